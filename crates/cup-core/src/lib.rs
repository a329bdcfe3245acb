//! cup core types: the collector contract shared by every mutator, and interned strings.

pub mod gc;
pub mod string;
