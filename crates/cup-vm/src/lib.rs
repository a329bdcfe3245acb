//! Execution engine of the cup scripting runtime: value stacks, call
//! dispatch, protected calls, coroutines, upvalues and to-be-closed
//! variables, and the collector contract every mutator honors.

pub mod api;
pub mod baselib;
pub mod call;
pub mod callinfo;
pub mod collector;
pub mod config;
pub mod coroutine;
pub mod dispatch;
pub mod error;
pub mod hook;
pub mod metamethod;
pub mod object;
pub mod opcode;
pub mod proto;
pub mod protect;
pub mod stack;
pub mod table;
pub mod thread;
pub mod upval;
pub mod value;
pub mod vm;

pub use config::RuntimeConfig;
pub use coroutine::CoroutineStatus;
pub use error::{CupError, Status, Throw, VmResult};
pub use opcode::OpCode;
pub use proto::{Constant, Proto};
pub use thread::ThreadId;
pub use value::TValue;
pub use vm::Vm;
