//! Hybrid array + hash table.
//!
//! Tables are the container the collector treats as frequently mutated: stores
//! through [`crate::vm::Vm::raw_set`] apply the backward barrier, so this type
//! itself never talks to the collector.

use crate::value::TValue;
use cup_core::gc::{GcIdx, GcRef};
use cup_core::string::StringId;
use indexmap::IndexMap;

/// A key in the hash part.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Int(i64),
    Str(StringId),
    /// Float key stored as raw bits.
    Float(u64),
    Bool(bool),
    Obj(GcRef),
}

impl TableKey {
    /// Normalized key for `v`; `None` for nil and NaN.
    pub fn from_value(v: TValue) -> Option<TableKey> {
        match v {
            TValue::Nil => None,
            TValue::Bool(b) => Some(TableKey::Bool(b)),
            TValue::Int(i) => Some(TableKey::Int(i)),
            TValue::Float(f) if f.is_nan() => None,
            TValue::Float(f) => match v.as_int() {
                Some(i) => Some(TableKey::Int(i)),
                None => Some(TableKey::Float(f.to_bits())),
            },
            TValue::Str(s) => Some(TableKey::Str(s)),
            _ => v.gc_ref().map(TableKey::Obj),
        }
    }

    pub fn to_value(self) -> TValue {
        match self {
            TableKey::Int(i) => TValue::Int(i),
            TableKey::Str(s) => TValue::Str(s),
            TableKey::Float(bits) => TValue::Float(f64::from_bits(bits)),
            TableKey::Bool(b) => TValue::Bool(b),
            TableKey::Obj(r) => TValue::from_gc_ref(r).unwrap_or(TValue::Nil),
        }
    }
}

pub struct Table {
    /// Array part: `array[0]` holds key 1.
    array: Vec<TValue>,
    hash: IndexMap<TableKey, TValue>,
    pub metatable: Option<GcIdx<Table>>,
}

impl Table {
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity(hash_hint),
            metatable: None,
        }
    }

    pub fn raw_get(&self, key: TValue) -> TValue {
        match TableKey::from_value(key) {
            Some(TableKey::Int(i)) => self.raw_geti(i),
            Some(k) => self.hash.get(&k).copied().unwrap_or_default(),
            None => TValue::Nil,
        }
    }

    pub fn raw_set(&mut self, key: TValue, value: TValue) -> Result<(), &'static str> {
        match key {
            TValue::Nil => return Err("table index is nil"),
            TValue::Float(f) if f.is_nan() => return Err("table index is NaN"),
            _ => {}
        }
        match TableKey::from_value(key) {
            Some(TableKey::Int(i)) => self.raw_seti(i, value),
            Some(k) if value.is_nil() => {
                self.hash.shift_remove(&k);
            }
            Some(k) => {
                self.hash.insert(k, value);
            }
            None => return Err("invalid table key"),
        }
        Ok(())
    }

    pub fn raw_geti(&self, key: i64) -> TValue {
        if key >= 1 && (key as usize) <= self.array.len() {
            self.array[(key - 1) as usize]
        } else {
            self.hash.get(&TableKey::Int(key)).copied().unwrap_or_default()
        }
    }

    pub fn raw_seti(&mut self, key: i64, value: TValue) {
        if key >= 1 {
            let idx = (key - 1) as usize;
            if idx < self.array.len() {
                self.array[idx] = value;
                return;
            }
            if idx == self.array.len() && !value.is_nil() {
                self.array.push(value);
                self.migrate_to_array();
                return;
            }
        }
        if value.is_nil() {
            self.hash.shift_remove(&TableKey::Int(key));
        } else {
            self.hash.insert(TableKey::Int(key), value);
        }
    }

    pub fn raw_get_str(&self, key: StringId) -> TValue {
        self.hash.get(&TableKey::Str(key)).copied().unwrap_or_default()
    }

    pub fn raw_set_str(&mut self, key: StringId, value: TValue) {
        if value.is_nil() {
            self.hash.shift_remove(&TableKey::Str(key));
        } else {
            self.hash.insert(TableKey::Str(key), value);
        }
    }

    /// Pull integer keys that now continue the array part out of the hash part.
    fn migrate_to_array(&mut self) {
        loop {
            let next = TableKey::Int(self.array.len() as i64 + 1);
            match self.hash.shift_remove(&next) {
                Some(v) => self.array.push(v),
                None => break,
            }
        }
    }

    /// Border of the array part.
    pub fn length(&self) -> usize {
        self.array.iter().rposition(|v| !v.is_nil()).map_or(0, |p| p + 1)
    }

    pub fn array_values(&self) -> &[TValue] {
        &self.array
    }

    /// Key/value pairs of the hash part, for traversal.
    pub fn hash_entries(&self) -> impl Iterator<Item = (TValue, TValue)> + '_ {
        self.hash.iter().map(|(k, v)| (k.to_value(), *v))
    }

    /// Drop every entry for which `keep` returns false. Array slots become nil.
    pub fn retain_entries(&mut self, mut keep: impl FnMut(TValue, TValue) -> bool) {
        for (i, v) in self.array.iter_mut().enumerate() {
            if !v.is_nil() && !keep(TValue::Int(i as i64 + 1), *v) {
                *v = TValue::Nil;
            }
        }
        self.hash.retain(|k, v| keep(k.to_value(), *v));
    }

    pub fn entry_count(&self) -> usize {
        self.array.len() + self.hash.len()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "table(array={}, hash={})", self.array.len(), self.hash.len())
    }
}
