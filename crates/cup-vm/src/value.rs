//! Tagged runtime values.

use crate::object::{LuaClosure, NativeClosure, Userdata};
use crate::table::Table;
use crate::thread::Thread;
use cup_core::gc::{GcIdx, GcRef, ObjKind};
use cup_core::string::StringId;

/// A value slot. Managed variants hold arena indices; strings are interned ids.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum TValue {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(StringId),
    Table(GcIdx<Table>),
    Function(GcIdx<LuaClosure>),
    Native(GcIdx<NativeClosure>),
    Userdata(GcIdx<Userdata>),
    Thread(GcIdx<Thread>),
}

/// Basic type of a value, indexing the per-type metatables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeTag {
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Thread,
}

pub const NUM_TYPES: usize = 8;

impl TypeTag {
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Nil => "nil",
            TypeTag::Boolean => "boolean",
            TypeTag::Number => "number",
            TypeTag::String => "string",
            TypeTag::Table => "table",
            TypeTag::Function => "function",
            TypeTag::Userdata => "userdata",
            TypeTag::Thread => "thread",
        }
    }
}

impl TValue {
    #[inline(always)]
    pub fn is_nil(&self) -> bool {
        matches!(self, TValue::Nil)
    }

    /// `nil` and `false` are the only false values.
    #[inline(always)]
    pub fn is_false(&self) -> bool {
        matches!(self, TValue::Nil | TValue::Bool(false))
    }

    pub fn type_tag(&self) -> TypeTag {
        match self {
            TValue::Nil => TypeTag::Nil,
            TValue::Bool(_) => TypeTag::Boolean,
            TValue::Int(_) | TValue::Float(_) => TypeTag::Number,
            TValue::Str(_) => TypeTag::String,
            TValue::Table(_) => TypeTag::Table,
            TValue::Function(_) | TValue::Native(_) => TypeTag::Function,
            TValue::Userdata(_) => TypeTag::Userdata,
            TValue::Thread(_) => TypeTag::Thread,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_tag().name()
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            TValue::Int(i) => Some(i),
            TValue::Float(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                Some(f as i64)
            }
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<GcIdx<Table>> {
        match *self {
            TValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<GcIdx<Thread>> {
        match *self {
            TValue::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_string_id(&self) -> Option<StringId> {
        match *self {
            TValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The collector reference of a managed value.
    pub fn gc_ref(&self) -> Option<GcRef> {
        match *self {
            TValue::Table(i) => Some(GcRef::new(ObjKind::Table, i)),
            TValue::Function(i) => Some(GcRef::new(ObjKind::LuaClosure, i)),
            TValue::Native(i) => Some(GcRef::new(ObjKind::NativeClosure, i)),
            TValue::Userdata(i) => Some(GcRef::new(ObjKind::Userdata, i)),
            TValue::Thread(i) => Some(GcRef::new(ObjKind::Thread, i)),
            _ => None,
        }
    }

    /// Rebuild a value from a collector reference. Upvalues are not values.
    pub fn from_gc_ref(r: GcRef) -> Option<TValue> {
        Some(match r.kind {
            ObjKind::Table => TValue::Table(r.typed()),
            ObjKind::LuaClosure => TValue::Function(r.typed()),
            ObjKind::NativeClosure => TValue::Native(r.typed()),
            ObjKind::Userdata => TValue::Userdata(r.typed()),
            ObjKind::Thread => TValue::Thread(r.typed()),
            ObjKind::UpVal => return None,
        })
    }
}

impl From<bool> for TValue {
    fn from(b: bool) -> Self {
        TValue::Bool(b)
    }
}

impl From<i64> for TValue {
    fn from(i: i64) -> Self {
        TValue::Int(i)
    }
}

impl From<f64> for TValue {
    fn from(f: f64) -> Self {
        TValue::Float(f)
    }
}
