//! Metamethod names and lookup.

use crate::value::TValue;
use crate::vm::Vm;
use cup_core::gc::GcIdx;
use cup_core::string::{StringId, StringInterner};

use crate::table::Table;

/// Events the engine resolves through metatables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tm {
    Index,
    NewIndex,
    Gc,
    Mode,
    Call,
    Close,
    Name,
}

const TM_COUNT: usize = 7;

/// Pre-interned metamethod names.
pub struct MetamethodNames {
    names: [StringId; TM_COUNT],
}

impl MetamethodNames {
    pub fn init(strings: &mut StringInterner) -> Self {
        MetamethodNames {
            names: [
                strings.intern(b"__index"),
                strings.intern(b"__newindex"),
                strings.intern(b"__gc"),
                strings.intern(b"__mode"),
                strings.intern(b"__call"),
                strings.intern(b"__close"),
                strings.intern(b"__name"),
            ],
        }
    }

    #[inline]
    pub fn get(&self, tm: Tm) -> StringId {
        self.names[tm as usize]
    }
}

impl Vm {
    /// Metatable of any value: its own for tables and userdata, the
    /// per-type one otherwise.
    pub fn metatable_of(&self, v: TValue) -> Option<GcIdx<Table>> {
        match v {
            TValue::Table(t) => self.heap.tables.get(t).metatable,
            TValue::Userdata(u) => self.heap.userdata.get(u).metatable,
            other => self.type_mt[other.type_tag() as usize],
        }
    }

    /// Handler for `event` on `v`, or nil.
    pub fn get_tm_by_obj(&self, v: TValue, event: Tm) -> TValue {
        match self.metatable_of(v) {
            Some(mt) => self.heap.tables.get(mt).raw_get_str(self.tm_names.get(event)),
            None => TValue::Nil,
        }
    }

    /// `__name` of the metatable if it is a string, else the basic type name.
    pub fn obj_type_name(&self, v: TValue) -> String {
        if let TValue::Table(_) | TValue::Userdata(_) = v {
            if let TValue::Str(s) = self.get_tm_by_obj(v, Tm::Name) {
                return self.strings.get_str(s).into_owned();
            }
        }
        v.type_name().to_string()
    }
}
