//! Managed object payloads and the arenas that hold them.

use crate::proto::Proto;
use crate::table::Table;
use crate::thread::{StackValue, Thread, ThreadId};
use crate::value::TValue;
use crate::vm::NativeFn;
use cup_core::gc::{Arena, GcBox, GcHeader, GcIdx, GcRef, ObjKind};
use std::mem::size_of;
use std::rc::Rc;

/// A script closure: prototype plus captured upvalue cells.
pub struct LuaClosure {
    pub proto: Rc<Proto>,
    pub upvals: Vec<GcIdx<UpVal>>,
}

/// A native function with its own upvalue slots.
pub struct NativeClosure {
    pub func: NativeFn,
    pub name: &'static str,
    pub upvalues: Vec<TValue>,
}

/// A captured variable cell.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UpVal {
    /// Still backed by a live stack slot of `thread`.
    Open { thread: ThreadId, level: usize },
    /// Owns its value.
    Closed(TValue),
}

/// A raw memory block with an optional metatable and one user value.
pub struct Userdata {
    pub metatable: Option<GcIdx<Table>>,
    pub user_value: TValue,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct Heap {
    pub tables: Arena<Table>,
    pub lua_closures: Arena<LuaClosure>,
    pub natives: Arena<NativeClosure>,
    pub upvals: Arena<UpVal>,
    pub userdata: Arena<Userdata>,
    pub threads: Arena<Thread>,
}

impl Heap {
    pub fn header(&self, r: GcRef) -> &GcHeader {
        match r.kind {
            ObjKind::Thread => self.threads.header(r.typed()),
            ObjKind::Table => self.tables.header(r.typed()),
            ObjKind::LuaClosure => self.lua_closures.header(r.typed()),
            ObjKind::NativeClosure => self.natives.header(r.typed()),
            ObjKind::UpVal => self.upvals.header(r.typed()),
            ObjKind::Userdata => self.userdata.header(r.typed()),
        }
    }

    pub fn header_mut(&mut self, r: GcRef) -> &mut GcHeader {
        match r.kind {
            ObjKind::Thread => self.threads.header_mut(r.typed()),
            ObjKind::Table => self.tables.header_mut(r.typed()),
            ObjKind::LuaClosure => self.lua_closures.header_mut(r.typed()),
            ObjKind::NativeClosure => self.natives.header_mut(r.typed()),
            ObjKind::UpVal => self.upvals.header_mut(r.typed()),
            ObjKind::Userdata => self.userdata.header_mut(r.typed()),
        }
    }

    pub fn contains(&self, r: GcRef) -> bool {
        match r.kind {
            ObjKind::Thread => self.threads.contains(r.typed()),
            ObjKind::Table => self.tables.contains(r.typed()),
            ObjKind::LuaClosure => self.lua_closures.contains(r.typed()),
            ObjKind::NativeClosure => self.natives.contains(r.typed()),
            ObjKind::UpVal => self.upvals.contains(r.typed()),
            ObjKind::Userdata => self.userdata.contains(r.typed()),
        }
    }

    pub fn slot_count(&self, kind: ObjKind) -> usize {
        match kind {
            ObjKind::Thread => self.threads.slot_count(),
            ObjKind::Table => self.tables.slot_count(),
            ObjKind::LuaClosure => self.lua_closures.slot_count(),
            ObjKind::NativeClosure => self.natives.slot_count(),
            ObjKind::UpVal => self.upvals.slot_count(),
            ObjKind::Userdata => self.userdata.slot_count(),
        }
    }

    pub fn slot_header_mut(&mut self, kind: ObjKind, slot: usize) -> Option<&mut GcHeader> {
        match kind {
            ObjKind::Thread => self.threads.slot_header_mut(slot),
            ObjKind::Table => self.tables.slot_header_mut(slot),
            ObjKind::LuaClosure => self.lua_closures.slot_header_mut(slot),
            ObjKind::NativeClosure => self.natives.slot_header_mut(slot),
            ObjKind::UpVal => self.upvals.slot_header_mut(slot),
            ObjKind::Userdata => self.userdata.slot_header_mut(slot),
        }
    }

    /// Number of live objects across all arenas.
    pub fn object_count(&self) -> usize {
        self.threads.len()
            + self.tables.len()
            + self.lua_closures.len()
            + self.natives.len()
            + self.upvals.len()
            + self.userdata.len()
    }

    /// Drop an object, returning the bytes it was charged for.
    pub fn free(&mut self, r: GcRef) -> usize {
        match r.kind {
            ObjKind::Thread => self
                .threads
                .remove(r.typed())
                .map_or(0, |th| object_size(ObjKind::Thread) + th.stack.len() * size_of::<StackValue>()),
            ObjKind::Table => self.tables.remove(r.typed()).map_or(0, |_| object_size(r.kind)),
            ObjKind::LuaClosure => self
                .lua_closures
                .remove(r.typed())
                .map_or(0, |_| object_size(r.kind)),
            ObjKind::NativeClosure => self.natives.remove(r.typed()).map_or(0, |_| object_size(r.kind)),
            ObjKind::UpVal => self.upvals.remove(r.typed()).map_or(0, |_| object_size(r.kind)),
            ObjKind::Userdata => self
                .userdata
                .remove(r.typed())
                .map_or(0, |u| object_size(r.kind) + u.data.len()),
        }
    }
}

/// Bytes charged to the collector for one object of `kind`, excluding
/// variable-size parts (thread stacks, userdata blocks).
pub fn object_size(kind: ObjKind) -> usize {
    match kind {
        ObjKind::Thread => size_of::<GcBox<Thread>>(),
        ObjKind::Table => size_of::<GcBox<Table>>(),
        ObjKind::LuaClosure => size_of::<GcBox<LuaClosure>>(),
        ObjKind::NativeClosure => size_of::<GcBox<NativeClosure>>(),
        ObjKind::UpVal => size_of::<GcBox<UpVal>>(),
        ObjKind::Userdata => size_of::<GcBox<Userdata>>(),
    }
}
