//! Upvalue cells, to-be-closed variables and closing.

use crate::error::{Status, VmResult};
use crate::metamethod::Tm;
use crate::object::{object_size, LuaClosure, UpVal};
use crate::proto::Proto;
use crate::thread::{ThreadId, MAX_DELTA};
use crate::value::TValue;
use crate::vm::Vm;
use cup_core::gc::{GcIdx, GcRef, ObjKind};
use std::rc::Rc;

/// How a close call treats the error slot and the stack top.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseStatus {
    /// Normal exit that must preserve the values above the closed level
    /// (results being returned). Close methods get nil as error.
    KeepTop,
    /// Scope exit or error unwind with this status.
    Status(Status),
}

impl Vm {
    /// Open upvalue for stack slot `level` of `l`, created on first use.
    pub fn find_upval(&mut self, l: ThreadId, level: usize) -> VmResult<GcIdx<UpVal>> {
        let mut pos = self.th(l).open_upval.len();
        for (i, &(lvl, uv)) in self.th(l).open_upval.iter().enumerate() {
            if lvl == level {
                return Ok(uv);
            }
            if lvl < level {
                pos = i;
                break;
            }
        }
        self.charge_alloc(l, object_size(ObjKind::UpVal))?;
        let uv = self
            .heap
            .upvals
            .insert(UpVal::Open { thread: l, level }, self.gc.white());
        let th = self.heap.threads.get_mut(l);
        th.open_upval.insert(pos, (level, uv));
        if !th.in_twups {
            th.in_twups = true;
            self.twups.push(l);
        }
        Ok(uv)
    }

    pub fn upval_get(&self, uv: GcIdx<UpVal>) -> TValue {
        match *self.heap.upvals.get(uv) {
            UpVal::Open { thread, level } => self.th(thread).get(level),
            UpVal::Closed(v) => v,
        }
    }

    pub fn upval_set(&mut self, uv: GcIdx<UpVal>, v: TValue) {
        match *self.heap.upvals.get(uv) {
            UpVal::Open { thread, level } => self.th_mut(thread).set(level, v),
            UpVal::Closed(_) => {
                *self.heap.upvals.get_mut(uv) = UpVal::Closed(v);
                self.barrier(GcRef::new(ObjKind::UpVal, uv), v);
            }
        }
    }

    /// Close every open upvalue of `l` at or above `level`: each cell takes
    /// a copy of its slot's value and stops referring to the stack.
    pub fn close_upval(&mut self, l: ThreadId, level: usize) {
        loop {
            let th = self.heap.threads.get_mut(l);
            let Some(&(lvl, uv)) = th.open_upval.first() else {
                break;
            };
            if lvl < level {
                break;
            }
            th.open_upval.remove(0);
            let v = th.get(lvl);
            *self.heap.upvals.get_mut(uv) = UpVal::Closed(v);
            if !self.heap.upvals.header(uv).is_white() {
                // an open cell is never black; once closed it must be
                self.heap.upvals.header_mut(uv).set_black();
                self.barrier(GcRef::new(ObjKind::UpVal, uv), v);
            }
        }
    }

    /// Register slot `level` as a to-be-closed variable. `false` and `nil`
    /// need no closing and are ignored; any other value must have a
    /// `__close` metamethod.
    pub fn new_tbc_upval(&mut self, l: ThreadId, level: usize) -> VmResult<()> {
        debug_assert!(level > self.th(l).tbc_list);
        let v = self.th(l).get(level);
        if v.is_false() {
            return Ok(());
        }
        if self.get_tm_by_obj(v, Tm::Close).is_nil() {
            let name = self.local_name_at(l, level).unwrap_or_else(|| "?".to_string());
            return Err(self.run_error(l, format!("variable '{name}' got a non-closable value")));
        }
        let th = self.th_mut(l);
        // gaps too large for the delta field get dummy nodes
        while level - th.tbc_list > MAX_DELTA {
            th.tbc_list += MAX_DELTA;
            let filler = th.tbc_list;
            th.stack[filler].tbc_delta = 0;
        }
        th.stack[level].tbc_delta = (level - th.tbc_list) as u16;
        th.tbc_list = level;
        Ok(())
    }

    fn local_name_at(&self, l: ThreadId, level: usize) -> Option<String> {
        let th = self.th(l);
        let ci = th.ci();
        if ci.is_native() {
            return Some("(temporary)".to_string());
        }
        let p = self.frame_proto(l, th.ci)?;
        p.local_name(level - ci.func, ci.savedpc.saturating_sub(1))
            .map(str::to_string)
    }

    /// Unlink the newest to-be-closed entry, skipping filler nodes.
    fn pop_tbc_list(&mut self, l: ThreadId) {
        let th = self.th_mut(l);
        let mut tbc = th.tbc_list;
        debug_assert!(tbc > 0);
        loop {
            let delta = th.stack[tbc].tbc_delta as usize;
            tbc -= if delta == 0 { MAX_DELTA } else { delta };
            if tbc == 0 || th.stack[tbc].tbc_delta != 0 {
                break;
            }
        }
        th.tbc_list = tbc;
    }

    /// Close upvalues at or above `level`, then call the pending close
    /// methods at or above `level`, newest first. `yy` permits the close
    /// methods to yield.
    pub fn close(&mut self, l: ThreadId, level: usize, status: CloseStatus, yy: bool) -> VmResult<()> {
        self.close_upval(l, level);
        while self.th(l).tbc_list >= level && self.th(l).tbc_list > 0 {
            let tbc = self.th(l).tbc_list;
            self.pop_tbc_list(l);
            self.prep_call_close_method(l, tbc, status, yy)?;
        }
        Ok(())
    }

    fn prep_call_close_method(&mut self, l: ThreadId, level: usize, status: CloseStatus, yy: bool) -> VmResult<()> {
        let obj = self.th(l).get(level);
        let err = match status {
            CloseStatus::KeepTop | CloseStatus::Status(Status::Ok) => TValue::Nil,
            CloseStatus::Status(st) => {
                // the error object lands just above the variable
                self.set_error_obj(l, st, level + 1);
                self.th(l).get(level + 1)
            }
        };
        self.call_close_method(l, obj, err, yy)
    }

    fn call_close_method(&mut self, l: ThreadId, obj: TValue, err: TValue, yy: bool) -> VmResult<()> {
        let tm = self.get_tm_by_obj(obj, Tm::Close);
        let th = self.th_mut(l);
        let top = th.top;
        th.set(top, tm);
        th.set(top + 1, obj);
        th.set(top + 2, err);
        th.top = top + 3;
        if yy {
            self.call(l, top, 0)
        } else {
            self.call_no_yield(l, top, 0)
        }
    }

    /// Closure over `proto` whose upvalues come from frame registers at
    /// `base` or from the enclosing closure `parent`.
    pub(crate) fn new_nested_closure(
        &mut self,
        l: ThreadId,
        proto: Rc<Proto>,
        parent: GcIdx<LuaClosure>,
        base: usize,
    ) -> VmResult<GcIdx<LuaClosure>> {
        let mut upvals = Vec::with_capacity(proto.upvalues.len());
        for desc in &proto.upvalues {
            let uv = if desc.in_stack {
                self.find_upval(l, base + desc.index as usize)?
            } else {
                self.heap.lua_closures.get(parent).upvals[desc.index as usize]
            };
            upvals.push(uv);
        }
        self.charge_alloc(l, object_size(ObjKind::LuaClosure))?;
        Ok(self
            .heap
            .lua_closures
            .insert(LuaClosure { proto, upvals }, self.gc.white()))
    }

    /// Closure over `proto` with fresh closed upvalues holding nil.
    pub(crate) fn new_top_closure(&mut self, l: ThreadId, proto: Rc<Proto>) -> VmResult<GcIdx<LuaClosure>> {
        let n = proto.upvalues.len();
        self.charge_alloc(l, object_size(ObjKind::LuaClosure) + n * object_size(ObjKind::UpVal))?;
        let white = self.gc.white();
        let upvals = (0..n)
            .map(|_| self.heap.upvals.insert(UpVal::Closed(TValue::Nil), white))
            .collect();
        Ok(self.heap.lua_closures.insert(LuaClosure { proto, upvals }, white))
    }
}
