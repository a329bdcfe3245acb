//! Host-facing stack API used by native functions and embedders.
//!
//! Stack indices are 1-based and relative to the running native frame, so
//! index 1 is the first argument.

use crate::callinfo::{code_nresults, has_to_close_native, CIST_OAH, CIST_YPCALL, MULTRET};
use crate::error::{CupError, Status, VmResult};
use crate::object::{object_size, NativeClosure, Userdata};
use crate::proto::Proto;
use crate::table::Table;
use crate::thread::ThreadId;
use crate::upval::CloseStatus;
use crate::value::{TValue, TypeTag};
use crate::vm::{KFunction, NativeFn, Vm};
use cup_core::gc::{GcIdx, GcRef, ObjKind};
use cup_core::string::StringId;
use std::rc::Rc;

impl Vm {
    /// Stack slot of 1-based index `idx` in the running frame.
    #[inline]
    fn slot(&self, l: ThreadId, idx: usize) -> usize {
        debug_assert!(idx > 0, "stack indices start at 1");
        self.th(l).ci().func + idx
    }

    // ---- stack access ----

    /// Number of values in the running frame.
    pub fn get_top(&self, l: ThreadId) -> usize {
        let th = self.th(l);
        th.top - (th.ci().func + 1)
    }

    /// Set the number of values in the running frame, filling with nil or
    /// dropping values. Dropped to-be-closed slots are closed.
    pub fn set_top(&mut self, l: ThreadId, n: usize) -> VmResult<()> {
        let new_top = self.th(l).ci().func + 1 + n;
        let top = self.th(l).top;
        if new_top > top {
            let th = self.th_mut(l);
            for i in top..new_top {
                th.set(i, TValue::Nil);
            }
        } else if self.th(l).tbc_list >= new_top {
            debug_assert!(has_to_close_native(self.th(l).ci().nresults));
            self.close(l, new_top, CloseStatus::KeepTop, false)?;
        }
        self.th_mut(l).top = new_top;
        Ok(())
    }

    /// Value at index `idx`, or nil past the top.
    pub fn value_at(&self, l: ThreadId, idx: usize) -> TValue {
        let slot = self.slot(l, idx);
        let th = self.th(l);
        if slot < th.top {
            th.get(slot)
        } else {
            TValue::Nil
        }
    }

    /// Argument `n` (1-based) of the running native.
    #[inline]
    pub fn arg(&self, l: ThreadId, n: usize) -> TValue {
        self.value_at(l, n)
    }

    /// Push onto the running frame. Natives get `MIN_STACK` free slots;
    /// beyond that, call [`Vm::check_stack_api`] first.
    pub fn push(&mut self, l: ThreadId, v: TValue) {
        let th = self.th_mut(l);
        debug_assert!(th.top < th.stack_size(), "stack overflow");
        th.push(v);
    }

    pub fn pop(&mut self, l: ThreadId, n: usize) {
        let th = self.th_mut(l);
        debug_assert!(th.top - n > th.ci().func);
        th.top -= n;
    }

    /// Move the top value to index `idx`, shifting the values above it up.
    pub fn insert(&mut self, l: ThreadId, idx: usize) {
        let slot = self.slot(l, idx);
        let th = self.th_mut(l);
        let top = th.top;
        let v = th.get(top - 1);
        for p in (slot + 1..top).rev() {
            let below = th.get(p - 1);
            th.set(p, below);
        }
        th.set(slot, v);
    }

    /// Ensure room for `n` more pushes. Returns false when the stack cannot
    /// grow that far.
    pub fn check_stack_api(&mut self, l: ThreadId, n: usize) -> bool {
        let th = self.th(l);
        let ok = th.stack_size() - th.top > n || matches!(self.grow_stack(l, n, false), Ok(true));
        if ok {
            let th = self.th_mut(l);
            let need = th.top + n;
            let ci = th.ci_mut();
            if ci.top < need {
                ci.top = need;
            }
        }
        ok
    }

    // ---- calls ----

    /// Call the function below the top `nargs` values. With a continuation
    /// `k` on a yieldable thread, a yield inside the callee is allowed and
    /// `k` finishes this native after the resume; otherwise the call is not
    /// yieldable.
    pub fn call_k(&mut self, l: ThreadId, nargs: usize, nresults: i32, ctx: isize, k: Option<KFunction>) -> VmResult<()> {
        let func = self.th(l).top - (nargs + 1);
        match k {
            Some(k) if self.th(l).is_yieldable() => {
                let ci = self.th_mut(l).ci_mut();
                ci.k = Some(k);
                ci.ctx = ctx;
                self.call(l, func, nresults)?;
            }
            _ => self.call_no_yield(l, func, nresults)?,
        }
        self.adjust_results(l, nresults);
        Ok(())
    }

    /// Protected version of [`Vm::call_k`]. `errfunc` is the index of a
    /// message handler, or 0.
    ///
    /// Without a continuation the call runs in its own protected region and
    /// the status is returned; errors leave their value on top. With one,
    /// the call runs directly: an error unwinds to the enclosing resume,
    /// which recovers here and runs `k` with the error status.
    pub fn pcall_k(
        &mut self,
        l: ThreadId,
        nargs: usize,
        nresults: i32,
        errfunc: usize,
        ctx: isize,
        k: Option<KFunction>,
    ) -> VmResult<Status> {
        let ef = if errfunc == 0 { 0 } else { self.slot(l, errfunc) };
        let func = self.th(l).top - (nargs + 1);
        let status = match k {
            Some(k) if self.th(l).is_yieldable() => {
                let th = self.th_mut(l);
                let old_errfunc = th.errfunc;
                let allow_hook = th.allow_hook;
                th.errfunc = ef;
                let ci = th.ci_mut();
                ci.k = Some(k);
                ci.ctx = ctx;
                ci.funcidx = func;
                ci.old_errfunc = old_errfunc;
                ci.set_oah(allow_hook);
                ci.set(CIST_YPCALL);
                self.call(l, func, nresults)?;
                let th = self.th_mut(l);
                th.ci_mut().clear(CIST_YPCALL | CIST_OAH);
                th.errfunc = old_errfunc;
                Status::Ok
            }
            _ => self.pcall(l, |vm| vm.call_no_yield(l, func, nresults), func, ef),
        };
        self.adjust_results(l, nresults);
        Ok(status)
    }

    /// Mark index `idx` as a to-be-closed variable of the running native.
    /// It is closed when the native returns or the slot is dropped.
    pub fn to_close(&mut self, l: ThreadId, idx: usize) -> VmResult<()> {
        let slot = self.slot(l, idx);
        self.new_tbc_upval(l, slot)?;
        let ci = self.th_mut(l).ci_mut();
        if !has_to_close_native(ci.nresults) {
            ci.nresults = code_nresults(ci.nresults);
        }
        Ok(())
    }

    /// Close the to-be-closed slot at `idx` now and set it to nil.
    pub fn close_slot(&mut self, l: ThreadId, idx: usize) -> VmResult<()> {
        let slot = self.slot(l, idx);
        self.close(l, slot, CloseStatus::KeepTop, false)?;
        self.th_mut(l).set(slot, TValue::Nil);
        Ok(())
    }

    // ---- allocation ----

    /// Create a table and push it.
    pub fn new_table(&mut self, l: ThreadId) -> VmResult<GcIdx<Table>> {
        self.charge_alloc(l, object_size(ObjKind::Table))?;
        let t = self.heap.tables.insert(Table::new(0, 0), self.gc.white());
        self.push(l, TValue::Table(t));
        self.check_gc(l);
        Ok(t)
    }

    /// Create a userdata block of `size` zeroed bytes and push it.
    pub fn new_userdata(&mut self, l: ThreadId, size: usize) -> VmResult<GcIdx<Userdata>> {
        self.charge_alloc(l, object_size(ObjKind::Userdata) + size)?;
        let u = self.heap.userdata.insert(
            Userdata {
                metatable: None,
                user_value: TValue::Nil,
                data: vec![0; size],
            },
            self.gc.white(),
        );
        self.push(l, TValue::Userdata(u));
        self.check_gc(l);
        Ok(u)
    }

    pub(crate) fn alloc_native(
        &mut self,
        l: ThreadId,
        func: NativeFn,
        name: &'static str,
        upvalues: Vec<TValue>,
    ) -> VmResult<GcIdx<NativeClosure>> {
        self.charge_alloc(l, object_size(ObjKind::NativeClosure) + upvalues.len() * std::mem::size_of::<TValue>())?;
        Ok(self
            .heap
            .natives
            .insert(NativeClosure { func, name, upvalues }, self.gc.white()))
    }

    /// Create a native closure whose `nup` upvalues are popped from the
    /// stack, and push it.
    pub fn new_native(&mut self, l: ThreadId, func: NativeFn, name: &'static str, nup: usize) -> VmResult<()> {
        let first = self.th(l).top - nup;
        let upvalues = self.th(l).stack[first..first + nup].iter().map(|sv| sv.val).collect();
        let c = self.alloc_native(l, func, name, upvalues)?;
        let th = self.th_mut(l);
        th.top = first;
        th.push(TValue::Native(c));
        self.check_gc(l);
        Ok(())
    }

    /// Create a closure over `proto` with fresh upvalues and push it.
    pub fn new_closure(&mut self, l: ThreadId, proto: Rc<Proto>) -> VmResult<()> {
        self.check_stack(l, 1)?;
        let c = self.new_top_closure(l, proto)?;
        self.th_mut(l).push(TValue::Function(c));
        self.check_gc(l);
        Ok(())
    }

    /// Upvalue `n` (1-based) of the running native.
    pub fn native_upvalue(&self, l: ThreadId, n: usize) -> TValue {
        let th = self.th(l);
        match th.get(th.ci().func) {
            TValue::Native(c) => self.heap.natives.get(c).upvalues.get(n - 1).copied().unwrap_or_default(),
            _ => TValue::Nil,
        }
    }

    /// Push upvalue `n` (1-based) of the function at `funcidx` and return
    /// its name, or return `None` if there is no such upvalue.
    pub fn get_upvalue(&mut self, l: ThreadId, funcidx: usize, n: usize) -> Option<String> {
        let (v, name) = match self.value_at(l, funcidx) {
            TValue::Native(c) => (*self.heap.natives.get(c).upvalues.get(n.checked_sub(1)?)?, String::new()),
            TValue::Function(c) => {
                let cl = self.heap.lua_closures.get(c);
                let uv = *cl.upvals.get(n.checked_sub(1)?)?;
                let name = cl.proto.upvalues.get(n - 1).map_or_else(|| "?".to_string(), |d| d.name.clone());
                (self.upval_get(uv), name)
            }
            _ => return None,
        };
        self.push(l, v);
        Some(name)
    }

    /// Pop a value into upvalue `n` (1-based) of the function at `funcidx`.
    /// Returns the upvalue's name, or `None` (popping nothing) if there is
    /// no such upvalue.
    pub fn set_upvalue(&mut self, l: ThreadId, funcidx: usize, n: usize) -> Option<String> {
        let f = self.value_at(l, funcidx);
        let i = n.checked_sub(1)?;
        let v = {
            let th = self.th(l);
            th.get(th.top - 1)
        };
        let name = match f {
            TValue::Native(c) => {
                let slot = self.heap.natives.get_mut(c).upvalues.get_mut(i)?;
                *slot = v;
                self.barrier(GcRef::new(ObjKind::NativeClosure, c), v);
                String::new()
            }
            TValue::Function(c) => {
                let cl = self.heap.lua_closures.get(c);
                let uv = *cl.upvals.get(i)?;
                let name = cl.proto.upvalues.get(i).map_or_else(|| "?".to_string(), |d| d.name.clone());
                self.upval_set(uv, v);
                name
            }
            _ => return None,
        };
        self.th_mut(l).top -= 1;
        Some(name)
    }

    // ---- tables and metatables ----

    /// Store into a table with the collector's backward barrier.
    pub(crate) fn table_set(&mut self, l: ThreadId, t: GcIdx<Table>, key: TValue, v: TValue) -> VmResult<()> {
        if let Err(msg) = self.heap.tables.get_mut(t).raw_set(key, v) {
            return Err(self.run_error(l, msg));
        }
        let owner = GcRef::new(ObjKind::Table, t);
        self.barrier_back(owner, key);
        self.barrier_back(owner, v);
        Ok(())
    }

    /// Store under an interned string key. Never fails.
    pub fn table_set_str(&mut self, t: GcIdx<Table>, key: StringId, v: TValue) {
        self.heap.tables.get_mut(t).raw_set_str(key, v);
        self.barrier_back(GcRef::new(ObjKind::Table, t), v);
    }

    /// `t[k] = v` without metamethods, where `t` is at `idx` and `k`, `v`
    /// are the two top values, which are popped.
    pub fn raw_set(&mut self, l: ThreadId, idx: usize) -> VmResult<()> {
        let TValue::Table(t) = self.value_at(l, idx) else {
            return Err(self.run_error(l, "table expected"));
        };
        let (k, v) = {
            let th = self.th(l);
            (th.get(th.top - 2), th.get(th.top - 1))
        };
        self.table_set(l, t, k, v)?;
        self.th_mut(l).top -= 2;
        Ok(())
    }

    /// Replace the key on top with `t[key]`, where `t` is at `idx`.
    pub fn raw_get(&mut self, l: ThreadId, idx: usize) -> VmResult<()> {
        let TValue::Table(t) = self.value_at(l, idx) else {
            return Err(self.run_error(l, "table expected"));
        };
        let th = self.th(l);
        let k = th.get(th.top - 1);
        let v = self.heap.tables.get(t).raw_get(k);
        let th = self.th_mut(l);
        let top = th.top;
        th.set(top - 1, v);
        Ok(())
    }

    /// Pop a table (or nil) and make it the metatable of the value at
    /// `idx`. Tables and userdata have their own; other types share one
    /// per type.
    pub fn set_metatable(&mut self, l: ThreadId, idx: usize) -> VmResult<()> {
        let obj = self.value_at(l, idx);
        let mt = match self.value_at(l, self.get_top(l)) {
            TValue::Nil => None,
            TValue::Table(t) => Some(t),
            _ => return Err(self.run_error(l, "table expected")),
        };
        let owner = match obj {
            TValue::Table(t) => {
                self.heap.tables.get_mut(t).metatable = mt;
                Some(GcRef::new(ObjKind::Table, t))
            }
            TValue::Userdata(u) => {
                self.heap.userdata.get_mut(u).metatable = mt;
                Some(GcRef::new(ObjKind::Userdata, u))
            }
            other => {
                self.set_type_metatable(other.type_tag(), mt);
                None
            }
        };
        if let (Some(owner), Some(mt)) = (owner, mt) {
            self.obj_barrier(owner, GcRef::new(ObjKind::Table, mt));
            self.check_finalizer(owner, Some(mt));
        }
        self.th_mut(l).top -= 1;
        Ok(())
    }

    /// Pop a value into the user value of the userdata at `idx`.
    pub fn set_user_value(&mut self, l: ThreadId, idx: usize) -> VmResult<()> {
        let TValue::Userdata(u) = self.value_at(l, idx) else {
            return Err(self.run_error(l, "userdata expected"));
        };
        let v = {
            let th = self.th(l);
            th.get(th.top - 1)
        };
        self.heap.userdata.get_mut(u).user_value = v;
        self.barrier_back(GcRef::new(ObjKind::Userdata, u), v);
        self.th_mut(l).top -= 1;
        Ok(())
    }

    // ---- host conveniences ----

    /// Call `f` with `args` in protected mode on the current thread and
    /// collect every result.
    pub fn pcall_function(&mut self, f: TValue, args: &[TValue]) -> Result<Vec<TValue>, CupError> {
        let l = self.current;
        if !self.check_stack_api(l, args.len() + 1) {
            return Err(CupError::Runtime("stack overflow".to_string()));
        }
        let func = self.th(l).top;
        {
            let th = self.th_mut(l);
            th.push(f);
            for &a in args {
                th.push(a);
            }
        }
        let status = self.pcall(l, |vm| vm.call_no_yield(l, func, MULTRET), func, 0);
        let th = self.th_mut(l);
        let out = if status == Status::Ok {
            Ok(th.stack[func..th.top].iter().map(|sv| sv.val).collect())
        } else {
            let err = th.get(th.top - 1);
            Err(self.to_host_error(status, err))
        };
        self.th_mut(l).top = func;
        out
    }

    /// Host-facing form of an error status and its error value.
    pub fn to_host_error(&self, status: Status, err: TValue) -> CupError {
        match status {
            Status::ErrMem => CupError::Memory,
            Status::ErrErr => CupError::ErrorInErrorHandling,
            Status::ErrSyntax => CupError::Syntax(self.display_value(err)),
            _ => match err.type_tag() {
                TypeTag::String | TypeTag::Number => CupError::Runtime(self.display_value(err)),
                _ => CupError::Value(err.type_name()),
            },
        }
    }
}
