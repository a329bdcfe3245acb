//! Call dispatch: frame setup, tail calls and result delivery.

use crate::callinfo::{
    decode_nresults, has_to_close_native, CallInfo, CIST_C, CIST_CLSRET, CIST_FRESH, CIST_TAIL, MULTRET,
};
use crate::dispatch;
use crate::error::{Throw, VmResult};
use crate::hook::{HookEvent, MASK_CALL};
use crate::metamethod::Tm;
use crate::thread::{ThreadId, MIN_STACK, NYCI};
use crate::upval::CloseStatus;
use crate::value::TValue;
use crate::vm::{NativeFn, Vm};
use std::rc::Rc;

/// Callee resolved for a call.
enum Callee {
    Native(NativeFn),
    Script { nparams: usize, frame_size: usize },
}

impl Vm {
    fn callee_at(&self, l: ThreadId, func: usize) -> Option<Callee> {
        match self.th(l).get(func) {
            TValue::Native(c) => Some(Callee::Native(self.heap.natives.get(c).func)),
            TValue::Function(c) => {
                let p = &self.heap.lua_closures.get(c).proto;
                Some(Callee::Script {
                    nparams: p.num_params as usize,
                    frame_size: p.max_stack_size as usize,
                })
            }
            _ => None,
        }
    }

    fn prep_call_info(&mut self, l: ThreadId, func: usize, nresults: i32, callstatus: u16, top: usize) -> usize {
        let ci = self.next_ci(l);
        self.th_mut(l).ci_list[ci] = CallInfo {
            func,
            top,
            nresults,
            callstatus,
            ..Default::default()
        };
        ci
    }

    /// Run a native callee to completion and deliver its results.
    fn precall_native(&mut self, l: ThreadId, func: usize, nresults: i32, f: NativeFn) -> VmResult<usize> {
        self.check_stack_gcp(l, MIN_STACK)?;
        let top = self.th(l).top;
        let ci = self.prep_call_info(l, func, nresults, CIST_C, top + MIN_STACK);
        debug_assert!(self.th(l).ci_list[ci].top <= self.th(l).stack_size());
        if self.th(l).hook_mask & MASK_CALL != 0 {
            let narg = top - func - 1;
            self.hook(l, HookEvent::Call, -1, 1, narg)?;
        }
        let n = f(self, l)?;
        debug_assert!(n <= self.th(l).top - (func + 1), "not enough elements in the stack");
        self.poscall(l, ci, n)?;
        Ok(n)
    }

    /// Prepare a call to the value at `func` with its arguments above it.
    /// A native callee runs to completion here and `None` is returned; a
    /// script callee gets a frame whose index is returned, and the caller
    /// must run it. Non-callable values go through `__call` once.
    pub fn precall(&mut self, l: ThreadId, func: usize, nresults: i32) -> VmResult<Option<usize>> {
        let mut delegated = false;
        loop {
            match self.callee_at(l, func) {
                Some(Callee::Native(f)) => {
                    self.precall_native(l, func, nresults, f)?;
                    return Ok(None);
                }
                Some(Callee::Script { nparams, frame_size }) => {
                    self.check_stack_gcp(l, frame_size)?;
                    let mut narg = self.th(l).top - func - 1;
                    let ci = self.prep_call_info(l, func, nresults, 0, func + 1 + frame_size);
                    let th = self.th_mut(l);
                    while narg < nparams {
                        th.push(TValue::Nil);
                        narg += 1;
                    }
                    debug_assert!(th.ci_list[ci].top <= th.stack_size());
                    return Ok(Some(ci));
                }
                None if !delegated => {
                    self.try_func_tm(l, func)?;
                    delegated = true;
                }
                None => {
                    let v = self.th(l).get(func);
                    return Err(self.call_error(l, v));
                }
            }
        }
    }

    /// Tail call from frame `ci`: the callee and its `narg1 - 1` arguments
    /// at `func` replace the frame in place. `delta` is how far the frame's
    /// callee slot was moved by vararg adjustment. Returns the result count
    /// of a native callee, or -1 when a script frame is ready to run.
    pub fn pretailcall(&mut self, l: ThreadId, ci: usize, func: usize, narg1: usize, delta: usize) -> VmResult<i32> {
        let mut narg1 = narg1;
        let mut delegated = false;
        loop {
            match self.callee_at(l, func) {
                Some(Callee::Native(f)) => {
                    let n = self.precall_native(l, func, MULTRET, f)?;
                    return Ok(n as i32);
                }
                Some(Callee::Script { nparams, frame_size }) => {
                    self.check_stack_gcp(l, frame_size.saturating_sub(delta))?;
                    let th = self.th_mut(l);
                    th.ci_list[ci].func -= delta;
                    let base = th.ci_list[ci].func;
                    for i in 0..narg1 {
                        let v = th.get(func + i);
                        th.set(base + i, v);
                    }
                    while narg1 <= nparams {
                        th.set(base + narg1, TValue::Nil);
                        narg1 += 1;
                    }
                    let c = &mut th.ci_list[ci];
                    c.top = base + 1 + frame_size;
                    c.savedpc = 0;
                    c.set(CIST_TAIL);
                    th.top = base + narg1;
                    return Ok(-1);
                }
                None if !delegated => {
                    self.try_func_tm(l, func)?;
                    narg1 += 1;
                    delegated = true;
                }
                None => {
                    let v = self.th(l).get(func);
                    return Err(self.call_error(l, v));
                }
            }
        }
    }

    /// Finish frame `ci`: deliver its `nres` results (the top `nres` slots)
    /// to the callee slot and make the caller current.
    pub fn poscall(&mut self, l: ThreadId, ci: usize, nres: usize) -> VmResult<()> {
        let wanted = self.th(l).ci_list[ci].nresults;
        if self.th(l).hook_mask != 0 && !has_to_close_native(wanted) {
            self.ret_hook(l, ci, nres)?;
        }
        let res = self.th(l).ci_list[ci].func;
        self.move_results(l, ci, res, nres, wanted)?;
        self.th_mut(l).ci = ci - 1;
        Ok(())
    }

    fn move_results(&mut self, l: ThreadId, ci: usize, res: usize, nres: usize, wanted: i32) -> VmResult<()> {
        let mut wanted = wanted;
        match wanted {
            0 => {
                self.th_mut(l).top = res;
                return Ok(());
            }
            1 => {
                let th = self.th_mut(l);
                let v = if nres == 0 { TValue::Nil } else { th.get(th.top - nres) };
                th.set(res, v);
                th.top = res + 1;
                return Ok(());
            }
            MULTRET => wanted = nres as i32,
            _ if has_to_close_native(wanted) => {
                {
                    let c = &mut self.th_mut(l).ci_list[ci];
                    c.set(CIST_CLSRET);
                    c.nres = nres;
                }
                self.close(l, res, CloseStatus::KeepTop, true)?;
                self.th_mut(l).ci_list[ci].clear(CIST_CLSRET);
                if self.th(l).hook_mask != 0 {
                    self.ret_hook(l, ci, nres)?;
                }
                wanted = decode_nresults(wanted);
                if wanted == MULTRET {
                    wanted = nres as i32;
                }
            }
            _ => {}
        }
        let wanted = wanted as usize;
        let th = self.th_mut(l);
        let first = th.top - nres;
        let n = nres.min(wanted);
        for i in 0..n {
            let v = th.get(first + i);
            th.set(res + i, v);
        }
        for i in n..wanted {
            th.set(res + i, TValue::Nil);
        }
        th.top = res + wanted;
        Ok(())
    }

    /// Put the `__call` handler of the value at `func` in its place, shifting
    /// the original callee up to become the first argument.
    fn try_func_tm(&mut self, l: ThreadId, func: usize) -> VmResult<()> {
        self.check_stack_gcp(l, 1)?;
        let callee = self.th(l).get(func);
        let tm = self.get_tm_by_obj(callee, Tm::Call);
        if tm.is_nil() {
            return Err(self.call_error(l, callee));
        }
        let th = self.th_mut(l);
        let top = th.top;
        for p in (func + 1..=top).rev() {
            let v = th.get(p - 1);
            th.set(p, v);
        }
        th.top = top + 1;
        th.set(func, tm);
        Ok(())
    }

    fn call_error(&mut self, l: ThreadId, v: TValue) -> Throw {
        let msg = format!("attempt to call a {} value", self.obj_type_name(v));
        self.run_error(l, msg)
    }

    pub(crate) fn ccall(&mut self, l: ThreadId, func: usize, nresults: i32, inc: u32) -> VmResult<()> {
        self.th_mut(l).n_ccalls += inc;
        if self.th(l).ccalls() >= self.config.max_ccalls {
            self.check_stack(l, 0)?;
            self.check_cstack(l)?;
        }
        if let Some(ci) = self.precall(l, func, nresults)? {
            self.th_mut(l).ci_list[ci].callstatus = CIST_FRESH;
            dispatch::execute(self, l, ci)?;
        }
        self.th_mut(l).n_ccalls -= inc;
        Ok(())
    }

    /// Call the value at `func` with everything above it as arguments,
    /// leaving `nresults` results (all for `MULTRET`) starting at `func`.
    pub fn call(&mut self, l: ThreadId, func: usize, nresults: i32) -> VmResult<()> {
        self.ccall(l, func, nresults, 1)
    }

    /// `call` that also forbids yields for its duration.
    pub fn call_no_yield(&mut self, l: ThreadId, func: usize, nresults: i32) -> VmResult<()> {
        self.ccall(l, func, nresults, NYCI)
    }

    /// Raise the current frame's top after a call that returned all results.
    pub(crate) fn adjust_results(&mut self, l: ThreadId, nresults: i32) {
        let th = self.th_mut(l);
        let top = th.top;
        let ci = th.ci_mut();
        if nresults <= MULTRET && ci.top < top {
            ci.top = top;
        }
    }

    pub(crate) fn closure_proto(&self, v: TValue) -> Option<Rc<crate::proto::Proto>> {
        match v {
            TValue::Function(c) => Some(Rc::clone(&self.heap.lua_closures.get(c).proto)),
            _ => None,
        }
    }
}
