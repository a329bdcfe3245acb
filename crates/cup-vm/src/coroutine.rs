//! Coroutines: creation, resume, yield and recovery of yieldable
//! protected calls.
//!
//! A yield unwinds the coroutine's native call chain with `Throw::Yield`
//! back to `resume`. Frames left on the coroutine are finished later by
//! `unroll`: script frames continue in the dispatch loop, native frames
//! through their continuation.

use crate::callinfo::{CIST_C, CIST_CLSRET, CIST_HOOKED, CIST_OAH, CIST_YPCALL, MULTRET};
use crate::dispatch;
use crate::error::{Status, Throw, VmResult};
use crate::object::object_size;
use crate::thread::{StackValue, Thread, ThreadId, BASIC_STACK_SIZE, EXTRA_STACK, MIN_STACK};
use crate::upval::CloseStatus;
use crate::value::TValue;
use crate::vm::{KFunction, Vm};
use cup_core::gc::ObjKind;
use std::mem::size_of;
use tracing::trace;

/// Status of a coroutine as seen from the running thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Created, body not started yet.
    Initial,
    /// The thread asking.
    Running,
    /// Stopped in a yield.
    Suspended,
    /// Active but not running: it resumed another coroutine.
    Normal,
    /// Body finished.
    Dead,
    /// Body raised an error.
    Errored,
}

impl CoroutineStatus {
    /// Name reported by `coroutine.status`.
    pub fn name(self) -> &'static str {
        match self {
            CoroutineStatus::Running => "running",
            CoroutineStatus::Initial | CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead | CoroutineStatus::Errored => "dead",
        }
    }
}

impl Vm {
    /// Create a thread and push it on `l`. The new thread inherits `l`'s hook.
    pub fn new_thread(&mut self, l: ThreadId) -> VmResult<ThreadId> {
        self.check_stack(l, 1)?;
        let bytes = object_size(ObjKind::Thread) + (BASIC_STACK_SIZE + EXTRA_STACK) * size_of::<StackValue>();
        self.charge_alloc(l, bytes)?;
        let mut t = Thread::new();
        {
            let parent = self.th(l);
            t.hook = parent.hook;
            t.hook_mask = parent.hook_mask;
            t.base_hook_count = parent.base_hook_count;
            t.hook_count = parent.base_hook_count;
        }
        let co = self.heap.threads.insert(t, self.gc.white());
        self.th_mut(l).push(TValue::Thread(co));
        self.check_gc(l);
        Ok(co)
    }

    fn resume_error(&mut self, co: ThreadId, msg: &str, nargs: usize) -> (Status, usize) {
        let v = self.intern(msg);
        let th = self.th_mut(co);
        th.top -= nargs;
        th.push(v);
        (Status::ErrRun, 1)
    }

    /// Start or continue coroutine `co` with the `nargs` values on top of
    /// its stack (below them, the body when starting). `from` is the
    /// resuming thread. Returns the status and how many values (yielded,
    /// returned, or the error) sit on top of `co`'s stack.
    pub fn resume(&mut self, co: ThreadId, from: Option<ThreadId>, nargs: usize) -> (Status, usize) {
        let th = self.th(co);
        match th.status {
            Status::Ok => {
                if th.ci != 0 {
                    return self.resume_error(co, "cannot resume non-suspended coroutine", nargs);
                }
                if th.top - (th.ci_list[0].func + 1) == nargs {
                    return self.resume_error(co, "cannot resume dead coroutine", nargs);
                }
            }
            Status::Yield => {}
            _ => return self.resume_error(co, "cannot resume dead coroutine", nargs),
        }
        let ccalls = from.map_or(0, |f| self.th(f).ccalls());
        if ccalls >= self.config.max_ccalls {
            return self.resume_error(co, "C stack overflow", nargs);
        }
        self.th_mut(co).n_ccalls = ccalls + 1;

        let previous = self.current;
        self.current = co;
        trace!(thread = co.index(), nargs, "resume");
        let status = self.raw_run_protected(co, |vm| vm.resume_body(co, nargs));
        let status = self.precover(co, status);
        self.current = previous;

        if status.is_error() {
            // the coroutine is dead; its error value goes on top
            let th = self.th_mut(co);
            th.status = status;
            let top = th.top;
            self.set_error_obj(co, status, top);
            let th = self.th_mut(co);
            let top = th.top;
            th.ci_mut().top = top;
        }
        let th = self.th(co);
        let nres = if status == Status::Yield {
            th.ci().nyield
        } else {
            th.top - (th.ci().func + 1)
        };
        trace!(thread = co.index(), ?status, nres, "resume returned");
        (status, nres)
    }

    fn resume_body(&mut self, l: ThreadId, nargs: usize) -> VmResult<()> {
        let first_arg = self.th(l).top - nargs;
        if self.th(l).status == Status::Ok {
            // starting: the body sits just below the arguments
            return self.ccall(l, first_arg - 1, MULTRET, 0);
        }
        debug_assert_eq!(self.th(l).status, Status::Yield);
        self.th_mut(l).status = Status::Ok;
        let ci = self.th(l).ci;
        if self.th(l).ci_list[ci].is_script() {
            // yielded inside a hook: the arguments are discarded
            self.th_mut(l).top = first_arg;
            dispatch::execute(self, l, ci)?;
        } else {
            let c = self.th(l).ci_list[ci];
            let n = match c.k {
                Some(k) => k(self, l, Status::Yield, c.ctx)?,
                None => nargs,
            };
            self.poscall(l, ci, n)?;
        }
        self.unroll(l)
    }

    /// Finish every frame interrupted by a yield or a recovered error,
    /// down to the base frame.
    fn unroll(&mut self, l: ThreadId) -> VmResult<()> {
        loop {
            let ci = self.th(l).ci;
            if ci == 0 {
                return Ok(());
            }
            if self.th(l).ci_list[ci].is_native() {
                self.finish_ccall(l, ci)?;
            } else {
                dispatch::finish_op(self, l, ci);
                dispatch::execute(self, l, ci)?;
            }
        }
    }

    fn finish_ccall(&mut self, l: ThreadId, ci: usize) -> VmResult<()> {
        let c = self.th(l).ci_list[ci];
        let n = if c.has(CIST_CLSRET) {
            // it was closing variables on return: redo the return
            c.nres
        } else {
            let status = if c.has(CIST_YPCALL) {
                self.finish_pcallk(l, ci)?
            } else {
                Status::Yield
            };
            self.adjust_results(l, MULTRET);
            match c.k {
                Some(k) => k(self, l, status, c.ctx)?,
                None => self.th(l).top - (c.func + 1),
            }
        };
        self.poscall(l, ci, n)
    }

    /// Complete a yieldable protected call of frame `ci` that was interrupted
    /// by a yield or ended by an error, and return the status its
    /// continuation should see.
    fn finish_pcallk(&mut self, l: ThreadId, ci: usize) -> VmResult<Status> {
        let c = self.th(l).ci_list[ci];
        let mut status = c.recover_status;
        if status == Status::Ok {
            status = Status::Yield;
        } else {
            let func = c.funcidx;
            self.th_mut(l).allow_hook = c.has(CIST_OAH);
            self.close(l, func, CloseStatus::Status(status), true)?;
            self.set_error_obj(l, status, func);
            self.shrink_stack(l);
            self.th_mut(l).ci_list[ci].recover_status = Status::Ok;
        }
        let th = self.th_mut(l);
        th.ci_list[ci].clear(CIST_YPCALL);
        th.errfunc = c.old_errfunc;
        Ok(status)
    }

    /// Innermost frame running a yieldable protected call.
    fn find_pcall(&self, l: ThreadId) -> Option<usize> {
        let th = self.th(l);
        (0..=th.ci).rev().find(|&ci| th.ci_list[ci].has(CIST_YPCALL))
    }

    /// Hand an error to the nearest yieldable protected call and carry on
    /// from there, for as long as errors keep finding one.
    fn precover(&mut self, l: ThreadId, status: Status) -> Status {
        let mut status = status;
        while status.is_error() {
            let Some(ci) = self.find_pcall(l) else {
                break;
            };
            let th = self.th_mut(l);
            th.ci = ci;
            th.ci_list[ci].recover_status = status;
            status = self.raw_run_protected(l, |vm| vm.unroll(l));
        }
        status
    }

    /// Suspend the running coroutine, handing the top `nresults` values to
    /// its resumer. Natives return the result of this call. After a resume,
    /// `k` runs in place of the rest of the native; without one, the resume
    /// arguments become the native's results.
    ///
    /// Inside a line or count hook this returns `Ok(0)` and the coroutine
    /// suspends once the hook is done.
    pub fn yield_k(&mut self, l: ThreadId, nresults: usize, ctx: isize, k: Option<KFunction>) -> VmResult<usize> {
        if !self.th(l).is_yieldable() {
            let msg = if l != self.main_thread {
                "attempt to yield across a C-call boundary"
            } else {
                "attempt to yield from outside a coroutine"
            };
            return Err(self.run_error(l, msg));
        }
        let th = self.th_mut(l);
        th.status = Status::Yield;
        let ci = th.ci_mut();
        ci.nyield = nresults;
        if ci.is_script() {
            debug_assert!(ci.has(CIST_HOOKED), "script frames yield only from hooks");
            debug_assert!(nresults == 0 && k.is_none(), "hooks cannot yield values or continue");
            return Ok(0);
        }
        ci.k = k;
        if k.is_some() {
            ci.ctx = ctx;
        }
        Err(self.throw(l, Throw::Yield))
    }

    /// Unwind `l` to its base frame and close everything still pending on
    /// it. Leaves the error value, if closing ended with one, in slot 1.
    pub(crate) fn reset_thread(&mut self, l: ThreadId, status: Status) -> Status {
        let th = self.th_mut(l);
        th.ci = 0;
        th.set(0, TValue::Nil);
        {
            let base = &mut th.ci_list[0];
            base.func = 0;
            base.callstatus = CIST_C;
        }
        th.errfunc = 0;
        th.status = Status::Ok;
        let status = if status == Status::Yield { Status::Ok } else { status };
        let status = self.close_protected(l, 1, status);
        if status != Status::Ok {
            self.set_error_obj(l, status, 1);
        } else {
            self.th_mut(l).top = 1;
        }
        let th = self.th_mut(l);
        let ci_top = th.top + MIN_STACK;
        th.ci_list[0].top = ci_top;
        // failing to shrink is harmless
        let _ = self.realloc_stack(l, ci_top, false);
        status
    }

    /// Close a suspended or dead coroutine: run its pending to-be-closed
    /// variables and make it dead. Returns the error status (with the error
    /// value on top of `co`) if the coroutine had died with one or a close
    /// method raised.
    pub fn close_thread(&mut self, co: ThreadId, from: Option<ThreadId>) -> Status {
        let ccalls = from.map_or(0, |f| self.th(f).ccalls());
        self.th_mut(co).n_ccalls = ccalls;
        let status = self.th(co).status;
        self.reset_thread(co, status)
    }

    pub fn coroutine_status(&self, co: ThreadId) -> CoroutineStatus {
        if co == self.current {
            return CoroutineStatus::Running;
        }
        let th = self.th(co);
        match th.status {
            Status::Yield => CoroutineStatus::Suspended,
            Status::Ok if th.ci != 0 => CoroutineStatus::Normal,
            Status::Ok if th.top == 1 => CoroutineStatus::Dead,
            Status::Ok => CoroutineStatus::Initial,
            _ => CoroutineStatus::Errored,
        }
    }

    pub fn is_yieldable(&self, l: ThreadId) -> bool {
        self.th(l).is_yieldable()
    }

    /// Move the top `n` values of `from` onto `to`.
    pub fn xmove(&mut self, from: ThreadId, to: ThreadId, n: usize) -> VmResult<()> {
        if from == to || n == 0 {
            return Ok(());
        }
        self.check_stack(to, n)?;
        let first = self.th(from).top - n;
        for i in 0..n {
            let v = self.th(from).get(first + i);
            self.th_mut(to).push(v);
        }
        self.th_mut(from).top = first;
        Ok(())
    }
}
