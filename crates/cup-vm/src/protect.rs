//! Protected execution: raising errors, recovery contexts and the
//! protected-call envelope.
//!
//! A raise returns `Err(Throw)` that unwinds through `?` to the innermost
//! protected runner of the raising thread. Each runner pushes a
//! [`RecoveryContext`] so a raise can tell whether anything will catch it.

use crate::callinfo::CallInfo;
use crate::error::{Status, Throw, VmResult};
use crate::thread::{RecoveryContext, ThreadId};
use crate::upval::CloseStatus;
use crate::value::TValue;
use crate::vm::Vm;
use tracing::error;

impl Vm {
    /// Raise `code` on `l`. The error value must already be on `l`'s stack.
    /// With no recovery context on `l`, the thread is reset and the error is
    /// re-raised on the main thread; with none there either, the panic
    /// handler runs and the process aborts.
    pub fn throw(&mut self, l: ThreadId, code: Throw) -> Throw {
        if let Some(ctx) = self.th_mut(l).recovery.last_mut() {
            ctx.status = code.into();
            return code;
        }
        let status = self.reset_thread(l, code.into());
        let code = status.as_throw().unwrap_or(code);
        let main = self.main_thread;
        if !self.th(main).recovery.is_empty() {
            let err = {
                let th = self.th(l);
                th.get(th.top - 1)
            };
            self.th_mut(main).push(err);
            return self.throw(main, code);
        }
        let msg = {
            let th = self.th(l);
            self.display_value(th.get(th.top - 1))
        };
        error!(thread = l.index(), error = %msg, "unprotected error");
        if let Some(mut panic) = self.panic.take() {
            panic(self, l);
            self.panic = Some(panic);
        }
        std::process::abort();
    }

    /// Run `f` as a protected region of `l`. Restores the native nesting
    /// count on exit and reports how the region ended.
    pub fn raw_run_protected<F>(&mut self, l: ThreadId, f: F) -> Status
    where
        F: FnOnce(&mut Vm) -> VmResult<()>,
    {
        let old_n_ccalls = self.th(l).n_ccalls;
        self.th_mut(l).recovery.push(RecoveryContext { status: Status::Ok });
        let result = f(self);
        let th = self.th_mut(l);
        th.recovery.pop();
        th.n_ccalls = old_n_ccalls;
        Status::from_result(result)
    }

    /// Protected call of `f` with message handler slot `ef`. On error the
    /// frame chain is unwound, pending to-be-closed variables at or above
    /// `old_top` are closed, and the final error value is left at `old_top`.
    pub fn pcall<F>(&mut self, l: ThreadId, f: F, old_top: usize, ef: usize) -> Status
    where
        F: FnOnce(&mut Vm) -> VmResult<()>,
    {
        let (old_ci, old_allow_hook, old_errfunc) = {
            let th = self.th(l);
            (th.ci, th.allow_hook, th.errfunc)
        };
        self.th_mut(l).errfunc = ef;
        let mut status = self.raw_run_protected(l, f);
        if status != Status::Ok {
            let th = self.th_mut(l);
            th.ci = old_ci;
            th.allow_hook = old_allow_hook;
            status = self.close_protected(l, old_top, status);
            self.set_error_obj(l, status, old_top);
            self.shrink_stack(l);
        }
        self.th_mut(l).errfunc = old_errfunc;
        status
    }

    /// Close upvalues and to-be-closed variables at or above `level` in
    /// protected mode. An error raised by a close method replaces the
    /// current status and closing continues with the remaining entries.
    pub fn close_protected(&mut self, l: ThreadId, level: usize, status: Status) -> Status {
        let (old_ci, old_allow_hook) = {
            let th = self.th(l);
            (th.ci, th.allow_hook)
        };
        let mut status = status;
        loop {
            let st = status;
            let r = self.raw_run_protected(l, |vm| vm.close(l, level, CloseStatus::Status(st), false));
            if r == Status::Ok {
                return status;
            }
            status = r;
            let th = self.th_mut(l);
            th.ci = old_ci;
            th.allow_hook = old_allow_hook;
        }
    }

    /// Store the error value for `status` at `old_top` and make it the top.
    pub(crate) fn set_error_obj(&mut self, l: ThreadId, status: Status, old_top: usize) {
        let v = match status {
            Status::ErrMem => TValue::Str(self.mem_err_msg),
            Status::ErrErr => self.intern("error in error handling"),
            Status::Ok => TValue::Nil,
            _ => {
                let th = self.th(l);
                th.get(th.top - 1)
            }
        };
        let th = self.th_mut(l);
        th.set(old_top, v);
        th.top = old_top + 1;
    }

    /// `source:line:` of frame `ci - level`, if that frame runs a script.
    pub fn where_at(&self, l: ThreadId, level: usize) -> Option<String> {
        let th = self.th(l);
        let ci = th.ci.checked_sub(level)?;
        let frame: &CallInfo = &th.ci_list[ci];
        if frame.is_native() {
            return None;
        }
        let p = self.frame_proto(l, ci)?;
        let line = p.line_at(frame.savedpc.saturating_sub(1))?;
        Some(format!("{}:{}:", p.short_source(), line))
    }

    /// Raise a runtime error with `msg`, prefixed with the position of the
    /// running script frame.
    pub fn run_error(&mut self, l: ThreadId, msg: impl AsRef<str>) -> Throw {
        let msg = match self.where_at(l, 0) {
            Some(pos) => format!("{pos} {}", msg.as_ref()),
            None => msg.as_ref().to_string(),
        };
        let v = self.intern_message(l, &msg);
        self.th_mut(l).push(v);
        self.error_msg(l)
    }

    /// Raise the value on top of `l`'s stack, passing it through the
    /// message handler first when one is installed.
    pub fn error_msg(&mut self, l: ThreadId) -> Throw {
        let errfunc = self.th(l).errfunc;
        if errfunc != 0 {
            let th = self.th_mut(l);
            let top = th.top;
            let err = th.get(top - 1);
            let handler = th.get(errfunc);
            th.set(top, err);
            th.set(top - 1, handler);
            th.top = top + 1;
            if let Err(e) = self.call_no_yield(l, top - 1, 1) {
                return e;
            }
        }
        self.throw(l, Throw::Runtime)
    }

    /// Raise the value on top of the stack. The preallocated out-of-memory
    /// message raises a memory error.
    pub fn error(&mut self, l: ThreadId) -> Throw {
        let th = self.th(l);
        if th.get(th.top - 1) == TValue::Str(self.mem_err_msg) {
            return self.mem_error(l);
        }
        self.error_msg(l)
    }

    pub fn mem_error(&mut self, l: ThreadId) -> Throw {
        self.throw(l, Throw::Memory)
    }

    /// Raise a syntax error, for front ends that compile into prototypes.
    pub fn syntax_error(&mut self, l: ThreadId, msg: &str) -> Throw {
        let v = self.intern(msg);
        self.th_mut(l).push(v);
        self.throw(l, Throw::Syntax)
    }

    /// Native nesting reached the limit. Past the overflow error's own
    /// allowance this is an error while handling an error.
    pub(crate) fn check_cstack(&mut self, l: ThreadId) -> VmResult<()> {
        let n = self.th(l).ccalls();
        if n == self.config.max_ccalls {
            Err(self.run_error(l, "C stack overflow"))
        } else if n >= self.config.errerr_ccalls() {
            Err(self.throw(l, Throw::ErrErr))
        } else {
            Ok(())
        }
    }
}
