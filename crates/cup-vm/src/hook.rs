//! Debug hooks: call, return, line and count events.

use crate::callinfo::{CIST_HOOKED, CIST_HOOKYIELD, CIST_TAIL, CIST_TRAN};
use crate::error::{Status, Throw, VmResult};
use crate::opcode::OpCode;
use crate::proto::Proto;
use crate::thread::{ThreadId, MIN_STACK};
use crate::vm::Vm;

pub const MASK_CALL: u8 = 1 << 0;
pub const MASK_RET: u8 = 1 << 1;
pub const MASK_LINE: u8 = 1 << 2;
pub const MASK_COUNT: u8 = 1 << 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Return,
    Line,
    Count,
    TailCall,
}

/// What a hook sees about the event that fired it.
#[derive(Clone, Copy, Debug)]
pub struct DebugInfo {
    pub event: HookEvent,
    /// New line for line events, -1 otherwise.
    pub current_line: i32,
    /// Frame the event belongs to.
    pub ci: usize,
    /// First transferred value, relative to the frame's callee slot.
    pub ftransfer: usize,
    /// Number of transferred values (parameters or results).
    pub ntransfer: usize,
}

pub type HookFn = fn(&mut Vm, ThreadId, &DebugInfo) -> VmResult<()>;

impl Vm {
    /// Install or clear the hook of `l`. A zero mask or no function clears it.
    pub fn set_hook(&mut self, l: ThreadId, f: Option<HookFn>, mask: u8, count: u32) {
        let (f, mask) = match f {
            Some(f) if mask != 0 => (Some(f), mask),
            _ => (None, 0),
        };
        let th = self.th_mut(l);
        th.hook = f;
        th.hook_mask = mask;
        th.base_hook_count = count;
        th.hook_count = count;
    }

    /// Run the hook of `l` for `event` in the current frame. Hooks never
    /// nest: `allow_hook` is off while one runs.
    pub(crate) fn hook(
        &mut self,
        l: ThreadId,
        event: HookEvent,
        line: i32,
        ftransfer: usize,
        ntransfer: usize,
    ) -> VmResult<()> {
        let th = self.th(l);
        let Some(hook) = th.hook else {
            return Ok(());
        };
        if !th.allow_hook {
            return Ok(());
        }
        let ci = th.ci;
        let top = th.top;
        let ci_top = th.ci_list[ci].top;
        let mut mask = CIST_HOOKED;
        let ar = DebugInfo {
            event,
            current_line: line,
            ci,
            ftransfer,
            ntransfer,
        };
        {
            let th = self.th_mut(l);
            if ntransfer != 0 {
                mask |= CIST_TRAN;
                th.ci_list[ci].ftransfer = ftransfer;
                th.ci_list[ci].ntransfer = ntransfer;
            }
            // script frames may hold live registers above top
            if th.ci_list[ci].is_script() && th.top < ci_top {
                th.top = ci_top;
            }
        }
        self.check_stack(l, MIN_STACK)?;
        let th = self.th_mut(l);
        if th.ci_list[ci].top < th.top + MIN_STACK {
            th.ci_list[ci].top = th.top + MIN_STACK;
        }
        th.allow_hook = false;
        th.ci_list[ci].set(mask);
        hook(self, l, &ar)?;
        let th = self.th_mut(l);
        debug_assert!(!th.allow_hook);
        th.allow_hook = true;
        th.ci_list[ci].top = ci_top;
        th.top = top;
        th.ci_list[ci].clear(mask);
        Ok(())
    }

    /// Call hook for a script frame about to run its first instruction.
    pub(crate) fn hook_call(&mut self, l: ThreadId, ci: usize) -> VmResult<()> {
        self.th_mut(l).old_pc = 0;
        if self.th(l).hook_mask & MASK_CALL == 0 {
            return Ok(());
        }
        let nparams = self.frame_proto(l, ci).map_or(0, |p| p.num_params as usize);
        let event = if self.th(l).ci_list[ci].has(CIST_TAIL) {
            HookEvent::TailCall
        } else {
            HookEvent::Call
        };
        // hooks expect the pc already past the current instruction
        self.th_mut(l).ci_list[ci].savedpc += 1;
        self.hook(l, event, -1, 1, nparams)?;
        self.th_mut(l).ci_list[ci].savedpc -= 1;
        Ok(())
    }

    /// Return hook for frame `ci`, whose `nres` results sit below top.
    pub(crate) fn ret_hook(&mut self, l: ThreadId, ci: usize, nres: usize) -> VmResult<()> {
        if self.th(l).hook_mask & MASK_RET != 0 {
            let first_res = self.th(l).top - nres;
            let c = self.th(l).ci_list[ci];
            // report positions relative to the vararg frame's working callee slot
            let delta = match self.frame_proto(l, ci) {
                Some(p) if c.is_script() && p.is_vararg => c.nextraargs + p.num_params as usize + 1,
                _ => 0,
            };
            self.th_mut(l).ci_list[ci].func += delta;
            let ftransfer = first_res - self.th(l).ci_list[ci].func;
            let r = self.hook(l, HookEvent::Return, -1, ftransfer, nres);
            self.th_mut(l).ci_list[ci].func -= delta;
            r?;
        }
        let th = self.th_mut(l);
        if ci > 0 {
            let prev = th.ci_list[ci - 1];
            if prev.is_script() {
                th.old_pc = prev.savedpc.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// Line and count hooks, run before an instruction when either is armed.
    /// `savedpc` already points past `op`.
    pub(crate) fn trace_exec(&mut self, l: ThreadId, ci: usize, proto: &Proto, op: OpCode) -> VmResult<()> {
        let mask = self.th(l).hook_mask;
        if mask & (MASK_LINE | MASK_COUNT) == 0 {
            return Ok(());
        }
        let th = self.th_mut(l);
        th.hook_count = th.hook_count.wrapping_sub(1);
        let count_hook = th.hook_count == 0 && mask & MASK_COUNT != 0;
        if count_hook {
            th.hook_count = th.base_hook_count;
        } else if mask & MASK_LINE == 0 {
            return Ok(());
        }
        if th.ci_list[ci].has(CIST_HOOKYIELD) {
            // the hook already ran before the yield
            th.ci_list[ci].clear(CIST_HOOKYIELD);
            return Ok(());
        }
        if !op.is_in_top() {
            th.top = th.ci_list[ci].top;
        }
        if count_hook {
            self.hook(l, HookEvent::Count, -1, 0, 0)?;
        }
        if mask & MASK_LINE != 0 {
            let npc = self.th(l).ci_list[ci].savedpc - 1;
            let old_pc = self.th(l).old_pc;
            let old_pc = if old_pc < proto.code.len() { old_pc } else { 0 };
            if npc <= old_pc || proto.line_at(old_pc) != proto.line_at(npc) {
                let line = proto.line_at(npc).map_or(-1, |n| n as i32);
                self.hook(l, HookEvent::Line, line, 0, 0)?;
            }
            self.th_mut(l).old_pc = npc;
        }
        let th = self.th_mut(l);
        if th.status == Status::Yield {
            if count_hook {
                th.hook_count = 1;
            }
            // resume re-executes this instruction without calling the hook again
            th.ci_list[ci].savedpc -= 1;
            th.ci_list[ci].set(CIST_HOOKYIELD);
            return Err(self.throw(l, Throw::Yield));
        }
        Ok(())
    }
}
