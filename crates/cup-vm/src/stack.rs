//! Stack growth, shrinking and frame-chain allocation.
//!
//! Every stored position (top, frame bounds, open upvalue levels, the
//! to-be-closed list) is an index, so moving the slots to a new buffer needs
//! no correction pass.

use crate::callinfo::CallInfo;
use crate::error::{Throw, VmResult};
use crate::thread::{StackValue, ThreadId, EXTRA_STACK, MIN_STACK};
use crate::vm::Vm;
use std::mem::size_of;
use tracing::{debug, trace};

impl Vm {
    pub fn stack_size(&self, l: ThreadId) -> usize {
        self.th(l).stack_size()
    }

    /// Resize `l`'s stack to `new_size` usable slots. On allocation failure
    /// raises out-of-memory when `raise`, else returns `Ok(false)`.
    pub fn realloc_stack(&mut self, l: ThreadId, new_size: usize, raise: bool) -> VmResult<bool> {
        let old_size = self.th(l).stack_size();
        debug_assert!(
            new_size <= self.config.max_stack || new_size == self.config.error_stack_size()
        );
        debug_assert!(new_size >= self.th(l).top);
        let slot = size_of::<StackValue>();
        if new_size > old_size && !self.try_charge(l, (new_size - old_size) * slot) {
            return self.stack_alloc_failed(l, raise);
        }
        let new_len = new_size + EXTRA_STACK;
        let mut new_stack: Vec<StackValue> = Vec::new();
        if new_stack.try_reserve_exact(new_len).is_err() {
            if new_size > old_size {
                self.gc.release((new_size - old_size) * slot);
            }
            return self.stack_alloc_failed(l, raise);
        }
        let th = self.th_mut(l);
        let keep = old_size.min(new_size) + EXTRA_STACK;
        new_stack.extend_from_slice(&th.stack[..keep]);
        new_stack.resize(new_len, StackValue::default());
        th.stack = new_stack;
        if new_size < old_size {
            self.gc.release((old_size - new_size) * slot);
        }
        trace!(thread = l.index(), old_size, new_size, "stack reallocated");
        Ok(true)
    }

    fn stack_alloc_failed(&mut self, l: ThreadId, raise: bool) -> VmResult<bool> {
        if raise {
            Err(self.mem_error(l))
        } else {
            Ok(false)
        }
    }

    /// Make room for `n` more slots above top. Past `max_stack` the thread
    /// gets the emergency size once and an overflow error is raised; asking
    /// again while on that allowance is an error while handling an error.
    pub fn grow_stack(&mut self, l: ThreadId, n: usize, raise: bool) -> VmResult<bool> {
        let size = self.th(l).stack_size();
        let max = self.config.max_stack;
        if size > max {
            debug_assert_eq!(size, self.config.error_stack_size());
            if raise {
                return Err(self.throw(l, Throw::ErrErr));
            }
            return Ok(false);
        }
        let needed = self.th(l).top + n;
        let new_size = (2 * size).min(max).max(needed);
        if new_size <= max {
            return self.realloc_stack(l, new_size, raise);
        }
        debug!(thread = l.index(), needed, "stack overflow; using emergency allowance");
        let error_size = self.config.error_stack_size();
        self.realloc_stack(l, error_size, raise)?;
        if raise {
            return Err(self.run_error(l, "stack overflow"));
        }
        Ok(false)
    }

    /// Ensure `n` free slots above top, growing and raising as needed.
    #[inline]
    pub fn check_stack(&mut self, l: ThreadId, n: usize) -> VmResult<()> {
        let th = self.th(l);
        if th.stack_size().saturating_sub(th.top) <= n {
            self.grow_stack(l, n, true)?;
        }
        Ok(())
    }

    /// `check_stack` that also gives the collector a chance to run when the
    /// stack has to grow. The step runs first: traversing the thread may
    /// shrink its stack, and the reserved slots are not yet covered by any
    /// frame top.
    pub(crate) fn check_stack_gcp(&mut self, l: ThreadId, n: usize) -> VmResult<()> {
        let th = self.th(l);
        if th.stack_size().saturating_sub(th.top) <= n {
            self.check_gc(l);
            self.grow_stack(l, n, true)?;
        }
        Ok(())
    }

    /// High-water mark: one past the largest of top and every active frame's top.
    pub fn stack_in_use(&self, l: ThreadId) -> usize {
        let th = self.th(l);
        let lim = th.ci_list[..=th.ci]
            .iter()
            .map(|ci| ci.top)
            .fold(th.top, usize::max);
        (lim + 1).max(MIN_STACK)
    }

    /// Give back stack space left over from deep recursion, and leave the
    /// emergency allowance once it is no longer in use.
    pub fn shrink_stack(&mut self, l: ThreadId) {
        let in_use = self.stack_in_use(l);
        let max_stack = self.config.max_stack;
        let mut max = in_use * 3;
        let mut new_size = in_use * 2;
        if max > max_stack {
            max = max_stack;
            new_size = new_size.min(max_stack);
        }
        if in_use <= max_stack && self.th(l).stack_size() > max {
            // failing to shrink is harmless
            let _ = self.realloc_stack(l, new_size, false);
        }
        self.shrink_ci(l);
    }

    /// Push one slot, growing the stack when full.
    pub fn inc_top(&mut self, l: ThreadId) -> VmResult<()> {
        self.check_stack(l, 1)?;
        self.th_mut(l).top += 1;
        Ok(())
    }

    /// Activate the next frame, reusing the free chain when possible.
    pub(crate) fn next_ci(&mut self, l: ThreadId) -> usize {
        let th = self.th_mut(l);
        let next = th.ci + 1;
        if next == th.ci_list.len() {
            th.ci_list.push(CallInfo::default());
        }
        th.ci = next;
        next
    }

    /// Drop half of the retained free frames.
    pub fn shrink_ci(&mut self, l: ThreadId) {
        let th = self.th_mut(l);
        let free = th.ci_list.len() - (th.ci + 1);
        th.ci_list.truncate(th.ci + 1 + (free - free / 2));
    }
}
