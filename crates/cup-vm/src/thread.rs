//! Logical threads: a value stack, a frame chain and a recovery chain.

use crate::callinfo::{CallInfo, CIST_C};
use crate::error::Status;
use crate::hook::HookFn;
use crate::object::UpVal;
use crate::value::TValue;
use cup_core::gc::GcIdx;

/// Slots kept past the usable end of every stack, so a few pushes never
/// need a bounds check (error messages, close-method calls, handlers).
pub const EXTRA_STACK: usize = 5;
/// Free slots guaranteed to a native function.
pub const MIN_STACK: usize = 20;
pub const BASIC_STACK_SIZE: usize = 2 * MIN_STACK;
/// Largest gap between two to-be-closed entries that fits the encoding.
pub const MAX_DELTA: usize = u16::MAX as usize;

/// Increment of `n_ccalls` for a non-yieldable native call: one level of
/// nesting plus one in the non-yieldable counter kept in the upper half.
pub const NYCI: u32 = 0x10000 | 1;

pub type ThreadId = GcIdx<Thread>;

/// A stack slot. `tbc_delta` links to-be-closed entries: it is the distance
/// to the previous entry, or 0 for a filler node.
#[derive(Clone, Copy, Debug, Default)]
pub struct StackValue {
    pub val: TValue,
    pub tbc_delta: u16,
}

/// A live protected region on this thread.
#[derive(Clone, Copy, Debug)]
pub struct RecoveryContext {
    pub status: Status,
}

pub struct Thread {
    /// `stack_size() + EXTRA_STACK` slots.
    pub stack: Vec<StackValue>,
    /// First free slot.
    pub top: usize,
    /// Most recent to-be-closed entry; 0 when the list is empty.
    pub tbc_list: usize,
    /// Frame chain; entries past `ci` are the retained free chain.
    pub ci_list: Vec<CallInfo>,
    /// Active frame.
    pub ci: usize,
    pub status: Status,
    /// Open upvalues as (level, cell), strictly decreasing by level.
    pub open_upval: Vec<(usize, GcIdx<UpVal>)>,
    /// Registered in the runtime's threads-with-open-upvalues list.
    pub in_twups: bool,
    pub recovery: Vec<RecoveryContext>,
    /// Low 16 bits: native nesting. High bits: non-yieldable nesting.
    pub n_ccalls: u32,
    /// Stack slot of the current message handler; 0 for none.
    pub errfunc: usize,
    /// Last instruction traced by the line hook.
    pub old_pc: usize,
    pub hook: Option<HookFn>,
    pub hook_mask: u8,
    pub base_hook_count: u32,
    pub hook_count: u32,
    pub allow_hook: bool,
}

impl Thread {
    pub fn new() -> Self {
        let base = CallInfo {
            func: 0,
            top: 1 + MIN_STACK,
            nresults: 0,
            callstatus: CIST_C,
            ..Default::default()
        };
        Thread {
            stack: vec![StackValue::default(); BASIC_STACK_SIZE + EXTRA_STACK],
            top: 1,
            tbc_list: 0,
            ci_list: vec![base],
            ci: 0,
            status: Status::Ok,
            open_upval: Vec::new(),
            in_twups: false,
            recovery: Vec::new(),
            n_ccalls: 0,
            errfunc: 0,
            old_pc: 0,
            hook: None,
            hook_mask: 0,
            base_hook_count: 0,
            hook_count: 0,
            allow_hook: true,
        }
    }

    /// Usable slots; the boundary `top` may reach.
    #[inline(always)]
    pub fn stack_size(&self) -> usize {
        self.stack.len() - EXTRA_STACK
    }

    #[inline(always)]
    pub fn get(&self, idx: usize) -> TValue {
        self.stack[idx].val
    }

    #[inline(always)]
    pub fn set(&mut self, idx: usize, v: TValue) {
        self.stack[idx].val = v;
    }

    #[inline(always)]
    pub fn push(&mut self, v: TValue) {
        self.stack[self.top].val = v;
        self.top += 1;
    }

    #[inline(always)]
    pub fn ci(&self) -> &CallInfo {
        &self.ci_list[self.ci]
    }

    #[inline(always)]
    pub fn ci_mut(&mut self) -> &mut CallInfo {
        let ci = self.ci;
        &mut self.ci_list[ci]
    }

    pub fn ccalls(&self) -> u32 {
        self.n_ccalls & 0xffff
    }

    pub fn is_yieldable(&self) -> bool {
        self.n_ccalls & 0xffff_0000 == 0
    }

    /// Frames in use, the base frame included.
    pub fn frame_depth(&self) -> usize {
        self.ci + 1
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}
