//! Runtime limits and collector tuning.

use crate::thread::BASIC_STACK_SIZE;
use cup_core::gc::{GcMode, DEFAULT_PAUSE, DEFAULT_STEPMUL, DEFAULT_STEPSIZE};

/// Slots past `max_stack` granted once to build a stack-overflow message.
pub const ERROR_STACK_EXTRA: usize = 200;

#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    /// Hard cap on a thread's stack, in slots.
    pub max_stack: usize,
    /// Nesting limit for native calls and resumes.
    pub max_ccalls: u32,
    pub gc_mode: GcMode,
    /// Percent of the live estimate the heap may grow before a new cycle.
    pub gc_pause: u32,
    /// Work per step relative to allocation.
    pub gc_stepmul: u32,
    /// Log2 of the bytes allocated between steps.
    pub gc_stepsize: u32,
    /// Allocations past this many bytes fail with "not enough memory".
    pub memory_limit: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_stack: 1_000_000,
            max_ccalls: 200,
            gc_mode: GcMode::Incremental,
            gc_pause: DEFAULT_PAUSE,
            gc_stepmul: DEFAULT_STEPMUL,
            gc_stepsize: DEFAULT_STEPSIZE,
            memory_limit: None,
        }
    }
}

impl RuntimeConfig {
    pub fn with_max_stack(mut self, n: usize) -> Self {
        self.max_stack = n;
        self
    }

    pub fn with_max_ccalls(mut self, n: u32) -> Self {
        self.max_ccalls = n;
        self
    }

    pub fn with_gc_mode(mut self, mode: GcMode) -> Self {
        self.gc_mode = mode;
        self
    }

    pub fn with_gc_pause(mut self, pause: u32) -> Self {
        self.gc_pause = pause;
        self
    }

    pub fn with_gc_stepmul(mut self, stepmul: u32) -> Self {
        self.gc_stepmul = stepmul;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Stack size used while an overflow error is being raised.
    pub fn error_stack_size(&self) -> usize {
        self.max_stack + ERROR_STACK_EXTRA
    }

    /// Native depth at which raising turns into "error in error handling".
    pub fn errerr_ccalls(&self) -> u32 {
        self.max_ccalls / 10 * 11
    }

    /// Clamp values the engine cannot work with.
    pub fn normalized(mut self) -> Self {
        self.max_stack = self.max_stack.max(BASIC_STACK_SIZE);
        self.max_ccalls = self.max_ccalls.clamp(10, 50_000);
        self.gc_stepsize = self.gc_stepsize.min(40);
        self
    }
}
