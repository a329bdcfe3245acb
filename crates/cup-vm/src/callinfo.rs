//! Call frame information.

use crate::error::Status;
use crate::vm::KFunction;
use std::fmt;

/// Wanted-results value meaning "all of them".
pub const MULTRET: i32 = -1;

// Bits of `CallInfo::callstatus`.
/// Original value of `allow_hook` at a yieldable protected call.
pub const CIST_OAH: u16 = 1 << 0;
/// Native frame.
pub const CIST_C: u16 = 1 << 1;
/// Script frame entered by a fresh dispatch loop.
pub const CIST_FRESH: u16 = 1 << 2;
/// Frame is running a debug hook.
pub const CIST_HOOKED: u16 = 1 << 3;
/// Yieldable protected call in progress.
pub const CIST_YPCALL: u16 = 1 << 4;
/// Frame was reached through a tail call.
pub const CIST_TAIL: u16 = 1 << 5;
/// Last hook call yielded.
pub const CIST_HOOKYIELD: u16 = 1 << 6;
/// Frame is running a finalizer.
pub const CIST_FIN: u16 = 1 << 7;
/// Transfer info in `ftransfer`/`ntransfer` is valid.
pub const CIST_TRAN: u16 = 1 << 8;
/// Native frame is closing its to-be-closed variables before returning.
pub const CIST_CLSRET: u16 = 1 << 9;

/// Native frames that own to-be-closed slots encode their wanted count below
/// `MULTRET` so `poscall` takes the slow path.
#[inline]
pub fn has_to_close_native(nresults: i32) -> bool {
    nresults < MULTRET
}

#[inline]
pub fn code_nresults(n: i32) -> i32 {
    -n - 3
}

#[inline]
pub fn decode_nresults(n: i32) -> i32 {
    -n - 3
}

/// One activation record. Positions are stack indices, so stack
/// reallocation never invalidates a frame.
#[derive(Clone, Copy)]
pub struct CallInfo {
    /// Slot holding the callee.
    pub func: usize,
    /// First slot the frame may not use.
    pub top: usize,
    pub nresults: i32,
    pub callstatus: u16,
    /// Script frames: index of the next instruction.
    pub savedpc: usize,
    /// Script frames: extra arguments of a vararg call.
    pub nextraargs: usize,
    /// Native frames: continuation run after a yield or a recovered error.
    pub k: Option<KFunction>,
    pub ctx: isize,
    pub old_errfunc: usize,
    /// Status left by error recovery for a yieldable protected call.
    pub recover_status: Status,
    /// Callee slot of the yieldable protected call.
    pub funcidx: usize,
    pub nyield: usize,
    pub nres: usize,
    pub ftransfer: usize,
    pub ntransfer: usize,
}

impl Default for CallInfo {
    fn default() -> Self {
        CallInfo {
            func: 0,
            top: 0,
            nresults: 0,
            callstatus: 0,
            savedpc: 0,
            nextraargs: 0,
            k: None,
            ctx: 0,
            old_errfunc: 0,
            recover_status: Status::Ok,
            funcidx: 0,
            nyield: 0,
            nres: 0,
            ftransfer: 0,
            ntransfer: 0,
        }
    }
}

impl CallInfo {
    #[inline(always)]
    pub fn is_native(&self) -> bool {
        self.callstatus & CIST_C != 0
    }

    #[inline(always)]
    pub fn is_script(&self) -> bool {
        self.callstatus & CIST_C == 0
    }

    #[inline(always)]
    pub fn has(&self, flag: u16) -> bool {
        self.callstatus & flag != 0
    }

    #[inline(always)]
    pub fn set(&mut self, flag: u16) {
        self.callstatus |= flag;
    }

    #[inline(always)]
    pub fn clear(&mut self, flag: u16) {
        self.callstatus &= !flag;
    }

    pub fn set_oah(&mut self, allow_hook: bool) {
        if allow_hook {
            self.set(CIST_OAH);
        } else {
            self.clear(CIST_OAH);
        }
    }
}

impl fmt::Debug for CallInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallInfo")
            .field("func", &self.func)
            .field("top", &self.top)
            .field("nresults", &self.nresults)
            .field("callstatus", &format_args!("{:#06x}", self.callstatus))
            .field("savedpc", &self.savedpc)
            .field("has_k", &self.k.is_some())
            .finish()
    }
}
