//! Collector contract: typed arena indices, object headers, and the phase machine.
//!
//! Every managed object lives in an [`Arena`] slot next to a [`GcHeader`]. The
//! header carries the tri-color mark, the generational age and the
//! finalization flag. [`GcState`] holds the process-wide bookkeeping that the
//! runtime's collector drives and that every barrier consults.

use std::fmt;
use std::marker::PhantomData;

/// A typed index into an [`Arena`].
pub struct GcIdx<T>(pub u32, pub PhantomData<T>);

impl<T> GcIdx<T> {
    pub fn new(index: u32) -> Self {
        GcIdx(index, PhantomData)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> fmt::Debug for GcIdx<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcIdx({})", self.0)
    }
}

// Layout of the `marked` byte: bits 0-2 age, 3-4 whites, 5 black, 6 finalizable.
pub const WHITE0_BIT: u8 = 3;
pub const WHITE1_BIT: u8 = 4;
pub const BLACK_BIT: u8 = 5;
pub const FINALIZED_BIT: u8 = 6;

pub const WHITE_BITS: u8 = (1 << WHITE0_BIT) | (1 << WHITE1_BIT);
const BLACK: u8 = 1 << BLACK_BIT;
const COLOR_MASK: u8 = WHITE_BITS | BLACK;
const AGE_MASK: u8 = 0x07;

/// Collector stop reasons, combined as a bit set.
pub const STOP_USER: u8 = 1;
/// Set while a finalizer runs so collection steps never nest inside one.
pub const STOP_GC: u8 = 2;
/// Set for the duration of a collector step; blocks emergency collections.
pub const STOP_STEP: u8 = 4;
/// Set while the runtime shuts down; no new finalizers are registered.
pub const STOP_CLOSE: u8 = 8;

/// Bytes of allocation that pay for one unit of collector work.
pub const WORK2MEM: isize = 16;

/// Generational age of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Age {
    New = 0,
    Survival = 1,
    /// Marked old by a forward barrier during this cycle.
    Old0 = 2,
    Old1 = 3,
    Old = 4,
    /// Old object written to during this cycle.
    Touched1 = 5,
    Touched2 = 6,
}

impl Age {
    fn from_bits(bits: u8) -> Age {
        match bits & AGE_MASK {
            0 => Age::New,
            1 => Age::Survival,
            2 => Age::Old0,
            3 => Age::Old1,
            4 => Age::Old,
            5 => Age::Touched1,
            _ => Age::Touched2,
        }
    }

    /// Age after surviving one more collection.
    pub fn next(self) -> Age {
        match self {
            Age::New => Age::Survival,
            Age::Survival | Age::Old0 => Age::Old1,
            Age::Old1 | Age::Old => Age::Old,
            Age::Touched1 => Age::Touched1,
            Age::Touched2 => Age::Touched2,
        }
    }

    pub fn is_old(self) -> bool {
        self > Age::Survival
    }
}

/// Observable color of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Color {
    White0,
    White1,
    Gray,
    Black,
}

/// Per-object collector header.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct GcHeader {
    marked: u8,
}

impl GcHeader {
    /// A fresh header in the given white with age `New`.
    pub fn new(white: u8) -> Self {
        GcHeader {
            marked: white & WHITE_BITS,
        }
    }

    pub fn bits(self) -> u8 {
        self.marked
    }

    #[inline]
    pub fn is_white(&self) -> bool {
        self.marked & WHITE_BITS != 0
    }

    #[inline]
    pub fn is_black(&self) -> bool {
        self.marked & BLACK != 0
    }

    #[inline]
    pub fn is_gray(&self) -> bool {
        self.marked & COLOR_MASK == 0
    }

    pub fn color(&self) -> Color {
        if self.is_black() {
            Color::Black
        } else if self.marked & (1 << WHITE0_BIT) != 0 {
            Color::White0
        } else if self.marked & (1 << WHITE1_BIT) != 0 {
            Color::White1
        } else {
            Color::Gray
        }
    }

    /// An object carrying the white of the previous cycle is garbage once
    /// the whites have been flipped.
    #[inline]
    pub fn is_dead(&self, other_white: u8) -> bool {
        self.marked & other_white != 0
    }

    pub fn make_white(&mut self, white: u8) {
        self.marked = (self.marked & !COLOR_MASK) | (white & WHITE_BITS);
    }

    pub fn set_gray(&mut self) {
        self.marked &= !COLOR_MASK;
    }

    pub fn set_black(&mut self) {
        self.marked = (self.marked & !WHITE_BITS) | BLACK;
    }

    pub fn age(&self) -> Age {
        Age::from_bits(self.marked)
    }

    pub fn set_age(&mut self, age: Age) {
        self.marked = (self.marked & !AGE_MASK) | age as u8;
    }

    pub fn is_old(&self) -> bool {
        self.age().is_old()
    }

    /// Whether the object sits on the finalizable list.
    pub fn to_finalize(&self) -> bool {
        self.marked & (1 << FINALIZED_BIT) != 0
    }

    pub fn set_to_finalize(&mut self, on: bool) {
        if on {
            self.marked |= 1 << FINALIZED_BIT;
        } else {
            self.marked &= !(1 << FINALIZED_BIT);
        }
    }
}

impl fmt::Debug for GcHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcHeader")
            .field("color", &self.color())
            .field("age", &self.age())
            .field("to_finalize", &self.to_finalize())
            .finish()
    }
}

/// Collector phases, in cycle order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcPhase {
    Propagate,
    EnterAtomic,
    Atomic,
    SweepAllGc,
    SweepFinObj,
    SweepToBeFnz,
    SweepEnd,
    CallFin,
    Pause,
}

impl GcPhase {
    /// No black object may point to a white one while this holds.
    pub fn keeps_invariant(self) -> bool {
        self <= GcPhase::Atomic
    }

    pub fn is_sweep(self) -> bool {
        (GcPhase::SweepAllGc..=GcPhase::SweepEnd).contains(&self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GcMode {
    #[default]
    Incremental,
    Generational,
}

/// Kinds of managed objects. The order is the sweep order: threads go first
/// so their open upvalues can still be closed while being freed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjKind {
    Thread,
    Table,
    LuaClosure,
    NativeClosure,
    UpVal,
    Userdata,
}

pub const OBJ_KINDS: [ObjKind; 6] = [
    ObjKind::Thread,
    ObjKind::Table,
    ObjKind::LuaClosure,
    ObjKind::NativeClosure,
    ObjKind::UpVal,
    ObjKind::Userdata,
];

/// An untyped reference to a managed object, as held by the worklists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GcRef {
    pub kind: ObjKind,
    pub index: u32,
}

impl GcRef {
    pub fn new<T>(kind: ObjKind, idx: GcIdx<T>) -> Self {
        GcRef {
            kind,
            index: idx.0,
        }
    }

    pub fn typed<T>(self) -> GcIdx<T> {
        GcIdx::new(self.index)
    }
}

/// An arena slot: header plus payload.
pub struct GcBox<T> {
    pub header: GcHeader,
    pub value: T,
}

/// Slot arena with a free list. Indices stay stable for an object's lifetime.
pub struct Arena<T> {
    slots: Vec<Option<GcBox<T>>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Store `value` with a header in the given white.
    pub fn insert(&mut self, value: T, white: u8) -> GcIdx<T> {
        let slot = GcBox {
            header: GcHeader::new(white),
            value,
        };
        self.live += 1;
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(slot);
            GcIdx::new(idx)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Some(slot));
            GcIdx::new(idx)
        }
    }

    #[inline]
    pub fn get(&self, idx: GcIdx<T>) -> &T {
        &self.slots[idx.0 as usize]
            .as_ref()
            .expect("object was freed")
            .value
    }

    #[inline]
    pub fn get_mut(&mut self, idx: GcIdx<T>) -> &mut T {
        &mut self.slots[idx.0 as usize]
            .as_mut()
            .expect("object was freed")
            .value
    }

    pub fn try_get(&self, idx: GcIdx<T>) -> Option<&T> {
        self.slots
            .get(idx.0 as usize)
            .and_then(|s| s.as_ref())
            .map(|b| &b.value)
    }

    pub fn contains(&self, idx: GcIdx<T>) -> bool {
        self.try_get(idx).is_some()
    }

    #[inline]
    pub fn header(&self, idx: GcIdx<T>) -> &GcHeader {
        &self.slots[idx.0 as usize]
            .as_ref()
            .expect("object was freed")
            .header
    }

    #[inline]
    pub fn header_mut(&mut self, idx: GcIdx<T>) -> &mut GcHeader {
        &mut self.slots[idx.0 as usize]
            .as_mut()
            .expect("object was freed")
            .header
    }

    /// Number of slots, live or free. Sweeping walks `0..slot_count()`.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_header(&self, slot: usize) -> Option<GcHeader> {
        self.slots.get(slot)?.as_ref().map(|b| b.header)
    }

    pub fn slot_header_mut(&mut self, slot: usize) -> Option<&mut GcHeader> {
        self.slots.get_mut(slot)?.as_mut().map(|b| &mut b.header)
    }

    pub fn remove(&mut self, idx: GcIdx<T>) -> Option<T> {
        let slot = self.slots.get_mut(idx.0 as usize)?.take()?;
        self.free.push(idx.0);
        self.live -= 1;
        Some(slot.value)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn indices(&self) -> impl Iterator<Item = GcIdx<T>> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| GcIdx::new(i as u32))
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Default collector parameters.
pub const DEFAULT_PAUSE: u32 = 200;
pub const DEFAULT_STEPMUL: u32 = 100;
pub const DEFAULT_STEPSIZE: u32 = 13;

/// Process-wide collector bookkeeping.
pub struct GcState {
    pub phase: GcPhase,
    pub mode: GcMode,
    current_white: u8,
    total_bytes: usize,
    /// Bytes allocated beyond the current threshold. A step is due when positive.
    debt: isize,
    /// Live bytes after the last completed mark.
    pub estimate: usize,
    pub gray: Vec<GcRef>,
    pub gray_again: Vec<GcRef>,
    /// Marked tables with weak keys or values, cleared in the atomic phase.
    pub weak: Vec<GcRef>,
    /// Objects with a finalizer that are still reachable.
    pub finobj: Vec<GcRef>,
    /// Unreachable finalizable objects waiting for their finalizer.
    pub tobefnz: Vec<GcRef>,
    stop: u8,
    pub emergency: bool,
    pub pause: u32,
    pub stepmul: u32,
    /// Log2 of the step size in bytes.
    pub stepsize: u32,
    /// (kind, slot) position of an in-progress sweep.
    pub sweep_cursor: (usize, usize),
}

impl GcState {
    pub fn new(mode: GcMode, pause: u32, stepmul: u32, stepsize: u32) -> Self {
        GcState {
            phase: GcPhase::Pause,
            mode,
            current_white: 1 << WHITE0_BIT,
            total_bytes: 0,
            debt: 0,
            estimate: 0,
            gray: Vec::new(),
            gray_again: Vec::new(),
            weak: Vec::new(),
            finobj: Vec::new(),
            tobefnz: Vec::new(),
            stop: 0,
            emergency: false,
            pause,
            stepmul,
            stepsize,
            sweep_cursor: (0, 0),
        }
    }

    #[inline]
    pub fn white(&self) -> u8 {
        self.current_white
    }

    #[inline]
    pub fn other_white(&self) -> u8 {
        self.current_white ^ WHITE_BITS
    }

    pub fn flip_white(&mut self) {
        self.current_white ^= WHITE_BITS;
    }

    #[inline]
    pub fn keep_invariant(&self) -> bool {
        self.phase.keeps_invariant()
    }

    #[inline]
    pub fn is_sweep_phase(&self) -> bool {
        self.phase.is_sweep()
    }

    pub fn is_running(&self) -> bool {
        self.stop == 0
    }

    pub fn is_stopped_by(&self, reason: u8) -> bool {
        self.stop & reason != 0
    }

    pub fn stop(&mut self, reason: u8) {
        self.stop |= reason;
    }

    pub fn restart(&mut self, reason: u8) {
        self.stop &= !reason;
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn debt(&self) -> isize {
        self.debt
    }

    pub fn set_debt(&mut self, debt: isize) {
        self.debt = debt;
    }

    /// Record an allocation of `bytes`.
    pub fn charge(&mut self, bytes: usize) {
        self.total_bytes += bytes;
        self.debt += bytes as isize;
    }

    /// Record that `bytes` were returned.
    pub fn release(&mut self, bytes: usize) {
        self.total_bytes = self.total_bytes.saturating_sub(bytes);
        self.debt -= bytes as isize;
    }

    #[inline]
    pub fn needs_step(&self) -> bool {
        self.debt > 0 && self.is_running()
    }

    /// Bytes of allocation between two incremental steps.
    pub fn step_size(&self) -> isize {
        1isize << self.stepsize.min(40)
    }

    fn stepmul_odd(&self) -> isize {
        (self.stepmul | 1) as isize
    }

    /// Work units one incremental step should perform.
    pub fn step_work(&self) -> isize {
        (self.step_size() / WORK2MEM) * self.stepmul_odd()
    }

    /// Current debt expressed in work units.
    pub fn debt_work(&self) -> isize {
        (self.debt / WORK2MEM) * self.stepmul_odd()
    }

    /// Turn leftover work units back into a debt in bytes.
    pub fn set_debt_from_work(&mut self, work: isize) {
        self.debt = (work / self.stepmul_odd()) * WORK2MEM;
    }

    /// Schedule the next cycle once memory grows `pause` percent over the estimate.
    pub fn set_pause(&mut self) {
        let threshold = (self.estimate / 100).saturating_mul(self.pause as usize);
        let debt = self.total_bytes as isize - threshold as isize;
        self.debt = debt.min(0);
    }

    /// Move a white object to gray and queue it for traversal.
    pub fn mark_gray(&mut self, r: GcRef, header: &mut GcHeader) {
        header.set_gray();
        self.gray.push(r);
    }

    /// Re-gray a black object and queue it for the atomic rescan.
    pub fn link_gray_again(&mut self, r: GcRef, header: &mut GcHeader) {
        header.set_gray();
        self.gray_again.push(r);
    }
}

impl Default for GcState {
    fn default() -> Self {
        GcState::new(
            GcMode::Incremental,
            DEFAULT_PAUSE,
            DEFAULT_STEPMUL,
            DEFAULT_STEPSIZE,
        )
    }
}
