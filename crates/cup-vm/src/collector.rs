//! Collector driver: allocation accounting, write barriers, incremental
//! and generational cycles, finalizers.
//!
//! Marking is tri-color over the object arenas. While the phase is at or
//! before `Atomic`, no black object may refer to a white one; every store
//! of a managed reference into a possibly black object goes through
//! [`Vm::barrier`] or [`Vm::barrier_back`].

use crate::callinfo::CIST_FIN;
use crate::error::{Status, VmResult};
use crate::metamethod::Tm;
use crate::object::UpVal;
use crate::table::Table;
use crate::thread::ThreadId;
use crate::value::TValue;
use crate::vm::Vm;
use cup_core::gc::{
    Age, GcIdx, GcMode, GcPhase, GcRef, ObjKind, OBJ_KINDS, STOP_CLOSE, STOP_GC, STOP_STEP, STOP_USER,
};
use tracing::{debug, trace, warn};

/// Arena slots visited per sweep step.
const SWEEP_MAX: usize = 100;
/// Finalizers run per step of the `CallFin` phase.
const FIN_MAX: usize = 10;
const FIN_COST: usize = 50;
/// Growth over the last major collection, in percent, that triggers the next one.
const GEN_MAJOR_MUL: usize = 100;
/// Allocation between minor collections, in percent of the heap.
const GEN_MINOR_MUL: usize = 20;

fn push_ref(out: &mut Vec<GcRef>, v: TValue) {
    if let Some(r) = v.gc_ref() {
        out.push(r);
    }
}

impl Vm {
    /// Account for `bytes` of new memory. Past the memory limit an
    /// emergency collection is tried once; `false` means the allocation
    /// must fail.
    pub(crate) fn try_charge(&mut self, l: ThreadId, bytes: usize) -> bool {
        if let Some(limit) = self.config.memory_limit {
            if self.gc.total_bytes() + bytes > limit {
                if !self.gc.is_stopped_by(STOP_GC | STOP_STEP | STOP_CLOSE) {
                    debug!(bytes, total = self.gc.total_bytes(), "emergency collection");
                    self.full_gc(l, true);
                }
                if self.gc.total_bytes() + bytes > limit {
                    return false;
                }
            }
        }
        self.gc.charge(bytes);
        true
    }

    /// `try_charge` that raises out-of-memory on failure.
    pub(crate) fn charge_alloc(&mut self, l: ThreadId, bytes: usize) -> VmResult<()> {
        if self.try_charge(l, bytes) {
            Ok(())
        } else {
            Err(self.mem_error(l))
        }
    }

    /// Run a collector step if allocation has paid for one.
    pub fn check_gc(&mut self, l: ThreadId) {
        if self.gc.needs_step() {
            self.gc_step(l);
        }
    }

    // ---- barriers ----

    /// Forward barrier for storing `v` into `owner`.
    pub(crate) fn barrier(&mut self, owner: GcRef, v: TValue) {
        if let Some(target) = v.gc_ref() {
            self.obj_barrier(owner, target);
        }
    }

    pub(crate) fn obj_barrier(&mut self, owner: GcRef, target: GcRef) {
        if self.heap.header(owner).is_black() && self.heap.header(target).is_white() {
            self.barrier_forward(owner, target);
        }
    }

    fn barrier_forward(&mut self, owner: GcRef, target: GcRef) {
        debug_assert!(!self.heap.header(owner).is_dead(self.gc.other_white()));
        if self.gc.keep_invariant() {
            self.really_mark(target);
            if self.heap.header(owner).is_old() {
                self.heap.header_mut(target).set_age(Age::Old0);
            }
        } else {
            debug_assert!(self.gc.is_sweep_phase());
            // sweeping whitens the owner anyway; do it now and skip the mark
            if self.gc.mode == GcMode::Incremental {
                let white = self.gc.white();
                self.heap.header_mut(owner).make_white(white);
            }
        }
    }

    /// Backward barrier: `owner` was mutated and is rescanned before the
    /// cycle ends.
    pub(crate) fn barrier_back(&mut self, owner: GcRef, v: TValue) {
        match v.gc_ref() {
            Some(t) if self.heap.header(t).is_white() && self.heap.header(owner).is_black() => {}
            _ => return,
        }
        let header = self.heap.header_mut(owner);
        let old = header.is_old();
        self.gc.link_gray_again(owner, header);
        if old {
            header.set_age(Age::Touched1);
        }
    }

    // ---- marking ----

    fn mark_value(&mut self, v: TValue) {
        if let Some(r) = v.gc_ref() {
            self.mark_object(r);
        }
    }

    fn mark_object(&mut self, r: GcRef) {
        if self.heap.header(r).is_white() {
            self.really_mark(r);
        }
    }

    fn really_mark(&mut self, r: GcRef) {
        if r.kind == ObjKind::UpVal {
            let uv: GcIdx<UpVal> = r.typed();
            match *self.heap.upvals.get(uv) {
                // open cells stay gray and off the lists; their thread marks the value
                UpVal::Open { .. } => self.heap.upvals.header_mut(uv).set_gray(),
                UpVal::Closed(v) => {
                    self.heap.upvals.header_mut(uv).set_black();
                    self.mark_value(v);
                }
            }
            return;
        }
        let header = self.heap.header_mut(r);
        self.gc.mark_gray(r, header);
    }

    fn mark_roots(&mut self, l: ThreadId) {
        let roots = [
            TValue::Table(self.registry),
            TValue::Table(self.globals),
            TValue::Thread(self.main_thread),
            TValue::Thread(self.current),
            TValue::Thread(l),
        ];
        for v in roots {
            self.mark_value(v);
        }
        for mt in self.type_mt.into_iter().flatten() {
            self.mark_value(TValue::Table(mt));
        }
    }

    fn mark_being_fnz(&mut self) {
        let pending = self.gc.tobefnz.clone();
        for r in pending {
            self.mark_object(r);
        }
    }

    /// Weak keys and weak values of a table, from its metatable's `__mode`.
    fn weak_mode(&self, t: &Table) -> (bool, bool) {
        let Some(mt) = t.metatable else {
            return (false, false);
        };
        match self.heap.tables.get(mt).raw_get_str(self.tm_names.get(Tm::Mode)) {
            TValue::Str(s) => {
                let mode = self.strings.get_bytes(s);
                (mode.contains(&b'k'), mode.contains(&b'v'))
            }
            _ => (false, false),
        }
    }

    /// Managed references held strongly by a non-thread object.
    fn children_of(&self, r: GcRef) -> Vec<GcRef> {
        let mut out = Vec::new();
        match r.kind {
            ObjKind::Table => {
                let t = self.heap.tables.get(r.typed());
                let (weak_keys, weak_values) = self.weak_mode(t);
                if let Some(mt) = t.metatable {
                    out.push(GcRef::new(ObjKind::Table, mt));
                }
                if !weak_values {
                    for &v in t.array_values() {
                        push_ref(&mut out, v);
                    }
                }
                for (k, v) in t.hash_entries() {
                    if !weak_keys {
                        push_ref(&mut out, k);
                    }
                    if !weak_values {
                        push_ref(&mut out, v);
                    }
                }
            }
            ObjKind::LuaClosure => {
                let c = self.heap.lua_closures.get(r.typed());
                out.extend(c.upvals.iter().map(|&uv| GcRef::new(ObjKind::UpVal, uv)));
            }
            ObjKind::NativeClosure => {
                for &v in &self.heap.natives.get(r.typed()).upvalues {
                    push_ref(&mut out, v);
                }
            }
            ObjKind::Userdata => {
                let u = self.heap.userdata.get(r.typed());
                if let Some(mt) = u.metatable {
                    out.push(GcRef::new(ObjKind::Table, mt));
                }
                push_ref(&mut out, u.user_value);
            }
            ObjKind::UpVal => {
                if let UpVal::Closed(v) = *self.heap.upvals.get(r.typed()) {
                    push_ref(&mut out, v);
                }
            }
            ObjKind::Thread => {}
        }
        out
    }

    /// One past the highest slot of `t` that may hold a live value: top,
    /// or the register window of any script frame.
    fn live_limit(&self, t: ThreadId) -> usize {
        let th = self.th(t);
        th.ci_list[..=th.ci]
            .iter()
            .filter(|ci| ci.is_script())
            .map(|ci| ci.top)
            .fold(th.top, usize::max)
            .min(th.stack.len())
    }

    fn traverse_thread(&mut self, t: ThreadId) -> usize {
        if self.gc.phase == GcPhase::Propagate {
            // stacks change without barriers; look again in the atomic phase
            let r = GcRef::new(ObjKind::Thread, t);
            let header = self.heap.threads.header_mut(t);
            self.gc.link_gray_again(r, header);
        }
        let limit = self.live_limit(t);
        let mut refs = Vec::new();
        {
            let th = self.th(t);
            for sv in &th.stack[..limit] {
                push_ref(&mut refs, sv.val);
            }
            refs.extend(th.open_upval.iter().map(|&(_, uv)| GcRef::new(ObjKind::UpVal, uv)));
        }
        for r in refs {
            self.mark_object(r);
        }
        if self.gc.phase == GcPhase::Atomic {
            let th = self.heap.threads.get_mut(t);
            for sv in &mut th.stack[limit..] {
                sv.val = TValue::Nil;
            }
            if !th.in_twups && !th.open_upval.is_empty() {
                th.in_twups = true;
                self.twups.push(t);
            }
        } else if !self.gc.emergency {
            self.shrink_stack(t);
        }
        1 + limit
    }

    /// Blacken one gray object and mark what it refers to.
    fn propagate_mark(&mut self) -> usize {
        let Some(r) = self.gc.gray.pop() else {
            return 0;
        };
        self.heap.header_mut(r).set_black();
        if r.kind == ObjKind::Thread {
            return self.traverse_thread(r.typed());
        }
        if r.kind == ObjKind::Table && self.weak_mode(self.heap.tables.get(r.typed())) != (false, false) {
            self.gc.weak.push(r);
        }
        let children = self.children_of(r);
        let work = 1 + children.len();
        for c in children {
            self.mark_object(c);
        }
        work
    }

    fn propagate_all(&mut self) -> usize {
        let mut work = 0;
        while !self.gc.gray.is_empty() {
            work += self.propagate_mark();
        }
        work
    }

    /// Keep values of open upvalues alive for threads that are not marked;
    /// such threads leave the list.
    fn remark_upvals(&mut self) -> usize {
        let mut work = 0;
        let list = std::mem::take(&mut self.twups);
        let mut keep = Vec::with_capacity(list.len());
        for t in list {
            work += 1;
            let th = self.th(t);
            if !self.heap.threads.header(t).is_white() && !th.open_upval.is_empty() {
                keep.push(t);
                continue;
            }
            let cells: Vec<_> = th.open_upval.iter().map(|&(_, uv)| uv).collect();
            self.th_mut(t).in_twups = false;
            for uv in cells {
                work += 1;
                if !self.heap.upvals.header(uv).is_white() {
                    let v = self.upval_get(uv);
                    self.mark_value(v);
                }
            }
        }
        self.twups.extend(keep);
        work
    }

    fn is_unmarked(&self, v: TValue) -> bool {
        v.gc_ref().is_some_and(|r| self.heap.header(r).is_white())
    }

    /// Remove entries of weak tables whose weak part refers to an unmarked
    /// object. Strings are never collected, so they are never cleared.
    fn clear_weak_tables(&mut self) {
        let weak = std::mem::take(&mut self.gc.weak);
        for &r in &weak {
            let t: GcIdx<Table> = r.typed();
            let (weak_keys, weak_values) = self.weak_mode(self.heap.tables.get(t));
            let mut dead = Vec::new();
            {
                let tbl = self.heap.tables.get(t);
                for (i, &v) in tbl.array_values().iter().enumerate() {
                    if weak_values && self.is_unmarked(v) {
                        dead.push(TValue::Int(i as i64 + 1));
                    }
                }
                for (k, v) in tbl.hash_entries() {
                    if (weak_keys && self.is_unmarked(k)) || (weak_values && self.is_unmarked(v)) {
                        dead.push(k);
                    }
                }
            }
            if !dead.is_empty() {
                self.heap.tables.get_mut(t).retain_entries(|k, _| !dead.contains(&k));
            }
        }
        self.gc.weak = weak;
    }

    /// Move unreachable objects with finalizers (or all of them) to the
    /// to-be-finalized list, newest first.
    fn separate_tobefnz(&mut self, all: bool) {
        let heap = &self.heap;
        let mut moved = Vec::new();
        self.gc.finobj.retain(|&r| {
            if all || heap.header(r).is_white() {
                moved.push(r);
                false
            } else {
                true
            }
        });
        moved.reverse();
        self.gc.tobefnz.extend(moved);
    }

    fn atomic(&mut self, l: ThreadId) -> usize {
        self.gc.phase = GcPhase::Atomic;
        self.mark_roots(l);
        let mut work = self.propagate_all();
        work += self.remark_upvals();
        work += self.propagate_all();
        let again = std::mem::take(&mut self.gc.gray_again);
        self.gc.gray.extend(again);
        work += self.propagate_all();
        // finalizable objects are resurrected below; weak values drop them first
        self.clear_weak_tables();
        self.separate_tobefnz(false);
        self.mark_being_fnz();
        work += self.propagate_all();
        self.clear_weak_tables();
        self.gc.weak.clear();
        self.gc.flip_white();
        debug_assert!(self.gc.gray.is_empty());
        work
    }

    fn restart_collection(&mut self, l: ThreadId) {
        self.gc.gray.clear();
        self.gc.gray_again.clear();
        self.gc.weak.clear();
        self.mark_roots(l);
        self.mark_being_fnz();
    }

    // ---- sweeping ----

    fn free_object(&mut self, r: GcRef) {
        if r.kind == ObjKind::Thread {
            self.close_dead_thread(r.typed());
        }
        let bytes = self.heap.free(r);
        self.gc.release(bytes);
    }

    /// Cells still open on a dying thread take their final values.
    fn close_dead_thread(&mut self, t: ThreadId) {
        let open = std::mem::take(&mut self.th_mut(t).open_upval);
        for (level, uv) in open {
            let v = self.th(t).get(level);
            if self.heap.upvals.contains(uv) {
                *self.heap.upvals.get_mut(uv) = UpVal::Closed(v);
            }
        }
        self.twups.retain(|&x| x != t);
    }

    fn enter_sweep(&mut self) {
        self.gc.phase = GcPhase::SweepAllGc;
        self.gc.sweep_cursor = (0, 0);
    }

    /// Sweep up to `SWEEP_MAX` slots: free dead objects, turn survivors
    /// white for the next cycle.
    fn sweep_step(&mut self) -> usize {
        let other = self.gc.other_white();
        let white = self.gc.white();
        let (mut k, mut slot) = self.gc.sweep_cursor;
        let mut count = 0;
        while k < OBJ_KINDS.len() && count < SWEEP_MAX {
            let kind = OBJ_KINDS[k];
            if slot >= self.heap.slot_count(kind) {
                k += 1;
                slot = 0;
                continue;
            }
            let r = GcRef {
                kind,
                index: slot as u32,
            };
            slot += 1;
            count += 1;
            let dead = match self.heap.slot_header_mut(kind, r.index as usize) {
                None => continue,
                Some(h) if h.is_dead(other) => true,
                Some(h) => {
                    h.make_white(white);
                    h.set_age(Age::New);
                    false
                }
            };
            if dead {
                self.free_object(r);
            }
        }
        self.gc.sweep_cursor = (k, slot);
        if k >= OBJ_KINDS.len() {
            self.gc.phase = GcPhase::SweepFinObj;
        }
        count
    }

    // ---- finalizers ----

    /// Register `r` for finalization if `mt` has a `__gc` field.
    pub(crate) fn check_finalizer(&mut self, r: GcRef, mt: Option<GcIdx<Table>>) {
        let Some(mt) = mt else {
            return;
        };
        if self.heap.header(r).to_finalize() || self.gc.is_stopped_by(STOP_CLOSE) {
            return;
        }
        let gc_name = self.tm_names.get(Tm::Gc);
        if self.heap.tables.get(mt).raw_get_str(gc_name).is_nil() {
            return;
        }
        self.heap.header_mut(r).set_to_finalize(true);
        self.gc.finobj.push(r);
    }

    fn call_one_finalizer(&mut self, l: ThreadId) {
        let r = self.gc.tobefnz.remove(0);
        self.heap.header_mut(r).set_to_finalize(false);
        let Some(obj) = TValue::from_gc_ref(r) else {
            return;
        };
        let tm = self.get_tm_by_obj(obj, Tm::Gc);
        if tm.is_nil() {
            return;
        }
        let was_stopped = self.gc.is_stopped_by(STOP_GC);
        let old_allow_hook = self.th(l).allow_hook;
        self.gc.stop(STOP_GC);
        let th = self.th_mut(l);
        th.allow_hook = false;
        let top = th.top;
        th.push(tm);
        th.push(obj);
        th.ci_mut().set(CIST_FIN);
        let status = self.pcall(l, |vm| vm.call_no_yield(l, top, 0), top, 0);
        let th = self.th_mut(l);
        th.ci_mut().clear(CIST_FIN);
        th.allow_hook = old_allow_hook;
        if !was_stopped {
            self.gc.restart(STOP_GC);
        }
        if status != Status::Ok {
            let msg = {
                let th = self.th(l);
                self.display_value(th.get(th.top - 1))
            };
            warn!(error = %msg, "error in __gc");
            self.th_mut(l).top = top;
        }
    }

    fn run_a_few_finalizers(&mut self, l: ThreadId) -> usize {
        let mut n = 0;
        while n < FIN_MAX && !self.gc.tobefnz.is_empty() {
            self.call_one_finalizer(l);
            n += 1;
        }
        n
    }

    fn call_all_pending_finalizers(&mut self, l: ThreadId) {
        while !self.gc.tobefnz.is_empty() {
            self.call_one_finalizer(l);
        }
    }

    // ---- driver ----

    /// Perform one unit of the incremental state machine, returning the
    /// work done.
    pub fn gc_single_step(&mut self, l: ThreadId) -> usize {
        self.gc.stop(STOP_STEP);
        let work = match self.gc.phase {
            GcPhase::Pause => {
                self.restart_collection(l);
                self.gc.phase = GcPhase::Propagate;
                1
            }
            GcPhase::Propagate => {
                if self.gc.gray.is_empty() {
                    self.gc.phase = GcPhase::EnterAtomic;
                    0
                } else {
                    self.propagate_mark()
                }
            }
            GcPhase::EnterAtomic | GcPhase::Atomic => {
                let work = self.atomic(l);
                self.enter_sweep();
                self.gc.estimate = self.gc.total_bytes();
                work
            }
            GcPhase::SweepAllGc => self.sweep_step(),
            GcPhase::SweepFinObj => {
                self.gc.phase = GcPhase::SweepToBeFnz;
                0
            }
            GcPhase::SweepToBeFnz => {
                self.gc.phase = GcPhase::SweepEnd;
                0
            }
            GcPhase::SweepEnd => {
                self.gc.estimate = self.gc.total_bytes();
                self.gc.phase = GcPhase::CallFin;
                0
            }
            GcPhase::CallFin => {
                if !self.gc.tobefnz.is_empty() && !self.gc.emergency {
                    self.run_a_few_finalizers(l) * FIN_COST
                } else {
                    self.gc.phase = GcPhase::Pause;
                    debug!(
                        total = self.gc.total_bytes(),
                        objects = self.heap.object_count(),
                        "collection cycle finished"
                    );
                    0
                }
            }
        };
        self.gc.restart(STOP_STEP);
        work
    }

    fn run_until(&mut self, l: ThreadId, phase: GcPhase) {
        while self.gc.phase != phase {
            self.gc_single_step(l);
        }
    }

    /// Pay the current allocation debt with collector work.
    pub fn gc_step(&mut self, l: ThreadId) {
        if !self.gc.is_running() {
            self.gc.set_debt(-2000);
            return;
        }
        match self.gc.mode {
            GcMode::Incremental => self.inc_step(l),
            GcMode::Generational => self.gen_step(l),
        }
    }

    fn inc_step(&mut self, l: ThreadId) {
        let step = self.gc.step_work();
        let mut debt = self.gc.debt_work();
        loop {
            debt -= self.gc_single_step(l) as isize;
            if debt <= -step || self.gc.phase == GcPhase::Pause {
                break;
            }
        }
        if self.gc.phase == GcPhase::Pause {
            self.gc.set_pause();
        } else {
            self.gc.set_debt_from_work(debt);
        }
        trace!(phase = ?self.gc.phase, debt = self.gc.debt(), "incremental step");
    }

    /// Complete collection. An emergency collection runs no finalizers and
    /// leaves stacks alone.
    pub fn full_gc(&mut self, l: ThreadId, emergency: bool) {
        debug_assert!(!self.gc.emergency);
        self.gc.emergency = emergency;
        match self.gc.mode {
            GcMode::Incremental => self.full_inc(l),
            GcMode::Generational => self.full_gen(l),
        }
        self.gc.emergency = false;
    }

    fn full_inc(&mut self, l: ThreadId) {
        if self.gc.keep_invariant() {
            // sweeping turns the black objects of the interrupted cycle white
            self.enter_sweep();
        }
        self.run_until(l, GcPhase::Pause);
        self.run_until(l, GcPhase::CallFin);
        self.run_until(l, GcPhase::Pause);
        self.gc.set_pause();
    }

    // ---- generational mode ----

    fn set_minor_debt(&mut self) {
        let d = (self.gc.total_bytes() / 100) * GEN_MINOR_MUL;
        self.gc.set_debt(-(d as isize));
    }

    fn gen_step(&mut self, l: ThreadId) {
        let major_base = self.gc.estimate;
        let major_inc = (major_base / 100) * GEN_MAJOR_MUL;
        if self.gc.total_bytes() > major_base + major_inc {
            self.full_gen(l);
        } else {
            self.young_collection(l);
            self.set_minor_debt();
        }
    }

    /// Whiten every object and return to a clean incremental state.
    fn enter_inc(&mut self) {
        let white = self.gc.white();
        for kind in OBJ_KINDS {
            for slot in 0..self.heap.slot_count(kind) {
                if let Some(h) = self.heap.slot_header_mut(kind, slot) {
                    h.make_white(white);
                    h.set_age(Age::New);
                }
            }
        }
        self.gc.gray.clear();
        self.gc.gray_again.clear();
        self.gc.phase = GcPhase::Pause;
        self.gc.mode = GcMode::Incremental;
    }

    /// Full trace in incremental style, then everything alive becomes old.
    fn enter_gen(&mut self, l: ThreadId) {
        self.run_until(l, GcPhase::Pause);
        self.run_until(l, GcPhase::Propagate);
        self.gc.stop(STOP_STEP);
        self.atomic(l);
        self.atomic_to_gen();
        self.gc.restart(STOP_STEP);
        if !self.gc.emergency {
            self.call_all_pending_finalizers(l);
        }
    }

    fn atomic_to_gen(&mut self) {
        self.gc.gray.clear();
        self.gc.gray_again.clear();
        let other = self.gc.other_white();
        for kind in OBJ_KINDS {
            for slot in 0..self.heap.slot_count(kind) {
                let dead = match self.heap.slot_header_mut(kind, slot) {
                    None => continue,
                    Some(h) if h.is_dead(other) => true,
                    Some(h) => {
                        h.set_black();
                        h.set_age(Age::Old);
                        false
                    }
                };
                if dead {
                    self.free_object(GcRef {
                        kind,
                        index: slot as u32,
                    });
                }
            }
        }
        self.gc.mode = GcMode::Generational;
        self.gc.phase = GcPhase::Propagate;
        self.gc.estimate = self.gc.total_bytes();
        self.set_minor_debt();
    }

    fn full_gen(&mut self, l: ThreadId) {
        debug!(total = self.gc.total_bytes(), "major collection");
        self.enter_inc();
        self.enter_gen(l);
    }

    /// Minor collection: only young objects can die. Old objects that may
    /// refer to young ones are traversed again, and so are all threads.
    fn young_collection(&mut self, l: ThreadId) {
        debug_assert_eq!(self.gc.phase, GcPhase::Propagate);
        self.gc.stop(STOP_STEP);
        let mut rescan = Vec::new();
        for kind in OBJ_KINDS {
            for slot in 0..self.heap.slot_count(kind) {
                let weak = kind == ObjKind::Table
                    && self
                        .heap
                        .tables
                        .try_get(GcIdx::new(slot as u32))
                        .is_some_and(|t| self.weak_mode(t) != (false, false));
                let Some(h) = self.heap.slot_header_mut(kind, slot) else {
                    continue;
                };
                let old_with_young_refs = matches!(h.age(), Age::Old1 | Age::Touched1 | Age::Touched2);
                if !h.is_white() && (kind == ObjKind::Thread || old_with_young_refs || weak) {
                    rescan.push(GcRef {
                        kind,
                        index: slot as u32,
                    });
                }
            }
        }
        for r in rescan {
            if r.kind == ObjKind::UpVal {
                if let UpVal::Closed(v) = *self.heap.upvals.get(r.typed()) {
                    self.mark_value(v);
                }
            } else {
                let header = self.heap.header_mut(r);
                self.gc.mark_gray(r, header);
            }
        }
        self.atomic(l);
        let other = self.gc.other_white();
        let white = self.gc.white();
        for kind in OBJ_KINDS {
            for slot in 0..self.heap.slot_count(kind) {
                let dead = match self.heap.slot_header_mut(kind, slot) {
                    None => continue,
                    Some(h) if h.is_dead(other) => true,
                    Some(h) => {
                        match h.age() {
                            Age::New => {
                                h.make_white(white);
                                h.set_age(Age::Survival);
                            }
                            Age::Touched1 => h.set_age(Age::Touched2),
                            Age::Touched2 => h.set_age(Age::Old),
                            age => h.set_age(age.next()),
                        }
                        false
                    }
                };
                if dead {
                    self.free_object(GcRef {
                        kind,
                        index: slot as u32,
                    });
                }
            }
        }
        self.gc.phase = GcPhase::Propagate;
        self.gc.restart(STOP_STEP);
        trace!(total = self.gc.total_bytes(), "minor collection");
        if !self.gc.emergency {
            self.call_all_pending_finalizers(l);
        }
    }

    /// Switch collector mode, returning the previous one.
    pub fn set_gc_mode(&mut self, l: ThreadId, mode: GcMode) -> GcMode {
        let old = self.gc.mode;
        if mode != old {
            match mode {
                GcMode::Generational => self.enter_gen(l),
                GcMode::Incremental => self.enter_inc(),
            }
            debug!(?old, new = ?mode, "collector mode changed");
        }
        old
    }

    /// Stop or restart automatic collection on behalf of the host.
    pub fn set_gc_running(&mut self, running: bool) {
        if running {
            self.gc.restart(STOP_USER);
            self.gc.set_debt(0);
        } else {
            self.gc.stop(STOP_USER);
        }
    }

    /// Explicit step requested by the host: a basic step when `kb` is 0,
    /// otherwise `kb` kilobytes are added to the debt first. Runs even when
    /// the host stopped the collector. Returns true if a cycle finished.
    pub fn gc_user_step(&mut self, l: ThreadId, kb: usize) -> bool {
        let user_stopped = self.gc.is_stopped_by(STOP_USER);
        self.gc.restart(STOP_USER);
        let debt = if kb == 0 {
            self.gc.set_debt(0);
            self.gc_step(l);
            1
        } else {
            let debt = (kb * 1024) as isize + self.gc.debt();
            self.gc.set_debt(debt);
            self.check_gc(l);
            debt
        };
        if user_stopped {
            self.gc.stop(STOP_USER);
        }
        debt > 0 && self.gc.phase == GcPhase::Pause
    }

    /// Whether no black object refers to a white one. Only meaningful for
    /// incremental mode while the phase is at or before `Atomic`.
    pub fn gc_invariant_holds(&self) -> bool {
        if self.gc.mode != GcMode::Incremental || !self.gc.keep_invariant() {
            return true;
        }
        for kind in OBJ_KINDS {
            for slot in 0..self.heap.slot_count(kind) {
                let r = GcRef {
                    kind,
                    index: slot as u32,
                };
                if !self.heap.contains(r) || !self.heap.header(r).is_black() {
                    continue;
                }
                let children = if kind == ObjKind::Thread {
                    let t: ThreadId = r.typed();
                    let th = self.th(t);
                    let mut out = Vec::new();
                    for sv in &th.stack[..self.live_limit(t)] {
                        push_ref(&mut out, sv.val);
                    }
                    out
                } else {
                    self.children_of(r)
                };
                if children.iter().any(|&c| self.heap.header(c).is_white()) {
                    return false;
                }
            }
        }
        true
    }

    /// Close the main thread's pending to-be-closed variables and run every
    /// outstanding finalizer. Consumes the runtime.
    pub fn shutdown(mut self) {
        let l = self.main_thread;
        self.th_mut(l).ci = 0;
        self.close_protected(l, 1, Status::Ok);
        self.gc.stop(STOP_CLOSE);
        self.separate_tobefnz(true);
        self.call_all_pending_finalizers(l);
        debug!(objects = self.heap.object_count(), "runtime closed");
    }
}
