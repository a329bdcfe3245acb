//! Reference dispatch loop.
//!
//! `execute` runs script frames of one thread until the frame it was
//! entered with (a fresh frame) returns. Script-to-script calls reuse the
//! loop instead of recursing; calls into natives go through `precall`.

use crate::callinfo::CIST_FRESH;
use crate::error::{Status, Throw, VmResult};
use crate::hook::{MASK_COUNT, MASK_LINE};
use crate::object::LuaClosure;
use crate::opcode::OpCode;
use crate::proto::{Constant, Proto};
use crate::thread::ThreadId;
use crate::upval::CloseStatus;
use crate::value::TValue;
use crate::vm::Vm;
use cup_core::gc::GcIdx;
use std::rc::Rc;

/// Why `run` left a frame.
enum Exit {
    /// A script callee got frame `ci`; run it.
    Enter(usize),
    /// The frame was replaced in place by a tail call.
    Reenter,
    /// The frame returned to its caller.
    Return,
}

fn constant_to_tvalue(k: Constant) -> TValue {
    match k {
        Constant::Nil => TValue::Nil,
        Constant::Bool(b) => TValue::Bool(b),
        Constant::Int(i) => TValue::Int(i),
        Constant::Float(f) => TValue::Float(f),
        Constant::Str(s) => TValue::Str(s),
    }
}

/// Run script frame `ci` of `l` (and everything it calls) until a frame
/// marked fresh returns.
pub(crate) fn execute(vm: &mut Vm, l: ThreadId, ci: usize) -> VmResult<()> {
    let mut ci = ci;
    loop {
        let th = vm.th(l);
        if th.hook_mask != 0 && th.ci_list[ci].savedpc == 0 {
            // vararg functions report the call after their arguments are in place
            let is_vararg = vm.frame_proto(l, ci).is_some_and(|p| p.is_vararg);
            if !is_vararg {
                vm.hook_call(l, ci)?;
            }
        }
        match run(vm, l, ci)? {
            Exit::Enter(callee) => ci = callee,
            Exit::Reenter => {}
            Exit::Return => {
                if vm.th(l).ci_list[ci].has(CIST_FRESH) {
                    return Ok(());
                }
                ci = vm.th(l).ci;
            }
        }
    }
}

fn frame_closure(vm: &Vm, l: ThreadId, ci: usize) -> GcIdx<LuaClosure> {
    let th = vm.th(l);
    match th.get(th.ci_list[ci].func) {
        TValue::Function(c) => c,
        other => unreachable!("script frame holds a {} value", other.type_name()),
    }
}

fn arith_error(vm: &mut Vm, l: ThreadId, ci: usize, v: TValue) -> Throw {
    let top = vm.th(l).ci_list[ci].top;
    vm.th_mut(l).top = top;
    let msg = format!("attempt to perform arithmetic on a {} value", vm.obj_type_name(v));
    vm.run_error(l, msg)
}

fn run(vm: &mut Vm, l: ThreadId, ci: usize) -> VmResult<Exit> {
    let cl = frame_closure(vm, l, ci);
    let proto = Rc::clone(&vm.heap.lua_closures.get(cl).proto);
    loop {
        let pc = vm.th(l).ci_list[ci].savedpc;
        // falling off the end returns nothing
        let op = proto.code.get(pc).copied().unwrap_or(OpCode::Return(0, 1));
        vm.th_mut(l).ci_list[ci].savedpc = pc + 1;
        if vm.th(l).hook_mask & (MASK_LINE | MASK_COUNT) != 0 {
            vm.trace_exec(l, ci, &proto, op)?;
        }
        let base = vm.th(l).ci_list[ci].func + 1;
        match op {
            OpCode::Move(a, b) => {
                let th = vm.th_mut(l);
                let v = th.get(base + b as usize);
                th.set(base + a as usize, v);
            }
            OpCode::LoadK(a, bx) => {
                let v = constant_to_tvalue(proto.constants[bx as usize]);
                vm.th_mut(l).set(base + a as usize, v);
            }
            OpCode::LoadInt(a, sbx) => vm.th_mut(l).set(base + a as usize, TValue::Int(sbx as i64)),
            OpCode::LoadNil(a, b) => {
                let th = vm.th_mut(l);
                for r in a as usize..=(a as usize + b as usize) {
                    th.set(base + r, TValue::Nil);
                }
            }

            // ---- upvalues and globals ----
            OpCode::GetUpval(a, b) => {
                let uv = vm.heap.lua_closures.get(cl).upvals[b as usize];
                let v = vm.upval_get(uv);
                vm.th_mut(l).set(base + a as usize, v);
            }
            OpCode::SetUpval(a, b) => {
                let uv = vm.heap.lua_closures.get(cl).upvals[b as usize];
                let v = vm.th(l).get(base + a as usize);
                vm.upval_set(uv, v);
            }
            OpCode::GetGlobal(a, bx) => {
                let key = constant_to_tvalue(proto.constants[bx as usize]);
                let v = vm.heap.tables.get(vm.globals).raw_get(key);
                vm.th_mut(l).set(base + a as usize, v);
            }
            OpCode::SetGlobal(a, bx) => {
                let key = constant_to_tvalue(proto.constants[bx as usize]);
                let v = vm.th(l).get(base + a as usize);
                let top = vm.th(l).ci_list[ci].top;
                vm.th_mut(l).top = top;
                let globals = vm.globals;
                vm.table_set(l, globals, key, v)?;
            }

            // ---- arithmetic and tests ----
            OpCode::AddI(a, b, sc) => {
                let v = match vm.th(l).get(base + b as usize) {
                    TValue::Int(i) => TValue::Int(i.wrapping_add(sc as i64)),
                    TValue::Float(f) => TValue::Float(f + sc as f64),
                    other => return Err(arith_error(vm, l, ci, other)),
                };
                vm.th_mut(l).set(base + a as usize, v);
            }
            OpCode::Add(a, b, c) => {
                let vb = vm.th(l).get(base + b as usize);
                let vc = vm.th(l).get(base + c as usize);
                let v = match (vb, vc) {
                    (TValue::Int(x), TValue::Int(y)) => TValue::Int(x.wrapping_add(y)),
                    (TValue::Int(x), TValue::Float(y)) => TValue::Float(x as f64 + y),
                    (TValue::Float(x), TValue::Int(y)) => TValue::Float(x + y as f64),
                    (TValue::Float(x), TValue::Float(y)) => TValue::Float(x + y),
                    (TValue::Int(_) | TValue::Float(_), other) | (other, _) => {
                        return Err(arith_error(vm, l, ci, other));
                    }
                };
                vm.th_mut(l).set(base + a as usize, v);
            }
            OpCode::EqI(a, sb, k) => {
                let eq = match vm.th(l).get(base + a as usize) {
                    TValue::Int(i) => i == sb as i64,
                    TValue::Float(f) => f == sb as f64,
                    _ => false,
                };
                if eq != k {
                    vm.th_mut(l).ci_list[ci].savedpc += 1;
                }
            }
            OpCode::Test(a, k) => {
                if vm.th(l).get(base + a as usize).is_false() == k {
                    vm.th_mut(l).ci_list[ci].savedpc += 1;
                }
            }
            OpCode::Jmp(sj) => {
                let c = &mut vm.th_mut(l).ci_list[ci];
                c.savedpc = (c.savedpc as isize + sj as isize) as usize;
            }

            OpCode::Closure(a, bx) => {
                let p = Rc::clone(&proto.protos[bx as usize]);
                let top = vm.th(l).ci_list[ci].top;
                vm.th_mut(l).top = top;
                let c = vm.new_nested_closure(l, p, cl, base)?;
                vm.th_mut(l).set(base + a as usize, TValue::Function(c));
                vm.check_gc(l);
            }

            // ---- calls ----
            OpCode::Call(a, b, c) => {
                let ra = base + a as usize;
                if b != 0 {
                    vm.th_mut(l).top = ra + b as usize;
                }
                if let Some(callee) = vm.precall(l, ra, c as i32 - 1)? {
                    return Ok(Exit::Enter(callee));
                }
            }
            OpCode::TailCall(a, b) => {
                let ra = base + a as usize;
                let narg1 = if b != 0 {
                    vm.th_mut(l).top = ra + b as usize;
                    b as usize
                } else {
                    vm.th(l).top - ra
                };
                // distance from the working callee slot to the real one
                let delta = if proto.is_vararg {
                    vm.th(l).ci_list[ci].nextraargs + proto.num_params as usize + 1
                } else {
                    0
                };
                vm.close_upval(l, base);
                debug_assert!(vm.th(l).tbc_list < base);
                let n = vm.pretailcall(l, ci, ra, narg1, delta)?;
                if n < 0 {
                    return Ok(Exit::Reenter);
                }
                vm.th_mut(l).ci_list[ci].func -= delta;
                vm.poscall(l, ci, n as usize)?;
                return Ok(Exit::Return);
            }
            OpCode::Return(a, b) => {
                let ra = base + a as usize;
                let n = if b != 0 {
                    b as usize - 1
                } else {
                    vm.th(l).top - ra
                };
                let needs_close = {
                    let th = vm.th(l);
                    th.tbc_list >= base || th.open_upval.first().is_some_and(|&(lvl, _)| lvl >= base)
                };
                if needs_close {
                    let th = vm.th_mut(l);
                    th.ci_list[ci].nres = n;
                    if th.top < th.ci_list[ci].top {
                        th.top = th.ci_list[ci].top;
                    }
                    vm.close(l, base, CloseStatus::KeepTop, true)?;
                }
                let th = vm.th_mut(l);
                if proto.is_vararg {
                    th.ci_list[ci].func -= th.ci_list[ci].nextraargs + proto.num_params as usize + 1;
                }
                th.top = ra + n;
                vm.poscall(l, ci, n)?;
                return Ok(Exit::Return);
            }

            // ---- to-be-closed variables ----
            OpCode::Tbc(a) => {
                let top = vm.th(l).ci_list[ci].top;
                vm.th_mut(l).top = top;
                vm.new_tbc_upval(l, base + a as usize)?;
            }
            OpCode::Close(a) => {
                let top = vm.th(l).ci_list[ci].top;
                vm.th_mut(l).top = top;
                vm.close(l, base + a as usize, CloseStatus::Status(Status::Ok), true)?;
            }

            // ---- varargs ----
            OpCode::VarargPrep(a) => {
                vm.adjust_varargs(l, ci, a as usize, &proto)?;
                if vm.th(l).hook_mask != 0 {
                    vm.hook_call(l, ci)?;
                    // the next instruction counts as a new line
                    vm.th_mut(l).old_pc = 1;
                }
            }
            OpCode::Vararg(a, c) => {
                vm.get_varargs(l, ci, base + a as usize, c as i32 - 1)?;
            }
        }
    }
}

/// Complete an instruction interrupted by a yield inside a close method,
/// so that re-running the frame picks up where it stopped.
pub(crate) fn finish_op(vm: &mut Vm, l: ThreadId, ci: usize) {
    let th = vm.th(l);
    let c = th.ci_list[ci];
    let Some(proto) = vm.frame_proto(l, ci) else {
        return;
    };
    match proto.code.get(c.savedpc.wrapping_sub(1)) {
        Some(&OpCode::Return(a, _)) => {
            // results up to top are whatever the return had collected
            let th = vm.th_mut(l);
            th.top = c.func + 1 + a as usize + c.nres;
            th.ci_list[ci].savedpc -= 1;
        }
        Some(&OpCode::Close(_)) => {
            // run the close again for the variables still pending
            vm.th_mut(l).ci_list[ci].savedpc -= 1;
        }
        _ => {}
    }
}

impl Vm {
    /// Prototype of the script function running in frame `ci`.
    pub(crate) fn frame_proto(&self, l: ThreadId, ci: usize) -> Option<Rc<Proto>> {
        let th = self.th(l);
        self.closure_proto(th.get(th.ci_list[ci].func))
    }

    /// Move the callee and the fixed parameters above the extra arguments,
    /// so the frame's registers start after them.
    pub(crate) fn adjust_varargs(&mut self, l: ThreadId, ci: usize, nfixparams: usize, proto: &Proto) -> VmResult<()> {
        let func = self.th(l).ci_list[ci].func;
        let actual = self.th(l).top - func - 1;
        let nextra = actual.saturating_sub(nfixparams);
        self.th_mut(l).ci_list[ci].nextraargs = nextra;
        self.check_stack(l, proto.max_stack_size as usize + 1)?;
        let th = self.th_mut(l);
        let f = th.get(func);
        th.push(f);
        for i in 1..=nfixparams {
            let v = th.get(func + i);
            th.push(v);
            th.set(func + i, TValue::Nil);
        }
        let c = &mut th.ci_list[ci];
        c.func += actual + 1;
        c.top += actual + 1;
        debug_assert!(th.top <= th.ci_list[ci].top);
        Ok(())
    }

    /// Copy `wanted` extra arguments of frame `ci` to `dest`, padding with
    /// nil; a negative `wanted` copies all of them and sets top after them.
    pub(crate) fn get_varargs(&mut self, l: ThreadId, ci: usize, dest: usize, wanted: i32) -> VmResult<()> {
        let nextra = self.th(l).ci_list[ci].nextraargs;
        let wanted = if wanted < 0 {
            // dest sits inside the frame, so space is counted from there
            self.th_mut(l).top = dest;
            self.check_stack_gcp(l, nextra)?;
            self.th_mut(l).top = dest + nextra;
            nextra
        } else {
            wanted as usize
        };
        let th = self.th_mut(l);
        let first = th.ci_list[ci].func - nextra;
        for i in 0..wanted {
            let v = if i < nextra { th.get(first + i) } else { TValue::Nil };
            th.set(dest + i, v);
        }
        Ok(())
    }
}
