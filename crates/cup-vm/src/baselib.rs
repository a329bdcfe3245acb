//! Base functions built on the engine: protected calls, `error`,
//! `collectgarbage` and the `coroutine` table.

use crate::callinfo::MULTRET;
use crate::coroutine::CoroutineStatus;
use crate::error::{Status, Throw, VmResult};
use crate::table::Table;
use crate::thread::ThreadId;
use crate::value::TValue;
use crate::vm::{NativeFn, Vm};
use cup_core::gc::{GcIdx, GcMode, STOP_USER};

/// Register the base functions as globals, plus the `coroutine` table.
pub fn open_base(vm: &mut Vm) -> VmResult<()> {
    let l = vm.main_thread;
    let globals = vm.globals;
    for &(name, f) in &[
        ("pcall", base_pcall as NativeFn),
        ("xpcall", base_xpcall),
        ("error", base_error),
        ("collectgarbage", base_collectgarbage),
    ] {
        register(vm, l, globals, name, f)?;
    }

    let co = vm.new_table(l)?;
    for &(name, f) in &[
        ("create", co_create as NativeFn),
        ("resume", co_resume),
        ("yield", co_yield),
        ("status", co_status),
        ("running", co_running),
        ("isyieldable", co_isyieldable),
        ("wrap", co_wrap),
        ("close", co_close),
    ] {
        register(vm, l, co, name, f)?;
    }
    vm.set_global("coroutine", TValue::Table(co));
    vm.pop(l, 1);
    Ok(())
}

fn register(vm: &mut Vm, l: ThreadId, t: GcIdx<Table>, name: &'static str, f: NativeFn) -> VmResult<()> {
    let c = vm.alloc_native(l, f, name, Vec::new())?;
    let key = vm.strings.intern_str(name);
    vm.table_set_str(t, key, TValue::Native(c));
    Ok(())
}

// ---- argument helpers ----

fn arg_error(vm: &mut Vm, l: ThreadId, n: usize, fname: &str, msg: &str) -> Throw {
    vm.run_error(l, format!("bad argument #{n} to '{fname}' ({msg})"))
}

fn type_error(vm: &mut Vm, l: ThreadId, n: usize, fname: &str, expected: &str) -> Throw {
    let got = if n > vm.get_top(l) {
        "no value".to_string()
    } else {
        vm.obj_type_name(vm.arg(l, n))
    };
    arg_error(vm, l, n, fname, &format!("{expected} expected, got {got}"))
}

fn check_any(vm: &mut Vm, l: ThreadId, n: usize, fname: &str) -> VmResult<()> {
    if n > vm.get_top(l) {
        return Err(arg_error(vm, l, n, fname, "value expected"));
    }
    Ok(())
}

fn check_function(vm: &mut Vm, l: ThreadId, n: usize, fname: &str) -> VmResult<TValue> {
    match vm.arg(l, n) {
        v @ (TValue::Function(_) | TValue::Native(_)) => Ok(v),
        _ => Err(type_error(vm, l, n, fname, "function")),
    }
}

fn check_thread(vm: &mut Vm, l: ThreadId, n: usize, fname: &str) -> VmResult<ThreadId> {
    match vm.arg(l, n) {
        TValue::Thread(co) => Ok(co),
        _ => Err(type_error(vm, l, n, fname, "coroutine")),
    }
}

fn opt_integer(vm: &mut Vm, l: ThreadId, n: usize, fname: &str, default: i64) -> VmResult<i64> {
    match vm.arg(l, n) {
        TValue::Nil => Ok(default),
        v => match v.as_int() {
            Some(i) => Ok(i),
            None => Err(type_error(vm, l, n, fname, "number")),
        },
    }
}

fn opt_string(vm: &mut Vm, l: ThreadId, n: usize, fname: &str, default: &str) -> VmResult<String> {
    match vm.arg(l, n) {
        TValue::Nil => Ok(default.to_string()),
        TValue::Str(s) => Ok(vm.strings.get_str(s).into_owned()),
        _ => Err(type_error(vm, l, n, fname, "string")),
    }
}

/// Concatenate `prefix` and a string at stack index `idx` in place.
fn prefix_message(vm: &mut Vm, l: ThreadId, idx: usize, prefix: &str) {
    if let TValue::Str(s) = vm.value_at(l, idx) {
        let msg = format!("{prefix} {}", vm.strings.get_str(s));
        let v = vm.intern_message(l, &msg);
        let slot = vm.th(l).ci().func + idx;
        vm.th_mut(l).set(slot, v);
    }
}

// ---- protected calls and errors ----

/// Continuation shared by `pcall` and `xpcall`: `extra` values below the
/// results are not returned.
fn finish_pcall(vm: &mut Vm, l: ThreadId, status: Status, extra: isize) -> VmResult<usize> {
    if status != Status::Ok && status != Status::Yield {
        vm.push(l, TValue::Bool(false));
        let err = vm.arg(l, vm.get_top(l) - 1);
        vm.push(l, err);
        return Ok(2);
    }
    Ok(vm.get_top(l) - extra as usize)
}

fn base_pcall(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    check_any(vm, l, 1, "pcall")?;
    vm.push(l, TValue::Bool(true));
    vm.insert(l, 1);
    let nargs = vm.get_top(l) - 2;
    let status = vm.pcall_k(l, nargs, MULTRET, 0, 0, Some(finish_pcall))?;
    finish_pcall(vm, l, status, 0)
}

fn base_xpcall(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let n = vm.get_top(l);
    check_function(vm, l, 2, "xpcall")?;
    // [f, msgh, args...] -> [f, msgh, true, f, args...]
    vm.push(l, TValue::Bool(true));
    vm.insert(l, 3);
    let f = vm.arg(l, 1);
    vm.push(l, f);
    vm.insert(l, 4);
    let status = vm.pcall_k(l, n - 2, MULTRET, 2, 2, Some(finish_pcall))?;
    finish_pcall(vm, l, status, 2)
}

fn base_error(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let level = opt_integer(vm, l, 2, "error", 1)?;
    vm.set_top(l, 1)?;
    if level > 0 {
        if let Some(pos) = vm.where_at(l, level as usize) {
            prefix_message(vm, l, 1, &pos);
        }
    }
    Err(vm.error(l))
}

fn base_collectgarbage(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let opt = opt_string(vm, l, 1, "collectgarbage", "collect")?;
    let result = match opt.as_str() {
        "collect" => {
            vm.full_gc(l, false);
            TValue::Int(0)
        }
        "step" => {
            let kb = opt_integer(vm, l, 2, "collectgarbage", 0)?;
            TValue::Bool(vm.gc_user_step(l, kb.max(0) as usize))
        }
        "count" => TValue::Float(vm.gc.total_bytes() as f64 / 1024.0),
        "isrunning" => TValue::Bool(!vm.gc.is_stopped_by(STOP_USER)),
        "stop" => {
            vm.set_gc_running(false);
            TValue::Int(0)
        }
        "restart" => {
            vm.set_gc_running(true);
            TValue::Int(0)
        }
        "incremental" | "generational" => {
            let mode = if opt == "incremental" {
                GcMode::Incremental
            } else {
                GcMode::Generational
            };
            let old = vm.set_gc_mode(l, mode);
            match old {
                GcMode::Incremental => vm.intern("incremental"),
                GcMode::Generational => vm.intern("generational"),
            }
        }
        other => {
            let msg = format!("invalid option '{other}'");
            return Err(arg_error(vm, l, 1, "collectgarbage", &msg));
        }
    };
    vm.push(l, result);
    Ok(1)
}

// ---- coroutines ----

fn co_create(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let f = check_function(vm, l, 1, "create")?;
    let co = vm.new_thread(l)?;
    vm.push(l, f);
    vm.xmove(l, co, 1)?;
    Ok(1)
}

/// Resume `co` with the top `narg` values of `l`. On success the results
/// are moved to `l` and their count returned; on failure the error value
/// is moved instead and `None` returned.
fn aux_resume(vm: &mut Vm, l: ThreadId, co: ThreadId, narg: usize) -> VmResult<Option<usize>> {
    if !vm.check_stack_api(co, narg) {
        let v = vm.intern("too many arguments to resume");
        vm.push(l, v);
        return Ok(None);
    }
    vm.xmove(l, co, narg)?;
    let (status, nres) = vm.resume(co, Some(l), narg);
    if matches!(status, Status::Ok | Status::Yield) {
        if !vm.check_stack_api(l, nres + 1) {
            vm.pop(co, nres);
            let v = vm.intern("too many results to resume");
            vm.push(l, v);
            return Ok(None);
        }
        vm.xmove(co, l, nres)?;
        Ok(Some(nres))
    } else {
        vm.xmove(co, l, 1)?;
        Ok(None)
    }
}

fn co_resume(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let co = check_thread(vm, l, 1, "resume")?;
    let narg = vm.get_top(l) - 1;
    match aux_resume(vm, l, co, narg)? {
        Some(n) => {
            vm.push(l, TValue::Bool(true));
            let at = vm.get_top(l) - n;
            vm.insert(l, at);
            Ok(n + 1)
        }
        None => {
            vm.push(l, TValue::Bool(false));
            let at = vm.get_top(l) - 1;
            vm.insert(l, at);
            Ok(2)
        }
    }
}

fn aux_wrap(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let TValue::Thread(co) = vm.native_upvalue(l, 1) else {
        return Err(vm.run_error(l, "wrapped coroutine is missing"));
    };
    let narg = vm.get_top(l);
    if let Some(n) = aux_resume(vm, l, co, narg)? {
        return Ok(n);
    }
    let mut status = vm.th(co).status;
    if status != Status::Ok && status != Status::Yield {
        // the body raised: close its pending variables
        status = vm.close_thread(co, Some(l));
        vm.xmove(co, l, 1)?;
    }
    if status != Status::ErrMem {
        if let Some(pos) = vm.where_at(l, 1) {
            let top = vm.get_top(l);
            prefix_message(vm, l, top, &pos);
        }
    }
    Err(vm.error(l))
}

fn co_wrap(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    co_create(vm, l)?;
    vm.new_native(l, aux_wrap, "wrap", 1)?;
    Ok(1)
}

fn co_yield(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let n = vm.get_top(l);
    vm.yield_k(l, n, 0, None)
}

fn co_status(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let co = check_thread(vm, l, 1, "status")?;
    let name = vm.coroutine_status(co).name();
    let v = vm.intern(name);
    vm.push(l, v);
    Ok(1)
}

fn co_running(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    vm.push(l, TValue::Thread(l));
    vm.push(l, TValue::Bool(l == vm.main_thread));
    Ok(2)
}

fn co_isyieldable(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let co = match vm.arg(l, 1) {
        TValue::Nil => l,
        _ => check_thread(vm, l, 1, "isyieldable")?,
    };
    let y = vm.is_yieldable(co);
    vm.push(l, TValue::Bool(y));
    Ok(1)
}

fn co_close(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let co = check_thread(vm, l, 1, "close")?;
    let st = vm.coroutine_status(co);
    match st {
        CoroutineStatus::Dead
        | CoroutineStatus::Errored
        | CoroutineStatus::Suspended
        | CoroutineStatus::Initial => {
            if vm.close_thread(co, Some(l)) == Status::Ok {
                vm.push(l, TValue::Bool(true));
                Ok(1)
            } else {
                vm.push(l, TValue::Bool(false));
                vm.xmove(co, l, 1)?;
                Ok(2)
            }
        }
        CoroutineStatus::Running | CoroutineStatus::Normal => {
            let msg = format!("cannot close a {} coroutine", st.name());
            Err(vm.run_error(l, msg))
        }
    }
}
