use super::helpers::*;
use cup_vm::OpCode::*;
use cup_vm::{CupError, TValue, ThreadId, Vm, VmResult};

fn produces_nothing(_: &mut Vm, _: ThreadId) -> VmResult<usize> {
    Ok(0)
}

fn three(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    for i in 1..=3 {
        vm.push(l, TValue::Int(i));
    }
    Ok(3)
}

/// Pushes the number of arguments it received.
fn count_args(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let n = vm.get_top(l);
    vm.push(l, TValue::Int(n as i64));
    Ok(1)
}

/// `f()` called for `wanted` results, returning all of them.
fn caller_of(vm: &mut Vm, callee: &str, wanted: u8) {
    let mut p = script("=test", 0, 4);
    let k = str_k(vm, &mut p, callee);
    let c = if wanted == 0 { 0 } else { wanted + 1 };
    emit_all(&mut p, &[GetGlobal(0, k), Call(0, 1, c), Return(0, c)]);
    closure(vm, "main", p);
}

#[test]
fn test_missing_native_results_are_nil() {
    let mut vm = new_vm();
    native(&mut vm, "f", produces_nothing);
    caller_of(&mut vm, "f", 2);
    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Nil, TValue::Nil]);
}

#[test]
fn test_extra_results_are_dropped() {
    let mut vm = new_vm();
    native(&mut vm, "three", three);
    caller_of(&mut vm, "three", 1);
    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Int(1)]);
}

#[test]
fn test_multret_keeps_every_result() {
    let mut vm = new_vm();
    native(&mut vm, "three", three);
    caller_of(&mut vm, "three", 0);
    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Int(1), TValue::Int(2), TValue::Int(3)]);
}

#[test]
fn test_missing_parameters_are_nil() {
    let mut vm = new_vm();
    let mut g = script("=g", 3, 3);
    emit_all(&mut g, &[Return(0, 4)]);
    closure(&mut vm, "g", g);

    let mut p = script("=test", 0, 3);
    let k = str_k(&mut vm, &mut p, "g");
    emit_all(&mut p, &[GetGlobal(0, k), LoadInt(1, 7), Call(0, 2, 0), Return(0, 0)]);
    closure(&mut vm, "main", p);

    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Int(7), TValue::Nil, TValue::Nil]);
}

#[test]
fn test_varargs_are_reachable() {
    let mut vm = new_vm();
    let mut va = script("=va", 1, 3);
    va.is_vararg = true;
    emit_all(&mut va, &[VarargPrep(1), Vararg(1, 0), Return(1, 0)]);
    closure(&mut vm, "va", va);

    let mut p = script("=test", 0, 4);
    let k = str_k(&mut vm, &mut p, "va");
    emit_all(
        &mut p,
        &[GetGlobal(0, k), LoadInt(1, 1), LoadInt(2, 2), LoadInt(3, 3), Call(0, 4, 0), Return(0, 0)],
    );
    closure(&mut vm, "main", p);

    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Int(2), TValue::Int(3)]);
}

#[test]
fn test_call_handler_receives_object_first() {
    let mut vm = new_vm();
    let t = table_with_handler(&mut vm, "__call", count_args);
    vm.set_global("t", t);

    let mut p = script("=test", 0, 3);
    let k = str_k(&mut vm, &mut p, "t");
    emit_all(&mut p, &[GetGlobal(0, k), LoadInt(1, 5), Call(0, 2, 2), Return(0, 2)]);
    closure(&mut vm, "main", p);

    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Int(2)]);
}

#[test]
fn test_calling_nil_reports_position() {
    let mut vm = new_vm();
    let mut p = script("=test", 0, 2);
    let k = str_k(&mut vm, &mut p, "nothing");
    emit_all(&mut p, &[GetGlobal(0, k), Call(0, 1, 2), Return(0, 2)]);
    closure(&mut vm, "main", p);

    match run_err(&mut vm, "main") {
        CupError::Runtime(msg) => assert_eq!(msg, "test:2: attempt to call a nil value"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_host_call_passes_arguments() {
    let mut vm = new_vm();
    let f = native(&mut vm, "count", count_args);
    let r = vm.pcall_function(f, &[TValue::Nil, TValue::Bool(true), TValue::Int(3)]).unwrap();
    assert_eq!(r, vec![TValue::Int(3)]);
}

#[test]
fn test_frames_are_released_after_call() {
    let mut vm = new_vm();
    native(&mut vm, "three", three);
    caller_of(&mut vm, "three", 0);
    run_ok(&mut vm, "main");

    let l = vm.main_thread;
    let th = vm.th(l);
    assert_eq!(th.ci, 0);
    assert_eq!(th.frame_depth(), 1);
    assert_eq!(vm.get_top(l), 0);
}
