use super::helpers::*;
use cup_vm::callinfo::MULTRET;
use cup_vm::OpCode::*;
use cup_vm::{CupError, Status, TValue, ThreadId, Vm, VmResult};

fn coroutine_vm() -> Vm {
    let mut vm = new_vm();
    export_coroutine(&mut vm);
    vm
}

/// Create a coroutine over global `body`, kept alive as global `name`.
fn create(vm: &mut Vm, name: &str, body: &str) -> TValue {
    let create = vm.get_global("create");
    let f = vm.get_global(body);
    let r = vm.pcall_function(create, &[f]).unwrap();
    assert!(matches!(r[0], TValue::Thread(_)));
    vm.set_global(name, r[0]);
    r[0]
}

fn resume(vm: &mut Vm, co: TValue, args: &[TValue]) -> Vec<TValue> {
    let resume = vm.get_global("resume");
    let mut all = vec![co];
    all.extend_from_slice(args);
    vm.pcall_function(resume, &all).unwrap()
}

fn status(vm: &mut Vm, co: TValue) -> String {
    let status = vm.get_global("status");
    let r = vm.pcall_function(status, &[co]).unwrap();
    vm.display_value(r[0])
}

/// Script that calls the globals `fname(args...)` and returns everything.
fn call_script(vm: &mut Vm, name: &str, fname: &str, args: &[&str]) {
    let mut p = script("=main", 0, 6);
    let f = str_k(vm, &mut p, fname);
    let mut code = vec![GetGlobal(0, f)];
    for (i, a) in args.iter().enumerate() {
        let k = str_k(vm, &mut p, a);
        code.push(GetGlobal(i as u8 + 1, k));
    }
    code.push(Call(0, args.len() as u8 + 1, 0));
    code.push(Return(0, 0));
    emit_all(&mut p, &code);
    closure(vm, name, p);
}

fn inner(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    for i in 1..=3 {
        vm.push(l, TValue::Int(i));
    }
    vm.yield_k(l, 3, 0, None)
}

fn outer(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let f = vm.get_global("inner");
    vm.push(l, f);
    vm.call_k(l, 0, MULTRET, 7, Some(outer_k))?;
    outer_k(vm, l, Status::Ok, 7)
}

fn outer_k(vm: &mut Vm, l: ThreadId, _status: Status, ctx: isize) -> VmResult<usize> {
    vm.push(l, TValue::Int(ctx as i64));
    Ok(vm.get_top(l))
}

fn yield_then_fail(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    vm.yield_k(l, 0, 0, Some(fail_k))
}

fn fail_k(vm: &mut Vm, l: ThreadId, _status: Status, _ctx: isize) -> VmResult<usize> {
    Err(vm.run_error(l, "late"))
}

/// Calls `yield` without a continuation.
fn call_without_k(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let y = vm.get_global("yield");
    vm.push(l, y);
    vm.call_k(l, 0, 0, 0, None)?;
    Ok(0)
}

fn mark_closed(vm: &mut Vm, _: ThreadId) -> VmResult<usize> {
    vm.set_global("closed", TValue::Bool(true));
    Ok(0)
}

#[test]
fn test_values_cross_both_ways() {
    let mut vm = coroutine_vm();
    let mut body = script("=co", 2, 5);
    let y = str_k(&mut vm, &mut body, "yield");
    emit_all(&mut body, &[GetGlobal(2, y), Move(3, 0), Move(4, 1), Call(2, 3, 0), Return(2, 0)]);
    closure(&mut vm, "body", body);
    let co = create(&mut vm, "co", "body");

    assert_eq!(status(&mut vm, co), "suspended");
    let r = resume(&mut vm, co, &[TValue::Int(10), TValue::Int(20)]);
    assert_eq!(r, vec![TValue::Bool(true), TValue::Int(10), TValue::Int(20)]);
    assert_eq!(status(&mut vm, co), "suspended");

    let r = resume(&mut vm, co, &[TValue::Int(7)]);
    assert_eq!(r, vec![TValue::Bool(true), TValue::Int(7)]);
    assert_eq!(status(&mut vm, co), "dead");

    let r = resume(&mut vm, co, &[]);
    assert_eq!(r[0], TValue::Bool(false));
    assert_str(&vm, r[1], "cannot resume dead coroutine");
}

#[test]
fn test_running_coroutine_cannot_resume_itself() {
    let mut vm = coroutine_vm();
    // resume(running())
    let mut body = script("=co", 0, 3);
    let r = str_k(&mut vm, &mut body, "resume");
    let run = str_k(&mut vm, &mut body, "running");
    emit_all(&mut body, &[GetGlobal(0, r), GetGlobal(1, run), Call(1, 1, 2), Call(0, 2, 0), Return(0, 0)]);
    closure(&mut vm, "body", body);
    let co = create(&mut vm, "co", "body");

    let r = resume(&mut vm, co, &[]);
    assert_eq!(r[..2], [TValue::Bool(true), TValue::Bool(false)]);
    assert_str(&vm, r[2], "cannot resume non-suspended coroutine");
}

#[test]
fn test_native_continuation_after_yield() {
    let mut vm = coroutine_vm();
    native(&mut vm, "inner", inner);
    native(&mut vm, "outer", outer);
    let co = create(&mut vm, "co", "outer");

    let r = resume(&mut vm, co, &[]);
    assert_eq!(r, vec![TValue::Bool(true), TValue::Int(1), TValue::Int(2), TValue::Int(3)]);

    let r = resume(&mut vm, co, &[TValue::Int(10), TValue::Int(20)]);
    assert_eq!(r, vec![TValue::Bool(true), TValue::Int(10), TValue::Int(20), TValue::Int(7)]);
    assert_eq!(status(&mut vm, co), "dead");
}

#[test]
fn test_yield_across_pcall() {
    let mut vm = coroutine_vm();
    let mut body = script("=co", 0, 3);
    let pc = str_k(&mut vm, &mut body, "pcall");
    let y = str_k(&mut vm, &mut body, "yield");
    emit_all(&mut body, &[GetGlobal(0, pc), GetGlobal(1, y), LoadInt(2, 5), Call(0, 3, 0), Return(0, 0)]);
    closure(&mut vm, "body", body);
    let co = create(&mut vm, "co", "body");

    assert_eq!(resume(&mut vm, co, &[]), vec![TValue::Bool(true), TValue::Int(5)]);
    let x = vm.intern("x");
    assert_eq!(resume(&mut vm, co, &[x]), vec![TValue::Bool(true), TValue::Bool(true), x]);
}

#[test]
fn test_error_after_yield_is_caught_by_pcall() {
    let mut vm = coroutine_vm();
    native(&mut vm, "ytf", yield_then_fail);
    call_script(&mut vm, "body", "pcall", &["ytf"]);
    let co = create(&mut vm, "co", "body");

    assert_eq!(resume(&mut vm, co, &[]), vec![TValue::Bool(true)]);
    let r = resume(&mut vm, co, &[]);
    assert_eq!(r[..2], [TValue::Bool(true), TValue::Bool(false)]);
    assert_str(&vm, r[2], "late");
    assert_eq!(status(&mut vm, co), "dead");
}

#[test]
fn test_yield_needs_yieldable_context() {
    let mut vm = coroutine_vm();
    native(&mut vm, "nok", call_without_k);
    call_script(&mut vm, "body", "nok", &[]);
    let co = create(&mut vm, "co", "body");

    let r = resume(&mut vm, co, &[]);
    assert_eq!(r[0], TValue::Bool(false));
    assert_str(&vm, r[1], "attempt to yield across a C-call boundary");

    let y = vm.get_global("yield");
    assert_eq!(
        vm.pcall_function(y, &[]),
        Err(CupError::Runtime("attempt to yield from outside a coroutine".to_string()))
    );
}

#[test]
fn test_status_inside_and_between() {
    let mut vm = coroutine_vm();
    // B reports the status of A, which resumed it
    let mut b = script("=b", 0, 3);
    let st = str_k(&mut vm, &mut b, "status");
    let a = str_k(&mut vm, &mut b, "A");
    let run = str_k(&mut vm, &mut b, "running");
    emit_all(
        &mut b,
        &[
            GetGlobal(0, st),
            GetGlobal(1, a),
            Call(0, 2, 2),
            GetGlobal(1, st),
            GetGlobal(2, run),
            Call(2, 1, 2),
            Call(1, 2, 2),
            Return(0, 3),
        ],
    );
    closure(&mut vm, "bbody", b);
    create(&mut vm, "B", "bbody");
    call_script(&mut vm, "abody", "resume", &["B"]);
    let co = create(&mut vm, "A", "abody");

    let r = resume(&mut vm, co, &[]);
    assert_eq!(show(&vm, &r), ["true", "true", "normal", "running"]);
}

#[test]
fn test_isyieldable() {
    let mut vm = coroutine_vm();
    call_script(&mut vm, "body", "isyieldable", &[]);
    let co = create(&mut vm, "co", "body");
    assert_eq!(resume(&mut vm, co, &[]), vec![TValue::Bool(true), TValue::Bool(true)]);

    let f = vm.get_global("isyieldable");
    assert_eq!(vm.pcall_function(f, &[]).unwrap(), vec![TValue::Bool(false)]);
}

#[test]
fn test_wrap() {
    let mut vm = coroutine_vm();
    let mut body = script("=co", 2, 5);
    let y = str_k(&mut vm, &mut body, "yield");
    emit_all(&mut body, &[GetGlobal(2, y), Move(3, 0), Move(4, 1), Call(2, 3, 0), Return(2, 0)]);
    closure(&mut vm, "body", body);

    let wrap = vm.get_global("wrap");
    let f = vm.get_global("body");
    let w = vm.pcall_function(wrap, &[f]).unwrap()[0];
    vm.set_global("w", w);
    assert_eq!(vm.pcall_function(w, &[TValue::Int(1), TValue::Int(2)]).unwrap(), vec![TValue::Int(1), TValue::Int(2)]);
    assert_eq!(vm.pcall_function(w, &[TValue::Int(3)]).unwrap(), vec![TValue::Int(3)]);
    assert_eq!(
        vm.pcall_function(w, &[]),
        Err(CupError::Runtime("cannot resume dead coroutine".to_string()))
    );
}

#[test]
fn test_wrap_error_gets_caller_position() {
    let mut vm = coroutine_vm();
    let mut body = script("=co", 0, 3);
    let e = str_k(&mut vm, &mut body, "error");
    let oops = str_k(&mut vm, &mut body, "oops");
    emit_all(&mut body, &[GetGlobal(0, e), LoadK(1, oops), Call(0, 2, 1), Return(0, 1)]);
    closure(&mut vm, "body", body);

    let mut p = script("=main", 0, 3);
    let w = str_k(&mut vm, &mut p, "wrap");
    let b = str_k(&mut vm, &mut p, "body");
    emit_all(&mut p, &[GetGlobal(0, w), GetGlobal(1, b), Call(0, 2, 2), Call(0, 1, 1), Return(0, 1)]);
    closure(&mut vm, "main", p);

    assert_eq!(run_err(&mut vm, "main"), CupError::Runtime("main:4: co:3: oops".to_string()));
}

#[test]
fn test_close_runs_pending_handlers() {
    let mut vm = coroutine_vm();
    let t = table_with_handler(&mut vm, "__close", mark_closed);
    vm.set_global("res", t);

    let mut body = script("=co", 0, 3);
    let res = str_k(&mut vm, &mut body, "res");
    let y = str_k(&mut vm, &mut body, "yield");
    emit_all(&mut body, &[GetGlobal(0, res), Tbc(0), GetGlobal(1, y), Call(1, 1, 1), Return(0, 1)]);
    closure(&mut vm, "body", body);
    let co = create(&mut vm, "co", "body");

    assert_eq!(resume(&mut vm, co, &[]), vec![TValue::Bool(true)]);
    assert_eq!(vm.get_global("closed"), TValue::Nil);

    let close = vm.get_global("close");
    assert_eq!(vm.pcall_function(close, &[co]).unwrap(), vec![TValue::Bool(true)]);
    assert_eq!(vm.get_global("closed"), TValue::Bool(true));
    assert_eq!(status(&mut vm, co), "dead");
}

#[test]
fn test_close_dead_with_error() {
    let mut vm = coroutine_vm();
    let mut body = script("=co", 0, 3);
    let e = str_k(&mut vm, &mut body, "error");
    emit_all(&mut body, &[GetGlobal(0, e), LoadInt(1, 42), Call(0, 2, 1), Return(0, 1)]);
    closure(&mut vm, "body", body);
    let co = create(&mut vm, "co", "body");

    assert_eq!(resume(&mut vm, co, &[]), vec![TValue::Bool(false), TValue::Int(42)]);
    let close = vm.get_global("close");
    assert_eq!(vm.pcall_function(close, &[co]).unwrap(), vec![TValue::Bool(false), TValue::Int(42)]);
    // closing again finds a clean, dead coroutine
    assert_eq!(vm.pcall_function(close, &[co]).unwrap(), vec![TValue::Bool(true)]);
}

#[test]
fn test_cannot_close_running() {
    let mut vm = coroutine_vm();
    let mut body = script("=co", 0, 3);
    let c = str_k(&mut vm, &mut body, "close");
    let run = str_k(&mut vm, &mut body, "running");
    emit_all(&mut body, &[GetGlobal(0, c), GetGlobal(1, run), Call(1, 1, 2), Call(0, 2, 1), Return(0, 1)]);
    closure(&mut vm, "body", body);
    let co = create(&mut vm, "co", "body");

    let r = resume(&mut vm, co, &[]);
    assert_eq!(r[0], TValue::Bool(false));
    assert_str(&vm, r[1], "cannot close a running coroutine");
}
