use super::helpers::*;
use cup_vm::hook::{DebugInfo, HookEvent, MASK_CALL, MASK_COUNT, MASK_LINE, MASK_RET};
use cup_vm::OpCode::*;
use cup_vm::{TValue, ThreadId, Vm, VmResult};
use std::cell::RefCell;

thread_local! {
    static EVENTS: RefCell<Vec<(HookEvent, i32)>> = const { RefCell::new(Vec::new()) };
}

fn events() -> Vec<HookEvent> {
    EVENTS.with(|e| e.borrow().iter().map(|&(ev, _)| ev).collect())
}

fn record(_: &mut Vm, _: ThreadId, ar: &DebugInfo) -> VmResult<()> {
    EVENTS.with(|e| e.borrow_mut().push((ar.event, ar.current_line)));
    Ok(())
}

/// Records, then calls `noop` from inside the hook.
fn calling_hook(vm: &mut Vm, l: ThreadId, ar: &DebugInfo) -> VmResult<()> {
    record(vm, l, ar)?;
    let f = vm.get_global("noop");
    vm.push(l, f);
    vm.call_k(l, 0, 0, 0, None)
}

fn yield_on_line(vm: &mut Vm, l: ThreadId, ar: &DebugInfo) -> VmResult<()> {
    if ar.event == HookEvent::Line {
        vm.yield_k(l, 0, 0, None)?;
    }
    Ok(())
}

fn noop(_: &mut Vm, _: ThreadId) -> VmResult<usize> {
    Ok(0)
}

/// `noop()` from a script.
fn calls_noop(vm: &mut Vm) {
    native(vm, "noop", noop);
    let mut p = script("=test", 0, 2);
    let k = str_k(vm, &mut p, "noop");
    emit_all(&mut p, &[GetGlobal(0, k), Call(0, 1, 1), Return(0, 1)]);
    closure(vm, "main", p);
}

#[test]
fn test_call_and_return_events() {
    let mut vm = new_vm();
    calls_noop(&mut vm);
    let l = vm.main_thread;
    vm.set_hook(l, Some(record), MASK_CALL | MASK_RET, 0);
    run_ok(&mut vm, "main");
    assert_eq!(
        events(),
        [HookEvent::Call, HookEvent::Call, HookEvent::Return, HookEvent::Return]
    );
}

#[test]
fn test_hooks_do_not_nest() {
    let mut vm = new_vm();
    calls_noop(&mut vm);
    let l = vm.main_thread;
    vm.set_hook(l, Some(calling_hook), MASK_CALL | MASK_RET, 0);
    run_ok(&mut vm, "main");
    assert_eq!(events().len(), 4);
    assert!(vm.th(l).allow_hook);
}

#[test]
fn test_line_events() {
    let mut vm = new_vm();
    let mut p = script("=test", 0, 2);
    emit_all(&mut p, &[LoadInt(0, 1), LoadInt(1, 2), Return(0, 3)]);
    closure(&mut vm, "main", p);
    let l = vm.main_thread;
    vm.set_hook(l, Some(record), MASK_LINE, 0);
    run_ok(&mut vm, "main");
    let lines: Vec<i32> = EVENTS.with(|e| e.borrow().iter().map(|&(_, line)| line).collect());
    assert_eq!(lines, [1, 2, 3]);
}

#[test]
fn test_count_events() {
    let mut vm = new_vm();
    let mut p = script("=test", 0, 3);
    emit_all(
        &mut p,
        &[LoadInt(0, 1), LoadInt(1, 2), Add(2, 0, 1), AddI(2, 2, 1), Return(2, 2)],
    );
    closure(&mut vm, "main", p);
    let l = vm.main_thread;
    vm.set_hook(l, Some(record), MASK_COUNT, 2);
    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Int(4)]);
    assert_eq!(events(), [HookEvent::Count, HookEvent::Count]);
}

#[test]
fn test_tail_call_event() {
    let mut vm = new_vm();
    let mut g = script("=g", 0, 2);
    emit_all(&mut g, &[Return(0, 1)]);
    closure(&mut vm, "g", g);
    let mut p = script("=test", 0, 2);
    let k = str_k(&mut vm, &mut p, "g");
    emit_all(&mut p, &[GetGlobal(0, k), TailCall(0, 1), Return(0, 0)]);
    closure(&mut vm, "main", p);

    let l = vm.main_thread;
    vm.set_hook(l, Some(record), MASK_CALL, 0);
    run_ok(&mut vm, "main");
    assert_eq!(events(), [HookEvent::Call, HookEvent::TailCall]);
}

#[test]
fn test_clearing_hook() {
    let mut vm = new_vm();
    calls_noop(&mut vm);
    let l = vm.main_thread;
    vm.set_hook(l, Some(record), MASK_CALL, 0);
    vm.set_hook(l, None, MASK_CALL, 0);
    run_ok(&mut vm, "main");
    assert!(events().is_empty());
    assert_eq!(vm.th(l).hook_mask, 0);
}

#[test]
fn test_line_hook_yields_coroutine() {
    let mut vm = new_vm();
    export_coroutine(&mut vm);
    let mut body = script("=co", 0, 2);
    emit_all(&mut body, &[LoadInt(0, 1), LoadInt(1, 2), Add(0, 0, 1), Return(0, 2)]);
    let body = closure(&mut vm, "body", body);

    let create = vm.get_global("create");
    let co = vm.pcall_function(create, &[body]).unwrap()[0];
    vm.set_global("co", co);
    let TValue::Thread(t) = co else { unreachable!() };
    vm.set_hook(t, Some(yield_on_line), MASK_LINE, 0);

    let resume = vm.get_global("resume");
    for _ in 0..4 {
        let r = vm.pcall_function(resume, &[co]).unwrap();
        assert_eq!(r, vec![TValue::Bool(true)]);
    }
    let r = vm.pcall_function(resume, &[co]).unwrap();
    assert_eq!(r, vec![TValue::Bool(true), TValue::Int(3)]);
}
