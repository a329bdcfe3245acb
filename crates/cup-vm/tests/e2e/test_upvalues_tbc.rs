use super::helpers::*;
use cup_vm::OpCode::*;
use cup_vm::thread::MAX_DELTA;
use cup_vm::{CupError, TValue, ThreadId, Vm, VmResult};
use std::cell::RefCell;

thread_local! {
    /// (id, error argument) of every close handler run, in order.
    static CLOSED: RefCell<Vec<(TValue, String)>> = const { RefCell::new(Vec::new()) };
}

fn record_close(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let TValue::Table(t) = vm.arg(l, 1) else {
        return Ok(0);
    };
    let key = vm.strings.intern_str("id");
    let id = vm.heap.tables.get(t).raw_get_str(key);
    let err = vm.arg(l, 2);
    let err = vm.display_value(err);
    CLOSED.with(|c| c.borrow_mut().push((id, err)));
    Ok(0)
}

fn closed() -> Vec<(TValue, String)> {
    CLOSED.with(|c| c.borrow().clone())
}

fn closed_count(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let n = CLOSED.with(|c| c.borrow().len());
    vm.push(l, TValue::Int(n as i64));
    Ok(1)
}

/// Closable table with `id`, kept alive as global `name`.
fn closable(vm: &mut Vm, name: &str, id: i64) {
    let t = table_with_handler(vm, "__close", record_close);
    let TValue::Table(idx) = t else { unreachable!() };
    let key = vm.strings.intern_str("id");
    vm.table_set_str(idx, key, TValue::Int(id));
    vm.set_global(name, t);
}

/// Records like `record_close`, then raises "close <id>".
fn raising_close(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    record_close(vm, l)?;
    let id = closed().last().map_or(TValue::Nil, |(id, _)| *id);
    let id = vm.display_value(id);
    Err(vm.run_error(l, format!("close {id}")))
}

fn raising_closable(vm: &mut Vm, name: &str, id: i64) {
    let t = table_with_handler(vm, "__close", raising_close);
    let TValue::Table(idx) = t else { unreachable!() };
    let key = vm.strings.intern_str("id");
    vm.table_set_str(idx, key, TValue::Int(id));
    vm.set_global(name, t);
}

/// Marks slot 1 and a slot far enough above it that the list needs
/// filler links between them.
fn native_with_distant_tbc(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let far = MAX_DELTA + 4_465;
    if !vm.check_stack_api(l, far + 1) {
        return Err(vm.run_error(l, "no room"));
    }
    let a = vm.get_global("a");
    vm.push(l, a);
    vm.to_close(l, 1)?;
    for _ in 2..far {
        vm.push(l, TValue::Nil);
    }
    let b = vm.get_global("b");
    vm.push(l, b);
    vm.to_close(l, far)?;
    Ok(0)
}

fn native_with_tbc(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let a = vm.get_global("a");
    vm.push(l, a);
    vm.to_close(l, 1)?;
    vm.push(l, TValue::Int(5));
    Ok(1)
}

#[test]
fn test_sibling_closures_share_upvalue() {
    let mut vm = new_vm();
    let mut inc = script("=inc", 0, 2);
    inc.add_upvalue("n", true, 0);
    emit_all(&mut inc, &[GetUpval(0, 0), AddI(0, 0, 1), SetUpval(0, 0), Return(0, 2)]);
    let mut get = script("=get", 0, 2);
    get.add_upvalue("n", true, 0);
    emit_all(&mut get, &[GetUpval(0, 0), Return(0, 2)]);

    let mut make = script("=make", 0, 3);
    make.add_proto(inc);
    make.add_proto(get);
    emit_all(&mut make, &[LoadInt(0, 0), Closure(1, 0), Closure(2, 1), Return(1, 3)]);
    closure(&mut vm, "make", make);

    let r = run_ok(&mut vm, "make");
    vm.set_global("inc", r[0]);
    vm.set_global("get", r[1]);
    assert_eq!(run_ok(&mut vm, "inc"), vec![TValue::Int(1)]);
    assert_eq!(run_ok(&mut vm, "inc"), vec![TValue::Int(2)]);
    assert_eq!(run_ok(&mut vm, "get"), vec![TValue::Int(2)]);

    // a second factory call gets a fresh cell
    let r = run_ok(&mut vm, "make");
    vm.set_global("get2", r[1]);
    assert_eq!(run_ok(&mut vm, "get2"), vec![TValue::Int(0)]);
    assert_eq!(run_ok(&mut vm, "get"), vec![TValue::Int(2)]);
}

#[test]
fn test_open_upvalue_sees_register_writes() {
    let mut vm = new_vm();
    let mut get = script("=get", 0, 2);
    get.add_upvalue("x", true, 0);
    emit_all(&mut get, &[GetUpval(0, 0), Return(0, 2)]);

    let mut p = script("=test", 0, 3);
    p.add_proto(get);
    emit_all(&mut p, &[LoadInt(0, 1), Closure(1, 0), LoadInt(0, 5), Call(1, 1, 2), Return(1, 2)]);
    closure(&mut vm, "main", p);

    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Int(5)]);
}

#[test]
fn test_upvalue_access_from_host() {
    let mut vm = new_vm();
    let mut get = script("=get", 0, 2);
    get.add_upvalue("n", true, 0);
    emit_all(&mut get, &[GetUpval(0, 0), Return(0, 2)]);
    let mut make = script("=make", 0, 2);
    make.add_proto(get);
    emit_all(&mut make, &[LoadInt(0, 0), Closure(1, 0), Return(1, 2)]);
    closure(&mut vm, "make", make);

    let get = run_ok(&mut vm, "make")[0];
    vm.set_global("get", get);
    let l = vm.main_thread;
    vm.push(l, get);
    let idx = vm.get_top(l);

    assert_eq!(vm.get_upvalue(l, idx, 1).as_deref(), Some("n"));
    assert_eq!(vm.value_at(l, vm.get_top(l)), TValue::Int(0));
    vm.pop(l, 1);
    assert_eq!(vm.get_upvalue(l, idx, 2), None);

    vm.push(l, TValue::Int(42));
    assert_eq!(vm.set_upvalue(l, idx, 1).as_deref(), Some("n"));
    vm.pop(l, 1);
    assert_eq!(run_ok(&mut vm, "get"), vec![TValue::Int(42)]);
}

#[test]
fn test_close_in_reverse_order() {
    let mut vm = new_vm();
    closable(&mut vm, "a", 1);
    closable(&mut vm, "b", 2);
    let mut p = script("=test", 0, 3);
    let a = str_k(&mut vm, &mut p, "a");
    let b = str_k(&mut vm, &mut p, "b");
    emit_all(
        &mut p,
        &[GetGlobal(0, a), Tbc(0), GetGlobal(1, b), Tbc(1), LoadInt(2, 42), Return(2, 2)],
    );
    closure(&mut vm, "main", p);

    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Int(42)]);
    let ids: Vec<TValue> = closed().into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, [TValue::Int(2), TValue::Int(1)]);
}

#[test]
fn test_unwinding_passes_error_to_handler() {
    let mut vm = new_vm();
    closable(&mut vm, "a", 1);
    let mut p = script("=test", 0, 3);
    let a = str_k(&mut vm, &mut p, "a");
    let e = str_k(&mut vm, &mut p, "error");
    let msg = str_k(&mut vm, &mut p, "fail");
    emit_all(
        &mut p,
        &[GetGlobal(0, a), Tbc(0), GetGlobal(1, e), LoadK(2, msg), Call(1, 2, 1), Return(0, 1)],
    );
    closure(&mut vm, "main", p);

    assert_eq!(run_err(&mut vm, "main"), CupError::Runtime("test:5: fail".to_string()));
    assert_eq!(closed(), [(TValue::Int(1), "test:5: fail".to_string())]);
}

#[test]
fn test_non_closable_value_is_rejected() {
    let mut vm = new_vm();
    let mut p = script("=test", 0, 2);
    p.add_local("x", 1, 3);
    emit_all(&mut p, &[LoadInt(0, 3), Tbc(0), Return(0, 1)]);
    closure(&mut vm, "main", p);

    assert_eq!(
        run_err(&mut vm, "main"),
        CupError::Runtime("test:2: variable 'x' got a non-closable value".to_string())
    );
}

#[test]
fn test_false_values_are_not_tracked() {
    let mut vm = new_vm();
    let mut p = script("=test", 0, 2);
    emit_all(&mut p, &[LoadNil(0, 0), Tbc(0), LoadInt(1, 1), Return(1, 2)]);
    closure(&mut vm, "main", p);

    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Int(1)]);
    assert_eq!(vm.th(vm.main_thread).tbc_list, 0);
}

#[test]
fn test_close_instruction_closes_early() {
    let mut vm = new_vm();
    closable(&mut vm, "a", 1);
    native(&mut vm, "count", closed_count);
    let mut p = script("=test", 0, 3);
    let a = str_k(&mut vm, &mut p, "a");
    let c = str_k(&mut vm, &mut p, "count");
    emit_all(
        &mut p,
        &[GetGlobal(0, a), Tbc(0), Close(0), GetGlobal(1, c), Call(1, 1, 2), Return(1, 2)],
    );
    closure(&mut vm, "main", p);

    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Int(1)]);
    assert_eq!(closed().len(), 1);
    assert_eq!(closed()[0].1, "nil");
}

#[test]
fn test_native_slot_closed_on_return() {
    let mut vm = new_vm();
    closable(&mut vm, "a", 7);
    native(&mut vm, "f", native_with_tbc);

    assert_eq!(run_ok(&mut vm, "f"), vec![TValue::Int(5)]);
    assert_eq!(closed(), [(TValue::Int(7), "nil".to_string())]);
}

#[test]
fn test_distant_slots_closed_in_order() {
    let mut vm = new_vm();
    closable(&mut vm, "a", 1);
    closable(&mut vm, "b", 2);
    native(&mut vm, "f", native_with_distant_tbc);

    assert!(run_ok(&mut vm, "f").is_empty());
    let ids: Vec<TValue> = closed().into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, [TValue::Int(2), TValue::Int(1)]);
    assert_eq!(vm.th(vm.main_thread).tbc_list, 0);
}

#[test]
fn test_close_handler_errors_replace_the_error() {
    let mut vm = new_vm();
    raising_closable(&mut vm, "a", 1);
    raising_closable(&mut vm, "b", 2);
    let mut p = script("=test", 0, 4);
    let a = str_k(&mut vm, &mut p, "a");
    let b = str_k(&mut vm, &mut p, "b");
    let e = str_k(&mut vm, &mut p, "error");
    let msg = str_k(&mut vm, &mut p, "boom");
    emit_all(
        &mut p,
        &[
            GetGlobal(0, a),
            Tbc(0),
            GetGlobal(1, b),
            Tbc(1),
            GetGlobal(2, e),
            LoadK(3, msg),
            Call(2, 2, 1),
            Return(0, 1),
        ],
    );
    closure(&mut vm, "main", p);

    assert_eq!(run_err(&mut vm, "main"), CupError::Runtime("close 1".to_string()));
    assert_eq!(
        closed(),
        [
            (TValue::Int(2), "test:7: boom".to_string()),
            (TValue::Int(1), "close 2".to_string()),
        ]
    );
    assert_eq!(vm.th(vm.main_thread).tbc_list, 0);
}
