use super::helpers::*;
use cup_vm::OpCode::*;
use cup_vm::{TValue, ThreadId, Vm, VmResult};

/// Frame depth, and the slot count of the calling frame.
fn probe(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let th = vm.th(l);
    let caller = th.ci_list[th.ci - 1];
    let size = caller.top - caller.func - 1;
    let depth = th.frame_depth();
    vm.push(l, TValue::Int(depth as i64));
    vm.push(l, TValue::Int(size as i64));
    Ok(2)
}

fn depth(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    let d = vm.th(l).frame_depth();
    vm.push(l, TValue::Int(d as i64));
    Ok(1)
}

fn three(vm: &mut Vm, l: ThreadId) -> VmResult<usize> {
    for i in 1..=3 {
        vm.push(l, TValue::Int(i));
    }
    Ok(3)
}

#[test]
fn test_tail_call_reuses_frame() {
    let mut vm = new_vm();
    native(&mut vm, "probe", probe);

    let mut b = script("=b", 1, 3);
    let k = str_k(&mut vm, &mut b, "probe");
    emit_all(&mut b, &[GetGlobal(1, k), Call(1, 1, 0), Return(1, 0)]);
    closure(&mut vm, "B", b);

    let mut a = script("=a", 0, 5);
    let k = str_k(&mut vm, &mut a, "B");
    emit_all(
        &mut a,
        &[
            LoadInt(0, 1),
            LoadInt(1, 2),
            LoadInt(2, 3),
            GetGlobal(3, k),
            LoadInt(4, 9),
            TailCall(3, 2),
            Return(3, 0),
        ],
    );
    closure(&mut vm, "A", a);

    // base frame, B in place of A, probe
    assert_eq!(run_ok(&mut vm, "A"), vec![TValue::Int(3), TValue::Int(3)]);
}

#[test]
fn test_unbounded_tail_recursion() {
    let mut vm = new_vm();
    native(&mut vm, "depth", depth);

    let mut p = script("=loop", 1, 3);
    let me = str_k(&mut vm, &mut p, "loop");
    let d = str_k(&mut vm, &mut p, "depth");
    emit_all(
        &mut p,
        &[
            EqI(0, 0, true),
            Jmp(4),
            GetGlobal(1, me),
            AddI(2, 0, -1),
            TailCall(1, 2),
            Return(1, 0),
            GetGlobal(1, d),
            Call(1, 1, 2),
            Return(1, 2),
        ],
    );
    let f = closure(&mut vm, "loop", p);

    let r = vm.pcall_function(f, &[TValue::Int(200_000)]).unwrap();
    assert_eq!(r, vec![TValue::Int(3)]);
    assert!(vm.th(vm.main_thread).ci_list.len() < 16);
}

#[test]
fn test_tail_call_to_native() {
    let mut vm = new_vm();
    native(&mut vm, "three", three);

    let mut p = script("=test", 0, 2);
    let k = str_k(&mut vm, &mut p, "three");
    emit_all(&mut p, &[GetGlobal(0, k), TailCall(0, 1), Return(0, 0)]);
    closure(&mut vm, "main", p);

    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Int(1), TValue::Int(2), TValue::Int(3)]);
}

#[test]
fn test_tail_call_through_call_handler() {
    let mut vm = new_vm();
    let t = table_with_handler(&mut vm, "__call", three);
    vm.set_global("t", t);

    let mut p = script("=test", 0, 3);
    let k = str_k(&mut vm, &mut p, "t");
    emit_all(&mut p, &[GetGlobal(0, k), LoadInt(1, 0), TailCall(0, 2), Return(0, 0)]);
    closure(&mut vm, "main", p);

    assert_eq!(run_ok(&mut vm, "main"), vec![TValue::Int(1), TValue::Int(2), TValue::Int(3)]);
}
