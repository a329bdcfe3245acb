use cup_vm::baselib::open_base;
use cup_vm::vm::NativeFn;
use cup_vm::{Constant, CupError, OpCode, Proto, RuntimeConfig, TValue, Vm};
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

/// Route engine logs to the test output; filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runtime with the base library loaded.
pub fn new_vm() -> Vm {
    vm_with(RuntimeConfig::default())
}

pub fn vm_with(config: RuntimeConfig) -> Vm {
    init_tracing();
    let mut vm = Vm::with_config(config);
    open_base(&mut vm).unwrap_or_else(|e| panic!("base library failed to load: {e}"));
    vm
}

/// Empty prototype with the given shape.
pub fn script(source: &str, num_params: u8, max_stack: u8) -> Proto {
    let mut p = Proto::new(source);
    p.num_params = num_params;
    p.max_stack_size = max_stack;
    p
}

/// Append instructions on consecutive lines, continuing after the last one.
pub fn emit_all(p: &mut Proto, code: &[OpCode]) {
    for &op in code {
        let line = p.line_info.last().map_or(1, |l| l + 1);
        p.emit(op, line);
    }
}

pub fn str_k(vm: &mut Vm, p: &mut Proto, s: &str) -> u32 {
    let id = vm.strings.intern_str(s);
    p.add_constant(Constant::Str(id))
}

/// Instantiate `p` as a closure value, kept alive as global `name`.
pub fn closure(vm: &mut Vm, name: &str, p: Proto) -> TValue {
    let l = vm.main_thread;
    vm.new_closure(l, Rc::new(p)).unwrap_or_else(|e| panic!("closure: {e}"));
    let f = vm.value_at(l, vm.get_top(l));
    vm.set_global(name, f);
    vm.pop(l, 1);
    f
}

/// Register a native function as global `name`.
pub fn native(vm: &mut Vm, name: &'static str, f: NativeFn) -> TValue {
    let l = vm.main_thread;
    vm.new_native(l, f, name, 0).unwrap_or_else(|e| panic!("native: {e}"));
    let v = vm.value_at(l, vm.get_top(l));
    vm.set_global(name, v);
    vm.pop(l, 1);
    v
}

/// Field of a library table, such as `coroutine.resume`.
pub fn lib_fn(vm: &mut Vm, lib: &str, name: &str) -> TValue {
    let TValue::Table(t) = vm.get_global(lib) else {
        panic!("no library '{lib}'");
    };
    let key = vm.strings.intern_str(name);
    vm.heap.tables.get(t).raw_get_str(key)
}

/// Expose every `coroutine` function as a global of the same name.
pub fn export_coroutine(vm: &mut Vm) {
    for name in ["create", "resume", "yield", "status", "running", "isyieldable", "wrap", "close"] {
        let f = lib_fn(vm, "coroutine", name);
        vm.set_global(name, f);
    }
}

/// Call global `name` with no arguments.
pub fn run(vm: &mut Vm, name: &str) -> Result<Vec<TValue>, CupError> {
    let f = vm.get_global(name);
    vm.pcall_function(f, &[])
}

/// Like [`run`], panicking on error.
pub fn run_ok(vm: &mut Vm, name: &str) -> Vec<TValue> {
    run(vm, name).unwrap_or_else(|e| panic!("runtime error: {e}"))
}

pub fn run_err(vm: &mut Vm, name: &str) -> CupError {
    match run(vm, name) {
        Err(e) => e,
        Ok(vals) => panic!("expected error, got {} results: {vals:?}", vals.len()),
    }
}

/// Rendering of every value, strings unquoted.
pub fn show(vm: &Vm, vals: &[TValue]) -> Vec<String> {
    vals.iter().map(|&v| vm.display_value(v)).collect()
}

pub fn assert_str(vm: &Vm, v: TValue, expected: &str) {
    assert!(matches!(v, TValue::Str(_)), "expected string \"{expected}\", got {v:?}");
    assert_eq!(vm.display_value(v), expected);
}

/// Table whose metatable carries `event = handler`.
pub fn table_with_handler(vm: &mut Vm, event: &str, handler: NativeFn) -> TValue {
    let l = vm.main_thread;
    vm.new_table(l).unwrap_or_else(|e| panic!("table: {e}"));
    vm.new_table(l).unwrap_or_else(|e| panic!("table: {e}"));
    let mt_idx = vm.get_top(l);
    let key = vm.intern(event);
    vm.push(l, key);
    vm.new_native(l, handler, "handler", 0).unwrap_or_else(|e| panic!("native: {e}"));
    vm.raw_set(l, mt_idx).unwrap_or_else(|e| panic!("raw_set: {e}"));
    let obj_idx = mt_idx - 1;
    vm.set_metatable(l, obj_idx).unwrap_or_else(|e| panic!("set_metatable: {e}"));
    let t = vm.value_at(l, obj_idx);
    vm.pop(l, 1);
    t
}
