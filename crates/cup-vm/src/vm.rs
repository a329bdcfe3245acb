//! Process-wide runtime state shared by every logical thread.

use crate::config::RuntimeConfig;
use crate::error::{Status, VmResult};
use crate::metamethod::MetamethodNames;
use crate::object::{object_size, Heap};
use crate::table::Table;
use crate::thread::{StackValue, Thread, ThreadId};
use crate::value::{TValue, TypeTag, NUM_TYPES};
use cup_core::gc::{GcIdx, GcState, ObjKind};
use cup_core::string::{StringId, StringInterner};
use std::mem::size_of;

/// A native function. Arguments are the frame's slots above its callee;
/// it pushes its results and returns how many there are.
pub type NativeFn = fn(&mut Vm, ThreadId) -> VmResult<usize>;

/// Continuation of a native function, run after a yield or after an error
/// was recovered by a yieldable protected call. Receives that status and the
/// context given when the continuation was registered.
pub type KFunction = fn(&mut Vm, ThreadId, Status, isize) -> VmResult<usize>;

/// Last-resort handler for errors with no recovery context anywhere.
pub type PanicFn = Box<dyn FnMut(&mut Vm, ThreadId)>;

/// Registry slots.
pub const RIDX_MAINTHREAD: i64 = 1;
pub const RIDX_GLOBALS: i64 = 2;

pub struct Vm {
    /// Object arenas.
    pub heap: Heap,
    /// Collector bookkeeping.
    pub gc: GcState,
    pub strings: StringInterner,
    pub config: RuntimeConfig,
    /// Thread created with the runtime; it can never yield.
    pub main_thread: ThreadId,
    /// Innermost thread currently executing.
    pub current: ThreadId,
    /// Threads that may have open upvalues, so the collector can reach
    /// cells whose thread is otherwise unreachable.
    pub(crate) twups: Vec<ThreadId>,
    pub(crate) tm_names: MetamethodNames,
    /// Preallocated so raising out-of-memory never allocates.
    pub(crate) mem_err_msg: StringId,
    pub registry: GcIdx<Table>,
    pub globals: GcIdx<Table>,
    /// Metatables of non-table, non-userdata types.
    pub(crate) type_mt: [Option<GcIdx<Table>>; NUM_TYPES],
    pub(crate) panic: Option<PanicFn>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let config = config.normalized();
        let mut strings = StringInterner::new();
        let tm_names = MetamethodNames::init(&mut strings);
        let mem_err_msg = strings.intern(b"not enough memory");
        let mut gc = GcState::new(
            config.gc_mode,
            config.gc_pause,
            config.gc_stepmul,
            config.gc_stepsize,
        );
        let mut heap = Heap::default();
        let white = gc.white();

        let mut main = Thread::new();
        // the main thread counts as one non-yieldable level forever
        main.n_ccalls += 0x10000;
        gc.charge(object_size(ObjKind::Thread) + main.stack.len() * size_of::<StackValue>());
        let main_thread = heap.threads.insert(main, white);

        let registry = heap.tables.insert(Table::new(2, 0), white);
        let globals = heap.tables.insert(Table::new(0, 16), white);
        gc.charge(2 * object_size(ObjKind::Table));
        let reg = heap.tables.get_mut(registry);
        reg.raw_seti(RIDX_MAINTHREAD, TValue::Thread(main_thread));
        reg.raw_seti(RIDX_GLOBALS, TValue::Table(globals));

        gc.estimate = gc.total_bytes();
        gc.set_pause();

        Vm {
            heap,
            gc,
            strings,
            config,
            main_thread,
            current: main_thread,
            twups: Vec::new(),
            tm_names,
            mem_err_msg,
            registry,
            globals,
            type_mt: [None; NUM_TYPES],
            panic: None,
        }
    }

    #[inline(always)]
    pub fn th(&self, l: ThreadId) -> &Thread {
        self.heap.threads.get(l)
    }

    #[inline(always)]
    pub fn th_mut(&mut self, l: ThreadId) -> &mut Thread {
        self.heap.threads.get_mut(l)
    }

    /// Install the panic handler, returning the previous one. A handler
    /// that returns lets the process abort; one that panics unwinds instead.
    pub fn set_panic(&mut self, f: PanicFn) -> Option<PanicFn> {
        self.panic.replace(f)
    }

    pub fn intern(&mut self, s: &str) -> TValue {
        TValue::Str(self.strings.intern_str(s))
    }

    /// Intern a runtime diagnostic. Repeated messages share one string and
    /// new ones are charged to the heap; past the memory limit the fixed
    /// out-of-memory message is returned instead.
    pub(crate) fn intern_message(&mut self, l: ThreadId, msg: &str) -> TValue {
        let (id, fresh) = self.strings.intern_reused(msg.as_bytes());
        if fresh && !self.try_charge(l, msg.len()) {
            return TValue::Str(self.mem_err_msg);
        }
        TValue::Str(id)
    }

    pub fn set_type_metatable(&mut self, tag: TypeTag, mt: Option<GcIdx<Table>>) {
        self.type_mt[tag as usize] = mt;
    }

    /// Human-readable rendering used in diagnostics and host errors.
    pub fn display_value(&self, v: TValue) -> String {
        match v {
            TValue::Nil => "nil".to_string(),
            TValue::Bool(b) => b.to_string(),
            TValue::Int(i) => i.to_string(),
            TValue::Float(f) => format!("{f:?}"),
            TValue::Str(s) => self.strings.get_str(s).into_owned(),
            other => format!("{}: {}", self.obj_type_name(other), other.gc_ref().map_or(0, |r| r.index)),
        }
    }

    pub fn get_global(&self, name: &str) -> TValue {
        match self.strings.find(name.as_bytes()) {
            Some(id) => self.heap.tables.get(self.globals).raw_get_str(id),
            None => TValue::Nil,
        }
    }

    pub fn set_global(&mut self, name: &str, v: TValue) {
        let key = self.strings.intern_str(name);
        self.table_set_str(self.globals, key, v);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
