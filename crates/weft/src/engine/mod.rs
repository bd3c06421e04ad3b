//! The engine: shared configuration, generated stubs, the stack pool,
//! probe registries and the tiering policy.

use std::collections::HashMap;
use std::rc::Rc;

use wasmparser::ValType;

use crate::frames::CodeRegionMap;
use crate::heap::{Heap, HeapObject};
use crate::instance::Instance;
use crate::module::{Function, WasmFunction};
use crate::stack::object::StackObject;
use crate::stubs::StackStubs;
use crate::trap::{RunResult, Throwable};
use crate::value::{Value, ValueRep};

/// Outcome of a fired probe.
pub enum ProbeOutcome {
    Continue,
    /// A trap returned here is promoted with a stack trace starting at
    /// the probed frame; other throwables propagate verbatim.
    Throw(Box<Throwable>),
}

/// A user-registered callback fired at loop headers or individual
/// instructions.
pub type ProbeFn = Box<dyn FnMut(&WasmFunction, u32) -> ProbeOutcome>;

/// When and whether the interpreter tiers up through OSR.
#[derive(Debug, Clone, Copy)]
pub struct TieringPolicy {
    pub enabled: bool,
    /// Loop-header visits before a function is handed to the SPC.
    pub loop_threshold: u32,
}

impl Default for TieringPolicy {
    fn default() -> Self {
        TieringPolicy {
            enabled: false,
            loop_threshold: 10_000,
        }
    }
}

/// Engine construction knobs.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub value_rep: ValueRep,
    /// Total mapping size per stack object.
    pub stack_size: usize,
    /// Pages of native region (frame records and bootstrap slots).
    pub native_pages: usize,
    pub tiering: TieringPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            value_rep: ValueRep::TAGGED,
            stack_size: 256 * 1024,
            native_pages: 16,
            tiering: TieringPolicy::default(),
        }
    }
}

/// Shared execution state: one per embedding.
pub struct Engine {
    config: Config,
    stubs: StackStubs,
    pub(crate) regions: CodeRegionMap,
    /// Reusable EMPTY stacks.
    stacks: Vec<Box<StackObject>>,
    pub(crate) loop_probes: Vec<ProbeFn>,
    pub(crate) instr_probes: HashMap<(usize, u32), Vec<ProbeFn>>,
    pub(crate) heap: Heap,
    pub(crate) tier_counters: HashMap<(usize, u32), u32>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Engine, anyhow::Error> {
        let stubs = StackStubs::generate(
            crate::interp::interp_entry as usize,
            crate::runtime::call_host2 as usize,
        )?;
        let mut regions = CodeRegionMap::default();
        stubs.register_regions(&mut regions);
        Ok(Engine {
            config,
            stubs,
            regions,
            stacks: Vec::new(),
            loop_probes: Vec::new(),
            instr_probes: HashMap::new(),
            heap: Heap::new(),
            tier_counters: HashMap::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn stubs(&self) -> &StackStubs {
        &self.stubs
    }

    /// Entry code installed for interpreted functions.
    pub(crate) fn interp_trampoline(&self) -> *const u8 {
        self.stubs.interp_tramp
    }

    pub(crate) fn interp_marker(&self) -> *const u8 {
        self.stubs.interp_marker
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Name of the code region containing `addr`, if it is engine code.
    pub fn code_region_name(&self, addr: usize) -> Option<&'static str> {
        use crate::frames::CodeRegionKind;
        self.regions.classify(addr).map(|r| match r.kind {
            CodeRegionKind::Interpreter => "interpreter",
            CodeRegionKind::Spc(_) => "spc",
            CodeRegionKind::StackStub { .. } => "stub",
        })
    }

    /// Register a probe fired at every loop header.
    pub fn add_loop_probe(&mut self, probe: ProbeFn) {
        self.loop_probes.push(probe);
    }

    /// Register a probe fired before one instruction of one function.
    pub fn add_instr_probe(
        &mut self,
        func: &Function,
        pc: u32,
        probe: ProbeFn,
    ) -> Result<(), anyhow::Error> {
        let Function::Wasm(wf) = func else {
            anyhow::bail!("instruction probes require a Wasm function");
        };
        let key = (Rc::as_ptr(&wf.decl) as usize, pc);
        self.instr_probes.entry(key).or_default().push(probe);
        Ok(())
    }

    pub(crate) fn has_instr_probes(&self) -> bool {
        !self.instr_probes.is_empty()
    }

    /// GC scan contract: heap roots held by pooled (quiesced) stacks.
    pub fn scan_stack_roots(&self) -> Vec<*mut HeapObject> {
        let mut roots = Vec::new();
        for s in &self.stacks {
            roots.extend(s.values().scan_roots());
        }
        roots
    }

    /// Synchronously execute `func` with `args` on a stack object.
    ///
    /// Arguments are validated against the signature; misuse is an API
    /// error, not a throwable. The run is stack-neutral: the stack's
    /// `vsp` is restored to its pre-call value whether the outcome is
    /// values or a throwable.
    pub fn run(
        &mut self,
        instance: &mut Instance,
        func: &Function,
        args: &[Value],
    ) -> Result<RunResult, anyhow::Error> {
        let sig = func.sig();
        anyhow::ensure!(
            args.len() == sig.params.len(),
            "expected {} arguments, got {}",
            sig.params.len(),
            args.len()
        );
        for (ty, v) in sig.params.iter().zip(args) {
            anyhow::ensure!(
                value_matches(*ty, v),
                "argument {v:?} does not match declared type {ty:?}"
            );
        }

        let mut stack = self.stacks.pop().unwrap_or_else(|| {
            StackObject::new(
                self.config.value_rep,
                self.config.stack_size,
                self.config.native_pages,
            )
        });
        stack.engine = self as *mut Engine;
        stack.instance = instance as *mut Instance;
        stack.reset(func.clone(), &self.stubs);
        if !args.is_empty() {
            stack.bind(args);
        }
        // This run may be nested inside a host callback of another
        // stack: the current-stack cell is restored once the machine
        // is back.
        let prev = crate::stubs::current_stack();
        stack.resume_machine(&self.stubs);
        crate::stubs::set_current_stack(prev);
        let result = stack.take_result();
        stack.clear();
        self.stacks.push(stack);
        Ok(result)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(Config::default()).expect("engine initialization failed")
    }
}

/// Dynamic argument check against a declared parameter type.
fn value_matches(ty: ValType, v: &Value) -> bool {
    match ty {
        ValType::I32 => matches!(v, Value::I32(_)),
        ValType::I64 => matches!(v, Value::I64(_)),
        ValType::F32 => matches!(v, Value::F32(_)),
        ValType::F64 => matches!(v, Value::F64(_)),
        ValType::V128 => matches!(v, Value::V128(_)),
        ValType::Ref(_) => v.is_ref(),
    }
}
