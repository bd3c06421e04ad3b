//! Stack objects: the unit of suspendability.
//!
//! A stack object bundles one guarded mapping (value stack growing up,
//! native region growing down), the state machine that gates
//! suspend/resume, and the parent linkage used when control returns to
//! the stack that resumed this one.
//!
//! The `#[repr(C)]` field prefix is read and written by the generated
//! stack-switch stubs at fixed offsets; everything below `mapping` is
//! Rust-side bookkeeping.

use std::mem::offset_of;

use wasmparser::ValType;

use crate::engine::Engine;
use crate::frames::store_ptr;
use crate::instance::Instance;
use crate::module::{FuncDecl, Function, HostFunction, WasmFunction};
use crate::stack::mapping::StackMapping;
use crate::stack::value_stack::ValueStack;
use crate::stubs::StackStubs;
use crate::trap::{RunResult, Throwable};
use crate::value::{Value, ValueRep};

/// Lifecycle states.
///
/// ```text
/// EMPTY --reset(f)--> SUSPENDED (params pending) | RESUMABLE
/// SUSPENDED --bind(args)--> SUSPENDED | RESUMABLE
/// RESUMABLE --resume()--> RUNNING
/// RUNNING --return/throw--> EMPTY
/// RUNNING --host call--> RUNNING_HOST --host returns--> RUNNING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    Empty,
    Suspended,
    Resumable,
    Running,
    RunningHost,
}

/// One suspendable execution context.
#[repr(C)]
pub struct StackObject {
    // --- Fields at fixed offsets, read by generated code ---
    pub(crate) values: ValueStack,
    /// Native return-address stack pointer; grows downward.
    pub(crate) rsp: *mut u8,
    /// Stack to resume when this one returns; bottom of a chain is null.
    pub(crate) parent: *mut StackObject,
    /// Machine sp of the host caller, saved by the resume stub.
    pub(crate) parent_rsp: *mut u8,
    /// 0 = Wasm function, 1 = host function.
    pub(crate) func_kind: u64,
    pub(crate) func_decl: *const FuncDecl,
    pub(crate) func_wasm: *const WasmFunction,
    pub(crate) func_host: *const HostFunction,
    /// Innermost frame handle, for trap traces.
    pub(crate) trace_sp: *mut u8,

    // --- Rust-side bookkeeping ---
    pub(crate) mapping: StackMapping,
    pub(crate) state: StackState,
    /// Arguments still needed before the stack becomes resumable.
    pub(crate) params_arity: u32,
    pub(crate) return_results: Vec<ValType>,
    pub(crate) func_handle: Option<Function>,
    pub(crate) thrown: Option<Box<Throwable>>,
    /// Top of the interpreter's frame chain (walker continuation).
    pub(crate) interp_top: *mut u8,
    /// Value-stack top before arguments were bound; restored on
    /// completion so every run is stack-neutral.
    pub(crate) prev_vsp: *mut u8,
    pub(crate) engine: *mut Engine,
    pub(crate) instance: *mut Instance,
}

impl StackObject {
    pub(crate) fn new(rep: ValueRep, size: usize, native_pages: usize) -> Box<StackObject> {
        let mapping = StackMapping::new(size, native_pages);
        let values = ValueStack::new(&mapping, rep);
        let rsp = mapping.end();
        let prev_vsp = values.vsp();
        Box::new(StackObject {
            values,
            rsp,
            parent: std::ptr::null_mut(),
            parent_rsp: std::ptr::null_mut(),
            func_kind: 0,
            func_decl: std::ptr::null(),
            func_wasm: std::ptr::null(),
            func_host: std::ptr::null(),
            trace_sp: std::ptr::null_mut(),
            mapping,
            state: StackState::Empty,
            params_arity: 0,
            return_results: Vec::new(),
            func_handle: None,
            thrown: None,
            interp_top: std::ptr::null_mut(),
            prev_vsp,
            engine: std::ptr::null_mut(),
            instance: std::ptr::null_mut(),
        })
    }

    // Offsets consumed by the stub generator.

    pub(crate) fn off_vsp() -> usize {
        offset_of!(StackObject, values) + ValueStack::vsp_offset()
    }

    pub(crate) fn off_rsp() -> usize {
        offset_of!(StackObject, rsp)
    }

    pub(crate) fn off_parent() -> usize {
        offset_of!(StackObject, parent)
    }

    pub(crate) fn off_parent_rsp() -> usize {
        offset_of!(StackObject, parent_rsp)
    }

    pub(crate) fn off_func_kind() -> usize {
        offset_of!(StackObject, func_kind)
    }

    pub(crate) fn off_func_decl() -> usize {
        offset_of!(StackObject, func_decl)
    }

    pub(crate) fn off_func_host() -> usize {
        offset_of!(StackObject, func_host)
    }

    pub(crate) fn off_trace_sp() -> usize {
        offset_of!(StackObject, trace_sp)
    }

    pub(crate) fn off_instance() -> usize {
        offset_of!(StackObject, instance)
    }

    pub fn state(&self) -> StackState {
        self.state
    }

    pub fn values(&self) -> &ValueStack {
        &self.values
    }

    pub(crate) fn values_mut(&mut self) -> &mut ValueStack {
        &mut self.values
    }

    /// The mapping's no-access ranges, for the external signal handler.
    pub fn red_zone_range(&self) -> [(usize, usize); 2] {
        self.mapping.red_zone_range()
    }

    /// `range.start <= vsp <= rsp <= range.end`.
    pub(crate) fn check_invariants(&self) {
        debug_assert!(self.values.base() <= self.values.vsp());
        debug_assert!((self.values.vsp() as usize) <= self.rsp as usize);
        debug_assert!(self.rsp <= self.mapping.end());
    }

    /// Prepare this stack to invoke `func`.
    ///
    /// Pushes the two bootstrap return addresses onto the native
    /// region: `return-to-parent` deepest, then `enter-func` on top, so
    /// the resume stub's `ret` lands in `enter-func` and the last Wasm
    /// return lands in `return-to-parent`.
    pub(crate) fn reset(&mut self, func: Function, stubs: &StackStubs) {
        assert_eq!(self.state, StackState::Empty, "reset requires an EMPTY stack");
        let sig = func.sig();
        self.params_arity = sig.params.len() as u32;
        self.return_results = sig.results.clone();
        self.prev_vsp = self.values.vsp();
        match &func {
            Function::Wasm(wf) => {
                self.func_kind = 0;
                self.func_decl = std::rc::Rc::as_ptr(&wf.decl);
                self.func_wasm = std::rc::Rc::as_ptr(wf);
                self.func_host = std::ptr::null();
            }
            Function::Host(hf) => {
                self.func_kind = 1;
                self.func_decl = std::ptr::null();
                self.func_wasm = std::ptr::null();
                self.func_host = std::rc::Rc::as_ptr(hf);
            }
        }
        self.func_handle = Some(func);
        unsafe {
            self.rsp = self.mapping.end().sub(8);
            store_ptr(self.rsp, stubs.return_parent as usize);
            self.rsp = self.rsp.sub(8);
            store_ptr(self.rsp, stubs.enter_func as usize);
        }
        self.state = if self.params_arity == 0 {
            StackState::Resumable
        } else {
            StackState::Suspended
        };
        self.check_invariants();
    }

    /// Bind some or all pending arguments.
    pub(crate) fn bind(&mut self, args: &[Value]) {
        assert_eq!(self.state, StackState::Suspended, "bind requires SUSPENDED");
        assert!(
            args.len() as u32 <= self.params_arity,
            "excess arguments bound to stack"
        );
        self.values.push_n(args);
        self.params_arity -= args.len() as u32;
        if self.params_arity == 0 {
            self.state = StackState::Resumable;
        }
    }

    /// Switch the machine onto this stack and run to completion.
    ///
    /// On return the machine is back on the host stack; the outcome is
    /// collected with [`StackObject::take_result`].
    pub(crate) fn resume_machine(&mut self, stubs: &StackStubs) {
        assert_eq!(self.state, StackState::Resumable, "resume requires RESUMABLE");
        let mut bottom: *mut StackObject = self;
        unsafe {
            while !(*bottom).parent.is_null() {
                bottom = (*bottom).parent;
            }
        }
        self.state = StackState::Running;
        self.check_invariants();
        let resume: extern "C" fn(*mut StackObject, *mut StackObject) =
            unsafe { std::mem::transmute(stubs.resume) };
        resume(self, bottom);
    }

    /// Collect the outcome after the machine has returned, restoring
    /// value-stack neutrality either way.
    pub(crate) fn take_result(&mut self) -> RunResult {
        if let Some(t) = self.thrown.take() {
            // One catch opportunity before delivery; declines today.
            let _ = self.catch_thrown(&t);
            self.values.set_vsp(self.prev_vsp);
            return RunResult::Throw(*t);
        }
        let results = match self.values.pop_n(&self.return_results.clone()) {
            Ok(vs) => vs,
            Err(t) => {
                self.values.set_vsp(self.prev_vsp);
                return RunResult::Throw(*t);
            }
        };
        self.values.set_vsp(self.prev_vsp);
        RunResult::Value(results)
    }

    /// Reset all bookkeeping to the EMPTY configuration.
    pub(crate) fn clear(&mut self) {
        self.values.clear();
        self.rsp = self.mapping.end();
        self.parent = std::ptr::null_mut();
        self.parent_rsp = std::ptr::null_mut();
        self.func_kind = 0;
        self.func_decl = std::ptr::null();
        self.func_wasm = std::ptr::null();
        self.func_host = std::ptr::null();
        self.trace_sp = std::ptr::null_mut();
        self.interp_top = std::ptr::null_mut();
        self.params_arity = 0;
        self.return_results.clear();
        self.func_handle = None;
        self.thrown = None;
        self.prev_vsp = self.values.vsp();
        self.state = StackState::Empty;
        self.check_invariants();
    }

    /// One chance for an embedder hook to catch a throwable before it
    /// is delivered. Always declines today.
    pub fn catch_thrown(&self, _thrown: &Throwable) -> bool {
        false
    }

    // --- Declared, deliberately unsupported operations ---

    /// Unwinding every frame without delivering a result is not
    /// supported.
    pub fn pop_all_frames(&mut self) -> Result<(), anyhow::Error> {
        anyhow::bail!("unsupported: pop_all_frames")
    }

    /// Tag-based exception throws are stubbed out.
    pub fn throw_tag(&mut self, _tag: u32) -> Result<(), anyhow::Error> {
        anyhow::bail!("unsupported: throw_tag")
    }

    /// Querying the suspension site is not supported.
    pub fn where_(&self) -> Result<(), anyhow::Error> {
        anyhow::bail!("unsupported: where_")
    }

    /// Querying the logical caller stack is not supported.
    pub fn caller(&self) -> Result<(), anyhow::Error> {
        anyhow::bail!("unsupported: caller")
    }

    // --- Interpreter frame window ---

    /// Handle of the root frame record: just below the two bootstrap
    /// return-address slots.
    pub(crate) fn root_frame_handle(&self) -> *mut u8 {
        unsafe { self.mapping.end().sub(16 + crate::frames::FRAME_SIZE) }
    }

    /// Lowest address a frame record may occupy.
    pub(crate) fn frame_window_bottom(&self) -> *mut u8 {
        self.mapping.native_base()
    }
}
