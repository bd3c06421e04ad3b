//! Traps, host throwables and internal errors.

use crate::module::WasmFunction;
use crate::value::Value;

/// Wasm-specified failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapReason {
    Oob,
    NullDeref,
    DivZero,
    IntOverflow,
    InvalidConv,
    Unreachable,
    StackOverflow,
    TableOob,
    MemoryOob,
    ArrayIndexOob,
    Oom,
    CastFailure,
}

impl std::fmt::Display for TrapReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            TrapReason::Oob => "out of bounds access",
            TrapReason::NullDeref => "null reference dereference",
            TrapReason::DivZero => "integer divide by zero",
            TrapReason::IntOverflow => "integer overflow",
            TrapReason::InvalidConv => "invalid conversion to integer",
            TrapReason::Unreachable => "unreachable executed",
            TrapReason::StackOverflow => "stack overflow",
            TrapReason::TableOob => "out of bounds table access",
            TrapReason::MemoryOob => "out of bounds memory access",
            TrapReason::ArrayIndexOob => "out of bounds array access",
            TrapReason::Oom => "allocation limit exceeded",
            TrapReason::CastFailure => "cast failure",
        };
        f.write_str(msg)
    }
}

/// Why a throwable was raised.
#[derive(Debug)]
pub enum ThrowReason {
    /// A Wasm trap.
    Trap(TrapReason),
    /// A throwable produced by a host callback, propagated unchanged
    /// except for frame prepending.
    Host(anyhow::Error),
    /// An engine invariant violation. Indicates an engine bug, carried
    /// with a distinct reason so tests can assert its absence.
    Internal(&'static str),
}

/// One entry of a throwable's stack trace. Entry 0 is the innermost
/// frame.
#[derive(Debug, Clone)]
pub enum TraceFrame {
    Wasm {
        func: *const WasmFunction,
        name: String,
        pc: u32,
    },
    Host {
        name: String,
    },
}

impl TraceFrame {
    pub fn name(&self) -> &str {
        match self {
            TraceFrame::Wasm { name, .. } | TraceFrame::Host { name } => name,
        }
    }

    pub fn pc(&self) -> Option<u32> {
        match self {
            TraceFrame::Wasm { pc, .. } => Some(*pc),
            TraceFrame::Host { .. } => None,
        }
    }
}

/// A failure value delivered to the host: reason plus a lazily
/// attached stack trace.
#[derive(Debug)]
pub struct Throwable {
    pub reason: ThrowReason,
    pub trace: Vec<TraceFrame>,
}

impl Throwable {
    pub fn trap(reason: TrapReason) -> Box<Throwable> {
        Box::new(Throwable {
            reason: ThrowReason::Trap(reason),
            trace: Vec::new(),
        })
    }

    pub fn host(err: anyhow::Error) -> Box<Throwable> {
        Box::new(Throwable {
            reason: ThrowReason::Host(err),
            trace: Vec::new(),
        })
    }

    pub fn internal(what: &'static str) -> Box<Throwable> {
        Box::new(Throwable {
            reason: ThrowReason::Internal(what),
            trace: Vec::new(),
        })
    }

    pub fn is_trap(&self, reason: TrapReason) -> bool {
        matches!(self.reason, ThrowReason::Trap(r) if r == reason)
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.reason, ThrowReason::Internal(_))
    }
}

impl std::fmt::Display for Throwable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            ThrowReason::Trap(r) => write!(f, "trap: {r}")?,
            ThrowReason::Host(e) => write!(f, "host error: {e}")?,
            ThrowReason::Internal(what) => write!(f, "internal engine error: {what}")?,
        }
        for frame in &self.trace {
            match frame {
                TraceFrame::Wasm { name, pc, .. } => write!(f, "\n  at {name} (pc {pc})")?,
                TraceFrame::Host { name } => write!(f, "\n  at {name} (host)")?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for Throwable {}

/// Outcome of a completed `run`.
#[derive(Debug)]
pub enum RunResult {
    Value(Vec<Value>),
    Throw(Throwable),
}

impl RunResult {
    /// Panics unless the run produced values.
    pub fn unwrap_values(self) -> Vec<Value> {
        match self {
            RunResult::Value(vs) => vs,
            RunResult::Throw(t) => panic!("expected values, got throw: {t}"),
        }
    }

    /// Panics unless the run produced a throwable.
    pub fn unwrap_throw(self) -> Throwable {
        match self {
            RunResult::Value(vs) => panic!("expected throw, got values: {vs:?}"),
            RunResult::Throw(t) => t,
        }
    }
}
