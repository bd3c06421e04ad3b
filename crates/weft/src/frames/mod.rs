//! Native frame records, the code-region map and the frame walker.
//!
//! ## Frame record ABI
//!
//! Both tiers lay out one 48-byte record per Wasm frame in the native
//! region, identified by a handle `h` (a native stack pointer). The
//! slot at `h - 8` holds the frame's return address, which classifies
//! the owning tier through the code-region map; the caller's handle is
//! `h + FRAME_SIZE`.
//!
//! ```text
//! h - 8   return address / tier marker
//! h + 0   pc           (interpreter frames; current wasm pc)
//! h + 8   locals_vsp   (interpreter frames; locals base on the value stack)
//! h + 16  func_decl    (interpreter frames)
//! h + 24  accessor     (both tiers; lazily created FrameAccessor)
//! h + 32  wasm_func    (both tiers)
//! h + 40  last slot; the caller's return-address slot
//! ```
//!
//! The offsets of `accessor` and `wasm_func` (plus `func_decl` for
//! interpreter frames) are the cross-component ABI shared with
//! compiled-code prologues.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::module::{FuncDecl, WasmFunction};
use crate::spc::CompiledCode;
use crate::stack::value_stack::{StackResult, ValueStack};
use crate::trap::{Throwable, TraceFrame};
use crate::value::Value;

/// Frame record stride in bytes.
pub(crate) const FRAME_SIZE: usize = 48;

pub(crate) const FRAME_PC: usize = 0;
pub(crate) const FRAME_LOCALS: usize = 8;
pub(crate) const FRAME_DECL: usize = 16;
pub(crate) const FRAME_ACCESSOR: usize = 24;
pub(crate) const FRAME_FUNC: usize = 32;

// --- Raw native-stack access ---
//
// The one primitive that writes through a raw native-stack address,
// distinct from any safe reference API. Confined to this module; the
// stack object and the tier-up gate go through `FrameRecord`.

#[inline(always)]
pub(crate) unsafe fn store_ptr(at: *mut u8, val: usize) {
    unsafe { (at as *mut usize).write(val) }
}

#[inline(always)]
pub(crate) unsafe fn load_ptr(at: *const u8) -> usize {
    unsafe { (at as *const usize).read() }
}

/// A view over one frame record, addressed by its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameRecord(pub(crate) *mut u8);

impl FrameRecord {
    /// Initialize an interpreter frame record in place.
    ///
    /// # Safety
    ///
    /// `h - 8 .. h + FRAME_SIZE - 8` must lie inside the owning
    /// mapping's native region.
    pub(crate) unsafe fn init_interp(
        h: *mut u8,
        marker: *const u8,
        func: *const WasmFunction,
        decl: *const FuncDecl,
        locals_vsp: *mut u8,
    ) -> FrameRecord {
        unsafe {
            store_ptr(h.sub(8), marker as usize);
            store_ptr(h.add(FRAME_PC), 0);
            store_ptr(h.add(FRAME_LOCALS), locals_vsp as usize);
            store_ptr(h.add(FRAME_DECL), decl as usize);
            store_ptr(h.add(FRAME_ACCESSOR), 0);
            store_ptr(h.add(FRAME_FUNC), func as usize);
        }
        FrameRecord(h)
    }

    #[inline(always)]
    pub(crate) fn ret_addr(&self) -> *const u8 {
        unsafe { load_ptr(self.0.sub(8)) as *const u8 }
    }

    /// Overwrite the pending return address in place (tier-up).
    #[inline(always)]
    pub(crate) fn set_ret_addr(&self, addr: *const u8) {
        unsafe { store_ptr(self.0.sub(8), addr as usize) }
    }

    #[inline(always)]
    pub(crate) fn pc(&self) -> u32 {
        unsafe { load_ptr(self.0.add(FRAME_PC)) as u32 }
    }

    #[inline(always)]
    pub(crate) fn set_pc(&self, pc: u32) {
        unsafe { store_ptr(self.0.add(FRAME_PC), pc as usize) }
    }

    #[inline(always)]
    pub(crate) fn locals_vsp(&self) -> *mut u8 {
        unsafe { load_ptr(self.0.add(FRAME_LOCALS)) as *mut u8 }
    }

    #[inline(always)]
    pub(crate) fn func(&self) -> *const WasmFunction {
        unsafe { load_ptr(self.0.add(FRAME_FUNC)) as *const WasmFunction }
    }

    #[inline(always)]
    pub(crate) fn decl(&self) -> *const FuncDecl {
        unsafe { load_ptr(self.0.add(FRAME_DECL)) as *const FuncDecl }
    }

    #[inline(always)]
    pub(crate) fn accessor(&self) -> *mut FrameAccessor {
        unsafe { load_ptr(self.0.add(FRAME_ACCESSOR)) as *mut FrameAccessor }
    }

    #[inline(always)]
    pub(crate) fn set_accessor(&self, acc: *mut FrameAccessor) {
        unsafe { store_ptr(self.0.add(FRAME_ACCESSOR), acc as usize) }
    }

    /// Handle of the caller's frame record.
    #[inline(always)]
    pub(crate) fn caller(&self) -> FrameRecord {
        FrameRecord(unsafe { self.0.add(FRAME_SIZE) })
    }

    /// Handle of a new callee frame record below this one.
    #[inline(always)]
    pub(crate) fn callee(&self) -> FrameRecord {
        FrameRecord(unsafe { self.0.sub(FRAME_SIZE) })
    }

    /// Drop the cached accessor, if one was inflated.
    pub(crate) fn release_accessor(&self) {
        let acc = self.accessor();
        if !acc.is_null() {
            unsafe {
                drop(Box::from_raw(acc));
            }
            self.set_accessor(std::ptr::null_mut());
        }
    }
}

// --- Code regions ---

/// What kind of code a return address points into.
#[derive(Debug, Clone)]
pub(crate) enum CodeRegionKind {
    Interpreter,
    Spc(Rc<CompiledCode>),
    StackStub {
        name: &'static str,
        frame_size: usize,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct CodeRegion {
    pub(crate) end: usize,
    pub(crate) kind: CodeRegionKind,
}

/// Sorted map from instruction-pointer ranges to code regions.
#[derive(Debug, Default)]
pub(crate) struct CodeRegionMap {
    regions: BTreeMap<usize, CodeRegion>,
}

impl CodeRegionMap {
    pub(crate) fn register(&mut self, start: usize, end: usize, kind: CodeRegionKind) {
        debug_assert!(start < end);
        self.regions.insert(start, CodeRegion { end, kind });
    }

    /// Find the region containing `addr`, if any.
    pub(crate) fn classify(&self, addr: usize) -> Option<&CodeRegion> {
        let (_, region) = self.regions.range(..=addr).next_back()?;
        (addr < region.end).then_some(region)
    }
}

// --- Walker ---

/// Walk native frame records starting at `start`, collecting
/// `(function, pc)` pairs innermost-first until the caller is no
/// longer Wasm.
///
/// `interp_top` is the interpreter's current frame chain; the walk
/// continues there when a compiled-tier chain bottoms out on a
/// non-Wasm return address (compiled frames live below the host-side
/// interpreter frames and are not contiguous with the record window).
pub(crate) fn capture_trace(
    regions: &CodeRegionMap,
    start: *mut u8,
    interp_top: *mut u8,
) -> Vec<TraceFrame> {
    let mut trace = Vec::new();
    let mut frame = FrameRecord(start);
    let mut jumped = false;
    if start.is_null() {
        return trace;
    }
    loop {
        let ra = frame.ret_addr() as usize;
        // Stride to the caller's handle, or None when the chain ends.
        let step = match regions.classify(ra).map(|r| r.kind.clone()) {
            Some(CodeRegionKind::Interpreter) => {
                let func = frame.func();
                let name = unsafe { (*func).name.clone() };
                trace.push(TraceFrame::Wasm {
                    func,
                    name,
                    pc: frame.pc(),
                });
                if frame.0 == interp_top {
                    jumped = true;
                }
                Some(FRAME_SIZE)
            }
            // Only recorded runtime-call sites (and rewritten OSR
            // targets) are frame return addresses; anything else in a
            // compiled region — e.g. an entry thunk's internal call —
            // ends the chain.
            Some(CodeRegionKind::Spc(code)) => match code.pc_for_return(ra) {
                Some(pc) => {
                    let func = frame.func();
                    let name = unsafe { (*func).name.clone() };
                    trace.push(TraceFrame::Wasm { func, name, pc });
                    Some(code.frame_size as usize)
                }
                None => None,
            },
            Some(CodeRegionKind::StackStub { frame_size, .. }) => Some(frame_size),
            None => None,
        };
        match step {
            Some(stride) => frame = FrameRecord(unsafe { frame.0.add(stride) }),
            None => {
                // Compiled frames live below the host-side interpreter
                // frames; continue on the interpreter chain once.
                if !jumped && !interp_top.is_null() && frame.0 != interp_top {
                    jumped = true;
                    frame = FrameRecord(interp_top);
                } else {
                    break;
                }
            }
        }
    }
    trace
}

// --- Target frames and accessors ---

/// A transient view over a native frame identified by its handle.
pub struct TargetFrame<'a> {
    pub(crate) regions: &'a CodeRegionMap,
    pub(crate) handle: *mut u8,
}

impl<'a> TargetFrame<'a> {
    /// The function executing in this frame, if it is a Wasm frame.
    pub fn function(&self) -> Option<&WasmFunction> {
        let frame = FrameRecord(self.handle);
        match self.regions.classify(frame.ret_addr() as usize)?.kind {
            CodeRegionKind::Interpreter | CodeRegionKind::Spc(_) => {
                Some(unsafe { &*frame.func() })
            }
            CodeRegionKind::StackStub { .. } => None,
        }
    }

    pub fn pc(&self) -> Option<u32> {
        let frame = FrameRecord(self.handle);
        match &self.regions.classify(frame.ret_addr() as usize)?.kind {
            CodeRegionKind::Interpreter => Some(frame.pc()),
            CodeRegionKind::Spc(code) => code.pc_for_return(frame.ret_addr() as usize),
            CodeRegionKind::StackStub { .. } => None,
        }
    }

    /// The caller's frame, if it is still a Wasm or stub frame.
    pub fn caller(&self) -> Option<TargetFrame<'a>> {
        let frame = FrameRecord(self.handle);
        let region = self.regions.classify(frame.ret_addr() as usize)?;
        let stride = match &region.kind {
            CodeRegionKind::Interpreter => FRAME_SIZE,
            CodeRegionKind::Spc(code) => code.frame_size as usize,
            CodeRegionKind::StackStub { frame_size, .. } => *frame_size,
        };
        let caller = unsafe { self.handle.add(stride) };
        let caller_frame = FrameRecord(caller);
        self.regions.classify(caller_frame.ret_addr() as usize)?;
        Some(TargetFrame {
            regions: self.regions,
            handle: caller,
        })
    }

    /// The accessor for this frame, inflating and caching it on first
    /// use.
    pub fn accessor(&self) -> &FrameAccessor {
        let frame = FrameRecord(self.handle);
        let mut acc = frame.accessor();
        if acc.is_null() {
            acc = Box::into_raw(Box::new(FrameAccessor {
                handle: self.handle,
            }));
            frame.set_accessor(acc);
        }
        unsafe { &*acc }
    }
}

/// Lazy typed access to a frame's locals, cached inside the frame.
#[derive(Debug)]
pub struct FrameAccessor {
    handle: *mut u8,
}

impl FrameAccessor {
    pub(crate) fn frame(&self) -> FrameRecord {
        FrameRecord(self.handle)
    }

    pub fn func(&self) -> &WasmFunction {
        unsafe { &*self.frame().func() }
    }

    pub fn pc(&self) -> u32 {
        self.frame().pc()
    }

    /// Read local `i` through the tagged value stack.
    pub fn local(&self, stack: &ValueStack, i: u32) -> StackResult<Value> {
        let decl = unsafe { &*self.frame().decl() };
        if i as usize >= decl.local_count() {
            return Err(Throwable::internal("frame accessor local index out of range"));
        }
        let at = unsafe {
            self.frame()
                .locals_vsp()
                .add(i as usize * stack.rep().slot_size())
        };
        stack.read_value(at)
    }

    /// Overwrite local `i`. Reference-typed writes are unsupported
    /// until the GC barrier story is settled.
    pub fn set_local(&self, stack: &mut ValueStack, i: u32, v: &Value) -> StackResult<()> {
        let decl = unsafe { &*self.frame().decl() };
        if i as usize >= decl.local_count() {
            return Err(Throwable::internal("frame accessor local index out of range"));
        }
        let at = unsafe {
            self.frame()
                .locals_vsp()
                .add(i as usize * stack.rep().slot_size())
        };
        stack.write_value(at, v)
    }
}
