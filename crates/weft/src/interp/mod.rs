//! The interpreter tier.
//!
//! Executes flat bodies with locals and operands on the value stack
//! and one 48-byte frame record per call in the mapping's native
//! region (so the frame walker and the tier-up gate see real native
//! frames). Simple operators run inline; every complex operator
//! escapes into the runtime dispatcher.
//!
//! The Rust code itself runs on the host machine stack — the generated
//! interpreter trampoline switches over before calling
//! [`interp_entry`] and switches back after.

use std::rc::Rc;

use crate::engine::Engine;
use crate::frames::{FrameRecord, FRAME_SIZE};
use crate::instance::Instance;
use crate::module::{Function, Instr, WasmFunction};
use crate::runtime::{self, RtResult};
use crate::spc::CompiledCode;
use crate::stack::object::StackObject;
use crate::trap::{Throwable, TrapReason};
use crate::value::{TypeCode, Value};

/// Entry point called by the interpreter trampoline. The pending
/// function and all context hang off the current stack.
pub(crate) extern "C" fn interp_entry() {
    let stack_ptr = crate::stubs::current_stack();
    unsafe {
        let stack = &mut *stack_ptr;
        let engine = &mut *stack.engine;
        let instance = &mut *stack.instance;
        if let Err(t) = run_root(engine, instance, stack) {
            stack.thrown = Some(t);
        }
    }
}

fn run_root(engine: &mut Engine, instance: &mut Instance, stack: &mut StackObject) -> RtResult {
    let Some(Function::Wasm(wf)) = stack.func_handle.clone() else {
        return Err(Throwable::internal("interpreter entered without a Wasm function"));
    };
    let prev_top = stack.interp_top;
    let frame = push_frame(engine, stack, &wf)?;
    let result = execute(engine, instance, stack, frame);
    if result.is_err() {
        release_frames(stack, frame);
    }
    stack.interp_top = prev_top;
    stack.trace_sp = prev_top;
    result
}

/// Invoke a Wasm function from runtime code (host-call protocol).
///
/// Arguments are already on the value stack; on success the stack has
/// been adjusted by `(results - params) · slot_size`.
pub(crate) fn invoke_wasm(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    wf: &Rc<WasmFunction>,
) -> RtResult {
    if let Some(code) = wf.decl.compiled() {
        return call_compiled(stack, &code, wf.decl.sig.params.len());
    }
    let prev_top = stack.interp_top;
    let frame = push_frame(engine, stack, wf)?;
    let result = execute(engine, instance, stack, frame);
    if result.is_err() {
        release_frames(stack, frame);
    }
    stack.interp_top = prev_top;
    stack.trace_sp = prev_top;
    result
}

/// Push a frame record and materialize the callee's locals.
///
/// Parameters are already the top `|params|` slots; extra locals are
/// pushed as typed defaults above them.
fn push_frame(
    engine: &Engine,
    stack: &mut StackObject,
    wf: &Rc<WasmFunction>,
) -> Result<FrameRecord, Box<Throwable>> {
    let slot = stack.values.rep().slot_size();
    let h = if stack.interp_top.is_null() {
        let h = stack.root_frame_handle();
        // Stop sentinel: the walker ends at the root frame's caller.
        unsafe { crate::frames::store_ptr(h.add(FRAME_SIZE).sub(8), 0) };
        h
    } else {
        FrameRecord(stack.interp_top).callee().0
    };
    if (h as usize).saturating_sub(8) < stack.frame_window_bottom() as usize {
        return Err(runtime::trap_here(engine, stack, TrapReason::StackOverflow));
    }
    let decl = &wf.decl;
    let locals = unsafe {
        stack
            .values
            .vsp()
            .sub(decl.sig.params.len() * slot)
    };
    for ty in &decl.locals {
        stack.values.push(&Value::default_for(*ty));
    }
    let frame = unsafe {
        FrameRecord::init_interp(
            h,
            engine.interp_marker(),
            Rc::as_ptr(wf),
            Rc::as_ptr(decl),
            locals,
        )
    };
    stack.interp_top = h;
    stack.trace_sp = h;
    Ok(frame)
}

/// Release accessors of every live frame from the innermost up to and
/// including `entry` (unwind path).
fn release_frames(stack: &mut StackObject, entry: FrameRecord) {
    let mut h = stack.interp_top;
    if h.is_null() {
        return;
    }
    loop {
        let frame = FrameRecord(h);
        frame.release_accessor();
        if frame == entry {
            break;
        }
        h = frame.caller().0;
    }
}

/// Pop the current frame. Returns the caller frame, or `None` when the
/// entry frame of this interpreter activation was popped.
fn pop_frame(stack: &mut StackObject, frame: FrameRecord, entry: FrameRecord) -> Option<FrameRecord> {
    frame.release_accessor();
    if frame == entry {
        return None;
    }
    let caller = frame.caller();
    stack.interp_top = caller.0;
    stack.trace_sp = caller.0;
    Some(caller)
}

/// Copy the results down over the frame's locals and pop it.
fn finish_return(
    stack: &mut StackObject,
    frame: FrameRecord,
    nresults: usize,
    entry: FrameRecord,
) -> Option<FrameRecord> {
    let slot = stack.values.rep().slot_size();
    let locals = frame.locals_vsp();
    unsafe {
        let src = stack.values.vsp().sub(nresults * slot);
        std::ptr::copy(src, locals, nresults * slot);
        stack.values.set_vsp(locals.add(nresults * slot));
    }
    pop_frame(stack, frame, entry)
}

/// Call a compiled body directly: arguments on the stack become the
/// callee's locals; the body pushes its own extra locals and leaves
/// its results at the locals base.
///
/// Compiled code delivers failures from its runtime escapes through
/// the stack object's `thrown` slot; they re-enter `Result` propagation
/// here.
fn call_compiled(stack: &mut StackObject, code: &CompiledCode, nparams: usize) -> RtResult {
    let slot = stack.values.rep().slot_size();
    let vsp = stack.values.vsp();
    let locals = unsafe { vsp.sub(nparams * slot) };
    let f: extern "C" fn(*mut u8, *mut u8) -> *mut u8 =
        unsafe { std::mem::transmute(code.entry) };
    let new_vsp = f(locals, vsp);
    stack.values.set_vsp(new_vsp);
    // The compiled frame is gone; traces resume on the interpreter
    // chain.
    stack.trace_sp = stack.interp_top;
    match stack.thrown.take() {
        Some(t) => Err(t),
        None => Ok(()),
    }
}

fn execute(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    entry: FrameRecord,
) -> RtResult {
    let marker = engine.interp_marker();
    let mut frame = entry;
    'frames: loop {
        let func: &WasmFunction = unsafe { &*frame.func() };
        let decl = unsafe { &*frame.decl() };
        let body = &decl.body;
        let slot = stack.values.rep().slot_size();
        let locals = frame.locals_vsp();
        let mut pc = frame.pc() as usize;
        loop {
            if pc >= body.len() {
                match finish_return(stack, frame, decl.sig.results.len(), entry) {
                    Some(caller) => {
                        frame = caller;
                        continue 'frames;
                    }
                    None => return Ok(()),
                }
            }
            frame.set_pc(pc as u32);
            let at = pc as u32;
            pc += 1;
            if engine.has_instr_probes() {
                runtime::probe_instr(engine, stack, func, at)?;
            }
            match body[at as usize] {
                Instr::Nop => {}
                Instr::Unreachable => {
                    return Err(runtime::trap_here(engine, stack, TrapReason::Unreachable));
                }

                // --- Constants ---
                Instr::I32Const(v) => stack.values.push(&Value::I32(v)),
                Instr::I64Const(v) => stack.values.push(&Value::I64(v)),
                Instr::F32Const(v) => stack.values.push(&Value::F32(v)),
                Instr::F64Const(v) => stack.values.push(&Value::F64(v)),
                Instr::V128Const(v) => stack.values.push(&Value::V128(v)),
                Instr::RefNull => stack.values.push_with(TypeCode::NullRef, &Value::NULL),

                // --- i31 ---
                Instr::RefI31 => {
                    let x = stack.values.pop_u32()?;
                    stack.values.push(&Value::I31(x & 0x7FFF_FFFF));
                }
                Instr::I31GetS => match stack.values.pop_ref()? {
                    Value::I31(x) => {
                        stack.values.push(&Value::I32(((x << 1) as i32) >> 1));
                    }
                    Value::Ref(r) if r.is_null() => {
                        return Err(runtime::trap_here(engine, stack, TrapReason::NullDeref));
                    }
                    _ => {
                        return Err(runtime::trap_here(engine, stack, TrapReason::CastFailure));
                    }
                },
                Instr::I31GetU => match stack.values.pop_ref()? {
                    Value::I31(x) => stack.values.push(&Value::I32(x as i32)),
                    Value::Ref(r) if r.is_null() => {
                        return Err(runtime::trap_here(engine, stack, TrapReason::NullDeref));
                    }
                    _ => {
                        return Err(runtime::trap_here(engine, stack, TrapReason::CastFailure));
                    }
                },

                // --- Locals: raw slot copies, tag included ---
                Instr::LocalGet(i) => unsafe {
                    let src = locals.add(i as usize * slot);
                    let vsp = stack.values.vsp();
                    std::ptr::copy_nonoverlapping(src, vsp, slot);
                    stack.values.set_vsp(vsp.add(slot));
                },
                Instr::LocalSet(i) => unsafe {
                    let vsp = stack.values.vsp().sub(slot);
                    std::ptr::copy_nonoverlapping(vsp, locals.add(i as usize * slot), slot);
                    stack.values.set_vsp(vsp);
                },
                Instr::LocalTee(i) => unsafe {
                    let top = stack.values.vsp().sub(slot);
                    std::ptr::copy_nonoverlapping(top, locals.add(i as usize * slot), slot);
                },
                Instr::Drop => stack.values.drop_slot(),

                // --- i32/i64 arithmetic ---
                Instr::I32Add => {
                    let b = stack.values.pop_u32()?;
                    let a = stack.values.pop_u32()?;
                    stack.values.push(&Value::I32(a.wrapping_add(b) as i32));
                }
                Instr::I32Sub => {
                    let b = stack.values.pop_u32()?;
                    let a = stack.values.pop_u32()?;
                    stack.values.push(&Value::I32(a.wrapping_sub(b) as i32));
                }
                Instr::I32Mul => {
                    let b = stack.values.pop_u32()?;
                    let a = stack.values.pop_u32()?;
                    stack.values.push(&Value::I32(a.wrapping_mul(b) as i32));
                }
                Instr::I32DivS => {
                    let b = stack.values.pop_u32()? as i32;
                    let a = stack.values.pop_u32()? as i32;
                    if b == 0 {
                        return Err(runtime::trap_here(engine, stack, TrapReason::DivZero));
                    }
                    if a == i32::MIN && b == -1 {
                        return Err(runtime::trap_here(engine, stack, TrapReason::IntOverflow));
                    }
                    stack.values.push(&Value::I32(a.wrapping_div(b)));
                }
                Instr::I32DivU => {
                    let b = stack.values.pop_u32()?;
                    let a = stack.values.pop_u32()?;
                    if b == 0 {
                        return Err(runtime::trap_here(engine, stack, TrapReason::DivZero));
                    }
                    stack.values.push(&Value::I32((a / b) as i32));
                }
                Instr::I32Eq => cmp_i32(stack, |a, b| a == b)?,
                Instr::I32Ne => cmp_i32(stack, |a, b| a != b)?,
                Instr::I32LtS => cmp_i32(stack, |a, b| (a as i32) < (b as i32))?,
                Instr::I32LtU => cmp_i32(stack, |a, b| a < b)?,
                Instr::I32LeS => cmp_i32(stack, |a, b| (a as i32) <= (b as i32))?,
                Instr::I32GtS => cmp_i32(stack, |a, b| (a as i32) > (b as i32))?,
                Instr::I32GeS => cmp_i32(stack, |a, b| (a as i32) >= (b as i32))?,
                Instr::I32Eqz => {
                    let a = stack.values.pop_u32()?;
                    stack.values.push(&Value::I32((a == 0) as i32));
                }
                Instr::I64Add => {
                    let b = stack.values.pop_u64()?;
                    let a = stack.values.pop_u64()?;
                    stack.values.push(&Value::I64(a.wrapping_add(b) as i64));
                }
                Instr::I64Sub => {
                    let b = stack.values.pop_u64()?;
                    let a = stack.values.pop_u64()?;
                    stack.values.push(&Value::I64(a.wrapping_sub(b) as i64));
                }

                // --- Memory 0 loads/stores, bounds-checked inline ---
                Instr::I32Load { offset } => {
                    let addr = stack.values.pop_u32()? as u64 + offset as u64;
                    match memory0(instance)?.load(addr, 4) {
                        Some(v) => stack.values.push(&Value::I32(v as u32 as i32)),
                        None => {
                            return Err(runtime::trap_here(engine, stack, TrapReason::MemoryOob));
                        }
                    }
                }
                Instr::I64Load { offset } => {
                    let addr = stack.values.pop_u32()? as u64 + offset as u64;
                    match memory0(instance)?.load(addr, 8) {
                        Some(v) => stack.values.push(&Value::I64(v as i64)),
                        None => {
                            return Err(runtime::trap_here(engine, stack, TrapReason::MemoryOob));
                        }
                    }
                }
                Instr::I32Store { offset } => {
                    let v = stack.values.pop_u32()?;
                    let addr = stack.values.pop_u32()? as u64 + offset as u64;
                    if !memory0_mut(instance)?.store(addr, 4, v as u64) {
                        return Err(runtime::trap_here(engine, stack, TrapReason::MemoryOob));
                    }
                }
                Instr::I64Store { offset } => {
                    let v = stack.values.pop_u64()?;
                    let addr = stack.values.pop_u32()? as u64 + offset as u64;
                    if !memory0_mut(instance)?.store(addr, 8, v) {
                        return Err(runtime::trap_here(engine, stack, TrapReason::MemoryOob));
                    }
                }
                Instr::MemorySize(mi) => {
                    let Some(mem) = instance.memory(mi) else {
                        return Err(Throwable::internal("memory index out of range"));
                    };
                    stack.values.push(&Value::I32(mem.size_pages() as i32));
                }

                // --- Control ---
                Instr::Loop => {
                    runtime::probe_loop(engine, stack, func, at)?;
                    if engine.config().tiering.enabled {
                        let Some(Function::Wasm(wrc)) = instance.function_at(func.index).cloned()
                        else {
                            return Err(Throwable::internal("loop header in unknown function"));
                        };
                        crate::tierup::tierup(engine, instance, stack, frame, &wrc, at)?;
                        if frame.ret_addr() != marker {
                            // The gate rewrote our pending return
                            // address: transfer into compiled code at
                            // the equivalent pc and treat the frame as
                            // returned. The record is popped first so
                            // traces taken inside compiled code see
                            // one activation, not two.
                            let target = frame.ret_addr();
                            let locals_vsp = frame.locals_vsp();
                            let popped = pop_frame(stack, frame, entry);
                            if popped.is_none() {
                                stack.interp_top = std::ptr::null_mut();
                                stack.trace_sp = std::ptr::null_mut();
                            }
                            let f: extern "C" fn(*mut u8, *mut u8) -> *mut u8 =
                                unsafe { std::mem::transmute(target) };
                            let new_vsp = f(locals_vsp, stack.values.vsp());
                            stack.values.set_vsp(new_vsp);
                            stack.trace_sp = stack.interp_top;
                            if let Some(t) = stack.thrown.take() {
                                return Err(t);
                            }
                            match popped {
                                Some(caller) => {
                                    frame = caller;
                                    continue 'frames;
                                }
                                None => return Ok(()),
                            }
                        }
                    }
                }
                Instr::Br(t) => pc = t as usize,
                Instr::BrIf(t) => {
                    if stack.values.pop_u32()? != 0 {
                        pc = t as usize;
                    }
                }
                Instr::Return => {
                    match finish_return(stack, frame, decl.sig.results.len(), entry) {
                        Some(caller) => {
                            frame = caller;
                            continue 'frames;
                        }
                        None => return Ok(()),
                    }
                }
                Instr::Call(fi) => {
                    frame.set_pc(pc as u32); // resume point
                    let Some(target) = instance.function_at(fi).cloned() else {
                        return Err(Throwable::internal("call target out of range"));
                    };
                    match target {
                        Function::Host(_) => {
                            runtime::call_host(engine, instance, stack, &target)?;
                        }
                        Function::Wasm(wf) => {
                            if let Some(code) = wf.decl.compiled() {
                                call_compiled(stack, &code, wf.decl.sig.params.len())?;
                            } else {
                                frame = push_frame(engine, stack, &wf)?;
                                continue 'frames;
                            }
                        }
                    }
                }
                Instr::ReturnCall(fi) => {
                    let Some(target) = instance.function_at(fi).cloned() else {
                        return Err(Throwable::internal("call target out of range"));
                    };
                    match target {
                        Function::Host(_) => {
                            // Tail call across the boundary: the host's
                            // results become this frame's results.
                            runtime::call_host(engine, instance, stack, &target)?;
                            match finish_return(stack, frame, decl.sig.results.len(), entry) {
                                Some(caller) => {
                                    frame = caller;
                                    continue 'frames;
                                }
                                None => return Ok(()),
                            }
                        }
                        Function::Wasm(wf) => {
                            let nparams = wf.decl.sig.params.len();
                            unsafe {
                                let src = stack.values.vsp().sub(nparams * slot);
                                std::ptr::copy(src, locals, nparams * slot);
                                stack.values.set_vsp(locals.add(nparams * slot));
                            }
                            if let Some(code) = wf.decl.compiled() {
                                // Pop the record first: the tail
                                // caller's activation is over.
                                let popped = pop_frame(stack, frame, entry);
                                if popped.is_none() {
                                    stack.interp_top = std::ptr::null_mut();
                                    stack.trace_sp = std::ptr::null_mut();
                                }
                                call_compiled(stack, &code, nparams)?;
                                match popped {
                                    Some(caller) => {
                                        frame = caller;
                                        continue 'frames;
                                    }
                                    None => return Ok(()),
                                }
                            } else {
                                // Reuse the frame record in place.
                                frame.release_accessor();
                                for ty in &wf.decl.locals {
                                    stack.values.push(&Value::default_for(*ty));
                                }
                                unsafe {
                                    FrameRecord::init_interp(
                                        frame.0,
                                        marker,
                                        Rc::as_ptr(&wf),
                                        Rc::as_ptr(&wf.decl),
                                        locals,
                                    );
                                }
                                continue 'frames;
                            }
                        }
                    }
                }

                // --- Complex operators: runtime dispatcher escapes ---
                Instr::MemoryGrow(mi) => runtime::memory_grow(engine, instance, stack, mi)?,
                Instr::MemoryInit { data, mem } => {
                    runtime::memory_init(engine, instance, stack, data, mem)?
                }
                Instr::MemoryCopy { dst, src } => {
                    runtime::memory_copy(engine, instance, stack, dst, src)?
                }
                Instr::MemoryFill(mi) => runtime::memory_fill(engine, instance, stack, mi)?,
                Instr::DataDrop(i) => runtime::data_drop(instance, i)?,
                Instr::ElemDrop(i) => runtime::elem_drop(instance, i)?,
                Instr::GlobalGet(i) => runtime::global_get(engine, instance, stack, i)?,
                Instr::GlobalSet(i) => runtime::global_set(engine, instance, stack, i)?,
                Instr::TableGet(t) => runtime::table_get(engine, instance, stack, t)?,
                Instr::TableSet(t) => runtime::table_set(engine, instance, stack, t)?,
                Instr::TableGrow(t) => runtime::table_grow(engine, instance, stack, t)?,
                Instr::TableFill(t) => runtime::table_fill(engine, instance, stack, t)?,
                Instr::TableInit { elem, table } => {
                    runtime::table_init(engine, instance, stack, elem, table)?
                }
                Instr::TableCopy { dst, src } => {
                    runtime::table_copy(engine, instance, stack, dst, src)?
                }
                Instr::StructNew(ty) => runtime::struct_new(engine, instance, stack, ty)?,
                Instr::StructNewDefault(ty) => {
                    runtime::struct_new_default(engine, instance, stack, ty)?
                }
                Instr::StructGet { ty, field } => {
                    runtime::struct_get(engine, instance, stack, ty, field, crate::heap::Ext::None)?
                }
                Instr::StructGetS { ty, field } => runtime::struct_get(
                    engine,
                    instance,
                    stack,
                    ty,
                    field,
                    crate::heap::Ext::Signed,
                )?,
                Instr::StructGetU { ty, field } => runtime::struct_get(
                    engine,
                    instance,
                    stack,
                    ty,
                    field,
                    crate::heap::Ext::Unsigned,
                )?,
                Instr::StructSet { ty, field } => {
                    runtime::struct_set(engine, instance, stack, ty, field)?
                }
                Instr::ArrayNew(ty) => runtime::array_new(engine, instance, stack, ty)?,
                Instr::ArrayNewDefault(ty) => {
                    runtime::array_new_default(engine, instance, stack, ty)?
                }
                Instr::ArrayNewFixed { ty, len } => {
                    runtime::array_new_fixed(engine, instance, stack, ty, len)?
                }
                Instr::ArrayNewData { ty, data } => {
                    runtime::array_new_data(engine, instance, stack, ty, data)?
                }
                Instr::ArrayNewElem { ty, elem } => {
                    runtime::array_new_elem(engine, instance, stack, ty, elem)?
                }
                Instr::ArrayLen => runtime::array_len(engine, instance, stack)?,
                Instr::ArrayGet(_) => {
                    runtime::array_get(engine, instance, stack, crate::heap::Ext::None)?
                }
                Instr::ArrayGetS(_) => {
                    runtime::array_get(engine, instance, stack, crate::heap::Ext::Signed)?
                }
                Instr::ArrayGetU(_) => {
                    runtime::array_get(engine, instance, stack, crate::heap::Ext::Unsigned)?
                }
                Instr::ArraySet(ty) => runtime::array_set(engine, instance, stack, ty)?,
                Instr::ArrayFill(ty) => runtime::array_fill(engine, instance, stack, ty)?,
                Instr::ArrayCopy { .. } => runtime::array_copy(engine, instance, stack)?,
                Instr::ArrayInitData { data, .. } => {
                    runtime::array_init_data(engine, instance, stack, data)?
                }
                Instr::ArrayInitElem { elem, .. } => {
                    runtime::array_init_elem(engine, instance, stack, elem)?
                }
            }
        }
    }
}

fn cmp_i32(stack: &mut StackObject, op: impl Fn(u32, u32) -> bool) -> RtResult {
    let b = stack.values.pop_u32()?;
    let a = stack.values.pop_u32()?;
    stack.values.push(&Value::I32(op(a, b) as i32));
    Ok(())
}

fn memory0(instance: &Instance) -> Result<&crate::instance::Memory, Box<Throwable>> {
    instance
        .memory(0)
        .ok_or_else(|| Throwable::internal("module has no memory"))
}

fn memory0_mut(instance: &mut Instance) -> Result<&mut crate::instance::Memory, Box<Throwable>> {
    instance
        .memory_mut(0)
        .ok_or_else(|| Throwable::internal("module has no memory"))
}
