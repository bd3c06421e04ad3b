//! The runtime dispatcher.
//!
//! One routine per complex bytecode, shared by the interpreter and the
//! compiled tier. Every routine pops its operands from the value stack
//! (right to left, per the Wasm operand order), performs the operation
//! on the instance's resources, pushes results, and returns a
//! possibly-empty failure. Traps get their stack trace attached here,
//! starting from the caller's native frame.
//!
//! [`abi`] exposes the same routines under the native calling
//! convention for generated code.

pub mod abi;

use std::rc::Rc;

use wasmparser::StorageType;

use crate::engine::{Engine, ProbeOutcome};
use crate::heap::{self, Ext, HeapObject, MAX_ARRAY_LENGTH};
use crate::instance::Instance;
use crate::module::{ArrayDecl, Function, HeapTypeDecl, HostFunction, HostResult, StructDecl, WasmFunction};
use crate::stack::object::{StackObject, StackState};
use crate::trap::{Throwable, ThrowReason, TraceFrame, TrapReason};
use crate::value::{TypeCode, Value};

pub(crate) type RtResult = Result<(), Box<Throwable>>;

/// Capture the current Wasm frame chain, innermost first.
pub(crate) fn capture(engine: &Engine, stack: &StackObject) -> Vec<TraceFrame> {
    crate::frames::capture_trace(&engine.regions, stack.trace_sp, stack.interp_top)
}

/// Materialize a trap with a trace starting at the caller's frame.
pub(crate) fn trap_here(
    engine: &Engine,
    stack: &StackObject,
    reason: TrapReason,
) -> Box<Throwable> {
    let mut t = Throwable::trap(reason);
    t.trace = capture(engine, stack);
    t
}

/// `TRAP(f, pc, reason)`: construct a fresh trap with the current
/// frame chain. Always fails.
pub(crate) fn trap_op(
    engine: &mut Engine,
    _instance: &mut Instance,
    stack: &mut StackObject,
    reason: TrapReason,
) -> RtResult {
    Err(trap_here(engine, stack, reason))
}

// --- Probes ---

fn fire_probes(
    probes: &mut [crate::engine::ProbeFn],
    func: &WasmFunction,
    pc: u32,
) -> Option<Box<Throwable>> {
    for p in probes.iter_mut() {
        match p(func, pc) {
            ProbeOutcome::Continue => {}
            ProbeOutcome::Throw(t) => return Some(t),
        }
    }
    None
}

/// Promote a probe-returned trap with a trace starting at the probed
/// frame; other throwables propagate verbatim.
fn promote(engine: &Engine, stack: &StackObject, mut t: Box<Throwable>) -> Box<Throwable> {
    if matches!(t.reason, ThrowReason::Trap(_)) && t.trace.is_empty() {
        t.trace = capture(engine, stack);
    }
    t
}

/// `PROBE_loop(f, pc)`: fire the global probe registry.
pub(crate) fn probe_loop(
    engine: &mut Engine,
    stack: &mut StackObject,
    func: &WasmFunction,
    pc: u32,
) -> RtResult {
    if engine.loop_probes.is_empty() {
        return Ok(());
    }
    let thrown = fire_probes(&mut engine.loop_probes, func, pc);
    match thrown {
        Some(t) => Err(promote(engine, stack, t)),
        None => Ok(()),
    }
}

/// `PROBE_instr(f, pc)`: fire probes registered on one instruction.
pub(crate) fn probe_instr(
    engine: &mut Engine,
    stack: &mut StackObject,
    func: &WasmFunction,
    pc: u32,
) -> RtResult {
    let key = (Rc::as_ptr(&func.decl) as usize, pc);
    let thrown = match engine.instr_probes.get_mut(&key) {
        Some(probes) => fire_probes(probes, func, pc),
        None => return Ok(()),
    };
    match thrown {
        Some(t) => Err(promote(engine, stack, t)),
        None => Ok(()),
    }
}

// --- Memory ---

pub(crate) fn memory_grow(
    _engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    mi: u32,
) -> RtResult {
    let pages = stack.values.pop_u32()?;
    let Some(mem) = instance.memory_mut(mi) else {
        return Err(Throwable::internal("memory index out of range"));
    };
    let old = mem.grow(pages);
    stack.values.push(&Value::I32(old));
    Ok(())
}

fn data_segment<'a>(instance: &'a Instance, i: u32) -> Result<&'a [u8], Box<Throwable>> {
    let Some(seg) = instance.data.get(i as usize) else {
        return Err(Throwable::internal("data segment index out of range"));
    };
    Ok(if instance.dropped_data[i as usize] {
        &[]
    } else {
        seg
    })
}

fn elem_segment<'a>(instance: &'a Instance, i: u32) -> Result<&'a [Value], Box<Throwable>> {
    let Some(seg) = instance.elems.get(i as usize) else {
        return Err(Throwable::internal("element segment index out of range"));
    };
    Ok(if instance.dropped_elems[i as usize] {
        &[]
    } else {
        seg
    })
}

pub(crate) fn memory_init(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    data: u32,
    mem: u32,
) -> RtResult {
    let n = stack.values.pop_u32()? as u64;
    let s = stack.values.pop_u32()? as u64;
    let d = stack.values.pop_u32()? as u64;
    let seg_len = data_segment(instance, data)?.len() as u64;
    let Some(m) = instance.memory(mem) else {
        return Err(Throwable::internal("memory index out of range"));
    };
    if s.checked_add(n).is_none_or(|end| end > seg_len) || !m.check(d, n) {
        return Err(trap_here(engine, stack, TrapReason::MemoryOob));
    }
    let bytes = data_segment(instance, data)?[s as usize..(s + n) as usize].to_vec();
    instance.memory_mut(mem).unwrap().bytes_mut()[d as usize..(d + n) as usize]
        .copy_from_slice(&bytes);
    Ok(())
}

pub(crate) fn memory_copy(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    dst_mi: u32,
    src_mi: u32,
) -> RtResult {
    let n = stack.values.pop_u32()? as u64;
    let s = stack.values.pop_u32()? as u64;
    let d = stack.values.pop_u32()? as u64;
    let (Some(src), Some(dst)) = (instance.memory(src_mi), instance.memory(dst_mi)) else {
        return Err(Throwable::internal("memory index out of range"));
    };
    if !src.check(s, n) || !dst.check(d, n) {
        return Err(trap_here(engine, stack, TrapReason::MemoryOob));
    }
    if dst_mi == src_mi {
        instance
            .memory_mut(dst_mi)
            .unwrap()
            .bytes_mut()
            .copy_within(s as usize..(s + n) as usize, d as usize);
    } else {
        let bytes = instance.memory(src_mi).unwrap().bytes()[s as usize..(s + n) as usize].to_vec();
        instance.memory_mut(dst_mi).unwrap().bytes_mut()[d as usize..(d + n) as usize]
            .copy_from_slice(&bytes);
    }
    Ok(())
}

pub(crate) fn memory_fill(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    mi: u32,
) -> RtResult {
    let n = stack.values.pop_u32()? as u64;
    let val = stack.values.pop_u32()? as u8;
    let d = stack.values.pop_u32()? as u64;
    let Some(mem) = instance.memory_mut(mi) else {
        return Err(Throwable::internal("memory index out of range"));
    };
    if !mem.check(d, n) {
        return Err(trap_here(engine, stack, TrapReason::MemoryOob));
    }
    mem.bytes_mut()[d as usize..(d + n) as usize].fill(val);
    Ok(())
}

pub(crate) fn data_drop(instance: &mut Instance, i: u32) -> RtResult {
    match instance.dropped_data.get_mut(i as usize) {
        Some(flag) => {
            *flag = true;
            Ok(())
        }
        None => Err(Throwable::internal("data segment index out of range")),
    }
}

pub(crate) fn elem_drop(instance: &mut Instance, i: u32) -> RtResult {
    match instance.dropped_elems.get_mut(i as usize) {
        Some(flag) => {
            *flag = true;
            Ok(())
        }
        None => Err(Throwable::internal("element segment index out of range")),
    }
}

// --- Globals ---

pub(crate) fn global_get(
    _engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    i: u32,
) -> RtResult {
    let Some(g) = instance.global(i) else {
        return Err(Throwable::internal("global index out of range"));
    };
    stack.values.push(&g.value);
    Ok(())
}

/// Mutability is enforced at validation; asserted here.
pub(crate) fn global_set(
    _engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    i: u32,
) -> RtResult {
    let Some(g) = instance.globals.get_mut(i as usize) else {
        return Err(Throwable::internal("global index out of range"));
    };
    debug_assert!(g.mutable, "global.set on an immutable global");
    let v = stack.values.pop(TypeCode::for_valtype(g.ty))?;
    g.value = v;
    Ok(())
}

// --- Tables ---

pub(crate) fn table_get(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
) -> RtResult {
    let i = stack.values.pop_u32()?;
    let Some(table) = instance.table(ti) else {
        return Err(Throwable::internal("table index out of range"));
    };
    match table.get(i) {
        Some(v) => {
            stack.values.push(v);
            Ok(())
        }
        None => Err(trap_here(engine, stack, TrapReason::TableOob)),
    }
}

pub(crate) fn table_set(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
) -> RtResult {
    let v = stack.values.pop_ref()?;
    let i = stack.values.pop_u32()?;
    let Some(table) = instance.tables.get_mut(ti as usize) else {
        return Err(Throwable::internal("table index out of range"));
    };
    if !table.set(i, v) {
        return Err(trap_here(engine, stack, TrapReason::TableOob));
    }
    Ok(())
}

pub(crate) fn table_grow(
    _engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
) -> RtResult {
    let n = stack.values.pop_u32()?;
    let init = stack.values.pop_ref()?;
    let Some(table) = instance.tables.get_mut(ti as usize) else {
        return Err(Throwable::internal("table index out of range"));
    };
    let old = table.grow(n, &init);
    stack.values.push(&Value::I32(old));
    Ok(())
}

pub(crate) fn table_fill(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
) -> RtResult {
    let n = stack.values.pop_u32()? as u64;
    let v = stack.values.pop_ref()?;
    let i = stack.values.pop_u32()? as u64;
    let Some(table) = instance.tables.get_mut(ti as usize) else {
        return Err(Throwable::internal("table index out of range"));
    };
    if i.checked_add(n).is_none_or(|end| end > table.len() as u64) {
        return Err(trap_here(engine, stack, TrapReason::TableOob));
    }
    for k in i..i + n {
        table.set(k as u32, v);
    }
    Ok(())
}

pub(crate) fn table_init(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    elem: u32,
    ti: u32,
) -> RtResult {
    let n = stack.values.pop_u32()? as u64;
    let s = stack.values.pop_u32()? as u64;
    let d = stack.values.pop_u32()? as u64;
    let seg_len = elem_segment(instance, elem)?.len() as u64;
    let Some(table) = instance.table(ti) else {
        return Err(Throwable::internal("table index out of range"));
    };
    if s.checked_add(n).is_none_or(|end| end > seg_len)
        || d.checked_add(n).is_none_or(|end| end > table.len() as u64)
    {
        return Err(trap_here(engine, stack, TrapReason::TableOob));
    }
    let values = elem_segment(instance, elem)?[s as usize..(s + n) as usize].to_vec();
    let table = instance.tables.get_mut(ti as usize).unwrap();
    for (k, v) in values.iter().enumerate() {
        table.set(d as u32 + k as u32, *v);
    }
    Ok(())
}

pub(crate) fn table_copy(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    dst_ti: u32,
    src_ti: u32,
) -> RtResult {
    let n = stack.values.pop_u32()? as u64;
    let s = stack.values.pop_u32()? as u64;
    let d = stack.values.pop_u32()? as u64;
    let (Some(src), Some(dst)) = (instance.table(src_ti), instance.table(dst_ti)) else {
        return Err(Throwable::internal("table index out of range"));
    };
    if s.checked_add(n).is_none_or(|end| end > src.len() as u64)
        || d.checked_add(n).is_none_or(|end| end > dst.len() as u64)
    {
        return Err(trap_here(engine, stack, TrapReason::TableOob));
    }
    let values = instance.table(src_ti).unwrap().elems()[s as usize..(s + n) as usize].to_vec();
    let dst = instance.tables.get_mut(dst_ti as usize).unwrap();
    dst.elems_mut()[d as usize..(d + n) as usize].copy_from_slice(&values);
    Ok(())
}

// --- GC objects ---

fn struct_decl(instance: &Instance, ti: u32) -> Result<Rc<StructDecl>, Box<Throwable>> {
    match instance.heaptypes.get(ti as usize) {
        Some(HeapTypeDecl::Struct(d)) => Ok(Rc::clone(d)),
        _ => Err(Throwable::internal("heap type is not a struct")),
    }
}

fn array_decl(instance: &Instance, ti: u32) -> Result<Rc<ArrayDecl>, Box<Throwable>> {
    match instance.heaptypes.get(ti as usize) {
        Some(HeapTypeDecl::Array(d)) => Ok(Rc::clone(d)),
        _ => Err(Throwable::internal("heap type is not an array")),
    }
}

fn code_for_storage(st: StorageType) -> TypeCode {
    match st {
        StorageType::I8 | StorageType::I16 => TypeCode::I32,
        StorageType::Val(ty) => TypeCode::for_valtype(ty),
    }
}

/// Byte width of a storage type in a data segment, or `None` for
/// references.
fn storage_byte_width(st: StorageType) -> Option<usize> {
    use wasmparser::ValType;
    match st {
        StorageType::I8 => Some(1),
        StorageType::I16 => Some(2),
        StorageType::Val(ValType::I32) | StorageType::Val(ValType::F32) => Some(4),
        StorageType::Val(ValType::I64) | StorageType::Val(ValType::F64) => Some(8),
        StorageType::Val(ValType::V128) => Some(16),
        StorageType::Val(ValType::Ref(_)) => None,
    }
}

/// Decode one element of width `w` from little-endian bytes.
fn decode_storage(st: StorageType, bytes: &[u8]) -> Value {
    use wasmparser::ValType;
    let mut buf = [0u8; 16];
    buf[..bytes.len()].copy_from_slice(bytes);
    let lo = u64::from_le_bytes(buf[..8].try_into().unwrap());
    match st {
        StorageType::I8 | StorageType::I16 => Value::I32(lo as u32 as i32),
        StorageType::Val(ValType::I32) => Value::I32(lo as u32 as i32),
        StorageType::Val(ValType::I64) => Value::I64(lo as i64),
        StorageType::Val(ValType::F32) => Value::F32(f32::from_bits(lo as u32)),
        StorageType::Val(ValType::F64) => Value::F64(f64::from_bits(lo)),
        StorageType::Val(ValType::V128) => Value::V128(u128::from_le_bytes(buf)),
        StorageType::Val(ValType::Ref(_)) => Value::NULL,
    }
}

/// Deref a popped reference, trapping on null and non-objects.
fn as_object<'a>(
    engine: &Engine,
    stack: &StackObject,
    v: Value,
) -> Result<&'a HeapObject, Box<Throwable>> {
    match v {
        Value::Ref(r) if r.is_null() => Err(trap_here(engine, stack, TrapReason::NullDeref)),
        Value::Ref(r) => Ok(unsafe { r.get() }),
        Value::I31(_) => Err(trap_here(engine, stack, TrapReason::CastFailure)),
        _ => Err(Throwable::internal("expected a reference value")),
    }
}

pub(crate) fn struct_new(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
) -> RtResult {
    let decl = struct_decl(instance, ti)?;
    let mut values = Vec::with_capacity(decl.fields.len());
    for f in decl.fields.iter().rev() {
        values.push(stack.values.pop(code_for_storage(f.element_type))?);
    }
    values.reverse();
    let r = engine.heap.alloc_struct(&decl, &values);
    stack.values.push(&Value::Ref(r));
    Ok(())
}

pub(crate) fn struct_new_default(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
) -> RtResult {
    let decl = struct_decl(instance, ti)?;
    let r = engine.heap.alloc_struct_default(&decl);
    stack.values.push(&Value::Ref(r));
    Ok(())
}

pub(crate) fn struct_get(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
    field: u32,
    ext: Ext,
) -> RtResult {
    let decl = struct_decl(instance, ti)?;
    let Some(fty) = decl.fields.get(field as usize) else {
        return Err(Throwable::internal("struct field index out of range"));
    };
    let packed = matches!(fty.element_type, StorageType::I8 | StorageType::I16);
    if packed == matches!(ext, Ext::None) {
        return Err(Throwable::internal(
            "packed fields require an extension mode, unpacked fields forbid one",
        ));
    }
    let v = stack.values.pop_ref()?;
    let obj = as_object(engine, stack, v)?;
    if !matches!(obj, HeapObject::Struct { .. }) {
        return Err(Throwable::internal("struct access on a non-struct object"));
    }
    stack.values.push(&heap::struct_get(obj, field, ext));
    Ok(())
}

pub(crate) fn struct_set(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
    field: u32,
) -> RtResult {
    let decl = struct_decl(instance, ti)?;
    let Some(fty) = decl.fields.get(field as usize) else {
        return Err(Throwable::internal("struct field index out of range"));
    };
    let v = stack.values.pop(code_for_storage(fty.element_type))?;
    let r = stack.values.pop_ref()?;
    let obj = as_object(engine, stack, r)?;
    if !matches!(obj, HeapObject::Struct { .. }) {
        return Err(Throwable::internal("struct access on a non-struct object"));
    }
    heap::struct_set(obj, field, &v);
    Ok(())
}

fn check_array_len(engine: &Engine, stack: &StackObject, n: u32) -> RtResult {
    if n > MAX_ARRAY_LENGTH {
        return Err(trap_here(engine, stack, TrapReason::Oom));
    }
    Ok(())
}

pub(crate) fn array_new(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
) -> RtResult {
    let decl = array_decl(instance, ti)?;
    let n = stack.values.pop_u32()?;
    let fill = stack.values.pop(code_for_storage(decl.elem.element_type))?;
    check_array_len(engine, stack, n)?;
    let r = engine.heap.alloc_array(&decl, n, &fill);
    stack.values.push(&Value::Ref(r));
    Ok(())
}

pub(crate) fn array_new_default(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
) -> RtResult {
    let decl = array_decl(instance, ti)?;
    let n = stack.values.pop_u32()?;
    check_array_len(engine, stack, n)?;
    let r = engine.heap.alloc_array_default(&decl, n);
    stack.values.push(&Value::Ref(r));
    Ok(())
}

pub(crate) fn array_new_fixed(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
    len: u32,
) -> RtResult {
    let decl = array_decl(instance, ti)?;
    check_array_len(engine, stack, len)?;
    let mut values = Vec::with_capacity(len as usize);
    for _ in 0..len {
        values.push(stack.values.pop(code_for_storage(decl.elem.element_type))?);
    }
    values.reverse();
    let r = engine.heap.alloc_array_from(&decl, &values);
    stack.values.push(&Value::Ref(r));
    Ok(())
}

pub(crate) fn array_new_data(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
    data: u32,
) -> RtResult {
    let decl = array_decl(instance, ti)?;
    let n = stack.values.pop_u32()?;
    let s = stack.values.pop_u32()? as u64;
    let Some(width) = storage_byte_width(decl.elem.element_type) else {
        return Err(Throwable::internal("array.new_data on a reference array"));
    };
    check_array_len(engine, stack, n)?;
    let seg = data_segment(instance, data)?;
    let total = n as u64 * width as u64;
    if s.checked_add(total).is_none_or(|end| end > seg.len() as u64) {
        return Err(trap_here(engine, stack, TrapReason::MemoryOob));
    }
    let values: Vec<Value> = (0..n as usize)
        .map(|i| {
            let at = s as usize + i * width;
            decode_storage(decl.elem.element_type, &seg[at..at + width])
        })
        .collect();
    let r = engine.heap.alloc_array_from(&decl, &values);
    stack.values.push(&Value::Ref(r));
    Ok(())
}

pub(crate) fn array_new_elem(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
    elem: u32,
) -> RtResult {
    let decl = array_decl(instance, ti)?;
    let n = stack.values.pop_u32()?;
    let s = stack.values.pop_u32()? as u64;
    check_array_len(engine, stack, n)?;
    let seg = elem_segment(instance, elem)?;
    if s.checked_add(n as u64).is_none_or(|end| end > seg.len() as u64) {
        return Err(trap_here(engine, stack, TrapReason::TableOob));
    }
    let values = seg[s as usize..s as usize + n as usize].to_vec();
    let r = engine.heap.alloc_array_from(&decl, &values);
    stack.values.push(&Value::Ref(r));
    Ok(())
}

fn pop_array<'a>(
    engine: &Engine,
    stack: &mut StackObject,
) -> Result<(&'a HeapObject, u32), Box<Throwable>> {
    let v = stack.values.pop_ref()?;
    let obj = as_object(engine, stack, v)?;
    match obj {
        HeapObject::Array { len, .. } => Ok((obj, *len)),
        HeapObject::Struct { .. } => {
            Err(Throwable::internal("array access on a non-array object"))
        }
    }
}

pub(crate) fn array_len(
    engine: &mut Engine,
    _instance: &mut Instance,
    stack: &mut StackObject,
) -> RtResult {
    let (_, len) = pop_array(engine, stack)?;
    stack.values.push(&Value::I32(len as i32));
    Ok(())
}

pub(crate) fn array_get(
    engine: &mut Engine,
    _instance: &mut Instance,
    stack: &mut StackObject,
    ext: Ext,
) -> RtResult {
    let i = stack.values.pop_u32()?;
    let (obj, len) = pop_array(engine, stack)?;
    if i >= len {
        return Err(trap_here(engine, stack, TrapReason::ArrayIndexOob));
    }
    stack.values.push(&heap::array_get(obj, i, ext));
    Ok(())
}

/// `ARRAY_SET`: the value's expected tag comes from the array's
/// declaration, so the typed pop happens against it.
pub(crate) fn array_set(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
) -> RtResult {
    let decl = array_decl(instance, ti)?;
    let v = stack.values.pop(code_for_storage(decl.elem.element_type))?;
    let i = stack.values.pop_u32()?;
    let (obj, len) = pop_array(engine, stack)?;
    if i >= len {
        return Err(trap_here(engine, stack, TrapReason::ArrayIndexOob));
    }
    heap::array_set(obj, i, &v);
    Ok(())
}

pub(crate) fn array_fill(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    ti: u32,
) -> RtResult {
    let decl = array_decl(instance, ti)?;
    let n = stack.values.pop_u32()? as u64;
    let v = stack.values.pop(code_for_storage(decl.elem.element_type))?;
    let d = stack.values.pop_u32()? as u64;
    let (obj, len) = pop_array(engine, stack)?;
    if d.checked_add(n).is_none_or(|end| end > len as u64) {
        return Err(trap_here(engine, stack, TrapReason::ArrayIndexOob));
    }
    for k in d..d + n {
        heap::array_set(obj, k as u32, &v);
    }
    Ok(())
}

pub(crate) fn array_copy(
    engine: &mut Engine,
    _instance: &mut Instance,
    stack: &mut StackObject,
) -> RtResult {
    let n = stack.values.pop_u32()? as u64;
    let s = stack.values.pop_u32()? as u64;
    let (src, src_len) = pop_array(engine, stack)?;
    let d = stack.values.pop_u32()? as u64;
    let (dst, dst_len) = pop_array(engine, stack)?;
    if s.checked_add(n).is_none_or(|end| end > src_len as u64)
        || d.checked_add(n).is_none_or(|end| end > dst_len as u64)
    {
        return Err(trap_here(engine, stack, TrapReason::ArrayIndexOob));
    }
    // Read everything first: source and destination may alias.
    let values: Vec<Value> = (0..n).map(|k| heap::array_get(src, (s + k) as u32, Ext::None)).collect();
    for (k, v) in values.iter().enumerate() {
        heap::array_set(dst, (d + k as u64) as u32, v);
    }
    Ok(())
}

pub(crate) fn array_init_data(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    data: u32,
) -> RtResult {
    let n = stack.values.pop_u32()? as u64;
    let s = stack.values.pop_u32()? as u64;
    let d = stack.values.pop_u32()? as u64;
    let (obj, len) = pop_array(engine, stack)?;
    let HeapObject::Array { decl, .. } = obj else {
        unreachable!("pop_array returned a non-array");
    };
    let Some(width) = storage_byte_width(decl.elem.element_type) else {
        return Err(Throwable::internal("array.init_data on a reference array"));
    };
    if d.checked_add(n).is_none_or(|end| end > len as u64) {
        return Err(trap_here(engine, stack, TrapReason::ArrayIndexOob));
    }
    let seg = data_segment(instance, data)?;
    let total = n * width as u64;
    if s.checked_add(total).is_none_or(|end| end > seg.len() as u64) {
        return Err(trap_here(engine, stack, TrapReason::MemoryOob));
    }
    for k in 0..n as usize {
        let at = s as usize + k * width;
        let v = decode_storage(decl.elem.element_type, &seg[at..at + width]);
        heap::array_set(obj, d as u32 + k as u32, &v);
    }
    Ok(())
}

pub(crate) fn array_init_elem(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    elem: u32,
) -> RtResult {
    let n = stack.values.pop_u32()? as u64;
    let s = stack.values.pop_u32()? as u64;
    let d = stack.values.pop_u32()? as u64;
    let (obj, len) = pop_array(engine, stack)?;
    if d.checked_add(n).is_none_or(|end| end > len as u64) {
        return Err(trap_here(engine, stack, TrapReason::ArrayIndexOob));
    }
    let seg = elem_segment(instance, elem)?;
    if s.checked_add(n).is_none_or(|end| end > seg.len() as u64) {
        return Err(trap_here(engine, stack, TrapReason::TableOob));
    }
    let values = seg[s as usize..(s + n) as usize].to_vec();
    for (k, v) in values.iter().enumerate() {
        heap::array_set(obj, d as u32 + k as u32, v);
    }
    Ok(())
}

// --- Host calls ---

/// `callHost(f)`: the generalized call loop of the host-call protocol.
///
/// Host branch: pop the arguments, invoke the callback, then push
/// results, propagate a throwable with frames prepended, or follow a
/// tail call (host targets loop in place, Wasm targets are invoked).
/// Wasm branch: invoke through the tiered entry; the callee adjusts
/// the value stack by `(results - params) · slot_size`.
pub(crate) fn call_host(
    engine: &mut Engine,
    instance: &mut Instance,
    stack: &mut StackObject,
    f: &Function,
) -> RtResult {
    let mut current = f.clone();
    let mut pending_args: Option<Vec<Value>> = None;
    loop {
        match current {
            Function::Host(hf) => {
                let args = match pending_args.take() {
                    Some(a) => a,
                    None => stack.values.pop_n(&hf.sig.params.clone())?,
                };
                stack.state = StackState::RunningHost;
                let outcome = (hf.callback.borrow_mut())(&args);
                // The callback may have resumed other stacks; restore
                // ours from the saved pointer.
                crate::stubs::set_current_stack(stack as *mut StackObject);
                stack.state = StackState::Running;
                match outcome {
                    HostResult::Value0 => return Ok(()),
                    HostResult::Value1(v) => {
                        stack.values.push(&v);
                        return Ok(());
                    }
                    HostResult::ValueN(vs) => {
                        stack.values.push_n(&vs);
                        return Ok(());
                    }
                    HostResult::Throw(mut t) => {
                        let mut trace = vec![TraceFrame::Host {
                            name: hf.name.clone(),
                        }];
                        trace.extend(capture(engine, stack));
                        trace.extend(std::mem::take(&mut t.trace));
                        t.trace = trace;
                        return Err(t);
                    }
                    HostResult::TailCall(target, args) => {
                        current = target;
                        pending_args = Some(args);
                    }
                }
            }
            Function::Wasm(wf) => {
                if let Some(a) = pending_args.take() {
                    stack.values.push_n(&a);
                }
                return crate::interp::invoke_wasm(engine, instance, stack, &wf);
            }
        }
    }
}

/// `callHost2(hf)`: the stub-dispatch flavor, entered on the stack's
/// own native region when a host function is the stack's pending
/// function.
///
/// Returns the entry code of a Wasm tail-call target (the enter-func
/// stub loops back into its Wasm branch), or null when finished —
/// results or a throwable have been left on the stack object.
pub(crate) extern "C" fn call_host2(hf: *const HostFunction) -> *const u8 {
    let stack = unsafe { &mut *crate::stubs::current_stack() };
    let mut current: Rc<HostFunction> = match stack.func_handle.clone() {
        Some(Function::Host(h)) => h,
        _ => {
            stack.thrown = Some(Throwable::internal(
                "host dispatch without a pending host function",
            ));
            return std::ptr::null();
        }
    };
    debug_assert_eq!(Rc::as_ptr(&current), hf);
    let mut pending_args: Option<Vec<Value>> = None;
    loop {
        let args = match pending_args.take() {
            Some(a) => a,
            None => match stack.values.pop_n(&current.sig.params.clone()) {
                Ok(a) => a,
                Err(t) => {
                    stack.thrown = Some(t);
                    return std::ptr::null();
                }
            },
        };
        stack.state = StackState::RunningHost;
        let outcome = (current.callback.borrow_mut())(&args);
        crate::stubs::set_current_stack(stack as *mut StackObject);
        stack.state = StackState::Running;
        match outcome {
            HostResult::Value0 => return std::ptr::null(),
            HostResult::Value1(v) => {
                stack.values.push(&v);
                return std::ptr::null();
            }
            HostResult::ValueN(vs) => {
                stack.values.push_n(&vs);
                return std::ptr::null();
            }
            HostResult::Throw(mut t) => {
                t.trace.insert(
                    0,
                    TraceFrame::Host {
                        name: current.name.clone(),
                    },
                );
                stack.thrown = Some(t);
                return std::ptr::null();
            }
            HostResult::TailCall(Function::Host(h2), args) => {
                current = h2;
                pending_args = Some(args);
            }
            HostResult::TailCall(Function::Wasm(wf), args) => {
                // Install the Wasm target as the stack's pending
                // function; the enter-func stub re-dispatches without
                // growing the native stack.
                stack.values.push_n(&args);
                stack.func_kind = 0;
                stack.func_decl = Rc::as_ptr(&wf.decl);
                stack.func_wasm = Rc::as_ptr(&wf);
                stack.func_host = std::ptr::null();
                let entry = wf.decl.target_code.get();
                stack.func_handle = Some(Function::Wasm(wf));
                return entry;
            }
        }
    }
}
