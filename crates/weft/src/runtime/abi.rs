//! Native-calling-convention wrappers over the dispatcher.
//!
//! The contract consumed by generated code: the first argument is the
//! `Instance`, subsequent arguments are literal immediates from the
//! bytecode, operands travel on the value stack, and the return value
//! is a possibly-null `Throwable` pointer (void for routines that
//! cannot trap). Execution context beyond the instance hangs off the
//! current stack.

use crate::engine::Engine;
use crate::frames::FrameRecord;
use crate::heap::Ext;
use crate::instance::Instance;
use crate::module::{Function, WasmFunction};
use crate::runtime::{self, RtResult};
use crate::stack::object::StackObject;
use crate::trap::{Throwable, TrapReason};

/// Numeric trap reasons as generated code passes them.
pub fn reason_from_code(code: u32) -> TrapReason {
    match code {
        0 => TrapReason::Oob,
        1 => TrapReason::NullDeref,
        2 => TrapReason::DivZero,
        3 => TrapReason::IntOverflow,
        4 => TrapReason::InvalidConv,
        5 => TrapReason::Unreachable,
        6 => TrapReason::StackOverflow,
        7 => TrapReason::TableOob,
        8 => TrapReason::MemoryOob,
        9 => TrapReason::ArrayIndexOob,
        10 => TrapReason::Oom,
        _ => TrapReason::CastFailure,
    }
}

/// Inverse of [`reason_from_code`], used when emitting `rt_trap` calls.
pub fn code_for_reason(reason: TrapReason) -> u32 {
    match reason {
        TrapReason::Oob => 0,
        TrapReason::NullDeref => 1,
        TrapReason::DivZero => 2,
        TrapReason::IntOverflow => 3,
        TrapReason::InvalidConv => 4,
        TrapReason::Unreachable => 5,
        TrapReason::StackOverflow => 6,
        TrapReason::TableOob => 7,
        TrapReason::MemoryOob => 8,
        TrapReason::ArrayIndexOob => 9,
        TrapReason::Oom => 10,
        TrapReason::CastFailure => 11,
    }
}

fn with_context(
    instance: *mut Instance,
    f: impl FnOnce(&mut Engine, &mut Instance, &mut StackObject) -> RtResult,
) -> *mut Throwable {
    let stack = unsafe { &mut *crate::stubs::current_stack() };
    let engine = unsafe { &mut *stack.engine };
    let instance = unsafe { &mut *instance };
    match f(engine, instance, stack) {
        Ok(()) => std::ptr::null_mut(),
        Err(t) => Box::into_raw(t),
    }
}

/// Store a throwable produced by a runtime routine on the current
/// stack so the unwind path delivers it.
pub extern "C" fn rt_deliver_throwable(t: *mut Throwable) {
    let stack = unsafe { &mut *crate::stubs::current_stack() };
    stack.thrown = Some(unsafe { Box::from_raw(t) });
}

// --- Memory ---

pub extern "C" fn rt_memory_grow(instance: *mut Instance, mi: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::memory_grow(e, i, s, mi))
}

pub extern "C" fn rt_memory_init(instance: *mut Instance, data: u32, mem: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::memory_init(e, i, s, data, mem))
}

pub extern "C" fn rt_memory_copy(instance: *mut Instance, dst: u32, src: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::memory_copy(e, i, s, dst, src))
}

pub extern "C" fn rt_memory_fill(instance: *mut Instance, mi: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::memory_fill(e, i, s, mi))
}

pub extern "C" fn rt_data_drop(instance: *mut Instance, i: u32) -> *mut Throwable {
    with_context(instance, |_, inst, _| runtime::data_drop(inst, i))
}

pub extern "C" fn rt_elem_drop(instance: *mut Instance, i: u32) -> *mut Throwable {
    with_context(instance, |_, inst, _| runtime::elem_drop(inst, i))
}

// --- Globals ---

/// Cannot trap: void return.
pub extern "C" fn rt_global_get(instance: *mut Instance, i: u32) {
    let t = with_context(instance, |e, inst, s| runtime::global_get(e, inst, s, i));
    debug_assert!(t.is_null(), "global.get cannot trap");
    if !t.is_null() {
        rt_deliver_throwable(t);
    }
}

pub extern "C" fn rt_global_set(instance: *mut Instance, i: u32) -> *mut Throwable {
    with_context(instance, |e, inst, s| runtime::global_set(e, inst, s, i))
}

// --- Tables ---

pub extern "C" fn rt_table_get(instance: *mut Instance, ti: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::table_get(e, i, s, ti))
}

pub extern "C" fn rt_table_set(instance: *mut Instance, ti: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::table_set(e, i, s, ti))
}

pub extern "C" fn rt_table_grow(instance: *mut Instance, ti: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::table_grow(e, i, s, ti))
}

pub extern "C" fn rt_table_fill(instance: *mut Instance, ti: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::table_fill(e, i, s, ti))
}

pub extern "C" fn rt_table_init(instance: *mut Instance, elem: u32, ti: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::table_init(e, i, s, elem, ti))
}

pub extern "C" fn rt_table_copy(instance: *mut Instance, dst: u32, src: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::table_copy(e, i, s, dst, src))
}

// --- GC objects ---

pub extern "C" fn rt_struct_new(instance: *mut Instance, ti: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::struct_new(e, i, s, ti))
}

pub extern "C" fn rt_struct_new_default(instance: *mut Instance, ti: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::struct_new_default(e, i, s, ti))
}

pub extern "C" fn rt_struct_get(instance: *mut Instance, ti: u32, field: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| {
        runtime::struct_get(e, i, s, ti, field, Ext::None)
    })
}

pub extern "C" fn rt_struct_get_s(instance: *mut Instance, ti: u32, field: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| {
        runtime::struct_get(e, i, s, ti, field, Ext::Signed)
    })
}

pub extern "C" fn rt_struct_get_u(instance: *mut Instance, ti: u32, field: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| {
        runtime::struct_get(e, i, s, ti, field, Ext::Unsigned)
    })
}

pub extern "C" fn rt_struct_set(instance: *mut Instance, ti: u32, field: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::struct_set(e, i, s, ti, field))
}

pub extern "C" fn rt_array_new(instance: *mut Instance, ti: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_new(e, i, s, ti))
}

pub extern "C" fn rt_array_new_default(instance: *mut Instance, ti: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_new_default(e, i, s, ti))
}

pub extern "C" fn rt_array_new_fixed(instance: *mut Instance, ti: u32, len: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_new_fixed(e, i, s, ti, len))
}

pub extern "C" fn rt_array_new_data(instance: *mut Instance, ti: u32, data: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_new_data(e, i, s, ti, data))
}

pub extern "C" fn rt_array_new_elem(instance: *mut Instance, ti: u32, elem: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_new_elem(e, i, s, ti, elem))
}

pub extern "C" fn rt_array_len(instance: *mut Instance) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_len(e, i, s))
}

pub extern "C" fn rt_array_get(instance: *mut Instance) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_get(e, i, s, Ext::None))
}

pub extern "C" fn rt_array_get_s(instance: *mut Instance) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_get(e, i, s, Ext::Signed))
}

pub extern "C" fn rt_array_get_u(instance: *mut Instance) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_get(e, i, s, Ext::Unsigned))
}

pub extern "C" fn rt_array_set(instance: *mut Instance, ti: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_set(e, i, s, ti))
}

pub extern "C" fn rt_array_fill(instance: *mut Instance, ti: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_fill(e, i, s, ti))
}

pub extern "C" fn rt_array_copy(instance: *mut Instance) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_copy(e, i, s))
}

pub extern "C" fn rt_array_init_data(instance: *mut Instance, data: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_init_data(e, i, s, data))
}

pub extern "C" fn rt_array_init_elem(instance: *mut Instance, elem: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| runtime::array_init_elem(e, i, s, elem))
}

// --- Control ---

pub extern "C" fn rt_probe_loop(
    instance: *mut Instance,
    func: *const WasmFunction,
    pc: u32,
) -> *mut Throwable {
    with_context(instance, |e, _, s| {
        runtime::probe_loop(e, s, unsafe { &*func }, pc)
    })
}

pub extern "C" fn rt_probe_instr(
    instance: *mut Instance,
    func: *const WasmFunction,
    pc: u32,
) -> *mut Throwable {
    with_context(instance, |e, _, s| {
        runtime::probe_instr(e, s, unsafe { &*func }, pc)
    })
}

/// Always returns a throwable.
pub extern "C" fn rt_trap(instance: *mut Instance, reason: u32) -> *mut Throwable {
    with_context(instance, |e, i, s| {
        runtime::trap_op(e, i, s, reason_from_code(reason))
    })
}

pub extern "C" fn rt_tierup(
    instance: *mut Instance,
    func: *const WasmFunction,
    pc: u32,
) -> *mut Throwable {
    with_context(instance, |e, i, s| {
        let index = unsafe { (*func).index };
        let Some(Function::Wasm(wf)) = i.function_at(index).cloned() else {
            return Err(Throwable::internal("tier-up on an unknown function"));
        };
        let frame = FrameRecord(s.trace_sp);
        crate::tierup::tierup(e, i, s, frame, &wf, pc)
    })
}

pub extern "C" fn rt_call_host(instance: *mut Instance, f: *const Function) -> *mut Throwable {
    with_context(instance, |e, i, s| {
        let f = unsafe { &*f };
        runtime::call_host(e, i, s, f)
    })
}

#[cfg(test)]
mod tests {
    //! Drives the wrappers exactly as generated code does: operands on
    //! the value stack, the current stack installed, instance as the
    //! first argument, nullable throwable out.

    use super::*;
    use crate::engine::ProbeOutcome;
    use crate::linker::Linker;
    use crate::module::{HostResult, HostFunction, Module, ModuleBuilder};
    use crate::value::{anyref, TypeCode, Value, ValueRep};
    use std::cell::Cell;
    use std::rc::Rc;
    use wasmparser::{FieldType, StorageType, ValType};

    fn rich_module() -> Rc<Module> {
        let mut mb = ModuleBuilder::new();
        mb.memory(1, Some(4));
        mb.global(ValType::I32, true, Value::I32(7));
        mb.table(anyref(), 2, Some(8));
        mb.struct_type(&[
            FieldType {
                element_type: StorageType::I8,
                mutable: true,
            },
            FieldType {
                element_type: StorageType::Val(ValType::I32),
                mutable: true,
            },
        ]);
        mb.array_type(FieldType {
            element_type: StorageType::Val(ValType::I32),
            mutable: true,
        });
        mb.data(&[1, 2, 3, 4]);
        mb.elem(vec![Value::I31(9), Value::NULL]);
        mb.finish()
    }

    /// Build an engine/instance/stack triple, publish the stack, run
    /// `f`, and unpublish.
    fn with_context_installed(
        f: impl FnOnce(*mut Instance, &mut Engine, &mut Instance, &mut StackObject),
    ) {
        let mut engine = Engine::default();
        let mut instance = Linker::new().instantiate(&engine, &rich_module()).unwrap();
        let mut stack = StackObject::new(ValueRep::TAGGED, 256 * 1024, 16);
        stack.engine = &mut engine as *mut Engine;
        stack.instance = &mut instance as *mut Instance;
        crate::stubs::set_current_stack(&mut *stack);
        let ip = &mut instance as *mut Instance;
        f(ip, &mut engine, &mut instance, &mut stack);
        crate::stubs::set_current_stack(std::ptr::null_mut());
    }

    fn take(t: *mut Throwable) -> Box<Throwable> {
        assert!(!t.is_null(), "expected a throwable");
        unsafe { Box::from_raw(t) }
    }

    #[test]
    fn memory_family_round_trips_and_traps() {
        with_context_installed(|ip, _e, instance, stack| {
            // init mem[8..12) from data[0..4)
            stack.values.push(&Value::I32(8));
            stack.values.push(&Value::I32(0));
            stack.values.push(&Value::I32(4));
            assert!(rt_memory_init(ip, 0, 0).is_null());
            // copy to 16, fill one byte, grow by 1
            stack.values.push(&Value::I32(16));
            stack.values.push(&Value::I32(8));
            stack.values.push(&Value::I32(4));
            assert!(rt_memory_copy(ip, 0, 0).is_null());
            stack.values.push(&Value::I32(16));
            stack.values.push(&Value::I32(0x11));
            stack.values.push(&Value::I32(1));
            assert!(rt_memory_fill(ip, 0).is_null());
            stack.values.push(&Value::I32(1));
            assert!(rt_memory_grow(ip, 0).is_null());
            assert_eq!(stack.values.pop(TypeCode::I32).unwrap(), Value::I32(1));
            assert_eq!(instance.memory(0).unwrap().size_pages(), 2);
            assert_eq!(
                instance.memory(0).unwrap().load(16, 4),
                Some(0x0403_0211)
            );
            // a dropped segment has length zero: init traps
            assert!(rt_data_drop(ip, 0).is_null());
            stack.values.push(&Value::I32(0));
            stack.values.push(&Value::I32(0));
            stack.values.push(&Value::I32(4));
            let t = take(rt_memory_init(ip, 0, 0));
            assert!(t.is_trap(TrapReason::MemoryOob));
        });
    }

    #[test]
    fn global_and_table_family() {
        with_context_installed(|ip, _e, instance, stack| {
            rt_global_get(ip, 0);
            assert_eq!(stack.values.pop(TypeCode::I32).unwrap(), Value::I32(7));
            stack.values.push(&Value::I32(40));
            assert!(rt_global_set(ip, 0).is_null());
            assert_eq!(instance.global(0).unwrap().value, Value::I32(40));

            stack.values.push(&Value::I31(3));
            stack.values.push(&Value::I32(2));
            assert!(rt_table_grow(ip, 0).is_null());
            assert_eq!(stack.values.pop(TypeCode::I32).unwrap(), Value::I32(2));
            stack.values.push(&Value::I32(3));
            assert!(rt_table_get(ip, 0).is_null());
            assert_eq!(stack.values.pop_ref().unwrap(), Value::I31(3));
            stack.values.push(&Value::I32(0));
            stack.values.push(&Value::I31(5));
            assert!(rt_table_set(ip, 0).is_null());
            assert_eq!(instance.table(0).unwrap().get(0), Some(&Value::I31(5)));
            // out of bounds
            stack.values.push(&Value::I32(99));
            let t = take(rt_table_get(ip, 0));
            assert!(t.is_trap(TrapReason::TableOob));
        });
    }

    #[test]
    fn gc_object_family() {
        with_context_installed(|ip, _e, _instance, stack| {
            // struct { i8, i32 }: heap type 0
            stack.values.push(&Value::I32(-1));
            stack.values.push(&Value::I32(42));
            assert!(rt_struct_new(ip, 0).is_null());
            let s = stack.values.peek_ref().unwrap();
            assert!(rt_struct_get_s(ip, 0, 0).is_null());
            assert_eq!(stack.values.pop(TypeCode::I32).unwrap(), Value::I32(-1));
            stack.values.push(&s);
            assert!(rt_struct_get_u(ip, 0, 0).is_null());
            assert_eq!(stack.values.pop(TypeCode::I32).unwrap(), Value::I32(0xFF));
            stack.values.push(&s);
            assert!(rt_struct_get(ip, 0, 1).is_null());
            assert_eq!(stack.values.pop(TypeCode::I32).unwrap(), Value::I32(42));
            stack.values.push(&s);
            stack.values.push(&Value::I32(9));
            assert!(rt_struct_set(ip, 0, 1).is_null());

            // array of i32: heap type 1
            stack.values.push(&Value::I32(6));
            stack.values.push(&Value::I32(3));
            assert!(rt_array_new(ip, 1).is_null());
            let a = stack.values.peek_ref().unwrap();
            assert!(rt_array_len(ip).is_null());
            assert_eq!(stack.values.pop(TypeCode::I32).unwrap(), Value::I32(3));
            stack.values.push(&a);
            stack.values.push(&Value::I32(1));
            assert!(rt_array_get(ip).is_null());
            assert_eq!(stack.values.pop(TypeCode::I32).unwrap(), Value::I32(6));
            stack.values.push(&a);
            stack.values.push(&Value::I32(9));
            let t = take(rt_array_get(ip));
            assert!(t.is_trap(TrapReason::ArrayIndexOob));
            // array.new_data decodes segment bytes
            stack.values.push(&Value::I32(0));
            stack.values.push(&Value::I32(1));
            assert!(rt_array_new_data(ip, 1, 0).is_null());
            stack.values.push(&Value::I32(0));
            assert!(rt_array_get(ip).is_null());
            assert_eq!(
                stack.values.pop(TypeCode::I32).unwrap(),
                Value::I32(0x04030201u32 as i32)
            );
        });
    }

    #[test]
    fn control_family() {
        with_context_installed(|ip, engine, instance, stack| {
            // TRAP constructs a fresh trap; no frames are live here.
            let t = take(rt_trap(ip, code_for_reason(TrapReason::DivZero)));
            assert!(t.is_trap(TrapReason::DivZero));

            // Probes fire through the same entry generated code uses.
            let mut mb = ModuleBuilder::new();
            let sig = mb.sig(&[], &[]);
            mb.func("probed", sig, &[], vec![crate::module::Instr::Return]);
            let m2 = mb.finish();
            let mut i2 = Linker::new().instantiate(engine, &m2).unwrap();
            let f = i2.function("probed").unwrap();
            let hits = Rc::new(Cell::new(0u32));
            let h2 = Rc::clone(&hits);
            engine.add_loop_probe(Box::new(move |_f, _pc| {
                h2.set(h2.get() + 1);
                ProbeOutcome::Continue
            }));
            let crate::module::Function::Wasm(wf) = &f else {
                unreachable!()
            };
            let i2p = &mut i2 as *mut Instance;
            assert!(rt_probe_loop(i2p, Rc::as_ptr(wf), 0).is_null());
            assert_eq!(hits.get(), 1);
            // Tiering disabled: the gate is a no-op.
            assert!(rt_tierup(i2p, Rc::as_ptr(wf), 0).is_null());

            // Host dispatch through the ABI.
            let host = Function::Host(HostFunction::new(
                "inc",
                Rc::new(crate::module::SigDecl {
                    params: vec![ValType::I32],
                    results: vec![ValType::I32],
                }),
                |args| match args[0] {
                    Value::I32(v) => HostResult::Value1(Value::I32(v + 1)),
                    _ => unreachable!(),
                },
            ));
            stack.values.push(&Value::I32(41));
            assert!(rt_call_host(ip, &host as *const Function).is_null());
            assert_eq!(stack.values.pop(TypeCode::I32).unwrap(), Value::I32(42));

            // Deliver stores on the current stack for the unwind path.
            let boxed = Throwable::trap(TrapReason::Unreachable);
            rt_deliver_throwable(Box::into_raw(boxed));
            assert!(stack.thrown.take().unwrap().is_trap(TrapReason::Unreachable));
            let _ = instance;
        });
    }

    #[test]
    fn reason_codes_round_trip() {
        for reason in [
            TrapReason::Oob,
            TrapReason::NullDeref,
            TrapReason::DivZero,
            TrapReason::IntOverflow,
            TrapReason::InvalidConv,
            TrapReason::Unreachable,
            TrapReason::StackOverflow,
            TrapReason::TableOob,
            TrapReason::MemoryOob,
            TrapReason::ArrayIndexOob,
            TrapReason::Oom,
            TrapReason::CastFailure,
        ] {
            assert_eq!(reason_from_code(code_for_reason(reason)), reason);
        }
    }
}
