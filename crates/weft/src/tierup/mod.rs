//! The tier-up gate: on-stack replacement from the interpreter into
//! compiled code.
//!
//! The tiering policy counts loop-header visits per `(function, pc)`.
//! Once the threshold is reached the function is handed to the SPC;
//! if the compiled code carries an OSR entry matching the probed pc,
//! the gate overwrites the caller frame's pending return-address slot
//! in place with `compiled_entry + offset`. The next return-equivalent
//! transfer lands in compiled code with the Wasm state re-derived from
//! the value stack and frame locals. Without a matching entry the call
//! is a no-op and execution continues in the interpreter.
//!
//! Compilation also installs the compiled entry thunk in the
//! declaration's `target_code`, so subsequent calls enter the SPC tier
//! directly.

use std::rc::Rc;

use crate::engine::Engine;
use crate::frames::FrameRecord;
use crate::instance::Instance;
use crate::module::WasmFunction;
use crate::runtime::RtResult;
use crate::spc;
use crate::stack::object::StackObject;
use crate::trap::Throwable;

/// `TIERUP(f, pc)`: consult the tiering policy and, when an OSR record
/// matches, rewrite the frame's pending return address.
pub(crate) fn tierup(
    engine: &mut Engine,
    instance: &Instance,
    _stack: &mut StackObject,
    frame: FrameRecord,
    func: &Rc<WasmFunction>,
    pc: u32,
) -> RtResult {
    let policy = engine.config().tiering;
    if !policy.enabled {
        return Ok(());
    }
    let key = (Rc::as_ptr(&func.decl) as usize, pc);
    let count = {
        let c = engine.tier_counters.entry(key).or_insert(0);
        *c = c.saturating_add(1);
        *c
    };
    if count < policy.loop_threshold {
        return Ok(());
    }

    // The frame under the gate must belong to the probed function.
    if frame.func() != Rc::as_ptr(func) {
        return Err(Throwable::internal(
            "tier-up frame does not belong to the probed function",
        ));
    }

    let code = match func.decl.compiled() {
        Some(code) => code,
        None => match spc::compile_and_install(engine, instance, func) {
            Some(code) => code,
            // Outside the SPC subset: stay in the interpreter.
            None => return Ok(()),
        },
    };

    let Some(&(_, offset)) = code.osr.iter().find(|(p, _)| *p == pc) else {
        return Ok(());
    };
    let (start, _) = code.range();
    // The rewrite must land before the gate returns so the next
    // return-equivalent transfer observes it.
    frame.set_ret_addr((start + offset as usize) as *const u8);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Config, TieringPolicy};
    use crate::frames::FRAME_SIZE;
    use crate::linker::Linker;
    use crate::module::{FuncDecl, Instr, ModuleBuilder, SigDecl};
    use wasmparser::ValType;

    fn engine_with_tiering(threshold: u32) -> Engine {
        Engine::new(Config {
            tiering: TieringPolicy {
                enabled: true,
                loop_threshold: threshold,
            },
            ..Config::default()
        })
        .unwrap()
    }

    fn empty_instance(engine: &Engine) -> Instance {
        let module = ModuleBuilder::new().finish();
        Linker::new().instantiate(engine, &module).unwrap()
    }

    fn loopy_func() -> Rc<WasmFunction> {
        // Counts local 0 down to zero.
        let body = vec![
            Instr::Loop,        // 0
            Instr::LocalGet(0), // 1
            Instr::I32Eqz,      // 2
            Instr::BrIf(9),     // 3
            Instr::LocalGet(0), // 4
            Instr::I32Const(1), // 5
            Instr::I32Sub,      // 6
            Instr::LocalSet(0), // 7
            Instr::Br(0),       // 8
            Instr::Return,      // 9
        ];
        let sig = Rc::new(SigDecl {
            params: vec![ValType::I32],
            results: vec![],
        });
        Rc::new(WasmFunction {
            name: "loopy".into(),
            index: 0,
            decl: Rc::new(FuncDecl::new(sig, vec![], body)),
        })
    }

    #[test]
    fn gate_rewrites_return_address_at_threshold() {
        let mut engine = engine_with_tiering(3);
        let instance = empty_instance(&engine);
        let mut stack =
            crate::stack::object::StackObject::new(crate::value::ValueRep::TAGGED, 256 * 1024, 16);
        let func = loopy_func();

        // A synthetic interpreter frame owned by this function.
        let mut area = vec![0u8; 4 * FRAME_SIZE];
        let h = unsafe { area.as_mut_ptr().add(2 * FRAME_SIZE) };
        let marker = engine.interp_marker();
        let frame = unsafe {
            FrameRecord::init_interp(
                h,
                marker,
                Rc::as_ptr(&func),
                Rc::as_ptr(&func.decl),
                std::ptr::null_mut(),
            )
        };

        for _ in 0..2 {
            tierup(&mut engine, &instance, &mut stack, frame, &func, 0).unwrap();
            assert_eq!(frame.ret_addr(), marker, "below threshold: no rewrite");
            assert!(func.decl.compiled().is_none());
        }
        tierup(&mut engine, &instance, &mut stack, frame, &func, 0).unwrap();
        let code = func.decl.compiled().expect("threshold reached: compiled");
        assert_ne!(frame.ret_addr(), marker, "return address rewritten");
        let (start, end) = code.range();
        let target = frame.ret_addr() as usize;
        assert!(target >= start && target < end, "target inside SPC code");
        assert_eq!(
            engine.code_region_name(target),
            Some("spc"),
            "rewritten address classifies as compiled code"
        );
    }

    #[test]
    fn gate_is_noop_without_matching_osr_entry() {
        let mut engine = engine_with_tiering(1);
        let instance = empty_instance(&engine);
        let mut stack =
            crate::stack::object::StackObject::new(crate::value::ValueRep::TAGGED, 256 * 1024, 16);
        let func = loopy_func();
        let mut area = vec![0u8; 4 * FRAME_SIZE];
        let h = unsafe { area.as_mut_ptr().add(2 * FRAME_SIZE) };
        let marker = engine.interp_marker();
        let frame = unsafe {
            FrameRecord::init_interp(
                h,
                marker,
                Rc::as_ptr(&func),
                Rc::as_ptr(&func.decl),
                std::ptr::null_mut(),
            )
        };
        // pc 4 is not a loop header: compilation may happen, but no
        // rewrite.
        tierup(&mut engine, &instance, &mut stack, frame, &func, 4).unwrap();
        assert_eq!(frame.ret_addr(), marker);
    }
}
