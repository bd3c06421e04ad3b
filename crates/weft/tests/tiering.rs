use std::cell::Cell;
use std::rc::Rc;

use wasmparser::ValType;

use weft::{Config, Engine, Instr, Linker, ModuleBuilder, ProbeOutcome, TieringPolicy, Value};

fn sum_module() -> std::rc::Rc<weft::Module> {
    let mut mb = ModuleBuilder::new();
    let sig = mb.sig(&[ValType::I32], &[ValType::I32]);
    mb.func(
        "sum",
        sig,
        &[ValType::I32, ValType::I32], // acc, i
        vec![
            Instr::Loop,        // 0
            Instr::LocalGet(2), // 1
            Instr::LocalGet(0), // 2
            Instr::I32GeS,      // 3
            Instr::BrIf(14),    // 4
            Instr::LocalGet(1), // 5
            Instr::LocalGet(2), // 6
            Instr::I32Add,      // 7
            Instr::LocalSet(1), // 8
            Instr::LocalGet(2), // 9
            Instr::I32Const(1), // 10
            Instr::I32Add,      // 11
            Instr::LocalSet(2), // 12
            Instr::Br(0),       // 13
            Instr::LocalGet(1), // 14
            Instr::Return,      // 15
        ],
    );
    mb.finish()
}

fn tiering_engine(threshold: u32) -> Engine {
    Engine::new(Config {
        tiering: TieringPolicy {
            enabled: true,
            loop_threshold: threshold,
        },
        ..Config::default()
    })
    .unwrap()
}

#[test]
fn osr_enters_the_compiled_tier_mid_loop() -> Result<(), anyhow::Error> {
    let module = sum_module();
    let mut engine = tiering_engine(100);
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("sum").unwrap();

    // Count interpreter visits to a loop-body instruction; the
    // compiled tier runs no probes, so the count freezes at OSR.
    let hits = Rc::new(Cell::new(0u32));
    let hits_probe = Rc::clone(&hits);
    engine.add_instr_probe(
        &f,
        5,
        Box::new(move |_f, _pc| {
            hits_probe.set(hits_probe.get() + 1);
            ProbeOutcome::Continue
        }),
    )?;

    let n = 500;
    let result = engine.run(&mut instance, &f, &[Value::I32(n)])?;
    assert_eq!(
        result.unwrap_values(),
        vec![Value::I32(n * (n - 1) / 2)],
        "interp prefix and compiled remainder agree"
    );

    let weft::Function::Wasm(wf) = &f else { unreachable!() };
    let code = wf.decl.compiled().expect("tier-up compiled the function");
    assert_eq!(
        engine.code_region_name(code.entry_addr()),
        Some("spc"),
        "compiled entry registered as an SPC region"
    );
    let interp_iterations = hits.get();
    assert!(
        interp_iterations > 0 && interp_iterations < n as u32,
        "execution left the interpreter mid-loop (saw {interp_iterations} iterations)"
    );

    // The OSR target itself sits inside the compiled region.
    let (pc, off) = code.osr_entries()[0];
    assert_eq!(pc, 0);
    assert_eq!(
        engine.code_region_name(code.range().0 + off as usize),
        Some("spc")
    );
    Ok(())
}

#[test]
fn subsequent_calls_run_fully_compiled() -> Result<(), anyhow::Error> {
    let module = sum_module();
    let mut engine = tiering_engine(50);
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("sum").unwrap();

    let hits = Rc::new(Cell::new(0u32));
    let hits_probe = Rc::clone(&hits);
    engine.add_instr_probe(
        &f,
        5,
        Box::new(move |_f, _pc| {
            hits_probe.set(hits_probe.get() + 1);
            ProbeOutcome::Continue
        }),
    )?;

    let first = engine.run(&mut instance, &f, &[Value::I32(200)])?;
    assert_eq!(first.unwrap_values(), vec![Value::I32(19900)]);
    let after_first = hits.get();
    assert!(after_first > 0);

    // Tier-up installed the compiled entry on the declaration: the
    // next call dispatches straight into compiled code and the
    // interpreter probe never fires again.
    let second = engine.run(&mut instance, &f, &[Value::I32(200)])?;
    assert_eq!(second.unwrap_values(), vec![Value::I32(19900)]);
    assert_eq!(hits.get(), after_first, "no interpreter iterations on call two");
    Ok(())
}

#[test]
fn tiered_loop_calls_the_runtime_through_the_abi() -> Result<(), anyhow::Error> {
    // The accumulator lives in a global, so every iteration crosses
    // the runtime ABI — in the interpreter prefix through the
    // dispatcher, in the compiled remainder through rt_global_get/set.
    let mut mb = ModuleBuilder::new();
    let g = mb.global(ValType::I32, true, Value::I32(0));
    let sig = mb.sig(&[ValType::I32], &[ValType::I32]);
    mb.func(
        "gsum",
        sig,
        &[ValType::I32], // i
        vec![
            Instr::Loop,         // 0
            Instr::LocalGet(1),  // 1
            Instr::LocalGet(0),  // 2
            Instr::I32GeS,       // 3
            Instr::BrIf(14),     // 4
            Instr::GlobalGet(g), // 5
            Instr::LocalGet(1),  // 6
            Instr::I32Add,       // 7
            Instr::GlobalSet(g), // 8
            Instr::LocalGet(1),  // 9
            Instr::I32Const(1),  // 10
            Instr::I32Add,       // 11
            Instr::LocalSet(1),  // 12
            Instr::Br(0),        // 13
            Instr::GlobalGet(g), // 14
            Instr::Return,       // 15
        ],
    );
    let module = mb.finish();

    let mut engine = tiering_engine(50);
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("gsum").unwrap();
    let n = 300;
    let result = engine.run(&mut instance, &f, &[Value::I32(n)])?;
    assert_eq!(result.unwrap_values(), vec![Value::I32(n * (n - 1) / 2)]);
    assert_eq!(
        instance.global(g).unwrap().value,
        Value::I32(n * (n - 1) / 2)
    );
    let weft::Function::Wasm(wf) = &f else { unreachable!() };
    let code = wf.decl.compiled().expect("global accesses stay compilable");
    assert!(!code.osr_entries().is_empty());
    Ok(())
}

#[test]
fn trap_raised_inside_the_compiled_tier() -> Result<(), anyhow::Error> {
    let mut mb = ModuleBuilder::new();
    let sig = mb.sig(&[ValType::I32], &[]);
    mb.func(
        "countdown",
        sig,
        &[],
        vec![
            Instr::Loop,        // 0
            Instr::LocalGet(0), // 1
            Instr::I32Eqz,      // 2
            Instr::BrIf(9),     // 3
            Instr::LocalGet(0), // 4
            Instr::I32Const(1), // 5
            Instr::I32Sub,      // 6
            Instr::LocalSet(0), // 7
            Instr::Br(0),       // 8
            Instr::Unreachable, // 9
        ],
    );
    let module = mb.finish();

    let mut engine = tiering_engine(10);
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("countdown").unwrap();
    // Tier-up fires well before the countdown ends: the trap is
    // constructed by compiled code calling rt_trap and unwinds through
    // rt_deliver_throwable.
    let t = engine
        .run(&mut instance, &f, &[Value::I32(100)])?
        .unwrap_throw();
    assert!(t.is_trap(weft::TrapReason::Unreachable));
    assert_eq!(t.trace.len(), 1);
    assert_eq!(t.trace[0].name(), "countdown");
    assert_eq!(t.trace[0].pc(), Some(9), "pc reconstructed from the call site");
    let weft::Function::Wasm(wf) = &f else { unreachable!() };
    assert!(wf.decl.compiled().is_some());
    Ok(())
}

#[test]
fn functions_outside_the_subset_stay_interpreted() -> Result<(), anyhow::Error> {
    let mut mb = ModuleBuilder::new();
    let sig = mb.sig(&[ValType::I32], &[ValType::I64]);
    // i64 results are outside the SPC subset.
    mb.func(
        "wide",
        sig,
        &[ValType::I64],
        vec![
            Instr::Loop,        // 0
            Instr::LocalGet(0), // 1
            Instr::I32Eqz,      // 2
            Instr::BrIf(13),    // 3
            Instr::LocalGet(1), // 4
            Instr::I64Const(3), // 5
            Instr::I64Add,      // 6
            Instr::LocalSet(1), // 7
            Instr::LocalGet(0), // 8
            Instr::I32Const(1), // 9
            Instr::I32Sub,      // 10
            Instr::LocalSet(0), // 11
            Instr::Br(0),       // 12
            Instr::LocalGet(1), // 13
            Instr::Return,      // 14
        ],
    );
    let module = mb.finish();

    let mut engine = tiering_engine(10);
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("wide").unwrap();
    let result = engine.run(&mut instance, &f, &[Value::I32(100)])?;
    assert_eq!(result.unwrap_values(), vec![Value::I64(300)]);
    let weft::Function::Wasm(wf) = &f else { unreachable!() };
    assert!(wf.decl.compiled().is_none(), "stays in the interpreter");
    Ok(())
}
