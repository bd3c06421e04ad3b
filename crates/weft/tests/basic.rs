use wasmparser::ValType;

use weft::{Engine, Instr, Linker, ModuleBuilder, Value};

fn engine() -> Engine {
    Engine::default()
}

#[test]
fn return_const_i32() -> Result<(), anyhow::Error> {
    let mut mb = ModuleBuilder::new();
    let sig = mb.sig(&[], &[ValType::I32]);
    mb.func("answer", sig, &[], vec![Instr::I32Const(42), Instr::Return]);
    let module = mb.finish();

    let mut engine = engine();
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("answer").unwrap();
    let result = engine.run(&mut instance, &f, &[])?;
    assert_eq!(result.unwrap_values(), vec![Value::I32(42)]);
    Ok(())
}

#[test]
fn arguments_and_arithmetic() -> Result<(), anyhow::Error> {
    let mut mb = ModuleBuilder::new();
    let sig = mb.sig(&[ValType::I32, ValType::I32], &[ValType::I32]);
    mb.func(
        "addmul",
        sig,
        &[],
        vec![
            Instr::LocalGet(0),
            Instr::LocalGet(1),
            Instr::I32Add,
            Instr::LocalGet(0),
            Instr::I32Mul,
            Instr::Return,
        ],
    );
    let module = mb.finish();

    let mut engine = engine();
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("addmul").unwrap();
    let result = engine.run(&mut instance, &f, &[Value::I32(3), Value::I32(4)])?;
    // (3 + 4) * 3
    assert_eq!(result.unwrap_values(), vec![Value::I32(21)]);
    Ok(())
}

#[test]
fn multi_value_results() -> Result<(), anyhow::Error> {
    let mut mb = ModuleBuilder::new();
    let sig = mb.sig(&[ValType::I32, ValType::I64], &[ValType::I32, ValType::I64]);
    mb.func(
        "swapish",
        sig,
        &[],
        vec![Instr::LocalGet(0), Instr::LocalGet(1), Instr::Return],
    );
    let module = mb.finish();

    let mut engine = engine();
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("swapish").unwrap();
    let result = engine.run(&mut instance, &f, &[Value::I32(7), Value::I64(-9)])?;
    assert_eq!(result.unwrap_values(), vec![Value::I32(7), Value::I64(-9)]);
    Ok(())
}

#[test]
fn argument_validation_is_an_api_error() -> Result<(), anyhow::Error> {
    let mut mb = ModuleBuilder::new();
    let sig = mb.sig(&[ValType::I32], &[ValType::I32]);
    mb.func("id", sig, &[], vec![Instr::LocalGet(0), Instr::Return]);
    let module = mb.finish();

    let mut engine = engine();
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("id").unwrap();
    assert!(engine.run(&mut instance, &f, &[]).is_err());
    assert!(engine.run(&mut instance, &f, &[Value::I64(1)]).is_err());
    assert!(
        engine
            .run(&mut instance, &f, &[Value::I32(1), Value::I32(2)])
            .is_err()
    );
    Ok(())
}

#[test]
fn memory_grow_returns_previous_size() -> Result<(), anyhow::Error> {
    let mut mb = ModuleBuilder::new();
    let sig = mb.sig(&[], &[ValType::I32]);
    mb.memory(1, None);
    mb.func(
        "grow2",
        sig,
        &[],
        vec![Instr::I32Const(2), Instr::MemoryGrow(0), Instr::Return],
    );
    let module = mb.finish();

    let mut engine = engine();
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("grow2").unwrap();
    let result = engine.run(&mut instance, &f, &[])?;
    assert_eq!(result.unwrap_values(), vec![Value::I32(1)]);
    assert_eq!(instance.memory(0).unwrap().size_pages(), 3);
    Ok(())
}

#[test]
fn nested_calls() -> Result<(), anyhow::Error> {
    let mut mb = ModuleBuilder::new();
    let unary = mb.sig(&[ValType::I32], &[ValType::I32]);
    let double = mb.func(
        "double",
        unary,
        &[],
        vec![
            Instr::LocalGet(0),
            Instr::LocalGet(0),
            Instr::I32Add,
            Instr::Return,
        ],
    );
    mb.func(
        "quad",
        unary,
        &[],
        vec![
            Instr::LocalGet(0),
            Instr::Call(double),
            Instr::Call(double),
            Instr::Return,
        ],
    );
    let module = mb.finish();

    let mut engine = engine();
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("quad").unwrap();
    let result = engine.run(&mut instance, &f, &[Value::I32(5)])?;
    assert_eq!(result.unwrap_values(), vec![Value::I32(20)]);
    Ok(())
}

#[test]
fn wasm_tail_call_reuses_the_frame() -> Result<(), anyhow::Error> {
    let mut mb = ModuleBuilder::new();
    let unary = mb.sig(&[ValType::I32], &[ValType::I32]);
    // even(n): n == 0 -> 1; else odd(n - 1). odd(n): n == 0 -> 0; else
    // even(n - 1). Deep mutual recursion only terminates promptly with
    // real tail calls.
    let even = 0;
    let odd = 1;
    mb.func(
        "even",
        unary,
        &[],
        vec![
            Instr::LocalGet(0),  // 0
            Instr::I32Eqz,       // 1
            Instr::BrIf(7),      // 2
            Instr::LocalGet(0),  // 3
            Instr::I32Const(1),  // 4
            Instr::I32Sub,       // 5
            Instr::ReturnCall(odd), // 6
            Instr::I32Const(1),  // 7
            Instr::Return,       // 8
        ],
    );
    mb.func(
        "odd",
        unary,
        &[],
        vec![
            Instr::LocalGet(0),
            Instr::I32Eqz,
            Instr::BrIf(7),
            Instr::LocalGet(0),
            Instr::I32Const(1),
            Instr::I32Sub,
            Instr::ReturnCall(even),
            Instr::I32Const(0),
            Instr::Return,
        ],
    );
    let module = mb.finish();

    let mut engine = engine();
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("even").unwrap();
    // Far deeper than the frame window could hold without tail calls.
    let result = engine.run(&mut instance, &f, &[Value::I32(100_000)])?;
    assert_eq!(result.unwrap_values(), vec![Value::I32(1)]);
    Ok(())
}

#[test]
fn counted_loop_in_the_interpreter() -> Result<(), anyhow::Error> {
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
    let module = mb.finish();

    let mut engine = engine();
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("sum").unwrap();
    let result = engine.run(&mut instance, &f, &[Value::I32(100)])?;
    assert_eq!(result.unwrap_values(), vec![Value::I32(4950)]);
    Ok(())
}

#[test]
fn runs_are_stack_neutral_across_reuse() -> Result<(), anyhow::Error> {
    let mut mb = ModuleBuilder::new();
    let sig = mb.sig(&[ValType::I32], &[ValType::I32]);
    mb.func(
        "inc",
        sig,
        &[],
        vec![
            Instr::LocalGet(0),
            Instr::I32Const(1),
            Instr::I32Add,
            Instr::Return,
        ],
    );
    let module = mb.finish();

    let mut engine = engine();
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("inc").unwrap();
    // The pooled stack is reused across runs; any drift in vsp or rsp
    // bookkeeping would compound and corrupt later results.
    for i in 0..200 {
        let result = engine.run(&mut instance, &f, &[Value::I32(i)])?;
        assert_eq!(result.unwrap_values(), vec![Value::I32(i + 1)]);
    }
    Ok(())
}

#[test]
fn ref_values_cross_the_boundary() -> Result<(), anyhow::Error> {
    let mut mb = ModuleBuilder::new();
    let sig = mb.sig(&[], &[weft::value::anyref(), weft::value::i31ref()]);
    mb.func(
        "refs",
        sig,
        &[],
        vec![
            Instr::RefNull,
            Instr::I32Const(17),
            Instr::RefI31,
            Instr::Return,
        ],
    );
    let module = mb.finish();

    let mut engine = engine();
    let mut instance = Linker::new().instantiate(&engine, &module)?;
    let f = instance.function("refs").unwrap();
    let result = engine.run(&mut instance, &f, &[])?;
    assert_eq!(result.unwrap_values(), vec![Value::NULL, Value::I31(17)]);
    Ok(())
}
