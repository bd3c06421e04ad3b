//! Runs a recursive fib in the interpreter and a counted loop through
//! tier-up, printing rough timings.
//!
//! ```sh
//! cargo run --release --example bench_fib
//! ```

use std::time::Instant;

use wasmparser::ValType;
use weft::{Config, Engine, Instr, Linker, ModuleBuilder, TieringPolicy, Value};

fn main() -> Result<(), anyhow::Error> {
    let mut mb = ModuleBuilder::new();
    let sig = mb.sig(&[ValType::I32], &[ValType::I32]);

    // fib(n): n < 2 -> n; else fib(n-1) + fib(n-2)
    mb.func(
        "fib",
        sig,
        &[],
        vec![
            Instr::LocalGet(0), // 0
            Instr::I32Const(2), // 1
            Instr::I32LtS,      // 2
            Instr::BrIf(14),    // 3
            Instr::LocalGet(0), // 4
            Instr::I32Const(1), // 5
            Instr::I32Sub,      // 6
            Instr::Call(0),     // 7
            Instr::LocalGet(0), // 8
            Instr::I32Const(2), // 9
            Instr::I32Sub,      // 10
            Instr::Call(0),     // 11
            Instr::I32Add,      // 12
            Instr::Return,      // 13
            Instr::LocalGet(0), // 14
            Instr::Return,      // 15
        ],
    );

    // sum(n): triangle sum via a counted loop; hot enough to tier up.
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

    let mut engine = Engine::new(Config {
        tiering: TieringPolicy {
            enabled: true,
            loop_threshold: 1000,
        },
        ..Config::default()
    })?;
    let mut instance = Linker::new().instantiate(&engine, &module)?;

    let fib = instance.function("fib").unwrap();
    let start = Instant::now();
    let result = engine.run(&mut instance, &fib, &[Value::I32(25)])?;
    println!(
        "fib(25) = {:?} in {:?}",
        result.unwrap_values(),
        start.elapsed()
    );

    let sum = instance.function("sum").unwrap();
    let start = Instant::now();
    let result = engine.run(&mut instance, &sum, &[Value::I32(5_000_000)])?;
    println!(
        "sum(5M) = {:?} in {:?} (tiered up mid-loop)",
        result.unwrap_values(),
        start.elapsed()
    );
    Ok(())
}
