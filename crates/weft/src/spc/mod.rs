//! Single-pass compiler for the integer/control subset.
//!
//! Compiles function bodies made of i32 constants, locals, arithmetic,
//! comparisons, branches and loops to x86-64. Complex operators with
//! i32 shape — `global.get`/`global.set` of i32 globals, `memory.grow`
//! and `unreachable` — are emitted as calls into the runtime ABI
//! ([`crate::runtime::abi`]): the code publishes its VSP and frame
//! handle, passes the instance as the first argument, and unwinds
//! through `rt_deliver_throwable` when the routine returns a
//! throwable. Anything else makes the function stay in the
//! interpreter (`compile` returns `None`).
//!
//! ## Conventions
//!
//! Body entry: `extern "C" fn(locals: *mut u8, vsp: *mut u8) -> *mut u8`
//! (SysV: rdi, rsi; returns the new vsp). `r14` holds the locals base,
//! `r15` the VSP. Operands live on the tagged value stack; compiled
//! code writes tags and skips checks, which is exactly the static-type
//! privilege untagged mode formalizes.
//!
//! On return, results sit at the locals base and the returned vsp is
//! `locals + results · slot`, matching the interpreter's post-return
//! layout.
//!
//! The prologue builds the SPC frame record (accessor and function
//! slots per the frame contract); per-loop OSR preludes repeat it
//! without re-initializing locals and jump straight to the loop header,
//! so a rewritten return address enters compiled code with machine
//! state re-derived from the value stack and locals alone.

use std::rc::Rc;

use weft_codegen::{Asm, CodeBuffer, Cond, Fixup, Reg};

use wasmparser::ValType;

use crate::engine::Engine;
use crate::frames::CodeRegionKind;
use crate::instance::Instance;
use crate::module::{Instr, WasmFunction};
use crate::runtime::abi;
use crate::stack::object::StackObject;
use crate::trap::TrapReason;

/// A compiled function: executable buffer plus the tables the walker
/// and the tier-up gate consult.
pub struct CompiledCode {
    #[allow(dead_code)]
    buf: CodeBuffer,
    /// Body entry (full prologue, initializes extra locals).
    pub(crate) entry: *const u8,
    /// Stub-dispatch entry installed in `FuncDecl::target_code`.
    pub(crate) entry_thunk: *const u8,
    /// `(wasm pc of loop header, code offset of its OSR prelude)`.
    pub(crate) osr: Vec<(u32, u32)>,
    /// `(code offset after a runtime call, wasm pc)` for trace
    /// reconstruction.
    pub(crate) ret_pcs: Vec<(u32, u32)>,
    pub(crate) frame_size: u32,
    #[allow(dead_code)]
    pub(crate) func: *const WasmFunction,
}

impl CompiledCode {
    /// Address range of the emitted code.
    pub fn range(&self) -> (usize, usize) {
        self.buf.range()
    }

    pub fn entry_addr(&self) -> usize {
        self.entry as usize
    }

    /// OSR entry table: `(wasm_pc, code_offset_from_entry)` pairs.
    pub fn osr_entries(&self) -> &[(u32, u32)] {
        &self.osr
    }

    /// Reconstruct a wasm pc from a return address inside this code,
    /// mapping it back through the call-site and OSR tables.
    ///
    /// `None` means the address is not a frame return address (e.g.
    /// the entry thunk's internal call site); the walker treats that
    /// as the end of the frame chain.
    pub(crate) fn pc_for_return(&self, ra: usize) -> Option<u32> {
        let (start, _) = self.buf.range();
        let off = (ra - start) as u32;
        if let Some((_, pc)) = self.ret_pcs.iter().find(|(o, _)| *o == off) {
            return Some(*pc);
        }
        if let Some((pc, _)) = self.osr.iter().find(|(_, o)| *o == off) {
            return Some(*pc);
        }
        None
    }
}

impl std::fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCode")
            .field("entry", &self.entry)
            .field("osr", &self.osr)
            .finish()
    }
}

fn is_i32(ty: &ValType) -> bool {
    matches!(ty, ValType::I32)
}

/// Whether the SPC can take this instruction.
fn supported(instr: &Instr) -> bool {
    matches!(
        instr,
        Instr::Nop
            | Instr::I32Const(_)
            | Instr::LocalGet(_)
            | Instr::LocalSet(_)
            | Instr::LocalTee(_)
            | Instr::Drop
            | Instr::I32Add
            | Instr::I32Sub
            | Instr::I32Mul
            | Instr::I32Eq
            | Instr::I32Ne
            | Instr::I32LtS
            | Instr::I32LtU
            | Instr::I32LeS
            | Instr::I32GtS
            | Instr::I32GeS
            | Instr::I32Eqz
            | Instr::Loop
            | Instr::Br(_)
            | Instr::BrIf(_)
            | Instr::Return
    )
}

fn cond_for(instr: &Instr) -> Cond {
    match instr {
        Instr::I32Eq => Cond::E,
        Instr::I32Ne => Cond::Ne,
        Instr::I32LtS => Cond::L,
        Instr::I32LtU => Cond::B,
        Instr::I32LeS => Cond::Le,
        Instr::I32GtS => Cond::G,
        Instr::I32GeS => Cond::Ge,
        _ => unreachable!(),
    }
}

/// Compile one function, returning `None` when any part of it falls
/// outside the subset.
///
/// The instance supplies the shapes the runtime escapes depend on
/// (global types, memory presence); the emitted code itself loads the
/// live instance from the current stack at each call, so it stays
/// valid for any instance of the same module.
pub(crate) fn compile(
    engine: &Engine,
    instance: &Instance,
    func: &Rc<WasmFunction>,
) -> Option<Rc<CompiledCode>> {
    let decl = &func.decl;
    let sig = &decl.sig;
    if !sig.params.iter().all(is_i32)
        || !sig.results.iter().all(is_i32)
        || !decl.locals.iter().all(is_i32)
    {
        return None;
    }
    for instr in &decl.body {
        let ok = match *instr {
            Instr::GlobalGet(i) | Instr::GlobalSet(i) => {
                matches!(instance.global(i), Some(g) if g.ty == ValType::I32)
            }
            Instr::MemoryGrow(mi) => instance.memory(mi).is_some(),
            Instr::Unreachable => true,
            ref other => supported(other),
        };
        if !ok {
            return None;
        }
    }

    let rep = engine.config().value_rep;
    let slot = rep.slot_size() as i32;
    let tag = rep.tag_size() as i32;
    let tagged = rep.tagged;
    let nparams = sig.params.len() as i32;
    let nresults = sig.results.len() as i32;
    let nextra = decl.locals.len() as i32;
    let func_ptr = Rc::as_ptr(func);
    let cell = crate::stubs::current_stack_cell_addr();
    let off_vsp = StackObject::off_vsp() as i32;
    let off_trace_sp = StackObject::off_trace_sp() as i32;
    let off_instance = StackObject::off_instance() as i32;

    let i32_tag = crate::value::TypeCode::I32 as u8;

    let mut buf = CodeBuffer::new(4096).ok()?;

    // Offsets of instruction starts; index body.len() is the implicit
    // return.
    let mut pc_offsets: Vec<usize> = Vec::with_capacity(decl.body.len() + 1);
    let mut fixups: Vec<(u32, Fixup)> = Vec::new();
    let mut throws: Vec<Fixup> = Vec::new();
    let mut loops: Vec<u32> = Vec::new();
    let mut osr: Vec<(u32, u32)> = Vec::new();
    let mut ret_pcs: Vec<(u32, u32)> = Vec::new();
    let (entry_off, thunk_off);

    {
        let mut a = Asm::new(&mut buf);

        let prologue = |a: &mut Asm| {
            a.mov_ri64(Reg::Rax, func_ptr as u64);
            a.push(Reg::Rax); // wasm_func slot
            a.xor_rr32(Reg::Rcx, Reg::Rcx);
            a.push(Reg::Rcx); // accessor slot
            a.push(Reg::R15);
            a.push(Reg::R14);
            a.push(Reg::R13); // alignment pad, kept callee-saved anyway
            a.mov_rr(Reg::R14, Reg::Rdi);
            a.mov_rr(Reg::R15, Reg::Rsi);
        };
        let push_eax = |a: &mut Asm| {
            if tagged {
                a.mov_mi8(Reg::R15, 0, i32_tag);
            }
            a.mov_mr32(Reg::R15, tag, Reg::Rax);
            a.add_ri32(Reg::R15, slot);
        };
        let pop_to = |a: &mut Asm, reg: Reg| {
            a.sub_ri32(Reg::R15, slot);
            a.mov_rm32(reg, Reg::R15, tag);
        };
        let emit_return = |a: &mut Asm| {
            for k in (0..nresults).rev() {
                a.sub_ri32(Reg::R15, slot);
                a.mov_rm32(Reg::Rax, Reg::R15, tag);
                if tagged {
                    a.mov_mi8(Reg::R14, k * slot, i32_tag);
                }
                a.mov_mr32(Reg::R14, k * slot + tag, Reg::Rax);
            }
            a.lea(Reg::Rax, Reg::R14, nresults * slot);
            a.pop(Reg::R13);
            a.pop(Reg::R14);
            a.pop(Reg::R15);
            a.add_ri32(Reg::Rsp, 16);
            a.ret();
        };
        // Runtime escape: publish VSP and this frame's handle, call the
        // ABI routine with the live instance, reload the VSP, and
        // branch to the unwind block when a throwable comes back.
        let emit_rt_call = |a: &mut Asm,
                            ret_pcs: &mut Vec<(u32, u32)>,
                            throws: &mut Vec<Fixup>,
                            pc: usize,
                            target: usize,
                            arg: i32,
                            can_throw: bool| {
            a.mov_ri64(Reg::R10, cell as u64);
            a.mov_rm(Reg::R10, Reg::R10, 0);
            a.mov_mr(Reg::R10, off_vsp, Reg::R15);
            a.mov_mr(Reg::R10, off_trace_sp, Reg::Rsp);
            a.mov_rm(Reg::Rdi, Reg::R10, off_instance);
            a.mov_ri32(Reg::Rsi, arg);
            a.call_abs(Reg::Rax, target);
            ret_pcs.push((a.pos() as u32, pc as u32));
            // The routine moved the value-stack top.
            a.mov_ri64(Reg::R10, cell as u64);
            a.mov_rm(Reg::R10, Reg::R10, 0);
            a.mov_rm(Reg::R15, Reg::R10, off_vsp);
            if can_throw {
                a.test_rr(Reg::Rax, Reg::Rax);
                throws.push(a.jcc_fwd(Cond::Ne));
            }
        };

        // ---- body entry ----
        entry_off = a.pos();
        prologue(&mut a);
        if nextra > 0 {
            a.xor_rr32(Reg::Rax, Reg::Rax);
            for _ in 0..nextra {
                push_eax(&mut a);
            }
        }

        // Compile-time operand depth; OSR demands empty stacks at loop
        // headers.
        let mut ct_sp: i32 = 0;

        for (pc, instr) in decl.body.iter().enumerate() {
            pc_offsets.push(a.pos());
            match *instr {
                Instr::Nop => {}
                Instr::I32Const(v) => {
                    a.mov_ri32(Reg::Rax, v);
                    push_eax(&mut a);
                    ct_sp += 1;
                }
                Instr::LocalGet(i) => {
                    a.mov_rm32(Reg::Rax, Reg::R14, i as i32 * slot + tag);
                    push_eax(&mut a);
                    ct_sp += 1;
                }
                Instr::LocalSet(i) => {
                    pop_to(&mut a, Reg::Rax);
                    a.mov_mr32(Reg::R14, i as i32 * slot + tag, Reg::Rax);
                    ct_sp -= 1;
                }
                Instr::LocalTee(i) => {
                    a.mov_rm32(Reg::Rax, Reg::R15, tag - slot);
                    a.mov_mr32(Reg::R14, i as i32 * slot + tag, Reg::Rax);
                }
                Instr::Drop => {
                    a.sub_ri32(Reg::R15, slot);
                    ct_sp -= 1;
                }
                Instr::I32Add => {
                    pop_to(&mut a, Reg::Rcx);
                    pop_to(&mut a, Reg::Rax);
                    a.add_rr32(Reg::Rax, Reg::Rcx);
                    push_eax(&mut a);
                    ct_sp -= 1;
                }
                Instr::I32Sub => {
                    pop_to(&mut a, Reg::Rcx);
                    pop_to(&mut a, Reg::Rax);
                    a.sub_rr32(Reg::Rax, Reg::Rcx);
                    push_eax(&mut a);
                    ct_sp -= 1;
                }
                Instr::I32Mul => {
                    pop_to(&mut a, Reg::Rcx);
                    pop_to(&mut a, Reg::Rax);
                    a.imul_rr32(Reg::Rax, Reg::Rcx);
                    push_eax(&mut a);
                    ct_sp -= 1;
                }
                Instr::I32Eq
                | Instr::I32Ne
                | Instr::I32LtS
                | Instr::I32LtU
                | Instr::I32LeS
                | Instr::I32GtS
                | Instr::I32GeS => {
                    pop_to(&mut a, Reg::Rcx);
                    pop_to(&mut a, Reg::Rax);
                    a.cmp_rr32(Reg::Rax, Reg::Rcx);
                    a.setcc(cond_for(instr), Reg::Rax);
                    a.movzx_r32_r8(Reg::Rax, Reg::Rax);
                    push_eax(&mut a);
                    ct_sp -= 1;
                }
                Instr::I32Eqz => {
                    pop_to(&mut a, Reg::Rax);
                    a.test_rr32(Reg::Rax, Reg::Rax);
                    a.setcc(Cond::E, Reg::Rax);
                    a.movzx_r32_r8(Reg::Rax, Reg::Rax);
                    push_eax(&mut a);
                }
                Instr::Loop => {
                    if ct_sp != 0 {
                        return None;
                    }
                    loops.push(pc as u32);
                }
                Instr::Br(t) => {
                    if (t as usize) < pc_offsets.len() {
                        let target = pc_offsets[t as usize];
                        a.jmp_back(target);
                    } else {
                        fixups.push((t, a.jmp_fwd()));
                    }
                }
                Instr::BrIf(t) => {
                    pop_to(&mut a, Reg::Rax);
                    a.test_rr32(Reg::Rax, Reg::Rax);
                    ct_sp -= 1;
                    if (t as usize) < pc_offsets.len() {
                        let target = pc_offsets[t as usize];
                        a.jcc_back(Cond::Ne, target);
                    } else {
                        fixups.push((t, a.jcc_fwd(Cond::Ne)));
                    }
                }
                Instr::Return => {
                    emit_return(&mut a);
                }
                Instr::GlobalGet(i) => {
                    // Cannot trap: void return, no unwind check.
                    emit_rt_call(
                        &mut a,
                        &mut ret_pcs,
                        &mut throws,
                        pc,
                        abi::rt_global_get as usize,
                        i as i32,
                        false,
                    );
                    ct_sp += 1;
                }
                Instr::GlobalSet(i) => {
                    emit_rt_call(
                        &mut a,
                        &mut ret_pcs,
                        &mut throws,
                        pc,
                        abi::rt_global_set as usize,
                        i as i32,
                        true,
                    );
                    ct_sp -= 1;
                }
                Instr::MemoryGrow(mi) => {
                    emit_rt_call(
                        &mut a,
                        &mut ret_pcs,
                        &mut throws,
                        pc,
                        abi::rt_memory_grow as usize,
                        mi as i32,
                        true,
                    );
                }
                Instr::Unreachable => {
                    // Always returns a throwable: the unwind branch is
                    // unconditional in practice.
                    emit_rt_call(
                        &mut a,
                        &mut ret_pcs,
                        &mut throws,
                        pc,
                        abi::rt_trap as usize,
                        abi::code_for_reason(TrapReason::Unreachable) as i32,
                        true,
                    );
                }
                _ => return None,
            }
        }
        // Implicit return; also a valid branch target.
        pc_offsets.push(a.pos());
        emit_return(&mut a);

        for (target, fixup) in fixups.drain(..) {
            a.bind_at(fixup, pc_offsets[target as usize]);
        }

        // ---- unwind block ----
        // Deliver the throwable to the stack object and return with
        // the current VSP; the caller propagates from `thrown`.
        if !throws.is_empty() {
            for f in throws.drain(..) {
                a.bind(f);
            }
            a.mov_rr(Reg::Rdi, Reg::Rax);
            a.call_abs(Reg::Rax, abi::rt_deliver_throwable as usize);
            a.mov_rr(Reg::Rax, Reg::R15);
            a.pop(Reg::R13);
            a.pop(Reg::R14);
            a.pop(Reg::R15);
            a.add_ri32(Reg::Rsp, 16);
            a.ret();
        }

        // ---- OSR preludes ----
        // Locals are already live when control enters here: rebuild
        // the frame record and continue at the loop header.
        for &pc in &loops {
            osr.push((pc, a.pos() as u32));
            prologue(&mut a);
            a.jmp_back(pc_offsets[pc as usize]);
        }

        // ---- entry thunk (stub dispatch) ----
        // Entered by jmp from enter-func: [rsp] = return-to-parent.
        thunk_off = a.pos();
        a.mov_ri64(Reg::R10, cell as u64);
        a.mov_rm(Reg::R11, Reg::R10, 0);
        a.mov_rm(Reg::Rsi, Reg::R11, off_vsp);
        a.lea(Reg::Rdi, Reg::Rsi, -(nparams * slot));
        a.sub_ri32(Reg::Rsp, 8); // call-site alignment
        a.call_back(entry_off);
        a.add_ri32(Reg::Rsp, 8);
        a.mov_ri64(Reg::R10, cell as u64);
        a.mov_rm(Reg::R11, Reg::R10, 0);
        a.mov_mr(Reg::R11, off_vsp, Reg::Rax);
        a.mov_rr(Reg::R15, Reg::Rax);
        a.ret(); // → return-to-parent
    }

    buf.finalize().ok()?;
    let base = buf.entry() as usize;

    Some(Rc::new(CompiledCode {
        entry: (base + entry_off) as *const u8,
        entry_thunk: (base + thunk_off) as *const u8,
        osr,
        ret_pcs,
        frame_size: crate::frames::FRAME_SIZE as u32,
        func: Rc::as_ptr(func),
        buf,
    }))
}

/// Compile, register the code region, and install the result on the
/// declaration so subsequent calls enter the compiled tier.
pub(crate) fn compile_and_install(
    engine: &mut Engine,
    instance: &Instance,
    func: &Rc<WasmFunction>,
) -> Option<Rc<CompiledCode>> {
    let code = compile(engine, instance, func)?;
    let (start, end) = code.range();
    engine
        .regions
        .register(start, end, CodeRegionKind::Spc(Rc::clone(&code)));
    func.decl.compiled.borrow_mut().replace(Rc::clone(&code));
    func.decl.target_code.set(code.entry_thunk);
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::Linker;
    use crate::module::{FuncDecl, ModuleBuilder, SigDecl};
    use crate::value::{Value, ValueRep};

    fn wasm_func(
        params: usize,
        results: usize,
        locals: usize,
        body: Vec<Instr>,
    ) -> Rc<WasmFunction> {
        let sig = Rc::new(SigDecl {
            params: vec![ValType::I32; params],
            results: vec![ValType::I32; results],
        });
        Rc::new(WasmFunction {
            name: "compiled".into(),
            index: 0,
            decl: Rc::new(FuncDecl::new(sig, vec![ValType::I32; locals], body)),
        })
    }

    fn empty_instance(engine: &Engine) -> Instance {
        let module = ModuleBuilder::new().finish();
        Linker::new().instantiate(engine, &module).unwrap()
    }

    /// Lay out tagged i32 slots and call a compiled body directly.
    fn call_body(code: &CompiledCode, args: &[i32], results: usize) -> Vec<i32> {
        let rep = ValueRep::TAGGED;
        let slot_words = rep.slot_size() / 8;
        let mut area = vec![0u64; 64 * slot_words];
        for (i, v) in args.iter().enumerate() {
            area[i * slot_words] = crate::value::TypeCode::I32 as u64;
            area[i * slot_words + 1] = *v as u32 as u64;
        }
        let locals = area.as_mut_ptr() as *mut u8;
        let vsp = unsafe { locals.add(args.len() * rep.slot_size()) };
        let f: extern "C" fn(*mut u8, *mut u8) -> *mut u8 =
            unsafe { std::mem::transmute(code.entry) };
        let out_vsp = f(locals, vsp);
        assert_eq!(
            out_vsp as usize - locals as usize,
            results * rep.slot_size(),
            "returned vsp must sit above the results"
        );
        (0..results)
            .map(|k| area[k * slot_words + 1] as u32 as i32)
            .collect()
    }

    #[test]
    fn compiles_and_runs_add() {
        let engine = Engine::default();
        let instance = empty_instance(&engine);
        let f = wasm_func(
            2,
            1,
            0,
            vec![Instr::LocalGet(0), Instr::LocalGet(1), Instr::I32Add, Instr::Return],
        );
        let code = compile(&engine, &instance, &f).expect("subset function compiles");
        assert_eq!(call_body(&code, &[40, 2], 1), vec![42]);
        assert_eq!(call_body(&code, &[-5, 3], 1), vec![-2]);
    }

    #[test]
    fn compiles_counted_loop_with_osr_entry() {
        let engine = Engine::default();
        let instance = empty_instance(&engine);
        // acc/i locals; sum 0..n.
        let body = vec![
            Instr::Loop,          // 0
            Instr::LocalGet(2),   // 1: i
            Instr::LocalGet(0),   // 2: n
            Instr::I32GeS,        // 3
            Instr::BrIf(14),      // 4: exit
            Instr::LocalGet(1),   // 5: acc
            Instr::LocalGet(2),   // 6
            Instr::I32Add,        // 7
            Instr::LocalSet(1),   // 8
            Instr::LocalGet(2),   // 9
            Instr::I32Const(1),   // 10
            Instr::I32Add,        // 11
            Instr::LocalSet(2),   // 12
            Instr::Br(0),         // 13
            Instr::LocalGet(1),   // 14
            Instr::Return,        // 15
        ];
        let f = wasm_func(1, 1, 2, body);
        let code = compile(&engine, &instance, &f).expect("loop compiles");
        assert_eq!(call_body(&code, &[10], 1), vec![45]);
        assert_eq!(call_body(&code, &[0], 1), vec![0]);
        // One loop header, one OSR entry, inside the emitted range.
        assert_eq!(code.osr_entries().len(), 1);
        assert_eq!(code.osr_entries()[0].0, 0);
        let (start, end) = code.range();
        let prelude = start + code.osr_entries()[0].1 as usize;
        assert!(prelude > start && prelude < end);
    }

    #[test]
    fn unsupported_bodies_stay_interpreted() {
        let engine = Engine::default();
        let instance = empty_instance(&engine);
        let f = wasm_func(0, 1, 0, vec![Instr::I64Const(1), Instr::Return]);
        assert!(compile(&engine, &instance, &f).is_none());
        // Runtime escapes bail when the instance lacks their resource.
        let f = wasm_func(0, 0, 0, vec![Instr::GlobalGet(0), Instr::Drop, Instr::Return]);
        assert!(compile(&engine, &instance, &f).is_none());
        let f = wasm_func(0, 1, 0, vec![Instr::I32Const(1), Instr::MemoryGrow(0), Instr::Return]);
        assert!(compile(&engine, &instance, &f).is_none());
        // Non-empty operand stack at a loop header defeats OSR.
        let f = wasm_func(
            0,
            1,
            0,
            vec![Instr::I32Const(1), Instr::Loop, Instr::Return],
        );
        assert!(compile(&engine, &instance, &f).is_none());
    }

    #[test]
    fn pc_reconstruction_maps_osr_offsets() {
        let engine = Engine::default();
        let instance = empty_instance(&engine);
        let body = vec![
            Instr::Loop,
            Instr::LocalGet(0),
            Instr::I32Eqz,
            Instr::BrIf(5),
            Instr::Br(0),
            Instr::Return,
        ];
        let f = wasm_func(1, 0, 0, body);
        let code = compile(&engine, &instance, &f).expect("compiles");
        let (start, _) = code.range();
        let (pc, off) = code.osr_entries()[0];
        assert_eq!(code.pc_for_return(start + off as usize), Some(pc));
        assert_eq!(code.pc_for_return(start), None, "entry is not a frame ra");
    }

    #[test]
    fn runtime_escapes_execute_through_the_abi() {
        let mut mb = ModuleBuilder::new();
        mb.memory(1, None);
        mb.global(ValType::I32, true, Value::I32(5));
        let module = mb.finish();
        let mut engine = Engine::default();
        let mut instance = Linker::new().instantiate(&engine, &module).unwrap();
        let f = wasm_func(
            0,
            2,
            0,
            vec![
                Instr::GlobalGet(0),
                Instr::I32Const(2),
                Instr::I32Add,
                Instr::GlobalSet(0),
                Instr::GlobalGet(0),
                Instr::I32Const(3),
                Instr::MemoryGrow(0),
                Instr::Return,
            ],
        );
        let code = compile_and_install(&mut engine, &instance, &f).expect("escapes compile");
        assert!(!code.ret_pcs.is_empty(), "runtime call sites are recorded");

        // Execute on a real stack object so the routines see live
        // state through the published current stack.
        let mut stack = StackObject::new(ValueRep::TAGGED, 256 * 1024, 16);
        stack.engine = &mut engine as *mut Engine;
        stack.instance = &mut instance as *mut Instance;
        crate::stubs::set_current_stack(&mut *stack);
        let base = stack.values.base();
        let body: extern "C" fn(*mut u8, *mut u8) -> *mut u8 =
            unsafe { std::mem::transmute(code.entry) };
        let out = body(base, base);
        stack.values.set_vsp(out);
        crate::stubs::set_current_stack(std::ptr::null_mut());

        assert!(stack.thrown.is_none());
        let results = stack.values.pop_n(&[ValType::I32, ValType::I32]).unwrap();
        assert_eq!(results, vec![Value::I32(7), Value::I32(1)]);
        assert_eq!(instance.global(0).unwrap().value, Value::I32(7));
        assert_eq!(instance.memory(0).unwrap().size_pages(), 4);
    }

    #[test]
    fn compiled_unreachable_unwinds_through_deliver() {
        let mut engine = Engine::default();
        let mut instance = empty_instance(&engine);
        let f = wasm_func(0, 0, 0, vec![Instr::Unreachable]);
        let code = compile_and_install(&mut engine, &instance, &f).expect("compiles");

        let mut stack = StackObject::new(ValueRep::TAGGED, 256 * 1024, 16);
        stack.engine = &mut engine as *mut Engine;
        stack.instance = &mut instance as *mut Instance;
        crate::stubs::set_current_stack(&mut *stack);
        let base = stack.values.base();
        let body: extern "C" fn(*mut u8, *mut u8) -> *mut u8 =
            unsafe { std::mem::transmute(code.entry) };
        let out = body(base, base);
        stack.values.set_vsp(out);
        crate::stubs::set_current_stack(std::ptr::null_mut());

        let t = stack.thrown.take().expect("throwable delivered on unwind");
        assert!(t.is_trap(crate::trap::TrapReason::Unreachable));
        assert_eq!(t.trace.len(), 1, "the compiled frame walks");
        assert_eq!(t.trace[0].name(), "compiled");
        assert_eq!(t.trace[0].pc(), Some(0));
    }
}
