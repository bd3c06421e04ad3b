//! Generated stack-switch thunks and the current-stack cell.
//!
//! Three thunks are emitted once at engine initialization:
//!
//! - `resume(stack, bottom)` — publish `stack` as current, save the
//!   host machine sp into `bottom.parent_rsp`, install the stack's
//!   native sp and VSP, and `ret` into the pre-pushed `enter-func`
//!   address.
//! - `enter-func` — dispatch the pending function: Wasm jumps to the
//!   declaration's `target_code`; host stashes the machine sp and
//!   calls the host-call helper, looping back for host→Wasm tail
//!   calls.
//! - `return-to-parent` — the deepest return address on every stack;
//!   spills VSP and returns control to the host caller (the
//!   parent-to-parent value copy is reserved; only the null-parent
//!   path is fully implemented).
//!
//! A fourth thunk, the interpreter trampoline, bridges into the Rust
//! interpreter: it records the wasm-side sp, switches back to the host
//! machine stack for the Rust code, and restores the wasm sp on the
//! way out. A few marker bytes emitted last give interpreter frame
//! records a classifiable return address.
//!
//! Register conventions: VSP lives in `r15` while Wasm code runs;
//! `r10`/`r11` are scratch. The resume stub saves all callee-saved
//! registers on the host stack and `return-to-parent` restores them.

use std::cell::UnsafeCell;

use weft_codegen::{Asm, CodeBuffer, Cond, Reg};

use crate::frames::{CodeRegionKind, CodeRegionMap, FRAME_SIZE};
use crate::module::FuncDecl;
use crate::stack::object::StackObject;

/// Pointer to the stack currently executing on this thread.
///
/// Execution is single-threaded cooperative: exactly one stack is
/// RUNNING at any moment, and only stub code and the runtime touch
/// this cell. An engine is confined to its creating thread (its types
/// are not `Send`), so the cell lives in TLS and generated code bakes
/// the owning thread's cell address as an immediate.
struct CurrentStackCell(UnsafeCell<*mut StackObject>);

thread_local! {
    static CURRENT_STACK: CurrentStackCell =
        const { CurrentStackCell(UnsafeCell::new(std::ptr::null_mut())) };
}

/// The stack designated as currently executing, or null.
pub(crate) fn current_stack() -> *mut StackObject {
    CURRENT_STACK.with(|c| unsafe { *c.0.get() })
}

/// Re-publish a stack pointer. Host callbacks may resume other stacks;
/// callers restore their own stack from a saved pointer afterwards —
/// no one may assume the cell is stable across a host invocation.
pub(crate) fn set_current_stack(stack: *mut StackObject) {
    CURRENT_STACK.with(|c| unsafe { *c.0.get() = stack })
}

pub(crate) fn current_stack_cell_addr() -> usize {
    CURRENT_STACK.with(|c| c.0.get() as usize)
}

/// The generated thunks.
pub(crate) struct StackStubs {
    #[allow(dead_code)]
    buf: CodeBuffer,
    pub(crate) resume: *const u8,
    pub(crate) enter_func: *const u8,
    pub(crate) return_parent: *const u8,
    pub(crate) interp_tramp: *const u8,
    /// Return-address marker written into interpreter frame records.
    pub(crate) interp_marker: *const u8,
    stub_range: (usize, usize),
    marker_range: (usize, usize),
}

impl StackStubs {
    /// Emit all thunks. `interp_entry` and `call_host2` are the
    /// addresses of the runtime's `extern "C"` entry points.
    pub(crate) fn generate(
        interp_entry: usize,
        call_host2: usize,
    ) -> Result<StackStubs, anyhow::Error> {
        let cell = current_stack_cell_addr();
        let off_vsp = StackObject::off_vsp() as i32;
        let off_rsp = StackObject::off_rsp() as i32;
        let off_parent = StackObject::off_parent() as i32;
        let off_parent_rsp = StackObject::off_parent_rsp() as i32;
        let off_kind = StackObject::off_func_kind() as i32;
        let off_decl = StackObject::off_func_decl() as i32;
        let off_host = StackObject::off_func_host() as i32;
        let off_target = FuncDecl::target_code_offset() as i32;

        let mut buf = CodeBuffer::new(4096)?;
        let base = buf.entry() as usize;

        let (resume_off, enter_off, return_off, tramp_off, marker_off);
        {
            let mut a = Asm::new(&mut buf);

            // ---- resume(rdi = stack, rsi = bottom) ----
            // Entry: rsp % 16 == 8 (normal call).
            resume_off = a.pos();
            a.push(Reg::Rbp);
            a.push(Reg::Rbx);
            a.push(Reg::R12);
            a.push(Reg::R13);
            a.push(Reg::R14);
            a.push(Reg::R15);
            a.mov_ri64(Reg::R10, cell as u64);
            a.mov_mr(Reg::R10, 0, Reg::Rdi); // currentStack = stack
            a.mov_mr(Reg::Rsi, off_parent_rsp, Reg::Rsp); // bottom.parent_rsp = host sp
            a.mov_mi(Reg::Rsi, off_parent, 0); // bottom.parent = null
            a.mov_rm(Reg::R15, Reg::Rdi, off_vsp); // VSP
            a.mov_rm(Reg::Rsp, Reg::Rdi, off_rsp); // switch stacks
            a.ret(); // pops the enter-func slot

            // ---- enter-func ----
            // Entry: rsp points at the return-to-parent slot; % 16 == 8.
            enter_off = a.pos();
            let dispatch = a.pos();
            a.mov_ri64(Reg::R10, cell as u64);
            a.mov_rm(Reg::R11, Reg::R10, 0);
            a.mov_rm(Reg::Rax, Reg::R11, off_kind);
            a.test_rr(Reg::Rax, Reg::Rax);
            let host = a.jcc_fwd(Cond::Ne);
            // Wasm: spill VSP, enter via the declaration's target code.
            a.mov_mr(Reg::R11, off_vsp, Reg::R15);
            a.mov_rm(Reg::Rax, Reg::R11, off_decl);
            a.mov_rm(Reg::Rax, Reg::Rax, off_target);
            a.jmp_r(Reg::Rax);
            // Host: stash sp - 8, call the helper on this stack.
            a.bind(host);
            a.mov_mr(Reg::R11, off_vsp, Reg::R15);
            a.lea(Reg::Rax, Reg::Rsp, -8);
            a.mov_mr(Reg::R11, off_rsp, Reg::Rax);
            a.mov_rm(Reg::Rdi, Reg::R11, off_host);
            a.sub_ri32(Reg::Rsp, 8); // call-site alignment
            a.call_abs(Reg::Rax, call_host2);
            a.add_ri32(Reg::Rsp, 8);
            // The helper may have switched stacks: reload everything.
            a.mov_ri64(Reg::R10, cell as u64);
            a.mov_rm(Reg::R11, Reg::R10, 0);
            a.mov_rm(Reg::R15, Reg::R11, off_vsp);
            a.test_rr(Reg::Rax, Reg::Rax);
            a.jcc_back(Cond::Ne, dispatch); // host→Wasm tail call
            a.ret(); // → return-to-parent

            // ---- return-to-parent ----
            // Entry: both bootstrap slots consumed; rsp == range.end.
            return_off = a.pos();
            a.mov_ri64(Reg::R10, cell as u64);
            a.mov_rm(Reg::R11, Reg::R10, 0);
            a.mov_mr(Reg::R11, off_vsp, Reg::R15); // store live VSP back
            a.mov_rm(Reg::Rdx, Reg::R11, off_parent);
            a.test_rr(Reg::Rdx, Reg::Rdx);
            let to_parent = a.jcc_fwd(Cond::Ne);
            // Null parent: restore the host machine stack and return to
            // the original caller of the resume stub.
            a.mov_rm(Reg::Rsp, Reg::R11, off_parent_rsp);
            a.mov_mi(Reg::R11, off_parent_rsp, 0);
            a.pop(Reg::R15);
            a.pop(Reg::R14);
            a.pop(Reg::R13);
            a.pop(Reg::R12);
            a.pop(Reg::Rbx);
            a.pop(Reg::Rbp);
            a.ret();
            // Non-null parent: value copy across the boundary is
            // reserved; hand the machine back to the parent as-is.
            a.bind(to_parent);
            a.mov_mr(Reg::R10, 0, Reg::Rdx); // currentStack = parent
            a.mov_rm(Reg::Rsp, Reg::R11, off_parent_rsp);
            a.mov_mi(Reg::R11, off_parent, 0);
            a.mov_mi(Reg::R11, off_parent_rsp, 0);
            a.ret();

            // ---- interpreter trampoline ----
            // Entry via jmp from enter-func; [rsp] = return-to-parent.
            tramp_off = a.pos();
            a.mov_ri64(Reg::R10, cell as u64);
            a.mov_rm(Reg::R11, Reg::R10, 0);
            a.mov_mr(Reg::R11, off_rsp, Reg::Rsp); // remember the wasm-side sp
            // The Rust interpreter runs on the host machine stack; frame
            // records and wasm state stay on the mapping.
            a.mov_rm(Reg::Rsp, Reg::R11, off_parent_rsp);
            a.sub_ri32(Reg::Rsp, 8); // call-site alignment
            a.call_abs(Reg::Rax, interp_entry);
            a.add_ri32(Reg::Rsp, 8);
            a.mov_ri64(Reg::R10, cell as u64);
            a.mov_rm(Reg::R11, Reg::R10, 0);
            a.mov_rm(Reg::Rsp, Reg::R11, off_rsp); // back onto the wasm stack
            a.mov_rm(Reg::R15, Reg::R11, off_vsp);
            a.ret(); // → return-to-parent

            // ---- interpreter marker ----
            marker_off = a.pos();
            a.nop();
            a.nop();
            a.nop();
            a.nop();
        }
        let end = buf.pos();
        buf.finalize()?;

        Ok(StackStubs {
            resume: (base + resume_off) as *const u8,
            enter_func: (base + enter_off) as *const u8,
            return_parent: (base + return_off) as *const u8,
            interp_tramp: (base + tramp_off) as *const u8,
            interp_marker: (base + marker_off) as *const u8,
            stub_range: (base, base + marker_off),
            marker_range: (base + marker_off, base + end),
            buf,
        })
    }

    /// Register the stub and marker ranges with the walker's map.
    pub(crate) fn register_regions(&self, regions: &mut CodeRegionMap) {
        regions.register(
            self.stub_range.0,
            self.stub_range.1,
            CodeRegionKind::StackStub {
                name: "stack-switch",
                frame_size: FRAME_SIZE,
            },
        );
        regions.register(
            self.marker_range.0,
            self.marker_range.1,
            CodeRegionKind::Interpreter,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn nop_entry() {}
    extern "C" fn nop_host(_f: *const u8) -> *const u8 {
        std::ptr::null()
    }

    #[test]
    fn stubs_generate_distinct_entry_points() {
        let stubs =
            StackStubs::generate(nop_entry as usize, nop_host as usize).unwrap();
        let addrs = [
            stubs.resume as usize,
            stubs.enter_func as usize,
            stubs.return_parent as usize,
            stubs.interp_tramp as usize,
            stubs.interp_marker as usize,
        ];
        for (i, a) in addrs.iter().enumerate() {
            assert!(*a != 0);
            for b in &addrs[i + 1..] {
                assert!(a != b);
            }
        }
    }

    #[test]
    fn regions_classify_stub_and_marker() {
        let stubs =
            StackStubs::generate(nop_entry as usize, nop_host as usize).unwrap();
        let mut map = CodeRegionMap::default();
        stubs.register_regions(&mut map);
        assert!(matches!(
            map.classify(stubs.resume as usize).map(|r| &r.kind),
            Some(CodeRegionKind::StackStub { .. })
        ));
        assert!(matches!(
            map.classify(stubs.return_parent as usize).map(|r| &r.kind),
            Some(CodeRegionKind::StackStub { .. })
        ));
        assert!(matches!(
            map.classify(stubs.interp_marker as usize).map(|r| &r.kind),
            Some(CodeRegionKind::Interpreter)
        ));
    }
}
