pub mod code_buffer;
pub mod x86_64;

pub use code_buffer::CodeBuffer;
pub use x86_64::{Asm, Cond, Fixup, Reg};
