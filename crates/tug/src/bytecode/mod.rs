//! Bytecode representation, emission and compilation.
//!
//! - `op` — opcode definitions
//! - `code` — the immutable byte container, shared via `Rc`, plus the
//!   disassembler
//! - `builder` — emission helpers with forward-jump patching
//! - `compiler` — the single-pass AST walk

mod builder;
mod code;
mod compiler;
mod op;

pub(crate) use builder::CodeBuilder;
pub(crate) use code::{ADDR_SIZE, NUM_SIZE};
pub(crate) use compiler::compile_program;

pub use code::Code;
pub use op::Opcode;
