//! An embeddable interpreter for the tug scripting language.
//!
//! The runtime is designed to be linked into a host program: the host compiles
//! a script into a [`TaskId`], installs native callbacks as globals, and drives
//! execution through [`Runtime::resume`]. Scripts are dynamically typed with
//! first-class functions, closures, hash tables with metatables, ordered lists,
//! multi-value returns and cooperative pause/resume.
//!
//! ```
//! use tug::Runtime;
//!
//! let mut rt = Runtime::new();
//! let task = rt.compile("demo", "x := 1 + 2 * 3 return x").unwrap();
//! rt.resume(task);
//! let result = rt.result(task);
//! assert_eq!(rt.get_number(result), Some(7.0));
//! ```

mod heap;

mod ast;
mod bytecode;
mod error;
mod lexer;
mod parse;
mod runtime;
mod scope;
pub mod stdlib;
mod task;
pub mod tracer;
mod types;
mod value;
mod vm;

pub use crate::{
    bytecode::{Code, Opcode},
    error::CompileError,
    heap::{GcTuning, HeapId},
    runtime::{NativeCtx, NativeError, NativeFn, NativeResult, Runtime, TaskId},
    task::TaskState,
    tracer::{NoopTracer, StderrTracer, VmTracer},
    value::{Value, ValueType},
};
