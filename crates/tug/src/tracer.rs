//! VM execution tracing infrastructure.
//!
//! The [`VmTracer`] trait defines hook points at key execution events
//! (instruction dispatch, call frame push/pop, GC cycles). The runtime holds a
//! boxed tracer chosen by the host; [`NoopTracer`] is the production default,
//! [`StderrTracer`] writes a human-readable execution log for debugging
//! (pairing with [`Code::disassemble`](crate::Code::disassemble) output).

use crate::bytecode::Opcode;

/// Hook points invoked by the VM during execution.
///
/// All methods have empty default bodies so implementations only override the
/// events they care about.
pub trait VmTracer {
    /// An opcode was dispatched at the given instruction pointer.
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize) {
        let _ = (ip, opcode, stack_depth);
    }

    /// A call pushed a new frame; `depth` is the frame count after the push.
    fn on_call(&mut self, name: &str, depth: usize) {
        let _ = (name, depth);
    }

    /// A frame was popped; `depth` is the frame count after the pop.
    fn on_return(&mut self, depth: usize) {
        let _ = depth;
    }

    /// A garbage collection cycle finished.
    fn on_gc(&mut self, live_bytes: usize, new_threshold: usize) {
        let _ = (live_bytes, new_threshold);
    }
}

/// Zero-cost tracer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Tracer that logs every event to stderr.
///
/// Intended for interactive debugging of scripts or of the VM itself; the
/// output volume makes it unsuitable for anything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize) {
        eprintln!("[tug] {ip:>6} {opcode} (stack {stack_depth})");
    }

    fn on_call(&mut self, name: &str, depth: usize) {
        eprintln!("[tug] call {name} (depth {depth})");
    }

    fn on_return(&mut self, depth: usize) {
        eprintln!("[tug] return (depth {depth})");
    }

    fn on_gc(&mut self, live_bytes: usize, new_threshold: usize) {
        eprintln!("[tug] gc: {live_bytes} bytes live, next threshold {new_threshold}");
    }
}
