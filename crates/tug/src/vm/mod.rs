//! The bytecode interpreter.
//!
//! Stack-based, one opcode per loop iteration. The collector runs lazily at
//! the top of each iteration — only at instruction boundaries, so a native
//! callback's allocations stay live until it returns or reenters the VM.
//! Errors are recorded on the task and unwound
//! immediately by [`Runtime::raise`]; the [`ErrorSignal`] token then
//! propagates out through every nested dispatch level without touching the
//! task again. The loop exits whenever the task leaves `Running` state or the
//! frame stack returns to the caller's depth (reentrant host calls).

mod binary;
mod call;
mod index;
mod iter;

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    bytecode::{Code, Opcode},
    heap::HeapData,
    runtime::Runtime,
    task::{Task, TaskState, TraceRecord},
    types::{List, Str, Table},
    value::Value,
};

/// Marker that an error has been recorded on the task and unwound.
pub(crate) struct ErrorSignal;

pub(crate) type VmResult<T> = Result<T, ErrorSignal>;

impl Runtime {
    /// Runs the task until it leaves `Running` state or its frame stack
    /// drops back to `min_depth` frames.
    pub(crate) fn execute(&mut self, task: &mut Task, min_depth: usize) {
        while task.state == TaskState::Running && task.frames.len() > min_depth {
            if self.gc_pressure() {
                self.collect_garbage(Some(task));
            }
            let ip = task.frame().ip;
            let byte = task.frame_mut().read_byte();
            let op = Opcode::from_byte(byte).expect("compiler emits valid opcodes");
            self.tracer.on_instruction(ip, op, task.stack.len());
            // an Err here means the task is already in Error state and unwound
            let _ = self.dispatch(task, op);
        }
    }

    fn dispatch(&mut self, task: &mut Task, op: Opcode) -> VmResult<()> {
        match op {
            Opcode::Num => {
                let num = task.frame_mut().read_num();
                let value = self.heap.alloc(HeapData::Num(num));
                task.stack.push(value);
            }
            Opcode::Str => {
                let code = frame_code(task);
                let (start, _) = task.frame_mut().read_str_range();
                let (literal, _) = code.str_at(start);
                let value = self.heap.alloc(HeapData::Str(Str::from(literal)));
                task.stack.push(value);
            }
            Opcode::LoadVar => {
                let code = frame_code(task);
                let (start, _) = task.frame_mut().read_str_range();
                let (name, _) = code.str_at(start);
                let value = self.load_var(task, name);
                task.stack.push(value);
            }
            Opcode::True => task.stack.push(Value::TRUE),
            Opcode::False => task.stack.push(Value::FALSE),
            Opcode::Nil => task.stack.push(Value::NIL),

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Gt
            | Opcode::Lt
            | Opcode::Ge
            | Opcode::Le
            | Opcode::Eq
            | Opcode::Ne => self.binary_op(task, op)?,

            Opcode::Pos | Opcode::Neg | Opcode::Not => self.unary_op(task, op)?,

            Opcode::Pop => {
                let count = task.frame_mut().read_addr();
                for _ in 0..count {
                    self.pop_value(task);
                }
            }
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                let target = task.frame_mut().read_addr();
                let pushback = task.frame_mut().read_byte() == 1;
                let value = self.pop_value(task);
                let truthy = self.heap.truthy(value);
                if truthy == (op == Opcode::JumpIfTrue) {
                    task.frame_mut().ip = target;
                }
                if pushback {
                    task.stack.push(value);
                }
            }
            Opcode::Jump => {
                let target = task.frame_mut().read_addr();
                task.frame_mut().ip = target;
            }

            Opcode::Store => {
                let code = frame_code(task);
                let local = task.frame_mut().read_byte() == 1;
                let count = task.frame_mut().read_addr();
                for _ in 0..count {
                    let (start, _) = task.frame_mut().read_str_range();
                    let (name, _) = code.str_at(start);
                    let value = self.pop_value(task);
                    self.store_var(task, name, value, local);
                }
            }
            Opcode::PushClosure => {
                let top = task.scope_stack.last_mut().expect("scope stack underflow");
                *top = self.scopes.alloc(Some(*top));
            }
            Opcode::PopClosure => {
                let top = task.scope_stack.last_mut().expect("scope stack underflow");
                *top = self.scopes.outer(*top).expect("block scope has an outer scope");
            }
            Opcode::ScopePopJump => {
                let count = task.frame_mut().read_addr();
                let target = task.frame_mut().read_addr();
                for _ in 0..count {
                    let top = task.scope_stack.last_mut().expect("scope stack underflow");
                    *top = self.scopes.outer(*top).expect("block scope has an outer scope");
                }
                task.frame_mut().ip = target;
            }

            Opcode::FuncDef => self.op_funcdef(task)?,
            Opcode::Call => {
                let argc = task.frame_mut().read_addr();
                let line = task.frame_mut().read_addr();
                task.frame_mut().line = line;
                let mut args: SmallVec<[Value; 4]> =
                    (0..argc).map(|_| self.pop_value(task)).collect();
                args.reverse();
                let callee = self.pop_value(task);
                self.push_call(task, callee, args, false)?;
            }
            Opcode::Tuple => {
                let count = task.frame_mut().read_addr();
                let mut rev: Vec<Value> = Vec::with_capacity(count);
                for _ in 0..count {
                    let value = self.pop_raw(task);
                    match self.heap.tuple_items(value) {
                        Some(items) => rev.extend(items.iter().rev().copied()),
                        None => rev.push(value),
                    }
                }
                rev.reverse();
                let tuple = self.heap.alloc(HeapData::Tuple(rev));
                task.stack.push(tuple);
            }

            Opcode::Table => {
                let value = self.heap.alloc(HeapData::Table(Table::new()));
                task.stack.push(value);
            }
            Opcode::SetIndex => {
                let line = task.frame_mut().read_addr();
                task.frame_mut().line = line;
                let pushback = task.frame_mut().read_byte() == 1;
                let value = self.pop_value(task);
                let key = self.pop_value(task);
                let obj = self.pop_value(task);
                self.index_set(task, obj, key, value)?;
                if pushback {
                    task.stack.push(obj);
                }
            }
            Opcode::GetIndex => {
                let line = task.frame_mut().read_addr();
                task.frame_mut().line = line;
                let key = self.pop_value(task);
                let obj = self.pop_value(task);
                let value = self.index_get(task, obj, key)?;
                task.stack.push(value);
            }

            Opcode::MultiAssign => self.op_multiassign(task)?,
            Opcode::Iter => self.op_iter(task)?,
            Opcode::Next => self.op_next(task)?,

            Opcode::List => {
                let count = task.frame_mut().read_addr();
                let mut items: Vec<Value> = (0..count).map(|_| self.pop_value(task)).collect();
                items.reverse();
                let value = self.heap.alloc(HeapData::List(List::from_items(items)));
                task.stack.push(value);
            }

            Opcode::Halt => self.op_halt(task),
        }
        Ok(())
    }

    /// Return protocol: pop the frame, record its value as the parent's
    /// pending return (leaving it on the stack), clear the parent's
    /// protection. The last frame ending moves the task to `Ended` and stores
    /// the script's result.
    fn op_halt(&mut self, task: &mut Task) {
        task.frames.pop();
        task.scope_stack.pop();
        let ret = self.peek_raw(task);
        match task.frames.last_mut() {
            Some(parent) => {
                parent.ret = ret;
                parent.protected = false;
            }
            None => {
                task.result = ret;
                task.state = TaskState::Ended;
            }
        }
        self.tracer.on_return(task.frames.len());
    }

    // ----- error machinery -------------------------------------------------

    /// Records a runtime error and unwinds. Always returns `Err`, so error
    /// sites read `return self.raise(task, …)`.
    pub(crate) fn raise<T>(&mut self, task: &mut Task, message: String) -> VmResult<T> {
        task.message = message;
        task.state = TaskState::Error;
        self.unwind(task);
        Err(ErrorSignal)
    }

    /// Pops frames until the first protected one, truncating the operand and
    /// scope stacks to each frame's entry depths and accumulating traceback
    /// records. A protected frame absorbs the error: its flag clears, the
    /// traceback is discarded, and the frame survives.
    fn unwind(&mut self, task: &mut Task) {
        while let Some(frame) = task.frames.last_mut() {
            if frame.protected {
                frame.protected = false;
                task.traceback.clear();
                return;
            }
            let frame = task.frames.pop().expect("frame checked above");
            task.stack.truncate(frame.stack_depth);
            task.scope_stack.truncate(frame.scope_depth);
            task.traceback.push(TraceRecord {
                native: frame.is_native(),
                src: frame.src,
                name: frame.name,
                line: frame.line,
            });
        }
    }

    // ----- operand stack ---------------------------------------------------

    /// Pops one stack slot without tuple unwrapping; `nil` at the frame's
    /// floor.
    pub(crate) fn pop_raw(&self, task: &mut Task) -> Value {
        if task.stack.len() <= task.base() {
            Value::NIL
        } else {
            task.stack.pop().unwrap_or(Value::NIL)
        }
    }

    pub(crate) fn peek_raw(&self, task: &Task) -> Value {
        if task.stack.len() <= task.base() {
            Value::NIL
        } else {
            task.stack.last().copied().unwrap_or(Value::NIL)
        }
    }

    /// Pops one value; a tuple collapses to its last element.
    pub(crate) fn pop_value(&self, task: &mut Task) -> Value {
        let value = self.pop_raw(task);
        match self.heap.tuple_items(value) {
            Some(items) => items.last().copied().unwrap_or(Value::NIL),
            None => value,
        }
    }

    pub(crate) fn peek_value(&self, task: &Task) -> Value {
        let value = self.peek_raw(task);
        match self.heap.tuple_items(value) {
            Some(items) => items.last().copied().unwrap_or(Value::NIL),
            None => value,
        }
    }

    /// Pops `n` stack slots into `n` values, spreading tuples from their tail
    /// and padding missing leading values with `nil` — values right-align
    /// against the consumer's slots. The spread never mutates the tuple.
    pub(crate) fn pop_n(&self, task: &mut Task, n: usize) -> SmallVec<[Value; 4]> {
        let mut rev: SmallVec<[Value; 4]> = SmallVec::new();
        for _ in 0..n {
            let value = self.pop_raw(task);
            if rev.len() < n {
                match self.heap.tuple_items(value) {
                    Some(items) => {
                        for &item in items.iter().rev() {
                            if rev.len() >= n {
                                break;
                            }
                            rev.push(item);
                        }
                    }
                    None => rev.push(value),
                }
            }
        }
        while rev.len() < n {
            rev.push(Value::NIL);
        }
        rev.reverse();
        rev
    }

    // ----- variables -------------------------------------------------------

    /// Chain lookup with the global-scope fallback; unknown names read `nil`.
    pub(crate) fn load_var(&self, task: &Task, name: &str) -> Value {
        if let Some(&top) = task.scope_stack.last() {
            if let Some(value) = self.scopes.lookup(top, name) {
                return value;
            }
        }
        self.scopes.lookup(task.global, name).unwrap_or(Value::NIL)
    }

    pub(crate) fn store_var(&mut self, task: &Task, name: &str, value: Value, local: bool) {
        let Some(&top) = task.scope_stack.last() else { return };
        if local {
            self.scopes.declare(top, name, value);
        } else {
            self.scopes.rebind(top, name, value);
        }
    }
}

/// Clones the current frame's code handle so operand strings can be borrowed
/// from it while the task is mutated.
pub(crate) fn frame_code(task: &Task) -> Rc<Code> {
    Rc::clone(task.frame().code.as_ref().expect("bytecode frame"))
}
