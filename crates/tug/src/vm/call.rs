//! Calls, returns and reentrant host calls.
//!
//! Scripted calls push a frame plus a parameter scope chained to the
//! function's captured definition chain; the main loop then runs the body in
//! place. Native calls run synchronously inside the `Call` instruction — the
//! collector never interleaves — with a catch-style error boundary: the
//! callback returns a [`NativeError`](crate::NativeError) and the VM turns it
//! into a normal unwind.

use std::rc::Rc;

use smallvec::SmallVec;

use super::{ErrorSignal, VmResult, frame_code};
use crate::{
    bytecode::Code,
    heap::{FuncKind, Function, HeapData},
    runtime::{CALL_LIMIT, NativeCtx, NativeFn, Runtime},
    scope::ScopeId,
    task::{Frame, Task, TaskState},
    types::Str,
    value::Value,
};

enum Callee {
    Script {
        src: Rc<str>,
        name: Rc<str>,
        params: Rc<[Box<str>]>,
        code: Rc<Code>,
        upper: Option<ScopeId>,
    },
    Native {
        name: Rc<str>,
        f: NativeFn,
    },
}

impl Runtime {
    /// Begins a call: resolves `__call`, enforces the depth limit, pushes the
    /// callee frame. Scripted bodies are left for the main loop; natives run
    /// to completion here.
    pub(crate) fn push_call(
        &mut self,
        task: &mut Task,
        callee: Value,
        mut args: SmallVec<[Value; 4]>,
        protected: bool,
    ) -> VmResult<()> {
        if let Some(frame) = task.frames.last_mut() {
            frame.protected = protected;
        }

        let mut target = callee;
        let mut via_call_hook = false;
        if self.heap.table_id(target).is_some() && !self.heap.metatable_of(target).is_nil() {
            via_call_hook = true;
            args.insert(0, target);
            let hook = self.heap.meta_field(target, "__call");
            if !hook.is_nil() {
                target = hook;
            }
        }

        let resolved = match target {
            Value::Ref(id) => match self.heap.data(id) {
                HeapData::Func(Function { src, name, kind }) => match kind {
                    FuncKind::Script { params, code, upper } => Some(Callee::Script {
                        src: Rc::clone(src),
                        name: Rc::clone(name),
                        params: Rc::clone(params),
                        code: Rc::clone(code),
                        upper: *upper,
                    }),
                    FuncKind::Native(f) => {
                        Some(Callee::Native { name: Rc::clone(name), f: Rc::clone(f) })
                    }
                },
                _ => None,
            },
            _ => None,
        };
        let Some(resolved) = resolved else {
            let got = self.heap.type_name(target);
            return if via_call_hook {
                self.raise(task, format!("metamethod '__call' must be 'func', got '{got}'"))
            } else {
                self.raise(task, format!("unable to call '{got}'"))
            };
        };

        if task.frames.len() >= CALL_LIMIT {
            return self.raise(task, "stack overflow".to_string());
        }

        match resolved {
            Callee::Script { src, name, params, code, upper } => {
                let env = self.scopes.alloc(upper);
                for (i, param) in params.iter().enumerate() {
                    let value = args.get(i).copied().unwrap_or(Value::NIL);
                    self.scopes.declare(env, param, value);
                }
                self.tracer.on_call(&name, task.frames.len() + 1);
                let frame = Frame::new(
                    src,
                    name,
                    Some(code),
                    task.scope_stack.len(),
                    task.stack.len(),
                    args,
                );
                task.scope_stack.push(env);
                task.frames.push(frame);
            }
            Callee::Native { name, f } => {
                self.tracer.on_call(&name, task.frames.len() + 1);
                let frame = Frame::new(
                    Rc::from("[C]"),
                    name,
                    None,
                    task.scope_stack.len(),
                    task.stack.len(),
                    args,
                );
                task.frames.push(frame);

                let result = f(&mut NativeCtx { rt: self, task });
                match result {
                    Ok(()) => {
                        if task.state == TaskState::Running {
                            let ret = task.frames.pop().expect("native frame").ret;
                            task.stack.push(ret);
                            self.tracer.on_return(task.frames.len());
                        }
                        // on pause the frame stays pending; the next resume
                        // completes it
                    }
                    Err(e) => {
                        if let Some(message) = e.message {
                            return self.raise(task, message);
                        }
                        // a propagated reentrant failure was already recorded
                        // and unwound
                        return Err(ErrorSignal);
                    }
                }
            }
        }
        Ok(())
    }

    /// Completes a native frame left pending by a pause, pushing its return
    /// value so the parent resumes past the call.
    pub(crate) fn finish_pending_native(&mut self, task: &mut Task) {
        if task.frames.last().is_some_and(Frame::is_native) {
            let ret = task.frames.pop().expect("pending native frame").ret;
            task.stack.push(ret);
            self.tracer.on_return(task.frames.len());
        }
    }

    /// Calls a hook or function and drives the VM until that call returns,
    /// yielding the raw stacked result (possibly a tuple).
    pub(crate) fn call_to_completion(
        &mut self,
        task: &mut Task,
        func: Value,
        args: SmallVec<[Value; 4]>,
    ) -> VmResult<Value> {
        let depth = task.frames.len();
        self.push_call(task, func, args, false)?;
        if task.frames.len() > depth && task.state == TaskState::Running {
            self.execute(task, depth);
        }
        if task.state == TaskState::Error {
            return Err(ErrorSignal);
        }
        Ok(self.pop_raw(task))
    }

    /// Reentrant call used by the host API: drives nested frames until the
    /// invoked function halts and hands back its return value.
    pub(crate) fn call_impl(
        &mut self,
        task: &mut Task,
        func: Value,
        args: &[Value],
        protected: bool,
    ) -> VmResult<Value> {
        let entry_state = task.state;
        if matches!(entry_state, TaskState::Ended | TaskState::Error) {
            return Ok(Value::NIL);
        }
        task.state = TaskState::Running;

        let depth = task.frames.len();
        self.push_call(task, func, Self::args_from(args), protected)?;
        if task.frames.len() > depth && task.state == TaskState::Running {
            self.execute(task, depth);
        }
        if task.state == TaskState::Error {
            return Err(ErrorSignal);
        }
        let value = self.pop_raw(task);
        if task.state == TaskState::Running {
            task.state = entry_state;
        }
        Ok(value)
    }

    // ----- function definition ---------------------------------------------

    /// Builds a function value from an embedded body. Multi-part names
    /// (`func a.b.c()`) walk the dotted path and assign through `__set`;
    /// single names and anonymous literals leave the value on the stack.
    pub(crate) fn op_funcdef(&mut self, task: &mut Task) -> VmResult<()> {
        let code = frame_code(task);
        let line = task.frame_mut().read_addr();
        task.frame_mut().line = line;

        let namec = task.frame_mut().read_addr();
        let mut name_parts: Vec<&str> = Vec::with_capacity(namec);
        for _ in 0..namec {
            let (start, _) = task.frame_mut().read_str_range();
            name_parts.push(code.str_at(start).0);
        }

        let paramc = task.frame_mut().read_addr();
        let mut params: Vec<Box<str>> = Vec::with_capacity(paramc);
        for _ in 0..paramc {
            let (start, _) = task.frame_mut().read_str_range();
            params.push(code.str_at(start).0.into());
        }
        let body = Rc::new(task.frame_mut().read_code());

        // resolve the holder for a dotted assignment before building the value
        let mut holder = Value::NIL;
        if namec > 1 {
            holder = self.load_var(task, name_parts[0]);
            for &part in &name_parts[1..namec - 1] {
                holder = self.path_get(task, holder, part)?;
            }
        }

        let display: Rc<str> = if namec == 0 {
            Rc::from("<anonymous>")
        } else {
            Rc::from(name_parts.join("."))
        };
        let upper = task.scope_stack.last().copied();
        let func = self.heap.alloc(HeapData::Func(Function {
            src: Rc::clone(&task.frame().src),
            name: display,
            kind: FuncKind::Script { params: params.into(), code: body, upper },
        }));

        if namec > 1 {
            let last = name_parts[namec - 1];
            self.path_set(task, holder, last, func)?;
        } else {
            task.stack.push(func);
        }
        Ok(())
    }

    /// `__get`-aware read of a dotted-path segment.
    fn path_get(&mut self, task: &mut Task, obj: Value, part: &str) -> VmResult<Value> {
        let hook = self.heap.meta_field(obj, "__get");
        if !hook.is_nil() {
            let key = self.heap.alloc(HeapData::Str(Str::from(part)));
            let raw = self.call_to_completion(task, hook, SmallVec::from_slice(&[obj, key]))?;
            return Ok(match self.heap.tuple_items(raw) {
                Some(items) => items.first().copied().unwrap_or(Value::NIL),
                None => raw,
            });
        }
        if let Some(table) = self.heap.table_id(obj) {
            return Ok(self.heap.table_get_str(table, part));
        }
        let got = self.heap.type_name(obj);
        self.raise(task, format!("unable to get index '{got}'"))
    }

    /// `__set`-aware write of the final dotted-path segment.
    fn path_set(&mut self, task: &mut Task, obj: Value, part: &str, value: Value) -> VmResult<()> {
        let hook = self.heap.meta_field(obj, "__set");
        if !hook.is_nil() {
            let key = self.heap.alloc(HeapData::Str(Str::from(part)));
            self.call_to_completion(task, hook, SmallVec::from_slice(&[obj, key, value]))?;
            return Ok(());
        }
        if let Some(table) = self.heap.table_id(obj) {
            let key = self.heap.alloc(HeapData::Str(Str::from(part)));
            self.heap.table_set(table, key, value);
            return Ok(());
        }
        let got = self.heap.type_name(obj);
        self.raise(task, format!("unable to set function to field '{got}'"))
    }
}
