//! The host API: runtime lifecycle, value construction and introspection,
//! task control, and the native-callback context.
//!
//! One [`Runtime`] owns the GC heap, the scope arena and every task. Hosts
//! compile scripts into tasks, install native callbacks as globals, and drive
//! execution with [`Runtime::resume`]. Native callbacks receive a
//! [`NativeCtx`] giving argument/return access and reentrant calls back into
//! the VM; their error exit is catch-style — [`NativeCtx::err`] produces a
//! [`NativeError`] that the callback returns early with `?`.

use std::{borrow::Cow, rc::Rc};

use smallvec::SmallVec;

use crate::{
    bytecode::compile_program,
    error::CompileError,
    heap::{self, Function, FuncKind, GcTuning, Heap, HeapData, HeapId},
    parse::parse_program,
    scope::ScopeArena,
    task::{Task, TaskState},
    tracer::{NoopTracer, VmTracer},
    types::{List, Str, Table},
    value::{Value, ValueType},
};

/// Handle to a task owned by a [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u32);

/// Error token returned by native callbacks to unwind into the VM.
///
/// Produced by [`NativeCtx::err`] (fresh failure) or propagated from a failed
/// reentrant [`NativeCtx::call`]. Constructing one does not record anything;
/// returning it from the callback does.
#[derive(Debug)]
pub struct NativeError {
    pub(crate) message: Option<String>,
}

/// Result type for native callbacks.
pub type NativeResult = Result<(), NativeError>;

/// A host function callable from scripts.
pub type NativeFn = Rc<dyn Fn(&mut NativeCtx<'_>) -> NativeResult>;

/// Maximum call-frame depth per task; exceeding it raises `stack overflow`.
pub(crate) const CALL_LIMIT: usize = 1000;

/// Owner of the heap, scopes and tasks of one interpreter instance.
pub struct Runtime {
    pub(crate) heap: Heap,
    pub(crate) scopes: ScopeArena,
    pub(crate) tasks: Vec<Option<Task>>,
    pub(crate) tracer: Box<dyn VmTracer>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    #[must_use]
    pub fn new() -> Self {
        Self::with_tuning(GcTuning::default())
    }

    #[must_use]
    pub fn with_tuning(tuning: GcTuning) -> Self {
        Self {
            heap: Heap::new(tuning),
            scopes: ScopeArena::new(),
            tasks: Vec::new(),
            tracer: Box::new(NoopTracer),
        }
    }

    /// Replaces the execution tracer (see [`crate::tracer`]).
    pub fn set_tracer(&mut self, tracer: Box<dyn VmTracer>) {
        self.tracer = tracer;
    }

    // ----- compile & task control ------------------------------------------

    /// Compiles a script into a new task in `New` state.
    pub fn compile(&mut self, source: &str, code: &str) -> Result<TaskId, CompileError> {
        let block = parse_program(code).map_err(|e| CompileError {
            source: source.to_string(),
            line: e.line,
            message: e.message,
        })?;
        let compiled = Rc::new(compile_program(&block));

        let root = self.scopes.alloc(None);
        let global = self.scopes.alloc(None);
        let task = Task::new(Rc::from(source), compiled, root, global);
        self.tasks.push(Some(task));
        Ok(TaskId((self.tasks.len() - 1) as u32))
    }

    /// Runs a task until it ends, fails, or a native callback pauses it.
    /// Resuming a task in any other state is a no-op.
    pub fn resume(&mut self, id: TaskId) {
        let Some(mut task) = self.take_task(id) else { return };
        if matches!(task.state, TaskState::New | TaskState::Yielded) {
            task.state = TaskState::Running;
            self.finish_pending_native(&mut task);
            if task.state == TaskState::Running {
                self.execute(&mut task, 0);
            }
        }
        self.put_task(id, task);
    }

    /// Requests cooperative suspension; normally called from a native
    /// callback via [`NativeCtx::pause`].
    pub fn pause(&mut self, id: TaskId) {
        if let Some(task) = self.task_mut(id) {
            task.state = TaskState::Yielded;
        }
    }

    /// Current state; freed tasks read as `Ended`.
    #[must_use]
    pub fn state(&self, id: TaskId) -> TaskState {
        self.task(id).map_or(TaskState::Ended, |t| t.state)
    }

    /// The error message of a failed task, or the empty string.
    #[must_use]
    pub fn error_message(&self, id: TaskId) -> &str {
        self.task(id).map_or("", |t| t.message.as_str())
    }

    /// The full error report: a `stack traceback:` block followed by
    /// `error: <message>`.
    #[must_use]
    pub fn error_traceback(&self, id: TaskId) -> String {
        self.task(id).map_or_else(String::new, Task::error_report)
    }

    /// The main body's return value once the task has ended.
    #[must_use]
    pub fn result(&self, id: TaskId) -> Value {
        self.task(id).map_or(Value::NIL, |t| t.result)
    }

    // ----- value construction ----------------------------------------------

    pub fn number(&mut self, num: f64) -> Value {
        self.heap.alloc(HeapData::Num(num))
    }

    pub fn string(&mut self, s: &str) -> Value {
        self.heap.alloc(HeapData::Str(Str::from(s)))
    }

    pub fn string_from_bytes(&mut self, bytes: &[u8]) -> Value {
        self.heap.alloc(HeapData::Str(Str::from_bytes(bytes)))
    }

    pub fn table(&mut self) -> Value {
        self.heap.alloc(HeapData::Table(Table::new()))
    }

    pub fn list(&mut self) -> Value {
        self.heap.alloc(HeapData::List(List::new()))
    }

    pub fn tuple(&mut self) -> Value {
        self.heap.alloc(HeapData::Tuple(Vec::new()))
    }

    /// Wraps a host callback into a function value with a display name.
    pub fn native(&mut self, name: &str, f: NativeFn) -> Value {
        self.heap.alloc(HeapData::Func(Function {
            src: Rc::from("[C]"),
            name: Rc::from(name),
            kind: FuncKind::Native(f),
        }))
    }

    /// Convenience wrapper around [`Runtime::native`] for closures.
    pub fn native_fn(
        &mut self,
        name: &str,
        f: impl Fn(&mut NativeCtx<'_>) -> NativeResult + 'static,
    ) -> Value {
        self.native(name, Rc::new(f))
    }

    // ----- introspection ---------------------------------------------------

    #[must_use]
    pub fn type_of(&self, value: Value) -> ValueType {
        self.heap.type_of(value)
    }

    /// The monotonic identity of a heap value; singletons have none and
    /// report 0.
    #[must_use]
    pub fn id_of(&self, value: Value) -> u64 {
        self.heap.identity(value)
    }

    #[must_use]
    pub fn get_number(&self, value: Value) -> Option<f64> {
        self.heap.num(value)
    }

    /// Lossy UTF-8 view of a string value.
    #[must_use]
    pub fn get_string(&self, value: Value) -> Option<Cow<'_, str>> {
        self.heap.str_bytes(value).map(String::from_utf8_lossy)
    }

    #[must_use]
    pub fn get_string_bytes(&self, value: Value) -> Option<&[u8]> {
        self.heap.str_bytes(value)
    }

    /// Length of a string (bytes), table (entries) or list (elements);
    /// 0 for every other kind.
    #[must_use]
    pub fn get_length(&self, value: Value) -> usize {
        match value {
            Value::Ref(id) => match self.heap.data(id) {
                HeapData::Str(s) => s.len(),
                HeapData::Table(t) => t.len(),
                HeapData::List(l) => l.len(),
                HeapData::Tuple(items) => items.len(),
                _ => 0,
            },
            _ => 0,
        }
    }

    /// Whether two values are equal by content (numbers, strings) or
    /// identity (everything else).
    #[must_use]
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        self.heap.values_equal(a, b)
    }

    /// Hook-free textual form of a value: strings verbatim, numbers in their
    /// script form, reference kinds as `kind: 0x<id>`. `__tostr` dispatch
    /// lives in the standard library's `tostr`, which falls back to this.
    #[must_use]
    pub fn display_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(true) => "true".to_string(),
            Value::Bool(false) => "false".to_string(),
            Value::Ref(id) => match self.heap.data(id) {
                HeapData::Num(n) => crate::value::format_number(*n),
                HeapData::Str(s) => s.to_display().into_owned(),
                HeapData::Func(_) => format!("func: 0x{:x}", self.heap.identity(value)),
                HeapData::Table(_) => format!("table: 0x{:x}", self.heap.identity(value)),
                HeapData::List(_) => format!("list: 0x{:x}", self.heap.identity(value)),
                HeapData::Tuple(items) => match items.last() {
                    Some(&last) => self.display_value(last),
                    None => "nil".to_string(),
                },
                _ => "unknown".to_string(),
            },
        }
    }

    // ----- tables ----------------------------------------------------------

    /// Direct field read; absent keys and non-tables read as `nil`.
    #[must_use]
    pub fn get_field(&self, table: Value, key: Value) -> Value {
        match self.heap.table_id(table) {
            Some(id) => self.heap.table_get(id, key),
            None => Value::NIL,
        }
    }

    /// Direct field write; assigning `nil` removes the entry. Ignored for
    /// non-tables.
    pub fn set_field(&mut self, table: Value, key: Value, value: Value) {
        if let Some(id) = self.heap.table_id(table) {
            self.heap.table_set(id, key, value);
        }
    }

    /// The metatable of a table. When the metatable carries a `__metatable`
    /// field, that value is returned instead — a shield against inspection.
    #[must_use]
    pub fn get_metatable(&self, table: Value) -> Value {
        let meta = self.heap.metatable_of(table);
        if let Value::Ref(mid) = meta {
            let shield = self.heap.table_get_str(mid, "__metatable");
            if !shield.is_nil() {
                return shield;
            }
        }
        meta
    }

    /// Attaches (or clears, with `nil`) a metatable. Ignored for non-tables.
    pub fn set_metatable(&mut self, table: Value, metatable: Value) {
        if let Some(id) = self.heap.table_id(table) {
            self.heap.table_mut(id).metatable = metatable;
        }
    }

    // ----- lists -----------------------------------------------------------

    pub fn list_push(&mut self, list: Value, value: Value) {
        if let Some(id) = self.list_id(list) {
            self.heap.list_mut(id).push(value);
            self.heap.refresh_bytes(id);
        }
    }

    /// Removes and returns the element at `idx`; `nil` when out of range.
    pub fn list_pop(&mut self, list: Value, idx: usize) -> Value {
        match self.list_id(list) {
            Some(id) => {
                let value = self.heap.list_mut(id).remove(idx).unwrap_or(Value::NIL);
                self.heap.refresh_bytes(id);
                value
            }
            None => Value::NIL,
        }
    }

    /// Inserts before `idx`; an index past the end appends.
    pub fn list_insert(&mut self, list: Value, idx: usize, value: Value) {
        if let Some(id) = self.list_id(list) {
            self.heap.list_mut(id).insert(idx, value);
            self.heap.refresh_bytes(id);
        }
    }

    /// Overwrites an existing slot; returns `false` when out of range.
    pub fn list_set(&mut self, list: Value, idx: usize, value: Value) -> bool {
        match self.list_id(list) {
            Some(id) => self.heap.list_mut(id).set(idx, value),
            None => false,
        }
    }

    #[must_use]
    pub fn list_get(&self, list: Value, idx: usize) -> Value {
        match self.list_id(list) {
            Some(id) => self.heap.list_ref(id).get(idx).unwrap_or(Value::NIL),
            None => Value::NIL,
        }
    }

    fn list_id(&self, value: Value) -> Option<HeapId> {
        match value {
            Value::Ref(id) => match self.heap.data(id) {
                HeapData::List(_) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }

    // ----- tuples ----------------------------------------------------------

    /// Appends to a tuple; pushing a tuple flattens its elements.
    pub fn tuple_push(&mut self, tuple: Value, value: Value) {
        let Value::Ref(id) = tuple else { return };
        let flattened: Option<Vec<Value>> = self.heap.tuple_items(value).map(<[Value]>::to_vec);
        match self.heap.data_mut(id) {
            HeapData::Tuple(items) => match flattened {
                Some(inner) => items.extend(inner),
                None => items.push(value),
            },
            _ => return,
        }
        self.heap.refresh_bytes(id);
    }

    /// Removes and returns the last element; `nil` when empty.
    pub fn tuple_pop(&mut self, tuple: Value) -> Value {
        let Value::Ref(id) = tuple else { return Value::NIL };
        match self.heap.data_mut(id) {
            HeapData::Tuple(items) => items.pop().unwrap_or(Value::NIL),
            _ => Value::NIL,
        }
    }

    /// Positional access; `nil` out of range. A non-tuple value acts as a
    /// one-element tuple, which is how hosts uniformly consume returns.
    #[must_use]
    pub fn tuple_get(&self, tuple: Value, idx: usize) -> Value {
        match self.heap.tuple_items(tuple) {
            Some(items) => items.get(idx).copied().unwrap_or(Value::NIL),
            None if idx == 0 => tuple,
            None => Value::NIL,
        }
    }

    /// Element count; a non-tuple value counts as one.
    #[must_use]
    pub fn tuple_len(&self, tuple: Value) -> usize {
        self.heap.tuple_items(tuple).map_or(1, <[Value]>::len)
    }

    // ----- task variables --------------------------------------------------

    /// Binds a name in the task's global scope (the lookup fallback for
    /// names unbound in the lexical chain — where the standard library
    /// lives).
    pub fn set_global(&mut self, id: TaskId, name: &str, value: Value) {
        if let Some(task) = self.tasks.get(id.0 as usize).and_then(Option::as_ref) {
            let global = task.global;
            self.scopes.declare(global, name, value);
        }
    }

    #[must_use]
    pub fn get_global(&self, id: TaskId, name: &str) -> Value {
        self.task(id)
            .and_then(|t| self.scopes.lookup(t.global, name))
            .unwrap_or(Value::NIL)
    }

    #[must_use]
    pub fn has_global(&self, id: TaskId, name: &str) -> bool {
        self.task(id).is_some_and(|t| self.scopes.lookup(t.global, name).is_some())
    }

    /// Binds a name in the current top lexical scope.
    pub fn set_var(&mut self, id: TaskId, name: &str, value: Value) {
        if let Some(task) = self.tasks.get(id.0 as usize).and_then(Option::as_ref) {
            if let Some(&scope) = task.scope_stack.last() {
                self.scopes.declare(scope, name, value);
            }
        }
    }

    /// Reads a name from the current lexical chain (without the global
    /// fallback).
    #[must_use]
    pub fn get_var(&self, id: TaskId, name: &str) -> Value {
        self.task(id)
            .and_then(|t| t.scope_stack.last().copied())
            .and_then(|scope| self.scopes.lookup(scope, name))
            .unwrap_or(Value::NIL)
    }

    #[must_use]
    pub fn has_var(&self, id: TaskId, name: &str) -> bool {
        self.task(id)
            .and_then(|t| t.scope_stack.last().copied())
            .and_then(|scope| self.scopes.lookup(scope, name))
            .is_some()
    }

    // ----- reentrant calls -------------------------------------------------

    /// Calls a function value on a task, driving the VM until the invoked
    /// function returns. On error the task is left in `Error` state and the
    /// call reports `nil`.
    pub fn call(&mut self, id: TaskId, func: Value, args: &[Value]) -> Value {
        let Some(mut task) = self.take_task(id) else { return Value::NIL };
        let result = self.call_impl(&mut task, func, args, false).unwrap_or(Value::NIL);
        self.put_task(id, task);
        result
    }

    /// Like [`Runtime::call`], but any error unwinds only up to this call and
    /// is reported as the `Err` message, leaving the task resumable.
    pub fn protected_call(&mut self, id: TaskId, func: Value, args: &[Value]) -> Result<Value, String> {
        let Some(mut task) = self.take_task(id) else {
            return Err("task is not live".to_string());
        };
        let result = self.protected_impl(&mut task, func, args);
        self.put_task(id, task);
        result
    }

    pub(crate) fn protected_impl(
        &mut self,
        task: &mut Task,
        func: Value,
        args: &[Value],
    ) -> Result<Value, String> {
        let entry_state = task.state;
        match self.call_impl(task, func, args, true) {
            Ok(value) => Ok(value),
            Err(_) => {
                let message = task.message.clone();
                // the error was absorbed at the protected frame; put the task
                // back in the state the call found it in
                task.state = entry_state;
                task.traceback.clear();
                Err(message)
            }
        }
    }

    // ----- internals -------------------------------------------------------

    pub(crate) fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub(crate) fn take_task(&mut self, id: TaskId) -> Option<Task> {
        self.tasks.get_mut(id.0 as usize).and_then(Option::take)
    }

    pub(crate) fn put_task(&mut self, id: TaskId, task: Task) {
        self.tasks[id.0 as usize] = Some(task);
    }

    /// Collection entry point; `current` is a task detached while executing.
    pub(crate) fn collect_garbage(&mut self, current: Option<&Task>) {
        heap::collect(
            &mut self.heap,
            &mut self.scopes,
            &mut self.tasks,
            current,
            self.tracer.as_mut(),
        );
    }

    pub(crate) fn gc_pressure(&self) -> bool {
        self.heap.bytes() + self.scopes.bytes() > self.heap.threshold()
    }
}

/// Execution context handed to native callbacks.
///
/// Gives access to the call's arguments, the return slot, the task's
/// variables, and reentrant calls into the VM. All value constructors and
/// introspection of the runtime are reachable through [`NativeCtx::runtime`].
pub struct NativeCtx<'a> {
    pub(crate) rt: &'a mut Runtime,
    pub(crate) task: &'a mut Task,
}

impl NativeCtx<'_> {
    /// The owning runtime, for value construction and introspection.
    pub fn runtime(&mut self) -> &mut Runtime {
        self.rt
    }

    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.task.frame().args.len()
    }

    /// The `i`-th argument; missing arguments read as `nil`.
    #[must_use]
    pub fn arg(&self, i: usize) -> Value {
        self.task.frame().args.get(i).copied().unwrap_or(Value::NIL)
    }

    #[must_use]
    pub fn has_arg(&self, i: usize) -> bool {
        i < self.task.frame().args.len()
    }

    /// Sets the callback's return value.
    pub fn ret(&mut self, value: Value) {
        self.task.frame_mut().ret = value;
    }

    /// Returns multiple values as a tuple (flattening nested tuples).
    pub fn ret_many(&mut self, values: &[Value]) {
        match values {
            [] => self.ret(Value::NIL),
            [single] => self.ret(*single),
            _ => {
                let tuple = self.rt.tuple();
                for &value in values {
                    self.rt.tuple_push(tuple, value);
                }
                self.ret(tuple);
            }
        }
    }

    /// Builds the error token to return from the callback:
    /// `return Err(ctx.err("boom"))` is the native equivalent of `error()`.
    /// The VM records the message and unwinds once the callback returns it.
    #[must_use]
    pub fn err(&mut self, message: impl Into<String>) -> NativeError {
        NativeError { message: Some(message.into()) }
    }

    /// Requests suspension: the VM loop returns to the host after this
    /// callback finishes, and the next resume completes the call with the
    /// value passed to [`NativeCtx::ret`].
    pub fn pause(&mut self) {
        self.task.state = TaskState::Yielded;
    }

    // -- convenience constructors -------------------------------------------

    pub fn number(&mut self, num: f64) -> Value {
        self.rt.number(num)
    }

    pub fn string(&mut self, s: &str) -> Value {
        self.rt.string(s)
    }

    pub fn table(&mut self) -> Value {
        self.rt.table()
    }

    pub fn list(&mut self) -> Value {
        self.rt.list()
    }

    // -- task variables -----------------------------------------------------

    pub fn set_global(&mut self, name: &str, value: Value) {
        let global = self.task.global;
        self.rt.scopes.declare(global, name, value);
    }

    #[must_use]
    pub fn get_global(&self, name: &str) -> Value {
        self.rt.scopes.lookup(self.task.global, name).unwrap_or(Value::NIL)
    }

    #[must_use]
    pub fn has_global(&self, name: &str) -> bool {
        self.rt.scopes.lookup(self.task.global, name).is_some()
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        if let Some(&scope) = self.task.scope_stack.last() {
            self.rt.scopes.declare(scope, name, value);
        }
    }

    #[must_use]
    pub fn get_var(&self, name: &str) -> Value {
        self.task
            .scope_stack
            .last()
            .and_then(|&scope| self.rt.scopes.lookup(scope, name))
            .unwrap_or(Value::NIL)
    }

    #[must_use]
    pub fn has_var(&self, name: &str) -> bool {
        self.task
            .scope_stack
            .last()
            .is_some_and(|&scope| self.rt.scopes.lookup(scope, name).is_some())
    }

    // -- reentrant calls ----------------------------------------------------

    /// Calls back into the VM, driving nested frames until the invoked
    /// function returns. An `Err` means the task is unwinding — propagate it
    /// with `?`.
    pub fn call(&mut self, func: Value, args: &[Value]) -> Result<Value, NativeError> {
        self.rt
            .call_impl(self.task, func, args, false)
            .map_err(|_| NativeError { message: None })
    }

    /// Protected reentrant call: errors are absorbed and reported as the
    /// `Err` message, and the task stays runnable.
    pub fn protected_call(&mut self, func: Value, args: &[Value]) -> Result<Value, String> {
        self.rt.protected_impl(self.task, func, args)
    }
}

impl Runtime {
    /// Collects args for `call_impl` from a slice.
    pub(crate) fn args_from(values: &[Value]) -> SmallVec<[Value; 4]> {
        values.iter().copied().collect()
    }
}
