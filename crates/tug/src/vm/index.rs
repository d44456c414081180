//! Indexing (`obj[key]`, `obj.field`) and multi-target assignment.

use smallvec::SmallVec;

use super::{VmResult, frame_code};
use crate::{
    heap::HeapData,
    runtime::Runtime,
    task::Task,
    types::Str,
    value::Value,
};

/// One decoded assignment target. Name targets keep the operand's offset into
/// the frame's code; index targets own the object/key popped from the stack.
enum Target {
    Name(usize),
    Index { obj: Value, key: Value },
}

impl Runtime {
    /// `obj[key]` with `__get` dispatch. Strings and lists support 0-based
    /// numeric indexing; out-of-range reads (including `i == len`) are `nil`.
    pub(crate) fn index_get(&mut self, task: &mut Task, obj: Value, key: Value) -> VmResult<Value> {
        if let Some(table) = self.heap.table_id(obj) {
            let hook = self.heap.meta_field(obj, "__get");
            if !hook.is_nil() {
                return self.call_to_completion(task, hook, SmallVec::from_slice(&[obj, key]));
            }
            return Ok(self.heap.table_get(table, key));
        }

        if let Some(idx) = self.heap.num(key) {
            if let Some(bytes) = self.heap.str_bytes(obj) {
                if idx < 0.0 || idx as usize >= bytes.len() {
                    return Ok(Value::NIL);
                }
                let byte = bytes[idx as usize];
                return Ok(self.heap.alloc(HeapData::Str(Str::from_bytes(&[byte]))));
            }
            if let Value::Ref(id) = obj {
                if let HeapData::List(list) = self.heap.data(id) {
                    if idx < 0.0 {
                        return Ok(Value::NIL);
                    }
                    return Ok(list.get(idx as usize).unwrap_or(Value::NIL));
                }
            }
        }

        let (t1, t2) = (self.heap.type_name(obj), self.heap.type_name(key));
        self.raise(task, format!("unable to get index '{t1}' with '{t2}'"))
    }

    /// `obj[key] = value` with `__set` dispatch. Lists require an in-range
    /// numeric index; tables remove the entry when `value` is `nil`.
    pub(crate) fn index_set(
        &mut self,
        task: &mut Task,
        obj: Value,
        key: Value,
        value: Value,
    ) -> VmResult<()> {
        if let Some(table) = self.heap.table_id(obj) {
            let hook = self.heap.meta_field(obj, "__set");
            if !hook.is_nil() {
                self.call_to_completion(task, hook, SmallVec::from_slice(&[obj, key, value]))?;
                return Ok(());
            }
            self.heap.table_set(table, key, value);
            return Ok(());
        }

        if let Value::Ref(id) = obj {
            if matches!(self.heap.data(id), HeapData::List(_)) {
                let Some(idx) = self.heap.num(key) else {
                    let got = self.heap.type_name(key);
                    return self.raise(task, format!("unable to set list index with '{got}'"));
                };
                let list = self.heap.list_mut(id);
                if idx < 0.0 || !list.set(idx as usize, value) {
                    return self.raise(task, "set index out of range".to_string());
                }
                return Ok(());
            }
        }

        let got = self.heap.type_name(obj);
        self.raise(task, format!("unable to set index '{got}'"))
    }

    /// Multi-target assignment: values were pushed left to right, index
    /// targets' object/key pairs sit beneath them. Values right-align against
    /// the target list (see [`Runtime::pop_n`]).
    pub(crate) fn op_multiassign(&mut self, task: &mut Task) -> VmResult<()> {
        let code = frame_code(task);
        let line = task.frame_mut().read_addr();
        task.frame_mut().line = line;
        let local = task.frame_mut().read_byte() == 1;
        let valuec = task.frame_mut().read_addr();
        let targetc = task.frame_mut().read_addr();

        let values = self.pop_n(task, targetc);
        if targetc < valuec {
            for _ in 0..valuec - targetc {
                self.pop_raw(task);
            }
        }

        // descriptors were emitted in reverse target order; index targets pop
        // their object/key as they are decoded
        let mut rev_targets: Vec<Target> = Vec::with_capacity(targetc);
        for _ in 0..targetc {
            let kind = task.frame_mut().read_byte();
            if kind == 1 {
                let (start, _) = task.frame_mut().read_str_range();
                rev_targets.push(Target::Name(start));
            } else {
                let pair = self.pop_n(task, 2);
                rev_targets.push(Target::Index { obj: pair[0], key: pair[1] });
            }
        }

        for (i, &value) in values.iter().enumerate() {
            match &rev_targets[targetc - 1 - i] {
                Target::Name(start) => {
                    let (name, _) = code.str_at(*start);
                    self.store_var(task, name, value, local);
                }
                Target::Index { obj, key } => {
                    self.index_set(task, *obj, *key, value)?;
                }
            }
        }
        Ok(())
    }
}
