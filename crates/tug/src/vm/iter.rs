//! The iteration protocol: `Iter` builds a cursor, `Next` advances it.
//!
//! Strings yield successive 1-byte substrings, lists yield elements, tables
//! yield key/value pairs in bucket order. A table whose metatable carries
//! `__next` is its own iterator; `__iter` is consulted first and must produce
//! something iterable. Custom `__next` hooks return a boolean continue flag
//! followed by one value per bound name, as a tuple.

use smallvec::SmallVec;

use super::VmResult;
use crate::{
    heap::{HeapData, HeapId},
    runtime::Runtime,
    task::Task,
    types::Str,
    value::Value,
};

/// What `Iter` decided to do with the iterable.
enum IterPlan {
    /// The value drives itself through its `__next` hook.
    SelfDriven,
    Str { target: HeapId, len: usize },
    List { target: HeapId },
    Table { target: HeapId },
    NotIterable,
}

/// Copy of an internal cursor's state, taken before advancing it.
enum Cursor {
    Str { target: HeapId, len: usize, idx: usize },
    List { target: HeapId, idx: usize },
    Table { target: HeapId, bucket: usize, entry: usize },
    HookDriven,
}

/// Outcome of advancing an iterator one step.
enum Step {
    Done,
    /// Bound `used` names; the rest get `nil`.
    Bound { used: usize },
}

impl Runtime {
    pub(crate) fn op_iter(&mut self, task: &mut Task) -> VmResult<()> {
        let line = task.frame_mut().read_addr();
        task.frame_mut().line = line;

        let mut obj = self.pop_value(task);
        let mut from_hook = false;
        let hook = self.heap.meta_field(obj, "__iter");
        if !hook.is_nil() {
            obj = self.call_to_completion(task, hook, SmallVec::from_slice(&[obj]))?;
            from_hook = true;
        }

        let plan = match obj {
            Value::Ref(id) => match self.heap.data(id) {
                HeapData::Table(_) => {
                    if self.heap.meta_field(obj, "__next").is_nil() {
                        IterPlan::Table { target: id }
                    } else {
                        IterPlan::SelfDriven
                    }
                }
                HeapData::Str(s) => IterPlan::Str { target: id, len: s.len() },
                HeapData::List(_) => IterPlan::List { target: id },
                _ => IterPlan::NotIterable,
            },
            _ => IterPlan::NotIterable,
        };

        let iter = match plan {
            IterPlan::SelfDriven => obj,
            IterPlan::Str { target, len } => {
                self.heap.alloc(HeapData::IterStr { target, len, idx: 0 })
            }
            IterPlan::List { target } => self.heap.alloc(HeapData::IterList { target, idx: 0 }),
            IterPlan::Table { target } => {
                self.heap.alloc(HeapData::IterTable { target, bucket: 0, entry: 0 })
            }
            IterPlan::NotIterable => {
                let got = self.heap.type_name(obj);
                return if from_hook {
                    self.raise(
                        task,
                        format!("metamethod '__iter' must return an iterable, got '{got}'"),
                    )
                } else {
                    self.raise(task, format!("unable to iterate '{got}'"))
                };
            }
        };
        task.stack.push(iter);
        Ok(())
    }

    pub(crate) fn op_next(&mut self, task: &mut Task) -> VmResult<()> {
        let code = super::frame_code(task);
        let line = task.frame_mut().read_addr();
        task.frame_mut().line = line;
        let namec = task.frame_mut().read_addr();
        let mut name_starts: SmallVec<[usize; 2]> = SmallVec::new();
        for _ in 0..namec {
            let (start, _) = task.frame_mut().read_str_range();
            name_starts.push(start);
        }
        let exit = task.frame_mut().read_addr();

        let iter = self.peek_value(task);
        let cursor = match iter {
            Value::Ref(id) => match self.heap.data(id) {
                HeapData::IterStr { target, len, idx } => {
                    Cursor::Str { target: *target, len: *len, idx: *idx }
                }
                HeapData::IterList { target, idx } => {
                    Cursor::List { target: *target, idx: *idx }
                }
                HeapData::IterTable { target, bucket, entry } => {
                    Cursor::Table { target: *target, bucket: *bucket, entry: *entry }
                }
                _ => Cursor::HookDriven,
            },
            _ => Cursor::HookDriven,
        };

        let step = match cursor {
            Cursor::Str { target, len, idx } => {
                if idx < len {
                    let byte = self.heap.str_bytes(Value::Ref(target)).map_or(0, |b| b[idx]);
                    self.advance_cursor(iter, |data| {
                        if let HeapData::IterStr { idx, .. } = data {
                            *idx += 1;
                        }
                    });
                    let piece = self.heap.alloc(HeapData::Str(Str::from_bytes(&[byte])));
                    self.bind_name(task, &code, &name_starts, 0, piece);
                    Step::Bound { used: 1 }
                } else {
                    Step::Done
                }
            }
            Cursor::List { target, idx } => match self.heap.list_ref(target).get(idx) {
                Some(item) => {
                    self.advance_cursor(iter, |data| {
                        if let HeapData::IterList { idx, .. } = data {
                            *idx += 1;
                        }
                    });
                    self.bind_name(task, &code, &name_starts, 0, item);
                    Step::Bound { used: 1 }
                }
                None => Step::Done,
            },
            Cursor::Table { target, bucket, entry } => {
                let found = self
                    .heap
                    .table_ref(target)
                    .entry_from(bucket, entry)
                    .map(|(e, pos)| (e.key, e.value, pos));
                match found {
                    Some((key, value, pos)) => {
                        self.advance_cursor(iter, |data| {
                            if let HeapData::IterTable { bucket, entry, .. } = data {
                                *bucket = pos.0;
                                *entry = pos.1 + 1;
                            }
                        });
                        self.bind_name(task, &code, &name_starts, 0, key);
                        if namec >= 2 {
                            self.bind_name(task, &code, &name_starts, 1, value);
                        }
                        Step::Bound { used: 2 }
                    }
                    None => Step::Done,
                }
            }
            Cursor::HookDriven => self.next_via_hook(task, iter, &code, &name_starts)?,
        };

        match step {
            Step::Done => {
                task.frame_mut().ip = exit;
                self.pop_value(task);
            }
            Step::Bound { used } => {
                for slot in used..namec {
                    self.bind_name(task, &code, &name_starts, slot, Value::NIL);
                }
            }
        }
        Ok(())
    }

    /// Declares an iteration variable in the loop's scope.
    fn bind_name(
        &mut self,
        task: &Task,
        code: &crate::bytecode::Code,
        name_starts: &[usize],
        slot: usize,
        value: Value,
    ) {
        let Some(&start) = name_starts.get(slot) else { return };
        let (name, _) = code.str_at(start);
        if let Some(&top) = task.scope_stack.last() {
            self.scopes.declare(top, name, value);
        }
    }

    fn advance_cursor(&mut self, iter: Value, advance: impl FnOnce(&mut HeapData)) {
        if let Value::Ref(id) = iter {
            advance(self.heap.data_mut(id));
        }
    }

    /// Drives a `__next` hook: the return is a continue flag, optionally
    /// followed (as a tuple) by one value per bound name.
    fn next_via_hook(
        &mut self,
        task: &mut Task,
        iter: Value,
        code: &crate::bytecode::Code,
        name_starts: &[usize],
    ) -> VmResult<Step> {
        let hook = self.heap.meta_field(iter, "__next");
        if hook.is_nil() {
            return self.raise(task, "iteration fatal error".to_string());
        }
        let raw = self.call_to_completion(task, hook, SmallVec::from_slice(&[iter]))?;

        let mut used = 0;
        let flag = match self.heap.tuple_items(raw) {
            Some(items) => {
                let flag = items.first().copied().unwrap_or(Value::NIL);
                let values: SmallVec<[Value; 4]> = items.iter().skip(1).copied().collect();
                for (slot, value) in values.into_iter().enumerate() {
                    if slot >= name_starts.len() {
                        break;
                    }
                    self.bind_name(task, code, name_starts, slot, value);
                    used += 1;
                }
                flag
            }
            None => raw,
        };

        match flag {
            Value::Nil | Value::Bool(false) => Ok(Step::Done),
            Value::Bool(true) => Ok(Step::Bound { used }),
            other => {
                let got = self.heap.type_name(other);
                self.raise(
                    task,
                    format!("metamethod '__next' must return 'bool' or 'nil', got '{got}'"),
                )
            }
        }
    }
}
