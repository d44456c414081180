//! Binary and unary operator evaluation with metatable dispatch.
//!
//! Either operand may supply the hook (`__add` … `__ne`); the left side wins.
//! Relational hooks must return a real boolean. Without a hook, numbers get
//! arithmetic and ordering, strings get concatenation (`+`) and lexicographic
//! ordering, and equality falls back to content/identity comparison.

use smallvec::SmallVec;

use super::VmResult;
use crate::{
    bytecode::Opcode,
    heap::HeapData,
    runtime::Runtime,
    task::Task,
    types::Str,
    value::{Value, ValueType},
};

fn hook_name(op: Opcode) -> &'static str {
    match op {
        Opcode::Add => "__add",
        Opcode::Sub => "__sub",
        Opcode::Mul => "__mul",
        Opcode::Div => "__div",
        Opcode::Mod => "__mod",
        Opcode::Gt => "__gt",
        Opcode::Lt => "__lt",
        Opcode::Ge => "__ge",
        Opcode::Le => "__le",
        Opcode::Eq => "__eq",
        Opcode::Ne => "__ne",
        _ => unreachable!("not a binary opcode"),
    }
}

fn verb(op: Opcode) -> &'static str {
    match op {
        Opcode::Add => "add",
        Opcode::Sub => "sub",
        Opcode::Mul => "mul",
        Opcode::Div => "div",
        Opcode::Mod => "mod",
        Opcode::Gt => "gt",
        Opcode::Lt => "lt",
        Opcode::Ge => "ge",
        Opcode::Le => "le",
        _ => unreachable!("not an arithmetic opcode"),
    }
}

fn is_relational(op: Opcode) -> bool {
    matches!(op, Opcode::Gt | Opcode::Lt | Opcode::Ge | Opcode::Le | Opcode::Eq | Opcode::Ne)
}

impl Runtime {
    pub(crate) fn binary_op(&mut self, task: &mut Task, op: Opcode) -> VmResult<()> {
        if !matches!(op, Opcode::Eq | Opcode::Ne) {
            let line = task.frame_mut().read_addr();
            task.frame_mut().line = line;
        }
        let rhs = self.pop_value(task);
        let lhs = self.pop_value(task);

        let name = hook_name(op);
        let mut hook = self.heap.meta_field(lhs, name);
        if hook.is_nil() {
            hook = self.heap.meta_field(rhs, name);
        }
        if !hook.is_nil() {
            let result = self.call_to_completion(task, hook, SmallVec::from_slice(&[lhs, rhs]))?;
            if is_relational(op) && self.heap.type_of(result) != ValueType::Bool {
                let got = self.heap.type_name(result);
                return self.raise(task, format!("metamethod '{name}' must return 'bool', got '{got}'"));
            }
            task.stack.push(result);
            return Ok(());
        }

        if matches!(op, Opcode::Eq | Opcode::Ne) {
            let equal = self.heap.values_equal(lhs, rhs);
            task.stack.push(Value::truth(equal == (op == Opcode::Eq)));
            return Ok(());
        }

        if let (Some(a), Some(b)) = (self.heap.num(lhs), self.heap.num(rhs)) {
            let result = match op {
                Opcode::Add => self.heap.alloc(HeapData::Num(a + b)),
                Opcode::Sub => self.heap.alloc(HeapData::Num(a - b)),
                Opcode::Mul => self.heap.alloc(HeapData::Num(a * b)),
                Opcode::Div => {
                    if b == 0.0 {
                        return self.raise(task, "zero division".to_string());
                    }
                    self.heap.alloc(HeapData::Num(a / b))
                }
                Opcode::Mod => {
                    if b == 0.0 {
                        return self.raise(task, "zero modulo".to_string());
                    }
                    self.heap.alloc(HeapData::Num(a % b))
                }
                Opcode::Gt => Value::truth(a > b),
                Opcode::Lt => Value::truth(a < b),
                Opcode::Ge => Value::truth(a >= b),
                Opcode::Le => Value::truth(a <= b),
                _ => unreachable!("handled above"),
            };
            task.stack.push(result);
            return Ok(());
        }

        if let (Some(a), Some(b)) = (self.heap.str_bytes(lhs), self.heap.str_bytes(rhs)) {
            match op {
                Opcode::Add => {
                    let mut joined = Vec::with_capacity(a.len() + b.len());
                    joined.extend_from_slice(a);
                    joined.extend_from_slice(b);
                    let value = self.heap.alloc(HeapData::Str(Str::from_vec(joined)));
                    task.stack.push(value);
                    return Ok(());
                }
                Opcode::Gt | Opcode::Lt | Opcode::Ge | Opcode::Le => {
                    let ord = a.cmp(b);
                    let result = match op {
                        Opcode::Gt => ord.is_gt(),
                        Opcode::Lt => ord.is_lt(),
                        Opcode::Ge => ord.is_ge(),
                        Opcode::Le => ord.is_le(),
                        _ => unreachable!(),
                    };
                    task.stack.push(Value::truth(result));
                    return Ok(());
                }
                _ => {}
            }
        }

        let (t1, t2) = (self.heap.type_name(lhs), self.heap.type_name(rhs));
        self.raise(task, format!("unable to {} '{t1}' with '{t2}'", verb(op)))
    }

    pub(crate) fn unary_op(&mut self, task: &mut Task, op: Opcode) -> VmResult<()> {
        if op != Opcode::Not {
            let line = task.frame_mut().read_addr();
            task.frame_mut().line = line;
        }
        let value = self.pop_value(task);

        match op {
            Opcode::Not => {
                let hook = self.heap.meta_field(value, "__truth");
                if hook.is_nil() {
                    let truthy = self.heap.truthy(value);
                    task.stack.push(Value::truth(!truthy));
                    return Ok(());
                }
                let result =
                    self.call_to_completion(task, hook, SmallVec::from_slice(&[value]))?;
                match result {
                    Value::Bool(b) => task.stack.push(Value::truth(!b)),
                    _ => {
                        let got = self.heap.type_name(result);
                        return self.raise(
                            task,
                            format!("metamethod '__truth' must return 'bool', got '{got}'"),
                        );
                    }
                }
            }
            Opcode::Pos | Opcode::Neg => {
                let name = if op == Opcode::Pos { "__pos" } else { "__neg" };
                let hook = self.heap.meta_field(value, name);
                if !hook.is_nil() {
                    let result =
                        self.call_to_completion(task, hook, SmallVec::from_slice(&[value]))?;
                    task.stack.push(result);
                    return Ok(());
                }
                match self.heap.num(value) {
                    Some(n) => {
                        let result = if op == Opcode::Neg { -n } else { n };
                        let result = self.heap.alloc(HeapData::Num(result));
                        task.stack.push(result);
                    }
                    None => {
                        let verb = if op == Opcode::Pos { "pos" } else { "neg" };
                        let got = self.heap.type_name(value);
                        return self.raise(task, format!("unable to {verb} '{got}'"));
                    }
                }
            }
            _ => unreachable!("not a unary opcode"),
        }
        Ok(())
    }
}
