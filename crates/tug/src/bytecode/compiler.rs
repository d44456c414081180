//! Single-pass AST-to-bytecode compiler.
//!
//! Walks the tree once, emitting into a [`CodeBuilder`]. Nested function
//! bodies are compiled into fresh builders and embedded inline. A loop
//! context stack tracks the scope depth at loop entry, the loop start
//! address and pending break patches; `break`/`continue` compile to
//! [`Opcode::ScopePopJump`] with the number of block scopes between the
//! statement and the loop.

use super::{builder::CodeBuilder, code::Code, op::Opcode};
use crate::ast::{AssignTarget, BinOp, Block, Expr, Stmt, UnOp};

/// Compiles a parsed program into its top-level bytecode block.
pub(crate) fn compile_program(block: &Block) -> Code {
    let mut compiler = Compiler::new();
    compiler.block(block);
    compiler.b.emit_op(Opcode::Halt);
    compiler.b.finish()
}

struct LoopCtx {
    /// Scope depth at the loop start instruction.
    depth: usize,
    /// Address of the loop start (`while` condition / `Next`).
    start: usize,
    /// Break jump operands awaiting the loop end address.
    breaks: Vec<usize>,
}

struct Compiler {
    b: CodeBuilder,
    loops: Vec<LoopCtx>,
    /// Current block-scope depth, counted in `PushClosure` units.
    depth: usize,
}

impl Compiler {
    fn new() -> Self {
        Self { b: CodeBuilder::new(), loops: Vec::new(), depth: 0 }
    }

    fn enter_scope(&mut self) {
        self.depth += 1;
        self.b.emit_op(Opcode::PushClosure);
    }

    fn exit_scope(&mut self) {
        self.depth -= 1;
        self.b.emit_op(Opcode::PopClosure);
    }

    fn block(&mut self, block: &Block) {
        for stmt in block {
            self.stmt(stmt);
            if matches!(stmt, Stmt::Expr(_)) {
                self.b.emit_op(Opcode::Pop);
                self.b.emit_addr(1);
            }
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(expr) => self.expr(expr),
            Stmt::If { cond, body, elseifs, else_body } => {
                let mut end_patches = Vec::new();

                self.expr(cond);
                let mut next_arm = self.b.emit_jump(Opcode::JumpIfFalse, 0);
                self.enter_scope();
                self.block(body);
                self.exit_scope();
                self.b.emit_op(Opcode::Jump);
                end_patches.push(self.b.emit_addr(0));
                self.b.patch_addr(next_arm, self.b.pos());

                for (econd, eblock) in elseifs {
                    self.expr(econd);
                    next_arm = self.b.emit_jump(Opcode::JumpIfFalse, 0);
                    self.enter_scope();
                    self.block(eblock);
                    self.exit_scope();
                    self.b.emit_op(Opcode::Jump);
                    end_patches.push(self.b.emit_addr(0));
                    self.b.patch_addr(next_arm, self.b.pos());
                }

                if let Some(eblock) = else_body {
                    self.enter_scope();
                    self.block(eblock);
                    self.exit_scope();
                }

                for patch in end_patches {
                    self.b.patch_addr(patch, self.b.pos());
                }
            }
            Stmt::While { cond, body } => {
                let start = self.b.pos();
                self.loops.push(LoopCtx { depth: self.depth, start, breaks: Vec::new() });

                self.expr(cond);
                let exit = self.b.emit_jump(Opcode::JumpIfFalse, 0);

                self.enter_scope();
                self.block(body);
                self.exit_scope();

                self.b.emit_op(Opcode::Jump);
                self.b.emit_addr(start);

                self.b.patch_addr(exit, self.b.pos());
                self.finish_loop();
            }
            Stmt::For { names, iterable, body, line } => {
                self.enter_scope();

                self.expr(iterable);
                self.b.emit_op(Opcode::Iter);
                self.b.emit_addr(*line);

                let start = self.b.pos();
                self.loops.push(LoopCtx { depth: self.depth, start, breaks: Vec::new() });

                self.b.emit_op(Opcode::Next);
                self.b.emit_addr(*line);
                self.b.emit_addr(names.len());
                for name in names {
                    self.b.emit_str(name);
                }
                let exit = self.b.emit_addr(0);

                self.block(body);

                self.b.emit_op(Opcode::Jump);
                self.b.emit_addr(start);

                self.b.patch_addr(exit, self.b.pos());
                self.finish_loop();

                self.exit_scope();
            }
            Stmt::Break => {
                let ctx = self.loops.last().expect("parser rejects break outside loops");
                let pops = self.depth - ctx.depth;
                self.b.emit_op(Opcode::ScopePopJump);
                self.b.emit_addr(pops);
                let patch = self.b.emit_addr(0);
                self.loops.last_mut().expect("loop context").breaks.push(patch);
            }
            Stmt::Continue => {
                let ctx = self.loops.last().expect("parser rejects continue outside loops");
                let (pops, start) = (self.depth - ctx.depth, ctx.start);
                self.b.emit_op(Opcode::ScopePopJump);
                self.b.emit_addr(pops);
                self.b.emit_addr(start);
            }
            Stmt::FuncDef { names, params, body, line } => {
                self.func_def(Some(names), params, body, *line);
                if names.len() == 1 {
                    self.b.emit_op(Opcode::Store);
                    self.b.emit_byte(1);
                    self.b.emit_addr(1);
                    self.b.emit_str(&names[0]);
                }
            }
            Stmt::Return(values) => {
                match values.len() {
                    0 => self.b.emit_op(Opcode::Nil),
                    1 => self.expr(&values[0]),
                    _ => {
                        for value in values {
                            self.expr(value);
                        }
                        self.b.emit_op(Opcode::Tuple);
                        self.b.emit_addr(values.len());
                    }
                }
                self.b.emit_op(Opcode::Halt);
            }
            Stmt::Assign { targets, local, values, line } => {
                for target in targets {
                    if let AssignTarget::Index { obj, key } = target {
                        self.expr(obj);
                        self.expr(key);
                    }
                }
                for value in values {
                    self.expr(value);
                }

                self.b.emit_op(Opcode::MultiAssign);
                self.b.emit_addr(*line);
                self.b.emit_byte(u8::from(*local));
                self.b.emit_addr(values.len());
                self.b.emit_addr(targets.len());
                // descriptors are emitted in reverse so the VM can interleave
                // popping index operands with reading them
                for target in targets.iter().rev() {
                    match target {
                        AssignTarget::Name(name) => {
                            self.b.emit_byte(1);
                            self.b.emit_str(name);
                        }
                        AssignTarget::Index { .. } => self.b.emit_byte(0),
                    }
                }
            }
        }
    }

    /// Patches pending breaks to the current position and pops the context.
    fn finish_loop(&mut self) {
        let ctx = self.loops.pop().expect("loop context");
        for patch in ctx.breaks {
            self.b.patch_addr(patch, self.b.pos());
        }
    }

    fn func_def(&mut self, names: Option<&[Box<str>]>, params: &[Box<str>], body: &Block, line: usize) {
        self.b.emit_op(Opcode::FuncDef);
        self.b.emit_addr(line);
        match names {
            None => {
                self.b.emit_addr(0);
            }
            Some(names) => {
                self.b.emit_addr(names.len());
                for name in names {
                    self.b.emit_str(name);
                }
            }
        }
        self.b.emit_addr(params.len());
        for param in params {
            self.b.emit_str(param);
        }

        // the body is compiled into a fresh buffer with its own loop state
        let mut inner = Compiler::new();
        inner.block(body);
        inner.b.emit_op(Opcode::Nil);
        inner.b.emit_op(Opcode::Halt);
        self.b.emit_block(&inner.b);
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Num(n) => {
                self.b.emit_op(Opcode::Num);
                self.b.emit_num(*n);
            }
            Expr::Str(s) => {
                self.b.emit_op(Opcode::Str);
                self.b.emit_str(s);
            }
            Expr::Name(name) => {
                self.b.emit_op(Opcode::LoadVar);
                self.b.emit_str(name);
            }
            Expr::True => self.b.emit_op(Opcode::True),
            Expr::False => self.b.emit_op(Opcode::False),
            Expr::Nil => self.b.emit_op(Opcode::Nil),
            Expr::Binary { op, lhs, rhs, line } => {
                self.expr(lhs);
                self.expr(rhs);
                let opcode = match op {
                    BinOp::Add => Opcode::Add,
                    BinOp::Sub => Opcode::Sub,
                    BinOp::Mul => Opcode::Mul,
                    BinOp::Div => Opcode::Div,
                    BinOp::Mod => Opcode::Mod,
                    BinOp::Gt => Opcode::Gt,
                    BinOp::Lt => Opcode::Lt,
                    BinOp::Ge => Opcode::Ge,
                    BinOp::Le => Opcode::Le,
                    BinOp::Eq => Opcode::Eq,
                    BinOp::Ne => Opcode::Ne,
                };
                self.b.emit_op(opcode);
                if !matches!(op, BinOp::Eq | BinOp::Ne) {
                    self.b.emit_addr(*line);
                }
            }
            Expr::And { lhs, rhs } => {
                self.expr(lhs);
                let over = self.b.emit_jump(Opcode::JumpIfFalse, 1);
                self.b.emit_op(Opcode::Pop);
                self.b.emit_addr(1);
                self.expr(rhs);
                self.b.patch_addr(over, self.b.pos());
            }
            Expr::Or { lhs, rhs } => {
                self.expr(lhs);
                let over = self.b.emit_jump(Opcode::JumpIfTrue, 1);
                self.b.emit_op(Opcode::Pop);
                self.b.emit_addr(1);
                self.expr(rhs);
                self.b.patch_addr(over, self.b.pos());
            }
            Expr::Unary { op, expr, line } => {
                self.expr(expr);
                let opcode = match op {
                    UnOp::Pos => Opcode::Pos,
                    UnOp::Neg => Opcode::Neg,
                    UnOp::Not => Opcode::Not,
                };
                self.b.emit_op(opcode);
                if !matches!(op, UnOp::Not) {
                    self.b.emit_addr(*line);
                }
            }
            Expr::Call { callee, args, line } => {
                self.expr(callee);
                for arg in args {
                    self.expr(arg);
                }
                self.b.emit_op(Opcode::Call);
                self.b.emit_addr(args.len());
                self.b.emit_addr(*line);
            }
            Expr::Index { obj, key, line } => {
                self.expr(obj);
                self.expr(key);
                self.b.emit_op(Opcode::GetIndex);
                self.b.emit_addr(*line);
            }
            Expr::Table { entries } => {
                self.b.emit_op(Opcode::Table);
                for (i, (key, value)) in entries.iter().enumerate() {
                    match key {
                        Some(key) => self.expr(key),
                        // a bare entry is keyed by its 0-based source position
                        None => {
                            self.b.emit_op(Opcode::Num);
                            self.b.emit_num(i as f64);
                        }
                    }
                    self.expr(value);
                    self.b.emit_op(Opcode::SetIndex);
                    self.b.emit_addr(0);
                    self.b.emit_byte(1);
                }
            }
            Expr::List(items) => {
                for item in items {
                    self.expr(item);
                }
                self.b.emit_op(Opcode::List);
                self.b.emit_addr(items.len());
            }
            Expr::Func { params, body, line } => {
                self.func_def(None, params, body, *line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_program;

    fn compile(src: &str) -> Code {
        compile_program(&parse_program(src).expect("parse"))
    }

    #[test]
    fn trivial_program_ends_with_halt() {
        let code = compile("x := 1");
        let listing = code.disassemble();
        assert!(listing.contains("Num 1"));
        assert!(listing.contains("MultiAssign"));
        assert!(listing.trim_end().ends_with("Halt"));
    }

    #[test]
    fn expression_statements_are_popped() {
        let code = compile("1 + 2");
        let listing = code.disassemble();
        assert!(listing.contains("Add"));
        assert!(listing.contains("Pop 1"));
    }

    #[test]
    fn short_circuit_and_keeps_tested_value() {
        let code = compile("x := a and b");
        let listing = code.disassemble();
        assert!(listing.contains("JumpIfFalse"));
        assert!(listing.contains("pushback:1"));
    }

    #[test]
    fn while_loop_jumps_back_to_condition() {
        let code = compile("while x do y := 1 end");
        let listing = code.disassemble();
        assert!(listing.contains("JumpIfFalse"));
        assert!(listing.contains("PushClosure"));
        assert!(listing.contains("PopClosure"));
        // the back edge targets offset 0, where the condition starts
        assert!(listing.contains("Jump 0"));
    }

    #[test]
    fn for_loop_emits_iter_and_next() {
        let code = compile("for k, v in t do end");
        let listing = code.disassemble();
        assert!(listing.contains("Iter"));
        assert!(listing.contains("Next"));
        assert!(listing.contains(" k v "));
    }

    #[test]
    fn break_targets_loop_end() {
        let code = compile("while x do break end");
        let listing = code.disassemble();
        assert!(listing.contains("ScopePopJump count:1"));
    }

    #[test]
    fn nested_function_bodies_are_embedded() {
        let code = compile("f := func(a, b) return a end");
        let listing = code.disassemble();
        assert!(listing.contains("FuncDef"));
        assert!(listing.contains("<anonymous>"));
        assert!(listing.contains("bodysize:"));
        // the body appears indented
        assert!(listing.contains("  0 LoadVar |a|"));
    }

    #[test]
    fn named_function_statement_stores_its_name() {
        let code = compile("func hello() end");
        let listing = code.disassemble();
        assert!(listing.contains(" hello"));
        assert!(listing.contains("Store local:1 count:1 hello"));
    }

    #[test]
    fn multi_assign_descriptors_are_reversed() {
        let code = compile("a, t[1] = 1, 2");
        let listing = code.disassemble();
        // index descriptor first because targets are emitted reversed
        assert!(listing.contains("targetc:2 [index] a"));
    }
}
