use std::rc::Rc;

use tracing::debug;

use crate::ast::{
    self, BinOp, Block, Expr, Literal, LogicalOp, Param, Scope, Span, Stmt, Type, UnaryOp,
};
use crate::value::{Function, Value};

use super::frame::{FrameAllocator, Program};
use super::memory::Memory;
use super::opcode::{CastTarget, GlobalIdx, Instruction, Opcode, Operand, Reg};
use super::CompileError;

type CompileResult<T> = Result<T, CompileError>;

fn r(reg: Reg) -> Operand {
    Operand::Reg(reg)
}

fn lit(n: u32) -> Operand {
    Operand::Literal(n)
}

/// Lowering state for one function body.
#[derive(Default)]
struct FunctionState {
    alloc: FrameAllocator,
    locals: Vec<(String, Reg)>,
}

/// Where an expression's value lives. Temporaries are released by whoever
/// consumes them; locals are borrowed and left alone.
#[derive(Debug, Clone, Copy)]
struct Slot {
    reg: Reg,
    temp: bool,
}

impl Slot {
    fn temp(reg: Reg) -> Self {
        Slot { reg, temp: true }
    }

    fn local(reg: Reg) -> Self {
        Slot { reg, temp: false }
    }
}

pub(crate) struct Compiler {
    memory: Memory,
    current: FunctionState,
    span: Span,
}

impl Compiler {
    pub(crate) fn new() -> Self {
        Compiler { memory: Memory::new(), current: FunctionState::default(), span: Span::UNKNOWN }
    }

    pub(crate) fn compile_program(mut self, program: &ast::Program) -> CompileResult<Program> {
        self.current.alloc.reset();
        self.declare_globals(&program.body);
        self.block(&program.body)?;
        let registers = self.current.alloc.peak();
        debug!(
            instructions = self.memory.here(),
            constants = self.memory.constants().len(),
            globals = self.memory.globals().len(),
            registers,
            "compiled program"
        );
        let mut compiled = Program { memory: self.memory, main_frame: Default::default() };
        compiled.declare_main_registers(registers);
        Ok(compiled)
    }

    /// Globals are visible before their declaration runs, so a function
    /// body may refer to a global declared further down.
    fn declare_globals(&mut self, block: &Block) {
        for stmt in block {
            match &stmt.node {
                Stmt::Declare { name, scope: Scope::Global, .. } => {
                    self.memory.declare_global(name);
                }
                Stmt::If { then_branch, elifs, else_branch, .. } => {
                    self.declare_globals(then_branch);
                    for (_, body) in elifs {
                        self.declare_globals(body);
                    }
                    self.declare_globals(else_branch);
                }
                Stmt::While { body, .. } | Stmt::For { body, .. } => self.declare_globals(body),
                _ => {}
            }
        }
    }

    // ---- Emission helpers ----

    fn emit(&mut self, op: Opcode, operands: &[Operand]) -> CompileResult<usize> {
        let inst = Instruction::encode(op, operands)?;
        Ok(self.memory.emit(inst, self.span))
    }

    /// Emits a jump with a placeholder target, to be patched later.
    fn emit_jump(&mut self, op: Opcode, cond: Option<Reg>) -> CompileResult<usize> {
        match cond {
            Some(reg) => self.emit(op, &[r(reg), lit(0)]),
            None => self.emit(op, &[lit(0)]),
        }
    }

    fn patch_here(&mut self, at: usize) {
        let here = self.memory.here();
        self.memory.patch(at, here);
    }

    fn temp(&mut self) -> Reg {
        self.current.alloc.acquire(false)
    }

    fn release(&mut self, slot: Slot) {
        if slot.temp {
            self.current.alloc.release(slot.reg, false);
        }
    }

    fn add_local(&mut self, name: &str, reg: Reg) {
        self.current.locals.push((name.to_string(), reg));
    }

    fn resolve_local(&self, name: &str) -> CompileResult<Reg> {
        self.current
            .locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, reg)| *reg)
            .ok_or_else(|| CompileError::UndefinedLocal { name: name.to_string() })
    }

    fn resolve_global(&self, name: &str) -> CompileResult<GlobalIdx> {
        self.memory
            .resolve_global(name)
            .ok_or_else(|| CompileError::UndefinedGlobal { name: name.to_string() })
    }

    // ---- Statements ----

    fn block(&mut self, stmts: &Block) -> CompileResult<()> {
        let saved_locals = self.current.locals.len();
        let saved_span = self.span;
        for stmt in stmts {
            self.span = stmt.span;
            self.stmt(&stmt.node)?;
        }
        self.span = saved_span;
        self.end_scope(saved_locals);
        Ok(())
    }

    /// Drops the locals declared since `saved` and frees their registers.
    fn end_scope(&mut self, saved: usize) {
        for (_, reg) in self.current.locals.split_off(saved) {
            self.current.alloc.release(reg, true);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Declare { name, scope: Scope::Local, value, .. } => {
                let reg = self.current.alloc.acquire(true);
                match value {
                    Some(value) => self.expr_into(value, reg)?,
                    None => {
                        self.emit(Opcode::LoadNone, &[r(reg)])?;
                    }
                }
                self.add_local(name, reg);
            }

            Stmt::Declare { name, scope: Scope::Global, value, .. } => {
                let global = self.memory.declare_global(name);
                let slot = match value {
                    Some(value) => self.expr(value)?,
                    None => {
                        let t = self.temp();
                        self.emit(Opcode::LoadNone, &[r(t)])?;
                        Slot::temp(t)
                    }
                };
                self.emit(Opcode::SetGlobal, &[Operand::Global(global), r(slot.reg)])?;
                self.release(slot);
            }

            Stmt::Expr(expr) => {
                let slot = self.expr(expr)?;
                self.release(slot);
            }

            Stmt::Print(expr) => {
                let slot = self.expr(expr)?;
                self.emit(Opcode::Print, &[r(slot.reg)])?;
                self.release(slot);
            }

            Stmt::If { condition, then_branch, elifs, else_branch } => {
                let mut exits = Vec::new();
                let mut skip = self.branch_if_false(condition)?;
                self.block(then_branch)?;
                for (condition, body) in elifs {
                    exits.push(self.emit_jump(Opcode::Jump, None)?);
                    self.patch_here(skip);
                    skip = self.branch_if_false(condition)?;
                    self.block(body)?;
                }
                if else_branch.is_empty() {
                    self.patch_here(skip);
                } else {
                    exits.push(self.emit_jump(Opcode::Jump, None)?);
                    self.patch_here(skip);
                    self.block(else_branch)?;
                }
                for exit in exits {
                    self.patch_here(exit);
                }
            }

            Stmt::While { condition, body } => {
                let top = self.memory.here();
                let exit = self.branch_if_false(condition)?;
                self.block(body)?;
                self.emit(Opcode::Jump, &[lit(top as u32)])?;
                self.patch_here(exit);
            }

            Stmt::For { binding, index, iterable, body } => {
                self.for_loop(binding, index.as_deref(), iterable, body)?;
            }

            Stmt::Return(value) => {
                let slot = match value {
                    Some(value) => self.expr(value)?,
                    None => {
                        let t = self.temp();
                        self.emit(Opcode::LoadNone, &[r(t)])?;
                        Slot::temp(t)
                    }
                };
                self.emit(Opcode::Return, &[r(slot.reg)])?;
                self.release(slot);
            }

            Stmt::Delete { object, index } => {
                let obj = self.operand(object, &[index])?;
                let key = self.expr(index)?;
                self.emit(Opcode::Delete, &[r(obj.reg), r(key.reg)])?;
                self.release(key);
                self.release(obj);
            }
        }
        Ok(())
    }

    /// Evaluates `condition` and emits the `JMPF` that skips what follows.
    fn branch_if_false(&mut self, condition: &Expr) -> CompileResult<usize> {
        let slot = self.expr(condition)?;
        let at = self.emit_jump(Opcode::JumpIfFalse, Some(slot.reg))?;
        self.release(slot);
        Ok(at)
    }

    fn for_loop(
        &mut self,
        binding: &str,
        index: Option<&str>,
        iterable: &Expr,
        body: &Block,
    ) -> CompileResult<()> {
        // The body may rebind the iterated local, so iterate over a copy.
        let coll = match self.expr(iterable)? {
            slot if slot.temp => slot,
            local => {
                let copy = self.temp();
                self.emit(Opcode::Move, &[r(copy), r(local.reg)])?;
                Slot::temp(copy)
            }
        };
        let pos = self.current.alloc.acquire(true);
        let len = self.current.alloc.acquire(true);
        let step = self.current.alloc.acquire(true);
        let zero = self.memory.intern_constant(Value::Number(0.0));
        let one = self.memory.intern_constant(Value::Number(1.0));
        self.emit(Opcode::LoadConst, &[r(pos), Operand::Const(zero)])?;
        self.emit(Opcode::Len, &[r(len), r(coll.reg)])?;
        self.emit(Opcode::LoadConst, &[r(step), Operand::Const(one)])?;

        let top = self.memory.here();
        let test = self.temp();
        self.emit(Opcode::Lt, &[r(test), r(pos), r(len)])?;
        let exit = self.emit_jump(Opcode::JumpIfFalse, Some(test))?;
        self.current.alloc.release(test, false);

        let saved_locals = self.current.locals.len();
        let item = self.current.alloc.acquire(true);
        self.emit(Opcode::IterValue, &[r(item), r(coll.reg), r(pos)])?;
        self.add_local(binding, item);
        if let Some(index) = index {
            let key = self.current.alloc.acquire(true);
            self.emit(Opcode::IterKey, &[r(key), r(coll.reg), r(pos)])?;
            self.add_local(index, key);
        }
        self.block(body)?;
        self.end_scope(saved_locals);

        self.emit(Opcode::Add, &[r(pos), r(pos), r(step)])?;
        self.emit(Opcode::Jump, &[lit(top as u32)])?;
        self.patch_here(exit);

        for reg in [step, len, pos] {
            self.current.alloc.release(reg, true);
        }
        self.release(coll);
        Ok(())
    }

    // ---- Expressions ----

    /// Lowers `expr` into whatever register suits it. Local reads return
    /// the local's own register without a copy.
    fn expr(&mut self, expr: &Expr) -> CompileResult<Slot> {
        match expr {
            Expr::Variable { name, scope: Scope::Local } => {
                Ok(Slot::local(self.resolve_local(name)?))
            }
            Expr::Assign { name, scope, value } => self.assign(name, *scope, value),
            Expr::AssignIndex { target, index, value } => {
                let container = self.operand(target, &[&**index, &**value])?;
                let key = self.operand(index, &[&**value])?;
                let value = self.expr(value)?;
                self.emit(Opcode::SetIndex, &[r(container.reg), r(key.reg), r(value.reg)])?;
                self.release(key);
                self.release(container);
                Ok(value)
            }
            Expr::AssignProperty { object, name, value } => {
                let obj = self.operand(object, &[&**value])?;
                let value = self.expr(value)?;
                let prop = self.memory.intern_name(name);
                self.emit(Opcode::SetProp, &[r(obj.reg), Operand::Prop(prop), r(value.reg)])?;
                self.release(obj);
                Ok(value)
            }
            Expr::Call { callee, args } => Ok(Slot::temp(self.call(callee, args)?)),
            _ => {
                let t = self.temp();
                self.expr_into(expr, t)?;
                Ok(Slot::temp(t))
            }
        }
    }

    /// Lowers an operand that is read after `later` is evaluated. A local
    /// that one of them assigns is copied first, so operands are read
    /// left to right.
    fn operand(&mut self, expr: &Expr, later: &[&Expr]) -> CompileResult<Slot> {
        let slot = self.expr(expr)?;
        if slot.temp || !later.iter().any(|e| self.assigns(e, slot.reg)) {
            return Ok(slot);
        }
        let copy = self.temp();
        self.emit(Opcode::Move, &[r(copy), r(slot.reg)])?;
        Ok(Slot::temp(copy))
    }

    /// Whether evaluating `expr` stores into the local held in `reg`.
    /// Function bodies are skipped: they only see copies of enclosing locals.
    fn assigns(&self, expr: &Expr, reg: Reg) -> bool {
        match expr {
            Expr::Literal(_) | Expr::Variable { .. } | Expr::Function { .. } => false,
            Expr::Assign { name, scope, value } => {
                (*scope == Scope::Local && self.resolve_local(name).ok() == Some(reg))
                    || self.assigns(value, reg)
            }
            Expr::AssignIndex { target, index, value } => {
                [target, index, value].iter().any(|e| self.assigns(e, reg))
            }
            Expr::AssignProperty { object, value, .. } => {
                self.assigns(object, reg) || self.assigns(value, reg)
            }
            Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
                self.assigns(left, reg) || self.assigns(right, reg)
            }
            Expr::Index { object: left, index: right }
            | Expr::Range { start: left, end: right, .. } => {
                self.assigns(left, reg) || self.assigns(right, reg)
            }
            Expr::Unary { operand: inner, .. }
            | Expr::Property { object: inner, .. }
            | Expr::Cast { value: inner, .. } => self.assigns(inner, reg),
            Expr::List(items) => items.iter().any(|e| self.assigns(e, reg)),
            Expr::Dict(fields) | Expr::Object { fields, .. } => {
                fields.iter().any(|(_, e)| self.assigns(e, reg))
            }
            Expr::Call { callee, args } => {
                self.assigns(callee, reg) || args.iter().any(|e| self.assigns(e, reg))
            }
        }
    }

    fn assign(&mut self, name: &str, scope: Scope, value: &Expr) -> CompileResult<Slot> {
        match scope {
            Scope::Local => {
                let target = self.resolve_local(name)?;
                let slot = self.expr(value)?;
                if slot.reg != target {
                    self.emit(Opcode::Move, &[r(target), r(slot.reg)])?;
                }
                self.release(slot);
                Ok(Slot::local(target))
            }
            Scope::Global => {
                let global = self.resolve_global(name)?;
                let slot = self.expr(value)?;
                self.emit(Opcode::SetGlobal, &[Operand::Global(global), r(slot.reg)])?;
                Ok(slot)
            }
        }
    }

    /// Lowers `expr` so its value ends up in `dst`.
    fn expr_into(&mut self, expr: &Expr, dst: Reg) -> CompileResult<()> {
        match expr {
            Expr::Literal(literal) => self.literal(literal, dst)?,

            Expr::Variable { name, scope: Scope::Local } => {
                let src = self.resolve_local(name)?;
                if src != dst {
                    self.emit(Opcode::Move, &[r(dst), r(src)])?;
                }
            }

            Expr::Variable { name, scope: Scope::Global } => {
                let global = self.resolve_global(name)?;
                self.emit(Opcode::GetGlobal, &[r(dst), Operand::Global(global)])?;
            }

            Expr::Assign { .. } | Expr::AssignIndex { .. } | Expr::AssignProperty { .. } => {
                let slot = self.expr(expr)?;
                if slot.reg != dst {
                    self.emit(Opcode::Move, &[r(dst), r(slot.reg)])?;
                }
                self.release(slot);
            }

            Expr::Binary { op, left, right } => {
                let l = self.operand(left, &[&**right])?;
                let rhs = self.expr(right)?;
                self.emit(binary_opcode(*op), &[r(dst), r(l.reg), r(rhs.reg)])?;
                self.release(rhs);
                self.release(l);
            }

            Expr::Logical { op, left, right } => {
                self.expr_into(left, dst)?;
                let jump = match op {
                    LogicalOp::And => Opcode::JumpIfFalse,
                    LogicalOp::Or => Opcode::JumpIfTrue,
                };
                let short = self.emit_jump(jump, Some(dst))?;
                self.expr_into(right, dst)?;
                self.patch_here(short);
            }

            Expr::Unary { op, operand } => {
                let slot = self.expr(operand)?;
                let opcode = match op {
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::Negate => Opcode::Neg,
                };
                self.emit(opcode, &[r(dst), r(slot.reg)])?;
                self.release(slot);
            }

            Expr::List(items) => {
                let count = items.len() as u32;
                let base = self.current.alloc.acquire_span(count);
                for (i, item) in items.iter().enumerate() {
                    self.expr_into(item, base.offset(i as u32))?;
                }
                self.emit(Opcode::NewList, &[r(dst), r(base), lit(count)])?;
                self.current.alloc.release_span(base, count);
            }

            Expr::Dict(entries) => {
                self.emit(Opcode::NewDict, &[r(dst)])?;
                self.set_fields(dst, entries)?;
            }

            Expr::Object { class, fields } => {
                let class = self.memory.intern_name(class);
                self.emit(Opcode::NewObject, &[r(dst), Operand::Prop(class)])?;
                self.set_fields(dst, fields)?;
            }

            Expr::Index { object, index } => {
                let obj = self.operand(object, &[&**index])?;
                let key = self.expr(index)?;
                self.emit(Opcode::GetIndex, &[r(dst), r(obj.reg), r(key.reg)])?;
                self.release(key);
                self.release(obj);
            }

            Expr::Property { object, name } => {
                let obj = self.expr(object)?;
                let prop = self.memory.intern_name(name);
                self.emit(Opcode::GetProp, &[r(dst), r(obj.reg), Operand::Prop(prop)])?;
                self.release(obj);
            }

            Expr::Function { name, params, captures, body, .. } => {
                self.function(name.as_deref(), params, captures, body, dst)?;
            }

            Expr::Call { callee, args } => {
                let base = self.call(callee, args)?;
                self.emit(Opcode::Move, &[r(dst), r(base)])?;
                self.current.alloc.release(base, false);
            }

            Expr::Cast { value, ty } => {
                let slot = self.expr(value)?;
                match cast_target(ty) {
                    Some(target) => {
                        self.emit(Opcode::Cast, &[r(dst), r(slot.reg), lit(target as u32)])?;
                    }
                    None if slot.reg != dst => {
                        self.emit(Opcode::Move, &[r(dst), r(slot.reg)])?;
                    }
                    None => {}
                }
                self.release(slot);
            }

            Expr::Range { start, end, inclusive } => {
                let lo = self.operand(start, &[&**end])?;
                let hi = self.expr(end)?;
                let op = if *inclusive { Opcode::RangeInclusive } else { Opcode::Range };
                self.emit(op, &[r(dst), r(lo.reg), r(hi.reg)])?;
                self.release(hi);
                self.release(lo);
            }
        }
        Ok(())
    }

    fn literal(&mut self, literal: &Literal, dst: Reg) -> CompileResult<()> {
        match literal {
            Literal::None => {
                self.emit(Opcode::LoadNone, &[r(dst)])?;
            }
            Literal::Bool(b) => {
                self.emit(Opcode::LoadBool, &[r(dst), lit(*b as u32)])?;
            }
            Literal::Number(n) => {
                let k = self.memory.intern_constant(Value::Number(*n));
                self.emit(Opcode::LoadConst, &[r(dst), Operand::Const(k)])?;
            }
            Literal::String(s) => {
                let k = self.memory.intern_constant(Value::string(s.as_str()));
                self.emit(Opcode::LoadConst, &[r(dst), Operand::Const(k)])?;
            }
        }
        Ok(())
    }

    fn set_fields(&mut self, dst: Reg, fields: &[(String, Expr)]) -> CompileResult<()> {
        for (name, value) in fields {
            let slot = self.expr(value)?;
            let prop = self.memory.intern_name(name);
            self.emit(Opcode::SetProp, &[r(dst), Operand::Prop(prop), r(slot.reg)])?;
            self.release(slot);
        }
        Ok(())
    }

    /// Lays out `callee, args...` in a fresh span and emits `CALL`. The
    /// returned base register holds the result and is a live temporary.
    fn call(&mut self, callee: &Expr, args: &[Expr]) -> CompileResult<Reg> {
        let argc = args.len() as u32;
        let base = self.current.alloc.acquire_span(argc + 1);
        self.expr_into(callee, base)?;
        for (i, arg) in args.iter().enumerate() {
            self.expr_into(arg, base.offset(1 + i as u32))?;
        }
        self.emit(Opcode::Call, &[r(base), lit(argc)])?;
        self.current.alloc.release_span(base.offset(1), argc);
        Ok(base)
    }

    /// Emits the body inline behind a jump, then materialises the function
    /// value into `dst`.
    fn function(
        &mut self,
        name: Option<&str>,
        params: &[Param],
        captures: &[String],
        body: &Block,
        dst: Reg,
    ) -> CompileResult<()> {
        let skip = self.emit_jump(Opcode::Jump, None)?;
        let entry = self.memory.here();
        let saved_span = self.span;

        let enclosing = std::mem::take(&mut self.current);
        let lowered = self.function_body(params, captures, body);
        let inner = std::mem::replace(&mut self.current, enclosing);
        self.span = saved_span;
        lowered?;

        self.patch_here(skip);
        let registers = inner.alloc.peak();
        let proto = Function {
            name: name.map(Rc::from),
            arity: params.len() as u32,
            entry,
            registers,
            capture_count: captures.len() as u32,
            captures: Vec::new(),
        };
        debug!(
            name = name.unwrap_or("<anonymous>"),
            entry,
            arity = proto.arity,
            registers,
            captures = proto.capture_count,
            "compiled function"
        );
        let k = self.memory.add_constant(Value::Function(Rc::new(proto)));

        if captures.is_empty() {
            self.emit(Opcode::LoadConst, &[r(dst), Operand::Const(k)])?;
            return Ok(());
        }
        let count = captures.len() as u32;
        let base = self.current.alloc.acquire_span(count);
        for (i, capture) in captures.iter().enumerate() {
            let src = self
                .resolve_local(capture)
                .map_err(|_| CompileError::UndefinedCapture { name: capture.clone() })?;
            self.emit(Opcode::Move, &[r(base.offset(i as u32)), r(src)])?;
        }
        self.emit(Opcode::Closure, &[r(dst), Operand::Const(k), r(base)])?;
        self.current.alloc.release_span(base, count);
        Ok(())
    }

    /// Params take registers `0..arity`, captures the next ones.
    fn function_body(
        &mut self,
        params: &[Param],
        captures: &[String],
        body: &Block,
    ) -> CompileResult<()> {
        for param in params {
            let reg = self.current.alloc.acquire(true);
            self.add_local(&param.name, reg);
        }
        for capture in captures {
            let reg = self.current.alloc.acquire(true);
            self.add_local(capture, reg);
        }
        self.block(body)?;
        if !matches!(body.last().map(|s| &s.node), Some(Stmt::Return(_))) {
            let t = self.temp();
            self.emit(Opcode::LoadNone, &[r(t)])?;
            self.emit(Opcode::Return, &[r(t)])?;
            self.current.alloc.release(t, false);
        }
        Ok(())
    }
}

fn binary_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Subtract => Opcode::Sub,
        BinOp::Multiply => Opcode::Mul,
        BinOp::Divide => Opcode::Div,
        BinOp::Equals => Opcode::Eq,
        BinOp::NotEquals => Opcode::Ne,
        BinOp::LessThan => Opcode::Lt,
        BinOp::LessOrEqual => Opcode::Le,
        BinOp::GreaterThan => Opcode::Gt,
        BinOp::GreaterOrEqual => Opcode::Ge,
    }
}

/// Casts to other types are identities once the analyzer has checked them.
fn cast_target(ty: &Type) -> Option<CastTarget> {
    match ty {
        Type::String => Some(CastTarget::String),
        Type::Number => Some(CastTarget::Number),
        Type::Bool => Some(CastTarget::Bool),
        _ => None,
    }
}
