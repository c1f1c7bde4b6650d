use std::cmp::Ordering;
use std::io::Write;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::config::Config;
use crate::value::{Dictionary, Object, Value};

use super::frame::{Frame, Program};
use super::opcode::{CastTarget, ConstIdx, GlobalIdx, Instruction, Opcode, PropIdx, Reg};
use super::{Fault, VmError, VmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    /// Returned from the root frame or ran off the end of the code.
    Halted,
    /// Stopped on a runtime or internal error.
    Faulted,
}

/// Executes a [`Program`] in place. The root frame is borrowed out of the
/// program for the run and handed back on halt, globals stay in memory.
pub struct Vm<'p> {
    program: &'p mut Program,
    current: Frame,
    callers: Vec<Frame>,
    pc: usize,
    state: VmState,
    max_call_depth: usize,
    trace_execution: bool,
}

impl<'p> Vm<'p> {
    pub fn new(program: &'p mut Program, config: &Config) -> Self {
        let mut current = std::mem::take(&mut program.main_frame);
        let size = current.size() as u32;
        current.setup(size, None, Reg(0));
        Vm {
            program,
            current,
            callers: Vec::new(),
            pc: 0,
            state: VmState::Running,
            max_call_depth: config.max_call_depth,
            trace_execution: config.trace_execution,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// Frames on the call stack, the root frame included.
    pub fn depth(&self) -> usize {
        self.callers.len() + 1
    }

    pub fn run(&mut self, out: &mut dyn Write) -> Result<Value, Fault> {
        if self.state != VmState::Running {
            return Err(self.fault(VmError::Corrupt("executor already halted")));
        }
        let result = self.execute(out);
        let outcome = match result {
            Ok(value) => {
                self.state = VmState::Halted;
                debug!(pc = self.pc, result = %value, "halted");
                Ok(value)
            }
            Err(error) => {
                self.state = VmState::Faulted;
                let fault = self.fault(error);
                debug!(pc = fault.address, depth = fault.depth, error = %fault.error, "faulted");
                Err(fault)
            }
        };
        self.restore_main_frame();
        outcome
    }

    fn fault(&self, error: VmError) -> Fault {
        Fault {
            error,
            address: self.pc,
            depth: self.depth(),
            span: self.program.memory.span_at(self.pc),
        }
    }

    fn restore_main_frame(&mut self) {
        let main = if self.callers.is_empty() {
            std::mem::take(&mut self.current)
        } else {
            let main = self.callers.swap_remove(0);
            self.callers.clear();
            self.current = Frame::default();
            main
        };
        self.program.main_frame = main;
    }

    #[inline(always)]
    fn reg(&self, reg: Reg) -> &Value {
        self.current.get(reg)
    }

    fn execute(&mut self, out: &mut dyn Write) -> VmResult<Value> {
        loop {
            let Some(inst) = self.program.memory.fetch(self.pc) else {
                if self.callers.is_empty() {
                    return Ok(Value::None);
                }
                return Err(VmError::Corrupt("ran off the end of the code inside a call"));
            };
            if self.trace_execution {
                trace!(pc = self.pc, depth = self.depth(), "{}", inst);
            }
            let mut next = self.pc + 1;

            match inst.op {
                Opcode::LoadConst => {
                    let value = self.program.memory.constant(ConstIdx(inst.word(1))).clone();
                    self.current.set(inst.reg(0), value);
                }
                Opcode::LoadNone => self.current.set(inst.reg(0), Value::None),
                Opcode::LoadBool => self.current.set(inst.reg(0), Value::Bool(inst.word(1) != 0)),
                Opcode::Move => {
                    let value = self.reg(inst.reg(1)).clone();
                    self.current.set(inst.reg(0), value);
                }

                Opcode::GetGlobal => {
                    let value = self.program.memory.global_value(GlobalIdx(inst.word(1))).clone();
                    self.current.set(inst.reg(0), value);
                }
                Opcode::SetGlobal => {
                    let value = self.reg(inst.reg(1)).clone();
                    self.program.memory.set_global(GlobalIdx(inst.word(0)), value);
                }

                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                    let value = arithmetic(inst.op, self.reg(inst.reg(1)), self.reg(inst.reg(2)))?;
                    self.current.set(inst.reg(0), value);
                }
                Opcode::Eq | Opcode::Ne => {
                    let equal = self.reg(inst.reg(1)) == self.reg(inst.reg(2));
                    self.current.set(inst.reg(0), Value::Bool(equal == (inst.op == Opcode::Eq)));
                }
                Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                    let test: fn(Ordering) -> bool = match inst.op {
                        Opcode::Lt => Ordering::is_lt,
                        Opcode::Le => Ordering::is_le,
                        Opcode::Gt => Ordering::is_gt,
                        _ => Ordering::is_ge,
                    };
                    let (a, b) = (self.reg(inst.reg(1)), self.reg(inst.reg(2)));
                    let result = compare(inst.op, a, b, test)?;
                    self.current.set(inst.reg(0), Value::Bool(result));
                }
                Opcode::Neg => {
                    let value = match self.reg(inst.reg(1)) {
                        Value::Number(n) => Value::Number(-n),
                        other => return Err(VmError::internal(inst.op, other.type_name())),
                    };
                    self.current.set(inst.reg(0), value);
                }
                Opcode::Not => {
                    let value = !self.reg(inst.reg(1)).is_truthy();
                    self.current.set(inst.reg(0), Value::Bool(value));
                }
                Opcode::Cast => {
                    let code = inst.word(2);
                    let target = CastTarget::from_literal(code).ok_or_else(|| {
                        VmError::internal(inst.op, format!("cast target #{}", code))
                    })?;
                    let value = cast(self.reg(inst.reg(1)), target)?;
                    self.current.set(inst.reg(0), value);
                }

                Opcode::Jump => next = inst.word(0) as usize,
                Opcode::JumpIfFalse => {
                    if !self.reg(inst.reg(0)).is_truthy() {
                        next = inst.word(1) as usize;
                    }
                }
                Opcode::JumpIfTrue => {
                    if self.reg(inst.reg(0)).is_truthy() {
                        next = inst.word(1) as usize;
                    }
                }

                Opcode::NewList => {
                    let base = inst.reg(1);
                    let items =
                        (0..inst.word(2)).map(|i| self.reg(base.offset(i)).clone()).collect();
                    self.current.set(inst.reg(0), Value::list(items));
                }
                Opcode::NewDict => self.current.set(inst.reg(0), Value::dict(Dictionary::new())),
                Opcode::NewObject => {
                    let class = self.program.memory.name(PropIdx(inst.word(1))).clone();
                    self.current.set(inst.reg(0), Value::object(Object::new(class)));
                }
                Opcode::Range | Opcode::RangeInclusive => {
                    let value = range(inst.op, self.reg(inst.reg(1)), self.reg(inst.reg(2)))?;
                    self.current.set(inst.reg(0), value);
                }

                Opcode::GetIndex => {
                    let value = get_index(inst.op, self.reg(inst.reg(1)), self.reg(inst.reg(2)))?;
                    self.current.set(inst.reg(0), value);
                }
                Opcode::SetIndex => {
                    let value = self.reg(inst.reg(2)).clone();
                    set_index(inst.op, self.reg(inst.reg(0)), self.reg(inst.reg(1)), value)?;
                }
                Opcode::Delete => delete(inst.op, self.reg(inst.reg(0)), self.reg(inst.reg(1)))?,
                Opcode::GetProp => {
                    let name = self.program.memory.name(PropIdx(inst.word(2)));
                    let value = get_prop(inst.op, self.current.get(inst.reg(1)), name)?;
                    self.current.set(inst.reg(0), value);
                }
                Opcode::SetProp => {
                    let name = self.program.memory.name(PropIdx(inst.word(1))).clone();
                    let value = self.reg(inst.reg(2)).clone();
                    set_prop(inst.op, self.reg(inst.reg(0)), name, value)?;
                }
                Opcode::Len => {
                    let len = length(inst.op, self.reg(inst.reg(1)))?;
                    self.current.set(inst.reg(0), Value::Number(len as f64));
                }
                Opcode::IterKey | Opcode::IterValue => {
                    let value = iterate(inst.op, self.reg(inst.reg(1)), self.reg(inst.reg(2)))?;
                    self.current.set(inst.reg(0), value);
                }

                Opcode::Closure => {
                    let value = self.closure(inst)?;
                    self.current.set(inst.reg(0), value);
                }
                Opcode::Call => next = self.call(inst.reg(0), inst.word(1), next)?,
                Opcode::Return => {
                    let value = self.reg(inst.reg(0)).clone();
                    let Some(caller) = self.callers.pop() else {
                        return Ok(value);
                    };
                    let mut callee = std::mem::replace(&mut self.current, caller);
                    let Some(address) = callee.return_address else {
                        return Err(VmError::Corrupt("call frame without a return address"));
                    };
                    self.current.set(callee.result_register, value);
                    callee.free_registers();
                    debug!(depth = self.depth(), address, "return");
                    next = address;
                }
                Opcode::Print => writeln!(out, "{}", self.reg(inst.reg(0)))?,
            }

            self.pc = next;
        }
    }

    fn closure(&self, inst: Instruction) -> VmResult<Value> {
        let Value::Function(proto) = self.program.memory.constant(ConstIdx(inst.word(1))) else {
            return Err(VmError::internal(inst.op, "constant is not a function"));
        };
        let base = inst.reg(2);
        let captures = (0..proto.capture_count).map(|i| self.reg(base.offset(i)).clone()).collect();
        Ok(Value::Function(Rc::new(proto.with_captures(captures))))
    }

    /// Pushes a frame for the function in `base` and returns its entry.
    fn call(&mut self, base: Reg, argc: u32, return_address: usize) -> VmResult<usize> {
        let func = match self.reg(base) {
            Value::Function(f) => Rc::clone(f),
            other => return Err(VmError::NotCallable { tag: other.type_name() }),
        };
        if func.arity != argc {
            return Err(VmError::ArityMismatch { expected: func.arity, got: argc });
        }
        if self.depth() >= self.max_call_depth {
            return Err(VmError::CallDepthExceeded { limit: self.max_call_depth });
        }
        let mut frame = Frame::new(func.registers, Some(return_address), base);
        for i in 0..argc {
            frame.set(Reg(i), self.reg(base.offset(1 + i)).clone());
        }
        for (i, value) in func.captures.iter().enumerate() {
            frame.set(Reg(argc + i as u32), value.clone());
        }
        let caller = std::mem::replace(&mut self.current, frame);
        self.callers.push(caller);
        debug!(depth = self.depth(), entry = func.entry, "call");
        Ok(func.entry)
    }
}

// ---- Operand semantics ----

fn mismatch(op: Opcode, a: &Value, b: &Value) -> VmError {
    VmError::internal(op, format!("{} and {}", a.type_name(), b.type_name()))
}

fn arithmetic(op: Opcode, a: &Value, b: &Value) -> VmResult<Value> {
    match (op, a, b) {
        (Opcode::Add, Value::Number(x), Value::Number(y)) => Ok(Value::Number(x + y)),
        (Opcode::Add, Value::String(x), Value::String(y)) => {
            Ok(Value::string(format!("{}{}", x, y)))
        }
        (Opcode::Add, Value::List(x), Value::List(y)) => {
            let mut items = x.borrow().clone();
            items.extend(y.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (Opcode::Sub, Value::Number(x), Value::Number(y)) => Ok(Value::Number(x - y)),
        (Opcode::Mul, Value::Number(x), Value::Number(y)) => Ok(Value::Number(x * y)),
        (Opcode::Div, Value::Number(_), Value::Number(y)) if *y == 0.0 => {
            Err(VmError::DivisionByZero)
        }
        (Opcode::Div, Value::Number(x), Value::Number(y)) => Ok(Value::Number(x / y)),
        _ => Err(mismatch(op, a, b)),
    }
}

fn compare(op: Opcode, a: &Value, b: &Value, test: fn(Ordering) -> bool) -> VmResult<bool> {
    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => return Err(mismatch(op, a, b)),
    };
    // NaN compares false both ways
    Ok(ordering.is_some_and(test))
}

fn cast(value: &Value, target: CastTarget) -> VmResult<Value> {
    Ok(match target {
        CastTarget::String => match value {
            Value::String(_) => value.clone(),
            other => Value::string(other.to_string()),
        },
        CastTarget::Number => match value {
            Value::Number(_) => value.clone(),
            Value::Bool(b) => Value::Number(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(n) => Value::Number(n),
                Err(_) => return Err(VmError::InvalidCast { text: s.to_string() }),
            },
            other => {
                let detail = format!("{} to number", other.type_name());
                return Err(VmError::internal(Opcode::Cast, detail));
            }
        },
        CastTarget::Bool => Value::Bool(value.is_truthy()),
    })
}

/// Longest list a range expression may build.
pub const MAX_RANGE_LEN: usize = 1 << 24;

fn range(op: Opcode, start: &Value, end: &Value) -> VmResult<Value> {
    let (Value::Number(lo), Value::Number(hi)) = (start, end) else {
        return Err(mismatch(op, start, end));
    };
    let (lo, hi) = (lo.floor(), hi.floor());
    let len = if op == Opcode::RangeInclusive { hi - lo + 1.0 } else { hi - lo };
    if len > MAX_RANGE_LEN as f64 {
        return Err(VmError::RangeTooLarge { len, limit: MAX_RANGE_LEN });
    }
    let (lo, hi) = (lo as i64, hi as i64);
    let items: Vec<Value> = if op == Opcode::RangeInclusive {
        (lo..=hi).map(|n| Value::Number(n as f64)).collect()
    } else {
        (lo..hi).map(|n| Value::Number(n as f64)).collect()
    };
    Ok(Value::list(items))
}

/// Integral, non-negative and below `len`.
fn position(op: Opcode, key: &Value, len: usize) -> VmResult<usize> {
    match key {
        Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 && (*n as usize) < len => Ok(*n as usize),
        Value::Number(n) => Err(VmError::IndexOutOfRange { index: *n, len }),
        other => Err(VmError::internal(op, format!("index of type {}", other.type_name()))),
    }
}

fn dict_key<'a>(op: Opcode, key: &'a Value) -> VmResult<&'a str> {
    match key {
        Value::String(s) => Ok(&**s),
        other => Err(VmError::internal(op, format!("dict key of type {}", other.type_name()))),
    }
}

fn char_at(s: &str, pos: usize) -> Value {
    s.chars().nth(pos).map(|c| Value::string(c.to_string())).unwrap_or_default()
}

fn get_index(op: Opcode, container: &Value, key: &Value) -> VmResult<Value> {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let i = position(op, key, items.len())?;
            Ok(items[i].clone())
        }
        Value::Dict(dict) => {
            let key = dict_key(op, key)?;
            dict.borrow()
                .get(key)
                .cloned()
                .ok_or_else(|| VmError::MissingKey { key: key.to_string() })
        }
        Value::String(s) => {
            let i = position(op, key, s.chars().count())?;
            Ok(char_at(s, i))
        }
        other => Err(mismatch(op, other, key)),
    }
}

fn set_index(op: Opcode, container: &Value, key: &Value, value: Value) -> VmResult<()> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = position(op, key, items.len())?;
            items[i] = value;
        }
        Value::Dict(dict) => {
            let key = dict_key(op, key)?;
            dict.borrow_mut().insert(key, value);
        }
        other => return Err(mismatch(op, other, key)),
    }
    Ok(())
}

fn delete(op: Opcode, container: &Value, key: &Value) -> VmResult<()> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = position(op, key, items.len())?;
            items.remove(i);
        }
        Value::Dict(dict) => {
            let key = dict_key(op, key)?;
            if dict.borrow_mut().remove(key).is_none() {
                return Err(VmError::MissingKey { key: key.to_string() });
            }
        }
        other => return Err(mismatch(op, other, key)),
    }
    Ok(())
}

fn get_prop(op: Opcode, target: &Value, name: &str) -> VmResult<Value> {
    match target {
        Value::Object(obj) => obj
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| VmError::MissingProperty { name: name.to_string(), tag: "object" }),
        Value::Dict(dict) => dict
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| VmError::MissingKey { key: name.to_string() }),
        other => Err(no_property(op, name, other)),
    }
}

fn no_property(op: Opcode, name: &str, target: &Value) -> VmError {
    VmError::internal(op, format!("property '{}' on {}", name, target.type_name()))
}

fn set_prop(op: Opcode, target: &Value, name: Rc<str>, value: Value) -> VmResult<()> {
    match target {
        Value::Object(obj) => obj.borrow_mut().set(name, value),
        Value::Dict(dict) => dict.borrow_mut().insert(name, value),
        other => return Err(no_property(op, &name, other)),
    }
    Ok(())
}

fn length(op: Opcode, value: &Value) -> VmResult<usize> {
    match value {
        Value::List(items) => Ok(items.borrow().len()),
        Value::Dict(dict) => Ok(dict.borrow().len()),
        Value::String(s) => Ok(s.chars().count()),
        other => Err(VmError::internal(op, format!("length of {}", other.type_name()))),
    }
}

/// Lists and strings yield (position, element); dictionaries (key, value).
fn iterate(op: Opcode, coll: &Value, pos: &Value) -> VmResult<Value> {
    let want_key = op == Opcode::IterKey;
    match coll {
        Value::List(items) => {
            let items = items.borrow();
            let i = position(op, pos, items.len())?;
            Ok(if want_key { pos.clone() } else { items[i].clone() })
        }
        Value::String(s) => {
            let i = position(op, pos, s.chars().count())?;
            Ok(if want_key { pos.clone() } else { char_at(s, i) })
        }
        Value::Dict(dict) => {
            let dict = dict.borrow();
            let i = position(op, pos, dict.len())?;
            let (key, value) = dict
                .entry_at(i)
                .ok_or(VmError::IndexOutOfRange { index: i as f64, len: dict.len() })?;
            Ok(if want_key { Value::String(key.clone()) } else { value.clone() })
        }
        other => Err(mismatch(op, other, pos)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;
    use crate::value::Function;
    use crate::vm::opcode::Operand;
    use crate::vm::ErrorKind;

    fn r(n: u32) -> Operand {
        Operand::Reg(Reg(n))
    }

    fn lit(n: u32) -> Operand {
        Operand::Literal(n)
    }

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    /// An anonymous zero-argument function with one register.
    fn proto(entry: usize, capture_count: u32) -> Function {
        Function { name: None, arity: 0, entry, registers: 1, capture_count, captures: vec![] }
    }

    /// Hand-assembles a program one instruction at a time.
    struct Asm {
        program: Program,
        registers: u32,
    }

    impl Asm {
        fn new(registers: u32) -> Self {
            Asm { program: Program::new(), registers }
        }

        fn op(&mut self, op: Opcode, operands: &[Operand]) -> usize {
            let inst = Instruction::encode(op, operands).unwrap();
            self.program.memory.emit(inst, Span::UNKNOWN)
        }

        fn num(&mut self, n: f64) -> Operand {
            Operand::Const(self.program.memory.intern_constant(Value::Number(n)))
        }

        fn finish(mut self) -> Program {
            self.program.declare_main_registers(self.registers);
            self.program
        }
    }

    fn run(program: &mut Program) -> (Result<Value, Fault>, String) {
        let mut out = Vec::new();
        let result = Vm::new(program, &Config::default()).run(&mut out);
        (result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn empty_program_halts_with_none() {
        let mut program = Asm::new(0).finish();
        let (result, out) = run(&mut program);
        assert_eq!(result.unwrap(), Value::None);
        assert!(out.is_empty());
    }

    #[test]
    fn adds_and_prints() {
        let mut asm = Asm::new(3);
        let (one, two) = (asm.num(1.0), asm.num(2.0));
        asm.op(Opcode::LoadConst, &[r(0), one]);
        asm.op(Opcode::LoadConst, &[r(1), two]);
        asm.op(Opcode::Add, &[r(2), r(0), r(1)]);
        asm.op(Opcode::Print, &[r(2)]);
        let mut program = asm.finish();
        let (result, out) = run(&mut program);
        assert!(result.is_ok());
        assert_eq!(out, "3\n");
        assert_eq!(program.main_frame.get(Reg(2)), &Value::Number(3.0));
    }

    #[test]
    fn return_from_root_frame_halts_with_value() {
        let mut asm = Asm::new(1);
        let k = asm.num(9.0);
        asm.op(Opcode::LoadConst, &[r(0), k]);
        asm.op(Opcode::Return, &[r(0)]);
        asm.op(Opcode::Print, &[r(0)]);
        let mut program = asm.finish();
        let (result, out) = run(&mut program);
        assert_eq!(result.unwrap(), Value::Number(9.0));
        assert!(out.is_empty());
    }

    fn branch_program(cond: bool) -> Program {
        // r0 = cond; if !r0 goto 5; print "yes"; goto 7; print "no"
        let mut asm = Asm::new(2);
        let yes = Operand::Const(asm.program.memory.intern_constant(Value::string("yes")));
        let no = Operand::Const(asm.program.memory.intern_constant(Value::string("no")));
        asm.op(Opcode::LoadBool, &[r(0), lit(cond as u32)]);
        asm.op(Opcode::JumpIfFalse, &[r(0), lit(5)]);
        asm.op(Opcode::LoadConst, &[r(1), yes]);
        asm.op(Opcode::Print, &[r(1)]);
        asm.op(Opcode::Jump, &[lit(7)]);
        asm.op(Opcode::LoadConst, &[r(1), no]);
        asm.op(Opcode::Print, &[r(1)]);
        asm.finish()
    }

    #[test]
    fn conditional_jump_takes_both_branches() {
        let (_, out) = run(&mut branch_program(true));
        assert_eq!(out, "yes\n");
        let (_, out) = run(&mut branch_program(false));
        assert_eq!(out, "no\n");
    }

    #[test]
    fn zero_and_empty_string_are_truthy() {
        let mut asm = Asm::new(2);
        let zero = asm.num(0.0);
        asm.op(Opcode::LoadConst, &[r(0), zero]);
        asm.op(Opcode::Not, &[r(1), r(0)]);
        asm.op(Opcode::Print, &[r(1)]);
        asm.op(Opcode::LoadNone, &[r(0)]);
        asm.op(Opcode::Not, &[r(1), r(0)]);
        asm.op(Opcode::Print, &[r(1)]);
        let (_, out) = run(&mut asm.finish());
        assert_eq!(out, "false\ntrue\n");
    }

    /// Root: r0 = fn, r1 = 5, r2 = 7, call r0 with r1,r2; print r0, print r1.
    /// Callee: r0 = a, r1 = b, r2 = a*b, overwrite r1, return r2.
    fn multiply_program(arity: u32) -> Program {
        let mut asm = Asm::new(3);
        let (five, seven, zero) = (asm.num(5.0), asm.num(7.0), asm.num(0.0));
        let func = Function {
            name: Some("mul".into()),
            arity,
            entry: 7,
            registers: 3,
            capture_count: 0,
            captures: vec![],
        };
        let f = Operand::Const(asm.program.memory.add_constant(Value::Function(Rc::new(func))));
        asm.op(Opcode::LoadConst, &[r(0), f]);
        asm.op(Opcode::LoadConst, &[r(1), five]);
        asm.op(Opcode::LoadConst, &[r(2), seven]);
        asm.op(Opcode::Call, &[r(0), lit(2)]);
        asm.op(Opcode::Print, &[r(0)]);
        asm.op(Opcode::Print, &[r(1)]);
        asm.op(Opcode::Jump, &[lit(11)]);
        asm.op(Opcode::Mul, &[r(2), r(0), r(1)]);
        asm.op(Opcode::LoadConst, &[r(1), zero]);
        asm.op(Opcode::LoadConst, &[r(0), zero]);
        asm.op(Opcode::Return, &[r(2)]);
        asm.finish()
    }

    #[test]
    fn call_result_lands_in_base_and_frames_are_isolated() {
        let (result, out) = run(&mut multiply_program(2));
        assert!(result.is_ok());
        // callee overwrote its own r1, not the caller's
        assert_eq!(out, "35\n5\n");
    }

    #[test]
    fn arity_mismatch_is_a_runtime_fault() {
        let (result, _) = run(&mut multiply_program(3));
        let fault = result.unwrap_err();
        assert!(matches!(fault.error, VmError::ArityMismatch { expected: 3, got: 2 }));
        assert_eq!(fault.address, 3);
        assert_eq!(fault.depth, 1);
        assert_eq!(fault.kind(), ErrorKind::Runtime);
    }

    #[test]
    fn calling_a_number_fails() {
        let mut asm = Asm::new(1);
        let k = asm.num(1.0);
        asm.op(Opcode::LoadConst, &[r(0), k]);
        asm.op(Opcode::Call, &[r(0), lit(0)]);
        let (result, _) = run(&mut asm.finish());
        assert!(matches!(result.unwrap_err().error, VmError::NotCallable { tag: "number" }));
    }

    #[test]
    fn unbounded_recursion_hits_the_depth_limit() {
        // g0 = f; f: r0 = g0; call r0; return r0
        let mut asm = Asm::new(1);
        let g = asm.program.memory.declare_global("f");
        let func = proto(3, 0);
        let f = Operand::Const(asm.program.memory.add_constant(Value::Function(Rc::new(func))));
        asm.op(Opcode::LoadConst, &[r(0), f]);
        asm.op(Opcode::SetGlobal, &[Operand::Global(g), r(0)]);
        asm.op(Opcode::Call, &[r(0), lit(0)]);
        asm.op(Opcode::GetGlobal, &[r(0), Operand::Global(g)]);
        asm.op(Opcode::Call, &[r(0), lit(0)]);
        asm.op(Opcode::Return, &[r(0)]);
        let mut program = asm.finish();
        let mut out = Vec::new();
        let config = Config { max_call_depth: 16, ..Config::default() };
        let fault = Vm::new(&mut program, &config).run(&mut out).unwrap_err();
        assert!(matches!(fault.error, VmError::CallDepthExceeded { limit: 16 }));
        assert_eq!(fault.depth, 16);
        assert_eq!(fault.address, 4);
        // the root frame is back in place after the fault
        assert_eq!(program.main_frame.size(), 1);
    }

    #[test]
    fn closure_copies_captures() {
        // root: r1 = 42; r0 = closure(k, r1); r1 = 0; call r0; print r0
        // body: return r0 (the capture)
        let mut asm = Asm::new(2);
        let (answer, zero) = (asm.num(42.0), asm.num(0.0));
        let func = proto(6, 1);
        let f = Operand::Const(asm.program.memory.add_constant(Value::Function(Rc::new(func))));
        asm.op(Opcode::LoadConst, &[r(1), answer]);
        asm.op(Opcode::Closure, &[r(0), f, r(1)]);
        asm.op(Opcode::LoadConst, &[r(1), zero]);
        asm.op(Opcode::Call, &[r(0), lit(0)]);
        asm.op(Opcode::Print, &[r(0)]);
        asm.op(Opcode::Jump, &[lit(7)]);
        asm.op(Opcode::Return, &[r(0)]);
        let (result, out) = run(&mut asm.finish());
        assert!(result.is_ok());
        assert_eq!(out, "42\n");
    }

    #[test]
    fn type_confusion_is_internal() {
        let mut asm = Asm::new(3);
        asm.op(Opcode::LoadBool, &[r(0), lit(1)]);
        asm.op(Opcode::NewList, &[r(1), r(0), lit(0)]);
        asm.op(Opcode::Add, &[r(2), r(0), r(1)]);
        let fault = run(&mut asm.finish()).0.unwrap_err();
        assert_eq!(fault.kind(), ErrorKind::Internal);
        assert_eq!(fault.address, 2);
        assert!(fault.error.to_string().contains("bool and list"));
    }

    #[test]
    fn operands_are_read_before_the_destination_is_written() {
        let mut asm = Asm::new(2);
        let (three, four) = (asm.num(3.0), asm.num(4.0));
        asm.op(Opcode::LoadConst, &[r(0), three]);
        asm.op(Opcode::LoadConst, &[r(1), four]);
        asm.op(Opcode::Sub, &[r(0), r(1), r(0)]);
        asm.op(Opcode::Print, &[r(0)]);
        assert_eq!(run(&mut asm.finish()).1, "1\n");
    }

    #[test]
    fn division_by_zero() {
        assert!(matches!(
            arithmetic(Opcode::Div, &Value::Number(1.0), &Value::Number(0.0)),
            Err(VmError::DivisionByZero)
        ));
        assert_eq!(arithmetic(Opcode::Div, &num(1.0), &num(4.0)).unwrap(), num(0.25));
    }

    #[test]
    fn concatenation() {
        let s = arithmetic(Opcode::Add, &Value::string("ab"), &Value::string("cd")).unwrap();
        assert_eq!(s, Value::string("abcd"));
        let a = Value::list(vec![Value::Number(1.0)]);
        let joined = arithmetic(Opcode::Add, &a, &a).unwrap();
        assert_eq!(joined, Value::list(vec![Value::Number(1.0), Value::Number(1.0)]));
        assert!(!joined.same(&a));
    }

    #[test]
    fn comparisons() {
        let lt = |a: &Value, b: &Value| compare(Opcode::Lt, a, b, Ordering::is_lt);
        assert!(lt(&Value::Number(1.0), &Value::Number(2.0)).unwrap());
        assert!(lt(&Value::string("a"), &Value::string("b")).unwrap());
        assert!(!lt(&Value::Number(f64::NAN), &Value::Number(1.0)).unwrap());
        assert!(lt(&Value::Number(1.0), &Value::string("b")).is_err());
    }

    #[test]
    fn casts() {
        assert_eq!(cast(&Value::Number(3.0), CastTarget::String).unwrap(), Value::string("3"));
        assert_eq!(cast(&Value::string(" 2.5 "), CastTarget::Number).unwrap(), Value::Number(2.5));
        assert_eq!(cast(&Value::Bool(true), CastTarget::Number).unwrap(), Value::Number(1.0));
        assert_eq!(cast(&Value::None, CastTarget::Bool).unwrap(), Value::Bool(false));
        assert!(matches!(
            cast(&Value::string("abc"), CastTarget::Number),
            Err(VmError::InvalidCast { .. })
        ));
    }

    #[test]
    fn ranges() {
        let exclusive = range(Opcode::Range, &num(1.0), &num(4.0)).unwrap();
        assert_eq!(exclusive.to_string(), "[1, 2, 3]");
        let inclusive = range(Opcode::RangeInclusive, &num(1.0), &num(4.0)).unwrap();
        assert_eq!(inclusive.to_string(), "[1, 2, 3, 4]");
        let empty = range(Opcode::Range, &num(3.0), &num(1.0)).unwrap();
        assert_eq!(empty.to_string(), "[]");
    }

    #[test]
    fn ranges_past_the_limit_fail() {
        let limit = MAX_RANGE_LEN as f64;
        assert!(range(Opcode::Range, &num(0.0), &num(limit)).is_ok());
        assert!(matches!(
            range(Opcode::RangeInclusive, &num(0.0), &num(limit)),
            Err(VmError::RangeTooLarge { .. })
        ));
        let err = range(Opcode::Range, &num(0.0), &num(f64::INFINITY)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Runtime);
    }

    #[test]
    fn indexing_rules() {
        let list = Value::list(vec![Value::Number(10.0), Value::Number(20.0)]);
        assert_eq!(get_index(Opcode::GetIndex, &list, &num(1.0)).unwrap(), num(20.0));
        for bad in [2.0, -1.0, 0.5] {
            assert!(matches!(
                get_index(Opcode::GetIndex, &list, &Value::Number(bad)),
                Err(VmError::IndexOutOfRange { len: 2, .. })
            ));
        }
        let text = Value::string("héllo");
        assert_eq!(get_index(Opcode::GetIndex, &text, &num(1.0)).unwrap(), Value::string("é"));

        let dict = Value::dict(Dictionary::new());
        set_index(Opcode::SetIndex, &dict, &Value::string("k"), Value::Bool(true)).unwrap();
        let k = Value::string("k");
        assert_eq!(get_index(Opcode::GetIndex, &dict, &k).unwrap(), Value::Bool(true));
        assert!(matches!(
            get_index(Opcode::GetIndex, &dict, &Value::string("missing")),
            Err(VmError::MissingKey { .. })
        ));
        delete(Opcode::Delete, &dict, &k).unwrap();
        assert!(matches!(delete(Opcode::Delete, &dict, &k), Err(VmError::MissingKey { .. })));

        delete(Opcode::Delete, &list, &Value::Number(0.0)).unwrap();
        assert_eq!(list.to_string(), "[20]");
    }

    #[test]
    fn properties() {
        let obj = Value::object(Object::new("Point"));
        set_prop(Opcode::SetProp, &obj, "x".into(), Value::Number(1.0)).unwrap();
        assert_eq!(get_prop(Opcode::GetProp, &obj, "x").unwrap(), Value::Number(1.0));
        assert!(matches!(
            get_prop(Opcode::GetProp, &obj, "y"),
            Err(VmError::MissingProperty { .. })
        ));
        let err = get_prop(Opcode::GetProp, &Value::Number(1.0), "x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn iteration_over_dicts_yields_keys_and_values() {
        let dict: Dictionary = vec![("a", num(1.0)), ("b", num(2.0))].into_iter().collect();
        let dict = Value::dict(dict);
        assert_eq!(length(Opcode::Len, &dict).unwrap(), 2);
        assert_eq!(iterate(Opcode::IterKey, &dict, &num(1.0)).unwrap(), Value::string("b"));
        assert_eq!(iterate(Opcode::IterValue, &dict, &num(1.0)).unwrap(), num(2.0));
        let list = Value::list(vec![Value::string("x")]);
        assert_eq!(iterate(Opcode::IterKey, &list, &num(0.0)).unwrap(), num(0.0));
        assert_eq!(iterate(Opcode::IterValue, &list, &num(0.0)).unwrap(), Value::string("x"));
    }

    #[test]
    fn halted_vm_refuses_to_run_again() {
        let mut program = Asm::new(0).finish();
        let mut out = Vec::new();
        let mut vm = Vm::new(&mut program, &Config::default());
        assert!(vm.run(&mut out).is_ok());
        assert_eq!(vm.state(), VmState::Halted);
        let fault = vm.run(&mut out).unwrap_err();
        assert_eq!(fault.kind(), ErrorKind::Internal);
    }
}
