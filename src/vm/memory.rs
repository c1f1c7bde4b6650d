use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;

use crate::ast::Span;
use crate::value::Value;

use super::opcode::{ConstIdx, GlobalIdx, Instruction, Operand, PropIdx};

#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub value: Value,
}

/// The program's static resources: instruction stream, constant pool,
/// property names and the global table.
///
/// Instructions are append-only; the one permitted rewrite is resolving a
/// forward jump's target through [`Memory::patch`].
#[derive(Debug, Default)]
pub struct Memory {
    code: Vec<Instruction>,
    spans: Vec<Span>,
    constants: Vec<Value>,
    names: Vec<Rc<str>>,
    name_index: HashMap<Rc<str>, PropIdx>,
    globals: Vec<Global>,
    global_index: HashMap<String, GlobalIdx>,
}

impl Memory {
    pub fn new() -> Self {
        Memory::default()
    }

    /// Appends an instruction and returns its address.
    pub fn emit(&mut self, inst: Instruction, span: Span) -> usize {
        let address = self.code.len();
        self.code.push(inst);
        self.spans.push(span);
        address
    }

    /// Points the jump at `address` to `target`.
    pub fn patch(&mut self, address: usize, target: usize) {
        let inst = &mut self.code[address];
        match inst.target_slot() {
            Some(slot) => inst.args[slot] = target as u32,
            None => debug_assert!(false, "patch on non-jump {} at {}", inst.op, address),
        }
    }

    /// Address the next emitted instruction will get.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.code
    }

    #[inline(always)]
    pub(crate) fn fetch(&self, address: usize) -> Option<Instruction> {
        self.code.get(address).copied()
    }

    pub fn span_at(&self, address: usize) -> Option<Span> {
        self.spans.get(address).copied().filter(|s| !s.is_unknown())
    }

    /// Returns the index of an equal scalar constant if one exists.
    /// Functions and containers are never shared.
    pub fn intern_constant(&mut self, value: Value) -> ConstIdx {
        let found = self.constants.iter().position(|c| match (c, &value) {
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::None, Value::None) => true,
            _ => false,
        });
        match found {
            Some(i) => ConstIdx(i as u32),
            None => self.add_constant(value),
        }
    }

    pub fn add_constant(&mut self, value: Value) -> ConstIdx {
        let idx = ConstIdx(self.constants.len() as u32);
        self.constants.push(value);
        idx
    }

    #[inline(always)]
    pub fn constant(&self, idx: ConstIdx) -> &Value {
        &self.constants[idx.0 as usize]
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn intern_name(&mut self, name: &str) -> PropIdx {
        if let Some(&idx) = self.name_index.get(name) {
            return idx;
        }
        let idx = PropIdx(self.names.len() as u32);
        let name: Rc<str> = name.into();
        self.names.push(name.clone());
        self.name_index.insert(name, idx);
        idx
    }

    #[inline(always)]
    pub fn name(&self, idx: PropIdx) -> &Rc<str> {
        &self.names[idx.0 as usize]
    }

    /// Creates the slot for `name` on first declaration; later declarations
    /// of the same name resolve to that slot.
    pub fn declare_global(&mut self, name: &str) -> GlobalIdx {
        if let Some(idx) = self.resolve_global(name) {
            return idx;
        }
        let idx = GlobalIdx(self.globals.len() as u32);
        self.globals.push(Global { name: name.to_string(), value: Value::None });
        self.global_index.insert(name.to_string(), idx);
        idx
    }

    pub fn resolve_global(&self, name: &str) -> Option<GlobalIdx> {
        self.global_index.get(name).copied()
    }

    #[inline(always)]
    pub(crate) fn global_value(&self, idx: GlobalIdx) -> &Value {
        &self.globals[idx.0 as usize].value
    }

    #[inline(always)]
    pub(crate) fn set_global(&mut self, idx: GlobalIdx, value: Value) {
        self.globals[idx.0 as usize].value = value;
    }

    /// Current value of a global by name.
    pub fn global(&self, name: &str) -> Option<&Value> {
        self.resolve_global(name).map(|idx| self.global_value(idx))
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    /// Human-readable listing, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (address, inst) in self.code.iter().enumerate() {
            let _ = write!(out, "{:04}  {}", address, inst);
            let notes: Vec<String> = inst
                .operands()
                .into_iter()
                .filter_map(|operand| match operand {
                    Operand::Const(k) => Some(match self.constant(k) {
                        Value::String(s) => format!("{:?}", s),
                        other => other.to_string(),
                    }),
                    Operand::Global(g) => Some(self.globals[g.0 as usize].name.clone()),
                    Operand::Prop(p) => Some(self.name(p).to_string()),
                    _ => None,
                })
                .collect();
            if !notes.is_empty() {
                let _ = write!(out, "  ; {}", notes.join(", "));
            }
            out.push('\n');
        }
        out
    }
}
