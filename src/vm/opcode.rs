use std::fmt;

// ---- Operands ----
//
// Every instruction carries up to three 32-bit operand words. What a word
// means is fixed per opcode by its signature, never by the word itself.

pub(crate) const MAX_OPERANDS: usize = 3;

/// Register index, relative to the frame currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Reg(pub u32);

impl Reg {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn offset(self, by: u32) -> Reg {
        Reg(self.0 + by)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstIdx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalIdx(pub u32);

/// Index into the memory's interned property-name table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropIdx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Register,
    Constant,
    Global,
    Literal,
    Property,
}

impl fmt::Display for OperandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperandKind::Register => "register",
            OperandKind::Constant => "constant",
            OperandKind::Global => "global",
            OperandKind::Literal => "literal",
            OperandKind::Property => "property",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Const(ConstIdx),
    Global(GlobalIdx),
    Literal(u32),
    Prop(PropIdx),
}

impl Operand {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::Reg(_) => OperandKind::Register,
            Operand::Const(_) => OperandKind::Constant,
            Operand::Global(_) => OperandKind::Global,
            Operand::Literal(_) => OperandKind::Literal,
            Operand::Prop(_) => OperandKind::Property,
        }
    }

    fn word(&self) -> u32 {
        match *self {
            Operand::Reg(Reg(w))
            | Operand::Const(ConstIdx(w))
            | Operand::Global(GlobalIdx(w))
            | Operand::Literal(w)
            | Operand::Prop(PropIdx(w)) => w,
        }
    }

    fn from_word(kind: OperandKind, w: u32) -> Operand {
        match kind {
            OperandKind::Register => Operand::Reg(Reg(w)),
            OperandKind::Constant => Operand::Const(ConstIdx(w)),
            OperandKind::Global => Operand::Global(GlobalIdx(w)),
            OperandKind::Literal => Operand::Literal(w),
            OperandKind::Property => Operand::Prop(PropIdx(w)),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "r{}", r.0),
            Operand::Const(k) => write!(f, "k{}", k.0),
            Operand::Global(g) => write!(f, "g{}", g.0),
            Operand::Literal(n) => write!(f, "#{}", n),
            Operand::Prop(p) => write!(f, ".{}", p.0),
        }
    }
}

// ---- Opcodes ----

use OperandKind::{Constant as K, Global as G, Literal as L, Property as P, Register as R};

macro_rules! opcodes {
    ($( $(#[$doc:meta])* $variant:ident = $name:literal [$($kind:ident),*], )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $( $(#[$doc])* $variant, )*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant),*];

            /// Ordered operand kinds this opcode is encoded with.
            pub fn signature(self) -> &'static [OperandKind] {
                match self {
                    $( Opcode::$variant => &[$($kind),*], )*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( Opcode::$variant => $name, )*
                }
            }
        }
    };
}

opcodes! {
    /// R[a] = K[b]
    LoadConst = "LOADK" [R, K],
    /// R[a] = none
    LoadNone = "LOADNONE" [R],
    /// R[a] = (#b != 0)
    LoadBool = "LOADBOOL" [R, L],
    /// R[a] = R[b]
    Move = "MOVE" [R, R],
    /// R[a] = G[b]
    GetGlobal = "GETG" [R, G],
    /// G[a] = R[b]
    SetGlobal = "SETG" [G, R],

    Add = "ADD" [R, R, R],
    Sub = "SUB" [R, R, R],
    Mul = "MUL" [R, R, R],
    Div = "DIV" [R, R, R],
    Eq = "EQ" [R, R, R],
    Ne = "NE" [R, R, R],
    Lt = "LT" [R, R, R],
    Le = "LE" [R, R, R],
    Gt = "GT" [R, R, R],
    Ge = "GE" [R, R, R],
    Neg = "NEG" [R, R],
    Not = "NOT" [R, R],
    /// R[a] = R[b] as CastTarget(#c)
    Cast = "CAST" [R, R, L],

    /// pc = #a
    Jump = "JMP" [L],
    /// if !R[a] { pc = #b }
    JumpIfFalse = "JMPF" [R, L],
    /// if R[a] { pc = #b }
    JumpIfTrue = "JMPT" [R, L],

    /// R[a] = [R[b], R[b+1], ... R[b+#c-1]]
    NewList = "LISTNEW" [R, R, L],
    NewDict = "DICTNEW" [R],
    /// R[a] = new object of class P[b]
    NewObject = "OBJNEW" [R, P],
    /// R[a] = [R[b] .. R[c])
    Range = "RANGE" [R, R, R],
    /// R[a] = [R[b] ..= R[c]]
    RangeInclusive = "RANGEINC" [R, R, R],

    /// R[a] = R[b][R[c]]
    GetIndex = "GETIDX" [R, R, R],
    /// R[a][R[b]] = R[c]
    SetIndex = "SETIDX" [R, R, R],
    /// remove R[a][R[b]]
    Delete = "DEL" [R, R],
    /// R[a] = R[b].P[c]
    GetProp = "GETPROP" [R, R, P],
    /// R[a].P[b] = R[c]
    SetProp = "SETPROP" [R, P, R],
    Len = "LEN" [R, R],
    /// R[a] = key (or position) of entry R[c] in R[b]
    IterKey = "ITERKEY" [R, R, R],
    /// R[a] = value of entry R[c] in R[b]
    IterValue = "ITERVAL" [R, R, R],

    /// R[a] = K[b] capturing R[c], R[c+1], ...
    Closure = "CLOSURE" [R, K, R],
    /// R[a] = R[a](R[a+1], ... R[a+#b])
    Call = "CALL" [R, L],
    Return = "RET" [R],
    Print = "PRINT" [R],
}

impl Opcode {
    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::JumpIfFalse | Opcode::JumpIfTrue)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn operand_signature(op: Opcode) -> &'static [OperandKind] {
    op.signature()
}

pub fn opcode_to_string(op: Opcode) -> &'static str {
    op.name()
}

/// Debug text for an instruction, e.g. `ADD r2, r0, r1`.
pub fn render(op: Opcode, operands: &[Operand]) -> String {
    let mut out = format!("{:<9}", op.name());
    for (i, operand) in operands.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&operand.to_string());
    }
    out.trim_end().to_string()
}

/// Target of a `CAST`, stored as the literal operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CastTarget {
    String = 0,
    Number = 1,
    Bool = 2,
}

impl CastTarget {
    pub fn from_literal(n: u32) -> Option<CastTarget> {
        match n {
            0 => Some(CastTarget::String),
            1 => Some(CastTarget::Number),
            2 => Some(CastTarget::Bool),
            _ => None,
        }
    }
}

// ---- Instruction ----

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EncodeError {
    #[error("{op} takes {expected} operands, got {got}")]
    Arity { op: Opcode, expected: usize, got: usize },
    #[error("{op} operand {position} must be a {expected}, got a {got}")]
    Kind { op: Opcode, position: usize, expected: OperandKind, got: OperandKind },
}

/// One fixed-size instruction: opcode plus raw operand words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Opcode,
    pub(crate) args: [u32; MAX_OPERANDS],
}

impl Instruction {
    /// Checks `operands` against the opcode's signature and packs them.
    pub fn encode(op: Opcode, operands: &[Operand]) -> Result<Instruction, EncodeError> {
        let sig = op.signature();
        if sig.len() != operands.len() {
            return Err(EncodeError::Arity { op, expected: sig.len(), got: operands.len() });
        }
        let mut args = [0u32; MAX_OPERANDS];
        for (position, (&expected, operand)) in sig.iter().zip(operands).enumerate() {
            if operand.kind() != expected {
                return Err(EncodeError::Kind { op, position, expected, got: operand.kind() });
            }
            args[position] = operand.word();
        }
        Ok(Instruction { op, args })
    }

    pub fn operands(&self) -> Vec<Operand> {
        self.op
            .signature()
            .iter()
            .zip(self.args)
            .map(|(&kind, w)| Operand::from_word(kind, w))
            .collect()
    }

    #[inline(always)]
    pub(crate) fn reg(&self, i: usize) -> Reg {
        Reg(self.args[i])
    }

    #[inline(always)]
    pub(crate) fn word(&self, i: usize) -> u32 {
        self.args[i]
    }

    /// Index of the jump-target word, for jumps only.
    pub(crate) fn target_slot(&self) -> Option<usize> {
        match self.op {
            Opcode::Jump => Some(0),
            Opcode::JumpIfFalse | Opcode::JumpIfTrue => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(self.op, &self.operands()))
    }
}
