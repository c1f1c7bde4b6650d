use std::io::Write;

use crate::ast::{self, Span};
use crate::config::Config;
use crate::diagnostic::{Diagnostic, DiagnosticSink};
use crate::value::Value;

mod compiler;
mod exec;
pub mod frame;
pub mod memory;
pub mod opcode;

pub use exec::{Vm, VmState, MAX_RANGE_LEN};
pub use frame::{Frame, FrameAllocator, Program};
pub use memory::Memory;
pub use opcode::{
    opcode_to_string, operand_signature, render, CastTarget, ConstIdx, EncodeError, GlobalIdx,
    Instruction, Opcode, Operand, OperandKind, PropIdx, Reg,
};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("undefined local variable: {name}")]
    UndefinedLocal { name: String },
    #[error("undefined global variable: {name}")]
    UndefinedGlobal { name: String },
    #[error("cannot capture '{name}': not a local of the enclosing function")]
    UndefinedCapture { name: String },
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Whether a halt is the program's fault or the toolchain's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Depends on runtime data: bad index, missing key, bad call, ...
    Runtime,
    /// An operand combination the analyzer should have ruled out.
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: f64, len: usize },
    #[error("key '{key}' not found")]
    MissingKey { key: String },
    #[error("no property '{name}' on {tag}")]
    MissingProperty { name: String, tag: &'static str },
    #[error("division by zero")]
    DivisionByZero,
    #[error("cannot call a value of type {tag}")]
    NotCallable { tag: &'static str },
    #[error("function takes {expected} arguments, got {got}")]
    ArityMismatch { expected: u32, got: u32 },
    #[error("cannot convert '{text}' to a number")]
    InvalidCast { text: String },
    #[error("range of {len} elements exceeds the limit of {limit}")]
    RangeTooLarge { len: f64, limit: usize },
    #[error("call depth exceeded the limit of {limit}")]
    CallDepthExceeded { limit: usize },
    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
    #[error("internal error in {opcode}: {detail}")]
    Internal { opcode: Opcode, detail: String },
    #[error("internal error: {0}")]
    Corrupt(&'static str),
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::Internal { .. } | VmError::Corrupt(_) => ErrorKind::Internal,
            _ => ErrorKind::Runtime,
        }
    }

    pub(crate) fn internal(opcode: Opcode, detail: impl Into<String>) -> Self {
        VmError::Internal { opcode, detail: detail.into() }
    }
}

type VmResult<T> = Result<T, VmError>;

/// Why and where the executor halted abnormally.
#[derive(Debug, thiserror::Error)]
#[error("{error} (at instruction {address}, frame depth {depth})")]
pub struct Fault {
    pub error: VmError,
    pub address: usize,
    pub depth: usize,
    pub span: Option<Span>,
}

impl Fault {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    #[error("runtime error: {0}")]
    Runtime(#[from] Fault),
}

/// Everything an execution touches outside the program itself.
pub struct Context<'a> {
    pub config: Config,
    pub output: &'a mut dyn Write,
    pub diagnostics: &'a mut dyn DiagnosticSink,
}

impl<'a> Context<'a> {
    pub fn new(output: &'a mut dyn Write, diagnostics: &'a mut dyn DiagnosticSink) -> Self {
        Context { config: Config::default(), output, diagnostics }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }
}

/// Lowers a validated tree to a ready-to-run [`Program`].
pub fn compile(program: &ast::Program) -> Result<Program, CompileError> {
    compiler::Compiler::new().compile_program(program)
}

/// Executes `program` from its first instruction until it halts.
pub fn run(program: &mut Program, ctx: &mut Context<'_>) -> Result<Value, Fault> {
    let result = Vm::new(program, &ctx.config).run(&mut *ctx.output);
    if let Err(fault) = &result {
        ctx.diagnostics.report(Diagnostic::from(fault));
    }
    result
}

/// The front end's single entry point: compile and run a validated tree.
pub fn compile_and_run(program: &ast::Program, ctx: &mut Context<'_>) -> Result<Value, Error> {
    let mut compiled = match compile(program) {
        Ok(p) => p,
        Err(e) => {
            ctx.diagnostics.report(Diagnostic::from(&e));
            return Err(e.into());
        }
    };
    Ok(run(&mut compiled, ctx)?)
}
