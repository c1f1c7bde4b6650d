//! Register-based bytecode back end and virtual machine for nuua.
//!
//! A validated [`ast::Program`] is lowered by [`vm::compile`] into a
//! [`vm::Program`]: one instruction stream, a constant pool, the global
//! table and a sized root frame. [`vm::run`] executes it.

pub mod ast;
pub mod config;
pub mod diagnostic;
pub mod value;
pub mod vm;

pub use config::Config;
pub use diagnostic::{Diagnostic, DiagnosticSink};
pub use value::Value;
pub use vm::{compile, compile_and_run, run, Context, Error};
