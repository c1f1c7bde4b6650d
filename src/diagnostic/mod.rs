pub mod json;

use crate::ast::Span;
use crate::vm::{CompileError, ErrorKind, Fault};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

/// A structured report handed to the embedder instead of being printed.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// `compile`, `runtime` or `internal`.
    pub code: &'static str,
    pub message: String,
    pub labels: Vec<Label>,
    /// Instruction address, for faults raised by the executor.
    pub address: Option<usize>,
    pub frame_depth: Option<usize>,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code,
            message: message.into(),
            labels: Vec::new(),
            address: None,
            frame_depth: None,
            notes: Vec::new(),
        }
    }

    pub fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(code, message) }
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into() });
        self
    }

    pub fn with_location(mut self, address: usize, frame_depth: usize) -> Self {
        self.address = Some(address);
        self.frame_depth = Some(frame_depth);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

/// Where diagnostics go. The toolchain never prints on its own.
pub trait DiagnosticSink {
    fn report(&mut self, diagnostic: Diagnostic);
}

impl DiagnosticSink for Vec<Diagnostic> {
    fn report(&mut self, diagnostic: Diagnostic) {
        self.push(diagnostic);
    }
}

impl From<&CompileError> for Diagnostic {
    fn from(e: &CompileError) -> Self {
        let d = Diagnostic::error("compile", e.to_string());
        match e {
            CompileError::Encode(_) => {
                d.with_note("the code generator emitted a malformed instruction")
            }
            _ => d,
        }
    }
}

impl From<&Fault> for Diagnostic {
    fn from(fault: &Fault) -> Self {
        let code = match fault.kind() {
            ErrorKind::Runtime => "runtime",
            ErrorKind::Internal => "internal",
        };
        let mut d = Diagnostic::error(code, fault.error.to_string())
            .with_location(fault.address, fault.depth);
        if let Some(span) = fault.span {
            d = d.with_span(span, "raised here");
        }
        if fault.kind() == ErrorKind::Internal {
            d = d.with_note("this program should have been rejected before execution");
        }
        d
    }
}
