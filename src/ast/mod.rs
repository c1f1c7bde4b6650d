//! The validated syntax tree handed over by the front end.
//!
//! Every name is already resolved to a [`Scope`] and every construct has
//! passed semantic analysis; the back end lowers this tree as-is and never
//! re-checks typing rules.

use serde::{Deserialize, Serialize};

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn is_unknown(&self) -> bool {
        *self == Span::UNKNOWN
    }
}

/// Wraps a node with its source span. Transparent to serde (serializes as inner node only).
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Spanned { node, span }
    }

    pub fn unknown(node: T) -> Self {
        Spanned { node, span: Span::UNKNOWN }
    }
}

impl<T> std::ops::Deref for Spanned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.node
    }
}

impl<T> From<T> for Spanned<T> {
    fn from(node: T) -> Self {
        Spanned::unknown(node)
    }
}

impl<T: Serialize> Serialize for Spanned<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.node.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Spanned<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(|node| Spanned { node, span: Span::UNKNOWN })
    }
}

// ---- Core AST types ----

/// Where a name lives once resolved by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// A register in the enclosing function's frame (or the main frame).
    Local,
    /// A slot in the program-wide global table.
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    None,
    Bool,
    Number,
    String,
    List(Box<Type>),
    Dict(Box<Type>),
    Function,
    Object(String),
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

pub type Block = Vec<Spanned<Stmt>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// `name: ty = value`
    Declare {
        name: String,
        scope: Scope,
        ty: Type,
        value: Option<Expr>,
    },

    Expr(Expr),

    Print(Expr),

    If {
        condition: Expr,
        then_branch: Block,
        #[serde(default)]
        elifs: Vec<(Expr, Block)>,
        #[serde(default)]
        else_branch: Block,
    },

    While {
        condition: Expr,
        body: Block,
    },

    /// `for binding, index in iterable { body }`
    ///
    /// Lists and strings bind the numeric position to `index`, dictionaries
    /// bind the key.
    For {
        binding: String,
        index: Option<String>,
        iterable: Expr,
        body: Block,
    },

    Return(Option<Expr>),

    /// `delete object[index]`
    Delete {
        object: Expr,
        index: Expr,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Literal),

    Variable {
        name: String,
        scope: Scope,
    },

    Assign {
        name: String,
        scope: Scope,
        value: Box<Expr>,
    },

    /// `target[index] = value`
    AssignIndex {
        target: Box<Expr>,
        index: Box<Expr>,
        value: Box<Expr>,
    },

    /// `object.name = value`
    AssignProperty {
        object: Box<Expr>,
        name: String,
        value: Box<Expr>,
    },

    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Short-circuiting `and` / `or`
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    List(Vec<Expr>),

    Dict(Vec<(String, Expr)>),

    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },

    Property {
        object: Box<Expr>,
        name: String,
    },

    /// Object construction: `Class { field: value, ... }`
    Object {
        class: String,
        fields: Vec<(String, Expr)>,
    },

    /// Function literal. `captures` lists the enclosing locals the body
    /// reads; inside the body they are addressed as locals.
    Function {
        name: Option<String>,
        params: Vec<Param>,
        return_type: Type,
        #[serde(default)]
        captures: Vec<String>,
        body: Block,
    },

    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },

    /// `value as ty`
    Cast {
        value: Box<Expr>,
        ty: Type,
    },

    /// `start..end` or `start...end`
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
        inclusive: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    None,
    Bool(bool),
    Number(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Equals,
    NotEquals,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
}

/// The root block of a validated program.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub body: Block,
}

impl Program {
    pub fn new(body: Vec<Stmt>) -> Self {
        Program { body: body.into_iter().map(Spanned::unknown).collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_unknown_is_zero() {
        assert_eq!(Span::UNKNOWN, Span { start: 0, end: 0 });
        assert!(Span::default().is_unknown());
    }

    #[test]
    fn span_merge_takes_extremes() {
        let a = Span { start: 5, end: 10 };
        let b = Span { start: 2, end: 15 };
        assert_eq!(a.merge(b), Span { start: 2, end: 15 });
    }

    #[test]
    fn spanned_deref() {
        let s = Spanned::new(42, Span { start: 0, end: 2 });
        assert_eq!(*s, 42);
    }

    #[test]
    fn spanned_serialize_transparent() {
        let s = Spanned::new(42i32, Span { start: 5, end: 10 });
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn spanned_deserialize_transparent() {
        let s: Spanned<i32> = serde_json::from_str("42").unwrap();
        assert_eq!(s.node, 42);
        assert_eq!(s.span, Span::UNKNOWN);
    }

    #[test]
    fn program_json_round_trip() {
        let prog = Program {
            body: vec![Spanned::new(
                Stmt::Declare {
                    name: "a".to_string(),
                    scope: Scope::Global,
                    ty: Type::Number,
                    value: Some(Expr::Literal(Literal::Number(1.0))),
                },
                Span { start: 0, end: 9 },
            )],
        };
        let json = serde_json::to_string_pretty(&prog).unwrap();
        assert!(!json.contains("span"));
        let back: Program = serde_json::from_str(&json).unwrap();
        // spans are dropped on the way out, everything else survives
        assert_eq!(back.body.len(), 1);
        assert_eq!(back.body[0].node, prog.body[0].node);
        assert!(back.body[0].span.is_unknown());
    }

    #[test]
    fn if_branches_default_when_absent() {
        let json = r#"{"If":{"condition":{"Literal":{"Bool":true}},"then_branch":[]}}"#;
        let stmt: Stmt = serde_json::from_str(json).unwrap();
        match stmt {
            Stmt::If { elifs, else_branch, .. } => {
                assert!(elifs.is_empty());
                assert!(else_branch.is_empty());
            }
            other => panic!("expected If, got {:?}", other),
        }
    }
}
