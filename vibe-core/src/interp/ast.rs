//! The AST the interpreter consumes (§6 "AST (parser contract)").
//!
//! The lexer, parser, and semantic analyzer are out of scope (spec.md §1);
//! this module only types the tree they hand to [`crate::interp::lower`].
//! Every node carries a [`Location`].
//!
//! Every type here derives `serde::{Serialize, Deserialize}` with default
//! (externally tagged) enum representation, so a driver with no parser in
//! scope — `vibe-cli` included — can load a tree serialized by an offline
//! tool as plain JSON rather than inventing its own AST wire format.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Source position of an AST node: `{file, line, column}`, 1-based over the
/// debug-adapter channel (§6) but stored here exactly as produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: Arc<str>,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(file: impl Into<Arc<str>>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    /// Used by tests and REPL-style programs with no real source file.
    pub fn synthetic() -> Self {
        Self::new("<synthetic>", 0, 0)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A node paired with its source location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node<T> {
    pub kind: T,
    pub loc: Location,
}

impl<T> Node<T> {
    pub fn new(kind: T, loc: Location) -> Self {
        Self { kind, loc }
    }
}

pub type Stmt = Node<StmtKind>;
pub type Expr = Node<ExprKind>;

/// A type annotation: a base name plus zero or more `[]` suffixes (§3 "Types").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeAnnotation {
    pub base: String,
    pub array_depth: u32,
}

impl TypeAnnotation {
    pub fn scalar(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            array_depth: 0,
        }
    }

    pub fn array_of(base: impl Into<String>, depth: u32) -> Self {
        Self {
            base: base.into(),
            array_depth: depth,
        }
    }
}

impl fmt::Display for TypeAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        for _ in 0..self.array_depth {
            write!(f, "[]")?;
        }
        Ok(())
    }
}

/// One parameter of a `tool` or `FunctionDeclaration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Option<TypeAnnotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StmtKind {
    Program(Vec<Stmt>),
    LetDeclaration {
        name: String,
        ty: Option<TypeAnnotation>,
        init: Option<Expr>,
    },
    ConstDeclaration {
        name: String,
        ty: Option<TypeAnnotation>,
        init: Expr,
    },
    DestructuringDeclaration {
        names: Vec<String>,
        init: Expr,
    },
    FunctionDeclaration {
        name: String,
        params: Vec<Param>,
        return_ty: Option<TypeAnnotation>,
        body: Vec<Stmt>,
    },
    ToolDeclaration {
        name: String,
        params: Vec<Param>,
        return_ty: Option<TypeAnnotation>,
        description: Option<String>,
        body: ToolBody,
    },
    ModelDeclaration {
        name: String,
        fields: Vec<(String, Expr)>,
    },
    ExpressionStatement(Expr),
    ReturnStatement(Option<Expr>),
    IfStatement {
        cond: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
    },
    ForInStatement {
        var_name: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    WhileStatement {
        cond: Expr,
        body: Vec<Stmt>,
    },
    ImportDeclaration {
        names: Vec<String>,
        source: String,
    },
    ExportDeclaration(Box<Stmt>),
    BlockStatement(Vec<Stmt>),
}

/// Body of a `tool` declaration: either a single `ts(...) { ... }` block or a
/// further sequence of Vibe statements (§4.C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToolBody {
    Ts { params: Vec<String>, body: String },
    Statements(Vec<Stmt>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// The AI-call kind: `do`/`vibe` are synonyms; `ask` is a user prompt (§1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AiCallKind {
    Do,
    Vibe,
}

/// How `contextText` is computed for an `ai_call` (§4.F).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextKind {
    Default,
    Local,
    Variable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExprKind {
    Identifier(String),
    StringLiteral(String),
    NumberLiteral(f64),
    BooleanLiteral(bool),
    NullLiteral,
    TemplateLiteral(Vec<TemplatePart>),
    ArrayLiteral(Vec<Expr>),
    ObjectLiteral(Vec<(String, Expr)>),
    BinaryExpression {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryExpression {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    MemberExpression {
        object: Box<Expr>,
        property: String,
    },
    IndexExpression {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    AssignmentExpression {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    CallExpression {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    RangeExpression {
        start: Box<Expr>,
        end: Box<Expr>,
        inclusive: bool,
    },
    VibeExpression {
        kind: AiCallKind,
        prompt: Box<Expr>,
        model: String,
        context: ContextKind,
        target_type: Option<TypeAnnotation>,
    },
    TsBlock {
        params: Vec<String>,
        body: String,
    },
    AskExpression {
        prompt: Box<Expr>,
        target_type: Option<TypeAnnotation>,
    },
}

/// One segment of a template literal: either literal text or `{name}`/`${name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TemplatePart {
    Text(String),
    Placeholder(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_round_trips_through_json() {
        let program = Stmt::new(
            StmtKind::Program(vec![Stmt::new(
                StmtKind::LetDeclaration {
                    name: "x".into(),
                    ty: Some(TypeAnnotation::scalar("number")),
                    init: Some(Expr::new(
                        ExprKind::NumberLiteral(2.0),
                        Location::synthetic(),
                    )),
                },
                Location::synthetic(),
            )]),
            Location::synthetic(),
        );
        let json = serde_json::to_string(&program).unwrap();
        let back: Stmt = serde_json::from_str(&json).unwrap();
        match back.kind {
            StmtKind::Program(stmts) => {
                assert_eq!(stmts.len(), 1);
                match &stmts[0].kind {
                    StmtKind::LetDeclaration { name, .. } => assert_eq!(name, "x"),
                    other => panic!("unexpected kind: {other:?}"),
                }
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
