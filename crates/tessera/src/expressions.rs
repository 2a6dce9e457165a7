//! AST node types produced by the parser and consumed by the compiler.

use crate::error::SourceLoc;

/// Binary arithmetic and concatenation operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    /// `~` string concatenation; stringifies both operands.
    Concat,
}

impl Operator {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::Concat => "~",
        }
    }
}

/// Comparison and membership operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

/// A literal constant in source.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// An expression with its source location.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ExprLoc {
    pub expr: Expr,
    pub loc: SourceLoc,
}

impl ExprLoc {
    pub fn new(expr: Expr, loc: SourceLoc) -> Self {
        Self { expr, loc }
    }
}

/// Positional and keyword arguments of a call, filter, or test application.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct CallArgs {
    pub pos: Vec<ExprLoc>,
    pub kwargs: Vec<(String, ExprLoc)>,
}

/// An expression in the AST.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Literal),
    /// A name resolved against the scope chain at runtime.
    Name(String),
    List(Vec<ExprLoc>),
    /// Dict literal entries in source order; keys are arbitrary expressions
    /// that must evaluate to strings.
    Dict(Vec<(ExprLoc, ExprLoc)>),
    BinOp {
        op: Operator,
        left: Box<ExprLoc>,
        right: Box<ExprLoc>,
    },
    Compare {
        op: CmpOperator,
        left: Box<ExprLoc>,
        right: Box<ExprLoc>,
    },
    And {
        left: Box<ExprLoc>,
        right: Box<ExprLoc>,
    },
    Or {
        left: Box<ExprLoc>,
        right: Box<ExprLoc>,
    },
    Not(Box<ExprLoc>),
    Neg(Box<ExprLoc>),
    /// `X if C else Y`; without `else` the false branch yields undefined.
    CondExpr {
        cond: Box<ExprLoc>,
        then: Box<ExprLoc>,
        otherwise: Option<Box<ExprLoc>>,
    },
    /// Attribute access `a.b`. On dicts this tries methods first, then keys.
    Attr {
        obj: Box<ExprLoc>,
        name: String,
    },
    /// Subscript `a[i]`.
    Subscript {
        obj: Box<ExprLoc>,
        index: Box<ExprLoc>,
    },
    /// Slice `a[start:stop:step]` with Python defaults for omitted parts.
    Slice {
        obj: Box<ExprLoc>,
        start: Option<Box<ExprLoc>>,
        stop: Option<Box<ExprLoc>>,
        step: Option<Box<ExprLoc>>,
    },
    Call {
        callee: Box<ExprLoc>,
        args: CallArgs,
    },
    /// Filter application `value | name(args)`.
    Filter {
        name: String,
        value: Box<ExprLoc>,
        args: CallArgs,
    },
    /// Test application `value is name(args)` or `value is not name`.
    Test {
        name: String,
        value: Box<ExprLoc>,
        args: CallArgs,
        negated: bool,
    },
}

/// The target of a `set` statement.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SetTarget {
    Name(String),
    /// `ns.attr = value`; only legal on namespace objects.
    Attr { name: String, attr: String },
}

/// One declared macro parameter, with its optional default expression.
///
/// Defaults are stored unevaluated; the compiler lowers them into the macro
/// prologue so they are evaluated at call-site binding time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MacroParamDecl {
    pub name: String,
    pub default: Option<ExprLoc>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MacroDecl {
    pub name: String,
    pub params: Vec<MacroParamDecl>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BlockDecl {
    pub name: String,
    pub required: bool,
    pub scoped: bool,
    pub body: Vec<Stmt>,
}

/// A statement with its source location.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Stmt {
    pub node: StmtNode,
    pub loc: SourceLoc,
}

impl Stmt {
    pub fn new(node: StmtNode, loc: SourceLoc) -> Self {
        Self { node, loc }
    }
}

/// A statement in the AST, one variant per block tag plus literal text.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StmtNode {
    /// Literal template text, already whitespace-trimmed by the lexer.
    Text(String),
    /// `{{ expr }}` output.
    Emit(ExprLoc),
    If {
        /// `(condition, body)` for the `if` and each `elif`.
        arms: Vec<(ExprLoc, Vec<Stmt>)>,
        else_body: Vec<Stmt>,
    },
    For {
        targets: Vec<String>,
        iter: ExprLoc,
        /// Inline `if` filter; filtered-out items do not consume loop indices.
        cond: Option<ExprLoc>,
        body: Vec<Stmt>,
        /// Runs only when the iterable produced zero items.
        else_body: Vec<Stmt>,
    },
    Set {
        target: SetTarget,
        value: ExprLoc,
    },
    /// `{% set x %}…{% endset %}`: the body renders to a safe string.
    SetBlock {
        target: SetTarget,
        body: Vec<Stmt>,
    },
    With {
        bindings: Vec<(String, ExprLoc)>,
        body: Vec<Stmt>,
    },
    Macro(MacroDecl),
    /// `{% call(params) macro(args) %}body{% endcall %}`.
    CallBlock {
        params: Vec<MacroParamDecl>,
        call: ExprLoc,
        body: Vec<Stmt>,
    },
    /// `{% filter name | name2 %}body{% endfilter %}`.
    FilterBlock {
        filters: Vec<(String, CallArgs, SourceLoc)>,
        body: Vec<Stmt>,
    },
    Include {
        expr: ExprLoc,
        ignore_missing: bool,
        with_context: bool,
    },
    Import {
        template: ExprLoc,
        alias: String,
        with_context: bool,
    },
    FromImport {
        template: ExprLoc,
        /// `(exported name, optional alias)` pairs.
        names: Vec<(String, Option<String>)>,
        with_context: bool,
    },
    Extends(ExprLoc),
    Block(BlockDecl),
    Autoescape {
        enabled: ExprLoc,
        body: Vec<Stmt>,
    },
    /// `{% do expr %}`: evaluate for side effects, discard the result.
    Do(ExprLoc),
    Break,
    Continue,
}
