//! Template parser.
//!
//! A recursive-descent statement recognizer keyed by block tag names, with a
//! precedence-climbing expression parser. The token stream comes from the
//! lexer with whitespace control already applied.

use ahash::AHashSet;

use crate::{
    error::{Error, ErrorKind, RunResult, SourceLoc},
    expressions::{
        BlockDecl, CallArgs, CmpOperator, Expr, ExprLoc, Literal, MacroDecl, MacroParamDecl, Operator, SetTarget,
        Stmt, StmtNode,
    },
    lexer::{Op, Token, TokenKind},
};

/// Maximum expression nesting depth.
///
/// Prevents stack overflow from pathological inputs like `((((((x))))))`.
const MAX_NESTING_DEPTH: u32 = 200;

/// Names that terminate an unparenthesized sub-expression and therefore can
/// never start a bare test argument.
const RESERVED_NAMES: &[&str] = &["and", "or", "not", "in", "is", "if", "else", "recursive"];

pub(crate) fn parse(tokens: Vec<Token>, name: &str) -> RunResult<Vec<Stmt>> {
    let mut parser = Parser::new(tokens);
    let (stmts, _) = parser.parse_until(&[]).map_err(|e| e.with_template(name))?;
    Ok(stmts)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: u32,
    /// Set once any construct other than whitespace text has been parsed;
    /// `extends` must come before this point.
    body_started: bool,
    extends_seen: bool,
    block_names: AHashSet<String>,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            body_started: false,
            extends_seen: false,
            block_names: AHashSet::new(),
        }
    }

    // --- token stream helpers ---

    fn peek(&self) -> &TokenKind {
        self.tokens.get(self.pos).map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        self.tokens.get(self.pos + offset).map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn loc(&self) -> SourceLoc {
        self.tokens.get(self.pos).map_or_else(SourceLoc::default, |t| t.loc)
    }

    fn bump(&mut self) -> TokenKind {
        let kind = self.tokens.get(self.pos).map_or(TokenKind::Eof, |t| t.kind.clone());
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn unexpected(&self, expected: &str) -> Error {
        Error::new_at(
            ErrorKind::UnexpectedToken,
            format!("expected {expected}, found {}", self.peek().describe()),
            self.loc(),
        )
    }

    fn expect_op(&mut self, op: Op) -> RunResult<()> {
        if *self.peek() == TokenKind::Op(op) {
            self.bump();
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{}`", op.describe())))
        }
    }

    fn accept_op(&mut self, op: Op) -> bool {
        if *self.peek() == TokenKind::Op(op) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_name(&mut self, what: &str) -> RunResult<String> {
        match self.peek() {
            TokenKind::Name(_) => {
                let TokenKind::Name(name) = self.bump() else { unreachable!() };
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn accept_name(&mut self, name: &str) -> bool {
        if matches!(self.peek(), TokenKind::Name(n) if n == name) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn peek_name(&self) -> Option<&str> {
        match self.peek() {
            TokenKind::Name(n) => Some(n),
            _ => None,
        }
    }

    fn expect_block_end(&mut self) -> RunResult<()> {
        if *self.peek() == TokenKind::BlockEnd {
            self.bump();
            Ok(())
        } else {
            Err(self.unexpected("end of block tag"))
        }
    }

    // --- statements ---

    /// Parses statements until one of `end_tags` opens, returning the body and
    /// the tag that terminated it (empty at end of input).
    ///
    /// The terminating tag's name is consumed; the rest of its block tag is
    /// left for the caller.
    fn parse_until(&mut self, end_tags: &[&str]) -> RunResult<(Vec<Stmt>, String)> {
        let mut stmts = Vec::new();
        loop {
            let loc = self.loc();
            match self.peek() {
                TokenKind::Eof => {
                    if end_tags.is_empty() {
                        return Ok((stmts, String::new()));
                    }
                    return Err(Error::new_at(
                        ErrorKind::UnterminatedBlock,
                        format!("template ended while waiting for {}", format_tags(end_tags)),
                        loc,
                    ));
                }
                TokenKind::Text(_) => {
                    let TokenKind::Text(text) = self.bump() else { unreachable!() };
                    if !text.trim().is_empty() {
                        self.body_started = true;
                    }
                    stmts.push(Stmt::new(StmtNode::Text(text), loc));
                }
                TokenKind::VarStart => {
                    self.bump();
                    let expr = self.parse_expr()?;
                    if *self.peek() != TokenKind::VarEnd {
                        return Err(self.unexpected("end of variable tag"));
                    }
                    self.bump();
                    self.body_started = true;
                    stmts.push(Stmt::new(StmtNode::Emit(expr), loc));
                }
                TokenKind::BlockStart => {
                    let tag = match self.peek_at(1) {
                        TokenKind::Name(n) => n.clone(),
                        _ => {
                            self.bump();
                            return Err(self.unexpected("statement name"));
                        }
                    };
                    if end_tags.contains(&tag.as_str()) {
                        self.bump();
                        self.bump();
                        return Ok((stmts, tag));
                    }
                    self.bump();
                    self.bump();
                    let stmt = self.parse_statement(&tag, loc)?;
                    stmts.push(stmt);
                }
                _ => return Err(self.unexpected("template text or a tag")),
            }
        }
    }

    fn parse_statement(&mut self, tag: &str, loc: SourceLoc) -> RunResult<Stmt> {
        let is_extends = tag == "extends";
        let node = match tag {
            "if" => self.parse_if()?,
            "for" => self.parse_for()?,
            "set" => self.parse_set()?,
            "with" => self.parse_with()?,
            "macro" => self.parse_macro()?,
            "call" => self.parse_call_block()?,
            "include" => self.parse_include()?,
            "import" => self.parse_import()?,
            "from" => self.parse_from_import()?,
            "extends" => self.parse_extends(loc)?,
            "block" => self.parse_block(loc)?,
            "autoescape" => self.parse_autoescape()?,
            "filter" => self.parse_filter_block()?,
            "do" => {
                let expr = self.parse_expr()?;
                self.expect_block_end()?;
                StmtNode::Do(expr)
            }
            "break" => {
                self.expect_block_end()?;
                StmtNode::Break
            }
            "continue" => {
                self.expect_block_end()?;
                StmtNode::Continue
            }
            "endif" | "endfor" | "endset" | "endwith" | "endmacro" | "endcall" | "endblock" | "endautoescape"
            | "endfilter" | "elif" | "else" => {
                return Err(Error::new_at(
                    ErrorKind::UnexpectedToken,
                    format!("unexpected `{{% {tag} %}}` with no open block"),
                    loc,
                ));
            }
            other => {
                return Err(Error::new_at(
                    ErrorKind::UnexpectedToken,
                    format!("unknown statement tag `{other}`"),
                    loc,
                ));
            }
        };
        if !is_extends {
            self.body_started = true;
        }
        Ok(Stmt::new(node, loc))
    }

    fn parse_if(&mut self) -> RunResult<StmtNode> {
        let mut arms = Vec::new();
        let mut cond = self.parse_expr()?;
        self.expect_block_end()?;
        self.depth += 1;
        let mut else_body = Vec::new();
        loop {
            let (body, tag) = self.parse_until(&["elif", "else", "endif"])?;
            arms.push((cond, body));
            match tag.as_str() {
                "elif" => {
                    cond = self.parse_expr()?;
                    self.expect_block_end()?;
                }
                "else" => {
                    self.expect_block_end()?;
                    let (body, _) = self.parse_until(&["endif"])?;
                    else_body = body;
                    self.expect_block_end()?;
                    break;
                }
                _ => {
                    self.expect_block_end()?;
                    break;
                }
            }
        }
        self.depth -= 1;
        Ok(StmtNode::If { arms, else_body })
    }

    fn parse_for(&mut self) -> RunResult<StmtNode> {
        let targets = self.parse_assign_targets()?;
        if !self.accept_name("in") {
            return Err(self.unexpected("`in`"));
        }
        // the iterable is parsed without the conditional expression so an
        // inline `if` filter is not swallowed
        let iter = self.parse_or()?;
        let cond = if self.accept_name("if") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect_block_end()?;
        self.depth += 1;
        let (body, tag) = self.parse_until(&["else", "endfor"])?;
        let else_body = if tag == "else" {
            self.expect_block_end()?;
            let (body, _) = self.parse_until(&["endfor"])?;
            body
        } else {
            Vec::new()
        };
        self.expect_block_end()?;
        self.depth -= 1;
        Ok(StmtNode::For {
            targets,
            iter,
            cond,
            body,
            else_body,
        })
    }

    fn parse_assign_targets(&mut self) -> RunResult<Vec<String>> {
        let mut targets = Vec::new();
        let parenthesized = self.accept_op(Op::LParen);
        loop {
            targets.push(self.expect_name("a loop target name")?);
            if !self.accept_op(Op::Comma) {
                break;
            }
        }
        if parenthesized {
            self.expect_op(Op::RParen)?;
        }
        Ok(targets)
    }

    fn parse_set_target(&mut self) -> RunResult<SetTarget> {
        let loc = self.loc();
        let name = match self.peek() {
            TokenKind::Name(_) => self.expect_name("an assignment target")?,
            _ => {
                return Err(Error::new_at(
                    ErrorKind::InvalidAssignmentTarget,
                    format!("cannot assign to {}", self.peek().describe()),
                    loc,
                ));
            }
        };
        if self.accept_op(Op::Dot) {
            let attr = self.expect_name("an attribute name")?;
            if *self.peek() == TokenKind::Op(Op::Dot) {
                return Err(Error::new_at(
                    ErrorKind::InvalidAssignmentTarget,
                    "only one attribute level can be assigned",
                    loc,
                ));
            }
            Ok(SetTarget::Attr { name, attr })
        } else {
            Ok(SetTarget::Name(name))
        }
    }

    fn parse_set(&mut self) -> RunResult<StmtNode> {
        let target = self.parse_set_target()?;
        if self.accept_op(Op::Assign) {
            let value = self.parse_expr()?;
            self.expect_block_end()?;
            Ok(StmtNode::Set { target, value })
        } else {
            self.expect_block_end()?;
            self.depth += 1;
            let (body, _) = self.parse_until(&["endset"])?;
            self.expect_block_end()?;
            self.depth -= 1;
            Ok(StmtNode::SetBlock { target, body })
        }
    }

    fn parse_with(&mut self) -> RunResult<StmtNode> {
        let mut bindings = Vec::new();
        while matches!(self.peek(), TokenKind::Name(_)) {
            let name = self.expect_name("a binding name")?;
            self.expect_op(Op::Assign)?;
            let value = self.parse_expr()?;
            bindings.push((name, value));
            if !self.accept_op(Op::Comma) {
                break;
            }
        }
        self.expect_block_end()?;
        self.depth += 1;
        let (body, _) = self.parse_until(&["endwith"])?;
        self.expect_block_end()?;
        self.depth -= 1;
        Ok(StmtNode::With { bindings, body })
    }

    fn parse_macro_params(&mut self) -> RunResult<Vec<MacroParamDecl>> {
        let mut params = Vec::new();
        self.expect_op(Op::LParen)?;
        while !self.accept_op(Op::RParen) {
            let name = self.expect_name("a parameter name")?;
            let default = if self.accept_op(Op::Assign) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(MacroParamDecl { name, default });
            if !self.accept_op(Op::Comma) {
                self.expect_op(Op::RParen)?;
                break;
            }
        }
        Ok(params)
    }

    fn parse_macro(&mut self) -> RunResult<StmtNode> {
        let name = self.expect_name("a macro name")?;
        let params = self.parse_macro_params()?;
        self.expect_block_end()?;
        self.depth += 1;
        let (body, _) = self.parse_until(&["endmacro"])?;
        self.expect_block_end()?;
        self.depth -= 1;
        Ok(StmtNode::Macro(MacroDecl { name, params, body }))
    }

    fn parse_call_block(&mut self) -> RunResult<StmtNode> {
        let params = if *self.peek() == TokenKind::Op(Op::LParen) {
            self.parse_macro_params()?
        } else {
            Vec::new()
        };
        let loc = self.loc();
        let call = self.parse_expr()?;
        if !matches!(call.expr, Expr::Call { .. }) {
            return Err(Error::new_at(
                ErrorKind::UnexpectedToken,
                "`call` requires a macro invocation",
                loc,
            ));
        }
        self.expect_block_end()?;
        self.depth += 1;
        let (body, _) = self.parse_until(&["endcall"])?;
        self.expect_block_end()?;
        self.depth -= 1;
        Ok(StmtNode::CallBlock { params, call, body })
    }

    /// Parses the `[with|without context]` suffix, returning the default when absent.
    fn parse_context_modifier(&mut self, default: bool) -> RunResult<bool> {
        if self.accept_name("with") {
            if !self.accept_name("context") {
                return Err(self.unexpected("`context`"));
            }
            Ok(true)
        } else if self.accept_name("without") {
            if !self.accept_name("context") {
                return Err(self.unexpected("`context`"));
            }
            Ok(false)
        } else {
            Ok(default)
        }
    }

    fn parse_include(&mut self) -> RunResult<StmtNode> {
        let expr = self.parse_expr()?;
        let ignore_missing = if self.accept_name("ignore") {
            if !self.accept_name("missing") {
                return Err(self.unexpected("`missing`"));
            }
            true
        } else {
            false
        };
        let with_context = self.parse_context_modifier(true)?;
        self.expect_block_end()?;
        Ok(StmtNode::Include {
            expr,
            ignore_missing,
            with_context,
        })
    }

    fn parse_import(&mut self) -> RunResult<StmtNode> {
        let template = self.parse_expr()?;
        if !self.accept_name("as") {
            return Err(self.unexpected("`as`"));
        }
        let alias = self.expect_name("an alias name")?;
        let with_context = self.parse_context_modifier(false)?;
        self.expect_block_end()?;
        Ok(StmtNode::Import {
            template,
            alias,
            with_context,
        })
    }

    fn parse_from_import(&mut self) -> RunResult<StmtNode> {
        let template = self.parse_expr()?;
        if !self.accept_name("import") {
            return Err(self.unexpected("`import`"));
        }
        let mut names = Vec::new();
        let mut with_context = false;
        loop {
            if let Some(name) = self.peek_name()
                && (name == "with" || name == "without")
                && matches!(self.peek_at(1), TokenKind::Name(n) if n == "context")
            {
                with_context = self.parse_context_modifier(false)?;
                break;
            }
            let name = self.expect_name("an import name")?;
            let alias = if self.accept_name("as") {
                Some(self.expect_name("an alias name")?)
            } else {
                None
            };
            names.push((name, alias));
            if !self.accept_op(Op::Comma) {
                break;
            }
        }
        if names.is_empty() {
            return Err(self.unexpected("an import name"));
        }
        self.expect_block_end()?;
        Ok(StmtNode::FromImport {
            template,
            names,
            with_context,
        })
    }

    fn parse_extends(&mut self, loc: SourceLoc) -> RunResult<StmtNode> {
        if self.extends_seen {
            return Err(Error::new_at(
                ErrorKind::MultipleExtends,
                "a template can only extend one parent",
                loc,
            ));
        }
        if self.depth > 0 || self.body_started {
            return Err(Error::new_at(
                ErrorKind::MultipleExtends,
                "`extends` must be the first construct in a template",
                loc,
            ));
        }
        self.extends_seen = true;
        let expr = self.parse_expr()?;
        self.expect_block_end()?;
        Ok(StmtNode::Extends(expr))
    }

    fn parse_block(&mut self, loc: SourceLoc) -> RunResult<StmtNode> {
        let name = self.expect_name("a block name")?;
        if !self.block_names.insert(name.clone()) {
            return Err(Error::new_at(
                ErrorKind::DuplicateBlock,
                format!("block `{name}` is defined twice"),
                loc,
            ));
        }
        let mut required = false;
        let mut scoped = false;
        loop {
            if self.accept_name("required") {
                required = true;
            } else if self.accept_name("scoped") {
                scoped = true;
            } else {
                break;
            }
        }
        self.expect_block_end()?;
        self.depth += 1;
        let (body, _) = self.parse_until(&["endblock"])?;
        if matches!(self.peek(), TokenKind::Name(_)) {
            let trailer = self.expect_name("the block name")?;
            if trailer != name {
                return Err(Error::new_at(
                    ErrorKind::UnexpectedToken,
                    format!("`endblock {trailer}` does not match block `{name}`"),
                    loc,
                ));
            }
        }
        self.expect_block_end()?;
        self.depth -= 1;
        if required {
            let solid = body
                .iter()
                .any(|stmt| !matches!(&stmt.node, StmtNode::Text(t) if t.trim().is_empty()));
            if solid {
                return Err(Error::new_at(
                    ErrorKind::RequiredBlockBody,
                    format!("required block `{name}` may only contain whitespace"),
                    loc,
                ));
            }
        }
        Ok(StmtNode::Block(BlockDecl {
            name,
            required,
            scoped,
            body,
        }))
    }

    fn parse_autoescape(&mut self) -> RunResult<StmtNode> {
        let enabled = self.parse_expr()?;
        self.expect_block_end()?;
        self.depth += 1;
        let (body, _) = self.parse_until(&["endautoescape"])?;
        self.expect_block_end()?;
        self.depth -= 1;
        Ok(StmtNode::Autoescape { enabled, body })
    }

    fn parse_filter_block(&mut self) -> RunResult<StmtNode> {
        let mut filters = Vec::new();
        loop {
            let loc = self.loc();
            let name = self.expect_name("a filter name")?;
            let args = if *self.peek() == TokenKind::Op(Op::LParen) {
                self.parse_call_args()?
            } else {
                CallArgs::default()
            };
            filters.push((name, args, loc));
            if !self.accept_op(Op::Pipe) {
                break;
            }
        }
        self.expect_block_end()?;
        self.depth += 1;
        let (body, _) = self.parse_until(&["endfilter"])?;
        self.expect_block_end()?;
        self.depth -= 1;
        Ok(StmtNode::FilterBlock { filters, body })
    }

    // --- expressions ---

    fn parse_expr(&mut self) -> RunResult<ExprLoc> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(Error::new_at(ErrorKind::UnexpectedToken, "expression too deeply nested", self.loc()));
        }
        let result = self.parse_condexpr();
        self.depth -= 1;
        result
    }

    fn parse_condexpr(&mut self) -> RunResult<ExprLoc> {
        let loc = self.loc();
        let then = self.parse_or()?;
        if self.accept_name("if") {
            let cond = self.parse_or()?;
            let otherwise = if self.accept_name("else") {
                Some(Box::new(self.parse_condexpr()?))
            } else {
                None
            };
            Ok(ExprLoc::new(
                Expr::CondExpr {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    otherwise,
                },
                loc,
            ))
        } else {
            Ok(then)
        }
    }

    fn parse_or(&mut self) -> RunResult<ExprLoc> {
        let loc = self.loc();
        let mut left = self.parse_and()?;
        while self.accept_name("or") {
            let right = self.parse_and()?;
            left = ExprLoc::new(
                Expr::Or {
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> RunResult<ExprLoc> {
        let loc = self.loc();
        let mut left = self.parse_not()?;
        while self.accept_name("and") {
            let right = self.parse_not()?;
            left = ExprLoc::new(
                Expr::And {
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            );
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> RunResult<ExprLoc> {
        let loc = self.loc();
        if self.accept_name("not") {
            let inner = self.parse_not()?;
            Ok(ExprLoc::new(Expr::Not(Box::new(inner)), loc))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> RunResult<ExprLoc> {
        let loc = self.loc();
        let left = self.parse_concat()?;
        let op = match self.peek() {
            TokenKind::Op(Op::Eq) => Some(CmpOperator::Eq),
            TokenKind::Op(Op::Ne) => Some(CmpOperator::Ne),
            TokenKind::Op(Op::Lt) => Some(CmpOperator::Lt),
            TokenKind::Op(Op::Le) => Some(CmpOperator::Le),
            TokenKind::Op(Op::Gt) => Some(CmpOperator::Gt),
            TokenKind::Op(Op::Ge) => Some(CmpOperator::Ge),
            TokenKind::Name(n) if n == "in" => Some(CmpOperator::In),
            TokenKind::Name(n) if n == "not" && matches!(self.peek_at(1), TokenKind::Name(m) if m == "in") => {
                Some(CmpOperator::NotIn)
            }
            TokenKind::Name(n) if n == "is" => {
                self.bump();
                return self.parse_test(left, loc);
            }
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        self.bump();
        if op == CmpOperator::NotIn {
            self.bump();
        }
        let right = self.parse_concat()?;
        Ok(ExprLoc::new(
            Expr::Compare {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            loc,
        ))
    }

    /// Parses `value is [not] testname [args]`.
    fn parse_test(&mut self, value: ExprLoc, loc: SourceLoc) -> RunResult<ExprLoc> {
        let negated = self.accept_name("not");
        let name = self.expect_name("a test name")?;
        let mut args = CallArgs::default();
        if *self.peek() == TokenKind::Op(Op::LParen) {
            args = self.parse_call_args()?;
        } else if self.bare_test_arg_follows() {
            args.pos.push(self.parse_postfix()?);
        }
        Ok(ExprLoc::new(
            Expr::Test {
                name,
                value: Box::new(value),
                args,
                negated,
            },
            loc,
        ))
    }

    /// Whether the next token can start an unparenthesized test argument,
    /// as in `x is divisibleby 3`.
    fn bare_test_arg_follows(&self) -> bool {
        match self.peek() {
            TokenKind::Int(_) | TokenKind::Float(_) | TokenKind::Str(_) => true,
            TokenKind::Op(Op::LBracket | Op::LBrace) => true,
            TokenKind::Name(n) => !RESERVED_NAMES.contains(&n.as_str()),
            _ => false,
        }
    }

    fn parse_concat(&mut self) -> RunResult<ExprLoc> {
        let loc = self.loc();
        let mut left = self.parse_additive()?;
        while self.accept_op(Op::Tilde) {
            let right = self.parse_additive()?;
            left = ExprLoc::new(
                Expr::BinOp {
                    op: Operator::Concat,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            );
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> RunResult<ExprLoc> {
        let loc = self.loc();
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Op(Op::Add) => Operator::Add,
                TokenKind::Op(Op::Sub) => Operator::Sub,
                _ => break,
            };
            self.bump();
            let right = self.parse_multiplicative()?;
            left = ExprLoc::new(
                Expr::BinOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            );
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> RunResult<ExprLoc> {
        let loc = self.loc();
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Op(Op::Mul) => Operator::Mul,
                TokenKind::Op(Op::Div) => Operator::Div,
                TokenKind::Op(Op::FloorDiv) => Operator::FloorDiv,
                TokenKind::Op(Op::Mod) => Operator::Mod,
                _ => break,
            };
            self.bump();
            let right = self.parse_unary()?;
            left = ExprLoc::new(
                Expr::BinOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> RunResult<ExprLoc> {
        let loc = self.loc();
        if self.accept_op(Op::Sub) {
            let inner = self.parse_unary()?;
            // constant-fold negative literals so `-1` is a plain constant
            let expr = match inner.expr {
                Expr::Literal(Literal::Int(v)) => Expr::Literal(Literal::Int(-v)),
                Expr::Literal(Literal::Float(v)) => Expr::Literal(Literal::Float(-v)),
                other => Expr::Neg(Box::new(ExprLoc::new(other, inner.loc))),
            };
            Ok(ExprLoc::new(expr, loc))
        } else if self.accept_op(Op::Add) {
            self.parse_unary()
        } else {
            self.parse_power()
        }
    }

    fn parse_power(&mut self) -> RunResult<ExprLoc> {
        let loc = self.loc();
        let base = self.parse_filtered()?;
        if self.accept_op(Op::Pow) {
            let exp = self.parse_unary()?;
            Ok(ExprLoc::new(
                Expr::BinOp {
                    op: Operator::Pow,
                    left: Box::new(base),
                    right: Box::new(exp),
                },
                loc,
            ))
        } else {
            Ok(base)
        }
    }

    fn parse_filtered(&mut self) -> RunResult<ExprLoc> {
        let mut value = self.parse_postfix()?;
        while self.accept_op(Op::Pipe) {
            let loc = self.loc();
            let name = self.expect_name("a filter name")?;
            let args = if *self.peek() == TokenKind::Op(Op::LParen) {
                self.parse_call_args()?
            } else {
                CallArgs::default()
            };
            value = ExprLoc::new(
                Expr::Filter {
                    name,
                    value: Box::new(value),
                    args,
                },
                loc,
            );
        }
        Ok(value)
    }

    fn parse_postfix(&mut self) -> RunResult<ExprLoc> {
        let mut expr = self.parse_primary()?;
        loop {
            let loc = self.loc();
            if self.accept_op(Op::Dot) {
                let name = self.expect_name("an attribute name")?;
                expr = ExprLoc::new(
                    Expr::Attr {
                        obj: Box::new(expr),
                        name,
                    },
                    loc,
                );
            } else if *self.peek() == TokenKind::Op(Op::LParen) {
                let args = self.parse_call_args()?;
                expr = ExprLoc::new(
                    Expr::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    loc,
                );
            } else if self.accept_op(Op::LBracket) {
                expr = self.parse_subscript(expr, loc)?;
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_subscript(&mut self, obj: ExprLoc, loc: SourceLoc) -> RunResult<ExprLoc> {
        let start = if matches!(self.peek(), TokenKind::Op(Op::Colon)) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        if self.accept_op(Op::Colon) {
            let stop = if matches!(self.peek(), TokenKind::Op(Op::Colon | Op::RBracket)) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            let step = if self.accept_op(Op::Colon) {
                if matches!(self.peek(), TokenKind::Op(Op::RBracket)) {
                    None
                } else {
                    Some(Box::new(self.parse_expr()?))
                }
            } else {
                None
            };
            self.expect_op(Op::RBracket)?;
            Ok(ExprLoc::new(
                Expr::Slice {
                    obj: Box::new(obj),
                    start,
                    stop,
                    step,
                },
                loc,
            ))
        } else {
            self.expect_op(Op::RBracket)?;
            let index = start.ok_or_else(|| self.unexpected("a subscript expression"))?;
            Ok(ExprLoc::new(
                Expr::Subscript {
                    obj: Box::new(obj),
                    index,
                },
                loc,
            ))
        }
    }

    fn parse_call_args(&mut self) -> RunResult<CallArgs> {
        self.expect_op(Op::LParen)?;
        let mut args = CallArgs::default();
        loop {
            if self.accept_op(Op::RParen) {
                return Ok(args);
            }
            let is_kwarg =
                matches!(self.peek(), TokenKind::Name(_)) && matches!(self.peek_at(1), TokenKind::Op(Op::Assign));
            if is_kwarg {
                let name = self.expect_name("an argument name")?;
                self.expect_op(Op::Assign)?;
                let value = self.parse_expr()?;
                args.kwargs.push((name, value));
            } else {
                if !args.kwargs.is_empty() {
                    return Err(Error::new_at(
                        ErrorKind::UnexpectedToken,
                        "positional argument follows keyword argument",
                        self.loc(),
                    ));
                }
                args.pos.push(self.parse_expr()?);
            }
            if !self.accept_op(Op::Comma) {
                self.expect_op(Op::RParen)?;
                return Ok(args);
            }
        }
    }

    fn parse_primary(&mut self) -> RunResult<ExprLoc> {
        let loc = self.loc();
        match self.peek().clone() {
            TokenKind::Int(v) => {
                self.bump();
                Ok(ExprLoc::new(Expr::Literal(Literal::Int(v)), loc))
            }
            TokenKind::Float(v) => {
                self.bump();
                Ok(ExprLoc::new(Expr::Literal(Literal::Float(v)), loc))
            }
            TokenKind::Str(_) => {
                let TokenKind::Str(s) = self.bump() else { unreachable!() };
                Ok(ExprLoc::new(Expr::Literal(Literal::Str(s)), loc))
            }
            TokenKind::Name(name) => {
                self.bump();
                let expr = match name.as_str() {
                    "true" | "True" => Expr::Literal(Literal::Bool(true)),
                    "false" | "False" => Expr::Literal(Literal::Bool(false)),
                    "none" | "None" => Expr::Literal(Literal::None),
                    _ => Expr::Name(name),
                };
                Ok(ExprLoc::new(expr, loc))
            }
            TokenKind::Op(Op::LParen) => {
                self.bump();
                let first = self.parse_expr()?;
                if self.accept_op(Op::Comma) {
                    // a parenthesized tuple is represented as a list value
                    let mut items = vec![first];
                    while !matches!(self.peek(), TokenKind::Op(Op::RParen)) {
                        items.push(self.parse_expr()?);
                        if !self.accept_op(Op::Comma) {
                            break;
                        }
                    }
                    self.expect_op(Op::RParen)?;
                    Ok(ExprLoc::new(Expr::List(items), loc))
                } else {
                    self.expect_op(Op::RParen)?;
                    Ok(first)
                }
            }
            TokenKind::Op(Op::LBracket) => {
                self.bump();
                let mut items = Vec::new();
                while !matches!(self.peek(), TokenKind::Op(Op::RBracket)) {
                    items.push(self.parse_expr()?);
                    if !self.accept_op(Op::Comma) {
                        break;
                    }
                }
                self.expect_op(Op::RBracket)?;
                Ok(ExprLoc::new(Expr::List(items), loc))
            }
            TokenKind::Op(Op::LBrace) => {
                self.bump();
                let mut pairs = Vec::new();
                while !matches!(self.peek(), TokenKind::Op(Op::RBrace)) {
                    let key = self.parse_expr()?;
                    self.expect_op(Op::Colon)?;
                    let value = self.parse_expr()?;
                    pairs.push((key, value));
                    if !self.accept_op(Op::Comma) {
                        break;
                    }
                }
                self.expect_op(Op::RBrace)?;
                Ok(ExprLoc::new(Expr::Dict(pairs), loc))
            }
            _ => Err(self.unexpected("an expression")),
        }
    }
}

fn format_tags(tags: &[&str]) -> String {
    let list: Vec<String> = tags.iter().map(|t| format!("`{{% {t} %}}`")).collect();
    list.join(" or ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        environment::SyntaxConfig,
        lexer::{LexOptions, lex},
    };

    fn parse_source(source: &str) -> RunResult<Vec<Stmt>> {
        let options = LexOptions {
            syntax: SyntaxConfig::default(),
            trim_blocks: false,
            lstrip_blocks: false,
            keep_trailing_newline: true,
            line_statement_prefix: None,
        };
        parse(lex(source, "test", &options)?, "test")
    }

    #[test]
    fn emit_with_filter_chain() {
        let stmts = parse_source("{{ x | upper | join(', ') }}").unwrap();
        assert_eq!(stmts.len(), 1);
        let StmtNode::Emit(expr) = &stmts[0].node else {
            panic!("expected emit");
        };
        let Expr::Filter { name, value, .. } = &expr.expr else {
            panic!("expected filter");
        };
        assert_eq!(name, "join");
        assert!(matches!(&value.expr, Expr::Filter { name, .. } if name == "upper"));
    }

    #[test]
    fn for_with_inline_condition_and_else() {
        let stmts = parse_source("{% for x in xs if x %}a{% else %}b{% endfor %}").unwrap();
        let StmtNode::For {
            targets,
            cond,
            else_body,
            ..
        } = &stmts[0].node
        else {
            panic!("expected for");
        };
        assert_eq!(targets, &["x"]);
        assert!(cond.is_some());
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn test_application_with_bare_argument() {
        let stmts = parse_source("{{ x is divisibleby 3 }}").unwrap();
        let StmtNode::Emit(expr) = &stmts[0].node else {
            panic!("expected emit");
        };
        let Expr::Test { name, args, negated, .. } = &expr.expr else {
            panic!("expected test, got {expr:?}");
        };
        assert_eq!(name, "divisibleby");
        assert_eq!(args.pos.len(), 1);
        assert!(!negated);
    }

    #[test]
    fn is_not_defined_negates() {
        let stmts = parse_source("{{ x is not defined }}").unwrap();
        let StmtNode::Emit(expr) = &stmts[0].node else {
            panic!("expected emit");
        };
        assert!(matches!(&expr.expr, Expr::Test { negated: true, .. }));
    }

    #[test]
    fn slice_components_may_be_omitted() {
        let stmts = parse_source("{{ xs[1:] }}{{ xs[:2] }}{{ xs[::2] }}").unwrap();
        for stmt in &stmts {
            let StmtNode::Emit(expr) = &stmt.node else {
                panic!("expected emit");
            };
            assert!(matches!(&expr.expr, Expr::Slice { .. }));
        }
    }

    #[test]
    fn set_namespace_attribute_target() {
        let stmts = parse_source("{% set ns.count = 1 %}").unwrap();
        let StmtNode::Set { target, .. } = &stmts[0].node else {
            panic!("expected set");
        };
        assert_eq!(
            target,
            &SetTarget::Attr {
                name: "ns".to_owned(),
                attr: "count".to_owned()
            }
        );
    }

    #[test]
    fn multiple_extends_is_rejected() {
        let err = parse_source("{% extends 'a' %}{% extends 'b' %}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MultipleExtends);
    }

    #[test]
    fn extends_after_output_is_rejected() {
        let err = parse_source("hello {% extends 'a' %}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MultipleExtends);
    }

    #[test]
    fn duplicate_block_is_rejected() {
        let err = parse_source("{% block a %}{% endblock %}{% block a %}{% endblock %}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateBlock);
    }

    #[test]
    fn required_block_with_content_is_rejected() {
        let err = parse_source("{% block a required %}text{% endblock %}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequiredBlockBody);
    }

    #[test]
    fn unterminated_if_is_rejected() {
        let err = parse_source("{% if x %}y").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnterminatedBlock);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = parse_source("{% bogus %}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedToken);
    }

    #[test]
    fn conditional_expression_without_else() {
        let stmts = parse_source("{{ 'a' if x }}").unwrap();
        let StmtNode::Emit(expr) = &stmts[0].node else {
            panic!("expected emit");
        };
        assert!(matches!(&expr.expr, Expr::CondExpr { otherwise: None, .. }));
    }

    #[test]
    fn power_is_right_associative() {
        let stmts = parse_source("{{ 2 ** 3 ** 2 }}").unwrap();
        let StmtNode::Emit(expr) = &stmts[0].node else {
            panic!("expected emit");
        };
        let Expr::BinOp {
            op: Operator::Pow,
            right,
            ..
        } = &expr.expr
        else {
            panic!("expected pow");
        };
        assert!(matches!(&right.expr, Expr::BinOp { op: Operator::Pow, .. }));
    }
}
