//! Template lexer.
//!
//! Splits source into text segments and delimiter-enclosed expression token
//! runs, applying whitespace control in the documented order: `lstrip_blocks`
//! first, then explicit `-`/`+` markers, then the `trim_blocks` newline.
//! Raw blocks are consumed wholesale and re-emitted as a single text token.

use crate::{
    environment::SyntaxConfig,
    error::{Error, ErrorKind, RunResult, SourceLoc},
};

/// Lexer-facing configuration, extracted from the environment.
#[derive(Debug, Clone)]
pub(crate) struct LexOptions {
    pub syntax: SyntaxConfig,
    pub trim_blocks: bool,
    pub lstrip_blocks: bool,
    pub keep_trailing_newline: bool,
    pub line_statement_prefix: Option<String>,
}

/// Operators and punctuation recognized inside delimiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Tilde,
    Pipe,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    Comma,
    Colon,
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
}

impl Op {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::Tilde => "~",
            Self::Pipe => "|",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Assign => "=",
            Self::Comma => ",",
            Self::Colon => ":",
            Self::Dot => ".",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBracket => "[",
            Self::RBracket => "]",
            Self::LBrace => "{",
            Self::RBrace => "}",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    /// Literal template text between delimiters, already whitespace-trimmed.
    Text(String),
    VarStart,
    VarEnd,
    BlockStart,
    BlockEnd,
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    Op(Op),
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            Self::Text(_) => "template text".to_owned(),
            Self::VarStart => "start of variable".to_owned(),
            Self::VarEnd => "end of variable".to_owned(),
            Self::BlockStart => "start of block".to_owned(),
            Self::BlockEnd => "end of block".to_owned(),
            Self::Name(n) => format!("`{n}`"),
            Self::Str(_) => "string literal".to_owned(),
            Self::Int(_) | Self::Float(_) => "number literal".to_owned(),
            Self::Op(op) => format!("`{}`", op.describe()),
            Self::Eof => "end of template".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub loc: SourceLoc,
}

/// Whitespace handling owed to the next text segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingTrim {
    /// No trimming.
    Keep,
    /// Explicit `-` marker: remove all leading whitespace.
    All,
    /// `trim_blocks`: remove a single leading newline.
    Newline,
}

/// Which delimiter pair an opening matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelimKind {
    Variable,
    Block,
    Comment,
}

/// How an expression token run terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExprEnd {
    /// At the configured closing delimiter.
    Delimiter(DelimKind),
    /// At the end of the line (line statements).
    Line,
}

pub(crate) fn lex(source: &str, name: &str, options: &LexOptions) -> RunResult<Vec<Token>> {
    let mut lexer = Lexer::new(source, options);
    lexer.run().map_err(|e| e.with_template(name))?;
    Ok(lexer.tokens)
}

struct Lexer<'s> {
    src: &'s str,
    options: &'s LexOptions,
    pos: usize,
    line: u32,
    col: u32,
    tokens: Vec<Token>,
    pending: PendingTrim,
}

impl<'s> Lexer<'s> {
    fn new(source: &'s str, options: &'s LexOptions) -> Self {
        let mut src = source;
        if !options.keep_trailing_newline {
            if let Some(stripped) = src.strip_suffix('\n') {
                src = stripped.strip_suffix('\r').unwrap_or(stripped);
            }
        }
        Self {
            src,
            options,
            pos: 0,
            line: 1,
            col: 1,
            tokens: Vec::new(),
            pending: PendingTrim::Keep,
        }
    }

    fn loc(&self) -> SourceLoc {
        SourceLoc::new(self.line, self.col)
    }

    fn push(&mut self, kind: TokenKind, loc: SourceLoc) {
        self.tokens.push(Token { kind, loc });
    }

    fn rest(&self) -> &'s str {
        &self.src[self.pos..]
    }

    /// Advances to an absolute byte position, updating line/column.
    fn advance_to(&mut self, target: usize) {
        debug_assert!(target >= self.pos);
        for c in self.src[self.pos..target].chars() {
            if c == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
        self.pos = target;
    }

    fn advance(&mut self, bytes: usize) {
        self.advance_to(self.pos + bytes);
    }

    fn run(&mut self) -> RunResult<()> {
        while self.pos < self.src.len() {
            self.text_segment()?;
        }
        // a trailing pending trim with no following text is a no-op
        let loc = self.loc();
        self.push(TokenKind::Eof, loc);
        Ok(())
    }

    /// Finds the earliest delimiter opening at or after `from`.
    fn find_delimiter(&self, from: usize) -> Option<(usize, DelimKind)> {
        let hay = &self.src[from..];
        let syntax = &self.options.syntax;
        let mut best: Option<(usize, DelimKind, usize)> = None;
        for (pat, kind) in [
            (&syntax.variable_start, DelimKind::Variable),
            (&syntax.block_start, DelimKind::Block),
            (&syntax.comment_start, DelimKind::Comment),
        ] {
            if let Some(idx) = hay.find(pat.as_str()) {
                let replace = match best {
                    None => true,
                    // ties go to the longer pattern so `{%` does not shadow a
                    // hypothetical `{%%` configuration
                    Some((bi, _, blen)) => idx < bi || (idx == bi && pat.len() > blen),
                };
                if replace {
                    best = Some((idx, kind, pat.len()));
                }
            }
        }
        best.map(|(idx, kind, _)| (from + idx, kind))
    }

    /// Finds a line-statement start strictly inside `[from, until)`.
    ///
    /// Returns (line start, statement start past prefix and leading space).
    fn find_line_statement(&self, from: usize, until: usize) -> Option<(usize, usize)> {
        let prefix = self.options.line_statement_prefix.as_deref()?;
        let mut line_start = if from == 0 || self.src.as_bytes()[from - 1] == b'\n' {
            Some(from)
        } else {
            None
        };
        let mut i = from;
        loop {
            if let Some(start) = line_start {
                let mut j = start;
                let bytes = self.src.as_bytes();
                while j < until && (bytes[j] == b' ' || bytes[j] == b'\t') {
                    j += 1;
                }
                if self.src[j..].starts_with(prefix) && j + prefix.len() <= until {
                    return Some((start, j + prefix.len()));
                }
            }
            match self.src[i..until].find('\n') {
                Some(nl) => {
                    i += nl + 1;
                    line_start = Some(i);
                }
                None => return None,
            }
        }
    }

    /// Lexes one text segment and whatever construct terminates it.
    fn text_segment(&mut self) -> RunResult<()> {
        let seg_start = self.pos;
        let delim = self.find_delimiter(seg_start);
        let delim_at = delim.map_or(self.src.len(), |(idx, _)| idx);
        let line_stmt = self.find_line_statement(seg_start, delim_at);

        if let Some((line_start, stmt_start)) = line_stmt {
            let text = self.src[seg_start..line_start].to_owned();
            self.emit_text(text, seg_start);
            self.advance_to(stmt_start);
            self.line_statement()?;
            return Ok(());
        }

        let Some((idx, kind)) = delim else {
            let text = self.src[seg_start..].to_owned();
            self.emit_text(text, seg_start);
            self.advance_to(self.src.len());
            return Ok(());
        };

        let open_len = match kind {
            DelimKind::Variable => self.options.syntax.variable_start.len(),
            DelimKind::Block => self.options.syntax.block_start.len(),
            DelimKind::Comment => self.options.syntax.comment_start.len(),
        };
        let marker = self.src[idx + open_len..].chars().next().filter(|c| *c == '-' || *c == '+');

        let mut text = self.src[seg_start..idx].to_owned();
        // order: lstrip_blocks, then the explicit marker
        if self.options.lstrip_blocks && kind != DelimKind::Variable && marker != Some('+') {
            lstrip_block_line(&mut text);
        }
        if marker == Some('-') {
            trim_text_end(&mut text);
        }
        self.emit_text(text, seg_start);

        self.advance_to(idx + open_len);
        if marker.is_some() {
            self.advance(1);
        }

        match kind {
            DelimKind::Comment => self.comment(),
            DelimKind::Variable => {
                let loc = self.loc();
                self.push(TokenKind::VarStart, loc);
                self.expression_tokens(ExprEnd::Delimiter(DelimKind::Variable))
            }
            DelimKind::Block => {
                if self.peek_raw_tag() {
                    self.raw_block()
                } else {
                    let loc = self.loc();
                    self.push(TokenKind::BlockStart, loc);
                    self.expression_tokens(ExprEnd::Delimiter(DelimKind::Block))
                }
            }
        }
    }

    fn emit_text(&mut self, mut text: String, _at: usize) {
        match self.pending {
            PendingTrim::Keep => {}
            PendingTrim::All => {
                let trimmed = text.trim_start();
                text = trimmed.to_owned();
            }
            PendingTrim::Newline => {
                if let Some(stripped) = text.strip_prefix("\r\n").or_else(|| text.strip_prefix('\n')) {
                    text = stripped.to_owned();
                }
            }
        }
        self.pending = PendingTrim::Keep;
        if !text.is_empty() {
            let loc = self.loc();
            self.push(TokenKind::Text(text), loc);
        }
    }

    /// Records the trim owed to the following text from a closing marker.
    fn set_pending(&mut self, marker: Option<char>, kind: DelimKind) {
        self.pending = match marker {
            Some('-') => PendingTrim::All,
            Some('+') => PendingTrim::Keep,
            _ if self.options.trim_blocks && kind != DelimKind::Variable => PendingTrim::Newline,
            _ => PendingTrim::Keep,
        };
    }

    fn comment(&mut self) -> RunResult<()> {
        let start_loc = self.loc();
        let end_pat = self.options.syntax.comment_end.as_str();
        let Some(rel) = self.rest().find(end_pat) else {
            return Err(Error::new_at(ErrorKind::UnterminatedComment, "unclosed comment", start_loc));
        };
        let end_idx = self.pos + rel;
        let marker = marker_before(self.src, self.pos, end_idx);
        self.advance_to(end_idx + end_pat.len());
        self.set_pending(marker, DelimKind::Comment);
        Ok(())
    }

    /// Checks whether the block tag just opened is `raw`.
    fn peek_raw_tag(&self) -> bool {
        let rest = self.rest().trim_start();
        if let Some(after) = rest.strip_prefix("raw") {
            match after.chars().next() {
                None => true,
                Some(c) => !c.is_alphanumeric() && c != '_',
            }
        } else {
            false
        }
    }

    /// Consumes `raw %} ... {% endraw %}`, emitting the body as one text token.
    fn raw_block(&mut self) -> RunResult<()> {
        let start_loc = self.loc();
        let ws = self.rest().len() - self.rest().trim_start().len();
        self.advance(ws + 3); // past "raw"
        let ws = self.rest().len() - self.rest().trim_start().len();
        self.advance(ws);
        let close_marker = self.rest().chars().next().filter(|c| *c == '-' || *c == '+');
        if close_marker.is_some() {
            self.advance(1);
        }
        let block_end = self.options.syntax.block_end.as_str();
        if !self.rest().starts_with(block_end) {
            return Err(Error::new_at(
                ErrorKind::UnexpectedCharacter,
                "expected end of raw tag",
                self.loc(),
            ));
        }
        self.advance(block_end.len());
        self.set_pending(close_marker, DelimKind::Block);

        // scan for the matching endraw tag
        let block_start = self.options.syntax.block_start.as_str();
        let mut search = self.pos;
        loop {
            let Some(rel) = self.src[search..].find(block_start) else {
                return Err(Error::new_at(
                    ErrorKind::UnterminatedRawBlock,
                    "missing {% endraw %} tag",
                    start_loc,
                ));
            };
            let tag_at = search + rel;
            let mut scan = tag_at + block_start.len();
            let mut open_marker = None;
            if let Some(c) = self.src[scan..].chars().next().filter(|c| *c == '-' || *c == '+') {
                open_marker = Some(c);
                scan += 1;
            }
            let trimmed = self.src[scan..].trim_start();
            scan += self.src[scan..].len() - trimmed.len();
            if let Some(after) = self.src[scan..].strip_prefix("endraw") {
                let boundary_ok = match after.chars().next() {
                    None => true,
                    Some(c) => !c.is_alphanumeric() && c != '_',
                };
                if boundary_ok {
                    scan += "endraw".len();
                    let trimmed = self.src[scan..].trim_start();
                    scan += self.src[scan..].len() - trimmed.len();
                    let mut end_marker = None;
                    if let Some(c) = self.src[scan..].chars().next().filter(|c| *c == '-' || *c == '+') {
                        end_marker = Some(c);
                        scan += 1;
                    }
                    if self.src[scan..].starts_with(block_end) {
                        let mut body = self.src[self.pos..tag_at].to_owned();
                        if self.options.lstrip_blocks && open_marker != Some('+') {
                            lstrip_block_line(&mut body);
                        }
                        if open_marker == Some('-') {
                            trim_text_end(&mut body);
                        }
                        self.emit_text(body, self.pos);
                        self.advance_to(scan + block_end.len());
                        self.set_pending(end_marker, DelimKind::Block);
                        return Ok(());
                    }
                }
            }
            search = tag_at + block_start.len();
        }
    }

    /// Lexes a line statement: `BlockStart`, tokens to end of line, `BlockEnd`.
    fn line_statement(&mut self) -> RunResult<()> {
        let loc = self.loc();
        self.push(TokenKind::BlockStart, loc);
        self.expression_tokens(ExprEnd::Line)
    }

    /// Lexes expression-mode tokens until the closing delimiter or end of line.
    fn expression_tokens(&mut self, end: ExprEnd) -> RunResult<()> {
        let start_loc = self.loc();
        let mut depth: u32 = 0;
        loop {
            // skip whitespace; newlines end line statements at depth 0
            loop {
                match self.rest().chars().next() {
                    Some('\n') if end == ExprEnd::Line && depth == 0 => {
                        let loc = self.loc();
                        self.push(TokenKind::BlockEnd, loc);
                        self.advance(1);
                        self.pending = PendingTrim::Keep;
                        return Ok(());
                    }
                    Some(c) if c.is_whitespace() => self.advance(c.len_utf8()),
                    _ => break,
                }
            }

            if self.pos >= self.src.len() {
                return match end {
                    ExprEnd::Line => {
                        let loc = self.loc();
                        self.push(TokenKind::BlockEnd, loc);
                        Ok(())
                    }
                    ExprEnd::Delimiter(_) => Err(Error::new_at(
                        ErrorKind::UnterminatedBlock,
                        "template ended inside a delimiter",
                        start_loc,
                    )),
                };
            }

            if depth == 0
                && let ExprEnd::Delimiter(kind) = end
            {
                let close = match kind {
                    DelimKind::Variable => self.options.syntax.variable_end.as_str(),
                    _ => self.options.syntax.block_end.as_str(),
                };
                let rest = self.rest();
                let marker = rest.chars().next().filter(|c| *c == '-' || *c == '+');
                let (marker, body) = match marker {
                    Some(c) if rest[1..].starts_with(close) => (Some(c), &rest[1..]),
                    _ => (None, rest),
                };
                if body.starts_with(close) {
                    let loc = self.loc();
                    let token = match kind {
                        DelimKind::Variable => TokenKind::VarEnd,
                        _ => TokenKind::BlockEnd,
                    };
                    self.push(token, loc);
                    self.advance(usize::from(marker.is_some()) + close.len());
                    self.set_pending(marker, kind);
                    return Ok(());
                }
            }

            let loc = self.loc();
            let c = self.rest().chars().next().expect("checked non-empty");
            match c {
                '\'' | '"' => {
                    let text = self.string_literal(c)?;
                    self.push(TokenKind::Str(text), loc);
                }
                '0'..='9' => {
                    let kind = self.number_literal();
                    self.push(kind, loc);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let rest = self.rest();
                    let len = rest
                        .char_indices()
                        .find(|(_, c)| !c.is_alphanumeric() && *c != '_')
                        .map_or(rest.len(), |(i, _)| i);
                    let name = rest[..len].to_owned();
                    self.advance(len);
                    self.push(TokenKind::Name(name), loc);
                }
                _ => {
                    let op = self.operator(loc)?;
                    match op {
                        Op::LParen | Op::LBracket | Op::LBrace => depth += 1,
                        Op::RParen | Op::RBracket | Op::RBrace => depth = depth.saturating_sub(1),
                        _ => {}
                    }
                    self.push(TokenKind::Op(op), loc);
                }
            }
        }
    }

    fn string_literal(&mut self, quote: char) -> RunResult<String> {
        let start_loc = self.loc();
        self.advance(1);
        let mut text = String::new();
        loop {
            let Some(c) = self.rest().chars().next() else {
                return Err(Error::new_at(ErrorKind::UnterminatedString, "unclosed string literal", start_loc));
            };
            if c == quote {
                self.advance(1);
                return Ok(text);
            }
            if c == '\\' {
                self.advance(1);
                let Some(esc) = self.rest().chars().next() else {
                    return Err(Error::new_at(ErrorKind::UnterminatedString, "unclosed string literal", start_loc));
                };
                match esc {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    'r' => text.push('\r'),
                    '\\' => text.push('\\'),
                    '\'' => text.push('\''),
                    '"' => text.push('"'),
                    // unknown escapes keep the backslash, like the reference engine
                    other => {
                        text.push('\\');
                        text.push(other);
                    }
                }
                self.advance(esc.len_utf8());
            } else {
                text.push(c);
                self.advance(c.len_utf8());
            }
        }
    }

    fn number_literal(&mut self) -> TokenKind {
        let rest = self.rest();
        let bytes = rest.as_bytes();
        let mut i = 0;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let mut is_float = false;
        if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
            is_float = true;
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
        // optional exponent
        if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
            let mut j = i + 1;
            if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                j += 1;
            }
            if j < bytes.len() && bytes[j].is_ascii_digit() {
                is_float = true;
                i = j;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
        }
        let literal = &rest[..i];
        self.advance(i);
        if is_float {
            TokenKind::Float(literal.parse().unwrap_or(0.0))
        } else {
            match literal.parse::<i64>() {
                Ok(v) => TokenKind::Int(v),
                // literals beyond i64 degrade to float
                Err(_) => TokenKind::Float(literal.parse().unwrap_or(0.0)),
            }
        }
    }

    fn operator(&mut self, loc: SourceLoc) -> RunResult<Op> {
        let rest = self.rest();
        let two = rest.get(..2);
        let op = match two {
            Some("==") => Some((Op::Eq, 2)),
            Some("!=") => Some((Op::Ne, 2)),
            Some("<=") => Some((Op::Le, 2)),
            Some(">=") => Some((Op::Ge, 2)),
            Some("//") => Some((Op::FloorDiv, 2)),
            Some("**") => Some((Op::Pow, 2)),
            _ => None,
        };
        let (op, len) = match op {
            Some(found) => found,
            None => {
                let c = rest.chars().next().expect("checked non-empty");
                let single = match c {
                    '+' => Op::Add,
                    '-' => Op::Sub,
                    '*' => Op::Mul,
                    '/' => Op::Div,
                    '%' => Op::Mod,
                    '~' => Op::Tilde,
                    '|' => Op::Pipe,
                    '=' => Op::Assign,
                    '<' => Op::Lt,
                    '>' => Op::Gt,
                    ',' => Op::Comma,
                    ':' => Op::Colon,
                    '.' => Op::Dot,
                    '(' => Op::LParen,
                    ')' => Op::RParen,
                    '[' => Op::LBracket,
                    ']' => Op::RBracket,
                    '{' => Op::LBrace,
                    '}' => Op::RBrace,
                    other => {
                        return Err(Error::new_at(
                            ErrorKind::UnexpectedCharacter,
                            format!("unexpected character `{other}`"),
                            loc,
                        ));
                    }
                };
                (single, 1)
            }
        };
        self.advance(len);
        Ok(op)
    }
}

/// Returns the `-`/`+` marker directly before a closing delimiter, if any.
fn marker_before(src: &str, content_start: usize, end_idx: usize) -> Option<char> {
    if end_idx > content_start {
        let c = src.as_bytes()[end_idx - 1];
        if c == b'-' || c == b'+' {
            return Some(c as char);
        }
    }
    None
}

/// `lstrip_blocks`: removes spaces and tabs between the last newline and a
/// block delimiter, leaving earlier lines untouched.
fn lstrip_block_line(text: &mut String) {
    let cut = text.rfind('\n').map_or(0, |i| i + 1);
    if text[cut..].bytes().all(|b| b == b' ' || b == b'\t') {
        text.truncate(cut);
    }
}

/// Explicit `-` before a tag: removes trailing spaces/tabs and at most one
/// newline from the preceding text.
fn trim_text_end(text: &mut String) {
    let bytes = text.as_bytes();
    let mut i = text.len();
    let mut seen_newline = false;
    while i > 0 {
        match bytes[i - 1] {
            b' ' | b'\t' | b'\r' => i -= 1,
            b'\n' if !seen_newline => {
                seen_newline = true;
                i -= 1;
            }
            _ => break,
        }
    }
    text.truncate(i);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> LexOptions {
        LexOptions {
            syntax: SyntaxConfig::default(),
            trim_blocks: false,
            lstrip_blocks: false,
            keep_trailing_newline: true,
            line_statement_prefix: None,
        }
    }

    fn kinds(source: &str, options: &LexOptions) -> Vec<TokenKind> {
        lex(source, "test", options).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn plain_text_is_one_token() {
        let toks = kinds("hello world", &options());
        assert_eq!(toks, vec![TokenKind::Text("hello world".to_owned()), TokenKind::Eof]);
    }

    #[test]
    fn variable_with_expression() {
        let toks = kinds("a{{ x + 1 }}b", &options());
        assert_eq!(
            toks,
            vec![
                TokenKind::Text("a".to_owned()),
                TokenKind::VarStart,
                TokenKind::Name("x".to_owned()),
                TokenKind::Op(Op::Add),
                TokenKind::Int(1),
                TokenKind::VarEnd,
                TokenKind::Text("b".to_owned()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn nested_braces_do_not_end_variable() {
        let toks = kinds("{{ {'a': 1} }}", &options());
        assert!(toks.contains(&TokenKind::Op(Op::LBrace)));
        assert_eq!(toks.last(), Some(&TokenKind::Eof));
        assert_eq!(toks.iter().filter(|t| **t == TokenKind::VarEnd).count(), 1);
    }

    #[test]
    fn explicit_trim_markers() {
        let toks = kinds("a  \n  {%- if x -%}  \n b{% endif %}", &options());
        assert_eq!(toks[0], TokenKind::Text("a".to_owned()));
        // right-side `-` strips all leading whitespace of the following text
        assert!(toks.contains(&TokenKind::Text("b".to_owned())));
    }

    #[test]
    fn trim_left_consumes_at_most_one_newline() {
        let mut text = "x\n\n  ".to_owned();
        trim_text_end(&mut text);
        assert_eq!(text, "x\n");
    }

    #[test]
    fn trim_blocks_removes_single_newline() {
        let mut opts = options();
        opts.trim_blocks = true;
        let toks = kinds("{% if x %}\ny{% endif %}", &opts);
        assert!(toks.contains(&TokenKind::Text("y".to_owned())));
    }

    #[test]
    fn lstrip_blocks_strips_indentation() {
        let mut opts = options();
        opts.lstrip_blocks = true;
        let toks = kinds("a\n    {% if x %}b{% endif %}", &opts);
        assert_eq!(toks[0], TokenKind::Text("a\n".to_owned()));
    }

    #[test]
    fn raw_block_preserves_delimiters() {
        let toks = kinds("{% raw %}{{ not lexed }}{% endraw %}", &options());
        assert_eq!(toks, vec![TokenKind::Text("{{ not lexed }}".to_owned()), TokenKind::Eof]);
    }

    #[test]
    fn unterminated_raw_block_errors() {
        let err = lex("{% raw %}stuff", "test", &options()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnterminatedRawBlock);
    }

    #[test]
    fn comments_vanish() {
        let toks = kinds("a{# note #}b", &options());
        assert_eq!(
            toks,
            vec![
                TokenKind::Text("a".to_owned()),
                TokenKind::Text("b".to_owned()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn unterminated_comment_errors() {
        let err = lex("a{# note", "test", &options()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnterminatedComment);
    }

    #[test]
    fn string_escapes_decode() {
        let toks = kinds(r#"{{ "a\n\t\"b" }}"#, &options());
        assert_eq!(toks[1], TokenKind::Str("a\n\t\"b".to_owned()));
    }

    #[test]
    fn line_statements_lex_as_blocks() {
        let mut opts = options();
        opts.line_statement_prefix = Some("#".to_owned());
        let toks = kinds("# if x\nbody\n# endif\n", &opts);
        assert_eq!(toks[0], TokenKind::BlockStart);
        assert_eq!(toks[1], TokenKind::Name("if".to_owned()));
        assert!(toks.contains(&TokenKind::Text("body\n".to_owned())));
    }

    #[test]
    fn trailing_newline_stripped_by_default_option() {
        let mut opts = options();
        opts.keep_trailing_newline = false;
        let toks = kinds("x\n", &opts);
        assert_eq!(toks[0], TokenKind::Text("x".to_owned()));
    }

    #[test]
    fn float_and_exponent_literals() {
        let toks = kinds("{{ 1.5 }}{{ 2e3 }}", &options());
        assert_eq!(toks[1], TokenKind::Float(1.5));
        assert_eq!(toks[4], TokenKind::Float(2000.0));
    }
}
