use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Result type alias for operations that can produce a render-time error.
pub(crate) type RunResult<T> = Result<T, Error>;

/// Error categories surfaced by the engine.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and `Into<&'static str>`
/// implementations. The string representation matches the variant name exactly
/// (e.g., `TemplateNotFound` -> "TemplateNotFound").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ErrorKind {
    // --- lex errors ---
    /// A string literal reached the end of the delimiter or source without a closing quote.
    UnterminatedString,
    /// A comment opened with the comment delimiter but never closed.
    UnterminatedComment,
    /// A `{% raw %}` block without a matching `{% endraw %}`.
    UnterminatedRawBlock,
    /// A character the lexer cannot form a token from.
    UnexpectedCharacter,

    // --- parse errors ---
    /// A token that does not fit the grammar at this position.
    UnexpectedToken,
    /// A statement body reached the end of the template without its terminator tag.
    UnterminatedBlock,
    /// More than one `{% extends %}` tag, or one that is not the first construct.
    MultipleExtends,
    /// Two blocks with the same name in one template.
    DuplicateBlock,
    /// An assignment target that is neither a name nor a namespace attribute.
    InvalidAssignmentTarget,

    // --- compile errors ---
    /// `break` or `continue` outside a `for` body.
    OutsideLoop,
    /// A `required` block whose body contains more than whitespace.
    RequiredBlockBody,
    /// A block marked `required` was never overridden by a descendant template.
    RequiredBlockUnsatisfied,

    // --- loading errors ---
    /// The loader could not resolve a template name.
    TemplateNotFound,
    /// A template extends or includes itself, directly or through other templates.
    CycleDetected,

    // --- runtime errors ---
    /// An operator or operation applied to incompatible values.
    InvalidOperation,
    /// Division or modulo by zero.
    DivisionByZero,
    /// Integer arithmetic exceeded the 64-bit range.
    IntegerOverflow,
    /// Use of an undefined value under the strict undefined policy.
    UndefinedError,
    /// A filter name with no registry entry.
    UnknownFilter,
    /// A test name with no registry entry.
    UnknownTest,
    /// A filter, test, or function called with the wrong number or kind of arguments.
    InvalidArguments,
    /// An error raised from inside a template via `raise_exception`.
    RaisedException,
    /// An async entry point was used on an environment without async enabled.
    AsyncNotEnabled,
}

/// A line/column position in template source, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceLoc {
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub(crate) fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// An error produced while lexing, parsing, compiling, or rendering a template.
///
/// Carries the error category, a human-readable message, and, when known, the
/// template name and source position the error originates from. Positions are
/// attached at the raising site by the lexer/parser, or looked up in the
/// instruction span table by the VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    template: Option<String>,
    loc: Option<SourceLoc>,
}

impl Error {
    /// Creates a new error without location information.
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            template: None,
            loc: None,
        }
    }

    /// Creates a new error at a known source location.
    pub(crate) fn new_at(kind: ErrorKind, message: impl Into<String>, loc: SourceLoc) -> Self {
        Self {
            kind,
            message: message.into(),
            template: None,
            loc: Some(loc),
        }
    }

    /// Attaches a source location if none is recorded yet.
    #[must_use]
    pub(crate) fn with_loc(mut self, loc: SourceLoc) -> Self {
        if self.loc.is_none() {
            self.loc = Some(loc);
        }
        self
    }

    /// Attaches the template name if none is recorded yet.
    #[must_use]
    pub(crate) fn with_template(mut self, name: &str) -> Self {
        if self.template.is_none() {
            self.template = Some(name.to_owned());
        }
        self
    }

    /// The error category.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable message, without location prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The name of the template the error originates from, if known.
    #[must_use]
    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    /// The 1-based source line, if known.
    #[must_use]
    pub fn line(&self) -> Option<u32> {
        self.loc.map(|l| l.line)
    }

    /// The 1-based source column, if known.
    #[must_use]
    pub fn column(&self) -> Option<u32> {
        self.loc.map(|l| l.column)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(template) = &self.template {
            write!(f, " (in {template}")?;
            if let Some(loc) = self.loc {
                write!(f, ", {loc}")?;
            }
            write!(f, ")")?;
        } else if let Some(loc) = self.loc {
            write!(f, " ({loc})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_template_and_loc() {
        let err = Error::new(ErrorKind::UnexpectedToken, "unexpected `}`")
            .with_loc(SourceLoc::new(3, 14))
            .with_template("page.html");
        assert_eq!(
            err.to_string(),
            "UnexpectedToken: unexpected `}` (in page.html, line 3, column 14)"
        );
    }

    #[test]
    fn with_loc_keeps_first_location() {
        let err = Error::new_at(ErrorKind::DivisionByZero, "division by zero", SourceLoc::new(1, 5))
            .with_loc(SourceLoc::new(9, 9));
        assert_eq!(err.line(), Some(1));
        assert_eq!(err.column(), Some(5));
    }

    #[test]
    fn kind_round_trips_through_strings() {
        let s: &'static str = ErrorKind::TemplateNotFound.into();
        assert_eq!(s, "TemplateNotFound");
        assert_eq!(s.parse::<ErrorKind>().unwrap(), ErrorKind::TemplateNotFound);
    }
}
