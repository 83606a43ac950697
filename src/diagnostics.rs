use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use thiserror::Error;

/// Position of an entity in the source text. `length` is 0 when the extent
/// is unknown (e.g. a diagnostic attached to a whole declaration).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
    pub length: usize,
}

impl SourceLoc {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Self {
            line,
            column,
            offset,
            length: 0,
        }
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }
}

impl Display for SourceLoc {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Every failure class visible at the API boundary. The display string is
/// the short human name; the full sentence lives in `Diagnostic::message`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    #[error("lexical error")]
    LexError,
    #[error("parse error")]
    ParseError,
    #[error("undeclared role")]
    UndeclaredRole,
    #[error("duplicate role")]
    DuplicateRole,
    #[error("choice needs at least two branches")]
    EmptyChoice,
    #[error("parallel needs at least two branches")]
    EmptyParallel,
    #[error("continue without enclosing recursion")]
    DanglingContinue,
    #[error("recursion label already bound in scope")]
    DuplicateRecursionLabel,
    #[error("branches cannot be merged for a non-participating role")]
    UnprojectableMerge,
    #[error("referenced protocol is not defined")]
    UnresolvedSubProtocol,
    #[error("role argument count mismatch")]
    RoleArityMismatch,
    #[error("parallel branches race on a channel")]
    Race,
    #[error("roles split into disconnected communication groups")]
    DisconnectedRoles,
    #[error("choice branches are not distinguishable")]
    AmbiguousChoice,
    #[error("role is declared but never used")]
    UnusedRole,
    #[error("step budget exhausted")]
    MaxSteps,
    #[error("sub-protocol nesting exceeds the configured depth")]
    CallStackOverflow,
    #[error("safety violation")]
    SafetyViolation,
    #[error("channel buffer exceeds the configured bound")]
    BufferOverflow,
    #[error("construct is recognized but not supported")]
    UnsupportedConstruct,
}

/// A structured, caller-facing error or warning. Pipeline passes never
/// panic and never throw across module boundaries; they accumulate these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLoc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offending_entity: Option<String>,
}

impl Diagnostic {
    pub fn error(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Error,
            message: message.into(),
            location: None,
            offending_entity: None,
        }
    }

    pub fn warning(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Warning,
            message: message.into(),
            location: None,
            offending_entity: None,
        }
    }

    pub fn at(mut self, location: SourceLoc) -> Self {
        self.location = Some(location);
        self
    }

    pub fn at_opt(mut self, location: Option<SourceLoc>) -> Self {
        self.location = location;
        self
    }

    pub fn entity(mut self, name: impl Into<String>) -> Self {
        self.offending_entity = Some(name.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Render the diagnostic for humans, with a caret line when the source
    /// and a location are available.
    pub fn render(&self, source: Option<&str>) -> String {
        let mut out = String::new();
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match self.location {
            Some(loc) => {
                out.push_str(&format!("{tag}[{}] at {loc}: {}", self.kind, self.message));
            }
            None => out.push_str(&format!("{tag}[{}]: {}", self.kind, self.message)),
        }
        if let Some(entity) = &self.offending_entity {
            out.push_str(&format!(" ({entity})"));
        }
        if let (Some(src), Some(loc)) = (source, self.location) {
            if let Some(line_text) = src.lines().nth(loc.line.saturating_sub(1)) {
                out.push('\n');
                out.push_str(line_text);
                out.push('\n');
                for _ in 1..loc.column {
                    out.push(' ');
                }
                for _ in 0..loc.length.max(1) {
                    out.push('^');
                }
            }
        }
        out
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.render(None))
    }
}

/// Ordered sink of diagnostics for one pipeline pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(Diagnostic::is_error)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(|d| d.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(|d| !d.is_error())
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(diagnostic: Diagnostic) -> Self {
        Self {
            items: vec![diagnostic],
        }
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caret_rendering_points_at_column() {
        let source = "protocol Broken role A) {\n}\n";
        let diag = Diagnostic::error(DiagnosticKind::ParseError, "expected '('")
            .at(SourceLoc::new(1, 17, 16).with_length(4));
        let rendered = diag.render(Some(source));
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("1:17"));
        assert_eq!(lines[2], "                ^^^^");
    }

    #[test]
    fn test_sink_separates_errors_from_warnings() {
        let mut sink = Diagnostics::new();
        sink.push(Diagnostic::warning(DiagnosticKind::UnusedRole, "role C unused").entity("C"));
        assert!(!sink.has_errors());
        sink.push(Diagnostic::error(DiagnosticKind::Race, "channel (A, B) races"));
        assert!(sink.has_errors());
        assert_eq!(sink.errors().count(), 1);
        assert_eq!(sink.warnings().count(), 1);
    }
}
