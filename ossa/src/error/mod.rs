//! Error types and reporting

use crate::ast::Span;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, CompileError>;

/// Compile error
#[derive(Debug, Error)]
pub enum CompileError {
    /// Malformed or under-resolved input reaching the lowering stage
    #[error("Lowering error{}: {message}", location(.span))]
    Lowering { message: String, span: Span },

    /// Two overlapping accesses to the same statically enforced storage
    #[error("Exclusivity error{}: {message}", location(.span))]
    Exclusivity { message: String, span: Span },

    /// Vtable or witness table construction failed
    #[error("Table error: {message}")]
    Table { message: String },

    /// Lowered IR violates a structural invariant
    #[error("Verification error in {function}: {message}")]
    Verify { function: String, message: String },

    #[error("IO error: {message}")]
    Io { message: String },

    /// Input decoding error (JSON module, TOML config)
    #[error("Parse error: {message}")]
    Parse { message: String },
}

/// ` at start..end`, or nothing for declarations built without a source
fn location(span: &Span) -> String {
    if span.is_unknown() {
        String::new()
    } else {
        format!(" at {span}")
    }
}

impl CompileError {
    pub fn lowering(message: impl Into<String>, span: Span) -> Self {
        Self::Lowering {
            message: message.into(),
            span,
        }
    }

    pub fn exclusivity(message: impl Into<String>, span: Span) -> Self {
        Self::Exclusivity {
            message: message.into(),
            span,
        }
    }

    pub fn table(message: impl Into<String>) -> Self {
        Self::Table {
            message: message.into(),
        }
    }

    pub fn verify(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Verify {
            function: function.into(),
            message: message.into(),
        }
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            Self::Lowering { span, .. } => Some(*span),
            Self::Exclusivity { span, .. } => Some(*span),
            Self::Table { .. } | Self::Verify { .. } | Self::Io { .. } | Self::Parse { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Lowering { message, .. } => message,
            Self::Exclusivity { message, .. } => message,
            Self::Table { message } => message,
            Self::Verify { message, .. } => message,
            Self::Io { message } => message,
            Self::Parse { message } => message,
        }
    }
}

impl From<std::io::Error> for CompileError {
    fn from(err: std::io::Error) -> Self {
        Self::io_error(err.to_string())
    }
}

impl From<serde_json::Error> for CompileError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse_error(err.to_string())
    }
}

impl From<toml::de::Error> for CompileError {
    fn from(err: toml::de::Error) -> Self {
        Self::parse_error(err.to_string())
    }
}

/// Report error with ariadne
pub fn report_error(filename: &str, source: &str, error: &CompileError) {
    use ariadne::{Color, Label, Report, ReportKind, Source};

    let kind = match error {
        CompileError::Lowering { .. } => "Lowering",
        CompileError::Exclusivity { .. } => "Exclusivity",
        CompileError::Table { .. } => "Table",
        CompileError::Verify { .. } => "Verification",
        CompileError::Io { .. } => "IO",
        CompileError::Parse { .. } => "Parse",
    };

    // Printing only fails when stderr is gone; nothing useful to do then.
    let printed = if let Some(span) = error.span() {
        Report::build(ReportKind::Error, (filename, span.start..span.end))
            .with_message(format!("{kind} error"))
            .with_label(
                Label::new((filename, span.start..span.end))
                    .with_message(error.message())
                    .with_color(Color::Red),
            )
            .finish()
            .eprint((filename, Source::from(source)))
    } else {
        Report::build(ReportKind::Error, (filename, 0..0))
            .with_message(format!("{kind} error: {}", error.message()))
            .finish()
            .eprint((filename, Source::from(source)))
    };
    if let Err(err) = printed {
        tracing::warn!("failed to print diagnostic: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_only_on_located_errors() {
        let err = CompileError::lowering("missing return", Span::new(3, 9));
        assert_eq!(err.span(), Some(Span::new(3, 9)));
        assert_eq!(err.message(), "missing return");

        let err = CompileError::verify("f", "unbalanced access");
        assert_eq!(err.span(), None);
        assert!(err.to_string().contains("in f"));
    }

    #[test]
    fn test_display_prints_span_as_range() {
        let err = CompileError::exclusivity("overlapping accesses to x", Span::new(3, 9));
        assert_eq!(err.to_string(), "Exclusivity error at 3..9: overlapping accesses to x");
    }

    #[test]
    fn test_display_omits_unknown_span() {
        let err = CompileError::lowering("cannot take the address of a temporary", Span::default());
        assert_eq!(err.to_string(), "Lowering error: cannot take the address of a temporary");
    }

    #[test]
    fn test_json_errors_become_parse_errors() {
        let err: CompileError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, CompileError::Parse { .. }));
    }
}
