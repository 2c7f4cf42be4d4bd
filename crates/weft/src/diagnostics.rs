//! Positioned parse and validation messages

use serde::Serialize;

use crate::ast::SourceLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub level: Level,
    pub message: String,
    pub location: SourceLocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            level: Level::Error,
            message: message.into(),
            location,
            code: None,
        }
    }

    pub fn warning(message: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            level: Level::Warning,
            message: message.into(),
            location,
            code: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == Level::Error
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.level {
            Level::Error => "error",
            Level::Warning => "warning",
        };
        write!(f, "{level}")?;
        if let Some(code) = self.code {
            write!(f, "[{code}]")?;
        }
        write!(f, " at {}: {}", self.location, self.message)
    }
}

/// Stable codes attached to diagnostics.
pub mod codes {
    pub const INVALID_EXPRESSION: &str = "INVALID_EXPRESSION";
    pub const UNTERMINATED_EXPRESSION: &str = "UNTERMINATED_EXPRESSION";
    pub const UNCLOSED_ELEMENT: &str = "UNCLOSED_ELEMENT";
    pub const UNEXPECTED_CLOSING_TAG: &str = "UNEXPECTED_CLOSING_TAG";
    pub const UNCLOSED_BLOCK: &str = "UNCLOSED_BLOCK";
    pub const UNCLOSED_COMMENT: &str = "UNCLOSED_COMMENT";
    pub const INVALID_DIRECTIVE: &str = "INVALID_DIRECTIVE";
    pub const MALFORMED_TAG: &str = "MALFORMED_TAG";
    pub const DUPLICATE_COMPONENT: &str = "DUPLICATE_COMPONENT";
    pub const UNKNOWN_COMPONENT: &str = "UNKNOWN_COMPONENT";
    pub const MISSING_REQUIRED_PROP: &str = "MISSING_REQUIRED_PROP";
    pub const UNKNOWN_PROP: &str = "UNKNOWN_PROP";
    pub const SLOT_OUTSIDE_COMPONENT: &str = "SLOT_OUTSIDE_COMPONENT";
}
