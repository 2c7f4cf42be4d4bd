//! AST types for weft templates
//!
//! Split into:
//! - `expr`: the expression language used inside `${...}` and directive heads
//! - `template`: the markup tree (text, elements, directives, components)
//!
//! Both trees are plain data. Every node carries a [`SourceLocation`] and is
//! never mutated after parsing, so one compiled template can be rendered any
//! number of times.

pub mod expr;
pub mod template;

use serde::Serialize;

// Shared types used by both expression and template ASTs

/// A single point in the template source. Lines and columns are 1-based,
/// columns count characters, offsets count bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SourceLocation {
    pub start: Position,
    pub end: Position,
    /// Name of the template the node came from, when the caller supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl SourceLocation {
    pub fn new(start: Position, end: Position) -> Self {
        Self {
            start,
            end,
            source: None,
        }
    }

    /// Location covering both `self` and `other`.
    pub fn to(&self, other: &SourceLocation) -> Self {
        Self {
            start: self.start,
            end: other.end,
            source: self.source.clone(),
        }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "{source}:")?;
        }
        write!(f, "{}:{}", self.start.line, self.start.column)
    }
}

/// Byte offset to line/column translation for one source text.
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<usize>,
    source: Option<String>,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(text.match_indices('\n').map(|(idx, _)| idx + 1));
        Self {
            line_starts,
            source: None,
        }
    }

    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }

    pub fn position(&self, text: &str, offset: usize) -> Position {
        let offset = offset.min(text.len());
        let line = match self.line_starts.binary_search(&offset) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };
        let line_start = self.line_starts[line];
        let column = text
            .get(line_start..offset)
            .map(|prefix| prefix.chars().count())
            .unwrap_or(offset - line_start);
        Position {
            line: line + 1,
            column: column + 1,
            offset,
        }
    }

    pub fn location(&self, text: &str, start: usize, end: usize) -> SourceLocation {
        SourceLocation {
            start: self.position(text, start),
            end: self.position(text, end),
            source: self.source.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Logical
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}
