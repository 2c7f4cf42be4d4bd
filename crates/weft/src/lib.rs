//! Weft - HTML templates with embedded expressions
//!
//! Templates are compiled once into a read-only tree, then rendered against
//! JSON-like data with explicit resource limits, so untrusted templates
//! cannot loop or recurse without bound.
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft::{CompileOptions, RenderOptions, compile, render};
//! use serde_json::json;
//!
//! let template = compile(r#"<ul>@for (item of items) {<li>${item}</li>}</ul>"#, &CompileOptions::default());
//! assert!(!template.has_errors());
//!
//! let out = render(&template, json!({"items": ["a", "b"]}), &RenderOptions::default())?;
//! assert_eq!(out.html, "<ul><li>a</li><li>b</li></ul>");
//! ```
//!
//! ## Engine Usage
//!
//! ```ignore
//! use weft::TemplateEngine;
//!
//! let mut engine = TemplateEngine::new();
//! engine.set_globals(json!({"currency": "EUR", "locale": "de-DE"}));
//! engine.add_template("price", "<b>${currency(amount)}</b>")?;
//! let out = engine.render("price", json!({"amount": 1234.5}))?;
//! assert_eq!(out.html, "<b>1.234,50 €</b>");
//! ```
//!
//! ## Syntax
//!
//! - `${expr}` / `$path` → interpolate (HTML-escaped)
//! - `$.name` → global, never shadowed by data or locals
//! - `items[*].price` → wildcard, maps and flattens
//! - `@if (c) { } @else { }`, `@for (x, i of xs) { }`, `@match (v) { 1 => { } _ => { } }`
//! - `@let x = expr;`, `@let f(a) = expr;`
//! - `<template:Card title size="md">...</template:Card>` → component definition
//! - `<Card title=${t}>...</Card>` with `<slot />` → component call

mod ast;
mod compile;
mod diagnostics;
mod engine;
mod eval;
mod helpers;
mod limits;
mod markup;
mod parse;
mod pretty;
mod render;
mod scope;
mod value;

use thiserror::Error;

// ============ Primary Public API ============

pub use compile::{CompileOptions, CompiledTemplate, compile};
pub use engine::TemplateEngine;
pub use render::{
    RenderConfig, RenderMetadata, RenderOptions, RenderResult, create_string_renderer, render,
};
pub use value::{Object, Value};

/// Compile and render in one step
///
/// Error diagnostics surface as [`RenderError::InvalidTemplate`].
pub fn render_source(
    source: &str,
    data: impl Into<Value>,
    options: &RenderOptions,
) -> Result<RenderResult, WeftError> {
    let template = compile(source, &CompileOptions::default());
    Ok(render(&template, data, options)?)
}

/// Evaluate a single expression against `data` with the builtin helpers
pub fn evaluate_expression(source: &str, data: impl Into<Value>) -> Result<Value, WeftError> {
    let expr = parse::parse(source)?;
    let scope = scope::Scope::new(data);
    Ok(eval::eval(&expr, &scope, &helpers::HelperRegistry::with_builtins())?)
}

// ============ Errors ============

#[derive(Error, Debug)]
pub enum WeftError {
    #[error("Parse error: {0}")]
    Parse(#[from] parse::ParseError),
    #[error("Eval error: {0}")]
    Eval(#[from] eval::EvalError),
    #[error("Render error: {0}")]
    Render(#[from] render::RenderError),
    #[error("Unknown template '{0}'")]
    UnknownTemplate(String),
}

impl WeftError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            WeftError::Parse(_) => "PARSE_ERROR",
            WeftError::Eval(e) => e.code(),
            WeftError::Render(e) => e.code(),
            WeftError::UnknownTemplate(_) => "UNKNOWN_TEMPLATE",
        }
    }
}

pub use diagnostics::{Diagnostic, Level, codes};
pub use eval::EvalError;
pub use limits::{LimitType, ResourceLimitError, ResourceLimits};
pub use parse::ParseError;
pub use render::RenderError;

// ============ Helpers ============

pub use helpers::{BoundHelper, Helper, HelperError, HelperRegistry, HelperResult};
pub use scope::Scope;

// ============ Advanced: AST Access ============

/// Low-level AST types and stage entry points (for tooling or introspection)
pub mod advanced {
    pub use crate::ast::expr::{Expr, ExprKind, Path, PathSegment};
    pub use crate::ast::template::{
        Attribute, AttributeValue, CommentStyle, ComponentDefinition, IfBranch, IterationKind,
        LetValue, MatchCase, Node, NodeKind, PropBinding, PropDefinition, TextSegment,
    };
    pub use crate::ast::{BinOp, LineIndex, Literal, Position, SourceLocation, UnaryOp};
    pub use crate::compile::{DirectiveCounts, SourceMap, SourceMapEntry, TemplateMetadata};
    pub use crate::eval::{EvalContext, EvalState, eval, evaluate};
    pub use crate::markup::{ParsedTemplate, parse_template, parse_template_named};
    pub use crate::parse::parse;
    pub use crate::render::escape_html;
    pub use crate::value::Function;
}
