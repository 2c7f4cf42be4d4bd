//! Template AST - what the markup parser produces and the renderer walks

use std::sync::Arc;

use super::expr::Expr;
use super::{Literal, SourceLocation};

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Literal text interleaved with `${...}` / `$path` interpolations
    Text { segments: Vec<TextSegment> },

    /// `<tag attr=...>children</tag>`
    Element {
        tag: String,
        attributes: Vec<Attribute>,
        children: Vec<Node>,
    },

    /// `@if (c) { } @else if (c) { } @else { }`
    If {
        branches: Vec<IfBranch>,
        else_branch: Option<Vec<Node>>,
    },

    /// `@for (item, index of items) { }`
    For {
        items: Expr,
        item_var: String,
        index_var: Option<String>,
        iteration: IterationKind,
        body: Vec<Node>,
    },

    /// `@match (value) { "a", "b" => { } _ > 1 => { } _ => { } }`
    Match {
        value: Expr,
        cases: Vec<MatchCase>,
        default_case: Option<Vec<Node>>,
    },

    /// `@let name = expr;`, `@let $.name = expr;`, `@let f(a) = expr;`
    Let {
        name: String,
        is_global: bool,
        value: LetValue,
    },

    /// `<Card title=${t}>children</Card>`
    Component {
        name: String,
        props: Vec<PropBinding>,
        children: Vec<Node>,
    },

    /// `<>children</>`, whitespace inside is always kept
    Fragment { children: Vec<Node> },

    /// `<slot name="x">fallback</slot>` inside a component definition
    Slot {
        name: Option<String>,
        fallback: Option<Vec<Node>>,
    },

    Comment { style: CommentStyle, text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextSegment {
    Literal(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// `a="x"`, or bare `a` when `None`
    Static(Option<String>),
    /// `a={expr}` / `a=${expr}`
    Expr(Expr),
    /// `a="x ${e} y"`
    Mixed(Vec<TextSegment>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfBranch {
    pub condition: Expr,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationKind {
    /// `of`: values of an array
    Of,
    /// `in`: indices of an array or keys of an object
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchCase {
    /// Matches when the value strictly equals any listed literal.
    Literal { values: Vec<Literal>, body: Vec<Node> },
    /// Matches when `condition` is truthy with the value bound to `_`.
    Expression { condition: Expr, body: Vec<Node> },
}

impl MatchCase {
    pub fn body(&self) -> &[Node] {
        match self {
            MatchCase::Literal { body, .. } | MatchCase::Expression { body, .. } => body,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LetValue {
    Expr(Expr),
    Function { params: Vec<String>, body: Arc<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropBinding {
    pub name: String,
    pub value: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentStyle {
    /// `<!-- -->`, the only style that can reach the output
    Html,
    /// `// ...`
    Line,
    /// `/* ... */`
    Block,
}

/// A `<template:Name>` definition, looked up by name at render time.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDefinition {
    pub name: String,
    pub props: Vec<PropDefinition>,
    pub body: Vec<Node>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropDefinition {
    pub name: String,
    pub required: bool,
    pub default_value: Option<Expr>,
}

impl ComponentDefinition {
    pub fn prop(&self, name: &str) -> Option<&PropDefinition> {
        self.props.iter().find(|p| p.name == name)
    }
}

impl Node {
    pub fn new(kind: NodeKind, location: SourceLocation) -> Self {
        Self { kind, location }
    }

    /// Short name of the node kind, used by source maps and diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Text { .. } => "text",
            NodeKind::Element { .. } => "element",
            NodeKind::If { .. } => "if",
            NodeKind::For { .. } => "for",
            NodeKind::Match { .. } => "match",
            NodeKind::Let { .. } => "let",
            NodeKind::Component { .. } => "component",
            NodeKind::Fragment { .. } => "fragment",
            NodeKind::Slot { .. } => "slot",
            NodeKind::Comment { .. } => "comment",
        }
    }

    /// Text made only of whitespace literals.
    pub fn is_blank_text(&self) -> bool {
        match &self.kind {
            NodeKind::Text { segments } => segments.iter().all(|seg| match seg {
                TextSegment::Literal(s) => s.trim().is_empty(),
                TextSegment::Expr(_) => false,
            }),
            _ => false,
        }
    }

    /// Direct child lists, in document order.
    pub fn child_lists(&self) -> Vec<&[Node]> {
        match &self.kind {
            NodeKind::Text { .. } | NodeKind::Let { .. } | NodeKind::Comment { .. } => vec![],
            NodeKind::Element { children, .. }
            | NodeKind::Component { children, .. }
            | NodeKind::Fragment { children } => vec![children.as_slice()],
            NodeKind::If {
                branches,
                else_branch,
            } => branches
                .iter()
                .map(|b| b.body.as_slice())
                .chain(else_branch.as_deref())
                .collect(),
            NodeKind::For { body, .. } => vec![body.as_slice()],
            NodeKind::Match {
                cases,
                default_case,
                ..
            } => cases
                .iter()
                .map(MatchCase::body)
                .chain(default_case.as_deref())
                .collect(),
            NodeKind::Slot { fallback, .. } => fallback.as_deref().into_iter().collect(),
        }
    }

    /// Every expression owned directly by this node (not its children).
    pub fn expressions(&self) -> Vec<&Expr> {
        match &self.kind {
            NodeKind::Text { segments } => segment_exprs(segments).collect(),
            NodeKind::Element { attributes, .. } => attributes
                .iter()
                .flat_map(|attr| match &attr.value {
                    AttributeValue::Static(_) => Vec::new(),
                    AttributeValue::Expr(e) => vec![e],
                    AttributeValue::Mixed(segments) => segment_exprs(segments).collect(),
                })
                .collect(),
            NodeKind::If { branches, .. } => branches.iter().map(|b| &b.condition).collect(),
            NodeKind::For { items, .. } => vec![items],
            NodeKind::Match { value, cases, .. } => std::iter::once(value)
                .chain(cases.iter().filter_map(|c| match c {
                    MatchCase::Expression { condition, .. } => Some(condition),
                    MatchCase::Literal { .. } => None,
                }))
                .collect(),
            NodeKind::Let { value, .. } => match value {
                LetValue::Expr(e) => vec![e],
                LetValue::Function { body, .. } => vec![&**body],
            },
            NodeKind::Component { props, .. } => props.iter().map(|p| &p.value).collect(),
            NodeKind::Fragment { .. } | NodeKind::Slot { .. } | NodeKind::Comment { .. } => {
                vec![]
            }
        }
    }

    /// Depth-first, parents before children.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Node)) {
        f(self);
        for list in self.child_lists() {
            for child in list {
                child.walk(f);
            }
        }
    }
}

pub(crate) fn segment_exprs(segments: &[TextSegment]) -> impl Iterator<Item = &Expr> {
    segments.iter().filter_map(|seg| match seg {
        TextSegment::Expr(e) => Some(e),
        TextSegment::Literal(_) => None,
    })
}

/// Elements that never have children or a closing tag
pub fn is_void_element(tag: &str) -> bool {
    matches!(
        tag.to_ascii_lowercase().as_str(),
        "area"
            | "base"
            | "br"
            | "col"
            | "embed"
            | "hr"
            | "img"
            | "input"
            | "link"
            | "meta"
            | "param"
            | "source"
            | "track"
            | "wbr"
    )
}

/// Elements whose body is scanned as raw text: no tags, no directives
pub fn is_raw_element(tag: &str) -> bool {
    tag.eq_ignore_ascii_case("style") || tag.eq_ignore_ascii_case("script")
}

/// Elements whose whitespace is significant
pub fn preserves_whitespace(tag: &str) -> bool {
    is_raw_element(tag) || tag.eq_ignore_ascii_case("pre") || tag.eq_ignore_ascii_case("textarea")
}
