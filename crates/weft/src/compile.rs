//! Compile entry point: parse, validate, and optionally describe a template
//!
//! `compile` never fails. Everything it finds goes into
//! [`CompiledTemplate::diagnostics`]; a template with any error-level entry
//! is refused by the renderer.

use indexmap::{IndexMap, IndexSet};
use log::debug;
use serde::Serialize;

use crate::ast::SourceLocation;
use crate::ast::expr::Expr;
use crate::ast::template::{ComponentDefinition, LetValue, MatchCase, Node, NodeKind};
use crate::diagnostics::{Diagnostic, Level, codes};
use crate::markup::parse_template_named;

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Run the semantic pass (components, props, slots)
    pub validate: bool,
    /// Promote every warning to an error
    pub strict: bool,
    pub include_source_map: bool,
    pub include_metadata: bool,
    /// Tagged onto every location, e.g. a file name
    pub source_name: Option<String>,
    /// Components available at render time besides the template's own
    pub components: IndexMap<String, ComponentDefinition>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            validate: true,
            strict: false,
            include_source_map: false,
            include_metadata: false,
            source_name: None,
            components: IndexMap::new(),
        }
    }
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn without_validation(mut self) -> Self {
        self.validate = false;
        self
    }

    pub fn with_source_map(mut self) -> Self {
        self.include_source_map = true;
        self
    }

    pub fn with_metadata(mut self) -> Self {
        self.include_metadata = true;
        self
    }

    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = Some(name.into());
        self
    }

    pub fn with_components(mut self, components: &IndexMap<String, ComponentDefinition>) -> Self {
        for (name, def) in components {
            self.components.insert(name.clone(), def.clone());
        }
        self
    }
}

/// A parsed template ready to render. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct CompiledTemplate {
    pub root: Vec<Node>,
    pub components: IndexMap<String, ComponentDefinition>,
    pub diagnostics: Vec<Diagnostic>,
    pub source_map: Option<SourceMap>,
    pub metadata: Option<TemplateMetadata>,
}

impl CompiledTemplate {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }
}

/// Every node, in document order; definitions follow the root tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceMap {
    pub entries: Vec<SourceMapEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceMapEntry {
    pub kind: &'static str,
    pub location: SourceLocation,
    /// Definition the node belongs to, `None` for the root tree
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

impl SourceMap {
    /// Innermost entry whose span contains `offset`
    pub fn lookup(&self, offset: usize) -> Option<&SourceMapEntry> {
        self.entries
            .iter()
            .filter(|e| e.location.start.offset <= offset && offset < e.location.end.offset)
            .min_by_key(|e| e.location.end.offset - e.location.start.offset)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    pub components_defined: Vec<String>,
    pub components_used: IndexSet<String>,
    pub helpers_referenced: IndexSet<String>,
    /// Paths into render data, with loop and `@let` names resolved away
    pub data_paths: IndexSet<String>,
    pub directives: DirectiveCounts,
    pub node_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveCounts {
    pub if_count: usize,
    pub for_count: usize,
    pub match_count: usize,
    pub let_count: usize,
}

/// Parse and check `source`
pub fn compile(source: &str, options: &CompileOptions) -> CompiledTemplate {
    let parsed = parse_template_named(source, options.source_name.as_deref());
    let mut diagnostics = parsed.diagnostics;

    if options.validate {
        validate(&parsed.nodes, &parsed.components, &options.components, &mut diagnostics);
    }
    if options.strict {
        for diagnostic in &mut diagnostics {
            diagnostic.level = Level::Error;
        }
    }

    let source_map = options
        .include_source_map
        .then(|| build_source_map(&parsed.nodes, &parsed.components));
    let metadata = options
        .include_metadata
        .then(|| build_metadata(&parsed.nodes, &parsed.components));

    let template = CompiledTemplate {
        root: parsed.nodes,
        components: parsed.components,
        diagnostics,
        source_map,
        metadata,
    };
    debug!(
        "compiled template{}: {} nodes, {} components, {} errors",
        options
            .source_name
            .as_deref()
            .map(|n| format!(" '{n}'"))
            .unwrap_or_default(),
        template.root.len(),
        template.components.len(),
        template.errors().count()
    );
    template
}

// ============ Validation ============

fn validate(
    root: &[Node],
    components: &IndexMap<String, ComponentDefinition>,
    external: &IndexMap<String, ComponentDefinition>,
    out: &mut Vec<Diagnostic>,
) {
    let mut check = |node: &Node, in_definition: bool| match &node.kind {
        NodeKind::Component { name, props, .. } => {
            let Some(def) = components.get(name).or_else(|| external.get(name)) else {
                out.push(
                    Diagnostic::warning(format!("unknown component <{name}>"), node.location.clone())
                        .with_code(codes::UNKNOWN_COMPONENT),
                );
                return;
            };
            for prop in def.props.iter().filter(|p| p.required) {
                if !props.iter().any(|b| b.name == prop.name) {
                    out.push(
                        Diagnostic::warning(
                            format!("<{name}> is missing required prop '{}'", prop.name),
                            node.location.clone(),
                        )
                        .with_code(codes::MISSING_REQUIRED_PROP),
                    );
                }
            }
            for binding in props {
                if def.prop(&binding.name).is_none() {
                    out.push(
                        Diagnostic::warning(
                            format!("<{name}> does not declare prop '{}'", binding.name),
                            binding.value.location.clone(),
                        )
                        .with_code(codes::UNKNOWN_PROP),
                    );
                }
            }
        }
        NodeKind::Slot { .. } if !in_definition => out.push(
            Diagnostic::warning("<slot> outside a component definition", node.location.clone())
                .with_code(codes::SLOT_OUTSIDE_COMPONENT),
        ),
        _ => {}
    };

    for node in root {
        node.walk(&mut |n| check(n, false));
    }
    for def in components.values() {
        for node in &def.body {
            node.walk(&mut |n| check(n, true));
        }
    }
}

// ============ Source Map & Metadata ============

fn build_source_map(root: &[Node], components: &IndexMap<String, ComponentDefinition>) -> SourceMap {
    let mut entries = Vec::new();
    for node in root {
        node.walk(&mut |n| {
            entries.push(SourceMapEntry {
                kind: n.kind_name(),
                location: n.location.clone(),
                component: None,
            })
        });
    }
    for def in components.values() {
        for node in &def.body {
            node.walk(&mut |n| {
                entries.push(SourceMapEntry {
                    kind: n.kind_name(),
                    location: n.location.clone(),
                    component: Some(def.name.clone()),
                })
            });
        }
    }
    SourceMap { entries }
}

fn build_metadata(
    root: &[Node],
    components: &IndexMap<String, ComponentDefinition>,
) -> TemplateMetadata {
    let mut meta = TemplateMetadata {
        components_defined: components.keys().cloned().collect(),
        ..TemplateMetadata::default()
    };
    let mut let_functions = IndexSet::new();

    let bodies = std::iter::once(root).chain(components.values().map(|d| d.body.as_slice()));
    for nodes in bodies {
        for node in nodes {
            node.walk(&mut |n| {
                meta.node_count += 1;
                match &n.kind {
                    NodeKind::If { .. } => meta.directives.if_count += 1,
                    NodeKind::For { .. } => meta.directives.for_count += 1,
                    NodeKind::Match { .. } => meta.directives.match_count += 1,
                    NodeKind::Let { name, value, .. } => {
                        meta.directives.let_count += 1;
                        if let LetValue::Function { .. } = value {
                            let_functions.insert(name.clone());
                        }
                    }
                    NodeKind::Component { name, .. } => {
                        meta.components_used.insert(name.clone());
                    }
                    _ => {}
                }
                for expr in n.expressions() {
                    expr.collect_calls(&mut meta.helpers_referenced);
                }
            });
        }
    }
    meta.helpers_referenced.retain(|name| !let_functions.contains(name));

    collect_data_paths(root, &mut Vec::new(), &mut meta.data_paths);
    meta
}

/// Paths whose root is not bound by an enclosing `@for`, `@let` or match
/// case. `bound` is restored before returning.
fn collect_data_paths(nodes: &[Node], bound: &mut Vec<String>, out: &mut IndexSet<String>) {
    let mark = bound.len();
    for node in nodes {
        match &node.kind {
            NodeKind::For {
                items,
                item_var,
                index_var,
                body,
                ..
            } => {
                free_paths(items, bound, out);
                let inner = bound.len();
                bound.push(item_var.clone());
                bound.extend(index_var.iter().cloned());
                collect_data_paths(body, bound, out);
                bound.truncate(inner);
            }
            NodeKind::Match {
                value,
                cases,
                default_case,
            } => {
                free_paths(value, bound, out);
                for case in cases {
                    match case {
                        MatchCase::Literal { body, .. } => collect_data_paths(body, bound, out),
                        MatchCase::Expression { condition, body } => {
                            bound.push("_".to_string());
                            free_paths(condition, bound, out);
                            bound.pop();
                            collect_data_paths(body, bound, out);
                        }
                    }
                }
                if let Some(body) = default_case {
                    collect_data_paths(body, bound, out);
                }
            }
            NodeKind::Let {
                name,
                is_global,
                value,
            } => {
                match value {
                    LetValue::Expr(expr) => free_paths(expr, bound, out),
                    LetValue::Function { params, body } => {
                        let inner = bound.len();
                        bound.push(name.clone());
                        bound.extend(params.iter().cloned());
                        free_paths(body, bound, out);
                        bound.truncate(inner);
                    }
                }
                // Visible to later siblings only
                if !is_global {
                    bound.push(name.clone());
                }
            }
            _ => {
                for expr in node.expressions() {
                    free_paths(expr, bound, out);
                }
                for list in node.child_lists() {
                    collect_data_paths(list, bound, out);
                }
            }
        }
    }
    bound.truncate(mark);
}

fn free_paths(expr: &Expr, bound: &[String], out: &mut IndexSet<String>) {
    expr.walk(&mut |e| {
        if let Some(path) = e.as_path() {
            let is_bound = path.root().is_some_and(|root| bound.iter().any(|b| b == root));
            if !path.is_global && !is_bound {
                out.insert(path.to_string());
            }
        }
    });
}

// ============ Sanity Tests ============
// Most testing is done via integration tests in tests/integration.rs

#[cfg(test)]
mod tests {
    use super::*;

    fn codes_of(template: &CompiledTemplate) -> Vec<&str> {
        template.diagnostics.iter().filter_map(|d| d.code).collect()
    }

    #[test]
    fn validation_flags_component_misuse() {
        let src = r#"<template:Card title size="md">${title}</template:Card>
<Card size="lg" colour="red" />
<Missing />
<slot />"#;
        let template = compile(src, &CompileOptions::default());
        assert!(!template.has_errors());
        assert_eq!(
            codes_of(&template),
            vec![
                codes::MISSING_REQUIRED_PROP,
                codes::UNKNOWN_PROP,
                codes::UNKNOWN_COMPONENT,
                codes::SLOT_OUTSIDE_COMPONENT
            ]
        );
    }

    #[test]
    fn strict_promotes_warnings() {
        let template = compile("<Missing />", &CompileOptions::new().strict());
        assert!(template.has_errors());

        let relaxed = compile("<Missing />", &CompileOptions::new().without_validation());
        assert!(relaxed.diagnostics.is_empty());
    }

    #[test]
    fn metadata_resolves_bound_names() {
        let src = r#"@for (row of rows) { ${row.name} ${upper(title)} }
@let total = sum + 1;
${total} ${$.locale}"#;
        let template = compile(src, &CompileOptions::new().with_metadata());
        let meta = template.metadata.unwrap();
        let paths: Vec<_> = meta.data_paths.iter().map(String::as_str).collect();
        assert_eq!(paths, vec!["rows", "title", "sum"]);
        assert!(meta.helpers_referenced.contains("upper"));
        assert_eq!(meta.directives.for_count, 1);
        assert_eq!(meta.directives.let_count, 1);
    }

    #[test]
    fn source_map_lookup_finds_innermost_node() {
        let src = "<div><b>${x}</b></div>";
        let template = compile(src, &CompileOptions::new().with_source_map());
        let map = template.source_map.unwrap();
        assert_eq!(map.entries[0].kind, "element");
        assert_eq!(map.lookup(9).unwrap().kind, "text");
    }
}
