//! Renderer: walks a compiled template and writes HTML
//!
//! One render owns its counters and metadata; the compiled template is only
//! borrowed, so the same template can be rendered any number of times, from
//! any number of threads that each hold their own copy of the data.
//!
//! Every nested walk goes through [`Renderer::with_depth`], which bumps a
//! counter, checks it against [`ResourceLimits`], and always restores it on
//! the way out, error or not.

use std::rc::Rc;
use std::time::Instant;

use indexmap::{IndexMap, IndexSet};
use log::{debug, trace, warn};
use serde::Serialize;
use thiserror::Error;

use crate::ast::SourceLocation;
use crate::ast::expr::{Expr, PathSegment};
use crate::ast::template::{
    Attribute, AttributeValue, CommentStyle, ComponentDefinition, IterationKind, LetValue,
    MatchCase, Node, NodeKind, PropBinding, TextSegment, is_raw_element, is_void_element,
    preserves_whitespace,
};
use crate::compile::CompiledTemplate;
use crate::diagnostics::Diagnostic;
use crate::eval::{EvalContext, EvalError, EvalState, evaluate, literal_value};
use crate::helpers::HelperRegistry;
use crate::limits::{LimitType, ResourceLimitError, ResourceLimits};
use crate::scope::Scope;
use crate::value::{Function, Value};

// ============ Configuration ============

/// Output switches, checked once before rendering starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderConfig {
    /// Emit `<!-- -->` comments
    pub include_comments: bool,
    /// Add `{prefix}source` attributes listing the data paths an element reads
    pub include_source_tracking: bool,
    /// Keep whitespace-only text between tags
    pub preserve_whitespace: bool,
    pub html_escape: bool,
    pub source_tracking_prefix: String,
    /// Add `{prefix}source-op` with helper names (needs source tracking)
    pub include_operation_tracking: bool,
    /// Add `{prefix}source-note` with the element's compound expressions
    pub include_note_generation: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            include_comments: false,
            include_source_tracking: false,
            preserve_whitespace: false,
            html_escape: true,
            source_tracking_prefix: "rd-".to_string(),
            include_operation_tracking: false,
            include_note_generation: false,
        }
    }
}

impl RenderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_comments(mut self) -> Self {
        self.include_comments = true;
        self
    }

    /// Turn on source tracking, with operations and notes
    pub fn with_source_tracking(mut self, prefix: impl Into<String>) -> Self {
        self.include_source_tracking = true;
        self.include_operation_tracking = true;
        self.include_note_generation = true;
        self.source_tracking_prefix = prefix.into();
        self
    }

    pub fn preserving_whitespace(mut self) -> Self {
        self.preserve_whitespace = true;
        self
    }

    pub fn without_escaping(mut self) -> Self {
        self.html_escape = false;
        self
    }

    /// The prefix must be empty or start an HTML attribute name:
    /// `[a-zA-Z_][a-zA-Z0-9_-]*`.
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.source_tracking_prefix;
        let mut chars = prefix.chars();
        let valid = match chars.next() {
            None => true,
            Some(first) => {
                (first.is_ascii_alphabetic() || first == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            }
        };
        if valid {
            Ok(())
        } else {
            Err(RenderError::InvalidConfig(format!(
                "invalid source tracking prefix '{prefix}'"
            )))
        }
    }
}

/// Everything a render needs besides the template and the data
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Reachable as `$.name` everywhere, including inside components
    pub globals: Value,
    pub helpers: HelperRegistry,
    pub config: RenderConfig,
    pub limits: ResourceLimits,
    /// Extra definitions; the template's own win on a name clash
    pub components: IndexMap<String, ComponentDefinition>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            globals: Value::Undefined,
            helpers: HelperRegistry::with_builtins(),
            config: RenderConfig::default(),
            limits: ResourceLimits::default(),
            components: IndexMap::new(),
        }
    }
}

impl RenderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_globals(mut self, globals: impl Into<Value>) -> Self {
        self.globals = globals.into();
        self
    }

    pub fn with_helpers(mut self, helpers: HelperRegistry) -> Self {
        self.helpers = helpers;
        self
    }

    pub fn with_config(mut self, config: RenderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_component(mut self, definition: ComponentDefinition) -> Self {
        self.components.insert(definition.name.clone(), definition);
        self
    }
}

// ============ Errors ============

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("Unknown component <{name}> at {location}")]
    UnknownComponent {
        name: String,
        location: SourceLocation,
    },

    #[error("Render failed at {location}: {message}")]
    RenderFailed {
        message: String,
        location: SourceLocation,
    },

    #[error("Invalid render config: {0}")]
    InvalidConfig(String),

    #[error("Template has {} error(s){}", .diagnostics.len(), first_error(.diagnostics))]
    InvalidTemplate { diagnostics: Vec<Diagnostic> },

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Limit(#[from] ResourceLimitError),
}

fn first_error(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .first()
        .map(|d| format!(", first: {d}"))
        .unwrap_or_default()
}

impl RenderError {
    pub fn code(&self) -> &'static str {
        match self {
            RenderError::UnknownComponent { .. } => "UNKNOWN_COMPONENT",
            RenderError::RenderFailed { .. } => "RENDER_FAILED",
            RenderError::InvalidConfig(_) => "INVALID_CONFIG",
            RenderError::InvalidTemplate { .. } => "INVALID_TEMPLATE",
            RenderError::Eval(e) => e.code(),
            RenderError::Limit(e) => e.code(),
        }
    }

    /// Location in the template, when the error has one
    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            RenderError::UnknownComponent { location, .. }
            | RenderError::RenderFailed { location, .. } => Some(location),
            RenderError::Limit(e) => Some(&e.location),
            RenderError::Eval(
                EvalError::UnknownHelper { location, .. }
                | EvalError::NotCallable { location, .. }
                | EvalError::HelperFailed { location, .. },
            ) => Some(location),
            RenderError::Eval(EvalError::Limit(e)) => Some(&e.location),
            RenderError::InvalidConfig(_) | RenderError::InvalidTemplate { .. } => None,
        }
    }
}

type Result<T> = std::result::Result<T, RenderError>;

// ============ Results ============

/// What one render touched, for auditing
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderMetadata {
    pub paths_accessed: IndexSet<String>,
    pub helpers_called: IndexSet<String>,
    pub render_time_ms: f64,
    pub total_iterations: usize,
    pub max_loop_nesting: usize,
    pub max_recursion_depth: usize,
    pub max_component_depth: usize,
    pub max_function_call_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderResult {
    pub html: String,
    pub metadata: RenderMetadata,
}

// ============ Entry Points ============

/// Render `template` against `data`
pub fn render(
    template: &CompiledTemplate,
    data: impl Into<Value>,
    options: &RenderOptions,
) -> Result<RenderResult> {
    options.config.validate()?;
    if template.has_errors() {
        let diagnostics: Vec<Diagnostic> = template.errors().cloned().collect();
        warn!("refusing to render template with {} error(s)", diagnostics.len());
        return Err(RenderError::InvalidTemplate { diagnostics });
    }

    let started = Instant::now();
    let scope = Scope::new(data).with_globals(options.globals.clone());
    let mut renderer = Renderer::new(template, options);
    renderer.render_children(&template.root, &scope, options.config.preserve_whitespace)?;

    let metadata = renderer.metadata(started);
    debug!(
        "rendered {} bytes in {:.3}ms ({} iterations, {} paths)",
        renderer.out.len(),
        metadata.render_time_ms,
        metadata.total_iterations,
        metadata.paths_accessed.len()
    );
    Ok(RenderResult {
        html: renderer.out,
        metadata,
    })
}

/// Check `template` once, then render it on every call
pub fn create_string_renderer(
    template: CompiledTemplate,
) -> Result<impl Fn(Value, &RenderOptions) -> Result<RenderResult>> {
    if template.has_errors() {
        return Err(RenderError::InvalidTemplate {
            diagnostics: template.errors().cloned().collect(),
        });
    }
    Ok(move |data: Value, options: &RenderOptions| render(&template, data, options))
}

// ============ Renderer ============

/// Caller content for one component invocation
#[derive(Default)]
struct SlotFrame<'a> {
    slots: IndexMap<String, Vec<&'a Node>>,
}

#[derive(Debug, Clone, Copy)]
enum Depth {
    Loop,
    Recursion,
    Component,
}

impl Depth {
    fn limit(self) -> LimitType {
        match self {
            Depth::Loop => LimitType::LoopNesting,
            Depth::Recursion => LimitType::RecursionDepth,
            Depth::Component => LimitType::ComponentDepth,
        }
    }
}

/// Output context for interpolated text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextMode {
    Html,
    /// Inside `<style>` / `<script>`
    Raw,
}

struct Renderer<'a> {
    template: &'a CompiledTemplate,
    options: &'a RenderOptions,
    state: EvalState,
    out: String,
    frames: Vec<SlotFrame<'a>>,
    /// Current and deepest value per [`Depth`]
    depths: [(usize, usize); 3],
    total_iterations: usize,
}

impl<'a> Renderer<'a> {
    fn new(template: &'a CompiledTemplate, options: &'a RenderOptions) -> Self {
        Self {
            template,
            options,
            state: EvalState::new(),
            out: String::new(),
            frames: Vec::new(),
            depths: [(0, 0); 3],
            total_iterations: 0,
        }
    }

    fn metadata(&self, started: Instant) -> RenderMetadata {
        RenderMetadata {
            paths_accessed: self.state.paths(),
            helpers_called: self.state.helpers_called(),
            render_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            total_iterations: self.total_iterations,
            max_loop_nesting: self.depths[Depth::Loop as usize].1,
            max_recursion_depth: self.depths[Depth::Recursion as usize].1,
            max_component_depth: self.depths[Depth::Component as usize].1,
            max_function_call_depth: self.state.max_call_depth(),
        }
    }

    /// Run `f` one level deeper on `depth`, restoring the counter afterwards
    fn with_depth<T>(
        &mut self,
        depth: Depth,
        location: &SourceLocation,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let slot = depth as usize;
        let current = self.depths[slot].0 + 1;
        self.options.limits.check(depth.limit(), current, location)?;
        self.depths[slot].0 = current;
        self.depths[slot].1 = self.depths[slot].1.max(current);
        let result = f(self);
        self.depths[slot].0 = current - 1;
        result
    }

    fn evaluate(&self, expr: &Expr, scope: &Scope) -> Result<Value> {
        let ctx = EvalContext::new(
            scope,
            &self.options.helpers,
            &self.options.limits,
            &self.state,
        );
        Ok(evaluate(expr, &ctx)?)
    }

    /// Render a sibling list. `@let` rebinds the working scope for the
    /// siblings after it, never for anything outside this list.
    fn render_children(&mut self, nodes: &'a [Node], scope: &Scope, preserve: bool) -> Result<()> {
        self.render_list(nodes, scope, preserve, TextMode::Html)
    }

    fn render_list(
        &mut self,
        nodes: impl IntoIterator<Item = &'a Node>,
        scope: &Scope,
        preserve: bool,
        mode: TextMode,
    ) -> Result<()> {
        let mut scope = scope.clone();
        for node in nodes {
            if let NodeKind::Let {
                name,
                is_global,
                value,
            } = &node.kind
            {
                scope = self.bind_let(name, *is_global, value, &scope)?;
                continue;
            }
            if !preserve && is_droppable_whitespace(node) {
                continue;
            }
            self.with_depth(Depth::Recursion, &node.location, |r| {
                r.render_node(node, &scope, preserve, mode)
            })?;
        }
        Ok(())
    }

    fn render_node(
        &mut self,
        node: &'a Node,
        scope: &Scope,
        preserve: bool,
        mode: TextMode,
    ) -> Result<()> {
        match &node.kind {
            NodeKind::Text { segments } => self.render_text(segments, scope, mode),
            NodeKind::Element {
                tag,
                attributes,
                children,
            } => self.render_element(node, tag, attributes, children, scope, preserve),
            NodeKind::If {
                branches,
                else_branch,
            } => {
                for branch in branches {
                    if self.evaluate(&branch.condition, scope)?.is_truthy() {
                        return self.render_list(&branch.body, scope, preserve, mode);
                    }
                }
                match else_branch {
                    Some(body) => self.render_list(body, scope, preserve, mode),
                    None => Ok(()),
                }
            }
            NodeKind::For {
                items,
                item_var,
                index_var,
                iteration,
                body,
            } => self.with_depth(Depth::Loop, &node.location, |r| {
                let vars = (item_var.as_str(), index_var.as_deref());
                r.render_for(node, items, vars, *iteration, body, scope, preserve, mode)
            }),
            NodeKind::Match {
                value,
                cases,
                default_case,
            } => {
                let value = self.evaluate(value, scope)?;
                for case in cases {
                    let matched = match case {
                        MatchCase::Literal { values, .. } => values
                            .iter()
                            .any(|lit| value.strict_eq(&literal_value(lit))),
                        MatchCase::Expression { condition, .. } => {
                            let case_scope = scope.with_local("_", value.clone());
                            self.evaluate(condition, &case_scope)?.is_truthy()
                        }
                    };
                    if matched {
                        return self.render_list(case.body(), scope, preserve, mode);
                    }
                }
                match default_case {
                    Some(body) => self.render_list(body, scope, preserve, mode),
                    None => Ok(()),
                }
            }
            // Bound by render_list; a lone `@let` has no later siblings
            NodeKind::Let { .. } => Ok(()),
            NodeKind::Component {
                name,
                props,
                children,
            } => self.with_depth(Depth::Component, &node.location, |r| {
                r.render_component(node, name, props, children, scope)
            }),
            NodeKind::Fragment { children } => self.render_list(children, scope, true, mode),
            NodeKind::Slot { name, fallback } => {
                let name = name.as_deref().unwrap_or("default");
                self.render_slot(name, fallback.as_deref(), scope, preserve)
            }
            NodeKind::Comment { style, text } => {
                if self.options.config.include_comments && *style == CommentStyle::Html {
                    self.out.push_str("<!--");
                    self.out.push_str(text);
                    self.out.push_str("-->");
                }
                Ok(())
            }
        }
    }

    // ============ Text & Elements ============

    fn render_text(&mut self, segments: &[TextSegment], scope: &Scope, mode: TextMode) -> Result<()> {
        for segment in segments {
            match segment {
                TextSegment::Literal(text) => self.out.push_str(text),
                TextSegment::Expr(expr) => {
                    let value = self.output_value(expr, scope)?;
                    match mode {
                        TextMode::Raw => self.out.push_str(&value.replace("</", "<\\/")),
                        TextMode::Html if self.options.config.html_escape => {
                            escape_html_into(&mut self.out, &value)
                        }
                        TextMode::Html => self.out.push_str(&value),
                    }
                }
            }
        }
        Ok(())
    }

    /// Evaluate for output: nullish is empty, functions are refused
    fn output_value(&self, expr: &Expr, scope: &Scope) -> Result<String> {
        match self.evaluate(expr, scope)? {
            Value::Function(function) => Err(RenderError::RenderFailed {
                message: format!("cannot render function '{}' as text", function.name),
                location: expr.location.clone(),
            }),
            value => Ok(value.to_output_string()),
        }
    }

    fn render_element(
        &mut self,
        node: &'a Node,
        tag: &str,
        attributes: &[Attribute],
        children: &'a [Node],
        scope: &Scope,
        preserve: bool,
    ) -> Result<()> {
        self.out.push('<');
        self.out.push_str(tag);
        for attr in attributes {
            self.render_attribute(attr, scope)?;
        }
        if self.options.config.include_source_tracking {
            self.render_source_tracking(node, children, scope);
        }

        if is_void_element(tag) {
            self.out.push_str(" />");
            return Ok(());
        }
        self.out.push('>');

        let mode = if is_raw_element(tag) {
            TextMode::Raw
        } else {
            TextMode::Html
        };
        self.render_list(children, scope, preserve || preserves_whitespace(tag), mode)?;

        self.out.push_str("</");
        self.out.push_str(tag);
        self.out.push('>');
        Ok(())
    }

    /// Attribute values are written escaped. Template-authored text keeps
    /// entity references it already contains; evaluated values never do.
    fn render_attribute(&mut self, attr: &Attribute, scope: &Scope) -> Result<()> {
        let escaped = match &attr.value {
            AttributeValue::Static(None) => None,
            AttributeValue::Static(Some(text)) => Some(escape_authored(text)),
            AttributeValue::Expr(expr) => match self.evaluate(expr, scope)? {
                Value::Bool(false) | Value::Null | Value::Undefined => return Ok(()),
                Value::Bool(true) => None,
                Value::Function(function) => {
                    return Err(RenderError::RenderFailed {
                        message: format!(
                            "cannot render function '{}' as attribute '{}'",
                            function.name, attr.name
                        ),
                        location: expr.location.clone(),
                    });
                }
                value => Some(escape_html(&value.to_output_string())),
            },
            AttributeValue::Mixed(segments) => {
                let mut text = String::new();
                for segment in segments {
                    match segment {
                        TextSegment::Literal(s) => text.push_str(&escape_authored(s)),
                        TextSegment::Expr(expr) => {
                            escape_html_into(&mut text, &self.output_value(expr, scope)?)
                        }
                    }
                }
                Some(text)
            }
        };

        self.out.push(' ');
        self.out.push_str(&attr.name);
        if let Some(escaped) = escaped {
            self.out.push_str("=\"");
            self.out.push_str(&escaped);
            self.out.push('"');
        }
        Ok(())
    }

    /// Static attribution: the render data this element's own attributes and
    /// direct text children read. Loop variables resolve to the collection
    /// they walk; `@let` names and other data-less locals are left out.
    fn render_source_tracking(&mut self, node: &Node, children: &[Node], scope: &Scope) {
        let exprs: Vec<&Expr> = node
            .expressions()
            .into_iter()
            .chain(
                children
                    .iter()
                    .filter(|c| matches!(c.kind, NodeKind::Text { .. }))
                    .flat_map(Node::expressions),
            )
            .collect();
        if exprs.is_empty() {
            return;
        }

        let config = &self.options.config;
        let prefix = config.source_tracking_prefix.as_str();
        // `@let`s among the children bind names the element's scope lacks
        let child_lets: Vec<&str> = children
            .iter()
            .filter_map(|c| match &c.kind {
                NodeKind::Let {
                    name,
                    is_global: false,
                    ..
                } => Some(name.as_str()),
                _ => None,
            })
            .collect();

        let mut paths = IndexSet::new();
        let mut ops = IndexSet::new();
        for expr in &exprs {
            for path in expr.paths() {
                if path.root().is_some_and(|root| child_lets.contains(&root)) {
                    continue;
                }
                if let Some(data_path) = scope.data_path(path) {
                    paths.insert(data_path.to_string());
                }
            }
            expr.collect_calls(&mut ops);
        }

        let mut attrs: Vec<(&str, String)> = Vec::new();
        if !paths.is_empty() {
            attrs.push(("source", join(&paths, ",")));
        }
        if config.include_operation_tracking && !ops.is_empty() {
            attrs.push(("source-op", join(&ops, ",")));
        }
        if config.include_note_generation {
            let notes: IndexSet<String> = exprs
                .iter()
                .filter(|e| !e.is_trivial())
                .map(|e| e.to_string())
                .collect();
            if !notes.is_empty() {
                attrs.push(("source-note", join(&notes, "; ")));
            }
        }

        for (name, value) in attrs {
            self.out.push(' ');
            self.out.push_str(prefix);
            self.out.push_str(name);
            self.out.push_str("=\"");
            escape_html_into(&mut self.out, &value);
            self.out.push('"');
        }
    }

    // ============ Directives ============

    #[allow(clippy::too_many_arguments)]
    fn render_for(
        &mut self,
        node: &Node,
        items: &Expr,
        (item_var, index_var): (&str, Option<&str>),
        iteration: IterationKind,
        body: &'a [Node],
        scope: &Scope,
        preserve: bool,
        mode: TextMode,
    ) -> Result<()> {
        let collection = self.evaluate(items, scope)?;
        let item_origin = match (iteration, items.as_path()) {
            (IterationKind::Of, Some(path)) => scope.data_path(path).map(|mut origin| {
                origin.segments.push(PathSegment::Star);
                origin
            }),
            _ => None,
        };
        let entries: Vec<Value> = match (iteration, &collection) {
            (IterationKind::Of, Value::Array(items)) => items.iter().cloned().collect(),
            (IterationKind::In, Value::Array(items)) => (0..items.len()).map(Value::from).collect(),
            (IterationKind::In, Value::Object(map)) => {
                map.keys().map(|k| Value::from(k.as_str())).collect()
            }
            _ => Vec::new(),
        };

        for (index, entry) in entries.into_iter().enumerate() {
            let limits = &self.options.limits;
            limits.check(LimitType::IterationsPerLoop, index + 1, &node.location)?;
            self.total_iterations += 1;
            limits.check(LimitType::TotalIterations, self.total_iterations, &node.location)?;

            let mut iteration_scope = scope.with_local_from(item_var, entry, item_origin.clone());
            if let Some(index_var) = index_var {
                iteration_scope = iteration_scope.with_local(index_var, index);
            }
            self.render_list(body, &iteration_scope, preserve, mode)?;
        }
        Ok(())
    }

    fn bind_let(&self, name: &str, is_global: bool, value: &LetValue, scope: &Scope) -> Result<Scope> {
        let origin = match value {
            LetValue::Expr(expr) => expr.as_path().and_then(|path| scope.data_path(path)),
            LetValue::Function { .. } => None,
        };
        let value = match value {
            LetValue::Expr(expr) => self.evaluate(expr, scope)?,
            LetValue::Function { params, body } => Value::Function(Rc::new(Function {
                name: name.to_string(),
                params: params.clone(),
                body: body.clone(),
                scope: scope.clone(),
            })),
        };
        Ok(if is_global {
            scope.with_global(name, value)
        } else {
            scope.with_local_from(name, value, origin)
        })
    }

    // ============ Components & Slots ============

    fn render_component(
        &mut self,
        node: &Node,
        name: &str,
        props: &[PropBinding],
        children: &'a [Node],
        scope: &Scope,
    ) -> Result<()> {
        let template = self.template;
        let options = self.options;
        let Some(def) = template
            .components
            .get(name)
            .or_else(|| options.components.get(name))
        else {
            return Err(RenderError::UnknownComponent {
                name: name.to_string(),
                location: node.location.clone(),
            });
        };
        trace!("rendering component <{name}> with {} props", props.len());

        let mut values: IndexMap<String, Value> = IndexMap::new();
        for binding in props {
            values.insert(binding.name.clone(), self.evaluate(&binding.value, scope)?);
        }
        // Defaults see the props resolved before them
        for prop in &def.props {
            if values.contains_key(&prop.name) {
                continue;
            }
            if let Some(default) = &prop.default_value {
                let partial = scope.isolated(Value::Object(Rc::new(values.clone())));
                let value = self.evaluate(default, &partial)?;
                values.insert(prop.name.clone(), value);
            }
        }
        let component_scope = scope.isolated(Value::Object(Rc::new(values)));

        self.frames.push(split_slots(children));
        let result = self.render_children(&def.body, &component_scope, false);
        self.frames.pop();
        result
    }

    /// Caller content renders in the component's scope, but its own
    /// `<slot>`s belong to the enclosing frame.
    fn render_slot(
        &mut self,
        name: &str,
        fallback: Option<&'a [Node]>,
        scope: &Scope,
        preserve: bool,
    ) -> Result<()> {
        let content = self
            .frames
            .last()
            .and_then(|frame| frame.slots.get(name))
            .filter(|nodes| nodes.iter().any(|n| !n.is_blank_text()))
            .cloned();

        match (content, self.frames.pop()) {
            (Some(nodes), Some(frame)) => {
                let result = self.render_list(nodes, scope, preserve, TextMode::Html);
                self.frames.push(frame);
                result
            }
            (_, frame) => {
                self.frames.extend(frame);
                match fallback {
                    Some(nodes) => self.render_children(nodes, scope, preserve),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Split a component's children into named slots. `<template slot="x">`
/// children fill `x`; everything else fills `default`.
fn split_slots(children: &[Node]) -> SlotFrame<'_> {
    let mut frame = SlotFrame::default();
    for child in children {
        if let NodeKind::Element {
            tag,
            attributes,
            children: content,
        } = &child.kind
        {
            let slot_name = attributes.iter().find_map(|a| match (&a.name[..], &a.value) {
                ("slot", AttributeValue::Static(Some(name))) => Some(name.clone()),
                _ => None,
            });
            if let (true, Some(slot_name)) = (tag == "template", slot_name) {
                frame.slots.entry(slot_name).or_default().extend(content.iter());
                continue;
            }
        }
        frame
            .slots
            .entry("default".to_string())
            .or_default()
            .push(child);
    }
    frame
}

/// Indentation between tags: whitespace only, spanning a line break
fn is_droppable_whitespace(node: &Node) -> bool {
    match &node.kind {
        NodeKind::Text { segments } => {
            node.is_blank_text()
                && segments.iter().any(|s| match s {
                    TextSegment::Literal(text) => text.contains('\n'),
                    TextSegment::Expr(_) => false,
                })
        }
        _ => false,
    }
}

fn join(items: &IndexSet<String>, sep: &str) -> String {
    items.iter().map(String::as_str).collect::<Vec<_>>().join(sep)
}

pub(crate) fn escape_html_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}

/// Escape text written in the template itself: like [`escape_html`], but an
/// `&` that already starts a character reference (`&amp;`, `&#39;`,
/// `&#x2F;`) is kept.
fn escape_authored(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, c) in text.char_indices() {
        match c {
            '&' if starts_char_ref(&text[i + 1..]) => out.push('&'),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// `rest` follows an `&`: is it `name;`, `#123;` or `#x1f;`?
fn starts_char_ref(rest: &str) -> bool {
    let Some(end) = rest.find(';') else {
        return false;
    };
    let body = &rest[..end];
    let valid = match body.strip_prefix('#') {
        Some(num) => match num.strip_prefix(['x', 'X']) {
            Some(hex) => !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()),
            None => !num.is_empty() && num.chars().all(|c| c.is_ascii_digit()),
        },
        None => body.starts_with(|c: char| c.is_ascii_alphabetic())
            && body.chars().all(|c| c.is_ascii_alphanumeric()),
    };
    valid && body.len() <= 32
}

/// HTML-escape `& < > " '`
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    escape_html_into(&mut out, text);
    out
}

// ============ Sanity Tests ============
// Most testing is done via integration tests in tests/integration.rs

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{CompileOptions, compile};
    use serde_json::json;

    fn html(src: &str, data: serde_json::Value) -> String {
        let template = compile(src, &CompileOptions::default());
        render(&template, data, &RenderOptions::default()).unwrap().html
    }

    #[test]
    fn escapes_interpolations() {
        assert_eq!(
            html("<p>${x}</p>", json!({"x": "<b>&'\""})),
            "<p>&lt;b&gt;&amp;&#39;&quot;</p>"
        );
        let template = compile("${x}", &CompileOptions::default());
        let options = RenderOptions::new().with_config(RenderConfig::new().without_escaping());
        let out = render(&template, json!({"x": "<b>"}), &options).unwrap();
        assert_eq!(out.html, "<b>");
    }

    #[test]
    fn prefix_validation() {
        assert!(RenderConfig::new().validate().is_ok());
        assert!(RenderConfig::new().with_source_tracking("").validate().is_ok());
        assert!(RenderConfig::new().with_source_tracking("data_x-").validate().is_ok());
        let err = RenderConfig::new().with_source_tracking("1bad").validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
        assert!(RenderConfig::new().with_source_tracking("a b").validate().is_err());
    }

    #[test]
    fn void_elements_self_close() {
        assert_eq!(html("<br><img src=${u}>", json!({"u": "a.png"})), r#"<br /><img src="a.png" />"#);
    }

    #[test]
    fn depth_counters_reset_after_errors() {
        let template = compile("@for (x of xs) { ${boom()} }", &CompileOptions::default());
        let options = RenderOptions::default();
        let mut renderer = Renderer::new(&template, &options);
        let scope = Scope::new(json!({"xs": [1]}));
        assert!(renderer.render_children(&template.root, &scope, false).is_err());
        assert_eq!(renderer.depths[Depth::Loop as usize].0, 0);
        assert_eq!(renderer.depths[Depth::Recursion as usize].0, 0);
    }

    #[test]
    fn raw_content_is_not_entity_escaped() {
        assert_eq!(
            html("<script>var s = \"${s}\";</script>", json!({"s": "a</script>&"})),
            "<script>var s = \"a<\\/script>&\";</script>"
        );
    }
}
