//! Evaluator for weft expressions
//!
//! Pure function of (expression, scope, helpers, limits). Missing data never
//! errors; only unknown helpers, helper failures and limit violations do.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexSet;
use log::trace;
use thiserror::Error;

use crate::ast::expr::{Expr, ExprKind, Path, PathSegment};
use crate::ast::{BinOp, Literal, SourceLocation, UnaryOp};
use crate::helpers::{HelperError, HelperRegistry};
use crate::limits::{LimitType, ResourceLimitError, ResourceLimits};
use crate::scope::Scope;
use crate::value::{Function, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Unknown helper '{name}' at {location}")]
    UnknownHelper {
        name: String,
        location: SourceLocation,
    },

    #[error("'{name}' is a {type_name}, not a function, at {location}")]
    NotCallable {
        name: String,
        type_name: &'static str,
        location: SourceLocation,
    },

    #[error("Helper '{name}' failed at {location}: {source}")]
    HelperFailed {
        name: String,
        location: SourceLocation,
        source: HelperError,
    },

    #[error(transparent)]
    Limit(#[from] ResourceLimitError),
}

impl EvalError {
    pub fn code(&self) -> &'static str {
        match self {
            EvalError::UnknownHelper { .. } => "UNKNOWN_HELPER",
            EvalError::NotCallable { .. } => "NOT_CALLABLE",
            EvalError::HelperFailed { .. } => "HELPER_FAILED",
            EvalError::Limit(e) => e.code(),
        }
    }
}

type Result<T> = std::result::Result<T, EvalError>;

/// Counters and audit sets shared by every evaluation in one render
#[derive(Debug, Default)]
pub struct EvalState {
    call_depth: Cell<usize>,
    max_call_depth: Cell<usize>,
    paths: RefCell<IndexSet<String>>,
    helpers: RefCell<IndexSet<String>>,
}

impl EvalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Data paths read so far, in first-access order
    pub fn paths(&self) -> IndexSet<String> {
        self.paths.borrow().clone()
    }

    /// Helper names invoked so far
    pub fn helpers_called(&self) -> IndexSet<String> {
        self.helpers.borrow().clone()
    }

    /// Deepest `@let` function call nesting reached
    pub fn max_call_depth(&self) -> usize {
        self.max_call_depth.get()
    }
}

/// Everything an expression can see while it evaluates
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub scope: &'a Scope,
    pub helpers: &'a HelperRegistry,
    pub limits: &'a ResourceLimits,
    pub state: &'a EvalState,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        scope: &'a Scope,
        helpers: &'a HelperRegistry,
        limits: &'a ResourceLimits,
        state: &'a EvalState,
    ) -> Self {
        Self {
            scope,
            helpers,
            limits,
            state,
        }
    }

    /// Same helpers, limits and counters over a different scope
    pub fn with_scope<'b>(&self, scope: &'b Scope) -> EvalContext<'b>
    where
        'a: 'b,
    {
        EvalContext {
            scope,
            helpers: self.helpers,
            limits: self.limits,
            state: self.state,
        }
    }
}

/// Evaluate `expr` in `ctx`
pub fn evaluate(expr: &Expr, ctx: &EvalContext<'_>) -> Result<Value> {
    match &expr.kind {
        ExprKind::Literal(lit) => Ok(literal_value(lit)),
        ExprKind::Path(path) => {
            record_path(ctx, path);
            Ok(resolve_path(ctx.scope, path))
        }
        ExprKind::Wildcard(path) => {
            record_path(ctx, path);
            Ok(resolve_wildcard(ctx.scope, path))
        }
        ExprKind::Unary { op, operand } => {
            let value = evaluate(operand, ctx)?;
            Ok(match op {
                UnaryOp::Not => Value::Bool(!value.is_truthy()),
                UnaryOp::Neg => Value::Number(-value.to_number()),
            })
        }
        ExprKind::Binary { op, left, right } => eval_binary(*op, left, right, ctx),
        ExprKind::Ternary {
            condition,
            truthy,
            falsy,
        } => {
            if evaluate(condition, ctx)?.is_truthy() {
                evaluate(truthy, ctx)
            } else {
                evaluate(falsy, ctx)
            }
        }
        ExprKind::Call { callee, args } => eval_call(callee, args, &expr.location, ctx),
    }
}

/// Evaluate with a fresh state and default limits
pub fn eval(expr: &Expr, scope: &Scope, helpers: &HelperRegistry) -> Result<Value> {
    let limits = ResourceLimits::default();
    let state = EvalState::new();
    evaluate(expr, &EvalContext::new(scope, helpers, &limits, &state))
}

pub(crate) fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::String(s) => Value::String(s.clone()),
        Literal::Number(n) => Value::Number(*n),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
        Literal::Undefined => Value::Undefined,
    }
}

/// Only reads of render data count; locals map back to what they iterate.
fn record_path(ctx: &EvalContext<'_>, path: &Path) {
    if let Some(data_path) = ctx.scope.data_path(path) {
        ctx.state.paths.borrow_mut().insert(data_path.to_string());
    }
}

// ============ Paths ============

fn resolve_root(scope: &Scope, path: &Path) -> Value {
    match path.root() {
        Some(name) => scope.resolve(name, path.is_global),
        None => Value::Undefined,
    }
}

fn step(value: &Value, segment: &PathSegment) -> Value {
    match segment {
        PathSegment::Key(key) => value.get_key(key),
        PathSegment::Index(index) => value.get_index(*index),
        PathSegment::Star => Value::Undefined,
    }
}

/// Walk a star-free path. Anything missing along the way is `Undefined`.
fn resolve_path(scope: &Scope, path: &Path) -> Value {
    let root = resolve_root(scope, path);
    path.segments
        .iter()
        .skip(1)
        .fold(root, |value, segment| step(&value, segment))
}

fn resolve_wildcard(scope: &Scope, path: &Path) -> Value {
    let root = resolve_root(scope, path);
    let rest = path.segments.get(1..).unwrap_or_default();
    match extract(root, rest) {
        value @ Value::Array(_) => value,
        _ => Value::array([]),
    }
}

/// Apply `segments` to `value`. At a star, map the remaining suffix over
/// every element; a nested star's array is spliced into this one, so each
/// star flattens exactly one level.
fn extract(mut value: Value, segments: &[PathSegment]) -> Value {
    for (i, segment) in segments.iter().enumerate() {
        if *segment != PathSegment::Star {
            value = step(&value, segment);
            continue;
        }
        let rest = &segments[i + 1..];
        let nested = rest.contains(&PathSegment::Star);
        let mut out = Vec::new();
        for item in elements(&value) {
            let mapped = extract(item, rest);
            match mapped {
                Value::Array(items) if nested => out.extend(items.iter().cloned()),
                other => out.push(other),
            }
        }
        return Value::array(out);
    }
    value
}

/// Elements a star iterates over: array items or object values
fn elements(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.as_ref().clone(),
        Value::Object(map) => map.values().cloned().collect(),
        _ => Vec::new(),
    }
}

// ============ Operators ============

fn eval_binary(op: BinOp, left: &Expr, right: &Expr, ctx: &EvalContext<'_>) -> Result<Value> {
    let lhs = evaluate(left, ctx)?;

    // Short-circuiting operators return an operand, never a coerced bool
    match op {
        BinOp::And => {
            return if lhs.is_truthy() {
                evaluate(right, ctx)
            } else {
                Ok(lhs)
            };
        }
        BinOp::Or => {
            return if lhs.is_truthy() {
                Ok(lhs)
            } else {
                evaluate(right, ctx)
            };
        }
        BinOp::Nullish => {
            return if lhs.is_nullish() {
                evaluate(right, ctx)
            } else {
                Ok(lhs)
            };
        }
        _ => {}
    }

    let rhs = evaluate(right, ctx)?;
    Ok(apply_binary(op, &lhs, &rhs))
}

fn apply_binary(op: BinOp, lhs: &Value, rhs: &Value) -> Value {
    match op {
        BinOp::Add if concatenates(lhs) || concatenates(rhs) => {
            Value::String(lhs.to_display_string() + &rhs.to_display_string())
        }
        BinOp::Add => Value::Number(lhs.to_number() + rhs.to_number()),
        BinOp::Sub => Value::Number(lhs.to_number() - rhs.to_number()),
        BinOp::Mul => Value::Number(lhs.to_number() * rhs.to_number()),
        BinOp::Div => Value::Number(lhs.to_number() / rhs.to_number()),
        BinOp::Mod => Value::Number(lhs.to_number() % rhs.to_number()),
        BinOp::Eq => Value::Bool(lhs.loose_eq(rhs)),
        BinOp::Ne => Value::Bool(!lhs.loose_eq(rhs)),
        BinOp::Lt => Value::Bool(lhs.compare(rhs).is_some_and(|o| o.is_lt())),
        BinOp::Le => Value::Bool(lhs.compare(rhs).is_some_and(|o| o.is_le())),
        BinOp::Gt => Value::Bool(lhs.compare(rhs).is_some_and(|o| o.is_gt())),
        BinOp::Ge => Value::Bool(lhs.compare(rhs).is_some_and(|o| o.is_ge())),
        BinOp::And => {
            if lhs.is_truthy() {
                rhs.clone()
            } else {
                lhs.clone()
            }
        }
        BinOp::Or => {
            if lhs.is_truthy() {
                lhs.clone()
            } else {
                rhs.clone()
            }
        }
        BinOp::Nullish => {
            if lhs.is_nullish() {
                rhs.clone()
            } else {
                lhs.clone()
            }
        }
    }
}

fn concatenates(value: &Value) -> bool {
    matches!(
        value,
        Value::String(_) | Value::Array(_) | Value::Object(_) | Value::Function(_)
    )
}

// ============ Calls ============

fn eval_call(
    callee: &str,
    args: &[Expr],
    location: &SourceLocation,
    ctx: &EvalContext<'_>,
) -> Result<Value> {
    if let Some(function) = lookup_function(ctx.scope, callee) {
        let args = eval_args(args, ctx)?;
        return call_function(&function, args, location, ctx);
    }

    let Some(helper) = ctx.helpers.get(callee) else {
        // A non-function local of that name makes the typo more specific
        if let Some(value) = ctx.scope.local(callee) {
            return Err(EvalError::NotCallable {
                name: callee.to_string(),
                type_name: value.type_name(),
                location: location.clone(),
            });
        }
        return Err(EvalError::UnknownHelper {
            name: callee.to_string(),
            location: location.clone(),
        });
    };
    let args = eval_args(args, ctx)?;
    ctx.state.helpers.borrow_mut().insert(callee.to_string());
    trace!("calling helper {callee} with {} args", args.len());

    let bound = helper(ctx.scope.clone());
    bound(&args).map_err(|source| EvalError::HelperFailed {
        name: callee.to_string(),
        location: location.clone(),
        source,
    })
}

fn eval_args(args: &[Expr], ctx: &EvalContext<'_>) -> Result<Vec<Value>> {
    args.iter().map(|arg| evaluate(arg, ctx)).collect()
}

/// `@let` functions live in locals, or in globals when declared `$.name`
fn lookup_function(scope: &Scope, name: &str) -> Option<Rc<Function>> {
    let found = match scope.local(name) {
        Some(value) => value.clone(),
        None => scope.global(name),
    };
    match found {
        Value::Function(function) => Some(function),
        _ => None,
    }
}

/// Invoke a `@let` function: parameters are bound over the declaring scope,
/// plus the function's own name so it can recurse.
pub(crate) fn call_function(
    function: &Rc<Function>,
    args: Vec<Value>,
    location: &SourceLocation,
    ctx: &EvalContext<'_>,
) -> Result<Value> {
    let depth = ctx.state.call_depth.get() + 1;
    ctx.limits
        .check(LimitType::FunctionCallDepth, depth, location)?;
    ctx.state.call_depth.set(depth);
    if depth > ctx.state.max_call_depth.get() {
        ctx.state.max_call_depth.set(depth);
    }

    let mut scope = function
        .scope
        .with_local(function.name.clone(), Value::Function(Rc::clone(function)));
    let mut args = args.into_iter();
    for param in &function.params {
        scope = scope.with_local(param.clone(), args.next().unwrap_or_default());
    }

    let result = evaluate(&function.body, &ctx.with_scope(&scope));
    ctx.state.call_depth.set(depth - 1);
    result
}

// ============ Sanity Tests ============
// Most testing is done via integration tests in tests/integration.rs
