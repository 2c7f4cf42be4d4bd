//! Expression AST - what `${...}` and directive heads parse into
//!
//! The evaluator consumes this directly; there is no desugaring step.

use indexmap::IndexSet;

use super::{BinOp, Literal, SourceLocation, UnaryOp};

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Literal value: `"a"`, `3.5`, `true`, `null`, `undefined`
    Literal(Literal),

    /// Property/index chain: `user.name`, `$items[0]`, `$.locale`
    Path(Path),

    /// Unary operation: `!x`, `-x`
    Unary { op: UnaryOp, operand: Box<Expr> },

    /// Binary operation: `a + b`, `a ?? b`
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// `condition ? truthy : falsy`
    Ternary {
        condition: Box<Expr>,
        truthy: Box<Expr>,
        falsy: Box<Expr>,
    },

    /// Helper or `@let` function call: `upper(name)`
    Call { callee: String, args: Vec<Expr> },

    /// A path with at least one `[*]` segment; evaluates to a flat array.
    Wildcard(Path),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    pub segments: Vec<PathSegment>,
    /// `$.` prefix: resolve against globals only.
    pub is_global: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
    Star,
}

impl Path {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self {
            segments,
            is_global: false,
        }
    }

    pub fn global(segments: Vec<PathSegment>) -> Self {
        Self {
            segments,
            is_global: true,
        }
    }

    pub fn has_star(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, PathSegment::Star))
    }

    /// The leading key, which is the name looked up in the scope.
    pub fn root(&self) -> Option<&str> {
        match self.segments.first() {
            Some(PathSegment::Key(name)) => Some(name),
            _ => None,
        }
    }
}

impl Expr {
    pub fn new(kind: ExprKind, location: SourceLocation) -> Self {
        Self { kind, location }
    }

    pub fn literal(lit: Literal) -> Self {
        Self::new(ExprKind::Literal(lit), SourceLocation::default())
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::literal(Literal::String(s.into()))
    }

    pub fn undefined(location: SourceLocation) -> Self {
        Self::new(ExprKind::Literal(Literal::Undefined), location)
    }

    pub fn path(path: Path) -> Self {
        let kind = if path.has_star() {
            ExprKind::Wildcard(path)
        } else {
            ExprKind::Path(path)
        };
        Self::new(kind, SourceLocation::default())
    }

    /// Single-key data path, mostly for building trees by hand.
    pub fn var(name: impl Into<String>) -> Self {
        Self::path(Path::new(vec![PathSegment::Key(name.into())]))
    }

    pub fn binop(self, op: BinOp, rhs: Expr) -> Self {
        let location = self.location.to(&rhs.location);
        Self::new(
            ExprKind::Binary {
                op,
                left: Box::new(self),
                right: Box::new(rhs),
            },
            location,
        )
    }

    pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::new(
            ExprKind::Call {
                callee: callee.into(),
                args,
            },
            SourceLocation::default(),
        )
    }

    pub fn as_path(&self) -> Option<&Path> {
        match &self.kind {
            ExprKind::Path(path) | ExprKind::Wildcard(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Literal> {
        match &self.kind {
            ExprKind::Literal(lit) => Some(lit),
            _ => None,
        }
    }

    /// Visit this node and all of its descendants, parents first.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match &self.kind {
            ExprKind::Literal(_) | ExprKind::Path(_) | ExprKind::Wildcard(_) => {}
            ExprKind::Unary { operand, .. } => operand.walk(f),
            ExprKind::Binary { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            ExprKind::Ternary {
                condition,
                truthy,
                falsy,
            } => {
                condition.walk(f);
                truthy.walk(f);
                falsy.walk(f);
            }
            ExprKind::Call { args, .. } => args.iter().for_each(|arg| arg.walk(f)),
        }
    }

    /// Mutable counterpart of [`Expr::walk`], used to rebase locations.
    pub(crate) fn walk_mut(&mut self, f: &mut impl FnMut(&mut Expr)) {
        f(self);
        match &mut self.kind {
            ExprKind::Literal(_) | ExprKind::Path(_) | ExprKind::Wildcard(_) => {}
            ExprKind::Unary { operand, .. } => operand.walk_mut(f),
            ExprKind::Binary { left, right, .. } => {
                left.walk_mut(f);
                right.walk_mut(f);
            }
            ExprKind::Ternary {
                condition,
                truthy,
                falsy,
            } => {
                condition.walk_mut(f);
                truthy.walk_mut(f);
                falsy.walk_mut(f);
            }
            ExprKind::Call { args, .. } => args.iter_mut().for_each(|arg| arg.walk_mut(f)),
        }
    }

    /// Every path read anywhere in this expression, in source order.
    pub fn paths(&self) -> Vec<&Path> {
        let mut out = Vec::new();
        self.walk(&mut |e| {
            if let Some(path) = e.as_path() {
                out.push(path);
            }
        });
        out
    }

    /// Names of every function called in this expression.
    pub fn collect_calls(&self, out: &mut IndexSet<String>) {
        self.walk(&mut |e| {
            if let ExprKind::Call { callee, .. } = &e.kind {
                out.insert(callee.clone());
            }
        });
    }

    /// True for a plain literal or path, which carries nothing worth
    /// annotating in a source note.
    pub fn is_trivial(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Literal(_) | ExprKind::Path(_) | ExprKind::Wildcard(_)
        )
    }
}
