//! Three-layer variable scope: locals, data and globals
//!
//! A `Scope` is never mutated. `with_local`, `with_global` and `isolated`
//! return a new scope that shares every untouched layer with its parent, so
//! a `@let` inside a loop body or component can never leak into sibling or
//! ancestor scopes.

use std::rc::Rc;

use crate::ast::expr::Path;
use crate::value::Value;

/// Persistent name → value list; newer bindings shadow older ones.
#[derive(Debug, Clone, Default)]
struct Bindings(Option<Rc<Binding>>);

#[derive(Debug)]
struct Binding {
    name: String,
    value: Value,
    /// Render-data path this name stands for, if any
    origin: Option<Path>,
    parent: Bindings,
}

impl Bindings {
    fn bind(&self, name: String, value: Value, origin: Option<Path>) -> Self {
        Bindings(Some(Rc::new(Binding {
            name,
            value,
            origin,
            parent: self.clone(),
        })))
    }

    fn binding(&self, name: &str) -> Option<&Binding> {
        let mut cursor = self.0.as_deref();
        while let Some(binding) = cursor {
            if binding.name == name {
                return Some(binding);
            }
            cursor = binding.parent.0.as_deref();
        }
        None
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.binding(name).map(|b| &b.value)
    }

    fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// `@let`, loop variables, function parameters
    locals: Bindings,
    /// Render input, or the props object inside a component
    data: Value,
    /// Caller-supplied globals
    globals: Value,
    /// `@let $.name` bindings layered over `globals`
    global_overrides: Bindings,
}

impl Scope {
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_globals(mut self, globals: impl Into<Value>) -> Self {
        self.globals = globals.into();
        self
    }

    /// New scope with `name` bound in locals.
    pub fn with_local(&self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_local_from(name, value, None)
    }

    /// New scope with `name` bound in locals, standing for the data at
    /// `origin`. A loop variable over `users` stands for `users[*]`.
    pub fn with_local_from(
        &self,
        name: impl Into<String>,
        value: impl Into<Value>,
        origin: Option<Path>,
    ) -> Self {
        Self {
            locals: self.locals.bind(name.into(), value.into(), origin),
            ..self.clone()
        }
    }

    /// New scope with `name` bound in the global namespace.
    pub fn with_global(&self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            global_overrides: self.global_overrides.bind(name.into(), value.into(), None),
            ..self.clone()
        }
    }

    /// Scope for a component body: `data` is exactly `props`, no locals,
    /// globals shared with the caller.
    pub fn isolated(&self, props: Value) -> Self {
        Self {
            locals: Bindings::default(),
            data: props,
            globals: self.globals.clone(),
            global_overrides: self.global_overrides.clone(),
        }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn has_locals(&self) -> bool {
        !self.locals.is_empty()
    }

    /// Local binding, if one exists (even when bound to undefined).
    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locals.get(name)
    }

    /// Resolve a non-global name: locals shadow data.
    pub fn lookup(&self, name: &str) -> Value {
        match self.locals.get(name) {
            Some(value) => value.clone(),
            None => self.data.get_key(name),
        }
    }

    /// Resolve a `$.` name: globals only, regardless of locals or data.
    pub fn global(&self, name: &str) -> Value {
        match self.global_overrides.get(name) {
            Some(value) => value.clone(),
            None => self.globals.get_key(name),
        }
    }

    /// The render-data path that `path` reads, with locals replaced by the
    /// data they stand for. `None` for globals and for locals with no data
    /// behind them (`@let` results, function parameters, loop indices).
    pub fn data_path(&self, path: &Path) -> Option<Path> {
        if path.is_global {
            return None;
        }
        let root = path.root()?;
        let Some(binding) = self.locals.binding(root) else {
            return Some(path.clone());
        };
        let origin = binding.origin.as_ref()?;
        let mut segments = origin.segments.clone();
        segments.extend(path.segments[1..].iter().cloned());
        Some(Path::new(segments))
    }

    /// First-segment resolution for a path.
    pub fn resolve(&self, name: &str, is_global: bool) -> Value {
        if is_global {
            self.global(name)
        } else {
            self.lookup(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expr::{ExprKind, PathSegment};
    use crate::parse::parse;
    use serde_json::json;

    #[test]
    fn locals_shadow_data_and_globals_are_separate() {
        let scope = Scope::new(json!({"x": 2})).with_globals(json!({"x": 3}));
        assert_eq!(scope.lookup("x"), Value::from(2));

        let inner = scope.with_local("x", 1);
        assert_eq!(inner.lookup("x"), Value::from(1));
        assert_eq!(inner.global("x"), Value::from(3));

        // parent untouched
        assert_eq!(scope.lookup("x"), Value::from(2));
    }

    #[test]
    fn isolated_scope_drops_locals_and_keeps_globals() {
        let caller = Scope::new(json!({"secret": 1}))
            .with_globals(json!({"locale": "en"}))
            .with_local("hidden", 42)
            .with_global("theme", "dark");
        let component = caller.isolated(Value::object([("title", Value::from("hi"))]));

        assert!(component.lookup("hidden").is_undefined());
        assert!(component.lookup("secret").is_undefined());
        assert_eq!(component.lookup("title"), Value::from("hi"));
        assert_eq!(component.global("locale"), Value::from("en"));
        assert_eq!(component.global("theme"), Value::from("dark"));
    }

    #[test]
    fn data_paths_follow_loop_variables() {
        let users = parse("users").unwrap();
        let ExprKind::Path(users) = users.kind else {
            panic!("Expected path");
        };
        let mut origin = users.clone();
        origin.segments.push(PathSegment::Star);

        let scope = Scope::new(json!({}))
            .with_local_from("u", json!({"name": "a"}), Some(origin))
            .with_local("i", 0);
        let path = |src: &str| match parse(src).unwrap().kind {
            ExprKind::Path(p) | ExprKind::Wildcard(p) => p,
            other => panic!("Expected path, got {other:?}"),
        };

        let resolved = scope.data_path(&path("u.tags[*].id")).unwrap();
        assert_eq!(resolved.to_string(), "users[*].tags[*].id");
        assert_eq!(scope.data_path(&path("title")).unwrap().to_string(), "title");
        assert!(scope.data_path(&path("i")).is_none());
        assert!(scope.data_path(&path("$.locale")).is_none());
    }

    #[test]
    fn local_bound_to_undefined_still_shadows() {
        let scope = Scope::new(json!({"x": 2})).with_local("x", Value::Undefined);
        assert!(scope.lookup("x").is_undefined());
        assert!(scope.local("x").is_some());
    }
}
