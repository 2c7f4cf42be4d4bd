//! Helper registry for weft expressions
//!
//! A helper is curried with the scope it is called from:
//! `helper(scope) -> (args) -> result`. Most helpers ignore the scope; the
//! ones that format for a locale read `$.locale` / `$.currency` through it.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::scope::Scope;
use crate::value::Value;

/// Error raised by a helper. Propagated to the render call unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct HelperError(pub String);

impl HelperError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type HelperResult = Result<Value, HelperError>;

/// A helper with its scope already applied
pub type BoundHelper = Box<dyn Fn(&[Value]) -> HelperResult>;

/// Handler stored in the registry
pub type Helper = Arc<dyn Fn(Scope) -> BoundHelper + Send + Sync + 'static>;

/// Registry of named helpers
#[derive(Default, Clone)]
pub struct HelperRegistry {
    helpers: HashMap<String, Helper>,
}

impl std::fmt::Debug for HelperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.helpers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("HelperRegistry")
            .field("helpers", &names)
            .finish()
    }
}

impl HelperRegistry {
    /// Empty registry, no builtins
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the builtin helpers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    /// Register a curried helper that sees the calling scope
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Scope) -> BoundHelper + Send + Sync + 'static,
    {
        self.helpers.insert(name.into(), Arc::new(handler));
    }

    /// Register a helper that only looks at its arguments
    pub fn register_fn<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[Value]) -> HelperResult + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(name, move |_scope| {
            let handler = Arc::clone(&handler);
            Box::new(move |args: &[Value]| handler(args))
        });
    }

    pub fn get(&self, name: &str) -> Option<&Helper> {
        self.helpers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }

    /// Copy every helper of `other` into `self`, replacing same-named ones
    pub fn extend(&mut self, other: &HelperRegistry) {
        for (name, helper) in &other.helpers {
            self.helpers.insert(name.clone(), Arc::clone(helper));
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.helpers.keys().map(String::as_str)
    }

    // ============ Builtin Helpers ============

    fn register_builtins(&mut self) {
        self.register_fn("upper", |args| {
            Ok(Value::String(arg(args, 0).to_output_string().to_uppercase()))
        });
        self.register_fn("lower", |args| {
            Ok(Value::String(arg(args, 0).to_output_string().to_lowercase()))
        });
        self.register_fn("trim", |args| {
            Ok(Value::String(arg(args, 0).to_output_string().trim().to_string()))
        });

        self.register_fn("len", |args| {
            let len = match arg(args, 0) {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                _ => 0,
            };
            Ok(Value::from(len))
        });

        self.register_fn("join", |args| {
            let items = arg(args, 0);
            let items = items
                .as_array()
                .ok_or_else(|| HelperError::new(format!("join: expected array, got {}", items.type_name())))?;
            let sep = match arg(args, 1) {
                Value::Undefined => ",".to_string(),
                other => other.to_output_string(),
            };
            Ok(Value::String(
                items
                    .iter()
                    .map(Value::to_output_string)
                    .collect::<Vec<_>>()
                    .join(&sep),
            ))
        });

        self.register_fn("json", |args| {
            serde_json::to_string(&arg(args, 0))
                .map(Value::String)
                .map_err(|e| HelperError::new(format!("json: {e}")))
        });

        self.register_fn("round", |args| {
            let n = arg(args, 0).to_number();
            let digits = match arg(args, 1) {
                Value::Undefined => 0,
                other => other.to_number().clamp(0.0, 15.0) as i32,
            };
            let factor = 10f64.powi(digits);
            Ok(Value::Number((n * factor).round() / factor))
        });

        self.register_fn("default", |args| {
            let value = arg(args, 0);
            Ok(if value.is_nullish() || value.as_str() == Some("") {
                arg(args, 1)
            } else {
                value
            })
        });

        self.register("currency", |scope| {
            let code = scope.global("currency");
            let locale = scope.global("locale");
            Box::new(move |args: &[Value]| {
                let code = match arg(args, 1) {
                    Value::Undefined => code.clone(),
                    explicit => explicit,
                };
                let code = code.as_str().unwrap_or("USD").to_string();
                let locale = locale.as_str().unwrap_or("en-US");
                let amount = arg(args, 0).to_number();
                if amount.is_nan() {
                    return Err(HelperError::new(format!(
                        "currency: expected number, got {}",
                        arg(args, 0).type_name()
                    )));
                }
                Ok(Value::String(format_currency(amount, &code, locale)))
            })
        });
    }
}

/// Positional argument, `Undefined` when missing
fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

/// `1234.5`, `USD`, `en-US` → `$1,234.50`; `de-DE` groups with `.` and
/// puts the symbol after the amount.
fn format_currency(amount: f64, code: &str, locale: &str) -> String {
    let (group, decimal, symbol_after) = match locale.split(['-', '_']).next() {
        Some("de" | "es" | "it" | "nl" | "pt") => ('.', ',', true),
        Some("fr") => (' ', ',', true),
        _ => (',', '.', false),
    };
    let symbol = match code {
        "USD" => "$",
        "EUR" => "€",
        "GBP" => "£",
        "JPY" => "¥",
        other => other,
    };

    let fixed = format!("{:.2}", amount.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(group);
        }
        grouped.push(c);
    }
    let sign = if amount < 0.0 { "-" } else { "" };
    let number = format!("{grouped}{decimal}{frac_part}");
    if symbol_after {
        format!("{sign}{number} {symbol}")
    } else {
        format!("{sign}{symbol}{number}")
    }
}
