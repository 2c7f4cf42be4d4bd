//! Runtime values and the coercion rules expressions are evaluated under
//!
//! Coercions are spelled out here rather than inherited from a host
//! language:
//!
//! | operation      | rule                                                      |
//! |----------------|-----------------------------------------------------------|
//! | to number      | undefined → NaN, null → 0, bool → 0/1, string → parsed    |
//! | `+`            | concatenation if either side is a string/array/object     |
//! | `==`           | null == undefined, numbers compare against parsed strings |
//! | `<` `>` ...    | two strings compare lexically, anything else numerically  |
//! | truthiness     | undefined, null, false, 0, NaN and "" are falsy           |
//! | output         | null/undefined render as the empty string                 |

use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::ast::expr::Expr;
use crate::scope::Scope;

pub type Object = IndexMap<String, Value>;

/// A value produced by evaluation or supplied as render data
#[derive(Clone, Default)]
pub enum Value {
    /// Missing: unknown key, out-of-range index, property of null
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Rc<Vec<Value>>),
    Object(Rc<Object>),
    /// A function declared with `@let f(a, b) = ...`
    Function(Rc<Function>),
}

/// Closure built from a `@let` function declaration
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Arc<Expr>,
    /// Scope at the point of declaration
    pub scope: Scope,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.params.join(", "))
    }
}

impl Value {
    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(Rc::new(items.into_iter().collect()))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(Rc::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// null or undefined
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Function(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(map) => Some(map.as_ref()),
            _ => None,
        }
    }

    /// Numeric coercion used by arithmetic, unary minus and ordering.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::String(s) => parse_number(s),
            Value::Array(_) => parse_number(&self.to_display_string()),
            Value::Object(_) | Value::Function(_) => f64::NAN,
        }
    }

    /// String coercion used by `+` concatenation: null and undefined
    /// spell themselves out.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(Value::to_output_string)
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => "[object Object]".to_string(),
            Value::Function(func) => format!("[function {}]", func.name),
        }
    }

    /// String used when a value reaches the rendered output: null and
    /// undefined become empty.
    pub fn to_output_string(&self) -> String {
        if self.is_nullish() {
            String::new()
        } else {
            self.to_display_string()
        }
    }

    /// Property lookup. Never fails; anything missing is `Undefined`.
    pub fn get_key(&self, key: &str) -> Value {
        match self {
            Value::Object(map) => map.get(key).cloned().unwrap_or_default(),
            Value::Array(items) if key == "length" => Value::Number(items.len() as f64),
            Value::String(s) if key == "length" => Value::Number(s.chars().count() as f64),
            _ => Value::Undefined,
        }
    }

    /// Index lookup. Out of range yields `Undefined`.
    pub fn get_index(&self, index: usize) -> Value {
        match self {
            Value::Array(items) => items.get(index).cloned().unwrap_or_default(),
            Value::String(s) => s
                .chars()
                .nth(index)
                .map(|c| Value::String(c.to_string()))
                .unwrap_or_default(),
            Value::Object(map) => map.get(&index.to_string()).cloned().unwrap_or_default(),
            _ => Value::Undefined,
        }
    }

    /// `==`
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
            (Value::Number(_), Value::String(s)) => self.to_number() == parse_number(s),
            (Value::String(s), Value::Number(_)) => parse_number(s) == other.to_number(),
            (Value::Bool(_), _) => Value::Number(self.to_number()).loose_eq(other),
            (_, Value::Bool(_)) => self.loose_eq(&Value::Number(other.to_number())),
            (
                Value::Array(_) | Value::Object(_) | Value::Function(_),
                Value::Array(_) | Value::Object(_) | Value::Function(_),
            ) => self.strict_eq(other),
            (Value::Array(_) | Value::Object(_) | Value::Function(_), _) => {
                Value::String(self.to_display_string()).loose_eq(other)
            }
            (_, Value::Array(_) | Value::Object(_) | Value::Function(_)) => {
                self.loose_eq(&Value::String(other.to_display_string()))
            }
            _ => self.strict_eq(other),
        }
    }

    /// Same kind and same value; containers compare by identity.
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Ordering used by `<`, `>`, `<=`, `>=`. `None` when either side is NaN
    /// after coercion, which makes every comparison false.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => self.to_number().partial_cmp(&other.to_number()),
        }
    }
}

/// Parse a string the way numeric coercion does: surrounding whitespace is
/// ignored, the empty string is zero and anything unparsable is NaN.
pub fn parse_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return i64::from_str_radix(hex, 16)
            .map(|n| n as f64)
            .unwrap_or(f64::NAN);
    }
    // Rust accepts "inf"/"nan" spellings the coercion rules do not.
    if trimmed
        .chars()
        .any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E')
    {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

/// Shortest round-trip form; integral values print without a fraction and
/// very large/small magnitudes switch to exponent form.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let abs = n.abs();
    if abs >= 1e21 || abs < 1e-6 {
        let formatted = format!("{n:e}");
        return match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => formatted,
        };
    }
    if n.fract() == 0.0 {
        format!("{n:.0}")
    } else {
        format!("{n}")
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Object(map) => f.debug_map().entries(map.iter()).finish(),
            Value::Function(func) => write!(f, "[function {func:?}]"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

/// Structural equality, for tests and caching. Expressions use
/// [`Value::loose_eq`] / [`Value::strict_eq`] instead.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Undefined | Value::Null | Value::Function(_) => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries.iter() {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

// ============ Conversions ============

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::array(items.into_iter().map(Value::from)),
            serde_json::Value::Object(map) => {
                Value::object(map.into_iter().map(|(k, v)| (k, Value::from(v))))
            }
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        Value::from(json.clone())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }
}

impl From<Object> for Value {
    fn from(map: Object) -> Self {
        Value::Object(Rc::new(map))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(13.0), "13");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1.5e-7), "1.5e-7");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn numeric_coercion() {
        assert_eq!(Value::Null.to_number(), 0.0);
        assert!(Value::Undefined.to_number().is_nan());
        assert_eq!(Value::from(" 42 ").to_number(), 42.0);
        assert_eq!(Value::from("").to_number(), 0.0);
        assert!(Value::from("nan").to_number().is_nan());
        assert!(Value::from("abc").to_number().is_nan());
        assert_eq!(Value::from(true).to_number(), 1.0);
        assert_eq!(Value::array([Value::from(7)]).to_number(), 7.0);
    }

    #[test]
    fn loose_equality_table() {
        assert!(Value::Null.loose_eq(&Value::Undefined));
        assert!(!Value::Null.loose_eq(&Value::from(0)));
        assert!(Value::from(1).loose_eq(&Value::from("1")));
        assert!(Value::from(true).loose_eq(&Value::from(1)));
        assert!(Value::from("").loose_eq(&Value::from(0)));
        assert!(!Value::from(f64::NAN).loose_eq(&Value::from(f64::NAN)));
        assert!(!Value::from(1).strict_eq(&Value::from("1")));
    }

    #[test]
    fn truthiness() {
        for falsy in [
            Value::Undefined,
            Value::Null,
            Value::from(false),
            Value::from(0),
            Value::from(f64::NAN),
            Value::from(""),
        ] {
            assert!(!falsy.is_truthy(), "{falsy:?} should be falsy");
        }
        assert!(Value::array([]).is_truthy());
        assert!(Value::from("0").is_truthy());
    }

    #[test]
    fn json_conversion_keeps_structure() {
        let value = Value::from(json!({"a": [1, null, "x"], "b": {"c": true}}));
        assert_eq!(value.get_key("a").get_index(2), Value::from("x"));
        assert_eq!(value.get_key("a").get_key("length"), Value::from(3));
        assert_eq!(value.get_key("b").get_key("c"), Value::from(true));
        assert_eq!(value.get_key("missing"), Value::Undefined);
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            json!({"a": [1.0, null, "x"], "b": {"c": true}})
        );
    }

    #[test]
    fn array_display_skips_nullish() {
        let value = Value::array([Value::from(1), Value::Null, Value::from("a")]);
        assert_eq!(value.to_display_string(), "1,,a");
    }
}
