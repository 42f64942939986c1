//! Dot-path lookup and comparison over JSON payloads.
//!
//! Device-state triggers and `logic.if` nodes both evaluate a comparator
//! against a value looked up by dot path (`state.motion`). Comparison
//! semantics: literal values compare structurally; the ordering comparators
//! require both sides to be numeric and never match otherwise.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

/// Comparison operator applied to a path lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    /// The path resolves to any value.
    Exists,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Error parsing a comparator string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ComparatorError {
    #[error("unknown comparator '{0}'")]
    Unknown(String),
}

impl FromStr for Comparator {
    type Err = ComparatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exists" => Ok(Self::Exists),
            "eq" => Ok(Self::Eq),
            "neq" => Ok(Self::Neq),
            "gt" => Ok(Self::Gt),
            "gte" => Ok(Self::Gte),
            "lt" => Ok(Self::Lt),
            "lte" => Ok(Self::Lte),
            other => Err(ComparatorError::Unknown(other.to_owned())),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exists => "exists",
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
        };
        write!(f, "{s}")
    }
}

impl Comparator {
    /// Whether this comparator needs a literal `value` to compare against.
    #[must_use]
    pub fn requires_value(self) -> bool {
        !matches!(self, Self::Exists)
    }

    /// Evaluate the comparator.
    ///
    /// `actual` is the result of the path lookup (`None` when the path does
    /// not resolve). Ordering comparators return `false` unless both sides
    /// are numeric.
    #[must_use]
    pub fn eval(self, actual: Option<&Value>, expected: Option<&Value>) -> bool {
        match self {
            Self::Exists => actual.is_some(),
            Self::Eq => matches!((actual, expected), (Some(a), Some(e)) if a == e),
            Self::Neq => !Self::Eq.eval(actual, expected),
            Self::Gt | Self::Gte | Self::Lt | Self::Lte => {
                let (Some(a), Some(e)) = (
                    actual.and_then(Value::as_f64),
                    expected.and_then(Value::as_f64),
                ) else {
                    return false;
                };
                match self {
                    Self::Gt => a > e,
                    Self::Gte => a >= e,
                    Self::Lt => a < e,
                    Self::Lte => a <= e,
                    _ => unreachable!(),
                }
            }
        }
    }
}

/// Resolve a dot path against a JSON value.
///
/// An empty path resolves to the root. Each segment descends one object
/// level; lookups into non-objects return `None`.
#[must_use]
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Flatten a JSON object into dot-keyed leaves.
///
/// Nested objects contribute joined keys (`{"a":{"b":1}}` becomes
/// `"a.b" → 1`); scalars and arrays are leaves. Non-object roots flatten to
/// a single entry under the empty key.
#[must_use]
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(value, String::new(), &mut out);
    out
}

fn flatten_into(value: &Value, prefix: String, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten_into(v, key, out);
            }
        }
        other => {
            out.insert(prefix, other.clone());
        }
    }
}
