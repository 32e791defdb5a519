use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per-row property values, keyed by the property's short name.
pub type RowValues = BTreeMap<String, Value>;

/// Row storage for a line collection: row id -> property values.
///
/// Rows are ordered by id, which makes "collection-row order" deterministic
/// for filter evaluation and structural notifications.
pub type RowMap = BTreeMap<String, RowValues>;

/// Versioned, JSON-friendly representation of an aspect value.
///
/// The enum uses an explicit `{type, value}` tagged layout so persisted blobs
/// stay stable across releases.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Empty / unset value.
    Empty,
    /// IEEE-754 double precision number.
    Number(f64),
    /// Boolean, typically produced by predicate formulas.
    Bool(bool),
    /// Plain string.
    Text(String),
    /// Row storage of a line collection (persisted verbatim).
    Rows(RowMap),
    /// Ordered list of row ids, produced by line filters.
    Ids(Vec<String>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Empty
    }
}

impl Value {
    /// Returns true if the value is [`Value::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    /// Numeric view of the value, if it has one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(t) => t.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// The value interpreted as an aspect name (references resolve through these).
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }

    /// Row storage view, if this is a [`Value::Rows`].
    pub fn as_rows(&self) -> Option<&RowMap> {
        match self {
            Value::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Truthiness used by filter predicates: non-zero numbers, `true`,
    /// and non-empty text are truthy; everything else is falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Empty => false,
            Value::Number(n) => *n != 0.0,
            Value::Bool(b) => *b,
            Value::Text(t) => !t.is_empty(),
            Value::Rows(rows) => !rows.is_empty(),
            Value::Ids(ids) => !ids.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => Ok(()),
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Text(t) => write!(f, "{t}"),
            Value::Rows(rows) => write!(f, "<{} rows>", rows.len()),
            Value::Ids(ids) => write!(f, "[{}]", ids.join(", ")),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

/// Declared data type of an aspect, used to coerce external edits and defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Whole numbers; fractional input is truncated.
    Numeric,
    /// Floating-point numbers.
    Decimal,
    /// Free text.
    Text,
    /// No declared type; values pass through unchanged.
    Unset,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Unset
    }
}

impl DataType {
    /// Coerce `value` into this data type.
    ///
    /// Unparseable input is returned unchanged; the caller decides whether
    /// that is worth reporting.
    pub fn coerce(self, value: Value) -> Value {
        match self {
            DataType::Numeric => match value.as_number() {
                Some(n) => Value::Number(n.trunc()),
                None => value,
            },
            DataType::Decimal => match value.as_number() {
                Some(n) => Value::Number(n),
                None => value,
            },
            DataType::Text => match value {
                Value::Text(_) => value,
                Value::Empty => Value::Text(String::new()),
                other => Value::Text(other.to_string()),
            },
            DataType::Unset => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn numeric_coercion_truncates() {
        assert_eq!(
            DataType::Numeric.coerce(Value::Text("4.7".into())),
            Value::Number(4.0)
        );
        assert_eq!(DataType::Numeric.coerce(Value::Number(3.2)), Value::Number(3.0));
    }

    #[test]
    fn unparseable_input_passes_through() {
        assert_eq!(
            DataType::Decimal.coerce(Value::Text("elf".into())),
            Value::Text("elf".into())
        );
    }

    #[test]
    fn value_round_trips_through_json() {
        let mut rows = RowMap::new();
        rows.insert("1".into(), RowValues::from([("qty".into(), Value::Number(2.0))]));
        let value = Value::Rows(rows);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&json).unwrap(), value);
    }

    #[test]
    fn truthiness_matches_predicate_expectations() {
        assert!(Value::Number(0.5).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::Empty.is_truthy());
        assert!(Value::Text("x".into()).is_truthy());
    }
}
