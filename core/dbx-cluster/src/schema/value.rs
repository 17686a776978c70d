//! Values and rows exchanged with the application.

use std::cmp::Ordering;
use std::fmt;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Microseconds since the Unix epoch
    Timestamp(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Bool(v) => Some(*v as i128),
            Value::Int(v) => Some(*v as i128),
            Value::UInt(v) => Some(*v as i128),
            Value::Timestamp(v) => Some(*v as i128),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            Value::UInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Order two values of compatible kinds.
    ///
    /// Integers of either signedness compare exactly; a float against an
    /// integer compares as floats. Text and bytes compare lexicographically.
    /// Nulls and mixed families are unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Float(_), _) | (_, Value::Float(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Bytes(b)) => Some(a.as_bytes().cmp(b.as_slice())),
            (Value::Bytes(a), Value::Text(b)) => Some(a.as_slice().cmp(b.as_bytes())),
            _ => Some(self.as_i128()?.cmp(&other.as_i128()?)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "'{v}'"),
            Value::Bytes(v) => write!(f, "x'{}'", v.iter().map(|b| format!("{b:02x}")).collect::<String>()),
            Value::Timestamp(v) => write!(f, "ts({v})"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// One row, positionally aligned with the table's columns.
///
/// `None` means "not supplied" and keeps the column out of the presence
/// mask; `Some(Value::Null)` is an explicit null.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<Option<Value>>,
}

impl Row {
    pub fn with_columns(count: usize) -> Self {
        Self {
            values: vec![None; count],
        }
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            values: values.into_iter().map(Some).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx).and_then(|v| v.as_ref())
    }

    pub fn is_set(&self, idx: usize) -> bool {
        self.get(idx).is_some()
    }

    pub fn set(&mut self, idx: usize, value: Value) {
        if idx >= self.values.len() {
            self.values.resize(idx + 1, None);
        }
        self.values[idx] = Some(value);
    }

    pub fn unset(&mut self, idx: usize) {
        if let Some(slot) = self.values.get_mut(idx) {
            *slot = None;
        }
    }

    pub fn take(&mut self, idx: usize) -> Option<Value> {
        self.values.get_mut(idx).and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Value)> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(idx, v)| v.as_ref().map(|v| (idx, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_integer_compare() {
        assert_eq!(Value::Int(-1).compare(&Value::UInt(0)), Some(Ordering::Less));
        assert_eq!(Value::UInt(u64::MAX).compare(&Value::Int(i64::MAX)), Some(Ordering::Greater));
        assert_eq!(Value::Int(3).compare(&Value::Float(2.5)), Some(Ordering::Greater));
    }

    #[test]
    fn test_unordered_families() {
        assert_eq!(Value::Int(1).compare(&Value::Text("1".into())), None);
        assert_eq!(Value::Null.compare(&Value::Null), None);
    }

    #[test]
    fn test_row_presence() {
        let mut row = Row::with_columns(3);
        row.set(1, Value::Null);
        assert!(!row.is_set(0));
        assert!(row.is_set(1));
        row.set(4, Value::Int(9));
        assert_eq!(row.len(), 5);
        assert_eq!(row.iter().map(|(i, _)| i).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(row.take(4), Some(Value::Int(9)));
        assert!(!row.is_set(4));
    }
}
