//! 행 ↔ 구조체 매핑 트레이트
//!
//! `#[derive(Table)]` generates [`Mapped`] for structs with named fields;
//! every field type must implement [`IntoValue`] and [`FromValue`].

use crate::error::{DbxError, DbxResult, SqlState};
use crate::schema::{Row, TableMetadata, Value};

/// A struct stored as one row of a table.
pub trait Mapped: Sized {
    const TABLE_NAME: &'static str;

    /// Field names in declaration order.
    fn field_names() -> &'static [&'static str];

    fn to_row(&self, table: &TableMetadata) -> DbxResult<Row>;

    fn from_row(table: &TableMetadata, row: &Row) -> DbxResult<Self>;
}

/// Rust value → column value.
pub trait IntoValue {
    fn into_value(&self) -> Value;
}

/// Column value → Rust value.
pub trait FromValue: Sized {
    fn from_value(column: &str, value: &Value) -> DbxResult<Self>;
}

fn conversion_error(column: &str, expected: &str, value: &Value) -> DbxError {
    DbxError::encoder(
        column,
        format!("expected {expected}, got {}", value.kind()),
        SqlState::DATA_EXCEPTION,
    )
}

macro_rules! signed_value {
    ($($ty:ty),*) => {$(
        impl IntoValue for $ty {
            fn into_value(&self) -> Value {
                Value::Int(*self as i64)
            }
        }

        impl FromValue for $ty {
            fn from_value(column: &str, value: &Value) -> DbxResult<Self> {
                value
                    .as_i128()
                    .and_then(|v| <$ty>::try_from(v).ok())
                    .ok_or_else(|| conversion_error(column, stringify!($ty), value))
            }
        }
    )*};
}

macro_rules! unsigned_value {
    ($($ty:ty),*) => {$(
        impl IntoValue for $ty {
            fn into_value(&self) -> Value {
                Value::UInt(*self as u64)
            }
        }

        impl FromValue for $ty {
            fn from_value(column: &str, value: &Value) -> DbxResult<Self> {
                value
                    .as_i128()
                    .and_then(|v| <$ty>::try_from(v).ok())
                    .ok_or_else(|| conversion_error(column, stringify!($ty), value))
            }
        }
    )*};
}

signed_value!(i8, i16, i32, i64);
unsigned_value!(u8, u16, u32, u64);

impl IntoValue for f64 {
    fn into_value(&self) -> Value {
        Value::Float(*self)
    }
}

impl FromValue for f64 {
    fn from_value(column: &str, value: &Value) -> DbxResult<Self> {
        value
            .as_f64()
            .ok_or_else(|| conversion_error(column, "f64", value))
    }
}

impl IntoValue for f32 {
    fn into_value(&self) -> Value {
        Value::Float(*self as f64)
    }
}

impl FromValue for f32 {
    fn from_value(column: &str, value: &Value) -> DbxResult<Self> {
        value
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| conversion_error(column, "f32", value))
    }
}

impl IntoValue for bool {
    fn into_value(&self) -> Value {
        Value::Bool(*self)
    }
}

impl FromValue for bool {
    fn from_value(column: &str, value: &Value) -> DbxResult<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => other
                .as_i128()
                .map(|v| v != 0)
                .ok_or_else(|| conversion_error(column, "bool", value)),
        }
    }
}

impl IntoValue for String {
    fn into_value(&self) -> Value {
        Value::Text(self.clone())
    }
}

impl FromValue for String {
    fn from_value(column: &str, value: &Value) -> DbxResult<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => Err(conversion_error(column, "text", other)),
        }
    }
}

impl IntoValue for Vec<u8> {
    fn into_value(&self) -> Value {
        Value::Bytes(self.clone())
    }
}

impl FromValue for Vec<u8> {
    fn from_value(column: &str, value: &Value) -> DbxResult<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            other => Err(conversion_error(column, "bytes", other)),
        }
    }
}

// Option<T> 구현
impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(&self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Null,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(column: &str, value: &Value) -> DbxResult<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            Ok(Some(T::from_value(column, value)?))
        }
    }
}

/// Helper used by generated code: fetch a named column from a row.
///
/// An absent column decodes as null, so `Option` fields tolerate it.
pub fn field<T: FromValue>(table: &TableMetadata, row: &Row, name: &str) -> DbxResult<T> {
    let idx = table.require_column(name)?;
    T::from_value(name, row.get(idx).unwrap_or(&Value::Null))
}

/// Helper used by generated code: store a named field into a row.
pub fn set_field<T: IntoValue>(
    table: &TableMetadata,
    row: &mut Row,
    name: &str,
    value: &T,
) -> DbxResult<()> {
    let idx = table.require_column(name)?;
    row.set(idx, value.into_value());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrowing_is_checked() {
        assert_eq!(i8::from_value("c", &Value::Int(-5)).unwrap(), -5);
        assert!(i8::from_value("c", &Value::Int(300)).is_err());
        assert!(u32::from_value("c", &Value::Int(-1)).is_err());
    }

    #[test]
    fn test_option_handles_null() {
        assert_eq!(Option::<String>::from_value("c", &Value::Null).unwrap(), None);
        assert_eq!(Some(3i32).into_value(), Value::Int(3));
        assert_eq!(None::<i32>.into_value(), Value::Null);
    }
}
