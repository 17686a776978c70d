//! Byte encoders and type converters
//!
//! All fixed-width numbers are little-endian. `Char(n)` is space padded;
//! `Varchar`/`Varbinary` carry a 1- or 2-byte little-endian length prefix.

use super::{ColumnMetadata, ColumnType, Value};
use crate::error::{DbxError, DbxResult, SqlState};
use std::fmt::Debug;

/// Application-side conversion applied before encoding and after decoding.
pub trait TypeConverter: Debug + Send + Sync {
    /// Application value → storage value.
    fn to_db(&self, value: &Value) -> DbxResult<Value>;
    /// Storage value → application value.
    fn from_db(&self, value: Value) -> DbxResult<Value>;
}

/// Stores booleans in an integer column as 0/1.
#[derive(Debug, Default, Clone, Copy)]
pub struct BooleanConverter;

impl TypeConverter for BooleanConverter {
    fn to_db(&self, value: &Value) -> DbxResult<Value> {
        match value {
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Int(0 | 1) | Value::UInt(0 | 1) => Ok(value.clone()),
            other => Err(DbxError::Serialization(format!(
                "cannot store {} as boolean",
                other.kind()
            ))),
        }
    }

    fn from_db(&self, value: Value) -> DbxResult<Value> {
        match value {
            Value::Null => Ok(Value::Null),
            other => Ok(Value::Bool(other.as_i128().unwrap_or(0) != 0)),
        }
    }
}

/// Stores JSON documents in a string column, normalized to compact form.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonConverter;

impl TypeConverter for JsonConverter {
    fn to_db(&self, value: &Value) -> DbxResult<Value> {
        match value {
            Value::Text(text) => {
                let doc: serde_json::Value = serde_json::from_str(text)?;
                Ok(Value::Text(serde_json::to_string(&doc)?))
            }
            other => Err(DbxError::Serialization(format!(
                "cannot store {} as JSON",
                other.kind()
            ))),
        }
    }

    fn from_db(&self, value: Value) -> DbxResult<Value> {
        if let Value::Text(text) = &value {
            serde_json::from_str::<serde_json::Value>(text)?;
        }
        Ok(value)
    }
}

fn mismatch(meta: &ColumnMetadata, value: &Value) -> DbxError {
    DbxError::encoder(
        &meta.name,
        format!("cannot encode {} into {:?}", value.kind(), meta.column_type),
        SqlState::DATA_EXCEPTION,
    )
}

fn out_of_range(meta: &ColumnMetadata, value: &Value) -> DbxError {
    DbxError::encoder(
        &meta.name,
        format!("value {value} out of range for {:?}", meta.column_type),
        SqlState::OUT_OF_RANGE,
    )
}

fn integer(meta: &ColumnMetadata, value: &Value, min: i128, max: i128) -> DbxResult<i128> {
    let v = match value {
        Value::Int(_) | Value::UInt(_) | Value::Bool(_) => value.as_i128(),
        _ => None,
    }
    .ok_or_else(|| mismatch(meta, value))?;
    if v < min || v > max {
        return Err(out_of_range(meta, value));
    }
    Ok(v)
}

fn put_bytes(meta: &ColumnMetadata, bytes: &[u8], max: u16, out: &mut [u8]) -> DbxResult<()> {
    if bytes.len() > max as usize {
        return Err(DbxError::encoder(
            &meta.name,
            format!("{} bytes exceed column width {max}", bytes.len()),
            SqlState::STRING_TOO_LONG,
        ));
    }
    let prefix = meta.column_type.length_prefix();
    if prefix == 1 {
        out[0] = bytes.len() as u8;
    } else {
        out[..2].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
    }
    out[prefix..prefix + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Encode a non-null value into its slot.
pub fn encode_into(meta: &ColumnMetadata, value: &Value, out: &mut [u8]) -> DbxResult<()> {
    match meta.column_type {
        ColumnType::TinyInt => {
            let v = integer(meta, value, i8::MIN as i128, i8::MAX as i128)?;
            out[0] = (v as i8) as u8;
        }
        ColumnType::SmallInt => {
            let v = integer(meta, value, i16::MIN as i128, i16::MAX as i128)?;
            out.copy_from_slice(&(v as i16).to_le_bytes());
        }
        ColumnType::Int => {
            let v = integer(meta, value, i32::MIN as i128, i32::MAX as i128)?;
            out.copy_from_slice(&(v as i32).to_le_bytes());
        }
        ColumnType::BigInt => {
            let v = integer(meta, value, i64::MIN as i128, i64::MAX as i128)?;
            out.copy_from_slice(&(v as i64).to_le_bytes());
        }
        ColumnType::UnsignedInt => {
            let v = integer(meta, value, 0, u32::MAX as i128)?;
            out.copy_from_slice(&(v as u32).to_le_bytes());
        }
        ColumnType::UnsignedBigInt => {
            let v = integer(meta, value, 0, u64::MAX as i128)?;
            out.copy_from_slice(&(v as u64).to_le_bytes());
        }
        ColumnType::Float => {
            let v = value.as_f64().ok_or_else(|| mismatch(meta, value))?;
            if v.is_finite() && v.abs() > f32::MAX as f64 {
                return Err(out_of_range(meta, value));
            }
            out.copy_from_slice(&(v as f32).to_le_bytes());
        }
        ColumnType::Double => {
            let v = value.as_f64().ok_or_else(|| mismatch(meta, value))?;
            out.copy_from_slice(&v.to_le_bytes());
        }
        ColumnType::Timestamp => {
            let v = match value {
                Value::Timestamp(v) | Value::Int(v) => *v,
                _ => return Err(mismatch(meta, value)),
            };
            out.copy_from_slice(&v.to_le_bytes());
        }
        ColumnType::Char(len) => {
            let Value::Text(text) = value else {
                return Err(mismatch(meta, value));
            };
            let bytes = text.as_bytes();
            if bytes.len() > len as usize {
                return Err(DbxError::encoder(
                    &meta.name,
                    format!("{} bytes exceed column width {len}", bytes.len()),
                    SqlState::STRING_TOO_LONG,
                ));
            }
            out[..bytes.len()].copy_from_slice(bytes);
            out[bytes.len()..].fill(b' ');
        }
        ColumnType::Varchar(len) => {
            let Value::Text(text) = value else {
                return Err(mismatch(meta, value));
            };
            put_bytes(meta, text.as_bytes(), len, out)?;
        }
        ColumnType::Varbinary(len) => {
            let bytes = match value {
                Value::Bytes(b) => b.as_slice(),
                Value::Text(t) => t.as_bytes(),
                _ => return Err(mismatch(meta, value)),
            };
            put_bytes(meta, bytes, len, out)?;
        }
    }
    Ok(())
}

fn corrupt(meta: &ColumnMetadata, detail: &str) -> DbxError {
    DbxError::Serialization(format!("column '{}': {detail}", meta.name))
}

fn fixed<const N: usize>(meta: &ColumnMetadata, bytes: &[u8]) -> DbxResult<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| corrupt(meta, "short slot"))
}

fn get_bytes<'a>(meta: &ColumnMetadata, bytes: &'a [u8]) -> DbxResult<&'a [u8]> {
    let prefix = meta.column_type.length_prefix();
    let len = if prefix == 1 {
        *bytes.first().ok_or_else(|| corrupt(meta, "missing length"))? as usize
    } else {
        u16::from_le_bytes(fixed::<2>(meta, bytes)?) as usize
    };
    bytes
        .get(prefix..prefix + len)
        .ok_or_else(|| corrupt(meta, "length prefix beyond slot"))
}

/// Decode a non-null value from its slot.
pub fn decode_from(meta: &ColumnMetadata, bytes: &[u8]) -> DbxResult<Value> {
    let value = match meta.column_type {
        ColumnType::TinyInt => Value::Int(i8::from_le_bytes(fixed(meta, bytes)?) as i64),
        ColumnType::SmallInt => Value::Int(i16::from_le_bytes(fixed(meta, bytes)?) as i64),
        ColumnType::Int => Value::Int(i32::from_le_bytes(fixed(meta, bytes)?) as i64),
        ColumnType::BigInt => Value::Int(i64::from_le_bytes(fixed(meta, bytes)?)),
        ColumnType::UnsignedInt => Value::UInt(u32::from_le_bytes(fixed(meta, bytes)?) as u64),
        ColumnType::UnsignedBigInt => Value::UInt(u64::from_le_bytes(fixed(meta, bytes)?)),
        ColumnType::Float => Value::Float(f32::from_le_bytes(fixed(meta, bytes)?) as f64),
        ColumnType::Double => Value::Float(f64::from_le_bytes(fixed(meta, bytes)?)),
        ColumnType::Timestamp => Value::Timestamp(i64::from_le_bytes(fixed(meta, bytes)?)),
        ColumnType::Char(_) => {
            let text = std::str::from_utf8(bytes).map_err(|_| corrupt(meta, "invalid utf-8"))?;
            Value::Text(text.trim_end_matches(' ').to_string())
        }
        ColumnType::Varchar(_) => {
            let raw = get_bytes(meta, bytes)?;
            let text = std::str::from_utf8(raw).map_err(|_| corrupt(meta, "invalid utf-8"))?;
            Value::Text(text.to_string())
        }
        ColumnType::Varbinary(_) => Value::Bytes(get_bytes(meta, bytes)?.to_vec()),
    };
    Ok(value)
}
