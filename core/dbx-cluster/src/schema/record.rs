//! Record layouts — byte layout of row and key buffers
//!
//! ```text
//! [ null bitmap (1 bit per nullable member) ][ slot 0 ][ slot 1 ] ...
//! ```
//!
//! Every member column gets a fixed-width slot; variable-width columns carry
//! their length prefix inside the slot.

use super::encoding::{decode_from, encode_into};
use super::{ColumnMetadata, Row, Value};
use crate::error::{DbxError, DbxResult, SqlState};
use smallvec::SmallVec;

/// Position of one member column inside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlot {
    /// Position in the table's column list
    pub column: usize,
    pub offset: usize,
    pub width: usize,
    pub null_bit: Option<usize>,
}

/// Set of columns present in a row buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMask {
    words: SmallVec<[u64; 2]>,
}

impl ColumnMask {
    pub fn set(&mut self, column: usize) {
        let word = column / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (column % 64);
    }

    pub fn contains(&self, column: usize) -> bool {
        self.words
            .get(column / 64)
            .is_some_and(|w| w & (1u64 << (column % 64)) != 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn all(columns: usize) -> Self {
        let mut mask = Self::default();
        for c in 0..columns {
            mask.set(c);
        }
        mask
    }
}

/// Byte layout of a record built from a subset of a table's columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    slots: Vec<FieldSlot>,
    null_bytes: usize,
    size: usize,
}

impl RecordLayout {
    pub fn new(columns: &[ColumnMetadata], members: &[usize]) -> Self {
        let nullable = members.iter().filter(|&&c| columns[c].nullable).count();
        let null_bytes = nullable.div_ceil(8);

        let mut offset = null_bytes;
        let mut next_bit = 0;
        let mut slots = Vec::with_capacity(members.len());
        for &column in members {
            let meta = &columns[column];
            let width = meta.column_type.encoded_width();
            let null_bit = meta.nullable.then(|| {
                next_bit += 1;
                next_bit - 1
            });
            slots.push(FieldSlot {
                column,
                offset,
                width,
                null_bit,
            });
            offset += width;
        }

        Self {
            slots,
            null_bytes,
            size: offset,
        }
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn slots(&self) -> &[FieldSlot] {
        &self.slots
    }

    pub fn slot_for(&self, column: usize) -> Option<&FieldSlot> {
        self.slots.iter().find(|s| s.column == column)
    }

    /// Zero-filled buffer of the right size.
    pub fn allocate(&self) -> Vec<u8> {
        vec![0u8; self.size]
    }

    fn set_null(&self, buf: &mut [u8], slot: &FieldSlot, null: bool) {
        if let Some(bit) = slot.null_bit {
            let mask = 1u8 << (bit % 8);
            if null {
                buf[bit / 8] |= mask;
            } else {
                buf[bit / 8] &= !mask;
            }
        }
    }

    pub fn is_null(&self, buf: &[u8], slot: &FieldSlot) -> bool {
        slot.null_bit
            .is_some_and(|bit| buf.get(bit / 8).is_some_and(|b| b & (1u8 << (bit % 8)) != 0))
    }

    /// Encode one field: null bit, else converter then byte encoder.
    pub fn encode_field(
        &self,
        columns: &[ColumnMetadata],
        slot: &FieldSlot,
        value: &Value,
        buf: &mut [u8],
    ) -> DbxResult<()> {
        let meta = &columns[slot.column];
        let converted;
        let value = match &meta.converter {
            Some(converter) if !value.is_null() => {
                converted = converter.to_db(value).map_err(|e| {
                    DbxError::encoder(&meta.name, e.to_string(), SqlState::DATA_EXCEPTION)
                })?;
                &converted
            }
            _ => value,
        };

        if value.is_null() {
            if slot.null_bit.is_none() {
                return Err(DbxError::encoder(
                    &meta.name,
                    "null value for non-nullable column",
                    SqlState::NULL_NOT_ALLOWED,
                ));
            }
            self.set_null(buf, slot, true);
            return Ok(());
        }

        self.set_null(buf, slot, false);
        let end = slot.offset + slot.width;
        encode_into(meta, value, &mut buf[slot.offset..end])
    }

    pub fn decode_field(
        &self,
        columns: &[ColumnMetadata],
        slot: &FieldSlot,
        buf: &[u8],
    ) -> DbxResult<Value> {
        if self.is_null(buf, slot) {
            return Ok(Value::Null);
        }
        let meta = &columns[slot.column];
        let end = slot.offset + slot.width;
        let bytes = buf.get(slot.offset..end).ok_or_else(|| {
            DbxError::Serialization(format!(
                "record of {} bytes too short for column '{}'",
                buf.len(),
                meta.name
            ))
        })?;
        let value = decode_from(meta, bytes)?;
        match &meta.converter {
            Some(converter) => converter.from_db(value),
            None => Ok(value),
        }
    }

    /// Encode every supplied column of `row`.
    ///
    /// Each failing field yields its own error; the other fields are still
    /// encoded so that all problems are reported together.
    pub fn encode_row(
        &self,
        columns: &[ColumnMetadata],
        row: &Row,
        buf: &mut [u8],
    ) -> (ColumnMask, Vec<DbxError>) {
        let mut mask = ColumnMask::default();
        let mut errors = Vec::new();
        for slot in &self.slots {
            if let Some(value) = row.get(slot.column) {
                match self.encode_field(columns, slot, value, buf) {
                    Ok(()) => mask.set(slot.column),
                    Err(err) => errors.push(err),
                }
            }
        }
        (mask, errors)
    }

    /// Decode the columns in `mask` (all members when `None`).
    pub fn decode_row(
        &self,
        columns: &[ColumnMetadata],
        buf: &[u8],
        mask: Option<&ColumnMask>,
    ) -> DbxResult<Row> {
        let mut row = Row::with_columns(columns.len());
        for slot in &self.slots {
            if mask.is_none_or(|m| m.contains(slot.column)) {
                row.set(slot.column, self.decode_field(columns, slot, buf)?);
            }
        }
        Ok(row)
    }

    /// Encode key values, given in member order.
    pub fn encode_key(
        &self,
        columns: &[ColumnMetadata],
        values: &[Value],
        buf: &mut [u8],
    ) -> Vec<DbxError> {
        if values.len() != self.slots.len() {
            return vec![DbxError::invalid_operation(
                format!(
                    "key has {} values but the index has {} columns",
                    values.len(),
                    self.slots.len()
                ),
                "RecordLayout::encode_key",
            )];
        }
        self.slots
            .iter()
            .zip(values)
            .filter_map(|(slot, value)| self.encode_field(columns, slot, value, buf).err())
            .collect()
    }

    pub fn decode_key(&self, columns: &[ColumnMetadata], buf: &[u8]) -> DbxResult<Vec<Value>> {
        self.slots
            .iter()
            .map(|slot| self.decode_field(columns, slot, buf))
            .collect()
    }

    /// Bytes of the null bitmap.
    pub fn null_bytes(&self) -> usize {
        self.null_bytes
    }
}
