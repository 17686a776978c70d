//! Table, column, and index metadata as published by the cluster dictionary.

pub mod encoding;
pub mod record;
pub mod value;

pub use encoding::{BooleanConverter, JsonConverter, TypeConverter};
pub use record::RecordLayout;
pub use value::{Row, Value};

use crate::error::{DbxError, DbxResult};
use std::sync::Arc;

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    UnsignedInt,
    UnsignedBigInt,
    Float,
    Double,
    /// Fixed-width, space padded
    Char(u16),
    Varchar(u16),
    Varbinary(u16),
    Timestamp,
}

impl ColumnType {
    /// Bytes occupied in a record, including any length prefix.
    pub fn encoded_width(&self) -> usize {
        match self {
            ColumnType::TinyInt => 1,
            ColumnType::SmallInt => 2,
            ColumnType::Int | ColumnType::UnsignedInt | ColumnType::Float => 4,
            ColumnType::BigInt
            | ColumnType::UnsignedBigInt
            | ColumnType::Double
            | ColumnType::Timestamp => 8,
            ColumnType::Char(len) => *len as usize,
            ColumnType::Varchar(len) | ColumnType::Varbinary(len) => {
                self.length_prefix() + *len as usize
            }
        }
    }

    /// Length prefix of variable-width columns: 1 byte up to 255, else 2.
    pub fn length_prefix(&self) -> usize {
        match self {
            ColumnType::Varchar(len) | ColumnType::Varbinary(len) => {
                if *len < 256 {
                    1
                } else {
                    2
                }
            }
            _ => 0,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ColumnType::TinyInt
                | ColumnType::SmallInt
                | ColumnType::Int
                | ColumnType::BigInt
                | ColumnType::UnsignedInt
                | ColumnType::UnsignedBigInt
        )
    }

    pub fn is_string(&self) -> bool {
        matches!(self, ColumnType::Char(_) | ColumnType::Varchar(_))
    }
}

/// Column metadata.
#[derive(Debug, Clone)]
pub struct ColumnMetadata {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    /// Optional application-side converter applied before byte encoding
    pub converter: Option<Arc<dyn TypeConverter>>,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            converter: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn TypeConverter>) -> Self {
        self.converter = Some(converter);
        self
    }
}

/// Index metadata. Index 0 of a table is always its primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMetadata {
    pub name: String,
    /// Positions in the table's column list
    pub columns: Vec<usize>,
    pub unique: bool,
    /// Ordered (range-scannable) rather than hash-only
    pub ordered: bool,
}

/// Table metadata plus precomputed record layouts.
#[derive(Debug, Clone)]
pub struct TableMetadata {
    pub database: String,
    pub name: String,
    pub columns: Vec<ColumnMetadata>,
    pub indexes: Vec<IndexMetadata>,
    /// Native dictionary handle, released by `close_table`
    pub handle: u64,
    row_layout: RecordLayout,
    key_layouts: Vec<RecordLayout>,
}

impl TableMetadata {
    /// Build table metadata. The primary key index is derived from the
    /// columns flagged `primary_key`; `secondary` lists further indexes.
    pub fn new(
        database: impl Into<String>,
        name: impl Into<String>,
        columns: Vec<ColumnMetadata>,
        secondary: Vec<IndexMetadata>,
    ) -> DbxResult<Self> {
        let name = name.into();
        let pk: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(idx, _)| idx)
            .collect();
        if pk.is_empty() {
            return Err(DbxError::invalid_operation(
                format!("table '{name}' has no primary key"),
                "TableMetadata::new",
            ));
        }
        if columns.iter().filter(|c| c.auto_increment).count() > 1 {
            return Err(DbxError::invalid_operation(
                format!("table '{name}' declares more than one auto-increment column"),
                "TableMetadata::new",
            ));
        }

        let mut indexes = Vec::with_capacity(secondary.len() + 1);
        indexes.push(IndexMetadata {
            name: "PRIMARY".to_string(),
            columns: pk,
            unique: true,
            ordered: true,
        });
        for index in secondary {
            if let Some(bad) = index.columns.iter().find(|&&c| c >= columns.len()) {
                return Err(DbxError::invalid_operation(
                    format!("index '{}' references column {bad}", index.name),
                    "TableMetadata::new",
                ));
            }
            indexes.push(index);
        }

        let all: Vec<usize> = (0..columns.len()).collect();
        let row_layout = RecordLayout::new(&columns, &all);
        let key_layouts = indexes
            .iter()
            .map(|index| RecordLayout::new(&columns, &index.columns))
            .collect();

        Ok(Self {
            database: database.into(),
            name,
            columns,
            indexes,
            handle: 0,
            row_layout,
            key_layouts,
        })
    }

    pub fn with_handle(mut self, handle: u64) -> Self {
        self.handle = handle;
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn require_column(&self, name: &str) -> DbxResult<usize> {
        self.column_index(name).ok_or_else(|| DbxError::ColumnNotFound {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }

    pub fn index_by_name(&self, name: &str) -> Option<usize> {
        self.indexes.iter().position(|i| i.name == name)
    }

    pub fn auto_increment_column(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.auto_increment)
    }

    pub fn row_layout(&self) -> &RecordLayout {
        &self.row_layout
    }

    pub fn key_layout(&self, index: usize) -> DbxResult<&RecordLayout> {
        self.key_layouts.get(index).ok_or_else(|| {
            DbxError::invalid_operation(
                format!("index {index} out of range for table '{}'", self.name),
                "TableMetadata::key_layout",
            )
        })
    }

    pub fn primary_key(&self) -> &IndexMetadata {
        &self.indexes[0]
    }
}
