//! Operations — 키/스캔 요청과 결과
//!
//! An [`Operation`] is one read, insert, update, delete, write, or scan
//! against a table. Before execution it is prepared into a freshly allocated
//! native descriptor ([`OperationHelper`] or [`ScanHelper`]); afterwards the
//! descriptor is reconciled into an [`OperationResult`].
//!
//! Buffer lifetime after execution:
//! - the key buffer is released for every opcode but insert
//! - the row buffer is released for every opcode but scan

use crate::config::ConnectionProperties;
use crate::dispatch::Callback;
use crate::error::{DbxError, DbxResult, SqlState};
use crate::filter::{Params, QueryPredicate};
use crate::mapping::Mapped;
pub use crate::native::{LockMode, OpCode, ScanFlags};
use crate::native::{OperationHelper, ScanHelper};
use crate::schema::record::ColumnMask;
use crate::schema::{ColumnType, Row, TableMetadata, Value};
use parking_lot::Mutex;
use std::sync::Arc;

// ════════════════════════════════════════════
// Scan requests
// ════════════════════════════════════════════

/// Options of a scan operation.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    index: Option<String>,
    predicate: Option<Arc<QueryPredicate>>,
    params: Params,
    flags: ScanFlags,
    lock_mode: LockMode,
    skip: usize,
    limit: Option<usize>,
    batch_size: Option<usize>,
}

impl ScanRequest {
    /// Full table scan with no filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan an index instead of the table.
    pub fn index(mut self, name: impl Into<String>) -> Self {
        self.index = Some(name.into());
        self
    }

    pub fn filter(mut self, predicate: Arc<QueryPredicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Return rows in index order.
    pub fn ordered(mut self) -> Self {
        self.flags.ordered = true;
        self
    }

    pub fn descending(mut self) -> Self {
        self.flags.ordered = true;
        self.flags.descending = true;
        self
    }

    pub fn lock(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Drop the first `n` matching rows.
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Return at most `n` rows after `skip`.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = Some(n);
        self
    }
}

#[derive(Debug, Clone)]
struct ScanSpec {
    index: Option<usize>,
    request: ScanRequest,
}

// ════════════════════════════════════════════
// Operations
// ════════════════════════════════════════════

/// One key or scan request.
pub struct Operation {
    opcode: OpCode,
    table: Arc<TableMetadata>,
    index: usize,
    lock_mode: LockMode,
    key: Vec<Value>,
    row: Row,
    scan: Option<ScanSpec>,
    value_object: bool,
    auto_increment: Option<u64>,
    /// Failure raised before the operation could be prepared
    failure: Option<DbxError>,
    /// Taken out before the operation is shared across worker threads
    callback: Mutex<Option<Callback<OperationResult>>>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("opcode", &self.opcode)
            .field("table", &self.table.name)
            .field("index", &self.index)
            .field("key", &self.key)
            .finish()
    }
}

impl Operation {
    fn new(opcode: OpCode, table: Arc<TableMetadata>) -> Self {
        Self {
            opcode,
            table,
            index: 0,
            lock_mode: LockMode::default(),
            key: Vec::new(),
            row: Row::default(),
            scan: None,
            value_object: false,
            auto_increment: None,
            failure: None,
            callback: Mutex::new(None),
        }
    }

    fn with_row(opcode: OpCode, table: Arc<TableMetadata>, row: Row) -> Self {
        let mut op = Self::new(opcode, table);
        op.row = row;
        op
    }

    /// Read by primary key.
    pub fn read(table: Arc<TableMetadata>, key: Vec<Value>) -> Self {
        let mut op = Self::new(OpCode::Read, table);
        op.key = key;
        op
    }

    /// Read by a unique index.
    pub fn read_by_index(table: Arc<TableMetadata>, index: &str, key: Vec<Value>) -> DbxResult<Self> {
        let position = table.index_by_name(index).ok_or_else(|| {
            DbxError::invalid_operation(
                format!("table '{}' has no index '{index}'", table.name),
                "Operation::read_by_index",
            )
        })?;
        if !table.indexes[position].unique {
            return Err(DbxError::invalid_operation(
                format!("index '{index}' is not unique; use a scan"),
                "Operation::read_by_index",
            ));
        }
        let mut op = Self::read(table, key);
        op.index = position;
        Ok(op)
    }

    pub fn insert(table: Arc<TableMetadata>, row: Row) -> Self {
        Self::with_row(OpCode::Insert, table, row)
    }

    /// Insert a mapped object.
    pub fn insert_object<T: Mapped>(table: Arc<TableMetadata>, object: &T) -> DbxResult<Self> {
        let row = object.to_row(&table)?;
        let mut op = Self::insert(table, row);
        op.value_object = true;
        Ok(op)
    }

    /// Update the supplied columns of an existing row.
    pub fn update(table: Arc<TableMetadata>, row: Row) -> Self {
        Self::with_row(OpCode::Update, table, row)
    }

    /// Insert, or update if the key exists.
    pub fn write(table: Arc<TableMetadata>, row: Row) -> Self {
        Self::with_row(OpCode::Write, table, row)
    }

    pub fn delete(table: Arc<TableMetadata>, key: Vec<Value>) -> Self {
        let mut op = Self::new(OpCode::Delete, table);
        op.key = key;
        op
    }

    /// Scan the table or one of its indexes.
    ///
    /// The filter's layout pass runs here, once per predicate tree.
    pub fn scan(table: Arc<TableMetadata>, request: ScanRequest) -> DbxResult<Self> {
        let index = match &request.index {
            Some(name) => Some(table.index_by_name(name).ok_or_else(|| {
                DbxError::invalid_operation(
                    format!("table '{}' has no index '{name}'", table.name),
                    "Operation::scan",
                )
            })?),
            None => None,
        };
        if let Some(predicate) = &request.predicate {
            predicate.filter_spec(&table)?;
        }
        let mut op = Self::new(OpCode::Scan, table);
        op.lock_mode = request.lock_mode;
        op.scan = Some(ScanSpec { index, request });
        Ok(op)
    }

    pub fn with_lock(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Callback run with this operation's result, before the transaction's.
    pub fn on_result(mut self, callback: impl FnOnce(OperationResult) + Send + 'static) -> Self {
        *self.callback.get_mut() = Some(Box::new(callback));
        self
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn table(&self) -> &Arc<TableMetadata> {
        &self.table
    }

    pub fn is_scan(&self) -> bool {
        self.opcode == OpCode::Scan
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    /// `(skip, limit)` of a scan.
    pub(crate) fn scan_window(&self) -> (usize, Option<usize>) {
        self.scan
            .as_ref()
            .map_or((0, None), |s| (s.request.skip, s.request.limit))
    }

    /// Auto-increment column this operation still needs a value for.
    pub(crate) fn needs_auto_increment(&self) -> Option<usize> {
        if !matches!(self.opcode, OpCode::Insert | OpCode::Write) || self.failure.is_some() {
            return None;
        }
        let column = self.table.auto_increment_column()?;
        match self.row.get(column) {
            Some(value) if !value.is_null() => None,
            _ => Some(column),
        }
    }

    /// Fill `column` with `value`, typed the way the column reads back.
    pub(crate) fn set_auto_increment(&mut self, column: usize, value: u64) {
        let filled = match self.table.columns.get(column).map(|c| c.column_type) {
            Some(ColumnType::UnsignedInt | ColumnType::UnsignedBigInt) | None => Value::UInt(value),
            Some(_) => i64::try_from(value).map_or(Value::UInt(value), Value::Int),
        };
        self.row.set(column, filled);
        self.auto_increment = Some(value);
    }

    pub(crate) fn fail(&mut self, err: DbxError) {
        self.failure.get_or_insert(err);
    }

    pub(crate) fn take_callback(&mut self) -> Option<Callback<OperationResult>> {
        self.callback.get_mut().take()
    }

    fn key_values(&self) -> DbxResult<Vec<Value>> {
        if !self.opcode.writes_row() {
            return Ok(self.key.clone());
        }
        let index = &self.table.indexes[self.index];
        index
            .columns
            .iter()
            .map(|&c| match self.row.get(c) {
                Some(v) if !v.is_null() => Ok(v.clone()),
                _ => Err(DbxError::encoder(
                    &self.table.columns[c].name,
                    "primary key column not set",
                    SqlState::NULL_NOT_ALLOWED,
                )),
            })
            .collect()
    }

    /// Encode the key and row buffers of a key operation.
    ///
    /// Every failing field is reported; several failures merge into one error.
    pub(crate) fn prepare_key(&self) -> DbxResult<OperationHelper> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let table = &self.table;
        let mut helper = OperationHelper::new(self.opcode, Arc::clone(table), self.index);
        helper.lock_mode = self.lock_mode;

        let mut errors = Vec::new();
        if self.opcode.writes_row() {
            let layout = table.row_layout();
            let mut buf = layout.allocate();
            let (mask, row_errors) = layout.encode_row(&table.columns, &self.row, &mut buf);
            errors.extend(row_errors);
            helper.row_buffer = Some(buf);
            helper.column_mask = mask;
        } else if self.opcode == OpCode::Read {
            helper.row_buffer = Some(table.row_layout().allocate());
            helper.column_mask = ColumnMask::all(table.columns.len());
        }

        if errors.is_empty() {
            let layout = table.key_layout(self.index)?;
            let mut key = layout.allocate();
            match self.key_values() {
                Ok(values) => errors.extend(layout.encode_key(&table.columns, &values, &mut key)),
                Err(err) => errors.push(err),
            }
            helper.key_buffer = Some(key);
        }

        if let Some(err) = DbxError::merge_encoder_errors(errors) {
            return Err(err);
        }
        if self.value_object {
            helper.is_value_object = true;
            helper.value_object = Some(self.row.clone());
        }
        helper.valid = true;
        Ok(helper)
    }

    /// Build the scan descriptor: filter program and index bounds.
    pub(crate) fn prepare_scan(&self, props: &ConnectionProperties) -> DbxResult<ScanHelper> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let spec = self.scan.as_ref().ok_or_else(|| {
            DbxError::invalid_operation("not a scan operation", "Operation::prepare_scan")
        })?;
        let request = &spec.request;
        let table = &self.table;

        let mut helper = ScanHelper::new(Arc::clone(table));
        helper.index_record = spec.index;
        helper.lock_mode = request.lock_mode;
        helper.flags = request.flags;
        helper.batch_size = request
            .batch_size
            .unwrap_or_else(|| usize::try_from(props.scan_batch_size).unwrap_or(usize::MAX));
        helper.parallelism = usize::try_from(props.scan_parallelism).unwrap_or(usize::MAX);

        if let Some(predicate) = &request.predicate {
            helper.filter = Some(predicate.program(table, &request.params)?);
            if let Some(index) = spec.index.map(|i| &table.indexes[i])
                && index.ordered
                && let Some(&first) = index.columns.first()
            {
                let line = predicate.bounds(&table.columns[first].name, &request.params);
                if !line.is_full() {
                    helper.bounds = Some(line);
                }
            }
        }
        Ok(helper)
    }

    /// Decode scan rows fetched from the native layer.
    pub(crate) fn decode_scan_row(&self, buf: &[u8]) -> DbxResult<Row> {
        self.table
            .row_layout()
            .decode_row(&self.table.columns, buf, None)
    }

    /// Reconcile an executed key operation into its result.
    pub(crate) fn complete(&self, helper: Option<OperationHelper>, error: Option<DbxError>) -> OperationResult {
        let mut result = OperationResult::new(self, error);
        let Some(mut helper) = helper else {
            return result;
        };

        if result.error.is_none() && self.opcode == OpCode::Read {
            if let Some(buf) = &helper.row_buffer {
                match self
                    .table
                    .row_layout()
                    .decode_row(&self.table.columns, buf, Some(&helper.column_mask))
                {
                    Ok(row) => result.value = Some(row),
                    Err(err) => result.fail(err),
                }
            }
        }

        release_buffers(&mut helper);
        if let Some(key) = &helper.key_buffer {
            result.key = self
                .table
                .key_layout(self.index)
                .and_then(|layout| layout.decode_key(&self.table.columns, key))
                .ok();
        }
        if self.opcode.writes_row() && result.error.is_none() {
            result.value = helper.value_object.take().or_else(|| Some(self.row.clone()));
        }
        result
    }

    /// Result of a scan from its accumulated rows.
    pub(crate) fn complete_scan(&self, rows: Vec<Row>, error: Option<DbxError>) -> OperationResult {
        let mut result = OperationResult::new(self, error);
        result.rows = rows;
        result
    }
}

/// Drop the buffers a finished operation no longer needs.
pub(crate) fn release_buffers(helper: &mut OperationHelper) {
    if helper.opcode != OpCode::Insert {
        helper.key_buffer = None;
    }
    if helper.opcode != OpCode::Scan {
        helper.row_buffer = None;
    }
}

// ════════════════════════════════════════════
// Results
// ════════════════════════════════════════════

/// Outcome of one operation.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub opcode: OpCode,
    pub table: Arc<TableMetadata>,
    pub success: bool,
    pub error: Option<DbxError>,
    /// Row read, or row written
    pub value: Option<Row>,
    /// Rows returned by a scan
    pub rows: Vec<Row>,
    /// Primary key of an inserted row
    pub key: Option<Vec<Value>>,
    /// Auto-increment value assigned to an inserted row
    pub auto_increment: Option<u64>,
}

impl OperationResult {
    fn new(op: &Operation, error: Option<DbxError>) -> Self {
        Self {
            opcode: op.opcode,
            table: Arc::clone(&op.table),
            success: error.is_none(),
            error,
            value: None,
            rows: Vec::new(),
            key: None,
            auto_increment: op.auto_increment,
        }
    }

    fn fail(&mut self, err: DbxError) {
        self.success = false;
        self.error = Some(err);
    }

    /// `Ok(self)` on success, the operation's error otherwise.
    pub fn into_result(self) -> DbxResult<Self> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Map the row read (or written) into `T`.
    pub fn decode<T: Mapped>(&self) -> DbxResult<T> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let row = self.value.as_ref().ok_or_else(|| {
            DbxError::invalid_operation(
                format!("{} result carries no row", self.opcode.as_str()),
                "OperationResult::decode",
            )
        })?;
        T::from_row(&self.table, row)
    }

    /// Map every scanned row into `T`.
    pub fn decode_all<T: Mapped>(&self) -> DbxResult<Vec<T>> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        self.rows
            .iter()
            .map(|row| T::from_row(&self.table, row))
            .collect()
    }
}
