//! Native Boundary — 스토리지 엔진 클라이언트 라이브러리 경계
//!
//! The driver never talks to the storage engine directly; it calls these
//! traits. Every method is blocking and must only be invoked through the
//! [`CallQueue`](crate::queue::CallQueue) of the handle it belongs to, so a
//! connection or session handle never sees two calls at once.
//!
//! Per-call descriptors ([`OperationHelper`], [`ScanHelper`]) are allocated
//! fresh for every call and owned by that call alone.

pub mod memory;

use crate::error::NativeError;
use crate::filter::bounds::NumberLine;
use crate::filter::compiler::FilterProgram;
use crate::schema::record::ColumnMask;
use crate::schema::{Row, TableMetadata};
use std::sync::Arc;

/// Result of a native call.
pub type NativeResult<T> = Result<T, NativeError>;

/// Execution mode of a native execute call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecMode {
    /// Run the operations, keep the transaction open
    NoCommit,
    Commit,
    Rollback,
}

impl ExecMode {
    /// Commit and rollback both end the transaction.
    pub fn closes_transaction(&self) -> bool {
        !matches!(self, ExecMode::NoCommit)
    }
}

/// Row lock taken by a read or scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockMode {
    Exclusive,
    #[default]
    Shared,
    /// Latest committed version, no lock
    CommittedRead,
}

/// Kind of a key or scan operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Read,
    Insert,
    Update,
    Delete,
    Write,
    Scan,
}

impl OpCode {
    pub fn is_read(&self) -> bool {
        matches!(self, OpCode::Read | OpCode::Scan)
    }

    /// Operations that carry an encoded row buffer into the call.
    pub fn writes_row(&self) -> bool {
        matches!(self, OpCode::Insert | OpCode::Update | OpCode::Write)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::Read => "read",
            OpCode::Insert => "insert",
            OpCode::Update => "update",
            OpCode::Delete => "delete",
            OpCode::Write => "write",
            OpCode::Scan => "scan",
        }
    }
}

/// Native transaction context slot owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

/// Open scan cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanId(pub u64);

/// Descriptor of one key operation handed to [`NativeSession::execute`].
#[derive(Debug, Clone)]
pub struct OperationHelper {
    pub opcode: OpCode,
    /// Row record: the table whose row layout encodes `row_buffer`
    pub row_record: Arc<TableMetadata>,
    /// Key record: index into `row_record.indexes` used by `key_buffer`
    pub key_record: usize,
    pub lock_mode: LockMode,
    pub key_buffer: Option<Vec<u8>>,
    pub row_buffer: Option<Vec<u8>>,
    /// Columns present in `row_buffer`
    pub column_mask: ColumnMask,
    /// Snapshot of the application object the row was built from
    pub value_object: Option<Row>,
    pub is_value_object: bool,
    /// Set once every buffer the opcode needs has been encoded
    pub valid: bool,
    /// Per-operation outcome written by the native layer
    pub error: Option<NativeError>,
}

impl OperationHelper {
    pub fn new(opcode: OpCode, row_record: Arc<TableMetadata>, key_record: usize) -> Self {
        Self {
            opcode,
            row_record,
            key_record,
            lock_mode: LockMode::default(),
            key_buffer: None,
            row_buffer: None,
            column_mask: ColumnMask::default(),
            value_object: None,
            is_value_object: false,
            valid: false,
            error: None,
        }
    }
}

/// Scan ordering flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanFlags {
    /// Return rows in index order
    pub ordered: bool,
    pub descending: bool,
}

/// Descriptor of one scan handed to [`NativeSession::open_scan`].
#[derive(Debug, Clone)]
pub struct ScanHelper {
    pub table_record: Arc<TableMetadata>,
    /// Index scanned, `None` for a full table scan
    pub index_record: Option<usize>,
    pub lock_mode: LockMode,
    /// Ranges on the first index column; `None` scans the whole index
    pub bounds: Option<NumberLine>,
    pub flags: ScanFlags,
    /// Rows per fetch, 0 for the native default
    pub batch_size: usize,
    /// Fragments scanned in parallel, 0 for all
    pub parallelism: usize,
    pub filter: Option<Arc<FilterProgram>>,
}

impl ScanHelper {
    pub fn new(table_record: Arc<TableMetadata>) -> Self {
        Self {
            table_record,
            index_record: None,
            lock_mode: LockMode::default(),
            bounds: None,
            flags: ScanFlags::default(),
            batch_size: 0,
            parallelism: 0,
            filter: None,
        }
    }
}

/// Status of a fetch from an open scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Rows were returned and the local cache still holds more
    More,
    /// The local cache is drained; fetch again to pull the next batch
    CacheEmpty,
    /// The scan is exhausted
    End,
}

/// One batch of encoded rows from a scan, in the table's row layout.
#[derive(Debug, Clone)]
pub struct FetchBatch {
    pub rows: Vec<Vec<u8>>,
    pub status: FetchStatus,
}

/// Entry point of the native client library.
pub trait NativeDriver: Send + Sync {
    /// One-time library initialization.
    fn initialize(&self) -> NativeResult<()>;

    fn connect(&self, connect_string: &str) -> NativeResult<Arc<dyn NativeConnection>>;
}

/// One physical cluster connection.
pub trait NativeConnection: Send + Sync {
    /// Block until the cluster accepts requests, or the timeout expires.
    fn wait_until_ready(&self, timeout_ms: u64) -> NativeResult<()>;

    fn disconnect(&self) -> NativeResult<()>;

    fn open_session(&self, database: &str) -> NativeResult<Arc<dyn NativeSession>>;

    fn list_tables(&self, database: &str) -> NativeResult<Vec<String>>;

    fn get_table(&self, database: &str, name: &str) -> NativeResult<TableMetadata>;

    fn close_table(&self, table: &TableMetadata) -> NativeResult<()>;

    /// Reserve `count` consecutive auto-increment values for `table`.
    fn fetch_auto_increment(&self, table: &TableMetadata, count: u64) -> NativeResult<Vec<u64>>;
}

/// A native session: owns transaction contexts and scans.
pub trait NativeSession: Send + Sync {
    /// Run key operations in the transaction bound to `ctx`.
    ///
    /// Per-operation failures are written to each helper's `error`; the
    /// returned error is the transaction-level outcome. A transaction-level
    /// error discards everything staged under `ctx`.
    fn execute(
        &self,
        ctx: ContextId,
        operations: &mut [OperationHelper],
        mode: ExecMode,
    ) -> NativeResult<()>;

    fn open_scan(&self, ctx: ContextId, scan: &ScanHelper) -> NativeResult<ScanId>;

    fn fetch(&self, scan: ScanId, max_rows: usize) -> NativeResult<FetchBatch>;

    fn close_scan(&self, scan: ScanId) -> NativeResult<()>;

    fn close(&self) -> NativeResult<()>;
}
