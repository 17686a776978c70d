//! Error types for the DBX cluster driver.
//!
//! All public APIs return `DbxResult<T>` — no panics in library code.
//! Every error carries a portable [`SqlState`] so callers can match on a small
//! set of status codes instead of storage-engine specific numbers.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Portable five-character status code (SQLSTATE style).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SqlState(&'static str);

impl SqlState {
    pub const SUCCESS: SqlState = SqlState("00000");
    pub const NO_DATA_FOUND: SqlState = SqlState("02000");
    pub const CONNECTION_EXCEPTION: SqlState = SqlState("08000");
    pub const FEATURE_NOT_SUPPORTED: SqlState = SqlState("0A000");
    pub const DATA_EXCEPTION: SqlState = SqlState("22000");
    pub const STRING_TOO_LONG: SqlState = SqlState("22001");
    pub const OUT_OF_RANGE: SqlState = SqlState("22003");
    pub const NULL_NOT_ALLOWED: SqlState = SqlState("22004");
    pub const CONSTRAINT_VIOLATION: SqlState = SqlState("23000");
    pub const INVALID_TRANSACTION_STATE: SqlState = SqlState("25000");
    pub const SCHEMA_ERROR: SqlState = SqlState("42000");
    pub const INSUFFICIENT_RESOURCES: SqlState = SqlState("53000");
    pub const CONFIG_ERROR: SqlState = SqlState("F0000");
    pub const GENERIC: SqlState = SqlState("HY000");

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Storage-engine error classification, as reported by the native client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    NoError,
    ApplicationError,
    NoDataFound,
    ConstraintViolation,
    SchemaError,
    UserDefinedError,
    InsufficientSpace,
    TemporaryResourceError,
    NodeRecoveryError,
    OverloadError,
    TimeoutExpired,
    UnknownResultError,
    InternalError,
    FunctionNotImplemented,
    UnknownErrorCode,
    NodeShutdown,
    SchemaObjectExists,
    InternalTemporary,
}

impl Classification {
    /// Fixed mapping from classification to portable status.
    pub fn sql_state(&self) -> SqlState {
        match self {
            Classification::NoError => SqlState::SUCCESS,
            Classification::ApplicationError => SqlState::DATA_EXCEPTION,
            Classification::NoDataFound => SqlState::NO_DATA_FOUND,
            Classification::ConstraintViolation => SqlState::CONSTRAINT_VIOLATION,
            Classification::SchemaError | Classification::SchemaObjectExists => {
                SqlState::SCHEMA_ERROR
            }
            Classification::InsufficientSpace => SqlState::INSUFFICIENT_RESOURCES,
            Classification::TemporaryResourceError
            | Classification::NodeRecoveryError
            | Classification::OverloadError
            | Classification::TimeoutExpired
            | Classification::UnknownResultError
            | Classification::NodeShutdown
            | Classification::InternalTemporary => SqlState::CONNECTION_EXCEPTION,
            Classification::FunctionNotImplemented => SqlState::FEATURE_NOT_SUPPORTED,
            Classification::UserDefinedError
            | Classification::InternalError
            | Classification::UnknownErrorCode => SqlState::GENERIC,
        }
    }

    /// Transient classifications may succeed when the request is retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Classification::TemporaryResourceError
                | Classification::NodeRecoveryError
                | Classification::OverloadError
                | Classification::TimeoutExpired
                | Classification::InternalTemporary
        )
    }
}

/// Native storage-engine error code for a duplicate primary or unique key.
pub const DUPLICATE_KEY_CODE: i32 = 630;
/// Native storage-engine error code for a missing tuple.
pub const NO_SUCH_TUPLE_CODE: i32 = 626;
/// Native storage-engine error code for a scan that timed out.
pub const SCAN_TIMEOUT_CODE: i32 = 274;

/// Error object produced by the native client library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub code: i32,
    pub classification: Classification,
    pub message: String,
}

impl NativeError {
    pub fn new(code: i32, classification: Classification, message: impl Into<String>) -> Self {
        Self {
            code,
            classification,
            message: message.into(),
        }
    }

    pub fn duplicate_key() -> Self {
        Self::new(
            DUPLICATE_KEY_CODE,
            Classification::ConstraintViolation,
            "Tuple already existed when attempting to insert",
        )
    }

    pub fn no_such_tuple() -> Self {
        Self::new(
            NO_SUCH_TUPLE_CODE,
            Classification::NoDataFound,
            "Tuple did not exist",
        )
    }

    pub fn scan_timeout() -> Self {
        Self::new(
            SCAN_TIMEOUT_CODE,
            Classification::TimeoutExpired,
            "Time-out in scan, transaction aborted",
        )
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.code == DUPLICATE_KEY_CODE
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (code {}, {:?})",
            self.message, self.code, self.classification
        )
    }
}

/// Unified error type for all driver operations.
#[derive(Debug, Clone, Error)]
pub enum DbxError {
    /// A value could not be encoded into its column
    #[error("encoder error on column '{column}': {message}")]
    Encoder {
        column: String,
        message: String,
        status: SqlState,
    },

    /// More than one field of the same operation failed to encode
    #[error("{} fields failed to encode", .0.len())]
    MultipleEncoder(Vec<DbxError>),

    /// Error reported by the storage engine
    #[error("storage engine error: {0}")]
    Native(NativeError),

    /// Error derived from a failure on the other side of an operation/transaction pair
    #[error("indirect error: {cause}")]
    Indirect { cause: Arc<DbxError> },

    /// The connection (or the pool owning it) is closed or disconnecting
    #[error("connection to '{0}' is closed")]
    ConnectionClosed(String),

    /// The session pool is closing and cannot hand out sessions
    #[error("session pool is closed")]
    PoolClosed,

    /// Requested table does not exist
    #[error("table '{0}' not found")]
    TableNotFound(String),

    /// Column referenced by a predicate or row does not exist
    #[error("column '{column}' not found in table '{table}'")]
    ColumnNotFound { table: String, column: String },

    /// Operation not valid in the current state
    #[error("invalid operation: {message}\nContext: {context}")]
    InvalidOperation { message: String, context: String },

    /// Parameter required by a filter was not supplied
    #[error("missing parameter '{0}'")]
    MissingParameter(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// A bounded wait expired
    #[error("timed out waiting for {what} after {after_ms}ms")]
    Timeout { what: String, after_ms: u64 },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Standard I/O error
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

/// Result type alias for all driver operations.
pub type DbxResult<T> = Result<T, DbxError>;

impl DbxError {
    pub fn invalid_operation(message: impl Into<String>, context: impl Into<String>) -> Self {
        DbxError::InvalidOperation {
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn encoder(column: impl Into<String>, message: impl Into<String>, status: SqlState) -> Self {
        DbxError::Encoder {
            column: column.into(),
            message: message.into(),
            status,
        }
    }

    /// Merge the per-field encoder errors of one operation.
    ///
    /// A single failure is reported as-is; several collapse into
    /// `MultipleEncoder`, which carries the generic status.
    pub fn merge_encoder_errors(mut errors: Vec<DbxError>) -> Option<DbxError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(DbxError::MultipleEncoder(errors)),
        }
    }

    /// Portable status code.
    pub fn status(&self) -> SqlState {
        match self {
            DbxError::Encoder { status, .. } => *status,
            DbxError::MultipleEncoder(_) => SqlState::GENERIC,
            DbxError::Native(err) => err.classification.sql_state(),
            DbxError::Indirect { cause } => cause.status(),
            DbxError::ConnectionClosed(_) | DbxError::PoolClosed | DbxError::Timeout { .. } => {
                SqlState::CONNECTION_EXCEPTION
            }
            DbxError::TableNotFound(_) | DbxError::ColumnNotFound { .. } => SqlState::SCHEMA_ERROR,
            DbxError::InvalidOperation { .. } => SqlState::INVALID_TRANSACTION_STATE,
            DbxError::MissingParameter(_) => SqlState::DATA_EXCEPTION,
            DbxError::Config(_) => SqlState::CONFIG_ERROR,
            DbxError::Serialization(_) | DbxError::Io(_) => SqlState::GENERIC,
        }
    }

    /// The error this one was caused by.
    ///
    /// Duplicate-key errors name themselves as their cause so that
    /// observers walking the chain always land on the constraint violation.
    pub fn cause(&self) -> Option<&DbxError> {
        match self {
            DbxError::Indirect { cause } => Some(cause.as_ref()),
            DbxError::Native(err) if err.is_duplicate_key() => Some(self),
            _ => None,
        }
    }

    /// Wrap as a derived error for the other side of an operation/transaction pair.
    /// An error that is already derived is returned unchanged.
    pub fn derived(&self) -> DbxError {
        match self {
            DbxError::Indirect { .. } => self.clone(),
            other => DbxError::Indirect {
                cause: Arc::new(other.clone()),
            },
        }
    }

    pub fn is_indirect(&self) -> bool {
        matches!(self, DbxError::Indirect { .. })
    }

    /// Native error at the root of this error, if any.
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            DbxError::Native(err) => Some(err),
            DbxError::Indirect { cause } => cause.native(),
            _ => None,
        }
    }

    /// True when retrying the request may succeed.
    pub fn is_transient(&self) -> bool {
        self.native()
            .is_some_and(|err| err.classification.is_transient())
    }
}

impl From<NativeError> for DbxError {
    fn from(err: NativeError) -> Self {
        DbxError::Native(err)
    }
}

impl From<std::io::Error> for DbxError {
    fn from(err: std::io::Error) -> Self {
        DbxError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for DbxError {
    fn from(err: serde_json::Error) -> Self {
        DbxError::Serialization(err.to_string())
    }
}
