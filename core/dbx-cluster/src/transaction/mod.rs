//! Transactions — 트랜잭션 상태 머신과 실행 파이프라인
//!
//! # 상태
//!
//! ```text
//! (none) ──begin──▶ Open ──execute──▶ Executing ──no-commit──▶ Open
//!                                        │
//!                                        └──commit / rollback / error──▶ Closed
//! ```
//!
//! A session has at most one current (explicit) transaction. Autocommit
//! executes run on a private handler that closes itself after its commit.

pub mod handler;
pub(crate) mod scan;

pub use handler::TransactionHandler;

use crate::error::DbxError;
use crate::native::ExecMode;
use crate::operation::OperationResult;

/// Lifecycle state of a transaction handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Accepting operations
    Open,
    /// An execute call is in flight
    Executing,
    /// Committed, rolled back, or aborted by an error
    Closed,
}

/// Outcome of one execute, commit, or rollback call.
#[derive(Debug, Clone, Default)]
pub struct TransactionResult {
    /// Transaction-level error
    pub error: Option<DbxError>,
    /// Per-operation results, in submission order
    pub results: Vec<OperationResult>,
}

impl TransactionResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub(crate) fn failed(error: DbxError) -> Self {
        Self {
            error: Some(error),
            results: Vec::new(),
        }
    }

    /// `Ok(results)` unless the transaction failed.
    pub fn into_result(self) -> Result<Vec<OperationResult>, DbxError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.results),
        }
    }
}

/// Attribute errors between the operations of one call and their transaction.
///
/// - an operation error with no transaction error becomes the transaction
///   error, derived, unless the operation is a read or `mode` is no-commit
/// - a transaction error reaches every operation without its own error as a
///   derived error
/// - when both exist they stay independent
///
/// Returns the transaction error.
pub(crate) fn attribute(
    op_errors: &mut [Option<DbxError>],
    reads: &[bool],
    tx_error: Option<DbxError>,
    mode: ExecMode,
) -> Option<DbxError> {
    let tx_error = tx_error.or_else(|| {
        if mode == ExecMode::NoCommit {
            return None;
        }
        op_errors
            .iter()
            .zip(reads)
            .find_map(|(err, &read)| err.as_ref().filter(|_| !read))
            .map(DbxError::derived)
    });

    if let Some(tx) = &tx_error {
        for err in op_errors.iter_mut().filter(|e| e.is_none()) {
            *err = Some(tx.derived());
        }
    }
    tx_error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NativeError, SqlState};

    fn dup() -> DbxError {
        NativeError::duplicate_key().into()
    }

    #[test]
    fn test_op_error_promotes_on_commit() {
        let mut errors = vec![None, Some(dup()), None];
        let tx = attribute(&mut errors, &[false; 3], None, ExecMode::Commit).unwrap();
        assert!(tx.is_indirect());
        assert_eq!(tx.status(), SqlState::CONSTRAINT_VIOLATION);
        assert!(errors[0].as_ref().unwrap().is_indirect());
        assert!(!errors[1].as_ref().unwrap().is_indirect());
        assert!(errors[2].as_ref().unwrap().is_indirect());
    }

    #[test]
    fn test_read_error_does_not_promote() {
        let mut errors = vec![Some(NativeError::no_such_tuple().into()), None];
        assert!(attribute(&mut errors, &[true, false], None, ExecMode::Commit).is_none());
        assert!(errors[1].is_none());
    }

    #[test]
    fn test_no_commit_does_not_promote() {
        let mut errors = vec![Some(dup())];
        assert!(attribute(&mut errors, &[false], None, ExecMode::NoCommit).is_none());
        assert!(!errors[0].as_ref().unwrap().is_indirect());
    }

    #[test]
    fn test_tx_error_reaches_clean_ops_once() {
        let tx_error: DbxError = NativeError::scan_timeout().into();
        let mut errors = vec![None, Some(dup())];
        let tx = attribute(&mut errors, &[false, false], Some(tx_error.derived()), ExecMode::Commit)
            .unwrap();
        match (&tx, errors[0].as_ref().unwrap()) {
            (DbxError::Indirect { cause: a }, DbxError::Indirect { cause: b }) => {
                assert!(std::sync::Arc::ptr_eq(a, b))
            }
            other => panic!("expected derived errors, got {other:?}"),
        }
        assert!(errors[1].as_ref().unwrap().native().unwrap().is_duplicate_key());
    }
}
