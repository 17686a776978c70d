//! Sessions — 세션과 트랜잭션 컨텍스트
//!
//! A [`Session`] is borrowed from a [`ConnectionPool`] and returned to it by
//! [`Session::close`] (or on drop). Its native handle, call queue, and
//! transaction contexts live in a [`SessionCore`] that the pool keeps on its
//! free list between borrowers.
//!
//! Ownership runs one way only: the pool owns idle cores, a session owns its
//! current transaction, and a transaction holds the core it runs on.

pub mod contexts;

pub use contexts::ContextPool;

use crate::connection::pool::{ConnectionPool, PoolShared};
use crate::dispatch::{Callback, Dispatcher};
use crate::error::{DbxError, DbxResult};
use crate::native::NativeSession;
use crate::operation::Operation;
use crate::queue::{CallQueue, QueuedCall};
use crate::schema::TableMetadata;
use crate::transaction::{TransactionHandler, TransactionResult, TransactionState};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Native session handle plus what runs on it.
pub struct SessionCore {
    id: u64,
    native: Arc<dyn NativeSession>,
    queue: Arc<CallQueue>,
    contexts: ContextPool,
    shared: Arc<PoolShared>,
}

impl SessionCore {
    pub(crate) fn new(
        id: u64,
        native: Arc<dyn NativeSession>,
        shared: Arc<PoolShared>,
        dispatcher: Dispatcher,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            native,
            queue: CallQueue::new(format!("session:{id}"), dispatcher),
            contexts: ContextPool::new(shared.props().session_concurrency),
            shared,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn native(&self) -> &Arc<dyn NativeSession> {
        &self.native
    }

    /// Queue serializing every call on the native session.
    pub fn queue(&self) -> &Arc<CallQueue> {
        &self.queue
    }

    pub fn contexts(&self) -> &ContextPool {
        &self.contexts
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    /// Close the native session.
    pub(crate) fn close(&self, done: Callback<DbxResult<()>>) {
        let native = Arc::clone(&self.native);
        let call = QueuedCall::new("close_session", move || native.close())
            .on_complete(move |closed| done(closed.map_err(DbxError::from)));
        self.queue.enqueue(call);
    }
}

impl std::fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("contexts_seized", &self.contexts.seized())
            .finish()
    }
}

/// A session borrowed from a connection pool.
pub struct Session {
    core: Arc<SessionCore>,
    pool: Arc<ConnectionPool>,
    current: Mutex<Option<Arc<TransactionHandler>>>,
    returned: bool,
}

impl Session {
    pub(crate) fn new(core: Arc<SessionCore>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            core,
            pool,
            current: Mutex::new(None),
            returned: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Start an explicit transaction; later executes run without commit
    /// until [`commit`](Self::commit) or [`rollback`](Self::rollback).
    pub fn begin(&self) -> DbxResult<Arc<TransactionHandler>> {
        let mut current = self.current.lock();
        // a transaction ended by a failure is finished; forget it
        if current.as_ref().is_some_and(|h| h.state() == TransactionState::Closed) {
            *current = None;
        }
        if current.is_some() {
            return Err(DbxError::invalid_operation(
                "a transaction is already open on this session",
                "Session::begin",
            ));
        }
        let handler = TransactionHandler::new(Arc::clone(&self.core), false);
        debug!(session = self.core.id, tx = handler.id(), "transaction begun");
        *current = Some(Arc::clone(&handler));
        Ok(handler)
    }

    /// Execute `operations` in the current transaction, or in a fresh
    /// autocommit transaction when none is open.
    pub fn execute(
        &self,
        operations: Vec<Operation>,
        callback: impl FnOnce(TransactionResult) + Send + 'static,
    ) {
        let handler = self
            .current
            .lock()
            .clone()
            .unwrap_or_else(|| TransactionHandler::new(Arc::clone(&self.core), true));
        handler.execute(operations, callback);
    }

    /// Commit the current transaction.
    pub fn commit(&self, callback: impl FnOnce(TransactionResult) + Send + 'static) {
        match self.current.lock().take() {
            Some(handler) => handler.commit(callback),
            None => callback(TransactionResult::failed(no_transaction("Session::commit"))),
        }
    }

    /// Roll back the current transaction.
    pub fn rollback(&self, callback: impl FnOnce(TransactionResult) + Send + 'static) {
        match self.current.lock().take() {
            Some(handler) => handler.rollback(callback),
            None => callback(TransactionResult::failed(no_transaction("Session::rollback"))),
        }
    }

    /// State of the current transaction; `None` between transactions.
    pub fn current_transaction(&self) -> Option<TransactionState> {
        self.current.lock().as_ref().map(|handler| handler.state())
    }

    pub fn get_table(
        &self,
        name: &str,
        callback: impl FnOnce(DbxResult<Arc<TableMetadata>>) + Send + 'static,
    ) {
        self.pool.get_table(name, Box::new(callback));
    }

    pub fn list_tables(&self, callback: impl FnOnce(DbxResult<Vec<String>>) + Send + 'static) {
        self.pool.list_tables(Box::new(callback));
    }

    /// Roll back any open transaction and return the session to its pool.
    pub fn close(mut self, callback: impl FnOnce(DbxResult<()>) + Send + 'static) {
        self.returned = true;
        let core = Arc::clone(&self.core);
        let pool = Arc::clone(&self.pool);
        let current = self.current.lock().take();
        drop(self);

        match current {
            Some(handler) => {
                debug!(session = core.id, tx = handler.id(), "rolling back open transaction on close");
                handler.rollback(move |rolled_back| {
                    pool.release_session(core, false);
                    callback(rolled_back.error.map_or(Ok(()), Err));
                });
            }
            None => {
                pool.release_session(core, false);
                callback(Ok(()));
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        // an abandoned transaction leaves the native session in an unknown state
        let abandoned = self
            .current
            .lock()
            .take()
            .is_some_and(|h| h.state() != TransactionState::Closed);
        self.pool.release_session(Arc::clone(&self.core), abandoned);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.core.id)
            .field("transaction", &self.current_transaction())
            .finish()
    }
}

fn no_transaction(context: &str) -> DbxError {
    DbxError::invalid_operation("no transaction is open on this session", context)
}
