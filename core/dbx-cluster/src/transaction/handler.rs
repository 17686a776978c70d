//! Transaction Handler — 실행 파이프라인
//!
//! Each execute, commit, or rollback call on a handler runs as one batch:
//!
//! ```text
//! seize context ─▶ auto-increment values ─▶ prepare buffers ─┬─ key ops only ─▶ execute(mode)
//!                                                            └─ with scans ───▶ execute(no-commit)
//!                                                                              ─▶ scan… ─▶ execute([], mode)
//!   ─▶ attribute errors ─▶ release context (closing) ─▶ operation callbacks ─▶ transaction callback
//! ```
//!
//! Calls on one handler run one batch at a time, in submission order.

use super::scan::run_scan;
use super::{TransactionResult, TransactionState, attribute};
use crate::autoincrement::AutoIncrementHandler;
use crate::dispatch::{Callback, Job};
use crate::error::{Classification, DbxError};
use crate::native::{ContextId, ExecMode, NativeResult, OperationHelper, ScanHelper};
use crate::operation::{Operation, OperationResult};
use crate::queue::QueuedCall;
use crate::schema::Row;
use crate::session::SessionCore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

struct Request {
    operations: Vec<Operation>,
    mode: ExecMode,
    callback: Callback<TransactionResult>,
}

struct HandlerState {
    phase: TransactionState,
    context: Option<ContextId>,
    /// No-commit work is staged under `context`
    staged: bool,
    running: bool,
    requests: VecDeque<Request>,
    executed: usize,
}

/// One execute call on its way through the pipeline.
struct Batch {
    operations: Arc<Vec<Operation>>,
    callbacks: Vec<Option<Callback<OperationResult>>>,
    mode: ExecMode,
    callback: Callback<TransactionResult>,
    ctx: ContextId,
    attempt: u32,
    helpers: Vec<Option<OperationHelper>>,
    rows: Vec<Vec<Row>>,
    errors: Vec<Option<DbxError>>,
    tx_error: Option<DbxError>,
    /// A native call ran under `ctx` for this batch
    touched: bool,
    /// The native layer already ended the transaction
    native_closed: bool,
}

impl Batch {
    fn new(
        mut operations: Vec<Operation>,
        mode: ExecMode,
        callback: Callback<TransactionResult>,
        ctx: ContextId,
    ) -> Self {
        let callbacks = operations.iter_mut().map(Operation::take_callback).collect();
        let count = operations.len();
        Self {
            operations: Arc::new(operations),
            callbacks,
            mode,
            callback,
            ctx,
            attempt: 0,
            helpers: vec![None; count],
            rows: vec![Vec::new(); count],
            errors: vec![None; count],
            tx_error: None,
            touched: false,
            native_closed: false,
        }
    }

    /// Forget every outcome before re-running the batch.
    fn reset_for_retry(&mut self) {
        let count = self.operations.len();
        self.attempt += 1;
        self.helpers = vec![None; count];
        self.rows = vec![Vec::new(); count];
        self.errors = vec![None; count];
        self.tx_error = None;
        self.native_closed = false;
    }

    fn first_write_error(&self) -> Option<&DbxError> {
        self.operations
            .iter()
            .zip(&self.errors)
            .find_map(|(op, err)| err.as_ref().filter(|_| !op.opcode().is_read()))
    }
}

/// A transaction on one session.
pub struct TransactionHandler {
    id: u64,
    session: Arc<SessionCore>,
    autocommit: bool,
    state: Mutex<HandlerState>,
}

impl std::fmt::Debug for TransactionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionHandler")
            .field("id", &self.id)
            .field("session", &self.session.id())
            .field("autocommit", &self.autocommit)
            .field("phase", &state.phase)
            .field("context", &state.context)
            .finish()
    }
}

impl TransactionHandler {
    pub(crate) fn new(session: Arc<SessionCore>, autocommit: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TRANSACTION.fetch_add(1, Ordering::Relaxed),
            session,
            autocommit,
            state: Mutex::new(HandlerState {
                phase: TransactionState::Open,
                context: None,
                staged: false,
                running: false,
                requests: VecDeque::new(),
                executed: 0,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn state(&self) -> TransactionState {
        self.state.lock().phase
    }

    /// Transaction context currently seized, if any.
    pub fn context(&self) -> Option<ContextId> {
        self.state.lock().context
    }

    /// Operations executed so far.
    pub fn executed(&self) -> usize {
        self.state.lock().executed
    }

    /// Calls waiting behind the running one.
    pub fn pending(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Execute `operations`: committed at once for an autocommit handler,
    /// left open otherwise.
    pub fn execute(
        self: &Arc<Self>,
        operations: Vec<Operation>,
        callback: impl FnOnce(TransactionResult) + Send + 'static,
    ) {
        let mode = if self.autocommit {
            ExecMode::Commit
        } else {
            ExecMode::NoCommit
        };
        self.submit(operations, mode, Box::new(callback));
    }

    /// Execute `operations` and commit in the same round trip.
    pub fn execute_and_commit(
        self: &Arc<Self>,
        operations: Vec<Operation>,
        callback: impl FnOnce(TransactionResult) + Send + 'static,
    ) {
        self.submit(operations, ExecMode::Commit, Box::new(callback));
    }

    pub fn commit(self: &Arc<Self>, callback: impl FnOnce(TransactionResult) + Send + 'static) {
        self.submit(Vec::new(), ExecMode::Commit, Box::new(callback));
    }

    pub fn rollback(self: &Arc<Self>, callback: impl FnOnce(TransactionResult) + Send + 'static) {
        self.submit(Vec::new(), ExecMode::Rollback, Box::new(callback));
    }

    fn submit(
        self: &Arc<Self>,
        operations: Vec<Operation>,
        mode: ExecMode,
        callback: Callback<TransactionResult>,
    ) {
        let start = {
            let mut state = self.state.lock();
            state.requests.push_back(Request {
                operations,
                mode,
                callback,
            });
            !std::mem::replace(&mut state.running, true)
        };
        if start {
            self.run_next();
        }
    }

    fn run_next(self: &Arc<Self>) {
        let request = {
            let mut state = self.state.lock();
            match state.requests.pop_front() {
                Some(request) => request,
                None => {
                    state.running = false;
                    return;
                }
            }
        };
        self.run(request);
    }

    fn run(self: &Arc<Self>, request: Request) {
        enum Start {
            Rejected(Request),
            Stub(Request),
            Ready(Request, Option<ContextId>),
        }

        let start = {
            let mut state = self.state.lock();
            let stub = state.context.is_none() && request.operations.is_empty();
            if state.phase == TransactionState::Closed {
                if stub && request.mode == ExecMode::Rollback {
                    Start::Stub(request)
                } else {
                    Start::Rejected(request)
                }
            } else if stub {
                if request.mode.closes_transaction() {
                    state.phase = TransactionState::Closed;
                }
                Start::Stub(request)
            } else {
                state.phase = TransactionState::Executing;
                Start::Ready(request, state.context)
            }
        };

        match start {
            Start::Rejected(request) => {
                (request.callback)(TransactionResult::failed(DbxError::invalid_operation(
                    format!("transaction {} is closed", self.id),
                    "TransactionHandler::execute",
                )));
                self.run_next();
            }
            Start::Stub(request) => {
                debug!(tx = self.id, mode = ?request.mode, "no native context touched, nothing to send");
                (request.callback)(TransactionResult::default());
                self.run_next();
            }
            Start::Ready(request, Some(ctx)) => self.resolve(ctx, request),
            Start::Ready(request, None) => {
                let handler = Arc::clone(self);
                self.session.contexts().seize(Box::new(move |ctx| {
                    trace!(tx = handler.id, ?ctx, "transaction context seized");
                    handler.state.lock().context = Some(ctx);
                    handler.resolve(ctx, request);
                }));
            }
        }
    }

    fn resolve(self: &Arc<Self>, ctx: ContextId, request: Request) {
        let Request {
            operations,
            mode,
            callback,
        } = request;
        let shared = self.session.shared();
        let handler = Arc::clone(self);
        AutoIncrementHandler::resolve(
            operations,
            shared.auto_increment(),
            shared.connection(),
            shared.props().autoincrement_batch_size,
            Box::new(move |operations| {
                handler.prepare(Batch::new(operations, mode, callback, ctx));
            }),
        );
    }

    fn prepare(self: &Arc<Self>, mut batch: Batch) {
        let props = self.session.shared().props();
        let mut keys = Vec::new();
        let mut scans = VecDeque::new();
        for (position, op) in batch.operations.iter().enumerate() {
            let prepared = if op.is_scan() {
                op.prepare_scan(props).map(|helper| scans.push_back((position, helper)))
            } else {
                op.prepare_key().map(|helper| keys.push((position, helper)))
            };
            if let Err(err) = prepared {
                batch.errors[position] = Some(err);
            }
        }

        if let Some(first) = batch.errors.iter().flatten().next() {
            debug!(tx = self.id, error = %first, "operation failed to prepare; execute skipped");
            batch.tx_error = Some(first.derived());
            return self.settle(batch);
        }

        if scans.is_empty() {
            let mode = batch.mode;
            self.execute_keys(batch, keys, mode, scans);
        } else if keys.is_empty() {
            self.run_scans(batch, scans);
        } else {
            self.execute_keys(batch, keys, ExecMode::NoCommit, scans);
        }
    }

    /// One native execute of `keys`; continues with `scans` if there are any.
    fn execute_keys(
        self: &Arc<Self>,
        mut batch: Batch,
        keys: Vec<(usize, OperationHelper)>,
        mode: ExecMode,
        scans: VecDeque<(usize, ScanHelper)>,
    ) {
        let (positions, helpers): (Vec<usize>, Vec<OperationHelper>) = keys.into_iter().unzip();
        let native = Arc::clone(self.session.native());
        let ctx = batch.ctx;
        batch.touched = true;

        let releasing = Arc::clone(self);
        let handler = Arc::clone(self);
        let call = QueuedCall::new("execute", move || {
            let mut helpers = helpers;
            let outcome = native.execute(ctx, &mut helpers, mode);
            (helpers, outcome)
        })
        .while_holding(move |executed: &mut (Vec<OperationHelper>, NativeResult<()>), deferred| {
            // the native transaction is over; hand the context on before the queue advances
            if (mode.closes_transaction() || executed.1.is_err())
                && let Some(grant) = releasing.release_context()
            {
                deferred.push(grant);
            }
        })
        .on_complete(move |(helpers, outcome)| {
            let mut batch = batch;
            batch.native_closed = mode.closes_transaction() || outcome.is_err();
            if let Err(err) = outcome {
                batch.tx_error = Some(err.into());
            }
            for (position, mut helper) in positions.into_iter().zip(helpers) {
                if let Some(err) = helper.error.take() {
                    batch.errors[position] = Some(err.into());
                }
                batch.helpers[position] = Some(helper);
            }

            if batch.tx_error.is_some() || scans.is_empty() {
                return handler.settle(batch);
            }
            // writes ran without commit ahead of the scans; a failed one must not reach the commit
            if batch.mode.closes_transaction()
                && let Some(tx_error) = batch.first_write_error().map(DbxError::derived)
            {
                batch.tx_error = Some(tx_error);
                return handler.settle(batch);
            }
            handler.run_scans(batch, scans);
        });
        self.session.queue().enqueue(call);
    }

    fn run_scans(self: &Arc<Self>, mut batch: Batch, mut scans: VecDeque<(usize, ScanHelper)>) {
        let Some((position, helper)) = scans.pop_front() else {
            // every scan is done: end the transaction unless it stays open
            return if batch.mode.closes_transaction() {
                let mode = batch.mode;
                self.execute_keys(batch, Vec::new(), mode, scans)
            } else {
                self.settle(batch)
            };
        };

        batch.touched = true;
        let handler = Arc::clone(self);
        let operations = Arc::clone(&batch.operations);
        let ctx = batch.ctx;
        run_scan(
            Arc::clone(&self.session),
            ctx,
            operations,
            position,
            helper,
            Box::new(move |scanned| {
                let mut batch = batch;
                match scanned {
                    Ok(rows) => {
                        batch.rows[position] = rows;
                        handler.run_scans(batch, scans);
                    }
                    Err(err) => handler.scan_failed(batch, position, err),
                }
            }),
        );
    }

    fn scan_failed(self: &Arc<Self>, mut batch: Batch, position: usize, err: DbxError) {
        let limit = self.session.shared().props().scan_retry_limit;
        let timed_out = err
            .native()
            .is_some_and(|native| native.classification == Classification::TimeoutExpired);

        if timed_out && batch.attempt < limit {
            warn!(
                tx = self.id,
                attempt = batch.attempt + 1,
                limit,
                "scan timed out; rolling back and retrying"
            );
            let native = Arc::clone(self.session.native());
            let ctx = batch.ctx;
            let handler = Arc::clone(self);
            let call = QueuedCall::new("rollback", move || {
                native.execute(ctx, &mut [], ExecMode::Rollback)
            })
            .on_complete(move |rolled_back: NativeResult<()>| {
                if let Err(err) = rolled_back {
                    warn!(tx = handler.id, error = %err, "rollback before scan retry failed");
                }
                handler.state.lock().staged = false;
                let mut batch = batch;
                batch.reset_for_retry();
                handler.prepare(batch);
            });
            self.session.queue().enqueue(call);
            return;
        }

        warn!(tx = self.id, error = %err, attempts = batch.attempt + 1, "scan failed");
        batch.tx_error = Some(err.derived());
        batch.errors[position] = Some(err);
        self.settle(batch);
    }

    /// Attribute errors, then end the transaction if the batch closes it.
    fn settle(self: &Arc<Self>, mut batch: Batch) {
        let reads: Vec<bool> = batch
            .operations
            .iter()
            .map(|op| op.opcode().is_read())
            .collect();
        batch.tx_error = attribute(&mut batch.errors, &reads, batch.tx_error.take(), batch.mode);

        let closing = batch.mode.closes_transaction() || batch.tx_error.is_some();
        let needs_rollback = closing
            && !batch.native_closed
            && (batch.touched || self.state.lock().staged);
        if !needs_rollback {
            return self.complete(batch, closing);
        }

        let native = Arc::clone(self.session.native());
        let ctx = batch.ctx;
        let releasing = Arc::clone(self);
        let handler = Arc::clone(self);
        let call = QueuedCall::new("rollback", move || {
            native.execute(ctx, &mut [], ExecMode::Rollback)
        })
        .while_holding(move |_, deferred| {
            if let Some(grant) = releasing.release_context() {
                deferred.push(grant);
            }
        })
        .on_complete(move |rolled_back: NativeResult<()>| {
            if let Err(err) = rolled_back {
                warn!(tx = handler.id, error = %err, "rollback failed");
            }
            handler.complete(batch, true);
        });
        self.session.queue().enqueue(call);
    }

    fn complete(self: &Arc<Self>, batch: Batch, closing: bool) {
        let grant = if closing { self.release_context() } else { None };
        {
            let mut state = self.state.lock();
            state.executed += batch.operations.len();
            if closing {
                state.phase = TransactionState::Closed;
                state.staged = false;
            } else {
                state.phase = TransactionState::Open;
                state.staged |= batch.touched;
            }
        }
        if closing {
            debug!(
                tx = self.id,
                mode = ?batch.mode,
                failed = batch.tx_error.is_some(),
                "transaction closed"
            );
        }

        let Batch {
            operations,
            callbacks,
            callback,
            helpers,
            rows,
            errors,
            tx_error,
            ..
        } = batch;
        let results: Vec<OperationResult> = operations
            .iter()
            .zip(helpers)
            .zip(rows)
            .zip(errors)
            .map(|(((op, helper), rows), error)| {
                if op.is_scan() {
                    op.complete_scan(rows, error)
                } else {
                    op.complete(helper, error)
                }
            })
            .collect();

        for (result, callback) in results.iter().zip(callbacks) {
            if let Some(callback) = callback {
                callback(result.clone());
            }
        }
        callback(TransactionResult {
            error: tx_error,
            results,
        });

        if let Some(grant) = grant {
            grant();
        }
        self.run_next();
    }

    /// Give the seized context back to the session. Idempotent.
    fn release_context(&self) -> Option<Job> {
        let ctx = self.state.lock().context.take()?;
        trace!(tx = self.id, ?ctx, "transaction context released");
        self.session.contexts().release(ctx)
    }
}
