//! Auto-Increment — 테이블별 자동 증가 값 캐시
//!
//! Values are reserved from the cluster in batches. Callers announce how many
//! values they are about to need with [`AutoIncrementCache::prefetch`]; the
//! next fetch is sized to the sum of outstanding announcements, so concurrent
//! prefetches coalesce into a single round trip.
//!
//! Fetches run on the owning connection's [`CallQueue`], one at a time, so a
//! cache never issues two overlapping fetches.

use crate::connection::registry::ConnectionHandle;
use crate::dispatch::Callback;
use crate::error::{DbxError, DbxResult};
use crate::operation::Operation;
use crate::queue::QueuedCall;
use crate::schema::TableMetadata;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

#[derive(Default)]
struct CacheState {
    values: VecDeque<u64>,
    /// Values announced but not yet taken
    batch_size: u64,
}

/// Cached auto-increment values of one table.
pub struct AutoIncrementCache {
    table: Arc<TableMetadata>,
    connection: Arc<ConnectionHandle>,
    /// Smallest fetch the cache issues
    min_batch: u64,
    state: Mutex<CacheState>,
    fetches: AtomicU64,
    fetched: AtomicU64,
}

impl AutoIncrementCache {
    pub fn new(table: Arc<TableMetadata>, connection: Arc<ConnectionHandle>, min_batch: u64) -> Arc<Self> {
        Arc::new(Self {
            table,
            connection,
            min_batch,
            state: Mutex::new(CacheState::default()),
            fetches: AtomicU64::new(0),
            fetched: AtomicU64::new(0),
        })
    }

    /// Announce `n` upcoming [`get_value`](Self::get_value) calls.
    pub fn prefetch(&self, n: u64) {
        self.state.lock().batch_size += n;
    }

    /// Take one value, fetching a batch from the cluster when the cache is dry.
    pub fn get_value(self: &Arc<Self>, callback: Callback<DbxResult<u64>>) {
        let cache = Arc::clone(self);
        let call = QueuedCall::new("fetch_auto_increment", move || cache.take_or_fetch())
            .on_complete(callback);
        self.connection.queue().enqueue(call);
    }

    fn take_or_fetch(&self) -> DbxResult<u64> {
        let count = {
            let mut state = self.state.lock();
            if let Some(value) = state.values.pop_front() {
                state.batch_size = state.batch_size.saturating_sub(1);
                return Ok(value);
            }
            state.batch_size.max(self.min_batch).max(1)
        };

        let native = self.connection.native()?;
        let values = native.fetch_auto_increment(&self.table, count)?;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.fetched.fetch_add(values.len() as u64, Ordering::Relaxed);
        debug!(
            table = %self.table.qualified_name(),
            requested = count,
            received = values.len(),
            "auto-increment batch fetched"
        );

        let mut state = self.state.lock();
        state.values.extend(values);
        state.batch_size = state.batch_size.saturating_sub(1);
        state.values.pop_front().ok_or_else(|| {
            DbxError::invalid_operation(
                format!("cluster returned no auto-increment values for '{}'", self.table.name),
                "AutoIncrementCache::get_value",
            )
        })
    }

    pub fn table(&self) -> &Arc<TableMetadata> {
        &self.table
    }

    /// Values announced but not yet taken.
    pub fn batch_size(&self) -> u64 {
        self.state.lock().batch_size
    }

    /// Values fetched but not yet taken.
    pub fn cached(&self) -> usize {
        self.state.lock().values.len()
    }

    /// Native round trips issued so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn fetched_values(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }
}

/// Caches of every table used through one connection pool.
#[derive(Default)]
pub struct AutoIncrementCaches {
    caches: DashMap<String, Arc<AutoIncrementCache>>,
}

impl AutoIncrementCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache of `table`, created on first use.
    pub fn cache_for(
        &self,
        table: &Arc<TableMetadata>,
        connection: &Arc<ConnectionHandle>,
        min_batch: u64,
    ) -> Arc<AutoIncrementCache> {
        self.caches
            .entry(table.qualified_name())
            .or_insert_with(|| AutoIncrementCache::new(Arc::clone(table), Arc::clone(connection), min_batch))
            .clone()
    }

    pub fn get(&self, qualified_name: &str) -> Option<Arc<AutoIncrementCache>> {
        self.caches.get(qualified_name).map(|c| c.clone())
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

/// Supplies auto-increment values to the operations of one execute call.
pub struct AutoIncrementHandler;

impl AutoIncrementHandler {
    /// Fill every operation whose auto-increment column is unset.
    ///
    /// `done` receives the operations back once every requested value has
    /// arrived. An operation whose value could not be fetched carries the
    /// error into its prepare step.
    pub fn resolve(
        mut operations: Vec<Operation>,
        caches: &AutoIncrementCaches,
        connection: &Arc<ConnectionHandle>,
        min_batch: u64,
        done: Callback<Vec<Operation>>,
    ) {
        let needed: Vec<(usize, usize, Arc<AutoIncrementCache>)> = operations
            .iter()
            .enumerate()
            .filter_map(|(position, op)| {
                let column = op.needs_auto_increment()?;
                Some((position, column, caches.cache_for(op.table(), connection, min_batch)))
            })
            .collect();
        if needed.is_empty() {
            done(operations);
            return;
        }

        for (_, _, cache) in &needed {
            cache.prefetch(1);
        }

        struct Pending {
            operations: Vec<Operation>,
            done: Option<Callback<Vec<Operation>>>,
        }
        let remaining = Arc::new(AtomicUsize::new(needed.len()));
        let pending = Arc::new(Mutex::new(Pending {
            operations: std::mem::take(&mut operations),
            done: Some(done),
        }));

        for (position, column, cache) in needed {
            let remaining = Arc::clone(&remaining);
            let pending = Arc::clone(&pending);
            cache.get_value(Box::new(move |value| {
                let finished = {
                    let mut pending = pending.lock();
                    let op = &mut pending.operations[position];
                    match value {
                        Ok(value) => op.set_auto_increment(column, value),
                        Err(err) => {
                            warn!(table = %op.table().name, error = %err, "auto-increment fetch failed");
                            op.fail(err);
                        }
                    }
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let operations = std::mem::take(&mut pending.operations);
                        pending.done.take().map(|done| (done, operations))
                    } else {
                        None
                    }
                };
                if let Some((done, operations)) = finished {
                    done(operations);
                }
            }));
        }
    }
}
