//! Connection Pool — 세션 풀과 딕셔너리 캐시
//!
//! A pool wraps one shared [`ConnectionHandle`] and keeps:
//! - a free list of idle sessions, topped up to `session_pool_min` in the background
//! - a cache of table metadata; concurrent lookups of one key share a native call
//!
//! Closing the pool closes every idle session and every cached table, then
//! releases the connection once all of those native closes have completed.

use crate::autoincrement::AutoIncrementCaches;
use crate::config::ConnectionProperties;
use crate::connection::registry::{ConnectionHandle, ConnectionRegistry};
use crate::dispatch::Callback;
use crate::error::{Classification, DbxError, DbxResult};
use crate::native::{NativeResult, NativeSession};
use crate::queue::QueuedCall;
use crate::schema::TableMetadata;
use crate::session::{Session, SessionCore};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

type TableCallback = Callback<DbxResult<Arc<TableMetadata>>>;
type ListCallback = Callback<DbxResult<Vec<String>>>;

/// State shared by a pool and every session it hands out.
pub struct PoolShared {
    props: ConnectionProperties,
    connection: Arc<ConnectionHandle>,
    auto_increment: AutoIncrementCaches,
}

impl PoolShared {
    pub fn props(&self) -> &ConnectionProperties {
        &self.props
    }

    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.connection
    }

    pub fn auto_increment(&self) -> &AutoIncrementCaches {
        &self.auto_increment
    }
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions served from the free list
    pub hits: u64,
    /// Sessions created because the free list was empty
    pub misses: u64,
    pub created: u64,
    pub destroyed: u64,
    /// Idle sessions on the free list
    pub free: usize,
    pub cached_tables: usize,
}

#[derive(Default)]
struct PoolState {
    free: Vec<Arc<SessionCore>>,
    prefetching: bool,
    closing: bool,
}

#[derive(Default)]
struct Dictionary {
    tables: AHashMap<String, Arc<TableMetadata>>,
    pending_tables: AHashMap<String, Vec<TableCallback>>,
    pending_list: Option<Vec<ListCallback>>,
}

struct CloseCountdown {
    remaining: usize,
    error: Option<DbxError>,
    done: Option<Callback<DbxResult<()>>>,
}

/// Session pool over one cluster connection.
pub struct ConnectionPool {
    registry: Arc<ConnectionRegistry>,
    shared: Arc<PoolShared>,
    state: Mutex<PoolState>,
    dictionary: Mutex<Dictionary>,
    next_session: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl ConnectionPool {
    /// Acquire the connection named by `props` and build a pool on it.
    pub fn open(
        registry: &Arc<ConnectionRegistry>,
        props: ConnectionProperties,
        callback: impl FnOnce(DbxResult<Arc<ConnectionPool>>) + Send + 'static,
    ) {
        if let Err(err) = props.validate() {
            callback(Err(err));
            return;
        }
        let owner = Arc::clone(registry);
        let connect_props = props.clone();
        registry.get_connection(
            &connect_props,
            Box::new(move |connected| match connected {
                Ok(connection) => {
                    info!(
                        connect_string = %props.connect_string,
                        database = %props.database,
                        "Session pool opened"
                    );
                    let pool = Arc::new(ConnectionPool {
                        registry: owner,
                        shared: Arc::new(PoolShared {
                            props,
                            connection,
                            auto_increment: AutoIncrementCaches::new(),
                        }),
                        state: Mutex::new(PoolState::default()),
                        dictionary: Mutex::new(Dictionary::default()),
                        next_session: AtomicU64::new(1),
                        hits: AtomicU64::new(0),
                        misses: AtomicU64::new(0),
                        created: AtomicU64::new(0),
                        destroyed: AtomicU64::new(0),
                    });
                    pool.prefetch();
                    callback(Ok(pool));
                }
                Err(err) => callback(Err(err)),
            }),
        );
    }

    pub fn props(&self) -> &ConnectionProperties {
        &self.shared.props
    }

    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.shared.connection
    }

    pub fn auto_increment(&self) -> &AutoIncrementCaches {
        &self.shared.auto_increment
    }

    pub fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.state.lock().free.len();
        let cached_tables = self.dictionary.lock().tables.len();
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            free,
            cached_tables,
        }
    }

    // ════════════════════════════════════════════
    // Sessions
    // ════════════════════════════════════════════

    /// Borrow a session: an idle one if available, a new one otherwise.
    pub fn get_session(self: &Arc<Self>, callback: impl FnOnce(DbxResult<Session>) + Send + 'static) {
        let idle = {
            let mut state = self.state.lock();
            if state.closing {
                None
            } else {
                Some(state.free.pop())
            }
        };

        match idle {
            None => callback(Err(DbxError::PoolClosed)),
            Some(Some(core)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(session = core.id(), "session pool hit");
                self.prefetch();
                callback(Ok(Session::new(core, Arc::clone(self))));
            }
            Some(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("session pool miss");
                let pool = Arc::clone(self);
                self.create_session(Box::new(move |created| {
                    callback(created.map(|core| Session::new(core, pool)));
                }));
            }
        }
    }

    fn create_session(self: &Arc<Self>, callback: Callback<DbxResult<Arc<SessionCore>>>) {
        let native = match self.shared.connection.native() {
            Ok(native) => native,
            Err(err) => return callback(Err(err)),
        };
        let database = self.shared.props.database.clone();
        let pool = Arc::clone(self);
        let call = QueuedCall::new("open_session", move || native.open_session(&database))
            .on_complete(move |opened: NativeResult<Arc<dyn NativeSession>>| {
                let created = opened.map_err(DbxError::from).map(|native| {
                    let id = pool.next_session.fetch_add(1, Ordering::Relaxed);
                    pool.created.fetch_add(1, Ordering::Relaxed);
                    debug!(session = id, "session created");
                    SessionCore::new(
                        id,
                        native,
                        Arc::clone(&pool.shared),
                        pool.registry.dispatcher().clone(),
                    )
                });
                callback(created);
            });
        self.shared.connection.queue().enqueue(call);
    }

    /// Top the free list up to `session_pool_min`, one session at a time.
    fn prefetch(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.prefetching
                || state.closing
                || state.free.len() >= self.shared.props.session_pool_min
            {
                return;
            }
            state.prefetching = true;
        }

        let pool = Arc::clone(self);
        self.create_session(Box::new(move |created| {
            let surplus = {
                let mut state = pool.state.lock();
                state.prefetching = false;
                match created {
                    Ok(core) if state.closing => Ok(Some(core)),
                    Ok(core) => {
                        state.free.push(core);
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            };
            match surplus {
                Ok(None) => pool.prefetch(),
                Ok(Some(core)) => pool.destroy_session(core, Box::new(|_| {})),
                Err(err) => warn!(error = %err, "session prefetch failed"),
            }
        }));
    }

    /// Take a session back. It is destroyed instead when `discard` is set,
    /// the pool is closing, or the free list is full.
    pub(crate) fn release_session(&self, core: Arc<SessionCore>, discard: bool) {
        let surplus = {
            let mut state = self.state.lock();
            if discard || state.closing || state.free.len() >= self.shared.props.session_pool_max {
                Some(core)
            } else {
                trace!(session = core.id(), "session returned to pool");
                state.free.push(core);
                None
            }
        };
        if let Some(core) = surplus {
            self.destroy_session(core, Box::new(|_| {}));
        }
    }

    fn destroy_session(&self, core: Arc<SessionCore>, done: Callback<DbxResult<()>>) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(session = core.id(), "destroying session");
        let id = core.id();
        core.close(Box::new(move |closed| {
            if let Err(err) = &closed {
                warn!(session = id, error = %err, "session close failed");
            }
            done(closed);
        }));
    }

    // ════════════════════════════════════════════
    // Dictionary
    // ════════════════════════════════════════════

    /// Metadata of table `name`, cached after the first lookup.
    pub fn get_table(self: &Arc<Self>, name: &str, callback: TableCallback) {
        enum Lookup {
            Cached(Arc<TableMetadata>, TableCallback),
            Joined,
            Fetch,
        }

        if self.is_closing() {
            return callback(Err(DbxError::PoolClosed));
        }
        let lookup = {
            let mut dictionary = self.dictionary.lock();
            if let Some(table) = dictionary.tables.get(name) {
                Lookup::Cached(Arc::clone(table), callback)
            } else if let Some(waiters) = dictionary.pending_tables.get_mut(name) {
                waiters.push(callback);
                Lookup::Joined
            } else {
                dictionary
                    .pending_tables
                    .insert(name.to_string(), vec![callback]);
                Lookup::Fetch
            }
        };

        match lookup {
            Lookup::Cached(table, callback) => callback(Ok(table)),
            Lookup::Joined => trace!(table = name, "joined pending table lookup"),
            Lookup::Fetch => {
                let name = name.to_string();
                let native = match self.shared.connection.native() {
                    Ok(native) => native,
                    Err(err) => return self.table_loaded(name, Err(err)),
                };
                let database = self.shared.props.database.clone();
                let pool = Arc::clone(self);
                let lookup_name = name.clone();
                let call = QueuedCall::new("get_table", move || native.get_table(&database, &lookup_name))
                    .on_complete(move |loaded: NativeResult<TableMetadata>| {
                        let loaded = loaded.map(Arc::new).map_err(|err| {
                            if err.classification == Classification::SchemaError {
                                DbxError::TableNotFound(name.clone())
                            } else {
                                err.into()
                            }
                        });
                        pool.table_loaded(name, loaded);
                    });
                self.shared.connection.queue().enqueue(call);
            }
        }
    }

    fn table_loaded(self: &Arc<Self>, name: String, loaded: DbxResult<Arc<TableMetadata>>) {
        let closing = self.is_closing();
        let waiters = {
            let mut dictionary = self.dictionary.lock();
            if let (Ok(table), false) = (&loaded, closing) {
                dictionary.tables.insert(name.clone(), Arc::clone(table));
            }
            dictionary.pending_tables.remove(&name).unwrap_or_default()
        };
        debug!(table = %name, waiters = waiters.len(), ok = loaded.is_ok(), "table lookup finished");

        // a table opened while the pool closed is not cached, so close it here
        if closing && let Ok(table) = &loaded {
            self.close_table(Arc::clone(table), Box::new(|_| {}));
        }
        for waiter in waiters {
            waiter(loaded.clone());
        }
    }

    /// Names of the tables in the pool's database.
    pub fn list_tables(self: &Arc<Self>, callback: ListCallback) {
        if self.is_closing() {
            return callback(Err(DbxError::PoolClosed));
        }
        {
            let mut dictionary = self.dictionary.lock();
            if let Some(waiters) = dictionary.pending_list.as_mut() {
                waiters.push(callback);
                return;
            }
            dictionary.pending_list = Some(vec![callback]);
        }

        let native = match self.shared.connection.native() {
            Ok(native) => native,
            Err(err) => return self.tables_listed(Err(err)),
        };
        let database = self.shared.props.database.clone();
        let pool = Arc::clone(self);
        let call = QueuedCall::new("list_tables", move || native.list_tables(&database))
            .on_complete(move |listed: NativeResult<Vec<String>>| {
                pool.tables_listed(listed.map_err(DbxError::from));
            });
        self.shared.connection.queue().enqueue(call);
    }

    fn tables_listed(&self, listed: DbxResult<Vec<String>>) {
        let waiters = self.dictionary.lock().pending_list.take().unwrap_or_default();
        for waiter in waiters {
            waiter(listed.clone());
        }
    }

    /// Table metadata cached so far.
    pub fn cached_tables(&self) -> Vec<Arc<TableMetadata>> {
        self.dictionary.lock().tables.values().cloned().collect()
    }

    fn close_table(&self, table: Arc<TableMetadata>, done: Callback<DbxResult<()>>) {
        let native = match self.shared.connection.native() {
            Ok(native) => native,
            Err(err) => return done(Err(err)),
        };
        let call = QueuedCall::new("close_table", move || native.close_table(&table))
            .on_complete(move |closed: NativeResult<()>| done(closed.map_err(DbxError::from)));
        self.shared.connection.queue().enqueue(call);
    }

    // ════════════════════════════════════════════
    // Shutdown
    // ════════════════════════════════════════════

    /// Close idle sessions and cached tables, then release the connection.
    ///
    /// Sessions still borrowed are destroyed when they come back.
    pub fn close(self: &Arc<Self>, callback: impl FnOnce(DbxResult<()>) + Send + 'static) {
        let sessions = {
            let mut state = self.state.lock();
            if state.closing {
                drop(state);
                return callback(Err(DbxError::PoolClosed));
            }
            state.closing = true;
            std::mem::take(&mut state.free)
        };
        let tables: Vec<Arc<TableMetadata>> = self
            .dictionary
            .lock()
            .tables
            .drain()
            .map(|(_, table)| table)
            .collect();

        let total = sessions.len() + tables.len();
        info!(sessions = sessions.len(), tables = tables.len(), "closing session pool");
        let countdown = Arc::new(Mutex::new(CloseCountdown {
            remaining: total,
            error: None,
            done: Some(Box::new(callback)),
        }));
        if total == 0 {
            return self.finish_close(&countdown);
        }

        for core in sessions {
            let pool = Arc::clone(self);
            let countdown = Arc::clone(&countdown);
            self.destroy_session(core, Box::new(move |closed| pool.close_step(&countdown, closed)));
        }
        for table in tables {
            let pool = Arc::clone(self);
            let countdown = Arc::clone(&countdown);
            self.close_table(table, Box::new(move |closed| pool.close_step(&countdown, closed)));
        }
    }

    fn close_step(&self, countdown: &Arc<Mutex<CloseCountdown>>, closed: DbxResult<()>) {
        let last = {
            let mut countdown = countdown.lock();
            if let Err(err) = closed {
                countdown.error.get_or_insert(err);
            }
            countdown.remaining = countdown.remaining.saturating_sub(1);
            countdown.remaining == 0
        };
        if last {
            self.finish_close(countdown);
        }
    }

    fn finish_close(&self, countdown: &Arc<Mutex<CloseCountdown>>) {
        let (done, error) = {
            let mut countdown = countdown.lock();
            (countdown.done.take(), countdown.error.take())
        };
        let props = &self.shared.props;
        self.registry
            .release_connection(&props.connect_string, props.linger_on_close_ms);
        info!(connect_string = %props.connect_string, "session pool closed");
        if let Some(done) = done {
            done(error.map_or(Ok(()), Err));
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connect_string", &self.shared.props.connect_string)
            .field("stats", &self.stats())
            .finish()
    }
}
