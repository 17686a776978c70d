//! Connection Registry — connect string 당 하나의 물리 연결
//!
//! Every pool naming the same connect string shares one [`ConnectionHandle`].
//! The handle is reference counted; when the last reference is released the
//! real disconnect is deferred by a linger delay and cancelled if a new
//! reference arrives first.
//!
//! ```text
//! get ──▶ refcount+1 ──▶ connected?  ─ yes ─▶ callback(handle)
//!                          │ no
//!                          ▼
//!                 connecting? ─ yes ─▶ wait in pending list
//!                          │ no
//!                          ▼
//!            enqueue connect + wait_until_ready ─▶ drain pending list
//!
//! release ──▶ refcount-1 ──▶ 0? ──▶ linger ──▶ still 0 and same generation? ──▶ disconnect
//! ```

use crate::config::ConnectionProperties;
use crate::dispatch::{Callback, Dispatcher, Timer};
use crate::error::{DbxError, DbxResult, NativeError};
use crate::native::{NativeConnection, NativeDriver};
use crate::queue::{CallQueue, QueuedCall};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

type ConnectCallback = Callback<DbxResult<Arc<ConnectionHandle>>>;

#[derive(Default)]
struct HandleState {
    native: Option<Arc<dyn NativeConnection>>,
    refcount: usize,
    connected: bool,
    connecting: bool,
    /// Set once teardown begins; the handle is never reused afterwards
    disconnecting: bool,
    pending: Vec<ConnectCallback>,
    /// Bumped on every acquire and on the release to zero; a linger timer
    /// only fires for the generation it was scheduled in
    generation: u64,
}

/// One physical connection shared by every pool with the same connect string.
pub struct ConnectionHandle {
    connect_string: String,
    queue: Arc<CallQueue>,
    state: Mutex<HandleState>,
}

impl ConnectionHandle {
    fn new(connect_string: &str, dispatcher: Dispatcher) -> Self {
        Self {
            connect_string: connect_string.to_string(),
            queue: CallQueue::new(format!("connection:{connect_string}"), dispatcher),
            state: Mutex::new(HandleState::default()),
        }
    }

    pub fn connect_string(&self) -> &str {
        &self.connect_string
    }

    /// Queue serializing every call on the native connection.
    pub fn queue(&self) -> &Arc<CallQueue> {
        &self.queue
    }

    pub fn native(&self) -> DbxResult<Arc<dyn NativeConnection>> {
        self.state
            .lock()
            .native
            .clone()
            .ok_or_else(|| DbxError::ConnectionClosed(self.connect_string.clone()))
    }

    pub fn refcount(&self) -> usize {
        self.state.lock().refcount
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_disconnecting(&self) -> bool {
        self.state.lock().disconnecting
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionHandle")
            .field("connect_string", &self.connect_string)
            .field("refcount", &state.refcount)
            .field("connected", &state.connected)
            .field("disconnecting", &state.disconnecting)
            .finish()
    }
}

enum Acquire {
    Ready(ConnectCallback),
    Wait,
    Connect,
}

/// Registry of shared connections, keyed by connect string.
pub struct ConnectionRegistry {
    driver: Arc<dyn NativeDriver>,
    dispatcher: Dispatcher,
    initialized: OnceLock<Result<(), NativeError>>,
    entries: DashMap<String, Arc<ConnectionHandle>>,
    /// Delayed teardowns of idle connections
    linger: Timer,
    teardowns: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(driver: Arc<dyn NativeDriver>, dispatcher: Dispatcher) -> Arc<Self> {
        Arc::new(Self {
            driver,
            dispatcher,
            initialized: OnceLock::new(),
            entries: DashMap::new(),
            linger: Timer::new("dbx-cluster-linger"),
            teardowns: AtomicU64::new(0),
        })
    }

    /// Registry dispatching the way `props` asks.
    pub fn from_properties(
        driver: Arc<dyn NativeDriver>,
        props: &ConnectionProperties,
    ) -> DbxResult<Arc<Self>> {
        Ok(Self::new(driver, Dispatcher::from_properties(props)?))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Acquire the connection for `props.connect_string`, connecting on first use.
    #[instrument(skip(self, props, callback), fields(connect_string = %props.connect_string))]
    pub fn get_connection(
        self: &Arc<Self>,
        props: &ConnectionProperties,
        callback: ConnectCallback,
    ) {
        let init = self.initialized.get_or_init(|| {
            info!("Initializing native client library");
            self.driver.initialize()
        });
        if let Err(err) = init {
            callback(Err(err.clone().into()));
            return;
        }

        let connect_string = props.connect_string.as_str();
        let (handle, action) = loop {
            let handle = self
                .entries
                .entry(connect_string.to_string())
                .or_insert_with(|| {
                    Arc::new(ConnectionHandle::new(connect_string, self.dispatcher.clone()))
                })
                .clone();

            let mut state = handle.state.lock();
            if state.disconnecting {
                drop(state);
                self.entries
                    .remove_if(connect_string, |_, h| Arc::ptr_eq(h, &handle));
                continue;
            }
            state.refcount += 1;
            state.generation += 1;
            let action = if state.connected {
                Acquire::Ready(callback)
            } else if state.connecting {
                state.pending.push(callback);
                Acquire::Wait
            } else {
                state.connecting = true;
                state.pending.push(callback);
                Acquire::Connect
            };
            debug!(refcount = state.refcount, "connection acquired");
            drop(state);
            break (handle, action);
        };

        match action {
            Acquire::Ready(callback) => callback(Ok(handle)),
            Acquire::Wait => {}
            Acquire::Connect => self.start_connect(handle, props),
        }
    }

    fn start_connect(self: &Arc<Self>, handle: Arc<ConnectionHandle>, props: &ConnectionProperties) {
        let driver = Arc::clone(&self.driver);
        let connect_string = props.connect_string.clone();
        let timeout_ms = props.connect_timeout_ms;
        let attempts = props.connect_retries + 1;
        let registry = Arc::clone(self);
        let target = Arc::clone(&handle);

        handle.queue.enqueue(
            QueuedCall::new("connect", move || {
                let mut last = None;
                for attempt in 1..=attempts {
                    let connected = driver.connect(&connect_string).and_then(|conn| {
                        conn.wait_until_ready(timeout_ms)?;
                        Ok(conn)
                    });
                    match connected {
                        Ok(conn) => return Ok(conn),
                        Err(err) => {
                            warn!(attempt, attempts, "connect to {} failed: {}", connect_string, err);
                            last = Some(err);
                        }
                    }
                }
                Err(last.map(DbxError::from).unwrap_or_else(|| {
                    DbxError::ConnectionClosed(connect_string.clone())
                }))
            })
            .on_complete(move |result| registry.finish_connect(target, result)),
        );
    }

    fn finish_connect(
        &self,
        handle: Arc<ConnectionHandle>,
        result: DbxResult<Arc<dyn NativeConnection>>,
    ) {
        let (pending, failed) = {
            let mut state = handle.state.lock();
            state.connecting = false;
            let pending = std::mem::take(&mut state.pending);
            let failed = match result {
                Ok(native) => {
                    state.native = Some(native);
                    state.connected = true;
                    None
                }
                Err(err) => {
                    // waiters never receive the handle, so they never release it
                    state.refcount = state.refcount.saturating_sub(pending.len());
                    if state.refcount == 0 {
                        state.disconnecting = true;
                    }
                    Some(err)
                }
            };
            (pending, failed)
        };

        match failed {
            None => {
                info!("Connected to {}", handle.connect_string);
                for callback in pending {
                    callback(Ok(Arc::clone(&handle)));
                }
            }
            Some(err) => {
                if handle.is_disconnecting() {
                    self.entries
                        .remove_if(&handle.connect_string, |_, h| Arc::ptr_eq(h, &handle));
                }
                for callback in pending {
                    callback(Err(err.clone()));
                }
            }
        }
    }

    /// Drop one reference; at zero the connection is torn down after `linger_ms`.
    pub fn release_connection(self: &Arc<Self>, connect_string: &str, linger_ms: u64) {
        let Some(handle) = self.entries.get(connect_string).map(|e| Arc::clone(e.value())) else {
            warn!("release of unknown connection {}", connect_string);
            return;
        };

        let generation = {
            let mut state = handle.state.lock();
            if state.refcount == 0 {
                warn!("release of unreferenced connection {}", connect_string);
                return;
            }
            state.refcount -= 1;
            if state.refcount > 0 {
                debug!(refcount = state.refcount, "connection released");
                return;
            }
            state.generation += 1;
            state.generation
        };

        if linger_ms == 0 {
            self.teardown(&handle, generation);
            return;
        }

        debug!("Connection {} idle, lingering {}ms", connect_string, linger_ms);
        let registry = Arc::downgrade(self);
        let lingering = Arc::clone(&handle);
        let scheduled = self.linger.schedule(
            Duration::from_millis(linger_ms),
            Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.teardown(&lingering, generation);
                }
            }),
        );
        if let Err(e) = scheduled {
            warn!("failed to schedule linger, disconnecting now: {e}");
            self.teardown(&handle, generation);
        }
    }

    fn teardown(&self, handle: &Arc<ConnectionHandle>, generation: u64) {
        let native = {
            let mut state = handle.state.lock();
            if state.refcount != 0 || state.generation != generation || state.disconnecting {
                debug!("teardown of {} cancelled", handle.connect_string);
                return;
            }
            state.disconnecting = true;
            state.connected = false;
            state.native.take()
        };

        self.entries
            .remove_if(&handle.connect_string, |_, h| Arc::ptr_eq(h, handle));
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        info!("Disconnecting from {}", handle.connect_string);

        if let Some(native) = native {
            let connect_string = handle.connect_string.clone();
            handle.queue.enqueue(
                QueuedCall::new("disconnect", move || native.disconnect()).on_complete(
                    move |result| {
                        if let Err(err) = result {
                            warn!("disconnect from {} failed: {}", connect_string, err);
                        }
                    },
                ),
            );
        }
    }

    /// Live handle for `connect_string`, if any.
    pub fn entry(&self, connect_string: &str) -> Option<Arc<ConnectionHandle>> {
        self.entries.get(connect_string).map(|e| Arc::clone(e.value()))
    }

    /// Timer holding lingering teardowns.
    pub fn linger_timer(&self) -> &Timer {
        &self.linger
    }

    /// Number of connections actually torn down.
    pub fn teardown_count(&self) -> u64 {
        self.teardowns.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::wait;
    use crate::native::memory::MemoryCluster;

    fn props() -> ConnectionProperties {
        let mut props = ConnectionProperties::new("mem:1186");
        props.dispatch = crate::config::DispatchMode::Inline;
        props.linger_on_close_ms = 0;
        props
    }

    fn registry(cluster: &MemoryCluster) -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(Arc::new(cluster.clone()), Dispatcher::Inline)
    }

    #[test]
    fn test_shared_handle_and_single_init() {
        let cluster = MemoryCluster::new();
        let registry = registry(&cluster);
        let p = props();

        let a = wait(|cb| registry.get_connection(&p, cb)).unwrap();
        let b = wait(|cb| registry.get_connection(&p, cb)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 2);
        assert_eq!(cluster.stats().connects, 1);
        assert_eq!(cluster.stats().initializations, 1);
    }

    #[test]
    fn test_refcount_never_negative_and_teardown_once() {
        let cluster = MemoryCluster::new();
        let registry = registry(&cluster);
        let p = props();

        let handle = wait(|cb| registry.get_connection(&p, cb)).unwrap();
        registry.release_connection(&p.connect_string, 0);
        registry.release_connection(&p.connect_string, 0);
        assert_eq!(handle.refcount(), 0);
        assert!(handle.is_disconnecting());
        assert_eq!(registry.teardown_count(), 1);
        assert_eq!(cluster.stats().disconnects, 1);

        let fresh = wait(|cb| registry.get_connection(&p, cb)).unwrap();
        assert!(!Arc::ptr_eq(&handle, &fresh));
        assert_eq!(cluster.stats().connects, 2);
    }

    #[test]
    fn test_linger_cancelled_by_new_reference() {
        let cluster = MemoryCluster::new();
        let registry = registry(&cluster);
        let p = props();

        let first = wait(|cb| registry.get_connection(&p, cb)).unwrap();
        registry.release_connection(&p.connect_string, 50);
        let second = wait(|cb| registry.get_connection(&p, cb)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(registry.teardown_count(), 0);
        assert!(second.is_connected());
    }

    #[test]
    fn test_linger_expires() {
        let cluster = MemoryCluster::new();
        let registry = registry(&cluster);
        let p = props();

        wait(|cb| registry.get_connection(&p, cb)).unwrap();
        registry.release_connection(&p.connect_string, 20);
        assert_eq!(registry.teardown_count(), 0);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(registry.teardown_count(), 1);
        assert!(registry.entry(&p.connect_string).is_none());
    }

    #[test]
    fn test_release_churn_shares_one_timer() {
        let cluster = MemoryCluster::new();
        let registry = registry(&cluster);
        let p = props();

        let handle = wait(|cb| registry.get_connection(&p, cb)).unwrap();
        registry.release_connection(&p.connect_string, 30);
        for _ in 0..50 {
            wait(|cb| registry.get_connection(&p, cb)).unwrap();
            registry.release_connection(&p.connect_string, 30);
        }
        assert!(registry.linger_timer().is_running());

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(registry.linger_timer().pending(), 0);
        assert_eq!(registry.teardown_count(), 1);
        assert_eq!(cluster.stats().connects, 1);
        assert_eq!(cluster.stats().disconnects, 1);
        assert!(handle.is_disconnecting());
    }

    #[test]
    fn test_connect_retries_then_fails() {
        let cluster = MemoryCluster::new();
        let registry = registry(&cluster);
        let mut p = props();
        p.connect_retries = 1;

        cluster.fail_connects(1);
        assert!(wait(|cb| registry.get_connection(&p, cb)).is_ok());

        let other = ConnectionProperties {
            connect_string: "mem:2".to_string(),
            ..p.clone()
        };
        cluster.fail_connects(2);
        let err = wait(|cb| registry.get_connection(&other, cb)).unwrap_err();
        assert!(err.native().is_some());
        assert!(registry.entry("mem:2").is_none());
    }

    #[test]
    fn test_not_ready_cluster() {
        let cluster = MemoryCluster::new();
        cluster.set_ready(false);
        let registry = registry(&cluster);
        let mut p = props();
        p.connect_retries = 0;
        assert!(wait(|cb| registry.get_connection(&p, cb)).is_err());
    }
}
