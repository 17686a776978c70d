//! Dispatch — where blocking native calls run
//!
//! A native call blocks its thread until the storage engine answers. The
//! [`CallQueue`](crate::queue::CallQueue) decides *when* a call may run; the
//! [`Dispatcher`] decides *where*: inline on the enqueuing thread, or on a
//! fixed rayon pool. Delayed work (connection linger) goes to a [`Timer`].

use crate::config::{ConnectionProperties, DispatchMode};
use crate::error::{DbxError, DbxResult};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Completion callback used throughout the driver.
pub type Callback<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// A unit of work handed to a dispatcher.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs queued native calls.
#[derive(Clone)]
pub enum Dispatcher {
    /// Run on the caller's thread. Completions re-enter synchronously.
    Inline,
    /// Run on a shared worker pool.
    Threads(Arc<WorkerPool>),
}

impl Dispatcher {
    pub fn from_properties(props: &ConnectionProperties) -> DbxResult<Self> {
        Ok(match props.dispatch {
            DispatchMode::Inline => Dispatcher::Inline,
            DispatchMode::Threads => {
                Dispatcher::Threads(Arc::new(WorkerPool::new(props.worker_threads)?))
            }
        })
    }

    pub fn dispatch(&self, job: Job) {
        match self {
            Dispatcher::Inline => job(),
            Dispatcher::Threads(pool) => pool.submit(job),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatcher::Inline => f.write_str("Dispatcher::Inline"),
            Dispatcher::Threads(pool) => write!(f, "Dispatcher::Threads({})", pool.size()),
        }
    }
}

/// Fixed-size worker pool backed by a rayon [`ThreadPool`].
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    pub fn new(size: usize) -> DbxResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(size.max(1))
            .thread_name(|i| format!("dbx-cluster-worker-{i}"))
            .panic_handler(|_| error!("job panicked on a dispatch worker"))
            .build()
            .map_err(|e| {
                DbxError::invalid_operation(
                    format!("failed to create worker pool: {e}"),
                    "WorkerPool::new",
                )
            })?;
        debug!(threads = pool.current_num_threads(), "worker pool started");
        Ok(Self { pool })
    }

    pub fn size(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Jobs spawned from a worker still run in submission order.
    fn submit(&self, job: Job) {
        self.pool.spawn_fifo(job);
    }
}

// ════════════════════════════════════════════
// Timer
// ════════════════════════════════════════════

#[derive(Default)]
struct TimerState {
    /// Keyed by deadline, then arrival order
    jobs: BTreeMap<(Instant, u64), Job>,
    next_seq: u64,
    running: bool,
    shutdown: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// One thread running delayed jobs in deadline order.
///
/// The thread starts on the first [`schedule`](Timer::schedule) and exits
/// when the timer is dropped; jobs still pending at that point never run.
pub struct Timer {
    name: String,
    shared: Arc<TimerShared>,
}

impl Timer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(TimerShared::default()),
        }
    }

    /// Run `job` on the timer thread once `delay` has passed.
    pub fn schedule(&self, delay: Duration, job: Job) -> DbxResult<()> {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.state.lock();
        if !state.running {
            let shared = Arc::clone(&self.shared);
            std::thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || run_timer(&shared))?;
            state.running = true;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert((deadline, seq), job);
        drop(state);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Jobs waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

fn run_timer(shared: &TimerShared) {
    let mut state = shared.state.lock();
    while !state.shutdown {
        let next = state.jobs.first_key_value().map(|(&(deadline, _), _)| deadline);
        match next {
            Some(deadline) if deadline <= Instant::now() => {
                if let Some((_, job)) = state.jobs.pop_first() {
                    MutexGuard::unlocked(&mut state, job);
                }
            }
            Some(deadline) => {
                shared.wake.wait_until(&mut state, deadline);
            }
            None => shared.wake.wait(&mut state),
        }
    }
    trace!(dropped = state.jobs.len(), "timer exiting");
}

/// Block the current thread until a callback-style call completes.
///
/// `start` receives the callback to hand to the asynchronous API.
///
/// # Example
/// ```rust,ignore
/// let session = dispatch::wait(|cb| pool.get_session(cb))?;
/// ```
pub fn wait<T, F>(start: F) -> DbxResult<T>
where
    T: Send + 'static,
    F: FnOnce(Callback<DbxResult<T>>),
{
    let (tx, rx) = mpsc::channel();
    start(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.recv().map_err(|_| {
        DbxError::invalid_operation("callback dropped without being invoked", "dispatch::wait")
    })?
}
