//! Call Queue — 네이티브 핸들 호출 직렬화
//!
//! A native handle can execute one call at a time. Every handle owns one
//! `CallQueue`; calls are started strictly in enqueue order and at most one
//! call per queue is in flight.
//!
//! Completion of a call runs in three stages:
//!
//! ```text
//! work() ─▶ while_holding steps ─▶ advance (start next call) ─▶ deferred steps ─▶ on_complete
//! ```
//!
//! `while_holding` steps run before the next queued call can start and may
//! push follow-up steps onto [`Deferred`], which run right after the queue has
//! advanced. There is no cancellation: a call that never returns blocks its
//! queue.

use crate::dispatch::{Callback, Dispatcher, Job};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Steps to run once the queue has advanced past the current call.
#[derive(Default)]
pub struct Deferred {
    steps: Vec<Job>,
}

impl Deferred {
    pub fn push(&mut self, step: impl FnOnce() + Send + 'static) {
        self.steps.push(Box::new(step));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn run(self) {
        for step in self.steps {
            step();
        }
    }
}

type HoldingStep<T> = Box<dyn FnOnce(&mut T, &mut Deferred) + Send + 'static>;

/// One native call plus its continuations.
pub struct QueuedCall<T> {
    label: &'static str,
    work: Box<dyn FnOnce() -> T + Send + 'static>,
    while_holding: Vec<HoldingStep<T>>,
    on_complete: Option<Callback<T>>,
}

impl<T: Send + 'static> QueuedCall<T> {
    pub fn new(label: &'static str, work: impl FnOnce() -> T + Send + 'static) -> Self {
        Self {
            label,
            work: Box::new(work),
            while_holding: Vec::new(),
            on_complete: None,
        }
    }

    /// Step run after the native call returns, before the queue advances.
    pub fn while_holding(
        mut self,
        step: impl FnOnce(&mut T, &mut Deferred) + Send + 'static,
    ) -> Self {
        self.while_holding.push(Box::new(step));
        self
    }

    /// The caller's callback, run last.
    pub fn on_complete(mut self, callback: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    fn into_job(self, queue: Arc<CallQueue>) -> Job {
        Box::new(move || {
            let QueuedCall {
                label,
                work,
                while_holding,
                on_complete,
            } = self;

            let mut result = work();
            let mut deferred = Deferred::default();
            for step in while_holding {
                step(&mut result, &mut deferred);
            }
            queue.completed.fetch_add(1, Ordering::Relaxed);
            trace!(queue = %queue.name, call = label, "call completed");

            queue.advance();
            deferred.run();
            if let Some(callback) = on_complete {
                callback(result);
            }
        })
    }
}

#[derive(Default)]
struct QueueState {
    running: bool,
    pending: VecDeque<Job>,
}

/// FIFO serializer for one native handle.
pub struct CallQueue {
    name: String,
    dispatcher: Dispatcher,
    state: Mutex<QueueState>,
    enqueued: AtomicU64,
    completed: AtomicU64,
}

impl CallQueue {
    pub fn new(name: impl Into<String>, dispatcher: Dispatcher) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            dispatcher,
            state: Mutex::new(QueueState::default()),
            enqueued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Append a call. Returns its queue position: 0 means it started immediately.
    pub fn enqueue<T: Send + 'static>(self: &Arc<Self>, call: QueuedCall<T>) -> usize {
        let label = call.label;
        let job = call.into_job(Arc::clone(self));
        self.enqueued.fetch_add(1, Ordering::Relaxed);

        let position = {
            let mut state = self.state.lock();
            if state.running {
                state.pending.push_back(job);
                state.pending.len()
            } else {
                state.running = true;
                drop(state);
                trace!(queue = %self.name, call = label, "starting call");
                self.dispatcher.dispatch(job);
                return 0;
            }
        };
        trace!(queue = %self.name, call = label, position, "call queued");
        position
    }

    /// Start the next pending call, or mark the queue idle.
    fn advance(&self) {
        let next = {
            let mut state = self.state.lock();
            match state.pending.pop_front() {
                Some(job) => Some(job),
                None => {
                    state.running = false;
                    None
                }
            }
        };
        if let Some(job) = next {
            self.dispatcher.dispatch(job);
        }
    }

    /// Calls waiting behind the running one.
    pub fn depth(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        !self.state.lock().running
    }

    pub fn enqueued_count(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CallQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallQueue")
            .field("name", &self.name)
            .field("depth", &self.depth())
            .field("enqueued", &self.enqueued_count())
            .field("completed", &self.completed_count())
            .finish()
    }
}
