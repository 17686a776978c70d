//! Transaction context pool
//!
//! A session owns a fixed set of native transaction contexts. `seize` hands
//! out a free one or queues the caller; `release` gives the context straight
//! to the oldest waiter, so waiters are served in FIFO order and the number
//! of seized contexts never exceeds the capacity.

use crate::dispatch::{Callback, Job};
use crate::native::ContextId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, trace};

struct PoolState {
    free: Vec<ContextId>,
    waiters: VecDeque<Callback<ContextId>>,
    seized: usize,
    high_water: usize,
}

pub struct ContextPool {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, usize::try_from(u32::MAX).unwrap_or(usize::MAX));
        Self {
            capacity,
            state: Mutex::new(PoolState {
                free: (0..capacity)
                    .rev()
                    .filter_map(|i| u32::try_from(i).ok())
                    .map(ContextId)
                    .collect(),
                waiters: VecDeque::new(),
                seized: 0,
                high_water: 0,
            }),
        }
    }

    /// Seize a context; `granted` runs now if one is free, else on a later release.
    pub fn seize(&self, granted: Callback<ContextId>) {
        let ctx = {
            let mut state = self.state.lock();
            match state.free.pop() {
                Some(ctx) => {
                    state.seized += 1;
                    state.high_water = state.high_water.max(state.seized);
                    ctx
                }
                None => {
                    state.waiters.push_back(granted);
                    debug!(waiting = state.waiters.len(), "all transaction contexts seized");
                    return;
                }
            }
        };
        trace!(?ctx, "context seized");
        granted(ctx);
    }

    /// Release `ctx`. A waiting seizer takes it over; its grant is returned
    /// for the caller to run once it no longer holds any lock.
    #[must_use = "the returned grant must be run"]
    pub fn release(&self, ctx: ContextId) -> Option<Job> {
        let mut state = self.state.lock();
        match state.waiters.pop_front() {
            Some(waiter) => {
                trace!(?ctx, "context handed to waiter");
                Some(Box::new(move || waiter(ctx)))
            }
            None => {
                state.free.push(ctx);
                state.seized = state.seized.saturating_sub(1);
                None
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn seized(&self) -> usize {
        self.state.lock().seized
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Most contexts ever seized at once.
    pub fn high_water(&self) -> usize {
        self.state.lock().high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(log: &Arc<Mutex<Vec<(usize, ContextId)>>>, who: usize) -> Callback<ContextId> {
        let log = Arc::clone(log);
        Box::new(move |ctx| log.lock().push((who, ctx)))
    }

    #[test]
    fn test_bound_and_fifo_handoff() {
        let pool = ContextPool::new(2);
        let log = Arc::new(Mutex::new(Vec::new()));
        for who in 0..5 {
            pool.seize(record(&log, who));
        }
        assert_eq!(pool.seized(), 2);
        assert_eq!(pool.waiting(), 3);

        let first = log.lock()[0].1;
        pool.release(first).unwrap()();
        let second = log.lock()[1].1;
        pool.release(second).unwrap()();

        let order: Vec<usize> = log.lock().iter().map(|(who, _)| *who).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(log.lock()[2].1, first);
        assert_eq!(pool.seized(), 2);
        assert_eq!(pool.high_water(), 2);
    }

    #[test]
    fn test_zero_capacity_still_grants_one() {
        let pool = ContextPool::new(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        pool.seize(record(&log, 0));
        pool.seize(record(&log, 1));
        assert_eq!(log.lock().as_slice(), &[(0, ContextId(0))]);
        assert_eq!(pool.waiting(), 1);
    }

    #[test]
    fn test_release_without_waiters_frees() {
        let pool = ContextPool::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        pool.seize(record(&log, 0));
        let ctx = log.lock()[0].1;
        assert!(pool.release(ctx).is_none());
        assert_eq!(pool.seized(), 0);
        pool.seize(record(&log, 1));
        assert_eq!(log.lock()[1].1, ctx);
    }
}
