//! Scan driver
//!
//! ```text
//! open_scan ─▶ fetch ─┬─ More ───────▶ (drained inside the same call)
//!                     ├─ CacheEmpty ─▶ fetch
//!                     └─ End ────────▶ close_scan ─▶ done(rows)
//! ```
//!
//! Every step is a separate call on the session's queue, so other calls on
//! the session may interleave between fetches. The skip/limit window is
//! applied here; reaching the limit closes the scan early.

use crate::dispatch::Callback;
use crate::error::{DbxError, DbxResult};
use crate::native::{ContextId, FetchStatus, NativeResult, ScanHelper, ScanId};
use crate::operation::Operation;
use crate::queue::QueuedCall;
use crate::schema::Row;
use crate::session::SessionCore;
use std::sync::Arc;
use tracing::trace;

/// Skip/limit window over the rows of one scan.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Window {
    skip: usize,
    limit: Option<usize>,
    seen: usize,
}

impl Window {
    pub(crate) fn new(skip: usize, limit: Option<usize>) -> Self {
        Self {
            skip,
            limit,
            seen: 0,
        }
    }

    /// Keep `row` if it falls inside the window.
    pub(crate) fn offer(&mut self, rows: &mut Vec<Row>, row: Row) {
        self.seen += 1;
        if self.seen > self.skip && !self.is_full(rows) {
            rows.push(row);
        }
    }

    pub(crate) fn is_full(&self, rows: &[Row]) -> bool {
        self.limit.is_some_and(|limit| rows.len() >= limit)
    }
}

struct ScanRun {
    session: Arc<SessionCore>,
    operations: Arc<Vec<Operation>>,
    position: usize,
    window: Window,
    rows: Vec<Row>,
    done: Callback<DbxResult<Vec<Row>>>,
}

/// Run the scan at `position` to completion under `ctx`.
pub(crate) fn run_scan(
    session: Arc<SessionCore>,
    ctx: ContextId,
    operations: Arc<Vec<Operation>>,
    position: usize,
    helper: ScanHelper,
    done: Callback<DbxResult<Vec<Row>>>,
) {
    let (skip, limit) = operations[position].scan_window();
    let run = ScanRun {
        session: Arc::clone(&session),
        operations,
        position,
        window: Window::new(skip, limit),
        rows: Vec::new(),
        done,
    };

    if limit == Some(0) {
        (run.done)(Ok(Vec::new()));
        return;
    }

    let native = Arc::clone(session.native());
    let call = QueuedCall::new("open_scan", move || native.open_scan(ctx, &helper)).on_complete(
        move |opened: NativeResult<ScanId>| match opened {
            Ok(scan) => {
                trace!(?scan, "scan opened");
                fetch(run, scan);
            }
            Err(err) => (run.done)(Err(err.into())),
        },
    );
    session.queue().enqueue(call);
}

fn fetch(run: ScanRun, scan: ScanId) {
    let native = Arc::clone(run.session.native());
    let queue = Arc::clone(run.session.queue());
    let call = QueuedCall::new("fetch", move || -> NativeResult<(Vec<Vec<u8>>, FetchStatus)> {
        let mut rows = Vec::new();
        loop {
            let batch = native.fetch(scan, 0)?;
            rows.extend(batch.rows);
            if batch.status != FetchStatus::More {
                return Ok((rows, batch.status));
            }
        }
    })
    .on_complete(move |fetched: NativeResult<(Vec<Vec<u8>>, FetchStatus)>| {
        let mut run = run;
        let (encoded, status) = match fetched {
            Ok(fetched) => fetched,
            Err(err) => return close(run, scan, Some(err.into())),
        };

        let op = &run.operations[run.position];
        for buf in &encoded {
            match op.decode_scan_row(buf) {
                Ok(row) => run.window.offer(&mut run.rows, row),
                Err(err) => return close(run, scan, Some(err)),
            }
        }

        if status == FetchStatus::CacheEmpty && !run.window.is_full(&run.rows) {
            fetch(run, scan);
        } else {
            close(run, scan, None);
        }
    });
    queue.enqueue(call);
}

fn close(run: ScanRun, scan: ScanId, error: Option<DbxError>) {
    let native = Arc::clone(run.session.native());
    let call = QueuedCall::new("close_scan", move || native.close_scan(scan)).on_complete(
        move |closed: NativeResult<()>| {
            let ScanRun { rows, done, .. } = run;
            match (error, closed) {
                (Some(err), _) => done(Err(err)),
                (None, Err(err)) => done(Err(err.into())),
                (None, Ok(())) => {
                    trace!(?scan, rows = rows.len(), "scan closed");
                    done(Ok(rows))
                }
            }
        },
    );
    run.session.queue().enqueue(call);
}
