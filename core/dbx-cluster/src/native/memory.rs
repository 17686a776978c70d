//! In-Memory Cluster — 인프로세스 스토리지 엔진
//!
//! A complete implementation of the native boundary backed by
//! `BTreeMap<primary key bytes, Row>` per table. Used by the test suite and
//! for running the driver without a cluster.
//!
//! Besides storage it records what the driver asked of it:
//! - call counters ([`ClusterStats`]) and a sequenced call log ([`CallRecord`])
//! - overlap detection: a handle entered while already busy is counted
//! - fault injection: connect failures, scan timeouts, execute failures,
//!   cluster-not-ready, per-call latency
//!
//! Transactions stage their writes per [`ContextId`]; commit applies them
//! unless a write operation failed, in which case the whole transaction is
//! discarded.

use super::{
    ContextId, ExecMode, FetchBatch, FetchStatus, NativeConnection, NativeDriver, NativeResult,
    NativeSession, OpCode, OperationHelper, ScanHelper, ScanId,
};
use crate::error::{Classification, DbxError, DbxResult, NativeError};
use crate::filter::bounds::total_cmp;
use crate::schema::{Row, TableMetadata};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Rows per server round trip when the scan asks for the default.
const DEFAULT_SCAN_BATCH: usize = 16;

const NO_SUCH_TABLE_CODE: i32 = 723;
const ILLEGAL_NULL_CODE: i32 = 839;
const CLUSTER_FAILURE_CODE: i32 = 4009;
const INTERNAL_CODE: i32 = 4000;

fn internal(err: DbxError) -> NativeError {
    NativeError::new(INTERNAL_CODE, Classification::InternalError, err.to_string())
}

fn no_such_table(name: &str) -> NativeError {
    NativeError::new(
        NO_SUCH_TABLE_CODE,
        Classification::SchemaError,
        format!("No such table existed: {name}"),
    )
}

// ════════════════════════════════════════════
// Statistics & call log
// ════════════════════════════════════════════

#[derive(Default)]
struct Counters {
    initializations: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    tables_opened: AtomicU64,
    tables_closed: AtomicU64,
    list_tables: AtomicU64,
    executes: AtomicU64,
    scans_opened: AtomicU64,
    scans_closed: AtomicU64,
    fetches: AtomicU64,
    auto_increment_fetches: AtomicU64,
    auto_increment_values: AtomicU64,
    overlaps: AtomicU64,
}

/// Snapshot of the calls the cluster has served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub initializations: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub tables_opened: u64,
    pub tables_closed: u64,
    pub list_tables: u64,
    pub executes: u64,
    pub scans_opened: u64,
    pub scans_closed: u64,
    pub fetches: u64,
    pub auto_increment_fetches: u64,
    pub auto_increment_values: u64,
    /// Calls that entered a handle while another call was running on it
    pub overlaps: u64,
}

/// Handle a call ran against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Connection,
    Session(u64),
}

/// One served call, stamped with a global sequence at entry and exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub target: CallTarget,
    pub call: &'static str,
    pub context: Option<ContextId>,
    pub detail: String,
    pub started: u64,
    pub finished: u64,
}

#[derive(Default)]
struct Faults {
    connect_failures: u32,
    scan_timeouts: u32,
    execute_failure: Option<NativeError>,
    not_ready: bool,
    latency: Duration,
}

struct MemTable {
    meta: TableMetadata,
    rows: BTreeMap<Vec<u8>, Row>,
    next_auto_increment: u64,
}

struct ClusterState {
    tables: RwLock<HashMap<String, MemTable>>,
    next_handle: AtomicU64,
    next_session: AtomicU64,
    next_scan: AtomicU64,
    sequence: AtomicU64,
    counters: Counters,
    faults: Mutex<Faults>,
    calls: Mutex<Vec<CallRecord>>,
}

impl ClusterState {
    /// Run `f` as one call on the handle guarded by `busy`.
    fn serve<T>(
        &self,
        busy: &AtomicBool,
        target: CallTarget,
        call: &'static str,
        context: Option<ContextId>,
        detail: impl Into<String>,
        f: impl FnOnce() -> T,
    ) -> T {
        if busy.swap(true, Ordering::SeqCst) {
            self.counters.overlaps.fetch_add(1, Ordering::SeqCst);
            debug!(?target, call, "overlapping native call");
        }
        let started = self.sequence.fetch_add(1, Ordering::SeqCst);

        let latency = self.faults.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let result = f();

        let finished = self.sequence.fetch_add(1, Ordering::SeqCst);
        busy.store(false, Ordering::SeqCst);
        self.calls.lock().push(CallRecord {
            target,
            call,
            context,
            detail: detail.into(),
            started,
            finished,
        });
        result
    }
}

fn qualified(database: &str, name: &str) -> String {
    format!("{database}.{name}")
}

// ════════════════════════════════════════════
// Cluster (driver)
// ════════════════════════════════════════════

/// In-process cluster implementing [`NativeDriver`].
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ClusterState {
                tables: RwLock::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                next_session: AtomicU64::new(1),
                next_scan: AtomicU64::new(1),
                sequence: AtomicU64::new(0),
                counters: Counters::default(),
                faults: Mutex::new(Faults::default()),
                calls: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a table. An existing table of the same name is replaced.
    pub fn create_table(&self, meta: TableMetadata) {
        let name = meta.qualified_name();
        debug!("Creating table {}", name);
        self.state.tables.write().insert(
            name,
            MemTable {
                meta,
                rows: BTreeMap::new(),
                next_auto_increment: 1,
            },
        );
    }

    /// Store a committed row directly, bypassing transactions.
    pub fn insert_row(&self, database: &str, table: &str, row: Row) -> DbxResult<()> {
        let mut tables = self.state.tables.write();
        let mem = tables
            .get_mut(&qualified(database, table))
            .ok_or_else(|| DbxError::TableNotFound(table.to_string()))?;
        let key = primary_key_bytes(&mem.meta, &row)?;
        mem.rows.insert(key, row);
        Ok(())
    }

    /// Committed rows in primary-key byte order.
    pub fn rows(&self, database: &str, table: &str) -> Vec<Row> {
        self.state
            .tables
            .read()
            .get(&qualified(database, table))
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ClusterStats {
        let c = &self.state.counters;
        let load = |a: &AtomicU64| a.load(Ordering::SeqCst);
        ClusterStats {
            initializations: load(&c.initializations),
            connects: load(&c.connects),
            disconnects: load(&c.disconnects),
            sessions_opened: load(&c.sessions_opened),
            sessions_closed: load(&c.sessions_closed),
            tables_opened: load(&c.tables_opened),
            tables_closed: load(&c.tables_closed),
            list_tables: load(&c.list_tables),
            executes: load(&c.executes),
            scans_opened: load(&c.scans_opened),
            scans_closed: load(&c.scans_closed),
            fetches: load(&c.fetches),
            auto_increment_fetches: load(&c.auto_increment_fetches),
            auto_increment_values: load(&c.auto_increment_values),
            overlaps: load(&c.overlaps),
        }
    }

    /// Served calls, in completion order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.calls.lock().clone()
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_connects(&self, n: u32) {
        self.state.faults.lock().connect_failures = n;
    }

    /// Abort the next `n` scan fetches with a scan timeout.
    pub fn fail_scan_fetches(&self, n: u32) {
        self.state.faults.lock().scan_timeouts = n;
    }

    /// Fail the next execute call at transaction level.
    pub fn fail_next_execute(&self, err: NativeError) {
        self.state.faults.lock().execute_failure = Some(err);
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.faults.lock().not_ready = !ready;
    }

    /// Sleep inside every native call.
    pub fn set_latency(&self, latency: Duration) {
        self.state.faults.lock().latency = latency;
    }
}

fn primary_key_bytes(meta: &TableMetadata, row: &Row) -> DbxResult<Vec<u8>> {
    let pk = meta.primary_key();
    let values = pk
        .columns
        .iter()
        .map(|&c| {
            row.get(c).cloned().ok_or_else(|| {
                DbxError::invalid_operation(
                    format!("primary key column '{}' not set", meta.columns[c].name),
                    "MemoryCluster::insert_row",
                )
            })
        })
        .collect::<DbxResult<Vec<_>>>()?;
    let layout = meta.key_layout(0)?;
    let mut buf = layout.allocate();
    if let Some(err) = DbxError::merge_encoder_errors(layout.encode_key(&meta.columns, &values, &mut buf)) {
        return Err(err);
    }
    Ok(buf)
}

impl NativeDriver for MemoryCluster {
    fn initialize(&self) -> NativeResult<()> {
        self.state
            .counters
            .initializations
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connect(&self, connect_string: &str) -> NativeResult<Arc<dyn NativeConnection>> {
        {
            let mut faults = self.state.faults.lock();
            if faults.connect_failures > 0 {
                faults.connect_failures -= 1;
                return Err(NativeError::new(
                    CLUSTER_FAILURE_CODE,
                    Classification::UnknownResultError,
                    format!("Could not connect to {connect_string}"),
                ));
            }
        }
        self.state.counters.connects.fetch_add(1, Ordering::SeqCst);
        debug!("Connected to {}", connect_string);
        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            busy: AtomicBool::new(false),
        }))
    }
}

// ════════════════════════════════════════════
// Connection
// ════════════════════════════════════════════

struct MemoryConnection {
    state: Arc<ClusterState>,
    busy: AtomicBool,
}

impl MemoryConnection {
    fn serve<T>(
        &self,
        call: &'static str,
        detail: impl Into<String>,
        f: impl FnOnce(&ClusterState) -> T,
    ) -> T {
        let state = &self.state;
        state.serve(&self.busy, CallTarget::Connection, call, None, detail, || f(state))
    }
}

impl NativeConnection for MemoryConnection {
    fn wait_until_ready(&self, timeout_ms: u64) -> NativeResult<()> {
        self.serve("wait_until_ready", "", |state| {
            if state.faults.lock().not_ready {
                return Err(NativeError::new(
                    CLUSTER_FAILURE_CODE,
                    Classification::UnknownResultError,
                    format!("Cluster not ready after {timeout_ms}ms"),
                ));
            }
            Ok(())
        })
    }

    fn disconnect(&self) -> NativeResult<()> {
        self.serve("disconnect", "", |state| {
            state.counters.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn open_session(&self, database: &str) -> NativeResult<Arc<dyn NativeSession>> {
        self.serve("open_session", database, |state| {
            let id = state.next_session.fetch_add(1, Ordering::SeqCst);
            state.counters.sessions_opened.fetch_add(1, Ordering::SeqCst);
            trace!(session = id, "native session opened");
            Ok(Arc::new(MemorySession {
                id,
                state: Arc::clone(&self.state),
                busy: AtomicBool::new(false),
                staged: Mutex::new(HashMap::new()),
                scans: Mutex::new(HashMap::new()),
            }) as Arc<dyn NativeSession>)
        })
    }

    fn list_tables(&self, database: &str) -> NativeResult<Vec<String>> {
        self.serve("list_tables", database, |state| {
            state.counters.list_tables.fetch_add(1, Ordering::SeqCst);
            let mut names: Vec<String> = state
                .tables
                .read()
                .values()
                .filter(|t| t.meta.database == database)
                .map(|t| t.meta.name.clone())
                .collect();
            names.sort();
            Ok(names)
        })
    }

    fn get_table(&self, database: &str, name: &str) -> NativeResult<TableMetadata> {
        let key = qualified(database, name);
        self.serve("get_table", key.clone(), |state| {
            let tables = state.tables.read();
            let table = tables.get(&key).ok_or_else(|| no_such_table(&key))?;
            state.counters.tables_opened.fetch_add(1, Ordering::SeqCst);
            let handle = state.next_handle.fetch_add(1, Ordering::SeqCst);
            Ok(table.meta.clone().with_handle(handle))
        })
    }

    fn close_table(&self, table: &TableMetadata) -> NativeResult<()> {
        self.serve("close_table", table.qualified_name(), |state| {
            state.counters.tables_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn fetch_auto_increment(&self, table: &TableMetadata, count: u64) -> NativeResult<Vec<u64>> {
        let key = table.qualified_name();
        self.serve("fetch_auto_increment", format!("{key}:{count}"), |state| {
            let mut tables = state.tables.write();
            let mem = tables.get_mut(&key).ok_or_else(|| no_such_table(&key))?;
            let start = mem.next_auto_increment;
            mem.next_auto_increment += count;
            state
                .counters
                .auto_increment_fetches
                .fetch_add(1, Ordering::SeqCst);
            state
                .counters
                .auto_increment_values
                .fetch_add(count, Ordering::SeqCst);
            Ok((start..start + count).collect())
        })
    }
}

// ════════════════════════════════════════════
// Session
// ════════════════════════════════════════════

/// Writes staged by one transaction: `None` marks a delete.
type Staged = BTreeMap<(String, Vec<u8>), Option<Row>>;

struct OpenScan {
    context: ContextId,
    rows: VecDeque<Vec<u8>>,
    batch: usize,
    cached: usize,
}

struct MemorySession {
    id: u64,
    state: Arc<ClusterState>,
    busy: AtomicBool,
    staged: Mutex<HashMap<ContextId, Staged>>,
    scans: Mutex<HashMap<ScanId, OpenScan>>,
}

impl MemorySession {
    fn serve<T>(
        &self,
        call: &'static str,
        context: Option<ContextId>,
        detail: impl Into<String>,
        f: impl FnOnce() -> T,
    ) -> T {
        self.state
            .serve(&self.busy, CallTarget::Session(self.id), call, context, detail, f)
    }

    /// Rows of `meta` visible to a transaction: committed plus staged.
    fn visible_rows(&self, meta: &TableMetadata, staged: Option<&Staged>) -> Vec<(Vec<u8>, Row)> {
        let name = meta.qualified_name();
        let mut rows: BTreeMap<Vec<u8>, Row> = self
            .state
            .tables
            .read()
            .get(&name)
            .map(|t| t.rows.clone())
            .unwrap_or_default();
        if let Some(staged) = staged {
            for ((table, key), change) in staged {
                if *table != name {
                    continue;
                }
                match change {
                    Some(row) => {
                        rows.insert(key.clone(), row.clone());
                    }
                    None => {
                        rows.remove(key);
                    }
                }
            }
        }
        rows.into_iter().collect()
    }

    /// Find a row by the helper's key record; returns its primary key bytes.
    fn lookup(
        &self,
        helper: &OperationHelper,
        staged: &Staged,
    ) -> NativeResult<Option<(Vec<u8>, Row)>> {
        let meta = &helper.row_record;
        let key = helper
            .key_buffer
            .as_deref()
            .ok_or_else(|| internal(DbxError::invalid_operation("missing key buffer", "lookup")))?;

        if helper.key_record == 0 {
            let name = meta.qualified_name();
            if let Some(change) = staged.get(&(name.clone(), key.to_vec())) {
                return Ok(change.clone().map(|row| (key.to_vec(), row)));
            }
            return Ok(self
                .state
                .tables
                .read()
                .get(&name)
                .and_then(|t| t.rows.get(key).cloned())
                .map(|row| (key.to_vec(), row)));
        }

        let layout = meta.key_layout(helper.key_record).map_err(internal)?;
        let wanted = layout.decode_key(&meta.columns, key).map_err(internal)?;
        let index = &meta.indexes[helper.key_record];
        Ok(self
            .visible_rows(meta, Some(staged))
            .into_iter()
            .find(|(_, row)| {
                index.columns.iter().zip(&wanted).all(|(&c, want)| {
                    row.get(c)
                        .is_some_and(|v| total_cmp(v, want) == std::cmp::Ordering::Equal)
                })
            }))
    }

    fn apply(&self, helper: &mut OperationHelper, staged: &mut Staged) -> NativeResult<()> {
        if !helper.valid {
            return Err(internal(DbxError::invalid_operation(
                "operation helper not prepared",
                "execute",
            )));
        }
        let meta = Arc::clone(&helper.row_record);
        let name = meta.qualified_name();
        if !self.state.tables.read().contains_key(&name) {
            return Err(no_such_table(&name));
        }
        let found = self.lookup(helper, staged)?;

        match helper.opcode {
            OpCode::Read => {
                let (_, row) = found.ok_or_else(NativeError::no_such_tuple)?;
                let layout = meta.row_layout();
                let mut buf = layout.allocate();
                let (mask, errors) = layout.encode_row(&meta.columns, &row, &mut buf);
                if let Some(err) = DbxError::merge_encoder_errors(errors) {
                    return Err(internal(err));
                }
                helper.row_buffer = Some(buf);
                helper.column_mask = mask;
            }
            OpCode::Insert => {
                if found.is_some() {
                    return Err(NativeError::duplicate_key());
                }
                let row = decode_row(helper)?;
                check_not_null(&meta, &row)?;
                staged.insert((name, primary_key(helper)?), Some(row));
            }
            OpCode::Update => {
                let (key, mut existing) = found.ok_or_else(NativeError::no_such_tuple)?;
                merge(&mut existing, decode_row(helper)?);
                staged.insert((name, key), Some(existing));
            }
            OpCode::Write => {
                let row = decode_row(helper)?;
                match found {
                    Some((key, mut existing)) => {
                        merge(&mut existing, row);
                        staged.insert((name, key), Some(existing));
                    }
                    None => {
                        check_not_null(&meta, &row)?;
                        staged.insert((name, primary_key(helper)?), Some(row));
                    }
                }
            }
            OpCode::Delete => {
                let (key, _) = found.ok_or_else(NativeError::no_such_tuple)?;
                staged.insert((name, key), None);
            }
            OpCode::Scan => {
                return Err(internal(DbxError::invalid_operation(
                    "scan passed to execute",
                    "execute",
                )));
            }
        }
        Ok(())
    }

    fn commit(&self, staged: Staged) {
        let mut tables = self.state.tables.write();
        for ((table, key), change) in staged {
            if let Some(mem) = tables.get_mut(&table) {
                match change {
                    Some(row) => {
                        mem.rows.insert(key, row);
                    }
                    None => {
                        mem.rows.remove(&key);
                    }
                }
            }
        }
    }
}

fn decode_row(helper: &OperationHelper) -> NativeResult<Row> {
    let buf = helper
        .row_buffer
        .as_deref()
        .ok_or_else(|| internal(DbxError::invalid_operation("missing row buffer", "execute")))?;
    let meta = &helper.row_record;
    meta.row_layout()
        .decode_row(&meta.columns, buf, Some(&helper.column_mask))
        .map_err(internal)
}

fn primary_key(helper: &OperationHelper) -> NativeResult<Vec<u8>> {
    helper
        .key_buffer
        .clone()
        .ok_or_else(|| internal(DbxError::invalid_operation("missing key buffer", "execute")))
}

fn merge(existing: &mut Row, update: Row) {
    for (idx, value) in update.iter() {
        existing.set(idx, value.clone());
    }
}

fn check_not_null(meta: &TableMetadata, row: &Row) -> NativeResult<()> {
    match meta
        .columns
        .iter()
        .enumerate()
        .find(|(idx, c)| !c.nullable && row.get(*idx).is_none_or(|v| v.is_null()))
    {
        Some((_, column)) => Err(NativeError::new(
            ILLEGAL_NULL_CODE,
            Classification::ApplicationError,
            format!("Illegal null attribute '{}'", column.name),
        )),
        None => Ok(()),
    }
}

impl NativeSession for MemorySession {
    fn execute(
        &self,
        ctx: ContextId,
        operations: &mut [OperationHelper],
        mode: ExecMode,
    ) -> NativeResult<()> {
        let detail: Vec<&str> = operations.iter().map(|h| h.opcode.as_str()).collect();
        self.serve("execute", Some(ctx), format!("{mode:?} {}", detail.join(",")), || {
            self.state.counters.executes.fetch_add(1, Ordering::SeqCst);

            let mut staged_map = self.staged.lock();
            if let Some(err) = self.state.faults.lock().execute_failure.take() {
                staged_map.remove(&ctx);
                return Err(err);
            }

            let staged = staged_map.entry(ctx).or_default();
            let mut aborted = false;
            for helper in operations.iter_mut() {
                if let Err(err) = self.apply(helper, staged) {
                    aborted |= !helper.opcode.is_read();
                    helper.error = Some(err);
                }
            }

            match mode {
                ExecMode::NoCommit => {}
                ExecMode::Commit => {
                    if let Some(staged) = staged_map.remove(&ctx)
                        && !aborted
                    {
                        self.commit(staged);
                    }
                }
                ExecMode::Rollback => {
                    staged_map.remove(&ctx);
                }
            }
            Ok(())
        })
    }

    fn open_scan(&self, ctx: ContextId, scan: &ScanHelper) -> NativeResult<ScanId> {
        let meta = &scan.table_record;
        self.serve("open_scan", Some(ctx), meta.qualified_name(), || {
            self.state.counters.scans_opened.fetch_add(1, Ordering::SeqCst);

            let rows = {
                let staged = self.staged.lock();
                self.visible_rows(meta, staged.get(&ctx))
            };
            let first_column = scan
                .index_record
                .and_then(|i| meta.indexes.get(i))
                .and_then(|index| index.columns.first().copied());

            let mut matched = Vec::new();
            for (_, row) in rows {
                if let (Some(column), Some(line)) = (first_column, &scan.bounds) {
                    let inside = row
                        .get(column)
                        .is_some_and(|v| !v.is_null() && line.contains(v));
                    if !inside {
                        continue;
                    }
                }
                if let Some(filter) = &scan.filter
                    && !filter.evaluate(meta, &row).map_err(internal)?
                {
                    continue;
                }
                matched.push(row);
            }

            if scan.flags.ordered
                && let Some(index) = scan.index_record.and_then(|i| meta.indexes.get(i))
            {
                matched.sort_by(|a, b| {
                    index
                        .columns
                        .iter()
                        .map(|&c| match (a.get(c), b.get(c)) {
                            (Some(x), Some(y)) => total_cmp(x, y),
                            (x, y) => x.is_some().cmp(&y.is_some()),
                        })
                        .find(|o| o.is_ne())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                if scan.flags.descending {
                    matched.reverse();
                }
            }

            let layout = meta.row_layout();
            let mut encoded = VecDeque::with_capacity(matched.len());
            for row in &matched {
                let mut buf = layout.allocate();
                let (_, errors) = layout.encode_row(&meta.columns, row, &mut buf);
                if let Some(err) = DbxError::merge_encoder_errors(errors) {
                    return Err(internal(err));
                }
                encoded.push_back(buf);
            }

            let id = ScanId(self.state.next_scan.fetch_add(1, Ordering::SeqCst));
            let batch = if scan.batch_size == 0 {
                DEFAULT_SCAN_BATCH
            } else {
                scan.batch_size
            };
            self.scans.lock().insert(
                id,
                OpenScan {
                    context: ctx,
                    rows: encoded,
                    batch,
                    cached: 0,
                },
            );
            Ok(id)
        })
    }

    fn fetch(&self, scan: ScanId, max_rows: usize) -> NativeResult<FetchBatch> {
        self.serve("fetch", None, format!("{scan:?}"), || {
            self.state.counters.fetches.fetch_add(1, Ordering::SeqCst);

            let mut scans = self.scans.lock();
            let timeout = {
                let mut faults = self.state.faults.lock();
                let hit = faults.scan_timeouts > 0;
                if hit {
                    faults.scan_timeouts -= 1;
                }
                hit
            };
            if timeout {
                // a timed-out scan aborts its transaction
                if let Some(open) = scans.remove(&scan) {
                    self.staged.lock().remove(&open.context);
                }
                return Err(NativeError::scan_timeout());
            }

            let open = scans.get_mut(&scan).ok_or_else(|| {
                internal(DbxError::invalid_operation("unknown scan", "fetch"))
            })?;
            if open.cached == 0 {
                open.cached = open.batch.min(open.rows.len());
            }
            let take = if max_rows == 0 {
                open.cached
            } else {
                max_rows.min(open.cached)
            };
            let rows: Vec<Vec<u8>> = open.rows.drain(..take).collect();
            open.cached -= take;

            let status = if open.rows.is_empty() {
                FetchStatus::End
            } else if open.cached == 0 {
                FetchStatus::CacheEmpty
            } else {
                FetchStatus::More
            };
            Ok(FetchBatch { rows, status })
        })
    }

    fn close_scan(&self, scan: ScanId) -> NativeResult<()> {
        self.serve("close_scan", None, format!("{scan:?}"), || {
            self.scans.lock().remove(&scan);
            self.state.counters.scans_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn close(&self) -> NativeResult<()> {
        self.serve("close", None, "", || {
            self.staged.lock().clear();
            self.scans.lock().clear();
            self.state
                .counters
                .sessions_closed
                .fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnMetadata, ColumnType, Value};

    fn cluster_with_people() -> MemoryCluster {
        let cluster = MemoryCluster::new();
        cluster.create_table(
            TableMetadata::new(
                "test",
                "people",
                vec![
                    ColumnMetadata::new("id", ColumnType::Int).primary_key(),
                    ColumnMetadata::new("name", ColumnType::Varchar(16)),
                ],
                vec![],
            )
            .unwrap(),
        );
        cluster
    }

    fn key_helper(meta: &Arc<TableMetadata>, opcode: OpCode, id: i64) -> OperationHelper {
        let mut helper = OperationHelper::new(opcode, Arc::clone(meta), 0);
        let layout = meta.key_layout(0).unwrap();
        let mut key = layout.allocate();
        assert!(layout.encode_key(&meta.columns, &[Value::Int(id)], &mut key).is_empty());
        helper.key_buffer = Some(key);
        helper.valid = true;
        helper
    }

    fn insert_helper(meta: &Arc<TableMetadata>, id: i64, name: &str) -> OperationHelper {
        let mut helper = key_helper(meta, OpCode::Insert, id);
        let row = Row::from_values(vec![Value::Int(id), Value::Text(name.into())]);
        let layout = meta.row_layout();
        let mut buf = layout.allocate();
        let (mask, errors) = layout.encode_row(&meta.columns, &row, &mut buf);
        assert!(errors.is_empty());
        helper.row_buffer = Some(buf);
        helper.column_mask = mask;
        helper
    }

    #[test]
    fn test_staged_writes_visible_only_after_commit() {
        let cluster = cluster_with_people();
        let conn = cluster.connect("mem").unwrap();
        let meta = Arc::new(conn.get_table("test", "people").unwrap());
        let session = conn.open_session("test").unwrap();

        let mut ops = vec![insert_helper(&meta, 1, "ann")];
        session.execute(ContextId(0), &mut ops, ExecMode::NoCommit).unwrap();
        assert!(ops[0].error.is_none());
        assert!(cluster.rows("test", "people").is_empty());

        let mut read = vec![key_helper(&meta, OpCode::Read, 1)];
        session.execute(ContextId(0), &mut read, ExecMode::Commit).unwrap();
        assert!(read[0].row_buffer.is_some());
        assert_eq!(cluster.rows("test", "people").len(), 1);
    }

    #[test]
    fn test_failed_write_aborts_commit() {
        let cluster = cluster_with_people();
        let conn = cluster.connect("mem").unwrap();
        let meta = Arc::new(conn.get_table("test", "people").unwrap());
        let session = conn.open_session("test").unwrap();

        let mut ops = vec![
            insert_helper(&meta, 1, "ann"),
            key_helper(&meta, OpCode::Delete, 99),
        ];
        session.execute(ContextId(0), &mut ops, ExecMode::Commit).unwrap();
        assert!(ops[0].error.is_none());
        assert_eq!(ops[1].error, Some(NativeError::no_such_tuple()));
        assert!(cluster.rows("test", "people").is_empty());
    }

    #[test]
    fn test_duplicate_insert() {
        let cluster = cluster_with_people();
        cluster
            .insert_row(
                "test",
                "people",
                Row::from_values(vec![Value::Int(1), Value::Text("ann".into())]),
            )
            .unwrap();
        let conn = cluster.connect("mem").unwrap();
        let meta = Arc::new(conn.get_table("test", "people").unwrap());
        let session = conn.open_session("test").unwrap();

        let mut ops = vec![insert_helper(&meta, 1, "bob")];
        session.execute(ContextId(0), &mut ops, ExecMode::Commit).unwrap();
        assert!(ops[0].error.as_ref().is_some_and(NativeError::is_duplicate_key));
    }

    #[test]
    fn test_scan_fetch_statuses() {
        let cluster = cluster_with_people();
        for id in 0..5 {
            cluster
                .insert_row(
                    "test",
                    "people",
                    Row::from_values(vec![Value::Int(id), Value::Text("x".into())]),
                )
                .unwrap();
        }
        let conn = cluster.connect("mem").unwrap();
        let meta = Arc::new(conn.get_table("test", "people").unwrap());
        let session = conn.open_session("test").unwrap();

        let mut helper = ScanHelper::new(meta);
        helper.batch_size = 2;
        let scan = session.open_scan(ContextId(0), &helper).unwrap();

        let first = session.fetch(scan, 1).unwrap();
        assert_eq!((first.rows.len(), first.status), (1, FetchStatus::More));
        let second = session.fetch(scan, 0).unwrap();
        assert_eq!((second.rows.len(), second.status), (1, FetchStatus::CacheEmpty));
        let third = session.fetch(scan, 0).unwrap();
        assert_eq!(third.status, FetchStatus::CacheEmpty);
        let last = session.fetch(scan, 0).unwrap();
        assert_eq!((last.rows.len(), last.status), (1, FetchStatus::End));
        session.close_scan(scan).unwrap();
    }

    #[test]
    fn test_call_log_is_sequenced() {
        let cluster = cluster_with_people();
        let conn = cluster.connect("mem").unwrap();
        conn.list_tables("test").unwrap();
        conn.get_table("test", "people").unwrap();
        let calls = cluster.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].finished < calls[1].started);
        assert_eq!(cluster.stats().overlaps, 0);
    }
}
