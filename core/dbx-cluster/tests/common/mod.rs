// 통합 테스트 공용 헬퍼 — 인메모리 클러스터 + 세션 풀

#![allow(dead_code)]

use dbx_cluster::dispatch::wait;
use dbx_cluster::native::memory::MemoryCluster;
use dbx_cluster::schema::{ColumnMetadata, ColumnType, IndexMetadata, Row, TableMetadata, Value};
use dbx_cluster::{
    ConnectionPool, ConnectionProperties, ConnectionRegistry, DispatchMode, Operation, Session,
    TransactionResult,
};
use std::sync::Arc;

pub const DB: &str = "test";

/// people(id INT PK AUTO_INCREMENT, name VARCHAR(16), age SMALLINT NULL, state VARCHAR(2) NULL)
/// with an ordered index on age and a unique hash index on name.
pub fn people_table() -> TableMetadata {
    TableMetadata::new(
        DB,
        "people",
        vec![
            ColumnMetadata::new("id", ColumnType::Int)
                .primary_key()
                .auto_increment(),
            ColumnMetadata::new("name", ColumnType::Varchar(16)),
            ColumnMetadata::new("age", ColumnType::SmallInt).nullable(),
            ColumnMetadata::new("state", ColumnType::Varchar(2)).nullable(),
        ],
        vec![
            IndexMetadata {
                name: "idx_age".into(),
                columns: vec![2],
                unique: false,
                ordered: true,
            },
            IndexMetadata {
                name: "idx_name".into(),
                columns: vec![1],
                unique: true,
                ordered: false,
            },
        ],
    )
    .unwrap()
}

/// notes(id INT PK, body VARCHAR(32))
pub fn notes_table() -> TableMetadata {
    TableMetadata::new(
        DB,
        "notes",
        vec![
            ColumnMetadata::new("id", ColumnType::Int).primary_key(),
            ColumnMetadata::new("body", ColumnType::Varchar(32)),
        ],
        vec![],
    )
    .unwrap()
}

pub fn cluster() -> MemoryCluster {
    let cluster = MemoryCluster::new();
    cluster.create_table(people_table());
    cluster.create_table(notes_table());
    cluster
}

/// Seed `people` with committed rows, bypassing the driver.
pub fn seed_people(cluster: &MemoryCluster, people: &[(i64, &str, i64, &str)]) {
    for &(id, name, age, state) in people {
        cluster
            .insert_row(DB, "people", person(Some(id), name, Some(age), Some(state)))
            .unwrap();
    }
}

pub fn person(id: Option<i64>, name: &str, age: Option<i64>, state: Option<&str>) -> Row {
    let mut row = Row::with_columns(4);
    if let Some(id) = id {
        row.set(0, Value::Int(id));
    }
    row.set(1, Value::Text(name.to_string()));
    row.set(2, age.map_or(Value::Null, Value::Int));
    row.set(3, state.map_or(Value::Null, |s| Value::Text(s.to_string())));
    row
}

pub fn props(connect_string: &str) -> ConnectionProperties {
    ConnectionProperties {
        dispatch: DispatchMode::Inline,
        linger_on_close_ms: 0,
        session_pool_min: 0,
        ..ConnectionProperties::new(connect_string)
    }
}

pub struct Env {
    pub cluster: MemoryCluster,
    pub registry: Arc<ConnectionRegistry>,
    pub pool: Arc<ConnectionPool>,
}

impl Env {
    pub fn open(cluster: MemoryCluster, props: ConnectionProperties) -> Self {
        let registry =
            ConnectionRegistry::from_properties(Arc::new(cluster.clone()), &props).unwrap();
        let pool = wait(|cb| ConnectionPool::open(&registry, props, cb)).unwrap();
        Self {
            cluster,
            registry,
            pool,
        }
    }

    pub fn inline() -> Self {
        Self::open(cluster(), props("mem:inline"))
    }

    pub fn session(&self) -> Session {
        wait(|cb| self.pool.get_session(cb)).unwrap()
    }

    pub fn table(&self, name: &str) -> Arc<TableMetadata> {
        wait(|cb| self.pool.get_table(name, cb)).unwrap()
    }

    /// Committed `people` rows as (id, name, age).
    pub fn people(&self) -> Vec<(i64, String, Option<i64>)> {
        self.cluster
            .rows(DB, "people")
            .iter()
            .map(|row| {
                let id = row.get(0).and_then(Value::as_i128).unwrap() as i64;
                let name = match row.get(1) {
                    Some(Value::Text(name)) => name.clone(),
                    other => panic!("unexpected name {other:?}"),
                };
                let age = row.get(2).and_then(Value::as_i128).map(|a| a as i64);
                (id, name, age)
            })
            .collect()
    }
}

/// Execute `operations` on `session` and block for the transaction result.
pub fn run(session: &Session, operations: Vec<Operation>) -> TransactionResult {
    wait(|cb| session.execute(operations, move |result| cb(Ok(result)))).unwrap()
}

pub fn commit(session: &Session) -> TransactionResult {
    wait(|cb| session.commit(move |result| cb(Ok(result)))).unwrap()
}

pub fn rollback(session: &Session) -> TransactionResult {
    wait(|cb| session.rollback(move |result| cb(Ok(result)))).unwrap()
}

pub fn int(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i128).expect("integer value") as i64
}
