// Call Queue / 트랜잭션 파이프라인 벤치마크
//
// Section 1: CallQueue 처리량 (인라인 / 워커 스레드)
// Section 2: 자동 커밋 삽입·조회 왕복 (인메모리 클러스터)
// Section 3: 스캔 필터 컴파일과 인덱스 범위 계산

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dbx_cluster::dispatch::{wait, Dispatcher, WorkerPool};
use dbx_cluster::filter::bounds::compile_bounds;
use dbx_cluster::native::memory::MemoryCluster;
use dbx_cluster::queue::{CallQueue, QueuedCall};
use dbx_cluster::schema::{ColumnMetadata, ColumnType, IndexMetadata, Row, TableMetadata, Value};
use dbx_cluster::{
    ConnectionPool, ConnectionProperties, ConnectionRegistry, DispatchMode, Operand, Operation,
    Params, Predicate, QueryPredicate,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

fn people() -> TableMetadata {
    TableMetadata::new(
        "bench",
        "people",
        vec![
            ColumnMetadata::new("id", ColumnType::BigInt).primary_key(),
            ColumnMetadata::new("name", ColumnType::Varchar(32)),
            ColumnMetadata::new("age", ColumnType::Int).nullable(),
            ColumnMetadata::new("state", ColumnType::Char(2)).nullable(),
        ],
        vec![IndexMetadata {
            name: "idx_age".into(),
            columns: vec![2],
            unique: false,
            ordered: true,
        }],
    )
    .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════
// Section 1: CallQueue
// ═══════════════════════════════════════════════════════════════════════════

fn bench_call_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("call_queue");

    // 인라인: enqueue가 호출과 완료까지 동기 실행
    group.bench_function("inline_enqueue", |b| {
        let queue = CallQueue::new("bench:inline", Dispatcher::Inline);
        let counter = Arc::new(AtomicU64::new(0));
        b.iter(|| {
            let counter = Arc::clone(&counter);
            queue.enqueue(
                QueuedCall::new("add", move || black_box(1u64))
                    .on_complete(move |n| {
                        counter.fetch_add(n, Ordering::Relaxed);
                    }),
            );
        })
    });

    // 워커 스레드: 100개 호출을 큐에 넣고 마지막 완료까지 대기
    group.bench_function("threads_100_calls", |b| {
        let pool = Arc::new(WorkerPool::new(4).unwrap());
        let queue = CallQueue::new("bench:threads", Dispatcher::Threads(pool));
        b.iter(|| {
            let (tx, rx) = mpsc::channel();
            for i in 0..100u64 {
                let tx = tx.clone();
                queue.enqueue(QueuedCall::new("noop", move || i).on_complete(move |i| {
                    if i == 99 {
                        let _ = tx.send(());
                    }
                }));
            }
            rx.recv().unwrap();
        })
    });

    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// Section 2: Transaction round trips
// ═══════════════════════════════════════════════════════════════════════════

fn bench_transactions(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction");

    let cluster = MemoryCluster::new();
    cluster.create_table(people());
    let props = ConnectionProperties {
        database: "bench".to_string(),
        dispatch: DispatchMode::Inline,
        linger_on_close_ms: 0,
        ..ConnectionProperties::new("mem:bench")
    };
    let registry = ConnectionRegistry::from_properties(Arc::new(cluster), &props).unwrap();
    let pool = wait(|cb| ConnectionPool::open(&registry, props, cb)).unwrap();
    let session = wait(|cb| pool.get_session(cb)).unwrap();
    let table = wait(|cb| session.get_table("people", cb)).unwrap();

    let mut next_id = 0i64;
    group.bench_function("autocommit_insert", |b| {
        b.iter(|| {
            next_id += 1;
            let row = Row::from_values(vec![
                Value::Int(next_id),
                Value::Text("bench".into()),
                Value::Int(next_id % 90),
                Value::Text("SC".into()),
            ]);
            let ops = vec![Operation::insert(Arc::clone(&table), row)];
            wait(|cb| session.execute(ops, move |r| cb(r.into_result()))).unwrap();
        })
    });

    group.bench_function("autocommit_read", |b| {
        b.iter(|| {
            let ops = vec![Operation::read(Arc::clone(&table), vec![Value::Int(1)])];
            black_box(wait(|cb| session.execute(ops, move |r| cb(r.into_result()))).unwrap());
        })
    });

    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// Section 3: Filter compilation
// ═══════════════════════════════════════════════════════════════════════════

fn bench_filters(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");
    let table = people();
    let predicate = QueryPredicate::new(
        Predicate::ge("age", Operand::param("min"))
            .and(Predicate::lt("age", 65))
            .or(Predicate::eq("state", "SC")),
    );
    let params = Params::new().with("min", 21);

    group.bench_function("program_with_params", |b| {
        b.iter(|| black_box(predicate.program(&table, black_box(&params)).unwrap()))
    });

    group.bench_function("index_bounds", |b| {
        b.iter(|| black_box(compile_bounds(predicate.root(), "age", &params)))
    });

    group.finish();
}

criterion_group!(benches, bench_call_queue, bench_transactions, bench_filters);
criterion_main!(benches);
