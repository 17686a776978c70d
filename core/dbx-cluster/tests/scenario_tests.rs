// Scenario Tests — 호출 직렬화 / 풀 종료 순서 / 인덱스 범위 / 자동 증가 값
//
// 네이티브 호출 기록(CallRecord)의 시작·종료 순번으로 순서를 검증한다

mod common;

use common::{DB, Env, person, run};
use dbx_cluster::dispatch::wait;
use dbx_cluster::filter::bounds::compile_bounds;
use dbx_cluster::native::memory::{CallRecord, CallTarget};
use dbx_cluster::schema::Value;
use dbx_cluster::{
    ConnectionProperties, DbxResult, DispatchMode, Operation, Params, Predicate, QueryPredicate,
};
use std::sync::mpsc;
use std::time::Duration;

fn threaded(connect_string: &str) -> ConnectionProperties {
    ConnectionProperties {
        dispatch: DispatchMode::Threads,
        worker_threads: 4,
        ..common::props(connect_string)
    }
}

fn session_calls(calls: &[CallRecord], name: &str) -> Vec<CallRecord> {
    calls
        .iter()
        .filter(|c| matches!(c.target, CallTarget::Session(_)) && c.call == name)
        .cloned()
        .collect()
}

/// 시나리오 A: 한 세션에 연달아 제출한 두 조회는 겹치지 않고 제출 순서대로 실행된다
#[test]
fn test_back_to_back_reads_are_serialized() {
    let env = Env::open(common::cluster(), threaded("mem:scenario-a"));
    common::seed_people(&env.cluster, &[(1, "Ann", 30, "CA"), (2, "Bob", 45, "SC")]);
    let session = env.session();
    let people = env.table("people");
    env.cluster.set_latency(Duration::from_millis(5));

    let (tx, rx) = mpsc::channel();
    for id in [1, 2] {
        let tx = tx.clone();
        session.execute(
            vec![Operation::read(people.clone(), vec![Value::Int(id)])],
            move |result| {
                let _ = tx.send((id, result));
            },
        );
    }
    for _ in 0..2 {
        let (id, result) = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("read completes");
        let row = result.into_result().unwrap().remove(0).value.unwrap();
        assert_eq!(common::int(row.get(0)), id);
    }

    let executes = session_calls(&env.cluster.calls(), "execute");
    assert_eq!(executes.len(), 2);
    assert!(executes[0].finished < executes[1].started);
    assert_eq!(env.cluster.stats().overlaps, 0);
}

/// 시나리오 B: 풀 종료는 유휴 세션과 캐시된 테이블을 모두 닫은 뒤 연결을 끊는다
#[test]
fn test_pool_close_order() -> DbxResult<()> {
    let props = ConnectionProperties {
        session_pool_min: 3,
        ..common::props("mem:scenario-b")
    };
    let env = Env::open(common::cluster(), props);
    assert_eq!(env.pool.stats().free, 3);
    env.table("people");
    env.table("notes");

    wait(|cb| env.pool.close(cb))?;

    let stats = env.cluster.stats();
    assert_eq!(stats.sessions_closed, 3);
    assert_eq!(stats.tables_closed, 2);
    assert_eq!(stats.disconnects, 1);
    assert_eq!(env.registry.teardown_count(), 1);

    let calls = env.cluster.calls();
    let disconnect = calls
        .iter()
        .find(|c| c.call == "disconnect")
        .expect("disconnect recorded");
    let closes: Vec<&CallRecord> = calls
        .iter()
        .filter(|c| c.call == "close" || c.call == "close_table")
        .collect();
    assert_eq!(closes.len(), 5);
    assert!(closes.iter().all(|c| c.finished < disconnect.started));
    Ok(())
}

/// 시나리오 C: `age < 30 OR state = 'SC'`는 age 인덱스 범위를 좁히지 못한다
#[test]
fn test_disjunction_on_other_column_yields_full_bounds() {
    let predicate = Predicate::lt("age", 30).or(Predicate::eq("state", "SC"));
    let line = compile_bounds(&predicate, "age", &Params::new());
    assert!(line.is_full());

    // the same tree without the foreign disjunct does narrow the range
    let narrowed = compile_bounds(&Predicate::lt("age", 30), "age", &Params::new());
    assert!(!narrowed.is_full());
    assert!(narrowed.contains(&Value::Int(29)));
    assert!(!narrowed.contains(&Value::Int(30)));

    let query = QueryPredicate::new(predicate);
    assert!(query.bounds("age", &Params::new()).is_full());
}

/// 시나리오 D: 키가 빈 삽입 하나는 크기 1의 자동 증가 fetch 한 번으로 채워진다
#[test]
fn test_single_insert_fetches_one_auto_increment_value() -> DbxResult<()> {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");

    let results = run(
        &session,
        vec![Operation::insert(people, person(None, "Ann", Some(30), None))],
    )
    .into_result()?;
    assert_eq!(results[0].auto_increment, Some(1));

    let fetches: Vec<CallRecord> = env
        .cluster
        .calls()
        .into_iter()
        .filter(|c| c.call == "fetch_auto_increment")
        .collect();
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].detail, format!("{DB}.people:1"));
    assert_eq!(env.people(), vec![(1, "Ann".to_string(), Some(30))]);
    Ok(())
}
