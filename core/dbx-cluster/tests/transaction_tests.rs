// Transaction Integration Tests — 트랜잭션 파이프라인 종단 간 검증
//
// 자동 커밋 / 명시적 트랜잭션, 오류 귀속, 자동 증가 값, 객체 매핑

mod common;

use common::{DB, Env, commit, int, person, rollback, run};
use dbx_cluster::dispatch::wait;
use dbx_cluster::native::memory::CallTarget;
use dbx_cluster::schema::Value;
use dbx_cluster::{
    Classification, DbxError, DbxResult, NativeError, OpCode, Operation, SqlState, Table,
    TransactionState,
};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Table, Debug, PartialEq)]
#[dbx(table_name = "people")]
pub struct Person {
    pub id: i32,
    pub name: String,
    pub age: Option<i16>,
    pub state: Option<String>,
}

// ═══════════════════════════════════════════════════════════════
// 자동 커밋
// ═══════════════════════════════════════════════════════════════

/// 테스트 1: 삽입 후 기본 키 조회
#[test]
fn test_autocommit_insert_then_read() -> DbxResult<()> {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");

    let inserted = run(
        &session,
        vec![Operation::insert(
            Arc::clone(&people),
            person(Some(7), "Ada", Some(36), Some("NY")),
        )],
    )
    .into_result()?;
    assert_eq!(inserted[0].opcode, OpCode::Insert);
    assert_eq!(inserted[0].key, Some(vec![Value::Int(7)]));
    assert_eq!(env.people(), vec![(7, "Ada".to_string(), Some(36))]);

    let read = run(&session, vec![Operation::read(people, vec![Value::Int(7)])]).into_result()?;
    let row = read[0].value.as_ref().expect("read returns the row");
    assert_eq!(row.get(1), Some(&Value::Text("Ada".into())));
    assert_eq!(int(row.get(2)), 36);
    assert_eq!(session.current_transaction(), None);
    Ok(())
}

/// 테스트 2: 존재하지 않는 키 조회는 연산 오류만 남긴다
#[test]
fn test_read_missing_row_fails_only_the_operation() {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");

    let result = run(&session, vec![Operation::read(people, vec![Value::Int(404)])]);
    assert!(result.error.is_none());
    let err = result.results[0].error.as_ref().expect("operation error");
    assert_eq!(err.status(), SqlState::NO_DATA_FOUND);
    assert!(!err.is_indirect());
}

/// 테스트 3: 중복 키는 트랜잭션 오류로 승격되고 형제 연산에도 전파된다
#[test]
fn test_duplicate_key_fails_the_transaction() {
    let env = Env::inline();
    common::seed_people(&env.cluster, &[(1, "Ann", 30, "CA")]);
    let session = env.session();
    let people = env.table("people");

    let result = run(
        &session,
        vec![
            Operation::insert(Arc::clone(&people), person(Some(2), "Bob", Some(41), None)),
            Operation::insert(people, person(Some(1), "Dup", Some(50), None)),
        ],
    );

    let tx_error = result.error.as_ref().expect("transaction error");
    assert!(tx_error.is_indirect());
    assert_eq!(tx_error.status(), SqlState::CONSTRAINT_VIOLATION);
    assert!(tx_error.native().is_some_and(NativeError::is_duplicate_key));

    let direct = result.results[1].error.as_ref().expect("duplicate insert fails");
    assert!(!direct.is_indirect());
    assert!(matches!(direct.cause(), Some(DbxError::Native(_))));

    let sibling = result.results[0].error.as_ref().expect("sibling fails indirectly");
    assert!(sibling.is_indirect());
    assert!(!result.results[0].success);

    // the whole transaction was aborted
    assert_eq!(env.people(), vec![(1, "Ann".to_string(), Some(30))]);
}

/// 테스트 4: 인코더 오류는 네이티브 execute 호출을 생략한다
#[test]
fn test_encoder_failure_skips_execute() {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");
    let before = env.cluster.stats().executes;

    let result = run(
        &session,
        vec![
            Operation::insert(Arc::clone(&people), person(Some(1), "Ok", Some(20), None)),
            Operation::insert(people, person(Some(2), "Bad", Some(70_000), None)),
        ],
    );

    assert_eq!(env.cluster.stats().executes, before);
    let direct = result.results[1].error.as_ref().expect("encoder error");
    assert_eq!(direct.status(), SqlState::OUT_OF_RANGE);
    let tx_error = result.error.as_ref().expect("transaction error");
    assert!(tx_error.is_indirect());
    assert_eq!(tx_error.status(), SqlState::OUT_OF_RANGE);
    assert!(result.results[0].error.as_ref().is_some_and(DbxError::is_indirect));
    assert_eq!(session.core().contexts().seized(), 0);
}

/// 테스트 5: 한 연산의 여러 필드 오류는 하나로 병합된다
#[test]
fn test_multiple_field_errors_merge() {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");

    let result = run(
        &session,
        vec![Operation::insert(
            people,
            person(Some(1), "a-name-that-is-far-too-long", Some(99_999), None),
        )],
    );
    assert!(matches!(
        result.results[0].error,
        Some(DbxError::MultipleEncoder(ref errors)) if errors.len() == 2
    ));
}

/// 테스트 6: 네이티브 execute 실패는 트랜잭션 오류가 되고 연산에는 간접 오류로 전달된다
#[test]
fn test_native_execute_failure() {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");
    env.cluster.fail_next_execute(NativeError::new(
        4010,
        Classification::NodeRecoveryError,
        "Node failure caused abort of transaction",
    ));

    let result = run(
        &session,
        vec![Operation::insert(people, person(Some(1), "Cy", Some(22), None))],
    );
    let tx_error = result.error.expect("transaction error");
    assert!(!tx_error.is_indirect());
    assert!(tx_error.is_transient());
    assert!(result.results[0].error.as_ref().is_some_and(DbxError::is_indirect));
    assert!(env.people().is_empty());
}

/// 테스트 7: update / write / delete
#[test]
fn test_update_write_delete() -> DbxResult<()> {
    let env = Env::inline();
    common::seed_people(&env.cluster, &[(1, "Ann", 30, "CA"), (2, "Bob", 40, "TX")]);
    let session = env.session();
    let people = env.table("people");

    let mut older = dbx_cluster::schema::Row::with_columns(4);
    older.set(0, Value::Int(1));
    older.set(2, Value::Int(31));

    run(
        &session,
        vec![
            Operation::update(Arc::clone(&people), older),
            Operation::write(Arc::clone(&people), person(Some(3), "Cat", Some(25), None)),
            Operation::delete(Arc::clone(&people), vec![Value::Int(2)]),
        ],
    )
    .into_result()?;

    assert_eq!(
        env.people(),
        vec![
            (1, "Ann".to_string(), Some(31)),
            (3, "Cat".to_string(), Some(25)),
        ]
    );

    let missing = run(&session, vec![Operation::update(people, person(Some(9), "Zed", None, None))]);
    assert_eq!(
        missing.error.as_ref().map(DbxError::status),
        Some(SqlState::NO_DATA_FOUND)
    );
    Ok(())
}

/// 테스트 8: 고유 인덱스 조회
#[test]
fn test_read_by_unique_index() -> DbxResult<()> {
    let env = Env::inline();
    common::seed_people(&env.cluster, &[(1, "Ann", 30, "CA"), (2, "Bob", 40, "TX")]);
    let session = env.session();
    let people = env.table("people");

    let read = run(
        &session,
        vec![Operation::read_by_index(
            Arc::clone(&people),
            "idx_name",
            vec![Value::Text("Bob".into())],
        )?],
    )
    .into_result()?;
    assert_eq!(int(read[0].value.as_ref().and_then(|row| row.get(0))), 2);

    assert!(Operation::read_by_index(people, "idx_age", vec![Value::Int(30)]).is_err());
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
// 명시적 트랜잭션
// ═══════════════════════════════════════════════════════════════

/// 테스트 9: no-commit 실행은 커밋 전까지 보이지 않는다
#[test]
fn test_explicit_transaction_commit() -> DbxResult<()> {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");

    let tx = session.begin()?;
    assert!(!tx.is_autocommit());
    run(
        &session,
        vec![Operation::insert(Arc::clone(&people), person(Some(1), "Ann", Some(30), None))],
    )
    .into_result()?;
    run(
        &session,
        vec![Operation::insert(people, person(Some(2), "Bob", Some(40), None))],
    )
    .into_result()?;

    assert_eq!(session.current_transaction(), Some(TransactionState::Open));
    assert!(tx.context().is_some());
    assert!(env.people().is_empty());

    assert!(commit(&session).is_success());
    assert_eq!(env.people().len(), 2);
    assert_eq!(tx.state(), TransactionState::Closed);
    assert_eq!(tx.executed(), 2);
    assert_eq!(tx.context(), None);
    assert_eq!(session.current_transaction(), None);
    Ok(())
}

/// 테스트 10: 롤백은 스테이징된 작업을 버린다
#[test]
fn test_explicit_transaction_rollback() -> DbxResult<()> {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");

    session.begin()?;
    run(
        &session,
        vec![Operation::insert(people, person(Some(1), "Ann", Some(30), None))],
    )
    .into_result()?;
    assert!(rollback(&session).is_success());
    assert!(env.people().is_empty());
    assert_eq!(session.core().contexts().seized(), 0);
    Ok(())
}

/// 테스트 11: 아무 것도 실행하지 않은 트랜잭션의 커밋/롤백은 네이티브 호출이 없다
#[test]
fn test_empty_transaction_sends_nothing() -> DbxResult<()> {
    let env = Env::inline();
    let session = env.session();
    let before = env.cluster.stats().executes;

    session.begin()?;
    assert!(commit(&session).is_success());
    session.begin()?;
    assert!(rollback(&session).is_success());

    assert_eq!(env.cluster.stats().executes, before);
    Ok(())
}

/// 테스트 12: 트랜잭션 없이 커밋하면 InvalidOperation
#[test]
fn test_commit_without_transaction() {
    let env = Env::inline();
    let session = env.session();
    let result = commit(&session);
    assert!(matches!(result.error, Some(DbxError::InvalidOperation { .. })));
    assert!(session.begin().is_ok());
    assert!(session.begin().is_err());
}

/// 테스트 12-1: 실패로 닫힌 명시적 트랜잭션 뒤에는 바로 새 트랜잭션을 시작할 수 있다
#[test]
fn test_begin_after_failed_transaction() -> DbxResult<()> {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");

    let failed = session.begin()?;
    env.cluster.fail_next_execute(NativeError::new(
        4010,
        Classification::NodeRecoveryError,
        "Node failure caused abort of transaction",
    ));
    let result = run(
        &session,
        vec![Operation::insert(Arc::clone(&people), person(Some(1), "Ann", Some(30), None))],
    );
    assert!(result.error.is_some());
    assert_eq!(failed.state(), TransactionState::Closed);

    let tx = session.begin()?;
    assert!(!Arc::ptr_eq(&failed, &tx));
    run(
        &session,
        vec![Operation::insert(Arc::clone(&people), person(Some(2), "Bob", Some(40), None))],
    )
    .into_result()?;
    assert!(commit(&session).is_success());
    assert_eq!(env.people(), vec![(2, "Bob".to_string(), Some(40))]);

    // a failed transaction is not an abandoned one
    session.begin()?;
    env.cluster.fail_next_execute(NativeError::new(
        4010,
        Classification::NodeRecoveryError,
        "Node failure caused abort of transaction",
    ));
    let result = run(
        &session,
        vec![Operation::insert(people, person(Some(3), "Cy", None, None))],
    );
    assert!(result.error.is_some());
    drop(session);
    assert_eq!(env.pool.stats().destroyed, 0);
    assert_eq!(env.pool.stats().free, 1);
    Ok(())
}

/// 테스트 13: 스테이징된 작업 뒤의 인코더 오류는 롤백을 보낸다
#[test]
fn test_prepare_failure_rolls_back_staged_work() -> DbxResult<()> {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");

    let tx = session.begin()?;
    run(
        &session,
        vec![Operation::insert(Arc::clone(&people), person(Some(1), "Ann", Some(30), None))],
    )
    .into_result()?;
    let failed = run(
        &session,
        vec![Operation::insert(people, person(Some(2), "Bad", Some(70_000), None))],
    );
    assert!(failed.error.is_some());
    assert_eq!(tx.state(), TransactionState::Closed);

    let rollbacks = env
        .cluster
        .calls()
        .into_iter()
        .filter(|call| call.call == "execute" && call.detail.starts_with("Rollback"))
        .count();
    assert_eq!(rollbacks, 1);

    // the closed transaction rejects commits; rolling back is a no-op
    assert!(matches!(
        commit(&session).error,
        Some(DbxError::InvalidOperation { .. })
    ));
    assert!(env.people().is_empty());
    Ok(())
}

/// 테스트 14: 연산 콜백은 트랜잭션 콜백보다 먼저, 제출 순서대로 실행된다
#[test]
fn test_callback_order() {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");
    let order = Arc::new(Mutex::new(Vec::new()));

    let ops = (1..=3)
        .map(|id| {
            let order = Arc::clone(&order);
            Operation::insert(Arc::clone(&people), person(Some(id), "P", Some(20), None))
                .on_result(move |result| {
                    assert!(result.success);
                    order.lock().push(format!("op{id}"));
                })
        })
        .collect();
    let seen = Arc::clone(&order);
    wait(|cb| {
        session.execute(ops, move |result| {
            seen.lock().push("tx".to_string());
            cb(result.into_result().map(|_| ()))
        })
    })
    .unwrap();

    assert_eq!(*order.lock(), vec!["op1", "op2", "op3", "tx"]);
}

/// 테스트 15: 같은 핸들러의 요청은 하나씩 제출 순서대로 실행된다
#[test]
fn test_handler_runs_requests_in_order() -> DbxResult<()> {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");
    let tx = session.begin()?;
    let order = Arc::new(Mutex::new(Vec::new()));

    for id in 1..=3 {
        let order = Arc::clone(&order);
        tx.execute(
            vec![Operation::insert(Arc::clone(&people), person(Some(id), "P", None, None))],
            move |result| {
                assert!(result.is_success());
                order.lock().push(id);
            },
        );
    }
    assert!(commit(&session).is_success());
    assert_eq!(*order.lock(), vec![1, 2, 3]);
    assert_eq!(tx.pending(), 0);
    assert_eq!(env.people().len(), 3);
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
// 자동 증가 값
// ═══════════════════════════════════════════════════════════════

/// 테스트 16: 한 배치의 자동 증가 값은 한 번의 fetch로 채워진다
#[test]
fn test_auto_increment_batch_is_coalesced() -> DbxResult<()> {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");

    let ops = ["a", "b", "c", "d", "e"]
        .iter()
        .map(|name| Operation::insert(Arc::clone(&people), person(None, name, None, None)))
        .collect();
    let results = run(&session, ops).into_result()?;

    let values: Vec<u64> = results.iter().filter_map(|r| r.auto_increment).collect();
    assert_eq!(values, vec![1, 2, 3, 4, 5]);
    let stats = env.cluster.stats();
    assert_eq!(stats.auto_increment_fetches, 1);
    assert_eq!(stats.auto_increment_values, 5);
    assert_eq!(env.people().iter().map(|p| p.0).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

    // the fetch ran on the connection, before the session's execute
    let calls = env.cluster.calls();
    let fetch = calls
        .iter()
        .find(|c| c.call == "fetch_auto_increment")
        .expect("auto-increment fetch");
    assert_eq!(fetch.target, CallTarget::Connection);
    let execute = calls.iter().find(|c| c.call == "execute").expect("execute");
    assert!(fetch.finished < execute.started);
    Ok(())
}

/// 테스트 17: 명시적으로 지정된 키는 자동 증가 값을 요청하지 않는다
#[test]
fn test_explicit_key_skips_auto_increment() -> DbxResult<()> {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");
    let results = run(
        &session,
        vec![Operation::insert(people, person(Some(42), "Fixed", None, None))],
    )
    .into_result()?;
    assert_eq!(results[0].auto_increment, None);
    assert_eq!(env.cluster.stats().auto_increment_fetches, 0);
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
// 객체 매핑
// ═══════════════════════════════════════════════════════════════

/// 테스트 18: derive(Table) 객체 삽입과 조회 결과 디코딩
#[test]
fn test_insert_and_decode_mapped_object() -> DbxResult<()> {
    let env = Env::inline();
    let session = env.session();
    let people = env.table("people");

    let ada = Person {
        id: 5,
        name: "Ada".to_string(),
        age: Some(36),
        state: None,
    };
    run(&session, vec![Operation::insert_object(Arc::clone(&people), &ada)?]).into_result()?;

    let read = run(&session, vec![Operation::read(people, vec![Value::Int(5)])]).into_result()?;
    assert_eq!(read[0].decode::<Person>()?, ada);
    assert_eq!(env.cluster.rows(DB, "people").len(), 1);
    Ok(())
}
