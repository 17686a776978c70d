//! # DBX Cluster — 클러스터 스토리지용 비동기 세션/트랜잭션 엔진
//!
//! DBX Cluster는 클러스터형 DBX 스토리지 노드를 위한 클라이언트 측 실행 엔진입니다.
//! 네이티브 클라이언트 라이브러리를 직접 구현하지 않고, [`native`] 트레이트 경계를
//! 통해 호출합니다.
//!
//! ## 주요 특징
//!
//! - **Call Queue**: 한 번에 하나의 호출만 처리하는 네이티브 핸들을 FIFO 큐로 직렬화
//! - **공유 연결**: connect string 당 하나의 참조 카운트 연결, linger 후 종료
//! - **세션 풀**: free-list, 백그라운드 prefetch, 딕셔너리 호출 중복 제거
//! - **트랜잭션 파이프라인**: 키/스캔 연산, 자동 증가 값 배치, 오류 귀속
//! - **스캔 필터 컴파일러**: 조건 트리 → 서버 필터 프로그램 + 인덱스 범위
//!
//! ## 빠른 시작
//!
//! ```rust
//! use dbx_cluster::dispatch::wait;
//! use dbx_cluster::native::memory::MemoryCluster;
//! use dbx_cluster::schema::{ColumnMetadata, ColumnType, Row, TableMetadata, Value};
//! use dbx_cluster::{ConnectionPool, ConnectionProperties, ConnectionRegistry, DispatchMode, Operation};
//! use std::sync::Arc;
//!
//! # fn main() -> dbx_cluster::DbxResult<()> {
//! let cluster = MemoryCluster::new();
//! cluster.create_table(TableMetadata::new(
//!     "test",
//!     "users",
//!     vec![
//!         ColumnMetadata::new("id", ColumnType::Int).primary_key(),
//!         ColumnMetadata::new("name", ColumnType::Varchar(32)),
//!     ],
//!     vec![],
//! )?);
//!
//! let props = ConnectionProperties {
//!     dispatch: DispatchMode::Inline,
//!     ..ConnectionProperties::new("localhost:1186")
//! };
//! let registry = ConnectionRegistry::from_properties(Arc::new(cluster), &props)?;
//! let pool = wait(|cb| ConnectionPool::open(&registry, props, cb))?;
//! let session = wait(|cb| pool.get_session(cb))?;
//! let users = wait(|cb| session.get_table("users", cb))?;
//!
//! // 자동 커밋 삽입
//! let row = Row::from_values(vec![Value::Int(1), Value::Text("Alice".into())]);
//! let insert = vec![Operation::insert(Arc::clone(&users), row)];
//! wait(|cb| session.execute(insert, move |r| cb(r.into_result())))?;
//!
//! // 기본 키 조회
//! let read = vec![Operation::read(users, vec![Value::Int(1)])];
//! let results = wait(|cb| session.execute(read, move |r| cb(r.into_result())))?;
//! let name = results[0].value.as_ref().and_then(|row| row.get(1));
//! assert_eq!(name, Some(&Value::Text("Alice".into())));
//!
//! wait(|cb| session.close(cb))?;
//! wait(|cb| pool.close(cb))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## 실행 모델
//!
//! ```text
//! Session.execute → TransactionHandler → seize context → auto-increment
//!     → prepare buffers → CallQueue → NativeSession.execute → attribute errors → callbacks
//! ```
//!
//! ## 모듈 구조
//!
//! - [`queue`] — 네이티브 핸들 호출 직렬화 ([`CallQueue`](queue::CallQueue))
//! - [`dispatch`] — 인라인 / 워커 스레드 실행
//! - [`connection`] — 연결 레지스트리와 세션 풀
//! - [`session`] — 세션과 트랜잭션 컨텍스트 풀
//! - [`transaction`] — 트랜잭션 상태 머신과 스캔 드라이버
//! - [`operation`] — 키/스캔 연산과 결과
//! - [`autoincrement`] — 자동 증가 값 캐시
//! - [`filter`] — 스캔 조건, 필터 컴파일러, 인덱스 범위
//! - [`schema`] — 테이블 메타데이터, 레코드 레이아웃, 인코더
//! - [`native`] — 네이티브 클라이언트 경계와 인메모리 클러스터
//! - [`config`] — 연결 설정
//! - [`error`] — 오류 타입 ([`DbxError`], [`DbxResult`])

extern crate self as dbx_cluster;

pub mod autoincrement;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod logging;
pub mod mapping;
pub mod native;
pub mod operation;
pub mod queue;
pub mod schema;
pub mod session;
pub mod transaction;

pub use config::{ConnectionProperties, DispatchMode};
pub use connection::{ConnectionHandle, ConnectionPool, ConnectionRegistry, PoolStats};
pub use dbx_derive::Table;
pub use error::{Classification, DbxError, DbxResult, NativeError, SqlState};
pub use filter::{Comparator, Operand, Params, Predicate, QueryPredicate};
pub use mapping::Mapped;
pub use operation::{LockMode, OpCode, Operation, OperationResult, ScanRequest};
pub use session::Session;
pub use transaction::{TransactionHandler, TransactionResult, TransactionState};
