//! Connections — 공유 연결과 세션 풀
//!
//! - [`registry`] — one reference-counted physical connection per connect string
//! - [`pool`] — sessions and dictionary lookups on top of a shared connection

pub mod pool;
pub mod registry;

pub use pool::{ConnectionPool, PoolStats};
pub use registry::{ConnectionHandle, ConnectionRegistry};
