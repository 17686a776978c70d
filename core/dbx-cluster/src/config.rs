//! Connection Properties — 연결/세션 풀 설정
//!
//! JSON 파일 또는 문자열에서 로드하고, `DBX_CLUSTER_*` 환경 변수로
//! 개별 값을 덮어쓸 수 있습니다.

use crate::error::{DbxError, DbxResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// 콜백 실행 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// 호출 스레드에서 즉시 실행 (결정적, 테스트용)
    Inline,
    /// 고정 크기 워커 스레드 풀에서 실행
    Threads,
}

/// Properties of one connection pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionProperties {
    /// Management server address(es) of the cluster, e.g. `"localhost:1186"`
    pub connect_string: String,
    /// Default database for dictionary lookups
    pub database: String,
    /// Delay before a connection whose last reference was released is torn down
    pub linger_on_close_ms: u64,
    /// Free-list size the prefetch loop maintains
    pub session_pool_min: usize,
    /// Sessions returned beyond this many are destroyed
    pub session_pool_max: usize,
    /// Transaction contexts a session may hold at once
    pub session_concurrency: usize,
    /// Minimum number of auto-increment values fetched per round trip
    pub autoincrement_batch_size: u64,
    /// Wait-for-cluster-ready timeout
    pub connect_timeout_ms: u64,
    /// Connection attempts before giving up
    pub connect_retries: u32,
    /// Retries of a scan that failed with a transient timeout
    pub scan_retry_limit: u32,
    /// Rows per scan fetch (0 = native default)
    pub scan_batch_size: u32,
    /// Fragments scanned in parallel (0 = native default)
    pub scan_parallelism: u32,
    pub dispatch: DispatchMode,
    pub worker_threads: usize,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            connect_string: "localhost:1186".to_string(),
            database: "test".to_string(),
            linger_on_close_ms: 500,
            session_pool_min: 1,
            session_pool_max: 100,
            session_concurrency: 4,
            autoincrement_batch_size: 1,
            connect_timeout_ms: 30_000,
            connect_retries: 4,
            scan_retry_limit: 10,
            scan_batch_size: 0,
            scan_parallelism: 0,
            dispatch: DispatchMode::Threads,
            worker_threads: 4,
        }
    }
}

/// 환경 변수 접두사
pub const ENV_PREFIX: &str = "DBX_CLUSTER_";

impl ConnectionProperties {
    /// 기본 설정 + 연결 문자열
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
            ..Self::default()
        }
    }

    /// JSON 문자열에서 로드 (누락된 필드는 기본값)
    pub fn from_json_str(json: &str) -> DbxResult<Self> {
        let props: ConnectionProperties = serde_json::from_str(json)?;
        props.validate()?;
        Ok(props)
    }

    /// JSON 파일에서 로드
    pub fn from_file(path: &Path) -> DbxResult<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// JSON 파일에 저장
    pub fn save_to_file(&self, path: &Path) -> DbxResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }

    /// 환경 변수 덮어쓰기 적용
    pub fn with_env_overrides(mut self) -> DbxResult<Self> {
        for (name, value) in env::vars() {
            if let Some(field) = name.strip_prefix(ENV_PREFIX) {
                self.apply_override(&field.to_lowercase(), &value)?;
            }
        }
        self.validate()?;
        Ok(self)
    }

    fn apply_override(&mut self, field: &str, value: &str) -> DbxResult<()> {
        fn parse<T: std::str::FromStr>(field: &str, value: &str) -> DbxResult<T> {
            value
                .trim()
                .parse()
                .map_err(|_| DbxError::Config(format!("invalid value '{value}' for {field}")))
        }

        match field {
            "connect_string" => self.connect_string = value.to_string(),
            "database" => self.database = value.to_string(),
            "linger_on_close_ms" => self.linger_on_close_ms = parse(field, value)?,
            "session_pool_min" => self.session_pool_min = parse(field, value)?,
            "session_pool_max" => self.session_pool_max = parse(field, value)?,
            "session_concurrency" => self.session_concurrency = parse(field, value)?,
            "autoincrement_batch_size" => self.autoincrement_batch_size = parse(field, value)?,
            "connect_timeout_ms" => self.connect_timeout_ms = parse(field, value)?,
            "connect_retries" => self.connect_retries = parse(field, value)?,
            "scan_retry_limit" => self.scan_retry_limit = parse(field, value)?,
            "scan_batch_size" => self.scan_batch_size = parse(field, value)?,
            "scan_parallelism" => self.scan_parallelism = parse(field, value)?,
            "worker_threads" => self.worker_threads = parse(field, value)?,
            "dispatch" => {
                self.dispatch = match value.trim().to_lowercase().as_str() {
                    "inline" => DispatchMode::Inline,
                    "threads" => DispatchMode::Threads,
                    other => {
                        return Err(DbxError::Config(format!("unknown dispatch mode '{other}'")));
                    }
                }
            }
            // Unrelated DBX_CLUSTER_* variables are not ours to reject.
            _ => {}
        }
        Ok(())
    }

    /// 설정 값 검증
    pub fn validate(&self) -> DbxResult<()> {
        if self.connect_string.trim().is_empty() {
            return Err(DbxError::Config("connect_string must not be empty".into()));
        }
        if self.session_concurrency == 0 {
            return Err(DbxError::Config("session_concurrency must be at least 1".into()));
        }
        if self.session_pool_min > self.session_pool_max {
            return Err(DbxError::Config(format!(
                "session_pool_min ({}) exceeds session_pool_max ({})",
                self.session_pool_min, self.session_pool_max
            )));
        }
        if self.dispatch == DispatchMode::Threads && self.worker_threads == 0 {
            return Err(DbxError::Config("worker_threads must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let props = ConnectionProperties::default();
        props.validate().unwrap();
        assert_eq!(props.session_concurrency, 4);
        assert_eq!(props.scan_retry_limit, 10);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let props = ConnectionProperties::from_json_str(
            r#"{ "connect_string": "mgm1:1186", "session_concurrency": 2, "dispatch": "inline" }"#,
        )
        .unwrap();
        assert_eq!(props.connect_string, "mgm1:1186");
        assert_eq!(props.session_concurrency, 2);
        assert_eq!(props.dispatch, DispatchMode::Inline);
        assert_eq!(props.linger_on_close_ms, 500);
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let err = ConnectionProperties::from_json_str(r#"{ "session_concurrency": 0 }"#).unwrap_err();
        assert!(matches!(err, DbxError::Config(_)));
    }

    #[test]
    fn test_validation_rejects_inverted_pool_bounds() {
        let props = ConnectionProperties {
            session_pool_min: 10,
            session_pool_max: 2,
            ..ConnectionProperties::default()
        };
        assert!(props.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        let props = ConnectionProperties {
            database: "inventory".into(),
            scan_batch_size: 256,
            ..ConnectionProperties::new("mgm2:1186")
        };
        props.save_to_file(&path).unwrap();

        let loaded = ConnectionProperties::from_file(&path).unwrap();
        assert_eq!(loaded, props);
    }

    #[test]
    fn test_override_parsing() {
        let mut props = ConnectionProperties::default();
        props.apply_override("session_pool_max", "7").unwrap();
        props.apply_override("dispatch", "INLINE").unwrap();
        props.apply_override("unrelated_setting", "x").unwrap();
        assert_eq!(props.session_pool_max, 7);
        assert_eq!(props.dispatch, DispatchMode::Inline);
        assert!(props.apply_override("scan_retry_limit", "many").is_err());
    }

    #[test]
    fn test_env_overrides() {
        // 환경 변수 설정 (unsafe)
        unsafe {
            env::set_var("DBX_CLUSTER_LINGER_ON_CLOSE_MS", "25");
        }
        let props = ConnectionProperties::default().with_env_overrides().unwrap();
        assert_eq!(props.linger_on_close_ms, 25);
        unsafe {
            env::remove_var("DBX_CLUSTER_LINGER_ON_CLOSE_MS");
        }
    }
}
