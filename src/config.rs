//! Watcher 연결 및 동작 설정

use crate::error::{Result, WatchError};
use crate::offset::BinlogPosition;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// TLS 사용 모드
///
/// 현재 구현은 평문 연결만 지원하며, `Required`를 지정하면
/// 암묵적으로 평문으로 내려가는 대신 설정 검증 단계에서 명시적으로 거부합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SslMode {
    Disabled,
    Required,
}

/// 구독 버퍼가 가득 찼을 때의 처리 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackpressurePolicy {
    /// 버퍼에 자리가 날 때까지 디스패치를 대기
    Block,
    /// 가장 오래된 이벤트를 버리고 새 이벤트를 넣음
    DropOldest,
    /// 새 이벤트를 버림
    DropNewest,
}

/// Watcher 설정
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// MySQL 호스트 (socket_path와 둘 중 하나만 지정)
    pub hostname: Option<String>,
    pub port: u16,
    /// Unix 도메인 소켓 경로 (hostname과 둘 중 하나만 지정)
    pub socket_path: Option<String>,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    pub ssl: SslMode,
    /// 이 클라이언트가 레플리카로 등록할 때 사용할 server id
    pub server_id: u32,
    /// 스트리밍 시작 위치 (None이면 서버가 현재 파일 처음부터 전송)
    pub start_position: Option<BinlogPosition>,
    pub backpressure_policy: BackpressurePolicy,
    /// 구독별 버퍼 크기 (이벤트 개수)
    pub buffer_size: usize,
    pub max_reconnect_backoff: Duration,
    pub connect_timeout: Duration,
    /// 모르는 이벤트 타입을 에러로 처리할지 (기본은 `Unknown`으로 보존)
    pub strict_decoding: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            hostname: Some("localhost".to_string()),
            port: 3306,
            socket_path: None,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            ssl: SslMode::Disabled,
            server_id: 65535,
            start_position: None,
            backpressure_policy: BackpressurePolicy::Block,
            buffer_size: 1024,
            max_reconnect_backoff: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            strict_decoding: false,
        }
    }
}

impl WatcherConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        WatcherConfig {
            hostname: Some(hostname.into()),
            username: username.into(),
            ..Default::default()
        }
    }

    /// 설정 검증 - 연결 시도 전에 항상 호출됨
    pub fn validate(&self) -> Result<()> {
        match (&self.hostname, &self.socket_path) {
            (Some(host), None) => {
                if host.is_empty() {
                    return Err(WatchError::Config("hostname is empty".to_string()));
                }
                if self.port == 0 {
                    return Err(WatchError::Config("port must be non-zero".to_string()));
                }
            }
            (None, Some(path)) => {
                if path.is_empty() {
                    return Err(WatchError::Config("socket path is empty".to_string()));
                }
            }
            (Some(_), Some(_)) => {
                return Err(WatchError::Config(
                    "hostname and socket_path are mutually exclusive".to_string(),
                ));
            }
            (None, None) => {
                return Err(WatchError::Config(
                    "either hostname or socket_path is required".to_string(),
                ));
            }
        }

        if self.username.is_empty() {
            return Err(WatchError::Config("username is empty".to_string()));
        }
        if self.server_id == 0 {
            // server_id 0은 서버가 레플리카 등록을 거부함
            return Err(WatchError::Config("server_id must be non-zero".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(WatchError::Config("buffer_size must be >= 1".to_string()));
        }
        if self.ssl == SslMode::Required {
            return Err(WatchError::Config(
                "ssl=Required is not supported by this client".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WatcherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 3306);
    }

    #[test]
    fn test_new_config() {
        let config = WatcherConfig::new("127.0.0.1", "repl");
        assert_eq!(config.hostname.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.username, "repl");
    }

    #[test]
    fn test_host_xor_socket() {
        let mut config = WatcherConfig::default();
        config.socket_path = Some("/var/run/mysqld/mysqld.sock".to_string());
        assert!(config.validate().is_err());

        config.hostname = None;
        assert!(config.validate().is_ok());

        config.socket_path = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_fields_rejected() {
        let mut config = WatcherConfig::default();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = WatcherConfig::default();
        config.server_id = 0;
        assert!(config.validate().is_err());

        let mut config = WatcherConfig::default();
        config.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ssl_required_rejected() {
        let mut config = WatcherConfig::default();
        config.ssl = SslMode::Required;
        match config.validate() {
            Err(WatchError::Config(msg)) => assert!(msg.contains("ssl")),
            other => panic!("expected config error, got {:?}", other.err()),
        }
    }
}
