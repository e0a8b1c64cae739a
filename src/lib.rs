//! MySQL binlog watcher
//!
//! 이 라이브러리는 MySQL 복제 프로토콜로 binlog 이벤트 스트림을 구독합니다.
//! 주요 기능:
//! - 클라이언트/서버 패킷 프레이밍 및 binlog 이벤트 파싱
//! - mysql_native_password 핸드셰이크
//! - 테이블/데이터베이스/이벤트 타입 필터 구독
//! - 백프레셔 정책 (Block / DropOldest / DropNewest)
//! - 끊긴 연결을 마지막 위치에서 재개하는 자동 재연결

pub mod auth;
pub mod binlog;
pub mod binlog_client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod offset;
pub mod protocol;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testutil;

pub use auth::Session;
pub use config::{BackpressurePolicy, SslMode, WatcherConfig};
pub use dispatch::{EventFilter, Subscription, WatchMessage};
pub use error::{Result, WatchError};
pub use events::{BinlogEvent, BinlogEventData, CellValue, EventType};
pub use offset::BinlogPosition;
pub use watcher::{MySqlWatcher, WatcherState};
