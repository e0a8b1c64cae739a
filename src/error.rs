//! Watcher 에러 타입

use thiserror::Error;
use std::io;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("설정 에러: {0}")]
    Config(String),

    #[error("인증 실패: {0}")]
    Auth(String),

    #[error("지원하지 않는 인증 플러그인: {0}")]
    UnsupportedPlugin(String),

    #[error("프로토콜 에러 (offset {offset}): {message}")]
    Protocol { message: String, offset: usize },

    #[error("스트림 에러: {0}")]
    Stream(String),

    #[error("구독 {subscription_id} 버퍼 초과: {dropped}건 유실")]
    Backpressure { subscription_id: u64, dropped: u64 },

    #[error("채널이 닫혔습니다")]
    ChannelClosed,
}

impl WatchError {
    /// offset 정보 없는 프로토콜 에러 생성
    pub fn protocol(message: impl Into<String>) -> Self {
        WatchError::Protocol {
            message: message.into(),
            offset: 0,
        }
    }

    pub fn protocol_at(message: impl Into<String>, offset: usize) -> Self {
        WatchError::Protocol {
            message: message.into(),
            offset,
        }
    }

    /// 재시도해도 의미가 없는 에러인지 (설정/인증 계열)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WatchError::Config(_) | WatchError::Auth(_) | WatchError::UnsupportedPlugin(_)
        )
    }
}

impl From<io::Error> for WatchError {
    fn from(err: io::Error) -> Self {
        WatchError::Stream(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;
