//! Binlog 처리 위치 추적
//!
//! Binlog 파일명 + 바이트 위치로 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// MySQL binlog 파일은 4바이트 매직 넘버로 시작하므로
/// 유효한 최소 이벤트 위치는 4입니다.
pub const BINLOG_START_POSITION: u64 = 4;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename.split('.').next_back().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// 스트림 위치 공유 추적기
///
/// 스트림 리더 태스크만 쓰고, 슈퍼바이저/호출자는 스냅샷으로만 읽습니다.
/// 살아있는 가변 상태 대신 불변 값의 복제본을 넘겨 일관성을 보장합니다.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    inner: Arc<RwLock<BinlogPosition>>,
}

impl PositionTracker {
    pub fn new(position: BinlogPosition) -> Self {
        PositionTracker {
            inner: Arc::new(RwLock::new(position)),
        }
    }

    /// 현재 위치의 일관된 스냅샷 반환
    pub fn snapshot(&self) -> BinlogPosition {
        self.inner.read().clone()
    }

    /// 같은 파일 내에서 바이트 위치 전진
    pub fn advance(&self, position: u64) {
        let mut current = self.inner.write();
        if position > current.position {
            current.position = position;
        }
    }

    /// 로테이션 - 새 파일로 전환하고 위치를 리셋
    pub fn rotate(&self, filename: String, position: u64) {
        let mut current = self.inner.write();
        current.filename = filename;
        current.position = position;
    }
}
