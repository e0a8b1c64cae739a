//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// MySQL Binlog 이벤트 타입 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN 등)
    QueryEvent = 2,
    /// 스트림 종료
    StopEvent = 3,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// 트랜잭션 커밋 (XID)
    XidEvent = 16,
    /// binlog 포맷 선언 - 각 파일의 첫 이벤트
    FormatDescriptionEvent = 15,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    /// 하트비트 (유휴 연결 유지용)
    HeartbeatEvent = 27,
    /// WRITE_ROWS v2 (INSERT)
    WriteRowsEvent = 30,
    /// UPDATE_ROWS v2 (UPDATE)
    UpdateRowsEvent = 31,
    /// DELETE_ROWS v2 (DELETE)
    DeleteRowsEvent = 32,
    /// GTID 이벤트
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            27 => EventType::HeartbeatEvent,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            _ => EventType::Unknown,
        }
    }
}

/// Binlog 이벤트 헤더 (19 바이트 고정)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// 이벤트를 기록한 서버의 ID
    pub server_id: u32,
    /// 헤더 포함 전체 이벤트 길이 (바이트)
    pub event_length: u32,
    /// 다음 이벤트의 파일 내 위치
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.timestamp as i64, 0).unwrap_or_default()
    }
}

/// 테이블 맵 정보 (컬럼 메타데이터)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapData {
    /// 서버가 세션별로 부여하는 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 타입 코드들
    pub column_types: Vec<u8>,
    /// 컬럼별 타입 메타데이터 (VARCHAR 최대 길이 등)
    pub column_meta: Vec<u16>,
    /// nullable 비트맵
    pub nullable_bitmap: Vec<u8>,
}

/// 행 이벤트 공통 데이터
///
/// database/table은 디코드 시점에 테이블 맵 레지스트리에서 해석된 값입니다.
/// 서버가 table id를 재사용해도 항상 가장 최근 매핑이 쓰입니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsData {
    pub table_id: u64,
    pub database: String,
    pub table: String,
    pub flags: u16,
    pub column_count: u64,
    /// 행 데이터들
    pub rows: Vec<Vec<CellValue>>,
}

/// UPDATE_ROWS 이벤트 데이터 - 변경 전/후 이미지 쌍
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRowsData {
    pub table_id: u64,
    pub database: String,
    pub table: String,
    pub flags: u16,
    pub column_count: u64,
    /// (변경 전, 변경 후) 쌍들
    pub rows: Vec<(Vec<CellValue>, Vec<CellValue>)>,
}

/// 셀 값 (주요 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Date(String),
    Year(u16),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn as_string(&self) -> Option<String> {
        match self {
            CellValue::String(s) => Some(s.clone()),
            CellValue::Int8(i) => Some(i.to_string()),
            CellValue::Int16(i) => Some(i.to_string()),
            CellValue::Int32(i) => Some(i.to_string()),
            CellValue::Int64(i) => Some(i.to_string()),
            CellValue::Float(f) => Some(f.to_string()),
            CellValue::Double(d) => Some(d.to_string()),
            CellValue::Date(d) => Some(d.clone()),
            CellValue::Year(y) => Some(y.to_string()),
            CellValue::Null => Some("NULL".to_string()),
            _ => None,
        }
    }
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    pub database: String,
    pub query: String,
}

/// 로테이션 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일에서의 시작 위치
    pub position: u64,
}

/// 트랜잭션 커밋 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XidEventData {
    pub xid: u64,
}

/// binlog 포맷 선언 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatDescriptionData {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    /// 0 = 없음, 1 = CRC32
    pub checksum_algorithm: u8,
}

/// GTID 이벤트 데이터 (format: uuid:sequence)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtidEventData {
    pub gtid: String,
}

/// 이벤트 종류별 페이로드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BinlogEventData {
    TableMap(TableMapData),
    WriteRows(RowsData),
    UpdateRows(UpdateRowsData),
    DeleteRows(RowsData),
    Query(QueryEventData),
    Rotate(RotateEventData),
    Xid(XidEventData),
    FormatDescription(FormatDescriptionData),
    Gtid(GtidEventData),
    /// 포맷은 유효하지만 모르는 타입 - 원본 페이로드 유지 (상위 호환)
    Unknown(Vec<u8>),
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogEvent {
    pub header: EventHeader,
    pub data: BinlogEventData,
}

impl BinlogEvent {
    /// 이벤트가 참조하는 데이터베이스명 (행/쿼리 이벤트만 해당)
    pub fn database(&self) -> Option<&str> {
        match &self.data {
            BinlogEventData::TableMap(d) => Some(&d.database),
            BinlogEventData::WriteRows(d) | BinlogEventData::DeleteRows(d) => Some(&d.database),
            BinlogEventData::UpdateRows(d) => Some(&d.database),
            BinlogEventData::Query(d) => Some(&d.database),
            _ => None,
        }
    }

    /// 이벤트가 참조하는 테이블명 (행 이벤트만 해당)
    pub fn table(&self) -> Option<&str> {
        match &self.data {
            BinlogEventData::TableMap(d) => Some(&d.table),
            BinlogEventData::WriteRows(d) | BinlogEventData::DeleteRows(d) => Some(&d.table),
            BinlogEventData::UpdateRows(d) => Some(&d.table),
            _ => None,
        }
    }
}
