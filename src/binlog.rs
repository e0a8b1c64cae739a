//! MySQL Binlog 이벤트 바이너리 포맷 디코딩
//!
//! 각 이벤트 레이아웃:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Body (variable, FDE가 CRC32를 선언하면 마지막 4바이트는 체크섬)
//!
//! 행 이벤트는 먼저 도착한 TableMapEvent의 컬럼 타입 정보가 있어야
//! 디코딩할 수 있으므로 디코더가 테이블 맵 레지스트리를 소유합니다.

use crate::error::{Result, WatchError};
use crate::events::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::{debug, warn};

/// 이벤트 헤더 크기 (고정)
pub const EVENT_HEADER_SIZE: usize = 19;

/// 컬럼 타입 코드
mod column_type {
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const YEAR: u8 = 13;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

/// 테이블 ID → 테이블 맵 레지스트리
///
/// 서버는 세션 내에서 table id를 재활용할 수 있으므로
/// 같은 id에 새 매핑이 오면 덮어씁니다 (last-write-wins).
/// 재연결 시 전체를 비우고 스트림에서 다시 채웁니다.
#[derive(Debug, Default)]
pub struct TableMapRegistry {
    tables: HashMap<u64, TableMapData>,
}

impl TableMapRegistry {
    pub fn new() -> Self {
        TableMapRegistry::default()
    }

    pub fn insert(&mut self, map: TableMapData) {
        self.tables.insert(map.table_id, map);
    }

    pub fn get(&self, table_id: u64) -> Option<&TableMapData> {
        self.tables.get(&table_id)
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Binlog 이벤트 디코더
///
/// strict 모드에서는 모르는 이벤트 타입도 에러로 처리합니다.
/// 기본 모드에서는 `Unknown`으로 디코딩해 상위 호환을 유지합니다.
pub struct BinlogDecoder {
    table_map: TableMapRegistry,
    strict: bool,
    checksum_length: usize,
}

impl BinlogDecoder {
    pub fn new(strict: bool) -> Self {
        BinlogDecoder {
            table_map: TableMapRegistry::new(),
            strict,
            checksum_length: 0,
        }
    }

    pub fn table_map(&self) -> &TableMapRegistry {
        &self.table_map
    }

    /// 재연결 시 호출 - table id는 서버 재시작 간 안정적이지 않음
    pub fn reset(&mut self) {
        self.table_map.clear();
        self.checksum_length = 0;
    }

    /// 이벤트 한 건 디코딩
    ///
    /// `data`는 헤더를 포함한 이벤트 전체 바이트입니다.
    pub fn decode_event(&mut self, data: &[u8]) -> Result<BinlogEvent> {
        let header = parse_header(data)?;

        if data.len() != header.event_length as usize {
            return Err(WatchError::protocol_at(
                format!(
                    "event size mismatch: header says {}, got {}",
                    header.event_length,
                    data.len()
                ),
                data.len().min(EVENT_HEADER_SIZE),
            ));
        }

        let mut body = &data[EVENT_HEADER_SIZE..];

        // FDE는 자체적으로 체크섬 알고리즘을 선언하므로 먼저 처리
        if header.event_type == EventType::FormatDescriptionEvent {
            let fde = parse_format_description(body)?;
            self.checksum_length = if fde.checksum_algorithm == 1 { 4 } else { 0 };
            debug!(
                binlog_version = fde.binlog_version,
                server_version = %fde.server_version,
                checksum = fde.checksum_algorithm,
                "format description"
            );
            return Ok(BinlogEvent {
                header,
                data: BinlogEventData::FormatDescription(fde),
            });
        }

        if self.checksum_length > 0 {
            if body.len() < self.checksum_length {
                return Err(WatchError::protocol_at(
                    "event body shorter than checksum".to_string(),
                    EVENT_HEADER_SIZE,
                ));
            }
            body = &body[..body.len() - self.checksum_length];
        }

        let payload = match header.event_type {
            EventType::TableMapEvent => {
                let map = parse_table_map(body)?;
                let result = BinlogEventData::TableMap(map.clone());
                self.table_map.insert(map);
                result
            }
            EventType::WriteRowsEvent => BinlogEventData::WriteRows(self.parse_rows(body)?),
            EventType::DeleteRowsEvent => BinlogEventData::DeleteRows(self.parse_rows(body)?),
            EventType::UpdateRowsEvent => BinlogEventData::UpdateRows(self.parse_update_rows(body)?),
            EventType::QueryEvent => BinlogEventData::Query(parse_query(body)?),
            EventType::RotateEvent => BinlogEventData::Rotate(parse_rotate(body)?),
            EventType::XidEvent => BinlogEventData::Xid(parse_xid(body)?),
            EventType::GtidEvent | EventType::AnonymousGtidEvent => {
                BinlogEventData::Gtid(parse_gtid(body)?)
            }
            EventType::Unknown if self.strict => {
                return Err(WatchError::protocol_at(
                    format!("unknown event type {}", data[4]),
                    4,
                ));
            }
            _ => BinlogEventData::Unknown(body.to_vec()),
        };

        Ok(BinlogEvent {
            header,
            data: payload,
        })
    }

    /// WRITE_ROWS / DELETE_ROWS v2 파싱
    fn parse_rows(&self, body: &[u8]) -> Result<RowsData> {
        let mut cursor = Cursor::new(body);
        let (table_id, flags) = parse_rows_prefix(&mut cursor)?;

        let table = self.resolve_table(table_id, &cursor)?;

        let column_count = read_lcb(&mut cursor)?;
        let bitmap_len = (column_count as usize + 7) / 8;
        let mut columns_present = vec![0u8; bitmap_len];
        read_exact(&mut cursor, &mut columns_present)?;

        let mut rows = Vec::new();
        while (cursor.position() as usize) < body.len() {
            rows.push(parse_row_image(
                &mut cursor,
                table,
                &columns_present,
                column_count as usize,
            )?);
        }

        Ok(RowsData {
            table_id,
            database: table.database.clone(),
            table: table.table.clone(),
            flags,
            column_count,
            rows,
        })
    }

    /// UPDATE_ROWS v2 파싱 - 행마다 (before, after) 이미지 쌍
    fn parse_update_rows(&self, body: &[u8]) -> Result<UpdateRowsData> {
        let mut cursor = Cursor::new(body);
        let (table_id, flags) = parse_rows_prefix(&mut cursor)?;

        let table = self.resolve_table(table_id, &cursor)?;

        let column_count = read_lcb(&mut cursor)?;
        let bitmap_len = (column_count as usize + 7) / 8;
        let mut columns_before = vec![0u8; bitmap_len];
        read_exact(&mut cursor, &mut columns_before)?;
        let mut columns_after = vec![0u8; bitmap_len];
        read_exact(&mut cursor, &mut columns_after)?;

        let mut rows = Vec::new();
        while (cursor.position() as usize) < body.len() {
            let before =
                parse_row_image(&mut cursor, table, &columns_before, column_count as usize)?;
            let after =
                parse_row_image(&mut cursor, table, &columns_after, column_count as usize)?;
            rows.push((before, after));
        }

        Ok(UpdateRowsData {
            table_id,
            database: table.database.clone(),
            table: table.table.clone(),
            flags,
            column_count,
            rows,
        })
    }

    fn resolve_table(&self, table_id: u64, cursor: &Cursor<&[u8]>) -> Result<&TableMapData> {
        self.table_map.get(table_id).ok_or_else(|| {
            warn!(table_id, "row event references unmapped table id");
            WatchError::protocol_at(
                format!("no table map for table id {}", table_id),
                cursor.position() as usize,
            )
        })
    }
}

/// 19바이트 이벤트 헤더 파싱
pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
    if data.len() < EVENT_HEADER_SIZE {
        return Err(WatchError::protocol_at(
            "event header too short".to_string(),
            data.len(),
        ));
    }

    let mut cursor = Cursor::new(data);
    let timestamp = cursor.read_u32::<LittleEndian>()?;
    let event_type = cursor.read_u8()?;
    let server_id = cursor.read_u32::<LittleEndian>()?;
    let event_length = cursor.read_u32::<LittleEndian>()?;
    let next_pos = cursor.read_u32::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;

    Ok(EventHeader {
        timestamp,
        event_type: EventType::from_u8(event_type),
        server_id,
        event_length,
        next_pos,
        flags,
    })
}

/// 행 이벤트 공통 prefix: table id(6) + flags(2) + extra data(가변)
fn parse_rows_prefix(cursor: &mut Cursor<&[u8]>) -> Result<(u64, u16)> {
    let table_id = read_u48(cursor)?;
    let flags = cursor.read_u16::<LittleEndian>().map_err(trunc(cursor))?;

    // v2 extra data block - 길이 필드(2바이트)를 포함한 크기
    let extra_len = cursor.read_u16::<LittleEndian>().map_err(trunc(cursor))? as u64;
    if extra_len > 2 {
        cursor.set_position(cursor.position() + extra_len - 2);
    }

    Ok((table_id, flags))
}

/// TABLE_MAP 이벤트 파싱
pub fn parse_table_map(body: &[u8]) -> Result<TableMapData> {
    let mut cursor = Cursor::new(body);

    let table_id = read_u48(&mut cursor)?;
    let _flags = cursor.read_u16::<LittleEndian>().map_err(trunc(&cursor))?;

    let db_len = cursor.read_u8().map_err(trunc(&cursor))? as usize;
    let mut db_bytes = vec![0u8; db_len];
    read_exact(&mut cursor, &mut db_bytes)?;
    let database = String::from_utf8_lossy(&db_bytes).to_string();
    cursor.read_u8().map_err(trunc(&cursor))?; // null terminator

    let tbl_len = cursor.read_u8().map_err(trunc(&cursor))? as usize;
    let mut tbl_bytes = vec![0u8; tbl_len];
    read_exact(&mut cursor, &mut tbl_bytes)?;
    let table = String::from_utf8_lossy(&tbl_bytes).to_string();
    cursor.read_u8().map_err(trunc(&cursor))?; // null terminator

    let column_count = read_lcb(&mut cursor)? as usize;
    let mut column_types = vec![0u8; column_count];
    read_exact(&mut cursor, &mut column_types)?;

    // 컬럼별 타입 메타데이터 블록
    let metadata_length = read_lcb(&mut cursor)? as usize;
    let metadata_end = cursor.position() as usize + metadata_length;
    let mut column_meta = Vec::with_capacity(column_count);
    for &col_type in &column_types {
        let meta = match col_type {
            column_type::FLOAT
            | column_type::DOUBLE
            | column_type::BLOB
            | column_type::JSON
            | column_type::GEOMETRY
            | column_type::TIMESTAMP2
            | column_type::DATETIME2
            | column_type::TIME2 => cursor.read_u8().map_err(trunc(&cursor))? as u16,
            column_type::VARCHAR | column_type::BIT => {
                cursor.read_u16::<LittleEndian>().map_err(trunc(&cursor))?
            }
            column_type::NEWDECIMAL | column_type::STRING | column_type::VAR_STRING => {
                // (상위 바이트, 하위 바이트) 쌍으로 기록됨
                let hi = cursor.read_u8().map_err(trunc(&cursor))? as u16;
                let lo = cursor.read_u8().map_err(trunc(&cursor))? as u16;
                (hi << 8) | lo
            }
            _ => 0,
        };
        column_meta.push(meta);
    }

    if cursor.position() as usize != metadata_end {
        return Err(WatchError::protocol_at(
            "column metadata length mismatch".to_string(),
            cursor.position() as usize,
        ));
    }

    let nullable_len = (column_count + 7) / 8;
    let mut nullable_bitmap = vec![0u8; nullable_len];
    read_exact(&mut cursor, &mut nullable_bitmap)?;

    Ok(TableMapData {
        table_id,
        database,
        table,
        column_types,
        column_meta,
        nullable_bitmap,
    })
}

/// QUERY 이벤트 파싱
pub fn parse_query(body: &[u8]) -> Result<QueryEventData> {
    let mut cursor = Cursor::new(body);

    let thread_id = cursor.read_u32::<LittleEndian>().map_err(trunc(&cursor))?;
    let exec_time = cursor.read_u32::<LittleEndian>().map_err(trunc(&cursor))?;
    let db_len = cursor.read_u8().map_err(trunc(&cursor))? as usize;
    let _error_code = cursor.read_u16::<LittleEndian>().map_err(trunc(&cursor))?;
    let status_len = cursor.read_u16::<LittleEndian>().map_err(trunc(&cursor))? as u64;

    cursor.set_position(cursor.position() + status_len);

    let mut db_bytes = vec![0u8; db_len];
    read_exact(&mut cursor, &mut db_bytes)?;
    let database = String::from_utf8_lossy(&db_bytes).to_string();
    cursor.read_u8().map_err(trunc(&cursor))?; // null terminator

    let query_start = cursor.position() as usize;
    if query_start > body.len() {
        return Err(WatchError::protocol_at("query event truncated", body.len()));
    }
    let query = String::from_utf8_lossy(&body[query_start..]).to_string();

    Ok(QueryEventData {
        thread_id,
        exec_time,
        database,
        query,
    })
}

/// ROTATE 이벤트 파싱
pub fn parse_rotate(body: &[u8]) -> Result<RotateEventData> {
    let mut cursor = Cursor::new(body);
    let position = cursor.read_u64::<LittleEndian>().map_err(trunc(&cursor))?;
    let next_binlog_name = String::from_utf8_lossy(&body[cursor.position() as usize..]).to_string();

    Ok(RotateEventData {
        next_binlog_name,
        position,
    })
}

/// XID 이벤트 파싱 (트랜잭션 커밋)
pub fn parse_xid(body: &[u8]) -> Result<XidEventData> {
    let mut cursor = Cursor::new(body);
    let xid = cursor.read_u64::<LittleEndian>().map_err(trunc(&cursor))?;
    Ok(XidEventData { xid })
}

/// GTID 이벤트 파싱
pub fn parse_gtid(body: &[u8]) -> Result<GtidEventData> {
    let mut cursor = Cursor::new(body);
    let _flags = cursor.read_u8().map_err(trunc(&cursor))?;
    let mut uuid_bytes = [0u8; 16];
    read_exact(&mut cursor, &mut uuid_bytes)?;
    let sequence = cursor.read_u64::<LittleEndian>().map_err(trunc(&cursor))?;

    Ok(GtidEventData {
        gtid: format!("{}:{}", format_uuid(&uuid_bytes), sequence),
    })
}

/// FORMAT_DESCRIPTION 이벤트 파싱
///
/// 버전(2) + 서버 버전(50, null 패딩) + 생성 시각(4) + 헤더 길이(1)
/// + 타입별 post-header 길이 배열 + 체크섬 알고리즘(1) + 자체 체크섬(4)
pub fn parse_format_description(body: &[u8]) -> Result<FormatDescriptionData> {
    const FIXED: usize = 2 + 50 + 4 + 1;
    if body.len() < FIXED {
        return Err(WatchError::protocol_at(
            "format description too short".to_string(),
            body.len(),
        ));
    }

    let mut cursor = Cursor::new(body);
    let binlog_version = cursor.read_u16::<LittleEndian>().map_err(trunc(&cursor))?;

    let mut version_bytes = [0u8; 50];
    read_exact(&mut cursor, &mut version_bytes)?;
    let server_version = String::from_utf8_lossy(&version_bytes)
        .trim_end_matches('\0')
        .to_string();

    let create_timestamp = cursor.read_u32::<LittleEndian>().map_err(trunc(&cursor))?;
    let header_length = cursor.read_u8().map_err(trunc(&cursor))?;

    // 꼬리 5바이트 = 체크섬 알고리즘 + FDE 자체 체크섬 (5.6.1 이후)
    let checksum_algorithm = if body.len() >= FIXED + 5 {
        body[body.len() - 5]
    } else {
        0
    };

    Ok(FormatDescriptionData {
        binlog_version,
        server_version,
        create_timestamp,
        header_length,
        checksum_algorithm,
    })
}

/// 행 이미지 하나 파싱
///
/// null 비트맵은 present 비트맵에 포함된 컬럼들 위로만 정의됩니다.
/// 포함되지 않은 컬럼은 Null로 채워 전체 폭의 행을 반환합니다.
fn parse_row_image(
    cursor: &mut Cursor<&[u8]>,
    table: &TableMapData,
    present_bitmap: &[u8],
    column_count: usize,
) -> Result<Vec<CellValue>> {
    let included: Vec<usize> = (0..column_count)
        .filter(|&i| bit_set(present_bitmap, i))
        .collect();

    let null_bitmap_len = (included.len() + 7) / 8;
    let mut null_bitmap = vec![0u8; null_bitmap_len];
    read_exact(cursor, &mut null_bitmap)?;

    let mut row = vec![CellValue::Null; column_count];
    for (image_idx, &col_idx) in included.iter().enumerate() {
        if bit_set(&null_bitmap, image_idx) {
            continue;
        }

        let col_type = *table.column_types.get(col_idx).ok_or_else(|| {
            WatchError::protocol_at("column index out of range", cursor.position() as usize)
        })?;
        let meta = table.column_meta.get(col_idx).copied().unwrap_or(0);
        row[col_idx] = parse_cell(cursor, col_type, meta)?;
    }

    Ok(row)
}

/// 컬럼 타입에 따라 셀 값 하나 파싱
fn parse_cell(cursor: &mut Cursor<&[u8]>, col_type: u8, meta: u16) -> Result<CellValue> {
    let value = match col_type {
        column_type::TINY => CellValue::Int8(cursor.read_i8().map_err(trunc(cursor))?),
        column_type::SHORT => {
            CellValue::Int16(cursor.read_i16::<LittleEndian>().map_err(trunc(cursor))?)
        }
        column_type::INT24 => {
            let raw = cursor.read_i24::<LittleEndian>().map_err(trunc(cursor))?;
            CellValue::Int32(raw)
        }
        column_type::LONG => {
            CellValue::Int32(cursor.read_i32::<LittleEndian>().map_err(trunc(cursor))?)
        }
        column_type::LONGLONG => {
            CellValue::Int64(cursor.read_i64::<LittleEndian>().map_err(trunc(cursor))?)
        }
        column_type::FLOAT => {
            CellValue::Float(cursor.read_f32::<LittleEndian>().map_err(trunc(cursor))?)
        }
        column_type::DOUBLE => {
            CellValue::Double(cursor.read_f64::<LittleEndian>().map_err(trunc(cursor))?)
        }
        column_type::YEAR => {
            let raw = cursor.read_u8().map_err(trunc(cursor))? as u16;
            CellValue::Year(if raw == 0 { 0 } else { 1900 + raw })
        }
        column_type::DATE => {
            let raw = cursor.read_u24::<LittleEndian>().map_err(trunc(cursor))?;
            let day = raw & 0x1f;
            let month = (raw >> 5) & 0x0f;
            let year = raw >> 9;
            CellValue::Date(format!("{:04}-{:02}-{:02}", year, month, day))
        }
        column_type::VARCHAR | column_type::VAR_STRING => {
            let len = if meta < 256 {
                cursor.read_u8().map_err(trunc(cursor))? as usize
            } else {
                cursor.read_u16::<LittleEndian>().map_err(trunc(cursor))? as usize
            };
            let mut buf = vec![0u8; len];
            read_exact(cursor, &mut buf)?;
            CellValue::String(String::from_utf8_lossy(&buf).to_string())
        }
        column_type::STRING => {
            // CHAR(n) - 1바이트 길이 prefix (255바이트 이하 가정)
            let len = cursor.read_u8().map_err(trunc(cursor))? as usize;
            let mut buf = vec![0u8; len];
            read_exact(cursor, &mut buf)?;
            CellValue::String(String::from_utf8_lossy(&buf).to_string())
        }
        column_type::BLOB => {
            let len = read_var_length(cursor, meta as usize)?;
            let mut buf = vec![0u8; len];
            read_exact(cursor, &mut buf)?;
            CellValue::Bytes(buf)
        }
        column_type::JSON => {
            let len = read_var_length(cursor, meta as usize)?;
            let mut buf = vec![0u8; len];
            read_exact(cursor, &mut buf)?;
            match serde_json::from_slice(&buf) {
                Ok(value) => CellValue::Json(value),
                // MySQL 내부 바이너리 JSON 포맷이면 원본 유지
                Err(_) => CellValue::Bytes(buf),
            }
        }
        other => {
            return Err(WatchError::protocol_at(
                format!("unsupported column type {}", other),
                cursor.position() as usize,
            ));
        }
    };

    Ok(value)
}

/// meta가 지정한 바이트 수(1~4)의 LE 길이 읽기
fn read_var_length(cursor: &mut Cursor<&[u8]>, length_bytes: usize) -> Result<usize> {
    let mut len = 0usize;
    for i in 0..length_bytes.clamp(1, 4) {
        let byte = cursor.read_u8().map_err(trunc(cursor))? as usize;
        len |= byte << (8 * i);
    }
    Ok(len)
}

/// LCB (Length-Coded Binary) 읽기
fn read_lcb(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let byte = cursor.read_u8().map_err(trunc(cursor))?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        0xfb => Ok(0),
        0xfc => Ok(cursor.read_u16::<LittleEndian>().map_err(trunc(cursor))? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>().map_err(trunc(cursor))? as u64),
        0xfe => Ok(cursor.read_u64::<LittleEndian>().map_err(trunc(cursor))?),
        0xff => Err(WatchError::protocol_at(
            "invalid LCB value".to_string(),
            cursor.position() as usize,
        )),
    }
}

fn read_u48(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    cursor.read_u48::<LittleEndian>().map_err(trunc(cursor))
}

/// 비트맵의 index번째 비트 확인 (바이트 내 LSB부터)
fn bit_set(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index / 8)
        .map(|byte| byte & (1 << (index % 8)) != 0)
        .unwrap_or(false)
}

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<()> {
    let offset = cursor.position() as usize;
    Read::read_exact(cursor, buf)
        .map_err(|_| WatchError::protocol_at("truncated event body", offset))
}

/// io 에러를 offset 포함 프로토콜 에러로 변환하는 클로저
fn trunc(cursor: &Cursor<&[u8]>) -> impl Fn(std::io::Error) -> WatchError {
    let offset = cursor.position() as usize;
    move |_| WatchError::protocol_at("truncated event body", offset)
}

/// UUID 바이트 배열을 문자열로 변환
fn format_uuid(bytes: &[u8; 16]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3],
        bytes[4], bytes[5],
        bytes[6], bytes[7],
        bytes[8], bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]
    )
}
