//! 테스트 전용 binlog 바이트 빌더
//!
//! 테스트 테이블 스키마는 (id INT, name VARCHAR(255)) 2컬럼으로 고정합니다.

use crate::binlog::EVENT_HEADER_SIZE;
use crate::events::CellValue;
use crate::protocol::capabilities;

/// 테스트용 greeting 패킷 페이로드 생성
pub fn build_greeting(plugin: &str, scramble20: &[u8; 20]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(10); // protocol version
    buf.extend_from_slice(b"8.0.36-test\0");
    buf.extend_from_slice(&42u32.to_le_bytes()); // connection id
    buf.extend_from_slice(&scramble20[..8]);
    buf.push(0); // filler

    let caps: u32 = capabilities::PROTOCOL_41
        | capabilities::SECURE_CONNECTION
        | capabilities::PLUGIN_AUTH;
    buf.extend_from_slice(&(caps as u16).to_le_bytes());
    buf.push(33); // collation
    buf.extend_from_slice(&2u16.to_le_bytes()); // status
    buf.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
    buf.push(21); // auth data length
    buf.extend_from_slice(&[0u8; 10]); // reserved
    buf.extend_from_slice(&scramble20[8..]); // part 2 (12 bytes)
    buf.push(0); // part 2 null
    buf.extend_from_slice(plugin.as_bytes());
    buf.push(0);
    buf
}

/// 헤더 + 본문으로 이벤트 전체 바이트 생성 (event_length는 자동 계산)
pub fn build_event(
    type_code: u8,
    timestamp: u32,
    server_id: u32,
    next_pos: u32,
    body: &[u8],
) -> Vec<u8> {
    let event_length = (EVENT_HEADER_SIZE + body.len()) as u32;
    let mut out = Vec::with_capacity(event_length as usize);
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.push(type_code);
    out.extend_from_slice(&server_id.to_le_bytes());
    out.extend_from_slice(&event_length.to_le_bytes());
    out.extend_from_slice(&next_pos.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // flags
    out.extend_from_slice(body);
    out
}

/// TABLE_MAP 이벤트 (컬럼: LONG + VARCHAR(255))
pub fn build_table_map(table_id: u64, database: &str, table: &str) -> Vec<u8> {
    build_table_map_at(table_id, database, table, 0)
}

/// next_pos를 지정한 TABLE_MAP 이벤트
pub fn build_table_map_at(table_id: u64, database: &str, table: &str, next_pos: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&table_id.to_le_bytes()[..6]);
    body.extend_from_slice(&1u16.to_le_bytes()); // flags

    body.push(database.len() as u8);
    body.extend_from_slice(database.as_bytes());
    body.push(0);

    body.push(table.len() as u8);
    body.extend_from_slice(table.as_bytes());
    body.push(0);

    body.push(2); // column count (lcb)
    body.extend_from_slice(&[3, 15]); // LONG, VARCHAR

    body.push(2); // metadata length (lcb)
    body.extend_from_slice(&255u16.to_le_bytes()); // VARCHAR max length

    body.push(0b10); // nullable bitmap - name만 nullable

    build_event(19, 1700000000, 1, next_pos, &body)
}

fn encode_row_image(cells: &[CellValue]) -> Vec<u8> {
    let mut null_bitmap = 0u8;
    let mut values = Vec::new();

    for (i, cell) in cells.iter().enumerate() {
        match cell {
            CellValue::Null => null_bitmap |= 1 << i,
            CellValue::Int32(v) => values.extend_from_slice(&v.to_le_bytes()),
            CellValue::String(s) => {
                values.push(s.len() as u8);
                values.extend_from_slice(s.as_bytes());
            }
            other => panic!("test schema only supports Int32/String/Null, got {:?}", other),
        }
    }

    let mut out = vec![null_bitmap];
    out.extend_from_slice(&values);
    out
}

fn rows_prefix(table_id: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&table_id.to_le_bytes()[..6]);
    body.extend_from_slice(&1u16.to_le_bytes()); // flags (end of statement)
    body.extend_from_slice(&2u16.to_le_bytes()); // v2 extra data: 길이 필드만
    body
}

/// WRITE_ROWS v2 이벤트 (한 행)
pub fn build_write_rows(table_id: u64, row: &[CellValue]) -> Vec<u8> {
    build_write_rows_at(table_id, row, 0)
}

/// next_pos를 지정한 WRITE_ROWS v2 이벤트
pub fn build_write_rows_at(table_id: u64, row: &[CellValue], next_pos: u32) -> Vec<u8> {
    let mut body = rows_prefix(table_id);
    body.push(2); // column count (lcb)
    body.push(0b11); // columns present
    body.extend_from_slice(&encode_row_image(row));
    build_event(30, 1700000000, 1, next_pos, &body)
}

/// UPDATE_ROWS v2 이벤트 (한 행, before/after 이미지)
pub fn build_update_rows(table_id: u64, before: &[CellValue], after: &[CellValue]) -> Vec<u8> {
    let mut body = rows_prefix(table_id);
    body.push(2); // column count (lcb)
    body.push(0b11); // columns present (before)
    body.push(0b11); // columns present (after)
    body.extend_from_slice(&encode_row_image(before));
    body.extend_from_slice(&encode_row_image(after));
    build_event(31, 1700000000, 1, 0, &body)
}

/// FORMAT_DESCRIPTION 이벤트
pub fn build_format_description(checksum_algorithm: u8) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&4u16.to_le_bytes()); // binlog version

    let mut version = [0u8; 50];
    version[..11].copy_from_slice(b"8.0.36-test");
    body.extend_from_slice(&version);

    body.extend_from_slice(&0u32.to_le_bytes()); // create timestamp
    body.push(EVENT_HEADER_SIZE as u8); // header length
    body.extend_from_slice(&[0u8; 40]); // post-header length array
    body.push(checksum_algorithm);
    body.extend_from_slice(&[0u8; 4]); // FDE 자체 체크섬 (검증 안 함)

    build_event(15, 1700000000, 1, 0, &body)
}

/// ROTATE 이벤트
pub fn build_rotate(next_file: &str, position: u64) -> Vec<u8> {
    let mut body = position.to_le_bytes().to_vec();
    body.extend_from_slice(next_file.as_bytes());
    build_event(4, 0, 1, 0, &body)
}

/// XID 이벤트
pub fn build_xid(xid: u64, next_pos: u32) -> Vec<u8> {
    build_event(16, 1700000000, 1, next_pos, &xid.to_le_bytes())
}

/// binlog 네트워크 스트림 패킷 페이로드 (0x00 OK prefix + 이벤트)
pub fn ok_prefixed(event: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(event.len() + 1);
    out.push(0x00);
    out.extend_from_slice(event);
    out
}
