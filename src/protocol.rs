//! MySQL 클라이언트-서버 프로토콜 패킷 처리
//!
//! 패킷 프레이밍: 3바이트 길이(LE) + 1바이트 시퀀스 + 페이로드.
//! 페이로드가 0xffffff 바이트면 다음 프레임으로 이어지며,
//! 정확히 0xffffff의 배수인 페이로드는 빈 프레임으로 종결됩니다.

use crate::error::{Result, WatchError};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Read;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// 단일 프레임의 최대 페이로드 크기 (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0xff_ffff;

/// 패킷 프레임 헤더 크기
pub const FRAME_HEADER_SIZE: usize = 4;

/// 페이로드를 프레임들로 인코딩
///
/// `sequence`는 첫 프레임의 시퀀스 번호이며 프레임마다 1씩 증가합니다.
/// 사용된 다음 시퀀스 번호를 함께 반환합니다.
pub fn encode_packet(payload: &[u8], mut sequence: u8) -> (Vec<u8>, u8) {
    let mut out = Vec::with_capacity(payload.len() + FRAME_HEADER_SIZE);
    let mut chunks: Vec<&[u8]> = payload.chunks(MAX_FRAME_SIZE).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }

    let needs_terminator = payload.len() % MAX_FRAME_SIZE == 0 && !payload.is_empty();

    for chunk in &chunks {
        write_frame_header(&mut out, chunk.len(), sequence);
        out.extend_from_slice(chunk);
        sequence = sequence.wrapping_add(1);
    }

    if needs_terminator {
        write_frame_header(&mut out, 0, sequence);
        sequence = sequence.wrapping_add(1);
    }

    (out, sequence)
}

fn write_frame_header(out: &mut Vec<u8>, len: usize, sequence: u8) {
    out.push((len & 0xff) as u8);
    out.push(((len >> 8) & 0xff) as u8);
    out.push(((len >> 16) & 0xff) as u8);
    out.push(sequence);
}

/// 바이트 버퍼에서 패킷 하나를 디코딩
///
/// 프레임 연속(0xffffff)을 재조립하여 (페이로드, 소비한 바이트 수)를 반환합니다.
/// 잘린 입력은 문제가 된 offset을 담은 프로토콜 에러입니다.
pub fn decode_packet(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut payload = Vec::new();
    let mut offset = 0;

    loop {
        if data.len() < offset + FRAME_HEADER_SIZE {
            return Err(WatchError::protocol_at("truncated frame header", offset));
        }
        let len = u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], 0]) as usize;
        let body_start = offset + FRAME_HEADER_SIZE;

        if data.len() < body_start + len {
            return Err(WatchError::protocol_at("truncated frame body", body_start));
        }

        payload.extend_from_slice(&data[body_start..body_start + len]);
        offset = body_start + len;

        // 최대 크기 프레임은 다음 프레임으로 이어짐
        if len < MAX_FRAME_SIZE {
            return Ok((payload, offset));
        }
    }
}

/// MySQL 패킷 채널
///
/// 전송 스트림(TCP/Unix 소켓/테스트용 duplex)을 감싸 프레임 단위 I/O를 제공합니다.
pub struct PacketChannel<S> {
    stream: S,
    last_sequence: u8,
}

impl<S> PacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        PacketChannel {
            stream,
            last_sequence: 0,
        }
    }

    /// 마지막으로 읽은 프레임의 시퀀스 번호
    pub fn last_sequence(&self) -> u8 {
        self.last_sequence
    }

    /// 패킷 읽기 (프레임 연속 재조립 포함)
    ///
    /// 스트림이 패킷 경계에서 깨끗하게 닫히면 `Ok(None)`을 반환합니다.
    pub async fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let mut payload = Vec::new();
        let mut first = true;

        loop {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            match self.stream.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if first && e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(e) => {
                    return Err(WatchError::Stream(format!(
                        "failed to read frame header: {}",
                        e
                    )));
                }
            }
            first = false;

            let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.last_sequence = header[3];

            let mut body = vec![0u8; len];
            self.stream.read_exact(&mut body).await.map_err(|e| {
                WatchError::Stream(format!("failed to read frame body: {}", e))
            })?;
            payload.extend_from_slice(&body);

            if len < MAX_FRAME_SIZE {
                trace!(len = payload.len(), seq = self.last_sequence, "packet read");
                return Ok(Some(payload));
            }
        }
    }

    /// 패킷 쓰기 (16MB 초과 페이로드는 프레임 분할)
    pub async fn write_packet(&mut self, data: &[u8], sequence: u8) -> Result<()> {
        let (framed, _) = encode_packet(data, sequence);
        self.stream
            .write_all(&framed)
            .await
            .map_err(|e| WatchError::Stream(format!("failed to write packet: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| WatchError::Stream(format!("failed to flush: {}", e)))?;
        Ok(())
    }
}

/// 서버 capability 플래그 중 이 클라이언트가 참조하는 것들
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const SSL: u32 = 2048;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// 서버 greeting(initial handshake) 패킷
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);

        let protocol_version = read_u8(&mut cursor, "protocol version")?;
        let server_version = read_null_terminated_string(&mut cursor)?;
        let connection_id = read_u32(&mut cursor, "connection id")?;

        // Auth plugin data part 1 (8 bytes) + filler
        let mut scramble_part1 = vec![0u8; 8];
        read_exact(&mut cursor, &mut scramble_part1, "scramble part 1")?;
        read_u8(&mut cursor, "filler")?;

        let capabilities_lower = read_u16(&mut cursor, "capabilities lower")?;
        let server_collation = read_u8(&mut cursor, "collation")?;
        let server_status = read_u16(&mut cursor, "status")?;
        let capabilities_upper = read_u16(&mut cursor, "capabilities upper")?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = read_u8(&mut cursor, "auth data length")?;

        let mut reserved = [0u8; 10];
        read_exact(&mut cursor, &mut reserved, "reserved")?;

        // Auth plugin data part 2 - 최소 13바이트, 마지막 null 제외
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut scramble_part2 = vec![0u8; part2_len];
        read_exact(&mut cursor, &mut scramble_part2, "scramble part 2")?;

        let mut scramble = scramble_part1;
        scramble.extend_from_slice(&scramble_part2[..part2_len - 1]);

        let auth_plugin = if server_capabilities & capabilities::PLUGIN_AUTH != 0 {
            read_null_terminated_string(&mut cursor)?
        } else {
            "mysql_native_password".to_string()
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            connection_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin,
        })
    }
}

/// ERR 패킷 (첫 바이트 0xFF)
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: Option<String>,
    pub message: String,
}

impl ErrPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 3 || data[0] != 0xFF {
            return Err(WatchError::protocol_at("not an ERR packet", 0));
        }

        let error_code = u16::from_le_bytes([data[1], data[2]]);
        let mut rest = &data[3..];

        // protocol 4.1: '#' + 5바이트 SQL state
        let sql_state = if rest.first() == Some(&b'#') && rest.len() >= 6 {
            let state = String::from_utf8_lossy(&rest[1..6]).to_string();
            rest = &rest[6..];
            Some(state)
        } else {
            None
        };

        Ok(ErrPacket {
            error_code,
            sql_state,
            message: String::from_utf8_lossy(rest).to_string(),
        })
    }
}

/// ERR 패킷 여부
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFF
}

/// OK 패킷 여부
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0x00
}

/// EOF 패킷 여부 (0xFE, 9바이트 미만)
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFE && data.len() < 9
}

fn read_u8(reader: &mut std::io::Cursor<&[u8]>, what: &str) -> Result<u8> {
    let offset = reader.position() as usize;
    ReadBytesExt::read_u8(reader)
        .map_err(|_| WatchError::protocol_at(format!("failed to read {}", what), offset))
}

fn read_u16(reader: &mut std::io::Cursor<&[u8]>, what: &str) -> Result<u16> {
    let offset = reader.position() as usize;
    ReadBytesExt::read_u16::<LittleEndian>(reader)
        .map_err(|_| WatchError::protocol_at(format!("failed to read {}", what), offset))
}

fn read_u32(reader: &mut std::io::Cursor<&[u8]>, what: &str) -> Result<u32> {
    let offset = reader.position() as usize;
    ReadBytesExt::read_u32::<LittleEndian>(reader)
        .map_err(|_| WatchError::protocol_at(format!("failed to read {}", what), offset))
}

fn read_exact(reader: &mut std::io::Cursor<&[u8]>, buf: &mut [u8], what: &str) -> Result<()> {
    let offset = reader.position() as usize;
    Read::read_exact(reader, buf)
        .map_err(|_| WatchError::protocol_at(format!("failed to read {}", what), offset))
}

/// null로 끝나는 문자열 읽기
pub(crate) fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = ReadBytesExt::read_u8(reader)
            .map_err(|e| WatchError::protocol(format!("failed to read string byte: {}", e)))?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| WatchError::protocol(format!("invalid UTF-8 in string: {}", e)))
}
