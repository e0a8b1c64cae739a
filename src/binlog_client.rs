//! Binlog 스트림 리더
//!
//! 레플리카 등록 후 COM_BINLOG_DUMP로 이벤트를 당겨오는 pull 방식 스트림입니다.
//! 재연결은 하지 않습니다 - 전송 에러가 나면 에러로 끝나고,
//! 슈퍼바이저가 마지막 위치로 새 리더를 만들어 재개합니다.
//! 테이블 맵은 스트림 수명에 묶이며 재연결 시 버려집니다
//! (table id는 서버 재시작 간 안정적이지 않음).

use crate::binlog::BinlogDecoder;
use crate::config::WatcherConfig;
use crate::error::{Result, WatchError};
use crate::events::{BinlogEvent, BinlogEventData, EventType};
use crate::offset::{BinlogPosition, PositionTracker};
use crate::protocol::{is_eof_packet, is_error_packet, ErrPacket, PacketChannel};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

/// Binlog 이벤트 스트림
///
/// `next_event()`가 도착 순서 = 커밋 순서대로 이벤트를 반환합니다.
/// 깨끗한 스트림 종료는 `Ok(None)`, 전송/프로토콜 문제는 `Err`입니다.
pub struct BinlogStream<S> {
    channel: PacketChannel<S>,
    decoder: BinlogDecoder,
    position: PositionTracker,
}

impl<S> BinlogStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// 인증된 채널 위에서 binlog 덤프 시작
    ///
    /// `position`의 현재 스냅샷이 재개 지점이 됩니다.
    /// 파일명이 비어 있으면 서버가 보관 중인 가장 오래된 로그부터 전송합니다.
    pub async fn start(
        mut channel: PacketChannel<S>,
        config: &WatcherConfig,
        position: PositionTracker,
    ) -> Result<Self> {
        let resume_from = position.snapshot();

        // 서버가 이벤트마다 CRC32를 붙이지 않도록 요청.
        // 거부되어도 FDE가 선언한 알고리즘대로 디코더가 처리하므로 계속 진행.
        let mut checksum_query = vec![COM_QUERY];
        checksum_query.extend_from_slice(b"SET @master_binlog_checksum='NONE'");
        channel.write_packet(&checksum_query, 0).await?;

        let response = read_response(&mut channel).await?;
        if is_error_packet(&response) {
            warn!("failed to set binlog checksum to NONE, continuing");
        }

        let register = build_register_slave_command(config.server_id)?;
        channel.write_packet(&register, 0).await?;

        let response = read_response(&mut channel).await?;
        if is_error_packet(&response) {
            let err = ErrPacket::parse(&response)?;
            return Err(WatchError::Stream(format!(
                "replica registration rejected ({}): {}",
                err.error_code, err.message
            )));
        }

        let dump = build_binlog_dump_command(
            config.server_id,
            &resume_from.filename,
            resume_from.position,
        )?;
        channel.write_packet(&dump, 0).await?;

        info!(
            server_id = config.server_id,
            position = %resume_from,
            "binlog dump started"
        );

        Ok(BinlogStream {
            channel,
            decoder: BinlogDecoder::new(config.strict_decoding),
            position,
        })
    }

    /// 현재 스트림 위치 스냅샷
    pub fn position(&self) -> BinlogPosition {
        self.position.snapshot()
    }

    /// 다음 이벤트 수신
    ///
    /// 테이블 맵과 하트비트는 내부 상태 갱신에만 쓰고 소비합니다.
    pub async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        loop {
            let packet = match self.channel.read_packet().await? {
                Some(packet) => packet,
                None => return Ok(None),
            };

            if is_error_packet(&packet) {
                let err = ErrPacket::parse(&packet)?;
                return Err(WatchError::Stream(format!(
                    "server error ({}): {}",
                    err.error_code, err.message
                )));
            }

            if is_eof_packet(&packet) {
                debug!("EOF packet received, stream ended");
                return Ok(None);
            }

            if packet.first() != Some(&0x00) || packet.len() <= 1 {
                return Err(WatchError::protocol_at(
                    "unexpected packet in binlog stream",
                    0,
                ));
            }

            let event = self.decoder.decode_event(&packet[1..])?;
            self.track_position(&event);

            match event.header.event_type {
                // 디코더 내부 상태 - 구독자에게는 의미 없음
                EventType::TableMapEvent | EventType::HeartbeatEvent => continue,
                _ => return Ok(Some(event)),
            }
        }
    }

    /// 위치는 안전한 경계(커밋/로테이션)에서만 발행
    ///
    /// 테이블 맵과 행 이벤트 사이의 offset으로 재개하면 행 이벤트가
    /// 맵 없이 재생되어 디코딩할 수 없으므로, 트랜잭션 중간 위치는
    /// 발행하지 않습니다. 재개 시 중복 수신은 가능하지만 유실은 없습니다.
    fn track_position(&mut self, event: &BinlogEvent) {
        match &event.data {
            BinlogEventData::Rotate(rotate) => {
                self.position
                    .rotate(rotate.next_binlog_name.clone(), rotate.position);
            }
            // 인위적 이벤트(next_pos 0)는 위치를 전진시키지 않음
            BinlogEventData::Xid(_) if event.header.next_pos > 0 => {
                self.position.advance(event.header.next_pos as u64);
            }
            _ => {}
        }
    }
}

async fn read_response<S>(channel: &mut PacketChannel<S>) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    channel
        .read_packet()
        .await?
        .ok_or_else(|| WatchError::Stream("connection closed awaiting response".to_string()))
}

/// COM_REGISTER_SLAVE 명령 생성
///
/// 호스트명/계정 필드는 보고용일 뿐이므로 비워 보냅니다.
fn build_register_slave_command(server_id: u32) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer.write_u8(COM_REGISTER_SLAVE)?;
    buffer.write_u32::<LittleEndian>(server_id)?;
    buffer.write_u8(0)?; // hostname length
    buffer.write_u8(0)?; // user length
    buffer.write_u8(0)?; // password length
    buffer.write_u16::<LittleEndian>(0)?; // port
    buffer.write_u32::<LittleEndian>(0)?; // replication rank
    buffer.write_u32::<LittleEndian>(0)?; // master id
    Ok(buffer)
}

/// COM_BINLOG_DUMP 명령 생성
fn build_binlog_dump_command(
    server_id: u32,
    binlog_filename: &str,
    binlog_position: u64,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer.write_u8(COM_BINLOG_DUMP)?;
    buffer.write_u32::<LittleEndian>(binlog_position as u32)?;
    buffer.write_u16::<LittleEndian>(0)?; // flags - blocking dump
    buffer.write_u32::<LittleEndian>(server_id)?;
    buffer.write_all(binlog_filename.as_bytes())?;

    debug!(
        server_id,
        file = binlog_filename,
        position = binlog_position,
        "COM_BINLOG_DUMP built"
    );

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CellValue;
    use crate::testutil::*;
    use tokio::io::DuplexStream;

    /// 스트림 시작 시의 명령 3종을 받아줌 (dump에는 응답 없이 바로 이벤트가 흐름)
    async fn accept_stream_commands(server: &mut PacketChannel<DuplexStream>) {
        for _ in 0..3 {
            let command = server.read_packet().await.unwrap().unwrap();
            assert!(matches!(
                command[0],
                COM_QUERY | COM_REGISTER_SLAVE | COM_BINLOG_DUMP
            ));
            if command[0] != COM_BINLOG_DUMP {
                server.write_packet(&[0x00, 0x00, 0x00], 1).await.unwrap();
            }
        }
    }

    async fn start_test_stream(
        server: DuplexStream,
        client: DuplexStream,
        start: BinlogPosition,
    ) -> (BinlogStream<DuplexStream>, PacketChannel<DuplexStream>) {
        let mut server_channel = PacketChannel::new(server);
        let config = WatcherConfig {
            server_id: 101,
            ..Default::default()
        };
        let tracker = PositionTracker::new(start);

        let (stream, server_channel) = tokio::join!(
            BinlogStream::start(PacketChannel::new(client), &config, tracker),
            async {
                accept_stream_commands(&mut server_channel).await;
                server_channel
            }
        );
        (stream.unwrap(), server_channel)
    }

    #[test]
    fn test_dump_command_layout() {
        let cmd = build_binlog_dump_command(101, "mysql-bin.000001", 4).unwrap();
        assert_eq!(cmd[0], COM_BINLOG_DUMP);
        assert_eq!(u32::from_le_bytes([cmd[1], cmd[2], cmd[3], cmd[4]]), 4);
        assert_eq!(u32::from_le_bytes([cmd[7], cmd[8], cmd[9], cmd[10]]), 101);
        assert!(cmd.ends_with(b"mysql-bin.000001"));
    }

    #[test]
    fn test_register_command_layout() {
        let cmd = build_register_slave_command(101).unwrap();
        assert_eq!(cmd[0], COM_REGISTER_SLAVE);
        assert_eq!(cmd.len(), 1 + 4 + 3 + 2 + 4 + 4);
    }

    #[tokio::test]
    async fn test_stream_yields_events_in_order() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut stream, mut server_channel) =
            start_test_stream(server, client, BinlogPosition::new("mysql-bin.000001", 4)).await;

        let events = vec![
            build_format_description(0),
            build_table_map(7, "shop", "orders"),
            build_write_rows_at(7, &[CellValue::Int32(1), CellValue::String("a".into())], 300),
            build_write_rows_at(7, &[CellValue::Int32(2), CellValue::String("b".into())], 360),
            build_xid(11, 400),
        ];
        for event in &events {
            server_channel
                .write_packet(&ok_prefixed(event), 1)
                .await
                .unwrap();
        }
        drop(server_channel);

        // 테이블 맵은 소비되므로 FDE, 행 2건, XID만 나와야 함
        let first = stream.next_event().await.unwrap().unwrap();
        assert_eq!(first.header.event_type, EventType::FormatDescriptionEvent);

        let rows1 = stream.next_event().await.unwrap().unwrap();
        assert_eq!(rows1.table(), Some("orders"));
        let rows2 = stream.next_event().await.unwrap().unwrap();
        match &rows2.data {
            BinlogEventData::WriteRows(data) => {
                assert_eq!(data.rows[0][0], CellValue::Int32(2))
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let xid = stream.next_event().await.unwrap().unwrap();
        assert_eq!(xid.header.event_type, EventType::XidEvent);
        assert_eq!(stream.position().position, 400);

        // 서버가 닫히면 깨끗한 종료
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_position_advances_only_at_commit_boundaries() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut stream, mut server_channel) =
            start_test_stream(server, client, BinlogPosition::new("mysql-bin.000001", 4)).await;

        let events = vec![
            build_table_map_at(7, "shop", "orders", 300),
            build_write_rows_at(7, &[CellValue::Int32(1), CellValue::String("a".into())], 360),
            build_xid(11, 420),
        ];
        for event in &events {
            server_channel
                .write_packet(&ok_prefixed(event), 1)
                .await
                .unwrap();
        }

        // 테이블 맵 뒤, 커밋 전에는 재개 지점이 움직이면 안 됨
        // (그 사이에서 재개하면 행 이벤트가 맵 없이 재생됨)
        let rows = stream.next_event().await.unwrap().unwrap();
        assert_eq!(rows.header.event_type, EventType::WriteRowsEvent);
        assert_eq!(stream.position().position, 4);

        let xid = stream.next_event().await.unwrap().unwrap();
        assert_eq!(xid.header.event_type, EventType::XidEvent);
        assert_eq!(stream.position().position, 420);
    }

    #[tokio::test]
    async fn test_strict_decoding_rejects_unknown_event_type() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server_channel = PacketChannel::new(server);
        let config = WatcherConfig {
            server_id: 101,
            strict_decoding: true,
            ..Default::default()
        };
        let tracker = PositionTracker::new(BinlogPosition::new("", 4));

        let (stream, _) = tokio::join!(
            BinlogStream::start(PacketChannel::new(client), &config, tracker),
            accept_stream_commands(&mut server_channel)
        );
        let mut stream = stream.unwrap();

        server_channel
            .write_packet(&ok_prefixed(&build_event(200, 0, 1, 0, &[1, 2, 3])), 1)
            .await
            .unwrap();

        assert!(matches!(
            stream.next_event().await,
            Err(WatchError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_rotate_updates_position() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut stream, mut server_channel) =
            start_test_stream(server, client, BinlogPosition::new("mysql-bin.000001", 900)).await;

        server_channel
            .write_packet(&ok_prefixed(&build_rotate("mysql-bin.000002", 4)), 1)
            .await
            .unwrap();

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.header.event_type, EventType::RotateEvent);

        let position = stream.position();
        assert_eq!(position.filename, "mysql-bin.000002");
        assert_eq!(position.position, 4);
    }

    #[tokio::test]
    async fn test_server_error_packet_fails_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut stream, mut server_channel) =
            start_test_stream(server, client, BinlogPosition::new("", 4)).await;

        let mut err = vec![0xFF, 0xEA, 0x04]; // 1258: binlog purged
        err.extend_from_slice(b"#HY000Could not find first log file name");
        server_channel.write_packet(&err, 1).await.unwrap();

        match stream.next_event().await {
            Err(WatchError::Stream(message)) => assert!(message.contains("1258")),
            other => panic!("expected stream error, got {:?}", other.is_err()),
        }
    }

    #[tokio::test]
    async fn test_registration_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server_channel = PacketChannel::new(server);
        let config = WatcherConfig {
            server_id: 101,
            ..Default::default()
        };
        let tracker = PositionTracker::new(BinlogPosition::new("", 4));

        let server_task = async {
            // checksum OK
            server_channel.read_packet().await.unwrap();
            server_channel.write_packet(&[0x00, 0x00, 0x00], 1).await.unwrap();
            // register 거부
            server_channel.read_packet().await.unwrap();
            let mut err = vec![0xFF, 0x2B, 0x05];
            err.extend_from_slice(b"#HY000Access denied; replication privilege required");
            server_channel.write_packet(&err, 1).await.unwrap();
        };

        let (result, _) = tokio::join!(
            BinlogStream::start(PacketChannel::new(client), &config, tracker),
            server_task
        );
        match result {
            Err(WatchError::Stream(message)) => assert!(message.contains("registration rejected")),
            other => panic!("expected stream error, got {:?}", other.is_ok()),
        }
    }
}
