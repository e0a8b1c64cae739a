//! MySQL 핸드셰이크 및 인증
//!
//! mysql_native_password 플러그인을 구현합니다.
//! 서버가 다른 플러그인을 요구하면 추측으로 진행하지 않고
//! `UnsupportedPlugin`으로 명시적으로 실패합니다.

use crate::config::WatcherConfig;
use crate::error::{Result, WatchError};
use crate::protocol::{
    capabilities, is_error_packet, is_ok_packet, ErrPacket, GreetingPacket, PacketChannel,
};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// 핸드셰이크 성공 결과
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: u32,
    pub server_version: String,
    pub server_capabilities: u32,
    pub collation: u8,
    pub auth_plugin: String,
}

/// 핸드셰이크 + 인증 수행
///
/// greeting 수신 → 자격 증명 응답 계산 → handshake response 전송 → OK/ERR 확인.
/// 재시도하지 않습니다 - 재시도 정책은 슈퍼바이저의 책임입니다.
pub async fn negotiate<S>(
    channel: &mut PacketChannel<S>,
    config: &WatcherConfig,
) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let greeting_packet = channel
        .read_packet()
        .await?
        .ok_or_else(|| WatchError::Stream("connection closed before greeting".to_string()))?;

    if is_error_packet(&greeting_packet) {
        let err = ErrPacket::parse(&greeting_packet)?;
        return Err(WatchError::Auth(format!(
            "server rejected connection ({}): {}",
            err.error_code, err.message
        )));
    }

    let greeting = GreetingPacket::parse(&greeting_packet)?;
    if greeting.protocol_version != 10 {
        return Err(WatchError::protocol(format!(
            "unsupported protocol version {}",
            greeting.protocol_version
        )));
    }

    debug!(
        server_version = %greeting.server_version,
        connection_id = greeting.connection_id,
        plugin = %greeting.auth_plugin,
        "greeting received"
    );

    if greeting.auth_plugin != NATIVE_PASSWORD_PLUGIN {
        return Err(WatchError::UnsupportedPlugin(greeting.auth_plugin));
    }

    let response = build_handshake_response(
        &config.username,
        &config.password,
        config.database.as_deref(),
        &greeting.scramble,
        greeting.server_collation,
    )?;

    let seq = channel.last_sequence().wrapping_add(1);
    channel.write_packet(&response, seq).await?;

    let mut result = channel
        .read_packet()
        .await?
        .ok_or_else(|| WatchError::Stream("connection closed during auth".to_string()))?;

    // Auth switch request: [0xFE][plugin name \0][새 scramble \0]
    if result.first() == Some(&0xFE) && result.len() > 1 {
        let (plugin, scramble) = parse_auth_switch(&result)?;
        if plugin != NATIVE_PASSWORD_PLUGIN {
            return Err(WatchError::UnsupportedPlugin(plugin));
        }

        let token = scramble_password(&config.password, &scramble);
        let seq = channel.last_sequence().wrapping_add(1);
        channel.write_packet(&token, seq).await?;

        result = channel
            .read_packet()
            .await?
            .ok_or_else(|| WatchError::Stream("connection closed during auth switch".to_string()))?;
    }

    if is_error_packet(&result) {
        let err = ErrPacket::parse(&result)?;
        return Err(WatchError::Auth(format!(
            "({}) {}",
            err.error_code, err.message
        )));
    }
    if !is_ok_packet(&result) {
        return Err(WatchError::protocol("unexpected packet after handshake response"));
    }

    info!(
        connection_id = greeting.connection_id,
        server_version = %greeting.server_version,
        "authenticated"
    );

    Ok(Session {
        connection_id: greeting.connection_id,
        server_version: greeting.server_version,
        server_capabilities: greeting.server_capabilities,
        collation: greeting.server_collation,
        auth_plugin: NATIVE_PASSWORD_PLUGIN.to_string(),
    })
}

/// Native password 인증 토큰 생성
///
/// XOR(SHA1(password), SHA1(scramble + SHA1(SHA1(password))))
pub fn scramble_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = sha1(password.as_bytes());
    let stage2 = sha1(&stage1);

    let mut combined = scramble.to_vec();
    combined.extend_from_slice(&stage2);
    let stage3 = sha1(&combined);

    let mut result = Vec::with_capacity(20);
    for i in 0..20 {
        result.push(stage1[i] ^ stage3[i]);
    }
    result
}

fn sha1(data: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Handshake response 패킷 생성
pub fn build_handshake_response(
    username: &str,
    password: &str,
    database: Option<&str>,
    scramble: &[u8],
    collation: u8,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    let mut caps = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;

    if database.is_some() {
        caps |= capabilities::CONNECT_WITH_DB;
    }

    buffer.write_u32::<LittleEndian>(caps)?;

    // Max packet size - 0은 기본값(16MB)
    buffer.write_u32::<LittleEndian>(0)?;
    buffer.write_u8(collation)?;

    // Reserved (23 bytes)
    buffer.write_all(&[0u8; 23])?;

    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    let token = scramble_password(password, scramble);
    buffer.write_u8(token.len() as u8)?;
    buffer.write_all(&token)?;

    if let Some(db) = database {
        buffer.write_all(db.as_bytes())?;
        buffer.write_u8(0)?;
    }

    buffer.write_all(NATIVE_PASSWORD_PLUGIN.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

/// Auth switch 패킷에서 (플러그인명, 새 scramble) 추출
fn parse_auth_switch(data: &[u8]) -> Result<(String, Vec<u8>)> {
    let body = &data[1..];
    let name_end = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| WatchError::protocol_at("unterminated plugin name", 1))?;

    let plugin = String::from_utf8_lossy(&body[..name_end]).to_string();
    let mut scramble = body[name_end + 1..].to_vec();
    // 서버가 끝에 null을 붙여 보냄
    if scramble.last() == Some(&0) {
        scramble.pop();
    }

    Ok((plugin, scramble))
}
