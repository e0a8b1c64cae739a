/// 실시간 binlog 감시 데모
///
/// 이 프로그램을 실행한 후, 다른 터미널에서 MySQL에 데이터를 INSERT/UPDATE/DELETE하면
/// binlog 이벤트를 실시간으로 출력합니다.
///
/// 사용법:
/// 1. 이 프로그램 실행: `cargo run --example live_watch`
/// 2. 다른 터미널에서:
///    ```sql
///    mysql -u root -prootpassword testdb
///    INSERT INTO users (name, email) VALUES ('테스트', 'test@example.com');
///    ```
use mysql_watcher::{EventFilter, MySqlWatcher, WatchMessage, WatcherConfig};
use std::env;
use tokio::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let config = WatcherConfig {
        hostname: Some(env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string())),
        port: env::var("DB_PORT")
            .unwrap_or_else(|_| "3306".to_string())
            .parse()
            .unwrap_or(3306),
        username: env::var("DB_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("DB_PASSWORD").unwrap_or_else(|_| "rootpassword".to_string()),
        database: Some(env::var("DB_NAME").unwrap_or_else(|_| "testdb".to_string())),
        server_id: 1001,
        connect_timeout: Duration::from_secs(30),
        ..Default::default()
    };

    info!("=== 실시간 MySQL binlog 감시 시작 ===");
    info!(
        "연결: {}:{}",
        config.hostname.as_deref().unwrap_or("-"),
        config.port
    );
    info!("");
    info!("이제 다른 터미널에서 MySQL에 데이터를 변경하세요:");
    info!("  mysql -u root -prootpassword testdb");
    info!("  INSERT INTO users (name, email) VALUES ('테스트', 'test@example.com');");
    info!("  UPDATE users SET email = 'new@example.com' WHERE name = '테스트';");
    info!("  DELETE FROM users WHERE name = '테스트';");
    info!("");

    let mut watcher = MySqlWatcher::new(config)?;
    let mut subscription = watcher.subscribe(EventFilter::any());
    watcher.connect()?;

    // Ctrl+C로 종료
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        _ = async {
            while let Some(message) = subscription.recv().await {
                match message {
                    WatchMessage::Event(event) => {
                        info!(
                            "[{}] {:?} {}:{} next_pos={}",
                            event.header.timestamp_utc(),
                            event.header.event_type,
                            event.database().unwrap_or("-"),
                            event.table().unwrap_or("-"),
                            event.header.next_pos,
                        );
                        info!("{}", serde_json::to_string_pretty(&event.data)?);
                    }
                    WatchMessage::Error(message) => {
                        error!("스트림 에러: {}", message);
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error>>(())
        } => Ok(()),
    };

    info!("종료 중... 마지막 위치: {}", watcher.position());
    watcher.disconnect().await;
    result
}
