//! 연결 슈퍼바이저
//!
//! 전송 수명주기를 소유합니다: 연결 → 인증 → 스트리밍 → (실패 시) 백오프 재연결.
//! 상태 머신: Disconnected → Connecting → Authenticating → Streaming,
//! 비치명 에러 시 Reconnecting을 거쳐 Connecting으로 돌아갑니다.
//! 치명 에러(설정/인증)는 에러 채널로 알리고 재시도 없이 멈춥니다.
//! 재연결 시 마지막으로 발행된 위치에서 재개하므로 이벤트 유실은 없지만
//! 중복 수신은 가능합니다 - 구독자는 멱등하게 처리해야 합니다.

use crate::auth;
use crate::binlog_client::BinlogStream;
use crate::config::WatcherConfig;
use crate::dispatch::{Dispatcher, EventFilter, Subscription};
use crate::error::{Result, WatchError};
use crate::offset::{BinlogPosition, PositionTracker, BINLOG_START_POSITION};
use crate::protocol::PacketChannel;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// 첫 재연결 대기 시간
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// 슈퍼바이저 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Disconnected,
    Connecting,
    Authenticating,
    Streaming,
    Reconnecting,
}

enum StopReason {
    /// disconnect() 호출
    Shutdown,
}

/// MySQL binlog watcher
///
/// 인스턴스 하나가 연결 하나를 감독합니다. 여러 서버를 감시하려면
/// 인스턴스를 여러 개 만들면 되고, 서로 상태를 공유하지 않습니다.
pub struct MySqlWatcher {
    config: WatcherConfig,
    dispatcher: Arc<Dispatcher>,
    position: PositionTracker,
    state: Arc<RwLock<WatcherState>>,
    error_tx: mpsc::UnboundedSender<WatchError>,
    error_rx: Option<mpsc::UnboundedReceiver<WatchError>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl MySqlWatcher {
    /// watcher 생성 - 설정은 여기서 검증됨
    pub fn new(config: WatcherConfig) -> Result<Self> {
        config.validate()?;

        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(
            config.backpressure_policy,
            config.buffer_size,
            error_tx.clone(),
        ));

        let start = config
            .start_position
            .clone()
            .unwrap_or_else(|| BinlogPosition::new("", BINLOG_START_POSITION));

        Ok(MySqlWatcher {
            position: PositionTracker::new(start),
            config,
            dispatcher,
            state: Arc::new(RwLock::new(WatcherState::Disconnected)),
            error_tx,
            error_rx: Some(error_rx),
            shutdown_tx: None,
            task: None,
        })
    }

    /// 이벤트 구독 등록
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.dispatcher.subscribe(filter)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.dispatcher.unsubscribe(id);
    }

    /// 백프레셔/스트림/치명 에러 수신 채널 (최초 1회만 가져갈 수 있음)
    pub fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<WatchError>> {
        self.error_rx.take()
    }

    pub fn state(&self) -> WatcherState {
        *self.state.read()
    }

    /// 마지막으로 발행된 재개 가능 위치 (커밋/로테이션 경계)
    ///
    /// 호출자가 외부에 저장해 두면 다음 기동 때 start_position으로 쓸 수 있습니다.
    pub fn position(&self) -> BinlogPosition {
        self.position.snapshot()
    }

    /// 감독 루프 시작
    ///
    /// 이미 연결 중이면 아무 일도 하지 않습니다.
    pub fn connect(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        self.config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let task = tokio::spawn(supervise(
            self.config.clone(),
            Arc::clone(&self.dispatcher),
            self.position.clone(),
            Arc::clone(&self.state),
            self.error_tx.clone(),
            shutdown_rx,
        ));
        self.task = Some(task);

        Ok(())
    }

    /// 연결 종료 - 어느 상태에서 불러도 되고 멱등함
    ///
    /// 백오프 대기 중이면 대기를 즉시 중단합니다.
    pub async fn disconnect(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.dispatcher.close_all();
        *self.state.write() = WatcherState::Disconnected;
    }
}

/// 감독 루프 본체
async fn supervise(
    config: WatcherConfig,
    dispatcher: Arc<Dispatcher>,
    position: PositionTracker,
    state: Arc<RwLock<WatcherState>>,
    error_tx: mpsc::UnboundedSender<WatchError>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match run_connection(&config, &dispatcher, &position, &state, &mut shutdown).await {
            Ok(StopReason::Shutdown) => break,
            Err(err) => {
                let was_streaming = *state.read() == WatcherState::Streaming;

                // 재시도/중단 전에 반드시 호출자에게 먼저 알림
                error!(error = %err, "connection attempt failed");
                dispatcher.broadcast_error(&err.to_string());
                let fatal = err.is_fatal();
                let _ = error_tx.send(err);

                if fatal {
                    break;
                }

                if was_streaming {
                    // 스트리밍까지 갔던 연결이면 백오프를 처음부터
                    backoff = INITIAL_BACKOFF;
                }

                *state.write() = WatcherState::Reconnecting;
                let wait = jittered(backoff);
                warn!(wait_ms = wait.as_millis() as u64, "reconnecting after backoff");

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => break,
                }

                backoff = (backoff * 2).min(config.max_reconnect_backoff);
            }
        }
    }

    *state.write() = WatcherState::Disconnected;
    // 감독이 끝나면 더 올 이벤트가 없으므로 구독자 대기를 풀어줌
    dispatcher.close_all();
    info!("watcher stopped");
}

/// 연결 한 번의 전체 수명: 전송 연결 → 인증 → 스트리밍
async fn run_connection(
    config: &WatcherConfig,
    dispatcher: &Dispatcher,
    position: &PositionTracker,
    state: &Arc<RwLock<WatcherState>>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<StopReason> {
    *state.write() = WatcherState::Connecting;

    if let Some(path) = &config.socket_path {
        let stream = timeout(config.connect_timeout, UnixStream::connect(path))
            .await
            .map_err(|_| WatchError::Stream("connect timeout".to_string()))??;
        run_stream(stream, config, dispatcher, position, state, shutdown).await
    } else {
        let host = config
            .hostname
            .as_ref()
            .ok_or_else(|| WatchError::Config("hostname missing".to_string()))?;
        let addr = format!("{}:{}", host, config.port);
        let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| WatchError::Stream(format!("connect timeout to {}", addr)))??;
        run_stream(stream, config, dispatcher, position, state, shutdown).await
    }
}

async fn run_stream<S>(
    transport: S,
    config: &WatcherConfig,
    dispatcher: &Dispatcher,
    position: &PositionTracker,
    state: &Arc<RwLock<WatcherState>>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<StopReason>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut channel = PacketChannel::new(transport);

    *state.write() = WatcherState::Authenticating;
    let session = auth::negotiate(&mut channel, config).await?;

    let mut stream = BinlogStream::start(channel, config, position.clone()).await?;
    *state.write() = WatcherState::Streaming;
    info!(
        connection_id = session.connection_id,
        position = %position.snapshot(),
        "streaming binlog events"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(StopReason::Shutdown),
            result = stream.next_event() => {
                match result {
                    Ok(Some(event)) => {
                        tokio::select! {
                            _ = shutdown.changed() => return Ok(StopReason::Shutdown),
                            _ = dispatcher.dispatch(&event) => {}
                        }
                    }
                    Ok(None) => {
                        return Err(WatchError::Stream(
                            "server closed binlog stream".to_string(),
                        ));
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }
}

/// 지수 백오프에 지터 적용 (0.5x ~ 1.0x)
fn jittered(backoff: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.0);
    backoff.mul_f64(factor)
}
