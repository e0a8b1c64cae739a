//! 이벤트 디스패처 - 구독 필터링 및 전달
//!
//! 구독마다 고정 크기 버퍼를 두고, 버퍼가 가득 찼을 때의 동작은
//! 설정된 백프레셔 정책을 따릅니다. 느린 구독자가 디코딩 루프를
//! 무한정 막지 못하도록 하되, 각 구독은 자신과 매칭되는 이벤트를
//! 도착 순서 그대로 정확히 한 번씩 받습니다.

use crate::config::BackpressurePolicy;
use crate::error::WatchError;
use crate::events::{BinlogEvent, EventType};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

/// 구독자에게 전달되는 메시지
#[derive(Debug, Clone)]
pub enum WatchMessage {
    Event(BinlogEvent),
    /// 스트림 레벨 에러 통지 (재연결 전에 전달됨)
    Error(String),
}

/// 구독 필터 - None인 항목은 "모두 허용"
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub databases: Option<Vec<String>>,
    pub tables: Option<Vec<String>>,
    pub event_types: Option<Vec<EventType>>,
}

impl EventFilter {
    /// 모든 이벤트를 받는 필터
    pub fn any() -> Self {
        EventFilter::default()
    }

    pub fn for_table(table: impl Into<String>) -> Self {
        EventFilter {
            tables: Some(vec![table.into()]),
            ..Default::default()
        }
    }

    pub fn for_database(database: impl Into<String>) -> Self {
        EventFilter {
            databases: Some(vec![database.into()]),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &BinlogEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.header.event_type) {
                return false;
            }
        }

        if let Some(databases) = &self.databases {
            match event.database() {
                Some(db) if databases.iter().any(|d| d == db) => {}
                _ => return false,
            }
        }

        if let Some(tables) = &self.tables {
            match event.table() {
                Some(table) if tables.iter().any(|t| t == table) => {}
                _ => return false,
            }
        }

        true
    }
}

struct QueueState {
    buf: VecDeque<WatchMessage>,
    closed: bool,
}

/// 구독별 고정 크기 이벤트 큐
///
/// 정책 구현을 한 곳에 모으기 위해 mpsc 대신 직접 관리합니다.
/// DropOldest는 송신 측에서 앞쪽을 버려야 해서 채널로는 표현할 수 없습니다.
struct EventQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
    dropped: AtomicU64,
}

/// push 결과 - 정책에 따라 유실이 있었는지
enum PushOutcome {
    Delivered,
    Dropped,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        EventQueue {
            state: Mutex::new(QueueState {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    async fn push(&self, message: WatchMessage, policy: BackpressurePolicy) -> PushOutcome {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return PushOutcome::Dropped;
                }

                if state.buf.len() < self.capacity {
                    state.buf.push_back(message);
                    self.readable.notify_one();
                    return PushOutcome::Delivered;
                }

                match policy {
                    BackpressurePolicy::DropOldest => {
                        state.buf.pop_front();
                        state.buf.push_back(message);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        self.readable.notify_one();
                        return PushOutcome::Dropped;
                    }
                    BackpressurePolicy::DropNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return PushOutcome::Dropped;
                    }
                    BackpressurePolicy::Block => {}
                }
            }
            // Block - 자리가 날 때까지 대기
            self.writable.notified().await;
        }
    }

    /// 용량 무시 push - 스트림 에러 통지는 유실하지 않음
    fn force_push(&self, message: WatchMessage) {
        let mut state = self.state.lock();
        if !state.closed {
            state.buf.push_back(message);
            self.readable.notify_one();
        }
    }

    async fn recv(&self) -> Option<WatchMessage> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(message) = state.buf.pop_front() {
                    self.writable.notify_one();
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// 구독 핸들
///
/// `recv()`로 매칭 이벤트를 도착 순서대로 수신합니다.
/// 핸들을 버리기 전에 `Dispatcher::unsubscribe`를 호출하면
/// 디스패처가 더 이상 이 큐에 이벤트를 쌓지 않습니다.
pub struct Subscription {
    id: u64,
    queue: Arc<EventQueue>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 다음 메시지 수신 - 구독 해제/스트림 종료 시 None
    pub async fn recv(&mut self) -> Option<WatchMessage> {
        self.queue.recv().await
    }

    /// 백프레셔 정책으로 유실된 이벤트 수
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

struct SubEntry {
    filter: EventFilter,
    queue: Arc<EventQueue>,
}

/// 이벤트 디스패처
pub struct Dispatcher {
    subscriptions: RwLock<HashMap<u64, SubEntry>>,
    next_id: AtomicU64,
    policy: BackpressurePolicy,
    capacity: usize,
    error_tx: mpsc::UnboundedSender<WatchError>,
}

impl Dispatcher {
    pub fn new(
        policy: BackpressurePolicy,
        capacity: usize,
        error_tx: mpsc::UnboundedSender<WatchError>,
    ) -> Self {
        Dispatcher {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            policy,
            capacity,
            error_tx,
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(EventQueue::new(self.capacity));

        self.subscriptions.write().insert(
            id,
            SubEntry {
                filter,
                queue: Arc::clone(&queue),
            },
        );

        Subscription { id, queue }
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Some(entry) = self.subscriptions.write().remove(&id) {
            entry.queue.close();
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// 디코딩된 이벤트 하나를 모든 매칭 구독에 전달
    ///
    /// Block 정책에서 가득 찬 큐를 기다리는 동안 구독 테이블 락은 잡지 않습니다.
    pub async fn dispatch(&self, event: &BinlogEvent) {
        let targets: Vec<(u64, Arc<EventQueue>)> = {
            let subs = self.subscriptions.read();
            subs.iter()
                .filter(|(_, entry)| entry.filter.matches(event))
                .map(|(id, entry)| (*id, Arc::clone(&entry.queue)))
                .collect()
        };

        for (id, queue) in targets {
            match queue
                .push(WatchMessage::Event(event.clone()), self.policy)
                .await
            {
                PushOutcome::Delivered => {}
                PushOutcome::Dropped => {
                    let dropped = queue.dropped.load(Ordering::Relaxed);
                    warn!(subscription_id = id, dropped, "subscription buffer exhausted");
                    let _ = self.error_tx.send(WatchError::Backpressure {
                        subscription_id: id,
                        dropped,
                    });
                }
            }
        }
    }

    /// 스트림 에러를 모든 구독에 통지 (용량과 무관하게 전달)
    pub fn broadcast_error(&self, message: &str) {
        let subs = self.subscriptions.read();
        for entry in subs.values() {
            entry.queue.force_push(WatchMessage::Error(message.to_string()));
        }
    }

    /// 모든 구독 종료 - 이후 recv는 버퍼를 비운 뒤 None
    pub fn close_all(&self) {
        let mut subs = self.subscriptions.write();
        for (_, entry) in subs.drain() {
            entry.queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BinlogEventData, EventHeader, RowsData};

    fn row_event(table: &str, seq: u32) -> BinlogEvent {
        BinlogEvent {
            header: EventHeader {
                timestamp: seq,
                event_type: EventType::WriteRowsEvent,
                server_id: 1,
                event_length: 40,
                next_pos: seq * 40,
                flags: 0,
            },
            data: BinlogEventData::WriteRows(RowsData {
                table_id: 7,
                database: "shop".to_string(),
                table: table.to_string(),
                flags: 1,
                column_count: 2,
                rows: vec![],
            }),
        }
    }

    fn new_dispatcher(policy: BackpressurePolicy, capacity: usize) -> (Dispatcher, mpsc::UnboundedReceiver<WatchError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Dispatcher::new(policy, capacity, tx), rx)
    }

    #[test]
    fn test_filter_matching() {
        let event = row_event("orders", 1);

        assert!(EventFilter::any().matches(&event));
        assert!(EventFilter::for_table("orders").matches(&event));
        assert!(!EventFilter::for_table("users").matches(&event));
        assert!(EventFilter::for_database("shop").matches(&event));
        assert!(!EventFilter::for_database("crm").matches(&event));

        let type_filter = EventFilter {
            event_types: Some(vec![EventType::XidEvent]),
            ..Default::default()
        };
        assert!(!type_filter.matches(&event));
    }

    #[test]
    fn test_table_filter_rejects_events_without_table() {
        let xid = BinlogEvent {
            header: EventHeader {
                timestamp: 0,
                event_type: EventType::XidEvent,
                server_id: 1,
                event_length: 31,
                next_pos: 0,
                flags: 0,
            },
            data: BinlogEventData::Xid(crate::events::XidEventData { xid: 1 }),
        };
        assert!(!EventFilter::for_table("orders").matches(&xid));
    }

    #[tokio::test]
    async fn test_dispatch_order_and_exactly_once() {
        let (dispatcher, _errors) = new_dispatcher(BackpressurePolicy::Block, 16);
        let mut sub = dispatcher.subscribe(EventFilter::for_table("orders"));

        for seq in 1..=5 {
            dispatcher.dispatch(&row_event("orders", seq)).await;
            dispatcher.dispatch(&row_event("users", seq * 100)).await;
        }
        dispatcher.close_all();

        let mut received = Vec::new();
        while let Some(WatchMessage::Event(event)) = sub.recv().await {
            received.push(event.header.timestamp);
        }
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let (dispatcher, mut errors) = new_dispatcher(BackpressurePolicy::DropOldest, 1);
        let mut sub = dispatcher.subscribe(EventFilter::any());

        for seq in 1..=3 {
            dispatcher.dispatch(&row_event("orders", seq)).await;
        }
        dispatcher.close_all();

        // 버퍼 1이므로 마지막 이벤트만 남음
        match sub.recv().await {
            Some(WatchMessage::Event(event)) => assert_eq!(event.header.timestamp, 3),
            other => panic!("unexpected message {:?}", other.is_some()),
        }
        assert!(sub.recv().await.is_none());
        assert_eq!(sub.dropped_events(), 2);

        match errors.recv().await {
            Some(WatchError::Backpressure { dropped, .. }) => assert!(dropped >= 1),
            other => panic!("expected backpressure error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drop_newest_keeps_oldest() {
        let (dispatcher, _errors) = new_dispatcher(BackpressurePolicy::DropNewest, 1);
        let mut sub = dispatcher.subscribe(EventFilter::any());

        for seq in 1..=3 {
            dispatcher.dispatch(&row_event("orders", seq)).await;
        }
        dispatcher.close_all();

        match sub.recv().await {
            Some(WatchMessage::Event(event)) => assert_eq!(event.header.timestamp, 1),
            other => panic!("unexpected message {:?}", other.is_some()),
        }
        assert!(sub.recv().await.is_none());
        assert_eq!(sub.dropped_events(), 2);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_space() {
        let (dispatcher, _errors) = new_dispatcher(BackpressurePolicy::Block, 1);
        let dispatcher = Arc::new(dispatcher);
        let mut sub = dispatcher.subscribe(EventFilter::any());

        let producer = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                for seq in 1..=10 {
                    dispatcher.dispatch(&row_event("orders", seq)).await;
                }
                dispatcher.close_all();
            })
        };

        let mut received = Vec::new();
        while let Some(WatchMessage::Event(event)) = sub.recv().await {
            received.push(event.header.timestamp);
            tokio::task::yield_now().await;
        }

        producer.await.unwrap();
        assert_eq!(received, (1..=10).collect::<Vec<u32>>());
        assert_eq!(sub.dropped_events(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (dispatcher, _errors) = new_dispatcher(BackpressurePolicy::Block, 4);
        let mut sub = dispatcher.subscribe(EventFilter::any());
        let id = sub.id();

        dispatcher.dispatch(&row_event("orders", 1)).await;
        dispatcher.unsubscribe(id);
        dispatcher.dispatch(&row_event("orders", 2)).await;

        // 해제 전에 쌓인 메시지는 받고, 이후는 None
        assert!(matches!(sub.recv().await, Some(WatchMessage::Event(_))));
        assert!(sub.recv().await.is_none());
        assert_eq!(dispatcher.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_error_reaches_full_queue() {
        let (dispatcher, _errors) = new_dispatcher(BackpressurePolicy::DropNewest, 1);
        let mut sub = dispatcher.subscribe(EventFilter::any());

        dispatcher.dispatch(&row_event("orders", 1)).await;
        dispatcher.broadcast_error("connection lost");
        dispatcher.close_all();

        assert!(matches!(sub.recv().await, Some(WatchMessage::Event(_))));
        match sub.recv().await {
            Some(WatchMessage::Error(message)) => assert!(message.contains("connection lost")),
            other => panic!("expected error message, got {:?}", other.is_some()),
        }
    }
}
