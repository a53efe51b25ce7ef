use crate::clock::Clock;
use crate::error::EngineError;
use crate::retry::retry_with_backoff;
use crate::store_api::RemoteStore;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mining_entity::record::activity_record::{self, ActivityType};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const RECENT_IDS_CAP: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
enum EventKind {
    BalanceChanged,
    ActivityAdded,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BalanceState {
    pub staked: Decimal,
    /// Kept for delta display across a balance change.
    pub previous_staked: Option<Decimal>,
    pub accrued: Decimal,
    pub updated_at_secs: i64,
}

/// Observer callbacks run synchronously on the delivering task; a panic is
/// caught and logged so one bad observer cannot stop the loop.
pub trait StateObserver: Send + Sync {
    fn on_balance_change(&self, state: &BalanceState);
    fn on_activity_change(&self, feed: &[activity_record::Model]);
}

/// Validates inbound realtime events and fans them out to observers. Keeps a
/// bounded most-recent activity feed; full history goes through the refresh
/// queue.
pub struct StateManager {
    account_id: String,
    clock: Arc<dyn Clock>,
    feed_len: usize,
    skew_tolerance_secs: i64,
    balance: Mutex<BalanceState>,
    feed: Mutex<VecDeque<activity_record::Model>>,
    recent_ids: Mutex<(VecDeque<String>, HashSet<String>)>,
    observers: Mutex<Vec<Arc<dyn StateObserver>>>,
}

impl StateManager {
    pub fn new(
        account_id: String,
        clock: Arc<dyn Clock>,
        feed_len: usize,
        skew_tolerance_secs: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            account_id,
            clock,
            feed_len: feed_len.max(1),
            skew_tolerance_secs,
            balance: Mutex::new(BalanceState {
                staked: Decimal::ZERO,
                previous_staked: None,
                accrued: Decimal::ZERO,
                updated_at_secs: 0,
            }),
            feed: Mutex::new(VecDeque::new()),
            recent_ids: Mutex::new((VecDeque::new(), HashSet::new())),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn register_observer(&self, observer: Arc<dyn StateObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    pub fn balance_state(&self) -> BalanceState {
        self.balance.lock().unwrap().clone()
    }

    pub fn activity_feed(&self) -> Vec<activity_record::Model> {
        self.feed.lock().unwrap().iter().cloned().collect()
    }

    /// Session-start seed, before any realtime event has arrived.
    pub fn seed_balance(&self, staked: Decimal, accrued: Decimal, updated_at_secs: i64) {
        let mut balance = self.balance.lock().unwrap();
        balance.staked = staked;
        balance.accrued = accrued;
        balance.updated_at_secs = updated_at_secs;
    }

    /// Earnings tick fan-out from the accumulator's tick handler.
    pub fn publish_earnings(&self, accrued: Decimal) {
        self.balance.lock().unwrap().accrued = accrued;
        self.notify_balance();
    }

    /// Last-write-wins by event timestamp, never by arrival order.
    pub fn apply_remote_balance(&self, staked: Decimal, timestamp: i64) {
        {
            let mut balance = self.balance.lock().unwrap();
            if timestamp < balance.updated_at_secs {
                debug!(
                    "Dropping stale balance event at {} (current {})",
                    timestamp, balance.updated_at_secs
                );
                return;
            }
            balance.previous_staked = Some(balance.staked);
            balance.staked = staked;
            balance.updated_at_secs = timestamp;
        }
        self.notify_balance();
    }

    pub fn handle_raw(&self, event: Value) {
        let kind = event
            .get("event")
            .and_then(Value::as_str)
            .and_then(|name| EventKind::from_str(name).ok());
        match kind {
            Some(EventKind::BalanceChanged) => self.handle_balance(&event),
            Some(EventKind::ActivityAdded) => self.handle_activity(&event),
            None => warn!("Dropping realtime event with unknown kind: {}", event),
        }
    }

    // Validation failures are operator-visible only, never surfaced to the
    // end user: a failing event means a bug or an attack, not a UI state.
    fn handle_balance(&self, event: &Value) {
        match self.parse_balance(event) {
            Ok((staked, timestamp)) => self.apply_remote_balance(staked, timestamp),
            Err(violation) => error!("Dropping balance event: {} ({})", violation, event),
        }
    }

    fn handle_activity(&self, event: &Value) {
        match self.parse_activity(event) {
            Ok(record) => self.admit_activity(record),
            Err(violation) => error!("Dropping activity event: {} ({})", violation, event),
        }
    }

    fn parse_balance(&self, event: &Value) -> Result<(Decimal, i64), EngineError> {
        self.check_account(event)?;
        let staked = decimal_field(event, "staked_amount")
            .filter(|staked| *staked >= Decimal::ZERO)
            .ok_or_else(|| EngineError::Integrity("bad staked_amount".to_owned()))?;
        let timestamp = self.check_timestamp(event)?;
        Ok((staked, timestamp))
    }

    fn parse_activity(&self, event: &Value) -> Result<activity_record::Model, EngineError> {
        self.check_account(event)?;
        let id = event
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| EngineError::Integrity("missing id".to_owned()))?;
        let activity_type = event
            .get("activity_type")
            .cloned()
            .and_then(|value| serde_json::from_value::<ActivityType>(value).ok())
            .ok_or_else(|| EngineError::Integrity("bad activity_type".to_owned()))?;
        let amount = decimal_field(event, "amount")
            .filter(|amount| *amount > Decimal::ZERO)
            .ok_or_else(|| EngineError::Integrity("bad amount".to_owned()))?;
        let timestamp = self.check_timestamp(event)?;
        Ok(activity_record::Model {
            id: id.to_owned(),
            account_id: self.account_id.to_owned(),
            activity_type,
            amount,
            denomination: event
                .get("denomination")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            timestamp,
            counterparty: event
                .get("counterparty")
                .and_then(Value::as_str)
                .map(str::to_owned),
            tx_hash: event
                .get("tx_hash")
                .and_then(Value::as_str)
                .map(str::to_owned),
            status: event
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("confirmed")
                .to_owned(),
        })
    }

    fn check_account(&self, event: &Value) -> Result<(), EngineError> {
        match event.get("account_id").and_then(Value::as_str) {
            Some(account_id) if account_id == self.account_id => Ok(()),
            other => Err(EngineError::Integrity(format!(
                "foreign or missing account {:?}",
                other
            ))),
        }
    }

    fn check_timestamp(&self, event: &Value) -> Result<i64, EngineError> {
        let timestamp = int_field(event, "timestamp")
            .ok_or_else(|| EngineError::Integrity("missing timestamp".to_owned()))?;
        if timestamp > self.clock.now_secs() + self.skew_tolerance_secs {
            return Err(EngineError::Integrity(format!(
                "timestamp {} is in the future",
                timestamp
            )));
        }
        Ok(timestamp)
    }

    fn admit_activity(&self, record: activity_record::Model) {
        {
            let mut recent = self.recent_ids.lock().unwrap();
            if !recent.1.insert(record.id.to_owned()) {
                debug!("Dropping duplicate activity {}", record.id);
                return;
            }
            recent.0.push_back(record.id.to_owned());
            while recent.0.len() > RECENT_IDS_CAP {
                if let Some(evicted) = recent.0.pop_front() {
                    recent.1.remove(&evicted);
                }
            }
        }
        {
            let mut feed = self.feed.lock().unwrap();
            feed.push_front(record);
            feed.truncate(self.feed_len);
        }
        self.notify_activity();
    }

    fn notify_balance(&self) {
        let state = self.balance_state();
        let observers = self.observers.lock().unwrap().clone();
        for observer in observers {
            let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
                observer.on_balance_change(&state);
            }));
            if delivered.is_err() {
                error!("Balance observer panicked, continuing");
            }
        }
    }

    fn notify_activity(&self) {
        let feed = self.activity_feed();
        let observers = self.observers.lock().unwrap().clone();
        for observer in observers {
            let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
                observer.on_activity_change(&feed);
            }));
            if delivered.is_err() {
                error!("Activity observer panicked, continuing");
            }
        }
    }
}

fn decimal_field(event: &Value, key: &str) -> Option<Decimal> {
    match event.get(key)? {
        Value::Number(number) => Decimal::from_str_radix(&number.to_string(), 10).ok(),
        Value::String(text) => Decimal::from_str_radix(text, 10).ok(),
        _ => None,
    }
}

fn int_field(event: &Value, key: &str) -> Option<i64> {
    event.get(key).and_then(Value::as_i64)
}

/// Push channel to the remote store. `connect` yields a stream that ends on
/// disconnect; the subscription loop owns reconnects.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn EventStream>, EngineError>;
}

#[async_trait]
pub trait EventStream: Send {
    async fn next_event(&mut self) -> Option<Value>;
}

pub struct WsRealtimeChannel {
    url: String,
    account_id: String,
}

impl WsRealtimeChannel {
    pub fn new(url: String, account_id: String) -> Self {
        Self { url, account_id }
    }
}

#[async_trait]
impl RealtimeChannel for WsRealtimeChannel {
    async fn connect(&self) -> Result<Box<dyn EventStream>, EngineError> {
        let (mut socket, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|error| {
                EngineError::TransientRemote(format!("realtime connect: {}", error))
            })?;
        let subscribe = serde_json::json!({
            "action": "subscribe",
            "account_id": self.account_id,
        });
        socket
            .send(tokio_tungstenite::tungstenite::Message::Text(
                subscribe.to_string(),
            ))
            .await
            .map_err(|error| {
                EngineError::TransientRemote(format!("realtime subscribe: {}", error))
            })?;
        Ok(Box::new(WsEventStream { socket }))
    }
}

struct WsEventStream {
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl EventStream for WsEventStream {
    async fn next_event(&mut self) -> Option<Value> {
        use tokio_tungstenite::tungstenite::Message;
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(value) => return Some(value),
                    Err(error) => {
                        warn!("Unparsable realtime frame: {}", error);
                    }
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Runs until aborted. A dropped or failed subscription is always followed
/// by a scheduled reconnect; listening never silently stops.
pub async fn run_subscription(
    manager: Arc<StateManager>,
    channel: Arc<dyn RealtimeChannel>,
    reconnect_delay: Duration,
) {
    loop {
        match channel.connect().await {
            Ok(mut stream) => {
                info!("Realtime subscription established");
                while let Some(event) = stream.next_event().await {
                    manager.handle_raw(event);
                }
                warn!(
                    "Realtime subscription dropped, reconnecting in {:?}",
                    reconnect_delay
                );
            }
            Err(error) => {
                warn!(
                    "Realtime connect failed ({}), retrying in {:?}",
                    error, reconnect_delay
                );
            }
        }
        sleep(reconnect_delay).await;
    }
}

enum RefreshRequest {
    History {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<activity_record::Model>, EngineError>>,
    },
    Balance,
}

/// Queued bounded-retry worker for data refresh operations, so a transient
/// fetch failure is retried instead of surfacing immediately.
pub struct RefreshQueue {
    queue: mpsc::UnboundedSender<RefreshRequest>,
}

impl RefreshQueue {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        manager: Arc<StateManager>,
        account_id: String,
        attempts: u32,
        base_delay: Duration,
    ) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<RefreshRequest>();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    RefreshRequest::History { limit, reply } => {
                        let result = retry_with_backoff(
                            "fetch_activity_history",
                            attempts,
                            base_delay,
                            || store.fetch_activity_history(&account_id, limit),
                        )
                        .await;
                        let _ = reply.send(result);
                    }
                    RefreshRequest::Balance => {
                        let fetched = retry_with_backoff(
                            "fetch_account",
                            attempts,
                            base_delay,
                            || store.fetch_account(&account_id),
                        )
                        .await;
                        match fetched {
                            Ok(Some(account)) => manager.apply_remote_balance(
                                account.staked_amount,
                                account.last_activity_timestamp,
                            ),
                            Ok(None) => {}
                            Err(error) => {
                                warn!("Balance refresh exhausted retries: {}", error)
                            }
                        }
                    }
                }
            }
        });
        Self { queue }
    }

    pub fn request_history(
        &self,
        limit: usize,
    ) -> oneshot::Receiver<Result<Vec<activity_record::Model>, EngineError>> {
        let (reply, receiver) = oneshot::channel();
        if self
            .queue
            .send(RefreshRequest::History { limit, reply })
            .is_err()
        {
            warn!("Refresh worker is gone, history request dropped");
        }
        receiver
    }

    pub fn request_balance_refresh(&self) {
        if self.queue.send(RefreshRequest::Balance).is_err() {
            warn!("Refresh worker is gone, balance refresh dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store_api::mock::MockStore;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    const START_MILLIS: i64 = 1_700_000_000_000;
    const START_SECS: i64 = START_MILLIS / 1000;

    #[derive(Default)]
    struct CountingObserver {
        balance_calls: AtomicU32,
        activity_calls: AtomicU32,
        last_staked: Mutex<Option<Decimal>>,
        last_previous: Mutex<Option<Decimal>>,
    }

    impl StateObserver for CountingObserver {
        fn on_balance_change(&self, state: &BalanceState) {
            self.balance_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_staked.lock().unwrap() = Some(state.staked);
            *self.last_previous.lock().unwrap() = state.previous_staked;
        }

        fn on_activity_change(&self, _feed: &[activity_record::Model]) {
            self.activity_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickyObserver;

    impl StateObserver for PanickyObserver {
        fn on_balance_change(&self, _state: &BalanceState) {
            panic!("observer bug");
        }

        fn on_activity_change(&self, _feed: &[activity_record::Model]) {
            panic!("observer bug");
        }
    }

    fn build() -> (Arc<StateManager>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let manager = StateManager::new(
            "acct-1".to_owned(),
            clock.clone() as Arc<dyn Clock>,
            10,
            60,
        );
        (manager, clock)
    }

    fn activity_event(id: &str, amount: Value, timestamp: i64) -> Value {
        json!({
            "event": "activity_added",
            "id": id,
            "account_id": "acct-1",
            "activity_type": "stake",
            "amount": amount,
            "denomination": "TON",
            "timestamp": timestamp,
            "status": "confirmed",
        })
    }

    #[test]
    fn test_malformed_activity_events_dropped() {
        let (manager, _clock) = build();
        let observer = Arc::new(CountingObserver::default());
        manager.register_observer(observer.clone());

        // Missing amount.
        let mut event = activity_event("a1", json!(5), START_SECS);
        event.as_object_mut().unwrap().remove("amount");
        manager.handle_raw(event);
        // Unparsable amount.
        manager.handle_raw(activity_event("a2", json!("NaN"), START_SECS));
        // Ten minutes in the future, past the 60s skew window.
        manager.handle_raw(activity_event("a3", json!(5), START_SECS + 600));
        // Foreign account.
        let mut event = activity_event("a4", json!(5), START_SECS);
        event["account_id"] = json!("acct-2");
        manager.handle_raw(event);
        // Missing id.
        let mut event = activity_event("a5", json!(5), START_SECS);
        event.as_object_mut().unwrap().remove("id");
        manager.handle_raw(event);

        assert!(manager.activity_feed().is_empty());
        assert_eq!(observer.activity_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_activity_within_skew_window_accepted() {
        let (manager, _clock) = build();
        manager.handle_raw(activity_event("a1", json!(5), START_SECS + 30));
        assert_eq!(manager.activity_feed().len(), 1);
    }

    #[test]
    fn test_activity_deduplicated_by_id() {
        let (manager, _clock) = build();
        let observer = Arc::new(CountingObserver::default());
        manager.register_observer(observer.clone());

        manager.handle_raw(activity_event("a1", json!(5), START_SECS));
        manager.handle_raw(activity_event("a1", json!(5), START_SECS));
        assert_eq!(manager.activity_feed().len(), 1);
        assert_eq!(observer.activity_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_feed_window_is_bounded_newest_first() {
        let (manager, _clock) = build();
        for n in 0..12 {
            manager.handle_raw(activity_event(&format!("a{}", n), json!(1), START_SECS + n));
        }
        let feed = manager.activity_feed();
        assert_eq!(feed.len(), 10);
        assert_eq!(feed[0].id, "a11");
        assert_eq!(feed[9].id, "a2");
    }

    #[test]
    fn test_balance_event_preserves_previous_value() {
        let (manager, _clock) = build();
        let observer = Arc::new(CountingObserver::default());
        manager.register_observer(observer.clone());
        manager.seed_balance(dec!(100), Decimal::ZERO, START_SECS);

        manager.handle_raw(json!({
            "event": "balance_changed",
            "account_id": "acct-1",
            "staked_amount": 150,
            "timestamp": START_SECS + 10,
        }));
        let state = manager.balance_state();
        assert_eq!(state.staked, dec!(150));
        assert_eq!(state.previous_staked, Some(dec!(100)));
        assert_eq!(*observer.last_staked.lock().unwrap(), Some(dec!(150)));
        assert_eq!(*observer.last_previous.lock().unwrap(), Some(dec!(100)));
    }

    #[test]
    fn test_balance_last_write_wins_by_timestamp() {
        let (manager, _clock) = build();
        manager.seed_balance(dec!(100), Decimal::ZERO, START_SECS);

        manager.handle_raw(json!({
            "event": "balance_changed",
            "account_id": "acct-1",
            "staked_amount": 200,
            "timestamp": START_SECS + 20,
        }));
        // Arrives later, but is older: dropped.
        manager.handle_raw(json!({
            "event": "balance_changed",
            "account_id": "acct-1",
            "staked_amount": 120,
            "timestamp": START_SECS + 5,
        }));
        assert_eq!(manager.balance_state().staked, dec!(200));
    }

    #[test]
    fn test_future_or_foreign_balance_dropped() {
        let (manager, _clock) = build();
        manager.seed_balance(dec!(100), Decimal::ZERO, START_SECS);

        manager.handle_raw(json!({
            "event": "balance_changed",
            "account_id": "acct-1",
            "staked_amount": 500,
            "timestamp": START_SECS + 600,
        }));
        manager.handle_raw(json!({
            "event": "balance_changed",
            "account_id": "acct-2",
            "staked_amount": 500,
            "timestamp": START_SECS,
        }));
        assert_eq!(manager.balance_state().staked, dec!(100));
    }

    #[test]
    fn test_panicking_observer_does_not_break_fanout() {
        let (manager, _clock) = build();
        let counting = Arc::new(CountingObserver::default());
        manager.register_observer(Arc::new(PanickyObserver));
        manager.register_observer(counting.clone());

        manager.handle_raw(activity_event("a1", json!(5), START_SECS));
        manager.publish_earnings(dec!(0.5));

        assert_eq!(counting.activity_calls.load(Ordering::SeqCst), 1);
        assert_eq!(counting.balance_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_queue_retries_transient_failures() {
        let (manager, _clock) = build();
        let store = Arc::new(MockStore::default());
        store.fail_fetches.store(2, Ordering::SeqCst);
        store
            .activities
            .lock()
            .unwrap()
            .push(activity_record::Model {
                id: "a1".to_owned(),
                account_id: "acct-1".to_owned(),
                activity_type: ActivityType::Claim,
                amount: dec!(1),
                denomination: "TON".to_owned(),
                timestamp: START_SECS,
                counterparty: None,
                tx_hash: None,
                status: "confirmed".to_owned(),
            });
        let queue = RefreshQueue::new(
            store.clone(),
            manager,
            "acct-1".to_owned(),
            3,
            Duration::from_millis(1),
        );

        let history = queue.request_history(100).await.unwrap().unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_queue_surfaces_exhaustion() {
        let (manager, _clock) = build();
        let store = Arc::new(MockStore::default());
        store.fail_fetches.store(10, Ordering::SeqCst);
        let queue = RefreshQueue::new(
            store,
            manager,
            "acct-1".to_owned(),
            3,
            Duration::from_millis(1),
        );

        let result = queue.request_history(100).await.unwrap();
        assert!(matches!(result, Err(EngineError::TransientRemote(_))));
    }

    mod subscription {
        use super::*;

        struct VecStream {
            events: VecDeque<Value>,
        }

        #[async_trait]
        impl EventStream for VecStream {
            async fn next_event(&mut self) -> Option<Value> {
                self.events.pop_front()
            }
        }

        struct MockChannel {
            scripts: Mutex<VecDeque<Result<Vec<Value>, EngineError>>>,
            attempts: AtomicU32,
        }

        #[async_trait]
        impl RealtimeChannel for MockChannel {
            async fn connect(&self) -> Result<Box<dyn EventStream>, EngineError> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                match self.scripts.lock().unwrap().pop_front() {
                    Some(Ok(events)) => Ok(Box::new(VecStream {
                        events: events.into(),
                    })),
                    Some(Err(error)) => Err(error),
                    None => Err(EngineError::TransientRemote("script over".to_owned())),
                }
            }
        }

        #[tokio::test]
        async fn test_subscription_reconnects_after_failure_and_drop() {
            let (manager, _clock) = build();
            let channel = Arc::new(MockChannel {
                scripts: Mutex::new(VecDeque::from([
                    Err(EngineError::TransientRemote("refused".to_owned())),
                    Ok(vec![
                        activity_event("a1", json!(5), START_SECS),
                        activity_event("a2", json!(7), START_SECS + 1),
                    ]),
                ])),
                attempts: AtomicU32::new(0),
            });

            let task = tokio::spawn(run_subscription(
                manager.clone(),
                channel.clone() as Arc<dyn RealtimeChannel>,
                Duration::from_millis(1),
            ));
            sleep(Duration::from_millis(100)).await;
            task.abort();

            // Failed connect, scripted stream, and at least one retry after
            // the stream ended.
            assert!(channel.attempts.load(Ordering::SeqCst) >= 3);
            assert_eq!(manager.activity_feed().len(), 2);
        }
    }
}
