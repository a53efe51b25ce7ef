use crate::clock::Clock;
use crate::store_api::RemoteStore;
use mining_entity::record::earnings_snapshot;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    /// Rate-limit skip. A deliberate no-op, not a failure.
    Skipped,
    Failed,
}

/// Sync quota bookkeeping. One instance per engine, and one engine serves
/// one account, so quota is never shared across accounts in a process.
pub struct RateLimiter {
    min_gap_millis: i64,
    max_per_window: u32,
    window_millis: i64,
    last_sync_millis: Option<i64>,
    window_started_millis: i64,
    count_in_window: u32,
}

impl RateLimiter {
    pub fn new(min_gap: Duration, max_per_window: u32, window: Duration, now_millis: i64) -> Self {
        Self {
            min_gap_millis: min_gap.as_millis() as i64,
            max_per_window,
            window_millis: window.as_millis() as i64,
            last_sync_millis: None,
            window_started_millis: now_millis,
            count_in_window: 0,
        }
    }

    /// Reserves a sync slot. `force` bypasses the minimum gap but never the
    /// per-window cap.
    pub fn try_acquire(&mut self, now_millis: i64, force: bool) -> bool {
        if now_millis - self.window_started_millis >= self.window_millis {
            self.window_started_millis = now_millis;
            self.count_in_window = 0;
        }
        if self.count_in_window >= self.max_per_window {
            return false;
        }
        if !force {
            if let Some(last) = self.last_sync_millis {
                if now_millis - last < self.min_gap_millis {
                    return false;
                }
            }
        }
        self.last_sync_millis = Some(now_millis);
        self.count_in_window += 1;
        true
    }
}

/// Counter of material unflushed mutations (gap credits, confirmed
/// operations, reconciliation raises). Regular ticks are covered by the
/// periodic sync and do not count. Crossing the threshold wakes the sync
/// task for a forced flush.
pub struct PendingWrites {
    count: AtomicU32,
    threshold: u32,
    notify: Notify,
}

impl PendingWrites {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            threshold: threshold.max(1),
            notify: Notify::new(),
        }
    }

    pub fn record(&self) {
        let pending = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if pending >= self.threshold {
            self.notify.notify_one();
        }
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    pub fn pending(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

pub struct SyncClient {
    store: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    account_id: String,
    limiter: Mutex<RateLimiter>,
    last_synced: Mutex<Option<Decimal>>,
}

impl SyncClient {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        account_id: String,
        min_gap: Duration,
        max_per_hour: u32,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            store,
            clock,
            account_id,
            limiter: Mutex::new(RateLimiter::new(
                min_gap,
                max_per_hour,
                Duration::from_secs(3600),
                now,
            )),
            last_synced: Mutex::new(None),
        }
    }

    pub fn needs_sync(&self, current: Decimal) -> bool {
        *self.last_synced.lock().unwrap() != Some(current)
    }

    /// Pushes the current accrued value as an idempotent set. On `Failed`
    /// the caller re-validates against the remote snapshot instead of
    /// retrying the same write blind.
    pub async fn sync(
        &self,
        value: Decimal,
        accrual_start_secs: i64,
        force: bool,
    ) -> SyncOutcome {
        let now = self.clock.now_millis();
        {
            let mut limiter = self.limiter.lock().unwrap();
            if !limiter.try_acquire(now, force) {
                debug!("Sync of {} skipped by rate limiter", value);
                return SyncOutcome::Skipped;
            }
        }
        let snapshot = earnings_snapshot::Model {
            account_id: self.account_id.to_owned(),
            current_earned: value,
            last_update_timestamp: now / 1000,
            accrual_start_timestamp: accrual_start_secs,
        };
        match self.store.upsert_snapshot(&snapshot).await {
            Ok(()) => {
                *self.last_synced.lock().unwrap() = Some(value);
                SyncOutcome::Synced
            }
            Err(error) => {
                warn!("Snapshot sync failed: {}", error);
                SyncOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store_api::mock::MockStore;
    use rust_decimal_macros::dec;

    const START_MILLIS: i64 = 1_700_000_000_000;
    const MINUTE: i64 = 60_000;

    #[test]
    fn test_rate_limiter_min_gap() {
        let mut limiter = RateLimiter::new(
            Duration::from_secs(45),
            20,
            Duration::from_secs(3600),
            START_MILLIS,
        );
        assert!(limiter.try_acquire(START_MILLIS, false));
        assert!(!limiter.try_acquire(START_MILLIS + 30_000, false));
        assert!(limiter.try_acquire(START_MILLIS + 46_000, false));
    }

    #[test]
    fn test_rate_limiter_force_bypasses_gap_not_cap() {
        let mut limiter = RateLimiter::new(
            Duration::from_secs(45),
            3,
            Duration::from_secs(3600),
            START_MILLIS,
        );
        assert!(limiter.try_acquire(START_MILLIS, false));
        assert!(limiter.try_acquire(START_MILLIS + 1_000, true));
        assert!(limiter.try_acquire(START_MILLIS + 2_000, true));
        // Cap reached; force does not help.
        assert!(!limiter.try_acquire(START_MILLIS + 3_000, true));
    }

    #[test]
    fn test_rate_limiter_window_resets() {
        let mut limiter = RateLimiter::new(
            Duration::from_secs(45),
            2,
            Duration::from_secs(3600),
            START_MILLIS,
        );
        assert!(limiter.try_acquire(START_MILLIS, true));
        assert!(limiter.try_acquire(START_MILLIS + MINUTE, true));
        assert!(!limiter.try_acquire(START_MILLIS + 2 * MINUTE, true));
        assert!(limiter.try_acquire(START_MILLIS + 61 * MINUTE, true));
    }

    #[tokio::test]
    async fn test_sync_and_skip() {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let store = Arc::new(MockStore::default());
        let client = SyncClient::new(
            store.clone(),
            clock.clone() as Arc<dyn Clock>,
            "acct-1".to_owned(),
            Duration::from_secs(45),
            20,
        );

        assert!(client.needs_sync(dec!(1.5)));
        assert_eq!(client.sync(dec!(1.5), 0, false).await, SyncOutcome::Synced);
        assert!(!client.needs_sync(dec!(1.5)));
        assert!(client.needs_sync(dec!(1.6)));

        // Inside the minimum gap: skipped, not failed.
        clock.advance_secs(10);
        assert_eq!(client.sync(dec!(1.6), 0, false).await, SyncOutcome::Skipped);
        assert_eq!(store.sync_calls.load(Ordering::SeqCst), 1);

        clock.advance_secs(60);
        assert_eq!(client.sync(dec!(1.6), 0, false).await, SyncOutcome::Synced);
        assert_eq!(store.sync_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeated_sync_is_idempotent() {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let store = Arc::new(MockStore::default());
        let client = SyncClient::new(
            store.clone(),
            clock.clone() as Arc<dyn Clock>,
            "acct-1".to_owned(),
            Duration::from_secs(45),
            20,
        );

        assert_eq!(client.sync(dec!(2), 0, false).await, SyncOutcome::Synced);
        clock.advance_secs(60);
        assert_eq!(client.sync(dec!(2), 0, false).await, SyncOutcome::Synced);
        let snapshot = store.snapshot.lock().unwrap().clone().unwrap();
        assert_eq!(snapshot.current_earned, dec!(2));
    }

    #[tokio::test]
    async fn test_failed_sync_reports_failed() {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let store = Arc::new(MockStore::default());
        store.fail_upserts.store(1, Ordering::SeqCst);
        let client = SyncClient::new(
            store.clone(),
            clock.clone() as Arc<dyn Clock>,
            "acct-1".to_owned(),
            Duration::from_secs(45),
            20,
        );

        assert_eq!(client.sync(dec!(3), 0, false).await, SyncOutcome::Failed);
        assert!(client.needs_sync(dec!(3)));
        clock.advance_secs(60);
        assert_eq!(client.sync(dec!(3), 0, false).await, SyncOutcome::Synced);
    }

    #[tokio::test]
    async fn test_pending_writes_threshold_notifies() {
        let pending = PendingWrites::new(3);
        pending.record();
        pending.record();
        assert_eq!(pending.pending(), 2);
        pending.record();
        tokio::time::timeout(Duration::from_millis(100), pending.notified())
            .await
            .expect("threshold should notify");
        pending.reset();
        assert_eq!(pending.pending(), 0);
    }
}
