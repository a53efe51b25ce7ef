use crate::accumulator::Accumulator;
use crate::error::EngineError;
use crate::store_api::RemoteStore;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Max-wins merge. Earnings are monotonic non-decreasing, so the larger of
/// the two values is always the newer truth; downward corrections bypass
/// this entirely via `Accumulator::force_overwrite`.
pub fn reconcile(local: Decimal, remote: Decimal) -> Decimal {
    if remote > local {
        remote
    } else {
        local
    }
}

pub struct Resolver {
    store: Arc<dyn RemoteStore>,
    accumulator: Arc<Accumulator>,
    account_id: String,
    last_snapshot_timestamp: Mutex<i64>,
}

impl Resolver {
    pub fn new(store: Arc<dyn RemoteStore>, accumulator: Arc<Accumulator>, account_id: String) -> Self {
        Self {
            store,
            accumulator,
            account_id,
            last_snapshot_timestamp: Mutex::new(0),
        }
    }

    /// Seeds the monotonic snapshot-timestamp check from the bootstrap fetch.
    pub fn observe_snapshot_timestamp(&self, timestamp: i64) {
        let mut last = self.last_snapshot_timestamp.lock().unwrap();
        if timestamp > *last {
            *last = timestamp;
        }
    }

    /// One reconciliation pass: a fresh fetch (never reused across passes),
    /// validation, then a raise-only apply. Returns the resolved value.
    pub async fn run_pass(&self) -> Result<Decimal, EngineError> {
        let snapshot = self.store.fetch_snapshot(&self.account_id).await?;
        let local = self.accumulator.snapshot().accrued;
        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => return Ok(local),
        };
        if snapshot.current_earned < Decimal::ZERO {
            error!(
                "Discarding remote snapshot with negative earned {}",
                snapshot.current_earned
            );
            return Ok(local);
        }
        {
            let mut last = self.last_snapshot_timestamp.lock().unwrap();
            if snapshot.last_update_timestamp < *last {
                error!(
                    "Discarding remote snapshot with regressing timestamp {} < {}",
                    snapshot.last_update_timestamp, *last
                );
                return Ok(local);
            }
            *last = snapshot.last_update_timestamp;
        }
        let resolved = reconcile(local, snapshot.current_earned);
        if self.accumulator.reconcile_to(resolved) {
            info!("Reconciled accrued {} -> {}", local, resolved);
        }
        Ok(resolved)
    }
}
