use crate::accumulator::Accumulator;
use crate::clock::Clock;
use crate::local_cache::{LocalCache, SuspendMarker};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{info, warn};

/// Credits earnings for the time the process spent suspended, once per
/// suspend/resume cycle. The marker is consumed on resume, so a repeated
/// resume credits nothing.
pub struct GapCompensator {
    cache: Arc<LocalCache>,
    accumulator: Arc<Accumulator>,
    clock: Arc<dyn Clock>,
    max_offline_gap_millis: i64,
}

impl GapCompensator {
    pub fn new(
        cache: Arc<LocalCache>,
        accumulator: Arc<Accumulator>,
        clock: Arc<dyn Clock>,
        max_offline_gap: std::time::Duration,
    ) -> Self {
        Self {
            cache,
            accumulator,
            clock,
            max_offline_gap_millis: max_offline_gap.as_millis() as i64,
        }
    }

    pub fn record_suspend(&self) {
        let state = self.accumulator.snapshot();
        self.cache.write_suspend_marker(SuspendMarker {
            last_active_millis: self.clock.now_millis(),
            rate_per_sec: state.rate_per_sec,
        });
        self.accumulator.set_inactive();
    }

    /// Returns the credited amount, if any. The ticker is restarted from
    /// `now` on every path so the regular tick never re-observes the gap.
    pub fn compensate_resume(&self) -> Option<Decimal> {
        let credited = match self.cache.take_suspend_marker() {
            Some(marker) => self.credit_marker(marker),
            None => None,
        };
        self.accumulator.resume_ticking();
        credited
    }

    fn credit_marker(&self, marker: SuspendMarker) -> Option<Decimal> {
        let now = self.clock.now_millis();
        let gap_millis = now - marker.last_active_millis;
        if gap_millis < 0 {
            warn!(
                "Suspend marker is {}ms in the future, skipping gap credit",
                -gap_millis
            );
            return None;
        }
        if gap_millis > self.max_offline_gap_millis {
            warn!(
                "Offline gap of {}ms exceeds plausibility limit {}ms, skipping gap credit",
                gap_millis, self.max_offline_gap_millis
            );
            return None;
        }
        let credit = marker.rate_per_sec * Decimal::from(gap_millis) / dec!(1000);
        match self.accumulator.credit_gap(credit) {
            Ok(accrued) => {
                info!(
                    "Credited {} for a {}s offline gap, accrued now {}",
                    credit,
                    gap_millis / 1000,
                    accrued
                );
                Some(credit)
            }
            Err(error) => {
                warn!("Offline gap credit refused: {}", error);
                None
            }
        }
    }
}
