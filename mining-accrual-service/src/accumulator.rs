use crate::clock::Clock;
use crate::error::EngineError;
use crate::fin_cal::{RateSchedule, SECONDS_PER_DAY};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct AccrualState {
    pub accrued: Decimal,
    pub staked: Decimal,
    pub rate_per_sec: Decimal,
    pub last_tick_millis: i64,
    pub accrual_start_secs: i64,
    pub active: bool,
}

/// Exclusive owner of the accrual state. Every other component reads a
/// snapshot or mutates through this API; nothing else touches `accrued` or
/// `last_tick_millis`.
pub struct Accumulator {
    state: Mutex<AccrualState>,
    schedule: RateSchedule,
    clock: Arc<dyn Clock>,
    earnings_ceiling: Decimal,
    max_tick_gap_millis: i64,
    halted: AtomicBool,
}

impl Accumulator {
    pub fn new(
        schedule: RateSchedule,
        clock: Arc<dyn Clock>,
        earnings_ceiling: Decimal,
        max_tick_gap: Duration,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            state: Mutex::new(AccrualState {
                accrued: Decimal::ZERO,
                staked: Decimal::ZERO,
                rate_per_sec: Decimal::ZERO,
                last_tick_millis: now,
                accrual_start_secs: now / 1000,
                active: false,
            }),
            schedule,
            clock,
            earnings_ceiling,
            max_tick_gap_millis: max_tick_gap.as_millis() as i64,
            halted: AtomicBool::new(false),
        }
    }

    /// Session-start bootstrap from the reconciled snapshot.
    pub fn initialize(&self, accrued: Decimal, staked: Decimal, accrual_start_secs: i64) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap();
        state.accrued = accrued;
        state.staked = staked;
        state.accrual_start_secs = accrual_start_secs;
        state.last_tick_millis = now;
        state.rate_per_sec = self
            .schedule
            .per_second_rate(staked, days_staked(now / 1000, accrual_start_secs));
        state.active = staked > Decimal::ZERO;
    }

    pub fn snapshot(&self) -> AccrualState {
        self.state.lock().unwrap().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// One timer step. Re-derives the rate from the current stake each call
    /// so a confirmed deposit changes the slope without a restart. Returns
    /// the new accrued value when anything was credited.
    pub fn tick(&self) -> Option<Decimal> {
        if self.is_halted() {
            return None;
        }
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap();
        if !state.active || state.staked <= Decimal::ZERO {
            state.last_tick_millis = now;
            return None;
        }
        let mut elapsed = now - state.last_tick_millis;
        if elapsed <= 0 {
            return None;
        }
        if elapsed > self.max_tick_gap_millis {
            // A suspend/resume cycle credits the full gap; a raw tick never
            // applies more than the clamp in one step.
            warn!(
                "Tick gap of {}ms exceeds clamp, crediting {}ms only",
                elapsed, self.max_tick_gap_millis
            );
            elapsed = self.max_tick_gap_millis;
        }
        state.rate_per_sec = self.schedule.per_second_rate(
            state.staked,
            days_staked(now / 1000, state.accrual_start_secs),
        );
        let delta = state.rate_per_sec * Decimal::from(elapsed) / dec!(1000);
        let next = state.accrued + delta;
        if next > self.earnings_ceiling {
            self.halt(&mut state, next);
            return None;
        }
        state.accrued = next;
        state.last_tick_millis = now;
        Some(state.accrued)
    }

    /// Offline-gap credit. Raise-only, subject to the same ceiling as ticks.
    pub fn credit_gap(&self, amount: Decimal) -> Result<Decimal, EngineError> {
        if amount <= Decimal::ZERO {
            let accrued = self.state.lock().unwrap().accrued;
            return Ok(accrued);
        }
        let mut state = self.state.lock().unwrap();
        let next = state.accrued + amount;
        if next > self.earnings_ceiling {
            self.halt(&mut state, next);
            return Err(EngineError::SafetyLimit(format!(
                "gap credit of {} would exceed ceiling {}",
                amount, self.earnings_ceiling
            )));
        }
        state.accrued = next;
        Ok(state.accrued)
    }

    /// Applies a reconciled value. Never writes backward; downward
    /// corrections go through `force_overwrite`.
    pub fn reconcile_to(&self, resolved: Decimal) -> bool {
        let mut state = self.state.lock().unwrap();
        if resolved <= state.accrued {
            return false;
        }
        if resolved > self.earnings_ceiling {
            self.halt(&mut state, resolved);
            return false;
        }
        state.accrued = resolved;
        true
    }

    /// Admin override path. Bypasses the raise-only rule and clears a halt
    /// when the new value is back under the ceiling.
    pub fn force_overwrite(&self, value: Decimal) {
        let mut state = self.state.lock().unwrap();
        state.accrued = value;
        if value <= self.earnings_ceiling {
            self.halted.store(false, Ordering::SeqCst);
            state.active = state.staked > Decimal::ZERO;
            state.last_tick_millis = self.clock.now_millis();
        }
    }

    /// Reserved to the deposit/withdrawal orchestrator, the single writer of
    /// staked principal.
    pub fn set_staked(&self, staked: Decimal) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap();
        state.staked = staked;
        state.rate_per_sec = self
            .schedule
            .per_second_rate(staked, days_staked(now / 1000, state.accrual_start_secs));
        state.active = staked > Decimal::ZERO && !self.is_halted();
    }

    pub fn set_inactive(&self) {
        self.state.lock().unwrap().active = false;
    }

    /// Restart ticking from `now`, so the first tick after a resume does not
    /// observe the suspension gap a second time.
    pub fn resume_ticking(&self) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap();
        state.last_tick_millis = now;
        state.active = state.staked > Decimal::ZERO && !self.is_halted();
    }

    fn halt(&self, state: &mut AccrualState, attempted: Decimal) {
        self.halted.store(true, Ordering::SeqCst);
        state.active = false;
        error!(
            "Accrual halted: {} exceeds earnings ceiling {}",
            attempted, self.earnings_ceiling
        );
    }
}

fn days_staked(now_secs: i64, accrual_start_secs: i64) -> i64 {
    ((now_secs - accrual_start_secs) / SECONDS_PER_DAY).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const START_MILLIS: i64 = 1_700_000_000_000;

    fn build(clock: &Arc<ManualClock>, ceiling: Decimal) -> Accumulator {
        Accumulator::new(
            RateSchedule::default(),
            clock.clone() as Arc<dyn Clock>,
            ceiling,
            Duration::from_secs(3 * 3600),
        )
    }

    #[test]
    fn test_tick_accrues_at_current_rate() {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let acc = build(&clock, dec!(100000));
        acc.initialize(Decimal::ZERO, dec!(120), START_MILLIS / 1000);

        clock.advance_secs(1);
        let accrued = acc.tick().unwrap();
        assert_eq!(accrued, dec!(120) * dec!(0.02) / dec!(86400));
    }

    #[test]
    fn test_hour_of_ticks_matches_formula() {
        // Stake 120 at 2%/day for 3600 simulated seconds is ~0.1 token.
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let acc = build(&clock, dec!(100000));
        acc.initialize(Decimal::ZERO, dec!(120), START_MILLIS / 1000);

        for _ in 0..3600 {
            clock.advance_secs(1);
            acc.tick();
        }
        let accrued = acc.snapshot().accrued;
        assert!((accrued - dec!(0.1)).abs() < dec!(0.000001));
    }

    #[test]
    fn test_accrued_is_monotonic() {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let acc = build(&clock, dec!(100000));
        acc.initialize(dec!(5), dec!(500), START_MILLIS / 1000);

        let mut previous = acc.snapshot().accrued;
        for step in 1..200 {
            clock.advance_millis(step * 37 % 3000 + 1);
            acc.tick();
            acc.reconcile_to(previous);
            let current = acc.snapshot().accrued;
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn test_tick_gap_is_clamped() {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let acc = build(&clock, dec!(100000));
        acc.initialize(Decimal::ZERO, dec!(120), START_MILLIS / 1000);

        clock.advance_secs(10 * 3600);
        acc.tick();
        let rate = dec!(120) * dec!(0.02) / dec!(86400);
        assert_eq!(acc.snapshot().accrued, rate * dec!(10800));
    }

    #[test]
    fn test_rate_reads_post_deposit_stake() {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let acc = build(&clock, dec!(100000));
        acc.initialize(Decimal::ZERO, dec!(100), START_MILLIS / 1000);

        clock.advance_secs(1);
        acc.tick();
        let before = acc.snapshot().accrued;
        assert_eq!(before, dec!(100) * dec!(0.02) / dec!(86400));

        // Stake 100 -> 150 stays inside the >=100 tier; only the principal
        // factor in the rate should change.
        acc.set_staked(dec!(150));
        clock.advance_secs(1);
        acc.tick();
        let delta = acc.snapshot().accrued - before;
        assert_eq!(delta, dec!(150) * dec!(0.02) / dec!(86400));
    }

    #[test]
    fn test_ceiling_halts_instead_of_clamping() {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let acc = build(&clock, dec!(1));
        acc.initialize(dec!(0.9), dec!(1000000), START_MILLIS / 1000);

        clock.advance_secs(3600);
        assert_eq!(acc.tick(), None);
        let state = acc.snapshot();
        assert_eq!(state.accrued, dec!(0.9));
        assert!(!state.active);
        assert!(acc.is_halted());

        // Still halted on the next tick.
        clock.advance_secs(1);
        assert_eq!(acc.tick(), None);
    }

    #[test]
    fn test_reconcile_only_raises() {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let acc = build(&clock, dec!(100000));
        acc.initialize(dec!(2), dec!(100), START_MILLIS / 1000);

        assert!(!acc.reconcile_to(dec!(1.5)));
        assert_eq!(acc.snapshot().accrued, dec!(2));
        assert!(acc.reconcile_to(dec!(3)));
        assert_eq!(acc.snapshot().accrued, dec!(3));
    }

    #[test]
    fn test_force_overwrite_lowers_and_clears_halt() {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let acc = build(&clock, dec!(1));
        acc.initialize(dec!(0.99), dec!(1000000), START_MILLIS / 1000);
        clock.advance_secs(3600);
        acc.tick();
        assert!(acc.is_halted());

        acc.force_overwrite(dec!(0.25));
        assert!(!acc.is_halted());
        let state = acc.snapshot();
        assert_eq!(state.accrued, dec!(0.25));
        assert!(state.active);
    }

    #[test]
    fn test_idle_with_zero_stake() {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let acc = build(&clock, dec!(100000));
        acc.initialize(Decimal::ZERO, Decimal::ZERO, START_MILLIS / 1000);

        clock.advance_secs(60);
        assert_eq!(acc.tick(), None);
        assert_eq!(acc.snapshot().accrued, Decimal::ZERO);
    }

    #[test]
    fn test_credit_gap_respects_ceiling() {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let acc = build(&clock, dec!(10));
        acc.initialize(dec!(9), dec!(100), START_MILLIS / 1000);

        assert!(acc.credit_gap(dec!(0.5)).is_ok());
        assert_eq!(acc.snapshot().accrued, dec!(9.5));
        assert!(matches!(
            acc.credit_gap(dec!(5)),
            Err(EngineError::SafetyLimit(_))
        ));
        assert_eq!(acc.snapshot().accrued, dec!(9.5));
        assert!(acc.is_halted());
    }
}
