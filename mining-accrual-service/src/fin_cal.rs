use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

pub const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RateTier {
    pub min_stake: Decimal,
    pub daily_rate: Decimal,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TimeBand {
    pub min_days: i64,
    pub multiplier: Decimal,
}

/// Tier table and time-multiplier bands. Both are configuration inputs; the
/// defaults below are the production values.
///
/// The per-second rate is `tier_daily_rate(staked) * time_multiplier(days)
/// * staked / 86400`. Pure and deterministic given its inputs.
#[derive(Clone, Debug)]
pub struct RateSchedule {
    tiers: Vec<RateTier>,
    bands: Vec<TimeBand>,
}

impl RateSchedule {
    pub fn new(mut tiers: Vec<RateTier>, mut bands: Vec<TimeBand>) -> Self {
        tiers.sort_by(|a, b| b.min_stake.cmp(&a.min_stake));
        bands.sort_by(|a, b| b.min_days.cmp(&a.min_days));
        Self { tiers, bands }
    }

    pub fn default_tiers() -> Vec<RateTier> {
        vec![
            RateTier {
                min_stake: dec!(1000),
                daily_rate: dec!(0.03),
            },
            RateTier {
                min_stake: dec!(500),
                daily_rate: dec!(0.025),
            },
            RateTier {
                min_stake: dec!(100),
                daily_rate: dec!(0.02),
            },
            RateTier {
                min_stake: dec!(50),
                daily_rate: dec!(0.015),
            },
            RateTier {
                min_stake: dec!(0),
                daily_rate: dec!(0.01),
            },
        ]
    }

    pub fn default_bands() -> Vec<TimeBand> {
        vec![
            TimeBand {
                min_days: 31,
                multiplier: dec!(1.25),
            },
            TimeBand {
                min_days: 8,
                multiplier: dec!(1.1),
            },
            TimeBand {
                min_days: 0,
                multiplier: dec!(1.0),
            },
        ]
    }

    pub fn daily_rate(&self, staked: Decimal) -> Decimal {
        self.tiers
            .iter()
            .find(|tier| staked >= tier.min_stake)
            .map(|tier| tier.daily_rate)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn time_multiplier(&self, days_staked: i64) -> Decimal {
        self.bands
            .iter()
            .find(|band| days_staked >= band.min_days)
            .map(|band| band.multiplier)
            .unwrap_or(Decimal::ONE)
    }

    pub fn per_second_rate(&self, staked: Decimal, days_staked: i64) -> Decimal {
        if staked <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.daily_rate(staked) * self.time_multiplier(days_staked) * staked
            / Decimal::from(SECONDS_PER_DAY)
    }
}

impl Default for RateSchedule {
    fn default() -> Self {
        Self::new(Self::default_tiers(), Self::default_bands())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries() {
        let schedule = RateSchedule::default();
        assert_eq!(schedule.daily_rate(dec!(49.99)), dec!(0.01));
        assert_eq!(schedule.daily_rate(dec!(50)), dec!(0.015));
        assert_eq!(schedule.daily_rate(dec!(99.99)), dec!(0.015));
        assert_eq!(schedule.daily_rate(dec!(100)), dec!(0.02));
        assert_eq!(schedule.daily_rate(dec!(499.99)), dec!(0.02));
        assert_eq!(schedule.daily_rate(dec!(500)), dec!(0.025));
        assert_eq!(schedule.daily_rate(dec!(999.99)), dec!(0.025));
        assert_eq!(schedule.daily_rate(dec!(1000)), dec!(0.03));
    }

    #[test]
    fn test_time_multiplier_bands() {
        let schedule = RateSchedule::default();
        assert_eq!(schedule.time_multiplier(0), dec!(1.0));
        assert_eq!(schedule.time_multiplier(7), dec!(1.0));
        assert_eq!(schedule.time_multiplier(8), dec!(1.1));
        assert_eq!(schedule.time_multiplier(30), dec!(1.1));
        assert_eq!(schedule.time_multiplier(31), dec!(1.25));
        assert_eq!(schedule.time_multiplier(365), dec!(1.25));
    }

    #[test]
    fn test_per_second_rate_formula() {
        let schedule = RateSchedule::default();
        // 120 staked, tier 2%/day, no time multiplier yet.
        let rate = schedule.per_second_rate(dec!(120), 0);
        assert_eq!(rate, dec!(120) * dec!(0.02) / dec!(86400));
        // 31 days staked picks up the 1.25x band.
        let rate = schedule.per_second_rate(dec!(120), 31);
        assert_eq!(rate, dec!(120) * dec!(0.02) * dec!(1.25) / dec!(86400));
    }

    #[test]
    fn test_zero_and_negative_stake_rate() {
        let schedule = RateSchedule::default();
        assert_eq!(schedule.per_second_rate(Decimal::ZERO, 10), Decimal::ZERO);
        assert_eq!(schedule.per_second_rate(dec!(-5), 10), Decimal::ZERO);
    }

    #[test]
    fn test_custom_tier_table() {
        let schedule = RateSchedule::new(
            vec![
                RateTier {
                    min_stake: dec!(0),
                    daily_rate: dec!(0.005),
                },
                RateTier {
                    min_stake: dec!(10),
                    daily_rate: dec!(0.05),
                },
            ],
            RateSchedule::default_bands(),
        );
        assert_eq!(schedule.daily_rate(dec!(9)), dec!(0.005));
        assert_eq!(schedule.daily_rate(dec!(10)), dec!(0.05));
    }
}
