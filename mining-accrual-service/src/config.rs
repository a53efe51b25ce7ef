use crate::fin_cal::{RateTier, TimeBand};
use serde::Deserialize;

/// Loaded from `App.toml` by `main`. Tunables are optional and defaulted
/// near their point of use; connection settings are required.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub rust_log: String,
    pub accrual_service_log: String,

    pub account_id: String,
    pub store_node: String,
    pub store_api_key: String,
    pub wallet_node: String,
    pub realtime_node: String,
    pub holding_wallet: String,

    pub local_cache_path: Option<String>,
    pub request_timeout_secs: Option<u64>,

    pub tick_interval_millis: Option<u64>,
    pub max_tick_gap_secs: Option<u64>,
    pub max_offline_gap_secs: Option<u64>,
    pub earnings_ceiling: Option<rust_decimal::Decimal>,
    pub rate_tiers: Option<Vec<RateTier>>,
    pub time_bands: Option<Vec<TimeBand>>,

    pub sync_interval_secs: Option<u64>,
    pub sync_min_gap_secs: Option<u64>,
    pub sync_max_per_hour: Option<u32>,
    pub sync_force_queue_len: Option<u32>,

    pub minimum_deposit: Option<rust_decimal::Decimal>,
    pub minimum_withdrawal: Option<rust_decimal::Decimal>,
    pub withdrawal_cooldown_secs: Option<i64>,
    pub referral_reward_rate: Option<rust_decimal::Decimal>,
    pub wallet_validity_secs: Option<i64>,

    pub reconnect_delay_secs: Option<u64>,
    pub activity_feed_len: Option<usize>,
    pub clock_skew_tolerance_secs: Option<i64>,

    pub denomination: Option<String>,
}
