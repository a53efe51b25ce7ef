mod accumulator;
mod clock;
mod config;
mod dto;
mod engine;
mod error;
mod fin_cal;
mod local_cache;
mod offline;
mod reconcile;
mod retry;
mod state_manager;
mod store_api;
mod sync;
mod transaction;
mod wallet;

use clock::{Clock, SystemClock};
use engine::{Engine, EngineSettings};
use fin_cal::RateSchedule;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use local_cache::LocalCache;
use mining_entity::record::activity_record;
use state_manager::{BalanceState, StateObserver, WsRealtimeChannel};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store_api::HttpRemoteStore;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};
use transaction::OrchestratorSettings;
use wallet::HttpWalletSigner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config: config::Config = Figment::new().merge(Toml::file("App.toml")).extract()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", &config.rust_log);
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                format!("mining_accrual_service={}", &config.accrual_service_log)
                    .parse()
                    .expect("Error parsing directive"),
            ),
        )
        .with_span_events(FmtSpan::FULL)
        .init();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs.unwrap_or(10)))
        .build()
        .expect("Reqwest client failed to initialize!");

    let store = Arc::new(HttpRemoteStore::new(
        client.clone(),
        config.store_node.to_owned(),
        config.store_api_key.to_owned(),
    ));
    let signer = Arc::new(HttpWalletSigner::new(client, config.wallet_node.to_owned()));
    let channel = Arc::new(WsRealtimeChannel::new(
        config.realtime_node.to_owned(),
        config.account_id.to_owned(),
    ));
    let cache_path = config
        .local_cache_path
        .to_owned()
        .unwrap_or_else(|| "accrual_cache.json".to_owned());
    let cache = Arc::new(LocalCache::load(PathBuf::from(cache_path)));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let engine = Engine::start(
        store,
        signer,
        channel,
        cache,
        clock,
        config.account_id.to_owned(),
        engine_settings(&config),
    )
    .await?;
    engine.register_observer(Arc::new(LogObserver));

    // SIGUSR1 suspends, SIGUSR2 resumes; ctrl-c flushes and exits. Any host
    // with a different lifecycle calls the same three engine methods.
    let mut suspend_signal = signal(SignalKind::user_defined1())?;
    let mut resume_signal = signal(SignalKind::user_defined2())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = suspend_signal.recv() => engine.suspend().await,
            _ = resume_signal.recv() => engine.resume().await,
        }
    }
    info!("Shutdown requested, flushing");
    engine.shutdown().await;
    Ok(())
}

struct LogObserver;

impl StateObserver for LogObserver {
    fn on_balance_change(&self, state: &BalanceState) {
        debug!(
            "Balance: staked {} (was {:?}), accrued {}",
            state.staked, state.previous_staked, state.accrued
        );
    }

    fn on_activity_change(&self, feed: &[activity_record::Model]) {
        if let Some(latest) = feed.first() {
            info!(
                "Activity: {} {} {} at {}",
                latest.activity_type, latest.amount, latest.denomination, latest.timestamp
            );
        }
    }
}

fn engine_settings(config: &config::Config) -> EngineSettings {
    let defaults = EngineSettings::default();
    let orchestrator_defaults = OrchestratorSettings::default();
    EngineSettings {
        tick_interval: Duration::from_millis(config.tick_interval_millis.unwrap_or(1_000)),
        sync_interval: Duration::from_secs(config.sync_interval_secs.unwrap_or(30)),
        sync_min_gap: Duration::from_secs(config.sync_min_gap_secs.unwrap_or(45)),
        sync_max_per_hour: config
            .sync_max_per_hour
            .unwrap_or(defaults.sync_max_per_hour),
        sync_force_queue_len: config
            .sync_force_queue_len
            .unwrap_or(defaults.sync_force_queue_len),
        max_tick_gap: config
            .max_tick_gap_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_tick_gap),
        max_offline_gap: config
            .max_offline_gap_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_offline_gap),
        earnings_ceiling: config
            .earnings_ceiling
            .unwrap_or(defaults.earnings_ceiling),
        reconnect_delay: Duration::from_secs(config.reconnect_delay_secs.unwrap_or(5)),
        feed_len: config.activity_feed_len.unwrap_or(defaults.feed_len),
        skew_tolerance_secs: config
            .clock_skew_tolerance_secs
            .unwrap_or(defaults.skew_tolerance_secs),
        refresh_attempts: defaults.refresh_attempts,
        refresh_base_delay: defaults.refresh_base_delay,
        rate_schedule: RateSchedule::new(
            config
                .rate_tiers
                .clone()
                .unwrap_or_else(RateSchedule::default_tiers),
            config
                .time_bands
                .clone()
                .unwrap_or_else(RateSchedule::default_bands),
        ),
        orchestrator: OrchestratorSettings {
            minimum_deposit: config
                .minimum_deposit
                .unwrap_or(orchestrator_defaults.minimum_deposit),
            minimum_withdrawal: config
                .minimum_withdrawal
                .unwrap_or(orchestrator_defaults.minimum_withdrawal),
            withdrawal_cooldown_secs: config
                .withdrawal_cooldown_secs
                .unwrap_or(orchestrator_defaults.withdrawal_cooldown_secs),
            referral_reward_rate: config
                .referral_reward_rate
                .unwrap_or(orchestrator_defaults.referral_reward_rate),
            holding_wallet: config.holding_wallet.to_owned(),
            wallet_validity_secs: config
                .wallet_validity_secs
                .unwrap_or(orchestrator_defaults.wallet_validity_secs),
            denomination: config
                .denomination
                .to_owned()
                .unwrap_or(orchestrator_defaults.denomination),
            persist_attempts: orchestrator_defaults.persist_attempts,
            retry_base_delay: orchestrator_defaults.retry_base_delay,
            flush_debounce: orchestrator_defaults.flush_debounce,
        },
    }
}
