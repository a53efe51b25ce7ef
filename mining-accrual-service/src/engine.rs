use crate::accumulator::{AccrualState, Accumulator};
use crate::clock::Clock;
use crate::error::EngineError;
use crate::fin_cal::RateSchedule;
use crate::local_cache::LocalCache;
use crate::offline::GapCompensator;
use crate::reconcile::Resolver;
use crate::state_manager::{
    run_subscription, BalanceState, RealtimeChannel, RefreshQueue, StateManager, StateObserver,
};
use crate::store_api::RemoteStore;
use crate::sync::{PendingWrites, SyncClient, SyncOutcome};
use crate::transaction::{OperationReceiver, OrchestratorSettings, TransactionManager};
use crate::wallet::WalletSigner;
use mining_entity::record::activity_record;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub tick_interval: Duration,
    pub sync_interval: Duration,
    pub sync_min_gap: Duration,
    pub sync_max_per_hour: u32,
    pub sync_force_queue_len: u32,
    pub max_tick_gap: Duration,
    pub max_offline_gap: Duration,
    pub earnings_ceiling: Decimal,
    pub reconnect_delay: Duration,
    pub feed_len: usize,
    pub skew_tolerance_secs: i64,
    pub refresh_attempts: u32,
    pub refresh_base_delay: Duration,
    pub rate_schedule: RateSchedule,
    pub orchestrator: OrchestratorSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            sync_interval: Duration::from_secs(30),
            sync_min_gap: Duration::from_secs(45),
            sync_max_per_hour: 20,
            sync_force_queue_len: 10,
            max_tick_gap: Duration::from_secs(3 * 3600),
            max_offline_gap: Duration::from_secs(7 * 24 * 3600),
            earnings_ceiling: dec!(1000000),
            reconnect_delay: Duration::from_secs(5),
            feed_len: 10,
            skew_tolerance_secs: 60,
            refresh_attempts: 3,
            refresh_base_delay: Duration::from_millis(500),
            rate_schedule: RateSchedule::default(),
            orchestrator: OrchestratorSettings::default(),
        }
    }
}

/// Owns every component and background task of one account's accrual
/// session. `suspend`/`resume`/`shutdown` are the host-agnostic lifecycle
/// surface; `main` wires them to process signals.
pub struct Engine {
    account_id: String,
    clock: Arc<dyn Clock>,
    cache: Arc<LocalCache>,
    accumulator: Arc<Accumulator>,
    compensator: GapCompensator,
    sync: Arc<SyncClient>,
    resolver: Arc<Resolver>,
    state: Arc<StateManager>,
    transactions: Arc<TransactionManager>,
    refresh: RefreshQueue,
    pending_writes: Arc<PendingWrites>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub async fn start(
        store: Arc<dyn RemoteStore>,
        signer: Arc<dyn WalletSigner>,
        channel: Arc<dyn RealtimeChannel>,
        cache: Arc<LocalCache>,
        clock: Arc<dyn Clock>,
        account_id: String,
        settings: EngineSettings,
    ) -> Result<Arc<Self>, EngineError> {
        let accumulator = Arc::new(Accumulator::new(
            settings.rate_schedule.clone(),
            clock.clone(),
            settings.earnings_ceiling,
            settings.max_tick_gap,
        ));
        let compensator = GapCompensator::new(
            cache.clone(),
            accumulator.clone(),
            clock.clone(),
            settings.max_offline_gap,
        );
        let sync = Arc::new(SyncClient::new(
            store.clone(),
            clock.clone(),
            account_id.to_owned(),
            settings.sync_min_gap,
            settings.sync_max_per_hour,
        ));
        let resolver = Arc::new(Resolver::new(
            store.clone(),
            accumulator.clone(),
            account_id.to_owned(),
        ));
        let state = StateManager::new(
            account_id.to_owned(),
            clock.clone(),
            settings.feed_len,
            settings.skew_tolerance_secs,
        );
        let pending_writes = Arc::new(PendingWrites::new(settings.sync_force_queue_len));
        let transactions = TransactionManager::new(
            store.clone(),
            signer,
            accumulator.clone(),
            sync.clone(),
            pending_writes.clone(),
            clock.clone(),
            account_id.to_owned(),
            settings.orchestrator.clone(),
        );
        let refresh = RefreshQueue::new(
            store.clone(),
            state.clone(),
            account_id.to_owned(),
            settings.refresh_attempts,
            settings.refresh_base_delay,
        );

        // Session-start bootstrap: the locally cached value gives instant
        // state, the remote snapshot is the source of truth, max wins.
        let account = store.fetch_account(&account_id).await?;
        let snapshot = store.fetch_snapshot(&account_id).await?;
        let staked = account
            .map(|account| account.staked_amount)
            .unwrap_or(Decimal::ZERO);
        let cached = cache.cached_accrued().unwrap_or(Decimal::ZERO);
        let (remote_earned, accrual_start, snapshot_secs) = match &snapshot {
            Some(snapshot) => (
                snapshot.current_earned.max(Decimal::ZERO),
                snapshot.accrual_start_timestamp,
                snapshot.last_update_timestamp,
            ),
            None => (Decimal::ZERO, clock.now_secs(), clock.now_secs()),
        };
        if let Some(snapshot) = &snapshot {
            resolver.observe_snapshot_timestamp(snapshot.last_update_timestamp);
        }
        let accrued = cached.max(remote_earned);
        accumulator.initialize(accrued, staked, accrual_start);
        transactions.set_confirmed_staked(staked);
        state.seed_balance(staked, accrued, snapshot_secs);
        info!(
            "Engine started for {}: staked {}, accrued {} (cached {}, remote {})",
            account_id, staked, accrued, cached, remote_earned
        );

        let engine = Arc::new(Self {
            account_id,
            clock,
            cache,
            accumulator,
            compensator,
            sync,
            resolver,
            state,
            transactions,
            refresh,
            pending_writes,
            tasks: Mutex::new(Vec::new()),
        });
        engine.spawn_tasks(&settings, channel);
        Ok(engine)
    }

    fn spawn_tasks(self: &Arc<Self>, settings: &EngineSettings, channel: Arc<dyn RealtimeChannel>) {
        let mut tasks = self.tasks.lock().unwrap();

        let engine = self.clone();
        let tick_interval = settings.tick_interval;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                interval.tick().await;
                if let Some(accrued) = engine.accumulator.tick() {
                    engine.state.publish_earnings(accrued);
                }
            }
        }));

        let engine = self.clone();
        let sync_interval = settings.sync_interval;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sync_interval);
            loop {
                interval.tick().await;
                let state = engine.accumulator.snapshot();
                engine
                    .cache
                    .cache_accrued(state.accrued, engine.clock.now_secs());
                if !engine.sync.needs_sync(state.accrued) {
                    continue;
                }
                let outcome = engine
                    .sync
                    .sync(state.accrued, state.accrual_start_secs, false)
                    .await;
                if outcome == SyncOutcome::Failed {
                    engine.revalidate_after_failed_sync().await;
                }
            }
        }));

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                engine.pending_writes.notified().await;
                let state = engine.accumulator.snapshot();
                match engine
                    .sync
                    .sync(state.accrued, state.accrual_start_secs, true)
                    .await
                {
                    SyncOutcome::Synced => engine.pending_writes.reset(),
                    SyncOutcome::Skipped => {}
                    SyncOutcome::Failed => engine.revalidate_after_failed_sync().await,
                }
            }
        }));

        tasks.push(tokio::spawn(run_subscription(
            self.state.clone(),
            channel,
            settings.reconnect_delay,
        )));
    }

    /// Read-after-fail: a failed write is answered with a fresh fetch and a
    /// max-wins merge, never a blind retry of the same value.
    async fn revalidate_after_failed_sync(&self) {
        if let Err(error) = self.resolver.run_pass().await {
            warn!("Post-failure reconciliation also failed: {}", error);
        }
    }

    /// Host went to background. Persists the suspend marker and flushes the
    /// current value best-effort.
    pub async fn suspend(&self) {
        self.compensator.record_suspend();
        let state = self.accumulator.snapshot();
        self.cache
            .cache_accrued(state.accrued, self.clock.now_secs());
        self.sync
            .sync(state.accrued, state.accrual_start_secs, true)
            .await;
        info!("Engine suspended for {}", self.account_id);
    }

    /// Host returned to foreground. Credits the offline gap exactly once,
    /// then syncs and reconciles.
    pub async fn resume(&self) {
        if let Some(credited) = self.compensator.compensate_resume() {
            info!("Resume credited {} for the offline gap", credited);
            self.pending_writes.record();
            let state = self.accumulator.snapshot();
            self.sync
                .sync(state.accrued, state.accrual_start_secs, true)
                .await;
        }
        if let Err(error) = self.resolver.run_pass().await {
            warn!("Reconciliation on resume failed: {}", error);
        }
    }

    /// Final best-effort flush, then stops every background task.
    pub async fn shutdown(&self) {
        self.accumulator.set_inactive();
        let state = self.accumulator.snapshot();
        self.cache
            .cache_accrued(state.accrued, self.clock.now_secs());
        self.sync
            .sync(state.accrued, state.accrual_start_secs, true)
            .await;
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!("Engine shut down for {}", self.account_id);
    }

    pub fn register_observer(&self, observer: Arc<dyn StateObserver>) {
        self.state.register_observer(observer);
    }

    pub fn accrual_state(&self) -> AccrualState {
        self.accumulator.snapshot()
    }

    pub fn balance_state(&self) -> BalanceState {
        self.state.balance_state()
    }

    pub fn activity_feed(&self) -> Vec<activity_record::Model> {
        self.state.activity_feed()
    }

    pub fn submit_deposit(&self, amount: Decimal) -> Result<OperationReceiver, EngineError> {
        self.transactions.submit_deposit(amount)
    }

    pub fn submit_withdrawal(
        &self,
        amount: Decimal,
        destination: &str,
    ) -> Result<OperationReceiver, EngineError> {
        self.transactions.submit_withdrawal(amount, destination)
    }

    pub fn request_history(
        &self,
        limit: usize,
    ) -> tokio::sync::oneshot::Receiver<Result<Vec<activity_record::Model>, EngineError>> {
        self.refresh.request_history(limit)
    }

    pub fn request_balance_refresh(&self) {
        self.refresh.request_balance_refresh()
    }
}
