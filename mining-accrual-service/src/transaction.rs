use crate::accumulator::Accumulator;
use crate::clock::Clock;
use crate::dto::SubmitTransactionRequest;
use crate::error::EngineError;
use crate::retry::retry_with_backoff;
use crate::store_api::RemoteStore;
use crate::sync::{PendingWrites, SyncClient};
use crate::wallet::WalletSigner;
use mining_entity::record::activity_record::{self, ActivityType};
use mining_entity::record::deposit_operation::{Model, OperationKind, OperationStatus};
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

const OPERATION_ID_ATTEMPTS: u32 = 3;

/// Coalesces rapid calls into one deferred action. A new schedule aborts the
/// previously armed timer, so only the last action within the window runs.
pub struct Debouncer {
    delay: Duration,
    armed: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            armed: Mutex::new(None),
        }
    }

    pub fn schedule<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let mut armed = self.armed.lock().unwrap();
        if let Some(previous) = armed.take() {
            previous.abort();
        }
        *armed = Some(tokio::spawn(async move {
            sleep(delay).await;
            action().await;
        }));
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub minimum_deposit: Decimal,
    pub minimum_withdrawal: Decimal,
    pub withdrawal_cooldown_secs: i64,
    pub referral_reward_rate: Decimal,
    pub holding_wallet: String,
    pub wallet_validity_secs: i64,
    pub denomination: String,
    pub persist_attempts: u32,
    pub retry_base_delay: Duration,
    pub flush_debounce: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            minimum_deposit: dec!(1),
            minimum_withdrawal: dec!(1),
            withdrawal_cooldown_secs: 86_400,
            referral_reward_rate: dec!(0.05),
            holding_wallet: String::new(),
            wallet_validity_secs: 1_200,
            denomination: "TON".to_owned(),
            persist_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            flush_debounce: Duration::from_millis(750),
        }
    }
}

pub type OperationReceiver = oneshot::Receiver<Result<Model, EngineError>>;

struct Request {
    kind: OperationKind,
    amount: Decimal,
    destination: Option<String>,
    completion: oneshot::Sender<Result<Model, EngineError>>,
}

/// Serializes all deposit/withdrawal operations for the account through one
/// FIFO worker, so at most one operation is in flight at a time. The worker
/// is the single writer of staked principal; the accumulator only reads it.
pub struct TransactionManager {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Request>,
}

struct Shared {
    store: Arc<dyn RemoteStore>,
    signer: Arc<dyn WalletSigner>,
    accumulator: Arc<Accumulator>,
    sync: Arc<SyncClient>,
    pending_writes: Arc<PendingWrites>,
    clock: Arc<dyn Clock>,
    account_id: String,
    settings: OrchestratorSettings,
    address_shape: Regex,
    confirmed_staked: Mutex<Decimal>,
    last_withdrawal_secs: Mutex<Option<i64>>,
    withdrawal_in_flight: AtomicBool,
    flush_debouncer: Debouncer,
}

impl TransactionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RemoteStore>,
        signer: Arc<dyn WalletSigner>,
        accumulator: Arc<Accumulator>,
        sync: Arc<SyncClient>,
        pending_writes: Arc<PendingWrites>,
        clock: Arc<dyn Clock>,
        account_id: String,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        let flush_debounce = settings.flush_debounce;
        let shared = Arc::new(Shared {
            store,
            signer,
            accumulator,
            sync,
            pending_writes,
            clock,
            account_id,
            settings,
            address_shape: Regex::new(r"^[A-Za-z0-9_-]{48}$").expect("address regex"),
            confirmed_staked: Mutex::new(Decimal::ZERO),
            last_withdrawal_secs: Mutex::new(None),
            withdrawal_in_flight: AtomicBool::new(false),
            flush_debouncer: Debouncer::new(flush_debounce),
        });
        let (queue, mut rx) = mpsc::unbounded_channel::<Request>();
        let worker = shared.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                worker.process(request).await;
            }
        });
        Arc::new(Self { shared, queue })
    }

    /// Session-start bootstrap from the remote account row.
    pub fn set_confirmed_staked(&self, staked: Decimal) {
        *self.shared.confirmed_staked.lock().unwrap() = staked;
    }

    pub fn confirmed_staked(&self) -> Decimal {
        *self.shared.confirmed_staked.lock().unwrap()
    }

    pub fn submit_deposit(&self, amount: Decimal) -> Result<OperationReceiver, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "deposit amount {} is not positive",
                amount
            )));
        }
        if amount < self.shared.settings.minimum_deposit {
            return Err(EngineError::Validation(format!(
                "deposit amount {} is below the minimum {}",
                amount, self.shared.settings.minimum_deposit
            )));
        }
        self.enqueue(OperationKind::Deposit, amount, None)
    }

    /// Withdrawal business rules are checked before anything is queued:
    /// address shape, cooldown window, pending-withdrawal exclusivity, and
    /// sufficient confirmed principal.
    pub fn submit_withdrawal(
        &self,
        amount: Decimal,
        destination: &str,
    ) -> Result<OperationReceiver, EngineError> {
        let shared = &self.shared;
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "withdrawal amount {} is not positive",
                amount
            )));
        }
        if amount < shared.settings.minimum_withdrawal {
            return Err(EngineError::Validation(format!(
                "withdrawal amount {} is below the minimum {}",
                amount, shared.settings.minimum_withdrawal
            )));
        }
        if !shared.address_shape.is_match(destination) {
            return Err(EngineError::Validation(format!(
                "destination address {} is malformed",
                destination
            )));
        }
        if let Some(last) = *shared.last_withdrawal_secs.lock().unwrap() {
            let elapsed = shared.clock.now_secs() - last;
            if elapsed < shared.settings.withdrawal_cooldown_secs {
                return Err(EngineError::Validation(format!(
                    "withdrawal cooldown: {}s of {}s elapsed",
                    elapsed, shared.settings.withdrawal_cooldown_secs
                )));
            }
        }
        if amount > *shared.confirmed_staked.lock().unwrap() {
            return Err(EngineError::Validation(format!(
                "withdrawal amount {} exceeds the staked principal",
                amount
            )));
        }
        if shared
            .withdrawal_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::Validation(
                "a withdrawal is already pending".to_owned(),
            ));
        }
        self.enqueue(
            OperationKind::Withdrawal,
            amount,
            Some(destination.to_owned()),
        )
        .map_err(|error| {
            shared.withdrawal_in_flight.store(false, Ordering::SeqCst);
            error
        })
    }

    fn enqueue(
        &self,
        kind: OperationKind,
        amount: Decimal,
        destination: Option<String>,
    ) -> Result<OperationReceiver, EngineError> {
        let (completion, receiver) = oneshot::channel();
        self.queue
            .send(Request {
                kind,
                amount,
                destination,
                completion,
            })
            .map_err(|_| EngineError::Validation("operation worker is gone".to_owned()))?;
        Ok(receiver)
    }
}

impl Shared {
    async fn process(&self, request: Request) {
        let result = self.execute(&request).await;
        if request.kind == OperationKind::Withdrawal {
            self.withdrawal_in_flight.store(false, Ordering::SeqCst);
        }
        if let Err(error) = &result {
            info!("Operation of {} failed: {}", request.amount, error);
        }
        let _ = request.completion.send(result);
    }

    async fn execute(&self, request: &Request) -> Result<Model, EngineError> {
        let mut op = self.record_pending(request).await?;
        let confirmed = *self.confirmed_staked.lock().unwrap();
        let target = match request.kind {
            OperationKind::Deposit => confirmed + request.amount,
            OperationKind::Withdrawal => confirmed - request.amount,
        };
        // Optimistic: visible immediately, reverted on any failure below.
        self.accumulator.set_staked(target);

        let wallet_request = SubmitTransactionRequest {
            destination: request
                .destination
                .clone()
                .unwrap_or_else(|| self.settings.holding_wallet.to_owned()),
            amount: request.amount,
            payload: op.id.to_string(),
            valid_until: self.clock.now_secs() + self.settings.wallet_validity_secs,
        };
        let deadline = Duration::from_secs(self.settings.wallet_validity_secs.max(1) as u64);
        let handle = match tokio::time::timeout(
            deadline,
            self.signer.submit_transaction(&wallet_request),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(error)) => return self.fail(op, confirmed, error).await,
            Err(_) => {
                let error = EngineError::Wallet("signer call exceeded its deadline".to_owned());
                return self.fail(op, confirmed, error).await;
            }
        };

        op.status = OperationStatus::AwaitingConfirmation;
        op.tx_handle = Some(handle);
        if let Err(update_error) = self.store.update_operation(&op).await {
            warn!(
                "Could not persist handle for operation {}: {}",
                op.id, update_error
            );
        }

        let durable = retry_with_backoff(
            "update_staked_amount",
            self.settings.persist_attempts,
            self.settings.retry_base_delay,
            || self.store.update_staked_amount(&self.account_id, target),
        )
        .await;
        if let Err(update_error) = durable {
            return self.fail(op, confirmed, update_error).await;
        }

        *self.confirmed_staked.lock().unwrap() = target;
        if request.kind == OperationKind::Withdrawal {
            *self.last_withdrawal_secs.lock().unwrap() = Some(self.clock.now_secs());
        }
        self.pending_writes.record();

        // Dependent side effects: each retried on its own, neither rolls
        // back the confirmed operation.
        self.append_activity(&op).await;
        if request.kind == OperationKind::Deposit {
            self.propagate_referral(&op).await;
        }

        op.status = OperationStatus::Confirmed;
        if let Err(update_error) = self.store.update_operation(&op).await {
            warn!(
                "Could not mark operation {} confirmed: {}",
                op.id, update_error
            );
        }
        info!(
            "Operation {} confirmed, staked principal {} -> {}",
            op.id, confirmed, target
        );

        let sync = self.sync.clone();
        let accumulator = self.accumulator.clone();
        self.flush_debouncer.schedule(move || async move {
            let state = accumulator.snapshot();
            sync.sync(state.accrued, state.accrual_start_secs, true).await;
        });
        Ok(op)
    }

    async fn record_pending(&self, request: &Request) -> Result<Model, EngineError> {
        let created_at = self.clock.now_secs();
        for _ in 0..OPERATION_ID_ATTEMPTS {
            let op = Model {
                id: Uuid::new_v4(),
                account_id: self.account_id.to_owned(),
                kind: request.kind,
                amount: request.amount,
                status: OperationStatus::Submitting,
                destination: request.destination.clone(),
                tx_handle: None,
                created_at,
                error_detail: None,
            };
            match self.store.insert_operation(&op).await {
                Ok(()) => return Ok(op),
                Err(EngineError::Conflict(detail)) => {
                    warn!("Operation id collision, drawing a fresh id: {}", detail);
                }
                Err(other) => return Err(other),
            }
        }
        Err(EngineError::Conflict(format!(
            "no unique operation id in {} attempts",
            OPERATION_ID_ATTEMPTS
        )))
    }

    async fn fail(
        &self,
        mut op: Model,
        confirmed: Decimal,
        error: EngineError,
    ) -> Result<Model, EngineError> {
        self.accumulator.set_staked(confirmed);
        op.status = OperationStatus::Failed;
        op.error_detail = Some(error.to_string());
        if let Err(update_error) = self.store.update_operation(&op).await {
            warn!(
                "Could not mark operation {} failed: {}",
                op.id, update_error
            );
        }
        Err(error)
    }

    async fn append_activity(&self, op: &Model) {
        let activity = activity_record::Model {
            id: op.id.to_string(),
            account_id: self.account_id.to_owned(),
            activity_type: match op.kind {
                OperationKind::Deposit => ActivityType::Stake,
                OperationKind::Withdrawal => ActivityType::Withdrawal,
            },
            amount: op.amount,
            denomination: self.settings.denomination.to_owned(),
            timestamp: self.clock.now_secs(),
            counterparty: op.destination.clone(),
            tx_hash: op.tx_handle.clone(),
            status: OperationStatus::Confirmed.to_string(),
        };
        let appended = retry_with_backoff(
            "insert_activity",
            self.settings.persist_attempts,
            self.settings.retry_base_delay,
            || self.store.insert_activity(&activity),
        )
        .await;
        if let Err(error) = appended {
            error!("Giving up on activity append for {}: {}", op.id, error);
        }
    }

    async fn propagate_referral(&self, op: &Model) {
        let account = match retry_with_backoff(
            "fetch_account",
            self.settings.persist_attempts,
            self.settings.retry_base_delay,
            || self.store.fetch_account(&self.account_id),
        )
        .await
        {
            Ok(account) => account,
            Err(error) => {
                error!(
                    "Could not resolve sponsor for operation {}: {}",
                    op.id, error
                );
                return;
            }
        };
        let sponsor = match account.and_then(|account| account.sponsor_id) {
            Some(sponsor) => sponsor,
            None => return,
        };
        let reward = op.amount * self.settings.referral_reward_rate;
        if reward <= Decimal::ZERO {
            return;
        }
        let credited = retry_with_backoff(
            "credit_referral",
            self.settings.persist_attempts,
            self.settings.retry_base_delay,
            || self.store.credit_referral(&sponsor, reward),
        )
        .await;
        if let Err(error) = credited {
            error!(
                "Referral credit of {} to {} permanently failed, dropping: {}",
                reward, sponsor, error
            );
        }
    }
}
