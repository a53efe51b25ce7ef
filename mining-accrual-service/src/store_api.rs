use crate::dto::{ReferralCreditRequest, ResponseData, StakeUpdateRequest, RESPONSE_CONFLICT, RESPONSE_OK};
use crate::error::EngineError;
use async_trait::async_trait;
use mining_entity::record::{activity_record, deposit_operation, earnings_snapshot, miner_account};
use rust_decimal::Decimal;

/// Row-level access to the remote store. The store owns durability and
/// last-write-wins semantics; this side only reads and sets.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_account(
        &self,
        account_id: &str,
    ) -> Result<Option<miner_account::Model>, EngineError>;

    async fn fetch_snapshot(
        &self,
        account_id: &str,
    ) -> Result<Option<earnings_snapshot::Model>, EngineError>;

    /// Idempotent set, never an increment.
    async fn upsert_snapshot(&self, snapshot: &earnings_snapshot::Model)
        -> Result<(), EngineError>;

    async fn update_staked_amount(
        &self,
        account_id: &str,
        staked_amount: Decimal,
    ) -> Result<(), EngineError>;

    async fn insert_operation(&self, op: &deposit_operation::Model) -> Result<(), EngineError>;

    async fn update_operation(&self, op: &deposit_operation::Model) -> Result<(), EngineError>;

    async fn insert_activity(&self, activity: &activity_record::Model) -> Result<(), EngineError>;

    async fn fetch_activity_history(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<activity_record::Model>, EngineError>;

    async fn credit_referral(&self, sponsor_id: &str, amount: Decimal) -> Result<(), EngineError>;
}

pub struct HttpRemoteStore {
    client: reqwest::Client,
    node: String,
    api_key: String,
}

impl HttpRemoteStore {
    pub fn new(client: reqwest::Client, node: String, api_key: String) -> Self {
        Self {
            client,
            node,
            api_key,
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        context: &str,
        url: String,
    ) -> Result<Option<T>, EngineError> {
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|error| remote_error(context, error))?;
        let envelope = response
            .json::<ResponseData<T>>()
            .await
            .map_err(|error| remote_error(context, error))?;
        check_envelope(context, envelope)
    }

    async fn post<B: serde::Serialize>(
        &self,
        context: &str,
        url: String,
        body: &B,
    ) -> Result<(), EngineError> {
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|error| remote_error(context, error))?;
        let envelope = response
            .json::<ResponseData<serde_json::Value>>()
            .await
            .map_err(|error| remote_error(context, error))?;
        check_envelope(context, envelope).map(|_| ())
    }
}

fn remote_error(context: &str, error: reqwest::Error) -> EngineError {
    EngineError::TransientRemote(format!("{}: {}", context, error))
}

fn check_envelope<T>(context: &str, envelope: ResponseData<T>) -> Result<Option<T>, EngineError> {
    let code = envelope.code.or(envelope.status_code).unwrap_or(0);
    match code {
        RESPONSE_OK => Ok(envelope.data),
        RESPONSE_CONFLICT => Err(EngineError::Conflict(format!(
            "{}: {}",
            context, envelope.message
        ))),
        _ => Err(EngineError::TransientRemote(format!(
            "{} code {}: {}",
            context, code, envelope.message
        ))),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_account(
        &self,
        account_id: &str,
    ) -> Result<Option<miner_account::Model>, EngineError> {
        let url = self.node.to_owned() + "/miner_account?account_id=" + account_id;
        self.get("fetch_account", url).await
    }

    async fn fetch_snapshot(
        &self,
        account_id: &str,
    ) -> Result<Option<earnings_snapshot::Model>, EngineError> {
        let url = self.node.to_owned() + "/earnings_snapshot?account_id=" + account_id;
        self.get("fetch_snapshot", url).await
    }

    async fn upsert_snapshot(
        &self,
        snapshot: &earnings_snapshot::Model,
    ) -> Result<(), EngineError> {
        let url = self.node.to_owned() + "/earnings_snapshot";
        self.post("upsert_snapshot", url, snapshot).await
    }

    async fn update_staked_amount(
        &self,
        account_id: &str,
        staked_amount: Decimal,
    ) -> Result<(), EngineError> {
        let url = self.node.to_owned() + "/miner_account/stake";
        let body = StakeUpdateRequest {
            account_id: account_id.to_owned(),
            staked_amount,
        };
        self.post("update_staked_amount", url, &body).await
    }

    async fn insert_operation(&self, op: &deposit_operation::Model) -> Result<(), EngineError> {
        let url = self.node.to_owned() + "/deposit_operation";
        self.post("insert_operation", url, op).await
    }

    async fn update_operation(&self, op: &deposit_operation::Model) -> Result<(), EngineError> {
        let url = self.node.to_owned() + "/deposit_operation/update";
        self.post("update_operation", url, op).await
    }

    async fn insert_activity(&self, activity: &activity_record::Model) -> Result<(), EngineError> {
        let url = self.node.to_owned() + "/activity_record";
        self.post("insert_activity", url, activity).await
    }

    async fn fetch_activity_history(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<activity_record::Model>, EngineError> {
        let url = self.node.to_owned()
            + "/activity_record?account_id="
            + account_id
            + "&limit="
            + &limit.to_string();
        Ok(self
            .get("fetch_activity_history", url)
            .await?
            .unwrap_or_default())
    }

    async fn credit_referral(&self, sponsor_id: &str, amount: Decimal) -> Result<(), EngineError> {
        let url = self.node.to_owned() + "/referral_credit";
        let body = ReferralCreditRequest {
            sponsor_id: sponsor_id.to_owned(),
            amount,
        };
        self.post("credit_referral", url, &body).await
    }
}
