use crate::dto::{
    ResponseData, SubmitTransactionRequest, SubmitTransactionResponse, RESPONSE_OK,
    WALLET_STATUS_CONFIRMED, WALLET_STATUS_USER_REJECTED,
};
use crate::error::EngineError;
use async_trait::async_trait;
use tracing::warn;

/// External transaction signer. One attempt per call; the orchestrator owns
/// retry and compensation policy, the signer owns the validity deadline.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    /// Returns the transaction handle on success. A user rejection maps to
    /// `EngineError::UserCancelled`, everything else to `EngineError::Wallet`.
    async fn submit_transaction(
        &self,
        request: &SubmitTransactionRequest,
    ) -> Result<String, EngineError>;
}

pub struct HttpWalletSigner {
    client: reqwest::Client,
    node: String,
}

impl HttpWalletSigner {
    pub fn new(client: reqwest::Client, node: String) -> Self {
        Self { client, node }
    }
}

#[async_trait]
impl WalletSigner for HttpWalletSigner {
    async fn submit_transaction(
        &self,
        request: &SubmitTransactionRequest,
    ) -> Result<String, EngineError> {
        let url = self.node.to_owned() + "/submit_transaction";
        let response = self
            .client
            .post(&url)
            .json(request)
            .header("User-Agent", "Mining Accrual Service")
            .send()
            .await
            .map_err(|error| EngineError::Wallet(format!("submit_transaction: {}", error)))?;
        let envelope = response
            .json::<ResponseData<SubmitTransactionResponse>>()
            .await
            .map_err(|error| {
                EngineError::Wallet(format!("submit_transaction response: {}", error))
            })?;
        let code = envelope.code.or(envelope.status_code).unwrap_or(0);
        if code != RESPONSE_OK {
            return Err(EngineError::Wallet(format!(
                "submit_transaction code {}: {}",
                code, envelope.message
            )));
        }
        let data = envelope
            .data
            .ok_or_else(|| EngineError::Wallet("submit_transaction: empty response".to_owned()))?;
        match data.status.as_str() {
            WALLET_STATUS_CONFIRMED => data.tx_hash.ok_or_else(|| {
                EngineError::Wallet("submit_transaction: confirmed without a handle".to_owned())
            }),
            WALLET_STATUS_USER_REJECTED => Err(EngineError::UserCancelled),
            other => {
                warn!("Unexpected signer status {:?}", other);
                Err(EngineError::Wallet(format!(
                    "submit_transaction status {}",
                    other
                )))
            }
        }
    }
}
