use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Model {
    pub id: Uuid,
    pub account_id: String,
    pub kind: OperationKind,
    pub amount: Decimal,
    pub status: OperationStatus,
    /// Withdrawal destination; deposits go to the configured holding wallet.
    pub destination: Option<String>,
    pub tx_handle: Option<String>,
    pub created_at: i64,
    pub error_detail: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    Deposit,
    Withdrawal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Submitting,
    AwaitingConfirmation,
    Confirmed,
    Failed,
}
