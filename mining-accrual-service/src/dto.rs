use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ResponseData<T> {
    pub code: Option<u16>,
    #[serde(rename = "statusCode")]
    pub status_code: Option<u16>,
    pub message: String,
    pub data: Option<T>,
}

pub const RESPONSE_OK: u16 = 200;
pub const RESPONSE_CONFLICT: u16 = 409;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SubmitTransactionRequest {
    pub destination: String,
    pub amount: Decimal,
    pub payload: String,
    /// Epoch seconds past which the signer must refuse to broadcast.
    pub valid_until: i64,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SubmitTransactionResponse {
    pub status: String,
    pub tx_hash: Option<String>,
}

pub const WALLET_STATUS_CONFIRMED: &str = "confirmed";
pub const WALLET_STATUS_USER_REJECTED: &str = "user_rejected";

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ReferralCreditRequest {
    pub sponsor_id: String,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct StakeUpdateRequest {
    pub account_id: String,
    pub staked_amount: Decimal,
}
