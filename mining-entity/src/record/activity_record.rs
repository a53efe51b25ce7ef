use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Model {
    pub id: String,
    pub account_id: String,
    pub activity_type: ActivityType,
    pub amount: Decimal,
    pub denomination: String,
    pub timestamp: i64,
    pub counterparty: Option<String>,
    pub tx_hash: Option<String>,
    pub status: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActivityType {
    Stake,
    Claim,
    Withdrawal,
    Conversion,
}
