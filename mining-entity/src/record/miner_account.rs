use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Model {
    pub account_id: String,
    pub wallet_address: Option<String>,
    pub staked_amount: Decimal,
    pub total_earned: Decimal,
    pub last_activity_timestamp: i64,
    /// Set at most once, by the remote side, when the account is created.
    pub sponsor_id: Option<String>,
}
