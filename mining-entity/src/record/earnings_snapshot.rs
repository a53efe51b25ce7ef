use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Model {
    pub account_id: String,
    pub current_earned: Decimal,
    pub last_update_timestamp: i64,
    pub accrual_start_timestamp: i64,
}
