pub mod activity_record;
pub mod deposit_operation;
pub mod earnings_snapshot;
pub mod miner_account;
