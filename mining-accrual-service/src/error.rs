use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("remote call failed: {0}")]
    TransientRemote(String),

    #[error("duplicate remote row: {0}")]
    Conflict(String),

    #[error("transaction rejected by user")]
    UserCancelled,

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("safety limit exceeded: {0}")]
    SafetyLimit(String),

    #[error("wallet service error: {0}")]
    Wallet(String),
}
