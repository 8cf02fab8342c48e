use thiserror::Error;

use ledger_core::Money;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unsupported store file version {0}")]
    UnsupportedVersion(u32),

    #[error("balance underflow (needed {needed}, available {available})")]
    Underflow { needed: Money, available: Money },

    #[error("delta must be positive")]
    InvalidDelta,

    #[error("expense {0} already recorded")]
    DuplicateExpense(String),

    #[error("unknown group {0}")]
    UnknownGroup(String),

    #[error("group {0} already exists")]
    GroupExists(String),

    #[error("only the creator may delete group {0}")]
    NotGroupCreator(String),

    #[error("invalid pagination cursor")]
    InvalidCursor,
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
