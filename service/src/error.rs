use thiserror::Error;

use ledger_core::{ScopeId, SplitError, UserId};
use ledger_store::StoreError;

use crate::lock::LockError;

/// Operation-level errors with stable wire slugs.
///
/// Infrastructure trouble from the cache or job queue never surfaces here;
/// those paths log and fall through to the store.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid split: {0}")]
    InvalidSplit(#[from] SplitError),

    #[error("invalid expense: {0}")]
    InvalidExpense(String),

    #[error("{user} is not a member of {scope}")]
    NotMember { user: UserId, scope: ScopeId },

    #[error("invalid settlement: {0}")]
    InvalidSettlement(String),

    #[error("timed out waiting for lock {name}")]
    LockTimeout { name: String, retry_after_secs: u64 },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable error slug, part of the public contract.
    pub fn slug(&self) -> &'static str {
        match self {
            ServiceError::InvalidSplit(_) | ServiceError::InvalidExpense(_) => "invalid_split",
            ServiceError::NotMember { .. } => "not_member",
            ServiceError::InvalidSettlement(_) => "invalid_settlement",
            ServiceError::LockTimeout { .. } => "lock_timeout",
            ServiceError::StoreUnavailable(_) => "store_unavailable",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::InvalidParams(_) => "invalid_params",
            ServiceError::Internal(_) => "internal",
        }
    }

    /// Retry hint in seconds, only for retryable failures.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ServiceError::LockTimeout {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            ServiceError::StoreUnavailable(_) => Some(1),
            _ => None,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Underflow { needed, available } => ServiceError::InvalidSettlement(
                format!("insufficient balance (needed {needed}, available {available})"),
            ),
            StoreError::UnknownGroup(id) => ServiceError::NotFound(format!("group {id}")),
            StoreError::GroupExists(id) => {
                ServiceError::Conflict(format!("group {id} already exists"))
            }
            StoreError::DuplicateExpense(id) => {
                ServiceError::Conflict(format!("expense {id} already recorded"))
            }
            StoreError::NotGroupCreator(id) => {
                ServiceError::Forbidden(format!("only the creator may delete group {id}"))
            }
            StoreError::InvalidCursor => {
                ServiceError::InvalidParams("invalid pagination cursor".to_string())
            }
            other => ServiceError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<LockError> for ServiceError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout {
                name,
                retry_after_secs,
            } => ServiceError::LockTimeout {
                name,
                retry_after_secs,
            },
            LockError::Lost { name } => ServiceError::LockTimeout {
                name,
                retry_after_secs: 0,
            },
            LockError::Io(err) => ServiceError::StoreUnavailable(err.to_string()),
        }
    }
}
