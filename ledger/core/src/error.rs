use thiserror::Error;

use crate::money::Money;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyParseError {
    #[error("empty amount")]
    Empty,

    #[error("invalid amount: {0}")]
    Invalid(String),

    #[error("amount out of range")]
    OutOfRange,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("expense amount must be positive")]
    NonPositiveAmount,

    #[error("participant list is empty")]
    EmptyParticipants,

    #[error("duplicate participant {0}")]
    DuplicateParticipant(String),

    #[error("participant {0} is missing an exact amount")]
    MissingExactAmount(String),

    #[error("participant {0} has a non-positive exact amount")]
    NonPositiveShare(String),

    #[error("participant {0} is missing a percentage")]
    MissingPercent(String),

    #[error("participant {0} percentage exceeds 10000 basis points")]
    PercentOutOfRange(String),

    #[error("percentages total {0} basis points, exceeding 10000")]
    PercentTotalExceeded(u64),

    #[error("shares total {total} exceeds expense amount {amount}")]
    ExceedsTotal { total: Money, amount: Money },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("debtor and creditor are the same user")]
    SelfDebt,

    #[error("debt delta must be positive")]
    NonPositiveDelta,

    #[error("insufficient balance (needed {needed}, available {available})")]
    InsufficientBalance { needed: Money, available: Money },

    #[error("balance overflow")]
    Overflow,
}
