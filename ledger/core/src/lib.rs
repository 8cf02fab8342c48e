pub mod error;
pub mod money;
pub mod pairwise;
pub mod planner;
pub mod split;
pub mod types;

pub use error::{LedgerError, MoneyParseError, SplitError};
pub use money::Money;
pub use pairwise::PairLedger;
pub use planner::settlement_plan;
pub use split::compute_splits;
pub use types::{
    Expense, ExpenseId, GroupId, Participant, ScopeId, Settlement, Split, SplitMode, Transfer,
    UserId,
};
