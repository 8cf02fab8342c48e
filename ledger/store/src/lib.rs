pub mod activity;
pub mod balances;
pub mod cursor;
pub mod error;
pub mod expenses;
pub mod groups;

pub use activity::{ActivityEvent, ActivityLog, EventKind};
pub use balances::{BalanceEntry, BalanceStore, UpsertMode};
pub use cursor::{Cursor, Page, Pagination};
pub use error::StoreError;
pub use expenses::{ExpenseRegistry, ReplayRecord};
pub use groups::{Group, GroupRegistry};
