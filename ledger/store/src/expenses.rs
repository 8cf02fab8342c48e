use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledger_core::{Expense, ExpenseId, ScopeId, Settlement};

use crate::balances::write_atomic;
use crate::cursor::{paginate, Cursor, Page};
use crate::error::StoreError;

const FILE_VERSION: u32 = 1;

/// A replayable ledger record. Settlements live in the same log as expenses
/// so a recompute replays the scope's full history in one time-ordered pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplayRecord {
    Expense(Expense),
    Settlement(Settlement),
}

impl ReplayRecord {
    fn created_at(&self) -> DateTime<Utc> {
        match self {
            ReplayRecord::Expense(expense) => expense.created_at,
            ReplayRecord::Settlement(settlement) => settlement.created_at,
        }
    }

    fn id(&self) -> &ExpenseId {
        match self {
            ReplayRecord::Expense(expense) => &expense.id,
            ReplayRecord::Settlement(settlement) => &settlement.id,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    expenses: Vec<Expense>,
    settlements: Vec<Settlement>,
}

#[derive(Default)]
struct RegistryState {
    expenses: BTreeMap<ExpenseId, Expense>,
    settlements: BTreeMap<ExpenseId, Settlement>,
    // (created_at, id) per scope; expenses and settlements share the index
    // name space because ids are unique across both.
    expense_index: BTreeMap<ScopeId, BTreeSet<(DateTime<Utc>, ExpenseId)>>,
    settlement_index: BTreeMap<ScopeId, BTreeSet<(DateTime<Utc>, ExpenseId)>>,
}

/// Append-only registry of expenses and settlements.
pub struct ExpenseRegistry {
    path: Option<PathBuf>,
    state: Mutex<RegistryState>,
}

impl ExpenseRegistry {
    pub fn in_memory() -> Self {
        ExpenseRegistry {
            path: None,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut state = RegistryState::default();
        if path.exists() {
            let bytes = fs::read(&path)?;
            let file: RegistryFile = bincode::deserialize(&bytes)?;
            if file.version != FILE_VERSION {
                return Err(StoreError::UnsupportedVersion(file.version));
            }
            for expense in file.expenses {
                state.index_expense(&expense);
                state.expenses.insert(expense.id.clone(), expense);
            }
            for settlement in file.settlements {
                state.index_settlement(&settlement);
                state.settlements.insert(settlement.id.clone(), settlement);
            }
        }
        Ok(ExpenseRegistry {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Stores an immutable expense; ids are never reused.
    pub fn insert_expense(&self, expense: Expense) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.expenses.contains_key(&expense.id) || state.settlements.contains_key(&expense.id)
        {
            return Err(StoreError::DuplicateExpense(expense.id.to_string()));
        }
        state.index_expense(&expense);
        state.expenses.insert(expense.id.clone(), expense);
        self.persist(&state)
    }

    pub fn record_settlement(&self, settlement: Settlement) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.expenses.contains_key(&settlement.id)
            || state.settlements.contains_key(&settlement.id)
        {
            return Err(StoreError::DuplicateExpense(settlement.id.to_string()));
        }
        state.index_settlement(&settlement);
        state.settlements.insert(settlement.id.clone(), settlement);
        self.persist(&state)
    }

    pub fn get(&self, id: &ExpenseId) -> Option<Expense> {
        self.lock().expenses.get(id).cloned()
    }

    /// Newest-first page of a scope's expenses.
    pub fn list_by_scope(
        &self,
        scope: &ScopeId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Page<Expense> {
        let state = self.lock();
        let items = state
            .expense_index
            .get(scope)
            .into_iter()
            .flat_map(|index| index.iter().rev())
            .filter_map(|(created_at, id)| {
                state.expenses.get(id).map(|expense| {
                    (
                        created_at.timestamp_nanos_opt().unwrap_or(i64::MAX),
                        id.to_string(),
                        expense.clone(),
                    )
                })
            });
        paginate(items, cursor, limit)
    }

    /// The scope's full history, oldest first, for recompute.
    pub fn replay_log(&self, scope: &ScopeId) -> Vec<ReplayRecord> {
        let state = self.lock();
        let mut records: Vec<ReplayRecord> = Vec::new();
        if let Some(index) = state.expense_index.get(scope) {
            records.extend(
                index
                    .iter()
                    .filter_map(|(_, id)| state.expenses.get(id))
                    .cloned()
                    .map(ReplayRecord::Expense),
            );
        }
        if let Some(index) = state.settlement_index.get(scope) {
            records.extend(
                index
                    .iter()
                    .filter_map(|(_, id)| state.settlements.get(id))
                    .cloned()
                    .map(ReplayRecord::Settlement),
            );
        }
        records.sort_by(|a, b| {
            (a.created_at(), a.id()).cmp(&(b.created_at(), b.id()))
        });
        records
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().expect("expense registry mutex poisoned")
    }

    fn persist(&self, state: &RegistryState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = RegistryFile {
            version: FILE_VERSION,
            expenses: state.expenses.values().cloned().collect(),
            settlements: state.settlements.values().cloned().collect(),
        };
        write_atomic(path, &bincode::serialize(&file)?)
    }
}

impl RegistryState {
    fn index_expense(&mut self, expense: &Expense) {
        self.expense_index
            .entry(expense.scope.clone())
            .or_default()
            .insert((expense.created_at, expense.id.clone()));
    }

    fn index_settlement(&mut self, settlement: &Settlement) {
        self.settlement_index
            .entry(settlement.scope.clone())
            .or_default()
            .insert((settlement.created_at, settlement.id.clone()));
    }
}
