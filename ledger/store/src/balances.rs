use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use ledger_core::{ExpenseId, Money, ScopeId, UserId};

use crate::error::StoreError;

const FILE_VERSION: u32 = 1;

/// One pairwise balance row. `amount` is strictly positive: rows reaching
/// zero are deleted, never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub scope: ScopeId,
    pub debtor: UserId,
    pub creditor: UserId,
    pub amount: Money,
    pub last_expense_id: Option<ExpenseId>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum UpsertMode {
    Increment(Money),
    Decrement(Money),
    Set(Money),
    Delete,
}

#[derive(Serialize, Deserialize)]
struct BalanceFile {
    version: u32,
    entries: Vec<BalanceEntry>,
}

type PairKey = (UserId, UserId);

#[derive(Default)]
struct BalanceState {
    scopes: BTreeMap<ScopeId, BTreeMap<PairKey, BalanceEntry>>,
    by_debtor: BTreeMap<UserId, BTreeSet<(ScopeId, UserId)>>,
    by_creditor: BTreeMap<UserId, BTreeSet<(ScopeId, UserId)>>,
}

/// Durable store of pairwise balances keyed by `(scope, debtor, creditor)`.
///
/// Every mutation happens under one mutex and lands on disk before the call
/// returns, so each upsert is atomic per key. Mutual-debt rows are a bug in
/// the caller's algebra, not a recoverable condition: an increment against a
/// live reverse row aborts the process.
pub struct BalanceStore {
    path: Option<PathBuf>,
    state: Mutex<BalanceState>,
}

impl BalanceStore {
    pub fn in_memory() -> Self {
        BalanceStore {
            path: None,
            state: Mutex::new(BalanceState::default()),
        }
    }

    /// Opens (or initializes) a file-backed store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut state = BalanceState::default();
        if path.exists() {
            let bytes = fs::read(&path)?;
            let file: BalanceFile = bincode::deserialize(&bytes)?;
            if file.version != FILE_VERSION {
                return Err(StoreError::UnsupportedVersion(file.version));
            }
            for entry in file.entries {
                if entry.amount.is_positive() {
                    state.insert(entry);
                }
            }
        }
        Ok(BalanceStore {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn get_pair(
        &self,
        scope: &ScopeId,
        debtor: &UserId,
        creditor: &UserId,
    ) -> Option<BalanceEntry> {
        let state = self.lock();
        state
            .scopes
            .get(scope)
            .and_then(|pairs| pairs.get(&(debtor.clone(), creditor.clone())))
            .cloned()
    }

    /// Applies one atomic mutation to a pair and returns the resulting
    /// amount (zero when the row was deleted).
    pub fn upsert_atomic(
        &self,
        scope: &ScopeId,
        debtor: &UserId,
        creditor: &UserId,
        mode: UpsertMode,
        expense_id: Option<&ExpenseId>,
    ) -> Result<Money, StoreError> {
        let mut state = self.lock();
        let key = (debtor.clone(), creditor.clone());
        let existing = state
            .scopes
            .get(scope)
            .and_then(|pairs| pairs.get(&key));
        let previous_expense = existing.and_then(|entry| entry.last_expense_id.clone());
        let current = existing.map(|entry| entry.amount).unwrap_or(Money::ZERO);

        let next = match mode {
            UpsertMode::Increment(delta) => {
                if !delta.is_positive() {
                    return Err(StoreError::InvalidDelta);
                }
                let reverse = state
                    .scopes
                    .get(scope)
                    .and_then(|pairs| pairs.get(&(creditor.clone(), debtor.clone())))
                    .map(|entry| entry.amount)
                    .unwrap_or(Money::ZERO);
                assert!(
                    reverse.is_zero(),
                    "mutual debt detected for {debtor}->{creditor} in scope {scope}"
                );
                current
                    .checked_add(delta)
                    .ok_or(StoreError::InvalidDelta)?
            }
            UpsertMode::Decrement(delta) => {
                if !delta.is_positive() {
                    return Err(StoreError::InvalidDelta);
                }
                if current < delta {
                    return Err(StoreError::Underflow {
                        needed: delta,
                        available: current,
                    });
                }
                Money::from_cents(current.cents() - delta.cents())
            }
            UpsertMode::Set(value) => value,
            UpsertMode::Delete => Money::ZERO,
        };

        if next.is_positive() {
            state.insert(BalanceEntry {
                scope: scope.clone(),
                debtor: debtor.clone(),
                creditor: creditor.clone(),
                amount: next,
                last_expense_id: expense_id.cloned().or(previous_expense),
                updated_at: Utc::now(),
            });
        } else {
            state.remove(scope, &key);
        }

        self.persist(&state)?;
        debug!(%scope, %debtor, %creditor, amount = next.cents(), "balance updated");
        Ok(next)
    }

    pub fn scan_by_debtor(&self, user: &UserId) -> Vec<BalanceEntry> {
        let state = self.lock();
        state
            .by_debtor
            .get(user)
            .into_iter()
            .flatten()
            .filter_map(|(scope, creditor)| {
                state
                    .scopes
                    .get(scope)
                    .and_then(|pairs| pairs.get(&(user.clone(), creditor.clone())))
                    .cloned()
            })
            .collect()
    }

    pub fn scan_by_creditor(&self, user: &UserId) -> Vec<BalanceEntry> {
        let state = self.lock();
        state
            .by_creditor
            .get(user)
            .into_iter()
            .flatten()
            .filter_map(|(scope, debtor)| {
                state
                    .scopes
                    .get(scope)
                    .and_then(|pairs| pairs.get(&(debtor.clone(), user.clone())))
                    .cloned()
            })
            .collect()
    }

    pub fn scan_by_scope(&self, scope: &ScopeId) -> Vec<BalanceEntry> {
        let state = self.lock();
        state
            .scopes
            .get(scope)
            .map(|pairs| pairs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Replaces every row of one scope; used only by recompute. Zero-amount
    /// input rows are skipped.
    pub fn bulk_replace(
        &self,
        scope: &ScopeId,
        entries: Vec<BalanceEntry>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let old_keys: Vec<PairKey> = state
            .scopes
            .get(scope)
            .map(|pairs| pairs.keys().cloned().collect())
            .unwrap_or_default();
        for key in old_keys {
            state.remove(scope, &key);
        }
        for entry in entries {
            if entry.amount.is_positive() {
                debug_assert_eq!(&entry.scope, scope);
                state.insert(entry);
            }
        }
        self.persist(&state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BalanceState> {
        self.state.lock().expect("balance store mutex poisoned")
    }

    fn persist(&self, state: &BalanceState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let entries: Vec<BalanceEntry> = state
            .scopes
            .values()
            .flat_map(|pairs| pairs.values().cloned())
            .collect();
        let file = BalanceFile {
            version: FILE_VERSION,
            entries,
        };
        write_atomic(path, &bincode::serialize(&file)?)
    }
}

impl BalanceState {
    fn insert(&mut self, entry: BalanceEntry) {
        self.by_debtor
            .entry(entry.debtor.clone())
            .or_default()
            .insert((entry.scope.clone(), entry.creditor.clone()));
        self.by_creditor
            .entry(entry.creditor.clone())
            .or_default()
            .insert((entry.scope.clone(), entry.debtor.clone()));
        self.scopes
            .entry(entry.scope.clone())
            .or_default()
            .insert((entry.debtor.clone(), entry.creditor.clone()), entry);
    }

    fn remove(&mut self, scope: &ScopeId, key: &PairKey) {
        let Some(pairs) = self.scopes.get_mut(scope) else {
            return;
        };
        if pairs.remove(key).is_none() {
            return;
        }
        if pairs.is_empty() {
            self.scopes.remove(scope);
        }
        let (debtor, creditor) = key;
        if let Some(index) = self.by_debtor.get_mut(debtor) {
            index.remove(&(scope.clone(), creditor.clone()));
            if index.is_empty() {
                self.by_debtor.remove(debtor);
            }
        }
        if let Some(index) = self.by_creditor.get_mut(creditor) {
            index.remove(&(scope.clone(), debtor.clone()));
            if index.is_empty() {
                self.by_creditor.remove(creditor);
            }
        }
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserId {
        UserId::new(name)
    }

    fn group(name: &str) -> ScopeId {
        ScopeId::parse(name)
    }

    fn cents(v: i64) -> Money {
        Money::from_cents(v)
    }

    #[test]
    fn increments_and_decrements_delete_at_zero() {
        let store = BalanceStore::in_memory();
        let scope = group("g1");
        store
            .upsert_atomic(&scope, &user("b"), &user("a"), UpsertMode::Increment(cents(500)), None)
            .unwrap();
        assert_eq!(
            store.get_pair(&scope, &user("b"), &user("a")).unwrap().amount,
            cents(500)
        );

        let left = store
            .upsert_atomic(&scope, &user("b"), &user("a"), UpsertMode::Decrement(cents(500)), None)
            .unwrap();
        assert_eq!(left, Money::ZERO);
        assert!(store.get_pair(&scope, &user("b"), &user("a")).is_none());
        assert!(store.scan_by_scope(&scope).is_empty());
    }

    #[test]
    fn decrement_past_balance_underflows() {
        let store = BalanceStore::in_memory();
        let scope = group("g1");
        store
            .upsert_atomic(&scope, &user("b"), &user("a"), UpsertMode::Increment(cents(100)), None)
            .unwrap();
        let err = store
            .upsert_atomic(&scope, &user("b"), &user("a"), UpsertMode::Decrement(cents(200)), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Underflow { .. }));
    }

    #[test]
    fn scans_cover_both_directions_and_scopes() {
        let store = BalanceStore::in_memory();
        store
            .upsert_atomic(
                &group("g1"),
                &user("b"),
                &user("a"),
                UpsertMode::Increment(cents(300)),
                None,
            )
            .unwrap();
        store
            .upsert_atomic(
                &ScopeId::Direct,
                &user("a"),
                &user("b"),
                UpsertMode::Increment(cents(100)),
                None,
            )
            .unwrap();

        assert_eq!(store.scan_by_debtor(&user("b")).len(), 1);
        assert_eq!(store.scan_by_creditor(&user("b")).len(), 1);
        assert_eq!(store.scan_by_debtor(&user("a")).len(), 1);
        assert_eq!(store.scan_by_scope(&group("g1")).len(), 1);
        assert_eq!(store.scan_by_scope(&ScopeId::Direct).len(), 1);
    }

    #[test]
    #[should_panic(expected = "mutual debt")]
    fn increment_against_live_reverse_row_aborts() {
        let store = BalanceStore::in_memory();
        let scope = group("g1");
        store
            .upsert_atomic(&scope, &user("b"), &user("a"), UpsertMode::Increment(cents(100)), None)
            .unwrap();
        let _ = store.upsert_atomic(
            &scope,
            &user("a"),
            &user("b"),
            UpsertMode::Increment(cents(100)),
            None,
        );
    }

    #[test]
    fn bulk_replace_swaps_a_scope_wholesale() {
        let store = BalanceStore::in_memory();
        let scope = group("g1");
        store
            .upsert_atomic(&scope, &user("b"), &user("a"), UpsertMode::Increment(cents(300)), None)
            .unwrap();
        store
            .bulk_replace(
                &scope,
                vec![BalanceEntry {
                    scope: scope.clone(),
                    debtor: user("c"),
                    creditor: user("a"),
                    amount: cents(700),
                    last_expense_id: None,
                    updated_at: Utc::now(),
                }],
            )
            .unwrap();
        assert!(store.get_pair(&scope, &user("b"), &user("a")).is_none());
        assert_eq!(
            store.get_pair(&scope, &user("c"), &user("a")).unwrap().amount,
            cents(700)
        );
        assert!(store.scan_by_debtor(&user("b")).is_empty());
    }

    #[test]
    fn file_backed_store_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("balances.bin");
        {
            let store = BalanceStore::open(&path).unwrap();
            store
                .upsert_atomic(
                    &group("g1"),
                    &user("b"),
                    &user("a"),
                    UpsertMode::Increment(cents(450)),
                    Some(&ExpenseId::new("e1")),
                )
                .unwrap();
        }
        let reloaded = BalanceStore::open(&path).unwrap();
        let entry = reloaded.get_pair(&group("g1"), &user("b"), &user("a")).unwrap();
        assert_eq!(entry.amount, cents(450));
        assert_eq!(entry.last_expense_id, Some(ExpenseId::new("e1")));
    }
}
