use std::collections::BTreeMap;

use crate::error::LedgerError;
use crate::money::Money;
use crate::types::UserId;

/// In-memory pairwise debt ledger.
///
/// Two invariants hold after every operation: no pair carries debt in both
/// directions (a new debt first consumes any reverse debt), and no stored
/// amount is zero (rows are removed the moment they clear). The same algebra
/// drives the durable balance store; this type backs unit tests and the
/// recompute replay.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PairLedger {
    debts: BTreeMap<UserId, BTreeMap<UserId, Money>>,
    credits: BTreeMap<UserId, BTreeMap<UserId, Money>>,
}

impl PairLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `debtor owes creditor delta`, consuming reverse debt first.
    pub fn add_debt(
        &mut self,
        debtor: &UserId,
        creditor: &UserId,
        delta: Money,
    ) -> Result<(), LedgerError> {
        if debtor == creditor {
            return Err(LedgerError::SelfDebt);
        }
        if !delta.is_positive() {
            return Err(LedgerError::NonPositiveDelta);
        }

        let reverse = self.amount(creditor, debtor);
        if reverse >= delta {
            self.set(creditor, debtor, Money::from_cents(reverse.cents() - delta.cents()));
            return Ok(());
        }

        let remainder = delta
            .checked_sub(reverse)
            .ok_or(LedgerError::Overflow)?;
        self.set(creditor, debtor, Money::ZERO);
        let forward = self
            .amount(debtor, creditor)
            .checked_add(remainder)
            .ok_or(LedgerError::Overflow)?;
        self.set(debtor, creditor, forward);
        Ok(())
    }

    /// Reduces an existing debt; fails if the pair balance cannot cover it.
    pub fn settle_debt(
        &mut self,
        debtor: &UserId,
        creditor: &UserId,
        delta: Money,
    ) -> Result<(), LedgerError> {
        if debtor == creditor {
            return Err(LedgerError::SelfDebt);
        }
        if !delta.is_positive() {
            return Err(LedgerError::NonPositiveDelta);
        }
        let available = self.amount(debtor, creditor);
        if available < delta {
            return Err(LedgerError::InsufficientBalance {
                needed: delta,
                available,
            });
        }
        self.set(
            debtor,
            creditor,
            Money::from_cents(available.cents() - delta.cents()),
        );
        Ok(())
    }

    /// Current `debtor -> creditor` balance, zero if the pair is clear.
    pub fn amount(&self, debtor: &UserId, creditor: &UserId) -> Money {
        self.debts
            .get(debtor)
            .and_then(|row| row.get(creditor))
            .copied()
            .unwrap_or(Money::ZERO)
    }

    /// Total the user owes across all counterparties.
    pub fn user_owes(&self, user: &UserId) -> Money {
        self.debts
            .get(user)
            .map(|row| row.values().fold(Money::ZERO, |acc, v| acc.saturating_add(*v)))
            .unwrap_or(Money::ZERO)
    }

    /// Total the user is owed across all counterparties.
    pub fn user_owed(&self, user: &UserId) -> Money {
        self.credits
            .get(user)
            .map(|row| row.values().fold(Money::ZERO, |acc, v| acc.saturating_add(*v)))
            .unwrap_or(Money::ZERO)
    }

    /// Owed minus owing, in cents.
    pub fn net_balance(&self, user: &UserId) -> i64 {
        self.user_owed(user).cents() - self.user_owes(user).cents()
    }

    /// All `(debtor, creditor, amount)` rows in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&UserId, &UserId, Money)> {
        self.debts.iter().flat_map(|(debtor, row)| {
            row.iter()
                .map(move |(creditor, amount)| (debtor, creditor, *amount))
        })
    }

    /// Debtor -> creditor -> amount view for the settlement planner.
    pub fn matrix(&self) -> &BTreeMap<UserId, BTreeMap<UserId, Money>> {
        &self.debts
    }

    pub fn is_empty(&self) -> bool {
        self.debts.is_empty()
    }

    fn set(&mut self, debtor: &UserId, creditor: &UserId, amount: Money) {
        if amount.is_zero() {
            if let Some(row) = self.debts.get_mut(debtor) {
                row.remove(creditor);
                if row.is_empty() {
                    self.debts.remove(debtor);
                }
            }
            if let Some(row) = self.credits.get_mut(creditor) {
                row.remove(debtor);
                if row.is_empty() {
                    self.credits.remove(creditor);
                }
            }
        } else {
            self.debts
                .entry(debtor.clone())
                .or_default()
                .insert(creditor.clone(), amount);
            self.credits
                .entry(creditor.clone())
                .or_default()
                .insert(debtor.clone(), amount);
        }
    }
}
