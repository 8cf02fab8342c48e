use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use ledger_core::{
    compute_splits, Expense, ExpenseId, GroupId, Money, PairLedger, Participant, ScopeId,
    Settlement, SplitMode, UserId,
};
use ledger_store::{
    ActivityEvent, ActivityLog, BalanceEntry, BalanceStore, Cursor, EventKind, ExpenseRegistry,
    Group, GroupRegistry, Page, ReplayRecord, UpsertMode,
};

use crate::error::ServiceError;
use crate::events::EventEmitter;
use crate::jobs::JobRunner;
use crate::lock::{Lease, LockService};
use crate::util::fresh_id;

pub const INVALIDATE_JOB: &str = "cache.invalidate";

/// Wire-shaped request for posting an expense.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewExpense {
    pub scope: ScopeId,
    pub payer_id: UserId,
    pub amount: Money,
    pub split_mode: SplitMode,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

/// The mutation orchestrator: every balance write runs through here, under
/// the owning scope's lock, with the lease re-verified before each store
/// mutation.
pub struct LedgerService {
    balances: Arc<BalanceStore>,
    registry: Arc<ExpenseRegistry>,
    groups: Arc<GroupRegistry>,
    activity: Arc<ActivityLog>,
    locks: LockService,
    jobs: Arc<JobRunner>,
    events: EventEmitter,
}

impl LedgerService {
    pub fn new(
        balances: Arc<BalanceStore>,
        registry: Arc<ExpenseRegistry>,
        groups: Arc<GroupRegistry>,
        activity: Arc<ActivityLog>,
        locks: LockService,
        jobs: Arc<JobRunner>,
        events: EventEmitter,
    ) -> Self {
        LedgerService {
            balances,
            registry,
            groups,
            activity,
            locks,
            jobs,
            events,
        }
    }

    pub async fn post_expense(&self, request: NewExpense) -> Result<Expense, ServiceError> {
        self.check_membership(&request.scope, &request.payer_id, &request.participants)?;
        let splits = compute_splits(
            request.amount,
            request.split_mode,
            &request.participants,
            &request.payer_id,
        )?;

        let created_at = Utc::now();
        let expense = Expense {
            id: ExpenseId::new(fresh_id()),
            scope: request.scope,
            payer_id: request.payer_id,
            amount: request.amount,
            split_mode: request.split_mode,
            participants: request.participants,
            splits,
            date: request.date.unwrap_or(created_at),
            created_at,
        };
        self.registry.insert_expense(expense.clone())?;

        let lock_name = write_lock_name(&expense.scope, &expense.payer_id);
        let lease = self.locks.acquire(&lock_name).await?;
        let applied = self.apply_splits(&lease, &expense);
        self.locks.release(lease);
        applied?;

        let debtors: Vec<&UserId> = expense.splits.iter().map(|split| &split.user_id).collect();
        self.invalidate_after_write(
            &expense.scope,
            debtors.into_iter().chain(std::iter::once(&expense.payer_id)),
        );
        self.events.emit(
            EventKind::ExpenseAdded,
            &expense.payer_id,
            Some(&expense.scope),
            Some(&expense.id),
            json!({ "amount": expense.amount, "splitMode": expense.split_mode }),
        );
        info!(
            expense = %expense.id,
            scope = %expense.scope,
            amount = expense.amount.cents(),
            "expense posted"
        );
        Ok(expense)
    }

    pub async fn settle(
        &self,
        scope: &ScopeId,
        debtor: &UserId,
        creditor: &UserId,
        amount: Money,
    ) -> Result<Settlement, ServiceError> {
        if !amount.is_positive() {
            return Err(ServiceError::InvalidSettlement(
                "amount must be positive".to_string(),
            ));
        }
        if debtor == creditor {
            return Err(ServiceError::InvalidSettlement(
                "debtor and creditor are the same user".to_string(),
            ));
        }

        // In the direct pseudo-scope the debtor is the paying side.
        let lock_name = write_lock_name(scope, debtor);
        let lease = self.locks.acquire(&lock_name).await?;
        let settled = (|| -> Result<Settlement, ServiceError> {
            self.locks.verify(&lease)?;
            let entry = self
                .balances
                .get_pair(scope, debtor, creditor)
                .ok_or_else(|| {
                    ServiceError::InvalidSettlement(format!(
                        "no balance from {debtor} to {creditor} in {scope}"
                    ))
                })?;
            if entry.amount < amount {
                return Err(ServiceError::InvalidSettlement(format!(
                    "settlement {amount} exceeds balance {}",
                    entry.amount
                )));
            }
            self.balances
                .upsert_atomic(scope, debtor, creditor, UpsertMode::Decrement(amount), None)?;
            let settlement = Settlement {
                id: ExpenseId::new(fresh_id()),
                scope: scope.clone(),
                debtor_id: debtor.clone(),
                creditor_id: creditor.clone(),
                amount,
                created_at: Utc::now(),
            };
            self.registry.record_settlement(settlement.clone())?;
            Ok(settlement)
        })();
        self.locks.release(lease);
        let settlement = settled?;

        self.invalidate_after_write(scope, [debtor, creditor].into_iter());
        self.events.emit(
            EventKind::Settlement,
            debtor,
            Some(scope),
            None,
            json!({ "creditorId": creditor, "amount": amount }),
        );
        info!(scope = %scope, %debtor, %creditor, amount = amount.cents(), "settlement recorded");
        Ok(settlement)
    }

    /// Repair primitive: replays the scope's expense and settlement log
    /// through the pair algebra and replaces the stored balances wholesale.
    /// Returns the number of resulting rows.
    pub async fn recompute(&self, scope: &ScopeId) -> Result<usize, ServiceError> {
        let lock_name = match scope {
            ScopeId::Group(group) => format!("scope:{group}"),
            ScopeId::Direct => "scope:direct".to_string(),
        };
        let lease = self.locks.acquire(&lock_name).await?;
        let replaced = (|| -> Result<(usize, BTreeSet<UserId>), ServiceError> {
            let mut ledger = PairLedger::new();
            for record in self.registry.replay_log(scope) {
                match record {
                    ReplayRecord::Expense(expense) => {
                        for split in &expense.splits {
                            ledger
                                .add_debt(&split.user_id, &expense.payer_id, split.amount)
                                .map_err(|err| ServiceError::Internal(err.to_string()))?;
                        }
                    }
                    ReplayRecord::Settlement(settlement) => {
                        if let Err(err) = ledger.settle_debt(
                            &settlement.debtor_id,
                            &settlement.creditor_id,
                            settlement.amount,
                        ) {
                            // The settlement log predates whatever this
                            // repair is fixing; skip rather than abort.
                            warn!(settlement = %settlement.id, %err, "skipping settlement in replay");
                        }
                    }
                }
            }

            let mut affected: BTreeSet<UserId> = self
                .balances
                .scan_by_scope(scope)
                .into_iter()
                .flat_map(|entry| [entry.debtor, entry.creditor])
                .collect();
            let now = Utc::now();
            let entries: Vec<BalanceEntry> = ledger
                .entries()
                .map(|(debtor, creditor, amount)| BalanceEntry {
                    scope: scope.clone(),
                    debtor: debtor.clone(),
                    creditor: creditor.clone(),
                    amount,
                    last_expense_id: None,
                    updated_at: now,
                })
                .collect();
            for entry in &entries {
                affected.insert(entry.debtor.clone());
                affected.insert(entry.creditor.clone());
            }

            self.locks.verify(&lease)?;
            let count = entries.len();
            self.balances.bulk_replace(scope, entries)?;
            Ok((count, affected))
        })();
        self.locks.release(lease);
        let (count, affected) = replaced?;

        self.invalidate_after_write(scope, affected.iter());
        info!(scope = %scope, rows = count, "scope recomputed");
        Ok(count)
    }

    pub fn create_group(
        &self,
        name: &str,
        creator: &UserId,
        members: &[UserId],
    ) -> Result<Group, ServiceError> {
        let mut all_members: BTreeSet<UserId> = members.iter().cloned().collect();
        all_members.insert(creator.clone());
        let group = Group {
            id: GroupId::new(fresh_id()),
            name: name.to_string(),
            members: all_members,
            creator_id: creator.clone(),
            created_at: Utc::now(),
            deleted: false,
        };
        self.groups.create(group.clone())?;
        self.events.emit(
            EventKind::GroupCreated,
            creator,
            Some(&ScopeId::Group(group.id.clone())),
            None,
            json!({ "name": name }),
        );
        Ok(group)
    }

    pub fn add_member(
        &self,
        group_id: &GroupId,
        actor: &UserId,
        user: &UserId,
    ) -> Result<(), ServiceError> {
        if !self.groups.is_member(group_id, actor) {
            return Err(ServiceError::NotMember {
                user: actor.clone(),
                scope: ScopeId::Group(group_id.clone()),
            });
        }
        if self.groups.add_member(group_id, user)? {
            self.events.emit(
                EventKind::MemberAdded,
                user,
                Some(&ScopeId::Group(group_id.clone())),
                None,
                json!({ "addedBy": actor }),
            );
        }
        Ok(())
    }

    pub fn delete_group(&self, group_id: &GroupId, actor: &UserId) -> Result<(), ServiceError> {
        self.groups.soft_delete(group_id, actor)?;
        self.events.emit(
            EventKind::GroupDeleted,
            actor,
            Some(&ScopeId::Group(group_id.clone())),
            None,
            json!({}),
        );
        Ok(())
    }

    pub fn get_group(&self, group_id: &GroupId) -> Result<Group, ServiceError> {
        self.groups
            .get(group_id)
            .ok_or_else(|| ServiceError::NotFound(format!("group {group_id}")))
    }

    pub fn get_expense(&self, id: &ExpenseId) -> Result<Expense, ServiceError> {
        self.registry
            .get(id)
            .ok_or_else(|| ServiceError::NotFound(format!("expense {id}")))
    }

    pub fn list_expenses(
        &self,
        scope: &ScopeId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Page<Expense> {
        self.registry.list_by_scope(scope, cursor, limit)
    }

    pub fn list_activity(&self, cursor: Option<&Cursor>, limit: usize) -> Page<ActivityEvent> {
        self.activity.list(cursor, limit)
    }

    fn check_membership(
        &self,
        scope: &ScopeId,
        payer: &UserId,
        participants: &[Participant],
    ) -> Result<(), ServiceError> {
        match scope {
            ScopeId::Group(group_id) => {
                let group = self
                    .groups
                    .get(group_id)
                    .ok_or_else(|| ServiceError::NotFound(format!("group {group_id}")))?;
                if !group.members.contains(payer) {
                    return Err(ServiceError::NotMember {
                        user: payer.clone(),
                        scope: scope.clone(),
                    });
                }
                for participant in participants {
                    if !group.members.contains(&participant.user_id) {
                        return Err(ServiceError::NotMember {
                            user: participant.user_id.clone(),
                            scope: scope.clone(),
                        });
                    }
                }
            }
            ScopeId::Direct => {
                if !participants
                    .iter()
                    .any(|participant| participant.user_id != *payer)
                {
                    return Err(ServiceError::InvalidExpense(
                        "a direct expense needs a participant besides the payer".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn apply_splits(&self, lease: &Lease, expense: &Expense) -> Result<(), ServiceError> {
        for split in &expense.splits {
            // Fencing: a lease past its TTL loses the right to write. A
            // partially applied expense is repaired by recompute.
            self.locks.verify(lease)?;

            let debtor = &split.user_id;
            let creditor = &expense.payer_id;
            let reverse = self
                .balances
                .get_pair(&expense.scope, creditor, debtor)
                .map(|entry| entry.amount)
                .unwrap_or(Money::ZERO);

            if reverse >= split.amount {
                self.balances.upsert_atomic(
                    &expense.scope,
                    creditor,
                    debtor,
                    UpsertMode::Decrement(split.amount),
                    Some(&expense.id),
                )?;
            } else {
                if reverse.is_positive() {
                    self.balances.upsert_atomic(
                        &expense.scope,
                        creditor,
                        debtor,
                        UpsertMode::Delete,
                        None,
                    )?;
                }
                let delta = Money::from_cents(split.amount.cents() - reverse.cents());
                self.balances.upsert_atomic(
                    &expense.scope,
                    debtor,
                    creditor,
                    UpsertMode::Increment(delta),
                    Some(&expense.id),
                )?;
            }
        }
        Ok(())
    }

    fn invalidate_after_write<'a>(
        &self,
        scope: &ScopeId,
        users: impl Iterator<Item = &'a UserId>,
    ) {
        let mut keys = vec![format!("bal:scope:{scope}"), format!("set:scope:{scope}")];
        for user in users {
            keys.push(format!("bal:user:{user}"));
            keys.push(format!("set:user:{user}"));
        }
        keys.sort();
        keys.dedup();
        self.jobs.enqueue(INVALIDATE_JOB, json!({ "del": keys }));
    }
}

fn write_lock_name(scope: &ScopeId, payer: &UserId) -> String {
    match scope {
        ScopeId::Group(group) => format!("scope:{group}"),
        ScopeId::Direct => format!("direct:{payer}"),
    }
}
