use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use ledger_core::{settlement_plan, Money, ScopeId, Transfer, UserId};
use ledger_store::BalanceStore;

use crate::cache::CacheLayer;
use crate::error::ServiceError;

pub type ScopeMatrix = BTreeMap<UserId, BTreeMap<UserId, Money>>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterpartyAmount {
    pub user_id: UserId,
    pub amount: Money,
}

/// Cross-scope aggregate for one user. A counterparty can appear on both
/// sides at once (owed in one scope, owing in another); the sides are never
/// cancelled against each other.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub owes: Vec<CounterpartyAmount>,
    pub owed: Vec<CounterpartyAmount>,
    pub total_owes: Money,
    pub total_owed: Money,
    pub net_balance: Money,
}

/// Explicit netting policy for settlement plans: within one scope, or the
/// user-centric pairwise view across scopes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanTarget {
    Scope(ScopeId),
    User(UserId),
}

/// Read-side views over the balance store, cached with a short TTL. Every
/// view has a store-backed fallback; `fresh = true` bypasses the cache for
/// read-your-write callers.
pub struct AggregationService {
    balances: Arc<BalanceStore>,
    cache: CacheLayer,
    cache_ttl: Duration,
}

impl AggregationService {
    pub fn new(balances: Arc<BalanceStore>, cache: CacheLayer, cache_ttl: Duration) -> Self {
        AggregationService {
            balances,
            cache,
            cache_ttl,
        }
    }

    pub async fn user_view(&self, user: &UserId, fresh: bool) -> Result<UserView, ServiceError> {
        self.cached(format!("bal:user:{user}"), fresh, || async {
            Ok(self.compute_user_view(user))
        })
        .await
    }

    pub async fn scope_matrix(
        &self,
        scope: &ScopeId,
        fresh: bool,
    ) -> Result<ScopeMatrix, ServiceError> {
        self.cached(format!("bal:scope:{scope}"), fresh, || async {
            Ok(self.compute_matrix(scope))
        })
        .await
    }

    pub async fn plan(
        &self,
        target: &PlanTarget,
        fresh: bool,
    ) -> Result<Vec<Transfer>, ServiceError> {
        match target {
            PlanTarget::Scope(scope) => {
                self.cached(format!("set:scope:{scope}"), fresh, || async {
                    Ok(settlement_plan(&self.compute_matrix(scope)))
                })
                .await
            }
            PlanTarget::User(user) => {
                self.cached(format!("set:user:{user}"), fresh, || async {
                    Ok(self.compute_user_plan(user))
                })
                .await
            }
        }
    }

    fn compute_user_view(&self, user: &UserId) -> UserView {
        let mut owes: BTreeMap<UserId, Money> = BTreeMap::new();
        for entry in self.balances.scan_by_debtor(user) {
            let slot = owes.entry(entry.creditor).or_insert(Money::ZERO);
            *slot = slot.saturating_add(entry.amount);
        }
        let mut owed: BTreeMap<UserId, Money> = BTreeMap::new();
        for entry in self.balances.scan_by_creditor(user) {
            let slot = owed.entry(entry.debtor).or_insert(Money::ZERO);
            *slot = slot.saturating_add(entry.amount);
        }

        let total_owes = owes.values().fold(Money::ZERO, |acc, v| acc.saturating_add(*v));
        let total_owed = owed.values().fold(Money::ZERO, |acc, v| acc.saturating_add(*v));
        UserView {
            owes: collapse(owes),
            owed: collapse(owed),
            total_owes,
            total_owed,
            net_balance: Money::from_cents(total_owed.cents() - total_owes.cents()),
        }
    }

    fn compute_matrix(&self, scope: &ScopeId) -> ScopeMatrix {
        let mut matrix = ScopeMatrix::new();
        for entry in self.balances.scan_by_scope(scope) {
            matrix
                .entry(entry.debtor)
                .or_default()
                .insert(entry.creditor, entry.amount);
        }
        matrix
    }

    /// One transfer per aggregated counterparty balance: what the user pays,
    /// then what the user collects, each in counterparty order.
    fn compute_user_plan(&self, user: &UserId) -> Vec<Transfer> {
        let view = self.compute_user_view(user);
        let mut plan = Vec::with_capacity(view.owes.len() + view.owed.len());
        for leg in view.owes {
            plan.push(Transfer {
                from: user.clone(),
                to: leg.user_id,
                amount: leg.amount,
            });
        }
        for leg in view.owed {
            plan.push(Transfer {
                from: leg.user_id,
                to: user.clone(),
                amount: leg.amount,
            });
        }
        plan
    }

    async fn cached<T, Fut>(
        &self,
        key: String,
        fresh: bool,
        compute: impl FnOnce() -> Fut,
    ) -> Result<T, ServiceError>
    where
        T: Serialize + DeserializeOwned,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        if fresh || !self.cache.is_enabled() {
            return compute().await;
        }
        let value = self
            .cache
            .get_or_compute(&key, self.cache_ttl, || async {
                let computed = compute().await?;
                serde_json::to_value(computed)
                    .map_err(|err| ServiceError::Internal(err.to_string()))
            })
            .await?;
        serde_json::from_value(value).map_err(|err| ServiceError::Internal(err.to_string()))
    }
}

fn collapse(map: BTreeMap<UserId, Money>) -> Vec<CounterpartyAmount> {
    map.into_iter()
        .map(|(user_id, amount)| CounterpartyAmount { user_id, amount })
        .collect()
}
