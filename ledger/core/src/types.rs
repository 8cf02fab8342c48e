use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::money::Money;

/// Reserved scope literal for user-to-user balances outside any group.
pub const DIRECT_SCOPE: &str = "direct";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(ExpenseId);

/// A sub-ledger: either a group or the reserved `direct` scope.
///
/// `direct` balances and group balances are independent ledgers; aggregation
/// sums across both but never merges their rows.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeId {
    Group(GroupId),
    Direct,
}

impl ScopeId {
    pub fn parse(value: &str) -> Self {
        if value == DIRECT_SCOPE {
            ScopeId::Direct
        } else {
            ScopeId::Group(GroupId::new(value))
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ScopeId::Direct)
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            ScopeId::Group(id) => Some(id),
            ScopeId::Direct => None,
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeId::Group(id) => f.write_str(id.as_str()),
            ScopeId::Direct => f.write_str(DIRECT_SCOPE),
        }
    }
}

impl Serialize for ScopeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ScopeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ScopeId::parse(&raw))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    Equal,
    Exact,
    Percentage,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    // No skip attributes: participants round-trip through bincode in the
    // expense registry, which needs a fixed field layout.
    #[serde(default)]
    pub exact_amount: Option<Money>,
    #[serde(default)]
    pub percent_bp: Option<u32>,
}

impl Participant {
    pub fn equal(user_id: impl Into<String>) -> Self {
        Participant {
            user_id: UserId::new(user_id),
            exact_amount: None,
            percent_bp: None,
        }
    }

    pub fn exact(user_id: impl Into<String>, amount: Money) -> Self {
        Participant {
            user_id: UserId::new(user_id),
            exact_amount: Some(amount),
            percent_bp: None,
        }
    }

    pub fn percent(user_id: impl Into<String>, percent_bp: u32) -> Self {
        Participant {
            user_id: UserId::new(user_id),
            exact_amount: None,
            percent_bp: Some(percent_bp),
        }
    }
}

/// A derived per-debtor owed amount. Never contains the payer; always
/// strictly positive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub user_id: UserId,
    pub amount: Money,
}

/// An immutable stored expense; `splits` are derived at posting time and
/// satisfy `sum(splits) + payer_share == amount`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: ExpenseId,
    pub scope: ScopeId,
    pub payer_id: UserId,
    pub amount: Money,
    pub split_mode: SplitMode,
    pub participants: Vec<Participant>,
    pub splits: Vec<Split>,
    pub date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A recorded settle-up payment. Settlements share the replay log with
/// expenses so a recompute does not resurrect settled debt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub id: ExpenseId,
    pub scope: ScopeId,
    pub debtor_id: UserId,
    pub creditor_id: UserId,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}

/// One leg of a settlement plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub from: UserId,
    pub to: UserId,
    pub amount: Money,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_id_round_trips_through_json() {
        let direct: ScopeId = serde_json::from_str("\"direct\"").unwrap();
        assert_eq!(direct, ScopeId::Direct);
        assert_eq!(serde_json::to_string(&direct).unwrap(), "\"direct\"");

        let group: ScopeId = serde_json::from_str("\"trip-2026\"").unwrap();
        assert_eq!(group, ScopeId::Group(GroupId::new("trip-2026")));
        assert_eq!(serde_json::to_string(&group).unwrap(), "\"trip-2026\"");
    }

    #[test]
    fn split_mode_uses_snake_case_wire_names() {
        assert_eq!(
            serde_json::to_string(&SplitMode::Percentage).unwrap(),
            "\"percentage\""
        );
        let mode: SplitMode = serde_json::from_str("\"equal\"").unwrap();
        assert_eq!(mode, SplitMode::Equal);
    }
}
