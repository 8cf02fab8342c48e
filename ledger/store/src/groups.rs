use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledger_core::{GroupId, UserId};

use crate::balances::write_atomic;
use crate::error::StoreError;

const FILE_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub members: BTreeSet<UserId>,
    pub creator_id: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Serialize, Deserialize)]
struct GroupFile {
    version: u32,
    groups: Vec<Group>,
}

/// Groups are created, grow members, and are only ever soft-deleted by
/// their creator. The core never removes a member.
pub struct GroupRegistry {
    path: Option<PathBuf>,
    state: Mutex<BTreeMap<GroupId, Group>>,
}

impl GroupRegistry {
    pub fn in_memory() -> Self {
        GroupRegistry {
            path: None,
            state: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut groups = BTreeMap::new();
        if path.exists() {
            let bytes = fs::read(&path)?;
            let file: GroupFile = bincode::deserialize(&bytes)?;
            if file.version != FILE_VERSION {
                return Err(StoreError::UnsupportedVersion(file.version));
            }
            for group in file.groups {
                groups.insert(group.id.clone(), group);
            }
        }
        Ok(GroupRegistry {
            path: Some(path),
            state: Mutex::new(groups),
        })
    }

    pub fn create(&self, group: Group) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.contains_key(&group.id) {
            return Err(StoreError::GroupExists(group.id.to_string()));
        }
        state.insert(group.id.clone(), group);
        self.persist(&state)
    }

    /// Live groups only; a soft-deleted group behaves as missing.
    pub fn get(&self, id: &GroupId) -> Option<Group> {
        self.lock()
            .get(id)
            .filter(|group| !group.deleted)
            .cloned()
    }

    /// Adds a member; `Ok(false)` when already present.
    pub fn add_member(&self, id: &GroupId, user: &UserId) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let group = state
            .get_mut(id)
            .filter(|group| !group.deleted)
            .ok_or_else(|| StoreError::UnknownGroup(id.to_string()))?;
        let added = group.members.insert(user.clone());
        if added {
            self.persist(&state)?;
        }
        Ok(added)
    }

    pub fn soft_delete(&self, id: &GroupId, actor: &UserId) -> Result<(), StoreError> {
        let mut state = self.lock();
        let group = state
            .get_mut(id)
            .filter(|group| !group.deleted)
            .ok_or_else(|| StoreError::UnknownGroup(id.to_string()))?;
        if group.creator_id != *actor {
            return Err(StoreError::NotGroupCreator(id.to_string()));
        }
        group.deleted = true;
        self.persist(&state)
    }

    pub fn is_member(&self, id: &GroupId, user: &UserId) -> bool {
        self.lock()
            .get(id)
            .filter(|group| !group.deleted)
            .is_some_and(|group| group.members.contains(user))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<GroupId, Group>> {
        self.state.lock().expect("group registry mutex poisoned")
    }

    fn persist(&self, state: &BTreeMap<GroupId, Group>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = GroupFile {
            version: FILE_VERSION,
            groups: state.values().cloned().collect(),
        };
        write_atomic(path, &bincode::serialize(&file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str, creator: &str, members: &[&str]) -> Group {
        Group {
            id: GroupId::new(id),
            name: format!("group {id}"),
            members: members.iter().map(|m| UserId::new(*m)).collect(),
            creator_id: UserId::new(creator),
            created_at: Utc::now(),
            deleted: false,
        }
    }

    #[test]
    fn create_and_membership() {
        let registry = GroupRegistry::in_memory();
        registry
            .create(group("g1", "alice", &["alice", "bob"]))
            .unwrap();
        assert!(registry.is_member(&GroupId::new("g1"), &UserId::new("bob")));
        assert!(!registry.is_member(&GroupId::new("g1"), &UserId::new("carol")));
        assert!(matches!(
            registry.create(group("g1", "alice", &[])),
            Err(StoreError::GroupExists(_))
        ));
    }

    #[test]
    fn add_member_is_idempotent() {
        let registry = GroupRegistry::in_memory();
        registry.create(group("g1", "alice", &["alice"])).unwrap();
        assert!(registry
            .add_member(&GroupId::new("g1"), &UserId::new("bob"))
            .unwrap());
        assert!(!registry
            .add_member(&GroupId::new("g1"), &UserId::new("bob"))
            .unwrap());
    }

    #[test]
    fn only_the_creator_deletes_and_deletion_hides_the_group() {
        let registry = GroupRegistry::in_memory();
        registry
            .create(group("g1", "alice", &["alice", "bob"]))
            .unwrap();
        assert!(matches!(
            registry.soft_delete(&GroupId::new("g1"), &UserId::new("bob")),
            Err(StoreError::NotGroupCreator(_))
        ));
        registry
            .soft_delete(&GroupId::new("g1"), &UserId::new("alice"))
            .unwrap();
        assert!(registry.get(&GroupId::new("g1")).is_none());
        assert!(!registry.is_member(&GroupId::new("g1"), &UserId::new("bob")));
    }

    #[test]
    fn reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.bin");
        {
            let registry = GroupRegistry::open(&path).unwrap();
            registry
                .create(group("g1", "alice", &["alice", "bob"]))
                .unwrap();
        }
        let registry = GroupRegistry::open(&path).unwrap();
        assert!(registry.is_member(&GroupId::new("g1"), &UserId::new("alice")));
    }
}
