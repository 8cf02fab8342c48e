use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use ledger_core::{ExpenseId, ScopeId, UserId};

use crate::balances::write_atomic;
use crate::cursor::{paginate, Cursor, Page};
use crate::error::StoreError;

const FILE_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExpenseAdded,
    Settlement,
    GroupCreated,
    GroupDeleted,
    MemberAdded,
}

/// Append-only, immutable activity record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expense_id: Option<ExpenseId>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub created_at_ns: i64,
}

impl ActivityEvent {
    /// Natural dedup key: delivery is at-least-once, so persistence must be
    /// idempotent.
    fn dedup_key(&self) -> (EventKind, String, i64) {
        let entity = self
            .expense_id
            .as_ref()
            .map(|id| id.to_string())
            .or_else(|| self.scope.as_ref().map(|scope| scope.to_string()))
            .unwrap_or_else(|| self.user_id.to_string());
        (self.kind, entity, self.created_at_ns)
    }
}

// The activity file is JSON rather than bincode: event payloads are
// free-form `serde_json::Value`s, which only round-trip through a
// self-describing format.
#[derive(Serialize, Deserialize)]
struct ActivityFile {
    version: u32,
    events: Vec<ActivityEvent>,
}

#[derive(Default)]
struct ActivityState {
    events: Vec<ActivityEvent>,
    seen: BTreeSet<(EventKind, String, i64)>,
}

pub struct ActivityLog {
    path: Option<PathBuf>,
    state: Mutex<ActivityState>,
}

impl ActivityLog {
    pub fn in_memory() -> Self {
        ActivityLog {
            path: None,
            state: Mutex::new(ActivityState::default()),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut state = ActivityState::default();
        if path.exists() {
            let bytes = fs::read(&path)?;
            let file: ActivityFile = serde_json::from_slice(&bytes)?;
            if file.version != FILE_VERSION {
                return Err(StoreError::UnsupportedVersion(file.version));
            }
            for event in file.events {
                state.seen.insert(event.dedup_key());
                state.events.push(event);
            }
        }
        Ok(ActivityLog {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Appends an event; returns `false` for a duplicate delivery.
    pub fn append(&self, event: ActivityEvent) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if !state.seen.insert(event.dedup_key()) {
            debug!(event = %event.id, "duplicate activity event dropped");
            return Ok(false);
        }
        state.events.push(event);
        self.persist(&state)?;
        Ok(true)
    }

    /// Newest-first page over the whole log.
    pub fn list(&self, cursor: Option<&Cursor>, limit: usize) -> Page<ActivityEvent> {
        let state = self.lock();
        let items = state
            .events
            .iter()
            .rev()
            .map(|event| (event.created_at_ns, event.id.clone(), event.clone()));
        paginate(items, cursor, limit)
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ActivityState> {
        self.state.lock().expect("activity log mutex poisoned")
    }

    fn persist(&self, state: &ActivityState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = ActivityFile {
            version: FILE_VERSION,
            events: state.events.clone(),
        };
        write_atomic(path, &serde_json::to_vec(&file)?)
    }
}
