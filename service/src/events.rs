use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use ledger_core::{ExpenseId, ScopeId, UserId};
use ledger_store::{ActivityEvent, ActivityLog, EventKind};

use crate::jobs::{JobError, JobRunner};
use crate::util::fresh_id;

pub const PERSIST_JOB: &str = "activity.persist";
const BROADCAST_CAPACITY: usize = 256;

/// Emits domain events after the authoritative write has landed.
///
/// Persistence rides the job queue (at-least-once; the log dedups on the
/// natural key) and live subscribers get a broadcast copy. A failed emit is
/// logged and swallowed: events are auxiliary and never fail the write that
/// produced them.
#[derive(Clone)]
pub struct EventEmitter {
    jobs: Arc<JobRunner>,
    tx: broadcast::Sender<ActivityEvent>,
}

impl EventEmitter {
    pub fn new(log: Arc<ActivityLog>, jobs: Arc<JobRunner>) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        jobs.register(PERSIST_JOB, move |payload| {
            let log = log.clone();
            async move {
                let event: ActivityEvent = serde_json::from_value(payload)
                    .map_err(|err| JobError::Failed(format!("bad event payload: {err}")))?;
                log.append(event)
                    .map_err(|err| JobError::Failed(err.to_string()))?;
                Ok(())
            }
        });
        EventEmitter { jobs, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.tx.subscribe()
    }

    pub fn emit(
        &self,
        kind: EventKind,
        user_id: &UserId,
        scope: Option<&ScopeId>,
        expense_id: Option<&ExpenseId>,
        payload: Value,
    ) {
        let now = Utc::now();
        let event = ActivityEvent {
            id: fresh_id(),
            kind,
            user_id: user_id.clone(),
            scope: scope.cloned(),
            expense_id: expense_id.cloned(),
            payload,
            created_at: now,
            created_at_ns: now
                .timestamp_nanos_opt()
                .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1000)),
        };

        match serde_json::to_value(&event) {
            Ok(payload) => self.jobs.enqueue(PERSIST_JOB, payload),
            Err(err) => warn!(%err, "activity event not serializable; dropped"),
        }
        // No receivers is the normal case, not an error.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::jobs::JobConfig;

    fn fast_jobs() -> Arc<JobRunner> {
        JobRunner::spawn(JobConfig {
            backoff_base: Duration::from_millis(5),
            ..JobConfig::default()
        })
    }

    #[tokio::test]
    async fn events_reach_the_log_and_subscribers() {
        let log = Arc::new(ActivityLog::in_memory());
        let jobs = fast_jobs();
        let emitter = EventEmitter::new(log.clone(), jobs.clone());
        let mut rx = emitter.subscribe();

        emitter.emit(
            EventKind::ExpenseAdded,
            &UserId::new("alice"),
            Some(&ScopeId::parse("g1")),
            Some(&ExpenseId::new("e1")),
            json!({"amount": 900}),
        );

        let live = rx.recv().await.unwrap();
        assert_eq!(live.kind, EventKind::ExpenseAdded);
        assert!(jobs.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn redelivered_events_persist_once() {
        let log = Arc::new(ActivityLog::in_memory());
        let jobs = fast_jobs();
        let emitter = EventEmitter::new(log.clone(), jobs.clone());

        emitter.emit(
            EventKind::Settlement,
            &UserId::new("bob"),
            Some(&ScopeId::parse("g1")),
            None,
            json!({"amount": 500}),
        );
        assert!(jobs.wait_idle(Duration::from_secs(1)).await);

        // Simulate an at-least-once redelivery of the persisted event.
        let event = log.list(None, 1).data.remove(0);
        jobs.enqueue(PERSIST_JOB, serde_json::to_value(&event).unwrap());
        assert!(jobs.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(log.len(), 1);
        assert!(jobs.failed().is_empty());
    }
}
