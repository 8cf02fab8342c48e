use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("attempt timed out")]
    Timeout,
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct JobConfig {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Retry n sleeps `backoff_base * 2^n`; the default base of one second
    /// gives the 2/4/8... second ladder.
    pub backoff_base: Duration,
    pub default_concurrency: usize,
    pub concurrency: BTreeMap<String, usize>,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            default_concurrency: 5,
            concurrency: BTreeMap::new(),
        }
    }
}

struct QueuedJob {
    kind: String,
    payload: Value,
    attempt: u32,
    max_attempts: u32,
    delay: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct FailedJob {
    pub kind: String,
    pub error: String,
    pub attempts: u32,
}

/// Background executor for non-critical work.
///
/// Delivery is at-least-once and handlers must be idempotent. Nothing the
/// runner does may fail a caller: enqueue drops on the floor with a log line
/// if the dispatcher is gone, and exhausted jobs land on a dead list instead
/// of propagating.
pub struct JobRunner {
    tx: mpsc::UnboundedSender<QueuedJob>,
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    config: JobConfig,
    handlers: RwLock<HashMap<String, Handler>>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    pending: AtomicUsize,
    failed: Mutex<Vec<FailedJob>>,
}

impl JobRunner {
    /// Starts the dispatcher; must run inside a tokio runtime.
    pub fn spawn(config: JobConfig) -> Arc<JobRunner> {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedJob>();
        let inner = Arc::new(RunnerInner {
            config,
            handlers: RwLock::new(HashMap::new()),
            semaphores: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            failed: Mutex::new(Vec::new()),
        });

        let dispatcher_inner = inner.clone();
        let retry_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let inner = dispatcher_inner.clone();
                let tx = retry_tx.clone();
                tokio::spawn(async move { inner.run(job, tx).await });
            }
        });

        Arc::new(JobRunner { tx, inner })
    }

    pub fn register<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.inner
            .handlers
            .write()
            .expect("handler table poisoned")
            .insert(kind.to_string(), handler);
    }

    pub fn enqueue(&self, kind: &str, payload: Value) {
        self.enqueue_with(kind, payload, self.inner.config.max_attempts, None);
    }

    pub fn enqueue_with(
        &self,
        kind: &str,
        payload: Value,
        max_attempts: u32,
        delay: Option<Duration>,
    ) {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let job = QueuedJob {
            kind: kind.to_string(),
            payload,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            delay,
        };
        if self.tx.send(job).is_err() {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(kind, "job dispatcher is gone; dropping job");
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> Vec<FailedJob> {
        self.inner.failed.lock().expect("dead list poisoned").clone()
    }

    /// Waits until every enqueued job reached a terminal state. Test and
    /// shutdown helper; API handlers never block on this.
    pub async fn wait_idle(&self, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        while self.pending() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

impl RunnerInner {
    async fn run(self: Arc<Self>, job: QueuedJob, tx: mpsc::UnboundedSender<QueuedJob>) {
        if let Some(delay) = job.delay {
            tokio::time::sleep(delay).await;
        }

        let semaphore = self.semaphore(&job.kind);
        let _permit = semaphore
            .acquire_owned()
            .await
            .expect("job semaphore closed");

        let handler = self
            .handlers
            .read()
            .expect("handler table poisoned")
            .get(&job.kind)
            .cloned();
        let Some(handler) = handler else {
            self.give_up(&job, "no handler registered".to_string());
            return;
        };

        let outcome = match timeout(self.config.attempt_timeout, handler(job.payload.clone())).await
        {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout),
        };

        match outcome {
            Ok(()) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
            Err(err) if job.attempt < job.max_attempts => {
                let backoff = self.config.backoff_base * 2u32.pow(job.attempt.min(16));
                warn!(
                    kind = %job.kind,
                    attempt = job.attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    %err,
                    "job attempt failed; retrying"
                );
                let (kind, attempt) = (job.kind.clone(), job.attempt);
                let retry = QueuedJob {
                    attempt: attempt + 1,
                    delay: Some(backoff),
                    ..job
                };
                if tx.send(retry).is_err() {
                    self.give_up_count(&kind, attempt, err.to_string());
                }
            }
            Err(err) => {
                self.give_up(&job, err.to_string());
            }
        }
    }

    fn semaphore(&self, kind: &str) -> Arc<Semaphore> {
        let limit = self
            .config
            .concurrency
            .get(kind)
            .copied()
            .unwrap_or(self.config.default_concurrency)
            .max(1);
        self.semaphores
            .lock()
            .expect("semaphore table poisoned")
            .entry(kind.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone()
    }

    fn give_up(&self, job: &QueuedJob, reason: String) {
        self.give_up_count(&job.kind, job.attempt, reason);
    }

    fn give_up_count(&self, kind: &str, attempts: u32, reason: String) {
        error!(kind, attempts, %reason, "job failed permanently");
        self.failed.lock().expect("dead list poisoned").push(FailedJob {
            kind: kind.to_string(),
            error: reason,
            attempts,
        });
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fast_config() -> JobConfig {
        JobConfig {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(500),
            backoff_base: Duration::from_millis(5),
            default_concurrency: 5,
            concurrency: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn runs_jobs_to_completion() {
        let runner = JobRunner::spawn(fast_config());
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        runner.register("touch", move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        runner.enqueue("touch", json!({}));
        runner.enqueue("touch", json!({}));
        assert!(runner.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(runner.failed().is_empty());
    }

    #[tokio::test]
    async fn retries_then_lands_on_the_dead_list() {
        let runner = JobRunner::spawn(fast_config());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        runner.register("flaky", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(JobError::Failed("nope".to_string()))
            }
        });
        runner.enqueue("flaky", json!({}));
        assert!(runner.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let failed = runner.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
    }

    #[tokio::test]
    async fn recovery_mid_retry_clears_the_job() {
        let runner = JobRunner::spawn(fast_config());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        runner.register("second-try", move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(JobError::Failed("warming up".to_string()))
                } else {
                    Ok(())
                }
            }
        });
        runner.enqueue("second-try", json!({}));
        assert!(runner.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(runner.failed().is_empty());
    }

    #[tokio::test]
    async fn per_queue_concurrency_is_bounded() {
        let mut config = fast_config();
        config.concurrency.insert("narrow".to_string(), 2);
        let runner = JobRunner::spawn(config);

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current2, peak2) = (current.clone(), peak.clone());
        runner.register("narrow", move |_| {
            let current = current2.clone();
            let peak = peak2.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        for _ in 0..6 {
            runner.enqueue("narrow", json!({}));
        }
        assert!(runner.wait_idle(Duration::from_secs(2)).await);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn timeouts_count_as_failed_attempts() {
        let mut config = fast_config();
        config.attempt_timeout = Duration::from_millis(20);
        config.max_attempts = 2;
        let runner = JobRunner::spawn(config);
        runner.register("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        runner.enqueue("slow", json!({}));
        assert!(runner.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(runner.failed().len(), 1);
    }
}
