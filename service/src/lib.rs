pub mod aggregation;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod ledger;
pub mod lock;
pub mod util;

use std::sync::Arc;

use serde::Deserialize;

use ledger_store::{ActivityLog, BalanceStore, ExpenseRegistry, GroupRegistry};

pub use aggregation::{AggregationService, CounterpartyAmount, PlanTarget, ScopeMatrix, UserView};
pub use cache::CacheLayer;
pub use config::{Config, ConfigError, LockBackend};
pub use error::ServiceError;
pub use events::EventEmitter;
pub use jobs::{JobConfig, JobError, JobRunner};
pub use ledger::{LedgerService, NewExpense, INVALIDATE_JOB};
pub use lock::{Lease, LockError, LockService};

/// The assembled settlement core: stores, infrastructure, and the two
/// service facades.
pub struct Core {
    pub ledger: LedgerService,
    pub aggregation: AggregationService,
    pub jobs: Arc<JobRunner>,
    pub events: EventEmitter,
    pub cache: CacheLayer,
    pub balances: Arc<BalanceStore>,
    pub registry: Arc<ExpenseRegistry>,
}

impl Core {
    /// Opens the file-backed core under `config.store_path`. Must run inside
    /// a tokio runtime (the job dispatcher spawns immediately).
    pub fn open(config: &Config) -> Result<Core, ServiceError> {
        let dir = &config.store_path;
        std::fs::create_dir_all(dir)
            .map_err(|err| ServiceError::StoreUnavailable(err.to_string()))?;
        let balances = Arc::new(BalanceStore::open(dir.join("balances.bin"))?);
        let registry = Arc::new(ExpenseRegistry::open(dir.join("expenses.bin"))?);
        let groups = Arc::new(GroupRegistry::open(dir.join("groups.bin"))?);
        let activity = Arc::new(ActivityLog::open(dir.join("activity.json"))?);
        Core::assemble(config, balances, registry, groups, activity)
    }

    /// Fully in-memory core for tests.
    pub fn in_memory(config: &Config) -> Result<Core, ServiceError> {
        Core::assemble(
            config,
            Arc::new(BalanceStore::in_memory()),
            Arc::new(ExpenseRegistry::in_memory()),
            Arc::new(GroupRegistry::in_memory()),
            Arc::new(ActivityLog::in_memory()),
        )
    }

    fn assemble(
        config: &Config,
        balances: Arc<BalanceStore>,
        registry: Arc<ExpenseRegistry>,
        groups: Arc<GroupRegistry>,
        activity: Arc<ActivityLog>,
    ) -> Result<Core, ServiceError> {
        config
            .validate()
            .map_err(|err| ServiceError::InvalidParams(err.to_string()))?;

        let locks = match config.lock_backend {
            LockBackend::Process => LockService::process(config.lock_ttl, config.lock_wait),
            LockBackend::Distributed => LockService::file(
                config.store_path.join("locks"),
                config.lock_ttl,
                config.lock_wait,
            )
            .map_err(|err| ServiceError::StoreUnavailable(err.to_string()))?,
        };

        let cache = if config.cache_url.is_some() {
            CacheLayer::enabled()
        } else {
            CacheLayer::disabled()
        };

        // Env-derived queue names use underscores; job kinds use dots.
        let concurrency = config
            .job_concurrency
            .iter()
            .map(|(queue, limit)| (queue.replace('_', "."), *limit))
            .collect();
        let jobs = JobRunner::spawn(JobConfig {
            max_attempts: config.job_max_attempts,
            default_concurrency: config.default_job_concurrency,
            concurrency,
            ..JobConfig::default()
        });

        let invalidation_cache = cache.clone();
        jobs.register(INVALIDATE_JOB, move |payload| {
            let cache = invalidation_cache.clone();
            async move {
                let request: InvalidateRequest = serde_json::from_value(payload)
                    .map_err(|err| JobError::Failed(format!("bad invalidation payload: {err}")))?;
                cache.del(&request.del);
                for prefix in &request.del_prefix {
                    cache.del_prefix(prefix);
                }
                Ok(())
            }
        });

        let events = EventEmitter::new(activity.clone(), jobs.clone());
        let ledger = LedgerService::new(
            balances.clone(),
            registry.clone(),
            groups,
            activity,
            locks,
            jobs.clone(),
            events.clone(),
        );
        let aggregation =
            AggregationService::new(balances.clone(), cache.clone(), config.cache_ttl);

        Ok(Core {
            ledger,
            aggregation,
            jobs,
            events,
            cache,
            balances,
            registry,
        })
    }
}

#[derive(Deserialize)]
struct InvalidateRequest {
    #[serde(default)]
    del: Vec<String>,
    #[serde(default)]
    del_prefix: Vec<String>,
}
