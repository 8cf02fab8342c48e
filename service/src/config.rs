use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_LOCK_TTL_MS: u64 = 10_000;
pub const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;
pub const DEFAULT_JOB_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_JOB_CONCURRENCY: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value {value:?} for {name}")]
    InvalidVar { name: String, value: String },

    #[error("running {instances} instances requires LOCK_BACKEND=distributed")]
    MultiInstanceWithoutDistributedLock { instances: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockBackend {
    /// In-process lock table; only legal for a single instance.
    Process,
    /// File locks shared through the store directory; safe across instances
    /// on one host.
    Distributed,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Data directory holding every store file. Accepts a plain path or a
    /// `file:` URL.
    pub store_path: PathBuf,
    /// Presence enables the cache layer; the core runs (and stays correct)
    /// without it.
    pub cache_url: Option<String>,
    pub lock_backend: LockBackend,
    pub cache_ttl: Duration,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub job_max_attempts: u32,
    pub job_concurrency: BTreeMap<String, usize>,
    pub default_job_concurrency: usize,
    pub instances: u32,
}

impl Config {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Config {
            store_path: store_path.into(),
            cache_url: None,
            lock_backend: LockBackend::Process,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            lock_ttl: Duration::from_millis(DEFAULT_LOCK_TTL_MS),
            lock_wait: Duration::from_millis(DEFAULT_LOCK_WAIT_MS),
            job_max_attempts: DEFAULT_JOB_MAX_ATTEMPTS,
            job_concurrency: BTreeMap::new(),
            default_job_concurrency: DEFAULT_JOB_CONCURRENCY,
            instances: 1,
        }
    }

    /// Reads the recognized environment: `STORE_URL` (required),
    /// `CACHE_URL`, `LOCK_BACKEND`, `CACHE_TTL_SECONDS`, `LOCK_TTL_MS`,
    /// `LOCK_WAIT_MS`, `JOB_MAX_ATTEMPTS`, `JOB_CONCURRENCY_<QUEUE>`,
    /// `INSTANCES`.
    pub fn from_env() -> Result<Config, ConfigError> {
        let store_url =
            std::env::var("STORE_URL").map_err(|_| ConfigError::MissingVar("STORE_URL"))?;
        let mut config = Config::new(strip_file_scheme(&store_url));

        config.cache_url = std::env::var("CACHE_URL").ok().filter(|v| !v.is_empty());

        if let Ok(value) = std::env::var("LOCK_BACKEND") {
            config.lock_backend = match value.as_str() {
                "process" => LockBackend::Process,
                "distributed" => LockBackend::Distributed,
                _ => {
                    return Err(ConfigError::InvalidVar {
                        name: "LOCK_BACKEND".to_string(),
                        value,
                    })
                }
            };
        }

        if let Some(secs) = parse_var("CACHE_TTL_SECONDS")? {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var("LOCK_TTL_MS")? {
            config.lock_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var("LOCK_WAIT_MS")? {
            config.lock_wait = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var::<u32>("JOB_MAX_ATTEMPTS")? {
            config.job_max_attempts = attempts;
        }
        if let Some(instances) = parse_var::<u32>("INSTANCES")? {
            config.instances = instances;
        }

        for (name, value) in std::env::vars() {
            if let Some(queue) = name.strip_prefix("JOB_CONCURRENCY_") {
                let parsed = value.parse().map_err(|_| ConfigError::InvalidVar {
                    name: name.clone(),
                    value: value.clone(),
                })?;
                config
                    .job_concurrency
                    .insert(queue.to_ascii_lowercase(), parsed);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Refuses configurations that cannot hold the locking guarantees.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instances > 1 && self.lock_backend == LockBackend::Process {
            return Err(ConfigError::MultiInstanceWithoutDistributedLock {
                instances: self.instances,
            });
        }
        Ok(())
    }
}

fn strip_file_scheme(url: &str) -> &str {
    url.strip_prefix("file://")
        .or_else(|| url.strip_prefix("file:"))
        .unwrap_or(url)
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_instance_requires_distributed_locks() {
        let mut config = Config::new("/tmp/data");
        config.instances = 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MultiInstanceWithoutDistributedLock { instances: 2 })
        ));
        config.lock_backend = LockBackend::Distributed;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_scheme_is_stripped() {
        assert_eq!(strip_file_scheme("file:///var/lib/tally"), "/var/lib/tally");
        assert_eq!(strip_file_scheme("file:data"), "data");
        assert_eq!(strip_file_scheme("/var/lib/tally"), "/var/lib/tally");
    }
}
