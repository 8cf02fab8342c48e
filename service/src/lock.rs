use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

const RETRY_BASE: Duration = Duration::from_millis(10);
const RETRY_MAX: Duration = Duration::from_millis(200);
const RETRY_JITTER_MS: u64 = 25;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out acquiring lock {name}")]
    Timeout { name: String, retry_after_secs: u64 },

    #[error("lease on {name} expired or was reclaimed")]
    Lost { name: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A granted lock. Carries a fencing token: the service re-checks the lease
/// before every store mutation, so a holder that outlives its TTL has its
/// remaining writes rejected instead of corrupting the ledger.
#[derive(Clone, Debug)]
pub struct Lease {
    name: String,
    token: u64,
    expires_at: Instant,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

struct Holder {
    token: u64,
    expires_at: Instant,
}

enum Backend {
    Process {
        holders: Mutex<HashMap<String, Holder>>,
    },
    // One lock file per name; the OS drops the flock with the process, and
    // fencing tokens cover the TTL side.
    File {
        dir: PathBuf,
        held: Mutex<HashMap<u64, File>>,
    },
}

/// Named exclusive locks with TTL and bounded, jittered waiting.
#[derive(Clone)]
pub struct LockService {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Backend,
    ttl: Duration,
    wait: Duration,
    fencing: AtomicU64,
}

impl LockService {
    /// In-process table. Only legal when exactly one instance runs;
    /// configuration validation enforces that.
    pub fn process(ttl: Duration, wait: Duration) -> Self {
        LockService {
            inner: Arc::new(Inner {
                backend: Backend::Process {
                    holders: Mutex::new(HashMap::new()),
                },
                ttl,
                wait,
                fencing: AtomicU64::new(1),
            }),
        }
    }

    /// File locks under `dir`, shared by every instance pointed at the same
    /// store.
    pub fn file(dir: impl Into<PathBuf>, ttl: Duration, wait: Duration) -> Result<Self, LockError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(LockService {
            inner: Arc::new(Inner {
                backend: Backend::File {
                    dir,
                    held: Mutex::new(HashMap::new()),
                },
                ttl,
                wait,
                fencing: AtomicU64::new(1),
            }),
        })
    }

    pub async fn acquire(&self, name: &str) -> Result<Lease, LockError> {
        let deadline = Instant::now() + self.inner.wait;
        let mut backoff = RETRY_BASE;
        loop {
            if let Some(lease) = self.try_acquire(name)? {
                return Ok(lease);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    retry_after_secs: self.inner.ttl.as_secs().max(1),
                });
            }
            let jitter = Duration::from_millis(rand::random::<u64>() % RETRY_JITTER_MS);
            sleep((backoff + jitter).min(deadline - now)).await;
            backoff = (backoff * 2).min(RETRY_MAX);
        }
    }

    /// Fails when the lease expired or another holder took the name.
    pub fn verify(&self, lease: &Lease) -> Result<(), LockError> {
        if Instant::now() >= lease.expires_at {
            return Err(LockError::Lost {
                name: lease.name.clone(),
            });
        }
        let live = match &self.inner.backend {
            Backend::Process { holders } => holders
                .lock()
                .expect("lock table poisoned")
                .get(&lease.name)
                .is_some_and(|holder| holder.token == lease.token),
            Backend::File { held, .. } => held
                .lock()
                .expect("lock table poisoned")
                .contains_key(&lease.token),
        };
        if live {
            Ok(())
        } else {
            Err(LockError::Lost {
                name: lease.name.clone(),
            })
        }
    }

    /// Pushes the lease deadline out; used when a held operation approaches
    /// its TTL.
    pub fn extend(&self, lease: &mut Lease, ttl: Duration) -> Result<(), LockError> {
        self.verify(lease)?;
        let expires_at = Instant::now() + ttl;
        if let Backend::Process { holders } = &self.inner.backend {
            let mut holders = holders.lock().expect("lock table poisoned");
            if let Some(holder) = holders.get_mut(&lease.name) {
                if holder.token == lease.token {
                    holder.expires_at = expires_at;
                }
            }
        }
        lease.expires_at = expires_at;
        Ok(())
    }

    /// Idempotent; an expired or superseded lease is ignored silently.
    pub fn release(&self, lease: Lease) {
        match &self.inner.backend {
            Backend::Process { holders } => {
                let mut holders = holders.lock().expect("lock table poisoned");
                if holders
                    .get(&lease.name)
                    .is_some_and(|holder| holder.token == lease.token)
                {
                    holders.remove(&lease.name);
                }
            }
            Backend::File { held, .. } => {
                // Dropping the handle releases the flock.
                held.lock().expect("lock table poisoned").remove(&lease.token);
            }
        }
    }

    fn try_acquire(&self, name: &str) -> Result<Option<Lease>, LockError> {
        let now = Instant::now();
        let expires_at = now + self.inner.ttl;
        match &self.inner.backend {
            Backend::Process { holders } => {
                let mut holders = holders.lock().expect("lock table poisoned");
                if let Some(holder) = holders.get(name) {
                    if holder.expires_at > now {
                        return Ok(None);
                    }
                    warn!(lock = name, "reclaiming lock from expired holder");
                }
                let token = self.inner.fencing.fetch_add(1, Ordering::Relaxed);
                holders.insert(name.to_string(), Holder { token, expires_at });
                Ok(Some(Lease {
                    name: name.to_string(),
                    token,
                    expires_at,
                }))
            }
            Backend::File { dir, held } => {
                let path = dir.join(format!("{}.lock", name.replace(':', "_")));
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?;
                match file.try_lock_exclusive() {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                    Err(err) => return Err(LockError::Io(err)),
                }
                let token = self.inner.fencing.fetch_add(1, Ordering::Relaxed);
                // Best-effort breadcrumb for operators inspecting the dir.
                let _ = file.set_len(0);
                let _ = writeln!(file, "{token}");
                held.lock().expect("lock table poisoned").insert(token, file);
                Ok(Some(Lease {
                    name: name.to_string(),
                    token,
                    expires_at,
                }))
            }
        }
    }
}
