//! # Named Lock Service
//!
//! Mutual exclusion keyed by a string. This is the only arbiter the
//! coordinators use for "at most one" decisions, so backends must uphold:
//!
//! - At most one exclusive holder per name; shared holders only while no
//!   exclusive holder exists.
//! - A `try_only` request never waits: it yields `Ok(None)` when not granted.
//! - A blocking request waits until granted or until its cancellation token
//!   fires, in which case it fails with [`Error::Cancelled`].
//! - The lock is held for as long as the returned [`LockGuard`] lives.
//!
//! [`LocalLocks`] only keeps entries for names that are held or waited on.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OwnedRwLockReadGuard;
use tokio::sync::OwnedRwLockWriteGuard;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The request was cancelled before the lock was granted.
    #[error("lock request for '{name}' was cancelled")]
    Cancelled { name: String },
    /// The backend could not service the request.
    #[error("lock backend failure: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockMode {
    #[default]
    Exclusive,
    Shared,
}

/// How a lock should be requested.
#[derive(Clone, Debug, Default)]
pub struct LockOptions {
    pub mode: LockMode,
    pub try_only: bool,
    pub cancel: Option<CancellationToken>,
}

impl LockOptions {
    pub fn exclusive() -> Self {
        Self { mode: LockMode::Exclusive, ..Self::default() }
    }

    pub fn shared() -> Self {
        Self { mode: LockMode::Shared, ..Self::default() }
    }

    /// Do not wait; resolve to `None` if the lock is not immediately available.
    pub fn try_only(mut self) -> Self {
        self.try_only = true;
        self
    }

    /// Abandon the wait when `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Proof of holding a named lock. Dropping it releases the lock.
pub struct LockGuard {
    name: String,
    mode: LockMode,
    _held: Box<dyn Any + Send + Sync>,
}

impl LockGuard {
    /// Wraps a backend-specific token whose drop releases the lock.
    pub fn new(name: impl Into<String>, mode: LockMode, held: impl Any + Send + Sync) -> Self {
        Self {
            name: name.into(),
            mode,
            _held: Box::new(held),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

/// A named lock service.
///
/// This trait is designed to be object-safe (`Arc<dyn LockService>`).
#[async_trait::async_trait]
pub trait LockService: Send + Sync + 'static {
    /// Requests the lock called `name`.
    ///
    /// # invariants
    /// - Returns `Ok(Some(guard))` once granted.
    /// - Returns `Ok(None)` only for `try_only` requests that were not granted.
    /// - Returns `Err(Error::Cancelled)` if the cancellation token fires first.
    async fn acquire(&self, name: &str, options: LockOptions) -> Result<Option<LockGuard>>;
}

enum Held {
    Write(OwnedRwLockWriteGuard<()>),
    Read(OwnedRwLockReadGuard<()>),
}

type LockTable = DashMap<String, Arc<RwLock<()>>>;

/// Releases the lock, then forgets the name if nobody else holds or awaits it.
struct Lease {
    held: Option<Held>,
    name: String,
    locks: Arc<LockTable>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        drop(self.held.take());
        forget_if_unused(&self.locks, &self.name);
    }
}

/// Every holder and waiter owns a clone of the lock, so the table's own
/// reference being the last one means the name is idle.
fn forget_if_unused(locks: &LockTable, name: &str) {
    locks.remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
}

/// In-process lock service shared by every host in the same process.
///
/// Each name maps to a fair read/write lock: waiters are granted in request order.
#[derive(Default)]
pub struct LocalLocks {
    locks: Arc<LockTable>,
}

impl LocalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while anyone holds `name`, exclusively or shared.
    pub fn is_held(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .map(|lock| lock.try_write().is_err())
            .unwrap_or(false)
    }

    /// Number of names currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn lock_for(&self, name: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .value()
            .clone()
    }

    async fn hold(&self, name: &str, options: &LockOptions) -> Result<Option<Held>> {
        let lock = self.lock_for(name);

        if options.try_only {
            return Ok(match options.mode {
                LockMode::Exclusive => lock.try_write_owned().ok().map(Held::Write),
                LockMode::Shared => lock.try_read_owned().ok().map(Held::Read),
            });
        }

        let cancel = options.cancel.clone().unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled { name: name.to_string() });
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(lock = %name, "lock request cancelled");
                Err(Error::Cancelled { name: name.to_string() })
            }
            held = wait_for(lock, options.mode) => Ok(Some(held)),
        }
    }
}

impl fmt::Debug for LocalLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLocks")
            .field("names", &self.locks.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl LockService for LocalLocks {
    async fn acquire(&self, name: &str, options: LockOptions) -> Result<Option<LockGuard>> {
        match self.hold(name, &options).await {
            Ok(Some(held)) => {
                let lease = Lease {
                    held: Some(held),
                    name: name.to_string(),
                    locks: self.locks.clone(),
                };
                Ok(Some(LockGuard::new(name, options.mode, lease)))
            }
            outcome => {
                forget_if_unused(&self.locks, name);
                outcome.map(|_| None)
            }
        }
    }
}

async fn wait_for(lock: Arc<RwLock<()>>, mode: LockMode) -> Held {
    match mode {
        LockMode::Exclusive => Held::Write(lock.write_owned().await),
        LockMode::Shared => Held::Read(lock.read_owned().await),
    }
}
