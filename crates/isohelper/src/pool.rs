//! # Load-balanced pool of helpers
//!
//! [`WorkerHelperPool`] owns a fixed number of [`WorkerHelper`]s started
//! from the same bootstrap config and routes each call to the member with
//! the fewest calls in flight.
//!
//! ## Invariants
//!
//! - Selection and the counter increment happen together under one lock, so
//!   two concurrent calls never both see the same stale minimum.
//! - The counter is decremented exactly once when the call settles, whether
//!   it succeeded, failed or was dropped mid-flight.
//! - Ties go to the earliest member.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use isochan::Value;
use parking_lot::Mutex;
use tracing::debug;
use tracing::info;

use crate::bootstrap::BootstrapConfig;
use crate::bootstrap::LocalBootstrap;
use crate::helper::MethodCall;
use crate::helper::Result;
use crate::helper::WorkerHelper;
use crate::host::Host;
use crate::spawn::ContextOptions;

type PendingInit = Shared<BoxFuture<'static, Result<()>>>;

struct PoolEntry {
    tasks: AtomicUsize,
    helper: WorkerHelper,
}

struct PoolInner {
    entries: Vec<PoolEntry>,
    select: Mutex<()>,
    init: Mutex<Option<PendingInit>>,
}

/// N helpers behind one least-loaded dispatcher.
#[derive(Clone)]
pub struct WorkerHelperPool {
    inner: Arc<PoolInner>,
}

impl WorkerHelperPool {
    /// A pool of `count` helpers, or [`Config::pool_size`](crate::Config) of the
    /// host when `None`. A pool always has at least one member.
    pub fn new(host: Host, config: BootstrapConfig, name: impl Into<String>, count: Option<usize>) -> Self {
        let name = name.into();
        let count = count.unwrap_or(host.config().pool_size).max(1);
        // one published config for every member
        let provider = Arc::new(LocalBootstrap::new());

        let entries = (0..count)
            .map(|_| PoolEntry {
                tasks: AtomicUsize::new(0),
                helper: WorkerHelper::with_provider(
                    host.clone(),
                    config.clone(),
                    ContextOptions::dedicated(name.clone()),
                    provider.clone(),
                ),
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                entries,
                select: Mutex::new(()),
                init: Mutex::new(None),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Calls in flight per member, in member order.
    pub fn task_counts(&self) -> Vec<usize> {
        self.inner.entries
            .iter()
            .map(|entry| entry.tasks.load(Ordering::Acquire))
            .collect()
    }

    pub fn helpers(&self) -> impl Iterator<Item = &WorkerHelper> {
        self.inner.entries.iter().map(|entry| &entry.helper)
    }

    /// Starts every member, one after another. Memoised; a failed attempt is
    /// forgotten so the next call retries.
    pub async fn init(&self) -> Result<()> {
        let pending = {
            let mut slot = self.inner.init.lock();
            slot.get_or_insert_with(|| self.start()).clone()
        };

        let outcome = pending.clone().await;
        if outcome.is_err() {
            let mut slot = self.inner.init.lock();
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&pending)) {
                *slot = None;
            }
        }
        outcome
    }

    fn start(&self) -> PendingInit {
        let helpers: Vec<WorkerHelper> = self.helpers().cloned().collect();
        async move {
            for helper in &helpers {
                helper.init().await?;
            }
            info!(size = helpers.len(), "pool ready");
            Ok(())
        }
        .boxed()
        .shared()
    }

    /// Runs `method` on the least-loaded member.
    pub async fn call_method(&self, call: MethodCall) -> Result<Value> {
        let slot = self.reserve();
        debug!(member = slot.index, method = %call.method, "dispatching pool call");
        slot.entry.helper.call_method(call).await
    }

    fn reserve(&self) -> TaskSlot<'_> {
        let _select = self.inner.select.lock();

        let mut index = 0;
        let mut least = usize::MAX;
        for (i, entry) in self.inner.entries.iter().enumerate() {
            let tasks = entry.tasks.load(Ordering::Acquire);
            if tasks < least {
                index = i;
                least = tasks;
            }
        }

        let entry = &self.inner.entries[index];
        entry.tasks.fetch_add(1, Ordering::AcqRel);
        TaskSlot { index, entry }
    }

    /// Disconnects every member and forgets the initialisation.
    pub fn disconnect(&self) {
        for helper in self.helpers() {
            helper.disconnect();
        }
        *self.inner.init.lock() = None;
    }
}

impl fmt::Debug for WorkerHelperPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHelperPool")
            .field("tasks", &self.task_counts())
            .finish()
    }
}

/// One in-flight call on a member; releases the member's counter on drop.
struct TaskSlot<'a> {
    index: usize,
    entry: &'a PoolEntry,
}

impl Drop for TaskSlot<'_> {
    fn drop(&mut self) {
        self.entry.tasks.fetch_sub(1, Ordering::AcqRel);
    }
}
