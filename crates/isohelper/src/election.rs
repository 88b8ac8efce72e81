//! # Leader election for a shared bootstrap reference
//!
//! Several hosts want one shared context per resource name, but only one of
//! them should generate its bootstrap reference. The named lock for the
//! resource decides who that is; the broadcast channel of the same name
//! carries "who has it?" pings and the answers.
//!
//! 1. Try the lock without waiting.
//! 2. Granted: this host leads. It generates the reference once and answers
//!    every message on the channel by broadcasting the reference. The lock is
//!    held until the election's lifetime token is cancelled (host teardown).
//! 3. Not granted: this host contends. It pings with `Null` and waits up to
//!    the election timeout for a reference. On success it returns the
//!    reference and, in the background, waits for the lock; if the leader's
//!    host goes away and the lock is granted, it starts answering pings with
//!    the reference it already knows. A contender that times out does not
//!    try to succeed anyone.
//!
//! ## Invariants
//!
//! - At most one host answers pings at a time: answering requires the lock.
//! - References are generated at most once per leader and never regenerated
//!   by a successor.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use isochan::BroadcastChannel;
use isochan::LockGuard;
use isochan::LockOptions;
use isochan::LockService;
use isochan::PubSub;
use isochan::Value;
use isochan::lock;
use isochan::pubsub;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::bootstrap;
use crate::bootstrap::BootstrapConfig;
use crate::bootstrap::BootstrapProvider;
use crate::bootstrap::BootstrapRef;
use crate::host::Host;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No leader answered within the election timeout.
    #[error("Failed to fetch bootstrap reference for '{name}': timeout")]
    Timeout { name: String },
    #[error(transparent)]
    Lock(#[from] lock::Error),
    #[error(transparent)]
    Channel(#[from] pubsub::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Election state for one resource name on one host.
pub struct Election {
    name: String,
    locks: Arc<dyn LockService>,
    pubsub: Arc<dyn PubSub>,
    timeout: Duration,
    leading: Arc<AtomicBool>,
}

impl Election {
    pub fn new(host: &Host, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locks: host.origin().locks().clone(),
            pubsub: host.origin().pubsub().clone(),
            timeout: host.config().election_timeout,
            leading: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while this host holds the lock and answers pings.
    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::Acquire)
    }

    /// Obtains the reference for this resource, generating it only if this
    /// host wins the lock. Leadership, current or future, ends with `lifetime`.
    pub async fn run(
        &self,
        lifetime: &CancellationToken,
        generate: impl FnOnce() -> BootstrapRef,
    ) -> Result<BootstrapRef> {
        let attempt = self.locks.acquire(&self.name, LockOptions::exclusive().try_only()).await?;

        if let Some(guard) = attempt {
            // subscribe before generating so pings sent meanwhile are answered
            let channel = self.pubsub.open(&self.name);
            let reference = generate();
            info!(name = %self.name, %reference, "elected leader");
            self.lead(guard, channel, reference.clone(), lifetime.clone());
            return Ok(reference);
        }

        let mut channel = self.pubsub.open(&self.name);
        channel.send(Value::Null)?;
        debug!(name = %self.name, "lock held elsewhere, asking the leader");

        let reference = match tokio::time::timeout(self.timeout, wait_for_reference(channel.as_mut())).await {
            Ok(Some(reference)) => reference,
            Ok(None) => return Err(Error::Channel(pubsub::Error::Closed { name: self.name.clone() })),
            Err(_) => {
                warn!(name = %self.name, timeout = ?self.timeout, "no leader answered");
                return Err(Error::Timeout { name: self.name.clone() });
            }
        };
        channel.close();

        debug!(name = %self.name, %reference, "received reference from leader");
        self.succeed(reference.clone(), lifetime.clone());
        Ok(reference)
    }

    /// Waits in the background for the lock and takes over answering pings
    /// with `reference` once granted.
    ///
    /// A failed or cancelled attempt leaves this host a contender.
    pub fn succeed(&self, reference: BootstrapRef, lifetime: CancellationToken) {
        let name = self.name.clone();
        let locks = self.locks.clone();
        let pubsub = self.pubsub.clone();
        let leading = self.leading.clone();

        tokio::spawn(async move {
            let options = LockOptions::exclusive().cancel_on(lifetime.clone());
            match locks.acquire(&name, options).await {
                Ok(Some(guard)) => {
                    info!(%name, %reference, "previous leader left, taking over");
                    let channel = pubsub.open(&name);
                    serve(name, guard, channel, reference, lifetime, leading).await;
                }
                Ok(None) => {}
                Err(e) => debug!(%name, error = %e, "succession abandoned, staying contender"),
            }
        });
    }

    fn lead(
        &self,
        guard: LockGuard,
        channel: Box<dyn BroadcastChannel>,
        reference: BootstrapRef,
        lifetime: CancellationToken,
    ) {
        // flag before returning so the caller observes leadership immediately
        self.leading.store(true, Ordering::Release);
        tokio::spawn(serve(
            self.name.clone(),
            guard,
            channel,
            reference,
            lifetime,
            self.leading.clone(),
        ));
    }
}

impl fmt::Debug for Election {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Election")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("leading", &self.is_leader())
            .finish()
    }
}

/// Bootstrap provider that only lets the elected host publish the config.
///
/// The reference is cached once obtained. Releasing (on disconnect) ends any
/// leadership held or pending; the next `bootstrap` reuses the cached
/// reference and re-enters succession with it instead of electing again.
pub struct ElectedBootstrap {
    election: Election,
    cached: Mutex<Option<BootstrapRef>>,
    lifetime: Mutex<Option<CancellationToken>>,
}

impl ElectedBootstrap {
    pub fn new(host: &Host, name: impl Into<String>) -> Self {
        Self {
            election: Election::new(host, name),
            cached: Mutex::new(None),
            lifetime: Mutex::new(None),
        }
    }

    pub fn election(&self) -> &Election {
        &self.election
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn cached(&self) -> Option<BootstrapRef> {
        self.cached.lock().clone()
    }

    /// The token leadership ends with, and whether it was just created.
    fn lifetime(&self, host: &Host) -> (CancellationToken, bool) {
        let mut slot = self.lifetime.lock();
        match &*slot {
            Some(token) if !token.is_cancelled() => (token.clone(), false),
            _ => {
                let token = host.lifetime().child_token();
                *slot = Some(token.clone());
                (token, true)
            }
        }
    }
}

#[async_trait]
impl BootstrapProvider for ElectedBootstrap {
    async fn bootstrap(&self, host: &Host, config: &BootstrapConfig) -> bootstrap::Result<BootstrapRef> {
        let (lifetime, fresh) = self.lifetime(host);

        if let Some(reference) = self.cached() {
            if fresh {
                self.election.succeed(reference.clone(), lifetime);
            }
            return Ok(reference);
        }

        let store = host.origin().store();
        let reference = self.election
            .run(&lifetime, || store.publish(config.clone()))
            .await?;
        *self.cached.lock() = Some(reference.clone());
        Ok(reference)
    }

    fn release(&self) {
        if let Some(token) = self.lifetime.lock().take() {
            token.cancel();
        }
    }
}

impl fmt::Debug for ElectedBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElectedBootstrap")
            .field("election", &self.election)
            .field("cached", &self.cached())
            .finish()
    }
}

async fn wait_for_reference(channel: &mut dyn BroadcastChannel) -> Option<BootstrapRef> {
    loop {
        match channel.recv().await? {
            Value::Str(reference) => return Some(BootstrapRef::from(reference)),
            // other contenders' pings
            _ => continue,
        }
    }
}

/// Answers every message on `channel` with `reference` until `lifetime` ends.
/// The lock is released when `_guard` drops on return.
async fn serve(
    name: String,
    _guard: LockGuard,
    mut channel: Box<dyn BroadcastChannel>,
    reference: BootstrapRef,
    lifetime: CancellationToken,
    leading: Arc<AtomicBool>,
) {
    leading.store(true, Ordering::Release);

    loop {
        tokio::select! {
            _ = lifetime.cancelled() => break,
            msg = channel.recv() => match msg {
                Some(_) => {
                    debug!(%name, "answering ping");
                    if let Err(e) = channel.send(Value::Str(reference.to_string())) {
                        warn!(%name, error = %e, "failed to broadcast reference");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    leading.store(false, Ordering::Release);
    channel.close();
    info!(%name, "leadership released");
}
