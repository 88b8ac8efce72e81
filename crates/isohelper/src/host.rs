//! # Hosts and origins
//!
//! An [`Origin`] is what independent host processes of one application have
//! in common: the lock service, the broadcast channels, the bootstrap store
//! and the context spawner. A [`Host`] is one such process. Its lifetime is an
//! explicit cancellation token; everything that must end with the host
//! (teardown of its coordinators, leadership it holds) waits on that token.

use std::fmt;
use std::sync::Arc;

use isochan::LocalLocks;
use isochan::LocalPubSub;
use isochan::LockService;
use isochan::PubSub;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::BootstrapStore;
use crate::config::Config;
use crate::fetch::Fetcher;
use crate::fetch::HttpFetcher;
use crate::module::ModuleTable;
use crate::spawn::ContextSpawner;
use crate::spawn::ThreadSpawner;

/// The capabilities shared by every host of one application.
#[derive(Clone)]
pub struct Origin {
    locks: Arc<dyn LockService>,
    pubsub: Arc<dyn PubSub>,
    store: Arc<BootstrapStore>,
    spawner: Arc<dyn ContextSpawner>,
}

impl Origin {
    pub fn new(
        locks: Arc<dyn LockService>,
        pubsub: Arc<dyn PubSub>,
        store: Arc<BootstrapStore>,
        spawner: Arc<dyn ContextSpawner>,
    ) -> Self {
        Self { locks, pubsub, store, spawner }
    }

    /// In-process locks and broadcast channels, contexts on threads running
    /// the given modules.
    pub fn local(modules: ModuleTable) -> Self {
        let store = Arc::new(BootstrapStore::new());
        let spawner = ThreadSpawner::new(store.clone(), modules);
        Self::new(
            Arc::new(LocalLocks::new()),
            Arc::new(LocalPubSub::new()),
            store,
            Arc::new(spawner),
        )
    }

    pub fn locks(&self) -> &Arc<dyn LockService> {
        &self.locks
    }

    pub fn pubsub(&self) -> &Arc<dyn PubSub> {
        &self.pubsub
    }

    pub fn store(&self) -> &Arc<BootstrapStore> {
        &self.store
    }

    pub fn spawner(&self) -> &Arc<dyn ContextSpawner> {
        &self.spawner
    }
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Origin")
            .field("published", &self.store.len())
            .finish_non_exhaustive()
    }
}

/// One host process.
#[derive(Clone)]
pub struct Host {
    origin: Origin,
    fetcher: Arc<dyn Fetcher>,
    config: Config,
    lifetime: CancellationToken,
}

impl Host {
    pub fn new(origin: Origin) -> Self {
        Self::builder(origin).build()
    }

    pub fn builder(origin: Origin) -> HostBuilder {
        HostBuilder {
            origin,
            fetcher: None,
            config: Config::default(),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// The fetcher used to serve proxied requests.
    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancelled when the host terminates.
    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    pub fn is_terminated(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// Ends the host: coordinators disconnect, held leadership is released.
    pub fn terminate(&self) {
        if !self.lifetime.is_cancelled() {
            tracing::info!("host terminating");
            self.lifetime.cancel();
        }
    }

    /// Terminates the host when the process receives Ctrl-C.
    pub fn terminate_on_ctrl_c(&self) {
        let host = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = host.lifetime.cancelled() => {}
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        tracing::warn!(error = %e, "failed to listen for ctrl-c");
                        return;
                    }
                    host.terminate();
                }
            }
        });
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("config", &self.config)
            .field("terminated", &self.lifetime.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Fluent builder for hosts.
pub struct HostBuilder {
    origin: Origin,
    fetcher: Option<Arc<dyn Fetcher>>,
    config: Config,
}

impl HostBuilder {
    pub fn fetcher(mut self, fetcher: impl Fetcher) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Host {
        Host {
            origin: self.origin,
            fetcher: self.fetcher.unwrap_or_else(|| Arc::new(HttpFetcher::new())),
            config: self.config,
            lifetime: CancellationToken::new(),
        }
    }
}
