//! # Context spawning
//!
//! The instantiation primitive: turn a bootstrap reference into a running
//! context and a primary connection to it.
//!
//! [`ThreadSpawner`] runs each context on its own OS thread with its own
//! single-threaded runtime, so contexts are scheduled independently of each
//! other and of the host. Shared contexts are keyed by `(reference, name)`:
//! asking for one that is already running attaches a new connection to it
//! instead of starting another. A shared context that stopped between the
//! lookup and the attach is replaced by a fresh one.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use isochan::duplex;
use isochan::duplex::Receiver;
use isochan::duplex::Sender;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::BootstrapRef;
use crate::bootstrap::BootstrapStore;
use crate::context::Attachments;
use crate::context::Context;
use crate::fetch::Fetcher;
use crate::message::Connect;
use crate::module::ModuleTable;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("bootstrap reference '{0}' does not resolve")]
    Unresolved(BootstrapRef),
    #[error("no module registered for '{0}'")]
    ModuleNotFound(String),
    #[error("failed to start context thread: {0}")]
    Thread(String),
    #[error("{0} exited before accepting the connection")]
    Exited(ContextId),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Strong type for context identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context-{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextOptions {
    pub name: String,
    pub shared: bool,
}

impl ContextOptions {
    /// A context owned by a single host.
    pub fn dedicated(name: impl Into<String>) -> Self {
        Self { name: name.into(), shared: false }
    }

    /// A context every host of the origin may attach to.
    pub fn shared(name: impl Into<String>) -> Self {
        Self { name: name.into(), shared: true }
    }
}

/// A host's reference to a running context.
#[derive(Clone, Debug)]
pub struct ContextRef {
    id: ContextId,
    name: String,
    shared: bool,
    primary: Sender<Connect>,
    stop: CancellationToken,
}

impl ContextRef {
    pub fn new(
        id: ContextId,
        options: &ContextOptions,
        primary: Sender<Connect>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            id,
            name: options.name.clone(),
            shared: options.shared,
            primary,
            stop,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// The side used to hand the context its control channel.
    pub fn primary(&self) -> &Sender<Connect> {
        &self.primary
    }

    /// Stops a dedicated context. Shared contexts outlive any single host
    /// and stop on their own once the last host detaches.
    pub fn terminate(&self) {
        if !self.shared {
            self.stop.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }
}

/// Starts contexts from bootstrap references.
///
/// This trait is designed to be object-safe (`Arc<dyn ContextSpawner>`).
#[async_trait]
pub trait ContextSpawner: Send + Sync + 'static {
    async fn create(&self, reference: &BootstrapRef, options: &ContextOptions) -> Result<ContextRef>;
}

#[derive(Clone)]
struct Running {
    id: ContextId,
    connections: Sender<Receiver<Connect>>,
    attachments: Attachments,
}

impl Running {
    /// Opens a primary connection, or `None` if the context has stopped.
    fn connect(&self) -> Option<Sender<Connect>> {
        if !self.attachments.attach() {
            return None;
        }
        let (primary, connection) = duplex::channel();
        if self.connections.send(connection).is_err() {
            self.attachments.detach();
            return None;
        }
        Some(primary)
    }
}

/// Runs every context on a dedicated thread.
pub struct ThreadSpawner {
    store: Arc<BootstrapStore>,
    modules: ModuleTable,
    native: Option<Arc<dyn Fetcher>>,
    shared: DashMap<(BootstrapRef, String), Running>,
    next_id: AtomicU64,
}

impl ThreadSpawner {
    pub fn new(store: Arc<BootstrapStore>, modules: ModuleTable) -> Self {
        Self {
            store,
            modules,
            native: None,
            shared: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Gives contexts direct network access. Without one, every fetch a
    /// context makes is proxied through its hosts.
    pub fn with_native_fetcher(mut self, fetcher: impl Fetcher) -> Self {
        self.native = Some(Arc::new(fetcher));
        self
    }

    fn launch(&self, reference: &BootstrapRef, options: &ContextOptions) -> Result<Running> {
        let config = self.store
            .resolve(reference)
            .ok_or_else(|| Error::Unresolved(reference.clone()))?;
        let module = self.modules
            .resolve(&config)
            .ok_or_else(|| Error::ModuleNotFound(config.entry_uri().to_string()))?;

        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let attachments = Attachments::new(CancellationToken::new());
        let (connections, accept) = duplex::channel();
        let context = Arc::new(Context::new(
            id,
            options.name.clone(),
            config,
            module,
            self.native.clone(),
            attachments.clone(),
        ));
        let stop = attachments.stop().clone();

        std::thread::Builder::new()
            .name(format!("isohelper-{}", id))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(context = %id, error = %e, "failed to build context runtime");
                        stop.cancel();
                        return;
                    }
                };
                runtime.block_on(context.run(accept));
            })
            .map_err(|e| Error::Thread(e.to_string()))?;

        tracing::debug!(context = %id, name = %options.name, shared = options.shared, "spawned context");
        Ok(Running { id, connections, attachments })
    }

    /// Launches a context and opens its first connection.
    fn start(&self, reference: &BootstrapRef, options: &ContextOptions) -> Result<(Running, Sender<Connect>)> {
        let running = self.launch(reference, options)?;
        let primary = running.connect().ok_or(Error::Exited(running.id))?;
        Ok((running, primary))
    }

    fn connect(&self, reference: &BootstrapRef, options: &ContextOptions) -> Result<(Running, Sender<Connect>)> {
        if !options.shared {
            return self.start(reference, options);
        }

        match self.shared.entry((reference.clone(), options.name.clone())) {
            Entry::Occupied(mut occupied) => {
                if let Some(primary) = occupied.get().connect() {
                    return Ok((occupied.get().clone(), primary));
                }
                tracing::debug!(context = %occupied.get().id, name = %options.name, "shared context stopped, replacing it");
                let (running, primary) = self.start(reference, options)?;
                occupied.insert(running.clone());
                Ok((running, primary))
            }
            Entry::Vacant(vacant) => {
                let (running, primary) = self.start(reference, options)?;
                vacant.insert(running.clone());
                Ok((running, primary))
            }
        }
    }
}

#[async_trait]
impl ContextSpawner for ThreadSpawner {
    async fn create(&self, reference: &BootstrapRef, options: &ContextOptions) -> Result<ContextRef> {
        let (running, primary) = self.connect(reference, options)?;
        let stop = running.attachments.stop().clone();
        Ok(ContextRef::new(running.id, options, primary, stop))
    }
}
