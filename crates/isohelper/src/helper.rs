//! # Single-context coordinator
//!
//! [`WorkerHelper`] owns one context for one host.
//!
//! ## Lifecycle
//!
//! `Uninitialized → Initializing → Ready → Disconnected`, and from
//! `Disconnected` back to `Initializing` on the next `init`.
//!
//! - `init` is memoised: concurrent callers share one in-flight startup and
//!   observe the same outcome and the same [`ContextHandle`].
//! - Startup asks the [`BootstrapProvider`] for a reference, spawns the
//!   context, sends it `Connect` with one end of a fresh control channel,
//!   waits for `Connected`, and installs the handler that serves the
//!   context's proxied fetches.
//! - The handle is never observable before startup completes: accessors fail
//!   with [`Error::NotInitialized`].
//!
//! ## RPC
//!
//! Each call opens its own duplex channel, sends `Invoke` with one end over
//! the control channel, and waits for exactly one `Reply`. Cancellation
//! wins over a reply that has not been received yet; the remote side is told
//! and any late reply is dropped with the channel.

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use isochan::Value;
use isochan::duplex;
use isochan::duplex::Sender;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::bootstrap;
use crate::bootstrap::BootstrapConfig;
use crate::bootstrap::BootstrapProvider;
use crate::bootstrap::BootstrapRef;
use crate::bootstrap::LocalBootstrap;
use crate::host::Host;
use crate::message::CallSignal;
use crate::message::Connect;
use crate::message::ContextMessage;
use crate::message::HostMessage;
use crate::message::Reply;
use crate::proxy;
use crate::spawn;
use crate::spawn::ContextId;
use crate::spawn::ContextOptions;
use crate::spawn::ContextRef;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The context is not ready; `init` has not completed.
    #[error("worker helper is not initialized; call init() first")]
    NotInitialized,
    /// The request could not be handed to the context.
    #[error("failed to dispatch call to the context")]
    Dispatch,
    /// The context ran the method and reported this error value.
    #[error("remote call failed: {0}")]
    Remote(Value),
    /// The call was cancelled before a reply arrived.
    #[error("call was cancelled")]
    Cancelled,
    /// The context went away before replying.
    #[error("context disconnected before replying")]
    Disconnected,
    /// The host this helper belongs to has terminated.
    #[error("host has terminated")]
    HostTerminated,
    /// The context did not acknowledge `Connect` in time.
    #[error("{0} did not complete the startup handshake")]
    Handshake(ContextId),
    #[error(transparent)]
    Bootstrap(#[from] bootstrap::Error),
    #[error(transparent)]
    Spawn(#[from] spawn::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelperState {
    Uninitialized,
    Initializing,
    Ready,
    Disconnected,
}

/// A method call request.
#[derive(Debug, Default)]
pub struct MethodCall {
    pub method: String,
    pub args: Vec<Value>,
    /// Buffers moved into the context without copying.
    pub transfer: Vec<Vec<u8>>,
    pub cancel: Option<CancellationToken>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into(), ..Self::default() }
    }

    pub fn arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn transfer(mut self, buffer: Vec<u8>) -> Self {
        self.transfer.push(buffer);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// A ready context: its reference, the context itself, and the control channel.
///
/// Immutable once created; shared by every caller through an `Arc`.
pub struct ContextHandle {
    reference: BootstrapRef,
    context: ContextRef,
    control: Sender<HostMessage>,
    pump: JoinHandle<()>,
}

impl ContextHandle {
    async fn open(inner: &Inner) -> Result<Self> {
        let reference = inner.provider.bootstrap(&inner.host, &inner.config).await?;
        let context = inner.host.origin().spawner().create(&reference, &inner.options).await?;

        let (local, remote) = duplex::duplex::<HostMessage, ContextMessage>();
        if context.primary().send(Connect { control: remote }).is_err() {
            context.terminate();
            return Err(Error::Handshake(context.id()));
        }

        let (control, mut events) = local.split();
        let handshake = tokio::time::timeout(inner.host.config().handshake_timeout, events.recv()).await;
        if !matches!(handshake, Ok(Some(ContextMessage::Connected))) {
            warn!(context = %context.id(), name = %context.name(), "startup handshake failed");
            context.terminate();
            return Err(Error::Handshake(context.id()));
        }

        let pump = {
            let host = inner.host.clone();
            let control = control.clone();
            let id = context.id();
            let name = context.name().to_string();
            events.on_message(move |msg| match msg {
                ContextMessage::Fetch(request) => {
                    tokio::spawn(proxy::serve(host.clone(), id, name.clone(), request, control.clone()));
                }
                ContextMessage::Connected => debug!(context = %id, "ignoring repeated handshake"),
            })
        };

        info!(context = %context.id(), name = %context.name(), %reference, "context ready");
        Ok(Self { reference, context, control, pump })
    }

    pub fn reference(&self) -> &BootstrapRef {
        &self.reference
    }

    pub fn context(&self) -> &ContextRef {
        &self.context
    }

    /// False once the context has stopped listening on the control channel.
    pub fn is_connected(&self) -> bool {
        !self.control.is_closed()
    }

    async fn call(&self, call: MethodCall) -> Result<Value> {
        let MethodCall { method, args, transfer, cancel } = call;
        let cancel = cancel.unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (local, remote) = duplex::duplex::<CallSignal, Reply>();
        let (signals, mut replies) = local.split();

        let invoke = HostMessage::Invoke { method: method.clone(), args, transfer, reply: remote };
        if let Err(e) = self.control.send(invoke) {
            error!(context = %self.context.id(), %method, error = %e, "failed to dispatch call");
            return Err(Error::Dispatch);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(context = %self.context.id(), %method, "call cancelled");
                let _ = signals.send(CallSignal::Cancel);
                Err(Error::Cancelled)
            }
            reply = replies.recv() => match reply {
                Some(Reply::Ok(value)) => Ok(value),
                Some(Reply::Err(error)) => Err(Error::Remote(error)),
                None => Err(Error::Disconnected),
            },
        }
    }

    fn close(&self) {
        let _ = self.control.send(HostMessage::Disconnect);
        self.pump.abort();
        self.context.terminate();
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("reference", &self.reference)
            .field("context", &self.context.id())
            .field("connected", &self.is_connected())
            .finish()
    }
}

type PendingInit = Shared<BoxFuture<'static, Result<Arc<ContextHandle>>>>;

enum Slot {
    Uninitialized,
    Initializing { generation: u64, pending: PendingInit },
    Ready(Arc<ContextHandle>),
    Disconnected,
}

struct Inner {
    host: Host,
    config: BootstrapConfig,
    options: ContextOptions,
    provider: Arc<dyn BootstrapProvider>,
    slot: Mutex<Slot>,
    generation: AtomicU64,
    teardown_registered: AtomicBool,
}

/// Owns one context and talks to it.
#[derive(Clone)]
pub struct WorkerHelper {
    inner: Arc<Inner>,
}

impl WorkerHelper {
    /// A helper for a dedicated context started from `config`.
    pub fn new(host: Host, config: BootstrapConfig, name: impl Into<String>) -> Self {
        Self::with_provider(
            host,
            config,
            ContextOptions::dedicated(name),
            Arc::new(LocalBootstrap::new()),
        )
    }

    /// A helper whose bootstrap reference comes from `provider`.
    pub fn with_provider(
        host: Host,
        config: BootstrapConfig,
        options: ContextOptions,
        provider: Arc<dyn BootstrapProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                host,
                config,
                options,
                provider,
                slot: Mutex::new(Slot::Uninitialized),
                generation: AtomicU64::new(0),
                teardown_registered: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    pub fn state(&self) -> HelperState {
        match &*self.inner.slot.lock() {
            Slot::Uninitialized => HelperState::Uninitialized,
            Slot::Initializing { .. } => HelperState::Initializing,
            Slot::Ready(_) => HelperState::Ready,
            Slot::Disconnected => HelperState::Disconnected,
        }
    }

    /// The ready context, or [`Error::NotInitialized`].
    pub fn handle(&self) -> Result<Arc<ContextHandle>> {
        match &*self.inner.slot.lock() {
            Slot::Ready(handle) => Ok(handle.clone()),
            _ => Err(Error::NotInitialized),
        }
    }

    /// Starts the context, or joins the startup already in flight.
    pub async fn init(&self) -> Result<()> {
        if self.inner.host.is_terminated() {
            return Err(Error::HostTerminated);
        }
        self.register_teardown();

        let pending = {
            let mut slot = self.inner.slot.lock();
            let in_flight = match &*slot {
                Slot::Ready(_) => return Ok(()),
                Slot::Initializing { pending, .. } => Some(pending.clone()),
                Slot::Uninitialized | Slot::Disconnected => None,
            };
            match in_flight {
                Some(pending) => pending,
                None => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    let pending = Self::start(Arc::downgrade(&self.inner), generation);
                    *slot = Slot::Initializing { generation, pending: pending.clone() };
                    pending
                }
            }
        };

        pending.await.map(|_| ())
    }

    fn start(inner: Weak<Inner>, generation: u64) -> PendingInit {
        async move {
            let inner = inner.upgrade().ok_or(Error::Disconnected)?;
            let outcome = ContextHandle::open(&inner).await.map(Arc::new);

            let mut slot = inner.slot.lock();
            let current = matches!(&*slot, Slot::Initializing { generation: g, .. } if *g == generation);
            match outcome {
                Ok(handle) if current => {
                    *slot = Slot::Ready(handle.clone());
                    Ok(handle)
                }
                Ok(handle) => {
                    // disconnected while starting up
                    handle.close();
                    Err(Error::Disconnected)
                }
                Err(e) => {
                    if current {
                        *slot = Slot::Uninitialized;
                    }
                    warn!(name = %inner.options.name, error = %e, "context startup failed");
                    Err(e)
                }
            }
        }
        .boxed()
        .shared()
    }

    fn register_teardown(&self) {
        if self.inner.teardown_registered.swap(true, Ordering::AcqRel) {
            return;
        }

        let lifetime = self.inner.host.lifetime().clone();
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            lifetime.cancelled().await;
            if let Some(inner) = inner.upgrade() {
                WorkerHelper { inner }.disconnect();
            }
        });
    }

    /// Runs `method` in the context and returns its result.
    pub async fn call_method(&self, call: MethodCall) -> Result<Value> {
        let handle = self.handle()?;
        handle.call(call).await
    }

    /// Tears the context down. Idempotent; `init` may be called again afterwards.
    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.inner.slot.lock(), Slot::Disconnected);
        match previous {
            Slot::Ready(handle) => {
                info!(context = %handle.context().id(), name = %self.name(), "disconnecting");
                handle.close();
            }
            Slot::Initializing { .. } => debug!(name = %self.name(), "disconnect abandoned startup"),
            Slot::Uninitialized | Slot::Disconnected => {}
        }
        self.inner.provider.release();
    }
}

impl fmt::Debug for WorkerHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHelper")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
