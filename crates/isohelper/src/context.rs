//! # Context runtime
//!
//! The static bootstrap program every context runs. It never touches host
//! memory: it learns about hosts only through the `Connect` messages arriving
//! on its primary connections, and talks back only through the control
//! endpoint each `Connect` carries.
//!
//! Per connection the program:
//!
//! 1. answers `Connect` with `Connected` (the startup handshake),
//! 2. serves every `Invoke` in its own task, forwarding `CallSignal::Cancel`
//!    into the call's cancellation token,
//! 3. routes `FetchResponse`s to the fetch waiting on that id,
//! 4. detaches on `Disconnect` or when the control channel closes.
//!
//! The context stops when its last host detaches or when it is terminated.
//! Attaching and detaching agree through [`Attachments`]: a connection is
//! either counted before the last detach (and keeps the context alive) or
//! refused because the context has already stopped.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use futures::FutureExt;
use isochan::Endpoint;
use isochan::Value;
use isochan::duplex::Receiver;
use isochan::duplex::Sender;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::bootstrap::BootstrapConfig;
use crate::fetch::FetchOptions;
use crate::fetch::Fetcher;
use crate::fetch::ProxyResponse;
use crate::message::CallSignal;
use crate::message::Connect;
use crate::message::ContextMessage;
use crate::message::HostMessage;
use crate::message::ProxyRequest;
use crate::message::Reply;
use crate::module::CallContext;
use crate::module::Invocation;
use crate::module::Module;
use crate::spawn::ContextId;

/// Live host connections of one context.
///
/// The count covers connections from the moment the spawner hands them out
/// until their `serve` task ends. Reaching zero stops the context; once
/// stopped, no connection is accepted.
#[derive(Clone, Debug)]
pub(crate) struct Attachments {
    count: Arc<Mutex<usize>>,
    stop: CancellationToken,
}

impl Attachments {
    pub(crate) fn new(stop: CancellationToken) -> Self {
        Self {
            count: Arc::new(Mutex::new(0)),
            stop,
        }
    }

    pub(crate) fn stop(&self) -> &CancellationToken {
        &self.stop
    }

    /// Counts one more connection. False once the context has stopped.
    pub(crate) fn attach(&self) -> bool {
        let mut count = self.count.lock();
        if self.stop.is_cancelled() {
            return false;
        }
        *count += 1;
        true
    }

    /// Releases one connection and returns how many remain. The last one
    /// stops the context.
    pub(crate) fn detach(&self) -> usize {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.stop.cancel();
        }
        *count
    }
}

/// The context's network primitive.
///
/// Tries the native fetcher first. On failure the request is queued under an
/// auto-incrementing id and forwarded to every connected host; the first
/// response for that id wins and later ones are dropped.
pub(crate) struct Network {
    context: String,
    native: Option<Arc<dyn Fetcher>>,
    hosts: DashMap<u64, Sender<ContextMessage>>,
    pending: DashMap<u64, oneshot::Sender<ProxyResponse>>,
    next_fetch: AtomicU64,
}

impl Network {
    pub(crate) fn new(context: impl Into<String>, native: Option<Arc<dyn Fetcher>>) -> Self {
        Self {
            context: context.into(),
            native,
            hosts: DashMap::new(),
            pending: DashMap::new(),
            next_fetch: AtomicU64::new(1),
        }
    }

    fn attach(&self, connection: u64, host: Sender<ContextMessage>) {
        self.hosts.insert(connection, host);
    }

    fn detach(&self, connection: u64) {
        self.hosts.remove(&connection);
        if self.hosts.is_empty() {
            // nobody is left to answer; waiting fetches resolve as failed
            self.pending.clear();
        }
    }

    fn settle(&self, id: u64, response: ProxyResponse) {
        match self.pending.remove(&id) {
            Some((_, waiter)) => {
                let _ = waiter.send(response);
            }
            None => debug!(context = %self.context, id, "ignoring duplicate proxy response"),
        }
    }

    pub(crate) async fn fetch(&self, uri: &str, options: FetchOptions) -> ProxyResponse {
        if let Some(native) = &self.native {
            match native.fetch(uri, options.clone()).await {
                Ok(response) => return response,
                Err(e) => {
                    debug!(context = %self.context, %uri, error = %e, "direct fetch failed, proxying through host")
                }
            }
        }

        let id = self.next_fetch.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let request = ProxyRequest { id, uri: uri.to_string(), options };
        let delivered = self.hosts
            .iter()
            .filter(|host| host.value().send(ContextMessage::Fetch(request.clone())).is_ok())
            .count();

        if delivered == 0 {
            self.pending.remove(&id);
            warn!(context = %self.context, %uri, "no host available to proxy fetch");
            return ProxyResponse::failed();
        }

        rx.await.unwrap_or_else(|_| ProxyResponse::failed())
    }
}

/// One running context.
pub(crate) struct Context {
    id: ContextId,
    name: String,
    config: Arc<BootstrapConfig>,
    module: Arc<dyn Module>,
    network: Arc<Network>,
    next_connection: AtomicU64,
    attachments: Attachments,
}

impl Context {
    pub(crate) fn new(
        id: ContextId,
        name: impl Into<String>,
        config: Arc<BootstrapConfig>,
        module: Arc<dyn Module>,
        native: Option<Arc<dyn Fetcher>>,
        attachments: Attachments,
    ) -> Self {
        let name = name.into();
        Self {
            id,
            network: Arc::new(Network::new(name.clone(), native)),
            name,
            config,
            module,
            next_connection: AtomicU64::new(1),
            attachments,
        }
    }

    /// Accepts primary connections until stopped.
    pub(crate) async fn run(self: Arc<Self>, mut connections: Receiver<Receiver<Connect>>) {
        info!(context = %self.id, name = %self.name, entry = %self.config.entry_uri(), "context started");

        let stop = self.attachments.stop().clone();
        let mut accepting = true;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                primary = connections.recv(), if accepting => match primary {
                    Some(primary) => {
                        tokio::spawn(self.clone().serve(primary));
                    }
                    // no further hosts can arrive; live ones keep the context running
                    None => accepting = false,
                },
            }
        }

        info!(context = %self.id, name = %self.name, "context stopped");
    }

    async fn serve(self: Arc<Self>, mut primary: Receiver<Connect>) {
        let Some(Connect { control }) = primary.recv().await else {
            self.attachments.detach();
            return;
        };

        let (host, mut inbox) = control.split();
        if host.send(ContextMessage::Connected).is_err() {
            self.attachments.detach();
            return;
        }

        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.network.attach(connection, host);
        debug!(context = %self.id, channel = %self.config.control_channel, connection, "host connected");

        while let Some(msg) = inbox.recv().await {
            match msg {
                HostMessage::Invoke { method, args, transfer, reply } => {
                    tokio::spawn(self.clone().invoke(method, args, transfer, reply));
                }
                HostMessage::FetchResponse { id, response } => self.network.settle(id, response),
                HostMessage::Disconnect => break,
            }
        }

        self.network.detach(connection);
        let remaining = self.attachments.detach();
        debug!(context = %self.id, connection, remaining, "host detached");
    }

    async fn invoke(
        self: Arc<Self>,
        method: String,
        args: Vec<Value>,
        transfer: Vec<Vec<u8>>,
        reply: Endpoint<Reply, CallSignal>,
    ) {
        let (caller, mut signals) = reply.split();
        let cancel = CancellationToken::new();

        let watcher = {
            let cancel = cancel.clone();
            // a dropped caller counts as a cancellation
            tokio::spawn(async move {
                match signals.recv().await {
                    Some(CallSignal::Cancel) | None => cancel.cancel(),
                }
            })
        };

        let invocation = Invocation {
            method: method.clone(),
            args,
            transfer,
            cx: CallContext::new(cancel, self.network.clone()),
        };

        debug!(context = %self.id, %method, "invoke");
        let outcome = AssertUnwindSafe(self.module.call(invocation))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                warn!(context = %self.id, %method, "method panicked");
                Err(Value::map([
                    ("name", Value::from("Panic")),
                    ("message", Value::from(format!("method '{}' panicked", method))),
                ]))
            });
        watcher.abort();

        let reply = match outcome {
            Ok(value) => Reply::Ok(value),
            Err(error) => Reply::Err(error),
        };
        if caller.send(reply).is_err() {
            debug!(context = %self.id, %method, "caller went away before the reply");
        }
    }
}
