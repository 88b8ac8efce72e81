//! # Modules
//!
//! The code a context runs. A bootstrap config names an entry URI; the
//! [`ModuleTable`] maps that URI to a [`Module`] implementation, which
//! receives every `Invoke` the context is sent.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use isochan::Value;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::BootstrapConfig;
use crate::context::Network;
use crate::fetch::FetchOptions;
use crate::fetch::ProxyResponse;

/// One method call as seen from inside the context.
#[derive(Debug)]
pub struct Invocation {
    pub method: String,
    pub args: Vec<Value>,
    /// Buffers moved into the context alongside the arguments.
    pub transfer: Vec<Vec<u8>>,
    pub cx: CallContext,
}

/// Per-call facilities available to a method implementation.
#[derive(Clone)]
pub struct CallContext {
    cancel: CancellationToken,
    network: Arc<Network>,
}

impl CallContext {
    pub(crate) fn new(cancel: CancellationToken, network: Arc<Network>) -> Self {
        Self { cancel, network }
    }

    /// A context with no host attached: never cancelled, every fetch fails.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), Arc::new(Network::new("detached", None)))
    }

    /// True once the caller has cancelled this call.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the caller cancels this call.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The context's network primitive: direct access when available,
    /// otherwise proxied through the connected hosts.
    pub async fn fetch(&self, uri: &str, options: FetchOptions) -> ProxyResponse {
        self.network.fetch(uri, options).await
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Code a context runs.
///
/// The error value is handed to the caller verbatim.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    async fn call(&self, invocation: Invocation) -> Result<Value, Value>;
}

type Handler = Arc<dyn Fn(Invocation) -> BoxFuture<'static, Result<Value, Value>> + Send + Sync>;

/// A module built from named async closures.
#[derive(Clone, Default)]
pub struct Methods {
    handlers: HashMap<String, Handler>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |invocation: Invocation| -> BoxFuture<'static, Result<Value, Value>> {
                handler(invocation).boxed()
            },
        );
        self.handlers.insert(name.into(), handler);
        self
    }
}

impl fmt::Debug for Methods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

#[async_trait]
impl Module for Methods {
    async fn call(&self, invocation: Invocation) -> Result<Value, Value> {
        let Some(handler) = self.handlers.get(&invocation.method).cloned() else {
            return Err(method_not_found(&invocation.method));
        };
        handler(invocation).await
    }
}

/// The error value reported for a method the module does not define.
pub fn method_not_found(method: &str) -> Value {
    Value::map([
        ("name", Value::from("MethodNotFound")),
        ("message", Value::from(format!("method '{}' not found", method))),
    ])
}

/// URI → module, consulted by the bootstrap program.
#[derive(Clone, Default)]
pub struct ModuleTable {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, uri: impl Into<String>, module: impl Module) -> Self {
        self.register(uri, module);
        self
    }

    pub fn register(&mut self, uri: impl Into<String>, module: impl Module) {
        self.modules.insert(uri.into(), Arc::new(module));
    }

    pub fn get(&self, uri: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(uri).cloned()
    }

    /// The module a bootstrap config starts.
    pub fn resolve(&self, config: &BootstrapConfig) -> Option<Arc<dyn Module>> {
        self.get(config.entry_uri())
    }
}

impl fmt::Debug for ModuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.modules.keys()).finish()
    }
}
