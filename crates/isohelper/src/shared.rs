//! # Shared-context coordinator
//!
//! A [`WorkerHelper`] whose context is shared by every host of the origin.
//! Only the host elected for the resource name publishes the bootstrap
//! config; the others receive its reference over the broadcast channel and
//! attach to the same running context.

use std::fmt;
use std::sync::Arc;

use isochan::Value;

use crate::bootstrap::BootstrapConfig;
use crate::bootstrap::BootstrapRef;
use crate::election::ElectedBootstrap;
use crate::helper::ContextHandle;
use crate::helper::HelperState;
use crate::helper::MethodCall;
use crate::helper::Result;
use crate::helper::WorkerHelper;
use crate::host::Host;
use crate::spawn::ContextOptions;

#[derive(Clone)]
pub struct SharedWorkerHelper {
    helper: WorkerHelper,
    bootstrap: Arc<ElectedBootstrap>,
}

impl SharedWorkerHelper {
    /// `name` is both the shared context's name and the election's resource name.
    pub fn new(host: Host, config: BootstrapConfig, name: impl Into<String>) -> Self {
        let name = name.into();
        let bootstrap = Arc::new(ElectedBootstrap::new(&host, name.clone()));
        let helper = WorkerHelper::with_provider(
            host,
            config,
            ContextOptions::shared(name),
            bootstrap.clone(),
        );
        Self { helper, bootstrap }
    }

    pub fn name(&self) -> &str {
        self.helper.name()
    }

    pub fn state(&self) -> HelperState {
        self.helper.state()
    }

    pub fn handle(&self) -> Result<Arc<ContextHandle>> {
        self.helper.handle()
    }

    /// True while this host answers other hosts' requests for the reference.
    pub fn is_leader(&self) -> bool {
        self.bootstrap.is_leader()
    }

    /// The reference obtained by the last successful election, if any.
    pub fn reference(&self) -> Option<BootstrapRef> {
        self.bootstrap.cached()
    }

    pub async fn init(&self) -> Result<()> {
        self.helper.init().await
    }

    pub async fn call_method(&self, call: MethodCall) -> Result<Value> {
        self.helper.call_method(call).await
    }

    /// Detaches from the shared context and gives up any leadership.
    pub fn disconnect(&self) {
        self.helper.disconnect();
    }
}

impl fmt::Debug for SharedWorkerHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWorkerHelper")
            .field("helper", &self.helper)
            .field("leader", &self.is_leader())
            .finish()
    }
}
