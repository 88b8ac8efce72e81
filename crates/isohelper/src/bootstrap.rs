//! # Bootstrap resources
//!
//! A context starts from a [`BootstrapConfig`]: the URI of its entry module,
//! the label of its control channel and a module-resolution table. Configs are
//! published once into the origin's [`BootstrapStore`], which hands back an
//! opaque, reusable [`BootstrapRef`]. A small static program inside the
//! context resolves the reference and runs the entry module.
//!
//! ## Invariants
//!
//! - A reference is never mutated; publishing always yields a fresh one.
//! - A provider generates at most one reference and reuses it afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::election;
use crate::host::Host;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Election(#[from] election::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const DEFAULT_CONTROL_CHANNEL: &str = "isohelper-control";

/// Opaque locator of a published bootstrap config.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BootstrapRef(String);

impl BootstrapRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn generate() -> Self {
        Self(format!("bootstrap:{:032x}", rand::random::<u128>()))
    }
}

impl fmt::Display for BootstrapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for BootstrapRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What the static bootstrap program reads at context startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapConfig {
    /// URI (or import specifier) of the module the context runs.
    pub entry: String,
    /// Label of the control channel, used in diagnostics.
    pub control_channel: String,
    /// Specifier → URI.
    pub imports: BTreeMap<String, String>,
}

impl BootstrapConfig {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            control_channel: DEFAULT_CONTROL_CHANNEL.into(),
            imports: BTreeMap::new(),
        }
    }

    pub fn control_channel(mut self, name: impl Into<String>) -> Self {
        self.control_channel = name.into();
        self
    }

    pub fn import(mut self, specifier: impl Into<String>, uri: impl Into<String>) -> Self {
        self.imports.insert(specifier.into(), uri.into());
        self
    }

    /// The URI the entry specifier resolves to.
    pub fn entry_uri(&self) -> &str {
        self.imports.get(&self.entry).map(String::as_str).unwrap_or(&self.entry)
    }
}

/// Published bootstrap configs, shared by every host of an origin.
#[derive(Debug, Default)]
pub struct BootstrapStore {
    entries: DashMap<BootstrapRef, Arc<BootstrapConfig>>,
}

impl BootstrapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, config: BootstrapConfig) -> BootstrapRef {
        let reference = BootstrapRef::generate();
        self.entries.insert(reference.clone(), Arc::new(config));
        tracing::debug!(%reference, "published bootstrap config");
        reference
    }

    pub fn resolve(&self, reference: &BootstrapRef) -> Option<Arc<BootstrapConfig>> {
        self.entries.get(reference).map(|entry| entry.value().clone())
    }

    pub fn revoke(&self, reference: &BootstrapRef) -> bool {
        self.entries.remove(reference).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Produces the reference a helper starts its context from.
///
/// `WorkerHelper` calls this as the first step of `init`; overriding it is
/// how the shared helper swaps in leader election.
#[async_trait]
pub trait BootstrapProvider: Send + Sync + 'static {
    async fn bootstrap(&self, host: &Host, config: &BootstrapConfig) -> Result<BootstrapRef>;

    /// Called when the owning helper disconnects.
    fn release(&self) {}
}

/// Publishes the config on first use and reuses the reference afterwards.
/// The config is revoked from the store when the provider is dropped.
#[derive(Default)]
pub struct LocalBootstrap {
    cached: Mutex<Option<(Arc<BootstrapStore>, BootstrapRef)>>,
}

impl LocalBootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The reference published so far, if any.
    pub fn reference(&self) -> Option<BootstrapRef> {
        self.cached.lock().as_ref().map(|(_, reference)| reference.clone())
    }
}

#[async_trait]
impl BootstrapProvider for LocalBootstrap {
    async fn bootstrap(&self, host: &Host, config: &BootstrapConfig) -> Result<BootstrapRef> {
        let mut cached = self.cached.lock();
        let (_, reference) = cached.get_or_insert_with(|| {
            let store = host.origin().store().clone();
            let reference = store.publish(config.clone());
            (store, reference)
        });
        Ok(reference.clone())
    }
}

impl Drop for LocalBootstrap {
    fn drop(&mut self) {
        if let Some((store, reference)) = self.cached.get_mut().take() {
            store.revoke(&reference);
            tracing::debug!(%reference, "revoked bootstrap config");
        }
    }
}

impl fmt::Debug for LocalBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBootstrap")
            .field("reference", &self.reference())
            .finish()
    }
}
