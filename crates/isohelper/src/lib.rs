//! # isohelper
//!
//! Host-side coordination for isolated execution contexts.
//!
//! - [`WorkerHelper`] owns one context: lazy memoised startup, the
//!   invoke/reply RPC protocol with cancellation, and the network proxy the
//!   context falls back on when it cannot reach the network itself.
//! - [`WorkerHelperPool`] spreads calls over N helpers, least-loaded first.
//! - [`SharedWorkerHelper`] lets several hosts share one context: a leader
//!   election decides which host generates the bootstrap reference, and a
//!   successor takes over answering when the leader's host goes away.
//!
//! Hosts reach everything ambient (locks, broadcast channels, bootstrap
//! store, context spawner) through an explicitly injected [`Origin`].

pub mod bootstrap;
pub mod config;
mod context;
pub mod election;
pub mod fetch;
pub mod helper;
pub mod host;
pub mod message;
pub mod module;
pub mod pool;
pub mod proxy;
pub mod shared;
pub mod spawn;

pub use bootstrap::BootstrapConfig;
pub use bootstrap::BootstrapProvider;
pub use bootstrap::BootstrapRef;
pub use bootstrap::BootstrapStore;
pub use config::Config;
pub use election::ElectedBootstrap;
pub use election::Election;
pub use fetch::FetchOptions;
pub use fetch::Fetcher;
pub use fetch::HttpFetcher;
pub use fetch::ProxyResponse;
pub use helper::ContextHandle;
pub use helper::HelperState;
pub use helper::MethodCall;
pub use helper::WorkerHelper;
pub use host::Host;
pub use host::HostBuilder;
pub use host::Origin;
pub use module::CallContext;
pub use module::Invocation;
pub use module::Methods;
pub use module::Module;
pub use module::ModuleTable;
pub use pool::WorkerHelperPool;
pub use shared::SharedWorkerHelper;
pub use spawn::ContextOptions;
pub use spawn::ContextRef;
pub use spawn::ContextSpawner;
pub use spawn::ThreadSpawner;

#[cfg(test)]
mod tests;
