//! # isochan
//!
//! The message-passing substrate that isolated execution contexts and their
//! hosts talk through. Nothing in here shares memory between the two sides:
//! every payload is moved into a channel and owned by the receiver from then on.
//!
//! - [`duplex`]: linked endpoint pairs carrying typed messages.
//! - [`lock`]: a named lock service (exclusive / shared, blocking / try-only, cancellable).
//! - [`pubsub`]: named fan-out channels with no queueing for late joiners.
//! - [`value`]: the dynamic payload type carried across context boundaries.
//!
//! The lock service and the broadcast channels are traits so hosts can plug in
//! other backends; `LocalLocks` and `LocalPubSub` serve every host living in
//! the same process.

pub mod duplex;
pub mod lock;
pub mod pubsub;
pub mod value;

pub use duplex::Endpoint;
pub use duplex::duplex;
pub use lock::LocalLocks;
pub use lock::LockGuard;
pub use lock::LockMode;
pub use lock::LockOptions;
pub use lock::LockService;
pub use pubsub::BroadcastChannel;
pub use pubsub::LocalPubSub;
pub use pubsub::PubSub;
pub use value::Value;
