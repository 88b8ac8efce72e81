//! # Publish/Subscribe Channels
//!
//! Named fan-out: every open handle with the same name sees every message
//! sent by any *other* handle under that name. There is no queueing for late
//! joiners and no delivery guarantee; a message sent while nobody listens is gone.
//!
//! A topic lives while at least one handle on it is open.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The handle was closed before the send.
    #[error("broadcast channel '{name}' is closed")]
    Closed { name: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Opens broadcast channels by name.
pub trait PubSub: Send + Sync + 'static {
    fn open(&self, name: &str) -> Box<dyn BroadcastChannel>;
}

/// One subscriber/publisher handle on a named channel.
#[async_trait::async_trait]
pub trait BroadcastChannel: Send {
    fn name(&self) -> &str;

    /// Publishes to every other open handle with the same name.
    fn send(&self, msg: Value) -> Result<()>;

    /// Next message from another handle. `None` once this handle is closed.
    async fn recv(&mut self) -> Option<Value>;

    fn close(&mut self);
}

const DEFAULT_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
struct Envelope {
    origin: u64,
    value: Value,
}

type Topics = DashMap<String, broadcast::Sender<Envelope>>;

/// In-process broadcast channels shared by every host in the same process.
pub struct LocalPubSub {
    topics: Arc<Topics>,
    next_handle: AtomicU64,
    capacity: usize,
}

impl LocalPubSub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Messages a slow subscriber may fall behind before it starts losing them.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            next_handle: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Number of topics with at least one open handle.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl fmt::Debug for LocalPubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPubSub")
            .field("topics", &self.topics.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub for LocalPubSub {
    fn open(&self, name: &str) -> Box<dyn BroadcastChannel> {
        // subscribe under the entry lock so a closing handle never removes a live topic
        let (tx, rx) = {
            let topic = self.topics
                .entry(name.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0);
            let rx = topic.subscribe();
            (topic.value().clone(), rx)
        };

        Box::new(LocalChannel {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            tx,
            rx: Some(rx),
            topics: self.topics.clone(),
        })
    }
}

struct LocalChannel {
    id: u64,
    name: String,
    tx: broadcast::Sender<Envelope>,
    rx: Option<broadcast::Receiver<Envelope>>,
    topics: Arc<Topics>,
}

#[async_trait::async_trait]
impl BroadcastChannel for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, msg: Value) -> Result<()> {
        if self.rx.is_none() {
            return Err(Error::Closed { name: self.name.clone() });
        }
        // no subscribers is not an error: fan-out is at-most-once
        let _ = self.tx.send(Envelope { origin: self.id, value: msg });
        Ok(())
    }

    async fn recv(&mut self) -> Option<Value> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(env) if env.origin == self.id => continue,
                Ok(env) => return Some(env.value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %self.name, skipped, "broadcast subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn close(&mut self) {
        let Some(rx) = self.rx.take() else {
            return;
        };
        drop(rx);
        self.topics.remove_if(&self.name, |_, tx| tx.receiver_count() == 0);
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.close();
    }
}
