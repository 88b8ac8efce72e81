//! # Duplex Channel
//!
//! A pair of linked endpoints. Whatever one endpoint sends, the other receives,
//! in send order. Endpoints are themselves plain values, so an endpoint can be
//! sent through another channel to hand one side of a conversation to a
//! different context.
//!
//! ## Invariants
//!
//! - Messages are moved, never shared. Buffers inside a message change owner.
//! - Closing (or dropping) one side makes sends from the other side fail with
//!   [`Error::Closed`] and makes its `recv` return `None` once drained.
//! - A receiver has exactly one consumer: either `recv` calls or a single
//!   handler installed with [`Receiver::on_message`].

use std::fmt;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The other endpoint has been closed or dropped.
    #[error("channel closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Creates a linked pair: `a` sends `A` and receives `B`, `b` the reverse.
pub fn duplex<A, B>() -> (Endpoint<A, B>, Endpoint<B, A>) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();

    let a = Endpoint {
        tx: Sender { inner: tx_a },
        rx: Receiver { inner: rx_b },
    };

    let b = Endpoint {
        tx: Sender { inner: tx_b },
        rx: Receiver { inner: rx_a },
    };

    (a, b)
}

/// Creates a one-way channel.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Sender { inner: tx }, Receiver { inner: rx })
}

/// One side of a duplex channel.
pub struct Endpoint<S, R> {
    tx: Sender<S>,
    rx: Receiver<R>,
}

impl<S, R> Endpoint<S, R> {
    pub fn send(&self, msg: S) -> Result<()> {
        self.tx.send(msg)
    }

    pub async fn recv(&mut self) -> Option<R> {
        self.rx.recv().await
    }

    /// Separates the sending and receiving halves so they can live in different tasks.
    pub fn split(self) -> (Sender<S>, Receiver<R>) {
        (self.tx, self.rx)
    }

    /// Closes both directions. Equivalent to dropping the endpoint.
    pub fn close(self) {
        drop(self)
    }
}

impl<S, R> fmt::Debug for Endpoint<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

/// Sending half. Cloning yields another handle to the same direction.
pub struct Sender<T> {
    inner: mpsc::UnboundedSender<T>,
}

impl<T> Sender<T> {
    pub fn send(&self, msg: T) -> Result<()> {
        self.inner.send(msg).map_err(|_| Error::Closed)
    }

    /// True once the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

/// Receiving half.
pub struct Receiver<T> {
    inner: mpsc::UnboundedReceiver<T>,
}

impl<T> Receiver<T> {
    /// Waits for the next message. `None` once every sender is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.recv().await
    }

    /// Stops accepting new messages; already queued ones can still be drained.
    pub fn close(&mut self) {
        self.inner.close()
    }
}

impl<T: Send + 'static> Receiver<T> {
    /// Installs the single message handler for this receiver.
    ///
    /// Spawns a pump task that feeds every inbound message to `handler` until
    /// the channel closes. Aborting the returned handle detaches the handler.
    pub fn on_message<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(T) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(msg) = self.inner.recv().await {
                handler(msg);
            }
        })
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}
