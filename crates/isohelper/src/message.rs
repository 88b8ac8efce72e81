//! Messages exchanged between a host and a context.
//!
//! Three conversations exist per context:
//!
//! - **primary**: host → context, carries a single [`Connect`] per host.
//! - **control**: long-lived, [`HostMessage`] one way and [`ContextMessage`] the other.
//! - **call**: one ephemeral duplex per `Invoke`, [`CallSignal`] host → context
//!   and exactly one [`Reply`] context → host.

use isochan::Endpoint;
use isochan::Value;

use crate::fetch::FetchOptions;
use crate::fetch::ProxyResponse;

/// Hands the context its end of the control channel.
#[derive(Debug)]
pub struct Connect {
    pub control: Endpoint<ContextMessage, HostMessage>,
}

#[derive(Debug)]
pub enum HostMessage {
    /// Run `method`; the outcome goes back on `reply`.
    Invoke {
        method: String,
        args: Vec<Value>,
        transfer: Vec<Vec<u8>>,
        reply: Endpoint<Reply, CallSignal>,
    },
    /// Answer to a [`ContextMessage::Fetch`] with the same id.
    FetchResponse {
        id: u64,
        response: ProxyResponse,
    },
    /// The host is going away.
    Disconnect,
}

#[derive(Debug)]
pub enum ContextMessage {
    /// Startup handshake: the context accepted `Connect`.
    Connected,
    /// The context could not reach the network and asks the host to fetch.
    Fetch(ProxyRequest),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyRequest {
    pub id: u64,
    pub uri: String,
    pub options: FetchOptions,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallSignal {
    Cancel,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Ok(Value),
    Err(Value),
}
