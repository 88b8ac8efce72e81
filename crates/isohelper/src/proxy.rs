//! # Network proxy (host side)
//!
//! A context that cannot reach the network forwards `{id, uri, options}` to
//! its hosts. Each host serves the request under the named lock for
//! `(context name, uri)`, so contexts sharing one proxy never fetch the same
//! resource concurrently. When a host finishes it broadcasts completion on
//! the channel with the same name; other hosts still waiting on the lock for
//! that request cancel their wait.
//!
//! Failures never escape: a failed fetch is answered with a zero-status
//! response and a lost lock race is simply dropped, because another host is
//! handling it.

use futures::FutureExt;
use isochan::LockOptions;
use isochan::Value;
use isochan::duplex::Sender;
use tracing::debug;
use tracing::warn;

use crate::fetch::ProxyResponse;
use crate::host::Host;
use crate::message::HostMessage;
use crate::message::ProxyRequest;
use crate::spawn::ContextId;

/// Lock and broadcast channel name for proxied fetches of `uri` by contexts named `context`.
pub fn lock_name(context: &str, uri: &str) -> String {
    format!("isohelper-proxy:{}:{}", context, uri)
}

fn completion(context: ContextId, id: u64) -> Value {
    Value::Str(format!("{}#{}", context, id))
}

/// Serves one proxied request and replies on `reply`.
pub(crate) async fn serve(
    host: Host,
    context: ContextId,
    name: String,
    request: ProxyRequest,
    reply: Sender<HostMessage>,
) {
    let ProxyRequest { id, uri, options } = request;
    let key = lock_name(&name, &uri);
    let done = completion(context, id);
    let cancel = host.lifetime().child_token();
    let mut channel = host.origin().pubsub().open(&key);

    let mut acquire = host
        .origin()
        .locks()
        .acquire(&key, LockOptions::exclusive().cancel_on(cancel.clone()));

    let mut watching = true;
    let acquired = loop {
        tokio::select! {
            result = &mut acquire => break result,
            msg = channel.recv(), if watching => match msg {
                Some(msg) if msg == done => {
                    debug!(%context, id, %uri, "proxied fetch completed by another host");
                    cancel.cancel();
                }
                Some(_) => {}
                None => watching = false,
            },
        }
    };

    let _guard = match acquired {
        Ok(Some(guard)) => guard,
        Ok(None) => return,
        Err(e) => {
            debug!(%context, id, %uri, error = %e, "proxied fetch handled elsewhere");
            return;
        }
    };

    // completion may have landed while the lock was being granted
    while let Some(Some(msg)) = channel.recv().now_or_never() {
        if msg == done {
            debug!(%context, id, %uri, "proxied fetch completed by another host");
            return;
        }
    }
    if cancel.is_cancelled() {
        return;
    }

    let response = match host.fetcher().fetch(&uri, options).await {
        Ok(response) => response,
        Err(e) => {
            warn!(%context, id, %uri, error = %e, "proxied fetch failed");
            ProxyResponse::failed()
        }
    };

    let status = response.status;
    if reply.send(HostMessage::FetchResponse { id, response }).is_err() {
        debug!(%context, id, "context went away before the proxied response");
    }
    if let Err(e) = channel.send(done) {
        debug!(%context, id, error = %e, "failed to announce proxied fetch completion");
    }
    debug!(%context, id, %uri, status, "proxied fetch served");
}
