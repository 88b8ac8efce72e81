//! Tests for the coordinators against real context threads.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use isochan::LocalLocks;
use isochan::LocalPubSub;
use isochan::Value;
use isochan::duplex;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::BootstrapConfig;
use crate::bootstrap::BootstrapRef;
use crate::bootstrap::BootstrapStore;
use crate::config::Config;
use crate::fetch;
use crate::fetch::Denied;
use crate::fetch::FetchOptions;
use crate::fetch::Fetcher;
use crate::fetch::ProxyResponse;
use crate::helper::Error;
use crate::helper::HelperState;
use crate::helper::MethodCall;
use crate::helper::WorkerHelper;
use crate::host::Host;
use crate::host::Origin;
use crate::message::Connect;
use crate::message::ContextMessage;
use crate::message::HostMessage;
use crate::module::Invocation;
use crate::module::Methods;
use crate::module::ModuleTable;
use crate::pool::WorkerHelperPool;
use crate::spawn;
use crate::spawn::ContextId;
use crate::spawn::ContextOptions;
use crate::spawn::ContextRef;
use crate::spawn::ContextSpawner;
use crate::spawn::ThreadSpawner;

const ENTRY: &str = "app:test";

/// Side effects observable from outside the context thread.
#[derive(Default, Clone)]
struct Effects {
    touched: Arc<AtomicUsize>,
    cancelled: Arc<Notify>,
}

fn test_module(effects: &Effects) -> Methods {
    let touched = effects.touched.clone();
    let cancelled = effects.cancelled.clone();

    Methods::new()
        .method("echo", |inv: Invocation| async move {
            Ok(inv.args.into_iter().next().unwrap_or_default())
        })
        .method("fail", |_inv: Invocation| async move {
            Err(Value::from("boom"))
        })
        .method("size", |inv: Invocation| async move {
            let total: usize = inv.transfer.iter().map(Vec::len).sum();
            Ok(Value::Int(total as i64))
        })
        .method("touch", move |_inv: Invocation| {
            let touched = touched.clone();
            async move {
                touched.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .method("wait", move |inv: Invocation| {
            let cancelled = cancelled.clone();
            async move {
                inv.cx.cancelled().await;
                cancelled.notify_one();
                Ok(Value::from("cancelled"))
            }
        })
        .method("fetch", |inv: Invocation| async move {
            let uri = inv.args.first().and_then(Value::as_str).unwrap_or_default().to_string();
            let response = inv.cx.fetch(&uri, FetchOptions::default()).await;
            Ok(Value::map([
                ("status", Value::Int(response.status as i64)),
                ("body", Value::Bytes(response.body)),
            ]))
        })
}

/// Counts how many contexts were requested.
struct CountingSpawner {
    inner: ThreadSpawner,
    spawned: Arc<AtomicUsize>,
}

#[async_trait]
impl ContextSpawner for CountingSpawner {
    async fn create(&self, reference: &BootstrapRef, options: &ContextOptions) -> spawn::Result<ContextRef> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.inner.create(reference, options).await
    }
}

/// Answers every request with status 200 and the uri as body.
#[derive(Default, Clone)]
struct ScriptedFetcher {
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, uri: &str, _options: FetchOptions) -> fetch::Result<ProxyResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(ProxyResponse {
            status: 200,
            status_text: "OK".into(),
            headers: Vec::new(),
            body: uri.as_bytes().to_vec(),
        })
    }
}

struct FailingFetcher;

#[async_trait]
impl Fetcher for FailingFetcher {
    async fn fetch(&self, uri: &str, _options: FetchOptions) -> fetch::Result<ProxyResponse> {
        Err(fetch::Error::Network(format!("unreachable: {}", uri)))
    }
}

/// Holds every `create` until released, and remembers what it created.
struct GatedSpawner {
    inner: ThreadSpawner,
    entered: Arc<Notify>,
    release: Arc<Notify>,
    created: Arc<Mutex<Vec<ContextRef>>>,
}

#[async_trait]
impl ContextSpawner for GatedSpawner {
    async fn create(&self, reference: &BootstrapRef, options: &ContextOptions) -> spawn::Result<ContextRef> {
        self.entered.notify_one();
        self.release.notified().await;
        let context = self.inner.create(reference, options).await?;
        self.created.lock().push(context.clone());
        Ok(context)
    }
}

/// Hands out contexts that accept a connection but never answer it.
struct MuteSpawner {
    stop: CancellationToken,
    accepted: Mutex<Vec<duplex::Receiver<Connect>>>,
}

#[async_trait]
impl ContextSpawner for MuteSpawner {
    async fn create(&self, _reference: &BootstrapRef, options: &ContextOptions) -> spawn::Result<ContextRef> {
        let (primary, connection) = duplex::channel();
        self.accepted.lock().push(connection);
        Ok(ContextRef::new(ContextId(99), options, primary, self.stop.clone()))
    }
}

fn origin_with(store: Arc<BootstrapStore>, spawner: impl ContextSpawner) -> Origin {
    Origin::new(
        Arc::new(LocalLocks::new()),
        Arc::new(LocalPubSub::new()),
        store,
        Arc::new(spawner),
    )
}

struct Fixture {
    host: Host,
    spawned: Arc<AtomicUsize>,
    effects: Effects,
}

impl Fixture {
    fn new() -> Self {
        Self::with_fetcher(ScriptedFetcher::default())
    }

    fn with_fetcher(fetcher: impl Fetcher) -> Self {
        let effects = Effects::default();
        let spawned = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(BootstrapStore::new());
        let modules = ModuleTable::new().with(ENTRY, test_module(&effects));
        let spawner = CountingSpawner {
            inner: ThreadSpawner::new(store.clone(), modules),
            spawned: spawned.clone(),
        };
        let origin = Origin::new(
            Arc::new(LocalLocks::new()),
            Arc::new(LocalPubSub::new()),
            store,
            Arc::new(spawner),
        );
        let host = Host::builder(origin)
            .fetcher(fetcher)
            .config(Config::default().with_handshake_timeout(Duration::from_secs(5)))
            .build();

        Self { host, spawned, effects }
    }

    fn helper(&self) -> WorkerHelper {
        WorkerHelper::new(self.host.clone(), BootstrapConfig::new(ENTRY), "test")
    }

    fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// WorkerHelper
// ============================================================================

#[tokio::test]
async fn test_call_before_init_is_rejected() {
    let fixture = Fixture::new();
    let helper = fixture.helper();

    assert_eq!(helper.state(), HelperState::Uninitialized);
    assert!(matches!(helper.handle(), Err(Error::NotInitialized)));

    let result = helper.call_method(MethodCall::new("echo").arg("hi")).await;
    assert!(matches!(result, Err(Error::NotInitialized)));
    assert_eq!(fixture.spawned(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_init_shares_one_context() {
    let fixture = Fixture::new();
    let helper = fixture.helper();
    let other = helper.clone();

    let (a, b, c) = tokio::join!(helper.init(), other.init(), helper.init());
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(fixture.spawned(), 1);
    assert_eq!(helper.state(), HelperState::Ready);

    let first = helper.handle().unwrap();
    helper.init().await.unwrap();
    let second = other.handle().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fixture.spawned(), 1);

    helper.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_round_trip() {
    let fixture = Fixture::new();
    let helper = fixture.helper();
    helper.init().await.unwrap();

    let result = helper.call_method(MethodCall::new("echo").arg("hi")).await;
    assert_eq!(result.unwrap(), Value::from("hi"));

    helper.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_calls_settle_independently() {
    let fixture = Fixture::new();
    let helper = fixture.helper();
    helper.init().await.unwrap();

    let calls = (0..16i64).map(|i| helper.call_method(MethodCall::new("echo").arg(i)));
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), Value::Int(i as i64));
    }

    helper.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transferred_buffers_reach_the_context() {
    let fixture = Fixture::new();
    let helper = fixture.helper();
    helper.init().await.unwrap();

    let call = MethodCall::new("size").transfer(vec![0u8; 16]).transfer(vec![1u8; 4]);
    assert_eq!(helper.call_method(call).await.unwrap(), Value::Int(20));

    helper.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_error_is_passed_verbatim() {
    let fixture = Fixture::new();
    let helper = fixture.helper();
    helper.init().await.unwrap();

    match helper.call_method(MethodCall::new("fail")).await {
        Err(Error::Remote(value)) => assert_eq!(value, Value::from("boom")),
        other => panic!("expected remote error, got {:?}", other),
    }

    match helper.call_method(MethodCall::new("missing")).await {
        Err(Error::Remote(value)) => {
            assert_eq!(value.get("name"), Some(&Value::from("MethodNotFound")));
        }
        other => panic!("expected remote error, got {:?}", other),
    }

    helper.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_before_reply_rejects_and_reaches_the_context() {
    let fixture = Fixture::new();
    let helper = fixture.helper();
    helper.init().await.unwrap();

    let token = CancellationToken::new();
    let call = {
        let helper = helper.clone();
        let token = token.clone();
        tokio::spawn(async move { helper.call_method(MethodCall::new("wait").cancel_on(token)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let result = call.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    let observed = tokio::time::timeout(Duration::from_secs(2), fixture.effects.cancelled.notified()).await;
    assert!(observed.is_ok(), "context never saw the cancellation");

    // the helper stays usable
    let result = helper.call_method(MethodCall::new("echo").arg(7i64)).await;
    assert_eq!(result.unwrap(), Value::Int(7));

    helper.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pre_cancelled_call_is_never_dispatched() {
    let fixture = Fixture::new();
    let helper = fixture.helper();
    helper.init().await.unwrap();

    let token = CancellationToken::new();
    token.cancel();

    let result = helper.call_method(MethodCall::new("touch").cancel_on(token)).await;
    assert!(matches!(result, Err(Error::Cancelled)));

    helper.call_method(MethodCall::new("echo")).await.unwrap();
    assert_eq!(fixture.effects.touched.load(Ordering::SeqCst), 0);

    helper.call_method(MethodCall::new("touch")).await.unwrap();
    assert_eq!(fixture.effects.touched.load(Ordering::SeqCst), 1);

    helper.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_then_init_starts_a_fresh_context() {
    let fixture = Fixture::new();
    let helper = fixture.helper();
    helper.init().await.unwrap();
    let first = helper.handle().unwrap();

    helper.disconnect();
    assert_eq!(helper.state(), HelperState::Disconnected);
    assert!(matches!(
        helper.call_method(MethodCall::new("echo")).await,
        Err(Error::NotInitialized)
    ));

    // idempotent
    helper.disconnect();

    helper.init().await.unwrap();
    let second = helper.handle().unwrap();
    assert_ne!(first.context().id(), second.context().id());
    assert_eq!(first.reference(), second.reference());
    assert_eq!(fixture.spawned(), 2);
    assert_eq!(fixture.host.origin().store().len(), 1);

    let result = helper.call_method(MethodCall::new("echo").arg("again")).await;
    assert_eq!(result.unwrap(), Value::from("again"));

    helper.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_after_context_stopped_fails_to_dispatch() {
    let fixture = Fixture::new();
    let helper = fixture.helper();
    helper.init().await.unwrap();
    let handle = helper.handle().unwrap();

    handle.context().terminate();
    assert!(eventually(|| !handle.is_connected()).await);

    let result = helper.call_method(MethodCall::new("echo")).await;
    assert!(matches!(result, Err(Error::Dispatch)));

    helper.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_termination_disconnects_helpers() {
    let fixture = Fixture::new();
    let helper = fixture.helper();
    helper.init().await.unwrap();
    let handle = helper.handle().unwrap();

    fixture.host.terminate();

    assert!(eventually(|| helper.state() == HelperState::Disconnected).await);
    assert!(eventually(|| !handle.is_connected()).await);
    assert!(matches!(helper.init().await, Err(Error::HostTerminated)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_startup_can_be_retried() {
    let fixture = Fixture::new();
    let helper = WorkerHelper::new(fixture.host.clone(), BootstrapConfig::new("app:missing"), "missing");

    let result = helper.init().await;
    assert!(matches!(result, Err(Error::Spawn(spawn::Error::ModuleNotFound(_)))));
    assert_eq!(helper.state(), HelperState::Uninitialized);

    // a second attempt runs again instead of replaying the failure
    assert!(helper.init().await.is_err());
    assert_eq!(fixture.spawned(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_during_startup_closes_the_new_context() {
    let effects = Effects::default();
    let store = Arc::new(BootstrapStore::new());
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let created = Arc::new(Mutex::new(Vec::new()));
    let spawner = GatedSpawner {
        inner: ThreadSpawner::new(store.clone(), ModuleTable::new().with(ENTRY, test_module(&effects))),
        entered: entered.clone(),
        release: release.clone(),
        created: created.clone(),
    };
    let host = Host::new(origin_with(store, spawner));
    let helper = WorkerHelper::new(host.clone(), BootstrapConfig::new(ENTRY), "gated");

    let init = {
        let helper = helper.clone();
        tokio::spawn(async move { helper.init().await })
    };
    entered.notified().await;
    assert_eq!(helper.state(), HelperState::Initializing);

    helper.disconnect();
    release.notify_one();

    let result = init.await.unwrap();
    assert!(matches!(result, Err(Error::Disconnected)));
    assert_eq!(helper.state(), HelperState::Disconnected);
    assert!(matches!(helper.handle(), Err(Error::NotInitialized)));

    let context = created.lock().pop().expect("the spawner ran");
    assert!(eventually(|| !context.is_running()).await);

    host.terminate();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_handshake_times_out() {
    let stop = CancellationToken::new();
    let spawner = MuteSpawner { stop: stop.clone(), accepted: Mutex::new(Vec::new()) };
    let host = Host::builder(origin_with(Arc::new(BootstrapStore::new()), spawner))
        .config(Config::default().with_handshake_timeout(Duration::from_millis(500)))
        .build();
    let helper = WorkerHelper::new(host.clone(), BootstrapConfig::new(ENTRY), "mute");

    let started = tokio::time::Instant::now();
    let result = helper.init().await;

    assert!(matches!(result, Err(Error::Handshake(ContextId(99)))));
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(stop.is_cancelled(), "the unresponsive context was not terminated");
    assert_eq!(helper.state(), HelperState::Uninitialized);

    host.terminate();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_call_cancels_the_method() {
    let fixture = Fixture::new();
    let helper = fixture.helper();
    helper.init().await.unwrap();

    let abandoned = tokio::time::timeout(Duration::from_millis(50), helper.call_method(MethodCall::new("wait"))).await;
    assert!(abandoned.is_err());

    let observed = tokio::time::timeout(Duration::from_secs(2), fixture.effects.cancelled.notified()).await;
    assert!(observed.is_ok(), "context kept running a call nobody waits for");

    helper.disconnect();
}

// ============================================================================
// Shared contexts
// ============================================================================

/// Connects as a host would and waits for the handshake.
async fn handshake(context: &ContextRef) -> Option<duplex::Sender<HostMessage>> {
    let (local, remote) = duplex::duplex::<HostMessage, ContextMessage>();
    context.primary().send(Connect { control: remote }).ok()?;

    let (control, mut events) = local.split();
    match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ContextMessage::Connected)) => Some(control),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reattach_right_after_the_last_host_leaves() {
    let effects = Effects::default();
    let store = Arc::new(BootstrapStore::new());
    let spawner = ThreadSpawner::new(store.clone(), ModuleTable::new().with(ENTRY, test_module(&effects)));
    let reference = store.publish(BootstrapConfig::new(ENTRY));
    let options = ContextOptions::shared("reattach");

    let mut last = None;
    for _ in 0..20 {
        let context = spawner.create(&reference, &options).await.unwrap();
        let control = handshake(&context).await.expect("host attached");

        // leave and come back without waiting for the context to notice
        control.send(HostMessage::Disconnect).unwrap();
        let again = spawner.create(&reference, &options).await.unwrap();
        assert!(handshake(&again).await.is_some(), "re-attach lost the race with the detach");
        last = Some(again);
    }

    let last = last.expect("at least one round ran");
    assert!(eventually(|| !last.is_running()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dedicated_context_serves_its_host_after_create() {
    let effects = Effects::default();
    let store = Arc::new(BootstrapStore::new());
    let spawner = ThreadSpawner::new(store.clone(), ModuleTable::new().with(ENTRY, test_module(&effects)));
    let reference = store.publish(BootstrapConfig::new(ENTRY));

    let context = spawner.create(&reference, &ContextOptions::dedicated("alone")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(context.is_running());

    let control = handshake(&context).await;
    assert!(control.is_some());
    assert!(context.is_running());

    drop(control);
    assert!(eventually(|| !context.is_running()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_the_helper_revokes_its_config() {
    let fixture = Fixture::new();
    let store = fixture.host.origin().store().clone();
    let helper = fixture.helper();

    helper.init().await.unwrap();
    helper.disconnect();
    helper.init().await.unwrap();
    assert_eq!(store.len(), 1);

    helper.disconnect();
    drop(helper);
    assert!(eventually(|| store.is_empty()).await);
}

// ============================================================================
// Network proxy
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_fetch_is_proxied_through_the_host() {
    let fetcher = ScriptedFetcher::default();
    let calls = fetcher.calls.clone();
    let fixture = Fixture::with_fetcher(fetcher);
    let helper = fixture.helper();
    helper.init().await.unwrap();

    let result = helper
        .call_method(MethodCall::new("fetch").arg("https://example.test/data"))
        .await
        .unwrap();

    assert_eq!(result.get("status"), Some(&Value::Int(200)));
    assert_eq!(
        result.get("body").and_then(Value::as_bytes),
        Some("https://example.test/data".as_bytes())
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    helper.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_proxied_fetch_reports_zero_status() {
    let fixture = Fixture::with_fetcher(FailingFetcher);
    let helper = fixture.helper();
    helper.init().await.unwrap();

    let result = helper
        .call_method(MethodCall::new("fetch").arg("https://example.test/down"))
        .await
        .unwrap();

    assert_eq!(result.get("status"), Some(&Value::Int(0)));

    helper.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxied_fetches_of_one_uri_never_overlap() {
    let fetcher = ScriptedFetcher {
        delay: Duration::from_millis(50),
        ..ScriptedFetcher::default()
    };
    let calls = fetcher.calls.clone();
    let peak = fetcher.peak.clone();
    let fixture = Fixture::with_fetcher(fetcher);
    let helper = fixture.helper();
    helper.init().await.unwrap();

    let fetch = || helper.call_method(MethodCall::new("fetch").arg("https://example.test/same"));
    let (a, b) = tokio::join!(fetch(), fetch());

    assert_eq!(a.unwrap().get("status"), Some(&Value::Int(200)));
    assert_eq!(b.unwrap().get("status"), Some(&Value::Int(200)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    helper.disconnect();
}

fn host_with_native(native: impl Fetcher, fetcher: impl Fetcher) -> Host {
    let store = Arc::new(BootstrapStore::new());
    let modules = ModuleTable::new().with(ENTRY, test_module(&Effects::default()));
    let spawner = ThreadSpawner::new(store.clone(), modules).with_native_fetcher(native);
    let origin = Origin::new(
        Arc::new(LocalLocks::new()),
        Arc::new(LocalPubSub::new()),
        store,
        Arc::new(spawner),
    );
    Host::builder(origin).fetcher(fetcher).build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_native_fetch_skips_the_host() {
    let native = ScriptedFetcher::default();
    let proxied = ScriptedFetcher::default();
    let (native_calls, proxied_calls) = (native.calls.clone(), proxied.calls.clone());
    let host = host_with_native(native, proxied);
    let helper = WorkerHelper::new(host, BootstrapConfig::new(ENTRY), "native");
    helper.init().await.unwrap();

    let result = helper
        .call_method(MethodCall::new("fetch").arg("https://example.test/direct"))
        .await
        .unwrap();

    assert_eq!(result.get("status"), Some(&Value::Int(200)));
    assert_eq!(native_calls.load(Ordering::SeqCst), 1);
    assert_eq!(proxied_calls.load(Ordering::SeqCst), 0);

    helper.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_denied_native_fetch_falls_back_to_the_host() {
    let proxied = ScriptedFetcher::default();
    let proxied_calls = proxied.calls.clone();
    let host = host_with_native(Denied, proxied);
    let helper = WorkerHelper::new(host, BootstrapConfig::new(ENTRY), "denied");
    helper.init().await.unwrap();

    let result = helper
        .call_method(MethodCall::new("fetch").arg("https://example.test/fallback"))
        .await
        .unwrap();

    assert_eq!(result.get("status"), Some(&Value::Int(200)));
    assert_eq!(proxied_calls.load(Ordering::SeqCst), 1);

    helper.disconnect();
}

// ============================================================================
// WorkerHelperPool
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_init_starts_every_member_once() {
    let fixture = Fixture::new();
    let pool = WorkerHelperPool::new(fixture.host.clone(), BootstrapConfig::new(ENTRY), "pool", Some(3));

    let (a, b) = tokio::join!(pool.init(), pool.init());
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(pool.len(), 3);
    assert_eq!(fixture.spawned(), 3);
    assert_eq!(fixture.host.origin().store().len(), 1);
    assert!(pool.helpers().all(|helper| helper.state() == HelperState::Ready));

    pool.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_counts_return_to_zero_after_calls_settle() {
    let fixture = Fixture::new();
    let pool = WorkerHelperPool::new(fixture.host.clone(), BootstrapConfig::new(ENTRY), "pool", Some(3));
    pool.init().await.unwrap();

    let calls = (0..9i64).map(|i| pool.call_method(MethodCall::new("echo").arg(i)));
    let results = futures::future::join_all(calls).await;
    assert!(results.iter().all(Result::is_ok));

    let failed = pool.call_method(MethodCall::new("fail")).await;
    assert!(matches!(failed, Err(Error::Remote(_))));

    assert_eq!(pool.task_counts(), vec![0, 0, 0]);

    pool.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_can_be_reinitialised_after_disconnect() {
    let fixture = Fixture::new();
    let pool = WorkerHelperPool::new(fixture.host.clone(), BootstrapConfig::new(ENTRY), "pool", Some(2));
    pool.init().await.unwrap();

    pool.disconnect();
    assert!(pool.helpers().all(|helper| helper.state() == HelperState::Disconnected));

    pool.init().await.unwrap();
    assert_eq!(fixture.spawned(), 4);

    let result = pool.call_method(MethodCall::new("echo").arg("back")).await;
    assert_eq!(result.unwrap(), Value::from("back"));

    pool.disconnect();
}
