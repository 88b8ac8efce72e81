//! Runs a pool of echo contexts and one shared context on two hosts.
//!
//! `RUST_LOG=isohelper=debug cargo run -p isohelper-demo` shows the protocol steps.

use std::time::Duration;

use anyhow::Result;
use isochan::Value;
use isohelper::BootstrapConfig;
use isohelper::Config;
use isohelper::Host;
use isohelper::Invocation;
use isohelper::MethodCall;
use isohelper::Methods;
use isohelper::ModuleTable;
use isohelper::Origin;
use isohelper::SharedWorkerHelper;
use isohelper::WorkerHelperPool;
use tracing::info;

const ENTRY: &str = "demo:echo";

fn echo_module() -> Methods {
    Methods::new()
        .method("echo", |inv: Invocation| async move {
            Ok(inv.args.into_iter().next().unwrap_or_default())
        })
        .method("sleep", |inv: Invocation| async move {
            let ms = inv.args.first().and_then(Value::as_int).unwrap_or(100);
            tokio::select! {
                _ = inv.cx.cancelled() => Err(Value::from("cancelled")),
                _ = tokio::time::sleep(Duration::from_millis(ms.max(0) as u64)) => Ok(Value::Int(ms)),
            }
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let origin = Origin::local(ModuleTable::new().with(ENTRY, echo_module()));
    let config = Config::from_env();
    let first = Host::builder(origin.clone()).config(config.clone()).build();
    let second = Host::builder(origin).config(config).build();
    first.terminate_on_ctrl_c();
    second.terminate_on_ctrl_c();

    let pool = WorkerHelperPool::new(first.clone(), BootstrapConfig::new(ENTRY), "demo-pool", Some(3));
    pool.init().await?;

    let calls = (0..6i64).map(|i| pool.call_method(MethodCall::new("sleep").arg(20 * i)));
    for result in futures::future::join_all(calls).await {
        info!(result = %result?, "pool call settled");
    }
    info!(tasks = ?pool.task_counts(), "pool idle");

    let leader = SharedWorkerHelper::new(first.clone(), BootstrapConfig::new(ENTRY), "demo-shared");
    let follower = SharedWorkerHelper::new(second.clone(), BootstrapConfig::new(ENTRY), "demo-shared");
    leader.init().await?;
    follower.init().await?;
    info!(
        leader = leader.is_leader(),
        follower = follower.is_leader(),
        reference = ?follower.reference(),
        "shared context attached"
    );

    let reply = follower.call_method(MethodCall::new("echo").arg("hello from the follower")).await?;
    info!(%reply, "shared call settled");

    pool.disconnect();
    first.terminate();
    second.terminate();
    Ok(())
}
