#![cfg(unix)]

use futures_util::StreamExt;
use hostlink_core::RemoteError;
use hostlink_ipc::{
    CallGateway, CallInvoker, Registry, SocketConsumer, SocketHost, SocketHostConfig, StopHandle,
    SubscriptionBroker, SubscriptionClient,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

async fn wait_for_socket(path: &Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("socket did not appear: {}", path.display());
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calls_and_subscriptions_over_a_unix_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("run").join("hostlink.sock");

    let host = SocketHost::new(SocketHostConfig::new(&path));
    let registry = Registry::new();
    let gateway = CallGateway::new(host.clone());
    let broker = SubscriptionBroker::new(host.clone(), Arc::clone(&registry));
    gateway.register("fs:stat", |input: Value| async move {
        match input.as_str() {
            Some("/etc") => Ok(json!({"dir": true})),
            _ => Err(RemoteError::new("NotFound", "no such path")
                .with_field("code", 42)
                .into()),
        }
    });
    let teardowns = Arc::new(AtomicUsize::new(0));
    {
        let teardowns = Arc::clone(&teardowns);
        broker.register("clock", move |_input, sink| {
            let task = tokio::spawn(async move {
                let mut tick = 0u64;
                while sink.emit(json!(tick)) {
                    tick += 1;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
            let teardowns = Arc::clone(&teardowns);
            Ok(StopHandle::new(move || {
                task.abort();
                teardowns.fetch_add(1, Ordering::SeqCst);
            }))
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serve = tokio::spawn(Arc::clone(&host).serve(shutdown_rx));
    wait_for_socket(&path).await;

    let consumer = SocketConsumer::connect(&path).await.expect("connect");
    let invoker = CallInvoker::new(consumer.clone());
    assert_eq!(
        invoker.call("fs:stat", json!("/etc")).await.expect("call"),
        json!({"dir": true})
    );
    let err = invoker
        .call("fs:stat", json!("/nope"))
        .await
        .expect_err("remote error");
    let remote = err.remote().expect("remote");
    assert_eq!(remote.name, "NotFound");
    assert_eq!(remote.field("code"), Some(&json!(42)));

    let client = SubscriptionClient::new(consumer.clone(), Registry::new());
    let mut ticks = client.stream("clock", Value::Null).await.expect("subscribe");
    for expected in 0..3u64 {
        let item = tokio::time::timeout(Duration::from_secs(3), ticks.next())
            .await
            .expect("tick in time")
            .expect("open")
            .expect("event");
        assert_eq!(item, json!(expected));
    }
    ticks.stop();
    eventually(|| teardowns.load(Ordering::SeqCst) == 1).await;

    let open = client.stream("clock", Value::Null).await.expect("subscribe");
    eventually(|| registry.active_subscriptions().iter().any(|r| r.started)).await;
    drop(open);
    drop(client);
    drop(invoker);
    drop(consumer);
    eventually(|| teardowns.load(Ordering::SeqCst) == 2).await;
    eventually(|| registry.active_count() == 0).await;

    let _ = shutdown_tx.send(true);
    serve.await.expect("join").expect("serve");
}
