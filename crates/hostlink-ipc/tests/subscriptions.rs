use futures_util::StreamExt;
use hostlink_core::RemoteError;
use hostlink_ipc::{
    ConsumerTransport, EventSink, HostTransport, ListenerCapacity, LocalConsumer, LocalHost,
    Registry, StopHandle, SubscriptionBroker, SubscriptionClient,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Fixture {
    host: Arc<LocalHost>,
    host_registry: Arc<Registry>,
    broker: SubscriptionBroker,
    consumer: Arc<LocalConsumer>,
    client: SubscriptionClient,
    teardowns: Arc<AtomicUsize>,
}

fn fixture() -> Fixture {
    let host = LocalHost::new();
    let host_registry = Registry::new();
    let broker = SubscriptionBroker::new(host.clone(), Arc::clone(&host_registry));
    let consumer = Arc::new(host.connect());
    let client = SubscriptionClient::new(consumer.clone(), Registry::new());
    let teardowns = Arc::new(AtomicUsize::new(0));
    register_ticker(&broker, &teardowns);
    Fixture {
        host,
        host_registry,
        broker,
        consumer,
        client,
        teardowns,
    }
}

/// Emits `0..count`, then either completes or stays open until stopped.
fn register_ticker(broker: &SubscriptionBroker, teardowns: &Arc<AtomicUsize>) {
    let teardowns = Arc::clone(teardowns);
    broker.register("ticker", move |input: Value, sink: EventSink| {
        let count = input["count"].as_u64().unwrap_or(0);
        for n in 0..count {
            sink.emit(json!(n));
        }
        if input["complete"].as_bool().unwrap_or(false) {
            sink.complete();
        }
        let teardowns = Arc::clone(&teardowns);
        Ok(StopHandle::new(move || {
            drop(sink);
            teardowns.fetch_add(1, Ordering::SeqCst);
        }))
    });
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

async fn next_item(
    stream: &mut hostlink_ipc::SubscriptionStream,
) -> Option<Result<Value, RemoteError>> {
    tokio::time::timeout(Duration::from_secs(3), stream.next())
        .await
        .expect("stream item in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_arrive_in_order_then_complete() {
    let f = fixture();
    let mut stream = f
        .client
        .stream("ticker", json!({"count": 5, "complete": true}))
        .await
        .expect("subscribe");

    let mut seen = Vec::new();
    while let Some(item) = next_item(&mut stream).await {
        seen.push(item.expect("event"));
    }
    assert_eq!(seen, (0..5).map(|n| json!(n)).collect::<Vec<_>>());

    eventually(|| f.teardowns.load(Ordering::SeqCst) == 1).await;
    eventually(|| f.host_registry.active_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_after_completion_is_a_no_op() {
    let f = fixture();
    let mut stream = f
        .client
        .stream("ticker", json!({"count": 1, "complete": true}))
        .await
        .expect("subscribe");
    let channel = stream.channel().to_string();
    assert_eq!(next_item(&mut stream).await.map(Result::ok), Some(Some(json!(0))));
    assert!(next_item(&mut stream).await.is_none());
    eventually(|| f.teardowns.load(Ordering::SeqCst) == 1).await;

    stream.stop();
    stream.stop();
    f.consumer.send(&channel, json!("stop")).expect("raw stop");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn double_stop_tears_down_once() {
    let f = fixture();
    let received = Arc::new(Mutex::new(Vec::new()));
    let subscription = {
        let received = Arc::clone(&received);
        f.client
            .subscribe("ticker", json!({"count": 3}), move |err, message| {
                received
                    .lock()
                    .expect("lock")
                    .push((err.map(|e| e.name), message));
            })
            .await
            .expect("subscribe")
    };
    eventually(|| received.lock().expect("lock").len() == 3).await;
    assert!(received
        .lock()
        .expect("lock")
        .iter()
        .all(|(err, _)| err.is_none()));

    let channel = subscription.channel().to_string();
    subscription.stop();
    subscription.stop();
    f.consumer.send(&channel, json!("stop")).expect("raw stop");
    eventually(|| f.teardowns.load(Ordering::SeqCst) == 1).await;
    eventually(|| f.host_registry.active_count() == 0).await;
    assert!(subscription.is_stopped());

    drop(subscription);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_stream_stops_the_subscription() {
    let f = fixture();
    let stream = f
        .client
        .stream("ticker", json!({"count": 0}))
        .await
        .expect("subscribe");
    eventually(|| f.host_registry.active_subscriptions().iter().all(|r| r.started)).await;
    drop(stream);
    eventually(|| f.teardowns.load(Ordering::SeqCst) == 1).await;
}

/// Emits from a background thread until its stop handle runs.
fn register_firehose(broker: &SubscriptionBroker, teardowns: &Arc<AtomicUsize>) {
    let teardowns = Arc::clone(teardowns);
    broker.register("firehose", move |_input: Value, sink: EventSink| {
        let stopped = Arc::new(AtomicBool::new(false));
        let producer = {
            let stopped = Arc::clone(&stopped);
            std::thread::spawn(move || {
                let mut n = 0u64;
                while !stopped.load(Ordering::SeqCst) && sink.emit(json!(n)) {
                    n += 1;
                    std::thread::yield_now();
                }
            })
        };
        let teardowns = Arc::clone(&teardowns);
        Ok(StopHandle::new(move || {
            stopped.store(true, Ordering::SeqCst);
            let _ = producer.join();
            teardowns.fetch_add(1, Ordering::SeqCst);
        }))
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_reaches_a_feature_that_never_stops_emitting() {
    let f = fixture();
    let teardowns = Arc::new(AtomicUsize::new(0));
    register_firehose(&f.broker, &teardowns);

    let mut stream = f
        .client
        .stream("firehose", Value::Null)
        .await
        .expect("subscribe");
    for expected in 0..10u64 {
        let item = next_item(&mut stream).await.expect("item").expect("event");
        assert_eq!(item, json!(expected));
    }
    drop(stream);

    eventually(|| teardowns.load(Ordering::SeqCst) == 1).await;
    eventually(|| f.host_registry.active_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroying_an_endpoint_reaches_a_busy_feature() {
    let f = fixture();
    let teardowns = Arc::new(AtomicUsize::new(0));
    register_firehose(&f.broker, &teardowns);

    let mut stream = f
        .client
        .stream("firehose", Value::Null)
        .await
        .expect("subscribe");
    next_item(&mut stream).await.expect("item").expect("event");

    f.consumer.destroy();
    eventually(|| teardowns.load(Ordering::SeqCst) == 1).await;
    eventually(|| f.host_registry.active_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroyed_endpoint_tears_down_its_subscriptions() {
    let f = fixture();
    let other = Arc::new(f.host.connect());
    let other_client = SubscriptionClient::new(other.clone(), Registry::new());

    let _mine = f
        .client
        .stream("ticker", json!({"count": 0}))
        .await
        .expect("subscribe");
    let _theirs = other_client
        .stream("ticker", json!({"count": 0}))
        .await
        .expect("subscribe");
    eventually(|| {
        let records = f.host_registry.active_subscriptions();
        records.len() == 2 && records.iter().all(|r| r.started)
    })
    .await;

    other.destroy();
    eventually(|| f.teardowns.load(Ordering::SeqCst) == 1).await;
    let remaining = f.host_registry.active_subscriptions();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].endpoint, f.consumer.endpoint_id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn navigation_tears_down_and_new_subscriptions_work() {
    let f = fixture();
    let _before = f
        .client
        .stream("ticker", json!({"count": 0}))
        .await
        .expect("subscribe");
    eventually(|| f.host_registry.active_subscriptions().iter().all(|r| r.started)).await;

    f.consumer.navigate();
    eventually(|| f.teardowns.load(Ordering::SeqCst) == 1).await;
    eventually(|| f.host_registry.active_count() == 0).await;

    let mut after = f
        .client
        .stream("ticker", json!({"count": 1}))
        .await
        .expect("subscribe after navigation");
    assert_eq!(next_item(&mut after).await.map(Result::ok), Some(Some(json!(0))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn teardown_before_start_never_runs_the_feature() {
    let f = fixture();
    let started = Arc::new(AtomicUsize::new(0));
    {
        let started = Arc::clone(&started);
        f.broker.register("lazy", move |_input, _sink| {
            started.fetch_add(1, Ordering::SeqCst);
            Ok(StopHandle::noop())
        });
    }

    let reply = f
        .consumer
        .invoke("hostlink:subscribe:lazy", Value::Null)
        .await
        .expect("invoke");
    let channel = reply["value"].as_str().expect("channel").to_string();
    assert_eq!(f.host_registry.active_count(), 1);

    f.consumer.send(&channel, json!("stop")).expect("stop");
    eventually(|| f.host_registry.active_count() == 0).await;
    assert_eq!(started.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn setup_failure_delivers_one_error_then_ends() {
    let f = fixture();
    f.broker.register("broken", |_input, _sink| {
        Err(RemoteError::new("SetupError", "cannot open feed")
            .with_field("code", 42)
            .into())
    });

    let mut stream = f
        .client
        .stream("broken", Value::Null)
        .await
        .expect("subscribe");
    let err = next_item(&mut stream)
        .await
        .expect("one item")
        .expect_err("error event");
    assert_eq!(err.name, "SetupError");
    assert_eq!(err.message, "cannot open feed");
    assert_eq!(err.field("code"), Some(&json!(42)));
    assert!(next_item(&mut stream).await.is_none());
    eventually(|| f.host_registry.active_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_and_duplicate_signals_are_ignored() {
    let f = fixture();
    let mut stream = f
        .client
        .stream("ticker", json!({"count": 1}))
        .await
        .expect("subscribe");
    assert_eq!(next_item(&mut stream).await.map(Result::ok), Some(Some(json!(0))));

    let channel = stream.channel().to_string();
    f.consumer.send(&channel, json!("start")).expect("duplicate start");
    f.consumer.send(&channel, json!("restart")).expect("unknown signal");
    f.consumer
        .send("hostlink:stream:unknown:1:ticker", json!("stop"))
        .expect("stop for unknown channel");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.teardowns.load(Ordering::SeqCst), 0);
    assert_eq!(f.host_registry.active_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn feature_errors_do_not_end_the_stream() {
    let f = fixture();
    f.broker.register("flaky", |_input, sink: EventSink| {
        sink.emit(json!("first"));
        sink.error(&anyhow::anyhow!("transient"));
        sink.emit(json!("second"));
        sink.complete();
        Ok(StopHandle::noop())
    });

    let items = f
        .client
        .stream("flaky", Value::Null)
        .await
        .expect("subscribe")
        .collect::<Vec<_>>()
        .await;
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_ref().ok(), Some(&json!("first")));
    assert_eq!(
        items[1].as_ref().err().map(|e| e.message.as_str()),
        Some("transient")
    );
    assert_eq!(items[2].as_ref().ok(), Some(&json!("second")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_backed_features_complete_with_their_stream() {
    let f = fixture();
    f.broker.register_stream("letters", |input: Value| {
        let upto = input.as_u64().unwrap_or(0) as u8;
        Ok(futures_util::stream::iter(
            (0..upto).map(|n| Ok::<_, anyhow::Error>(json!(char::from(b'a' + n).to_string()))),
        ))
    });

    let items = f
        .client
        .stream("letters", json!(3))
        .await
        .expect("subscribe")
        .map(|item| item.expect("event"))
        .collect::<Vec<_>>()
        .await;
    assert_eq!(items, vec![json!("a"), json!("b"), json!("c")]);
    eventually(|| f.host_registry.active_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registry_shutdown_ends_every_subscription() {
    let f = fixture();
    let mut streams = Vec::new();
    for _ in 0..3 {
        streams.push(
            f.client
                .stream("ticker", json!({"count": 0}))
                .await
                .expect("subscribe"),
        );
    }
    eventually(|| {
        let records = f.host_registry.active_subscriptions();
        records.len() == 3 && records.iter().all(|r| r.started)
    })
    .await;

    f.host_registry.shutdown();
    for stream in &mut streams {
        assert!(next_item(stream).await.is_none());
    }
    eventually(|| f.teardowns.load(Ordering::SeqCst) == 3).await;
    assert_eq!(f.host_registry.active_count(), 0);

    let late = f.client.stream("ticker", json!({"count": 2})).await;
    assert!(matches!(late, Err(hostlink_ipc::SubscribeError::Remote(_))));
    assert_eq!(f.host_registry.active_count(), 0);
    assert_eq!(f.teardowns.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thousand_concurrent_subscriptions_keep_ceilings_ahead() {
    let f = fixture();
    let mut streams = Vec::new();
    for n in 0..1_000u64 {
        let name = format!("echo-{n}");
        f.broker.register(&name, |input: Value, sink: EventSink| {
            sink.emit(input);
            Ok(StopHandle::new(move || drop(sink)))
        });
        let stream = f.client.stream(&name, json!(n)).await.expect("subscribe");
        streams.push(stream);

        let host_events = f.host.events();
        assert!(host_events.max_listeners() >= 2 * host_events.listener_count());
        let consumer_events = f.consumer.events();
        assert!(consumer_events.max_listeners() >= 2 * consumer_events.listener_count());
    }
    assert_eq!(f.host_registry.active_count(), 1_000);
    let names = f
        .host_registry
        .active_subscriptions()
        .into_iter()
        .map(|record| record.logical_name)
        .collect::<std::collections::HashSet<_>>();
    assert_eq!(names.len(), 1_000);

    for (n, stream) in streams.iter_mut().enumerate() {
        let item = next_item(stream).await.expect("item").expect("event");
        assert_eq!(item, json!(n));
    }

    let raised = f.host.events().max_listeners();
    drop(streams);
    eventually(|| f.host_registry.active_count() == 0).await;
    assert_eq!(f.host.events().max_listeners(), raised);
    assert_eq!(f.host_registry.governor().registered(), 0);
}
