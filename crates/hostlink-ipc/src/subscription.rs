//! Long-lived event streams.
//!
//! A subscribe request allocates an ephemeral channel and replies with its
//! name; nothing on the feature side exists until the client sends `"start"`
//! on that channel. From then on events flow host to client in order until
//! one of the termination triggers fires:
//!
//! * the client sends `"stop"` (or drops its stream),
//! * the requesting endpoint is destroyed or navigates away,
//! * the registry shuts down,
//! * the feature completes.
//!
//! Whatever fires first ends the subscription task, which runs the feature's
//! stop handle exactly once and drops every listener it held.

use crate::error::{SubscribeError, TransportError};
use crate::governor::Governed;
use crate::hub::Listener;
use crate::registry::{shutdown_requested, Registry, SubscriptionRecord};
use crate::transport::{invoke_handler, ConsumerTransport, Endpoint, HostTransport, Lifecycle};
use futures_util::{Stream, StreamExt};
use hostlink_core::{
    channel_name, wrap_error, CallEnvelope, ChannelKind, ControlSignal, RemoteError, StreamEvent,
    StreamFrame, WrappedError,
};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{ready, Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Releases whatever a feature acquired when its subscription started.
/// Runs at most once, either through [`StopHandle::run`] or on drop.
#[must_use]
pub struct StopHandle(Option<Box<dyn FnOnce() + Send>>);

impl StopHandle {
    pub fn new<F>(stop: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Some(Box::new(stop)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    /// Aborts `task` on stop.
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self::new(move || task.abort())
    }

    pub fn run(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(stop) = self.0.take() {
            stop();
        }
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.fire();
    }
}

enum SinkItem {
    Event(Value),
    Error(WrappedError),
    Complete,
}

/// Feature-side handle for pushing events into one subscription.
///
/// The subscription completes when [`EventSink::complete`] is called or when
/// every clone of the sink has been dropped.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SinkItem>,
}

impl EventSink {
    fn channel() -> (Self, mpsc::UnboundedReceiver<SinkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues one event. Returns `false` once the subscription has ended.
    pub fn emit(&self, message: Value) -> bool {
        self.tx.send(SinkItem::Event(message)).is_ok()
    }

    /// Queues an error event. The subscription stays open.
    pub fn error(&self, err: &anyhow::Error) -> bool {
        self.tx.send(SinkItem::Error(wrap_error(err))).is_ok()
    }

    pub fn emit_result(&self, result: anyhow::Result<Value>) -> bool {
        match result {
            Ok(message) => self.emit(message),
            Err(err) => self.error(&err),
        }
    }

    pub fn complete(&self) {
        let _ = self.tx.send(SinkItem::Complete);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type SubscribeFn = Arc<dyn Fn(Value, EventSink) -> anyhow::Result<StopHandle> + Send + Sync>;

/// Host side: accepts subscribe requests and runs one task per subscription.
#[derive(Clone)]
pub struct SubscriptionBroker {
    transport: Arc<dyn HostTransport>,
    registry: Arc<Registry>,
}

impl SubscriptionBroker {
    pub fn new(transport: Arc<dyn HostTransport>, registry: Arc<Registry>) -> Self {
        Self {
            transport,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Registers a feature under `name`. `subscribe` runs when the client
    /// sends `"start"`, receives the request input and a sink, and returns
    /// the handle that releases the feature's resources.
    pub fn register<F>(&self, name: &str, subscribe: F)
    where
        F: Fn(Value, EventSink) -> anyhow::Result<StopHandle> + Send + Sync + 'static,
    {
        let subscribe: SubscribeFn = Arc::new(subscribe);
        // The handler is owned by the transport, so it must not keep it alive.
        let transport: Weak<dyn HostTransport> = Arc::downgrade(&self.transport);
        let registry = Arc::clone(&self.registry);
        let logical_name = name.to_string();
        self.transport.handle(
            &channel_name(ChannelKind::SubscriptionControl, name),
            invoke_handler(move |endpoint: Arc<dyn Endpoint>, input: Value| {
                let transport = transport.upgrade();
                let registry = Arc::clone(&registry);
                let subscribe = Arc::clone(&subscribe);
                let logical_name = logical_name.clone();
                async move {
                    let opened = match transport {
                        Some(transport) => open_session(
                            transport.as_ref(),
                            &registry,
                            &logical_name,
                            subscribe,
                            endpoint,
                            input,
                        ),
                        None => Err(TransportError::Closed.into()),
                    };
                    match opened {
                        Ok(channel) => CallEnvelope::Value(Value::String(channel)).to_value(),
                        Err(err) => {
                            debug!(
                                event = "subscription_rejected",
                                name = %logical_name,
                                error = %format!("{err:#}")
                            );
                            CallEnvelope::from_result(Err(err)).to_value()
                        }
                    }
                }
            }),
        );
    }

    /// Registers a feature whose events come from a stream. The stream is
    /// polled in its own task; its end completes the subscription and
    /// stopping the subscription drops it.
    pub fn register_stream<F, S>(&self, name: &str, open: F)
    where
        F: Fn(Value) -> anyhow::Result<S> + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(name, move |input, sink| {
            let stream = open(input)?;
            let task = tokio::spawn(async move {
                let mut stream = Box::pin(stream);
                while let Some(item) = stream.next().await {
                    if !sink.emit_result(item) {
                        return;
                    }
                }
                sink.complete();
            });
            Ok(StopHandle::from_task(task))
        });
    }
}

fn open_session(
    transport: &dyn HostTransport,
    registry: &Arc<Registry>,
    logical_name: &str,
    subscribe: SubscribeFn,
    endpoint: Arc<dyn Endpoint>,
    input: Value,
) -> anyhow::Result<String> {
    if registry.is_shut_down() {
        return Err(TransportError::Closed.into());
    }
    let channel = registry.allocate_channel(logical_name);
    let governor = registry.governor();
    let control = governor.listen(transport.events(), &channel)?;
    let destroyed = governor.listen(endpoint.lifecycle(), Lifecycle::Destroyed.channel())?;
    let navigated = governor.listen(endpoint.lifecycle(), Lifecycle::Navigated.channel())?;
    if endpoint.is_destroyed() {
        return Err(TransportError::EndpointDestroyed.into());
    }

    registry.track(SubscriptionRecord {
        logical_name: logical_name.to_string(),
        channel: channel.clone(),
        endpoint: endpoint.id(),
        started: false,
    });
    debug!(
        event = "subscription_accepted",
        name = logical_name,
        channel = %channel,
        endpoint = endpoint.id()
    );

    let session = Session {
        logical_name: logical_name.to_string(),
        channel: channel.clone(),
        input,
        endpoint,
        registry: Arc::clone(registry),
        subscribe,
        control,
        destroyed,
        navigated,
        shutdown: registry.shutdown_signal(),
    };
    tokio::spawn(session.run());
    Ok(channel)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Stop,
    Destroyed,
    Navigated,
    Shutdown,
    Completed,
    SetupFailed,
    TransportClosed,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Stop => "stop",
            Trigger::Destroyed => "destroyed",
            Trigger::Navigated => "navigated",
            Trigger::Shutdown => "shutdown",
            Trigger::Completed => "completed",
            Trigger::SetupFailed => "setup_failed",
            Trigger::TransportClosed => "transport_closed",
        }
    }

    /// Whether the client still needs to be told the stream is over.
    fn sends_sentinel(self) -> bool {
        matches!(
            self,
            Trigger::Completed | Trigger::SetupFailed | Trigger::Shutdown
        )
    }
}

struct Session {
    logical_name: String,
    channel: String,
    input: Value,
    endpoint: Arc<dyn Endpoint>,
    registry: Arc<Registry>,
    subscribe: SubscribeFn,
    control: Governed<Listener<Value>>,
    destroyed: Governed<Listener<()>>,
    navigated: Governed<Listener<()>>,
    shutdown: watch::Receiver<bool>,
}

fn deliver(endpoint: &dyn Endpoint, channel: &str, frame: StreamFrame) {
    endpoint.send(channel, frame.to_value());
}

fn ignore_signal(channel: &str, signal: &Value) {
    debug!(event = "control_signal_ignored", channel, signal = %signal);
}

impl Session {
    async fn run(mut self) {
        if let Some(trigger) = self.await_start().await {
            self.finish(trigger, None);
            return;
        }
        self.registry.mark_started(&self.channel);
        debug!(event = "subscription_started", name = %self.logical_name, channel = %self.channel);

        let (sink, mut items) = EventSink::channel();
        let input = self.input.take();
        let subscribe = Arc::clone(&self.subscribe);
        let setup = match catch_unwind(AssertUnwindSafe(|| subscribe(input, sink))) {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "subscribe handler for {} panicked",
                self.logical_name
            )),
        };
        let stop = match setup {
            Ok(stop) => stop,
            Err(err) => {
                debug!(
                    event = "subscription_setup_failed",
                    name = %self.logical_name,
                    error = %format!("{err:#}")
                );
                deliver(
                    self.endpoint.as_ref(),
                    &self.channel,
                    StreamFrame::Event(StreamEvent::error(wrap_error(&err))),
                );
                self.finish(Trigger::SetupFailed, None);
                return;
            }
        };

        let trigger = self.pump(&mut items).await;
        self.finish(trigger, Some(stop));
    }

    /// Waits for `"start"`; returns the trigger if the subscription ends first.
    async fn await_start(&mut self) -> Option<Trigger> {
        loop {
            tokio::select! {
                signal = self.control.recv() => {
                    let Some(signal) = signal else {
                        return Some(Trigger::TransportClosed);
                    };
                    match ControlSignal::from_value(&signal) {
                        Some(ControlSignal::Start) => return None,
                        Some(ControlSignal::Stop) => return Some(Trigger::Stop),
                        None => ignore_signal(&self.channel, &signal),
                    }
                }
                _ = self.destroyed.recv() => return Some(Trigger::Destroyed),
                _ = self.navigated.recv() => return Some(Trigger::Navigated),
                _ = shutdown_requested(&mut self.shutdown) => return Some(Trigger::Shutdown),
            }
        }
    }

    /// Forwards feature events until a trigger fires. Triggers are polled
    /// ahead of queued events so a busy feature cannot hold off its stop.
    async fn pump(&mut self, items: &mut mpsc::UnboundedReceiver<SinkItem>) -> Trigger {
        loop {
            tokio::select! {
                biased;
                signal = self.control.recv() => {
                    let Some(signal) = signal else {
                        return Trigger::TransportClosed;
                    };
                    match ControlSignal::from_value(&signal) {
                        Some(ControlSignal::Stop) => return Trigger::Stop,
                        Some(ControlSignal::Start) => {
                            debug!(event = "duplicate_start_ignored", channel = %self.channel);
                        }
                        None => ignore_signal(&self.channel, &signal),
                    }
                }
                _ = self.destroyed.recv() => return Trigger::Destroyed,
                _ = self.navigated.recv() => return Trigger::Navigated,
                _ = shutdown_requested(&mut self.shutdown) => return Trigger::Shutdown,
                item = items.recv() => match item {
                    Some(SinkItem::Event(message)) => deliver(
                        self.endpoint.as_ref(),
                        &self.channel,
                        StreamFrame::Event(StreamEvent::message(message)),
                    ),
                    Some(SinkItem::Error(error)) => deliver(
                        self.endpoint.as_ref(),
                        &self.channel,
                        StreamFrame::Event(StreamEvent::error(error)),
                    ),
                    Some(SinkItem::Complete) | None => return Trigger::Completed,
                },
            }
        }
    }

    fn finish(self, trigger: Trigger, stop: Option<StopHandle>) {
        if trigger.sends_sentinel() && !self.endpoint.is_destroyed() {
            deliver(self.endpoint.as_ref(), &self.channel, StreamFrame::End);
        }
        if let Some(stop) = stop {
            if catch_unwind(AssertUnwindSafe(|| stop.run())).is_err() {
                warn!(
                    event = "subscription_stop_panicked",
                    name = %self.logical_name,
                    channel = %self.channel
                );
            }
        }
        self.registry.release(&self.channel);
        debug!(
            event = "subscription_ended",
            name = %self.logical_name,
            channel = %self.channel,
            trigger = trigger.as_str()
        );
    }
}

/// Sends `"stop"` for one subscription at most once. A received sentinel
/// retires it without sending anything.
struct StopToken {
    channel: String,
    transport: Arc<dyn ConsumerTransport>,
    stopped: AtomicBool,
}

impl StopToken {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self
            .transport
            .send(&self.channel, ControlSignal::Stop.to_value())
        {
            debug!(event = "subscription_stop_unsent", channel = %self.channel, error = %err);
        }
    }

    fn retire(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Consumer side: opens subscriptions against a broker.
#[derive(Clone)]
pub struct SubscriptionClient {
    transport: Arc<dyn ConsumerTransport>,
    registry: Arc<Registry>,
}

impl SubscriptionClient {
    pub fn new(transport: Arc<dyn ConsumerTransport>, registry: Arc<Registry>) -> Self {
        Self {
            transport,
            registry,
        }
    }

    /// Opens a subscription and returns its events as a stream. The stream
    /// ends after the broker's sentinel; dropping it stops the subscription.
    pub async fn stream(&self, name: &str, input: Value) -> Result<SubscriptionStream, SubscribeError> {
        let reply = self
            .transport
            .invoke(&channel_name(ChannelKind::SubscriptionControl, name), input)
            .await?;
        let envelope: CallEnvelope = serde_json::from_value(reply)?;
        let channel = match envelope.into_result()? {
            Value::String(channel) => channel,
            other => return Err(SubscribeError::InvalidChannel(other.to_string())),
        };

        let token = Arc::new(StopToken {
            channel: channel.clone(),
            transport: Arc::clone(&self.transport),
            stopped: AtomicBool::new(false),
        });
        let listener = match self
            .registry
            .governor()
            .listen(self.transport.events(), &channel)
        {
            Ok(listener) => listener,
            Err(err) => {
                token.stop();
                return Err(err.into());
            }
        };
        if let Err(err) = self
            .transport
            .send(&channel, ControlSignal::Start.to_value())
        {
            token.retire();
            return Err(err.into());
        }
        Ok(SubscriptionStream {
            listener: Some(listener),
            token,
        })
    }

    /// Opens a subscription and delivers each event to `on_event` as
    /// `(error, message)` from a background task.
    pub async fn subscribe<F>(
        &self,
        name: &str,
        input: Value,
        mut on_event: F,
    ) -> Result<Subscription, SubscribeError>
    where
        F: FnMut(Option<RemoteError>, Option<Value>) + Send + 'static,
    {
        let mut stream = self.stream(name, input).await?;
        let token = Arc::clone(&stream.token);
        let (cancel, mut cancelled) = oneshot::channel::<()>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancelled => break,
                    item = stream.next() => match item {
                        Some(Ok(message)) => on_event(None, Some(message)),
                        Some(Err(err)) => on_event(Some(err), None),
                        None => break,
                    },
                }
            }
        });
        Ok(Subscription {
            token,
            cancel: Mutex::new(Some(cancel)),
        })
    }
}

/// Events of one subscription. Errors delivered by the feature arrive as
/// `Err` items without ending the stream.
pub struct SubscriptionStream {
    listener: Option<Governed<Listener<Value>>>,
    token: Arc<StopToken>,
}

impl SubscriptionStream {
    pub fn channel(&self) -> &str {
        &self.token.channel
    }

    /// Stops the subscription. Safe to call repeatedly or after the stream
    /// has ended.
    pub fn stop(&mut self) {
        self.token.stop();
        self.listener = None;
    }

    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Value, RemoteError>>> {
        loop {
            let raw = match self.listener.as_mut() {
                Some(listener) => ready!(listener.poll_recv(cx)),
                None => return Poll::Ready(None),
            };
            let frame = match raw.map(StreamFrame::from_value) {
                None => StreamFrame::End,
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    debug!(event = "malformed_stream_frame", channel = %self.token.channel, error = %err);
                    continue;
                }
            };
            return match frame {
                StreamFrame::End => {
                    self.token.retire();
                    self.listener = None;
                    Poll::Ready(None)
                }
                StreamFrame::Event(event) => Poll::Ready(Some(match event.error {
                    Some(error) => Err(error.into()),
                    None => Ok(event.message.unwrap_or(Value::Null)),
                })),
            };
        }
    }
}

impl Stream for SubscriptionStream {
    type Item = Result<Value, RemoteError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.token.stop();
    }
}

/// Callback-driven subscription. Dropping it stops the subscription.
#[must_use = "dropping a Subscription stops it"]
pub struct Subscription {
    token: Arc<StopToken>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.token.channel
    }

    /// True once stopped locally or ended by the host.
    pub fn is_stopped(&self) -> bool {
        self.token.is_stopped()
    }

    /// Idempotent; safe after the host has already ended the subscription.
    pub fn stop(&self) {
        self.token.stop();
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}
