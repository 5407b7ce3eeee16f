//! Unix-domain-socket transport.
//!
//! Frames are newline-delimited [`WireEnvelope`]s. Each accepted connection
//! is one endpoint: EOF destroys it and a `navigate` frame reports a reload.

use crate::error::TransportError;
use crate::hub::EventHub;
use crate::transport::{
    ConsumerTransport, Endpoint, EndpointId, HostTransport, InvokeHandler, Lifecycle,
};
use futures_util::future::BoxFuture;
use hostlink_core::frame::{InvokePayload, ReplyPayload, SendPayload};
use hostlink_core::{
    decode_frame, encode_frame, WireEnvelope, WireMsg, CURRENT_PROTOCOL_VERSION,
    DEFAULT_MAX_FRAME_BYTES,
};
use serde_json::Value;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use std::{fs, io};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct SocketHostConfig {
    pub socket_path: PathBuf,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

impl SocketHostConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

pub struct SocketHost {
    config: SocketHostConfig,
    handlers: RwLock<HashMap<String, InvokeHandler>>,
    events: Arc<EventHub<Value>>,
    endpoints: Mutex<HashMap<EndpointId, Arc<SocketEndpoint>>>,
    next_endpoint: AtomicU64,
}

impl SocketHost {
    pub fn new(config: SocketHostConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            handlers: RwLock::new(HashMap::new()),
            events: EventHub::new(),
            endpoints: Mutex::new(HashMap::new()),
            next_endpoint: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &SocketHostConfig {
        &self.config
    }

    fn endpoints_guard(&self) -> MutexGuard<'_, HashMap<EndpointId, Arc<SocketEndpoint>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self, channel: &str) -> Option<InvokeHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
    }

    /// Accepts connections until `shutdown` flips to `true`.
    pub async fn serve(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let socket_path = self.config.socket_path.clone();
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)?;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
        }
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        let listener = UnixListener::bind(&socket_path)?;
        let _ = fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600));

        info!(
            event = "hostlink_socket_start",
            socket = %socket_path.display(),
            queue_capacity = self.config.queue_capacity
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, _addr)) => {
                            let host = Arc::clone(&self);
                            tokio::spawn(async move {
                                host.handle_connection(stream).await;
                            });
                        }
                        Err(err) => {
                            warn!(event = "hostlink_socket_accept_error", error = %err);
                        }
                    }
                }
            }
        }

        let _ = fs::remove_file(&socket_path);
        info!(event = "hostlink_socket_stop", socket = %socket_path.display());
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let id = self.next_endpoint.fetch_add(1, Ordering::SeqCst) + 1;
        let label = format!("endpoint-{id}");
        let (reader_half, writer_half) = stream.into_split();
        let mut reader = BufReader::new(reader_half);

        let (tx, rx) = mpsc::channel::<WireEnvelope>(self.config.queue_capacity);
        let writer_task = tokio::spawn(writer_loop(
            label.clone(),
            writer_half,
            rx,
            self.config.write_timeout,
        ));

        let endpoint = Arc::new(SocketEndpoint {
            id,
            sender: tx,
            destroyed: AtomicBool::new(false),
            lifecycle: EventHub::new(),
            kick: Notify::new(),
        });
        self.endpoints_guard().insert(id, Arc::clone(&endpoint));
        debug!(event = "hostlink_socket_connected", endpoint = id);

        loop {
            let envelope = tokio::select! {
                frame = read_next_valid_frame(&mut reader, &label) => frame,
                _ = endpoint.kick.notified() => None,
            };
            let Some(envelope) = envelope else {
                break;
            };
            if envelope.version > CURRENT_PROTOCOL_VERSION {
                warn!(
                    event = "hostlink_socket_skip_version",
                    endpoint = id,
                    version = envelope.version
                );
                continue;
            }

            match envelope.msg {
                WireMsg::Invoke(invoke) => self.dispatch_invoke(&endpoint, invoke),
                WireMsg::Send(send) => {
                    self.events.emit(&send.channel, send.payload);
                }
                WireMsg::Navigate => {
                    endpoint
                        .lifecycle
                        .emit(Lifecycle::Navigated.channel(), ());
                }
                WireMsg::Reply(_) => {
                    debug!(event = "hostlink_socket_ignored_message", endpoint = id);
                }
            }
        }

        self.endpoints_guard().remove(&id);
        endpoint.destroy();
        drop(endpoint);
        let _ = writer_task.await;
        debug!(event = "hostlink_socket_disconnected", endpoint = id);
    }

    fn dispatch_invoke(&self, endpoint: &Arc<SocketEndpoint>, invoke: InvokePayload) {
        let InvokePayload {
            id,
            channel,
            payload,
        } = invoke;
        let Some(handler) = self.handler(&channel) else {
            debug!(event = "hostlink_socket_no_handler", endpoint = endpoint.id, channel = %channel);
            endpoint.push(WireEnvelope::new(WireMsg::Reply(ReplyPayload {
                id,
                payload: Value::Null,
                rejected: Some(TransportError::NoHandler(channel).to_string()),
            })));
            return;
        };
        let endpoint = Arc::clone(endpoint);
        tokio::spawn(async move {
            let target: Arc<dyn Endpoint> = endpoint.clone();
            let reply = handler(target, payload).await;
            endpoint.push(WireEnvelope::new(WireMsg::Reply(ReplyPayload {
                id,
                payload: reply,
                rejected: None,
            })));
        });
    }
}

impl HostTransport for SocketHost {
    fn handle(&self, channel: &str, handler: InvokeHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string(), handler);
    }

    fn events(&self) -> &Arc<EventHub<Value>> {
        &self.events
    }

    fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        self.endpoints_guard()
            .values()
            .map(|endpoint| Arc::clone(endpoint) as Arc<dyn Endpoint>)
            .collect()
    }
}

struct SocketEndpoint {
    id: EndpointId,
    sender: mpsc::Sender<WireEnvelope>,
    destroyed: AtomicBool,
    lifecycle: Arc<EventHub<()>>,
    kick: Notify,
}

impl SocketEndpoint {
    /// Queues a frame; a consumer that cannot keep up is disconnected.
    fn push(&self, envelope: WireEnvelope) {
        match self.sender.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => self.destroy(),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "hostlink_socket_backpressure", endpoint = self.id);
                self.destroy();
                self.kick.notify_one();
            }
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lifecycle.emit(Lifecycle::Destroyed.channel(), ());
    }
}

impl Endpoint for SocketEndpoint {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn send(&self, channel: &str, payload: Value) {
        if self.is_destroyed() {
            return;
        }
        self.push(WireEnvelope::new(WireMsg::Send(SendPayload {
            channel: channel.to_string(),
            payload,
        })));
    }

    fn lifecycle(&self) -> &Arc<EventHub<()>> {
        &self.lifecycle
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<ReplyPayload>>,
}

fn lock_pending(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consumer half of the socket transport.
pub struct SocketConsumer {
    writer: mpsc::Sender<WireEnvelope>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    events: Arc<EventHub<Value>>,
    reader_task: JoinHandle<()>,
}

impl SocketConsumer {
    pub async fn connect(path: impl AsRef<Path>) -> io::Result<Arc<Self>> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (reader_half, writer_half) = stream.into_split();
        let label = format!("consumer:{}", path.as_ref().display());

        let (writer, rx) = mpsc::channel::<WireEnvelope>(DEFAULT_QUEUE_CAPACITY);
        tokio::spawn(writer_loop(
            label.clone(),
            writer_half,
            rx,
            DEFAULT_WRITE_TIMEOUT,
        ));

        let pending = Arc::new(Mutex::new(Pending::default()));
        let events = EventHub::new();
        let reader_task = tokio::spawn(consumer_reader(
            label,
            BufReader::new(reader_half),
            Arc::clone(&pending),
            Arc::clone(&events),
        ));

        Ok(Arc::new(Self {
            writer,
            pending,
            next_id: AtomicU64::new(0),
            events,
            reader_task,
        }))
    }

    /// Tells the host this consumer reloaded; its subscriptions end.
    pub fn navigate(&self) -> Result<(), TransportError> {
        self.enqueue(WireEnvelope::new(WireMsg::Navigate))
    }

    pub fn is_closed(&self) -> bool {
        lock_pending(&self.pending).closed
    }

    fn enqueue(&self, envelope: WireEnvelope) -> Result<(), TransportError> {
        self.writer.try_send(envelope).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

impl ConsumerTransport for SocketConsumer {
    fn invoke(&self, channel: &str, payload: Value) -> BoxFuture<'static, Result<Value, TransportError>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        let registered = {
            let mut pending = lock_pending(&self.pending);
            if pending.closed {
                false
            } else {
                pending.waiters.insert(id, tx);
                true
            }
        };
        let writer = self.writer.clone();
        let envelope = WireEnvelope::new(WireMsg::Invoke(InvokePayload {
            id,
            channel: channel.to_string(),
            payload,
        }));
        Box::pin(async move {
            if !registered {
                return Err(TransportError::Closed);
            }
            writer
                .send(envelope)
                .await
                .map_err(|_| TransportError::Closed)?;
            let reply = rx.await.map_err(|_| TransportError::Closed)?;
            match reply.rejected {
                Some(reason) => Err(TransportError::Rejected(reason)),
                None => Ok(reply.payload),
            }
        })
    }

    fn send(&self, channel: &str, payload: Value) -> Result<(), TransportError> {
        self.enqueue(WireEnvelope::new(WireMsg::Send(SendPayload {
            channel: channel.to_string(),
            payload,
        })))
    }

    fn events(&self) -> &Arc<EventHub<Value>> {
        &self.events
    }
}

impl Drop for SocketConsumer {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn consumer_reader(
    label: String,
    mut reader: BufReader<OwnedReadHalf>,
    pending: Arc<Mutex<Pending>>,
    events: Arc<EventHub<Value>>,
) {
    while let Some(envelope) = read_next_valid_frame(&mut reader, &label).await {
        match envelope.msg {
            WireMsg::Reply(reply) => {
                let waiter = lock_pending(&pending).waiters.remove(&reply.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => debug!(event = "hostlink_socket_orphan_reply", conn = %label, id = reply.id),
                }
            }
            WireMsg::Send(send) => {
                events.emit(&send.channel, send.payload);
            }
            WireMsg::Invoke(_) | WireMsg::Navigate => {
                debug!(event = "hostlink_socket_ignored_message", conn = %label);
            }
        }
    }
    let mut pending = lock_pending(&pending);
    pending.closed = true;
    pending.waiters.clear();
    debug!(event = "hostlink_socket_closed", conn = %label);
}

async fn writer_loop(
    label: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<WireEnvelope>,
    write_timeout: Duration,
) {
    while let Some(envelope) = rx.recv().await {
        let frame = match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hostlink_socket_encode_error", conn = %label, error = %err);
                continue;
            }
        };
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "hostlink_socket_write_error", conn = %label, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "hostlink_socket_write_timeout", conn = %label);
                break;
            }
        }
    }
}

async fn read_next_valid_frame(reader: &mut BufReader<OwnedReadHalf>, label: &str) -> Option<WireEnvelope> {
    loop {
        let mut line = Vec::new();
        let n = match reader.read_until(b'\n', &mut line).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hostlink_socket_read_error", conn = %label, error = %err);
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match decode_frame::<WireEnvelope>(&line, DEFAULT_MAX_FRAME_BYTES) {
            Ok(envelope) => return Some(envelope),
            Err(err) => {
                warn!(event = "hostlink_socket_decode_error", conn = %label, error = %err);
                continue;
            }
        }
    }
}
