//! Fire-and-forget events from the host to every connected consumer.

use crate::error::TransportError;
use crate::governor::Governed;
use crate::hub::Listener;
use crate::registry::Registry;
use crate::transport::{ConsumerTransport, HostTransport};
use hostlink_core::{channel_name, ChannelKind};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

type LocalHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// One named broadcast event. Emitting reaches local handlers first, then
/// every connected endpoint.
pub struct BroadcastChannel {
    name: String,
    wire: String,
    transport: Arc<dyn HostTransport>,
    next_handler: AtomicU64,
    handlers: Mutex<Vec<(u64, LocalHandler)>>,
}

impl BroadcastChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn handlers(&self) -> MutexGuard<'_, Vec<(u64, LocalHandler)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an in-process handler; returns its id for [`BroadcastChannel::off`].
    pub fn on<F>(&self, handler: F) -> u64
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_handler.fetch_add(1, Ordering::SeqCst) + 1;
        self.handlers().push((id, Arc::new(handler)));
        id
    }

    pub fn off(&self, id: u64) -> bool {
        let mut handlers = self.handlers();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Returns how many endpoints the event was sent to.
    pub fn emit(&self, payload: Value) -> usize {
        let handlers = self
            .handlers()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect::<Vec<_>>();
        for handler in handlers {
            handler(&payload);
        }
        let endpoints = self.transport.endpoints();
        for endpoint in &endpoints {
            endpoint.send(&self.wire, payload.clone());
        }
        debug!(event = "broadcast_emitted", name = %self.name, endpoints = endpoints.len());
        endpoints.len()
    }
}

/// Host-side registry of broadcast channels.
pub struct Broadcaster {
    transport: Arc<dyn HostTransport>,
    channels: Mutex<HashMap<String, Arc<BroadcastChannel>>>,
}

impl Broadcaster {
    pub fn new(transport: Arc<dyn HostTransport>) -> Self {
        Self {
            transport,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the channel for `name`, creating it on first use.
    pub fn register(&self, name: &str) -> Arc<BroadcastChannel> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = channels.entry(name.to_string()).or_insert_with(|| {
            Arc::new(BroadcastChannel {
                name: name.to_string(),
                wire: channel_name(ChannelKind::BroadcastEvent, name),
                transport: Arc::clone(&self.transport),
                next_handler: AtomicU64::new(0),
                handlers: Mutex::new(Vec::new()),
            })
        });
        Arc::clone(channel)
    }

    pub fn emit(&self, name: &str, payload: Value) -> usize {
        self.register(name).emit(payload)
    }
}

/// Consumer-side access to broadcast events.
#[derive(Clone)]
pub struct BroadcastListener {
    transport: Arc<dyn ConsumerTransport>,
    registry: Arc<Registry>,
}

impl BroadcastListener {
    pub fn new(transport: Arc<dyn ConsumerTransport>, registry: Arc<Registry>) -> Self {
        Self {
            transport,
            registry,
        }
    }

    pub fn listen(&self, name: &str) -> Result<BroadcastReceiver, TransportError> {
        let listener = self.registry.governor().listen(
            self.transport.events(),
            &channel_name(ChannelKind::BroadcastEvent, name),
        )?;
        Ok(BroadcastReceiver { listener })
    }
}

pub struct BroadcastReceiver {
    listener: Governed<Listener<Value>>,
}

impl BroadcastReceiver {
    pub async fn recv(&mut self) -> Option<Value> {
        self.listener.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.listener.try_recv()
    }
}
