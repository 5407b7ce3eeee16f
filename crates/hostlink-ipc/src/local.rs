//! In-process transport: host and consumers live in one process and talk
//! through event hubs. Used by embedders that run both halves together and
//! by the protocol tests.

use crate::error::TransportError;
use crate::hub::EventHub;
use crate::transport::{
    ConsumerTransport, Endpoint, EndpointId, HostTransport, InvokeHandler, Lifecycle,
};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::debug;

pub struct LocalHost {
    handlers: RwLock<HashMap<String, InvokeHandler>>,
    events: Arc<EventHub<Value>>,
    endpoints: Mutex<HashMap<EndpointId, Arc<LocalEndpoint>>>,
    next_endpoint: AtomicU64,
}

impl LocalHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            events: EventHub::new(),
            endpoints: Mutex::new(HashMap::new()),
            next_endpoint: AtomicU64::new(0),
        })
    }

    /// Opens a new consumer attached to this host.
    pub fn connect(self: &Arc<Self>) -> LocalConsumer {
        let id = self.next_endpoint.fetch_add(1, Ordering::SeqCst) + 1;
        let inbox = EventHub::new();
        let endpoint = Arc::new(LocalEndpoint {
            id,
            destroyed: AtomicBool::new(false),
            lifecycle: EventHub::new(),
            inbox: Arc::clone(&inbox),
        });
        self.endpoints_guard().insert(id, Arc::clone(&endpoint));
        debug!(event = "local_endpoint_connected", endpoint = id);
        LocalConsumer {
            host: Arc::clone(self),
            endpoint,
            inbox,
        }
    }

    fn endpoints_guard(&self) -> MutexGuard<'_, HashMap<EndpointId, Arc<LocalEndpoint>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self, channel: &str) -> Option<InvokeHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
    }
}

impl HostTransport for LocalHost {
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

pub struct LocalEndpoint {
    id: EndpointId,
    destroyed: AtomicBool,
    lifecycle: Arc<EventHub<()>>,
    inbox: Arc<EventHub<Value>>,
}

impl Endpoint for LocalEndpoint {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn send(&self, channel: &str, payload: Value) {
        if self.is_destroyed() {
            return;
        }
        self.inbox.emit(channel, payload);
    }

    fn lifecycle(&self) -> &Arc<EventHub<()>> {
        &self.lifecycle
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Consumer half of the in-process transport. Dropping it destroys its
/// endpoint.
pub struct LocalConsumer {
    host: Arc<LocalHost>,
    endpoint: Arc<LocalEndpoint>,
    inbox: Arc<EventHub<Value>>,
}

impl LocalConsumer {
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id
    }

    /// Simulates the consumer reloading: the host sees a navigation event.
    pub fn navigate(&self) {
        if self.endpoint.is_destroyed() {
            return;
        }
        self.endpoint
            .lifecycle
            .emit(Lifecycle::Navigated.channel(), ());
    }

    pub fn destroy(&self) {
        if self.endpoint.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.host.endpoints_guard().remove(&self.endpoint.id);
        self.endpoint
            .lifecycle
            .emit(Lifecycle::Destroyed.channel(), ());
        debug!(event = "local_endpoint_destroyed", endpoint = self.endpoint.id);
    }
}

impl ConsumerTransport for LocalConsumer {
    fn invoke(&self, channel: &str, payload: Value) -> BoxFuture<'static, Result<Value, TransportError>> {
        let handler = self.host.handler(channel);
        let endpoint: Arc<dyn Endpoint> = self.endpoint.clone();
        let channel = channel.to_string();
        Box::pin(async move {
            if endpoint.is_destroyed() {
                return Err(TransportError::EndpointDestroyed);
            }
            let handler = handler.ok_or(TransportError::NoHandler(channel))?;
            Ok(handler(endpoint, payload).await)
        })
    }

    fn send(&self, channel: &str, payload: Value) -> Result<(), TransportError> {
        if self.endpoint.is_destroyed() {
            return Err(TransportError::EndpointDestroyed);
        }
        self.host.events.emit(channel, payload);
        Ok(())
    }

    fn events(&self) -> &Arc<EventHub<Value>> {
        &self.inbox
    }
}

impl Drop for LocalConsumer {
    fn drop(&mut self) {
        self.destroy();
    }
}
