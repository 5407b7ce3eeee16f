//! The two transport primitives (invoke with one reply, fire-and-forget send)
//! plus endpoint lifecycle notifications, as seen from each side.

use crate::error::TransportError;
use crate::hub::EventHub;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

pub type EndpointId = u64;

/// Host-side handler for invokes on one channel. Always produces a reply.
pub type InvokeHandler =
    Arc<dyn Fn(Arc<dyn Endpoint>, Value) -> BoxFuture<'static, Value> + Send + Sync>;

/// Boxes an async closure into an [`InvokeHandler`].
pub fn invoke_handler<F, Fut>(handler: F) -> InvokeHandler
where
    F: Fn(Arc<dyn Endpoint>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Value> + Send + 'static,
{
    Arc::new(
        move |endpoint: Arc<dyn Endpoint>, payload: Value| -> BoxFuture<'static, Value> {
            Box::pin(handler(endpoint, payload))
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// The consumer endpoint is gone for good.
    Destroyed,
    /// The consumer navigated away or reloaded; its listeners are gone.
    Navigated,
}

impl Lifecycle {
    pub const fn channel(self) -> &'static str {
        match self {
            Lifecycle::Destroyed => "destroyed",
            Lifecycle::Navigated => "did-navigate",
        }
    }
}

/// A connected consumer as seen by the host.
pub trait Endpoint: Send + Sync {
    fn id(&self) -> EndpointId;

    /// Fire-and-forget delivery to the consumer. Dropped once destroyed.
    fn send(&self, channel: &str, payload: Value);

    /// Lifecycle notifications, keyed by [`Lifecycle::channel`].
    fn lifecycle(&self) -> &Arc<EventHub<()>>;

    fn is_destroyed(&self) -> bool;
}

pub trait HostTransport: Send + Sync {
    /// Installs the invoke handler for `channel`, replacing any previous one.
    fn handle(&self, channel: &str, handler: InvokeHandler);

    /// Messages sent by consumers.
    fn events(&self) -> &Arc<EventHub<Value>>;

    /// Currently connected, not yet destroyed endpoints.
    fn endpoints(&self) -> Vec<Arc<dyn Endpoint>>;
}

pub trait ConsumerTransport: Send + Sync {
    fn invoke(&self, channel: &str, payload: Value) -> BoxFuture<'static, Result<Value, TransportError>>;

    fn send(&self, channel: &str, payload: Value) -> Result<(), TransportError>;

    /// Messages sent by the host to this consumer.
    fn events(&self) -> &Arc<EventHub<Value>>;
}
