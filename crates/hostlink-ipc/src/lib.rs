//! Call and subscription multiplexing over a two-primitive transport
//! (invoke with a single reply, fire-and-forget send).

pub mod broadcast;
pub mod call;
pub mod error;
pub mod governor;
pub mod hub;
pub mod local;
pub mod registry;
#[cfg(unix)]
pub mod socket;
pub mod subscription;
pub mod transport;

pub use broadcast::{BroadcastChannel, BroadcastListener, BroadcastReceiver, Broadcaster};
pub use call::{CallGateway, CallInvoker, Caller};
pub use error::{CallError, SubscribeError, TransportError};
pub use governor::{Governed, ListenerGovernor, Reservation};
pub use hub::{EventHub, Listener, ListenerCapacity, DEFAULT_MAX_LISTENERS};
pub use local::{LocalConsumer, LocalHost};
pub use registry::{Registry, SubscriptionRecord};
#[cfg(unix)]
pub use socket::{SocketConsumer, SocketHost, SocketHostConfig};
pub use subscription::{
    EventSink, StopHandle, Subscription, SubscriptionBroker, SubscriptionClient, SubscriptionStream,
};
pub use transport::{
    invoke_handler, ConsumerTransport, Endpoint, EndpointId, HostTransport, InvokeHandler,
    Lifecycle,
};
