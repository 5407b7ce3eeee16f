//! Channel-keyed listener table with a fixed listener ceiling.
//!
//! Both transports deliver inbound messages through an [`EventHub`]. The
//! ceiling exists to surface listener leaks early; components that
//! legitimately hold many listeners raise it through
//! [`crate::governor::ListenerGovernor`].

use crate::error::TransportError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub const DEFAULT_MAX_LISTENERS: usize = 10;

/// A registration API whose listener ceiling can be queried and raised.
pub trait ListenerCapacity: Send + Sync {
    fn max_listeners(&self) -> usize;
    /// Raises the ceiling. Values below the current ceiling are ignored.
    fn set_max_listeners(&self, max: usize);
    fn listener_count(&self) -> usize;
}

struct Slot<T> {
    id: u64,
    tx: mpsc::UnboundedSender<T>,
}

struct HubState<T> {
    max_listeners: usize,
    next_id: u64,
    registered: usize,
    channels: HashMap<String, Vec<Slot<T>>>,
}

pub struct EventHub<T> {
    state: Mutex<HubState<T>>,
}

impl<T> EventHub<T> {
    fn state(&self) -> MutexGuard<'_, HubState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, channel: &str, id: u64) {
        let mut state = self.state();
        let mut removed = false;
        if let Some(slots) = state.channels.get_mut(channel) {
            let before = slots.len();
            slots.retain(|slot| slot.id != id);
            removed = slots.len() != before;
            if slots.is_empty() {
                state.channels.remove(channel);
            }
        }
        if removed {
            state.registered = state.registered.saturating_sub(1);
        }
    }

    pub fn channel_listener_count(&self, channel: &str) -> usize {
        self.state().channels.get(channel).map_or(0, Vec::len)
    }
}

impl<T: Clone + Send + 'static> EventHub<T> {
    pub fn new() -> Arc<Self> {
        Self::with_max_listeners(DEFAULT_MAX_LISTENERS)
    }

    pub fn with_max_listeners(max_listeners: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState {
                max_listeners,
                next_id: 0,
                registered: 0,
                channels: HashMap::new(),
            }),
        })
    }

    /// Registers a listener on `channel`. Fails once the hub already holds
    /// `max_listeners` listeners.
    pub fn listen(self: &Arc<Self>, channel: &str) -> Result<Listener<T>, TransportError> {
        let mut state = self.state();
        if state.registered >= state.max_listeners {
            return Err(TransportError::ListenerCapacity {
                registered: state.registered,
                max: state.max_listeners,
            });
        }
        state.next_id += 1;
        let id = state.next_id;
        state.registered += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(Slot { id, tx });
        Ok(Listener {
            hub: Arc::downgrade(self),
            channel: channel.to_string(),
            id,
            rx,
        })
    }

    /// Delivers `payload` to every listener on `channel`; returns how many
    /// listeners received it.
    pub fn emit(&self, channel: &str, payload: T) -> usize {
        let state = self.state();
        let Some(slots) = state.channels.get(channel) else {
            return 0;
        };
        slots
            .iter()
            .filter(|slot| slot.tx.send(payload.clone()).is_ok())
            .count()
    }
}

impl<T: Send> ListenerCapacity for EventHub<T> {
    fn max_listeners(&self) -> usize {
        self.state().max_listeners
    }

    fn set_max_listeners(&self, max: usize) {
        let mut state = self.state();
        state.max_listeners = state.max_listeners.max(max);
    }

    fn listener_count(&self) -> usize {
        self.state().registered
    }
}

/// A registered listener. Dropping it deregisters it.
pub struct Listener<T> {
    hub: Weak<EventHub<T>>,
    channel: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Listener<T> {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Listener<T> {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.channel, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_reaches_only_matching_channel() {
        let hub = EventHub::<u32>::new();
        let mut a = hub.listen("a").expect("listen a");
        let mut b = hub.listen("b").expect("listen b");

        assert_eq!(hub.emit("a", 1), 1);
        assert_eq!(a.try_recv(), Some(1));
        assert_eq!(b.try_recv(), None);
        assert_eq!(hub.emit("missing", 2), 0);
    }

    #[test]
    fn ceiling_rejects_registrations_past_max() {
        let hub = EventHub::<()>::with_max_listeners(2);
        let _first = hub.listen("x").expect("first");
        let _second = hub.listen("x").expect("second");
        match hub.listen("x") {
            Err(TransportError::ListenerCapacity { registered, max }) => {
                assert_eq!(registered, 2);
                assert_eq!(max, 2);
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("third listener should be rejected"),
        }
    }

    #[test]
    fn dropping_listener_frees_its_slot() {
        let hub = EventHub::<()>::with_max_listeners(1);
        let first = hub.listen("x").expect("first");
        assert_eq!(hub.listener_count(), 1);
        drop(first);
        assert_eq!(hub.listener_count(), 0);
        assert_eq!(hub.channel_listener_count("x"), 0);
        let _again = hub.listen("x").expect("slot freed");
    }

    #[test]
    fn ceiling_never_shrinks() {
        let hub = EventHub::<()>::with_max_listeners(8);
        hub.set_max_listeners(4);
        assert_eq!(hub.max_listeners(), 8);
        hub.set_max_listeners(16);
        assert_eq!(hub.max_listeners(), 16);
    }

    #[test]
    fn listener_reports_closed_hub() {
        let hub = EventHub::<u8>::new();
        let mut listener = hub.listen("x").expect("listen");
        drop(hub);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        assert_eq!(runtime.block_on(listener.recv()), None);
    }
}
