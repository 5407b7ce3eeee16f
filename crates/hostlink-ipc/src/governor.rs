//! Keeps listener registrations under the transport's ceiling.
//!
//! Every subscription holds a handful of listeners, so the number of live
//! listeners grows with consumer state. The governor counts registrations made
//! through it and doubles a target's ceiling whenever one more listener would
//! push the total past half of it. The ceiling is a ratchet: releasing
//! listeners lowers the count but never the ceiling.

use crate::error::TransportError;
use crate::hub::{EventHub, ListenerCapacity, Listener};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ListenerGovernor {
    registered: AtomicUsize,
}

impl ListenerGovernor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }

    /// Counts one more listener against `target`, growing its ceiling first
    /// when needed. The slot is released when the reservation drops.
    pub fn reserve(self: &Arc<Self>, target: &dyn ListenerCapacity) -> Reservation {
        let total = self.registered.fetch_add(1, Ordering::SeqCst) + 1;
        let current = target.max_listeners();
        let mut ceiling = current;
        while total > ceiling / 2 {
            ceiling = ceiling.saturating_mul(2).max(2);
        }
        if ceiling != current {
            debug!(
                event = "listener_ceiling_raised",
                from = current,
                to = ceiling,
                registered = total
            );
            target.set_max_listeners(ceiling);
        }
        Reservation {
            governor: Arc::clone(self),
        }
    }

    /// Registers a listener on `hub` under this governor.
    pub fn listen<T: Clone + Send + 'static>(
        self: &Arc<Self>,
        hub: &Arc<EventHub<T>>,
        channel: &str,
    ) -> Result<Governed<Listener<T>>, TransportError> {
        let reservation = self.reserve(hub.as_ref());
        let inner = hub.listen(channel)?;
        Ok(Governed {
            inner,
            _reservation: reservation,
        })
    }
}

/// One counted registration. Dropping it releases the count.
#[derive(Debug)]
pub struct Reservation {
    governor: Arc<ListenerGovernor>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.governor.registered.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A value registered through the governor; releases its slot on drop.
pub struct Governed<T> {
    inner: T,
    _reservation: Reservation,
}

impl<T> Deref for Governed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for Governed<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::DEFAULT_MAX_LISTENERS;

    #[test]
    fn ceiling_stays_at_least_twice_the_registrations() {
        let governor = ListenerGovernor::new();
        let hub = EventHub::<()>::new();
        let mut held = Vec::new();
        for n in 1..=1_000 {
            let listener = governor
                .listen(&hub, &format!("channel-{n}"))
                .expect("governed listen never hits the ceiling");
            held.push(listener);
            assert!(hub.max_listeners() >= 2 * n, "ceiling too low at {n}");
        }
        assert_eq!(governor.registered(), 1_000);
        assert_eq!(hub.listener_count(), 1_000);
    }

    #[test]
    fn releasing_lowers_count_but_not_ceiling() {
        let governor = ListenerGovernor::new();
        let hub = EventHub::<()>::new();
        let held = (0..40)
            .map(|n| governor.listen(&hub, &n.to_string()).expect("listen"))
            .collect::<Vec<_>>();
        let raised = hub.max_listeners();
        assert!(raised > DEFAULT_MAX_LISTENERS);

        drop(held);
        assert_eq!(governor.registered(), 0);
        assert_eq!(hub.listener_count(), 0);
        assert_eq!(hub.max_listeners(), raised);
    }

    #[test]
    fn failed_registration_releases_reservation() {
        let governor = ListenerGovernor::new();
        let hub = EventHub::<()>::new();
        let _direct = (0..DEFAULT_MAX_LISTENERS)
            .map(|_| hub.listen("raw").expect("ungoverned listen"))
            .collect::<Vec<_>>();
        // Ungoverned listeners filled the hub behind the governor's back.
        let governed = governor.listen(&hub, "governed");
        assert!(matches!(
            governed,
            Err(TransportError::ListenerCapacity { .. })
        ));
        assert_eq!(governor.registered(), 0);
    }

    #[test]
    fn zero_ceiling_is_grown() {
        let governor = ListenerGovernor::new();
        let hub = EventHub::<()>::with_max_listeners(0);
        let _listener = governor.listen(&hub, "x").expect("listen");
        assert!(hub.max_listeners() >= 2);
    }
}
