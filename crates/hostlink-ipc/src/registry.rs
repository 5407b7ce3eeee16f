//! Process-wide protocol state, owned by the process entry point and passed
//! by `Arc` to the components that need it.

use crate::governor::ListenerGovernor;
use crate::transport::EndpointId;
use hostlink_core::ephemeral_channel;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Broker-side bookkeeping for one live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub logical_name: String,
    pub channel: String,
    pub endpoint: EndpointId,
    pub started: bool,
}

pub struct Registry {
    instance: String,
    sessions: AtomicU64,
    governor: Arc<ListenerGovernor>,
    active: Mutex<HashMap<String, SubscriptionRecord>>,
    shutdown: watch::Sender<bool>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            instance: Uuid::new_v4().simple().to_string(),
            sessions: AtomicU64::new(0),
            governor: ListenerGovernor::new(),
            active: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn governor(&self) -> &Arc<ListenerGovernor> {
        &self.governor
    }

    /// Allocates a fresh ephemeral channel for `logical_name`.
    pub fn allocate_channel(&self, logical_name: &str) -> String {
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        ephemeral_channel(&self.instance, session, logical_name)
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, SubscriptionRecord>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn track(&self, record: SubscriptionRecord) {
        self.active().insert(record.channel.clone(), record);
    }

    pub(crate) fn mark_started(&self, channel: &str) {
        if let Some(record) = self.active().get_mut(channel) {
            record.started = true;
        }
    }

    pub(crate) fn release(&self, channel: &str) -> Option<SubscriptionRecord> {
        self.active().remove(channel)
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionRecord> {
        let mut records = self.active().values().cloned().collect::<Vec<_>>();
        records.sort_by(|a, b| a.channel.cmp(&b.channel));
        records
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Ends every live subscription. Later subscribe requests are rejected.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!(
            event = "registry_shutdown",
            active_subscriptions = self.active_count()
        );
    }
}

/// Resolves once `signal` reads `true` or its registry is gone.
pub(crate) async fn shutdown_requested(signal: &mut watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn channels_are_unique_per_allocation() {
        let registry = Registry::new();
        let channels = (0..100)
            .map(|_| registry.allocate_channel("logs"))
            .collect::<HashSet<_>>();
        assert_eq!(channels.len(), 100);
    }

    #[test]
    fn registries_do_not_share_channel_space() {
        let first = Registry::new();
        let second = Registry::new();
        assert_ne!(first.allocate_channel("logs"), second.allocate_channel("logs"));
    }

    #[test]
    fn records_are_released_once() {
        let registry = Registry::new();
        let channel = registry.allocate_channel("logs");
        registry.track(SubscriptionRecord {
            logical_name: "logs".to_string(),
            channel: channel.clone(),
            endpoint: 1,
            started: false,
        });
        registry.mark_started(&channel);
        assert!(registry.active_subscriptions()[0].started);
        assert!(registry.release(&channel).is_some());
        assert!(registry.release(&channel).is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let registry = Registry::new();
        let mut signal = registry.shutdown_signal();
        let waiter = tokio::spawn(async move { shutdown_requested(&mut signal).await });
        registry.shutdown();
        waiter.await.expect("join");
        assert!(registry.is_shut_down());
    }
}
