//! Exposes a [`KvStore`] to consumers over the call and subscription
//! protocol, under the store's prefix.

use crate::store::KvStore;
use hostlink_core::RemoteError;
use hostlink_ipc::{
    CallError, CallGateway, CallInvoker, EventSink, StopHandle, SubscribeError, Subscription,
    SubscriptionBroker, SubscriptionClient,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn operation(prefix: &str, op: &str) -> String {
    format!("{prefix}:{op}")
}

pub struct StoreService;

impl StoreService {
    /// Registers `<prefix>:read|write|delete` calls and the `<prefix>:subscribe`
    /// subscription. A subscription first delivers the key's current value,
    /// then every change; `null` stands for absent.
    pub fn register(store: &Arc<KvStore>, gateway: &CallGateway, broker: &SubscriptionBroker) {
        let prefix = store.prefix().to_string();

        let reader = Arc::clone(store);
        gateway.register_typed(&operation(&prefix, "read"), move |req: KeyRequest| {
            let store = Arc::clone(&reader);
            async move { Ok(store.read(&req.key)) }
        });

        let writer = Arc::clone(store);
        gateway.register_typed(&operation(&prefix, "write"), move |req: WriteRequest| {
            let store = Arc::clone(&writer);
            async move {
                match req.ttl_ms {
                    Some(ttl_ms) => store
                        .write_with_ttl(&req.key, req.value, Duration::from_millis(ttl_ms))
                        .map_err(|err| RemoteError::new("StoreError", err.to_string()))?,
                    None => store.write(&req.key, req.value),
                }
                Ok(())
            }
        });

        let deleter = Arc::clone(store);
        gateway.register_typed(&operation(&prefix, "delete"), move |req: KeyRequest| {
            let store = Arc::clone(&deleter);
            async move { Ok(store.delete(&req.key)) }
        });

        let watched = Arc::clone(store);
        broker.register(&operation(&prefix, "subscribe"), move |input: Value, sink: EventSink| {
            let req: KeyRequest = serde_json::from_value(input)
                .map_err(|err| RemoteError::new("InvalidInput", err.to_string()))?;
            // The initial value is read under the sink lock, after subscribing.
            let sink = Arc::new(Mutex::new(sink));
            let changes = Arc::clone(&sink);
            let subscription = watched.subscribe(&req.key, move |value| {
                lock(&changes).emit(value.cloned().unwrap_or(Value::Null));
            });
            {
                let sink = lock(&sink);
                sink.emit(watched.peek(&req.key).unwrap_or(Value::Null));
            }
            Ok(StopHandle::new(move || subscription.stop()))
        });

        debug!(event = "store_service_registered", prefix = %prefix);
    }
}

/// Consumer-side view of a store registered with [`StoreService`].
#[derive(Clone)]
pub struct RemoteStore {
    prefix: String,
    invoker: CallInvoker,
    client: SubscriptionClient,
}

impl RemoteStore {
    pub fn new(prefix: impl Into<String>, invoker: CallInvoker, client: SubscriptionClient) -> Self {
        Self {
            prefix: prefix.into(),
            invoker,
            client,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn read(&self, key: &str) -> Result<Option<Value>, CallError> {
        self.invoker
            .caller::<KeyRequest, Option<Value>>(&operation(&self.prefix, "read"))
            .call(&KeyRequest {
                key: key.to_string(),
            })
            .await
    }

    pub async fn write(&self, key: &str, value: Value) -> Result<(), CallError> {
        self.send_write(WriteRequest {
            key: key.to_string(),
            value,
            ttl_ms: None,
        })
        .await
    }

    pub async fn write_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CallError> {
        self.send_write(WriteRequest {
            key: key.to_string(),
            value,
            ttl_ms: Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
        })
        .await
    }

    async fn send_write(&self, req: WriteRequest) -> Result<(), CallError> {
        self.invoker
            .caller::<WriteRequest, ()>(&operation(&self.prefix, "write"))
            .call(&req)
            .await
    }

    /// Removes `key`; returns whether it was present.
    pub async fn delete(&self, key: &str) -> Result<bool, CallError> {
        self.invoker
            .caller::<KeyRequest, bool>(&operation(&self.prefix, "delete"))
            .call(&KeyRequest {
                key: key.to_string(),
            })
            .await
    }

    /// Calls `on_change` with the current value of `key` and then with every
    /// change (`None` when absent).
    pub async fn subscribe<F>(&self, key: &str, mut on_change: F) -> Result<Subscription, SubscribeError>
    where
        F: FnMut(Option<Value>) + Send + 'static,
    {
        let input = serde_json::to_value(KeyRequest {
            key: key.to_string(),
        })?;
        let key = key.to_string();
        self.client
            .subscribe(&operation(&self.prefix, "subscribe"), input, move |err, message| {
                if let Some(err) = err {
                    debug!(event = "remote_store_event_error", key = %key, error = %err);
                    return;
                }
                on_change(message.filter(|value| !value.is_null()));
            })
            .await
    }
}
