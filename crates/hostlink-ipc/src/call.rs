//! Request/response half of the protocol.

use crate::error::CallError;
use crate::transport::{invoke_handler, ConsumerTransport, Endpoint, HostTransport};
use hostlink_core::{channel_name, CallEnvelope, ChannelKind, WrappedError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Host side: runs registered handlers and always answers with an envelope.
#[derive(Clone)]
pub struct CallGateway {
    transport: Arc<dyn HostTransport>,
}

impl CallGateway {
    pub fn new(transport: Arc<dyn HostTransport>) -> Self {
        Self { transport }
    }

    /// Registers `handler` under `name`. Each call runs in its own task, so a
    /// failing or panicking handler only affects its own reply.
    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let logical_name = name.to_string();
        self.transport.handle(
            &channel_name(ChannelKind::Call, name),
            invoke_handler(move |_endpoint: Arc<dyn Endpoint>, input: Value| {
                let handler = Arc::clone(&handler);
                let logical_name = logical_name.clone();
                async move {
                    let outcome = tokio::spawn(async move { handler(input).await }).await;
                    let envelope = match outcome {
                        Ok(result) => CallEnvelope::from_result(result),
                        Err(join_err) => {
                            warn!(event = "call_handler_panicked", name = %logical_name, error = %join_err);
                            CallEnvelope::Error(WrappedError::new(
                                "Error",
                                format!("handler for {logical_name} panicked"),
                            ))
                        }
                    };
                    if let CallEnvelope::Error(err) = &envelope {
                        debug!(
                            event = "call_handler_failed",
                            name = %logical_name,
                            error_name = %err.name,
                            error = %err.message
                        );
                    }
                    envelope.to_value()
                }
            }),
        );
    }

    /// Like [`CallGateway::register`] with typed input and output. Input that
    /// does not decode is reported back as an `InvalidInput` error.
    pub fn register_typed<I, O, F, Fut>(&self, name: &str, handler: F)
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(name, move |input: Value| {
            let handler = Arc::clone(&handler);
            async move {
                let input = serde_json::from_value::<I>(input).map_err(|err| {
                    hostlink_core::RemoteError::new("InvalidInput", err.to_string())
                })?;
                let output = handler(input).await?;
                Ok(serde_json::to_value(output)?)
            }
        });
    }
}

/// Consumer side: invokes calls and re-raises remote failures locally.
#[derive(Clone)]
pub struct CallInvoker {
    transport: Arc<dyn ConsumerTransport>,
}

impl CallInvoker {
    pub fn new(transport: Arc<dyn ConsumerTransport>) -> Self {
        Self { transport }
    }

    pub async fn call(&self, name: &str, input: Value) -> Result<Value, CallError> {
        let reply = self
            .transport
            .invoke(&channel_name(ChannelKind::Call, name), input)
            .await?;
        let envelope: CallEnvelope = serde_json::from_value(reply)?;
        Ok(envelope.into_result()?)
    }

    pub fn caller<I, O>(&self, name: &str) -> Caller<I, O> {
        Caller {
            invoker: self.clone(),
            name: name.to_string(),
            marker: PhantomData,
        }
    }
}

/// A typed handle on one logical call.
pub struct Caller<I, O> {
    invoker: CallInvoker,
    name: String,
    marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for Caller<I, O> {
    fn clone(&self) -> Self {
        Self {
            invoker: self.invoker.clone(),
            name: self.name.clone(),
            marker: PhantomData,
        }
    }
}

impl<I: Serialize, O: DeserializeOwned> Caller<I, O> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, input: &I) -> Result<O, CallError> {
        let input = serde_json::to_value(input)?;
        let output = self.invoker.call(&self.name, input).await?;
        Ok(serde_json::from_value(output)?)
    }
}
