//! Error codec: turns a failure into a JSON-safe [`WrappedError`] and back
//! into a [`RemoteError`] carrying the same name, message and fields.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const DEFAULT_ERROR_NAME: &str = "Error";

/// Wire form of an error: `{name, message, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// An error raised on the calling side with the identity of the original.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub fields: Map<String, Value>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Builds an error from an arbitrary thrown value, see [`WrappedError::from_value`].
    pub fn from_value(value: &Value) -> Self {
        WrappedError::from_value(value).into()
    }
}

impl WrappedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            data: Map::new(),
        }
    }

    /// Projects an arbitrary thrown JSON value.
    ///
    /// `null` and scalars become their JSON text, a string is the message, and
    /// an object contributes `name`/`message` plus every other field as data.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self::new(DEFAULT_ERROR_NAME, message.clone()),
            Value::Object(object) => {
                let name = object
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_ERROR_NAME)
                    .to_string();
                let message = match object.get("message") {
                    Some(Value::String(message)) => message.clone(),
                    Some(other) => other.to_string(),
                    None => value.to_string(),
                };
                let data = object
                    .iter()
                    .filter(|(key, _)| key.as_str() != "name" && key.as_str() != "message")
                    .map(|(key, field)| (key.clone(), field.clone()))
                    .collect();
                Self {
                    name,
                    message,
                    data,
                }
            }
            other => Self::new(DEFAULT_ERROR_NAME, other.to_string()),
        }
    }

    /// Wraps a handler failure. A [`RemoteError`] anywhere in the chain keeps
    /// its identity; anything else is reported under the default name with the
    /// full context chain as message.
    pub fn from_error(err: &anyhow::Error) -> Self {
        if let Some(remote) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<RemoteError>())
        {
            return remote.into();
        }
        Self::new(DEFAULT_ERROR_NAME, format!("{err:#}"))
    }

    pub fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "message": self.message,
            "data": self.data,
        })
    }
}

impl From<&RemoteError> for WrappedError {
    fn from(err: &RemoteError) -> Self {
        Self {
            name: err.name.clone(),
            message: err.message.clone(),
            data: err.fields.clone(),
        }
    }
}

impl From<WrappedError> for RemoteError {
    fn from(wrapped: WrappedError) -> Self {
        Self {
            name: wrapped.name,
            message: wrapped.message,
            fields: wrapped.data,
        }
    }
}

pub fn wrap_error(err: &anyhow::Error) -> WrappedError {
    WrappedError::from_error(err)
}

pub fn unwrap_error(wrapped: WrappedError) -> RemoteError {
    wrapped.into()
}
