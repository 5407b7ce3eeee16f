use crate::fault::{RemoteError, WrappedError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Reply to a call: `{"value": v}` or `{"error": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEnvelope {
    Value(Value),
    Error(WrappedError),
}

impl CallEnvelope {
    pub fn from_result(result: anyhow::Result<Value>) -> Self {
        match result {
            Ok(value) => CallEnvelope::Value(value),
            Err(err) => CallEnvelope::Error(WrappedError::from_error(&err)),
        }
    }

    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self {
            CallEnvelope::Value(value) => Ok(value),
            CallEnvelope::Error(wrapped) => Err(wrapped.into()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            CallEnvelope::Value(value) => json!({ "value": value }),
            CallEnvelope::Error(wrapped) => json!({ "error": wrapped.to_value() }),
        }
    }
}

/// One delivered subscription event, `{error?, message?}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WrappedError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

impl StreamEvent {
    pub fn message(message: Value) -> Self {
        Self {
            error: None,
            message: Some(message),
        }
    }

    pub fn error(error: WrappedError) -> Self {
        Self {
            error: Some(error),
            message: None,
        }
    }
}

/// Everything that can travel on an ephemeral channel towards the client.
/// `End` is the termination sentinel and is encoded as JSON `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Event(StreamEvent),
    End,
}

impl StreamFrame {
    pub fn to_value(&self) -> Value {
        match self {
            StreamFrame::End => Value::Null,
            StreamFrame::Event(event) => {
                let mut object = Map::new();
                if let Some(error) = &event.error {
                    object.insert("error".to_string(), error.to_value());
                }
                if let Some(message) = &event.message {
                    object.insert("message".to_string(), message.clone());
                }
                Value::Object(object)
            }
        }
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(StreamFrame::End);
        }
        serde_json::from_value(value).map(StreamFrame::Event)
    }
}

/// Client-to-broker signals on an ephemeral channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Start,
    Stop,
}

impl ControlSignal {
    pub const fn as_str(self) -> &'static str {
        match self {
            ControlSignal::Start => "start",
            ControlSignal::Stop => "stop",
        }
    }

    pub fn to_value(self) -> Value {
        Value::String(self.as_str().to_string())
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value.as_str()? {
            "start" => Some(ControlSignal::Start),
            "stop" => Some(ControlSignal::Stop),
            _ => None,
        }
    }
}
