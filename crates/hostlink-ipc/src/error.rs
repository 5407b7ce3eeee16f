use hostlink_core::{FrameError, RemoteError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("listener capacity reached: {registered} >= {max}")]
    ListenerCapacity { registered: usize, max: usize },
    #[error("no handler registered for channel {0}")]
    NoHandler(String),
    #[error("invoke rejected by host: {0}")]
    Rejected(String),
    #[error("endpoint destroyed")]
    EndpointDestroyed,
    #[error("outbound queue full")]
    Backpressure,
    #[error("transport closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl CallError {
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            CallError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("broker replied with an invalid channel: {0}")]
    InvalidChannel(String),
}
