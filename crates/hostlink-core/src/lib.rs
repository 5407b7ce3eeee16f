//! Wire contracts shared by the host process and its consumers: channel
//! naming, the error codec, call/stream envelopes and NDJSON framing.

pub mod channel;
pub mod envelope;
pub mod fault;
pub mod frame;

pub use channel::{channel_name, ephemeral_channel, ChannelKind};
pub use envelope::{CallEnvelope, ControlSignal, StreamEvent, StreamFrame};
pub use fault::{unwrap_error, wrap_error, RemoteError, WrappedError, DEFAULT_ERROR_NAME};
pub use frame::{
    decode_frame, encode_frame, FrameError, WireEnvelope, WireMsg, CURRENT_PROTOCOL_VERSION,
    DEFAULT_MAX_FRAME_BYTES,
};
