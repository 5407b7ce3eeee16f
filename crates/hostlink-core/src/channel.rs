use std::fmt;

const NAMESPACE: &str = "hostlink";
const STREAM_KIND: &str = "stream";

/// The three fixed channel classes a logical name can be published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Call,
    SubscriptionControl,
    BroadcastEvent,
}

impl ChannelKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Call => "call",
            ChannelKind::SubscriptionControl => "subscribe",
            ChannelKind::BroadcastEvent => "event",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire name for `(kind, logical_name)`.
///
/// The kind segment never contains `:` and always precedes the logical name,
/// so two different pairs cannot produce the same string.
pub fn channel_name(kind: ChannelKind, logical_name: &str) -> String {
    format!("{NAMESPACE}:{}:{logical_name}", kind.as_str())
}

/// One-time channel for a single subscription.
///
/// `instance` must not contain `:`; it scopes the session counter to one
/// registry so independently started processes do not hand out equal names.
pub fn ephemeral_channel(instance: &str, session: u64, logical_name: &str) -> String {
    format!("{NAMESPACE}:{STREAM_KIND}:{instance}:{session}:{logical_name}")
}
