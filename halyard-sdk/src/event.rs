//! Events emitted by the engine for the application layer to consume.
//!
//! Every wire-level occurrence maps to exactly one `Event` variant. Sessions
//! publish raw events onto the bus; the correlator republishes a refined
//! stream (folded multiline messages, resolved echoes, labeled replies).

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::irc::Tags;

/// Identifier of a configured server, unique within one engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Connection lifecycle state of one server, owned by its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// An event tagged with its server and a bus-wide sequence number.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub server: ServerId,
    /// Strictly increasing per bus, in publication order.
    pub seq: u64,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Privmsg,
    Notice,
    /// CTCP ACTION; `text` holds the action body without the CTCP framing.
    Action,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Privmsg => "privmsg",
            Self::Notice => "notice",
            Self::Action => "action",
        }
    }
}

/// Outcome of a labeled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelOutcome {
    Pending,
    Success,
    Failure,
    Timeout,
}

/// IRCv3 standard reply severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySeverity {
    Fail,
    Warn,
    Note,
}

/// Events the engine emits to the consumer (CLI, bot, UI, etc.)
#[derive(Debug, Clone)]
pub enum Event {
    // ── Lifecycle ──────────────────────────────────────────────────
    /// A connection attempt started.
    Connecting {
        host: String,
        port: u16,
        tls: bool,
    },

    /// Transport is up and registration has been sent.
    Connected {
        host: String,
        port: u16,
        tls: bool,
    },

    /// IRC registration complete. `nick` is our confirmed nick.
    Registered {
        nick: String,
    },

    /// A reconnect is scheduled after `delay`.
    Reconnecting {
        attempt: u32,
        delay: Duration,
        reason: String,
    },

    /// Connection was closed. Emitted exactly once per connection cycle.
    Disconnected {
        reason: String,
    },

    /// Reconnect attempts exhausted; the supervisor gave up.
    Fatal {
        reason: String,
    },

    // ── Negotiation ────────────────────────────────────────────────
    /// The set of enabled capabilities after an ACK/NAK round or CAP NEW/DEL.
    CapsNegotiated {
        enabled: Vec<String>,
    },

    /// SASL succeeded.
    Authenticated {
        account: Option<String>,
        mechanism: String,
    },

    /// SASL failed; `fatal` means the connection is being closed.
    AuthFailed {
        reason: String,
        fatal: bool,
    },

    /// A secure-transport policy was stored for `host`.
    StsPolicyStored {
        host: String,
        port: Option<u16>,
        expires_at: DateTime<Utc>,
    },

    /// A stored secure-transport policy was removed (`duration=0`).
    StsPolicyRemoved {
        host: String,
    },

    /// Connection parameters were upgraded by a stored policy.
    StsUpgraded {
        host: String,
        port: u16,
    },

    // ── Traffic ────────────────────────────────────────────────────
    /// A message in a channel or private message.
    Message {
        from: String,
        target: String,
        text: String,
        /// IRCv3 message tags (empty if none).
        tags: Tags,
        kind: MessageKind,
        /// Sent by our own nick (echo-message or a bouncer replay).
        self_authored: bool,
    },

    /// A TAGMSG (tags only, no body).
    TagMsg {
        from: String,
        target: String,
        tags: Tags,
    },

    Joined {
        channel: String,
        nick: String,
        /// From extended-join, when enabled.
        account: Option<String>,
    },

    Parted {
        channel: String,
        nick: String,
        reason: Option<String>,
    },

    Kicked {
        channel: String,
        nick: String,
        by: String,
        reason: String,
    },

    UserQuit {
        nick: String,
        reason: String,
    },

    NickChanged {
        old_nick: String,
        new_nick: String,
    },

    /// BATCH start (chathistory, labeled-response, multiline, netsplit…)
    BatchStart {
        id: String,
        batch_type: String,
        params: Vec<String>,
        tags: Tags,
    },

    BatchEnd {
        id: String,
        tags: Tags,
    },

    /// Labeled-response acknowledgement with no other reply.
    Ack {
        tags: Tags,
    },

    /// Any numeric reply not consumed by the negotiator.
    Numeric {
        code: u16,
        params: Vec<String>,
        tags: Tags,
    },

    /// WHOX (354) reply with flags/account recovered heuristically.
    WhoxReply {
        fields: Vec<String>,
        flags: Option<String>,
        account: Option<String>,
    },

    /// FAIL / WARN / NOTE.
    StandardReply {
        severity: ReplySeverity,
        command: String,
        code: String,
        context: Vec<String>,
        description: String,
        tags: Tags,
    },

    /// NOTICE from the server itself, or an ERROR line.
    ServerNotice {
        text: String,
    },

    /// A line the session has no typed mapping for.
    RawLine(String),

    // ── Correlation ────────────────────────────────────────────────
    /// A PRIVMSG/NOTICE was written and an echo is expected.
    OutboundMessage {
        pending_id: u64,
        target: String,
        text: String,
        kind: MessageKind,
    },

    /// A labeled command was written.
    LabeledRequestSent {
        label: String,
        context: String,
        preview: String,
    },

    /// A reply matched a pending label. `reply` is the matched event.
    LabeledReply {
        label: String,
        context: String,
        preview: String,
        outcome: LabelOutcome,
        reply: Box<Event>,
    },

    /// A labeled request got no reply in time.
    LabeledTimeout {
        label: String,
        context: String,
        preview: String,
    },

    /// Our own message came back from the server.
    EchoResolved {
        pending_id: u64,
        target: String,
        text: String,
        tags: Tags,
    },

    /// Our own message never came back.
    EchoFailed {
        pending_id: u64,
        target: String,
        text: String,
        reason: String,
    },

    /// Inferred from quit reasons shaped like `server1 server2`.
    NetsplitDetected {
        server1: String,
        server2: String,
    },
}

impl Event {
    /// Message tags carried by the event, when the variant has any.
    pub fn tags(&self) -> Option<&Tags> {
        match self {
            Self::Message { tags, .. }
            | Self::TagMsg { tags, .. }
            | Self::BatchStart { tags, .. }
            | Self::BatchEnd { tags, .. }
            | Self::Ack { tags }
            | Self::Numeric { tags, .. }
            | Self::StandardReply { tags, .. }
            | Self::EchoResolved { tags, .. } => Some(tags),
            _ => None,
        }
    }

    /// True for connectivity lifecycle events.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Connecting { .. }
                | Self::Connected { .. }
                | Self::Registered { .. }
                | Self::Reconnecting { .. }
                | Self::Disconnected { .. }
                | Self::Fatal { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_serializes_as_plain_string() {
        let id = ServerId::from("libera");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"libera\"");
        let back: ServerId = serde_json::from_str("\"oftc\"").unwrap();
        assert_eq!(back.as_str(), "oftc");
    }

    #[test]
    fn tags_accessor_covers_tagged_variants() {
        let mut tags = Tags::new();
        tags.insert("label", "L1");
        let ev = Event::Ack { tags };
        assert_eq!(ev.tags().and_then(|t| t.get("label")), Some("L1"));
        assert!(Event::Disconnected { reason: "x".into() }.tags().is_none());
    }
}
