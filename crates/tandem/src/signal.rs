//! Signaling message types exchanged between call endpoints
//!
//! Every message is a [`SignalingMessage`]: a small envelope naming the call,
//! the emitting endpoint and the addressed endpoint, with a closed
//! [`SignalPayload`] union flattened into it. The JSON shape is identical on
//! both transports:
//!
//! ```text
//! { "type": "offer", "callId": "..", "callerId": "alice", "receiverId": "bob",
//!   "channel": "relayed", "sdp": "v=0 ..." }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Explicit user identity, carried in every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Call identifier, generated by the endpoint that places the call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Generate a fresh random call id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One of the two independent signaling transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Server-side WebSocket relay
    Relayed,
    /// Serverless rendezvous swarm
    Discovery,
}

impl ChannelKind {
    /// The other transport
    pub fn other(self) -> Self {
        match self {
            ChannelKind::Relayed => ChannelKind::Discovery,
            ChannelKind::Discovery => ChannelKind::Relayed,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Relayed => f.write_str("relayed"),
            ChannelKind::Discovery => f.write_str("discovery"),
        }
    }
}

/// Media requested for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Incremental connectivity candidate (trickle ICE)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Closed union of everything that travels over a signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Out-of-band "incoming call" notification, sent before the offer
    Invite { media: MediaKind },
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
    /// Callee picked up
    Accept,
    /// Callee declined (or is busy with another call)
    Reject {
        #[serde(default)]
        busy: bool,
    },
    /// Caller gave up after the ring deadline
    Missed,
    /// Hangup. Not representable on the discovery channel.
    CallEnd,
}

impl SignalPayload {
    /// Wire name of the payload type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Invite { .. } => "invite",
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
            SignalPayload::Accept => "accept",
            SignalPayload::Reject { .. } => "reject",
            SignalPayload::Missed => "missed",
            SignalPayload::CallEnd => "call-end",
        }
    }

    /// Messages whose loss makes the call impossible to set up
    pub fn is_essential(&self) -> bool {
        matches!(
            self,
            SignalPayload::Invite { .. } | SignalPayload::Offer { .. } | SignalPayload::Answer { .. }
        )
    }
}

/// Immutable signaling envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub call_id: CallId,
    /// Endpoint that emitted this message
    pub caller_id: UserId,
    /// Endpoint this message is addressed to
    pub receiver_id: UserId,
    /// Transport that carried the message. Set by the sender, informational
    /// for the receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelKind>,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl SignalingMessage {
    pub fn new(call_id: CallId, from: UserId, to: UserId, payload: SignalPayload) -> Self {
        Self {
            call_id,
            caller_id: from,
            receiver_id: to,
            channel: None,
            payload,
        }
    }

    /// Copy of this message stamped with the transport about to carry it
    pub fn via(&self, channel: ChannelKind) -> Self {
        let mut msg = self.clone();
        msg.channel = Some(channel);
        msg
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
