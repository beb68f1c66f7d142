//! Relay wire protocol: JSON text frames over a WebSocket
//!
//! Client → server frames are tagged by `op`, server → client frames too.
//! Payloads carried by `send`/`deliver` are tagged by `kind`.

use serde::{Deserialize, Serialize};

use crate::signal::{SignalingMessage, UserId};

/// Frames sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Announce identity. Must be the first frame on a connection.
    #[serde(rename_all = "camelCase")]
    Register { user_id: UserId, token: String },
    /// Deliver `payload` to `to`; answered with `ack`/`nack` carrying `id`
    Send {
        id: u64,
        to: UserId,
        payload: RelayPayload,
    },
}

/// Frames sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Registered { user_id: UserId },
    Ack { id: u64 },
    Nack { id: u64, reason: String },
    Deliver { from: UserId, payload: RelayPayload },
    #[serde(rename_all = "camelCase")]
    Presence { user_id: UserId, online: bool },
    Error { reason: String },
}

/// Application payloads the relay forwards without interpreting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RelayPayload {
    Signal { message: SignalingMessage },
    #[serde(rename_all = "camelCase")]
    Chat { chat_id: String, body: String },
    #[serde(rename_all = "camelCase")]
    Typing { chat_id: String, typing: bool },
}

impl RelayPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayPayload::Signal { .. } => "signal",
            RelayPayload::Chat { .. } => "chat",
            RelayPayload::Typing { .. } => "typing",
        }
    }
}

impl ClientFrame {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ServerFrame {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
