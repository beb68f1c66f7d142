//! Call lifecycle
//!
//! - [`controller`]: single-owner loop driving calls from commands, inbound
//!   signals, engine events and timers
//! - [`outbox`]: ordered outbound signal queue feeding the channel selector
//! - [`history`]: sinks for terminal call records

pub mod controller;
pub mod history;
pub mod outbox;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mode::AppMode;
use crate::selector::{classify_call_mode, CallMode};
use crate::session::SessionState;
use crate::signal::{CallId, ChannelKind, MediaKind, UserId};

pub use controller::{spawn_controller, CallHandle, ControllerConfig, ControllerDeps};
pub use history::{CallHistory, CallRecord, JsonlHistory, MemoryHistory};
pub use outbox::{Outbox, OutboxItem, SendReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Calling,
    Ringing,
    Active,
    Ended,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Active => "active",
            CallState::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Clean hangup by either side
    #[serde(rename = "ended-normal")]
    Normal,
    Rejected,
    Missed,
    /// Caller hung up before the callee answered
    Cancelled,
    /// Negotiation failure or both channels exhausted
    Failed,
    /// Media transport went away
    Disconnected,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::Normal => "ended-normal",
            EndReason::Rejected => "rejected",
            EndReason::Missed => "missed",
            EndReason::Cancelled => "cancelled",
            EndReason::Failed => "failed",
            EndReason::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// One in-progress or just-ended call, as presented to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: CallId,
    pub local_user_id: UserId,
    pub remote_user_id: UserId,
    pub media_kind: MediaKind,
    pub direction: Direction,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    /// Channel our side signals on, known after the first successful send
    pub local_channel_used: Option<ChannelKind>,
    /// Learned from the first tagged message from the remote
    pub remote_channel_used: Option<ChannelKind>,
    #[serde(skip)]
    pub media: SessionState,
    pub muted: bool,
    pub video_enabled: bool,
}

impl CallSession {
    pub(crate) fn new(
        call_id: CallId,
        local: UserId,
        remote: UserId,
        media_kind: MediaKind,
        direction: Direction,
    ) -> Self {
        Self {
            call_id,
            local_user_id: local,
            remote_user_id: remote,
            media_kind,
            direction,
            state: match direction {
                Direction::Outgoing => CallState::Calling,
                Direction::Incoming => CallState::Ringing,
            },
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            end_reason: None,
            local_channel_used: None,
            remote_channel_used: None,
            media: SessionState::Idle,
            muted: false,
            video_enabled: media_kind == MediaKind::Video,
        }
    }

    /// `None` until both sides' channels are known
    pub fn call_mode(&self) -> Option<CallMode> {
        Some(classify_call_mode(
            self.local_channel_used?,
            self.remote_channel_used?,
        ))
    }

    /// Seconds between answer and end, for answered calls that ended
    pub fn duration_secs(&self) -> Option<i64> {
        let answered = self.answered_at?;
        let ended = self.ended_at?;
        Some((ended - answered).num_seconds().max(0))
    }
}

/// Events published to UI consumers
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    CallStateChanged(CallSession),
    ModeChanged(AppMode),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CallSession {
        CallSession::new(
            CallId::from("c1"),
            UserId::from("alice"),
            UserId::from("bob"),
            MediaKind::Video,
            Direction::Outgoing,
        )
    }

    #[test]
    fn call_mode_is_undetermined_until_remote_known() {
        let mut s = session();
        assert_eq!(s.state, CallState::Calling);
        assert_eq!(s.call_mode(), None);
        s.local_channel_used = Some(ChannelKind::Relayed);
        assert_eq!(s.call_mode(), None);
        s.remote_channel_used = Some(ChannelKind::Discovery);
        assert_eq!(s.call_mode(), Some(CallMode::Asymmetric));
    }

    #[test]
    fn duration_needs_answer_and_end() {
        let mut s = session();
        assert_eq!(s.duration_secs(), None);
        s.answered_at = Some(s.created_at);
        s.ended_at = Some(s.created_at + chrono::Duration::seconds(42));
        assert_eq!(s.duration_secs(), Some(42));
    }

    #[test]
    fn end_reason_labels() {
        assert_eq!(EndReason::Normal.to_string(), "ended-normal");
        assert_eq!(
            serde_json::to_value(EndReason::Normal).unwrap(),
            serde_json::json!("ended-normal")
        );
        assert_eq!(
            serde_json::to_value(EndReason::Missed).unwrap(),
            serde_json::json!("missed")
        );
    }
}
