//! Error types at the typed seams of the signaling stack
//!
//! Channel errors never cross the channel boundary as panics; the selector
//! inspects them to decide on fallback. Negotiation errors end the call.

use thiserror::Error;

use crate::signal::ChannelKind;

/// Failure of a single send attempt on one transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel unavailable")]
    Unavailable,

    #[error("no acknowledgement within {0:?}")]
    Timeout(std::time::Duration),

    #[error("rejected by relay: {0}")]
    Rejected(String),

    #[error("message type {0} is not representable on this channel")]
    Unrepresentable(&'static str),

    #[error("connection closed while waiting for acknowledgement")]
    Closed,

    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Both transports were tried and neither carried the message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("signal not delivered: {preferred} failed ({primary}){}", fallback_suffix(.fallback))]
pub struct SignalError {
    pub preferred: ChannelKind,
    pub primary: ChannelError,
    /// `None` when the other channel was unavailable and not attempted
    pub fallback: Option<ChannelError>,
}

fn fallback_suffix(fallback: &Option<ChannelError>) -> String {
    match fallback {
        Some(e) => format!(", fallback failed ({e})"),
        None => ", no fallback available".to_string(),
    }
}

/// Session negotiation failures. These end the call and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("media device access denied: {0}")]
    MediaDenied(String),

    #[error("no usable media device: {0}")]
    MediaUnavailable(String),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("connectivity context failure: {0}")]
    Context(String),

    #[error("duplicate {0} rejected")]
    Duplicate(&'static str),

    #[error("operation not valid in session state {0}")]
    InvalidState(&'static str),

    #[error("cancelled")]
    Cancelled,
}

/// Errors returned to callers of the call handle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("a call is already in progress")]
    Busy,

    #[error("no call in a state that allows this operation")]
    NoCall,

    #[error("cannot call yourself")]
    SelfCall,

    #[error("call controller has shut down")]
    ControllerGone,

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}
