//! Channel selection and failover
//!
//! The [`ChannelSelector`] holds no network state. For each signal it picks
//! the preferred transport from the current mode and availability, tries it,
//! and on failure tries the other transport exactly once.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::discovery::DiscoveryChannel;
use crate::error::{ChannelError, SignalError};
use crate::mode::AppMode;
use crate::relay::RelayChannel;
use crate::signal::{ChannelKind, SignalingMessage, UserId};

/// A transport the selector can send signals on
#[async_trait::async_trait]
pub trait SignalTransport: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Whether a send to `to` could currently succeed
    fn is_available(&self, to: &UserId) -> bool;

    /// Deliver `message`. Request/ack transports wait up to `timeout`.
    async fn send_signal(
        &self,
        message: &SignalingMessage,
        timeout: Duration,
    ) -> Result<(), ChannelError>;
}

#[async_trait::async_trait]
impl SignalTransport for RelayChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Relayed
    }

    fn is_available(&self, _to: &UserId) -> bool {
        RelayChannel::is_available(self)
    }

    async fn send_signal(
        &self,
        message: &SignalingMessage,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        RelayChannel::send_signal(self, message, timeout).await
    }
}

#[async_trait::async_trait]
impl SignalTransport for DiscoveryChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Discovery
    }

    fn is_available(&self, to: &UserId) -> bool {
        self.peer_count_for(to) > 0
    }

    async fn send_signal(
        &self,
        message: &SignalingMessage,
        _timeout: Duration,
    ) -> Result<(), ChannelError> {
        self.send(message).await
    }
}

/// Where a signal was meant to go and where it actually went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub preferred: ChannelKind,
    pub used: ChannelKind,
}

impl SendOutcome {
    pub fn fell_back(&self) -> bool {
        self.preferred != self.used
    }
}

/// Classification of a call by the channel each side used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallMode {
    /// Both sides relayed
    Normal,
    /// Both sides serverless
    Emergency,
    /// One side relayed, the other serverless
    Asymmetric,
}

/// Pure classification of a call from both sides' channels
pub fn classify_call_mode(local: ChannelKind, remote: ChannelKind) -> CallMode {
    match (local, remote) {
        (ChannelKind::Relayed, ChannelKind::Relayed) => CallMode::Normal,
        (ChannelKind::Discovery, ChannelKind::Discovery) => CallMode::Emergency,
        _ => CallMode::Asymmetric,
    }
}

/// Dual-channel manager
#[derive(Clone)]
pub struct ChannelSelector {
    relay: Arc<dyn SignalTransport>,
    discovery: Arc<dyn SignalTransport>,
    mode: watch::Receiver<AppMode>,
    ack_timeout: Duration,
}

impl ChannelSelector {
    pub fn new(
        relay: Arc<dyn SignalTransport>,
        discovery: Arc<dyn SignalTransport>,
        mode: watch::Receiver<AppMode>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            relay,
            discovery,
            mode,
            ack_timeout,
        }
    }

    fn transport(&self, kind: ChannelKind) -> &Arc<dyn SignalTransport> {
        match kind {
            ChannelKind::Relayed => &self.relay,
            ChannelKind::Discovery => &self.discovery,
        }
    }

    /// Relayed while the mode is `Connected` and the relay is up
    pub fn preferred(&self, to: &UserId) -> ChannelKind {
        if self.mode.borrow().is_connected() && self.relay.is_available(to) {
            ChannelKind::Relayed
        } else {
            ChannelKind::Discovery
        }
    }

    /// Send on the preferred channel, falling back once to the other.
    ///
    /// The message is stamped with the channel that carries it; the content
    /// is otherwise identical on both attempts.
    pub async fn send_signal(
        &self,
        message: &SignalingMessage,
    ) -> Result<SendOutcome, SignalError> {
        let to = &message.receiver_id;
        let preferred = self.preferred(to);

        let primary = match self.attempt(preferred, message).await {
            Ok(()) => {
                return Ok(SendOutcome {
                    preferred,
                    used: preferred,
                })
            }
            Err(e) => e,
        };

        let other = preferred.other();
        if !self.transport(other).is_available(to) {
            warn!(
                call_id = %message.call_id,
                kind = message.payload.kind(),
                channel = %preferred,
                error = %primary,
                "Signal send failed, no fallback channel available"
            );
            return Err(SignalError {
                preferred,
                primary,
                fallback: None,
            });
        }

        info!(
            call_id = %message.call_id,
            kind = message.payload.kind(),
            from = %preferred,
            to = %other,
            error = %primary,
            "Falling back to other channel"
        );
        match self.attempt(other, message).await {
            Ok(()) => Ok(SendOutcome {
                preferred,
                used: other,
            }),
            Err(fallback) => {
                warn!(
                    call_id = %message.call_id,
                    kind = message.payload.kind(),
                    error = %fallback,
                    "Fallback send failed"
                );
                Err(SignalError {
                    preferred,
                    primary,
                    fallback: Some(fallback),
                })
            }
        }
    }

    async fn attempt(
        &self,
        kind: ChannelKind,
        message: &SignalingMessage,
    ) -> Result<(), ChannelError> {
        let transport = self.transport(kind);
        if !transport.is_available(&message.receiver_id) {
            return Err(ChannelError::Unavailable);
        }
        let stamped = message.via(kind);
        transport.send_signal(&stamped, self.ack_timeout).await?;
        debug!(
            call_id = %message.call_id,
            kind = message.payload.kind(),
            channel = %kind,
            "Signal sent"
        );
        Ok(())
    }
}
