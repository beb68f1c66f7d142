//! Media backend seam
//!
//! The engine drives local media and a connectivity context through these
//! traits. Backends report asynchronous happenings (local candidates,
//! transport state) through a [`ContextEventSink`] tagged with the owning
//! session's generation, so events from a torn-down context are ignored.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::signal::{IceCandidate, MediaKind};

use super::ice::IceServer;

/// Requested local media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    /// Always requested
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

/// Ideal capture size. Backends pick the closest mode they have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl MediaConstraints {
    pub fn for_kind(kind: MediaKind) -> Self {
        Self {
            audio: true,
            video: match kind {
                MediaKind::Video => Some(VideoConstraints::default()),
                MediaKind::Audio => None,
            },
        }
    }

    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local capture track. `handle` carries backend-specific state.
#[derive(Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    /// Device label, e.g. "front camera"
    pub label: String,
    pub handle: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .finish()
    }
}

/// Local capture devices owned by one session
#[async_trait::async_trait]
pub trait LocalMedia: Send + Sync {
    async fn tracks(&self) -> Vec<MediaTrack>;

    /// Mute or unmute every track of `kind`. A disabled track stays open
    /// but sends no media. Applies to cameras opened later too.
    async fn set_enabled(&self, kind: TrackKind, enabled: bool);

    async fn is_enabled(&self, kind: TrackKind) -> bool;

    /// Open the next camera without touching the current one
    async fn open_next_camera(&self) -> Result<MediaTrack, NegotiationError>;

    /// Make `track` the active camera and release the previous one
    async fn commit_camera(&self, track: MediaTrack);

    /// Release a track opened by `open_next_camera` that was not committed
    async fn release(&self, track: MediaTrack);

    /// Stop every track. Idempotent.
    async fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Transport state reported by a connectivity context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContextEvent {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
}

/// Event tagged with the generation of the session that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub generation: u64,
    pub event: ContextEvent,
}

/// Where a context reports its events
#[derive(Debug, Clone)]
pub struct ContextEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ContextEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session owner has gone away
    pub fn emit(&self, event: ContextEvent) -> bool {
        self.tx
            .send(EngineEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Per-call negotiation object
#[async_trait::async_trait]
pub trait ConnectivityContext: Send + Sync {
    async fn add_tracks(&self, tracks: &[MediaTrack]) -> Result<(), NegotiationError>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    /// Create an answer and apply it as the local description
    async fn create_answer(&self) -> Result<String, NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError>;

    /// Swap the outgoing video track in place, without renegotiation
    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), NegotiationError>;

    /// Tear down. Idempotent.
    async fn close(&self);
}

/// Platform capability providing media devices and connectivity contexts
#[async_trait::async_trait]
pub trait MediaBackend: Send + Sync {
    async fn acquire_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, NegotiationError>;

    async fn create_context(
        &self,
        ice_servers: &[IceServer],
        events: ContextEventSink,
    ) -> Result<Box<dyn ConnectivityContext>, NegotiationError>;
}
