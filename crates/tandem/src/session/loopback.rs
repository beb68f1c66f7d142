//! In-process media backend
//!
//! Deterministic stand-in for a real media stack. Contexts created from the
//! same [`LoopbackNetwork`] find each other through tokens embedded in their
//! session descriptions, so closing one side reports `Disconnected` to the
//! other. A context reports `Connected` once both descriptions are applied
//! and at least one remote candidate arrived.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use super::backend::{
    ConnectivityContext, ContextEvent, ContextEventSink, LocalMedia, MediaBackend,
    MediaConstraints, MediaTrack, SdpKind, SessionDescription, TrackKind, TransportState,
};
use super::ice::IceServer;
use crate::error::NegotiationError;
use crate::signal::IceCandidate;

const TOKEN_PREFIX: &str = "a=x-loopback:";

/// Registry shared by contexts that can reach each other
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    contexts: Arc<Mutex<HashMap<String, ContextEventSink>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Knobs for failure injection
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Refuse device access
    pub deny_media: bool,
    /// Available camera labels. Empty means no camera.
    pub cameras: Vec<String>,
    /// Make `replace_video_track` fail
    pub fail_replace: bool,
    /// Simulated device open latency
    pub acquire_delay: Duration,
    /// How long the peer takes to notice this side closing
    pub disconnect_delay: Duration,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            deny_media: false,
            cameras: vec!["front camera".to_string(), "back camera".to_string()],
            fail_replace: false,
            acquire_delay: Duration::ZERO,
            disconnect_delay: Duration::ZERO,
        }
    }
}

/// Loopback [`MediaBackend`]
#[derive(Clone)]
pub struct LoopbackBackend {
    network: LoopbackNetwork,
    options: LoopbackOptions,
    /// Tracks currently open across all sessions from this backend
    open_tracks: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
    /// Most recently acquired media
    latest: Arc<std::sync::Mutex<Weak<LoopbackMedia>>>,
}

impl LoopbackBackend {
    pub fn new(network: LoopbackNetwork) -> Self {
        Self::with_options(network, LoopbackOptions::default())
    }

    pub fn with_options(network: LoopbackNetwork, options: LoopbackOptions) -> Self {
        Self {
            network,
            options,
            open_tracks: Arc::new(AtomicUsize::new(0)),
            next_id: Arc::new(AtomicU64::new(1)),
            latest: Arc::new(std::sync::Mutex::new(Weak::new())),
        }
    }

    /// Devices currently held open
    pub fn open_tracks(&self) -> usize {
        self.open_tracks.load(Ordering::SeqCst)
    }

    /// Whether tracks of `kind` in the live media are sending. `None` when
    /// no media is held.
    pub fn track_enabled(&self, kind: TrackKind) -> Option<bool> {
        let latest = self.latest.lock().ok()?.upgrade()?;
        if latest.stopped.load(Ordering::SeqCst) {
            return None;
        }
        Some(latest.enabled(kind).load(Ordering::SeqCst))
    }

    fn open_track(&self, kind: TrackKind, label: &str) -> MediaTrack {
        self.open_tracks.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        MediaTrack {
            id: format!("loopback-{id}"),
            kind,
            label: label.to_string(),
            handle: None,
        }
    }
}

#[async_trait::async_trait]
impl MediaBackend for LoopbackBackend {
    async fn acquire_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, NegotiationError> {
        if !self.options.acquire_delay.is_zero() {
            tokio::time::sleep(self.options.acquire_delay).await;
        }
        if self.options.deny_media {
            return Err(NegotiationError::MediaDenied("permission refused".into()));
        }
        if constraints.video.is_some() && self.options.cameras.is_empty() {
            return Err(NegotiationError::MediaUnavailable("no camera".into()));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.open_track(TrackKind::Audio, "microphone"));
        }
        if constraints.video.is_some() {
            tracks.push(self.open_track(TrackKind::Video, &self.options.cameras[0]));
        }
        let media = Arc::new(LoopbackMedia {
            backend: self.clone(),
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            state: Mutex::new(MediaState {
                tracks,
                camera_index: 0,
            }),
        });
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Arc::downgrade(&media);
        }
        Ok(media)
    }

    async fn create_context(
        &self,
        _ice_servers: &[IceServer],
        events: ContextEventSink,
    ) -> Result<Box<dyn ConnectivityContext>, NegotiationError> {
        let token = uuid::Uuid::new_v4().to_string();
        self.network
            .contexts
            .lock()
            .await
            .insert(token.clone(), events.clone());
        let _ = events.emit(ContextEvent::StateChanged(TransportState::New));
        Ok(Box::new(LoopbackContext {
            token,
            network: self.network.clone(),
            events,
            fail_replace: self.options.fail_replace,
            disconnect_delay: self.options.disconnect_delay,
            closed: AtomicBool::new(false),
            state: Mutex::new(ContextState::default()),
        }))
    }
}

struct MediaState {
    tracks: Vec<MediaTrack>,
    camera_index: usize,
}

struct LoopbackMedia {
    backend: LoopbackBackend,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    stopped: AtomicBool,
    state: Mutex<MediaState>,
}

impl LoopbackMedia {
    fn enabled(&self, kind: TrackKind) -> &AtomicBool {
        match kind {
            TrackKind::Audio => &self.audio_enabled,
            TrackKind::Video => &self.video_enabled,
        }
    }
}

#[async_trait::async_trait]
impl LocalMedia for LoopbackMedia {
    async fn tracks(&self) -> Vec<MediaTrack> {
        self.state.lock().await.tracks.clone()
    }

    async fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        self.enabled(kind).store(enabled, Ordering::SeqCst);
        debug!(?kind, enabled, "Loopback track toggled");
    }

    async fn is_enabled(&self, kind: TrackKind) -> bool {
        self.enabled(kind).load(Ordering::SeqCst)
    }

    async fn open_next_camera(&self) -> Result<MediaTrack, NegotiationError> {
        let state = self.state.lock().await;
        let cameras = &self.backend.options.cameras;
        if self.stopped.load(Ordering::SeqCst) || cameras.len() < 2 {
            return Err(NegotiationError::MediaUnavailable("no other camera".into()));
        }
        let next = (state.camera_index + 1) % cameras.len();
        Ok(self.backend.open_track(TrackKind::Video, &cameras[next]))
    }

    async fn commit_camera(&self, track: MediaTrack) {
        let mut state = self.state.lock().await;
        let cameras = &self.backend.options.cameras;
        if let Some(i) = cameras.iter().position(|c| *c == track.label) {
            state.camera_index = i;
        }
        let before = state.tracks.len();
        state.tracks.retain(|t| t.kind != TrackKind::Video);
        let released = before - state.tracks.len();
        self.backend.open_tracks.fetch_sub(released, Ordering::SeqCst);
        state.tracks.push(track);
    }

    async fn release(&self, _track: MediaTrack) {
        self.backend.open_tracks.fetch_sub(1, Ordering::SeqCst);
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let n = state.tracks.len();
        state.tracks.clear();
        self.backend.open_tracks.fetch_sub(n, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ContextState {
    local: Option<SdpKind>,
    /// Token of the peer context, learned from its description
    remote: Option<String>,
    remote_candidates: usize,
    candidate_seq: u32,
    connected: bool,
}

struct LoopbackContext {
    token: String,
    network: LoopbackNetwork,
    events: ContextEventSink,
    fail_replace: bool,
    disconnect_delay: Duration,
    closed: AtomicBool,
    state: Mutex<ContextState>,
}

impl LoopbackContext {
    fn check_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Context("context closed".into()));
        }
        Ok(())
    }

    fn describe(&self, kind: SdpKind) -> String {
        let kind = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        format!("v=0\r\ns=loopback {kind}\r\n{TOKEN_PREFIX}{}\r\n", self.token)
    }

    /// Emit one host candidate per local description
    fn gather(&self, state: &mut ContextState) {
        state.candidate_seq += 1;
        let mut c = IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host ufrag {}",
            state.candidate_seq,
            40000 + state.candidate_seq,
            &self.token[..8]
        ));
        c.sdp_mid = Some("0".into());
        c.sdp_mline_index = Some(0);
        let _ = self.events.emit(ContextEvent::LocalCandidate(c));
        let _ = self
            .events
            .emit(ContextEvent::StateChanged(TransportState::Connecting));
    }

    fn maybe_connect(&self, state: &mut ContextState) {
        if !state.connected
            && state.local.is_some()
            && state.remote.is_some()
            && state.remote_candidates > 0
        {
            state.connected = true;
            let _ = self
                .events
                .emit(ContextEvent::StateChanged(TransportState::Connected));
        }
    }
}

#[async_trait::async_trait]
impl ConnectivityContext for LoopbackContext {
    async fn add_tracks(&self, tracks: &[MediaTrack]) -> Result<(), NegotiationError> {
        self.check_open()?;
        debug!(count = tracks.len(), "Loopback tracks attached");
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        if state.local.is_some() {
            return Err(NegotiationError::InvalidState("local description already set"));
        }
        state.local = Some(SdpKind::Offer);
        self.gather(&mut state);
        Ok(self.describe(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        if state.remote.is_none() {
            return Err(NegotiationError::InvalidState("no remote offer"));
        }
        state.local = Some(SdpKind::Answer);
        self.gather(&mut state);
        self.maybe_connect(&mut state);
        Ok(self.describe(SdpKind::Answer))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.check_open()?;
        let token = description
            .sdp
            .lines()
            .find_map(|l| l.strip_prefix(TOKEN_PREFIX))
            .map(str::to_string)
            .ok_or_else(|| NegotiationError::InvalidDescription("missing loopback token".into()))?;

        let mut state = self.state.lock().await;
        match (description.kind, state.local) {
            (SdpKind::Offer, None) | (SdpKind::Answer, Some(SdpKind::Offer)) => {}
            _ => return Err(NegotiationError::InvalidState("unexpected description")),
        }
        state.remote = Some(token);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        self.check_open()?;
        if !candidate.candidate.starts_with("candidate:") {
            return Err(NegotiationError::InvalidDescription(format!(
                "bad candidate {}",
                candidate.candidate
            )));
        }
        let mut state = self.state.lock().await;
        if state.remote.is_none() {
            return Err(NegotiationError::InvalidState("candidate before remote description"));
        }
        state.remote_candidates += 1;
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), NegotiationError> {
        self.check_open()?;
        if self.fail_replace {
            return Err(NegotiationError::Context("replace_track refused".into()));
        }
        debug!(track = %track.id, label = %track.label, "Loopback video track replaced");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let remote = self.state.lock().await.remote.clone();
        let mut contexts = self.network.contexts.lock().await;
        contexts.remove(&self.token);
        if let Some(peer) = remote.and_then(|r| contexts.get(&r)).cloned() {
            if self.disconnect_delay.is_zero() {
                let _ = peer.emit(ContextEvent::StateChanged(TransportState::Disconnected));
            } else {
                let delay = self.disconnect_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = peer.emit(ContextEvent::StateChanged(TransportState::Disconnected));
                });
            }
        }
        let _ = self
            .events
            .emit(ContextEvent::StateChanged(TransportState::Closed));
    }
}
