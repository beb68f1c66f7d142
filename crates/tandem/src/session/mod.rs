//! Session negotiation engine
//!
//! One [`SessionEngine`] per call. It owns the local media and exactly one
//! connectivity context, and walks the state machine
//!
//! ```text
//! idle → acquiring-media → negotiating → connected → closing → idle
//!              │                └────────────┴──→ failed
//!              └──(no media / no offer)──→ closing → idle
//! ```
//!
//! Remote candidates that arrive before the remote description is applied
//! are buffered and replayed, in receipt order, right after it is applied.

pub mod backend;
pub mod ice;
pub mod loopback;

#[cfg(feature = "webrtc")]
pub mod rtc;

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::signal::{IceCandidate, MediaKind};

pub use backend::{
    ConnectivityContext, ContextEvent, ContextEventSink, EngineEvent, LocalMedia, MediaBackend,
    MediaConstraints, MediaTrack, SessionDescription, TrackKind, TransportState,
};
pub use ice::{IceServer, IceServerProvider};
pub use loopback::{LoopbackBackend, LoopbackNetwork, LoopbackOptions};

/// Public negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AcquiringMedia,
    Negotiating,
    Connected,
    Closing,
    Failed,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AcquiringMedia => "acquiring-media",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Failed => "failed",
        }
    }
}

/// What the engine wants its owner to do after an event
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotice {
    /// Trickle this local candidate to the remote
    SendCandidate(IceCandidate),
    Connected,
    /// Transport failed; the session has been torn down
    Failed,
    /// Transport went away cleanly; the session has been torn down
    Disconnected,
}

/// Result of handing the engine a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Buffered,
    Duplicate,
}

pub struct SessionEngine {
    backend: Arc<dyn MediaBackend>,
    ice: Arc<IceServerProvider>,
    sink: ContextEventSink,
    state: SessionState,
    media: Option<Arc<dyn LocalMedia>>,
    context: Option<Box<dyn ConnectivityContext>>,
    remote_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    seen_candidates: HashSet<String>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl SessionEngine {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        ice: Arc<IceServerProvider>,
        sink: ContextEventSink,
    ) -> Self {
        Self {
            backend,
            ice,
            sink,
            state: SessionState::Idle,
            media: None,
            context: None,
            remote_applied: false,
            pending_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            audio_enabled: true,
            video_enabled: true,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    /// Whether local devices are currently held
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    pub fn is_muted(&self) -> bool {
        !self.audio_enabled
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled
    }

    /// Number of candidates waiting for the remote description
    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    // ========== Negotiation ==========

    /// Acquire media, build the context and produce the local offer
    pub async fn start_call(
        &mut self,
        kind: MediaKind,
        cancel: &CancellationToken,
    ) -> Result<String, NegotiationError> {
        self.expect_state(SessionState::Idle)?;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
            r = self.prepare_and_offer(kind) => r,
        };
        self.settle(result).await
    }

    /// Acquire media, apply the remote offer and produce the local answer
    pub async fn answer_call(
        &mut self,
        kind: MediaKind,
        offer: String,
        cancel: &CancellationToken,
    ) -> Result<String, NegotiationError> {
        self.expect_state(SessionState::Idle)?;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
            r = self.prepare_and_answer(kind, offer) => r,
        };
        self.settle(result).await
    }

    async fn prepare_and_offer(&mut self, kind: MediaKind) -> Result<String, NegotiationError> {
        self.prepare(kind).await?;
        let context = self.context()?;
        let offer = context.create_offer().await?;
        self.state = SessionState::Negotiating;
        debug!(generation = self.generation(), "Local offer created");
        Ok(offer)
    }

    async fn prepare_and_answer(
        &mut self,
        kind: MediaKind,
        offer: String,
    ) -> Result<String, NegotiationError> {
        self.prepare(kind).await?;
        self.context()?
            .set_remote_description(SessionDescription::offer(offer))
            .await?;
        self.remote_applied = true;
        self.replay_candidates().await;
        let answer = self.context()?.create_answer().await?;
        self.state = SessionState::Negotiating;
        debug!(generation = self.generation(), "Local answer created");
        Ok(answer)
    }

    async fn prepare(&mut self, kind: MediaKind) -> Result<(), NegotiationError> {
        self.state = SessionState::AcquiringMedia;
        let media = match self
            .backend
            .acquire_media(&MediaConstraints::for_kind(kind))
            .await
        {
            Ok(m) => m,
            Err(NegotiationError::MediaUnavailable(reason)) if kind == MediaKind::Video => {
                info!(reason = %reason, "Camera unavailable, continuing audio-only");
                self.video_enabled = false;
                self.backend
                    .acquire_media(&MediaConstraints::audio_only())
                    .await?
            }
            Err(e) => return Err(e),
        };
        // Toggles made before media existed still apply
        for (kind, on) in [
            (TrackKind::Audio, self.audio_enabled),
            (TrackKind::Video, self.video_enabled),
        ] {
            if !on {
                media.set_enabled(kind, false).await;
            }
        }
        self.media = Some(Arc::clone(&media));

        let servers = self.ice.servers().await;
        let context = self
            .backend
            .create_context(&servers, self.sink.clone())
            .await?;
        context.add_tracks(&media.tracks().await).await?;
        self.context = Some(context);
        Ok(())
    }

    /// On failure or cancellation release everything and return to idle.
    /// Nothing was negotiated yet, so there is no failed session to keep.
    async fn settle(
        &mut self,
        result: Result<String, NegotiationError>,
    ) -> Result<String, NegotiationError> {
        match result {
            Ok(sdp) => Ok(sdp),
            Err(NegotiationError::Cancelled) => {
                self.end_call().await;
                Err(NegotiationError::Cancelled)
            }
            Err(e) => {
                warn!(
                    generation = self.generation(),
                    state = self.state.name(),
                    error = %e,
                    "Session setup failed"
                );
                self.end_call().await;
                Err(e)
            }
        }
    }

    /// Apply the remote answer to our offer. A second answer is rejected.
    pub async fn apply_answer(&mut self, sdp: String) -> Result<(), NegotiationError> {
        if self.remote_applied {
            return Err(NegotiationError::Duplicate("answer"));
        }
        self.expect_state(SessionState::Negotiating)?;
        if let Err(e) = self
            .context()?
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            warn!(error = %e, "Remote answer rejected");
            self.teardown().await;
            self.state = SessionState::Failed;
            return Err(e);
        }
        self.remote_applied = true;
        self.replay_candidates().await;
        Ok(())
    }

    /// Apply or buffer a remote candidate. Repeats are ignored.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> CandidateOutcome {
        if !self.seen_candidates.insert(candidate.candidate.clone()) {
            debug!(candidate = %candidate.candidate, "Duplicate remote candidate ignored");
            return CandidateOutcome::Duplicate;
        }
        if !self.remote_applied {
            self.pending_candidates.push(candidate);
            return CandidateOutcome::Buffered;
        }
        self.apply_candidate(&candidate).await;
        CandidateOutcome::Applied
    }

    async fn replay_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(count = pending.len(), "Replaying buffered candidates");
        }
        for candidate in pending {
            self.apply_candidate(&candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: &IceCandidate) {
        let Some(context) = &self.context else {
            return;
        };
        if let Err(e) = context.add_ice_candidate(candidate).await {
            warn!(candidate = %candidate.candidate, error = %e, "Remote candidate rejected");
        }
    }

    // ========== Events ==========

    /// React to a backend event. Events from other generations are ignored.
    pub async fn handle_event(&mut self, event: EngineEvent) -> Option<EngineNotice> {
        if event.generation != self.generation() {
            debug!(
                generation = event.generation,
                current = self.generation(),
                "Ignoring event from stale context"
            );
            return None;
        }
        match event.event {
            ContextEvent::LocalCandidate(c) => match self.state {
                SessionState::Negotiating | SessionState::Connected => {
                    Some(EngineNotice::SendCandidate(c))
                }
                _ => None,
            },
            ContextEvent::StateChanged(TransportState::Connected) => {
                if self.state == SessionState::Negotiating {
                    self.state = SessionState::Connected;
                    info!(generation = self.generation(), "Media session connected");
                    Some(EngineNotice::Connected)
                } else {
                    None
                }
            }
            ContextEvent::StateChanged(TransportState::Failed) => match self.state {
                SessionState::Negotiating | SessionState::Connected => {
                    warn!(generation = self.generation(), "Transport failed");
                    self.teardown().await;
                    self.state = SessionState::Failed;
                    Some(EngineNotice::Failed)
                }
                _ => None,
            },
            ContextEvent::StateChanged(TransportState::Disconnected) => match self.state {
                SessionState::Negotiating | SessionState::Connected => {
                    info!(generation = self.generation(), "Transport disconnected");
                    self.state = SessionState::Closing;
                    self.teardown().await;
                    self.state = SessionState::Idle;
                    Some(EngineNotice::Disconnected)
                }
                _ => None,
            },
            ContextEvent::StateChanged(_) => None,
        }
    }

    // ========== Media controls ==========

    /// Flip the microphone. Returns whether it is now muted.
    pub async fn toggle_mute(&mut self) -> bool {
        self.audio_enabled = !self.audio_enabled;
        if let Some(media) = &self.media {
            media.set_enabled(TrackKind::Audio, self.audio_enabled).await;
        }
        !self.audio_enabled
    }

    /// Flip the camera. Returns whether video is now enabled.
    pub async fn toggle_video(&mut self) -> bool {
        self.video_enabled = !self.video_enabled;
        if let Some(media) = &self.media {
            media.set_enabled(TrackKind::Video, self.video_enabled).await;
        }
        self.video_enabled
    }

    /// Replace the outgoing video track in place. On failure the previous
    /// track stays active and the call continues.
    pub async fn switch_camera(&mut self) -> Result<String, NegotiationError> {
        let (Some(media), Some(context)) = (&self.media, &self.context) else {
            return Err(NegotiationError::InvalidState(self.state.name()));
        };
        let track = media.open_next_camera().await?;
        match context.replace_video_track(&track).await {
            Ok(()) => {
                let label = track.label.clone();
                media.commit_camera(track).await;
                info!(label = %label, "Camera switched");
                Ok(label)
            }
            Err(e) => {
                warn!(error = %e, "Camera switch failed, keeping previous track");
                media.release(track).await;
                Err(e)
            }
        }
    }

    // ========== Teardown ==========

    /// Stop media, close the context and return to idle. Idempotent.
    pub async fn end_call(&mut self) {
        if self.media.is_some() || self.context.is_some() {
            self.state = SessionState::Closing;
        }
        self.teardown().await;
        self.state = SessionState::Idle;
    }

    async fn teardown(&mut self) {
        if let Some(media) = self.media.take() {
            media.stop().await;
        }
        if let Some(context) = self.context.take() {
            context.close().await;
        }
        self.remote_applied = false;
        self.pending_candidates.clear();
        self.seen_candidates.clear();
    }

    fn context(&self) -> Result<&dyn ConnectivityContext, NegotiationError> {
        self.context
            .as_deref()
            .ok_or(NegotiationError::InvalidState(self.state.name()))
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), NegotiationError> {
        if self.state != expected {
            return Err(NegotiationError::InvalidState(self.state.name()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::session::ice::IceConfig;

    struct Harness {
        backend: LoopbackBackend,
        rx: mpsc::UnboundedReceiver<EngineEvent>,
        engine: SessionEngine,
    }

    fn harness_with(network: LoopbackNetwork, options: LoopbackOptions, generation: u64) -> Harness {
        let backend = LoopbackBackend::with_options(network, options);
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = SessionEngine::new(
            Arc::new(backend.clone()),
            Arc::new(IceServerProvider::stun_only(IceConfig::default())),
            ContextEventSink::new(generation, tx),
        );
        Harness { backend, rx, engine }
    }

    fn harness(network: LoopbackNetwork, generation: u64) -> Harness {
        harness_with(network, LoopbackOptions::default(), generation)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 127.0.0.1 {} typ host", 5000 + n))
    }

    async fn drain(h: &mut Harness) -> Vec<EngineNotice> {
        let mut out = Vec::new();
        while let Ok(ev) = h.rx.try_recv() {
            if let Some(n) = h.engine.handle_event(ev).await {
                out.push(n);
            }
        }
        out
    }

    #[tokio::test]
    async fn offer_answer_connects_both_sides() {
        let network = LoopbackNetwork::new();
        let mut a = harness(network.clone(), 1);
        let mut b = harness(network, 2);
        let cancel = CancellationToken::new();

        let offer = a.engine.start_call(MediaKind::Video, &cancel).await.unwrap();
        assert_eq!(a.engine.state(), SessionState::Negotiating);
        let a_cands: Vec<_> = drain(&mut a)
            .await
            .into_iter()
            .filter_map(|n| match n {
                EngineNotice::SendCandidate(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(a_cands.len(), 1);

        let answer = b.engine.answer_call(MediaKind::Video, offer, &cancel).await.unwrap();
        b.engine.add_remote_candidate(a_cands[0].clone()).await;
        let b_notices = drain(&mut b).await;
        assert!(b_notices.contains(&EngineNotice::Connected));
        let b_cand = b_notices
            .iter()
            .find_map(|n| match n {
                EngineNotice::SendCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();

        a.engine.apply_answer(answer).await.unwrap();
        a.engine.add_remote_candidate(b_cand).await;
        assert!(drain(&mut a).await.contains(&EngineNotice::Connected));
        assert_eq!(a.engine.state(), SessionState::Connected);
        assert_eq!(a.backend.open_tracks(), 2);
    }

    #[tokio::test]
    async fn early_candidates_are_buffered_and_replayed_once_in_order() {
        let network = LoopbackNetwork::new();
        let mut a = harness(network.clone(), 1);
        let mut b = harness(network, 2);
        let cancel = CancellationToken::new();
        let offer = a.engine.start_call(MediaKind::Audio, &cancel).await.unwrap();

        // Candidates race ahead of the offer on the callee side
        for n in [3, 1, 2] {
            assert_eq!(
                b.engine.add_remote_candidate(candidate(n)).await,
                CandidateOutcome::Buffered
            );
        }
        assert_eq!(
            b.engine.add_remote_candidate(candidate(1)).await,
            CandidateOutcome::Duplicate
        );
        assert_eq!(b.engine.buffered_candidates(), 3);

        b.engine.answer_call(MediaKind::Audio, offer, &cancel).await.unwrap();
        assert_eq!(b.engine.buffered_candidates(), 0);
        assert!(drain(&mut b).await.contains(&EngineNotice::Connected));

        // Redelivery over the other channel is idempotent
        assert_eq!(
            b.engine.add_remote_candidate(candidate(2)).await,
            CandidateOutcome::Duplicate
        );
        assert_eq!(
            b.engine.add_remote_candidate(candidate(4)).await,
            CandidateOutcome::Applied
        );
    }

    #[tokio::test]
    async fn replay_preserves_receipt_order() {
        use std::sync::Mutex as StdMutex;

        struct Recording {
            applied: Arc<StdMutex<Vec<String>>>,
        }

        #[async_trait::async_trait]
        impl ConnectivityContext for Recording {
            async fn add_tracks(&self, _: &[MediaTrack]) -> Result<(), NegotiationError> {
                Ok(())
            }
            async fn create_offer(&self) -> Result<String, NegotiationError> {
                Ok("offer".into())
            }
            async fn create_answer(&self) -> Result<String, NegotiationError> {
                Ok("answer".into())
            }
            async fn set_remote_description(
                &self,
                _: SessionDescription,
            ) -> Result<(), NegotiationError> {
                Ok(())
            }
            async fn add_ice_candidate(&self, c: &IceCandidate) -> Result<(), NegotiationError> {
                self.applied.lock().unwrap().push(c.candidate.clone());
                Ok(())
            }
            async fn replace_video_track(&self, _: &MediaTrack) -> Result<(), NegotiationError> {
                Ok(())
            }
            async fn close(&self) {}
        }

        struct RecordingBackend {
            inner: LoopbackBackend,
            applied: Arc<StdMutex<Vec<String>>>,
        }

        #[async_trait::async_trait]
        impl MediaBackend for RecordingBackend {
            async fn acquire_media(
                &self,
                c: &MediaConstraints,
            ) -> Result<Arc<dyn LocalMedia>, NegotiationError> {
                self.inner.acquire_media(c).await
            }
            async fn create_context(
                &self,
                _: &[IceServer],
                _: ContextEventSink,
            ) -> Result<Box<dyn ConnectivityContext>, NegotiationError> {
                Ok(Box::new(Recording {
                    applied: Arc::clone(&self.applied),
                }))
            }
        }

        let applied = Arc::new(StdMutex::new(Vec::new()));
        let backend = RecordingBackend {
            inner: LoopbackBackend::new(LoopbackNetwork::new()),
            applied: Arc::clone(&applied),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut engine = SessionEngine::new(
            Arc::new(backend),
            Arc::new(IceServerProvider::stun_only(IceConfig::default())),
            ContextEventSink::new(1, tx),
        );

        for n in [5, 2, 9] {
            engine.add_remote_candidate(candidate(n)).await;
        }
        engine
            .answer_call(MediaKind::Audio, "offer".into(), &CancellationToken::new())
            .await
            .unwrap();
        engine.add_remote_candidate(candidate(5)).await;

        let applied = applied.lock().unwrap().clone();
        assert_eq!(applied, vec![candidate(5).candidate, candidate(2).candidate, candidate(9).candidate]);
    }

    #[tokio::test]
    async fn duplicate_answer_is_rejected() {
        let network = LoopbackNetwork::new();
        let mut a = harness(network.clone(), 1);
        let mut b = harness(network, 2);
        let cancel = CancellationToken::new();
        let offer = a.engine.start_call(MediaKind::Audio, &cancel).await.unwrap();
        let answer = b.engine.answer_call(MediaKind::Audio, offer, &cancel).await.unwrap();

        a.engine.apply_answer(answer.clone()).await.unwrap();
        assert_eq!(
            a.engine.apply_answer(answer).await.unwrap_err(),
            NegotiationError::Duplicate("answer")
        );
        assert_eq!(a.engine.state(), SessionState::Negotiating);
    }

    #[tokio::test]
    async fn denied_media_fails_without_leaks() {
        let mut h = harness_with(
            LoopbackNetwork::new(),
            LoopbackOptions {
                deny_media: true,
                ..Default::default()
            },
            1,
        );
        let err = h
            .engine
            .start_call(MediaKind::Video, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::MediaDenied(_)));
        assert_eq!(h.engine.state(), SessionState::Idle);
        assert!(!h.engine.has_context());
        assert_eq!(h.backend.open_tracks(), 0);
    }

    #[tokio::test]
    async fn failed_remote_answer_is_terminal() {
        let mut h = harness(LoopbackNetwork::new(), 1);
        h.engine
            .start_call(MediaKind::Audio, &CancellationToken::new())
            .await
            .unwrap();
        let err = h.engine.apply_answer("v=0\r\n".into()).await.unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidDescription(_)));
        assert_eq!(h.engine.state(), SessionState::Failed);
        assert_eq!(h.backend.open_tracks(), 0);
    }

    #[tokio::test]
    async fn toggles_reach_the_media_tracks() {
        let mut h = harness(LoopbackNetwork::new(), 1);
        // Muted before the call starts
        assert!(h.engine.toggle_mute().await);
        h.engine
            .start_call(MediaKind::Video, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.backend.track_enabled(TrackKind::Audio), Some(false));
        assert_eq!(h.backend.track_enabled(TrackKind::Video), Some(true));

        assert!(!h.engine.toggle_mute().await);
        assert!(!h.engine.toggle_video().await);
        assert_eq!(h.backend.track_enabled(TrackKind::Audio), Some(true));
        assert_eq!(h.backend.track_enabled(TrackKind::Video), Some(false));
    }

    #[tokio::test]
    async fn missing_camera_degrades_to_audio() {
        let mut h = harness_with(
            LoopbackNetwork::new(),
            LoopbackOptions {
                cameras: vec![],
                ..Default::default()
            },
            1,
        );
        h.engine
            .start_call(MediaKind::Video, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.backend.open_tracks(), 1);
        assert!(!h.engine.is_video_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_media_acquisition() {
        let mut h = harness_with(
            LoopbackNetwork::new(),
            LoopbackOptions {
                acquire_delay: Duration::from_secs(10),
                ..Default::default()
            },
            1,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = h.engine.start_call(MediaKind::Audio, &cancel).await.unwrap_err();
        assert_eq!(err, NegotiationError::Cancelled);
        assert_eq!(h.engine.state(), SessionState::Idle);
        assert_eq!(h.backend.open_tracks(), 0);
    }

    #[tokio::test]
    async fn camera_switch_keeps_context_and_survives_failure() {
        let mut h = harness(LoopbackNetwork::new(), 1);
        h.engine
            .start_call(MediaKind::Video, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.engine.switch_camera().await.unwrap(), "back camera");
        assert_eq!(h.engine.switch_camera().await.unwrap(), "front camera");
        assert_eq!(h.backend.open_tracks(), 2);
        assert_eq!(h.engine.state(), SessionState::Negotiating);

        let mut failing = harness_with(
            LoopbackNetwork::new(),
            LoopbackOptions {
                fail_replace: true,
                ..Default::default()
            },
            1,
        );
        failing
            .engine
            .start_call(MediaKind::Video, &CancellationToken::new())
            .await
            .unwrap();
        assert!(failing.engine.switch_camera().await.is_err());
        assert_eq!(failing.backend.open_tracks(), 2);
        assert!(failing.engine.has_context());
    }

    #[tokio::test]
    async fn end_call_is_idempotent_from_any_state() {
        let mut h = harness(LoopbackNetwork::new(), 1);
        h.engine.end_call().await;
        assert_eq!(h.engine.state(), SessionState::Idle);

        h.engine
            .start_call(MediaKind::Video, &CancellationToken::new())
            .await
            .unwrap();
        h.engine.end_call().await;
        h.engine.end_call().await;
        assert_eq!(h.engine.state(), SessionState::Idle);
        assert!(!h.engine.has_media());
        assert_eq!(h.backend.open_tracks(), 0);
    }

    #[tokio::test]
    async fn peer_teardown_disconnects() {
        let network = LoopbackNetwork::new();
        let mut a = harness(network.clone(), 1);
        let mut b = harness(network, 2);
        let cancel = CancellationToken::new();
        let offer = a.engine.start_call(MediaKind::Audio, &cancel).await.unwrap();
        let answer = b.engine.answer_call(MediaKind::Audio, offer, &cancel).await.unwrap();
        a.engine.apply_answer(answer).await.unwrap();
        drain(&mut b).await;

        a.engine.end_call().await;
        assert!(drain(&mut b).await.contains(&EngineNotice::Disconnected));
        assert!(!b.engine.has_media());
    }

    #[tokio::test]
    async fn stale_generation_events_are_ignored() {
        let mut h = harness(LoopbackNetwork::new(), 7);
        let event = EngineEvent {
            generation: 6,
            event: ContextEvent::StateChanged(TransportState::Failed),
        };
        assert_eq!(h.engine.handle_event(event).await, None);
    }
}
