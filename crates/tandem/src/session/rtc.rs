//! webrtc-rs backed media backend
//!
//! Capture and encoding are out of scope: local tracks are sample tracks
//! that an application feeds encoded media into through [`RtcTrack`]. The
//! connectivity context is a full `RTCPeerConnection` with trickle ICE and
//! state callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::backend::{
    ConnectivityContext, ContextEvent, ContextEventSink, LocalMedia, MediaBackend,
    MediaConstraints, MediaTrack, SdpKind, SessionDescription, TrackKind, TransportState,
};
use super::ice::IceServer;
use crate::error::NegotiationError;
use crate::signal::IceCandidate;

fn context_err<E: std::fmt::Display>(e: E) -> NegotiationError {
    NegotiationError::Context(e.to_string())
}

/// webrtc-rs [`MediaBackend`]
pub struct RtcBackend {
    api: API,
    /// Camera labels, in switch order
    cameras: Vec<String>,
}

impl RtcBackend {
    pub fn new(cameras: Vec<String>) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, cameras })
    }
}

/// Feed side of a local track. Samples written while the track is
/// disabled are dropped, so the remote sees a paused track.
pub struct RtcTrack {
    sample: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl RtcTrack {
    pub fn from_media(track: &MediaTrack) -> Option<Arc<RtcTrack>> {
        track.handle.clone()?.downcast::<RtcTrack>().ok()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns whether the sample was sent
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, NegotiationError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        self.sample.write_sample(sample).await.map_err(context_err)?;
        Ok(true)
    }
}

fn sample_track(kind: TrackKind, label: &str, enabled: Arc<AtomicBool>) -> MediaTrack {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    let id = uuid::Uuid::new_v4().to_string();
    let sample = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            ..Default::default()
        },
        id.clone(),
        "tandem".to_string(),
    ));
    MediaTrack {
        id,
        kind,
        label: label.to_string(),
        handle: Some(Arc::new(RtcTrack { sample, enabled })),
    }
}

fn local_track(track: &MediaTrack) -> Result<Arc<dyn TrackLocal + Send + Sync>, NegotiationError> {
    RtcTrack::from_media(track)
        .map(|t| Arc::clone(&t.sample) as Arc<dyn TrackLocal + Send + Sync>)
        .ok_or_else(|| NegotiationError::Context(format!("track {} has no rtc handle", track.id)))
}

#[async_trait::async_trait]
impl MediaBackend for RtcBackend {
    async fn acquire_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, NegotiationError> {
        if constraints.video.is_some() && self.cameras.is_empty() {
            return Err(NegotiationError::MediaUnavailable("no camera".into()));
        }
        let audio_enabled = Arc::new(AtomicBool::new(true));
        let video_enabled = Arc::new(AtomicBool::new(true));
        let mut tracks = vec![sample_track(
            TrackKind::Audio,
            "microphone",
            Arc::clone(&audio_enabled),
        )];
        if constraints.video.is_some() {
            tracks.push(sample_track(
                TrackKind::Video,
                &self.cameras[0],
                Arc::clone(&video_enabled),
            ));
        }
        Ok(Arc::new(RtcMedia {
            cameras: self.cameras.clone(),
            audio_enabled,
            video_enabled,
            state: Mutex::new(RtcMediaState {
                tracks,
                camera_index: 0,
            }),
        }))
    }

    async fn create_context(
        &self,
        ice_servers: &[IceServer],
        events: ContextEventSink,
    ) -> Result<Box<dyn ConnectivityContext>, NegotiationError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(context_err)?);

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = sink.emit(ContextEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::New => TransportState::New,
                    RTCPeerConnectionState::Connecting => TransportState::Connecting,
                    RTCPeerConnectionState::Connected => TransportState::Connected,
                    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                    RTCPeerConnectionState::Failed => TransportState::Failed,
                    RTCPeerConnectionState::Closed => TransportState::Closed,
                    _ => return,
                };
                debug!(?state, "Peer connection state changed");
                let _ = sink.emit(ContextEvent::StateChanged(mapped));
            })
        }));

        Ok(Box::new(RtcContext {
            pc,
            video_sender: Mutex::new(None),
        }))
    }
}

struct RtcMediaState {
    tracks: Vec<MediaTrack>,
    camera_index: usize,
}

struct RtcMedia {
    cameras: Vec<String>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    state: Mutex<RtcMediaState>,
}

impl RtcMedia {
    fn enabled(&self, kind: TrackKind) -> &Arc<AtomicBool> {
        match kind {
            TrackKind::Audio => &self.audio_enabled,
            TrackKind::Video => &self.video_enabled,
        }
    }
}

#[async_trait::async_trait]
impl LocalMedia for RtcMedia {
    async fn tracks(&self) -> Vec<MediaTrack> {
        self.state.lock().await.tracks.clone()
    }

    async fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        self.enabled(kind).store(enabled, Ordering::SeqCst);
        debug!(?kind, enabled, "Track toggled");
    }

    async fn is_enabled(&self, kind: TrackKind) -> bool {
        self.enabled(kind).load(Ordering::SeqCst)
    }

    async fn open_next_camera(&self) -> Result<MediaTrack, NegotiationError> {
        let state = self.state.lock().await;
        if self.cameras.len() < 2 {
            return Err(NegotiationError::MediaUnavailable("no other camera".into()));
        }
        let next = (state.camera_index + 1) % self.cameras.len();
        Ok(sample_track(
            TrackKind::Video,
            &self.cameras[next],
            Arc::clone(&self.video_enabled),
        ))
    }

    async fn commit_camera(&self, track: MediaTrack) {
        let mut state = self.state.lock().await;
        if let Some(i) = self.cameras.iter().position(|c| *c == track.label) {
            state.camera_index = i;
        }
        state.tracks.retain(|t| t.kind != TrackKind::Video);
        state.tracks.push(track);
    }

    async fn release(&self, _track: MediaTrack) {}

    async fn stop(&self) {
        self.state.lock().await.tracks.clear();
    }
}

struct RtcContext {
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

#[async_trait::async_trait]
impl ConnectivityContext for RtcContext {
    async fn add_tracks(&self, tracks: &[MediaTrack]) -> Result<(), NegotiationError> {
        for track in tracks {
            let sender = self.pc.add_track(local_track(track)?).await.map_err(context_err)?;
            if track.kind == TrackKind::Video {
                *self.video_sender.lock().await = Some(sender);
            }
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(context_err)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(context_err)?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(context_err)?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await.map_err(context_err)?;
        Ok(sdp)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc.add_ice_candidate(init).await.map_err(context_err)
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), NegotiationError> {
        let sender = self
            .video_sender
            .lock()
            .await
            .clone()
            .ok_or(NegotiationError::InvalidState("no video sender"))?;
        sender
            .replace_track(Some(local_track(track)?))
            .await
            .map_err(context_err)?;
        info!(label = %track.label, "Video track replaced");
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track_of(tracks: &[MediaTrack], kind: TrackKind) -> Arc<RtcTrack> {
        let track = tracks.iter().find(|t| t.kind == kind).unwrap();
        RtcTrack::from_media(track).unwrap()
    }

    #[tokio::test]
    async fn disabled_tracks_drop_samples() {
        let backend = RtcBackend::new(vec!["front".into(), "back".into()]).unwrap();
        let media = backend
            .acquire_media(&MediaConstraints::for_kind(crate::signal::MediaKind::Video))
            .await
            .unwrap();
        let tracks = media.tracks().await;
        let audio = track_of(&tracks, TrackKind::Audio);
        assert!(audio.is_enabled());

        media.set_enabled(TrackKind::Audio, false).await;
        assert!(!media.is_enabled(TrackKind::Audio).await);
        assert!(!audio.is_enabled());
        assert!(track_of(&tracks, TrackKind::Video).is_enabled());
        assert_eq!(audio.write_sample(&Sample::default()).await, Ok(false));
    }

    #[tokio::test]
    async fn next_camera_inherits_the_video_gate() {
        let backend = RtcBackend::new(vec!["front".into(), "back".into()]).unwrap();
        let media = backend
            .acquire_media(&MediaConstraints::for_kind(crate::signal::MediaKind::Video))
            .await
            .unwrap();
        media.set_enabled(TrackKind::Video, false).await;

        let next = media.open_next_camera().await.unwrap();
        assert_eq!(next.label, "back");
        assert!(!RtcTrack::from_media(&next).unwrap().is_enabled());
    }
}
