//! Call lifecycle controller
//!
//! One task owns every call for the local user. It consumes typed queues
//! (handle commands, inbound signals, engine events, outbox reports) in a
//! single `select!` loop, so call state is never shared.
//!
//! ```text
//! idle ──local call──▶ calling ──accept/answer──▶ active ──end/failure──▶ ended
//!   └──invite/offer──▶ ringing ──local accept───▶ active
//! calling ──reject / 30s deadline──▶ ended      ringing ──reject / cancel──▶ ended
//! ```
//!
//! At most one call exists at a time; a second attempt is refused before it
//! reaches the session engine.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::history::{CallHistory, CallRecord};
use super::outbox::{Outbox, SendReport};
use super::{CallSession, CallState, ClientEvent, Direction, EndReason};
use crate::error::{CallError, NegotiationError};
use crate::session::{
    ContextEventSink, EngineEvent, EngineNotice, IceServerProvider, MediaBackend, SessionEngine,
};
use crate::signal::{CallId, MediaKind, SignalPayload, SignalingMessage, UserId};

/// Finished call ids remembered for dropping late duplicates
const RECENT_CALLS: usize = 32;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub local: UserId,
    /// Peers with a standing rendezvous membership
    pub contacts: HashSet<UserId>,
    /// Outgoing ring deadline
    pub ring_timeout: Duration,
    /// Extra time an incoming call keeps ringing past `ring_timeout`
    pub ring_grace: Duration,
}

pub struct ControllerDeps {
    pub backend: Arc<dyn MediaBackend>,
    pub ice: Arc<IceServerProvider>,
    pub outbox: Outbox,
    pub reports: mpsc::UnboundedReceiver<SendReport>,
    pub signals: mpsc::Receiver<SignalingMessage>,
    pub events: broadcast::Sender<ClientEvent>,
    pub history: Option<Arc<dyn CallHistory>>,
}

enum Command {
    StartOutgoing {
        remote: UserId,
        media: MediaKind,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ToggleMute {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ToggleVideo {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    SwitchCamera {
        reply: oneshot::Sender<Result<String, CallError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Option<CallSession>>,
    },
}

/// Handle used by UI code to drive calls. Cheap to clone.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    /// Cancellation token of the current call, if any
    active: watch::Receiver<Option<CancellationToken>>,
}

impl CallHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CallError::ControllerGone)?;
        rx.await.map_err(|_| CallError::ControllerGone)
    }

    /// Place a call. Resolves once the local offer is out, or with the
    /// negotiation error that ended the call.
    pub async fn start_outgoing_call(
        &self,
        remote: impl Into<UserId>,
        media: MediaKind,
    ) -> Result<CallId, CallError> {
        let remote = remote.into();
        self.request(|reply| Command::StartOutgoing {
            remote,
            media,
            reply,
        })
        .await?
    }

    pub async fn accept_incoming_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await?
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await?
    }

    /// Hang up. Interrupts in-flight media acquisition. Idempotent.
    pub async fn end_call(&self) -> Result<(), CallError> {
        if let Some(token) = self.active.borrow().as_ref() {
            token.cancel();
        }
        self.request(|reply| Command::End { reply }).await?
    }

    /// Returns whether the microphone is now muted
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await?
    }

    /// Returns whether video is now enabled
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleVideo { reply }).await?
    }

    /// Returns the label of the camera now in use
    pub async fn switch_camera(&self) -> Result<String, CallError> {
        self.request(|reply| Command::SwitchCamera { reply }).await?
    }

    /// Current call, or the last one to end
    pub async fn snapshot(&self) -> Result<Option<CallSession>, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}

struct ActiveCall {
    session: CallSession,
    engine: SessionEngine,
    cancel: CancellationToken,
    /// Ring deadline, incoming expiry, or the wait for the remote's
    /// offer or answer once the call is accepted
    deadline: Option<Instant>,
    pending_offer: Option<String>,
    offer_seen: bool,
    accepted: bool,
    /// Rendezvous joined for this call only
    ad_hoc: bool,
}

impl ActiveCall {
    fn mark_answered(&mut self) {
        self.session.state = CallState::Active;
        self.session.answered_at = Some(Utc::now());
    }
}

struct Controller {
    config: ControllerConfig,
    backend: Arc<dyn MediaBackend>,
    ice: Arc<IceServerProvider>,
    outbox: Outbox,
    events: broadcast::Sender<ClientEvent>,
    history: Option<Arc<dyn CallHistory>>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    active_token: watch::Sender<Option<CancellationToken>>,
    call: Option<ActiveCall>,
    last: Option<CallSession>,
    generation: u64,
    recent: VecDeque<CallId>,
}

/// Spawn the controller loop
pub fn spawn_controller(
    config: ControllerConfig,
    deps: ControllerDeps,
    cancel: CancellationToken,
) -> (CallHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(32);
    let (engine_tx, engine_rx) = mpsc::unbounded_channel();
    let (active_token, active_rx) = watch::channel(None);

    let controller = Controller {
        config,
        backend: deps.backend,
        ice: deps.ice,
        outbox: deps.outbox,
        events: deps.events,
        history: deps.history,
        engine_tx,
        active_token,
        call: None,
        last: None,
        generation: 0,
        recent: VecDeque::new(),
    };
    let handle = tokio::spawn(controller.run(
        commands_rx,
        deps.signals,
        engine_rx,
        deps.reports,
        cancel,
    ));
    (
        CallHandle {
            commands: commands_tx,
            active: active_rx,
        },
        handle,
    )
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl Controller {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: mpsc::Receiver<SignalingMessage>,
        mut engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
        mut reports: mpsc::UnboundedReceiver<SendReport>,
        cancel: CancellationToken,
    ) {
        info!(user = %self.config.local, "Call controller started");
        loop {
            let deadline = self.call.as_ref().and_then(|c| c.deadline);
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(msg) = signals.recv() => self.handle_signal(msg).await,
                Some(event) = engine_rx.recv() => self.handle_engine_event(event).await,
                Some(report) = reports.recv() => self.handle_report(report).await,
                _ = sleep_until_opt(deadline) => self.on_deadline().await,
            }
        }

        let reason = self.call.as_ref().map(|c| match c.session.state {
            CallState::Active => EndReason::Normal,
            _ => EndReason::Cancelled,
        });
        if let Some(reason) = reason {
            self.finish(reason, None).await;
        }
        info!(user = %self.config.local, "Call controller stopped");
    }

    // ========== Commands ==========

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartOutgoing {
                remote,
                media,
                reply,
            } => {
                let result = self.start_outgoing(remote, media).await;
                let _ = reply.send(result);
            }
            Command::Accept { reply } => {
                let result = self.accept().await;
                let _ = reply.send(result);
            }
            Command::Reject { reply } => {
                let result = self.reject().await;
                let _ = reply.send(result);
            }
            Command::End { reply } => {
                self.end().await;
                let _ = reply.send(Ok(()));
            }
            Command::ToggleMute { reply } => {
                let result = match self.call.as_mut() {
                    Some(call) => Ok(call.engine.toggle_mute().await),
                    None => Err(CallError::NoCall),
                };
                self.publish();
                let _ = reply.send(result);
            }
            Command::ToggleVideo { reply } => {
                let result = match self.call.as_mut() {
                    Some(call) => Ok(call.engine.toggle_video().await),
                    None => Err(CallError::NoCall),
                };
                self.publish();
                let _ = reply.send(result);
            }
            Command::SwitchCamera { reply } => {
                let result = match self.call.as_mut() {
                    Some(call) => call.engine.switch_camera().await.map_err(CallError::from),
                    None => Err(CallError::NoCall),
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let current = self.call.as_ref().map(|c| c.session.clone());
                let _ = reply.send(current.or_else(|| self.last.clone()));
            }
        }
    }

    async fn start_outgoing(
        &mut self,
        remote: UserId,
        media: MediaKind,
    ) -> Result<CallId, CallError> {
        if remote == self.config.local {
            return Err(CallError::SelfCall);
        }
        if let Some(call) = &self.call {
            warn!(
                active = %call.session.call_id,
                peer = %remote,
                "Call attempt refused, another call is active"
            );
            return Err(CallError::Busy);
        }

        let call_id = CallId::generate();
        let session = CallSession::new(
            call_id.clone(),
            self.config.local.clone(),
            remote.clone(),
            media,
            Direction::Outgoing,
        );
        let deadline = Instant::now() + self.config.ring_timeout;
        self.begin(session, Some(deadline));
        info!(call_id = %call_id, peer = %remote, ?media, "Placing call");

        // Ring the remote before negotiation starts
        self.send(SignalPayload::Invite { media });
        self.publish();

        let Some(call) = self.call.as_mut() else {
            return Err(CallError::NoCall);
        };
        let result =
            tokio::time::timeout_at(deadline, call.engine.start_call(media, &call.cancel)).await;
        match result {
            Ok(Ok(offer)) => {
                self.send(SignalPayload::Offer { sdp: offer });
                self.publish();
                Ok(call_id)
            }
            // A hangup is queued behind us and will finish the call
            Ok(Err(NegotiationError::Cancelled)) => Ok(call_id),
            Ok(Err(e)) => {
                warn!(call_id = %call_id, error = %e, "Outgoing call failed");
                self.finish(EndReason::Failed, Some(SignalPayload::CallEnd))
                    .await;
                Err(e.into())
            }
            Err(_) => {
                self.ring_expired().await;
                Ok(call_id)
            }
        }
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        let ring_timeout = self.config.ring_timeout;
        let Some(call) = self.call.as_mut() else {
            return Err(CallError::NoCall);
        };
        if call.session.direction != Direction::Incoming || call.session.state != CallState::Ringing
        {
            return Err(CallError::NoCall);
        }
        call.accepted = true;
        call.mark_answered();
        call.deadline = match call.pending_offer {
            Some(_) => None,
            None => Some(Instant::now() + ring_timeout),
        };
        info!(call_id = %call.session.call_id, peer = %call.session.remote_user_id, "Call accepted");
        self.send(SignalPayload::Accept);
        self.publish();
        self.answer().await
    }

    /// Answer the pending offer, if both it and the local accept are in
    async fn answer(&mut self) -> Result<(), CallError> {
        let Some(call) = self.call.as_mut() else {
            return Err(CallError::NoCall);
        };
        if !call.accepted {
            return Ok(());
        }
        let Some(offer) = call.pending_offer.take() else {
            return Ok(());
        };
        let media = call.session.media_kind;
        match call.engine.answer_call(media, offer, &call.cancel).await {
            Ok(answer) => {
                call.deadline = None;
                self.send(SignalPayload::Answer { sdp: answer });
                self.publish();
                Ok(())
            }
            Err(NegotiationError::Cancelled) => Ok(()),
            Err(e) => {
                warn!(call_id = %call.session.call_id, error = %e, "Answering failed");
                self.finish(EndReason::Failed, Some(SignalPayload::CallEnd))
                    .await;
                Err(e.into())
            }
        }
    }

    async fn reject(&mut self) -> Result<(), CallError> {
        match self.call.as_ref().map(|c| (c.session.direction, c.session.state)) {
            Some((Direction::Incoming, CallState::Ringing)) => {
                self.finish(EndReason::Rejected, Some(SignalPayload::Reject { busy: false }))
                    .await;
                Ok(())
            }
            _ => Err(CallError::NoCall),
        }
    }

    async fn end(&mut self) {
        let Some(state) = self.call.as_ref().map(|c| c.session.state) else {
            debug!("End requested with no call");
            return;
        };
        match state {
            CallState::Ringing => {
                self.finish(EndReason::Rejected, Some(SignalPayload::Reject { busy: false }))
                    .await
            }
            CallState::Active => {
                self.finish(EndReason::Normal, Some(SignalPayload::CallEnd))
                    .await
            }
            _ => {
                self.finish(EndReason::Cancelled, Some(SignalPayload::CallEnd))
                    .await
            }
        }
    }

    // ========== Inbound signals ==========

    async fn handle_signal(&mut self, msg: SignalingMessage) {
        if msg.receiver_id != self.config.local {
            warn!(
                call_id = %msg.call_id,
                receiver = %msg.receiver_id,
                "Dropping signal addressed to someone else"
            );
            return;
        }
        if msg.caller_id == self.config.local {
            warn!(call_id = %msg.call_id, "Dropping signal from ourselves");
            return;
        }

        let current = self
            .call
            .as_ref()
            .map(|c| (c.session.call_id == msg.call_id, c.session.remote_user_id.clone()));
        match current {
            Some((true, remote)) => {
                if msg.caller_id != remote {
                    warn!(
                        call_id = %msg.call_id,
                        sender = %msg.caller_id,
                        "Dropping signal from a non-participant"
                    );
                    return;
                }
                self.note_remote_channel(&msg);
                self.apply_to_call(msg).await;
            }
            _ => self.handle_foreign(msg),
        }
    }

    /// A signal for a call other than the current one
    fn handle_foreign(&mut self, msg: SignalingMessage) {
        if self.recent.contains(&msg.call_id) {
            debug!(call_id = %msg.call_id, kind = msg.payload.kind(), "Late signal for finished call");
            return;
        }
        let starts_call = matches!(
            msg.payload,
            SignalPayload::Invite { .. } | SignalPayload::Offer { .. }
        );
        if !starts_call {
            debug!(call_id = %msg.call_id, kind = msg.payload.kind(), "Signal for unknown call");
            return;
        }
        if self.call.is_none() {
            self.ring(msg);
            return;
        }

        info!(
            call_id = %msg.call_id,
            peer = %msg.caller_id,
            "Busy, rejecting incoming call"
        );
        let reply = SignalingMessage::new(
            msg.call_id.clone(),
            self.config.local.clone(),
            msg.caller_id.clone(),
            SignalPayload::Reject { busy: true },
        );
        self.outbox.signal(reply, None);
        self.remember(msg.call_id);
    }

    fn ring(&mut self, msg: SignalingMessage) {
        let (media, offer) = match msg.payload {
            SignalPayload::Invite { media } => (media, None),
            SignalPayload::Offer { sdp } => {
                let media = if sdp.contains("m=video") {
                    MediaKind::Video
                } else {
                    MediaKind::Audio
                };
                (media, Some(sdp))
            }
            _ => return,
        };
        let mut session = CallSession::new(
            msg.call_id.clone(),
            self.config.local.clone(),
            msg.caller_id.clone(),
            media,
            Direction::Incoming,
        );
        session.remote_channel_used = msg.channel;
        let expiry = Instant::now() + self.config.ring_timeout + self.config.ring_grace;
        self.begin(session, Some(expiry));
        if let Some(call) = self.call.as_mut() {
            call.offer_seen = offer.is_some();
            call.pending_offer = offer;
        }
        info!(call_id = %msg.call_id, peer = %msg.caller_id, ?media, "Incoming call");
        self.publish();
    }

    async fn apply_to_call(&mut self, msg: SignalingMessage) {
        let answer_wait = self.config.ring_timeout;
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let call_id = call.session.call_id.clone();
        let direction = call.session.direction;
        let state = call.session.state;

        match msg.payload {
            SignalPayload::Invite { .. } => {
                debug!(call_id = %call_id, "Duplicate invite ignored");
            }
            SignalPayload::Offer { sdp } => {
                if direction != Direction::Incoming {
                    warn!(call_id = %call_id, "Unexpected offer on outgoing call dropped");
                    return;
                }
                if call.offer_seen {
                    warn!(call_id = %call_id, "Duplicate offer rejected");
                    return;
                }
                call.offer_seen = true;
                call.pending_offer = Some(sdp);
                if let Err(e) = self.answer().await {
                    debug!(call_id = %call_id, error = %e, "Deferred answer failed");
                }
            }
            SignalPayload::Answer { sdp } => {
                if direction != Direction::Outgoing {
                    warn!(call_id = %call_id, "Unexpected answer on incoming call dropped");
                    return;
                }
                if state == CallState::Calling {
                    call.mark_answered();
                }
                match call.engine.apply_answer(sdp).await {
                    Ok(()) => {
                        call.deadline = None;
                        self.publish();
                    }
                    Err(NegotiationError::Duplicate(what)) => {
                        warn!(call_id = %call_id, what, "Duplicate description rejected");
                    }
                    Err(e) => {
                        warn!(call_id = %call_id, error = %e, "Remote answer unusable");
                        self.finish(EndReason::Failed, Some(SignalPayload::CallEnd))
                            .await;
                    }
                }
            }
            SignalPayload::IceCandidate { candidate } => {
                let outcome = call.engine.add_remote_candidate(candidate).await;
                debug!(call_id = %call_id, ?outcome, "Remote candidate");
            }
            SignalPayload::Accept => {
                if direction == Direction::Outgoing && state == CallState::Calling {
                    call.mark_answered();
                    call.deadline = Some(Instant::now() + answer_wait);
                    info!(call_id = %call_id, "Remote accepted");
                    self.publish();
                }
            }
            SignalPayload::Reject { busy } => {
                if direction == Direction::Outgoing && state == CallState::Calling {
                    info!(call_id = %call_id, busy, "Remote rejected");
                    self.finish(EndReason::Rejected, None).await;
                } else {
                    warn!(call_id = %call_id, %state, "Unexpected reject dropped");
                }
            }
            SignalPayload::Missed => {
                if direction == Direction::Incoming && state == CallState::Ringing {
                    info!(call_id = %call_id, "Caller gave up");
                    self.finish(EndReason::Missed, None).await;
                } else {
                    warn!(call_id = %call_id, %state, "Unexpected missed dropped");
                }
            }
            SignalPayload::CallEnd => {
                let reason = match state {
                    CallState::Ringing => EndReason::Cancelled,
                    _ => EndReason::Normal,
                };
                info!(call_id = %call_id, %reason, "Remote hung up");
                self.finish(reason, None).await;
            }
        }
    }

    fn note_remote_channel(&mut self, msg: &SignalingMessage) {
        let Some(channel) = msg.channel else {
            return;
        };
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.session.remote_channel_used.is_none() {
            call.session.remote_channel_used = Some(channel);
            debug!(call_id = %call.session.call_id, %channel, "Remote channel learned");
            self.publish();
        }
    }

    // ========== Engine, outbox, timers ==========

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let Some(notice) = call.engine.handle_event(event).await else {
            return;
        };
        match notice {
            EngineNotice::SendCandidate(candidate) => {
                self.send(SignalPayload::IceCandidate { candidate });
            }
            EngineNotice::Connected => {
                info!(call_id = %call.session.call_id, "Media connected");
                self.publish();
            }
            EngineNotice::Failed => {
                self.finish(EndReason::Failed, Some(SignalPayload::CallEnd))
                    .await;
            }
            EngineNotice::Disconnected => {
                self.finish(EndReason::Disconnected, None).await;
            }
        }
    }

    async fn handle_report(&mut self, report: SendReport) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.session.call_id != report.call_id {
            return;
        }
        match report.result {
            Ok(outcome) => {
                if call.session.local_channel_used.is_none() {
                    call.session.local_channel_used = Some(outcome.preferred);
                    self.publish();
                }
            }
            Err(e) if report.essential => {
                warn!(
                    call_id = %report.call_id,
                    kind = report.kind,
                    error = %e,
                    "Essential signal undeliverable, failing call"
                );
                self.finish(EndReason::Failed, None).await;
            }
            Err(e) => {
                debug!(call_id = %report.call_id, kind = report.kind, error = %e, "Signal lost");
            }
        }
    }

    async fn on_deadline(&mut self) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        match (call.session.direction, call.session.state) {
            (Direction::Outgoing, CallState::Calling) => self.ring_expired().await,
            (Direction::Incoming, CallState::Ringing) => {
                info!(call_id = %call.session.call_id, "Incoming call expired unanswered");
                self.finish(EndReason::Missed, None).await;
            }
            (Direction::Outgoing, _) => {
                warn!(call_id = %call.session.call_id, "Accepted but the answer never arrived");
                self.finish(EndReason::Failed, Some(SignalPayload::CallEnd))
                    .await;
            }
            (Direction::Incoming, _) => {
                warn!(call_id = %call.session.call_id, "Offer never arrived");
                self.finish(EndReason::Failed, Some(SignalPayload::CallEnd))
                    .await;
            }
        }
    }

    async fn ring_expired(&mut self) {
        if let Some(call) = &self.call {
            info!(call_id = %call.session.call_id, "No answer before ring deadline");
        }
        self.finish(EndReason::Missed, Some(SignalPayload::Missed))
            .await;
    }

    // ========== Helpers ==========

    fn begin(&mut self, session: CallSession, deadline: Option<Instant>) {
        self.generation += 1;
        let engine = SessionEngine::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.ice),
            ContextEventSink::new(self.generation, self.engine_tx.clone()),
        );
        let ad_hoc = !self.config.contacts.contains(&session.remote_user_id);
        if ad_hoc {
            self.outbox.join(session.remote_user_id.clone());
        }
        let cancel = CancellationToken::new();
        self.active_token.send_replace(Some(cancel.clone()));
        self.call = Some(ActiveCall {
            session,
            engine,
            cancel,
            deadline,
            pending_offer: None,
            offer_seen: false,
            accepted: false,
            ad_hoc,
        });
    }

    /// Queue a signal for the current call. Dropped if the call ends first.
    fn send(&self, payload: SignalPayload) {
        let Some(call) = &self.call else {
            return;
        };
        let message = SignalingMessage::new(
            call.session.call_id.clone(),
            self.config.local.clone(),
            call.session.remote_user_id.clone(),
            payload,
        );
        self.outbox.signal(message, Some(call.cancel.clone()));
    }

    fn publish(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        call.session.media = call.engine.state();
        call.session.muted = call.engine.is_muted();
        call.session.video_enabled =
            call.session.media_kind == MediaKind::Video && call.engine.is_video_enabled();
        let _ = self
            .events
            .send(ClientEvent::CallStateChanged(call.session.clone()));
    }

    fn remember(&mut self, call_id: CallId) {
        if self.recent.len() == RECENT_CALLS {
            self.recent.pop_front();
        }
        self.recent.push_back(call_id);
    }

    /// Tear down and leave the call. Teardown always runs first.
    async fn finish(&mut self, reason: EndReason, signal: Option<SignalPayload>) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        call.cancel.cancel();
        self.active_token.send_replace(None);
        call.engine.end_call().await;

        let remote = call.session.remote_user_id.clone();
        if let Some(payload) = signal {
            let message = SignalingMessage::new(
                call.session.call_id.clone(),
                self.config.local.clone(),
                remote.clone(),
                payload,
            );
            self.outbox.signal(message, None);
        }
        if call.ad_hoc {
            self.outbox.leave(remote);
        }

        let session = &mut call.session;
        session.state = CallState::Ended;
        session.ended_at = Some(Utc::now());
        session.end_reason = Some(reason);
        session.media = call.engine.state();
        info!(call_id = %session.call_id, %reason, "Call ended");

        self.remember(session.call_id.clone());
        let _ = self
            .events
            .send(ClientEvent::CallStateChanged(session.clone()));
        if let Some(history) = &self.history {
            if let Err(e) = history.record(CallRecord::from_session(session)).await {
                warn!(call_id = %session.call_id, error = %e, "Failed to record call history");
            }
        }
        self.last = Some(call.session);
    }
}
