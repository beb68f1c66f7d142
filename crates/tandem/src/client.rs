//! Client assembly
//!
//! [`TandemClient::start`] builds every component for one signed-in user and
//! wires them together:
//!
//! ```text
//! ModeDetector ──watch──▶ relay supervisor ──▶ RelayChannel ──┐
//!      │                                                      ├─▶ signals ──▶ controller
//!      └──watch──▶ ChannelSelector ◀── outbox   DiscoveryChannel ─┘
//! ```
//!
//! All tasks are owned by a cancellation token and a task tracker and stop
//! on [`TandemClient::shutdown`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::call::{
    spawn_controller, CallHandle, CallHistory, ClientEvent, ControllerConfig, ControllerDeps,
    JsonlHistory, Outbox,
};
use crate::config::Config;
use crate::discovery::{DiscoveryChannel, Swarm};
use crate::error::ChannelError;
use crate::mode::{AppMode, HttpProbe, ModeDetector, ModeStore, Probe};
use crate::relay::{self, Credential, RelayChannel, RelayEvent};
use crate::selector::ChannelSelector;
use crate::session::ice::HttpCredentialSource;
use crate::session::{IceServerProvider, MediaBackend};
use crate::signal::{SignalingMessage, UserId};

/// How long shutdown waits for background tasks
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pluggable collaborators
pub struct ClientDeps {
    pub backend: Arc<dyn MediaBackend>,
    pub swarm: Arc<dyn Swarm>,
    /// Defaults to `GET config.probe_url`
    pub probe: Option<Arc<dyn Probe>>,
    /// Defaults to a JSON-lines file at `config.history_path`, if set
    pub history: Option<Arc<dyn CallHistory>>,
}

/// One running client
pub struct TandemClient {
    config: Config,
    detector: Arc<ModeDetector>,
    relay: RelayChannel,
    discovery: DiscoveryChannel,
    calls: CallHandle,
    outbox: Outbox,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TandemClient {
    pub async fn start(config: Config, deps: ClientDeps) -> Result<Self> {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (events, _) = broadcast::channel(256);

        // Mode
        let probe = deps
            .probe
            .unwrap_or_else(|| Arc::new(HttpProbe::new(config.probe_url.clone())));
        let mut detector = ModeDetector::new(probe, config.probe.clone());
        if let Some(path) = &config.mode_state_path {
            detector = detector.with_store(ModeStore::new(path.clone()));
        }
        let detector = Arc::new(detector);
        tracker.spawn(Arc::clone(&detector).spawn(cancel.child_token()));

        // Relayed channel
        let relay = RelayChannel::new(config.relay_url.clone(), config.reconnect.clone());
        let credential = config.token.clone().map(|token| Credential {
            user_id: config.user_id.clone(),
            token,
        });
        if credential.is_none() {
            info!(user = %config.user_id, "No relay credential, relayed channel stays closed");
        }
        tracker.spawn(relay::supervise(
            relay.clone(),
            detector.subscribe(),
            credential,
            config.probe.interval,
            cancel.child_token(),
        ));

        // Inbound signals from both channels share one queue
        let (signals_tx, signals_rx) = mpsc::channel::<SignalingMessage>(256);
        tracker.spawn(pump_relay_signals(
            relay.subscribe(),
            config.user_id.clone(),
            signals_tx.clone(),
            cancel.child_token(),
        ));
        let discovery = DiscoveryChannel::new(config.user_id.clone(), deps.swarm, signals_tx);

        for contact in &config.contacts {
            if let Err(e) = discovery.join(contact).await {
                warn!(peer = %contact, error = %e, "Failed to join contact rendezvous");
            }
        }

        // Outbound
        let selector = ChannelSelector::new(
            Arc::new(relay.clone()),
            Arc::new(discovery.clone()),
            detector.subscribe(),
            config.ack_timeout,
        );
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (outbox, outbox_task) = Outbox::spawn(
            selector,
            discovery.clone(),
            config.ack_timeout,
            reports_tx,
            cancel.child_token(),
        );
        tracker.spawn(outbox_task);

        // Negotiation
        let ice = match (&config.ice_url, &config.token) {
            (Some(url), Some(token)) => {
                let source = HttpCredentialSource::new(
                    url.clone(),
                    config.user_id.as_str(),
                    Some(token.clone()),
                    config.ice.fetch_timeout,
                )?;
                IceServerProvider::new(Some(Arc::new(source)), config.ice.clone())
            }
            _ => IceServerProvider::stun_only(config.ice.clone()),
        };
        let ice = Arc::new(ice);
        tracker.spawn(Arc::clone(&ice).refresh_loop(cancel.child_token()));

        let history = match deps.history {
            Some(history) => Some(history),
            None => config
                .history_path
                .as_ref()
                .map(|path| Arc::new(JsonlHistory::new(path.clone())) as Arc<dyn CallHistory>),
        };

        // Calls
        let (calls, controller_task) = spawn_controller(
            ControllerConfig {
                local: config.user_id.clone(),
                contacts: config.contacts.iter().cloned().collect::<HashSet<_>>(),
                ring_timeout: config.ring_timeout,
                ring_grace: config.ring_grace,
            },
            ControllerDeps {
                backend: deps.backend,
                ice,
                outbox: outbox.clone(),
                reports: reports_rx,
                signals: signals_rx,
                events: events.clone(),
                history,
            },
            cancel.child_token(),
        );
        tracker.spawn(controller_task);

        tracker.spawn(forward_mode(
            detector.subscribe(),
            events.clone(),
            cancel.child_token(),
        ));

        info!(
            user = %config.user_id,
            relay = %config.relay_url,
            contacts = config.contacts.len(),
            "Client started"
        );

        Ok(Self {
            config,
            detector,
            relay,
            discovery,
            calls,
            outbox,
            events,
            cancel,
            tracker,
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.config.user_id
    }

    /// Call controls
    pub fn calls(&self) -> &CallHandle {
        &self.calls
    }

    /// Call state and mode changes
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn mode(&self) -> AppMode {
        self.detector.current_mode()
    }

    pub fn watch_mode(&self) -> watch::Receiver<AppMode> {
        self.detector.subscribe()
    }

    /// Chat, typing and presence events arrive on [`RelayChannel::subscribe`]
    pub fn relay(&self) -> &RelayChannel {
        &self.relay
    }

    pub fn discovery(&self) -> &DiscoveryChannel {
        &self.discovery
    }

    /// Chat goes over the relayed channel only
    pub async fn send_chat(
        &self,
        to: &UserId,
        chat_id: &str,
        body: &str,
    ) -> Result<(), ChannelError> {
        self.relay
            .send_chat(to, chat_id, body, self.config.ack_timeout)
            .await
    }

    /// Hang up any call, leave every swarm and stop all tasks.
    ///
    /// The hangup signal is given one send attempt plus its fallback before
    /// the channels close.
    pub async fn shutdown(self) {
        if let Err(e) = self.calls.end_call().await {
            debug!(error = %e, "No call to end on shutdown");
        }
        let flush_timeout = self.config.ack_timeout * 2;
        match tokio::time::timeout(flush_timeout, self.outbox.flush()).await {
            Ok(true) => debug!("Outbox drained"),
            Ok(false) => debug!("Outbox already stopped"),
            Err(_) => warn!("Outbox not drained after {:?}", flush_timeout),
        }
        self.discovery.leave().await;
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
        }
        self.relay.disconnect().await;
        info!(user = %self.config.user_id, "Client stopped");
    }
}

/// Move relayed signals into the controller queue. The envelope must name
/// the relay-attested sender and us as the receiver.
async fn pump_relay_signals(
    mut events: broadcast::Receiver<RelayEvent>,
    local: UserId,
    signals: mpsc::Sender<SignalingMessage>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(RelayEvent::Signal { from, message }) => {
                if message.caller_id != from || message.receiver_id != local {
                    warn!(
                        from = %from,
                        caller = %message.caller_id,
                        receiver = %message.receiver_id,
                        "Dropping relayed signal with mismatched identities"
                    );
                    continue;
                }
                if signals.send(message).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Relay signal pump lagged, missed {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Relay signal pump stopped");
}

/// Republish mode transitions as client events
async fn forward_mode(
    mut mode: watch::Receiver<AppMode>,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
) {
    mode.mark_unchanged();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = mode.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *mode.borrow_and_update();
                let _ = events.send(ClientEvent::ModeChanged(current));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::Mode;
    use crate::signal::{CallId, SignalPayload};

    fn relayed(from: &str, caller: &str, receiver: &str) -> RelayEvent {
        RelayEvent::Signal {
            from: from.into(),
            message: SignalingMessage::new(
                CallId::from("c1"),
                caller.into(),
                receiver.into(),
                SignalPayload::Accept,
            ),
        }
    }

    #[tokio::test]
    async fn relay_pump_checks_identities() {
        let (events_tx, events_rx) = broadcast::channel(8);
        let (signals_tx, mut signals_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_relay_signals(
            events_rx,
            "bob".into(),
            signals_tx,
            cancel.clone(),
        ));

        events_tx.send(relayed("mallory", "alice", "bob")).unwrap();
        events_tx.send(relayed("alice", "alice", "carol")).unwrap();
        events_tx.send(relayed("alice", "alice", "bob")).unwrap();

        let msg = signals_rx.recv().await.unwrap();
        assert_eq!(msg.caller_id, UserId::from("alice"));
        assert!(signals_rx.try_recv().is_err());

        cancel.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn mode_transitions_become_events() {
        let (mode_tx, mode_rx) = watch::channel(AppMode::new(Mode::Connected));
        let (events, mut rx) = broadcast::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward_mode(mode_rx, events, cancel.clone()));

        mode_tx.send_replace(AppMode::new(Mode::Degraded));
        match rx.recv().await.unwrap() {
            ClientEvent::ModeChanged(mode) => assert_eq!(mode.mode, Mode::Degraded),
            other => panic!("unexpected event: {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap();
    }
}
