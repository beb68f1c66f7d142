//! End-to-end call setup between two clients.
//!
//! Each test runs a real relay server on 127.0.0.1:0, an in-process swarm
//! for the discovery channel and the loopback media backend. A client that
//! should be degraded points at a closed port and gets a failing probe.
//! The loopback peer notices a closed session after half a second, like a
//! real transport timing out.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tandem::call::CallSession;
use tandem::discovery::MemorySwarmHub;
use tandem::mode::{Probe, ProbeConfig};
use tandem::relay::RelayEvent;
use tandem::server::{Hub, ServerConfig};
use tandem::session::{LoopbackBackend, LoopbackNetwork, LoopbackOptions, SessionState};
use tandem::{
    CallMode, CallState, ChannelKind, ClientDeps, ClientEvent, Config, EndReason, MediaKind,
    Mode, TandemClient, UserId,
};

/// Nothing listens here
const UNREACHABLE: &str = "127.0.0.1:9";

struct FixedProbe(bool);

#[async_trait::async_trait]
impl Probe for FixedProbe {
    async fn probe(&self) -> anyhow::Result<()> {
        if self.0 {
            Ok(())
        } else {
            anyhow::bail!("server unreachable")
        }
    }
}

struct Relay {
    addr: String,
    hub: Hub,
    cancel: CancellationToken,
}

impl Relay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bind = listener.local_addr().unwrap();
        let hub = Hub::new();
        let cancel = CancellationToken::new();
        let config = ServerConfig {
            bind,
            auth_token: None,
            turn: None,
        };
        tokio::spawn(tandem::server::serve(
            listener,
            hub.clone(),
            config,
            cancel.clone(),
        ));
        Self {
            addr: bind.to_string(),
            hub,
            cancel,
        }
    }
}

struct Env {
    swarm: MemorySwarmHub,
    network: LoopbackNetwork,
}

impl Env {
    fn new() -> Self {
        Self {
            swarm: MemorySwarmHub::new(),
            network: LoopbackNetwork::new(),
        }
    }

    fn config(&self, user: &str, server: &str, contact: &str) -> Config {
        let mut config = Config::new(user, server);
        config.token = Some(format!("{user}-token"));
        config.ice_url = None;
        config.contacts = vec![UserId::from(contact)];
        config.probe = ProbeConfig {
            interval: Duration::from_millis(200),
            timeout: Duration::from_millis(100),
            retries: 2,
            backoff_base: Duration::from_millis(10),
        };
        config.reconnect.floor = Duration::from_millis(100);
        config.reconnect.cap = Duration::from_millis(200);
        config.ack_timeout = Duration::from_secs(1);
        config
    }

    async fn client(&self, config: Config, reachable: bool) -> TandemClient {
        let user = config.user_id.to_string();
        let deps = ClientDeps {
            backend: Arc::new(LoopbackBackend::with_options(
                self.network.clone(),
                LoopbackOptions {
                    disconnect_delay: Duration::from_millis(500),
                    ..Default::default()
                },
            )),
            swarm: Arc::new(self.swarm.node(user)),
            probe: Some(Arc::new(FixedProbe(reachable))),
            history: None,
        };
        TandemClient::start(config, deps).await.unwrap()
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<ClientEvent>,
    pred: impl Fn(&CallSession) -> bool,
) -> CallSession {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::CallStateChanged(s)) if pred(&s) => return s,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("expected call state not reached")
}

async fn wait_relay_up(client: &TandemClient) {
    let mut state = client.relay().watch_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.available))
        .await
        .expect("relay never came up")
        .unwrap();
}

async fn wait_degraded(client: &TandemClient) {
    let mut mode = client.watch_mode();
    tokio::time::timeout(Duration::from_secs(5), mode.wait_for(|m| m.mode == Mode::Degraded))
        .await
        .expect("mode never degraded")
        .unwrap();
}

async fn wait_linked(client: &TandemClient, remote: &str) {
    let remote = UserId::from(remote);
    let mut peers = client.discovery().watch_peers();
    tokio::time::timeout(
        Duration::from_secs(5),
        peers.wait_for(|p| p.get(&remote).copied().unwrap_or(0) > 0),
    )
    .await
    .expect("rendezvous link never came up")
    .unwrap();
}

fn connected(s: &CallSession) -> bool {
    s.state == CallState::Active && s.media == SessionState::Connected && s.call_mode().is_some()
}

#[tokio::test]
async fn both_connected_call_is_normal() {
    let relay = Relay::start().await;
    let env = Env::new();
    let alice = env
        .client(env.config("alice", &relay.addr, "bob"), true)
        .await;
    let bob = env.client(env.config("bob", &relay.addr, "alice"), true).await;
    let mut alice_events = alice.events();
    let mut bob_events = bob.events();
    wait_relay_up(&alice).await;
    wait_relay_up(&bob).await;

    let call_id = alice
        .calls()
        .start_outgoing_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    let ringing = wait_for(&mut bob_events, |s| s.state == CallState::Ringing).await;
    assert_eq!(ringing.call_id, call_id);
    assert_eq!(ringing.remote_user_id, UserId::from("alice"));

    bob.calls().accept_incoming_call().await.unwrap();
    let a = wait_for(&mut alice_events, connected).await;
    assert_eq!(a.call_mode(), Some(CallMode::Normal));
    assert_eq!(a.local_channel_used, Some(ChannelKind::Relayed));
    let b = wait_for(&mut bob_events, connected).await;
    assert_eq!(b.call_mode(), Some(CallMode::Normal));

    alice.calls().end_call().await.unwrap();
    let ended = wait_for(&mut bob_events, |s| s.state == CallState::Ended).await;
    assert!(matches!(
        ended.end_reason,
        Some(EndReason::Normal) | Some(EndReason::Disconnected)
    ));
    assert!(relay.hub.stats().frames_forwarded >= 4);

    alice.shutdown().await;
    bob.shutdown().await;
    relay.cancel.cancel();
}

#[tokio::test]
async fn shutdown_hangs_up_the_peer() {
    let relay = Relay::start().await;
    let env = Env::new();
    let alice = env
        .client(env.config("alice", &relay.addr, "bob"), true)
        .await;
    let bob = env.client(env.config("bob", &relay.addr, "alice"), true).await;
    let mut bob_events = bob.events();
    wait_relay_up(&alice).await;
    wait_relay_up(&bob).await;

    alice
        .calls()
        .start_outgoing_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    wait_for(&mut bob_events, |s| s.state == CallState::Ringing).await;
    bob.calls().accept_incoming_call().await.unwrap();
    wait_for(&mut bob_events, connected).await;

    alice.shutdown().await;
    let ended = wait_for(&mut bob_events, |s| s.state == CallState::Ended).await;
    assert_eq!(ended.end_reason, Some(EndReason::Normal));

    bob.shutdown().await;
    relay.cancel.cancel();
}

#[tokio::test]
async fn unanswered_call_is_missed_on_both_sides() {
    let relay = Relay::start().await;
    let env = Env::new();
    let mut alice_config = env.config("alice", &relay.addr, "bob");
    alice_config.ring_timeout = Duration::from_secs(1);
    let mut bob_config = env.config("bob", &relay.addr, "alice");
    bob_config.ring_timeout = Duration::from_secs(1);
    bob_config.ring_grace = Duration::from_secs(5);
    let alice = env.client(alice_config, true).await;
    let bob = env.client(bob_config, true).await;
    let mut alice_events = alice.events();
    let mut bob_events = bob.events();
    wait_relay_up(&alice).await;
    wait_relay_up(&bob).await;

    let started = Instant::now();
    alice
        .calls()
        .start_outgoing_call("bob", MediaKind::Video)
        .await
        .unwrap();
    wait_for(&mut bob_events, |s| s.state == CallState::Ringing).await;

    let a = wait_for(&mut alice_events, |s| s.state == CallState::Ended).await;
    assert_eq!(a.end_reason, Some(EndReason::Missed));
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(a.answered_at, None);

    // Arrives as a signal, well before bob's own expiry
    let b = wait_for(&mut bob_events, |s| s.state == CallState::Ended).await;
    assert_eq!(b.end_reason, Some(EndReason::Missed));
    assert!(started.elapsed() < Duration::from_secs(5));

    alice.shutdown().await;
    bob.shutdown().await;
    relay.cancel.cancel();
}

#[tokio::test]
async fn both_degraded_call_is_emergency() {
    let relay = Relay::start().await;
    let env = Env::new();
    let alice = env.client(env.config("alice", UNREACHABLE, "bob"), false).await;
    let bob = env.client(env.config("bob", UNREACHABLE, "alice"), false).await;
    let mut alice_events = alice.events();
    let mut bob_events = bob.events();
    wait_degraded(&alice).await;
    wait_degraded(&bob).await;
    wait_linked(&alice, "bob").await;
    wait_linked(&bob, "alice").await;

    alice
        .calls()
        .start_outgoing_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    wait_for(&mut bob_events, |s| s.state == CallState::Ringing).await;
    bob.calls().accept_incoming_call().await.unwrap();

    let a = wait_for(&mut alice_events, connected).await;
    assert_eq!(a.call_mode(), Some(CallMode::Emergency));
    assert_eq!(a.local_channel_used, Some(ChannelKind::Discovery));
    let b = wait_for(&mut bob_events, connected).await;
    assert_eq!(b.call_mode(), Some(CallMode::Emergency));

    // No call-end on this channel: bob learns from the media teardown
    alice.calls().end_call().await.unwrap();
    let ended = wait_for(&mut bob_events, |s| s.state == CallState::Ended).await;
    assert_eq!(ended.end_reason, Some(EndReason::Disconnected));

    assert_eq!(relay.hub.stats().frames_forwarded, 0);
    alice.shutdown().await;
    bob.shutdown().await;
    relay.cancel.cancel();
}

#[tokio::test]
async fn mixed_modes_fall_back_and_call_is_asymmetric() {
    let relay = Relay::start().await;
    let env = Env::new();
    let alice = env
        .client(env.config("alice", &relay.addr, "bob"), true)
        .await;
    let bob = env.client(env.config("bob", UNREACHABLE, "alice"), false).await;
    let mut alice_events = alice.events();
    let mut bob_events = bob.events();
    wait_relay_up(&alice).await;
    wait_degraded(&bob).await;
    wait_linked(&alice, "bob").await;
    wait_linked(&bob, "alice").await;

    alice
        .calls()
        .start_outgoing_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    let ringing = wait_for(&mut bob_events, |s| s.state == CallState::Ringing).await;
    assert_eq!(ringing.remote_channel_used, Some(ChannelKind::Discovery));
    assert!(relay.hub.stats().frames_rejected >= 1);

    bob.calls().accept_incoming_call().await.unwrap();
    let a = wait_for(&mut alice_events, connected).await;
    assert_eq!(a.local_channel_used, Some(ChannelKind::Relayed));
    assert_eq!(a.remote_channel_used, Some(ChannelKind::Discovery));
    assert_eq!(a.call_mode(), Some(CallMode::Asymmetric));
    let b = wait_for(&mut bob_events, connected).await;
    assert_eq!(b.call_mode(), Some(CallMode::Emergency));

    bob.calls().end_call().await.unwrap();
    let ended = wait_for(&mut alice_events, |s| s.state == CallState::Ended).await;
    assert_eq!(ended.end_reason, Some(EndReason::Disconnected));

    alice.shutdown().await;
    bob.shutdown().await;
    relay.cancel.cancel();
}

#[tokio::test]
async fn chat_and_presence_travel_over_relay() {
    let relay = Relay::start().await;
    let env = Env::new();
    let alice = env
        .client(env.config("alice", &relay.addr, "bob"), true)
        .await;
    let mut alice_inbound = alice.relay().subscribe();
    wait_relay_up(&alice).await;

    let bob = env.client(env.config("bob", &relay.addr, "alice"), true).await;
    let mut bob_inbound = bob.relay().subscribe();
    wait_relay_up(&bob).await;

    let presence = tokio::time::timeout(Duration::from_secs(5), alice_inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        presence,
        RelayEvent::Presence {
            user_id: "bob".into(),
            online: true
        }
    );

    alice
        .send_chat(&UserId::from("bob"), "chat-1", "hello")
        .await
        .unwrap();
    let chat = tokio::time::timeout(Duration::from_secs(5), bob_inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        chat,
        RelayEvent::Chat {
            from: "alice".into(),
            chat_id: "chat-1".to_string(),
            body: "hello".to_string(),
        }
    );

    alice.shutdown().await;
    bob.shutdown().await;
    relay.cancel.cancel();
}
