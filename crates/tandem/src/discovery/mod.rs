//! Peer-discovery channel: serverless signaling over a rendezvous swarm
//!
//! Both endpoints derive the same [`RendezvousId`] from their sorted user
//! ids and join the swarm topic it names. Signaling envelopes are broadcast
//! to every peer link on the topic, wrapped in an extension frame:
//!
//! ```text
//! { "ext": "signaling", "payload": { "type": "offer", ... } }
//! ```
//!
//! Sends are fire-and-forget. There is no acknowledgement and no retry.
//! `call-end` is refused: on this channel a hangup is expressed by tearing
//! down the media session.

pub mod memory;

#[cfg(feature = "iroh")]
pub mod gossip;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::signal::{SignalPayload, SignalingMessage, UserId};

pub use memory::{MemorySwarm, MemorySwarmHub};

/// Extension tag for signaling frames
pub const SIGNALING_EXT: &str = "signaling";

// ========== Rendezvous ==========

/// Shared swarm topic for a pair of users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RendezvousId([u8; 32]);

impl RendezvousId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for RendezvousId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// `SHA-256(lo ":" hi)` over the two ids in sorted order
pub fn rendezvous_id(a: &UserId, b: &UserId) -> RendezvousId {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(lo.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(hi.as_str().as_bytes());
    RendezvousId(hasher.finalize().into())
}

// ========== Swarm abstraction ==========

/// Something that happened on a joined topic
#[derive(Debug, Clone, PartialEq)]
pub enum SwarmEvent {
    PeerUp(String),
    PeerDown(String),
    Message { from: String, payload: Bytes },
}

/// Sending half of a topic membership
#[async_trait::async_trait]
pub trait SwarmLink: Send + Sync {
    /// Deliver `payload` once to every current peer link
    async fn broadcast(&self, payload: Bytes) -> Result<()>;

    /// Leave the topic. Must be idempotent.
    async fn leave(&self);
}

/// A joined topic: the link to send on and the event stream to read
pub struct SwarmMembership {
    pub link: Box<dyn SwarmLink>,
    pub events: mpsc::Receiver<SwarmEvent>,
}

/// Announce-based discovery network
#[async_trait::async_trait]
pub trait Swarm: Send + Sync {
    async fn join(&self, topic: RendezvousId) -> Result<SwarmMembership>;
}

// ========== Channel ==========

#[derive(Debug, Serialize, Deserialize)]
struct ExtFrame {
    ext: String,
    payload: serde_json::Value,
}

struct Membership {
    topic: RendezvousId,
    link: Arc<dyn SwarmLink>,
    pump: JoinHandle<()>,
}

struct DiscoveryInner {
    local: UserId,
    swarm: Arc<dyn Swarm>,
    inbound: mpsc::Sender<SignalingMessage>,
    memberships: Mutex<HashMap<UserId, Membership>>,
    /// Live peer count per joined remote
    peers: watch::Sender<HashMap<UserId, usize>>,
}

/// Serverless signaling channel. One membership per remote peer.
#[derive(Clone)]
pub struct DiscoveryChannel {
    inner: Arc<DiscoveryInner>,
}

impl DiscoveryChannel {
    /// Parsed inbound envelopes addressed to `local` are pushed to `inbound`
    pub fn new(local: UserId, swarm: Arc<dyn Swarm>, inbound: mpsc::Sender<SignalingMessage>) -> Self {
        let (peers, _) = watch::channel(HashMap::new());
        Self {
            inner: Arc::new(DiscoveryInner {
                local,
                swarm,
                inbound,
                memberships: Mutex::new(HashMap::new()),
                peers,
            }),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.inner.local
    }

    /// Join the rendezvous swarm shared with `remote`. Idempotent.
    pub async fn join(&self, remote: &UserId) -> Result<()> {
        if remote == &self.inner.local {
            anyhow::bail!("cannot join a rendezvous with ourselves");
        }

        let mut memberships = self.inner.memberships.lock().await;
        if memberships.contains_key(remote) {
            debug!(peer = %remote, "Already joined rendezvous");
            return Ok(());
        }

        let (local, other) = (self.inner.local.clone(), remote.clone());
        let topic = tokio::task::spawn_blocking(move || rendezvous_id(&local, &other)).await?;

        let SwarmMembership { link, events } = self.inner.swarm.join(topic).await?;
        let link: Arc<dyn SwarmLink> = Arc::from(link);
        self.inner.peers.send_modify(|p| {
            p.insert(remote.clone(), 0);
        });

        let pump = tokio::spawn(pump_events(
            Arc::clone(&self.inner),
            remote.clone(),
            events,
        ));
        memberships.insert(
            remote.clone(),
            Membership {
                topic,
                link,
                pump,
            },
        );
        info!(peer = %remote, %topic, "Joined rendezvous swarm");
        Ok(())
    }

    pub async fn is_joined(&self, remote: &UserId) -> bool {
        self.inner.memberships.lock().await.contains_key(remote)
    }

    /// Fan `message` out to every peer link on the rendezvous with its
    /// receiver. Resolves as soon as the broadcast is handed off.
    pub async fn send(&self, message: &SignalingMessage) -> Result<(), ChannelError> {
        if matches!(message.payload, SignalPayload::CallEnd) {
            return Err(ChannelError::Unrepresentable("call-end"));
        }
        let to = &message.receiver_id;

        let link = {
            let memberships = self.inner.memberships.lock().await;
            match memberships.get(to) {
                Some(m) => Arc::clone(&m.link),
                None => return Err(ChannelError::Unavailable),
            }
        };
        if self.peer_count_for(to) == 0 {
            return Err(ChannelError::Unavailable);
        }

        let frame = encode_frame(message).map_err(|e| ChannelError::Encode(e.to_string()))?;
        link.broadcast(frame).await.map_err(|e| {
            warn!(peer = %to, error = %e, "Swarm broadcast failed");
            ChannelError::Unavailable
        })?;
        debug!(peer = %to, kind = message.payload.kind(), call_id = %message.call_id, "Signal broadcast on swarm");
        Ok(())
    }

    /// Leave the rendezvous with `remote`. Safe when never joined.
    pub async fn leave_peer(&self, remote: &UserId) {
        let membership = self.inner.memberships.lock().await.remove(remote);
        if let Some(m) = membership {
            m.pump.abort();
            m.link.leave().await;
            self.inner.peers.send_modify(|p| {
                p.remove(remote);
            });
            info!(peer = %remote, topic = %m.topic, "Left rendezvous swarm");
        }
    }

    /// Leave every rendezvous. Idempotent.
    pub async fn leave(&self) {
        let drained: Vec<(UserId, Membership)> =
            self.inner.memberships.lock().await.drain().collect();
        for (remote, m) in drained {
            m.pump.abort();
            m.link.leave().await;
            debug!(peer = %remote, "Left rendezvous swarm");
        }
        self.inner.peers.send_modify(|p| p.clear());
    }

    /// Peer links across all joined swarms
    pub fn peer_count(&self) -> usize {
        self.inner.peers.borrow().values().sum()
    }

    pub fn peer_count_for(&self, remote: &UserId) -> usize {
        self.inner.peers.borrow().get(remote).copied().unwrap_or(0)
    }

    /// At least one peer link exists
    pub fn is_connected(&self) -> bool {
        self.peer_count() > 0
    }

    /// Peer counts per remote, updated as links come and go
    pub fn watch_peers(&self) -> watch::Receiver<HashMap<UserId, usize>> {
        self.inner.peers.subscribe()
    }
}

fn encode_frame(message: &SignalingMessage) -> serde_json::Result<Bytes> {
    let frame = ExtFrame {
        ext: SIGNALING_EXT.to_string(),
        payload: serde_json::to_value(message)?,
    };
    Ok(Bytes::from(serde_json::to_vec(&frame)?))
}

/// Parse an extension frame. `Ok(None)` for frames of another extension.
fn decode_frame(raw: &[u8]) -> serde_json::Result<Option<SignalingMessage>> {
    let frame: ExtFrame = serde_json::from_slice(raw)?;
    if frame.ext != SIGNALING_EXT {
        return Ok(None);
    }
    serde_json::from_value(frame.payload).map(Some)
}

async fn pump_events(
    inner: Arc<DiscoveryInner>,
    remote: UserId,
    mut events: mpsc::Receiver<SwarmEvent>,
) {
    let mut peers: HashSet<String> = HashSet::new();
    while let Some(event) = events.recv().await {
        match event {
            SwarmEvent::PeerUp(id) => {
                if peers.insert(id.clone()) {
                    debug!(peer = %remote, link = %id, "Swarm peer up");
                }
            }
            SwarmEvent::PeerDown(id) => {
                if peers.remove(&id) {
                    debug!(peer = %remote, link = %id, "Swarm peer down");
                }
            }
            SwarmEvent::Message { from, payload } => {
                let message = match decode_frame(&payload) {
                    Ok(Some(m)) => m,
                    Ok(None) => {
                        debug!(link = %from, "Ignoring non-signaling extension frame");
                        continue;
                    }
                    Err(e) => {
                        warn!(link = %from, error = %e, "Dropping malformed swarm frame");
                        continue;
                    }
                };
                if message.receiver_id != inner.local || message.caller_id != remote {
                    warn!(
                        from = %message.caller_id,
                        to = %message.receiver_id,
                        rendezvous = %remote,
                        "Dropping mis-addressed swarm frame"
                    );
                    continue;
                }
                if inner.inbound.send(message).await.is_err() {
                    break;
                }
                continue;
            }
        }
        let count = peers.len();
        inner.peers.send_if_modified(|p| match p.get_mut(&remote) {
            Some(c) if *c != count => {
                *c = count;
                true
            }
            _ => false,
        });
    }
    debug!(peer = %remote, "Swarm event stream ended");
}
