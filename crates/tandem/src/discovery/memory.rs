//! In-process swarm
//!
//! Every [`MemorySwarm`] node created from the same [`MemorySwarmHub`]
//! shares one topic table. Joining a topic announces the node to existing
//! members and vice versa; broadcasts reach every other member once.
//! Delivery is lossy under backpressure, like a real gossip overlay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{RendezvousId, Swarm, SwarmEvent, SwarmLink, SwarmMembership};

const EVENT_BUFFER: usize = 256;

struct Member {
    slot: u64,
    node: String,
    tx: mpsc::Sender<SwarmEvent>,
}

type Topics = Arc<Mutex<HashMap<RendezvousId, Vec<Member>>>>;

/// Shared topic table
#[derive(Clone, Default)]
pub struct MemorySwarmHub {
    topics: Topics,
    next_slot: Arc<AtomicU64>,
}

impl MemorySwarmHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A swarm node identified as `node` on this hub
    pub fn node(&self, node: impl Into<String>) -> MemorySwarm {
        MemorySwarm {
            hub: self.clone(),
            node: node.into(),
        }
    }

    /// Current member count of `topic`
    pub async fn members(&self, topic: &RendezvousId) -> usize {
        self.topics.lock().await.get(topic).map_or(0, Vec::len)
    }
}

/// One node on a [`MemorySwarmHub`]
#[derive(Clone)]
pub struct MemorySwarm {
    hub: MemorySwarmHub,
    node: String,
}

#[async_trait::async_trait]
impl Swarm for MemorySwarm {
    async fn join(&self, topic: RendezvousId) -> Result<SwarmMembership> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let slot = self.hub.next_slot.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.hub.topics.lock().await;
        let members = topics.entry(topic).or_default();
        for m in members.iter() {
            let _ = m.tx.try_send(SwarmEvent::PeerUp(self.node.clone()));
            let _ = tx.try_send(SwarmEvent::PeerUp(m.node.clone()));
        }
        members.push(Member {
            slot,
            node: self.node.clone(),
            tx,
        });
        debug!(node = %self.node, %topic, members = members.len(), "Memory swarm join");

        Ok(SwarmMembership {
            link: Box::new(MemoryLink {
                topics: Arc::clone(&self.hub.topics),
                topic,
                slot,
                node: self.node.clone(),
            }),
            events: rx,
        })
    }
}

struct MemoryLink {
    topics: Topics,
    topic: RendezvousId,
    slot: u64,
    node: String,
}

#[async_trait::async_trait]
impl SwarmLink for MemoryLink {
    async fn broadcast(&self, payload: Bytes) -> Result<()> {
        let topics = self.topics.lock().await;
        let Some(members) = topics.get(&self.topic) else {
            anyhow::bail!("not a member of {}", self.topic);
        };
        if !members.iter().any(|m| m.slot == self.slot) {
            anyhow::bail!("not a member of {}", self.topic);
        }
        for m in members.iter().filter(|m| m.slot != self.slot) {
            let event = SwarmEvent::Message {
                from: self.node.clone(),
                payload: payload.clone(),
            };
            if m.tx.try_send(event).is_err() {
                debug!(node = %m.node, "Memory swarm dropped a message");
            }
        }
        Ok(())
    }

    async fn leave(&self) {
        let mut topics = self.topics.lock().await;
        let Some(members) = topics.get_mut(&self.topic) else {
            return;
        };
        let before = members.len();
        members.retain(|m| m.slot != self.slot);
        if members.len() == before {
            return;
        }
        for m in members.iter() {
            let _ = m.tx.try_send(SwarmEvent::PeerDown(self.node.clone()));
        }
        if members.is_empty() {
            topics.remove(&self.topic);
        }
    }
}
