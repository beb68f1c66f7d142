//! Iroh gossip swarm
//!
//! The rendezvous id is used verbatim as the gossip topic. Peers are found
//! through the configured bootstrap endpoints and iroh's own discovery.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use iroh::endpoint::{Endpoint, RelayMode};
use iroh::protocol::Router;
use iroh::{PublicKey, SecretKey};
use iroh_gossip::api::{Event, GossipSender};
use iroh_gossip::net::Gossip;
use iroh_gossip::proto::TopicId;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RendezvousId, Swarm, SwarmEvent, SwarmLink, SwarmMembership};

const EVENT_BUFFER: usize = 256;

/// Gossip-backed swarm bound to one iroh endpoint
pub struct GossipSwarm {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    bootstrap: Vec<PublicKey>,
}

impl GossipSwarm {
    /// Bind an endpoint and start the gossip protocol.
    ///
    /// The secret key is loaded from `key_path` when it exists, otherwise
    /// generated (and saved there if a path was given).
    pub async fn spawn(key_path: Option<&Path>, bootstrap: &[String]) -> Result<Self> {
        let secret_key = load_or_generate_key(key_path)?;
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .relay_mode(RelayMode::Default)
            .bind()
            .await?;

        let gossip = Gossip::builder().spawn(endpoint.clone());
        let router = Router::builder(endpoint.clone())
            .accept(iroh_gossip::ALPN, gossip.clone())
            .spawn();

        let bootstrap = bootstrap
            .iter()
            .map(|s| PublicKey::from_str(s).with_context(|| format!("invalid bootstrap peer {s}")))
            .collect::<Result<Vec<_>>>()?;

        info!(endpoint = %endpoint.id(), bootstrap = bootstrap.len(), "Gossip swarm started");
        Ok(Self {
            endpoint,
            gossip,
            router,
            bootstrap,
        })
    }

    /// This node's endpoint id, to hand out as a bootstrap peer
    pub fn endpoint_id(&self) -> PublicKey {
        self.endpoint.id()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.router.shutdown().await?;
        Ok(())
    }
}

fn load_or_generate_key(key_path: Option<&Path>) -> Result<SecretKey> {
    let key = match key_path {
        Some(path) if path.exists() => {
            let bytes = std::fs::read(path)?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid key file length, expected 32 bytes"))?;
            SecretKey::from_bytes(&bytes)
        }
        Some(path) => {
            let key = SecretKey::generate(&mut rand::rng());
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, key.to_bytes())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            }
            info!("Generated swarm key at {}", path.display());
            key
        }
        None => SecretKey::generate(&mut rand::rng()),
    };
    Ok(key)
}

#[async_trait::async_trait]
impl Swarm for GossipSwarm {
    async fn join(&self, topic: RendezvousId) -> Result<SwarmMembership> {
        let gossip_topic = self
            .gossip
            .subscribe(TopicId::from_bytes(*topic.as_bytes()), self.bootstrap.clone())
            .await?;
        let (sender, mut receiver) = gossip_topic.split();

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    event = receiver.next() => event,
                };
                let mapped = match event {
                    Some(Ok(Event::NeighborUp(id))) => SwarmEvent::PeerUp(id.to_string()),
                    Some(Ok(Event::NeighborDown(id))) => SwarmEvent::PeerDown(id.to_string()),
                    Some(Ok(Event::Received(msg))) => SwarmEvent::Message {
                        from: msg.delivered_from.to_string(),
                        payload: msg.content,
                    },
                    Some(Ok(Event::Lagged)) => {
                        warn!(%topic, "Gossip receiver lagged");
                        continue;
                    }
                    Some(Err(e)) => {
                        warn!(%topic, error = %e, "Gossip topic error");
                        break;
                    }
                    None => break,
                };
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
            debug!(%topic, "Gossip topic pump stopped");
        });

        Ok(SwarmMembership {
            link: Box::new(GossipLink {
                sender: Mutex::new(Some(sender)),
                cancel,
            }),
            events: rx,
        })
    }
}

struct GossipLink {
    /// Taken on leave. The topic stays subscribed while a sender or
    /// receiver is alive.
    sender: Mutex<Option<GossipSender>>,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl SwarmLink for GossipLink {
    async fn broadcast(&self, payload: Bytes) -> Result<()> {
        let sender = self.sender.lock().await;
        match sender.as_ref() {
            Some(sender) if !self.cancel.is_cancelled() => {
                sender.broadcast(payload).await?;
                Ok(())
            }
            _ => anyhow::bail!("topic already left"),
        }
    }

    async fn leave(&self) {
        self.cancel.cancel();
        self.sender.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::discovery::rendezvous_id;
    use crate::signal::UserId;

    #[tokio::test]
    async fn leave_releases_the_topic() {
        let swarm = GossipSwarm::spawn(None, &[]).await.unwrap();
        let topic = rendezvous_id(&UserId::from("alice"), &UserId::from("bob"));
        let mut membership = swarm.join(topic).await.unwrap();

        membership.link.leave().await;

        let closed = tokio::time::timeout(Duration::from_secs(5), membership.events.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
        let err = membership
            .link
            .broadcast(Bytes::from_static(b"late"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already left"));

        swarm.shutdown().await.unwrap();
    }
}
