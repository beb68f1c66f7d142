//! Relay hub: routes `send` frames between registered users

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::relay::{RelayPayload, ServerFrame};
use crate::signal::UserId;

/// Outbound queue depth per connection
pub const CONNECTION_BUFFER: usize = 64;

/// Statistics about hub state (returned as a snapshot from atomic counters)
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub users_connected: usize,
    pub frames_forwarded: u64,
    pub frames_rejected: u64,
}

/// Internal atomic counters for lock-free stats tracking
struct AtomicHubStats {
    users_connected: AtomicUsize,
    frames_forwarded: AtomicU64,
    frames_rejected: AtomicU64,
}

impl AtomicHubStats {
    fn new() -> Self {
        Self {
            users_connected: AtomicUsize::new(0),
            frames_forwarded: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> HubStats {
        HubStats {
            users_connected: self.users_connected.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
        }
    }
}

/// A registered connection, with a generation counter for race-condition protection
struct Registration {
    generation: u64,
    tx: mpsc::Sender<ServerFrame>,
    connected_at: Instant,
}

/// Detail about a registered user (public API)
#[derive(Debug, Clone)]
pub struct UserDetail {
    pub user_id: UserId,
    pub connected_at: Instant,
}

struct HubInner {
    users: RwLock<HashMap<UserId, Registration>>,
    stats: AtomicHubStats,
    /// Monotonically increasing generation counter for registrations
    connection_generation: AtomicU64,
}

/// Routing table of online users. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                users: RwLock::new(HashMap::new()),
                stats: AtomicHubStats::new(),
                connection_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn stats(&self) -> HubStats {
        self.inner.stats.snapshot()
    }

    pub async fn users(&self) -> Vec<UserDetail> {
        self.inner
            .users
            .read()
            .await
            .iter()
            .map(|(user_id, r)| UserDetail {
                user_id: user_id.clone(),
                connected_at: r.connected_at,
            })
            .collect()
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.inner.users.read().await.contains_key(user)
    }

    /// Register `user` with the queue feeding its connection.
    ///
    /// A newer registration replaces an older one; the replaced
    /// connection sees its queue close. Returns a generation counter that
    /// must be passed to `unregister` so a stale connection handler never
    /// removes a newer registration.
    pub async fn register(&self, user: UserId, tx: mpsc::Sender<ServerFrame>) -> u64 {
        let gen = self
            .inner
            .connection_generation
            .fetch_add(1, Ordering::Relaxed);
        let old = self.inner.users.write().await.insert(
            user.clone(),
            Registration {
                generation: gen,
                tx,
                connected_at: Instant::now(),
            },
        );

        if old.is_none() {
            self.inner
                .stats
                .users_connected
                .fetch_add(1, Ordering::Relaxed);
            info!(user = %user, gen, "User registered");
            self.broadcast_presence(&user, true).await;
        } else {
            info!(user = %user, gen, "User re-registered, replacing previous connection");
        }
        gen
    }

    /// Remove `user` only if its registration still has generation `gen`
    pub async fn unregister(&self, user: &UserId, gen: u64) {
        let removed = {
            let mut users = self.inner.users.write().await;
            match users.get(user) {
                Some(r) if r.generation == gen => users.remove(user).is_some(),
                Some(r) => {
                    debug!(
                        user = %user,
                        our_gen = gen,
                        current_gen = r.generation,
                        "Skipping unregister: generation mismatch"
                    );
                    false
                }
                None => false,
            }
        };

        if removed {
            self.inner
                .stats
                .users_connected
                .fetch_sub(1, Ordering::Relaxed);
            info!(user = %user, "User unregistered");
            self.broadcast_presence(user, false).await;
        }
    }

    /// Hand `payload` from `from` to `to`'s connection.
    ///
    /// Returns the `ack`/`nack` frame for the sender. Signals whose
    /// envelope names a different sender or recipient than the frame are
    /// refused.
    pub async fn forward(
        &self,
        from: &UserId,
        id: u64,
        to: &UserId,
        payload: RelayPayload,
    ) -> ServerFrame {
        if let RelayPayload::Signal { message } = &payload {
            if &message.caller_id != from || &message.receiver_id != to {
                return self.reject(id, from, "sender mismatch");
            }
        }

        let tx = match self.inner.users.read().await.get(to) {
            Some(r) => r.tx.clone(),
            None => return self.reject(id, from, "recipient offline"),
        };

        let kind = payload.kind();
        let frame = ServerFrame::Deliver {
            from: from.clone(),
            payload,
        };
        match tx.try_send(frame) {
            Ok(()) => {
                self.inner
                    .stats
                    .frames_forwarded
                    .fetch_add(1, Ordering::Relaxed);
                debug!(from = %from, to = %to, kind, "Forwarded");
                ServerFrame::Ack { id }
            }
            Err(mpsc::error::TrySendError::Full(_)) => self.reject(id, from, "recipient busy"),
            Err(mpsc::error::TrySendError::Closed(_)) => self.reject(id, from, "recipient offline"),
        }
    }

    fn reject(&self, id: u64, from: &UserId, reason: &str) -> ServerFrame {
        self.inner
            .stats
            .frames_rejected
            .fetch_add(1, Ordering::Relaxed);
        debug!(from = %from, id, reason, "Rejected send");
        ServerFrame::Nack {
            id,
            reason: reason.to_string(),
        }
    }

    async fn broadcast_presence(&self, user: &UserId, online: bool) {
        let users = self.inner.users.read().await;
        for (other, r) in users.iter() {
            if other == user {
                continue;
            }
            let _ = r.tx.try_send(ServerFrame::Presence {
                user_id: user.clone(),
                online,
            });
        }
    }
}
