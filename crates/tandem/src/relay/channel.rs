//! Reconnecting WebSocket client for the relay
//!
//! A [`RelayChannel`] owns at most one session task. The task connects,
//! registers the local identity, and then multiplexes outbound frames with
//! inbound deliveries. Sends are request/ack: each gets an id, and the
//! caller waits (bounded) on a oneshot resolved by the matching `ack`/`nack`.
//!
//! When the connection drops the task reconnects with capped exponential
//! backoff. After the configured number of failed attempts it gives up and
//! the channel reports itself unavailable until `connect` is called again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{ClientFrame, RelayPayload, ServerFrame};
use crate::error::ChannelError;
use crate::signal::{SignalingMessage, UserId};

/// Capped exponential reconnect schedule
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Failed attempts before the channel gives up
    pub attempts: u32,
    pub floor: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            floor: Duration::from_secs(1),
            cap: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): 1s, 2s, 4s, 5s, 5s
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        (self.floor * (1u32 << exp)).min(self.cap)
    }
}

/// Identity and bearer credential used to open the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: UserId,
    pub token: String,
}

/// Availability as seen by the channel selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelState {
    pub available: bool,
    pub last_error: Option<String>,
}

/// Inbound events published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Signal {
        from: UserId,
        message: SignalingMessage,
    },
    Chat {
        from: UserId,
        chat_id: String,
        body: String,
    },
    Typing {
        from: UserId,
        chat_id: String,
        typing: bool,
    },
    Presence {
        user_id: UserId,
        online: bool,
    },
}

type AckResult = Result<(), ChannelError>;

struct Session {
    credential: Credential,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct RelayInner {
    url: String,
    policy: ReconnectPolicy,
    state: watch::Sender<ChannelState>,
    /// Present only while registered
    outbound: RwLock<Option<mpsc::Sender<ClientFrame>>>,
    pending: RwLock<HashMap<u64, oneshot::Sender<AckResult>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<RelayEvent>,
    session: tokio::sync::Mutex<Option<Session>>,
}

/// Handle to the relayed channel. Cheap to clone.
#[derive(Clone)]
pub struct RelayChannel {
    inner: Arc<RelayInner>,
}

impl RelayChannel {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ChannelState::default());
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RelayInner {
                url: url.into(),
                policy,
                state,
                outbound: RwLock::new(None),
                pending: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                events,
                session: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state.borrow().clone()
    }

    pub fn is_available(&self) -> bool {
        self.inner.state.borrow().available
    }

    /// Availability changes
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to inbound events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    /// Whether a session task is alive (connected or reconnecting)
    pub async fn is_running(&self) -> bool {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Start a session task for `credential`. No-op if one is already
    /// running for the same credential; a different credential replaces it.
    pub async fn connect(&self, credential: Credential) {
        let mut session = self.inner.session.lock().await;
        if let Some(s) = session.as_ref() {
            if !s.handle.is_finished() && s.credential == credential {
                return;
            }
        }
        if let Some(old) = session.take() {
            old.cancel.cancel();
            let _ = old.handle.await;
        }

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_session(inner, credential.clone(), cancel.clone()));
        *session = Some(Session {
            credential,
            cancel,
            handle,
        });
    }

    /// Stop the session task. Idempotent.
    pub async fn disconnect(&self) {
        let old = self.inner.session.lock().await.take();
        if let Some(old) = old {
            old.cancel.cancel();
            let _ = old.handle.await;
            info!("Relay channel disconnected");
        }
        self.inner.mark_down(None).await;
    }

    /// Send `payload` to `to` and wait up to `timeout` for the relay's ack.
    ///
    /// Never panics or blocks when disconnected: returns
    /// [`ChannelError::Unavailable`] so callers can fall back.
    pub async fn send(
        &self,
        to: &UserId,
        payload: RelayPayload,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let Some(tx) = self.inner.outbound.read().await.clone() else {
            debug!(to = %to, kind = payload.kind(), "Relay send while disconnected");
            return Err(ChannelError::Unavailable);
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner.pending.write().await.insert(id, ack_tx);

        let frame = ClientFrame::Send {
            id,
            to: to.clone(),
            payload,
        };
        if tx.send(frame).await.is_err() {
            self.inner.pending.write().await.remove(&id);
            return Err(ChannelError::Unavailable);
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.inner.pending.write().await.remove(&id);
                warn!(id, to = %to, ?timeout, "Relay ack timed out");
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    pub async fn send_signal(
        &self,
        message: &SignalingMessage,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let payload = RelayPayload::Signal {
            message: message.clone(),
        };
        self.send(&message.receiver_id, payload, timeout).await
    }

    pub async fn send_chat(
        &self,
        to: &UserId,
        chat_id: impl Into<String>,
        body: impl Into<String>,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let payload = RelayPayload::Chat {
            chat_id: chat_id.into(),
            body: body.into(),
        };
        self.send(to, payload, timeout).await
    }

    pub async fn send_typing(
        &self,
        to: &UserId,
        chat_id: impl Into<String>,
        typing: bool,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let payload = RelayPayload::Typing {
            chat_id: chat_id.into(),
            typing,
        };
        self.send(to, payload, timeout).await
    }
}

impl RelayInner {
    /// Clear the outbound sender and fail every pending ack
    async fn mark_down(&self, error: Option<String>) {
        self.outbound.write().await.take();
        for (_, tx) in self.pending.write().await.drain() {
            let _ = tx.send(Err(ChannelError::Closed));
        }
        self.state.send_if_modified(|state| {
            let changed = state.available || (error.is_some() && state.last_error != error);
            state.available = false;
            if error.is_some() {
                state.last_error = error.clone();
            }
            changed
        });
    }

    async fn mark_up(&self, tx: mpsc::Sender<ClientFrame>) {
        *self.outbound.write().await = Some(tx);
        self.state.send_modify(|state| {
            state.available = true;
            state.last_error = None;
        });
    }

    async fn resolve(&self, id: u64, result: AckResult) {
        if let Some(tx) = self.pending.write().await.remove(&id) {
            let _ = tx.send(result);
        } else {
            debug!(id, "Ack for unknown or expired request");
        }
    }

    fn publish(&self, event: RelayEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

// ========== Session task ==========

async fn run_session(inner: Arc<RelayInner>, credential: Credential, cancel: CancellationToken) {
    let mut attempt = 0u32;
    loop {
        let error = match run_connection(&inner, &credential, &cancel).await {
            Ok(registered) => {
                if registered {
                    attempt = 0;
                }
                None
            }
            Err(e) => {
                warn!(url = %inner.url, error = %e, "Relay connection failed");
                Some(e.to_string())
            }
        };
        inner.mark_down(error).await;

        if cancel.is_cancelled() {
            break;
        }

        attempt += 1;
        if attempt > inner.policy.attempts {
            warn!(
                attempts = inner.policy.attempts,
                "Relay reconnect attempts exhausted, giving up"
            );
            inner.mark_down(Some("reconnect attempts exhausted".to_string())).await;
            break;
        }

        let delay = inner.policy.delay(attempt);
        info!(attempt, ?delay, "Reconnecting to relay");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("Relay session task stopped");
}

/// One connection lifetime. Returns whether registration succeeded.
async fn run_connection(
    inner: &Arc<RelayInner>,
    credential: &Credential,
    cancel: &CancellationToken,
) -> Result<bool> {
    let (ws, _) = tokio::select! {
        _ = cancel.cancelled() => return Ok(false),
        r = tokio_tungstenite::connect_async(inner.url.as_str()) => {
            r.with_context(|| format!("connecting to {}", inner.url))?
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    let register = ClientFrame::Register {
        user_id: credential.user_id.clone(),
        token: credential.token.clone(),
    };
    ws_tx.send(Message::Text(register.to_json()?.into())).await?;

    let (tx, mut rx) = mpsc::channel::<ClientFrame>(64);
    let mut outbound = Some(tx);
    let mut registered = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(registered);
            }
            Some(frame) = rx.recv() => {
                let json = frame.to_json()?;
                ws_tx.send(Message::Text(json.into())).await?;
            }
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        info!(user = %credential.user_id, "Relay closed the connection");
                        return Ok(registered);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };
                let frame: ServerFrame = match serde_json::from_str(text.as_str()) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed relay frame");
                        continue;
                    }
                };
                match frame {
                    ServerFrame::Registered { user_id } => {
                        if let Some(tx) = outbound.take() {
                            registered = true;
                            inner.mark_up(tx).await;
                            info!(user = %user_id, "Registered with relay");
                        }
                    }
                    ServerFrame::Ack { id } => inner.resolve(id, Ok(())).await,
                    ServerFrame::Nack { id, reason } => {
                        debug!(id, reason = %reason, "Relay rejected send");
                        inner.resolve(id, Err(ChannelError::Rejected(reason))).await;
                    }
                    ServerFrame::Deliver { from, payload } => {
                        inner.publish(delivered(from, payload));
                    }
                    ServerFrame::Presence { user_id, online } => {
                        inner.publish(RelayEvent::Presence { user_id, online });
                    }
                    ServerFrame::Error { reason } => {
                        if !registered {
                            anyhow::bail!("registration refused: {reason}");
                        }
                        warn!(reason = %reason, "Relay reported an error");
                    }
                }
            }
        }
    }
}

fn delivered(from: UserId, payload: RelayPayload) -> RelayEvent {
    match payload {
        RelayPayload::Signal { message } => RelayEvent::Signal { from, message },
        RelayPayload::Chat { chat_id, body } => RelayEvent::Chat {
            from,
            chat_id,
            body,
        },
        RelayPayload::Typing { chat_id, typing } => RelayEvent::Typing {
            from,
            chat_id,
            typing,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delays_are_capped() {
        let p = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=6).map(|a| p.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5, 5]);
    }

    #[tokio::test]
    async fn send_while_disconnected_fails_fast() {
        let channel = RelayChannel::new("ws://127.0.0.1:9/relay", ReconnectPolicy::default());
        assert!(!channel.is_available());
        let err = channel
            .send_chat(&"bob".into(), "c", "hi", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Unavailable);
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_noop() {
        let channel = RelayChannel::new("ws://127.0.0.1:9/relay", ReconnectPolicy::default());
        channel.disconnect().await;
        channel.disconnect().await;
        assert!(!channel.is_running().await);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        // Bind then drop so the port refuses connections
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let policy = ReconnectPolicy {
            attempts: 2,
            floor: Duration::from_millis(10),
            cap: Duration::from_millis(20),
        };
        let channel = RelayChannel::new(format!("ws://{addr}/relay"), policy);
        channel
            .connect(Credential {
                user_id: "alice".into(),
                token: "t".into(),
            })
            .await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.is_running().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let state = channel.state();
        assert!(!state.available);
        assert_eq!(state.last_error.as_deref(), Some("reconnect attempts exhausted"));
    }
}
