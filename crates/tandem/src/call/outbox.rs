//! Ordered outbound signal queue
//!
//! The controller never awaits a relay acknowledgement itself. It pushes
//! signals and swarm membership changes here; one task works through them in
//! order and reports each send result back.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::discovery::DiscoveryChannel;
use crate::error::SignalError;
use crate::selector::{ChannelSelector, SendOutcome};
use crate::signal::{CallId, ChannelKind, SignalingMessage, UserId};

#[derive(Debug)]
pub enum OutboxItem {
    /// Send a signal. Skipped, or abandoned mid-send, once `cancel` fires.
    Signal {
        message: SignalingMessage,
        cancel: Option<CancellationToken>,
    },
    /// Join the rendezvous with a peer outside the contact list
    Join(UserId),
    Leave(UserId),
    /// Resolves once every earlier item has been handled
    Flush(oneshot::Sender<()>),
}

/// Result of one signal send, reported back to the controller
#[derive(Debug, Clone)]
pub struct SendReport {
    pub call_id: CallId,
    pub kind: &'static str,
    pub essential: bool,
    pub result: Result<SendOutcome, SignalError>,
}

/// Handle to the outbox task
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<OutboxItem>,
}

impl Outbox {
    /// Spawn the outbox task. `join_wait` bounds how long a fresh join
    /// waits for its first peer link when the relay cannot be used.
    pub fn spawn(
        selector: ChannelSelector,
        discovery: DiscoveryChannel,
        join_wait: Duration,
        reports: mpsc::UnboundedSender<SendReport>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(selector, discovery, join_wait, rx, reports, cancel));
        (Self { tx }, handle)
    }

    pub fn signal(&self, message: SignalingMessage, cancel: Option<CancellationToken>) {
        self.push(OutboxItem::Signal { message, cancel });
    }

    pub fn join(&self, remote: UserId) {
        self.push(OutboxItem::Join(remote));
    }

    pub fn leave(&self, remote: UserId) {
        self.push(OutboxItem::Leave(remote));
    }

    /// Wait until everything queued so far has been sent or given up on.
    /// Returns false if the outbox stopped first.
    pub async fn flush(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        self.push(OutboxItem::Flush(tx));
        rx.await.is_ok()
    }

    fn push(&self, item: OutboxItem) {
        if self.tx.send(item).is_err() {
            debug!("Outbox closed, dropping item");
        }
    }
}

async fn run(
    selector: ChannelSelector,
    discovery: DiscoveryChannel,
    join_wait: Duration,
    mut rx: mpsc::UnboundedReceiver<OutboxItem>,
    reports: mpsc::UnboundedSender<SendReport>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match item {
            OutboxItem::Signal { message, cancel: call_cancel } => {
                let call_cancel = call_cancel.unwrap_or_default();
                if call_cancel.is_cancelled() {
                    debug!(call_id = %message.call_id, kind = message.payload.kind(), "Dropping signal for finished call");
                    continue;
                }
                let result = tokio::select! {
                    _ = call_cancel.cancelled() => {
                        debug!(call_id = %message.call_id, kind = message.payload.kind(), "Signal send abandoned");
                        continue;
                    }
                    r = selector.send_signal(&message) => r,
                };
                let report = SendReport {
                    call_id: message.call_id.clone(),
                    kind: message.payload.kind(),
                    essential: message.payload.is_essential(),
                    result,
                };
                let _ = reports.send(report);
            }
            OutboxItem::Join(remote) => {
                if let Err(e) = discovery.join(&remote).await {
                    warn!(peer = %remote, error = %e, "Rendezvous join failed");
                    continue;
                }
                if selector.preferred(&remote) == ChannelKind::Discovery {
                    wait_for_peer(&discovery, &remote, join_wait).await;
                }
            }
            OutboxItem::Leave(remote) => discovery.leave_peer(&remote).await,
            OutboxItem::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Outbox stopped");
}

async fn wait_for_peer(discovery: &DiscoveryChannel, remote: &UserId, wait: Duration) {
    let mut peers = discovery.watch_peers();
    let found = tokio::time::timeout(
        wait,
        peers.wait_for(|p| p.get(remote).copied().unwrap_or(0) > 0),
    )
    .await;
    match found {
        Ok(Ok(_)) => debug!(peer = %remote, "Rendezvous peer link up"),
        _ => debug!(peer = %remote, ?wait, "No rendezvous peer yet"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::watch;

    use crate::discovery::MemorySwarmHub;
    use crate::error::ChannelError;
    use crate::mode::{AppMode, Mode};
    use crate::selector::SignalTransport;
    use crate::signal::SignalPayload;

    struct Slow {
        delay: Duration,
        sent: std::sync::Mutex<Vec<&'static str>>,
    }

    #[async_trait::async_trait]
    impl SignalTransport for Slow {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Relayed
        }
        fn is_available(&self, _to: &UserId) -> bool {
            true
        }
        async fn send_signal(
            &self,
            message: &SignalingMessage,
            _timeout: Duration,
        ) -> Result<(), ChannelError> {
            tokio::time::sleep(self.delay).await;
            self.sent.lock().unwrap().push(message.payload.kind());
            Ok(())
        }
    }

    fn message(payload: SignalPayload) -> SignalingMessage {
        SignalingMessage::new(
            CallId::from("c1"),
            UserId::from("alice"),
            UserId::from("bob"),
            payload,
        )
    }

    fn setup(
        relay: Arc<Slow>,
    ) -> (
        Outbox,
        mpsc::UnboundedReceiver<SendReport>,
        DiscoveryChannel,
        MemorySwarmHub,
    ) {
        let hub = MemorySwarmHub::new();
        let (inbound, _rx) = mpsc::channel(8);
        let discovery = DiscoveryChannel::new(UserId::from("alice"), Arc::new(hub.node("alice")), inbound);
        let (_mode_tx, mode_rx) = watch::channel(AppMode::new(Mode::Connected));
        let selector = ChannelSelector::new(
            relay,
            Arc::new(discovery.clone()),
            mode_rx,
            Duration::from_secs(5),
        );
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (outbox, _handle) = Outbox::spawn(
            selector,
            discovery.clone(),
            Duration::from_secs(5),
            reports_tx,
            CancellationToken::new(),
        );
        (outbox, reports_rx, discovery, hub)
    }

    #[tokio::test(start_paused = true)]
    async fn signals_are_sent_in_order_and_reported() {
        let relay = Arc::new(Slow {
            delay: Duration::from_millis(100),
            sent: Default::default(),
        });
        let (outbox, mut reports, _d, _hub) = setup(relay.clone());

        outbox.signal(message(SignalPayload::Invite { media: crate::signal::MediaKind::Audio }), None);
        outbox.signal(message(SignalPayload::Offer { sdp: "v=0".into() }), None);
        outbox.signal(message(SignalPayload::CallEnd), None);

        let first = reports.recv().await.unwrap();
        assert_eq!(first.kind, "invite");
        assert!(first.essential);
        assert_eq!(first.result.unwrap().used, ChannelKind::Relayed);
        assert_eq!(reports.recv().await.unwrap().kind, "offer");
        let last = reports.recv().await.unwrap();
        assert_eq!(last.kind, "call-end");
        assert!(!last.essential);
        assert_eq!(*relay.sent.lock().unwrap(), vec!["invite", "offer", "call-end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_signals_are_dropped() {
        let relay = Arc::new(Slow {
            delay: Duration::from_secs(3),
            sent: Default::default(),
        });
        let (outbox, mut reports, _d, _hub) = setup(relay.clone());
        let call = CancellationToken::new();

        outbox.signal(message(SignalPayload::Offer { sdp: "v=0".into() }), Some(call.clone()));
        outbox.signal(
            message(SignalPayload::IceCandidate {
                candidate: crate::signal::IceCandidate::new("candidate:1"),
            }),
            Some(call.clone()),
        );
        outbox.signal(message(SignalPayload::CallEnd), None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        call.cancel();

        let report = reports.recv().await.unwrap();
        assert_eq!(report.kind, "call-end");
        assert_eq!(*relay.sent.lock().unwrap(), vec!["call-end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_waits_for_queued_signals() {
        let relay = Arc::new(Slow {
            delay: Duration::from_secs(2),
            sent: Default::default(),
        });
        let (outbox, _reports, _d, _hub) = setup(relay.clone());

        outbox.signal(message(SignalPayload::Accept), None);
        outbox.signal(message(SignalPayload::CallEnd), None);
        assert!(outbox.flush().await);
        assert_eq!(*relay.sent.lock().unwrap(), vec!["accept", "call-end"]);
    }

    #[tokio::test]
    async fn join_and_leave_manage_membership() {
        let relay = Arc::new(Slow {
            delay: Duration::ZERO,
            sent: Default::default(),
        });
        let (outbox, mut reports, discovery, _hub) = setup(relay);
        let bob = UserId::from("bob");

        outbox.join(bob.clone());
        outbox.signal(message(SignalPayload::Accept), None);
        reports.recv().await.unwrap();
        assert!(discovery.is_joined(&bob).await);

        outbox.leave(bob.clone());
        outbox.signal(message(SignalPayload::Accept), None);
        reports.recv().await.unwrap();
        assert!(!discovery.is_joined(&bob).await);
    }
}
