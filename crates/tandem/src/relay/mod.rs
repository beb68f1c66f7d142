//! Relayed channel: persistent connection to the server-side message relay
//!
//! - [`protocol`]: JSON frames shared by the client and the relay server
//! - [`RelayChannel`]: reconnecting client with request/ack sends
//! - [`supervise`]: keeps the channel connected exactly while the mode is
//!   `Connected` and a credential is present

pub mod channel;
pub mod protocol;

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::mode::AppMode;

pub use channel::{ChannelState, Credential, ReconnectPolicy, RelayChannel, RelayEvent};
pub use protocol::{ClientFrame, RelayPayload, ServerFrame};

/// Drive `channel` from the mode signal.
///
/// Connects while the mode is `Connected` and `credential` is set, forces a
/// disconnect otherwise. A session that gave up after exhausting its
/// reconnect attempts is restarted on the next `recheck` tick if the mode
/// still says the backend is reachable.
pub fn supervise(
    channel: RelayChannel,
    mut mode: watch::Receiver<AppMode>,
    credential: Option<Credential>,
    recheck: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(recheck);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let connected = mode.borrow_and_update().is_connected();
            match (&credential, connected) {
                (Some(cred), true) => {
                    if !channel.is_running().await {
                        info!(user = %cred.user_id, "Opening relayed channel");
                        channel.connect(cred.clone()).await;
                    }
                }
                _ => {
                    if channel.is_running().await {
                        info!(connected, "Closing relayed channel");
                    }
                    channel.disconnect().await;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = mode.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }
        }
        channel.disconnect().await;
        debug!("Relay supervisor stopped");
    })
}
