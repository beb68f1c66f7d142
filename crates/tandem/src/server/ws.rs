//! WebSocket handler for one relay connection.
//!
//! The first text frame must be `register`. After that the connection
//! forwards `send` frames through the hub and pushes anything queued for
//! the registered user back down the socket.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::hub::{Hub, CONNECTION_BUFFER};
use crate::relay::{ClientFrame, ServerFrame};
use crate::signal::UserId;

/// How long a fresh connection may take to register
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection.
pub async fn handle_ws(socket: WebSocket, hub: Hub, auth_token: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let user = match tokio::time::timeout(REGISTER_TIMEOUT, read_register(&mut ws_rx)).await {
        Ok(Some((user, token))) => {
            let allowed = match &auth_token {
                Some(expected) => &token == expected,
                None => !token.is_empty(),
            };
            if !allowed {
                warn!(user = %user, "Registration refused: bad token");
                let _ = send_frame(
                    &mut ws_tx,
                    &ServerFrame::Error {
                        reason: "unauthorized".to_string(),
                    },
                )
                .await;
                return;
            }
            user
        }
        Ok(None) => {
            debug!("Connection closed before registering");
            return;
        }
        Err(_) => {
            debug!("Registration timed out");
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<ServerFrame>(CONNECTION_BUFFER);
    let gen = hub.register(user.clone(), tx).await;
    if send_frame(
        &mut ws_tx,
        &ServerFrame::Registered {
            user_id: user.clone(),
        },
    )
    .await
    .is_err()
    {
        hub.unregister(&user, gen).await;
        return;
    }

    loop {
        tokio::select! {
            queued = rx.recv() => {
                match queued {
                    Some(frame) => {
                        if send_frame(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        info!(user = %user, "Connection replaced by a newer registration");
                        break;
                    }
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(ClientFrame::Send { id, to, payload }) => {
                                hub.forward(&user, id, &to, payload).await
                            }
                            Ok(ClientFrame::Register { .. }) => ServerFrame::Error {
                                reason: "already registered".to_string(),
                            },
                            Err(e) => {
                                warn!(user = %user, error = %e, "Malformed client frame");
                                ServerFrame::Error {
                                    reason: "malformed frame".to_string(),
                                }
                            }
                        };
                        if send_frame(&mut ws_tx, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(user = %user, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    hub.unregister(&user, gen).await;
}

async fn read_register(ws_rx: &mut SplitStream<WebSocket>) -> Option<(UserId, String)> {
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(ClientFrame::Register { user_id, token }) => return Some((user_id, token)),
                Ok(other) => {
                    debug!(?other, "Frame before registration ignored");
                }
                Err(e) => {
                    warn!(error = %e, "Malformed frame before registration");
                }
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn send_frame(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let json = match frame.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to encode server frame");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await
}
