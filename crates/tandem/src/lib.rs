//! Tandem - dual-channel call signaling
//!
//! Calls are set up over two independent signaling transports: a relayed
//! channel through a server, and a serverless peer-discovery channel that
//! keeps working when the server is unreachable. Feature flags control
//! which optional backends are compiled:
//!
//! - **Core** (always available): signaling types, mode detector, both
//!   channels, channel selector, session engine with the loopback backend,
//!   call controller, client assembly
//! - **`server`**: relay server (WebSocket hub, `/health`, `/ice-servers`)
//! - **`iroh`**: iroh-gossip discovery swarm
//! - **`webrtc`**: webrtc-rs media backend

pub mod call;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod mode;
pub mod relay;
pub mod selector;
pub mod session;
pub mod signal;

// Server: WebSocket hub, liveness and TURN credential endpoints
#[cfg(feature = "server")]
pub mod server;

pub use call::{CallHandle, CallSession, CallState, ClientEvent, Direction, EndReason};
pub use client::{ClientDeps, TandemClient};
pub use config::Config;
pub use error::{CallError, ChannelError, NegotiationError, SignalError};
pub use mode::{AppMode, Mode};
pub use selector::CallMode;
pub use signal::{CallId, ChannelKind, MediaKind, SignalPayload, SignalingMessage, UserId};
