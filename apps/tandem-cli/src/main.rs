//! Tandem CLI — line-oriented call client
//!
//! ## Usage
//!
//! ```bash
//! TANDEM_USER=alice TANDEM_TOKEN=t TANDEM_SERVER=relay.example.org:8080 \
//! TANDEM_CONTACTS=bob tandem-cli
//! ```
//!
//! Commands: `call <user> [audio|video]`, `accept`, `reject`, `end`,
//! `mute`, `video`, `camera`, `chat <user> <text>`, `status`, `quit`.
//!
//! Without the `iroh` feature the discovery channel only reaches peers in
//! this process; without `webrtc` media runs over the loopback backend.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use tandem::discovery::Swarm;
use tandem::session::MediaBackend;
use tandem::{CallSession, ClientDeps, ClientEvent, Config, MediaKind, TandemClient, UserId};

#[derive(Debug, PartialEq)]
enum Input {
    Call(UserId, MediaKind),
    Accept,
    Reject,
    End,
    Mute,
    Video,
    Camera,
    Chat(UserId, String),
    Status,
    Quit,
    Help,
}

fn parse(line: &str) -> Result<Input, String> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Ok(Input::Help);
    };
    let input = match cmd {
        "call" => {
            let user = words.next().ok_or("usage: call <user> [audio|video]")?;
            let media = match words.next() {
                None | Some("audio") => MediaKind::Audio,
                Some("video") => MediaKind::Video,
                Some(other) => return Err(format!("unknown media kind: {other}")),
            };
            Input::Call(UserId::from(user), media)
        }
        "accept" => Input::Accept,
        "reject" => Input::Reject,
        "end" | "hangup" => Input::End,
        "mute" => Input::Mute,
        "video" => Input::Video,
        "camera" => Input::Camera,
        "chat" => {
            let user = words.next().ok_or("usage: chat <user> <text>")?;
            let text = words.collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                return Err("usage: chat <user> <text>".to_string());
            }
            Input::Chat(UserId::from(user), text)
        }
        "status" => Input::Status,
        "quit" | "exit" => Input::Quit,
        "help" => Input::Help,
        other => return Err(format!("unknown command: {other}")),
    };
    Ok(input)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env()?;
    info!("Tandem CLI starting as {}", config.user_id);
    info!("  Relay: {}", config.relay_url);
    info!("  Contacts: {}", config.contacts.len());

    let deps = ClientDeps {
        backend: media_backend()?,
        swarm: swarm(&config).await?,
        probe: None,
        history: None,
    };
    let client = TandemClient::start(config, deps).await?;
    let printer = tokio::spawn(print_events(client.events()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = match parse(&line) {
            Ok(input) => input,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if input == Input::Quit {
            break;
        }
        run(&client, input).await;
    }

    client.shutdown().await;
    printer.abort();
    Ok(())
}

async fn run(client: &TandemClient, input: Input) {
    let calls = client.calls();
    let outcome = match input {
        Input::Call(user, media) => calls
            .start_outgoing_call(user, media)
            .await
            .map(|id| format!("calling, call id {id}")),
        Input::Accept => calls.accept_incoming_call().await.map(|_| "accepted".into()),
        Input::Reject => calls.reject_call().await.map(|_| "rejected".into()),
        Input::End => calls.end_call().await.map(|_| "ended".into()),
        Input::Mute => calls
            .toggle_mute()
            .await
            .map(|muted| if muted { "muted" } else { "unmuted" }.into()),
        Input::Video => calls
            .toggle_video()
            .await
            .map(|on| if on { "video on" } else { "video off" }.into()),
        Input::Camera => calls.switch_camera().await.map(|label| format!("camera: {label}")),
        Input::Chat(user, text) => {
            match client.send_chat(&user, &format!("dm-{user}"), &text).await {
                Ok(()) => println!("sent"),
                Err(e) => println!("chat failed: {e}"),
            }
            return;
        }
        Input::Status => {
            let mode = client.mode();
            println!("mode: {:?}", mode.mode);
            println!("relay: {}", if client.relay().is_available() { "up" } else { "down" });
            println!("swarm links: {}", client.discovery().peer_count());
            match calls.snapshot().await {
                Ok(Some(session)) => println!("{}", describe(&session)),
                Ok(None) => println!("no call"),
                Err(e) => println!("{e}"),
            }
            return;
        }
        Input::Help => {
            println!("commands: call <user> [audio|video], accept, reject, end, mute, video, camera, chat <user> <text>, status, quit");
            return;
        }
        Input::Quit => return,
    };
    match outcome {
        Ok(msg) => println!("{msg}"),
        Err(e) => println!("error: {e}"),
    }
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::CallStateChanged(session)) => println!("{}", describe(&session)),
            Ok(ClientEvent::ModeChanged(mode)) => println!("mode changed: {:?}", mode.mode),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn describe(s: &CallSession) -> String {
    let mut line = format!(
        "[{}] {} with {} ({:?})",
        s.call_id, s.state, s.remote_user_id, s.media_kind
    );
    if let Some(mode) = s.call_mode() {
        line.push_str(&format!(", {mode:?}"));
    }
    if let Some(reason) = s.end_reason {
        line.push_str(&format!(", {reason}"));
    }
    if s.muted {
        line.push_str(", muted");
    }
    line
}

#[cfg(feature = "webrtc")]
fn media_backend() -> Result<Arc<dyn MediaBackend>> {
    let backend = tandem::session::rtc::RtcBackend::new(vec!["default".to_string()])?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "webrtc"))]
fn media_backend() -> Result<Arc<dyn MediaBackend>> {
    let network = tandem::session::LoopbackNetwork::new();
    Ok(Arc::new(tandem::session::LoopbackBackend::new(network)))
}

#[cfg(feature = "iroh")]
async fn swarm(config: &Config) -> Result<Arc<dyn Swarm>> {
    let key_path = std::env::var("TANDEM_KEY_PATH")
        .map(std::path::PathBuf::from)
        .ok();
    let swarm = tandem::discovery::gossip::GossipSwarm::spawn(key_path.as_deref(), &config.bootstrap).await?;
    info!("Swarm endpoint: {}", swarm.endpoint_id());
    Ok(Arc::new(swarm))
}

#[cfg(not(feature = "iroh"))]
async fn swarm(config: &Config) -> Result<Arc<dyn Swarm>> {
    let hub = tandem::discovery::MemorySwarmHub::new();
    Ok(Arc::new(hub.node(config.user_id.as_str())))
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
