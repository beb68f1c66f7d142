//! Client configuration
//!
//! Built from `TANDEM_*` environment variables, optionally overlaid on a TOML
//! file named by `TANDEM_CONFIG`. Environment variables win over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::mode::ProbeConfig;
use crate::relay::ReconnectPolicy;
use crate::session::ice::IceConfig;
use crate::signal::UserId;

/// Everything a [`crate::client::TandemClient`] needs to start
#[derive(Debug, Clone)]
pub struct Config {
    /// Local identity, announced to the relay and used for rendezvous ids
    pub user_id: UserId,
    /// Bearer credential for the relay and the credential service.
    /// Without one the relayed channel is never opened.
    pub token: Option<String>,
    /// WebSocket URL of the relay, e.g. `ws://host:8080/relay`
    pub relay_url: String,
    /// Liveness endpoint probed by the mode detector
    pub probe_url: String,
    /// Traversal credential service. `None` means public STUN only.
    pub ice_url: Option<String>,
    /// Users whose rendezvous swarm is joined at startup
    pub contacts: Vec<UserId>,
    /// Iroh endpoint ids used to bootstrap gossip topics
    pub bootstrap: Vec<String>,
    /// Where the mode label is persisted
    pub mode_state_path: Option<PathBuf>,
    /// JSON-lines call history file
    pub history_path: Option<PathBuf>,
    pub probe: ProbeConfig,
    pub reconnect: ReconnectPolicy,
    pub ice: IceConfig,
    /// Bounded wait for a relay acknowledgement
    pub ack_timeout: Duration,
    /// Hard deadline for an outgoing call to be answered
    pub ring_timeout: Duration,
    /// Extra time an incoming call keeps ringing past `ring_timeout`
    pub ring_grace: Duration,
}

impl Config {
    /// Defaults for a client talking to a relay at `host:port`
    pub fn new(user_id: impl Into<UserId>, server: &str) -> Self {
        let (relay_url, probe_url, ice_url) = server_urls(server);
        Self {
            user_id: user_id.into(),
            token: None,
            relay_url,
            probe_url,
            ice_url: Some(ice_url),
            contacts: Vec::new(),
            bootstrap: Vec::new(),
            mode_state_path: None,
            history_path: None,
            probe: ProbeConfig::default(),
            reconnect: ReconnectPolicy::default(),
            ice: IceConfig::default(),
            ack_timeout: Duration::from_secs(5),
            ring_timeout: Duration::from_secs(30),
            ring_grace: Duration::from_secs(5),
        }
    }

    /// Point all server URLs at `host:port`
    pub fn set_server(&mut self, server: &str) {
        let (relay_url, probe_url, ice_url) = server_urls(server);
        self.relay_url = relay_url;
        self.probe_url = probe_url;
        self.ice_url = Some(ice_url);
    }

    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file = match var("TANDEM_CONFIG") {
            Some(path) => FileConfig::load(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let user_id = var("TANDEM_USER")
            .or_else(|| file.user_id.clone())
            .context("TANDEM_USER environment variable not set")?;

        let server = var("TANDEM_SERVER")
            .or_else(|| file.server.clone())
            .unwrap_or_else(|| "127.0.0.1:8080".to_string());

        let mut config = Self::new(user_id, &server);
        file.apply(&mut config);

        if let Some(token) = var("TANDEM_TOKEN") {
            config.token = Some(token);
        }
        if let Some(contacts) = var("TANDEM_CONTACTS") {
            config.contacts = split_list(&contacts).map(UserId::from).collect();
        }
        if let Some(peers) = var("TANDEM_BOOTSTRAP") {
            config.bootstrap = split_list(&peers).map(str::to_string).collect();
        }
        if let Some(path) = var("TANDEM_MODE_STATE") {
            config.mode_state_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("TANDEM_HISTORY") {
            config.history_path = Some(PathBuf::from(path));
        }

        config.probe.interval = var("TANDEM_PROBE_INTERVAL")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(config.probe.interval);

        config.ring_timeout = var("TANDEM_RING_TIMEOUT")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(config.ring_timeout);

        Ok(config)
    }
}

fn server_urls(server: &str) -> (String, String, String) {
    let host = server
        .trim_start_matches("http://")
        .trim_start_matches("ws://")
        .trim_end_matches('/');
    (
        format!("ws://{host}/relay"),
        format!("http://{host}/health"),
        format!("http://{host}/ice-servers"),
    )
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// On-disk configuration. Every field is optional; durations are seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    user_id: Option<String>,
    server: Option<String>,
    token: Option<String>,
    ice_url: Option<String>,
    #[serde(default)]
    contacts: Vec<String>,
    #[serde(default)]
    bootstrap: Vec<String>,
    mode_state_path: Option<PathBuf>,
    history_path: Option<PathBuf>,
    probe_interval_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
    probe_retries: Option<u32>,
    reconnect_attempts: Option<u32>,
    ack_timeout_secs: Option<u64>,
    ring_timeout_secs: Option<u64>,
    ring_grace_secs: Option<u64>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    fn apply(self, config: &mut Config) {
        let secs = Duration::from_secs;
        if self.token.is_some() {
            config.token = self.token;
        }
        if self.ice_url.is_some() {
            config.ice_url = self.ice_url;
        }
        if !self.contacts.is_empty() {
            config.contacts = self.contacts.into_iter().map(UserId::from).collect();
        }
        if !self.bootstrap.is_empty() {
            config.bootstrap = self.bootstrap;
        }
        if self.mode_state_path.is_some() {
            config.mode_state_path = self.mode_state_path;
        }
        if self.history_path.is_some() {
            config.history_path = self.history_path;
        }
        if let Some(v) = self.probe_interval_secs {
            config.probe.interval = secs(v);
        }
        if let Some(v) = self.probe_timeout_secs {
            config.probe.timeout = secs(v);
        }
        if let Some(v) = self.probe_retries {
            config.probe.retries = v;
        }
        if let Some(v) = self.reconnect_attempts {
            config.reconnect.attempts = v;
        }
        if let Some(v) = self.ack_timeout_secs {
            config.ack_timeout = secs(v);
        }
        if let Some(v) = self.ring_timeout_secs {
            config.ring_timeout = secs(v);
        }
        if let Some(v) = self.ring_grace_secs {
            config.ring_grace = secs(v);
        }
    }
}
