//! Liveness / mode detection
//!
//! Periodically probes the backend and publishes a binary [`Mode`] on a
//! `watch` channel. A check cycle only reports `Degraded` after the initial
//! probe and every retry failed, so a transient blip never flips the mode.
//! Probe errors are swallowed here; callers only ever see the mode.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Binary reachability mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Backend reachable, relayed channel is authoritative
    Connected,
    /// Backend unreachable, signaling goes serverless
    Degraded,
}

/// Process-wide mode state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppMode {
    pub mode: Mode,
    pub last_successful_contact: Option<DateTime<Utc>>,
}

impl AppMode {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            last_successful_contact: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.mode == Mode::Connected
    }
}

impl Default for AppMode {
    fn default() -> Self {
        Self::new(Mode::Connected)
    }
}

/// Reachability probe. Must be idempotent and cheap.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    /// Returns Ok(()) when the backend answered successfully
    async fn probe(&self) -> Result<()>;
}

/// `GET <url>`; any 2xx counts as reachable
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> Result<()> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("probe returned {}", resp.status());
        }
        Ok(())
    }
}

/// Timing for the detector
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Time between check cycles
    pub interval: Duration,
    /// Per-probe latency bound
    pub timeout: Duration,
    /// Retries after the first failed probe within one cycle
    pub retries: u32,
    /// First retry delay; doubles on every retry
    pub backoff_base: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl ProbeConfig {
    /// Delay before retry number `retry` (0-based): base, 2*base, 4*base...
    pub fn retry_delay(&self, retry: u32) -> Duration {
        self.backoff_base * (1u32 << retry.min(16))
    }
}

/// Persists the mode label across restarts
#[derive(Debug, Clone)]
pub struct ModeStore {
    path: PathBuf,
}

impl ModeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last persisted label, if any. Unreadable files count as absent.
    pub fn load(&self) -> Option<Mode> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        match raw.trim() {
            "connected" => Some(Mode::Connected),
            "degraded" => Some(Mode::Degraded),
            other => {
                warn!(path = %self.path.display(), label = other, "Ignoring unknown mode label");
                None
            }
        }
    }

    pub fn save(&self, mode: Mode) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let label = match mode {
            Mode::Connected => "connected",
            Mode::Degraded => "degraded",
        };
        std::fs::write(&self.path, label)
            .with_context(|| format!("writing mode state to {}", self.path.display()))
    }
}

/// Liveness detector publishing [`AppMode`]
pub struct ModeDetector {
    probe: Arc<dyn Probe>,
    config: ProbeConfig,
    tx: watch::Sender<AppMode>,
    store: Option<ModeStore>,
}

impl ModeDetector {
    pub fn new(probe: Arc<dyn Probe>, config: ProbeConfig) -> Self {
        let (tx, _) = watch::channel(AppMode::default());
        Self {
            probe,
            config,
            tx,
            store: None,
        }
    }

    /// Attach a label store. The persisted label becomes the initial mode.
    pub fn with_store(mut self, store: ModeStore) -> Self {
        if let Some(mode) = store.load() {
            debug!(?mode, "Restored persisted mode");
            self.tx.send_replace(AppMode::new(mode));
        }
        self.store = Some(store);
        self
    }

    pub fn current_mode(&self) -> AppMode {
        *self.tx.borrow()
    }

    /// Receiver that is notified on mode transitions only
    pub fn subscribe(&self) -> watch::Receiver<AppMode> {
        self.tx.subscribe()
    }

    /// Run one check cycle and publish the outcome
    pub async fn check(&self) -> Mode {
        let reachable = self.probe_with_retries().await;
        let now = Utc::now();
        let mut transitioned = None;

        self.tx.send_if_modified(|state| {
            if reachable {
                state.last_successful_contact = Some(now);
            }
            let mode = if reachable { Mode::Connected } else { Mode::Degraded };
            if state.mode != mode {
                state.mode = mode;
                transitioned = Some(mode);
                true
            } else {
                false
            }
        });

        if let Some(mode) = transitioned {
            info!(?mode, "Mode changed");
            if let Some(store) = &self.store {
                if let Err(e) = store.save(mode) {
                    warn!(error = %e, "Failed to persist mode");
                }
            }
        }

        self.current_mode().mode
    }

    async fn probe_with_retries(&self) -> bool {
        let mut retry = 0;
        loop {
            match tokio::time::timeout(self.config.timeout, self.probe.probe()).await {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => debug!(retry, error = %e, "Probe failed"),
                Err(_) => debug!(retry, timeout = ?self.config.timeout, "Probe timed out"),
            }
            if retry >= self.config.retries {
                return false;
            }
            tokio::time::sleep(self.config.retry_delay(retry)).await;
            retry += 1;
        }
    }

    /// Spawn the periodic loop: immediate check, then one per interval
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.check() => {}
                }
            }
            debug!("Mode detector stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Fails the first `failures` probes, then succeeds
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Probe for Flaky {
        async fn probe(&self) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                anyhow::bail!("unreachable");
            }
            Ok(())
        }
    }

    struct Hangs;

    #[async_trait::async_trait]
    impl Probe for Hangs {
        async fn probe(&self) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn retry_delays_double() {
        let c = ProbeConfig::default();
        assert_eq!(c.retry_delay(0), Duration::from_secs(1));
        assert_eq!(c.retry_delay(1), Duration::from_secs(2));
        assert_eq!(c.retry_delay(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_blip_stays_connected() {
        let probe = Flaky::new(2);
        let detector = ModeDetector::new(probe.clone(), ProbeConfig::default());

        let start = Instant::now();
        assert_eq!(detector.check().await, Mode::Connected);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff before the third probe succeeded
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert!(detector.current_mode().last_successful_contact.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_degrade() {
        let probe = Flaky::new(u32::MAX);
        let detector = ModeDetector::new(probe.clone(), ProbeConfig::default());
        let mut rx = detector.subscribe();

        let start = Instant::now();
        assert_eq!(detector.check().await, Mode::Degraded);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().mode, Mode::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_is_bounded_by_timeout() {
        let config = ProbeConfig {
            retries: 0,
            ..ProbeConfig::default()
        };
        let detector = ModeDetector::new(Arc::new(Hangs), config);
        let start = Instant::now();
        assert_eq!(detector.check().await, Mode::Degraded);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_only_see_transitions() {
        let detector = ModeDetector::new(Flaky::new(0), ProbeConfig::default());
        let mut rx = detector.subscribe();
        detector.check().await;
        detector.check().await;
        // Connected -> Connected: timestamp refreshed, no notification
        assert!(!rx.has_changed().unwrap());
        assert!(detector.current_mode().last_successful_contact.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_checks_immediately_then_on_interval() {
        let probe = Flaky::new(0);
        let detector = Arc::new(ModeDetector::new(probe.clone(), ProbeConfig::default()));
        let cancel = CancellationToken::new();
        let handle = detector.clone().spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn store_roundtrip_and_initial_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModeStore::new(dir.path().join("state/mode"));
        assert_eq!(store.load(), None);
        store.save(Mode::Degraded).unwrap();
        assert_eq!(store.load(), Some(Mode::Degraded));

        let detector =
            ModeDetector::new(Flaky::new(0), ProbeConfig::default()).with_store(store.clone());
        assert_eq!(detector.current_mode().mode, Mode::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModeStore::new(dir.path().join("mode"));
        let config = ProbeConfig {
            retries: 0,
            ..ProbeConfig::default()
        };
        let detector = ModeDetector::new(Flaky::new(1), config).with_store(store.clone());

        detector.check().await;
        assert_eq!(store.load(), Some(Mode::Degraded));
        detector.check().await;
        assert_eq!(store.load(), Some(Mode::Connected));
    }
}
