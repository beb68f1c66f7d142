//! Traversal helper (STUN/TURN) configuration
//!
//! TURN credentials are time-limited. [`IceServerProvider`] caches the last
//! set and refetches it before it expires; when the credential service is
//! unreachable it falls back to public STUN servers.
//!
//! [`IceServerProvider::servers`] refreshes lazily on its own. Run
//! [`IceServerProvider::refresh_loop`] to fetch ahead of each refresh point
//! so a call never waits on the credential service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry interval of the refresh loop while no fresh credentials are cached
const REFRESH_RETRY: Duration = Duration::from_secs(30);

/// One ICE server entry as handed to the connectivity context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Body returned by the credential service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
    /// Seconds the credential stays valid
    pub ttl: u64,
}

#[derive(Debug, Clone)]
pub struct IceConfig {
    /// Refresh this long before expiry, capped at 10% of the ttl
    pub refresh_margin: Duration,
    /// Used when no credentials can be fetched
    pub fallback_stun: Vec<String>,
    pub fetch_timeout: Duration,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(60),
            fallback_stun: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

/// Source of TURN credentials
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<TurnCredentials>;
}

/// `GET <url>?user=<id>` with a bearer token
pub struct HttpCredentialSource {
    client: reqwest::Client,
    url: String,
    user: String,
    token: Option<String>,
}

impl HttpCredentialSource {
    pub fn new(url: impl Into<String>, user: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            user: user.into(),
            token,
        })
    }
}

#[async_trait::async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self) -> Result<TurnCredentials> {
        let mut req = self
            .client
            .get(&self.url)
            .query(&[("user", self.user.as_str())]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let creds = req
            .send()
            .await?
            .error_for_status()?
            .json::<TurnCredentials>()
            .await?;
        Ok(creds)
    }
}

struct Cached {
    servers: Vec<IceServer>,
    refresh_at: Instant,
    expires_at: Instant,
}

/// Caching provider of the ICE server list
pub struct IceServerProvider {
    source: Option<Arc<dyn CredentialSource>>,
    config: IceConfig,
    cache: Mutex<Option<Cached>>,
}

impl IceServerProvider {
    pub fn new(source: Option<Arc<dyn CredentialSource>>, config: IceConfig) -> Self {
        Self {
            source,
            config,
            cache: Mutex::new(None),
        }
    }

    /// Public STUN only
    pub fn stun_only(config: IceConfig) -> Self {
        Self::new(None, config)
    }

    fn fallback(&self) -> Vec<IceServer> {
        self.config
            .fallback_stun
            .iter()
            .map(|url| IceServer::stun(url.clone()))
            .collect()
    }

    /// Servers for a new connectivity context. Never fails.
    pub async fn servers(&self) -> Vec<IceServer> {
        let Some(source) = &self.source else {
            return self.fallback();
        };

        let mut cache = self.cache.lock().await;
        let now = Instant::now();
        if let Some(c) = cache.as_ref() {
            if now < c.refresh_at {
                return c.servers.clone();
            }
        }

        match tokio::time::timeout(self.config.fetch_timeout, source.fetch()).await {
            Ok(Ok(creds)) => {
                let ttl = Duration::from_secs(creds.ttl);
                let margin = self.config.refresh_margin.min(ttl / 10);
                let mut servers = vec![IceServer {
                    urls: creds.urls,
                    username: Some(creds.username),
                    credential: Some(creds.credential),
                }];
                servers.extend(self.fallback());
                debug!(ttl = creds.ttl, "Fetched traversal credentials");
                *cache = Some(Cached {
                    servers: servers.clone(),
                    refresh_at: now + ttl.saturating_sub(margin),
                    expires_at: now + ttl,
                });
                servers
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Traversal credential fetch failed");
                self.stale_or_fallback(cache.as_ref(), now)
            }
            Err(_) => {
                warn!(timeout = ?self.config.fetch_timeout, "Traversal credential fetch timed out");
                self.stale_or_fallback(cache.as_ref(), now)
            }
        }
    }

    /// Fetch now, then again at every refresh point, until cancelled
    pub async fn refresh_loop(self: Arc<Self>, cancel: CancellationToken) {
        if self.source.is_none() {
            return;
        }
        loop {
            self.servers().await;
            let next = self.next_refresh().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
            }
        }
        debug!("Credential refresh loop stopped");
    }

    async fn next_refresh(&self) -> Instant {
        let now = Instant::now();
        match self.cache.lock().await.as_ref() {
            Some(c) if c.refresh_at > now => c.refresh_at,
            _ => now + REFRESH_RETRY,
        }
    }

    /// Credentials past their refresh point are still usable until expiry
    fn stale_or_fallback(&self, cached: Option<&Cached>, now: Instant) -> Vec<IceServer> {
        match cached {
            Some(c) if now < c.expires_at => c.servers.clone(),
            _ => self.fallback(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeSource {
        calls: AtomicU32,
        fail: AtomicBool,
        ttl: u64,
    }

    impl FakeSource {
        fn new(ttl: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: AtomicBool::new(false),
                ttl,
            })
        }
    }

    #[async_trait::async_trait]
    impl CredentialSource for FakeSource {
        async fn fetch(&self) -> Result<TurnCredentials> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("service down");
            }
            Ok(TurnCredentials {
                urls: vec!["turn:turn.example:3478".into()],
                username: format!("{n}:alice"),
                credential: "secret".into(),
                ttl: self.ttl,
            })
        }
    }

    fn turn_username(servers: &[IceServer]) -> Option<String> {
        servers.iter().find_map(|s| s.username.clone())
    }

    #[tokio::test]
    async fn no_source_uses_public_stun() {
        let provider = IceServerProvider::stun_only(IceConfig::default());
        let servers = provider.servers().await;
        assert_eq!(servers.len(), 2);
        assert!(servers.iter().all(|s| s.username.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn credentials_are_refreshed_before_expiry() {
        let source = FakeSource::new(3600);
        let provider = IceServerProvider::new(Some(source.clone()), IceConfig::default());

        assert_eq!(turn_username(&provider.servers().await).as_deref(), Some("0:alice"));
        tokio::time::advance(Duration::from_secs(3500)).await;
        assert_eq!(turn_username(&provider.servers().await).as_deref(), Some("0:alice"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // Inside the 60s margin
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(turn_username(&provider.servers().await).as_deref(), Some("1:alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn short_ttl_uses_proportional_margin() {
        let source = FakeSource::new(100);
        let provider = IceServerProvider::new(Some(source.clone()), IceConfig::default());
        provider.servers().await;
        tokio::time::advance(Duration::from_secs(89)).await;
        provider.servers().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        provider.servers().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_unexpired_credentials() {
        let source = FakeSource::new(600);
        let provider = IceServerProvider::new(Some(source.clone()), IceConfig::default());
        provider.servers().await;

        source.fail.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(590)).await;
        assert_eq!(turn_username(&provider.servers().await).as_deref(), Some("0:alice"));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(turn_username(&provider.servers().await), None);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_fetches_ahead_of_expiry() {
        let source = FakeSource::new(600);
        let provider = Arc::new(IceServerProvider::new(
            Some(source.clone()),
            IceConfig::default(),
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&provider).refresh_loop(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // Refresh point is 600s - 60s after the first fetch
        tokio::time::sleep(Duration::from_secs(540)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(turn_username(&provider.servers().await).as_deref(), Some("1:alice"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_retries_while_the_service_is_down() {
        let source = FakeSource::new(600);
        source.fail.store(true, Ordering::SeqCst);
        let provider = Arc::new(IceServerProvider::new(
            Some(source.clone()),
            IceConfig::default(),
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&provider).refresh_loop(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }
}
