//! TURN REST credentials
//!
//! The TURN server shares `secret` with the relay. A credential is valid
//! until the unix time embedded in its username.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::session::ice::TurnCredentials;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub secret: String,
    pub urls: Vec<String>,
    pub ttl: Duration,
}

impl TurnConfig {
    /// Credentials for `user`, valid for `ttl` from now
    pub fn mint(&self, user: &str) -> TurnCredentials {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.mint_at(user, now)
    }

    pub fn mint_at(&self, user: &str, now_unix: u64) -> TurnCredentials {
        let expiry = now_unix + self.ttl.as_secs();
        let username = format!("{expiry}:{user}");
        TurnCredentials {
            urls: self.urls.clone(),
            credential: sign(&self.secret, &username),
            username,
            ttl: self.ttl.as_secs(),
        }
    }
}

fn sign(secret: &str, username: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha1::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(username.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TurnConfig {
        TurnConfig {
            secret: "north".to_string(),
            urls: vec!["turn:turn.example.org:3478".to_string()],
            ttl: Duration::from_secs(3600),
        }
    }

    #[test]
    fn username_carries_expiry_and_user() {
        let creds = config().mint_at("alice", 1_700_000_000);
        assert_eq!(creds.username, "1700003600:alice");
        assert_eq!(creds.ttl, 3600);
        assert_eq!(creds.urls, vec!["turn:turn.example.org:3478".to_string()]);
    }

    #[test]
    fn credential_is_base64_hmac_sha1() {
        let creds = config().mint_at("alice", 1_700_000_000);
        let raw = STANDARD.decode(&creds.credential).unwrap();
        assert_eq!(raw.len(), 20);

        let mut mac = HmacSha1::new_from_slice(b"north").unwrap();
        mac.update(b"1700003600:alice");
        mac.verify_slice(&raw).unwrap();
    }

    #[test]
    fn different_users_get_different_credentials() {
        let a = config().mint_at("alice", 1);
        let b = config().mint_at("bob", 1);
        assert_ne!(a.credential, b.credential);
    }
}
