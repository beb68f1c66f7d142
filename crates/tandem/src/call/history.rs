//! Call history sinks
//!
//! Terminal sessions are handed to a [`CallHistory`] as flat records. The
//! store is write-only from the controller's point of view.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::CallSession;
use crate::signal::{CallId, MediaKind, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: CallId,
    pub participants: Vec<UserId>,
    #[serde(rename = "type")]
    pub call_type: MediaKind,
    pub status: String,
    /// Seconds; absent for calls that were never answered
    pub duration: Option<i64>,
}

impl CallRecord {
    pub fn from_session(session: &CallSession) -> Self {
        Self {
            call_id: session.call_id.clone(),
            participants: vec![
                session.local_user_id.clone(),
                session.remote_user_id.clone(),
            ],
            call_type: session.media_kind,
            status: session
                .end_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| session.state.to_string()),
            duration: session.duration_secs(),
        }
    }
}

#[async_trait::async_trait]
pub trait CallHistory: Send + Sync {
    async fn record(&self, record: CallRecord) -> Result<()>;
}

/// Appends one JSON object per line
pub struct JsonlHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait::async_trait]
impl CallHistory for JsonlHistory {
    async fn record(&self, record: CallRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps records in memory
#[derive(Clone, Default)]
pub struct MemoryHistory {
    records: Arc<Mutex<Vec<CallRecord>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<CallRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl CallHistory for MemoryHistory {
    async fn record(&self, record: CallRecord) -> Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
}
