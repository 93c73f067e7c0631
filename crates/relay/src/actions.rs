//! Append-only action log for the deployment audit trail.
//!
//! Writes one JSON object per line; the sink is best-effort and never fails
//! a caller (a lost audit line is logged, not propagated).

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::error;

/// Action kinds appended by the relay.
pub mod kinds {
    pub const DEPLOYMENT_SUCCESS: &str = "DEPLOYMENT_SUCCESS";
    pub const DEPLOYMENT_FAILED: &str = "DEPLOYMENT_FAILED";
    pub const ROLLBACK_FAILED: &str = "ROLLBACK_FAILED";
    pub const SERVER_START: &str = "SERVER_START";
    pub const SERVER_SHUTDOWN: &str = "SERVER_SHUTDOWN";
    pub const ALERT_RAISED: &str = "ALERT_RAISED";
}

/// Append-only structured event log.
#[async_trait]
pub trait ActionLog: Send + Sync {
    /// Append one entry. Never fails the caller.
    async fn append(&self, kind: &str, fields: Value);
}

/// JSON-lines file sink.
pub struct FileActionLog {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileActionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl ActionLog for FileActionLog {
    async fn append(&self, kind: &str, fields: Value) {
        let entry = json!({
            "kind": kind,
            "at": Utc::now(),
            "fields": fields,
        });
        let mut line = entry.to_string();
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            error!(kind, error = %e, path = %self.path.display(), "Failed to append action log entry");
        }
    }
}

/// Discards all entries. Used in tests.
pub struct NoopActionLog;

#[async_trait]
impl ActionLog for NoopActionLog {
    async fn append(&self, _kind: &str, _fields: Value) {}
}
