//! Persisted Drive sync state and the stores that hold it.
//!
//! The state is one JSON document, rewritten wholesale after every mutation.
//! [`JsonFileStore`] writes a sibling temp file and renames it over the
//! target, so readers never observe a partial write. [`MemoryStore`] keeps
//! the document in memory for tests and one-shot runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A registered change-notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchChannel {
    pub id: String,
    #[serde(rename = "resourceId")]
    pub resource_id: String,
    #[serde(rename = "resourceUri", default)]
    pub resource_uri: Option<String>,
    /// Expiration in milliseconds since the Unix epoch.
    #[serde(default)]
    pub expiration: Option<i64>,
    pub address: String,
    pub created_at: String,
}

/// Watermark entry for one Drive file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub name: String,
    #[serde(rename = "modifiedTime")]
    pub modified_time: String,
    pub domain: String,
    #[serde(rename = "type")]
    pub file_type: String,
    #[serde(rename = "localPath")]
    pub local_path: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

/// Outcome of the last completed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub reason: String,
    pub detected: usize,
    pub processed: usize,
    pub event_count: usize,
    pub pushed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    pub finished_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveSyncState {
    pub page_token: Option<String>,
    pub watch_channel: Option<WatchChannel>,
    /// Keyed by Drive file id. Entries are updated in place, never removed.
    pub files: BTreeMap<String, TrackedFile>,
    pub last_run_at: Option<String>,
    pub last_success_at: Option<String>,
    pub last_error: Option<String>,
    pub last_result: Option<RunSummary>,
}

impl DriveSyncState {
    /// New file, or `modified_time` strictly newer than the stored watermark.
    pub fn is_changed(&self, file_id: &str, modified_time: &str) -> bool {
        match self.files.get(file_id) {
            None => true,
            Some(tracked) => is_newer(modified_time, &tracked.modified_time),
        }
    }
}

/// Compares RFC 3339 timestamps; falls back to string order when either
/// side does not parse.
fn is_newer(candidate: &str, stored: &str) -> bool {
    use chrono::DateTime;
    match (
        DateTime::parse_from_rfc3339(candidate),
        DateTime::parse_from_rfc3339(stored),
    ) {
        (Ok(a), Ok(b)) => a > b,
        _ => candidate > stored,
    }
}

/// Load/save seam for the sync state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the stored state, or the default when nothing is stored yet.
    async fn load_state(&self) -> Result<DriveSyncState>;

    async fn save_state(&self, state: &DriveSyncState) -> Result<()>;
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load_state(&self) -> Result<DriveSyncState> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DriveSyncState::default())
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read sync state: {}", self.path.display())
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(DriveSyncState::default());
        }
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse sync state: {}", self.path.display()))
    }

    async fn save_state(&self, state: &DriveSyncState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace sync state: {}", self.path.display()))?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state.json".into());
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<DriveSyncState>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn with_state(state: DriveSyncState) -> Self {
        Self {
            state: Mutex::new(state),
            saves: Mutex::new(0),
        }
    }

    /// Number of `save_state` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }

    pub fn snapshot(&self) -> DriveSyncState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_state(&self) -> Result<DriveSyncState> {
        Ok(self.snapshot())
    }

    async fn save_state(&self, state: &DriveSyncState) -> Result<()> {
        if let Ok(mut s) = self.state.lock() {
            *s = state.clone();
        }
        if let Ok(mut n) = self.saves.lock() {
            *n += 1;
        }
        Ok(())
    }
}
