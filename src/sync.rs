//! Drive sync state machine.
//!
//! A sync run detects changed files in one Drive folder, downloads them,
//! runs extraction over exactly those files and pushes the result:
//!
//! ```text
//! idle ──trigger──▶ running ──(ok | error)──▶ idle
//!        └─ already running: { skipped: true, reason: "sync_in_progress" }
//! ```
//!
//! The mode is fixed at construction:
//!
//! - **polling**: list the folder and compare each file's `modifiedTime`
//!   with the stored per-file watermark.
//! - **watch** (webhook address configured): read the change feed from the
//!   stored page token, and keep a webhook channel registered.
//!
//! File watermarks and the page token are committed only when the whole run
//! succeeds. A failed run records `last_error`, persists state and returns
//! the error; the next trigger retries the same files.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{Config, DriveConfig};
use crate::drive::{DriveFile, DriveProvider, FilePlan};
use crate::error::PipelineError;
use crate::extractor::{run_event_extraction, ExtractionOptions};
use crate::llm::ChatModel;
use crate::models::{make_unique, Domain, InputSource};
use crate::progress::NoProgress;
use crate::pusher::{run_event_push, PushOptions, RowSink};
use crate::state::{DriveSyncState, RunSummary, StateStore, TrackedFile, WatchChannel};

/// A channel expiring within this window is renewed.
const RENEW_AHEAD_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Polling,
    Watch,
}

impl SyncMode {
    pub fn for_config(drive: &DriveConfig) -> Self {
        if drive.watch_enabled() {
            SyncMode::Watch
        } else {
            SyncMode::Polling
        }
    }
}

/// What a sync run needs from the configuration.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub drive: DriveConfig,
    pub table: String,
    pub batch_size: usize,
    pub max_events_per_source: usize,
}

impl SyncSettings {
    /// # Errors
    ///
    /// [`PipelineError::MissingConfig`] when there is no `[drive]` section.
    pub fn from_config(config: &Config) -> Result<Self> {
        let drive = config
            .drive
            .clone()
            .ok_or_else(|| PipelineError::MissingConfig("[drive] section".to_string()))?;
        Ok(Self {
            drive,
            table: config.push.table.clone(),
            batch_size: config.batch_size(),
            max_events_per_source: config.max_events_per_source(),
        })
    }
}

/// Result of a trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SyncOutcome {
    Skipped { skipped: bool, reason: String },
    Completed(RunSummary),
}

impl SyncOutcome {
    fn in_progress() -> Self {
        SyncOutcome::Skipped {
            skipped: true,
            reason: "sync_in_progress".to_string(),
        }
    }
}

/// Notification headers relevant to the webhook entrypoint.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    pub channel_id: Option<String>,
    pub channel_token: Option<String>,
    pub resource_state: Option<String>,
    pub message_number: Option<String>,
}

/// Status snapshot: mode and guard plus the persisted state, flattened.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub mode: SyncMode,
    pub running: bool,
    pub folder_id: String,
    #[serde(flatten)]
    pub state: DriveSyncState,
}

pub struct DriveSync {
    settings: SyncSettings,
    mode: SyncMode,
    provider: Arc<dyn DriveProvider>,
    model: Arc<dyn ChatModel>,
    sink: Arc<dyn RowSink>,
    store: Arc<dyn StateStore>,
    state: tokio::sync::Mutex<DriveSyncState>,
    running: AtomicBool,
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Files to process in one run and the page token to commit on success.
struct Detection {
    files: Vec<(DriveFile, FilePlan)>,
    next_page_token: Option<String>,
}

struct Downloaded {
    file: DriveFile,
    plan: FilePlan,
    source: InputSource,
}

impl DriveSync {
    /// Loads persisted state from `store`; the mode is fixed from here on.
    pub async fn new(
        settings: SyncSettings,
        provider: Arc<dyn DriveProvider>,
        model: Arc<dyn ChatModel>,
        sink: Arc<dyn RowSink>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let state = store.load_state().await?;
        let mode = SyncMode::for_config(&settings.drive);
        tracing::info!(
            mode = ?mode,
            folder_id = %settings.drive.folder_id,
            tracked_files = state.files.len(),
            "drive sync initialised"
        );
        Ok(Self {
            settings,
            mode,
            provider,
            model,
            sink,
            store,
            state: tokio::sync::Mutex::new(state),
            running: AtomicBool::new(false),
        })
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn status(&self) -> SyncStatus {
        SyncStatus {
            mode: self.mode,
            running: self.is_running(),
            folder_id: self.settings.drive.folder_id.clone(),
            state: self.state.lock().await.clone(),
        }
    }

    /// Checks that the target folder exists and is shared with us.
    pub async fn verify_folder(&self) -> Result<()> {
        let folder = self.provider.get_folder(&self.settings.drive.folder_id).await?;
        tracing::info!(folder = %folder.name, "drive folder reachable");
        Ok(())
    }

    /// Runs one sync. Returns `Skipped` without touching state when a run is
    /// already in progress.
    pub async fn process_pending_changes(&self, reason: &str) -> Result<SyncOutcome> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            tracing::info!(reason, "sync already running, trigger skipped");
            return Ok(SyncOutcome::in_progress());
        };

        match self.run_once(reason).await {
            Ok(summary) => Ok(SyncOutcome::Completed(summary)),
            Err(e) => {
                tracing::warn!(reason, error = %format!("{:#}", e), "sync failed");
                let message = format!("{:#}", e);
                if let Err(save_err) = self
                    .update_state(|s| s.last_error = Some(message))
                    .await
                {
                    tracing::warn!(error = %save_err, "failed to persist sync error");
                }
                Err(e)
            }
        }
    }

    async fn run_once(&self, reason: &str) -> Result<RunSummary> {
        let started = Utc::now().to_rfc3339();
        self.state.lock().await.last_run_at = Some(started);

        let detection = self.detect_changes().await?;
        let detected = detection.files.len();
        tracing::info!(reason, detected, mode = ?self.mode, "changes detected");

        if detection.files.is_empty() {
            let summary = RunSummary {
                reason: reason.to_string(),
                finished_at: Utc::now().to_rfc3339(),
                ..Default::default()
            };
            let committed = summary.clone();
            self.update_state(move |s| {
                if let Some(token) = detection.next_page_token {
                    s.page_token = Some(token);
                }
                s.last_error = None;
                s.last_success_at = Some(committed.finished_at.clone());
                s.last_result = Some(committed);
            })
            .await?;
            return Ok(summary);
        }

        let downloaded = self.download_all(detection.files).await?;
        let input_files: Vec<InputSource> =
            downloaded.iter().map(|d| d.source.clone()).collect();

        let output_file = self.settings.drive.events_output();
        let extraction = run_event_extraction(
            &ExtractionOptions {
                input_files,
                output_file: output_file.clone(),
                max_events_per_source: self.settings.max_events_per_source,
            },
            self.model.as_ref(),
            &NoProgress,
        )
        .await?;

        let push = run_event_push(
            &PushOptions {
                input_file: output_file.clone(),
                table: self.settings.table.clone(),
                batch_size: self.settings.batch_size,
            },
            self.sink.as_ref(),
            &NoProgress,
        )
        .await?;

        let finished = Utc::now().to_rfc3339();
        let summary = RunSummary {
            reason: reason.to_string(),
            detected,
            processed: downloaded.len(),
            event_count: extraction.event_count,
            pushed: push.pushed_count,
            output_file: Some(output_file.display().to_string()),
            finished_at: finished.clone(),
        };
        let committed = summary.clone();
        self.update_state(move |s| {
            for d in downloaded {
                s.files.insert(
                    d.file.id.clone(),
                    TrackedFile {
                        name: d.file.name.clone(),
                        modified_time: d.file.modified_time.clone(),
                        domain: d.source.domain.to_string(),
                        file_type: d.plan.source_type.to_string(),
                        local_path: d.source.path.display().to_string(),
                        updated_at: finished.clone(),
                    },
                );
            }
            if let Some(token) = detection.next_page_token {
                s.page_token = Some(token);
            }
            s.last_error = None;
            s.last_success_at = Some(finished);
            s.last_result = Some(committed);
        })
        .await?;

        tracing::info!(
            reason,
            processed = summary.processed,
            events = summary.event_count,
            pushed = summary.pushed,
            "sync complete"
        );
        Ok(summary)
    }

    async fn detect_changes(&self) -> Result<Detection> {
        let stored_token = self.state.lock().await.page_token.clone();
        match (self.mode, stored_token) {
            (SyncMode::Polling, _) => Ok(Detection {
                files: self.changed_in_listing().await?,
                next_page_token: None,
            }),
            (SyncMode::Watch, None) => {
                // No watermark yet: take a start token and process the folder
                // once in full.
                let start = self.provider.start_page_token().await?;
                Ok(Detection {
                    files: self.changed_in_listing().await?,
                    next_page_token: Some(start),
                })
            }
            (SyncMode::Watch, Some(token)) => self.changed_in_feed(token).await,
        }
    }

    async fn changed_in_listing(&self) -> Result<Vec<(DriveFile, FilePlan)>> {
        let listing = self
            .provider
            .list_folder_files(&self.settings.drive.folder_id)
            .await?;
        let state = self.state.lock().await;
        Ok(listing
            .into_iter()
            .filter(|f| !f.trashed)
            .filter_map(|f| FilePlan::for_file(&f).map(|plan| (f, plan)))
            .filter(|(f, _)| state.is_changed(&f.id, &f.modified_time))
            .collect())
    }

    async fn changed_in_feed(&self, start_token: String) -> Result<Detection> {
        let folder_id = &self.settings.drive.folder_id;
        let mut by_id: BTreeMap<String, (DriveFile, FilePlan)> = BTreeMap::new();
        let mut token = start_token;
        let mut new_start: Option<String> = None;

        loop {
            let page = self.provider.list_changes(&token).await?;
            for change in page.changes {
                if change.removed {
                    continue;
                }
                let Some(file) = change.file else { continue };
                if file.trashed || !file.parents.iter().any(|p| p == folder_id) {
                    continue;
                }
                if let Some(plan) = FilePlan::for_file(&file) {
                    by_id.insert(file.id.clone(), (file, plan));
                }
            }
            if page.new_start_page_token.is_some() {
                new_start = page.new_start_page_token;
            }
            match page.next_page_token {
                Some(next) => token = next,
                None => break,
            }
        }

        Ok(Detection {
            files: by_id.into_values().collect(),
            next_page_token: new_start,
        })
    }

    async fn download_all(&self, files: Vec<(DriveFile, FilePlan)>) -> Result<Vec<Downloaded>> {
        let dir = self.settings.drive.downloads_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut keys = HashSet::new();
        let mut out = Vec::with_capacity(files.len());
        for (file, plan) in files {
            let bytes = match plan.export_mime {
                Some(mime) => self.provider.export(&file.id, mime).await,
                None => self.provider.download(&file.id).await,
            }
            .with_context(|| format!("Failed to fetch Drive file '{}' ({})", file.name, file.id))?;

            let path: PathBuf = dir.join(format!("{}_{}", file.id, plan.local_name(&file)));
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::debug!(file_id = %file.id, bytes = bytes.len(), path = %path.display(), "downloaded");

            let source = InputSource {
                key: make_unique(source_key_for(&file.name), &mut keys),
                domain: infer_domain(&file.name),
                path,
                source_type: Some(plan.source_type),
            };
            out.push(Downloaded { file, plan, source });
        }
        Ok(out)
    }

    /// Makes sure a webhook channel is registered (watch mode only).
    ///
    /// Creates one when none exists, when `force` is set, or when the current
    /// one expires within five minutes. Returns the active channel.
    pub async fn ensure_watch_channel(&self, force: bool) -> Result<Option<WatchChannel>> {
        self.ensure_channel_within(force, ChronoDuration::minutes(RENEW_AHEAD_MINUTES))
            .await
    }

    async fn ensure_channel_within(
        &self,
        force: bool,
        window: ChronoDuration,
    ) -> Result<Option<WatchChannel>> {
        if self.mode != SyncMode::Watch {
            return Ok(None);
        }
        let Some(address) = self.settings.drive.webhook_address.clone() else {
            return Ok(None);
        };

        let (current, page_token) = {
            let s = self.state.lock().await;
            (s.watch_channel.clone(), s.page_token.clone())
        };
        if let Some(channel) = current {
            if !force && !expires_within(&channel, Utc::now(), window) {
                return Ok(Some(channel));
            }
        }

        // Without a stored watermark, watch from a fresh start token but
        // leave `page_token` unset so the next run does its full listing.
        let token = match page_token {
            Some(t) => t,
            None => self.provider.start_page_token().await?,
        };
        let channel_id = uuid::Uuid::new_v4().to_string();
        let channel = self
            .provider
            .watch_changes(
                &token,
                &channel_id,
                &address,
                self.settings.drive.channel_token.as_deref(),
            )
            .await
            .context("Failed to register Drive watch channel")?;

        tracing::info!(
            channel_id = %channel.id,
            expiration = ?channel.expiration,
            forced = force,
            "watch channel registered"
        );
        let stored = channel.clone();
        self.update_state(move |s| s.watch_channel = Some(stored)).await?;
        Ok(Some(channel))
    }

    /// Webhook entrypoint. Never fails: malformed or unauthorised calls are
    /// ignored with a reason, and run errors are reported in the body.
    pub async fn handle_webhook(&self, headers: &WebhookHeaders) -> Value {
        if let Some(expected) = self
            .settings
            .drive
            .channel_token
            .as_deref()
            .filter(|t| !t.is_empty())
        {
            let given = headers.channel_token.as_deref().unwrap_or("");
            if !token_matches(expected, given) {
                return ignored("invalid_channel_token");
            }
        }

        let resource_state = match headers.resource_state.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return ignored("missing_resource_state"),
        };
        if resource_state == "sync" {
            return ignored("sync_handshake");
        }

        tracing::info!(
            resource_state = %resource_state,
            channel_id = ?headers.channel_id,
            message_number = ?headers.message_number,
            "drive notification"
        );
        match self
            .process_pending_changes(&format!("webhook:{}", resource_state))
            .await
        {
            Ok(outcome) => json!({ "ok": true, "result": outcome }),
            Err(e) => json!({ "ok": false, "error": format!("{:#}", e) }),
        }
    }

    /// Verifies the folder, registers the watch channel if needed, and
    /// spawns the renewal (watch) or poll (polling) timer.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        self.verify_folder().await?;
        let mut handles = Vec::new();

        match self.mode {
            SyncMode::Watch => {
                self.ensure_watch_channel(false).await?;
                let every = Duration::from_secs(self.settings.drive.watch_renew_interval_secs);
                // Renew anything that would lapse before the next tick.
                let window = ChronoDuration::minutes(RENEW_AHEAD_MINUTES)
                    + ChronoDuration::seconds(every.as_secs() as i64);
                let this = Arc::clone(self);
                handles.push(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(every);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        if let Err(e) = this.ensure_channel_within(false, window).await {
                            tracing::warn!(error = %format!("{:#}", e), "watch channel renewal failed");
                        }
                    }
                }));
            }
            SyncMode::Polling => {
                if let Some(secs) = self.settings.drive.poll_interval_secs {
                    let this = Arc::clone(self);
                    handles.push(tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(Duration::from_secs(secs));
                        ticker.tick().await;
                        loop {
                            ticker.tick().await;
                            if let Err(e) = this.process_pending_changes("poll").await {
                                tracing::warn!(error = %format!("{:#}", e), "scheduled sync failed");
                            }
                        }
                    }));
                }
            }
        }
        Ok(handles)
    }

    /// Applies `f` to the state and persists it while the lock is held, so
    /// saves from a run and from channel renewal cannot interleave.
    async fn update_state<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut DriveSyncState),
    {
        let mut state = self.state.lock().await;
        f(&mut state);
        self.store.save_state(&state).await
    }
}

fn ignored(reason: &str) -> Value {
    json!({ "ok": false, "ignored": true, "reason": reason })
}

fn expires_within(channel: &WatchChannel, now: DateTime<Utc>, window: ChronoDuration) -> bool {
    match channel.expiration.and_then(DateTime::<Utc>::from_timestamp_millis) {
        Some(expiry) => expiry <= now + window,
        None => false,
    }
}

/// Compares SHA-256 digests of both tokens without early exit.
fn token_matches(expected: &str, given: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(given.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Domain from file-name keywords, checked in order; `operations` otherwise.
pub fn infer_domain(file_name: &str) -> Domain {
    let name = file_name.to_lowercase();
    let has_any = |words: &[&str]| words.iter().any(|w| name.contains(w));
    if has_any(&["support", "ticket", "customer"]) {
        Domain::Support
    } else if has_any(&["finance", "procurement", "budget"]) {
        Domain::Finance
    } else {
        Domain::Operations
    }
}

/// `drive_<slug of the file stem>`.
fn source_key_for(file_name: &str) -> String {
    let stem = std::path::Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let mut slug = String::with_capacity(stem.len());
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "drive_file".to_string()
    } else {
        format!("drive_{}", slug)
    }
}
