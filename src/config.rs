//! TOML configuration and environment secrets.
//!
//! ```toml
//! [llm]
//! model = "gpt-4o-mini"
//! max_events_per_source = 8
//!
//! [pipeline]
//! output = "./data/events.json"
//!
//! [[pipeline.sources]]
//! key = "support_tickets"
//! domain = "support"
//! path = "./data/inputs/support_tickets.csv"
//!
//! [push]
//! table = "events"
//! batch_size = 200
//!
//! [drive]
//! folder_id = "1AbC..."
//! webhook_address = "https://example.com/api/mcp/drive/webhook"
//!
//! [server]
//! bind = "127.0.0.1:8787"
//! ```
//!
//! Secrets are never read from the file; see [`Secrets::from_env`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::models::InputSource;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub drive: Option<DriveConfig>,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_events")]
    pub max_events_per_source: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: default_llm_base_url(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
            max_events_per_source: default_max_events(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_temperature() -> f64 {
    0.2
}
fn default_max_retries() -> u32 {
    3
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_max_events() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_output")]
    pub output: PathBuf,
    #[serde(default)]
    pub sources: Vec<InputSource>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            sources: Vec::new(),
        }
    }
}

fn default_output() -> PathBuf {
    PathBuf::from("./data/events.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct PushConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_push_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_push_timeout_secs(),
        }
    }
}

fn default_table() -> String {
    "events".to_string()
}
fn default_batch_size() -> usize {
    200
}
fn default_push_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveConfig {
    pub folder_id: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_drive_api_base")]
    pub api_base: String,
    /// Public HTTPS address for change notifications. Enables watch mode.
    #[serde(default)]
    pub webhook_address: Option<String>,
    /// Shared secret echoed back by the provider in `X-Goog-Channel-Token`.
    #[serde(default)]
    pub channel_token: Option<String>,
    #[serde(default = "default_watch_renew_interval_secs")]
    pub watch_renew_interval_secs: u64,
    /// Periodic sync in polling mode; unset means manual/webhook only.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub events_output: Option<PathBuf>,
    #[serde(default = "default_drive_timeout_secs")]
    pub timeout_secs: u64,
}

impl DriveConfig {
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("drive-sync-state.json")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn events_output(&self) -> PathBuf {
        self.events_output
            .clone()
            .unwrap_or_else(|| self.data_dir.join("drive-events.json"))
    }

    /// Watch mode is active only when a webhook address is configured.
    pub fn watch_enabled(&self) -> bool {
        self.webhook_address
            .as_deref()
            .is_some_and(|a| !a.trim().is_empty())
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/drive")
}
fn default_drive_api_base() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}
fn default_watch_renew_interval_secs() -> u64 {
    20 * 60
}
fn default_drive_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

impl Config {
    /// `max_events_per_source`, floor-clamped to 4.
    pub fn max_events_per_source(&self) -> usize {
        self.llm.max_events_per_source.max(4)
    }

    /// `batch_size`, floor-clamped to 1.
    pub fn batch_size(&self) -> usize {
        self.push.batch_size.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            bail!("llm.temperature must be in [0.0, 2.0]");
        }
        if self.llm.max_retries > 10 {
            bail!("llm.max_retries must be <= 10");
        }
        if self.push.max_retries > 10 {
            bail!("push.max_retries must be <= 10");
        }
        if self.push.table.trim().is_empty() {
            bail!("push.table must not be empty");
        }

        let mut seen = HashSet::new();
        for source in &self.pipeline.sources {
            if source.key.trim().is_empty() {
                bail!("pipeline.sources: key must not be empty");
            }
            if !seen.insert(source.key.as_str()) {
                bail!("pipeline.sources: duplicate key '{}'", source.key);
            }
        }

        if let Some(drive) = &self.drive {
            if drive.folder_id.trim().is_empty() {
                bail!("drive.folder_id must not be empty");
            }
            if drive.watch_renew_interval_secs == 0 {
                bail!("drive.watch_renew_interval_secs must be > 0");
            }
            if drive.poll_interval_secs == Some(0) {
                bail!("drive.poll_interval_secs must be > 0 when set");
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

/// Loads `path`, or falls back to defaults when the file does not exist and
/// the path was not given explicitly.
pub fn load_config_or_default(path: &Path, explicit: bool) -> Result<Config> {
    if !explicit && !path.exists() {
        return Ok(Config::default());
    }
    load_config(path)
}

/// Credentials read from the environment.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub openai_api_key: String,
    pub supabase_url: String,
    pub supabase_service_role_key: String,
}

impl Secrets {
    /// Reads `OPENAI_API_KEY`, `SUPABASE_URL` and `SUPABASE_SERVICE_ROLE_KEY`.
    /// Missing variables become empty strings; the operation that needs a
    /// value reports it.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).unwrap_or_default().trim().to_string();
        Self {
            openai_api_key: var("OPENAI_API_KEY"),
            supabase_url: var("SUPABASE_URL"),
            supabase_service_role_key: var("SUPABASE_SERVICE_ROLE_KEY"),
        }
    }
}
