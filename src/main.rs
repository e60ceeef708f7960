//! # Event Harvest CLI (`harvest`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest generate-events` | Build digests for configured sources and extract events |
//! | `harvest push-events` | Upsert an extraction document into the events table |
//! | `harvest run-pipeline` | `generate-events` then `push-events` |
//! | `harvest digest <path>` | Print the evidence digest for one file (no LLM call) |
//! | `harvest sync` | Run one Drive sync |
//! | `harvest serve` | Start the HTTP control surface and sync timers |
//!
//! ## Examples
//!
//! ```bash
//! export OPENAI_API_KEY=... SUPABASE_URL=... SUPABASE_SERVICE_ROLE_KEY=...
//!
//! harvest --config ./config/harvest.toml generate-events --max-events 6
//! harvest push-events --file ./data/events.json --batch 100
//! harvest digest ./data/inputs/alerts.json --domain operations
//! harvest serve --log-json
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use event_harvest::config::{load_config_or_default, Config, Secrets};
use event_harvest::digest::build_evidence_digest;
use event_harvest::drive::GoogleDriveClient;
use event_harvest::extractor::{run_event_extraction, ExtractionOptions};
use event_harvest::llm::OpenAiChatClient;
use event_harvest::models::{Domain, InputSource, SourceType};
use event_harvest::progress::ProgressMode;
use event_harvest::pusher::{run_event_push, PostgrestSink, PushOptions};
use event_harvest::server::run_server;
use event_harvest::state::JsonFileStore;
use event_harvest::sync::{DriveSync, SyncSettings};

const DEFAULT_CONFIG: &str = "./config/harvest.toml";

/// Event Harvest: evidence digests, LLM event extraction, and upserts.
///
/// Secrets come from the environment (`OPENAI_API_KEY`, `SUPABASE_URL`,
/// `SUPABASE_SERVICE_ROLE_KEY`, and the Google Drive credentials).
#[derive(Parser)]
#[command(name = "harvest", version, about = "Extract business events from raw files with an LLM")]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when the default
    /// path does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    /// Progress output on stderr: off, human, json. Default: human when
    /// stderr is a TTY, else off.
    #[arg(long, global = true, value_parser = ["off", "human", "json"])]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract events from every `[[pipeline.sources]]` entry.
    GenerateEvents {
        /// Override `[llm].model`.
        #[arg(long)]
        model: Option<String>,

        /// Override `[pipeline].output`.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Override `[llm].max_events_per_source` (minimum 4).
        #[arg(long)]
        max_events: Option<usize>,
    },

    /// Upsert an extraction document into the events table.
    PushEvents {
        /// Extraction document. Defaults to `[pipeline].output`.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Override `[push].table`.
        #[arg(long)]
        table: Option<String>,

        /// Override `[push].batch_size`.
        #[arg(long)]
        batch: Option<usize>,
    },

    /// Generate events, then push them.
    RunPipeline {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        max_events: Option<usize>,
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        batch: Option<usize>,
    },

    /// Print the evidence digest for one file as JSON.
    Digest {
        path: PathBuf,

        /// Source key. Defaults to the file stem.
        #[arg(long)]
        key: Option<String>,

        #[arg(long, default_value = "operations")]
        domain: String,

        /// Type hint (csv, xlsx, json, docx); otherwise the extension decides.
        #[arg(long = "type")]
        source_type: Option<String>,
    },

    /// Run one Drive sync and print the outcome.
    Sync,

    /// Start the HTTP control surface and the Drive sync timers.
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (config_path, explicit) = match &cli.config {
        Some(p) => (p.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };
    let progress_mode = match cli.progress.as_deref() {
        Some(v) => ProgressMode::parse(v).unwrap_or(ProgressMode::Off),
        None => ProgressMode::default_for_tty(),
    };

    // `digest` reads only the file it is given.
    if let Commands::Digest {
        path,
        key,
        domain,
        source_type,
    } = &cli.command
    {
        return print_digest(path, key.as_deref(), domain, source_type.as_deref());
    }

    let cfg = load_config_or_default(&config_path, explicit)?;
    let secrets = Secrets::from_env();

    match cli.command {
        Commands::GenerateEvents {
            model,
            output,
            max_events,
        } => {
            generate(&cfg, &secrets, model, output, max_events, progress_mode).await?;
        }
        Commands::PushEvents { file, table, batch } => {
            let file = file.unwrap_or_else(|| cfg.pipeline.output.clone());
            push(&cfg, &secrets, file, table, batch, progress_mode).await?;
        }
        Commands::RunPipeline {
            model,
            output,
            max_events,
            table,
            batch,
        } => {
            let output_file =
                generate(&cfg, &secrets, model, output, max_events, progress_mode).await?;
            push(&cfg, &secrets, output_file, table, batch, progress_mode).await?;
        }
        Commands::Sync => {
            let sync = build_sync(&cfg, &secrets).await?;
            sync.verify_folder().await?;
            let outcome = sync.process_pending_changes("cli").await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Serve => {
            let sync = build_sync(&cfg, &secrets).await?;
            run_server(&cfg, sync).await?;
        }
        Commands::Digest { .. } => {}
    }

    Ok(())
}

async fn generate(
    cfg: &Config,
    secrets: &Secrets,
    model: Option<String>,
    output: Option<PathBuf>,
    max_events: Option<usize>,
    progress_mode: ProgressMode,
) -> Result<PathBuf> {
    let mut client = OpenAiChatClient::new(&cfg.llm, &secrets.openai_api_key)?;
    if let Some(m) = model {
        client = client.with_model(&m);
    }
    if cfg.pipeline.sources.is_empty() {
        bail!("no input sources configured; add [[pipeline.sources]] entries to the config");
    }

    let options = ExtractionOptions {
        input_files: cfg.pipeline.sources.clone(),
        output_file: output.unwrap_or_else(|| cfg.pipeline.output.clone()),
        max_events_per_source: max_events
            .unwrap_or(cfg.max_events_per_source())
            .max(4),
    };
    let reporter = progress_mode.reporter();
    let outcome = run_event_extraction(&options, &client, reporter.as_ref()).await?;

    println!(
        "Wrote {} events from {} sources to {}",
        outcome.event_count,
        outcome.output.source_runs.len(),
        outcome.output_file.display()
    );
    Ok(outcome.output_file)
}

async fn push(
    cfg: &Config,
    secrets: &Secrets,
    file: PathBuf,
    table: Option<String>,
    batch: Option<usize>,
    progress_mode: ProgressMode,
) -> Result<()> {
    let sink = PostgrestSink::new(
        &secrets.supabase_url,
        &secrets.supabase_service_role_key,
        &cfg.push,
    )?;
    let options = PushOptions {
        input_file: file,
        table: table.unwrap_or_else(|| cfg.push.table.clone()),
        batch_size: batch.unwrap_or(cfg.batch_size()).max(1),
    };
    let reporter = progress_mode.reporter();
    let report = run_event_push(&options, &sink, reporter.as_ref()).await?;

    println!(
        "Pushed {} rows in {} batches to '{}'",
        report.pushed_count, report.batches, report.table
    );
    Ok(())
}

fn print_digest(
    path: &Path,
    key: Option<&str>,
    domain: &str,
    source_type: Option<&str>,
) -> Result<()> {
    let key = match key {
        Some(k) => k.to_string(),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string()),
    };
    let source = InputSource {
        key,
        domain: domain.parse::<Domain>()?,
        path: path.to_path_buf(),
        source_type: source_type.map(|t| t.parse::<SourceType>()).transpose()?,
    };
    let digest = build_evidence_digest(&source)?;
    println!("{}", serde_json::to_string_pretty(&digest)?);
    Ok(())
}

async fn build_sync(cfg: &Config, secrets: &Secrets) -> Result<Arc<DriveSync>> {
    let settings = SyncSettings::from_config(cfg)?;
    let provider = Arc::new(GoogleDriveClient::from_env(&settings.drive)?);
    let model = Arc::new(OpenAiChatClient::new(&cfg.llm, &secrets.openai_api_key)?);
    let sink = Arc::new(PostgrestSink::new(
        &secrets.supabase_url,
        &secrets.supabase_service_role_key,
        &cfg.push,
    )?);
    let store = Arc::new(JsonFileStore::new(settings.drive.state_path()));
    let sync = DriveSync::new(settings, provider, model, sink, store).await?;
    Ok(Arc::new(sync))
}
