//! parl-ingest - Parliamentary record ingestion
//!
//! Fetches committees, bills, debates, votes, meetings and speeches from a
//! source adapter and upserts them into the canonical SQLite store keyed by
//! natural key. Batch results are printed as JSON on stdout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use parl_common::config::{self, SourceKind, TomlConfig};
use parl_common::EntityType;
use parl_ingest::adapters::build_adapter;
use parl_ingest::db::verify_references;
use parl_ingest::types::DateRange;
use parl_ingest::{BatchResult, FetchFilters, IngestContext, IngestError};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for parl-ingest
#[derive(Parser, Debug)]
#[command(name = "parl-ingest")]
#[command(about = "Idempotent ingestion of parliamentary records")]
#[command(version)]
struct Cli {
    /// TOML config file (default: platform config dir, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Root folder holding the database when no explicit path is given
    #[arg(long, global = true)]
    root_folder: Option<PathBuf>,

    /// Read records from a JSON fixture instead of the HTTP source
    #[arg(long, global = true, env = "PARL_SOURCE_FILE")]
    source_file: Option<PathBuf>,

    /// Disable the set-based upsert path
    #[arg(long, global = true, env = "PARL_FORCE_FALLBACK")]
    force_fallback: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest one entity type
    Ingest {
        /// committee, bill, debate, vote, meeting or speech
        entity: EntityType,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Ingest every entity type, parents first
    IngestAll {
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Collapse duplicates and enforce natural-key uniqueness (maintenance window only)
    Dedup,
}

#[derive(clap::Args, Debug)]
struct FilterArgs {
    #[arg(long)]
    parliament: Option<u32>,
    #[arg(long)]
    session: Option<u32>,
    /// Items per batch (default: fetch.page_size)
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long, default_value_t = 0)]
    offset: u32,
    /// Earliest date, YYYY-MM-DD
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Latest date, YYYY-MM-DD
    #[arg(long)]
    to: Option<NaiveDate>,
}

impl FilterArgs {
    fn to_filters(&self, config: &TomlConfig) -> FetchFilters {
        FetchFilters {
            parliament: self.parliament,
            session: self.session,
            limit: self.limit.unwrap_or(config.fetch.page_size),
            offset: self.offset,
            date_range: DateRange {
                from: self.from,
                to: self.to,
            },
        }
    }
}

fn init_logging(config: &TomlConfig) -> Result<()> {
    let level = &config.logging.level;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("parl_ingest={level},parl_common={level}").into());

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    // Logs go to stderr; stdout carries the JSON results
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn batch_json(entity_type: EntityType, outcome: &Result<BatchResult, IngestError>) -> serde_json::Value {
    match outcome {
        Ok(result) => json!(result),
        Err(err) => json!({ "entity_type": entity_type, "error": err.to_string() }),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config)?;

    info!("Starting parl-ingest {}", env!("CARGO_PKG_VERSION"));

    if let Some(path) = &cli.source_file {
        config.source.kind = SourceKind::File;
        config.source.path = Some(path.clone());
    }
    if cli.force_fallback {
        config.store.force_fallback = true;
    }

    let root_folder = config::resolve_root_folder(cli.root_folder.as_deref(), &config);
    let db_path = config::resolve_database_path(cli.database.as_deref(), &root_folder, &config);
    info!("Database: {}", db_path.display());

    let ctx = IngestContext::open(&db_path, config)
        .await
        .context("Failed to open store")?;

    match &cli.command {
        Command::Dedup => {
            let report = ctx.dedup().run().await.context("Dedup failed")?;
            let dangling = verify_references(&ctx.pool).await?;
            for finding in dangling.iter().filter(|d| d.count > 0) {
                warn!(table = finding.table, column = finding.column, count = finding.count, "Dangling references");
            }
            print_json(&json!({ "dedup": report, "references": dangling }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Ingest { entity, filters } => {
            let orchestrator = orchestrator_for(&ctx)?;
            let filters = filters.to_filters(&ctx.config);

            let outcome = orchestrator.run(*entity, &filters).await;
            print_json(&batch_json(*entity, &outcome))?;
            Ok(if outcome.is_ok() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::IngestAll { filters } => {
            let orchestrator = orchestrator_for(&ctx)?;
            let filters = filters.to_filters(&ctx.config);

            let outcomes = orchestrator.run_all(&filters).await;
            let any_failed = outcomes.iter().any(|(_, o)| o.is_err());
            let body: Vec<serde_json::Value> = outcomes.iter().map(|(t, o)| batch_json(*t, o)).collect();
            print_json(&json!(body))?;
            Ok(if any_failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
    }
}

/// Orchestrator wired to the configured adapter, cancelled on Ctrl+C
fn orchestrator_for(ctx: &IngestContext) -> Result<parl_ingest::BatchOrchestrator> {
    let adapter = build_adapter(&ctx.config.source, &ctx.config.fetch)?;
    info!(adapter = adapter.name(), "Source adapter ready");
    let orchestrator = ctx.orchestrator(Arc::clone(&adapter))?;

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after the current chunk");
            cancel.cancel();
        }
    });

    Ok(orchestrator)
}
