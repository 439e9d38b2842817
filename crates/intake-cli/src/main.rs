use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use intake_core::{PipelinePhase, ProductMatch, RunSummary};
use intake_feed::{collect_images, load_feed_file, validate_feed};
use intake_match::MatchingEngine;
use intake_pipeline::{
    CommitOutcome, DuplicateDecision, IngestRun, IntakeConfig, IntakeServices, TracingProgress,
};
use intake_storage::{MemoryCatalogRepository, MemoryObjectStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "intake")]
#[command(about = "Catalog intake: match product images to a feed and ingest them")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate the feed and show how each image would be matched.
    Match {
        #[arg(long)]
        images: PathBuf,
        #[arg(long)]
        feed: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Match, upload, and persist a catalog for one owner.
    Ingest {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        images: PathBuf,
        #[arg(long)]
        feed: PathBuf,
        #[arg(long, value_enum, default_value_t = OnDuplicates::Cancel)]
        on_duplicates: OnDuplicates,
        /// Use in-memory stores instead of Postgres and the configured object store.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create the catalog table.
    Migrate,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnDuplicates {
    Continue,
    Cancel,
}

impl From<OnDuplicates> for DuplicateDecision {
    fn from(value: OnDuplicates) -> Self {
        match value {
            OnDuplicates::Continue => DuplicateDecision::Continue,
            OnDuplicates::Cancel => DuplicateDecision::Cancel,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = IntakeConfig::from_env();

    match cli.command {
        Commands::Match { images, feed, json } => run_match(&config, images, feed, json),
        Commands::Ingest {
            owner,
            images,
            feed,
            on_duplicates,
            dry_run,
        } => run_ingest(&config, owner, images, feed, on_duplicates.into(), dry_run).await,
        Commands::Migrate => {
            let repo = config.catalog_repository().await?;
            repo.ensure_schema().await.context("creating catalog schema")?;
            println!("migrate complete: catalog_products ready");
            Ok(())
        }
    }
}

fn run_match(config: &IntakeConfig, images: PathBuf, feed: PathBuf, json: bool) -> Result<()> {
    let images = collect_images(&images)?;
    let validated = validate_feed(load_feed_file(&feed)?);
    for rejection in &validated.rejections {
        eprintln!(
            "row {} ({}) rejected: {}",
            rejection.row,
            rejection.sku.as_deref().unwrap_or("-"),
            rejection.reason
        );
    }

    let engine = MatchingEngine::new(config.match_policy()?)?;
    let matches = engine.match_images(&images, &validated.records);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&matches).context("serializing matches")?
        );
    } else {
        print_match_table(&matches);
    }
    Ok(())
}

fn print_match_table(matches: &[ProductMatch]) {
    println!("{:<40} {:<9} {:>5}  {:<16} secondaries", "file", "type", "score", "sku");
    for m in matches {
        let secondaries = m
            .secondary_images
            .iter()
            .map(|i| i.file_name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{:<40} {:<9} {:>5}  {:<16} {}",
            m.image.file_name,
            m.match_type,
            m.match_score,
            m.sku().unwrap_or("-"),
            secondaries
        );
    }
}

async fn run_ingest(
    config: &IntakeConfig,
    owner: String,
    images: PathBuf,
    feed: PathBuf,
    on_duplicates: DuplicateDecision,
    dry_run: bool,
) -> Result<()> {
    let images = collect_images(&images)?;
    let rows = load_feed_file(&feed)?;

    let services = if dry_run {
        IntakeServices::new(
            Arc::new(MemoryCatalogRepository::new()),
            Arc::new(MemoryObjectStore::new("memory://dry-run")),
        )
    } else {
        IntakeServices::new(config.catalog_repository().await?, config.object_store()?)
    }
    .with_progress(Arc::new(TracingProgress));

    let mut run = IngestRun::new(owner, config.run_settings()?, services);
    let matches = run.start_matching(images, rows)?;
    info!(
        run_id = %run.run_id(),
        matched = matches.iter().filter(|m| m.is_matched()).count(),
        unmatched = matches.iter().filter(|m| !m.is_matched()).count(),
        rejected_rows = run.rejections().len(),
        dry_run,
        "matching done"
    );

    let outcome = match run.commit().await? {
        CommitOutcome::NeedsConfirmation(duplicates) => {
            for duplicate in &duplicates {
                eprintln!(
                    "duplicate sku {} (existing product {})",
                    duplicate.sku, duplicate.existing_product_id
                );
            }
            run.resolve_duplicates(on_duplicates).await?
        }
        other => other,
    };

    match outcome {
        CommitOutcome::Finished(summary) => print_summary(&summary),
        CommitOutcome::Cancelled => {
            println!("ingest cancelled: duplicates found, nothing was uploaded");
        }
        CommitOutcome::NeedsConfirmation(duplicates) => {
            bail!("{} duplicate skus left unresolved", duplicates.len())
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "ingest complete: run_id={} outcome={} succeeded={} failed={} skipped_duplicates={} unmatched={} rejected_rows={}",
        summary.run_id,
        summary.phase,
        summary.succeeded,
        summary.failed,
        summary.skipped_duplicates,
        summary.unmatched,
        summary.rejected_rows
    );
    if summary.phase == PipelinePhase::PartiallyFailed {
        for failure in &summary.failures {
            println!("  retry {} ({:?}): {}", failure.sku, failure.stage, failure.error);
        }
    }
}
