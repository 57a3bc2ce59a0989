use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use roster_sync::config;
use roster_sync::db;
use roster_sync::gateway::parse_page;
use roster_sync::import;
use roster_sync::sync;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Import voter rows from a JSON file as local edits queued for push"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// JSON array of rows, or an object with an `items` array
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let session = cfg.session();
    sync::bind_database(&pool, session.database_id()).await?;
    let normalizer = cfg.normalizer()?;

    let body = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let rows = parse_page(&body, 0)
        .with_context(|| format!("unrecognised import format in {}", args.input.display()))?
        .items;
    info!(rows = rows.len(), "importing rows");

    let report = import::import_rows(&pool, session.database_id(), &normalizer, &rows).await?;
    let imported = report.imported;
    let pending = db::count_outbox(&pool, session.database_id()).await?;
    info!(imported, pending, "import complete; run `roster-sync push` to upload");
    println!("imported {imported} rows, {pending} changes queued");

    pool.close().await;
    Ok(())
}
