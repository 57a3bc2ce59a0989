use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use roster_sync::config;
use roster_sync::db;
use roster_sync::gateway::HttpGateway;
use roster_sync::model::Patch;
use roster_sync::search::{ScanSearch, SearchQuery, VoterSearch};
use roster_sync::sync::{self, CancelFlag, PullProgress, SyncEngine};

#[derive(Debug, Parser)]
#[command(author, version, about = "Offline voter roster sync and search")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pull remote changes since the last sync
    Pull {
        /// Ignore the stored watermark and fetch everything
        #[arg(long)]
        full: bool,
    },
    /// Upload queued local edits
    Push,
    /// Search the local roster
    Search {
        #[arg(default_value = "")]
        query: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Equality filter, e.g. --filter booth=12 (repeatable)
        #[arg(long = "filter", value_parser = parse_pair)]
        filters: Vec<(String, String)>,
    },
    /// Edit a voter locally and queue the change for push
    Edit {
        id: String,
        /// Field assignment, e.g. --set mobile=98220 (repeatable)
        #[arg(long = "set", value_parser = parse_pair, required = true)]
        fields: Vec<(String, String)>,
    },
    /// Drop local voters, queued edits and the watermark
    Reset,
    /// Show sync status for the configured database
    Status,
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
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
    if let Some(previous) = sync::bind_database(&pool, session.database_id()).await? {
        info!(%previous, current = session.database_id(), "bound database changed");
    }

    let gateway = HttpGateway::new(&cfg.remote.base_url, session.clone())?;
    let engine = SyncEngine::new(pool.clone(), Arc::new(gateway), session.clone())
        .with_normalizer(cfg.normalizer()?)
        .with_page_size(cfg.app.page_size);

    match args.command {
        Command::Pull { full } => {
            let cancel = CancelFlag::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current page");
                    on_interrupt.cancel();
                }
            });

            let mut progress = |p: PullProgress| {
                println!("page {}: {} records ({} total)", p.page, p.batch_size, p.total_so_far);
            };
            let report = if full {
                engine.resync(Some(&mut progress), &cancel).await?
            } else {
                engine.pull(Some(&mut progress), &cancel).await?
            };
            println!(
                "pulled {} records in {} pages{}",
                report.pulled,
                report.pages,
                if report.cancelled { " (cancelled)" } else { "" }
            );
            if report.synthesized_ids > 0 {
                println!("{} records had no stable id", report.synthesized_ids);
            }
        }
        Command::Push => {
            let report = engine.push().await?;
            println!("pushed {}, still queued {}", report.pushed, report.failed);
            for rejected in &report.rejected {
                println!(
                    "rejected {}: {}",
                    rejected.id,
                    rejected.reason.as_deref().unwrap_or("no reason given")
                );
            }
        }
        Command::Search {
            query,
            page,
            limit,
            filters,
        } => {
            let search = ScanSearch::new(pool.clone(), session.clone())
                .with_fields(cfg.search.fields.clone());
            let mut q = SearchQuery::new(query).page(page).page_size(limit);
            for (key, value) in filters {
                q = q.filter(key, value);
            }
            let result = search.search(&q).await?;
            for item in &result.items {
                println!("{}", serde_json::to_string(item)?);
            }
            println!(
                "page {}: {} of {} matches",
                result.page,
                result.items.len(),
                result.total
            );
        }
        Command::Edit { id, fields } => {
            let patch: Patch = fields
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            let record = db::apply_local_edit(&pool, session.database_id(), &id, &patch).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Reset => {
            engine.reset().await?;
            println!("local data for {} cleared", session.database_id());
        }
        Command::Status => {
            let status = engine.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    pool.close().await;
    Ok(())
}
