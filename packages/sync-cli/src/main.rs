// Command-line entry point for the sync engine

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use sync_engine::{
    sync_all, CrawlTargetId, PostgresStore, SourceKind, SourceRegistry, SourceSearch, Store,
    SyncLimiters, SyncOptions, UserId,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Config {
    database_url: String,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
        })
    }
}

#[derive(Parser)]
#[command(name = "shiori", about = "Crawl-sync engine for tracked serial content")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl tracked targets and reconcile their chapter updates
    Sync {
        /// Sync a single crawl target instead of everything
        #[arg(long)]
        target_id: Option<i32>,
        /// Restrict the pass to targets owned by this user
        #[arg(long)]
        user_id: Option<i32>,
        /// Drain every page instead of stopping after the latest one
        #[arg(long)]
        full: bool,
    },
    /// Search a source's catalogue for new targets
    Search {
        /// Source to search: mangadex or webtoon
        #[arg(long)]
        source: String,
        /// Owner for any target created from the results
        #[arg(long)]
        user_id: i32,
        query: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sync_engine=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().context("failed to load configuration")?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("../sync-engine/migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool));
    let registry = SourceRegistry::with_defaults().context("failed to build source registry")?;

    match cli.command {
        Command::Sync {
            target_id,
            user_id,
            full,
        } => {
            let options = SyncOptions {
                crawl_target_id: target_id.map(CrawlTargetId),
                user_id: user_id.map(UserId),
                only_latest: !full,
            };
            let outcomes = sync_all(&store, &registry, &SyncLimiters::default(), &options).await?;

            let mut failures = 0usize;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(summary) => tracing::info!(
                        target = %outcome.name,
                        inserted = summary.inserted,
                        updated = summary.updated,
                        unchanged = summary.unchanged,
                        "synced"
                    ),
                    Err(error) => {
                        failures += 1;
                        tracing::error!(target = %outcome.name, error = %error, "sync failed");
                    }
                }
            }
            tracing::info!(
                targets = outcomes.len(),
                failures,
                "sync pass finished"
            );
            if failures > 0 {
                std::process::exit(1);
            }
        }
        Command::Search {
            source,
            user_id,
            query,
        } => {
            let kind = SourceKind::parse(&source)
                .with_context(|| format!("unknown source '{source}'"))?;
            let results = registry
                .search(kind, &SourceSearch::new(query, UserId(user_id)))
                .await?;

            if results.is_empty() {
                println!("no results");
            }
            for target in results {
                println!("{}\t{}", target.name, target.url);
            }
        }
    }

    Ok(())
}
