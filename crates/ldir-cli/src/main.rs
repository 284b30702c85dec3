use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ldir_sync::{render_summary, RunOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ldir-populate")]
#[command(about = "Fill empty listing columns from stored scrape output")]
struct Cli {
    /// Log what would be written without updating any record.
    #[arg(long)]
    dry_run: bool,

    /// Only process this table, even if it is disabled in tables.yaml.
    #[arg(long, value_name = "NAME")]
    table: Option<String>,

    /// Read records from a JSON fixture file instead of the database.
    #[arg(long, value_name = "PATH")]
    fixtures: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::info!(dry_run = cli.dry_run, table = ?cli.table, "starting populate run");

    let reports = ldir_sync::run_from_env(RunOptions {
        dry_run: cli.dry_run,
        table: cli.table,
        fixtures: cli.fixtures,
    })
    .await
    .context("populate run failed")?;

    for report in &reports {
        println!("{}\n", render_summary(report));
    }
    println!("populate complete: tables={}", reports.len());

    Ok(())
}
