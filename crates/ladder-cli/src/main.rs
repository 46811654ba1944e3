use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ladder_sync::{stats, CycleStatus, CycleSummary, IngestionPipeline, LadderConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "ladder")]
#[command(about = "Harvest BASIL ladder games and replays into a local store")]
struct Cli {
    /// YAML file layered between the defaults and LADDER_* environment variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive menu (default).
    Menu,
    /// Run one full ingestion cycle and exit.
    Sync {
        /// Stop after this many games.
        #[arg(long)]
        max_games: Option<usize>,
        /// Print the cycle summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Download replays still pending in the store.
    Download {
        #[arg(long)]
        json: bool,
    },
    /// Print statistics about the stored games.
    Stats {
        #[arg(long, default_value_t = 5)]
        top: usize,
        #[arg(long)]
        json: bool,
    },
    /// Run full cycles on a cron schedule until ctrl-c.
    Watch {
        /// Six-field cron expression; overrides LADDER_SYNC_CRON.
        #[arg(long)]
        cron: Option<String>,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").unwrap_or_default() == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }
}

fn print_summary(summary: &CycleSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    let status = match &summary.status {
        CycleStatus::Completed if summary.persist_failures == 0 => "completed".to_string(),
        CycleStatus::Completed => format!("completed with {} persist failure(s)", summary.persist_failures),
        CycleStatus::ScrapeFailed(reason) => format!("scrape failed: {reason}"),
    };
    println!(
        "{status}: run_id={} games={} new={} duplicates={} replays={}/{} in {:.1}s",
        summary.run_id,
        summary.records_total,
        summary.inserted,
        summary.duplicates,
        summary.downloads.succeeded,
        summary.downloads.pending,
        summary.duration().as_secs_f64()
    );
    Ok(())
}

fn finish(summary: CycleSummary, json: bool) -> Result<()> {
    print_summary(&summary, json)?;
    if !summary.succeeded() {
        bail!("cycle {} did not complete cleanly", summary.run_id);
    }
    Ok(())
}

async fn show_stats(pipeline: &IngestionPipeline, top: usize, json: bool) -> Result<()> {
    let records = pipeline.inspect().await?;
    let summary = stats::summarize(&records, top);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render());
    }
    Ok(())
}

async fn run_menu(pipeline: &IngestionPipeline) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    println!("=== BASIL Ladder Harvester ===");
    loop {
        println!("\nWhat would you like to do?");
        println!("1. Load database and show statistics");
        println!("2. Fetch new games (and download new replays)");
        println!("3. Download pending replays");
        println!("4. Exit");
        stdout.write_all(b"Enter your choice (1-4): ").await?;
        stdout.flush().await?;

        let Some(choice) = lines.next_line().await.context("reading menu choice")? else {
            return Ok(());
        };
        // a failed cycle is reported and the menu continues
        match choice.trim() {
            "1" => {
                if let Err(err) = show_stats(pipeline, 5, false).await {
                    eprintln!("statistics unavailable: {err:#}");
                }
            }
            "2" => match pipeline.run_cycle().await {
                Ok(summary) => print_summary(&summary, false)?,
                Err(err) => eprintln!("cycle aborted: {err:#}"),
            },
            "3" => match pipeline.download_pending_only().await {
                Ok(summary) => print_summary(&summary, false)?,
                Err(err) => eprintln!("download aborted: {err:#}"),
            },
            "4" => {
                println!("Exiting.");
                return Ok(());
            }
            _ => println!("Invalid choice. Please try again."),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = LadderConfig::load(cli.config.as_deref())?;

    let command = match cli.command {
        Some(command) => command,
        None if config.scheduler_enabled => Commands::Watch { cron: None },
        None => Commands::Menu,
    };
    if let Commands::Sync {
        max_games: Some(max_games),
        ..
    } = &command
    {
        config.max_games = Some(*max_games);
    }
    info!(
        store = %config.store_path.display(),
        artifacts = %config.artifacts_dir.display(),
        dedup_key = %config.identity_key.describe(),
        "configuration loaded"
    );
    let pipeline = IngestionPipeline::new(&config)?;

    match command {
        Commands::Menu => run_menu(&pipeline).await,
        Commands::Sync { json, .. } => finish(pipeline.run_cycle().await?, json),
        Commands::Download { json } => finish(pipeline.download_pending_only().await?, json),
        Commands::Stats { top, json } => show_stats(&pipeline, top, json).await,
        Commands::Watch { cron } => {
            let cron = cron.unwrap_or_else(|| config.sync_cron.clone());
            ladder_sync::run_scheduled(Arc::new(pipeline), &cron).await
        }
    }
}
