use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use fireworks_geocoder::config::AppConfig;
use fireworks_geocoder::ingestion::load_raw_events;
use fireworks_geocoder::normalizer::TextKind;
use fireworks_geocoder::update::{load_snapshot, publish_report, ProgressObserver, UpdateProgress};
use fireworks_geocoder::{init_tracing, mappable_events, AppState};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a file of scraped events and publish them to the key-value store
    Update {
        /// `.json` array of events or `.csv` schedule rows
        #[arg(long)]
        input: PathBuf,
        /// Also write the resolved events to this file
        #[arg(long)]
        output: Option<PathBuf>,
        /// Skip publishing to the key-value store
        #[arg(long)]
        no_publish: bool,
    },
    /// Resolve a single address
    Resolve {
        address: String,
        #[arg(long, default_value = "")]
        purpose: String,
    },
    /// Repair the spacing of one or more strings through the text-fix queue
    Fix {
        texts: Vec<String>,
        /// Treat the texts as event purposes instead of addresses
        #[arg(long)]
        purpose: bool,
    },
    /// Print the published events that can be placed on a map
    Events,
    /// Print the effective configuration without secrets
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let state = AppState::initialize(AppConfig::from_env())
        .context("failed to initialize pipeline")?;

    match cli.command {
        Command::Update {
            input,
            output,
            no_publish,
        } => {
            let events = load_raw_events(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let observer: ProgressObserver = Arc::new(|progress: UpdateProgress| {
                info!(
                    processed = progress.processed,
                    total = progress.total,
                    resolved = progress.resolved,
                    "progress"
                );
            });
            let report = state.updater().run(&events, Some(observer)).await;

            if let Some(path) = output {
                fs::write(&path, serde_json::to_string_pretty(&report.events)?)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
            if !no_publish {
                publish_report(state.store().as_ref(), &report).await;
            }
            println!(
                "{}",
                serde_json::json!({
                    "events": report.events.len(),
                    "resolved": report.resolved,
                    "unresolved": report.unresolved,
                    "cacheHits": report.cache_hits,
                    "timestamp": report.timestamp,
                })
            );
        }
        Command::Resolve { address, purpose } => {
            let resolution = state.orchestrator().attempt(&address, &purpose).await;
            println!("{}", serde_json::to_string_pretty(&resolution)?);
        }
        Command::Fix { texts, purpose } => {
            let kind = if purpose {
                TextKind::Purpose
            } else {
                TextKind::Address
            };
            let queue = state.text_queue(kind);
            let fixes = futures_util::future::join_all(texts.iter().map(|text| queue.enqueue(text))).await;
            for (text, fixed) in texts.iter().zip(fixes) {
                match fixed {
                    Ok(fixed) => println!("{text} => {fixed}"),
                    Err(err) => println!("{text} => {} (fix failed: {err})", kind.normalize(text)),
                }
            }
        }
        Command::Events => {
            let snapshot = load_snapshot(state.store().as_ref()).await;
            let bounds = state.config().bounds;
            let mappable: Vec<_> = mappable_events(&snapshot.events, &bounds).collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "lastUpdated": snapshot.last_updated,
                    "total": snapshot.events.len(),
                    "events": mappable,
                }))?
            );
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&state.health())?);
        }
    }

    Ok(())
}
