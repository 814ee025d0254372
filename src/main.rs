mod cli;
mod config;
mod engine;
mod error;
mod matching;
mod records;
mod ui;
mod ymgal;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use cli::{Cli, Command};
use config::CrawlConfig;
use engine::{CheckpointStore, QueryMode, Scheduler, WorkItem};
use matching::BestScoreMatcher;
use records::{JsonlSink, SplitSink};
use ymgal::YmgalClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(env_filter(cli.verbose))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match &cli.command {
        Command::Run {
            input,
            output,
            unmatched,
            checkpoint,
            aliases,
            retry_abandoned,
        } => {
            let mut config = CrawlConfig::load(cli.config.as_deref())?;
            cli.apply_overrides(&mut config)?;
            let mode = if *aliases {
                QueryMode::Aliases
            } else {
                QueryMode::Names
            };
            let paths = RunPaths {
                input,
                output,
                unmatched: unmatched.as_deref(),
                checkpoint,
            };
            run(&config, paths, mode, *retry_abandoned).await
        }
        Command::Status { checkpoint } => {
            let snapshot = engine::checkpoint::read(checkpoint)?;
            ui::print_status(checkpoint, &snapshot);
            Ok(())
        }
    }
}

/// `YMCRAWL_LOG` > `RUST_LOG` > `--verbose` (debug) > info.
fn env_filter(verbose: bool) -> EnvFilter {
    if let Ok(directives) = std::env::var("YMCRAWL_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    if verbose {
        EnvFilter::new("info,ymcrawl=debug")
    } else {
        EnvFilter::new("info")
    }
}

struct RunPaths<'a> {
    input: &'a Path,
    output: &'a Path,
    unmatched: Option<&'a Path>,
    checkpoint: &'a Path,
}

async fn run(
    config: &CrawlConfig,
    paths: RunPaths<'_>,
    mode: QueryMode,
    retry_abandoned: bool,
) -> Result<()> {
    let RunPaths {
        input,
        output,
        unmatched,
        checkpoint,
    } = paths;
    let records = records::load_records(input)?;
    let items: Vec<WorkItem> = records
        .into_iter()
        .map(|record| WorkItem::new(record, mode))
        .collect();

    let run_id = Uuid::new_v4();
    let store = CheckpointStore::open(checkpoint, run_id).await?;
    tracing::info!(%run_id, items = items.len(), input = %input.display(), "loaded input");

    let client = YmgalClient::new(&config.api).context("failed to build HTTP client")?;
    // Bad credentials would fail every item; check them once up front.
    client
        .authenticate()
        .await
        .context("archive authentication failed")?;

    let sink = JsonlSink::new(output)?;
    tracing::debug!(output = %sink.path().display(), "appending results");
    let unmatched = unmatched.map(JsonlSink::new).transpose()?;
    let matcher = BestScoreMatcher::new(config.matching.min_score, mode);
    let progress = ui::CrawlProgress::start();
    let mut scheduler = Scheduler::new(client, matcher, store, config)
        .readmit_failed(retry_abandoned)
        .with_progress(progress.bar());

    let stop = CancellationToken::new();
    let on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight requests");
            on_signal.cancel();
        }
    });

    let summary = match unmatched {
        Some(unmatched) => {
            tracing::debug!(unmatched = %unmatched.path().display(), "unmatched rows go to a separate file");
            scheduler
                .run(items, SplitSink::new(sink, unmatched), stop)
                .await?
        }
        None => scheduler.run(items, sink, stop).await?,
    };
    progress.finish(&summary);
    Ok(())
}
