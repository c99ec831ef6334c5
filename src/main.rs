use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use patch_crawler::config::{Cli, CrawlerConfig};
use patch_crawler::crawler::{self, RunSummary};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "patch_crawler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<RunSummary> {
    let config = CrawlerConfig::from_env(cli).context("invalid configuration")?;
    tracing::debug!(?config, "resolved configuration");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, finishing in-flight requests");
                cancel.cancel();
            }
        }
    });

    let summary = crawler::crawl(&config, &cancel)
        .await
        .context("crawl aborted")?;
    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    if summary.interrupted {
        println!("Download interrupted: {summary}");
    } else {
        println!("Download complete: {summary}");
    }
    for failed in &summary.failed {
        println!("  PR {}: {}", failed.pr, failed.reason);
    }
    if summary.interrupted {
        println!("Rerun with --resume to continue.");
    }
}
