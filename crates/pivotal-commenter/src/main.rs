use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pivotal_commenter::commenter::{Commenter, PollSchedule};
use pivotal_commenter::config::CommenterConfig;
use pivotal_commenter::tracker::PivotalClient;
use tracing::info;

/// Watch Pivotal Tracker story comments for an outdated phrase and post corrections.
#[derive(Parser, Debug)]
#[command(name = "pivotal-commenter", version, about)]
struct Cli {
    /// Optional TOML config file; environment variables override its values.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Optional `KEY=VALUE` file for variables not set in the environment.
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Run a single iteration and exit.
    #[arg(long)]
    once: bool,

    /// Log corrections without posting them.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = CommenterConfig::load(cli.config.as_deref(), cli.env_file.as_deref())
        .context("Invalid configuration")?
        .with_dry_run(cli.dry_run);

    info!(
        project_id = config.project_id,
        filter = %config.story_filter(),
        interval_secs = config.poll_interval.as_secs(),
        dry_run = config.dry_run,
        "Pivotal commenter starting"
    );

    let tracker = PivotalClient::new(config.api_base_url.as_str(), config.auth_token.as_str());
    let commenter = Commenter::new(&tracker, &config);

    if cli.once {
        let report = commenter.run_once().await;
        info!(
            stories = report.stories_seen,
            posted = report.corrections_posted,
            failures = report.failures.len(),
            "Single iteration complete"
        );
        return Ok(());
    }

    commenter
        .run(PollSchedule::forever(config.poll_interval))
        .await;

    Ok(())
}
