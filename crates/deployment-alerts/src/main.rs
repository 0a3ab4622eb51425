//! deployment-alerts CLI - deliver deduplicated indexing alerts to Discord.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use deployment_alerts::{
    AlertEngine, DeploymentFindings, DiscordClient, EngineConfig, GitHubIssueTracker,
    HistoryPaginator, SuppressionMode, TokioDelay, WebhookForwarder,
};

/// Deliver deduplicated, rate-limited deployment alerts.
#[derive(Parser)]
#[command(name = "deployment-alerts")]
#[command(about = "Deduplicated Discord alerting for indexing deployments")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Root alert channel
    #[arg(long, global = true, env = "DISCORD_CHANNEL_ID")]
    channel_id: Option<String>,

    /// Aggregate summary channel for production deployments
    #[arg(long, global = true, env = "DISCORD_PROD_CHANNEL_ID")]
    prod_channel_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one alert cycle over a findings file
    Run {
        /// JSON array of deployment findings
        #[arg(long)]
        findings: PathBuf,

        /// How level findings are matched against earlier alerts (issue-type, issue-value)
        #[arg(long, env = "ALERT_SUPPRESSION_MODE")]
        suppression_mode: Option<SuppressionMode>,
    },

    /// Delete alerts older than the retention period
    Prune {
        /// Retention in days
        #[arg(long, env = "ALERT_RETENTION_DAYS")]
        retention_days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let mut config = EngineConfig::default();
    if cli.channel_id.is_some() {
        config.root_channel_id = cli.channel_id;
    }
    if cli.prod_channel_id.is_some() {
        config.prod_channel_id = cli.prod_channel_id;
    }

    match cli.command {
        Commands::Run {
            findings,
            suppression_mode,
        } => {
            if let Some(mode) = suppression_mode {
                config.suppression_mode = mode;
            }
            let deployments = load_findings(&findings)?;
            let mut engine = build_engine(&config)?;

            info!(deployments = deployments.len(), "Starting alert cycle");
            let report = engine.run_cycle(&deployments, chrono::Utc::now()).await;
            info!(
                delivered = report.delivered,
                already_delivered = report.already_delivered,
                dropped = report.dropped,
                summaries = report.aggregate.posted,
                "Alert cycle complete"
            );
        }
        Commands::Prune { retention_days } => {
            if let Some(days) = retention_days.filter(|d| *d > 0) {
                config.retention_days = days;
            }
            let mut engine = build_engine(&config)?;
            let report = engine.cleanup(chrono::Utc::now()).await;
            info!(
                channels = report.channels,
                deleted = report.deleted,
                failed = report.failed,
                "Prune complete"
            );
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("deployment_alerts=debug,info")
        } else {
            EnvFilter::new("deployment_alerts=info,warn")
        }
    });

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn load_findings(path: &Path) -> Result<Vec<DeploymentFindings>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read findings file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse findings file {}", path.display()))
}

fn build_engine(config: &EngineConfig) -> Result<AlertEngine> {
    let token = config
        .discord_token
        .as_deref()
        .context("DISCORD_BOT_TOKEN is not set")?;
    let client = Arc::new(DiscordClient::new(token, &config.api_base)?);
    let delay = Arc::new(TokioDelay);

    let mut engine = AlertEngine::new(client.clone(), delay.clone(), config)?;

    match (&config.github_token, &config.issues_repo) {
        (Some(token), Some(repo)) => {
            engine = engine.with_issue_tracker(Arc::new(GitHubIssueTracker::new(token, repo)?));
        }
        (None, Some(_)) => warn!("ALERT_ISSUES_REPO is set without GITHUB_TOKEN, issue filing disabled"),
        _ => {}
    }

    if let Some(url) = &config.webhook_url {
        let mut forwarder = WebhookForwarder::new(url.clone());
        if let Some(channel_id) = &config.webhook_channel_id {
            let paginator = HistoryPaginator::new(client, delay, config.pagination.clone());
            forwarder = forwarder.with_history(paginator, channel_id.clone());
        }
        engine = engine.with_sink(Arc::new(forwarder));
    }

    Ok(engine)
}
