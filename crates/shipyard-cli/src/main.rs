//! Shipyard - branch-driven container promotion
//!
//! The `shipyard` command builds, gates and promotes a container image for
//! one triggering event.
//!
//! ## Commands
//!
//! - `run`: execute the pipeline for a branch and build number
//! - `resolve`: show the environment and tags a branch maps to
//! - `tags`: print the fully qualified image references for a build
//! - `history`: list recorded deployments

use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::future::AbortHandle;
use tracing::{info, warn, Level};

use shipyard_ci::approval::ApprovalRequest;
use shipyard_ci::telemetry::init_tracing;
use shipyard_ci::{
    ApprovalSignal, ApprovalSource, AutoApprove, Collaborators, CommandToolchain, Environment,
    EventKind, NoApproval, Pipeline, PipelineConfig, PipelineReport, Resolver, StageOutcome,
    Trigger, WebhookNotifier,
};
use shipyard_state::{DeploymentLog, DeploymentRecord, JsonlDeploymentLog};

/// Exit code for configuration errors found before a run starts.
const EXIT_CONFIG: i32 = 2;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(author = "Stevedores Org")]
#[command(version = shipyard_ci::VERSION)]
#[command(about = "Branch-driven build, gate and promotion of container images", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration file
    #[arg(long, global = true, env = "SHIPYARD_CONFIG", default_value = "shipyard.toml")]
    config: PathBuf,

    /// Deployment history file
    #[arg(
        long,
        global = true,
        env = "SHIPYARD_DEPLOY_LOG",
        default_value = ".shipyard/deployments.jsonl"
    )]
    deploy_log: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for one triggering event
    Run {
        /// Branch that triggered the run
        #[arg(short, long, env = "SHIPYARD_BRANCH")]
        branch: Option<String>,

        /// Build number from the CI system
        #[arg(long, env = "SHIPYARD_BUILD_ID")]
        build_id: u64,

        /// Event kind: push, pull_request or manual
        #[arg(long, env = "SHIPYARD_EVENT", default_value = "push")]
        event: EventKind,

        /// Pre-approve production promotion as this actor
        #[arg(long)]
        approve_as: Option<String>,

        /// Write the run report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Show the environment and tags a branch resolves to
    Resolve {
        branch: String,

        /// Build number used for the build tag
        #[arg(long, default_value = "0")]
        build_id: u64,
    },

    /// Print the fully qualified image references for a build
    Tags {
        branch: String,

        #[arg(long)]
        build_id: u64,
    },

    /// List recorded deployments, oldest first
    History {
        /// Only show this environment
        #[arg(short, long)]
        environment: Option<Environment>,

        /// Show at most this many of the most recent records
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            branch,
            build_id,
            event,
            approve_as,
            report,
        } => {
            let trigger = Trigger::new(branch, build_id, event);
            let code = cmd_run(
                &cli.config,
                &cli.deploy_log,
                trigger,
                approve_as,
                report.as_deref(),
            )
            .await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Resolve { branch, build_id } => cmd_resolve(&branch, build_id),
        Commands::Tags { branch, build_id } => cmd_tags(&cli.config, &branch, build_id),
        Commands::History { environment, limit } => {
            cmd_history(&cli.deploy_log, environment, limit).await
        }
    }
}

/// Run the pipeline; returns the process exit code.
async fn cmd_run(
    config_path: &Path,
    deploy_log: &Path,
    trigger: Trigger,
    approve_as: Option<String>,
    report_path: Option<&Path>,
) -> Result<i32> {
    let config = match PipelineConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return Ok(EXIT_CONFIG);
        }
    };
    let settings = match config.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return Ok(EXIT_CONFIG);
        }
    };

    let toolchain = Arc::new(CommandToolchain::new(
        config.commands.clone(),
        config.image.clone(),
    ));
    let log = Arc::new(JsonlDeploymentLog::new(deploy_log));
    let mut pipeline = Pipeline::new(settings, Collaborators::shared(toolchain), log)
        .with_approvals(approval_source(approve_as));
    if let Some(url) = config.webhook_url() {
        let webhook = WebhookNotifier::new(url).context("Failed to create webhook notifier")?;
        pipeline = pipeline.with_notifier(Arc::new(webhook));
    }

    let (abort, registration) = AbortHandle::new_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            abort.abort();
        }
    });

    let report = pipeline.run_cancellable(trigger, registration).await;
    print!("{}", render_report(&report));

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }

    Ok(report.outcome.exit_code())
}

fn approval_source(approve_as: Option<String>) -> Arc<dyn ApprovalSource> {
    match approve_as {
        Some(actor) => Arc::new(AutoApprove { actor }),
        None if std::io::stdin().is_terminal() => Arc::new(PromptApproval),
        None => Arc::new(NoApproval),
    }
}

/// Asks on the terminal. `yes` approves; anything else aborts.
struct PromptApproval;

#[async_trait]
impl ApprovalSource for PromptApproval {
    async fn next_signal(&self, request: &ApprovalRequest) -> Option<ApprovalSignal> {
        let prompt = format!(
            "Promote {} (build {} from {}) to {}? [yes/no] ",
            request.image_reference, request.build_id, request.branch, request.environment
        );
        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{prompt}");
            let _ = stderr.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await
        .ok()?
        .ok()?;
        Some(parse_answer(&answer, &operator()))
    }
}

fn operator() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "operator".to_string())
}

fn parse_answer(answer: &str, actor: &str) -> ApprovalSignal {
    if answer.trim().eq_ignore_ascii_case("yes") {
        ApprovalSignal::Approve {
            actor: actor.to_string(),
        }
    } else {
        ApprovalSignal::Abort {
            actor: actor.to_string(),
            reason: Some("declined at prompt".to_string()),
        }
    }
}

fn render_report(report: &PipelineReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Run {} for build {} on {} ({} event)\n",
        report.run_id,
        report.trigger.build_id,
        report.trigger.branch_label(),
        report.trigger.event_kind
    ));
    out.push_str(&format!("Environment: {}\n", report.environment));
    if let Some(tags) = &report.tags {
        out.push_str(&format!("Tags: {}\n", tags.as_slice().join(", ")));
    }
    out.push('\n');
    for stage in &report.stages {
        let mark = match stage.outcome {
            StageOutcome::Passed => "✓",
            StageOutcome::Failed if !stage.blocking => "!",
            StageOutcome::Failed => "✗",
            StageOutcome::Skipped => "-",
        };
        out.push_str(&format!("  {mark} {:<14}", stage.name.name()));
        if let Some(detail) = &stage.detail {
            out.push_str(&format!(" {detail}"));
        }
        out.push('\n');
    }
    out.push('\n');
    match report.outcome.message() {
        None => out.push_str(&format!("Result: {}\n", report.outcome.label())),
        Some(msg) => out.push_str(&format!("Result: {} ({msg})\n", report.outcome.label())),
    }
    out
}

fn cmd_resolve(branch: &str, build_id: u64) -> Result<()> {
    let resolution = Resolver::standard()
        .resolve_branch(branch)
        .with_context(|| format!("Failed to resolve branch {branch}"))?;
    let tags = shipyard_ci::ImageTagger::new(None, "image").tags(
        build_id,
        resolution.environment,
        &resolution.tag_policy,
    );
    println!("Environment: {}", resolution.environment);
    println!("Tags: {}", tags.as_slice().join(", "));
    Ok(())
}

fn cmd_tags(config_path: &Path, branch: &str, build_id: u64) -> Result<()> {
    let config = PipelineConfig::load(config_path)?;
    let settings = config.settings()?;
    let resolution = Resolver::standard().resolve_branch(branch)?;
    let tags = settings
        .tagger
        .tags(build_id, resolution.environment, &resolution.tag_policy);
    for reference in settings.tagger.references(&tags) {
        println!("{reference}");
    }
    Ok(())
}

async fn cmd_history(
    deploy_log: &Path,
    environment: Option<Environment>,
    limit: Option<usize>,
) -> Result<()> {
    let records = load_history(deploy_log, environment, limit).await?;
    if records.is_empty() {
        println!("No deployments recorded.");
        return Ok(());
    }
    for record in &records {
        println!("{}", render_record(record));
    }
    Ok(())
}

async fn load_history(
    deploy_log: &Path,
    environment: Option<Environment>,
    limit: Option<usize>,
) -> Result<Vec<DeploymentRecord>> {
    let log = JsonlDeploymentLog::new(deploy_log);
    let mut records = log
        .list(environment.map(|e| e.as_str()))
        .await
        .with_context(|| format!("Failed to read {}", deploy_log.display()))?;
    if let Some(limit) = limit {
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
    }
    Ok(records)
}

fn render_record(record: &DeploymentRecord) -> String {
    let result = match &record.result {
        shipyard_state::DeploymentResult::Succeeded => "succeeded".to_string(),
        shipyard_state::DeploymentResult::Failed { error } => format!("failed: {error}"),
    };
    format!(
        "{}  {:<8} build {:<6} {:<24} {}  {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.environment,
        record.build_id,
        record.branch,
        record.image_reference,
        result
    )
}
