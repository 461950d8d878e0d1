use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use slb_config::{ConfigLoader, SlbConfig, WarningSeverity};
use slb_core::{Result, SlbError};
use slb_rollback::{RestoreOptions, RollbackPayload, RollbackPlan, RollbackRecord, plan_rollback};
use slb_runtime::Gateway;

/// SLB: two-person rule for destructive shell commands run by agents
#[derive(Parser)]
#[command(name = "slb", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to slb.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a command without recording anything
    Classify {
        /// The command line, quoted as one argument or as separate words
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
        /// Directory the command would run in (default: current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List requests waiting for review
    Pending {
        /// Only requests for this project
        #[arg(short, long)]
        project: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a request and its reviews
    Show {
        request_id: Uuid,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// End stale sessions and time out expired requests (one pass)
    Sweep {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or restore rollback points
    Rollback {
        #[command(subcommand)]
        action: RollbackAction,
    },
    /// Show the effective configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RollbackAction {
    /// Show a rollback point, by request id or rollback directory
    Show {
        target: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Restore a rollback point, by request id or rollback directory
    Restore {
        target: String,
        /// Git: reset even if work done since the capture would be lost
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level
                .as_deref()
                .unwrap_or(config.logging.level.as_str())
        };
        init_tracing(log_level, &config.logging.format);

        match self.command {
            Commands::Classify { command, cwd, json } => {
                Self::cmd_classify(config, &command.join(" "), cwd, json)
            }
            Commands::Pending { project, json } => Self::cmd_pending(config, project, json),
            Commands::Show { request_id, json } => Self::cmd_show(config, request_id, json),
            Commands::Sweep { json } => Self::cmd_sweep(config, json),
            Commands::Rollback { action } => Self::cmd_rollback(config, action).await,
            Commands::Config { json } => Self::cmd_config(config, config_loader.path(), json),
        }
    }

    fn cmd_classify(
        config: SlbConfig,
        command: &str,
        cwd: Option<PathBuf>,
        json: bool,
    ) -> Result<()> {
        let cwd = match cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir()?,
        };
        let engine = slb_classify::PatternEngine::from_config(&config.patterns)?;
        let result = engine.classify(command, &cwd);

        if json {
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Ok(());
        }

        println!("tier:       {}", result.tier);
        println!("approvals:  {}", result.min_approvals);
        println!("review:     {}", if result.needs_approval { "required" } else { "not required" });
        if let Some(pattern) = &result.matched_pattern {
            println!("matched:    {pattern}");
        }
        println!("normalized: {}", result.normalized_command);
        if result.tier.requires_rollback() {
            let rollback = match plan_rollback(command) {
                Ok(Some(RollbackPlan::Git)) => "git snapshot".to_string(),
                Ok(Some(RollbackPlan::Filesystem { targets })) => {
                    format!("filesystem archive of {}", targets.join(", "))
                }
                Ok(Some(RollbackPlan::Kubernetes(delete))) => {
                    let names: Vec<String> = delete
                        .resources
                        .iter()
                        .map(|r| format!("{}/{}", r.kind, r.name))
                        .collect();
                    format!("kubernetes manifests of {}", names.join(", "))
                }
                Ok(None) => "none available (execution would be denied)".to_string(),
                Err(e) => format!("unavailable: {e}"),
            };
            println!("rollback:   {rollback}");
        }
        Ok(())
    }

    fn cmd_pending(config: SlbConfig, project: Option<PathBuf>, json: bool) -> Result<()> {
        let gateway = Gateway::open(config)?;
        let pending = gateway.store().list_pending(project.as_deref())?;

        if json {
            println!("{}", serde_json::to_string_pretty(&pending)?);
            return Ok(());
        }
        if pending.is_empty() {
            println!("No pending requests.");
            return Ok(());
        }
        for r in pending {
            println!(
                "  {} [{}] {}/{} approvals  {}  ({}, expires {})",
                r.id,
                r.tier,
                r.approvals_so_far,
                r.min_approvals,
                r.display_redacted,
                r.requestor_agent,
                r.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
            );
        }
        Ok(())
    }

    fn cmd_show(config: SlbConfig, request_id: Uuid, json: bool) -> Result<()> {
        let gateway = Gateway::open(config)?;
        let request = gateway.store().get_request(request_id)?;
        let reviews = gateway.store().list_reviews(request_id)?;

        if json {
            let value = serde_json::json!({ "request": request, "reviews": reviews });
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(());
        }

        println!("request:   {}", request.id);
        println!("status:    {}", request.status);
        println!("tier:      {} ({}/{} approvals)", request.tier, request.approvals_so_far, request.min_approvals);
        println!("command:   {}", request.display_redacted);
        println!("cwd:       {}", request.cwd.display());
        println!("requestor: {}", request.requestor_agent);
        println!("expires:   {}", request.expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
        if let Some(path) = &request.rollback_path {
            println!("rollback:  {}", path.display());
        }
        for review in reviews {
            println!(
                "  {} {} at {}{}",
                review.reviewer_agent,
                review.decision,
                review.submitted_at.format("%H:%M:%S"),
                if review.comments.is_empty() {
                    String::new()
                } else {
                    format!(": {}", review.comments)
                },
            );
        }
        Ok(())
    }

    fn cmd_sweep(config: SlbConfig, json: bool) -> Result<()> {
        let gateway = Gateway::open(config)?;
        let report = gateway.sweeper().run_once();

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!(
                "Ended {} stale session(s), timed out {} request(s), {} failure(s).",
                report.sessions_ended, report.requests_timed_out, report.failures
            );
        }
        Ok(())
    }

    async fn cmd_rollback(config: SlbConfig, action: RollbackAction) -> Result<()> {
        match action {
            RollbackAction::Show { target, json } => {
                let record = Self::resolve_rollback(&config, &target)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                } else {
                    print_record(&record);
                }
                Ok(())
            }
            RollbackAction::Restore { target, force } => {
                let record = Self::resolve_rollback(&config, &target)?;
                let cancel = cancel_on_ctrl_c();
                let options = RestoreOptions {
                    force,
                    command_timeout: std::time::Duration::from_secs(
                        config.rollback.command_timeout_secs.max(1),
                    ),
                };
                slb_rollback::restore(&record, &options, &cancel).await?;
                println!("Restored {} rollback for request {}", record.kind(), record.request_id);
                Ok(())
            }
        }
    }

    /// A request id is looked up in the store; anything else is a rollback
    /// directory read straight from disk.
    fn resolve_rollback(config: &SlbConfig, target: &str) -> Result<RollbackRecord> {
        if let Ok(request_id) = target.parse::<Uuid>() {
            let gateway = Gateway::open(config.clone())?;
            let request = gateway.store().get_request(request_id)?;
            let path = request.rollback_path.ok_or_else(|| {
                SlbError::Rollback(format!("request {request_id} has no rollback point"))
            })?;
            return slb_rollback::load_rollback_data(&path);
        }
        slb_rollback::load_rollback_data(Path::new(target))
    }

    fn cmd_config(config: SlbConfig, path: &Path, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!("# {}", path.display());
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| SlbError::Config(e.to_string()))?
            );
        }

        match config.validate() {
            Ok(warnings) => {
                for w in warnings.iter().filter(|w| w.severity != WarningSeverity::Info) {
                    eprintln!("{w}");
                }
            }
            Err(e) => eprintln!("{e}"),
        }
        Ok(())
    }
}

fn init_tracing(log_level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    // Logs go to stderr so command output stays machine-readable.
    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            child.cancel();
        }
    });
    token
}

fn print_record(record: &RollbackRecord) {
    println!("request:  {}", record.request_id);
    println!("kind:     {}", record.kind());
    println!("command:  {}", record.command_raw);
    println!("captured: {}", record.captured_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("path:     {}", record.rollback_path.display());
    match &record.payload {
        RollbackPayload::Git(git) => {
            println!("repo:     {}", git.repo_root.display());
            println!("head:     {} ({})", git.head, git.branch);
            println!(
                "changes:  staged={} unstaged={} untracked={}",
                git.has_staged_changes, git.has_unstaged_changes, git.untracked_files
            );
        }
        RollbackPayload::Filesystem(fs) => {
            println!("archived: {} bytes", fs.total_bytes);
            for root in &fs.roots {
                println!("  {} {}", root.id, root.path.display());
            }
            for missing in &fs.missing {
                println!("  (missing) {}", missing.display());
            }
        }
        RollbackPayload::Kubernetes(k8s) => {
            if let Some(ns) = &k8s.namespace {
                println!("namespace: {ns}");
            }
            for (resource, manifest) in k8s.resources.iter().zip(&k8s.manifests) {
                println!("  {}/{} {}", resource.kind, resource.name, manifest);
            }
        }
    }
}
