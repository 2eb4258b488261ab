use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use faultline::config::{FaultlineConfig, LoggingConfig};
use faultline::investigate::reconcile_stale_leases;
use faultline::manage::{Action, ManagementService, Transition};
use faultline::signature::{Signature, SignatureKey, SignatureStatus};
use faultline::storage::{SignatureFilter, SqliteSignatureStore};

#[derive(Parser)]
#[command(
    name = "faultline",
    about = "Deduplicate recurring production errors into signatures and diagnose the ones that matter",
    version,
    long_about = None
)]
struct Cli {
    /// Path to faultline.toml
    #[arg(long, global = true, env = "FAULTLINE_CONFIG")]
    config: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (control loop + management API)
    Serve,

    /// Run a single poll/investigate tick and exit
    PollOnce {
        /// Fold events into signatures but do not investigate
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect and manage signatures
    Signatures {
        #[command(subcommand)]
        action: SignaturesAction,
    },

    /// Release investigation leases that outlived their owner
    Reconcile,

    /// Validate the configuration and print the effective values
    CheckConfig,
}

#[derive(Subcommand)]
enum SignaturesAction {
    /// List signatures, most recently seen first
    List {
        /// Only this status (new, investigating, diagnosed, muted, resolved)
        #[arg(long)]
        status: Option<SignatureStatus>,

        /// Only this service
        #[arg(long)]
        service: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Show one signature with its diagnosis
    Show { key: SignatureKey },

    /// Stop investigating and notifying about a signature
    Mute { key: SignatureKey },

    /// Mark a signature as fixed
    Resolve { key: SignatureKey },

    /// Send a signature back to triage
    Retriage { key: SignatureKey },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FaultlineConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve => {
            tracing::info!(
                api = %config.api.bind,
                db_path = %config.storage.db_path.display(),
                "Starting Faultline daemon"
            );
            faultline::serve(config).await?;
        }
        Commands::PollOnce { dry_run } => poll_once(&config, dry_run, cli.json).await?,
        Commands::Signatures { action } => signatures(&config, action, cli.json)?,
        Commands::Reconcile => {
            let store = SqliteSignatureStore::new(faultline::open_storage(&config)?);
            let report = reconcile_stale_leases(&store, config.investigation.stale_after(), Utc::now())?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "examined": report.examined,
                        "released": report.released,
                        "failed": report.failures.iter().map(|(k, e)| json!({"key": k, "error": e.to_string()})).collect::<Vec<_>>(),
                    }))?
                );
            } else {
                println!(
                    "Examined {} leased signature(s), released {}, {} failure(s)",
                    report.examined,
                    report.released.len(),
                    report.failures.len()
                );
                for key in &report.released {
                    println!("  released {}", key);
                }
                for (key, e) in &report.failures {
                    println!("  FAILED   {}: {}", key, e);
                }
            }
        }
        Commands::CheckConfig => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Configuration OK\n");
                println!("{}", toml::to_string_pretty(&config).context("failed to render configuration")?);
            }
        }
    }

    Ok(())
}

async fn poll_once(config: &FaultlineConfig, dry_run: bool, as_json: bool) -> Result<()> {
    let pool = faultline::open_storage(config)?;
    let ctx = faultline::build_daemon(config, pool, CancellationToken::new())?;

    if dry_run {
        let mut cycle = ctx
            .poll
            .poll(ctx.telemetry.as_ref(), ctx.settings.lookback, &ctx.token)
            .await?;
        faultline::poll::merge_backlog(&mut cycle.candidates, ctx.poll.backlog()?);
        if as_json {
            let failures: Vec<_> = cycle
                .failures
                .iter()
                .map(|f| json!({"index": f.index, "key": f.key, "error": f.error.to_string()}))
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "received": cycle.received,
                    "created": cycle.created,
                    "updated": cycle.updated,
                    "regressed": cycle.regressed,
                    "failures": failures,
                    "candidates": cycle.candidates,
                    "notify": cycle.notify,
                }))?
            );
        } else {
            println!(
                "Received {} event(s): {} new signature(s), {} update(s), {} failure(s)",
                cycle.received,
                cycle.created,
                cycle.updated,
                cycle.failures.len()
            );
            for failure in &cycle.failures {
                println!("  event #{}: {}", failure.index, failure.error);
            }
            println!("\n{:<14} | Priority", "Candidate");
            println!("{:-<14}-|-{:-<10}", "", "");
            for candidate in &cycle.candidates {
                println!("{:<14} | {:>8.1}", candidate.key.short(), candidate.priority);
            }
        }
        return Ok(());
    }

    let report = faultline::daemon::tick(&ctx).await;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Faultline tick");
        println!("{:<22} | Value", "Metric");
        println!("{:-<22}-|-{:-<10}", "", "");
        for (name, value) in [
            ("leases released", report.leases_released.to_string()),
            ("poll failed", report.poll_failed.to_string()),
            ("events", report.events.to_string()),
            ("event failures", report.event_failures.to_string()),
            ("high priority", report.high_priority.to_string()),
            ("candidates", report.candidates.to_string()),
            ("diagnosed", report.diagnosed.to_string()),
            ("investigation failures", report.failed.to_string()),
            ("budget exhausted", report.budget_exhausted.to_string()),
        ] {
            println!("{:<22} | {}", name, value);
        }
    }
    if report.poll_failed {
        anyhow::bail!("poll failed, see log for details");
    }
    Ok(())
}

fn signatures(config: &FaultlineConfig, action: SignaturesAction, as_json: bool) -> Result<()> {
    let store = Arc::new(SqliteSignatureStore::new(faultline::open_storage(config)?));
    let manage = ManagementService::new(store);

    let (key, action) = match action {
        SignaturesAction::List { status, service, limit } => {
            let list = manage.list(&SignatureFilter {
                status,
                service,
                limit: Some(limit),
            })?;
            if as_json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                print_table(&list);
            }
            return Ok(());
        }
        SignaturesAction::Show { key } => {
            let signature = manage.details(&key)?;
            if as_json {
                println!("{}", serde_json::to_string_pretty(&signature)?);
            } else {
                print_details(&signature);
            }
            return Ok(());
        }
        SignaturesAction::Mute { key } => (key, Action::Mute),
        SignaturesAction::Resolve { key } => (key, Action::Resolve),
        SignaturesAction::Retriage { key } => (key, Action::Retriage),
    };

    let Transition { signature, changed } = manage.apply(&key, action)?;
    if as_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({"data": signature, "changed": changed}))?
        );
    } else if changed {
        println!("{} is now {}", key.short(), signature.status());
    } else {
        println!("{} was already {}, nothing changed", key.short(), signature.status());
    }
    Ok(())
}

fn print_table(list: &[Signature]) {
    println!(
        "{:<12} | {:<13} | {:>7} | {:<16} | {:<24} | Last seen",
        "Key", "Status", "Count", "Service", "Error type"
    );
    println!("{:-<12}-|-{:-<13}-|-{:-<7}-|-{:-<16}-|-{:-<24}-|-{:-<20}", "", "", "", "", "", "");
    for s in list {
        println!(
            "{:<12} | {:<13} | {:>7} | {:<16} | {:<24} | {}",
            s.key().short(),
            s.status().as_str(),
            s.occurrence_count(),
            s.service(),
            s.error_type(),
            s.last_seen().format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} signature(s)", list.len());
}

fn print_details(s: &Signature) {
    println!("Signature   {}", s.key());
    println!("Status      {}", s.status());
    println!("Service     {}", s.service());
    println!("Error type  {}", s.error_type());
    println!("Template    {}", s.message_template());
    println!("Sample      {}", s.sample_message());
    println!("Occurrences {}", s.occurrence_count());
    println!("First seen  {}", s.first_seen().to_rfc3339());
    println!("Last seen   {}", s.last_seen().to_rfc3339());
    if let Some(since) = s.investigating_since() {
        println!("Leased at   {}", since.to_rfc3339());
    }
    if let Some(failure) = s.last_failure() {
        println!("Last error  {}", failure);
    }
    if let Some(d) = s.diagnosis() {
        println!("\nDiagnosis ({} confidence, ${:.4})", d.confidence(), d.cost_usd());
        println!("  Root cause:    {}", d.root_cause());
        println!("  Suggested fix: {}", d.suggested_fix());
        for e in d.evidence() {
            println!("  - [{}] {}", e.source, e.detail);
        }
        if !d.context_complete() {
            println!("  Unresolved traces: {}", d.context_gaps().join(", "));
        }
    }
    if !s.history().is_empty() {
        println!("\n{} earlier diagnosis(es)", s.history().len());
    }
}
