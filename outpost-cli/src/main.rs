//! Outpost CLI — run the publishing engine and operator one-shots.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use outpost_core::{CancellationToken, Engine, EngineConfig};

/// Outpost: multi-tenant social publishing control plane
#[derive(Parser, Debug)]
#[command(name = "outpost", version, about, long_about = None)]
struct Cli {
    /// Configuration file path (defaults to ./outpost.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the full engine: scheduler, workers, and ops beats
    Run,
    /// Run only the scheduler beats
    Scheduler,
    /// Run only the publish worker loop
    Worker,
    /// Operator one-shots
    Ops {
        #[command(subcommand)]
        action: OpsAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum OpsAction {
    /// Compute and print the system health snapshot
    Health,
    /// Run one auto-recovery pass
    AutoRecover,
    /// Set or clear the global publish breaker
    Breaker {
        /// `on` or `off`
        state: String,
        /// Reason recorded alongside the flag
        #[arg(long, default_value = "manual operator action")]
        reason: String,
    },
    /// List open platform incidents
    Incidents,
    /// List dead-lettered jobs
    FailedJobs,
    /// Recompute risk scores for every tenant
    Risk,
    /// Run one scheduler pass of each kind and exit
    Tick,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before config so OUTPOST_* variables land in the figment.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let engine = Engine::from_config(config).context("failed to assemble engine")?;
    engine.bootstrap().context("engine bootstrap failed")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    match cli.command {
        Commands::Run => {
            tracing::info!("starting engine (scheduler + worker + ops)");
            engine.run(cancel.clone()).await;
        }
        Commands::Scheduler => {
            tracing::info!("starting scheduler beats");
            engine.scheduler.clone().run(cancel.clone()).await;
        }
        Commands::Worker => {
            tracing::info!("starting publish worker");
            engine.worker.clone().run(cancel.clone()).await;
        }
        Commands::Ops { action } => run_ops_action(&engine, action)?,
    }
    Ok(())
}

fn run_ops_action(engine: &Engine, action: OpsAction) -> Result<()> {
    let now = engine.clock.now();
    match action {
        OpsAction::Health => {
            let health = engine.control.system_health(now)?;
            println!("system health score: {}", health.score);
            println!(
                "publish failure rate (1h): {:.2}%",
                health.publish_failure_rate * 100.0
            );
            println!("store latency: {:.2} ms", health.store_latency_ms);
            println!("kv latency: {:.2} ms", health.kv_latency_ms);
            println!("worker backlog: {}", health.worker_backlog_size);
            for component in &health.components {
                println!(
                    "  {:<16} {:<8} latency={:.2}ms error_rate={:.4}",
                    component.component, component.status, component.latency_ms, component.error_rate
                );
            }
        }
        OpsAction::AutoRecover => {
            let actions = engine.control.auto_recovery(&engine.heartbeat, now)?;
            if actions.is_empty() {
                println!("no recovery actions taken");
            }
            for action in actions {
                println!("{action}");
            }
        }
        OpsAction::Breaker { state, reason } => match state.as_str() {
            "on" => {
                engine.control.breakers.set_global(true, &reason);
                println!("global publish breaker enabled");
            }
            "off" => {
                engine.control.breakers.set_global(false, &reason);
                println!("global publish breaker disabled");
            }
            other => anyhow::bail!("unknown breaker state '{other}', expected on|off"),
        },
        OpsAction::Incidents => {
            let incidents = engine.control.open_incidents(100)?;
            if incidents.is_empty() {
                println!("no open incidents");
            }
            for incident in incidents {
                println!(
                    "{} [{}] {} — {}",
                    incident.created_at.to_rfc3339(),
                    incident.severity.as_str(),
                    incident.incident_type,
                    incident.message
                );
            }
        }
        OpsAction::FailedJobs => {
            let jobs = engine.store.failed_jobs(100)?;
            if jobs.is_empty() {
                println!("no dead-lettered jobs");
            }
            for job in jobs {
                println!(
                    "{} queue={} error={} payload={}",
                    job.created_at.to_rfc3339(),
                    job.queue,
                    job.error,
                    job.payload
                );
            }
        }
        OpsAction::Risk => {
            let scores = outpost_core::risk::calculate_for_all_tenants(
                &engine.store,
                &engine.kv,
                now,
            )?;
            if scores.is_empty() {
                println!("no tenants");
            }
            for score in scores {
                println!(
                    "{} score={} level={} publish_failure={:.4} flagged={:.4} abuse={:.4}",
                    score.tenant_id,
                    score.risk_score,
                    score.level.as_str(),
                    score.publish_failure_ratio,
                    score.flagged_content_ratio,
                    score.abuse_rate
                );
            }
        }
        OpsAction::Tick => {
            let due = engine.scheduler.dispatch_due_posts()?;
            println!("due posts: claimed={} enqueued={}", due.claimed, due.enqueued);
            let time_rules = engine.scheduler.dispatch_time_rules()?;
            println!(
                "time rules: checked={} runs={}",
                time_rules.rules_checked, time_rules.runs_created
            );
            let event_rules = engine.scheduler.dispatch_event_rules()?;
            println!(
                "event rules: checked={} runs={}",
                event_rules.rules_checked, event_rules.runs_created
            );
        }
    }
    Ok(())
}
