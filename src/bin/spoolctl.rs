//! spoolctl: operator interface to spool occupation.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use spool_occupation::config::Config;
use spool_occupation::db::Db;
use spool_occupation::engine::{LockView, OccupationOrchestrator, StopRequest};
use spool_occupation::lock::{LockService, LockToken};
use spool_occupation::model::spool::{Spool, SpoolId, SubUnit, SubUnitId, WorkerId};
use spool_occupation::model::track::Track;
use spool_occupation::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "spoolctl", about = "Spool occupation tracking")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Restore missing locks from spool holders (run at startup)
    Reconcile,
    /// Register a new spool
    Create {
        /// Spool tag
        id: String,
        /// Sub-unit as ID=SIZE, repeatable
        #[arg(long = "sub-unit", value_parser = parse_sub_unit)]
        sub_units: Vec<SubUnit>,
    },
    /// Show holder, tracks and progress of a spool
    Status { id: String },
    /// Start work on a track
    Start {
        id: String,
        worker: String,
        /// assembly | welding
        track: Track,
    },
    /// Stop work; no --done means cancel
    Stop {
        id: String,
        worker: String,
        /// Completed sub-unit, repeatable
        #[arg(long = "done")]
        done: Vec<String>,
        /// Lock token returned by start
        #[arg(long)]
        token: Option<uuid::Uuid>,
    },
    /// Inspection rejected a track: reopen for rework
    Reject {
        id: String,
        track: Track,
        inspector: String,
    },
    /// Supervisor reset of a blocked track
    Unblock {
        id: String,
        track: Track,
        supervisor: String,
    },
    /// Recent audit events of a spool
    Events {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

fn parse_sub_unit(s: &str) -> Result<SubUnit, String> {
    let (id, size) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=SIZE, got '{s}'"))?;
    let size: f64 = size
        .parse()
        .map_err(|_| format!("invalid size in '{s}'"))?;
    Ok(SubUnit::new(SubUnitId::new(id), size))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let policy = config.policy()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "spoolctl".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;

    let locks = Arc::new(LockService::new(
        db.clone(),
        db.clone(),
        policy.lock_settings(),
    ));
    let orchestrator =
        OccupationOrchestrator::new(db.clone(), locks.clone(), db.clone(), db.clone(), &policy);

    match cli.command {
        Command::Reconcile => {
            let report = locks.reconcile_from_source_of_truth().await?;
            println!(
                "recreated {}, already locked {}, skipped stale {}",
                report.recreated, report.already_locked, report.skipped_stale
            );
        }
        Command::Create { id, sub_units } => {
            let version = db.create_spool(&Spool::new(SpoolId::new(id), sub_units)).await?;
            println!("Created (version {version})");
        }
        Command::Status { id } => cmd_status(&orchestrator, SpoolId::new(id)).await?,
        Command::Start { id, worker, track } => {
            let outcome = orchestrator
                .start(&SpoolId::new(id), &WorkerId::new(worker), track)
                .await?;
            match outcome.grant.token() {
                Some(token) => println!("Started {} (token {token})", outcome.track),
                None => println!("Started {} without lock (degraded)", outcome.track),
            }
            if let Some(previous) = &outcome.reclaimed_from {
                println!("Reclaimed from abandoned session of {previous}");
            }
            println!("{}", outcome.status);
        }
        Command::Stop {
            id,
            worker,
            done,
            token,
        } => {
            let mut request = StopRequest::new(
                SpoolId::new(id),
                WorkerId::new(worker),
                done.into_iter().map(SubUnitId::new),
            );
            if let Some(token) = token {
                request = request.token(LockToken(token));
            }
            let outcome = orchestrator.stop(request).await?;
            println!(
                "{} {}: {}/{} sub-units ({:.1}%)",
                outcome.action.as_str(),
                outcome.track,
                outcome.progress.completed,
                outcome.progress.total,
                outcome.progress.percent()
            );
            println!("{}", outcome.status);
        }
        Command::Reject {
            id,
            track,
            inspector,
        } => {
            let outcome = orchestrator
                .reject(&SpoolId::new(id), track, &WorkerId::new(inspector))
                .await?;
            println!(
                "{} {} (cycle {})",
                outcome.track, outcome.track_status, outcome.cycle_count
            );
        }
        Command::Unblock {
            id,
            track,
            supervisor,
        } => {
            let outcome = orchestrator
                .override_block(&SpoolId::new(id), track, &WorkerId::new(supervisor))
                .await?;
            println!("{} {}", outcome.track, outcome.track_status);
        }
        Command::Events { id, limit } => {
            let rows = db.recent_events(&id, limit).await?;
            if rows.is_empty() {
                println!("No events.");
                return Ok(());
            }
            println!(
                "{:<16}  {:<28}  {:<10}  {:<12}  DETAIL",
                "WHEN", "EVENT", "TRACK", "WORKER"
            );
            println!("{}", "-".repeat(100));
            for row in &rows {
                println!(
                    "{:<16}  {:<28}  {:<10}  {:<12}  {}",
                    row.occurred_at.format("%Y-%m-%d %H:%M"),
                    row.event_type,
                    row.track.as_deref().unwrap_or("-"),
                    row.worker,
                    row.detail
                );
            }
        }
    }

    Ok(())
}

async fn cmd_status(orchestrator: &OccupationOrchestrator, id: SpoolId) -> anyhow::Result<()> {
    let status = orchestrator.status(&id).await?;

    println!("Spool:      {}", status.resource_id);
    println!("Status:     {}", status.composite);
    println!(
        "Holder:     {}",
        status
            .holder
            .as_ref()
            .map(|w| w.to_string())
            .unwrap_or("-".to_string())
    );
    if let Some(since) = status.holder_since {
        println!("Since:      {since}");
    }
    match &status.lock {
        LockView::Held(owner) => println!("Lock:       {owner}"),
        LockView::Free => println!("Lock:       -"),
        LockView::Unknown => println!("Lock:       unknown (backend unavailable)"),
    }
    println!("Version:    {}", status.version);
    println!("---");
    for track in Track::ALL {
        let state = &status.tracks[&track];
        let progress = status.progress[&track];
        println!(
            "{:<10}  {:<12}  {}/{} ({:.1}%)  cycles {}",
            track.as_str(),
            state.status.as_str(),
            progress.completed,
            progress.total,
            progress.percent(),
            state.cycle_count
        );
    }
    Ok(())
}
