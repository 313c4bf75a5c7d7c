//! edge-pipeline - operator CLI for the pipeline control plane
//!
//! # Usage
//!
//! ```bash
//! # Show (and lazily initialise) the current phase
//! edge-pipeline get
//!
//! # Switch phase
//! edge-pipeline set validated --by alice --reason "demo"
//!
//! # Machine-readable output
//! edge-pipeline --json history --limit 5
//!
//! # Watch for phase changes until Ctrl+C
//! edge-pipeline monitor --interval 2
//! ```
//!
//! # Environment Variables
//!
//! - `EDGE_PIPELINE_CONFIG`: path to a TOML config file (else `./pipeline.toml`)
//! - `PIPELINE_CONFIG_DB`: override `storage.config_db`
//! - `SENSOR_DB`: override `storage.sensor_db`
//! - `PIPELINE_ACTOR`: default actor for `set`
//! - `RUST_LOG`: logging level (default: info)
//! - `LOG_FORMAT`: `json` for JSON log lines on stderr

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use edge_pipeline::config::defaults;
use edge_pipeline::storage::SortOrder;
use edge_pipeline::{OperationalQuery, PipelineConfig, PipelineController, PipelineError};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "edge-pipeline")]
#[command(about = "Pipeline phase configuration and data-routing controller")]
#[command(version)]
struct CliArgs {
    /// Path to a pipeline TOML file (overrides EDGE_PIPELINE_CONFIG / ./pipeline.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Config store database
    #[arg(long, env = "PIPELINE_CONFIG_DB", value_name = "PATH")]
    config_db: Option<PathBuf>,

    /// Operational sensor database (opened read-only)
    #[arg(long, env = "SENSOR_DB", value_name = "PATH")]
    sensor_db: Option<PathBuf>,

    /// Print structured JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the current phase
    Get,
    /// Switch to a new phase
    Set {
        /// raw, validated, schematized, aggregated or anomaly
        phase: String,
        /// Who is making the change
        #[arg(long = "by", env = "PIPELINE_ACTOR", default_value = "operator")]
        actor: String,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Phase change history, most recent first
    History {
        #[arg(long, default_value_t = defaults::CLI_LIST_LIMIT)]
        limit: usize,
    },
    /// Batch execution records, most recent first
    Executions {
        #[arg(long, default_value_t = defaults::CLI_LIST_LIMIT)]
        limit: usize,
    },
    /// List phase definitions and their routing
    Phases,
    /// Read rows from the operational sensor database
    ReadSensor {
        /// Table to read (default: storage.sensor_table)
        #[arg(long)]
        table: Option<String>,
        #[arg(long, default_value_t = defaults::CLI_LIST_LIMIT)]
        limit: usize,
        /// Newest first by this column
        #[arg(long, value_name = "COLUMN")]
        order_by: Option<String>,
    },
    /// Tables in the operational sensor database
    Tables,
    /// Trim history and execution logs to their most recent rows
    Prune {
        #[arg(long, value_name = "N")]
        history: Option<usize>,
        #[arg(long, value_name = "N")]
        executions: Option<usize>,
    },
    /// Poll the current phase and report changes until Ctrl+C
    Monitor {
        /// Poll interval in seconds
        #[arg(long, default_value_t = defaults::MONITOR_INTERVAL_SECS)]
        interval: u64,
    },
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = CliArgs::parse();
    let json = args.json;
    if let Err(err) = run(args).await {
        if json {
            print_error_json(&err);
        }
        return Err(err);
    }
    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &CliArgs) -> Result<PipelineConfig> {
    let mut config = match args.config {
        Some(ref path) => PipelineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::load(),
    };
    if let Some(ref p) = args.config_db {
        config.storage.config_db = p.clone();
    }
    if let Some(ref p) = args.sensor_db {
        config.storage.sensor_db = Some(p.clone());
    }
    Ok(config)
}

async fn run(args: CliArgs) -> Result<()> {
    let config = load_config(&args)?;
    let controller =
        PipelineController::new(&config).context("Failed to start pipeline controller")?;
    let json = args.json;

    match args.command {
        Command::Get => {
            let current = controller.get_phase()?;
            if json {
                print_json(&current)?;
            } else {
                println!("Current phase: {} (seq {})", current.phase, current.seq);
                println!("  updated_at: {}", current.updated_at.to_rfc3339());
                println!("  updated_by: {}", current.updated_by);
                println!("  reason:     {}", current.reason.as_deref().unwrap_or("-"));
            }
        }
        Command::Set {
            phase,
            actor,
            reason,
        } => {
            let applied = controller.switch_phase(&phase, &actor, &reason)?;
            if json {
                print_json(&applied)?;
            } else {
                println!("Phase set to {} by {} (seq {})", applied.phase, applied.updated_by, applied.seq);
            }
        }
        Command::History { limit } => {
            let history = controller.get_history(limit)?;
            if json {
                print_json(&history)?;
            } else {
                println!("{:>6}  {:<12} {:<32} {:<16} REASON", "SEQ", "PHASE", "UPDATED_AT", "BY");
                for entry in &history {
                    println!(
                        "{:>6}  {:<12} {:<32} {:<16} {}",
                        entry.seq,
                        entry.phase,
                        entry.updated_at.to_rfc3339(),
                        entry.updated_by,
                        entry.reason.as_deref().unwrap_or("")
                    );
                }
            }
        }
        Command::Executions { limit } => {
            let runs = controller.execution_history(limit)?;
            if json {
                print_json(&runs)?;
            } else {
                println!(
                    "{:>6}  {:<32} {:<12} {:>6} {:>6} {:>7}  {:<8} DESTINATIONS",
                    "ID", "TIMESTAMP", "PHASE", "IN", "VALID", "INVALID", "OUTCOME"
                );
                for run in &runs {
                    println!(
                        "{:>6}  {:<32} {:<12} {:>6} {:>6} {:>7}  {:<8} {}",
                        run.id.unwrap_or_default(),
                        run.timestamp.to_rfc3339(),
                        run.phase_at_time,
                        run.records_in,
                        run.records_routed_valid,
                        run.records_routed_invalid,
                        run.outcome,
                        run.destinations.join(", ")
                    );
                    if let Some(ref detail) = run.error_detail {
                        println!("        error: {detail}");
                    }
                }
            }
        }
        Command::Phases => print_phases(&controller, json)?,
        Command::ReadSensor {
            table,
            limit,
            order_by,
        } => {
            let table = table.unwrap_or_else(|| controller.sensor_table().to_string());
            let mut query = OperationalQuery::table(table).limit(limit);
            if let Some(column) = order_by {
                query = query.order_by(column, SortOrder::Desc);
            }
            let rows = controller.read_operational_data(&query.into())?;
            if json {
                print_json(&rows)?;
            } else {
                for row in &rows {
                    println!("{}", serde_json::to_string(row)?);
                }
                println!("({} rows)", rows.len());
            }
        }
        Command::Tables => {
            if !controller.verify_connection() {
                anyhow::bail!("Operational sensor database is not reachable");
            }
            let infos = controller
                .list_tables()?
                .iter()
                .map(|t| controller.table_info(t))
                .collect::<edge_pipeline::Result<Vec<_>>>()?;
            if json {
                print_json(&infos)?;
            } else {
                for info in &infos {
                    let columns: Vec<&str> = info.columns.iter().map(|c| c.name.as_str()).collect();
                    println!("{:<24} {:>10} rows  [{}]", info.table, info.row_count, columns.join(", "));
                }
            }
        }
        Command::Prune {
            history,
            executions,
        } => {
            if history.is_none() && executions.is_none() {
                anyhow::bail!("Nothing to prune: pass --history N and/or --executions N");
            }
            let report = controller.prune(history, executions)?;
            if json {
                print_json(&report)?;
            } else {
                if let Some(n) = report.history_removed {
                    println!("Removed {n} phase history rows");
                }
                if let Some(n) = report.executions_removed {
                    println!("Removed {n} execution records");
                }
            }
        }
        Command::Monitor { interval } => {
            let cancel_token = CancellationToken::new();
            let shutdown_token = cancel_token.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Received Ctrl+C, stopping monitor");
                shutdown_token.cancel();
            });
            monitor(controller, Duration::from_secs(interval.max(1)), json, cancel_token).await?;
        }
    }
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_error_json(err: &anyhow::Error) {
    let kind = err
        .chain()
        .find_map(|e| e.downcast_ref::<PipelineError>())
        .map_or("error", PipelineError::kind);
    let body = serde_json::json!({ "error": kind, "message": format!("{err:#}") });
    println!("{body}");
}

#[derive(Serialize)]
struct PhaseRow<'a> {
    phase: edge_pipeline::Phase,
    processing: edge_pipeline::Processing,
    routing: &'a edge_pipeline::RoutingMode,
    transformation_hash: Option<&'a str>,
    current: bool,
}

fn print_phases(controller: &PipelineController, json: bool) -> Result<()> {
    let current = controller.get_phase()?.phase;
    let router = controller.router();
    let rows: Vec<PhaseRow<'_>> = router
        .table()
        .iter()
        .map(|def| PhaseRow {
            phase: def.phase,
            processing: def.processing,
            routing: &def.routing,
            transformation_hash: router.transformation_hash(def.phase),
            current: def.phase == current,
        })
        .collect();

    if json {
        return print_json(&rows);
    }
    for row in &rows {
        let marker = if row.current { "*" } else { " " };
        let routing = match row.routing.invalid_sink() {
            Some(invalid) => format!("valid -> {}, invalid -> {invalid}", row.routing.valid_sink()),
            None => format!("all -> {}", row.routing.valid_sink()),
        };
        println!("{marker} {:<12} {:<28} {routing}", row.phase, row.processing);
    }
    Ok(())
}

// ============================================================================
// Monitor
// ============================================================================

async fn monitor(
    controller: PipelineController,
    interval: Duration,
    json: bool,
    cancel_token: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_seq: Option<i64> = None;

    info!(interval_secs = interval.as_secs(), "Monitoring pipeline phase");
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let c = controller.clone();
                let polled = tokio::task::spawn_blocking(move || c.get_phase())
                    .await
                    .context("Phase poll task panicked")?;
                match polled {
                    Ok(current) if last_seq != Some(current.seq) => {
                        last_seq = Some(current.seq);
                        if json {
                            println!("{}", serde_json::to_string(&current)?);
                        } else {
                            println!(
                                "[{}] phase={} by={} seq={}",
                                current.updated_at.to_rfc3339(),
                                current.phase,
                                current.updated_by,
                                current.seq
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Phase poll failed"),
                }
            }
        }
    }
    info!("Monitor stopped");
    Ok(())
}
