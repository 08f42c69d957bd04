//! stepchart - resumable statechart runner
//!
//! Runs a JSON chart as a session with a checkpoint log. Events are read from
//! stdin as JSON lines; Ctrl-C or end of input suspends the session, and
//! running again with the same session id resumes it from its log.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use stepchart_core::{EngineObserver, Event, SessionId};
use stepchart_runtime::{load_chart, Config, SessionHost, SessionOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stepchart")]
#[command(about = "Resumable statechart runner with a checkpoint log")]
#[command(version)]
struct Cli {
    /// YAML config file
    #[arg(short, long, env = "STEPCHART_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or resume a chart session, reading events from stdin
    Run {
        /// Chart definition (JSON)
        chart: PathBuf,

        /// Session id (a new one is generated if omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Print every configuration change as a JSON line
        #[arg(long)]
        trace: bool,
    },

    /// Validate a chart definition
    Check {
        /// Chart definition (JSON)
        chart: PathBuf,
    },

    /// Inspect a session log without modifying it
    Verify {
        /// Log file
        log: PathBuf,
    },
}

/// One line of input.
#[derive(Deserialize)]
struct InputEvent {
    name: String,
    #[serde(default)]
    data: Value,
}

struct TraceObserver;

impl EngineObserver for TraceObserver {
    fn on_configuration(&self, session: &SessionId, states: &[String]) {
        println!(
            "{}",
            serde_json::json!({ "session": session.as_str(), "configuration": states })
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            chart,
            session,
            trace,
        } => run(cli.config, chart, session, trace).await,
        Commands::Check { chart } => {
            let doc = load_chart(&chart)?;
            println!(
                "{}: {} nodes, checksum {:08x}",
                doc.name(),
                doc.len(),
                doc.checksum()
            );
            Ok(())
        }
        Commands::Verify { log } => {
            let report = stepchart_wal::verify_log_file(&log)?;
            println!("records:      {}", report.records());
            for (level, count) in &report.records_by_level {
                println!("  level {:>2}:   {}", level, count);
            }
            println!("operations:   {}", report.operations);
            println!("skip blocks:  {}", report.skip_blocks);
            println!("valid bytes:  {}", report.valid_len);
            println!("stale bytes:  {}", report.stale_bytes);
            match (&report.damaged_at, &report.damage) {
                (Some(offset), Some(damage)) => {
                    println!("damaged at:   {} ({})", offset, damage);
                    Err("log is damaged".into())
                }
                _ => {
                    println!("clean");
                    Ok(())
                }
            }
        }
    }
}

async fn run(
    config_path: Option<PathBuf>,
    chart: PathBuf,
    session: Option<String>,
    trace: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match Config::load_from(config_path.as_deref()) {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path.display());
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    let doc = Arc::new(load_chart(&chart)?);
    let session = session.map(SessionId::from).unwrap_or_default();

    tracing::info!("Running chart '{}'", doc.name());
    tracing::info!("  Session: {}", session);
    tracing::info!("  Data directory: {}", config.storage.data_dir.display());

    let mut host = SessionHost::new(config);
    if trace {
        host = host.with_observer(Arc::new(TraceObserver));
    }
    let host = Arc::new(host);
    host.start_or_resume(doc, session.clone())?;

    // Feed stdin; end of input suspends the session.
    let feeder = {
        let host = host.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let input: InputEvent = match serde_json::from_str(&line) {
                    Ok(input) => input,
                    Err(e) => {
                        tracing::warn!("Skipping malformed event line: {}", e);
                        continue;
                    }
                };
                let event = Event::external(input.name).with_data(input.data);
                if let Err(e) = host.send(&session, event).await {
                    tracing::debug!("Session no longer accepts events: {}", e);
                    return;
                }
            }
            tracing::info!("End of input, suspending session");
            if let Err(e) = host.suspend(&session) {
                tracing::warn!("Failed to suspend session {}: {}", session, e);
            }
        })
    };

    let outcome = tokio::select! {
        outcome = host.wait(&session) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, suspending session...");
            host.suspend(&session)?;
            host.wait(&session).await?
        }
    };
    feeder.abort();

    match outcome {
        SessionOutcome::Done(data) => {
            println!("{}", serde_json::json!({ "session": session.as_str(), "done": data }));
            Ok(())
        }
        SessionOutcome::Suspended => {
            tracing::info!("Session {} suspended; run again with --session {} to resume", session, session);
            Ok(())
        }
        other => Err(format!("session {} ended: {:?}", session, other).into()),
    }
}
