//! The `muscle-manager` binary.
//!
//! Loads a simulation plan, starts the manager's RPC server, and serves
//! instances until the whole model has registered and deregistered
//! again, or until interrupted. Tracing output goes to a file and, when
//! not quiet, colorized to stdout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*};

use rusty_muscle::cli::Args;
use rusty_muscle::logging::ColorizedFormatter;
use rusty_muscle::manager::Logger;
use rusty_muscle::{Manager, MMPServer, SimulationPlan};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Tracing goes to a file next to the manager's log sink; the sink
    // itself only holds records submitted by instances.
    let trace_path = args.log_file.with_extension("trace.log");
    let file_appender = tracing_appender::rolling::never(
        trace_path.parent().unwrap_or_else(|| std::path::Path::new(".")),
        trace_path
            .file_name()
            .unwrap_or_else(|| "muscle3_manager.trace.log".as_ref()),
    );
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(log_level);

    let stdout_layer = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let plan_text = std::fs::read_to_string(&args.plan)
        .with_context(|| format!("reading simulation plan {:?}", args.plan))?;
    let plan = SimulationPlan::from_json(&plan_text)
        .with_context(|| format!("parsing simulation plan {:?}", args.plan))?;

    let logger = Logger::to_file(&args.log_file)
        .with_context(|| format!("opening log sink {:?}", args.log_file))?;
    let manager = Arc::new(Manager::new(&plan, logger)?);

    let mut server = MMPServer::start(manager.clone(), &args.bind)
        .with_context(|| format!("starting the manager server on {}", args.bind))?;
    info!("manager up; instances should pass --muscle-manager={}", server.location());

    // Serve until the model completes or we get interrupted.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if manager.is_done() {
                    info!("all instances have deregistered, shutting down");
                    break;
                }
            }
        }
    }

    server.stop();
    Ok(())
}
