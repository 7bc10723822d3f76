//! roc-bar-stress
//!
//! Stresses the BAR accessor of one channel with back-to-back register
//! write/read cycles and reports throughput and latency.
//!
//! Example:
//! `roc-bar-stress --id 04:00.0 --channel 1 --address 0x0f00040 --value 0x18 --cycles 100000`
//!
//! ## Runtime Configuration
//! - `ROC_LOCK_DIR`: Override the lock record directory
//! - `ROC_SYSFS_ROOT`: Override the PCI device directory
//! - `RUST_LOG`: Log filter (default: readout_card=info,roc_bar_stress=info)

use std::process::ExitCode;

use clap::Parser;
use readout_card::stress::{stress, StressReport};
use readout_card::util::parse_number;
use readout_card::{CardId, Channel, InterruptFlag, LockMedium, Parameters, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "roc-bar-stress", about = "Stress the BAR accessor")]
struct Args {
    /// Card PCI address (04:00.0) or sequence number (#0)
    #[arg(long, value_parser = parse_card_id)]
    id: CardId,

    /// Channel (BAR) number
    #[arg(long, default_value_t = 0)]
    channel: u32,

    /// Register byte address
    #[arg(long, value_parser = parse_u32)]
    address: u32,

    /// Value written every cycle
    #[arg(long, value_parser = parse_u32, default_value = "0")]
    value: u32,

    /// Write/read cycles to perform
    #[arg(long, default_value_t = 100)]
    cycles: u64,

    /// Lock medium guarding the channel
    #[arg(long, value_parser = parse_lock_medium, default_value = "file")]
    lock_medium: LockMedium,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn parse_card_id(s: &str) -> std::result::Result<CardId, String> {
    s.parse().map_err(|e: readout_card::Error| e.to_string())
}

fn parse_lock_medium(s: &str) -> std::result::Result<LockMedium, String> {
    s.parse().map_err(|e: readout_card::Error| e.to_string())
}

fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    let value = parse_number(s).map_err(|e| format!("'{}': {}", s, e))?;
    u32::try_from(value).map_err(|_| format!("'{}' does not fit in 32 bits", s))
}

fn run(args: Args, interrupt: &InterruptFlag) -> Result<StressReport> {
    let params = Parameters::from_env_defaults(args.id.clone(), args.channel)
        .with_lock_medium(args.lock_medium);
    let channel = Channel::open(params)?;

    tracing::info!("Card ID: {}", args.id);
    tracing::info!("BAR: {}", args.channel);
    tracing::info!("Total BAR operations: {}", args.cycles.saturating_mul(2));

    let report = stress(channel.bar(), args.address as usize, args.value, args.cycles, interrupt)?;
    channel.close()?;
    Ok(report)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "readout_card=info,roc_bar_stress=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    let json = args.json;

    // The stress loop is synchronous; signals only raise the flag it polls
    let interrupt = InterruptFlag::new();
    let mut worker = {
        let interrupt = interrupt.clone();
        tokio::task::spawn_blocking(move || run(args, &interrupt))
    };

    let outcome = tokio::select! {
        outcome = &mut worker => outcome,
        _ = shutdown_signal() => {
            interrupt.set();
            worker.await
        }
    };
    interrupt.clear();

    match outcome {
        Ok(Ok(report)) => {
            if json {
                println!("{}", report.to_json());
            } else {
                println!("{}", report);
            }
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            tracing::error!("{:?}: {}", e.kind(), e);
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("Stress worker failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, stopping..."),
        _ = terminate => tracing::info!("Received SIGTERM, stopping..."),
    }
}
