//! CSMS Node - CLI for the simulated CSMS
//!
//! Runs an OCPP 2.0.1 CSMS that charge point simulators can connect to.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (ws://127.0.0.1:9000)
//! csms-node
//!
//! # Request a configuration report from every charge point after 10 s
//! csms-node --request GetBaseReport --delay 10
//!
//! # Clear authorization caches every 60 s
//! csms-node --request ClearCache --period 60
//! ```

use std::time::Duration;

use clap::Parser;
use csms_sim::{CommandSchedule, CsmsConfig, CsmsServer, OutboundCommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Simulated OCPP 2.0.1 charging station management system
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Listen port
    #[arg(short, long, default_value = "9000")]
    port: u16,

    /// Command to issue on every connected charge point (ClearCache, GetBaseReport)
    #[arg(short, long)]
    request: Option<OutboundCommand>,

    /// Seconds to wait before issuing the command
    #[arg(long, requires = "request")]
    delay: Option<u64>,

    /// Seconds between repeated issuances
    #[arg(long, requires = "request")]
    period: Option<u64>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn schedule(&self) -> Option<CommandSchedule> {
        let mut schedule = CommandSchedule::once(self.request?);
        if let Some(delay) = self.delay {
            schedule = schedule.with_delay(Duration::from_secs(delay));
        }
        if let Some(period) = self.period {
            schedule = schedule.with_period(Duration::from_secs(period));
        }
        Some(schedule)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let mut config = CsmsConfig::new(&args.host, args.port);
    if let Some(schedule) = args.schedule() {
        config = config.with_schedule(schedule);
    }

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              CSMS Node - Simulated OCPP 2.0.1 CSMS           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:   {:<50} ║", config.bind_address());
    println!("║  Protocols:{:<50} ║", config.subprotocols.join(", "));
    println!("║  Request:  {:<50} ║", describe(config.schedule.as_ref()));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let server = CsmsServer::bind(config).await?;
    info!("Listening on ws://{}", server.local_addr()?);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Server stopped: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}

/// One-line summary of the configured schedule
fn describe(schedule: Option<&CommandSchedule>) -> String {
    let Some(schedule) = schedule else {
        return "none".to_string();
    };

    let mut text = schedule.command.to_string();
    if let Some(delay) = schedule.delay {
        text.push_str(&format!(" after {}s", delay.as_secs()));
    }
    if let Some(period) = schedule.period {
        text.push_str(&format!(" every {}s", period.as_secs()));
    }
    text
}
