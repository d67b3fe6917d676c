//! Periodic command driver
//!
//! Issues one outbound command on a session after an optional delay, either
//! once or repeatedly at a fixed period. Stops when the session closes.

use std::time::Duration;

use tracing::{debug, info};

use crate::ocpp::commands::{issue, OutboundCommand};
use crate::ocpp::SessionHandle;

/// When and how often to issue a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSchedule {
    pub command: OutboundCommand,
    pub delay: Option<Duration>,
    pub period: Option<Duration>,
}

impl CommandSchedule {
    /// Issue `command` once, as soon as the session opens
    pub fn once(command: OutboundCommand) -> Self {
        Self {
            command,
            delay: None,
            period: None,
        }
    }

    /// Wait before the first issuance; a zero delay means no wait
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay).filter(|d| !d.is_zero());
        self
    }

    /// Repeat at this period; a zero period means issue once
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = Some(period).filter(|p| !p.is_zero());
        self
    }
}

/// Drive `schedule` on a session until it finishes or the session closes
///
/// Returns how many issuances ran to completion, successful or not. A
/// call cut off by the connection closing still completes: its failure is
/// logged before the driver stops.
pub async fn run_schedule(handle: SessionHandle, schedule: CommandSchedule) -> usize {
    let mut completed = 0;
    tokio::select! {
        biased;
        _ = drive(&handle, &schedule, &mut completed) => {}
        _ = handle.closed() => {
            debug!("Stopping {} schedule for {}: session closed", schedule.command, handle.identity());
        }
    }
    completed
}

async fn drive(handle: &SessionHandle, schedule: &CommandSchedule, completed: &mut usize) {
    if let Some(delay) = schedule.delay {
        tokio::time::sleep(delay).await;
    }

    match schedule.period {
        Some(period) => loop {
            info!("Issuing scheduled {} to {}", schedule.command, handle.identity());
            issue(handle, schedule.command).await;
            *completed += 1;
            tokio::time::sleep(period).await;
        },
        None => {
            issue(handle, schedule.command).await;
            *completed += 1;
        }
    }
}
