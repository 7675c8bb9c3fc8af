//! Turning the running programs' intervals into device commands for one
//! minute, and issuing them one at a time with a fixed pause after each.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::actuator::{Actuator, DeviceState};
use crate::program::{DeviceId, DeviceInterval};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCommand {
    pub program_id: String,
    pub device_id: DeviceId,
    pub state: DeviceState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: DeviceCommand,
    /// When the actuator call returned.
    pub at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequenceReport {
    pub issued: usize,
    pub failed: usize,
}

impl SequenceReport {
    pub fn from_outcomes(outcomes: &[CommandOutcome]) -> Self {
        Self {
            issued: outcomes.len(),
            failed: outcomes.iter().filter(|o| o.error.is_some()).count(),
        }
    }
}

/// Commands due at `minute`: every OFF (interval ends now) before any ON
/// (interval starts now). A device whose next interval starts exactly when
/// the previous one ends is therefore left ON.
pub fn plan_commands<'a>(
    running: impl IntoIterator<Item = (&'a str, &'a [DeviceInterval])>,
    minute: DateTime<Utc>,
) -> Vec<DeviceCommand> {
    let mut off = Vec::new();
    let mut on = Vec::new();

    for (program_id, intervals) in running {
        for di in intervals {
            if di.interval.end == minute {
                off.push(DeviceCommand {
                    program_id: program_id.to_string(),
                    device_id: di.device_id,
                    state: DeviceState::Off,
                });
            }
            if di.interval.start == minute {
                on.push(DeviceCommand {
                    program_id: program_id.to_string(),
                    device_id: di.device_id,
                    state: DeviceState::On,
                });
            }
        }
    }

    off.extend(on);
    off
}

/// Issue `commands` strictly in order. Each call is awaited before the
/// next one starts, and `metering` is slept after every command whether
/// it succeeded or not.
pub async fn execute(
    actuator: &dyn Actuator,
    commands: Vec<DeviceCommand>,
    metering: Duration,
) -> Vec<CommandOutcome> {
    let mut outcomes = Vec::with_capacity(commands.len());

    for command in commands {
        let result = actuator.set_state(command.device_id, command.state).await;
        let at = Utc::now();
        let error = match result {
            Ok(()) => {
                info!(
                    program_id = %command.program_id,
                    device_id = command.device_id,
                    state = %command.state,
                    "device switched"
                );
                None
            }
            Err(e) => {
                error!(
                    program_id = %command.program_id,
                    device_id = command.device_id,
                    state = %command.state,
                    "device command failed: {e}"
                );
                Some(e.to_string())
            }
        };
        outcomes.push(CommandOutcome { command, at, error });

        tokio::time::sleep(metering).await;
    }

    outcomes
}

// ===========================================================================
// Tests
// ===========================================================================
