//! Remote command execution: the closed set of actions the server can
//! invoke on the gateway (spec §4.7, C10).

use crate::fault::FaultLog;
use crate::modbus::{build_write_single_request, parse_write_response, ReadResponse};
use crate::registers::find_by_name;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A command as received from the server's command-poll response.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    SetPowerPercentage { percentage: i32 },
    WriteRegister { register_name: String, value: u16 },
    ReadFaultLog,
    ResetFaultStats,
    GetPeripheralStats,
    Reboot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandResult {
    Ack { warning: Option<String> },
    FaultLog { events_json: String },
    PeripheralStats { free_heap: u32, uptime_ms: u64 },
    Reboot,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown register name: {0}")]
    UnknownRegister(String),
    #[error("modbus write failed: {0}")]
    WriteFailed(String),
    #[error("device rejected write with exception {0:#04X}")]
    Exception(u8),
}

/// Anything a command handler needs to talk to the device and the rest of
/// the gateway's state, kept narrow so tests can supply fakes.
pub trait CommandContext {
    fn write_holding_register(&mut self, address: u16, value: u16) -> Result<(), String>;
    fn free_heap(&self) -> u32;
    fn uptime_ms(&self) -> u64;
    fn request_reboot(&mut self);
}

/// Percentage is clamped to `[0, 100]`; an out-of-range request still
/// executes at the clamped value but returns a warning (spec §4.7 "clamp
/// and warn, do not reject").
pub fn clamp_percentage(requested: i32) -> (u16, Option<String>) {
    if requested < 0 {
        (0, Some(format!("requested percentage {requested} clamped to 0")))
    } else if requested > 100 {
        (100, Some(format!("requested percentage {requested} clamped to 100")))
    } else {
        (requested as u16, None)
    }
}

pub fn execute(
    command: Command,
    ctx: &mut dyn CommandContext,
    fault_log: &mut FaultLog,
) -> Result<CommandResult, CommandError> {
    match command {
        Command::SetPowerPercentage { percentage } => {
            let (clamped, warning) = clamp_percentage(percentage);
            let entry = find_by_name("ExportPowerPercentage")
                .ok_or_else(|| CommandError::UnknownRegister("ExportPowerPercentage".to_string()))?;
            ctx.write_holding_register(entry.address, clamped).map_err(CommandError::WriteFailed)?;
            Ok(CommandResult::Ack { warning })
        }
        Command::WriteRegister { register_name, value } => {
            let entry = find_by_name(&register_name).ok_or(CommandError::UnknownRegister(register_name))?;
            ctx.write_holding_register(entry.address, value).map_err(CommandError::WriteFailed)?;
            Ok(CommandResult::Ack { warning: None })
        }
        Command::ReadFaultLog => {
            let events_json = serde_json::to_string(&fault_log.events()).unwrap_or_default();
            Ok(CommandResult::FaultLog { events_json })
        }
        Command::ResetFaultStats => {
            fault_log.clear_stats();
            Ok(CommandResult::Ack { warning: None })
        }
        Command::GetPeripheralStats => {
            Ok(CommandResult::PeripheralStats { free_heap: ctx.free_heap(), uptime_ms: ctx.uptime_ms() })
        }
        Command::Reboot => {
            ctx.request_reboot();
            Ok(CommandResult::Reboot)
        }
    }
}

/// Build and validate the Modbus frame exchange for a register write,
/// without depending on a live serial port — acquisition.rs's
/// `SerialPort` owns the actual I/O; this is the pure framing half used by
/// both the real write path and tests.
pub fn build_and_check_write(slave: u8, address: u16, value: u16, response_frame: &[u8]) -> Result<(), CommandError> {
    match parse_write_response(response_frame, slave, address, value) {
        Ok(ReadResponse::Ok(_)) => Ok(()),
        Ok(ReadResponse::Exception(code)) => Err(CommandError::Exception(code)),
        Err(e) => Err(CommandError::WriteFailed(e.to_string())),
    }
}
