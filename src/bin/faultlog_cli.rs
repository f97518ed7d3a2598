//! Operator CLI (spec §6.4): a host-side tool for reading back a fault-log
//! dump pulled from a device's `POST /faults` payload (or forwarded by
//! whatever collects it) and reporting it in a form a field technician can
//! read without decoding JSON by eye.
//!
//! No global mutable configuration from the environment — the dump path is
//! the only input, and runtime config on the device itself flows through
//! §6.3's NVS keys, never through this tool.

use ecowatt_gateway::fault::{FaultEvent, FaultKind, FaultStats, FAULT_LOG_CAPACITY};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::process::ExitCode;

/// Exit codes per spec §6.4.
#[repr(u8)]
enum Exit {
    Success = 0,
    Validation = 1,
    Transport = 2,
    FirmwareUpdate = 3,
    FaultRecovery = 4,
}

/// The dump this tool reads: whatever a device's fault-log and OTA-session
/// report collapses to once serialized. Not the wire format of any single
/// endpoint — a superset a collector would assemble from `/faults` plus the
/// last known OTA state, for a single field-debugging snapshot.
#[derive(Debug, Deserialize)]
struct FaultDump {
    device_id: String,
    firmware_version: String,
    #[serde(default)]
    ota_state: Option<String>,
    fault_stats: FaultStats,
    fault_events: Vec<FaultEvent>,
}

const KNOWN_OTA_STATES: &[&str] = &[
    "idle",
    "checking",
    "manifest_ok",
    "downloading",
    "verifying",
    "activating",
    "validating",
    "done",
    "failed",
    "rolling_back",
];

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let path = match args.next() {
        Some(p) => p,
        None => {
            eprintln!("usage: faultlog-cli <dump.json|->");
            return ExitCode::from(Exit::Validation as u8);
        }
    };

    let raw = match read_input(&path) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("faultlog-cli: could not read dump from '{path}': {e}");
            return ExitCode::from(Exit::Transport as u8);
        }
    };

    let dump: FaultDump = match serde_json::from_str(&raw) {
        Ok(dump) => dump,
        Err(e) => {
            eprintln!("faultlog-cli: '{path}' is not a valid fault dump: {e}");
            return ExitCode::from(Exit::Validation as u8);
        }
    };

    if let Some(reason) = invalid_ota_state(&dump) {
        eprintln!("faultlog-cli: firmware-update state invalid: {reason}");
        return ExitCode::from(Exit::FirmwareUpdate as u8);
    }

    if let Some(reason) = broken_invariant(&dump) {
        eprintln!("faultlog-cli: fault log violates an invariant: {reason}");
        return ExitCode::from(Exit::FaultRecovery as u8);
    }

    print_report(&dump);
    ExitCode::from(Exit::Success as u8)
}

fn read_input(path: &str) -> io::Result<String> {
    if path == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        fs::read_to_string(path)
    }
}

/// Spec §6.4 distinguishes "firmware-update error" (3) from a generic
/// validation error (1): an unrecognized or garbled `ota_state` label means
/// the dump came from (or claims) a firmware-update session this tool
/// doesn't understand, which is specifically an OTA concern.
fn invalid_ota_state(dump: &FaultDump) -> Option<String> {
    match &dump.ota_state {
        Some(state) if !KNOWN_OTA_STATES.contains(&state.as_str()) => {
            Some(format!("unrecognized ota_state '{state}'"))
        }
        _ => None,
    }
}

/// Checks the invariants spec §8 holds for the fault log specifically
/// (ring length ≤ [`FAULT_LOG_CAPACITY`], `recovered` never exceeding
/// `total`) — a dump failing these isn't malformed JSON, it's internally
/// inconsistent, which is a fault-recovery-layer problem rather than a
/// parse error.
fn broken_invariant(dump: &FaultDump) -> Option<String> {
    if dump.fault_events.len() > FAULT_LOG_CAPACITY {
        return Some(format!("{} events exceeds ring capacity {FAULT_LOG_CAPACITY}", dump.fault_events.len()));
    }
    if dump.fault_stats.recovered > dump.fault_stats.total {
        return Some(format!(
            "recovered count {} exceeds total count {}",
            dump.fault_stats.recovered, dump.fault_stats.total
        ));
    }
    let by_kind_total: u64 = dump.fault_stats.by_kind.values().sum();
    if by_kind_total > dump.fault_stats.total {
        return Some(format!("by_kind counts sum to {by_kind_total}, more than total {}", dump.fault_stats.total));
    }
    None
}

fn print_report(dump: &FaultDump) {
    println!("device:   {}", dump.device_id);
    println!("firmware: {}", dump.firmware_version);
    println!("ota:      {}", dump.ota_state.as_deref().unwrap_or("unknown"));
    println!();
    println!(
        "faults:   {} total, {} recovered ({} outstanding)",
        dump.fault_stats.total,
        dump.fault_stats.recovered,
        dump.fault_stats.total - dump.fault_stats.recovered
    );
    for (kind, count) in sorted_by_kind(&dump.fault_stats) {
        println!("            {kind:<16} {count}");
    }
    println!();

    if dump.fault_events.is_empty() {
        println!("no events in the ring");
        return;
    }
    println!("events (oldest first, {} of ring capacity {FAULT_LOG_CAPACITY}):", dump.fault_events.len());
    for event in &dump.fault_events {
        println!("  {}", FormattedEvent(event));
    }
}

fn sorted_by_kind(stats: &FaultStats) -> Vec<(FaultKind, u64)> {
    let mut entries: Vec<_> = stats.by_kind.iter().map(|(k, v)| (*k, *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| format!("{:?}", a.0).cmp(&format!("{:?}", b.0))));
    entries
}

struct FormattedEvent<'a>(&'a FaultEvent);

impl fmt::Display for FormattedEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = self.0;
        write!(
            f,
            "[{}] {:?} ({}) {} - {}{}",
            e.timestamp_ms,
            e.kind,
            e.origin_component,
            if e.recovered { "recovered" } else { "outstanding" },
            e.description,
            if e.retries_used > 0 { format!(", {} retries", e.retries_used) } else { String::new() },
        )
    }
}
