//! Register polling: builds one contiguous read-holding-registers request
//! per poll, runs it over [`SerialPort`] with retry/backoff, and turns the
//! result into a [`crate::registers::Sample`] (spec §4.4, §6.1, C6).

use crate::fault::{classify_modbus_exception, FaultEvent, FaultKind};
use crate::modbus::{build_read_request, parse_read_response, FrameError, ReadResponse};
use crate::registers::{now_ms, RegisterSet, Sample};
use std::time::Duration;
use thiserror::Error;

/// Narrow seam over the RS-485/UART link so acquisition can be host-tested
/// against a scripted fake instead of real hardware.
pub trait SerialPort {
    fn write(&mut self, frame: &[u8]) -> std::io::Result<()>;
    fn read_frame(&mut self, timeout: Duration) -> std::io::Result<Vec<u8>>;
    fn open(&mut self) -> std::io::Result<()>;
    fn close(&mut self) -> std::io::Result<()>;
}

pub const MAX_RETRIES: u8 = 3;
/// Recoverable Modbus exceptions (0x04..=0x0B) get fewer retries than
/// transport/frame failures (spec §4.4 "retry/backoff").
pub const MAX_EXCEPTION_RETRIES: u8 = 2;
pub const BASE_BACKOFF: Duration = Duration::from_millis(500);
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);
pub const READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Exponential backoff, doubling from [`BASE_BACKOFF`] and capped at
/// [`MAX_BACKOFF`] (spec §6.1 "retry/backoff").
pub fn backoff_for_attempt(attempt: u8) -> Duration {
    let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
    let millis = (BASE_BACKOFF.as_millis() as u32).saturating_mul(factor);
    Duration::from_millis(millis as u64).min(MAX_BACKOFF)
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("serial I/O error: {0}")]
    Io(String),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("non-recoverable modbus exception {0:#04X}")]
    NonRecoverableException(u8),
    #[error("exhausted retries")]
    RetriesExhausted,
}

/// Poll the inverter once for every register in `register_set`, retrying
/// recoverable failures up to [`MAX_RETRIES`] with exponential backoff.
/// Exception codes 0x01-0x03 are non-recoverable (spec §6.1) and return
/// immediately without consuming a retry.
pub fn poll_once(
    port: &mut dyn SerialPort,
    slave: u8,
    register_set: &RegisterSet,
    on_fault: &mut dyn FnMut(FaultEvent),
) -> Result<Sample, PollError> {
    let (start, end) = register_set.address_span();
    let quantity = end - start + 1;

    let mut attempt = 0u8;
    // Kind of the most recent failure, so a later success amends the right
    // event (spec §4.9 "Recovery side-effect") instead of always claiming a
    // timeout was what got retried.
    let mut last_fault_kind = FaultKind::ModbusTimeout;
    loop {
        let request = build_read_request(slave, start, quantity);
        let outcome = port
            .write(&request)
            .and_then(|_| port.read_frame(READ_TIMEOUT))
            .map_err(AttemptError::Io)
            .and_then(|frame| parse_read_response(&frame, slave, quantity).map_err(AttemptError::Frame));

        match outcome {
            Ok(ReadResponse::Ok(values)) => {
                if attempt > 0 {
                    on_fault(
                        FaultEvent::new(last_fault_kind, "acquisition", "recovered after retry")
                            .with_retries(attempt)
                            .recovered(true),
                    );
                }
                return build_sample(register_set, start, values);
            }
            Ok(ReadResponse::Exception(code)) => {
                let (kind, recoverable) = classify_modbus_exception(code);
                if !recoverable || attempt >= MAX_EXCEPTION_RETRIES {
                    on_fault(
                        FaultEvent::new(kind, "acquisition", format!("exception {code:#04X}"))
                            .with_exception_code(code)
                            .with_retries(attempt)
                            .recovered(false),
                    );
                    return Err(PollError::NonRecoverableException(code));
                }
                last_fault_kind = kind;
            }
            Err(AttemptError::Io(e)) => {
                if attempt >= MAX_RETRIES {
                    on_fault(
                        FaultEvent::new(FaultKind::ModbusTimeout, "acquisition", e.to_string())
                            .with_retries(attempt)
                            .recovered(false),
                    );
                    return Err(PollError::RetriesExhausted);
                }
                last_fault_kind = FaultKind::ModbusTimeout;
            }
            Err(AttemptError::Frame(frame_err)) => {
                // CRC mismatch gets its own kind (spec §4.9); every other
                // frame-shape failure is a structurally impossible frame.
                let kind = match frame_err {
                    FrameError::CrcMismatch { .. } => FaultKind::CrcError,
                    _ => FaultKind::CorruptFrame,
                };
                if attempt >= MAX_RETRIES {
                    on_fault(
                        FaultEvent::new(kind, "acquisition", frame_err.to_string())
                            .with_retries(attempt)
                            .recovered(false),
                    );
                    return Err(PollError::RetriesExhausted);
                }
                last_fault_kind = kind;
            }
        }

        attempt += 1;
        std::thread::sleep(backoff_for_attempt(attempt - 1));
    }
}

/// Distinguishes a transport-level I/O failure from a parsed-but-invalid
/// frame so the two map to different `FaultKind`s at the retry-exhaustion
/// point (spec §4.9).
enum AttemptError {
    Io(std::io::Error),
    Frame(FrameError),
}

fn build_sample(register_set: &RegisterSet, span_start: u16, values: Vec<u16>) -> Result<Sample, PollError> {
    use crate::registers::find_by_id;

    let mut selected = Vec::with_capacity(register_set.len());
    for &id in register_set.ids() {
        let entry = find_by_id(id).expect("register set only contains known ids");
        let offset = (entry.address - span_start) as usize;
        let value = *values.get(offset).ok_or(PollError::RetriesExhausted)?;
        selected.push(value);
    }
    Sample::new(now_ms(), register_set.clone(), selected).map_err(|_| PollError::RetriesExhausted)
}
