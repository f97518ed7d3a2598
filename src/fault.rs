//! Fault classification and the persisted event-log ring (spec §4.9, C5).
//!
//! Every recoverable/unrecoverable failure from any other component funnels
//! through [`FaultLog::record`], which classifies it, appends-or-amends the
//! ring, and tracks running counters. The ring never grows past
//! [`FAULT_LOG_CAPACITY`]; eviction overwrites the oldest entry and never
//! touches the counters (spec §4.9 "Eviction").

use crate::registers::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const FAULT_LOG_CAPACITY: usize = 50;

/// Closed set of fault kinds (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultKind {
    ModbusException,
    ModbusTimeout,
    CrcError,
    CorruptFrame,
    BufferOverflow,
    HttpError,
    OtaFault,
    Unknown,
}

/// The taxonomy from spec §7, used to decide the propagation policy at the
/// call site. `FaultKind` is the wire/log representation; `ErrorClass` is
/// the policy label a component consults before deciding to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransientTransport,
    TransientDevice,
    PermanentConfig,
    CryptoFailure,
    IntegrityFailure,
    Overflow,
    Unknown,
}

impl FaultKind {
    pub fn error_class(self) -> ErrorClass {
        match self {
            FaultKind::ModbusTimeout | FaultKind::HttpError => ErrorClass::TransientTransport,
            FaultKind::CrcError | FaultKind::CorruptFrame => ErrorClass::TransientDevice,
            FaultKind::ModbusException => ErrorClass::TransientDevice,
            FaultKind::BufferOverflow => ErrorClass::Overflow,
            FaultKind::OtaFault => ErrorClass::IntegrityFailure,
            FaultKind::Unknown => ErrorClass::Unknown,
        }
    }
}

/// One persisted fault record (spec §3 FaultEvent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultEvent {
    pub kind: FaultKind,
    pub origin_component: &'static str,
    pub description: String,
    pub exception_code: u8,
    pub recovered: bool,
    pub retries_used: u8,
    pub timestamp_ms: u64,
}

impl FaultEvent {
    pub fn new(kind: FaultKind, origin_component: &'static str, description: impl Into<String>) -> Self {
        Self {
            kind,
            origin_component,
            description: description.into(),
            exception_code: 0,
            recovered: false,
            retries_used: 0,
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_exception_code(mut self, code: u8) -> Self {
        self.exception_code = code;
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.retries_used = retries;
        self
    }

    pub fn recovered(mut self, recovered: bool) -> Self {
        self.recovered = recovered;
        self
    }
}

/// Aggregate counters exposed alongside the serialized log (spec §4.9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultStats {
    pub total: u64,
    pub recovered: u64,
    pub by_kind: HashMap<FaultKind, u64>,
}

/// Bounded ring of the last [`FAULT_LOG_CAPACITY`] fault events, plus
/// never-decremented counters.
#[derive(Debug, Clone)]
pub struct FaultLog {
    ring: Vec<FaultEvent>,
    write_cursor: usize,
    stats: FaultStats,
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultLog {
    pub fn new() -> Self {
        Self {
            ring: Vec::with_capacity(FAULT_LOG_CAPACITY),
            write_cursor: 0,
            stats: FaultStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    /// Events in the log, oldest first. While the ring hasn't wrapped yet,
    /// `write_cursor` is the append point and physical order already is
    /// chronological order. Once it wraps, slot `write_cursor` holds the
    /// oldest surviving event and slot `write_cursor - 1` the newest, so the
    /// chronological view has to rotate the physical buffer to start there.
    pub fn events(&self) -> Vec<FaultEvent> {
        if self.ring.len() < FAULT_LOG_CAPACITY {
            self.ring.clone()
        } else {
            let mut ordered = Vec::with_capacity(FAULT_LOG_CAPACITY);
            ordered.extend_from_slice(&self.ring[self.write_cursor..]);
            ordered.extend_from_slice(&self.ring[..self.write_cursor]);
            ordered
        }
    }

    /// Record a new event. If the most recent event for the same
    /// `(kind, origin_component)` has `recovered == false` and this one is
    /// `recovered == true`, amend that entry in place instead of appending
    /// (spec §4.9 "Recovery side-effect") — this is how a single
    /// `CRC_ERROR` with `recovered=false` followed by a successful retry
    /// becomes one amended event, not two.
    pub fn record(&mut self, event: FaultEvent) {
        if event.recovered {
            if let Some(existing) = self
                .ring
                .iter_mut()
                .rev()
                .find(|e| e.kind == event.kind && e.origin_component == event.origin_component && !e.recovered)
            {
                *existing = event;
                return;
            }
        }

        self.stats.total += 1;
        if event.recovered {
            self.stats.recovered += 1;
        }
        *self.stats.by_kind.entry(event.kind).or_insert(0) += 1;

        if self.ring.len() < FAULT_LOG_CAPACITY {
            self.ring.push(event);
        } else {
            self.ring[self.write_cursor] = event;
            self.write_cursor = (self.write_cursor + 1) % FAULT_LOG_CAPACITY;
        }
    }

    pub fn clear_stats(&mut self) {
        self.stats = FaultStats::default();
    }
}

/// Classify a Modbus exception code per spec §4.9 / §6.1.
pub fn classify_modbus_exception(code: u8) -> (FaultKind, bool) {
    let recoverable = code >= 0x04;
    (FaultKind::ModbusException, recoverable)
}

/// Classify an HTTP outcome per spec §4.9 (`-1` denotes a transport-layer
/// failure with no status line).
pub fn classify_http(status_or_transport_error: i32) -> (FaultKind, bool) {
    let recoverable = matches!(status_or_transport_error, -1 | 503);
    (FaultKind::HttpError, recoverable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_without_touching_stats() {
        let mut log = FaultLog::new();
        for i in 0..(FAULT_LOG_CAPACITY + 5) {
            log.record(FaultEvent::new(FaultKind::CrcError, "test", format!("e{i}")));
        }
        assert_eq!(log.len(), FAULT_LOG_CAPACITY);
        assert_eq!(log.stats().total, (FAULT_LOG_CAPACITY + 5) as u64);
        // oldest 5 were evicted, first remaining should be "e5"
        assert_eq!(log.events()[0].description, "e5");
    }

    #[test]
    fn recovery_amends_in_place_not_appended() {
        let mut log = FaultLog::new();
        log.record(FaultEvent::new(FaultKind::CrcError, "acquisition", "crc failed").recovered(false));
        assert_eq!(log.len(), 1);
        log.record(FaultEvent::new(FaultKind::CrcError, "acquisition", "retry ok").recovered(true));
        assert_eq!(log.len(), 1, "amend, not append");
        assert!(log.events()[0].recovered);
        assert_eq!(log.stats().total, 2, "stats count both records");
    }

    #[test]
    fn modbus_exception_classification_boundary() {
        assert!(!classify_modbus_exception(0x03).1);
        assert!(classify_modbus_exception(0x04).1);
        assert!(classify_modbus_exception(0x0B).1);
    }

    #[test]
    fn http_classification() {
        assert!(classify_http(-1).1);
        assert!(classify_http(503).1);
        assert!(!classify_http(404).1);
        assert!(!classify_http(500).1);
    }
}
