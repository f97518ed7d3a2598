//! Static register map and the sample/batch types built on top of it.
//!
//! The register map is compile-time data: a small, dense table of Modbus
//! holding-register addresses the inverter exposes. Everything downstream
//! (acquisition, compression, command execution) indexes into this table by
//! `RegisterId` rather than carrying addresses around loose.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable, dense identifier for an entry in [`REGISTER_MAP`].
pub type RegisterId = u8;

/// One entry of the static register map: `{id, address, name}` from spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterEntry {
    pub id: RegisterId,
    pub address: u16,
    pub name: &'static str,
}

/// The inverter's register table. Kept intentionally small (`<= 32` entries
/// per spec §3); extend here, never at runtime.
pub const REGISTER_MAP: &[RegisterEntry] = &[
    RegisterEntry { id: 0, address: 0x0000, name: "Vac1" },
    RegisterEntry { id: 1, address: 0x0001, name: "Iac1" },
    RegisterEntry { id: 2, address: 0x0002, name: "Fac1" },
    RegisterEntry { id: 3, address: 0x0003, name: "Vpv1" },
    RegisterEntry { id: 4, address: 0x0004, name: "Vpv2" },
    RegisterEntry { id: 5, address: 0x0005, name: "Ipv1" },
    RegisterEntry { id: 6, address: 0x0006, name: "Ipv2" },
    RegisterEntry { id: 7, address: 0x0007, name: "Pac" },
    RegisterEntry { id: 8, address: 0x0008, name: "Temperature" },
    RegisterEntry { id: 9, address: 0x0009, name: "EnergyToday" },
    RegisterEntry { id: 10, address: 0x000A, name: "EnergyTotalHi" },
    RegisterEntry { id: 11, address: 0x000B, name: "EnergyTotalLo" },
    // The "export power percentage" register that `set_power_percentage`
    // writes to (spec §6.1).
    RegisterEntry { id: 12, address: 0x0032, name: "ExportPowerPercentage" },
];

/// Maximum register-set size a configuration document may select (spec §4.8).
pub const MAX_SELECTED_REGISTERS: usize = 10;

pub fn find_by_id(id: RegisterId) -> Option<&'static RegisterEntry> {
    REGISTER_MAP.iter().find(|e| e.id == id)
}

pub fn find_by_name(name: &str) -> Option<&'static RegisterEntry> {
    REGISTER_MAP.iter().find(|e| e.name == name)
}

pub fn find_by_address(address: u16) -> Option<&'static RegisterEntry> {
    REGISTER_MAP.iter().find(|e| e.address == address)
}

/// An ordered subset of [`REGISTER_MAP`] selected for acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSet {
    ids: Vec<RegisterId>,
}

impl RegisterSet {
    pub fn new(ids: Vec<RegisterId>) -> anyhow::Result<Self> {
        if ids.is_empty() {
            anyhow::bail!("register set must be non-empty");
        }
        if ids.len() > MAX_SELECTED_REGISTERS {
            anyhow::bail!(
                "register set has {} entries, max is {}",
                ids.len(),
                MAX_SELECTED_REGISTERS
            );
        }
        for id in &ids {
            if find_by_id(*id).is_none() {
                anyhow::bail!("unknown register id {}", id);
            }
        }
        Ok(Self { ids })
    }

    pub fn ids(&self) -> &[RegisterId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Contiguous `min..=max` address span covering every selected register,
    /// used to build a single read-holding-registers request (spec §4.4).
    pub fn address_span(&self) -> (u16, u16) {
        let addrs: Vec<u16> = self
            .ids
            .iter()
            .filter_map(|id| find_by_id(*id).map(|e| e.address))
            .collect();
        let min = *addrs.iter().min().expect("non-empty by construction");
        let max = *addrs.iter().max().expect("non-empty by construction");
        (min, max)
    }
}

/// Milliseconds since the Unix epoch, UTC. This is the one timestamp
/// representation used everywhere on the wire (spec §9, open question).
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A single poll result: one reading per selected register, immutable once
/// constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub timestamp_ms: u64,
    pub register_set: RegisterSet,
    values: Vec<u16>,
}

impl Sample {
    pub fn new(timestamp_ms: u64, register_set: RegisterSet, values: Vec<u16>) -> anyhow::Result<Self> {
        if values.len() != register_set.len() {
            anyhow::bail!(
                "sample has {} values but register set selects {}",
                values.len(),
                register_set.len()
            );
        }
        Ok(Self { timestamp_ms, register_set, values })
    }

    /// Value for `id`, positional lookup against `register_set`.
    pub fn value(&self, id: RegisterId) -> Option<u16> {
        self.register_set
            .ids()
            .iter()
            .position(|&r| r == id)
            .map(|idx| self.values[idx])
    }

    pub fn values(&self) -> &[u16] {
        &self.values
    }
}

/// An ordered sequence of [`Sample`]s awaiting compression (spec §3 Batch).
#[derive(Debug, Clone)]
pub struct Batch {
    target_size: u8,
    register_set: RegisterSet,
    samples: Vec<Sample>,
}

/// Clamp bounds for the dynamically derived batch target size (spec §4.3).
pub const BATCH_TARGET_MIN: u8 = 1;
pub const BATCH_TARGET_MAX: u8 = 50;

/// Derive `target_size` from the poll/upload cadence, clamped to
/// `[BATCH_TARGET_MIN, BATCH_TARGET_MAX]`.
pub fn derive_target_size(poll_period_secs: u32, upload_period_secs: u32) -> u8 {
    if poll_period_secs == 0 {
        return BATCH_TARGET_MAX;
    }
    let raw = upload_period_secs / poll_period_secs.max(1);
    raw.clamp(BATCH_TARGET_MIN as u32, BATCH_TARGET_MAX as u32) as u8
}

impl Batch {
    pub fn new(target_size: u8, register_set: RegisterSet) -> Self {
        Self {
            target_size: target_size.clamp(BATCH_TARGET_MIN, BATCH_TARGET_MAX),
            register_set,
            samples: Vec::new(),
        }
    }

    pub fn target_size(&self) -> u8 {
        self.target_size
    }

    pub fn set_target_size(&mut self, target_size: u8) {
        self.target_size = target_size.clamp(BATCH_TARGET_MIN, BATCH_TARGET_MAX);
    }

    pub fn register_set(&self) -> &RegisterSet {
        &self.register_set
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.target_size as usize
    }

    /// Append a sample. Fails if the sample's register set doesn't match the
    /// batch's (spec §3 invariant).
    pub fn push(&mut self, sample: Sample) -> anyhow::Result<()> {
        if sample.register_set != self.register_set {
            anyhow::bail!("sample register set does not match batch register set");
        }
        self.samples.push(sample);
        Ok(())
    }

    /// Reset to empty, keeping the register set and (possibly updated)
    /// target size.
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Take ownership of the accumulated samples, leaving the batch empty.
    pub fn drain(&mut self) -> Vec<Sample> {
        std::mem::take(&mut self.samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_set_rejects_empty_and_oversized() {
        assert!(RegisterSet::new(vec![]).is_err());
        let too_many: Vec<RegisterId> = (0..=MAX_SELECTED_REGISTERS as RegisterId).collect();
        assert!(RegisterSet::new(too_many).is_err());
    }

    #[test]
    fn register_set_address_span() {
        let rs = RegisterSet::new(vec![0, 7, 2]).unwrap();
        assert_eq!(rs.address_span(), (0x0000, 0x0007));
    }

    #[test]
    fn derive_target_size_clamped() {
        assert_eq!(derive_target_size(2, 15), 7);
        assert_eq!(derive_target_size(2, 1000), BATCH_TARGET_MAX);
        assert_eq!(derive_target_size(100, 15), BATCH_TARGET_MIN);
    }

    #[test]
    fn batch_rejects_mismatched_register_set() {
        let rs_a = RegisterSet::new(vec![0, 1]).unwrap();
        let rs_b = RegisterSet::new(vec![0]).unwrap();
        let mut batch = Batch::new(3, rs_a);
        let bad_sample = Sample::new(0, rs_b, vec![1]).unwrap();
        assert!(batch.push(bad_sample).is_err());
    }

    #[test]
    fn batch_fills_and_resets() {
        let rs = RegisterSet::new(vec![0, 1]).unwrap();
        let mut batch = Batch::new(2, rs.clone());
        assert!(!batch.is_full());
        batch.push(Sample::new(1, rs.clone(), vec![10, 20]).unwrap()).unwrap();
        batch.push(Sample::new(2, rs.clone(), vec![11, 21]).unwrap()).unwrap();
        assert!(batch.is_full());
        let drained = batch.drain();
        assert_eq!(drained.len(), 2);
        assert!(batch.is_empty());
    }
}
