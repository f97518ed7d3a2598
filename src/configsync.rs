//! Remote configuration sync: validates an incoming config document against
//! the exhaustive key table, applies it atomically, and reports an
//! acknowledgement snapshot back to the server (spec §4.8, C11).

use crate::config::{GatewayConfig, PersistentStore};
use crate::registers::{RegisterId, RegisterSet, MAX_SELECTED_REGISTERS};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire shape of an incoming config document. Every field is optional: a
/// sync may touch any subset of keys, and omitted keys keep their current
/// value (spec §4.8). Field names carry `#[serde(rename)]` to match the
/// wire keys in spec §4.8's table exactly, since they don't match this
/// crate's own internal field names.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigDocument {
    #[serde(rename = "sampling_interval")]
    pub poll_period_secs: Option<u32>,
    #[serde(rename = "upload_interval")]
    pub upload_period_secs: Option<u32>,
    #[serde(rename = "config_poll_interval")]
    pub config_sync_period_secs: Option<u32>,
    #[serde(rename = "command_poll_interval")]
    pub command_poll_period_secs: Option<u32>,
    #[serde(rename = "firmware_check_interval")]
    pub firmware_check_period_secs: Option<u32>,
    #[serde(rename = "energy_poll_interval")]
    pub energy_period_secs: Option<u32>,
    /// Register *names* (spec §4.8: "list of register names"), resolved
    /// against [`crate::registers::REGISTER_MAP`] during validation.
    #[serde(rename = "registers")]
    pub register_names: Option<Vec<String>>,
    pub server_url: Option<String>,
    pub device_id: Option<String>,
    #[serde(default)]
    pub power_management: Option<PowerManagementDocument>,
}

/// Spec §4.8's `power_management.*` keys. `techniques` is a bitmask; only
/// bit `0x08` (peripheral gating) is honoured, the rest is reserved.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct PowerManagementDocument {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub techniques: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigAck {
    pub applied: GatewayConfigSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayConfigSnapshot {
    pub poll_period_secs: u32,
    pub upload_period_secs: u32,
    pub config_sync_period_secs: u32,
    pub command_poll_period_secs: u32,
    pub firmware_check_period_secs: u32,
    pub energy_period_secs: u32,
    pub register_set: Vec<RegisterId>,
    pub server_url: String,
    pub device_id: String,
    pub power_enabled: bool,
    pub power_techniques: u8,
}

impl From<&GatewayConfig> for GatewayConfigSnapshot {
    fn from(cfg: &GatewayConfig) -> Self {
        Self {
            poll_period_secs: cfg.poll_period_secs,
            upload_period_secs: cfg.upload_period_secs,
            config_sync_period_secs: cfg.config_sync_period_secs,
            command_poll_period_secs: cfg.command_poll_period_secs,
            firmware_check_period_secs: cfg.firmware_check_period_secs,
            energy_period_secs: cfg.energy_period_secs,
            register_set: cfg.register_set.clone(),
            server_url: cfg.server_url.clone(),
            device_id: cfg.device_id.clone(),
            power_enabled: cfg.power_enabled,
            power_techniques: cfg.power_techniques,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigSyncError {
    #[error("{0} must be in {1}..={2}, got {3}")]
    OutOfRange(&'static str, u32, u32, u32),
    #[error("register set invalid: {0}")]
    BadRegisterSet(String),
    #[error("unknown register name: {0}")]
    UnknownRegisterName(String),
    #[error("server_url must not be empty")]
    EmptyServerUrl,
    #[error("device_id must not be empty")]
    EmptyDeviceId,
}

/// Per-key bounds from spec §4.8's config table.
fn check_range(key: &'static str, v: u32, min: u32, max: u32) -> Result<(), ConfigSyncError> {
    if v < min || v > max {
        return Err(ConfigSyncError::OutOfRange(key, min, max, v));
    }
    Ok(())
}

/// Validate every field the document sets, against the exhaustive key
/// table (spec §4.8). Returns the would-be config without mutating
/// anything, so the caller can apply all-or-nothing.
fn validate(current: &GatewayConfig, doc: &ConfigDocument) -> Result<GatewayConfig, ConfigSyncError> {
    let mut next = current.clone();

    if let Some(v) = doc.poll_period_secs {
        check_range("poll_period_secs", v, 1, 3600)?;
        next.poll_period_secs = v;
    }
    if let Some(v) = doc.upload_period_secs {
        check_range("upload_period_secs", v, 5, 3600)?;
        next.upload_period_secs = v;
    }
    if let Some(v) = doc.config_sync_period_secs {
        check_range("config_sync_period_secs", v, 5, 3600)?;
        next.config_sync_period_secs = v;
    }
    if let Some(v) = doc.command_poll_period_secs {
        check_range("command_poll_period_secs", v, 5, 3600)?;
        next.command_poll_period_secs = v;
    }
    if let Some(v) = doc.firmware_check_period_secs {
        check_range("firmware_check_period_secs", v, 30, 86400)?;
        next.firmware_check_period_secs = v;
    }
    if let Some(v) = doc.energy_period_secs {
        check_range("energy_period_secs", v, 1, 3600)?;
        next.energy_period_secs = v;
    }
    if let Some(names) = &doc.register_names {
        if names.is_empty() || names.len() > MAX_SELECTED_REGISTERS {
            return Err(ConfigSyncError::BadRegisterSet(format!(
                "{} entries, must be 1..={}",
                names.len(),
                MAX_SELECTED_REGISTERS
            )));
        }
        let ids: Vec<RegisterId> = names
            .iter()
            .map(|name| crate::registers::find_by_name(name).map(|e| e.id).ok_or_else(|| ConfigSyncError::UnknownRegisterName(name.clone())))
            .collect::<Result<_, _>>()?;
        RegisterSet::new(ids.clone()).map_err(|e| ConfigSyncError::BadRegisterSet(e.to_string()))?;
        next.register_set = ids;
    }
    if let Some(url) = &doc.server_url {
        if url.is_empty() {
            return Err(ConfigSyncError::EmptyServerUrl);
        }
        next.server_url = url.clone();
    }
    if let Some(id) = &doc.device_id {
        if id.is_empty() {
            return Err(ConfigSyncError::EmptyDeviceId);
        }
        next.device_id = id.clone();
    }
    if let Some(pm) = &doc.power_management {
        next.power_enabled = pm.enabled;
        next.power_techniques = pm.techniques;
    }

    Ok(next)
}

/// Validate and apply `doc` atomically: either every field it sets is
/// persisted and committed, or none are (spec §4.8 "all-or-nothing").
/// Applying the same document twice in a row is idempotent — the second
/// apply validates and persists the identical values again, producing the
/// same acknowledgement.
pub fn apply(
    store: &mut dyn PersistentStore,
    current: &GatewayConfig,
    doc: &ConfigDocument,
) -> Result<ConfigAck, ConfigSyncError> {
    let next = validate(current, doc)?;
    next.save(store).map_err(|_| ConfigSyncError::EmptyServerUrl)?; // save() only fails on serialization, which validate() already ruled out
    Ok(ConfigAck { applied: GatewayConfigSnapshot::from(&next) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryStore;

    #[test]
    fn valid_partial_document_applies_only_named_fields() {
        let mut store = InMemoryStore::new();
        let current = GatewayConfig::default();
        let doc = ConfigDocument { poll_period_secs: Some(5), ..Default::default() };
        let ack = apply(&mut store, &current, &doc).unwrap();
        assert_eq!(ack.applied.poll_period_secs, 5);
        assert_eq!(ack.applied.upload_period_secs, current.upload_period_secs);

        let reloaded = GatewayConfig::load(&store);
        assert_eq!(reloaded.poll_period_secs, 5);
    }

    #[test]
    fn zero_period_rejected_and_nothing_persisted() {
        let mut store = InMemoryStore::new();
        let current = GatewayConfig::default();
        let doc = ConfigDocument { poll_period_secs: Some(0), ..Default::default() };
        assert!(apply(&mut store, &current, &doc).is_err());
        assert_eq!(store.commit_count(), 0);
    }

    #[test]
    fn oversized_register_set_rejected() {
        let mut store = InMemoryStore::new();
        let current = GatewayConfig::default();
        let names: Vec<String> = crate::registers::REGISTER_MAP.iter().take(MAX_SELECTED_REGISTERS + 1).map(|e| e.name.to_string()).collect();
        let doc = ConfigDocument { register_names: Some(names), ..Default::default() };
        assert!(apply(&mut store, &current, &doc).is_err());
    }

    #[test]
    fn unknown_register_name_rejected() {
        let mut store = InMemoryStore::new();
        let current = GatewayConfig::default();
        let doc = ConfigDocument { register_names: Some(vec!["NoSuchRegister".to_string()]), ..Default::default() };
        assert_eq!(
            apply(&mut store, &current, &doc).unwrap_err(),
            ConfigSyncError::UnknownRegisterName("NoSuchRegister".to_string())
        );
    }

    #[test]
    fn valid_register_names_resolve_to_ids() {
        let mut store = InMemoryStore::new();
        let current = GatewayConfig::default();
        let doc = ConfigDocument { register_names: Some(vec!["Vac1".to_string(), "Pac".to_string()]), ..Default::default() };
        let ack = apply(&mut store, &current, &doc).unwrap();
        assert_eq!(ack.applied.register_set, vec![0, 7]);
    }

    #[test]
    fn firmware_check_period_below_minimum_rejected() {
        let mut store = InMemoryStore::new();
        let current = GatewayConfig::default();
        let doc = ConfigDocument { firmware_check_period_secs: Some(10), ..Default::default() };
        assert_eq!(
            apply(&mut store, &current, &doc).unwrap_err(),
            ConfigSyncError::OutOfRange("firmware_check_period_secs", 30, 86400, 10)
        );
    }

    #[test]
    fn power_management_bitmask_is_persisted() {
        let mut store = InMemoryStore::new();
        let current = GatewayConfig::default();
        let doc = ConfigDocument {
            power_management: Some(PowerManagementDocument { enabled: true, techniques: 0x08 }),
            ..Default::default()
        };
        let ack = apply(&mut store, &current, &doc).unwrap();
        assert!(ack.applied.power_enabled);
        assert_eq!(ack.applied.power_techniques, 0x08);

        let reloaded = GatewayConfig::load(&store);
        assert!(reloaded.power_enabled);
        assert_eq!(reloaded.power_techniques, 0x08);
    }

    #[test]
    fn wire_keys_match_spec_table() {
        let json = br#"{
            "sampling_interval": 5,
            "upload_interval": 30,
            "config_poll_interval": 60,
            "command_poll_interval": 20,
            "firmware_check_interval": 7200,
            "energy_poll_interval": 120,
            "registers": ["Vac1", "Pac"],
            "power_management": {"enabled": true, "techniques": 8}
        }"#;
        let doc: ConfigDocument = serde_json::from_slice(json).unwrap();
        assert_eq!(doc.poll_period_secs, Some(5));
        assert_eq!(doc.upload_period_secs, Some(30));
        assert_eq!(doc.config_sync_period_secs, Some(60));
        assert_eq!(doc.command_poll_period_secs, Some(20));
        assert_eq!(doc.firmware_check_period_secs, Some(7200));
        assert_eq!(doc.energy_period_secs, Some(120));
        assert_eq!(doc.register_names, Some(vec!["Vac1".to_string(), "Pac".to_string()]));
        let pm = doc.power_management.unwrap();
        assert!(pm.enabled);
        assert_eq!(pm.techniques, 8);
    }

    #[test]
    fn applying_same_document_twice_is_idempotent() {
        let mut store = InMemoryStore::new();
        let current = GatewayConfig::default();
        let doc = ConfigDocument { server_url: Some("https://gw.example".to_string()), ..Default::default() };
        let first = apply(&mut store, &current, &doc).unwrap();
        let reloaded = GatewayConfig::load(&store);
        let second = apply(&mut store, &reloaded, &doc).unwrap();
        assert_eq!(first.applied, second.applied);
    }
}
