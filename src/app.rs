//! Central wiring: the concrete [`Gateway`] that owns every piece of state
//! and implements [`coordinator::GatewayHandlers`] against it (spec §4,
//! C1/C13). Everything else in this crate is either pure logic or a narrow
//! hardware seam; this module is where the two meet.

use crate::acquisition::{self, SerialPort};
use crate::command::{self, Command, CommandContext, CommandResult};
use crate::compressor;
use crate::config::{self, GatewayConfig, PersistentStore};
use crate::configsync::{self, ConfigDocument, GatewayConfigSnapshot};
use crate::coordinator::{GatewayHandlers, TimerToken};
use crate::fault::{FaultEvent, FaultKind, FaultLog};
use crate::ota::{Manifest, OtaBackend, OtaManager, OtaState};
use crate::registers::{self, Batch, RegisterSet};
use crate::security::{self, Envelope, SecurityState};
use crate::transport::Transport;
use crate::upload::UploadQueue;
use crate::version::Version;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

/// Persist the OTA resume mask every this-many chunks rather than on every
/// write (spec §4.10 "resume via persisted received_mask").
const OTA_PERSIST_EVERY_N_CHUNKS: u32 = 16;

/// Everything the gateway needs across one power cycle: the persisted
/// config, the hardware seams, security/anti-replay state, the in-flight
/// batch and upload queue, the fault log, and the OTA session. Owned
/// entirely by `main.rs`, which is the only caller of `Gateway::new`.
pub struct Gateway {
    store: Box<dyn PersistentStore>,
    port: Box<dyn SerialPort>,
    transport: Box<dyn Transport>,
    ota: OtaManager<Box<dyn OtaBackend>>,
    ota_public_key: VerifyingKey,
    security: SecurityState,
    last_accepted_nonce: u32,
    fault_log: FaultLog,
    upload_queue: UploadQueue,
    batch: Batch,
    config: GatewayConfig,
    slave_id: u8,
    current_version: Version,
    reboot_requested: bool,
    boot_epoch_ms: u64,
    last_chunk_persist: u32,
}

impl Gateway {
    pub fn new(
        store: Box<dyn PersistentStore>,
        port: Box<dyn SerialPort>,
        transport: Box<dyn Transport>,
        ota_backend: Box<dyn OtaBackend>,
        ota_public_key: VerifyingKey,
        mut security: SecurityState,
        slave_id: u8,
        boot_epoch_ms: u64,
    ) -> anyhow::Result<Self> {
        let config = GatewayConfig::load(&*store);

        if let Some(next_nonce) = store.get_u32(config::keys::NEXT_NONCE) {
            security.next_nonce = next_nonce;
        }
        let last_accepted_nonce = store.get_u32(config::keys::LAST_ACCEPTED_NONCE).unwrap_or(security::INITIAL_NONCE - 1);

        let current_version = store
            .get_string(config::keys::FIRMWARE_VERSION)
            .and_then(|s| Version::parse(&s).ok())
            .map(Ok)
            .unwrap_or_else(Version::current)?;

        let register_set = RegisterSet::new(config.register_set.clone())?;
        let target_size = registers::derive_target_size(config.poll_period_secs, config.upload_period_secs);

        Ok(Self {
            store,
            port,
            transport,
            ota: OtaManager::new(ota_backend),
            ota_public_key,
            security,
            last_accepted_nonce,
            fault_log: FaultLog::new(),
            upload_queue: UploadQueue::new(),
            batch: Batch::new(target_size, register_set),
            config,
            slave_id,
            current_version,
            reboot_requested: false,
            boot_epoch_ms,
            last_chunk_persist: 0,
        })
    }

    pub fn reboot_requested(&self) -> bool {
        self.reboot_requested
    }

    pub fn fault_log(&self) -> &FaultLog {
        &self.fault_log
    }

    pub fn current_firmware_version(&self) -> &Version {
        &self.current_version
    }

    /// Current period, per timer token, so `main.rs` can push config-sync
    /// changes into the `Coordinator` it owns (the coordinator lives outside
    /// `Gateway` and isn't reachable from the handler methods below).
    pub fn periods(&self) -> [(TimerToken, u32); 5] {
        [
            (TimerToken::Poll, self.config.poll_period_secs),
            (TimerToken::CommandPoll, self.config.command_poll_period_secs),
            (TimerToken::Upload, self.config.upload_period_secs),
            (TimerToken::ConfigSync, self.config.config_sync_period_secs),
            (TimerToken::FirmwareCheck, self.config.firmware_check_period_secs),
        ]
    }

    fn record_fault(&mut self, event: FaultEvent) {
        self.fault_log.record(event);
    }

    /// Wrap `plaintext` and persist the incremented nonce *before* returning
    /// it to the caller, so a crash between wrap and send never reuses a
    /// nonce (spec §4.5 "persist next_nonce before sending").
    fn wrap_outbound(&mut self, plaintext: &[u8]) -> anyhow::Result<Envelope> {
        let envelope = security::wrap(&mut self.security, plaintext, false);
        self.store.set_u32(config::keys::NEXT_NONCE, self.security.next_nonce)?;
        self.store.commit()?;
        Ok(envelope)
    }

    /// Unwrap an inbound control message, enforcing the mirror-check replay
    /// rule and logging `integrity_failure` on rejection (spec §4.5/§8
    /// scenario 6).
    fn unwrap_inbound(&mut self, body: &[u8]) -> Result<Vec<u8>, String> {
        let envelope: Envelope = serde_json::from_slice(body).map_err(|e| e.to_string())?;
        match security::unwrap(&self.security, &envelope, self.last_accepted_nonce) {
            Ok((plaintext, nonce)) => {
                self.last_accepted_nonce = nonce;
                let _ = self.store.set_u32(config::keys::LAST_ACCEPTED_NONCE, nonce);
                let _ = self.store.commit();
                Ok(plaintext)
            }
            Err(e) => {
                self.record_fault(
                    FaultEvent::new(FaultKind::OtaFault, "security", format!("inbound envelope rejected: {e}")).recovered(false),
                );
                Err(e.to_string())
            }
        }
    }

    /// The version string an in-progress OTA session left pending
    /// first-boot validation for, if any. Doubles as the "is a validation
    /// pending" flag (an empty/missing value means no).
    fn ota_pending_version(&self) -> Option<String> {
        self.store.get_string(config::keys::OTA_PENDING_VALIDATION).filter(|s| !s.is_empty())
    }

    /// Runs once at startup when a prior tick left an activation pending
    /// (spec §4.10 "first boot after activation must pass within 60s").
    ///
    /// `pending_version` was persisted by `download_firmware` right before
    /// requesting the reboot into the newly activated partition. If the
    /// binary actually running now reports that same version, this boot
    /// *is* the new image and the self-test below decides whether it stays
    /// or the bootloader rolls back. If the versions differ, the bootloader
    /// already rolled back before this boot ever reached the new image
    /// (`OtaBackend::rollback_and_reboot` doesn't return), so there is
    /// nothing left to validate — just correct the bookkeeping and tell the
    /// cloud the activation failed (spec §8 scenario 5).
    pub fn run_post_boot_validation(&mut self, wifi_associated: bool) {
        let Some(pending_version) = self.ota_pending_version() else { return };
        let _ = self.store.set_string(config::keys::OTA_PENDING_VALIDATION, "");

        if pending_version == crate::version::FIRMWARE_VERSION {
            let healthy = wifi_associated && self.post_boot_health_check();
            let outcome = self.ota.validate_after_boot(|| healthy);
            let _ = self.store.commit();
            if outcome.is_ok() {
                self.report_activation(&pending_version, "completed");
            }
            // On failure `validate_after_boot` rolled back and rebooted
            // (or, in the host-test fake, panicked) — control never returns
            // here on real hardware.
        } else {
            self.record_fault(
                FaultEvent::new(
                    FaultKind::OtaFault,
                    "ota",
                    format!("rolled back from {pending_version}, running {} instead", crate::version::FIRMWARE_VERSION),
                )
                .recovered(true),
            );
            if let Ok(running) = Version::parse(crate::version::FIRMWARE_VERSION) {
                self.current_version = running;
                let _ = self.store.set_string(config::keys::FIRMWARE_VERSION, crate::version::FIRMWARE_VERSION);
            }
            let _ = self.store.commit();
            self.report_activation(&pending_version, "failed");
        }
    }

    fn post_boot_health_check(&mut self) -> bool {
        if !self.upload_queue.is_empty() {
            let before = self.upload_queue.len();
            self.run_upload();
            return self.upload_queue.len() < before;
        }
        let url = format!("{}/health", self.config.server_url);
        self.transport.get(&url, &[]).map(|r| r.is_success()).unwrap_or(false)
    }

    fn flush_batch(&mut self) {
        let encoded_timestamp_ms = registers::now_ms();
        let result = compressor::compress_batch(&self.batch, encoded_timestamp_ms, &mut |e| self.fault_log.record(e));
        if let Ok(compressed) = result {
            if !self.upload_queue.try_enqueue(compressed) {
                self.record_fault(
                    FaultEvent::new(FaultKind::BufferOverflow, "upload_queue", "upload queue full, dropping newest batch").recovered(true),
                );
            }
        }
        self.batch.reset();
    }

    fn download_firmware(&mut self, manifest: &Manifest) {
        for sequence in 0..manifest.total_chunks() {
            let url = format!("{}/{}", manifest.chunk_base_url, sequence);
            let resp = match self.transport.get(&url, &[]) {
                Ok(r) => r,
                Err(e) => {
                    self.record_fault(FaultEvent::new(FaultKind::OtaFault, "ota", format!("chunk {sequence} fetch failed: {e}")).recovered(false));
                    return;
                }
            };
            if !resp.is_success() {
                self.record_fault(
                    FaultEvent::new(FaultKind::OtaFault, "ota", format!("chunk {sequence} http status {}", resp.status)).recovered(false),
                );
                return;
            }
            let envelope: Envelope = match serde_json::from_slice(&resp.body) {
                Ok(e) => e,
                Err(_) => {
                    self.record_fault(FaultEvent::new(FaultKind::OtaFault, "ota", format!("chunk {sequence} malformed envelope")).recovered(false));
                    return;
                }
            };

            let mut last_accepted = self.last_accepted_nonce;
            match self.ota.handle_chunk(sequence, &envelope, &self.security, &mut last_accepted) {
                Ok(done) => {
                    self.last_accepted_nonce = last_accepted;
                    let _ = self.store.set_u32(config::keys::LAST_ACCEPTED_NONCE, last_accepted);

                    if done || sequence.saturating_sub(self.last_chunk_persist) >= OTA_PERSIST_EVERY_N_CHUNKS {
                        self.last_chunk_persist = sequence;
                        if let Ok(mask_json) = serde_json::to_string(self.ota.received_mask()) {
                            let _ = self.store.set_string(config::keys::OTA_RECEIVED_MASK, &mask_json);
                        }
                    }
                    let _ = self.store.commit();

                    if done {
                        let _ = self.store.set_string(config::keys::FIRMWARE_VERSION, &manifest.version);
                        let _ = self.store.set_string(config::keys::OTA_PENDING_VALIDATION, &manifest.version);
                        let _ = self.store.commit();
                        self.reboot_requested = true;
                        return;
                    }
                }
                Err(e) => {
                    self.record_fault(FaultEvent::new(FaultKind::OtaFault, "ota", format!("chunk {sequence} rejected: {e}")).recovered(false));
                    return;
                }
            }
        }
    }

    fn report_activation(&mut self, version: &str, status: &'static str) {
        let body = FirmwareActivatedBody { status };
        let Ok(json) = serde_json::to_vec(&body) else { return };
        let Ok(envelope) = self.wrap_outbound(&json) else { return };
        let Ok(bytes) = serde_json::to_vec(&envelope) else { return };
        let url = format!("{}/firmware/{}/activated", self.config.server_url, version);
        let _ = self.transport.post(&url, &[("Content-Type", "application/json")], &bytes);
    }

    /// `POST /faults` (spec §6.2 "Dump event log"), issued alongside the
    /// command-result ack whenever a `read_fault_log` command runs — the
    /// command result carries the events back to whoever asked, this gives
    /// the cloud's own fault store the same dump without a second command.
    fn report_fault_dump(&mut self) {
        let body = FaultDumpBody { device_id: self.config.device_id.clone(), stats: self.fault_log.stats().clone(), events: self.fault_log.events() };
        let Ok(json) = serde_json::to_vec(&body) else { return };
        let Ok(envelope) = self.wrap_outbound(&json) else { return };
        let Ok(bytes) = serde_json::to_vec(&envelope) else { return };
        let url = format!("{}/faults", self.config.server_url);
        let _ = self.transport.post(&url, &[("Content-Type", "application/json")], &bytes);
    }
}

// ---------------------------------------------------------------------
// Wire DTOs for the cloud HTTP surface (spec §6.2). All bodies are JSON;
// every endpoint except `/health` travels inside a security envelope.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct UploadPayload<'a> {
    device_id: &'a str,
    timestamp: u64,
    compressed_data: Vec<CompressedBatchWire>,
}

#[derive(Debug, Clone, Serialize)]
struct BatchHeaderWire {
    register_ids: Vec<u8>,
    sample_count: u16,
    encoded_timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
struct CompressionStatsWire {
    original_bytes: usize,
    compressed_bytes: usize,
    compression_ratio: f64,
    elapsed_micros: u64,
    lossless_verified: bool,
}

#[derive(Debug, Clone, Serialize)]
struct CompressedBatchWire {
    method_tag: String,
    header: BatchHeaderWire,
    payload: String,
    stats: CompressionStatsWire,
}

#[derive(Debug, Deserialize)]
struct PendingCommand {
    id: String,
    #[serde(flatten)]
    command: Command,
}

#[derive(Debug, Default, Deserialize)]
struct CommandsPendingResponse {
    #[serde(default)]
    commands: Vec<PendingCommand>,
}

#[derive(Debug, Serialize)]
struct CommandResultBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<CommandResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_msg: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPendingResponse {
    #[serde(default)]
    is_pending: bool,
    #[serde(default)]
    pending_config: Option<ConfigDocument>,
}

#[derive(Debug, Serialize)]
struct ConfigAckBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    applied: Option<GatewayConfigSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct FirmwareCheckResponse {
    #[serde(default)]
    update_available: bool,
    #[serde(default)]
    manifest: Option<Manifest>,
}

#[derive(Debug, Serialize)]
struct FirmwareActivatedBody {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct FaultDumpBody {
    device_id: String,
    stats: crate::fault::FaultStats,
    events: Vec<FaultEvent>,
}

// ---------------------------------------------------------------------
// `CommandContext` for remote command execution (spec §4.7). A separate
// borrow of `port`/`fault_log` rather than `&mut Gateway` itself, since
// `command::execute` needs a `&mut dyn CommandContext` and a `&mut FaultLog`
// at the same time.
// ---------------------------------------------------------------------

struct CmdCtx<'a> {
    port: &'a mut dyn SerialPort,
    slave: u8,
    boot_epoch_ms: u64,
    reboot_requested: &'a mut bool,
}

impl<'a> CommandContext for CmdCtx<'a> {
    fn write_holding_register(&mut self, address: u16, value: u16) -> Result<(), String> {
        let request = crate::modbus::build_write_single_request(self.slave, address, value);
        self.port.open().map_err(|e| e.to_string())?;
        let outcome = self
            .port
            .write(&request)
            .and_then(|_| self.port.read_frame(std::time::Duration::from_millis(1000)))
            .map_err(|e| e.to_string());
        let _ = self.port.close();
        let frame = outcome?;
        command::build_and_check_write(self.slave, address, value, &frame).map_err(|e| e.to_string())
    }

    fn free_heap(&self) -> u32 {
        current_free_heap()
    }

    fn uptime_ms(&self) -> u64 {
        registers::now_ms().saturating_sub(self.boot_epoch_ms)
    }

    fn request_reboot(&mut self) {
        *self.reboot_requested = true;
    }
}

#[cfg(target_os = "espidf")]
fn current_free_heap() -> u32 {
    crate::diagnostics::get_free_heap()
}

#[cfg(not(target_os = "espidf"))]
fn current_free_heap() -> u32 {
    0
}

// ---------------------------------------------------------------------
// GatewayHandlers: the five per-tick duties, dispatched by `Coordinator`
// in the fixed order poll -> commands -> upload -> config-sync -> firmware
// (spec §5).
// ---------------------------------------------------------------------

impl GatewayHandlers for Gateway {
    fn run_poll(&mut self) {
        if let Err(e) = self.port.open() {
            self.record_fault(FaultEvent::new(FaultKind::ModbusTimeout, "acquisition", format!("port open failed: {e}")).recovered(false));
            return;
        }
        let register_set = self.batch.register_set().clone();
        let result = acquisition::poll_once(&mut *self.port, self.slave_id, &register_set, &mut |e| self.fault_log.record(e));
        if let Err(e) = self.port.close() {
            crate::warn!("port close failed: {e}");
        }

        if let Ok(sample) = result {
            if self.batch.push(sample).is_ok() && self.batch.is_full() {
                self.flush_batch();
            }
        }
    }

    fn run_command_poll(&mut self) {
        let url = format!("{}/commands/pending?device={}", self.config.server_url, self.config.device_id);
        let resp = match self.transport.get(&url, &[]) {
            Ok(r) => r,
            Err(e) => {
                self.record_fault(FaultEvent::new(FaultKind::HttpError, "command_poll", format!("transport error: {e}")).recovered(false));
                return;
            }
        };
        if !resp.is_success() {
            let (kind, recoverable) = crate::fault::classify_http(resp.status as i32);
            self.record_fault(FaultEvent::new(kind, "command_poll", format!("http status {}", resp.status)).recovered(recoverable));
            return;
        }
        let plaintext = match self.unwrap_inbound(&resp.body) {
            Ok(p) => p,
            Err(_) => return,
        };
        let parsed: CommandsPendingResponse = serde_json::from_slice(&plaintext).unwrap_or_default();

        for pending in parsed.commands {
            let boot_epoch_ms = self.boot_epoch_ms;
            let slave = self.slave_id;
            let mut ctx = CmdCtx { port: &mut *self.port, slave, boot_epoch_ms, reboot_requested: &mut self.reboot_requested };
            let outcome = command::execute(pending.command, &mut ctx, &mut self.fault_log);
            if matches!(outcome, Ok(CommandResult::FaultLog { .. })) {
                self.report_fault_dump();
            }

            let body = match &outcome {
                Ok(result) => CommandResultBody { status: "ok", result: Some(result.clone()), error_msg: None },
                Err(e) => CommandResultBody { status: "failed", result: None, error_msg: Some(e.to_string()) },
            };
            let Ok(json) = serde_json::to_vec(&body) else { continue };
            let Ok(envelope) = self.wrap_outbound(&json) else { continue };
            let Ok(envelope_json) = serde_json::to_vec(&envelope) else { continue };
            let result_url = format!("{}/commands/{}/result", self.config.server_url, pending.id);
            if let Err(e) = self.transport.post(&result_url, &[("Content-Type", "application/json")], &envelope_json) {
                self.record_fault(FaultEvent::new(FaultKind::HttpError, "command_poll", format!("result post failed: {e}")).recovered(false));
            }
        }
    }

    fn run_upload(&mut self) {
        let Some(head) = self.upload_queue.peek_head() else { return };
        let wire = CompressedBatchWire {
            method_tag: head.header.method.name().to_string(),
            header: BatchHeaderWire {
                register_ids: head.header.register_ids.clone(),
                sample_count: head.header.sample_count,
                encoded_timestamp_ms: head.header.encoded_timestamp_ms,
            },
            payload: BASE64.encode(&head.body),
            stats: CompressionStatsWire {
                original_bytes: head.stats.original_bytes,
                compressed_bytes: head.stats.compressed_bytes,
                compression_ratio: head.stats.compression_ratio,
                elapsed_micros: head.stats.elapsed_micros,
                lossless_verified: head.stats.lossless_verified,
            },
        };

        let payload = UploadPayload { device_id: &self.config.device_id, timestamp: registers::now_ms(), compressed_data: vec![wire] };
        let Ok(json) = serde_json::to_vec(&payload) else { return };
        let Ok(envelope) = self.wrap_outbound(&json) else { return };
        let Ok(body) = serde_json::to_vec(&envelope) else { return };
        let url = format!("{}/process", self.config.server_url);

        match self.transport.post(&url, &[("Content-Type", "application/json")], &body) {
            Ok(resp) if resp.is_success() => {
                self.upload_queue.pop_head();
            }
            Ok(resp) => {
                let (kind, recoverable) = crate::fault::classify_http(resp.status as i32);
                self.record_fault(FaultEvent::new(kind, "upload", format!("http status {}", resp.status)).recovered(recoverable));
                self.upload_queue.requeue_head();
            }
            Err(e) => {
                let (kind, recoverable) = crate::fault::classify_http(-1);
                self.record_fault(FaultEvent::new(kind, "upload", format!("transport error: {e}")).recovered(recoverable));
                self.upload_queue.requeue_head();
            }
        }
    }

    fn run_config_sync(&mut self) {
        let url = format!("{}/config/{}", self.config.server_url, self.config.device_id);
        let resp = match self.transport.get(&url, &[]) {
            Ok(r) => r,
            Err(e) => {
                self.record_fault(FaultEvent::new(FaultKind::HttpError, "config_sync", format!("transport error: {e}")).recovered(false));
                return;
            }
        };
        if !resp.is_success() {
            return;
        }
        let plaintext = match self.unwrap_inbound(&resp.body) {
            Ok(p) => p,
            Err(_) => return,
        };
        let parsed: ConfigPendingResponse = serde_json::from_slice(&plaintext).unwrap_or_default();
        if !parsed.is_pending {
            return;
        }
        let Some(doc) = parsed.pending_config else { return };

        let ack_body = match configsync::apply(&mut *self.store, &self.config, &doc) {
            Ok(ack) => {
                self.config = GatewayConfig::load(&*self.store);
                let target_size = registers::derive_target_size(self.config.poll_period_secs, self.config.upload_period_secs);
                self.batch.set_target_size(target_size);
                if let Ok(new_register_set) = RegisterSet::new(self.config.register_set.clone()) {
                    if &new_register_set != self.batch.register_set() {
                        self.batch = Batch::new(target_size, new_register_set);
                    }
                }
                ConfigAckBody { status: "applied", applied: Some(ack.applied), message: None }
            }
            Err(e) => ConfigAckBody { status: "rejected", applied: None, message: Some(e.to_string()) },
        };

        let Ok(json) = serde_json::to_vec(&ack_body) else { return };
        let Ok(envelope) = self.wrap_outbound(&json) else { return };
        let Ok(body) = serde_json::to_vec(&envelope) else { return };
        let ack_url = format!("{}/config/{}/acknowledge", self.config.server_url, self.config.device_id);
        let _ = self.transport.post(&ack_url, &[("Content-Type", "application/json")], &body);
    }

    fn run_firmware_check(&mut self) {
        let url = format!("{}/firmware/check?device={}&version={}", self.config.server_url, self.config.device_id, self.current_version);
        let resp = match self.transport.get(&url, &[]) {
            Ok(r) => r,
            Err(e) => {
                self.record_fault(FaultEvent::new(FaultKind::HttpError, "firmware_check", format!("transport error: {e}")).recovered(false));
                return;
            }
        };
        if !resp.is_success() {
            return;
        }
        let plaintext = match self.unwrap_inbound(&resp.body) {
            Ok(p) => p,
            Err(_) => return,
        };
        let parsed: FirmwareCheckResponse = serde_json::from_slice(&plaintext).unwrap_or_default();
        if !parsed.update_available {
            return;
        }
        let Some(manifest) = parsed.manifest else { return };

        // `ota.rs::accept_manifest` trusts its caller for both of these —
        // neither is enforced inside the state machine.
        if manifest.total_chunks() == 0 {
            crate::warn!("firmware manifest {} advertises zero chunks, rejecting", manifest.version);
            return;
        }
        let candidate_version = match Version::parse(&manifest.version) {
            Ok(v) => v,
            Err(_) => return,
        };
        if !candidate_version.is_newer_than(&self.current_version) {
            return;
        }

        // `current_version` stays at the running image's version until
        // `download_firmware` actually finishes (spec §8 invariant 5): the
        // device hasn't flashed anything yet just because it accepted a
        // manifest, and a chunk failure partway through the (synchronous)
        // download below must leave `current_version` exactly where it was.
        match self.ota.accept_manifest(manifest.clone(), &self.ota_public_key, None) {
            Ok(()) => self.download_firmware(&manifest),
            Err(e) => {
                self.record_fault(FaultEvent::new(FaultKind::OtaFault, "ota", format!("manifest rejected: {e}")).recovered(false));
            }
        }
    }

    fn firmware_activation_in_progress(&self) -> bool {
        matches!(self.ota.state(), OtaState::Checking | OtaState::ManifestOk { .. } | OtaState::Downloading { .. } | OtaState::Verifying { .. } | OtaState::Activating { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryStore;
    use crate::fault::FaultKind;
    use crate::ota::FakeOtaBackend;
    use crate::transport::{HttpResponse, SharedFakeTransport, TransportError};
    use ed25519_dalek::{Signer, SigningKey};
    use sha2::{Digest, Sha256};
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Mirrors `Manifest::signed_message`'s layout (sha256_hex || version ||
    /// total_size big-endian) so tests can sign a manifest without that
    /// private helper.
    fn sign_manifest(signing_key: &SigningKey, version: &str, body: &[u8], chunk_base_url: &str) -> Manifest {
        let sha256_hex = hex::encode(Sha256::digest(body));
        let mut msg = Vec::new();
        msg.extend_from_slice(sha256_hex.as_bytes());
        msg.extend_from_slice(version.as_bytes());
        msg.extend_from_slice(&(body.len() as u32).to_be_bytes());
        let signature = signing_key.sign(&msg);
        Manifest {
            version: version.to_string(),
            total_size: body.len() as u32,
            sha256_hex,
            signature_hex: hex::encode(signature.to_bytes()),
            chunk_base_url: chunk_base_url.to_string(),
        }
    }

    /// Echoes back the last frame it was told to write unless a scripted
    /// poll response is queued — a write-single-register request and its
    /// success response are byte-identical on the wire (spec §4.6), and a
    /// read-holding-registers poll needs a distinct canned reply.
    #[derive(Default)]
    struct FakeSerialPort {
        last_written: Vec<u8>,
        scripted_reads: VecDeque<std::io::Result<Vec<u8>>>,
    }

    impl SerialPort for FakeSerialPort {
        fn write(&mut self, frame: &[u8]) -> std::io::Result<()> {
            self.last_written = frame.to_vec();
            Ok(())
        }

        fn read_frame(&mut self, _timeout: Duration) -> std::io::Result<Vec<u8>> {
            if let Some(scripted) = self.scripted_reads.pop_front() {
                return scripted;
            }
            Ok(self.last_written.clone())
        }

        fn open(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn read_holding_registers_frame(slave: u8, values: &[u16]) -> Vec<u8> {
        let mut frame = vec![slave, crate::modbus::FUNCTION_READ_HOLDING_REGISTERS, (values.len() * 2) as u8];
        for v in values {
            frame.extend_from_slice(&v.to_be_bytes());
        }
        let crc = crate::modbus::crc16(&frame);
        frame.push((crc & 0xFF) as u8);
        frame.push((crc >> 8) as u8);
        frame
    }

    fn test_store(poll_secs: u32, upload_secs: u32) -> InMemoryStore {
        let mut store = InMemoryStore::new();
        let mut cfg = GatewayConfig::default();
        cfg.server_url = "https://gw.example/api".to_string();
        cfg.device_id = "dev-1".to_string();
        cfg.poll_period_secs = poll_secs;
        cfg.upload_period_secs = upload_secs;
        cfg.save(&mut store).unwrap();
        store
    }

    fn build_gateway(store: InMemoryStore, transport: SharedFakeTransport, port: FakeSerialPort) -> Gateway {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        build_gateway_with_signing_key(store, transport, port, &signing_key)
    }

    fn build_gateway_with_signing_key(store: InMemoryStore, transport: SharedFakeTransport, port: FakeSerialPort, signing_key: &SigningKey) -> Gateway {
        let security = SecurityState::new([7u8; 32], [9u8; 16]);
        Gateway::new(
            Box::new(store),
            Box::new(port),
            Box::new(transport),
            Box::new(FakeOtaBackend::new()),
            signing_key.verifying_key(),
            security,
            1,
            0,
        )
        .unwrap()
    }

    #[test]
    fn poll_flushes_single_sample_batch_and_upload_delivers_it() {
        // upload_period == poll_period => target_size 1 (spec §4.3): a
        // single poll already fills and flushes the batch.
        let store = test_store(2, 2);
        let transport = SharedFakeTransport::new();
        transport.push_response(HttpResponse { status: 200, body: b"{}".to_vec() });

        let mut port = FakeSerialPort::default();
        // Default register set is ids [0, 7]; their address span is 0..=7,
        // so the poll asks for 8 contiguous registers.
        port.scripted_reads.push_back(Ok(read_holding_registers_frame(1, &[230, 0, 0, 0, 0, 0, 0, 1500])));

        let mut gateway = build_gateway(store, transport.clone(), port);
        gateway.run_poll();
        assert!(gateway.fault_log().is_empty(), "unexpected fault: {:?}", gateway.fault_log().events());

        gateway.run_upload();
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].1.ends_with("/process"), "unexpected url: {}", requests[0].1);
        assert!(gateway.fault_log().is_empty());
    }

    #[test]
    fn upload_failure_requeues_head_for_next_tick() {
        let store = test_store(2, 2);
        let transport = SharedFakeTransport::new();
        transport.push_response(HttpResponse { status: 503, body: Vec::new() });

        let mut port = FakeSerialPort::default();
        port.scripted_reads.push_back(Ok(read_holding_registers_frame(1, &[230, 0, 0, 0, 0, 0, 0, 1500])));

        let mut gateway = build_gateway(store, transport.clone(), port);
        gateway.run_poll();
        gateway.run_upload();

        assert_eq!(transport.requests().len(), 1);
        assert_eq!(gateway.fault_log().len(), 1);
        let events = gateway.fault_log().events();
        let event = &events[0];
        assert_eq!(event.kind, FaultKind::HttpError);
        assert!(event.recovered, "503 is recoverable per spec §4.9");
    }

    #[test]
    fn set_power_percentage_command_writes_register_and_reports_result() {
        let store = test_store(2, 15);
        let transport = SharedFakeTransport::new();

        let mut sender_security = SecurityState::new([7u8; 32], [9u8; 16]);
        let command_body = br#"{"commands":[{"id":"CMD_42","action":"set_power_percentage","percentage":50}]}"#;
        let envelope = security::wrap(&mut sender_security, command_body, false);
        transport.push_response(HttpResponse { status: 200, body: serde_json::to_vec(&envelope).unwrap() });
        // Result POST after the command executes.
        transport.push_response(HttpResponse { status: 200, body: b"{}".to_vec() });

        let port = FakeSerialPort::default();
        let mut gateway = build_gateway(store, transport.clone(), port);
        gateway.run_command_poll();

        assert!(gateway.fault_log().is_empty(), "unexpected fault: {:?}", gateway.fault_log().events());
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "GET");
        assert_eq!(requests[1].0, "POST");
        assert!(requests[1].1.ends_with("/commands/CMD_42/result"));

        let result_envelope: Envelope = serde_json::from_slice(&requests[1].2).unwrap();
        let (plaintext, _) = security::unwrap(&gateway.security, &result_envelope, security::INITIAL_NONCE - 1).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[test]
    fn rollback_detected_on_boot_reports_failure_and_restores_version() {
        // Simulate the aftermath of a failed first-boot self-test: a prior
        // run persisted the new version and a pending-validation marker,
        // then the bootloader rolled back before this process ever ran as
        // that new image (spec §8 scenario 5).
        let failed_version = "9.9.9";
        let mut store = test_store(2, 15);
        store.set_string(config::keys::FIRMWARE_VERSION, failed_version).unwrap();
        store.set_string(config::keys::OTA_PENDING_VALIDATION, failed_version).unwrap();
        store.commit().unwrap();

        let transport = SharedFakeTransport::new();
        transport.push_response(HttpResponse { status: 200, body: b"{}".to_vec() });
        let port = FakeSerialPort::default();
        let mut gateway = build_gateway(store, transport.clone(), port);

        assert_eq!(gateway.current_firmware_version().to_string(), failed_version);

        gateway.run_post_boot_validation(true);

        assert_eq!(gateway.current_firmware_version().to_string(), crate::version::FIRMWARE_VERSION, "invariant 5: failed OTA restores the pre-session version");
        assert_eq!(gateway.fault_log().len(), 1);
        let events = gateway.fault_log().events();
        let event = &events[0];
        assert_eq!(event.kind, FaultKind::OtaFault);
        assert!(event.recovered);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].1.ends_with(&format!("/firmware/{failed_version}/activated")));
        let envelope: Envelope = serde_json::from_slice(&requests[0].2).unwrap();
        let (plaintext, _) = security::unwrap(&gateway.security, &envelope, security::INITIAL_NONCE - 1).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(body["status"], "failed");
    }

    #[test]
    fn no_pending_validation_is_a_no_op() {
        let store = test_store(2, 15);
        let transport = SharedFakeTransport::new();
        let port = FakeSerialPort::default();
        let mut gateway = build_gateway(store, transport.clone(), port);
        gateway.run_post_boot_validation(true);
        assert!(transport.requests().is_empty());
        assert!(gateway.fault_log().is_empty());
    }

    #[test]
    fn failed_mid_download_leaves_current_version_unchanged() {
        // Invariant 5 (spec §8): a session that fails before the image is
        // fully received must leave `current_firmware_version` exactly
        // where it was, not optimistically bumped the moment a manifest is
        // accepted.
        let store = test_store(2, 15);
        let transport = SharedFakeTransport::new();
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);

        let body = vec![0xABu8; crate::ota::CHUNK_SIZE * 2];
        let manifest = sign_manifest(&signing_key, "9.9.9", &body, "https://gw.example/fw");

        let mut sender_security = SecurityState::new([7u8; 32], [9u8; 16]);
        let check_body = serde_json::to_vec(&FirmwareCheckResponse { update_available: true, manifest: Some(manifest) }).unwrap();
        let check_envelope = security::wrap(&mut sender_security, &check_body, false);
        transport.push_response(HttpResponse { status: 200, body: serde_json::to_vec(&check_envelope).unwrap() });

        let chunk0 = security::wrap(&mut sender_security, &body[..crate::ota::CHUNK_SIZE], false);
        transport.push_response(HttpResponse { status: 200, body: serde_json::to_vec(&chunk0).unwrap() });
        // Chunk 1 never arrives.
        transport.push_error(TransportError::Read("connection reset".to_string()));

        let port = FakeSerialPort::default();
        let mut gateway = build_gateway_with_signing_key(store, transport.clone(), port, &signing_key);
        let starting_version = gateway.current_firmware_version().clone();

        gateway.run_firmware_check();

        assert_eq!(gateway.current_firmware_version(), &starting_version, "failed download must not advance current_firmware_version");
        assert!(!gateway.reboot_requested());
        assert_eq!(gateway.fault_log().len(), 1);
        assert_eq!(gateway.fault_log().events()[0].kind, FaultKind::OtaFault);
    }

    #[test]
    fn read_fault_log_command_also_dumps_to_faults_endpoint() {
        let store = test_store(2, 15);
        let transport = SharedFakeTransport::new();

        let mut sender_security = SecurityState::new([7u8; 32], [9u8; 16]);
        let command_body = br#"{"commands":[{"id":"CMD_7","action":"read_fault_log"}]}"#;
        let envelope = security::wrap(&mut sender_security, command_body, false);
        transport.push_response(HttpResponse { status: 200, body: serde_json::to_vec(&envelope).unwrap() });
        // The fault dump posted to `/faults` ...
        transport.push_response(HttpResponse { status: 200, body: b"{}".to_vec() });
        // ... followed by the command-result ack.
        transport.push_response(HttpResponse { status: 200, body: b"{}".to_vec() });

        let port = FakeSerialPort::default();
        let mut gateway = build_gateway(store, transport.clone(), port);
        gateway.run_command_poll();

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[1].1.ends_with("/faults"), "unexpected url: {}", requests[1].1);
        assert!(requests[2].1.ends_with("/commands/CMD_7/result"));

        let dump_envelope: Envelope = serde_json::from_slice(&requests[1].2).unwrap();
        let (plaintext, _) = security::unwrap(&gateway.security, &dump_envelope, security::INITIAL_NONCE - 1).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(body["device_id"], "dev-1");
        assert!(body["events"].as_array().unwrap().is_empty());
    }
}
