//! Firmware OTA: manifest fetch + signature verification, chunked download
//! with resume, whole-image SHA-256 verification, dual-partition
//! activation and first-boot rollback (spec §4.10, C12).
//!
//! Each chunk travels inside a [`crate::security::Envelope`], so per-chunk
//! authenticity/integrity comes from the same HMAC the rest of the control
//! plane uses — there is no separate chunk checksum to keep in sync.

use crate::security::{self, EnvelopeError, SecurityState};
use anyhow::{Context, Result};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Download chunk size (spec §4.10).
pub const CHUNK_SIZE: usize = 4096;

/// The manifest the firmware-check poll fetches to learn about a candidate
/// update (spec §4.10).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Manifest {
    pub version: String,
    pub total_size: u32,
    pub sha256_hex: String,
    /// hex-encoded ed25519 signature over `sha256_hex || version || total_size`.
    pub signature_hex: String,
    pub chunk_base_url: String,
}

impl Manifest {
    pub fn total_chunks(&self) -> u32 {
        (self.total_size as usize).div_ceil(CHUNK_SIZE) as u32
    }

    fn signed_message(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.sha256_hex.as_bytes());
        buf.extend_from_slice(self.version.as_bytes());
        buf.extend_from_slice(&self.total_size.to_be_bytes());
        buf
    }

    /// Verify the manifest's ed25519 signature against the firmware's
    /// compiled-in public key (spec §4.10 "asymmetric signature").
    pub fn verify_signature(&self, public_key: &VerifyingKey) -> Result<(), OtaError> {
        let sig_bytes = hex::decode(&self.signature_hex).map_err(|_| OtaError::BadManifest("signature not hex".into()))?;
        let sig_array: [u8; 64] = sig_bytes.try_into().map_err(|_| OtaError::BadManifest("signature must be 64 bytes".into()))?;
        let signature = Signature::from_bytes(&sig_array);
        public_key
            .verify_strict(&self.signed_message(), &signature)
            .map_err(|_| OtaError::SignatureInvalid)
    }
}

/// The OTA state machine (spec §4.10).
#[derive(Debug, Clone, PartialEq)]
pub enum OtaState {
    Idle,
    Checking,
    ManifestOk { manifest: Manifest },
    Downloading { manifest: Manifest, received_chunks: u32 },
    Verifying { manifest: Manifest },
    Activating { manifest: Manifest },
    Validating,
    Done { version: String },
    Failed { reason: String },
    RollingBack { reason: String },
}

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("malformed manifest: {0}")]
    BadManifest(String),
    #[error("manifest signature verification failed")]
    SignatureInvalid,
    #[error("chunk envelope rejected: {0}")]
    ChunkEnvelope(#[from] EnvelopeError),
    #[error("chunk sequence {0} is out of range for {1} total chunks")]
    SequenceOutOfRange(u32, u32),
    #[error("whole-image sha256 mismatch: expected {expected}, got {actual}")]
    ImageHashMismatch { expected: String, actual: String },
    #[error("esp-idf ota error: {0}")]
    Esp(String),
    #[error("operation invalid in state {0:?}")]
    WrongState(OtaState),
}

/// One received-or-not bit per chunk, persisted so a reboot mid-download
/// can resume instead of restarting (spec §4.10 "resume via persisted
/// received_mask").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceivedMask {
    bits: Vec<bool>,
}

impl ReceivedMask {
    pub fn new(total_chunks: u32) -> Self {
        Self { bits: vec![false; total_chunks as usize] }
    }

    pub fn mark(&mut self, sequence: u32) {
        if let Some(slot) = self.bits.get_mut(sequence as usize) {
            *slot = true;
        }
    }

    pub fn is_received(&self, sequence: u32) -> bool {
        self.bits.get(sequence as usize).copied().unwrap_or(false)
    }

    pub fn next_missing(&self) -> Option<u32> {
        self.bits.iter().position(|&b| !b).map(|i| i as u32)
    }

    pub fn is_complete(&self) -> bool {
        !self.bits.is_empty() && self.bits.iter().all(|&b| b)
    }

    pub fn received_count(&self) -> u32 {
        self.bits.iter().filter(|&&b| b).count() as u32
    }
}

/// Seam over the platform's A/B OTA partitions, so the state machine above
/// can be exercised on the host against a fake.
pub trait OtaBackend {
    fn begin_update(&mut self) -> Result<(), OtaError>;
    /// Write must be called in strictly increasing sequential order; the
    /// caller (this module) guarantees that via `ReceivedMask` + buffering.
    fn write(&mut self, data: &[u8]) -> Result<(), OtaError>;
    fn complete(&mut self) -> Result<(), OtaError>;
    fn abort(&mut self) -> Result<(), OtaError>;
    fn mark_valid(&mut self) -> Result<(), OtaError>;
    fn rollback_and_reboot(&mut self) -> !;
}

#[cfg(target_os = "espidf")]
pub use esp_backend::EspOtaBackend;

#[cfg(target_os = "espidf")]
mod esp_backend {
    use super::*;
    use esp_idf_svc::ota::{EspOta, EspOtaUpdate};

    pub struct EspOtaBackend {
        ota: EspOta,
        update: Option<EspOtaUpdate>,
    }

    impl EspOtaBackend {
        pub fn new() -> Result<Self, OtaError> {
            Ok(Self { ota: EspOta::new().map_err(|e| OtaError::Esp(e.to_string()))?, update: None })
        }
    }

    impl OtaBackend for EspOtaBackend {
        fn begin_update(&mut self) -> Result<(), OtaError> {
            self.update = Some(self.ota.initiate_update().map_err(|e| OtaError::Esp(e.to_string()))?);
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
            self.update
                .as_mut()
                .ok_or_else(|| OtaError::Esp("no active update".to_string()))?
                .write(data)
                .map_err(|e| OtaError::Esp(e.to_string()))
        }

        fn complete(&mut self) -> Result<(), OtaError> {
            self.update
                .take()
                .ok_or_else(|| OtaError::Esp("no active update".to_string()))?
                .complete()
                .map_err(|e| OtaError::Esp(e.to_string()))
        }

        fn abort(&mut self) -> Result<(), OtaError> {
            if let Some(update) = self.update.take() {
                drop(update);
            }
            Ok(())
        }

        fn mark_valid(&mut self) -> Result<(), OtaError> {
            unsafe {
                let err = esp_idf_sys::esp_ota_mark_app_valid_cancel_rollback();
                if err != esp_idf_sys::ESP_OK {
                    return Err(OtaError::Esp(format!("mark_app_valid failed: {err}")));
                }
            }
            Ok(())
        }

        fn rollback_and_reboot(&mut self) -> ! {
            unsafe {
                esp_idf_sys::esp_ota_mark_app_invalid_rollback_and_reboot();
            }
            unreachable!("esp_ota_mark_app_invalid_rollback_and_reboot does not return")
        }
    }
}

#[cfg(not(target_os = "espidf"))]
pub use fake_backend::FakeOtaBackend;

#[cfg(not(target_os = "espidf"))]
mod fake_backend {
    use super::*;

    #[derive(Default)]
    pub struct FakeOtaBackend {
        pub written: Vec<u8>,
        pub completed: bool,
        pub aborted: bool,
        pub marked_valid: bool,
        pub rolled_back: bool,
        active: bool,
    }

    impl FakeOtaBackend {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl OtaBackend for FakeOtaBackend {
        fn begin_update(&mut self) -> Result<(), OtaError> {
            self.written.clear();
            self.active = true;
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
            if !self.active {
                return Err(OtaError::Esp("no active update".to_string()));
            }
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn complete(&mut self) -> Result<(), OtaError> {
            self.active = false;
            self.completed = true;
            Ok(())
        }

        fn abort(&mut self) -> Result<(), OtaError> {
            self.active = false;
            self.aborted = true;
            Ok(())
        }

        fn mark_valid(&mut self) -> Result<(), OtaError> {
            self.marked_valid = true;
            Ok(())
        }

        fn rollback_and_reboot(&mut self) -> ! {
            self.rolled_back = true;
            panic!("fake rollback_and_reboot: test should not reach past this point");
        }
    }
}

impl OtaBackend for Box<dyn OtaBackend> {
    fn begin_update(&mut self) -> Result<(), OtaError> {
        (**self).begin_update()
    }
    fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
        (**self).write(data)
    }
    fn complete(&mut self) -> Result<(), OtaError> {
        (**self).complete()
    }
    fn abort(&mut self) -> Result<(), OtaError> {
        (**self).abort()
    }
    fn mark_valid(&mut self) -> Result<(), OtaError> {
        (**self).mark_valid()
    }
    fn rollback_and_reboot(&mut self) -> ! {
        (**self).rollback_and_reboot()
    }
}

/// Drives the OTA state machine. Chunk writes happen strictly in order;
/// out-of-order arrivals are buffered until their predecessor has landed.
pub struct OtaManager<B: OtaBackend> {
    state: OtaState,
    backend: B,
    mask: ReceivedMask,
    buffer: std::collections::HashMap<u32, Vec<u8>>,
    hasher: Sha256,
    next_to_write: u32,
}

impl<B: OtaBackend> OtaManager<B> {
    pub fn new(backend: B) -> Self {
        Self {
            state: OtaState::Idle,
            backend,
            mask: ReceivedMask::default(),
            buffer: std::collections::HashMap::new(),
            hasher: Sha256::new(),
            next_to_write: 0,
        }
    }

    pub fn state(&self) -> &OtaState {
        &self.state
    }

    /// A manifest has been fetched; verify its signature and, if it names a
    /// version newer than `current_version`, transition to `ManifestOk` and
    /// begin the update (spec §4.10 CHECKING → MANIFEST_OK → DOWNLOADING).
    pub fn accept_manifest(
        &mut self,
        manifest: Manifest,
        public_key: &VerifyingKey,
        resume_mask: Option<ReceivedMask>,
    ) -> Result<(), OtaError> {
        self.state = OtaState::Checking;
        manifest.verify_signature(public_key)?;
        self.state = OtaState::ManifestOk { manifest: manifest.clone() };

        let total_chunks = manifest.total_chunks();
        self.mask = resume_mask.filter(|m| m.bits.len() as u32 == total_chunks).unwrap_or_else(|| ReceivedMask::new(total_chunks));
        self.next_to_write = self.mask.received_count();
        self.buffer.clear();
        self.hasher = Sha256::new();
        self.backend.begin_update()?;
        self.state = OtaState::Downloading { manifest, received_chunks: self.next_to_write };
        Ok(())
    }

    /// Unwrap and apply one downloaded chunk. Returns `true` once the image
    /// is fully received and the whole-image hash has been verified.
    pub fn handle_chunk(
        &mut self,
        sequence: u32,
        envelope: &security::Envelope,
        security_state: &SecurityState,
        last_accepted_nonce: &mut u32,
    ) -> Result<bool, OtaError> {
        let (manifest, _) = match &self.state {
            OtaState::Downloading { manifest, .. } => (manifest.clone(), ()),
            other => return Err(OtaError::WrongState(other.clone())),
        };

        if sequence >= manifest.total_chunks() {
            return Err(OtaError::SequenceOutOfRange(sequence, manifest.total_chunks()));
        }

        let (plaintext, accepted_nonce) = security::unwrap(security_state, envelope, *last_accepted_nonce)?;
        *last_accepted_nonce = accepted_nonce;

        if self.mask.is_received(sequence) {
            // Already applied (resume/duplicate delivery); nothing to do.
            return Ok(self.mask.is_complete());
        }

        self.buffer.insert(sequence, plaintext);
        self.mask.mark(sequence);

        while let Some(chunk) = self.buffer.remove(&self.next_to_write) {
            self.hasher.update(&chunk);
            self.backend.write(&chunk)?;
            self.next_to_write += 1;
        }

        self.state = OtaState::Downloading { manifest: manifest.clone(), received_chunks: self.mask.received_count() };

        if self.mask.is_complete() {
            self.verify_and_activate(manifest)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn received_mask(&self) -> &ReceivedMask {
        &self.mask
    }

    fn verify_and_activate(&mut self, manifest: Manifest) -> Result<(), OtaError> {
        self.state = OtaState::Verifying { manifest: manifest.clone() };

        let actual = hex::encode(self.hasher.clone().finalize());
        if actual != manifest.sha256_hex {
            self.backend.abort()?;
            self.state = OtaState::Failed { reason: format!("image hash mismatch: expected {}, got {actual}", manifest.sha256_hex) };
            return Err(OtaError::ImageHashMismatch { expected: manifest.sha256_hex.clone(), actual });
        }

        self.state = OtaState::Activating { manifest: manifest.clone() };
        self.backend.complete()?;
        self.state = OtaState::Done { version: manifest.version };
        Ok(())
    }

    /// Called once at startup, on the first boot after activating a new
    /// image. `self_test` decides whether the new firmware is healthy; a
    /// failure rolls back to the previous partition and reboots
    /// (spec §4.10 VALIDATING → DONE/ROLLING_BACK).
    pub fn validate_after_boot(&mut self, self_test: impl FnOnce() -> bool) -> Result<(), OtaError> {
        self.state = OtaState::Validating;
        if self_test() {
            self.backend.mark_valid()?;
            self.state = OtaState::Idle;
            Ok(())
        } else {
            self.state = OtaState::RollingBack { reason: "post-update self-test failed".to_string() };
            self.backend.rollback_and_reboot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::INITIAL_NONCE;
    use ed25519_dalek::{Signer, SigningKey};

    fn signed_manifest(body: &[u8], version: &str) -> (Manifest, VerifyingKey) {
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let sha256_hex = hex::encode(Sha256::digest(body));
        let manifest = Manifest {
            version: version.to_string(),
            total_size: body.len() as u32,
            sha256_hex,
            signature_hex: String::new(),
            chunk_base_url: "https://gw.example/fw".to_string(),
        };
        let signature = signing_key.sign(&manifest.signed_message());
        let manifest = Manifest { signature_hex: hex::encode(signature.to_bytes()), ..manifest };
        (manifest, signing_key.verifying_key())
    }

    fn chunks_of(body: &[u8]) -> Vec<&[u8]> {
        body.chunks(CHUNK_SIZE).collect()
    }

    #[test]
    fn full_download_verifies_and_completes() {
        let body = vec![0xABu8; CHUNK_SIZE * 3 + 17];
        let (manifest, public_key) = signed_manifest(&body, "1.2.3");
        let mut mgr = OtaManager::new(fake_backend_for_test());
        mgr.accept_manifest(manifest, &public_key, None).unwrap();

        let mut security_state = SecurityState::new([1u8; 32], [2u8; 16]);
        let mut last_accepted = INITIAL_NONCE - 1;
        let mut done = false;
        for (seq, chunk) in chunks_of(&body).into_iter().enumerate() {
            let env = security::wrap(&mut security_state, chunk, false);
            done = mgr.handle_chunk(seq as u32, &env, &security_state, &mut last_accepted).unwrap();
        }
        assert!(done);
        assert!(matches!(mgr.state(), OtaState::Done { version } if version == "1.2.3"));
    }

    #[test]
    fn out_of_order_chunks_are_buffered_then_applied() {
        let body = vec![0x11u8; CHUNK_SIZE * 3];
        let (manifest, public_key) = signed_manifest(&body, "2.0.0");
        let mut mgr = OtaManager::new(fake_backend_for_test());
        mgr.accept_manifest(manifest, &public_key, None).unwrap();

        let mut security_state = SecurityState::new([3u8; 32], [4u8; 16]);
        let mut last_accepted = INITIAL_NONCE - 1;
        let chunks: Vec<&[u8]> = chunks_of(&body);

        let env2 = security::wrap(&mut security_state, chunks[2], false);
        assert!(!mgr.handle_chunk(2, &env2, &security_state, &mut last_accepted).unwrap());
        let env0 = security::wrap(&mut security_state, chunks[0], false);
        assert!(!mgr.handle_chunk(0, &env0, &security_state, &mut last_accepted).unwrap());
        let env1 = security::wrap(&mut security_state, chunks[1], false);
        assert!(mgr.handle_chunk(1, &env1, &security_state, &mut last_accepted).unwrap());
    }

    #[test]
    fn corrupted_chunk_produces_hash_mismatch_and_aborts() {
        let body = vec![0x22u8; CHUNK_SIZE * 2];
        let (manifest, public_key) = signed_manifest(&body, "3.0.0");
        let mut mgr = OtaManager::new(fake_backend_for_test());
        mgr.accept_manifest(manifest, &public_key, None).unwrap();

        let mut security_state = SecurityState::new([5u8; 32], [6u8; 16]);
        let mut last_accepted = INITIAL_NONCE - 1;
        let chunks: Vec<&[u8]> = chunks_of(&body);

        let env0 = security::wrap(&mut security_state, chunks[0], false);
        mgr.handle_chunk(0, &env0, &security_state, &mut last_accepted).unwrap();

        let mut tampered = chunks[1].to_vec();
        tampered[0] ^= 0xFF;
        let env1 = security::wrap(&mut security_state, &tampered, false);
        let result = mgr.handle_chunk(1, &env1, &security_state, &mut last_accepted);
        assert!(matches!(result, Err(OtaError::ImageHashMismatch { .. })));
        assert!(matches!(mgr.state(), OtaState::Failed { .. }));
    }

    #[test]
    fn bad_signature_is_rejected_before_download_starts() {
        let body = vec![0x33u8; 16];
        let (mut manifest, public_key) = signed_manifest(&body, "4.0.0");
        manifest.version = "tampered".to_string();
        let mut mgr = OtaManager::new(fake_backend_for_test());
        assert!(matches!(mgr.accept_manifest(manifest, &public_key, None), Err(OtaError::SignatureInvalid)));
    }

    #[test]
    fn failed_self_test_rolls_back() {
        let mut mgr = OtaManager::new(fake_backend_for_test());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| mgr.validate_after_boot(|| false)));
        assert!(result.is_err(), "fake rollback path panics to simulate the non-returning reboot");
    }

    #[test]
    fn successful_self_test_marks_valid() {
        let mut mgr = OtaManager::new(fake_backend_for_test());
        mgr.validate_after_boot(|| true).unwrap();
        assert!(mgr.backend.marked_valid);
    }

    fn fake_backend_for_test() -> fake_backend::FakeOtaBackend {
        fake_backend::FakeOtaBackend::new()
    }
}
