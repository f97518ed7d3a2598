//! Security envelope: monotonic nonce + HMAC-SHA256, optional AES-128-CBC
//! (spec §3 SecurityState, §4.5, C9).
//!
//! Every outbound payload and every inbound control message is wrapped the
//! same way. `SecurityState` owns the persisted key material and the
//! monotonic nonce counter; `wrap`/`unwrap` are pure functions over it so
//! they can be unit tested without touching the persistent store.

use aes::cipher::{block_padding::Pkcs7, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const HMAC_KEY_LEN: usize = 32;
pub const CIPHER_KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;

/// First nonce value a freshly provisioned device uses (spec §3).
pub const INITIAL_NONCE: u32 = 10_000;

/// Persisted key material and anti-replay counter (spec §3 SecurityState).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityState {
    pub psk_hmac: [u8; HMAC_KEY_LEN],
    pub psk_cipher: [u8; CIPHER_KEY_LEN],
    pub next_nonce: u32,
}

impl SecurityState {
    pub fn new(psk_hmac: [u8; HMAC_KEY_LEN], psk_cipher: [u8; CIPHER_KEY_LEN]) -> Self {
        Self { psk_hmac, psk_cipher, next_nonce: INITIAL_NONCE }
    }

    /// Fetch-and-increment the nonce. Callers must persist the returned
    /// state (specifically the incremented `next_nonce`) *before* sending,
    /// so a crash mid-send never causes nonce reuse (spec §4.5 "Anti-replay").
    pub fn take_nonce(&mut self) -> u32 {
        let n = self.next_nonce;
        self.next_nonce = self.next_nonce.wrapping_add(1);
        n
    }
}

/// The outer authenticated wrapper (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub nonce: u32,
    pub payload: String, // base64(inner)
    pub mac: String,     // hex(hmac_sha256(psk_hmac, be32(nonce) || inner))
    pub encrypted: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("mac verification failed")]
    MacMismatch,
    #[error("nonce {nonce} is not greater than last accepted nonce {last_accepted}")]
    ReplayedNonce { nonce: u32, last_accepted: u32 },
    #[error("malformed base64 payload")]
    BadBase64,
    #[error("malformed ciphertext")]
    BadCiphertext,
}

fn mac_input(nonce: u32, inner: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + inner.len());
    buf.extend_from_slice(&nonce.to_be_bytes());
    buf.extend_from_slice(inner);
    buf
}

fn compute_mac(key: &[u8], nonce: u32, inner: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&mac_input(nonce, inner));
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time MAC comparison (spec §4.5 "Receivers must constant-time
/// compare `mac`").
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Wrap `plaintext` into an authenticated envelope, consuming one nonce.
/// When `encrypt` is true, `inner` is AES-128-CBC with a fresh IV prepended.
pub fn wrap(state: &mut SecurityState, plaintext: &[u8], encrypt: bool) -> Envelope {
    let nonce = state.take_nonce();
    let inner = if encrypt {
        let iv = fresh_iv(nonce);
        let key = GenericArray::from_slice(&state.psk_cipher);
        let iv_arr = GenericArray::from_slice(&iv);
        let ciphertext = Aes128CbcEnc::new(key, iv_arr).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let mut framed = Vec::with_capacity(IV_LEN + ciphertext.len());
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ciphertext);
        framed
    } else {
        plaintext.to_vec()
    };

    let mac = compute_mac(&state.psk_hmac, nonce, &inner);
    Envelope { nonce, payload: BASE64.encode(&inner), mac, encrypted: encrypt }
}

/// Deterministic-looking but session-unique IV derivation: devices without a
/// hardware RNG still need a fresh IV per message, so the nonce (which is
/// itself never reused) seeds it together with a fixed device-independent
/// salt. A real deployment may instead draw the IV from a hardware RNG; this
/// is the fallback the spec's "fresh IV carried in a field of `inner`"
/// wording permits.
fn fresh_iv(nonce: u32) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    iv[0..4].copy_from_slice(&nonce.to_be_bytes());
    iv[4..8].copy_from_slice(&nonce.rotate_left(13).to_be_bytes());
    iv[8] = 0xEC;
    iv[9] = 0x0;
    iv
}

/// Verify and unwrap an envelope, enforcing the receiver's anti-replay rule:
/// `nonce` must be strictly greater than `last_accepted_nonce`. Returns the
/// plaintext and the nonce to record as the new `last_accepted_nonce`.
pub fn unwrap(
    state: &SecurityState,
    envelope: &Envelope,
    last_accepted_nonce: u32,
) -> Result<(Vec<u8>, u32), EnvelopeError> {
    if envelope.nonce <= last_accepted_nonce {
        return Err(EnvelopeError::ReplayedNonce { nonce: envelope.nonce, last_accepted: last_accepted_nonce });
    }

    let inner = BASE64.decode(&envelope.payload).map_err(|_| EnvelopeError::BadBase64)?;
    let expected_mac = compute_mac(&state.psk_hmac, envelope.nonce, &inner);
    if !constant_time_eq(&expected_mac, &envelope.mac) {
        return Err(EnvelopeError::MacMismatch);
    }

    let plaintext = if envelope.encrypted {
        if inner.len() < IV_LEN {
            return Err(EnvelopeError::BadCiphertext);
        }
        let (iv, ciphertext) = inner.split_at(IV_LEN);
        let key = GenericArray::from_slice(&state.psk_cipher);
        let iv_arr = GenericArray::from_slice(iv);
        Aes128CbcDec::new(key, iv_arr)
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| EnvelopeError::BadCiphertext)?
    } else {
        inner
    };

    Ok((plaintext, envelope.nonce))
}
