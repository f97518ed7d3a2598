//! Batch compression: tries all four codecs, keeps the smallest result,
//! verifies it losslessly in-line, and falls back to BIT_PACKED on any
//! verification failure (spec §4.3, C7).

use crate::codecs::{self, CodecError, Columns, MethodTag};
use crate::fault::{FaultEvent, FaultKind};
use crate::registers::{Batch, RegisterId};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("batch is empty")]
    EmptyBatch,
}

/// Everything a decoder needs to reconstruct the columnar samples, besides
/// the codec body itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHeader {
    pub register_ids: Vec<RegisterId>,
    pub sample_count: u16,
    pub method: MethodTag,
    pub encoded_timestamp_ms: u64,
}

/// Timing/ratio metadata, not part of the wire format (spec §4.3 stats).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionStats {
    pub original_bytes: usize,
    pub compressed_bytes: usize,
    pub compression_ratio: f64,
    pub elapsed_micros: u64,
    pub lossless_verified: bool,
}

#[derive(Debug, Clone)]
pub struct CompressedBatch {
    pub header: BatchHeader,
    pub body: Vec<u8>,
    pub stats: CompressionStats,
}

impl CompressedBatch {
    /// Wire encoding per spec §4.3: 1-byte method tag, 1-byte register
    /// count, N register ids, 2-byte sample count (big-endian), 8-byte
    /// monotonic timestamp (big-endian), then the codec body.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 1 + self.header.register_ids.len() + 2 + 8 + self.body.len());
        out.push(self.header.method.as_u8());
        out.push(self.header.register_ids.len() as u8);
        out.extend_from_slice(&self.header.register_ids);
        out.extend_from_slice(&self.header.sample_count.to_be_bytes());
        out.extend_from_slice(&self.header.encoded_timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn from_wire(data: &[u8]) -> Result<Self, CodecError> {
        let method = MethodTag::from_u8(*data.first().ok_or(CodecError::Truncated)?)
            .ok_or(CodecError::Truncated)?;
        let register_count = *data.get(1).ok_or(CodecError::Truncated)? as usize;
        let ids_start = 2;
        let ids_end = ids_start + register_count;
        let register_ids = data.get(ids_start..ids_end).ok_or(CodecError::Truncated)?.to_vec();

        let sc_bytes = data.get(ids_end..ids_end + 2).ok_or(CodecError::Truncated)?;
        let sample_count = u16::from_be_bytes([sc_bytes[0], sc_bytes[1]]);

        let ts_start = ids_end + 2;
        let ts_bytes = data.get(ts_start..ts_start + 8).ok_or(CodecError::Truncated)?;
        let mut ts_arr = [0u8; 8];
        ts_arr.copy_from_slice(ts_bytes);
        let encoded_timestamp_ms = u64::from_be_bytes(ts_arr);

        let body_start = ts_start + 8;
        let body = data.get(body_start..).ok_or(CodecError::Truncated)?.to_vec();

        Ok(Self {
            header: BatchHeader { register_ids, sample_count, method, encoded_timestamp_ms },
            body,
            stats: CompressionStats {
                original_bytes: 0,
                compressed_bytes: data.len(),
                compression_ratio: 0.0,
                elapsed_micros: 0,
                lossless_verified: false,
            },
        })
    }
}

/// Transpose a batch's row-major samples into per-register columns, in
/// register-set order.
fn to_columns(batch: &Batch) -> Columns {
    batch
        .register_set()
        .ids()
        .iter()
        .map(|&id| batch.samples().iter().map(|s| s.value(id).unwrap_or(0)).collect())
        .collect()
}

fn encode_with(method: MethodTag, columns: &Columns) -> Vec<u8> {
    match method {
        MethodTag::Dictionary => codecs::dictionary::encode(columns),
        MethodTag::TemporalDelta => codecs::delta::encode(columns),
        MethodTag::SemanticRle => codecs::rle::encode(columns),
        MethodTag::BitPacked => codecs::bitpacked::encode(columns),
    }
}

fn decode_with(method: MethodTag, data: &[u8], register_count: usize, sample_count: usize) -> Result<Columns, CodecError> {
    match method {
        MethodTag::Dictionary => codecs::dictionary::decode(data, register_count, sample_count),
        MethodTag::TemporalDelta => codecs::delta::decode(data, register_count, sample_count),
        MethodTag::SemanticRle => codecs::rle::decode(data, register_count, sample_count),
        MethodTag::BitPacked => codecs::bitpacked::decode(data, register_count, sample_count),
    }
}

/// Compress `batch`, trying every codec and keeping the smallest body (ties
/// broken by [`MethodTag::priority_order`]), then verifying the winner
/// round-trips byte-exact before returning it. A verification failure is
/// reported via `on_fault` and forces a BIT_PACKED fallback, which always
/// round-trips because it makes no assumptions about the data.
pub fn compress_batch(
    batch: &Batch,
    encoded_timestamp_ms: u64,
    on_fault: &mut dyn FnMut(FaultEvent),
) -> Result<CompressedBatch, CompressError> {
    if batch.is_empty() {
        return Err(CompressError::EmptyBatch);
    }

    let columns = to_columns(batch);
    let register_ids = batch.register_set().ids().to_vec();
    let sample_count = batch.len() as u16;
    let original_bytes = register_ids.len() * batch.len() * 2;

    let started = Instant::now();

    let mut best: Option<(MethodTag, Vec<u8>)> = None;
    for method in MethodTag::priority_order() {
        let body = encode_with(method, &columns);
        match &best {
            Some((_, best_body)) if best_body.len() <= body.len() => {}
            _ => best = Some((method, body)),
        }
    }
    let (mut method, mut body) = best.expect("priority_order is non-empty");

    let verified = decode_with(method, &body, register_ids.len(), sample_count as usize)
        .map(|decoded| decoded == columns)
        .unwrap_or(false);

    let lossless_verified = if verified {
        true
    } else {
        on_fault(
            FaultEvent::new(
                FaultKind::CorruptFrame,
                "compressor",
                format!("{:?} failed lossless verification, falling back to BIT_PACKED", method),
            )
            .recovered(true),
        );
        method = MethodTag::BitPacked;
        body = encode_with(method, &columns);
        let fallback_ok = decode_with(method, &body, register_ids.len(), sample_count as usize)
            .map(|decoded| decoded == columns)
            .unwrap_or(false);
        fallback_ok
    };

    let elapsed_micros = started.elapsed().as_micros() as u64;
    let compressed_bytes = body.len();
    let compression_ratio = if compressed_bytes == 0 {
        0.0
    } else {
        original_bytes as f64 / compressed_bytes as f64
    };

    Ok(CompressedBatch {
        header: BatchHeader { register_ids, sample_count, method, encoded_timestamp_ms },
        body,
        stats: CompressionStats {
            original_bytes,
            compressed_bytes,
            compression_ratio,
            elapsed_micros,
            lossless_verified,
        },
    })
}

/// Decompress a [`CompressedBatch`] back into columns, for callers (e.g.
/// diagnostics, tests) that need the values rather than the wire bytes.
pub fn decompress(compressed: &CompressedBatch) -> Result<Columns, CodecError> {
    decode_with(
        compressed.header.method,
        &compressed.body,
        compressed.header.register_ids.len(),
        compressed.header.sample_count as usize,
    )
}
