//! DICTIONARY codec: a per-register LRU-capped learned map from observed
//! `u16` values to small ids (spec §4.3 codec 1).
//!
//! Best for registers with few distinct values over a batch (e.g. a status
//! word or a setpoint that rarely changes). Each entry in the body is
//! either a MISS (new value, carries the id it was assigned plus the full
//! value so the decoder's table stays in sync) or a HIT (an id already in
//! the table). Because the id is always explicit on the wire, the decoder
//! never needs to replay the encoder's eviction policy — it just mirrors
//! whatever the encoder did.

use super::{Columns, CodecError};
use std::collections::{HashMap, VecDeque};

/// Per spec §4.3: "≤ 256 entries per register".
pub const MAX_ENTRIES: usize = 256;

const TAG_MISS: u8 = 0;
const TAG_HIT: u8 = 1;

struct LruDict {
    id_to_value: HashMap<u8, u16>,
    value_to_id: HashMap<u16, u8>,
    recency: VecDeque<u8>, // front = most recently used
}

impl LruDict {
    fn new() -> Self {
        Self { id_to_value: HashMap::new(), value_to_id: HashMap::new(), recency: VecDeque::new() }
    }

    fn touch(&mut self, id: u8) {
        self.recency.retain(|&x| x != id);
        self.recency.push_front(id);
    }

    /// Returns `(tag, id, needs_value)` for encoding this occurrence.
    fn encode_step(&mut self, value: u16) -> (u8, u8, bool) {
        if let Some(&id) = self.value_to_id.get(&value) {
            self.touch(id);
            return (TAG_HIT, id, false);
        }

        let id = if self.id_to_value.len() < MAX_ENTRIES {
            self.id_to_value.len() as u8
        } else {
            let evict = self.recency.pop_back().expect("full table has entries");
            if let Some(old_value) = self.id_to_value.remove(&evict) {
                self.value_to_id.remove(&old_value);
            }
            evict
        };

        self.id_to_value.insert(id, value);
        self.value_to_id.insert(value, id);
        self.touch(id);
        (TAG_MISS, id, true)
    }

    fn decode_step(&mut self, tag: u8, id: u8, value: Option<u16>) -> Result<u16, CodecError> {
        match tag {
            t if t == TAG_MISS => {
                let value = value.ok_or(CodecError::Truncated)?;
                if let Some(old_value) = self.id_to_value.insert(id, value) {
                    self.value_to_id.remove(&old_value);
                }
                self.value_to_id.insert(value, id);
                self.touch(id);
                Ok(value)
            }
            t if t == TAG_HIT => {
                let value = *self.id_to_value.get(&id).ok_or(CodecError::Truncated)?;
                self.touch(id);
                Ok(value)
            }
            _ => Err(CodecError::Truncated),
        }
    }
}

pub fn encode(columns: &Columns) -> Vec<u8> {
    let mut out = Vec::new();
    for column in columns {
        let mut dict = LruDict::new();
        for &value in column {
            let (tag, id, needs_value) = dict.encode_step(value);
            out.push(tag);
            out.push(id);
            if needs_value {
                out.extend_from_slice(&value.to_be_bytes());
            }
        }
    }
    out
}

pub fn decode(data: &[u8], register_count: usize, sample_count: usize) -> Result<Columns, CodecError> {
    let mut pos = 0usize;
    let mut columns = Vec::with_capacity(register_count);
    for _ in 0..register_count {
        let mut dict = LruDict::new();
        let mut column = Vec::with_capacity(sample_count);
        for _ in 0..sample_count {
            let tag = *data.get(pos).ok_or(CodecError::Truncated)?;
            pos += 1;
            let id = *data.get(pos).ok_or(CodecError::Truncated)?;
            pos += 1;
            let value = if tag == TAG_MISS {
                let hi = *data.get(pos).ok_or(CodecError::Truncated)?;
                let lo = *data.get(pos + 1).ok_or(CodecError::Truncated)?;
                pos += 2;
                Some(u16::from_be_bytes([hi, lo]))
            } else {
                None
            };
            column.push(dict.decode_step(tag, id, value)?);
        }
        columns.push(column);
    }
    Ok(columns)
}
