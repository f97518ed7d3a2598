//! SEMANTIC_RLE codec: run-length encoding over bitwise-identical successive
//! values per register (spec §4.3 codec 3). Best when the inverter is
//! parked at a setpoint and a register holds steady for many samples.

use super::{Columns, CodecError};

/// Run lengths are single bytes; longer runs are split into multiple
/// `(255, value)` records.
const MAX_RUN: usize = 255;

pub fn encode(columns: &Columns) -> Vec<u8> {
    let mut out = Vec::new();
    for column in columns {
        let mut i = 0;
        while i < column.len() {
            let value = column[i];
            let mut run = 1usize;
            while i + run < column.len() && column[i + run] == value && run < MAX_RUN {
                run += 1;
            }
            out.push(run as u8);
            out.extend_from_slice(&value.to_be_bytes());
            i += run;
        }
    }
    out
}

pub fn decode(data: &[u8], register_count: usize, sample_count: usize) -> Result<Columns, CodecError> {
    let mut pos = 0usize;
    let mut columns = Vec::with_capacity(register_count);
    for _ in 0..register_count {
        let mut column = Vec::with_capacity(sample_count);
        while column.len() < sample_count {
            let run = *data.get(pos).ok_or(CodecError::Truncated)? as usize;
            let hi = *data.get(pos + 1).ok_or(CodecError::Truncated)?;
            let lo = *data.get(pos + 2).ok_or(CodecError::Truncated)?;
            pos += 3;
            let value = u16::from_be_bytes([hi, lo]);
            for _ in 0..run {
                column.push(value);
            }
        }
        if column.len() != sample_count {
            return Err(CodecError::Truncated);
        }
        columns.push(column);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_steady_setpoint() {
        let columns = vec![vec![500; 20]];
        let encoded = encode(&columns);
        assert_eq!(encoded.len(), 3, "one run record for a fully steady column");
        let decoded = decode(&encoded, 1, 20).unwrap();
        assert_eq!(decoded, columns);
    }

    #[test]
    fn round_trip_long_run_splits_records() {
        let column = vec![7u16; 600];
        let columns = vec![column.clone()];
        let encoded = encode(&columns);
        let decoded = decode(&encoded, 1, 600).unwrap();
        assert_eq!(decoded, columns);
    }

    #[test]
    fn round_trip_alternating_values() {
        let columns = vec![vec![1, 2, 1, 2, 1]];
        let encoded = encode(&columns);
        let decoded = decode(&encoded, 1, 5).unwrap();
        assert_eq!(decoded, columns);
    }
}
