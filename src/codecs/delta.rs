//! TEMPORAL_DELTA codec: first sample stored full-width, subsequent samples
//! as zigzag-encoded differences packed into variable-byte integers
//! (spec §4.3 codec 2). Best for slowly varying analog values.

use super::{read_varint, write_varint, zigzag_decode, zigzag_encode, Columns, CodecError};

pub fn encode(columns: &Columns) -> Vec<u8> {
    let mut out = Vec::new();
    for column in columns {
        let mut prev: Option<u16> = None;
        for &value in column {
            match prev {
                None => out.extend_from_slice(&value.to_be_bytes()),
                Some(p) => {
                    let diff = value as i32 - p as i32;
                    write_varint(&mut out, zigzag_encode(diff));
                }
            }
            prev = Some(value);
        }
    }
    out
}

pub fn decode(data: &[u8], register_count: usize, sample_count: usize) -> Result<Columns, CodecError> {
    let mut pos = 0usize;
    let mut columns = Vec::with_capacity(register_count);
    for _ in 0..register_count {
        let mut column = Vec::with_capacity(sample_count);
        let mut prev: Option<i32> = None;
        for _ in 0..sample_count {
            let value = match prev {
                None => {
                    let hi = *data.get(pos).ok_or(CodecError::Truncated)?;
                    let lo = *data.get(pos + 1).ok_or(CodecError::Truncated)?;
                    pos += 2;
                    u16::from_be_bytes([hi, lo]) as i32
                }
                Some(p) => {
                    let z = read_varint(data, &mut pos)?;
                    p + zigzag_decode(z)
                }
            };
            column.push(value as u16);
            prev = Some(value);
        }
        columns.push(column);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_slowly_varying() {
        let columns = vec![vec![1000, 1001, 1003, 1002, 1002, 999]];
        let encoded = encode(&columns);
        let decoded = decode(&encoded, 1, 6).unwrap();
        assert_eq!(decoded, columns);
    }

    #[test]
    fn round_trip_single_sample_degenerate() {
        let columns = vec![vec![42]];
        let encoded = encode(&columns);
        let decoded = decode(&encoded, 1, 1).unwrap();
        assert_eq!(decoded, columns);
    }

    #[test]
    fn round_trip_wraparound_extremes() {
        let columns = vec![vec![0, u16::MAX, 0, u16::MAX]];
        let encoded = encode(&columns);
        let decoded = decode(&encoded, 1, 4).unwrap();
        assert_eq!(decoded, columns);
    }
}
