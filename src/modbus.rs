//! Modbus RTU frame codec: request/response build + parse, CRC-16 (spec §4.4, §6.1).

use thiserror::Error;

/// CRC-16/MODBUS: polynomial 0xA001 (reflected form of 0x8005), seed 0xFFFF,
/// result transmitted little-endian.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

pub const FUNCTION_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FUNCTION_WRITE_SINGLE_REGISTER: u8 = 0x06;
/// Exception responses set the high bit of the function code.
const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("CRC mismatch: expected {expected:04X}, got {actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },
    #[error("unexpected function code {0:02X}")]
    UnexpectedFunction(u8),
    #[error("byte count {declared} does not match expected {expected}")]
    ByteCountMismatch { declared: usize, expected: usize },
    #[error("slave address mismatch: expected {expected}, got {actual}")]
    SlaveMismatch { expected: u8, actual: u8 },
}

/// Build a read-holding-registers request (spec §4.4 request layout).
pub fn build_read_request(slave: u8, start_address: u16, quantity: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave);
    frame.push(FUNCTION_READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&start_address.to_be_bytes());
    frame.extend_from_slice(&quantity.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Build a write-single-register request.
pub fn build_write_single_request(slave: u8, address: u16, value: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave);
    frame.push(FUNCTION_WRITE_SINGLE_REGISTER);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    append_crc(&mut frame);
    frame
}

fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    // on-wire CRC is little-endian: lo byte first, then hi byte.
    frame.push((crc & 0x00FF) as u8);
    frame.push((crc >> 8) as u8);
}

fn verify_crc(frame: &[u8]) -> Result<(), FrameError> {
    if frame.len() < 4 {
        return Err(FrameError::TooShort(frame.len()));
    }
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let actual = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if expected != actual {
        return Err(FrameError::CrcMismatch { expected, actual });
    }
    Ok(())
}

/// Outcome of parsing a response to a read-holding-registers request.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadResponse {
    Ok(Vec<u16>),
    Exception(u8),
}

/// Parse a response to a read-holding-registers request, validating CRC,
/// slave address, function code and byte count (spec §4.4 response layouts).
pub fn parse_read_response(frame: &[u8], expected_slave: u8, expected_qty: u16) -> Result<ReadResponse, FrameError> {
    verify_crc(frame)?;
    let slave = frame[0];
    if slave != expected_slave {
        return Err(FrameError::SlaveMismatch { expected: expected_slave, actual: slave });
    }
    let function = frame[1];
    if function == (FUNCTION_READ_HOLDING_REGISTERS | EXCEPTION_FLAG) {
        if frame.len() < 5 {
            return Err(FrameError::TooShort(frame.len()));
        }
        return Ok(ReadResponse::Exception(frame[2]));
    }
    if function != FUNCTION_READ_HOLDING_REGISTERS {
        return Err(FrameError::UnexpectedFunction(function));
    }
    if frame.len() < 3 {
        return Err(FrameError::TooShort(frame.len()));
    }
    let byte_count = frame[2] as usize;
    let expected_bytes = 2 * expected_qty as usize;
    if byte_count != expected_bytes {
        return Err(FrameError::ByteCountMismatch { declared: byte_count, expected: expected_bytes });
    }
    let data = &frame[3..3 + byte_count];
    if data.len() != byte_count {
        return Err(FrameError::TooShort(frame.len()));
    }
    let values = data
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    Ok(ReadResponse::Ok(values))
}

/// Parse a response to a write-single-register request: the inverter echoes
/// the request frame back on success, or replies with an exception frame.
pub fn parse_write_response(frame: &[u8], expected_slave: u8, expected_address: u16, expected_value: u16) -> Result<ReadResponse, FrameError> {
    verify_crc(frame)?;
    let slave = frame[0];
    if slave != expected_slave {
        return Err(FrameError::SlaveMismatch { expected: expected_slave, actual: slave });
    }
    let function = frame[1];
    if function == (FUNCTION_WRITE_SINGLE_REGISTER | EXCEPTION_FLAG) {
        if frame.len() < 5 {
            return Err(FrameError::TooShort(frame.len()));
        }
        return Ok(ReadResponse::Exception(frame[2]));
    }
    if function != FUNCTION_WRITE_SINGLE_REGISTER {
        return Err(FrameError::UnexpectedFunction(function));
    }
    if frame.len() < 8 {
        return Err(FrameError::TooShort(frame.len()));
    }
    let address = u16::from_be_bytes([frame[2], frame[3]]);
    let value = u16::from_be_bytes([frame[4], frame[5]]);
    if address != expected_address || value != expected_value {
        // Inverter echoed something other than what was written; treat as a
        // structurally-impossible frame rather than silently accepting it.
        return Err(FrameError::UnexpectedFunction(function));
    }
    Ok(ReadResponse::Ok(vec![value]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vector() {
        // Read holding registers, slave 1, start 0, qty 2 — a widely cited
        // worked example for the Modbus CRC-16.
        let frame_without_crc = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        let crc = crc16(&frame_without_crc);
        assert_eq!(crc, 0xC40B);
    }

    #[test]
    fn build_read_request_shape() {
        let req = build_read_request(1, 0x0000, 2);
        assert_eq!(req.len(), 8);
        assert_eq!(&req[0..6], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn round_trip_read_response() {
        let slave = 1u8;
        let qty = 3u16;
        let mut frame = vec![slave, FUNCTION_READ_HOLDING_REGISTERS, 6u8];
        for v in [100u16, 200, 300] {
            frame.extend_from_slice(&v.to_be_bytes());
        }
        append_crc(&mut frame);

        let parsed = parse_read_response(&frame, slave, qty).unwrap();
        assert_eq!(parsed, ReadResponse::Ok(vec![100, 200, 300]));
    }

    #[test]
    fn detects_crc_error() {
        let mut frame = vec![1u8, FUNCTION_READ_HOLDING_REGISTERS, 2, 0, 42];
        append_crc(&mut frame);
        frame[4] ^= 0xFF; // flip a data bit after CRC was computed
        assert!(matches!(parse_read_response(&frame, 1, 1), Err(FrameError::CrcMismatch { .. })));
    }

    #[test]
    fn parses_exception_response() {
        let mut frame = vec![1u8, FUNCTION_READ_HOLDING_REGISTERS | EXCEPTION_FLAG, 0x02];
        append_crc(&mut frame);
        let parsed = parse_read_response(&frame, 1, 1).unwrap();
        assert_eq!(parsed, ReadResponse::Exception(0x02));
    }

    #[test]
    fn write_single_register_round_trip() {
        let req = build_write_single_request(1, 0x0032, 50);
        // Device echoes the request verbatim on success.
        let resp = parse_write_response(&req, 1, 0x0032, 50).unwrap();
        assert_eq!(resp, ReadResponse::Ok(vec![50]));
    }
}
