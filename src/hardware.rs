//! UART-backed Modbus RTU serial port (spec §4.4 "Peripheral gating", C4/C6).
//!
//! Wraps `esp_idf_hal::uart::UartDriver` behind [`acquisition::SerialPort`]
//! so the poll handler never touches `esp_idf_hal` directly. `open`/`close`
//! are the device's only source of duty-cycling (spec §4.4): `close`
//! flushes outstanding bytes, `open` clears any stale input left over from a
//! previous, aborted exchange.

use crate::acquisition::SerialPort;
use esp_idf_hal::uart::UartDriver;
use std::io;
use std::time::{Duration, Instant};

/// Inter-byte gap that ends a frame read early (spec §5 "1s per byte-gap").
const BYTE_GAP_TIMEOUT: Duration = Duration::from_secs(1);
/// Longest a single response read is allowed to take (spec §5 "5s total").
const TOTAL_READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FRAME_LEN: usize = 256;

pub struct ModbusSerialPort<'d> {
    uart: UartDriver<'d>,
    is_open: bool,
}

impl<'d> ModbusSerialPort<'d> {
    pub fn new(uart: UartDriver<'d>) -> Self {
        Self { uart, is_open: false }
    }
}

impl<'d> SerialPort for ModbusSerialPort<'d> {
    fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        self.uart
            .write(frame)
            .map(|_| ())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    /// Read until a byte-gap or the total timeout elapses, whichever comes
    /// first. Modbus RTU has no length prefix the transport can trust ahead
    /// of parsing, so framing is inferred from silence on the wire.
    fn read_frame(&mut self, timeout: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout.min(TOTAL_READ_TIMEOUT);
        let mut buf = [0u8; MAX_FRAME_LEN];
        let mut out = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let slice_timeout = remaining.min(BYTE_GAP_TIMEOUT);
            let ticks = slice_timeout.as_millis().max(1) as u32;
            match self.uart.read(&mut buf, ticks) {
                Ok(0) if out.is_empty() => continue,
                Ok(0) => break, // gap after at least one byte: frame is done
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
            }
        }

        if out.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no response from inverter"));
        }
        Ok(out)
    }

    fn open(&mut self) -> io::Result<()> {
        // Drop anything left over from an aborted prior exchange before the
        // new request goes out.
        let _ = self.uart.clear_rx();
        self.is_open = true;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.uart
            .wait_tx_done(TOTAL_READ_TIMEOUT.as_millis() as u32)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.is_open = false;
        Ok(())
    }
}
