//! EcoWatt gateway firmware: polls a solar inverter over Modbus RTU,
//! compresses the batch, and ships it to the cloud inside a signed/optionally
//! encrypted envelope — plus remote commands, remote config sync, and
//! signed firmware OTA (spec §1-§4).
//!
//! The binary (`src/main.rs`) does hardware bring-up and owns the run loop;
//! everything else is either pure logic (testable on the host) or a narrow
//! trait seam (`SerialPort`, `Transport`, `OtaBackend`, `PersistentStore`)
//! with a real ESP-IDF impl and a host fake on either side of it.

#[macro_use]
pub mod logging;

#[cfg(target_os = "espidf")]
pub mod diagnostics;

pub mod acquisition;
pub mod app;
pub mod codecs;
pub mod command;
pub mod compressor;
pub mod config;
pub mod configsync;
pub mod coordinator;
pub mod fault;
pub mod hardware;
pub mod modbus;
pub mod ota;
pub mod registers;
pub mod security;
pub mod transport;
pub mod upload;
pub mod utils;
pub mod version;
