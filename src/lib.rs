//! Label printer library: stream text to BLE label printers in bounded, paced writes.
//!
//! Main modules:
//! - ble: device scanning, connection and the GATT write endpoint
//! - error: error and outcome types
//! - printer: characteristic writer, chunk scheduler and print session
//! - protocol: byte encoding and segment planning

pub mod ble;
pub mod error;
pub mod printer;
pub mod protocol;

/// BLE API: scan/connect to printers
pub use ble::{connect, resolve_endpoint, scan, DeviceInfo, GattEndpoint, GattIds, ScanResults};
pub use error::{PrintError, PrintOutcome, TransportError, WriteOutcome};
/// Printing API
pub use printer::*;
/// Protocol utilities (encoding, segmenting)
pub use protocol::*;
