//! BLE device session: scanning, connecting and resolving the printer's
//! writable characteristic with btleplug.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use log::{debug, info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::error::TransportError;
use crate::printer::Endpoint;

/// Serial-over-GATT service exposed by most thermal label printers.
pub const PRINTER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ff00_0000_1000_8000_00805f9b34fb);
/// Write characteristic inside [`PRINTER_SERVICE_UUID`].
pub const PRINTER_WRITE_UUID: Uuid = Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum BleError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("timed out connecting to device")]
    ConnectTimeout,
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error(transparent)]
    Btle(#[from] btleplug::Error),
}

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Scan results in discovery order, one entry per device id.
#[derive(Debug, Clone, Default)]
pub struct ScanResults {
    devices: Vec<DeviceInfo>,
}

impl ScanResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device. A known id keeps its position and takes the newer
    /// name/rssi if present. Returns true if the device was new.
    pub fn insert(&mut self, device: DeviceInfo) -> bool {
        match self.devices.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => {
                if device.name.is_some() {
                    existing.name = device.name;
                }
                if device.rssi.is_some() {
                    existing.rssi = device.rssi;
                }
                false
            }
            None => {
                self.devices.push(device);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.iter()
    }

    pub fn into_vec(self) -> Vec<DeviceInfo> {
        self.devices
    }
}

/// Which service/characteristic to write to, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattIds {
    pub service: Uuid,
    pub write_characteristic: Uuid,
    pub write_type: WriteType,
}

impl Default for GattIds {
    fn default() -> Self {
        Self {
            service: PRINTER_SERVICE_UUID,
            write_characteristic: PRINTER_WRITE_UUID,
            write_type: WriteType::WithoutResponse,
        }
    }
}

/// Writable characteristic of a connected printer.
pub struct GattEndpoint {
    peripheral: Peripheral,
    characteristic: Characteristic,
    write_type: WriteType,
}

impl GattEndpoint {
    pub fn characteristic(&self) -> &Characteristic {
        &self.characteristic
    }

    pub async fn disconnect(&self) -> Result<(), BleError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl Endpoint for GattEndpoint {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.characteristic, data, self.write_type)
            .await?;
        Ok(())
    }
}

async fn first_adapter() -> Result<Adapter, BleError> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(BleError::NoAdapter)
}

async fn device_info(peripheral: &Peripheral) -> Result<DeviceInfo, BleError> {
    let props = peripheral.properties().await?;
    Ok(DeviceInfo {
        id: peripheral.id().to_string(),
        name: props.as_ref().and_then(|p| p.local_name.clone()),
        rssi: props.and_then(|p| p.rssi),
    })
}

/// Scan for BLE devices.
///
/// - `duration`: how long to listen for advertisements
///
/// Returns every device seen, deduplicated, in discovery order.
pub async fn scan(duration: Duration) -> Result<Vec<DeviceInfo>, BleError> {
    scan_filtered(duration, None).await
}

/// Scan, keeping only devices whose advertised name starts with `name_prefix`.
pub async fn scan_filtered(
    duration: Duration,
    name_prefix: Option<&str>,
) -> Result<Vec<DeviceInfo>, BleError> {
    let adapter = first_adapter().await?;
    adapter.start_scan(ScanFilter::default()).await?;
    let polled = poll_devices(&adapter, duration, name_prefix).await;
    always_cleanup(polled, adapter.stop_scan()).await
}

async fn poll_devices(
    adapter: &Adapter,
    duration: Duration,
    name_prefix: Option<&str>,
) -> Result<Vec<DeviceInfo>, BleError> {
    let mut results = ScanResults::new();
    let start = tokio::time::Instant::now();
    while start.elapsed() < duration {
        for peripheral in adapter.peripherals().await? {
            let info = match device_info(&peripheral).await {
                Ok(info) => info,
                Err(e) => {
                    debug!("skipping {}: {}", peripheral.id(), e);
                    continue;
                }
            };
            let wanted = match name_prefix {
                Some(prefix) => info.name.as_deref().is_some_and(|n| n.starts_with(prefix)),
                None => true,
            };
            if wanted && results.insert(info.clone()) {
                debug!("found device id={} name={:?}", info.id, info.name);
            }
        }
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
    }
    Ok(results.into_vec())
}

/// Connect to a device and resolve its writable characteristic.
///
/// - `id`: device id as reported by [`scan`]
/// - `timeout`: upper bound for finding and connecting to the device
/// - `ids`: service/characteristic to use
///
/// A link that was opened but has no usable characteristic is disconnected
/// before the error is returned.
pub async fn connect(id: &str, timeout: Duration, ids: GattIds) -> Result<GattEndpoint, BleError> {
    let adapter = first_adapter().await?;
    adapter.start_scan(ScanFilter::default()).await?;
    let found = match tokio::time::timeout(timeout, find_peripheral(&adapter, id)).await {
        Ok(found) => found,
        Err(_) => Err(BleError::DeviceNotFound(id.to_string())),
    };
    let peripheral = always_cleanup(found, adapter.stop_scan()).await?;

    let opened = open_characteristic(&peripheral, timeout, ids).await;
    let characteristic = cleanup_on_error(opened, peripheral.disconnect()).await?;

    info!("connected to {} (write characteristic {})", id, characteristic.uuid);
    Ok(GattEndpoint {
        peripheral,
        characteristic,
        write_type: ids.write_type,
    })
}

async fn open_characteristic(
    peripheral: &Peripheral,
    timeout: Duration,
    ids: GattIds,
) -> Result<Characteristic, BleError> {
    tokio::time::timeout(timeout, peripheral.connect())
        .await
        .map_err(|_| BleError::ConnectTimeout)??;
    peripheral.discover_services().await?;

    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.service_uuid == ids.service && c.uuid == ids.write_characteristic)
        .ok_or(BleError::CharacteristicNotFound(ids.write_characteristic))
}

/// Runs `cleanup` after `result`, whatever it is.
///
/// The first error wins: a cleanup failure is only returned when `result`
/// succeeded, otherwise it is logged.
async fn always_cleanup<T, F>(result: Result<T, BleError>, cleanup: F) -> Result<T, BleError>
where
    F: Future<Output = Result<(), btleplug::Error>>,
{
    match (result, cleanup.await) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup_err)) => {
            warn!("cleanup after failure also failed: {}", cleanup_err);
            Err(e)
        }
    }
}

/// Runs `cleanup` only if `result` is an error, then returns `result`.
async fn cleanup_on_error<T, F>(result: Result<T, BleError>, cleanup: F) -> Result<T, BleError>
where
    F: Future<Output = Result<(), btleplug::Error>>,
{
    if result.is_err() {
        if let Err(e) = cleanup.await {
            warn!("disconnect after failed connect also failed: {}", e);
        }
    }
    result
}

/// Like [`connect`], but any failure is logged and reported as `None`.
pub async fn resolve_endpoint(id: &str, timeout: Duration, ids: GattIds) -> Option<GattEndpoint> {
    match connect(id, timeout, ids).await {
        Ok(endpoint) => Some(endpoint),
        Err(e) => {
            warn!("could not resolve printer endpoint on {}: {}", id, e);
            None
        }
    }
}

async fn find_peripheral(adapter: &Adapter, id: &str) -> Result<Peripheral, BleError> {
    loop {
        for peripheral in adapter.peripherals().await? {
            if peripheral.id().to_string() == id {
                return Ok(peripheral);
            }
        }
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
    }
}
