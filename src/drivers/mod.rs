// PyroVision — Hardware Collaborators
//
// The core talks to hardware and IDF services only through these traits.
// `sim` provides host implementations; `esp` the ESP-IDF ones.

pub mod sim;

#[cfg(target_os = "espidf")]
pub mod esp;

use thiserror::Error;

use crate::events::{Roi, RoiType};
use crate::frame_channel::FrameChannel;
use crate::settings::WifiMode;

// ---------------------------------------------------------------------------
// Thermal sensor
// ---------------------------------------------------------------------------
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor not responding")]
    NotResponding,
    #[error("sensor transaction failed: {0}")]
    Transaction(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// One raw capture, as delivered through the 1-slot raw queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Radiometric pixels in centikelvin, row-major.
    pub pixels: Vec<u16>,
    pub telemetry: Vec<u16>,
    pub width: u16,
    pub height: u16,
    pub bytes_per_pixel: u8,
}

/// Spotmeter statistics straight from the sensor, centikelvin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSpotmeter {
    pub min: u16,
    pub max: u16,
    pub avg: u16,
}

pub trait ThermalSensor: Send {
    /// Begin streaming; every new frame overwrites the slot in `sink`.
    fn start_capture(&mut self, sink: FrameChannel<RawFrame>) -> Result<(), SensorError>;
    fn stop_capture(&mut self);

    fn part_number(&mut self) -> Result<String, SensorError>;
    fn serial_number(&mut self) -> Result<u64, SensorError>;

    fn set_roi(&mut self, roi: &Roi) -> Result<(), SensorError>;
    fn roi(&mut self, kind: RoiType) -> Result<Roi, SensorError>;

    /// Focal-plane array temperature, centikelvin.
    fn fpa_temperature(&mut self) -> Result<u16, SensorError>;
    /// Housing (aux) temperature, centikelvin.
    fn aux_temperature(&mut self) -> Result<u16, SensorError>;
    fn uptime_ms(&mut self) -> Result<u32, SensorError>;
    fn spotmeter(&mut self) -> Result<RawSpotmeter, SensorError>;
}

// ---------------------------------------------------------------------------
// Power
// ---------------------------------------------------------------------------
pub trait PowerMonitor: Send {
    fn battery_voltage(&mut self) -> Result<f32, SensorError>;
    fn is_charging(&mut self) -> Result<bool, SensorError>;
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sd card mount failed: {0}")]
    Mount(String),
    #[error("filesystem query failed: {0}")]
    Info(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfo {
    pub total_mb: u32,
    pub free_mb: u32,
}

/// Removable card holding the FAT filesystem. Implementations mount on
/// demand and drop the mount once the card stops answering.
pub trait StorageMonitor: Send {
    /// Capacity of the mounted card, `Ok(None)` while no card is present.
    fn storage(&mut self) -> Result<Option<StorageInfo>, StorageError>;
}

// ---------------------------------------------------------------------------
// WiFi
// ---------------------------------------------------------------------------
#[derive(Debug, Error)]
pub enum WifiError {
    #[error("wifi driver error: {0}")]
    Driver(String),
    #[error("wifi not started")]
    NotStarted,
    #[error("invalid wifi configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaConfig {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApConfig {
    pub ssid: String,
    /// Empty = open network.
    pub password: String,
    pub channel: u8,
    pub max_connections: u16,
}

/// Station / access-point driver. Asynchronous outcomes (associated, got IP,
/// disconnected, AP up) arrive as `NetworkEvent`s on the event bus.
pub trait WifiDriver: Send {
    fn configure(
        &mut self,
        mode: WifiMode,
        sta: Option<&StaConfig>,
        ap: Option<&ApConfig>,
    ) -> Result<(), WifiError>;
    fn start(&mut self) -> Result<(), WifiError>;
    fn connect(&mut self) -> Result<(), WifiError>;
    fn disconnect(&mut self) -> Result<(), WifiError>;
    fn stop(&mut self) -> Result<(), WifiError>;
    /// RSSI of the current association, if any.
    fn rssi(&mut self) -> Option<i8>;
    fn mac(&mut self) -> [u8; 6];
}

/// Credential channel used while provisioning (captive portal, BLE).
/// Received credentials are posted as `ProvCredentialsReceived`.
pub trait ProvisioningTransport: Send {
    fn start(&mut self, service_name: &str) -> Result<(), WifiError>;
    fn stop(&mut self);
}

// ---------------------------------------------------------------------------
// OTA
// ---------------------------------------------------------------------------
#[derive(Debug, Error)]
pub enum OtaError {
    #[error("no OTA partition available")]
    NoPartition,
    #[error("OTA write failed: {0}")]
    Write(String),
    #[error("OTA image invalid: {0}")]
    Invalid(String),
}

pub trait OtaUpdate {
    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError>;
    /// Validate the image and mark it bootable.
    fn complete(self: Box<Self>) -> Result<(), OtaError>;
    fn abort(self: Box<Self>);
}

pub trait OtaWriter: Send + Sync {
    fn begin(&self) -> Result<Box<dyn OtaUpdate + '_>, OtaError>;
    /// Reboot into the new image after `delay_ms`.
    fn schedule_restart(&self, delay_ms: u64);
}
