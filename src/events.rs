// PyroVision — System Events & Data Types
//
// Every cross-task notification is one of these owned values. The event bus
// clones an `Event` on post, so a handler never sees memory the poster can
// still mutate.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::settings::{
    DisplaySettings, HttpServerSettings, LeptonSettings, ProvisioningSettings, SystemSettings,
    VisaServerSettings, WifiSettings,
};
use crate::time::TimeSource;

// ---------------------------------------------------------------------------
// Event bases (topics)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventBase {
    Network,
    Lepton,
    Gui,
    Devices,
    Settings,
    Time,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Network(NetworkEvent),
    Lepton(LeptonEvent),
    Gui(GuiEvent),
    Devices(DevicesEvent),
    Settings(SettingsEvent),
    Time(TimeEvent),
}

impl Event {
    pub fn base(&self) -> EventBase {
        match self {
            Self::Network(_) => EventBase::Network,
            Self::Lepton(_) => EventBase::Lepton,
            Self::Gui(_) => EventBase::Gui,
            Self::Devices(_) => EventBase::Devices,
            Self::Settings(_) => EventBase::Settings,
            Self::Time(_) => EventBase::Time,
        }
    }
}

// ---------------------------------------------------------------------------
// Network state: one authoritative copy, owned by the WiFi manager
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Provisioning,
    ApStarted,
    Error,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Provisioning => "provisioning",
            Self::ApStarted => "ap",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

// ---------------------------------------------------------------------------
// Network events
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// Station associated with the AP (no IP yet).
    WifiConnected,
    /// Station lost the AP. `reason` is the raw 802.11 / IDF reason code.
    WifiDisconnected { reason: u16 },
    WifiGotIp(IpInfo),
    CredentialsUpdated { ssid: String },
    ApStarted,
    ApStopped,
    ApStaConnected,
    ApStaDisconnected,
    ProvStarted,
    ProvStopped,
    /// Credentials arrived over the provisioning transport.
    ProvCredentialsReceived { ssid: String, password: String },
    ProvSuccess,
    ProvFailed,
    ProvTimeout,
    WsClientConnected { fd: i32 },
    WsClientDisconnected { fd: i32 },
    OtaStarted,
    OtaProgress { written: usize },
    OtaCompleted { size: usize },
    OtaFailed,
    SntpSynced,
    /// POSIX TZ string, e.g. "CET-1CEST,M3.5.0,M10.5.0/3".
    SetTimezone(String),
    /// User asked for the device to join an open network / retry.
    OpenWifiRequest,
    ServerStarted,
    ServerStopped,
    ServerError,
    StateChanged(NetworkState),
}

// ---------------------------------------------------------------------------
// Thermal camera (Lepton): regions of interest & statistics
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoiType {
    Spotmeter,
    Scene,
    Agc,
    VideoFocus,
}

/// Rectangle in sensor coordinates. `x + w - 1` is the inclusive end column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub kind: RoiType,
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}

impl Roi {
    pub fn end_col(&self) -> u16 {
        self.x.saturating_add(self.w).saturating_sub(1)
    }

    pub fn end_row(&self) -> u16 {
        self.y.saturating_add(self.h).saturating_sub(1)
    }
}

/// Spotmeter statistics, °C.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Spotmeter {
    pub min_c: f32,
    pub max_c: f32,
    pub avg_c: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeptonEvent {
    CameraReady { part_number: String, serial: String },
    CameraError,
    RoiResponse(Roi),
    Temperatures { fpa_c: f32, aux_c: f32 },
    Uptime(u32),
    PixelTemperature { x: u16, y: u16, temp_c: f32 },
    Spotmeter(Spotmeter),
}

// ---------------------------------------------------------------------------
// GUI → capture requests
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq)]
pub enum GuiEvent {
    SetRoi(Roi),
    GetTemperatures,
    GetUptime,
    GetPixelTemperature { screen_x: u16, screen_y: u16 },
    GetSpotmeter,
}

// ---------------------------------------------------------------------------
// Devices (power, RTC, SD)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DevicesEvent {
    /// Battery voltage (V) and charge (0–100 %).
    Battery { voltage: f32, percentage: u8 },
    Charging(bool),
    SdCard { present: bool, free_mb: u32 },
    /// A card is inserted but its filesystem could not be mounted.
    SdMountFailed,
}

// ---------------------------------------------------------------------------
// Settings: each change carries a copy of the section
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsEvent {
    Loaded,
    Saved,
    LeptonChanged(LeptonSettings),
    WifiChanged(WifiSettings),
    ProvisioningChanged(ProvisioningSettings),
    DisplayChanged(DisplaySettings),
    HttpServerChanged(HttpServerSettings),
    VisaServerChanged(VisaServerSettings),
    SystemChanged(SystemSettings),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeEvent {
    SourceChanged(TimeSource),
    Synchronized,
}
