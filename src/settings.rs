// PyroVision — Persistent Settings
//
// RAM copy of every settings section, backed by a key-value store (NVS on the
// device, a map on the host). Each section is stored as one JSON value under
// its own key. Updates change RAM only and announce a copy on the event bus;
// `save` persists everything.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::*;
use crate::event_bus::{EventBus, Wait};
use crate::events::{Event, Roi, RoiType, SettingsEvent};

const SETTINGS_POST_WAIT: Wait = Wait::For(Duration::from_millis(100));

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid {section} settings: {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },
    #[error("settings store error: {0}")]
    Store(String),
    #[error("settings encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WifiMode {
    #[default]
    Sta,
    Ap,
    ApSta,
}

impl WifiMode {
    /// AP fallback is configured whenever the device may host its own network.
    pub fn has_ap(&self) -> bool {
        matches!(self, Self::Ap | Self::ApSta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvMethod {
    None,
    Ble,
    #[default]
    SoftAp,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoSettings {
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
    pub hardware_revision: String,
    pub serial_number: String,
}

impl Default for InfoSettings {
    fn default() -> Self {
        Self {
            device_name: "PyroVision".into(),
            manufacturer: "PyroVision".into(),
            model: "PyroVision Thermal".into(),
            hardware_revision: "1.0".into(),
            serial_number: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emissivity {
    /// 0–100 %.
    pub value: f32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeptonSettings {
    pub rois: Vec<Roi>,
    pub emissivity_presets: Vec<Emissivity>,
}

impl Default for LeptonSettings {
    fn default() -> Self {
        let (w, h) = (LEPTON_WIDTH, LEPTON_HEIGHT);
        let preset = |value: f32, description: &str| Emissivity {
            value,
            description: description.into(),
        };
        Self {
            rois: vec![
                Roi { kind: RoiType::Spotmeter, x: w / 2 - 1, y: h / 2 - 1, w: 2, h: 2 },
                Roi { kind: RoiType::Scene, x: 0, y: 0, w, h },
                Roi { kind: RoiType::Agc, x: 0, y: 0, w, h },
                Roi { kind: RoiType::VideoFocus, x: 1, y: 1, w: w - 2, h: h - 2 },
            ],
            emissivity_presets: vec![
                preset(95.0, "Default"),
                preset(98.0, "Human skin"),
                preset(96.0, "Water"),
                preset(92.0, "Concrete"),
                preset(5.0, "Aluminium, polished"),
            ],
        }
    }
}

impl LeptonSettings {
    pub fn roi(&self, kind: RoiType) -> Option<Roi> {
        self.rois.iter().copied().find(|r| r.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiSettings {
    pub ssid: String,
    pub password: String,
    pub auto_connect: bool,
    pub max_retries: u8,
    pub retry_interval_ms: u16,
    pub mode: WifiMode,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            auto_connect: true,
            max_retries: WIFI_DEFAULT_MAX_RETRIES,
            retry_interval_ms: WIFI_DEFAULT_RETRY_INTERVAL_MS,
            mode: WifiMode::Sta,
        }
    }
}

impl WifiSettings {
    pub fn has_credentials(&self) -> bool {
        !self.ssid.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSettings {
    pub name: String,
    pub timeout_s: u32,
    pub method: ProvMethod,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            name: "PyroVision".into(),
            timeout_s: PROV_DEFAULT_TIMEOUT_S,
            method: ProvMethod::SoftAp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    /// 0–100 %.
    pub brightness: u8,
    /// Seconds, 0 = never.
    pub timeout_s: u16,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            brightness: 80,
            timeout_s: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServerSettings {
    pub port: u16,
    pub ws_ping_interval_s: u16,
    pub max_clients: u8,
    pub enable_cors: bool,
    pub api_key: Option<String>,
}

impl Default for HttpServerSettings {
    fn default() -> Self {
        Self {
            port: HTTP_DEFAULT_PORT,
            ws_ping_interval_s: WS_DEFAULT_PING_INTERVAL_S,
            max_clients: HTTP_DEFAULT_MAX_CLIENTS,
            enable_cors: true,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisaServerSettings {
    pub port: u16,
}

impl Default for VisaServerSettings {
    fn default() -> Self {
        Self {
            port: VISA_DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub sd_auto_mount: bool,
    pub bluetooth_enabled: bool,
    /// POSIX TZ string.
    pub timezone: String,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            sd_auto_mount: true,
            bluetooth_enabled: false,
            timezone: "CET-1CEST,M3.5.0,M10.5.0/3".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub info: InfoSettings,
    pub lepton: LeptonSettings,
    pub wifi: WifiSettings,
    pub provisioning: ProvisioningSettings,
    pub display: DisplaySettings,
    pub http_server: HttpServerSettings,
    pub visa_server: VisaServerSettings,
    pub system: SystemSettings,
}

// ---------------------------------------------------------------------------
// Section plumbing
// ---------------------------------------------------------------------------
pub trait Section: Clone + Serialize + DeserializeOwned + Default {
    /// Store key; also used in error messages.
    const KEY: &'static str;

    fn slot(settings: &mut AppSettings) -> &mut Self;

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Change notification carrying a copy, if the section has one.
    fn changed(&self) -> Option<SettingsEvent>;
}

impl Section for InfoSettings {
    const KEY: &'static str = "info";
    fn slot(s: &mut AppSettings) -> &mut Self {
        &mut s.info
    }
    fn changed(&self) -> Option<SettingsEvent> {
        None
    }
}

impl Section for LeptonSettings {
    const KEY: &'static str = "lepton";
    fn slot(s: &mut AppSettings) -> &mut Self {
        &mut s.lepton
    }
    fn validate(&self) -> Result<(), String> {
        if self.rois.len() > 4 {
            return Err(format!("{} ROIs, at most 4", self.rois.len()));
        }
        for roi in &self.rois {
            if roi.w == 0
                || roi.h == 0
                || roi.end_col() >= LEPTON_WIDTH
                || roi.end_row() >= LEPTON_HEIGHT
            {
                return Err(format!("{:?} ROI outside the sensor", roi.kind));
            }
        }
        if let Some(e) = self
            .emissivity_presets
            .iter()
            .find(|e| !(0.0..=100.0).contains(&e.value))
        {
            return Err(format!("emissivity '{}' out of range", e.description));
        }
        Ok(())
    }
    fn changed(&self) -> Option<SettingsEvent> {
        Some(SettingsEvent::LeptonChanged(self.clone()))
    }
}

impl Section for WifiSettings {
    const KEY: &'static str = "wifi";
    fn slot(s: &mut AppSettings) -> &mut Self {
        &mut s.wifi
    }
    fn validate(&self) -> Result<(), String> {
        if self.ssid.len() > WIFI_SSID_MAX {
            return Err("SSID too long".into());
        }
        if self.password.len() > WIFI_PASSWORD_MAX {
            return Err("password too long".into());
        }
        if self.max_retries == 0 {
            return Err("max_retries must be at least 1".into());
        }
        Ok(())
    }
    fn changed(&self) -> Option<SettingsEvent> {
        Some(SettingsEvent::WifiChanged(self.clone()))
    }
}

impl Section for ProvisioningSettings {
    const KEY: &'static str = "prov";
    fn slot(s: &mut AppSettings) -> &mut Self {
        &mut s.provisioning
    }
    fn validate(&self) -> Result<(), String> {
        if self.timeout_s == 0 {
            return Err("timeout must be non-zero".into());
        }
        Ok(())
    }
    fn changed(&self) -> Option<SettingsEvent> {
        Some(SettingsEvent::ProvisioningChanged(self.clone()))
    }
}

impl Section for DisplaySettings {
    const KEY: &'static str = "display";
    fn slot(s: &mut AppSettings) -> &mut Self {
        &mut s.display
    }
    fn validate(&self) -> Result<(), String> {
        if self.brightness > 100 {
            return Err("brightness above 100 %".into());
        }
        Ok(())
    }
    fn changed(&self) -> Option<SettingsEvent> {
        Some(SettingsEvent::DisplayChanged(self.clone()))
    }
}

impl Section for HttpServerSettings {
    const KEY: &'static str = "http";
    fn slot(s: &mut AppSettings) -> &mut Self {
        &mut s.http_server
    }
    fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port 0".into());
        }
        if self.max_clients == 0 {
            return Err("max_clients must be at least 1".into());
        }
        Ok(())
    }
    fn changed(&self) -> Option<SettingsEvent> {
        Some(SettingsEvent::HttpServerChanged(self.clone()))
    }
}

impl Section for VisaServerSettings {
    const KEY: &'static str = "visa";
    fn slot(s: &mut AppSettings) -> &mut Self {
        &mut s.visa_server
    }
    fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port 0".into());
        }
        Ok(())
    }
    fn changed(&self) -> Option<SettingsEvent> {
        Some(SettingsEvent::VisaServerChanged(self.clone()))
    }
}

impl Section for SystemSettings {
    const KEY: &'static str = "system";
    fn slot(s: &mut AppSettings) -> &mut Self {
        &mut s.system
    }
    fn changed(&self) -> Option<SettingsEvent> {
        Some(SettingsEvent::SystemChanged(self.clone()))
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------
pub trait SettingsStore: Send {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, SettingsError>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), SettingsError>;
    fn erase_all(&mut self) -> Result<(), SettingsError>;
}

/// Volatile store for host runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self.map.get(key).cloned())
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.map.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), SettingsError> {
        self.map.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------
pub struct SettingsManager {
    store: Mutex<Box<dyn SettingsStore>>,
    ram: Mutex<AppSettings>,
    bus: EventBus,
}

impl SettingsManager {
    /// Load every section from `store` (defaults for anything missing).
    pub fn init(store: Box<dyn SettingsStore>, bus: EventBus) -> Result<Self, SettingsError> {
        let manager = Self {
            store: Mutex::new(store),
            ram: Mutex::new(AppSettings::default()),
            bus,
        };
        manager.load()?;
        Ok(manager)
    }

    /// Reload from the store, discarding unsaved RAM changes.
    pub fn load(&self) -> Result<AppSettings, SettingsError> {
        let mut settings = AppSettings::default();
        {
            let mut store = self.store.lock();
            load_section::<InfoSettings>(store.as_mut(), &mut settings)?;
            load_section::<LeptonSettings>(store.as_mut(), &mut settings)?;
            load_section::<WifiSettings>(store.as_mut(), &mut settings)?;
            load_section::<ProvisioningSettings>(store.as_mut(), &mut settings)?;
            load_section::<DisplaySettings>(store.as_mut(), &mut settings)?;
            load_section::<HttpServerSettings>(store.as_mut(), &mut settings)?;
            load_section::<VisaServerSettings>(store.as_mut(), &mut settings)?;
            load_section::<SystemSettings>(store.as_mut(), &mut settings)?;
        }
        *self.ram.lock() = settings.clone();
        log::info!("Settings loaded");
        self.bus
            .post_or_warn(&Event::Settings(SettingsEvent::Loaded), SETTINGS_POST_WAIT);
        Ok(settings)
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        let settings = self.ram.lock().clone();
        {
            let mut store = self.store.lock();
            let store = store.as_mut();
            store.set_str(InfoSettings::KEY, &serde_json::to_string(&settings.info)?)?;
            store.set_str(LeptonSettings::KEY, &serde_json::to_string(&settings.lepton)?)?;
            store.set_str(WifiSettings::KEY, &serde_json::to_string(&settings.wifi)?)?;
            store.set_str(
                ProvisioningSettings::KEY,
                &serde_json::to_string(&settings.provisioning)?,
            )?;
            store.set_str(DisplaySettings::KEY, &serde_json::to_string(&settings.display)?)?;
            store.set_str(
                HttpServerSettings::KEY,
                &serde_json::to_string(&settings.http_server)?,
            )?;
            store.set_str(
                VisaServerSettings::KEY,
                &serde_json::to_string(&settings.visa_server)?,
            )?;
            store.set_str(SystemSettings::KEY, &serde_json::to_string(&settings.system)?)?;
        }
        log::info!("Settings saved");
        self.bus
            .post_or_warn(&Event::Settings(SettingsEvent::Saved), SETTINGS_POST_WAIT);
        Ok(())
    }

    /// Copy of the full RAM settings.
    pub fn snapshot(&self) -> AppSettings {
        self.ram.lock().clone()
    }

    pub fn get<S: Section>(&self) -> S {
        S::slot(&mut self.ram.lock()).clone()
    }

    /// Validate and store `section` in RAM, then announce the change.
    pub fn update<S: Section>(&self, section: S) -> Result<(), SettingsError> {
        section.validate().map_err(|reason| SettingsError::Invalid {
            section: S::KEY,
            reason,
        })?;
        *S::slot(&mut self.ram.lock()) = section.clone();
        log::debug!("Settings section '{}' updated", S::KEY);

        if let Some(changed) = section.changed() {
            self.bus
                .post_or_warn(&Event::Settings(changed), SETTINGS_POST_WAIT);
        }
        Ok(())
    }

    /// Erase the store and fall back to factory defaults.
    pub fn reset_to_defaults(&self) -> Result<(), SettingsError> {
        log::warn!("Resetting settings to factory defaults");
        self.store.lock().erase_all()?;
        self.load()?;
        Ok(())
    }
}

fn load_section<S: Section>(
    store: &mut dyn SettingsStore,
    settings: &mut AppSettings,
) -> Result<(), SettingsError> {
    let Some(raw) = store.get_str(S::KEY)? else {
        log::debug!("No stored '{}' settings, using defaults", S::KEY);
        return Ok(());
    };
    match serde_json::from_str::<S>(&raw) {
        Ok(section) => *S::slot(settings) = section,
        Err(e) => log::warn!("Stored '{}' settings unreadable ({}), using defaults", S::KEY, e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manager_with(store: MemoryStore) -> (SettingsManager, EventBus, Arc<Mutex<Vec<Event>>>) {
        let bus = EventBus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(None, move |e| sink.lock().push(e.clone()));
        let manager = SettingsManager::init(Box::new(store), bus.clone()).unwrap();
        bus.dispatch_pending();
        (manager, bus, seen)
    }

    #[test]
    fn empty_store_yields_defaults() {
        let (manager, _, seen) = manager_with(MemoryStore::new());
        assert_eq!(manager.snapshot(), AppSettings::default());
        assert_eq!(*seen.lock(), vec![Event::Settings(SettingsEvent::Loaded)]);
    }

    #[test]
    fn update_posts_a_copy_and_save_round_trips() {
        let (manager, bus, seen) = manager_with(MemoryStore::new());

        let mut wifi = manager.get::<WifiSettings>();
        wifi.ssid = "X".into();
        wifi.password = "Y".into();
        manager.update(wifi.clone()).unwrap();
        manager.save().unwrap();
        bus.dispatch_pending();

        assert!(seen
            .lock()
            .contains(&Event::Settings(SettingsEvent::WifiChanged(wifi.clone()))));
        assert_eq!(
            seen.lock().last(),
            Some(&Event::Settings(SettingsEvent::Saved))
        );

        // A fresh load from the same store sees the saved values.
        let reloaded = manager.load().unwrap();
        assert_eq!(reloaded.wifi, wifi);
    }

    #[test]
    fn unsaved_changes_are_discarded_by_load() {
        let (manager, _, _) = manager_with(MemoryStore::new());
        let mut display = manager.get::<DisplaySettings>();
        display.brightness = 10;
        manager.update(display).unwrap();

        manager.load().unwrap();
        assert_eq!(manager.get::<DisplaySettings>(), DisplaySettings::default());
    }

    #[test]
    fn invalid_update_is_rejected() {
        let (manager, _, _) = manager_with(MemoryStore::new());

        let wifi = WifiSettings {
            ssid: "s".repeat(33),
            ..Default::default()
        };
        assert!(matches!(
            manager.update(wifi),
            Err(SettingsError::Invalid { section: "wifi", .. })
        ));

        let mut lepton = manager.get::<LeptonSettings>();
        lepton.rois[0].x = LEPTON_WIDTH - 1;
        lepton.rois[0].w = 2;
        assert!(manager.update(lepton).is_err());
        assert_eq!(manager.get::<LeptonSettings>(), LeptonSettings::default());
    }

    #[test]
    fn corrupt_section_falls_back_to_defaults() {
        let mut store = MemoryStore::new();
        store.set_str("display", "{not json").unwrap();
        store
            .set_str("system", r#"{"timezone":"UTC0"}"#)
            .unwrap();

        let (manager, _, _) = manager_with(store);
        assert_eq!(manager.get::<DisplaySettings>(), DisplaySettings::default());
        let system = manager.get::<SystemSettings>();
        assert_eq!(system.timezone, "UTC0");
        assert!(system.sd_auto_mount);
    }

    #[test]
    fn reset_erases_saved_values() {
        let (manager, _, _) = manager_with(MemoryStore::new());
        let mut http = manager.get::<HttpServerSettings>();
        http.port = 8080;
        manager.update(http).unwrap();
        manager.save().unwrap();

        manager.reset_to_defaults().unwrap();
        assert_eq!(manager.get::<HttpServerSettings>().port, HTTP_DEFAULT_PORT);
    }

    #[test]
    fn default_rois_fit_the_sensor() {
        assert!(LeptonSettings::default().validate().is_ok());
        let spot = LeptonSettings::default().roi(RoiType::Spotmeter).unwrap();
        assert_eq!(spot.end_col(), LEPTON_WIDTH / 2);
    }
}
