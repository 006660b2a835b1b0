// PyroVision — NVS Settings Store

use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

use crate::config::*;
use crate::settings::{
    DisplaySettings, HttpServerSettings, InfoSettings, LeptonSettings,
    ProvisioningSettings, Section, SettingsError, SettingsStore, SystemSettings,
    VisaServerSettings, WifiSettings,
};

const SECTION_KEYS: [&str; 8] = [
    InfoSettings::KEY,
    LeptonSettings::KEY,
    WifiSettings::KEY,
    ProvisioningSettings::KEY,
    DisplaySettings::KEY,
    HttpServerSettings::KEY,
    VisaServerSettings::KEY,
    SystemSettings::KEY,
];

/// One JSON string per settings section in the `pyrovision` namespace.
pub struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self, SettingsError> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .map_err(|e| SettingsError::Store(format!("open namespace: {}", e)))?;
        Ok(Self { nvs })
    }
}

impl SettingsStore for NvsStore {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, SettingsError> {
        let mut buf = vec![0u8; NVS_MAX_VALUE_LEN];
        let value = self
            .nvs
            .get_str(key, &mut buf)
            .map_err(|e| SettingsError::Store(format!("read {}: {}", key, e)))?;
        Ok(value.map(str::to_owned))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        if value.len() >= NVS_MAX_VALUE_LEN {
            return Err(SettingsError::Store(format!(
                "{} is {} bytes, limit {}",
                key,
                value.len(),
                NVS_MAX_VALUE_LEN
            )));
        }
        self.nvs
            .set_str(key, value)
            .map_err(|e| SettingsError::Store(format!("write {}: {}", key, e)))
    }

    fn erase_all(&mut self) -> Result<(), SettingsError> {
        for key in SECTION_KEYS {
            self.nvs
                .remove(key)
                .map_err(|e| SettingsError::Store(format!("erase {}: {}", key, e)))?;
        }
        log::info!("Erased {} settings sections", SECTION_KEYS.len());
        Ok(())
    }
}

