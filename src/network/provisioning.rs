// PyroVision — Provisioning Manager
//
// Hands WiFi credentials to an unconfigured device through an injected
// transport (captive portal, BLE). Provisioning runs for a bounded time; the
// network task polls `poll_timeout` and decides on the fallback.

use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::config::*;
use crate::drivers::{ProvisioningTransport, StaConfig, WifiError};
use crate::event_bus::{EventBus, Wait};
use crate::events::{Event, NetworkEvent};
use crate::settings::{ProvisioningSettings, WifiSettings};

const PROV_POST_WAIT: Wait = Wait::For(Duration::from_millis(100));

/// `"<name truncated to 26>_<MAC[4]><MAC[5]>"`, e.g. `PyroVision_ABCD`.
pub fn service_name(device_name: &str, mac: &[u8; 6]) -> String {
    let prefix: String = device_name.chars().take(PROV_SERVICE_NAME_PREFIX_MAX).collect();
    format!("{}_{:02X}{:02X}", prefix, mac[4], mac[5])
}

pub fn is_provisioned(wifi: &WifiSettings) -> bool {
    wifi.has_credentials()
}

#[derive(Debug, Deserialize)]
struct CredentialsBody {
    ssid: String,
    #[serde(default)]
    password: String,
}

/// Validate credentials as submitted by a provisioning client.
pub fn validate_credentials(ssid: &str, password: &str) -> Result<StaConfig, WifiError> {
    if ssid.is_empty() || ssid.len() > WIFI_SSID_MAX {
        return Err(WifiError::InvalidConfig(format!(
            "SSID must be 1..={} bytes",
            WIFI_SSID_MAX
        )));
    }
    if password.len() > WIFI_PASSWORD_MAX {
        return Err(WifiError::InvalidConfig(format!(
            "password longer than {} bytes",
            WIFI_PASSWORD_MAX
        )));
    }
    Ok(StaConfig {
        ssid: ssid.into(),
        password: password.into(),
    })
}

/// Parse a `{"ssid": .., "password": ..}` body from the captive portal.
pub fn parse_credentials(body: &[u8]) -> Result<StaConfig, WifiError> {
    let parsed: CredentialsBody = serde_json::from_slice(body)
        .map_err(|e| WifiError::InvalidConfig(format!("bad credentials body: {}", e)))?;
    validate_credentials(&parsed.ssid, &parsed.password)
}

pub struct ProvisioningManager {
    transport: Box<dyn ProvisioningTransport>,
    bus: EventBus,
    settings: ProvisioningSettings,
    timeout: Duration,
    active: bool,
    deadline: Option<Instant>,
    received: Option<StaConfig>,
}

impl ProvisioningManager {
    pub fn new(
        transport: Box<dyn ProvisioningTransport>,
        bus: EventBus,
        settings: ProvisioningSettings,
    ) -> Self {
        let timeout = Duration::from_secs(u64::from(settings.timeout_s));
        Self {
            transport,
            bus,
            settings,
            timeout,
            active: false,
            deadline: None,
            received: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn settings(&self) -> &ProvisioningSettings {
        &self.settings
    }

    pub fn apply_settings(&mut self, settings: ProvisioningSettings) {
        self.timeout = Duration::from_secs(u64::from(settings.timeout_s));
        self.settings = settings;
    }

    /// Override the provisioning window.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn start(&mut self, service_name: &str, now: Instant) -> Result<(), WifiError> {
        if self.active {
            log::warn!("Provisioning already active");
            return Ok(());
        }
        self.transport.start(service_name)?;
        self.active = true;
        self.received = None;
        self.deadline = Some(now + self.timeout);
        log::info!(
            "Provisioning started as '{}' ({} s window)",
            service_name,
            self.timeout.as_secs()
        );
        self.post(NetworkEvent::ProvStarted);
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.transport.stop();
        self.active = false;
        self.deadline = None;
        log::info!("Provisioning stopped");
        self.post(NetworkEvent::ProvStopped);
    }

    /// `true` exactly once when the window closed without credentials.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if self.active && now >= deadline => {
                self.deadline = None;
                log::warn!("Provisioning timed out");
                true
            }
            _ => false,
        }
    }

    /// Accept credentials from the transport. Invalid ones are reported as
    /// `ProvFailed` and provisioning keeps running.
    pub fn on_credentials_received(&mut self, ssid: &str, password: &str) -> Option<StaConfig> {
        if !self.active {
            log::warn!("Credentials received while provisioning is not active");
            return None;
        }
        match validate_credentials(ssid, password) {
            Ok(creds) => {
                log::info!("Provisioning received credentials for '{}'", creds.ssid);
                self.received = Some(creds.clone());
                Some(creds)
            }
            Err(e) => {
                log::warn!("Provisioning rejected credentials: {}", e);
                self.post(NetworkEvent::ProvFailed);
                None
            }
        }
    }

    /// Credentials were stored; disarm and announce success.
    pub fn on_success(&mut self) {
        self.deadline = None;
        if let Some(creds) = self.received.take() {
            log::info!("Provisioning succeeded for '{}'", creds.ssid);
        }
        self.post(NetworkEvent::ProvSuccess);
    }

    fn post(&self, event: NetworkEvent) {
        self.bus.post_or_warn(&Event::Network(event), PROV_POST_WAIT);
    }
}
