// PyroVision — WiFi Manager
//
// Owns the WiFi driver, the retry counter and the one authoritative
// `NetworkState`. Every state change is announced on the bus as a copy.
// Driver outcomes arrive as events and are fed in through `handle_event`;
// reconnects are scheduled, not slept on, and issued from `poll`.

use std::time::{Duration, Instant};

use crate::config::*;
use crate::drivers::{ApConfig, StaConfig, WifiDriver, WifiError};
use crate::event_bus::{EventBus, Wait};
use crate::events::{Event, IpInfo, NetworkEvent, NetworkState};
use crate::settings::{WifiMode, WifiSettings};

const STATE_POST_WAIT: Wait = Wait::For(Duration::from_millis(100));

/// 802.11 / ESP-IDF disconnect reason that usually means a wrong SSID.
pub const REASON_NO_AP_FOUND: u16 = 201;

pub fn disconnect_reason_name(reason: u16) -> &'static str {
    match reason {
        1 => "UNSPECIFIED",
        2 => "AUTH_EXPIRE",
        3 => "AUTH_LEAVE",
        4 => "ASSOC_EXPIRE",
        8 => "ASSOC_LEAVE",
        15 => "4WAY_HANDSHAKE_TIMEOUT",
        23 => "802_1X_AUTH_FAILED",
        200 => "BEACON_TIMEOUT",
        REASON_NO_AP_FOUND => "NO_AP_FOUND",
        202 => "AUTH_FAIL",
        203 => "ASSOC_FAIL",
        204 => "HANDSHAKE_TIMEOUT",
        205 => "CONNECTION_FAIL",
        _ => "UNKNOWN",
    }
}

/// What a driver event meant for the rest of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiOutcome {
    Ignored,
    /// Station has an IP.
    Connected,
    /// Station lost its link or a connection attempt failed.
    Disconnected { was_connected: bool, will_retry: bool },
    /// Station lost its link and there is nothing to reconnect with.
    NeedsCredentials { was_connected: bool },
    /// Retry budget exhausted; state is now `Error`.
    GaveUp { was_connected: bool },
    /// Service access point is up.
    ApUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApRole {
    None,
    Provisioning,
    Service,
}

pub struct WifiManager {
    driver: Box<dyn WifiDriver>,
    bus: EventBus,
    settings: WifiSettings,
    ap: ApConfig,
    ap_role: ApRole,
    state: NetworkState,
    attempts: u8,
    reconnect_at: Option<Instant>,
    ip: Option<IpInfo>,
}

impl WifiManager {
    pub fn new(driver: Box<dyn WifiDriver>, bus: EventBus, settings: WifiSettings) -> Self {
        Self {
            driver,
            bus,
            settings,
            ap: ApConfig {
                ssid: AP_DEFAULT_SSID.into(),
                password: String::new(),
                channel: AP_DEFAULT_CHANNEL,
                max_connections: u16::from(AP_DEFAULT_MAX_CONNECTIONS),
            },
            ap_role: ApRole::None,
            state: NetworkState::Idle,
            attempts: 0,
            reconnect_at: None,
            ip: None,
        }
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn ip(&self) -> Option<IpInfo> {
        self.ip
    }

    pub fn settings(&self) -> &WifiSettings {
        &self.settings
    }

    pub fn mac(&mut self) -> [u8; 6] {
        self.driver.mac()
    }

    /// Connection attempts made since the last successful connection.
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    pub fn apply_settings(&mut self, settings: WifiSettings) {
        log::debug!("WiFi settings refreshed");
        self.settings = settings;
    }

    pub fn set_state(&mut self, state: NetworkState) {
        if self.state == state {
            return;
        }
        log::info!("Network state {} -> {}", self.state, state);
        self.state = state;
        self.bus
            .post_or_warn(&Event::Network(NetworkEvent::StateChanged(state)), STATE_POST_WAIT);
    }

    fn sta_config(&self) -> StaConfig {
        StaConfig {
            ssid: self.settings.ssid.clone(),
            password: self.settings.password.clone(),
        }
    }

    pub fn start_sta(&mut self, now: Instant) -> Result<(), WifiError> {
        if !self.settings.has_credentials() {
            return Err(WifiError::InvalidConfig("no stored credentials".into()));
        }
        let sta = self.sta_config();
        self.driver.configure(WifiMode::Sta, Some(&sta), None)?;
        self.driver.start()?;
        self.ap_role = ApRole::None;
        log::info!("WiFi STA connecting to '{}'", sta.ssid);
        self.begin_connecting(now);
        Ok(())
    }

    /// Bring up the service access point.
    pub fn start_ap(&mut self) -> Result<(), WifiError> {
        let ap = self.ap.clone();
        self.driver.configure(WifiMode::Ap, None, Some(&ap))?;
        self.ap_role = ApRole::Service;
        self.driver.start()?;
        log::info!("WiFi AP '{}' starting", ap.ssid);
        Ok(())
    }

    /// AP used only as the provisioning transport; does not change state.
    pub fn start_provisioning_ap(&mut self, ssid: &str) -> Result<(), WifiError> {
        let ap = ApConfig {
            ssid: ssid.into(),
            ..self.ap.clone()
        };
        self.driver.configure(WifiMode::Ap, None, Some(&ap))?;
        self.ap_role = ApRole::Provisioning;
        self.driver.start()?;
        log::info!("Provisioning AP '{}' starting", ssid);
        Ok(())
    }

    pub fn start_apsta(&mut self, now: Instant) -> Result<(), WifiError> {
        let sta = self.sta_config();
        let ap = self.ap.clone();
        self.driver.configure(WifiMode::ApSta, Some(&sta), Some(&ap))?;
        self.ap_role = ApRole::Service;
        self.driver.start()?;
        log::info!("WiFi AP+STA: AP '{}', connecting to '{}'", ap.ssid, sta.ssid);
        self.begin_connecting(now);
        Ok(())
    }

    fn begin_connecting(&mut self, now: Instant) {
        self.attempts = 1;
        self.reconnect_at = None;
        self.set_state(NetworkState::Connecting);
        self.request_connect(now);
    }

    /// A connect request the driver refuses counts as a failed attempt.
    fn request_connect(&mut self, now: Instant) {
        if let Err(e) = self.driver.connect() {
            log::warn!(
                "WiFi connect request {}/{} failed: {}",
                self.attempts,
                self.settings.max_retries,
                e
            );
            self.set_state(NetworkState::Disconnected);
            self.retry_or_give_up(false, now);
        }
    }

    pub fn disconnect(&mut self) -> Result<(), WifiError> {
        self.reconnect_at = None;
        self.driver.disconnect()
    }

    pub fn stop(&mut self) {
        self.reconnect_at = None;
        self.ip = None;
        self.ap_role = ApRole::None;
        if let Err(e) = self.driver.stop() {
            log::warn!("WiFi stop failed: {}", e);
        }
    }

    /// Store new station credentials and announce them.
    pub fn set_credentials(&mut self, ssid: &str, password: &str) {
        self.settings.ssid = ssid.into();
        self.settings.password = password.into();
        log::info!("WiFi credentials updated for '{}'", ssid);
        self.bus.post_or_warn(
            &Event::Network(NetworkEvent::CredentialsUpdated { ssid: ssid.into() }),
            STATE_POST_WAIT,
        );
    }

    /// Start over after the retry budget was exhausted.
    pub fn reset_retries(&mut self) {
        self.attempts = 0;
        self.reconnect_at = None;
    }

    pub fn rssi(&mut self) -> i8 {
        if self.state == NetworkState::Connected {
            self.driver.rssi().unwrap_or(0)
        } else {
            0
        }
    }

    pub fn handle_event(&mut self, event: &NetworkEvent, now: Instant) -> WifiOutcome {
        match event {
            NetworkEvent::WifiConnected => {
                log::info!("WiFi associated, waiting for IP");
                WifiOutcome::Ignored
            }
            NetworkEvent::WifiGotIp(info) => {
                log::info!("WiFi got IP {} (gw {})", info.ip, info.gateway);
                self.ip = Some(*info);
                self.attempts = 0;
                self.reconnect_at = None;
                self.set_state(NetworkState::Connected);
                WifiOutcome::Connected
            }
            NetworkEvent::WifiDisconnected { reason } => self.on_disconnected(*reason, now),
            NetworkEvent::ApStarted => match self.ap_role {
                ApRole::Service => {
                    if !matches!(self.state, NetworkState::Connecting | NetworkState::Connected) {
                        self.set_state(NetworkState::ApStarted);
                    }
                    WifiOutcome::ApUp
                }
                ApRole::Provisioning => {
                    log::debug!("Provisioning AP up");
                    WifiOutcome::Ignored
                }
                ApRole::None => WifiOutcome::Ignored,
            },
            NetworkEvent::ApStopped => {
                if self.state == NetworkState::ApStarted {
                    self.set_state(NetworkState::Idle);
                }
                WifiOutcome::Ignored
            }
            _ => WifiOutcome::Ignored,
        }
    }

    fn on_disconnected(&mut self, reason: u16, now: Instant) -> WifiOutcome {
        if !matches!(
            self.state,
            NetworkState::Connecting | NetworkState::Connected | NetworkState::Disconnected
        ) {
            log::debug!("Disconnect ({}) ignored in state {}", reason, self.state);
            return WifiOutcome::Ignored;
        }

        if reason == REASON_NO_AP_FOUND {
            log::warn!(
                "WiFi: access point '{}' not found, check the SSID",
                self.settings.ssid
            );
        } else {
            log::warn!("WiFi disconnected: {} ({})", disconnect_reason_name(reason), reason);
        }

        let was_connected = self.state == NetworkState::Connected;
        if was_connected {
            // A dropped link is not a failed attempt.
            self.attempts = 0;
        }
        self.ip = None;
        self.set_state(NetworkState::Disconnected);

        if !self.settings.has_credentials() {
            self.reconnect_at = None;
            return WifiOutcome::NeedsCredentials { was_connected };
        }

        self.retry_or_give_up(was_connected, now)
    }

    fn retry_or_give_up(&mut self, was_connected: bool, now: Instant) -> WifiOutcome {
        if self.attempts < self.settings.max_retries {
            let backoff = Duration::from_millis(u64::from(self.settings.retry_interval_ms));
            self.reconnect_at = Some(now + backoff);
            log::info!(
                "WiFi retry {}/{} in {} ms",
                self.attempts + 1,
                self.settings.max_retries,
                backoff.as_millis()
            );
            WifiOutcome::Disconnected {
                was_connected,
                will_retry: true,
            }
        } else {
            log::error!(
                "WiFi gave up after {} failed attempts",
                self.settings.max_retries
            );
            self.reconnect_at = None;
            self.set_state(NetworkState::Error);
            WifiOutcome::GaveUp { was_connected }
        }
    }

    /// Issue a scheduled reconnect once its backoff elapsed.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.reconnect_at {
            Some(at) if now >= at => {
                self.reconnect_at = None;
                self.attempts = self.attempts.saturating_add(1);
                self.set_state(NetworkState::Connecting);
                self.request_connect(now);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Calls {
        connects: u32,
        /// Connect requests from this count on are refused (0 = never).
        refuse_from: u32,
        modes: Vec<WifiMode>,
    }

    struct RecordingDriver(Arc<Mutex<Calls>>);

    impl WifiDriver for RecordingDriver {
        fn configure(&mut self, mode: WifiMode, _: Option<&StaConfig>, _: Option<&ApConfig>) -> Result<(), WifiError> {
            self.0.lock().modes.push(mode);
            Ok(())
        }
        fn start(&mut self) -> Result<(), WifiError> {
            Ok(())
        }
        fn connect(&mut self) -> Result<(), WifiError> {
            let mut calls = self.0.lock();
            calls.connects += 1;
            if calls.refuse_from != 0 && calls.connects >= calls.refuse_from {
                return Err(WifiError::Driver("ESP_ERR_WIFI_CONN".into()));
            }
            Ok(())
        }
        fn disconnect(&mut self) -> Result<(), WifiError> {
            Ok(())
        }
        fn stop(&mut self) -> Result<(), WifiError> {
            Ok(())
        }
        fn rssi(&mut self) -> Option<i8> {
            Some(-48)
        }
        fn mac(&mut self) -> [u8; 6] {
            [0, 1, 2, 3, 0xAB, 0xCD]
        }
    }

    fn manager(max_retries: u8) -> (WifiManager, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let settings = WifiSettings {
            ssid: "X".into(),
            password: "Y".into(),
            max_retries,
            retry_interval_ms: 100,
            ..Default::default()
        };
        let m = WifiManager::new(
            Box::new(RecordingDriver(Arc::clone(&calls))),
            EventBus::new(64),
            settings,
        );
        (m, calls)
    }

    fn got_ip() -> NetworkEvent {
        NetworkEvent::WifiGotIp(IpInfo {
            ip: [192, 168, 1, 50].into(),
            netmask: [255, 255, 255, 0].into(),
            gateway: [192, 168, 1, 1].into(),
        })
    }

    #[test]
    fn rssi_is_zero_unless_connected() {
        let (mut m, _) = manager(3);
        m.start_sta(Instant::now()).unwrap();
        assert_eq!(m.rssi(), 0);
        m.handle_event(&got_ip(), Instant::now());
        assert_eq!(m.rssi(), -48);
    }

    #[test]
    fn retries_are_scheduled_with_backoff() {
        let (mut m, calls) = manager(3);
        let t0 = Instant::now();
        m.start_sta(t0).unwrap();

        let out = m.handle_event(&NetworkEvent::WifiDisconnected { reason: 201 }, t0);
        assert_eq!(out, WifiOutcome::Disconnected { was_connected: false, will_retry: true });
        assert!(!m.poll(t0 + Duration::from_millis(50)));
        assert!(m.poll(t0 + Duration::from_millis(100)));
        assert_eq!(m.state(), NetworkState::Connecting);
        assert_eq!(calls.lock().connects, 2);
    }

    #[test]
    fn gives_up_after_max_failed_attempts() {
        let (mut m, calls) = manager(2);
        let mut now = Instant::now();
        m.start_sta(now).unwrap();

        m.handle_event(&NetworkEvent::WifiDisconnected { reason: 15 }, now);
        now += Duration::from_millis(100);
        assert!(m.poll(now));
        let out = m.handle_event(&NetworkEvent::WifiDisconnected { reason: 15 }, now);
        assert_eq!(out, WifiOutcome::GaveUp { was_connected: false });
        assert_eq!(m.state(), NetworkState::Error);

        now += Duration::from_secs(10);
        assert!(!m.poll(now));
        assert_eq!(calls.lock().connects, 2);
    }

    #[test]
    fn refused_reconnects_still_spend_the_budget() {
        let (mut m, calls) = manager(3);
        calls.lock().refuse_from = 2;
        let t0 = Instant::now();
        m.start_sta(t0).unwrap();
        m.handle_event(&NetworkEvent::WifiDisconnected { reason: 201 }, t0);

        for i in 1..100 {
            m.poll(t0 + Duration::from_millis(200 * i));
        }
        assert_eq!(m.state(), NetworkState::Error);
        assert_eq!(m.attempts(), 3);
        assert_eq!(calls.lock().connects, 3);
        assert!(!m.reconnect_pending());
    }

    #[test]
    fn refused_first_connect_is_retried() {
        let (mut m, calls) = manager(2);
        calls.lock().refuse_from = 1;
        let t0 = Instant::now();
        m.start_sta(t0).unwrap();
        assert_eq!(m.state(), NetworkState::Disconnected);
        assert!(m.reconnect_pending());

        calls.lock().refuse_from = 0;
        assert!(m.poll(t0 + Duration::from_millis(100)));
        assert_eq!(m.state(), NetworkState::Connecting);
        m.handle_event(&got_ip(), t0 + Duration::from_millis(150));
        assert_eq!(m.state(), NetworkState::Connected);
        assert_eq!(calls.lock().connects, 2);
    }

    #[test]
    fn link_loss_restarts_the_budget() {
        let (mut m, _) = manager(1);
        let now = Instant::now();
        m.start_sta(now).unwrap();
        m.handle_event(&got_ip(), now);
        assert_eq!(m.attempts(), 0);

        let out = m.handle_event(&NetworkEvent::WifiDisconnected { reason: 200 }, now);
        assert_eq!(out, WifiOutcome::Disconnected { was_connected: true, will_retry: true });
    }

    #[test]
    fn missing_credentials_need_provisioning() {
        let (mut m, _) = manager(3);
        m.start_sta(Instant::now()).unwrap();
        m.handle_event(&got_ip(), Instant::now());
        m.apply_settings(WifiSettings::default());

        let out = m.handle_event(&NetworkEvent::WifiDisconnected { reason: 8 }, Instant::now());
        assert_eq!(out, WifiOutcome::NeedsCredentials { was_connected: true });
        assert!(!m.reconnect_pending());
    }

    #[test]
    fn provisioning_ap_does_not_touch_state() {
        let (mut m, calls) = manager(3);
        m.start_provisioning_ap("PyroVision_ABCD").unwrap();
        assert_eq!(m.handle_event(&NetworkEvent::ApStarted, Instant::now()), WifiOutcome::Ignored);
        assert_eq!(m.state(), NetworkState::Idle);

        m.start_ap().unwrap();
        assert_eq!(m.handle_event(&NetworkEvent::ApStarted, Instant::now()), WifiOutcome::ApUp);
        assert_eq!(m.state(), NetworkState::ApStarted);
        assert_eq!(calls.lock().modes, vec![WifiMode::Ap, WifiMode::Ap]);
    }

    #[test]
    fn stray_disconnect_while_idle_is_ignored() {
        let (mut m, _) = manager(3);
        let out = m.handle_event(&NetworkEvent::WifiDisconnected { reason: 8 }, Instant::now());
        assert_eq!(out, WifiOutcome::Ignored);
        assert_eq!(m.state(), NetworkState::Idle);
    }

    #[test]
    fn reason_names() {
        assert_eq!(disconnect_reason_name(201), "NO_AP_FOUND");
        assert_eq!(disconnect_reason_name(9999), "UNKNOWN");
    }
}
