// PyroVision — Network Task
//
// WiFi / provisioning / server orchestration:
//
//   boot:  credentials stored  -> Connecting
//          none                -> Provisioning (or AP / Idle without a method)
//   Provisioning + credentials -> stop provisioning, Connecting
//   Provisioning + timeout     -> stop provisioning, AP fallback or Idle
//   Connecting + got IP        -> Connected, start server, time sync
//   Connected + link lost      -> Disconnected, time fallback, retry or
//                                 re-provision when credentials are gone
//   retries exhausted          -> Error until an external request
//
// Bus handlers only queue events and raise a bit; all driver calls happen in
// this task's loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::*;
use crate::drivers::{ProvisioningTransport, WifiDriver};
use crate::event_bus::{EventBus, Subscription, Wait};
use crate::events::{Event, EventBase, NetworkEvent, NetworkState, SettingsEvent};
use crate::network::provisioning::{self, ProvisioningManager};
use crate::network::wifi::{WifiManager, WifiOutcome};
use crate::server::ServerControl;
use crate::settings::{ProvMethod, ProvisioningSettings, SettingsManager, WifiMode, WifiSettings};
use crate::tasks::{spawn_task, EventBits, TaskError, TaskHandle, Watchdog, STOP_REQUEST};
use crate::time::TimeManager;

const BIT_MAIL: u32 = 1 << 0;

const POST_WAIT: Wait = Wait::For(Duration::from_millis(100));

enum Mail {
    Net(NetworkEvent),
    Wifi(WifiSettings),
    Provisioning(ProvisioningSettings),
}

pub struct NetworkDeps {
    pub wifi: Box<dyn WifiDriver>,
    pub provisioning: Box<dyn ProvisioningTransport>,
    pub server: Box<dyn ServerControl>,
    pub time: TimeManager,
    pub settings: Arc<SettingsManager>,
    pub watchdog: Arc<dyn Watchdog>,
    pub bus: EventBus,
}

pub struct NetworkTask {
    wifi: WifiManager,
    prov: ProvisioningManager,
    server: Box<dyn ServerControl>,
    time: TimeManager,
    settings: Arc<SettingsManager>,
    watchdog: Arc<dyn Watchdog>,
    bus: EventBus,
    bits: Arc<EventBits>,
    mailbox: Arc<Mutex<VecDeque<Mail>>>,
    _subscriptions: [Subscription; 2],
}

impl NetworkTask {
    pub fn new(deps: NetworkDeps) -> Self {
        let snapshot = deps.settings.snapshot();
        let bits = EventBits::new();
        let mailbox = Arc::new(Mutex::new(VecDeque::new()));

        let net_sub = {
            let (bits, mailbox) = (Arc::clone(&bits), Arc::clone(&mailbox));
            deps.bus.subscribe_scoped(Some(EventBase::Network), move |event| {
                let Event::Network(ev) = event else { return };
                let wanted = matches!(
                    ev,
                    NetworkEvent::WifiConnected
                        | NetworkEvent::WifiDisconnected { .. }
                        | NetworkEvent::WifiGotIp(_)
                        | NetworkEvent::ApStarted
                        | NetworkEvent::ApStopped
                        | NetworkEvent::ProvCredentialsReceived { .. }
                        | NetworkEvent::ProvFailed
                        | NetworkEvent::SetTimezone(_)
                        | NetworkEvent::OpenWifiRequest
                );
                if wanted {
                    mailbox.lock().push_back(Mail::Net(ev.clone()));
                    bits.set(BIT_MAIL);
                }
            })
        };
        let settings_sub = {
            let (bits, mailbox) = (Arc::clone(&bits), Arc::clone(&mailbox));
            deps.bus.subscribe_scoped(Some(EventBase::Settings), move |event| {
                let mail = match event {
                    Event::Settings(SettingsEvent::WifiChanged(s)) => Mail::Wifi(s.clone()),
                    Event::Settings(SettingsEvent::ProvisioningChanged(s)) => {
                        Mail::Provisioning(s.clone())
                    }
                    _ => return,
                };
                mailbox.lock().push_back(mail);
                bits.set(BIT_MAIL);
            })
        };

        Self {
            wifi: WifiManager::new(deps.wifi, deps.bus.clone(), snapshot.wifi),
            prov: ProvisioningManager::new(deps.provisioning, deps.bus.clone(), snapshot.provisioning),
            server: deps.server,
            time: deps.time,
            settings: deps.settings,
            watchdog: deps.watchdog,
            bus: deps.bus,
            bits,
            mailbox,
            _subscriptions: [net_sub, settings_sub],
        }
    }

    pub fn state(&self) -> NetworkState {
        self.wifi.state()
    }

    pub fn wifi(&self) -> &WifiManager {
        &self.wifi
    }

    pub fn provisioning_mut(&mut self) -> &mut ProvisioningManager {
        &mut self.prov
    }

    /// Pick the first state from the stored settings.
    pub fn boot(&mut self, now: Instant) {
        let wifi = self.wifi.settings().clone();
        if provisioning::is_provisioned(&wifi) {
            log::info!("Stored credentials for '{}', mode {:?}", wifi.ssid, wifi.mode);
            self.start_station(now);
        } else if self.prov.settings().method != ProvMethod::None {
            log::info!("No stored credentials, starting provisioning");
            self.enter_provisioning(now);
        } else if wifi.mode.has_ap() {
            log::info!("No credentials and no provisioning, starting AP");
            self.start_service_ap();
        } else {
            log::warn!("No credentials and provisioning disabled, staying idle");
            self.wifi.set_state(NetworkState::Idle);
        }
    }

    fn start_station(&mut self, now: Instant) {
        let mode = self.wifi.settings().mode;
        let result = match mode {
            WifiMode::Sta => self.wifi.start_sta(now),
            WifiMode::Ap => self.wifi.start_ap(),
            WifiMode::ApSta => self.wifi.start_apsta(now),
        };
        if let Err(e) = result {
            log::error!("WiFi start failed: {}", e);
            self.wifi.set_state(NetworkState::Error);
        }
    }

    fn start_service_ap(&mut self) {
        if let Err(e) = self.wifi.start_ap() {
            log::error!("AP start failed: {}", e);
            self.wifi.set_state(NetworkState::Error);
        }
    }

    fn enter_provisioning(&mut self, now: Instant) {
        let method = self.prov.settings().method;
        if method == ProvMethod::None {
            log::warn!("Provisioning disabled");
            self.wifi.set_state(NetworkState::Idle);
            return;
        }

        let mac = self.wifi.mac();
        let name = provisioning::service_name(&self.prov.settings().name, &mac);
        self.wifi.stop();
        if matches!(method, ProvMethod::SoftAp | ProvMethod::Both) {
            if let Err(e) = self.wifi.start_provisioning_ap(&name) {
                log::error!("Provisioning AP failed: {}", e);
            }
        }
        match self.prov.start(&name, now) {
            Ok(()) => self.wifi.set_state(NetworkState::Provisioning),
            Err(e) => {
                log::error!("Provisioning start failed: {}", e);
                self.provisioning_fallback();
            }
        }
    }

    fn provisioning_fallback(&mut self) {
        self.wifi.stop();
        if self.wifi.settings().mode.has_ap() {
            log::info!("Falling back to AP mode");
            self.start_service_ap();
        } else {
            log::info!("Waiting for a manual retry");
            self.wifi.set_state(NetworkState::Idle);
        }
    }

    fn start_server(&mut self) {
        if self.server.is_running() {
            return;
        }
        let event = match self.server.start() {
            Ok(()) => NetworkEvent::ServerStarted,
            Err(e) => {
                log::error!("Server start failed: {}", e);
                NetworkEvent::ServerError
            }
        };
        if let Err(e) = self.bus.post(&Event::Network(event), Wait::Forever) {
            log::error!("Failed to announce server state: {}", e);
        }
    }

    fn stop_server(&mut self) {
        if self.server.is_running() {
            self.server.stop();
            self.bus
                .post_or_warn(&Event::Network(NetworkEvent::ServerStopped), POST_WAIT);
        }
    }

    /// Drain queued events and run timers.
    pub fn step(&mut self, now: Instant) {
        let mail: Vec<Mail> = self.mailbox.lock().drain(..).collect();
        for m in mail {
            match m {
                Mail::Net(event) => self.handle(event, now),
                Mail::Wifi(s) => self.wifi.apply_settings(s),
                Mail::Provisioning(s) => self.prov.apply_settings(s),
            }
        }

        self.wifi.poll(now);

        if self.prov.poll_timeout(now) {
            if let Err(e) = self
                .bus
                .post(&Event::Network(NetworkEvent::ProvTimeout), Wait::Forever)
            {
                log::error!("Failed to post provisioning timeout: {}", e);
            }
            self.prov.stop();
            self.provisioning_fallback();
        }
    }

    fn handle(&mut self, event: NetworkEvent, now: Instant) {
        match event {
            NetworkEvent::ProvCredentialsReceived { ssid, password } => {
                self.on_credentials(&ssid, &password, now)
            }
            NetworkEvent::ProvFailed => log::warn!("Provisioning client reported a failure"),
            NetworkEvent::SetTimezone(tz) => {
                if let Err(e) = self.time.set_timezone(&tz) {
                    log::warn!("Timezone '{}' rejected: {}", tz, e);
                }
            }
            NetworkEvent::OpenWifiRequest => self.on_retry_request(now),
            other => self.on_wifi_event(&other, now),
        }
    }

    fn on_wifi_event(&mut self, event: &NetworkEvent, now: Instant) {
        match self.wifi.handle_event(event, now) {
            WifiOutcome::Connected => {
                self.start_server();
                self.time.on_network_connected();
            }
            WifiOutcome::ApUp => self.start_server(),
            WifiOutcome::Disconnected { was_connected, .. } | WifiOutcome::GaveUp { was_connected } => {
                if was_connected {
                    self.time.on_network_disconnected();
                }
            }
            WifiOutcome::NeedsCredentials { was_connected } => {
                if was_connected {
                    self.time.on_network_disconnected();
                }
                self.enter_provisioning(now);
            }
            WifiOutcome::Ignored => {}
        }
    }

    fn on_credentials(&mut self, ssid: &str, password: &str, now: Instant) {
        let Some(creds) = self.prov.on_credentials_received(ssid, password) else {
            return;
        };

        let mut wifi = self.settings.get::<WifiSettings>();
        wifi.ssid = creds.ssid.clone();
        wifi.password = creds.password.clone();
        match self.settings.update(wifi) {
            Ok(()) => {
                if let Err(e) = self.settings.save() {
                    log::error!("Failed to persist credentials: {}", e);
                }
            }
            Err(e) => log::error!("Credentials rejected by settings: {}", e),
        }

        self.wifi.set_credentials(&creds.ssid, &creds.password);
        self.prov.on_success();
        self.prov.stop();
        self.wifi.stop();
        if let Err(e) = self.wifi.start_sta(now) {
            log::error!("WiFi start failed after provisioning: {}", e);
            self.wifi.set_state(NetworkState::Error);
        }
    }

    fn on_retry_request(&mut self, now: Instant) {
        if !matches!(self.wifi.state(), NetworkState::Error | NetworkState::Idle) {
            log::debug!("Retry request ignored in state {}", self.wifi.state());
            return;
        }
        log::info!("Manual WiFi retry requested");
        self.wifi.reset_retries();
        if provisioning::is_provisioned(self.wifi.settings()) {
            self.wifi.stop();
            self.start_station(now);
        } else {
            self.enter_provisioning(now);
        }
    }

    fn teardown(&mut self) {
        self.prov.stop();
        self.stop_server();
        self.wifi.stop();
        self.wifi.set_state(NetworkState::Idle);
    }

    fn run(mut self) {
        self.watchdog.subscribe_current();
        self.boot(Instant::now());
        let period = Duration::from_millis(NETWORK_LOOP_MS);
        loop {
            self.watchdog.feed();
            let bits = self.bits.wait_any(BIT_MAIL | STOP_REQUEST, period);
            if bits & STOP_REQUEST != 0 {
                break;
            }
            self.step(Instant::now());
        }
        self.teardown();
        self.watchdog.unsubscribe_current();
        log::info!("Network task exiting");
    }

    pub fn start(self) -> Result<TaskHandle, TaskError> {
        let bits = Arc::clone(&self.bits);
        spawn_task("network", STACK_NETWORK, bits, move || self.run())
    }
}
