// PyroVision — Firmware Entry Point
//
// Boot sequence:
//   1. Logger, event bus and its dispatcher thread.
//   2. Settings (NVS on the board, memory on the host).
//   3. Devices task, time manager, frame buffers and the shared palette.
//   4. GUI and capture tasks.
//   5. Server parts (telemetry cache, HTTP API, WebSocket hub, SCPI
//      listener) and the network task, which brings WiFi up and starts the
//      server on IP.
//
// On a non-ESP host the same wiring runs against simulated collaborators.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;

use pyrovision::config::*;
use pyrovision::double_buffer::DoubleBuffer;
use pyrovision::drivers::{
    OtaWriter, PowerMonitor, ProvisioningTransport, StorageMonitor, ThermalSensor, WifiDriver,
};
use pyrovision::encoder::{Palette, SharedPalette};
use pyrovision::event_bus::EventBus;
use pyrovision::frame_channel::FrameChannel;
use pyrovision::network_frame::SharedNetworkFrame;
use pyrovision::server::http::{HttpApi, HttpApiParts};
use pyrovision::server::telemetry::{RssiProbe, TelemetryCache};
use pyrovision::server::visa::{Identity, VisaContext, VisaServer};
use pyrovision::server::websocket::{WsHub, WsSender};
use pyrovision::server::{HttpTransport, Server, ServerConfig, ServerStatus};
use pyrovision::settings::{HttpServerSettings, SettingsManager, SettingsStore, VisaServerSettings};
use pyrovision::tasks::capture::{CaptureConfig, CaptureTask};
use pyrovision::tasks::devices::DevicesTask;
use pyrovision::tasks::gui::{CanvasView, GuiDeps, GuiTask};
use pyrovision::tasks::network::{NetworkDeps, NetworkTask};
use pyrovision::tasks::Watchdog;
use pyrovision::time::{Clock, SntpClient, TimeManager};

/// Everything that differs between the board and a host run.
struct Platform<T: HttpTransport> {
    store: Box<dyn SettingsStore>,
    clock: Box<dyn Clock>,
    sntp: Box<dyn SntpClient>,
    sensor: Box<dyn ThermalSensor>,
    power: Box<dyn PowerMonitor>,
    storage: Box<dyn StorageMonitor>,
    wifi: Box<dyn WifiDriver>,
    provisioning: Box<dyn ProvisioningTransport>,
    watchdog: Arc<dyn Watchdog>,
    ota: Option<Arc<dyn OtaWriter>>,
    ws_sender: Arc<dyn WsSender>,
    transport: T,
    rssi: RssiProbe,
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------
#[cfg(target_os = "espidf")]
mod board {
    use std::sync::Arc;

    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_hal::spi::config::DriverConfig;
    use esp_idf_hal::spi::SpiDriver;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;

    use pyrovision::config::*;
    use pyrovision::drivers::esp::wifi::station_rssi;
    use pyrovision::drivers::esp::{
        AdcBattery, CaptivePortal, EspClock, EspHttpTransport, EspOtaWriter, EspSntpClient,
        EspWifiDriver, EspWsSenders, NvsStore, SdSpiCard, TaskWatchdog,
    };
    use pyrovision::drivers::sim::SimThermalSensor;
    use pyrovision::event_bus::EventBus;
    use pyrovision::tasks::Watchdog;

    use super::Platform;

    pub fn init_logging() {
        esp_idf_svc::sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();
    }

    pub fn take(bus: &EventBus) -> anyhow::Result<Platform<EspHttpTransport>> {
        let peripherals = Peripherals::take()?;
        let sysloop = EspSystemEventLoop::take()?;
        let nvs = EspDefaultNvsPartition::take()?;

        EspOtaWriter::mark_running_valid();

        let sd_bus = SpiDriver::new(
            peripherals.spi2,
            peripherals.pins.gpio12,
            peripherals.pins.gpio11,
            Some(peripherals.pins.gpio13),
            &DriverConfig::new(),
        )?;

        let senders = EspWsSenders::new();
        let watchdog: Arc<dyn Watchdog> = Arc::new(TaskWatchdog::init(WATCHDOG_TIMEOUT_MS)?);
        Ok(Platform {
            store: Box::new(NvsStore::new(nvs.clone())?),
            clock: Box::new(EspClock),
            sntp: Box::new(EspSntpClient::new()),
            // TODO: replace with the Lepton VoSPI driver once it implements ThermalSensor.
            sensor: Box::new(SimThermalSensor::new()),
            power: Box::new(AdcBattery::new()?),
            storage: Box::new(SdSpiCard::new(sd_bus)),
            wifi: Box::new(EspWifiDriver::new(
                peripherals.modem,
                sysloop,
                Some(nvs),
                bus.clone(),
            )?),
            provisioning: Box::new(CaptivePortal::new(bus.clone(), Arc::clone(&watchdog))),
            watchdog,
            ota: Some(Arc::new(EspOtaWriter::new())),
            ws_sender: senders.clone(),
            transport: EspHttpTransport::new(senders),
            rssi: Arc::new(|| station_rssi().unwrap_or(0)),
        })
    }
}

#[cfg(not(target_os = "espidf"))]
mod board {
    use std::sync::Arc;

    use pyrovision::drivers::sim::{
        InstantSntp, LoggingProvisioning, LoopbackWifi, SimPower, SimStorage, SimThermalSensor,
    };
    use pyrovision::event_bus::EventBus;
    use pyrovision::server::{NullSender, NullTransport};
    use pyrovision::settings::MemoryStore;
    use pyrovision::tasks::NoWatchdog;
    use pyrovision::time::SoftClock;

    use super::Platform;

    pub fn init_logging() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    pub fn take(bus: &EventBus) -> anyhow::Result<Platform<NullTransport>> {
        Ok(Platform {
            store: Box::new(MemoryStore::new()),
            clock: Box::new(SoftClock::default()),
            sntp: Box::new(InstantSntp),
            sensor: Box::new(SimThermalSensor::new()),
            power: Box::new(SimPower::new()),
            storage: Box::new(SimStorage::with_card()),
            wifi: Box::new(LoopbackWifi::new(bus.clone())),
            provisioning: Box::new(LoggingProvisioning::default()),
            watchdog: Arc::new(NoWatchdog),
            ota: None,
            ws_sender: Arc::new(NullSender),
            transport: NullTransport,
            rssi: Arc::new(|| -55),
        })
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------
fn main() -> anyhow::Result<()> {
    board::init_logging();
    log::info!("PyroVision firmware starting…");

    let bus = EventBus::new(EVENT_QUEUE_DEPTH);
    let _dispatcher = bus
        .spawn_dispatcher()
        .context("failed to spawn event dispatcher")?;

    let platform = board::take(&bus).context("platform init failed")?;

    // ---- Settings ---------------------------------------------------------
    let settings = Arc::new(
        SettingsManager::init(platform.store, bus.clone()).context("failed to load settings")?,
    );
    #[cfg(not(target_os = "espidf"))]
    seed_host_credentials(&settings)?;
    let snapshot = settings.snapshot();
    log::info!(
        "Settings loaded (device '{}', wifi '{}')",
        snapshot.info.device_name,
        snapshot.wifi.ssid
    );

    // ---- Devices ----------------------------------------------------------
    let _devices = DevicesTask::new(
        platform.power,
        platform.storage,
        bus.clone(),
        Arc::clone(&platform.watchdog),
    )
    .start()?;

    // ---- Time -------------------------------------------------------------
    let time = TimeManager::new(platform.clock, None, Some(platform.sntp), bus.clone());

    // ---- Frame plumbing ---------------------------------------------------
    let palette = SharedPalette::new(Palette::Iron);
    let buffer = Arc::new(DoubleBuffer::new(
        RGB_FRAME_BYTES,
        Duration::from_millis(DOUBLE_BUFFER_LOCK_MS),
    ));
    let frames = FrameChannel::new();
    let network_frame = SharedNetworkFrame::new();

    // ---- Server parts -----------------------------------------------------
    let server_config = ServerConfig::from(&settings.get::<HttpServerSettings>());
    let status = Arc::new(ServerStatus::default());
    let telemetry = TelemetryCache::new(&bus, platform.rssi);
    let hub = Arc::new(WsHub::new(
        usize::from(server_config.max_clients),
        platform.ws_sender,
        network_frame.clone(),
        Arc::clone(&status),
        bus.clone(),
    ));
    let api = Arc::new(HttpApi::new(
        server_config,
        HttpApiParts {
            time: time.clone(),
            frame: network_frame.clone(),
            palette: palette.clone(),
            telemetry: Arc::clone(&telemetry),
            status: Arc::clone(&status),
            ota: platform.ota,
            bus: bus.clone(),
        },
    ));
    let visa = VisaServer::new(
        VisaContext {
            identity: Identity::from(&snapshot.info),
            frame: network_frame.clone(),
            palette: palette.clone(),
            telemetry: Arc::clone(&telemetry),
        },
        settings.get::<VisaServerSettings>().port,
        &bus,
        Arc::clone(&platform.watchdog),
    );
    let server = Server::new(platform.transport, api, Arc::clone(&hub), telemetry, status)
        .with_visa(visa);

    // ---- GUI & capture ----------------------------------------------------
    let _gui = GuiTask::new(GuiDeps {
        view: Box::new(CanvasView::new()),
        frames: frames.clone(),
        buffer: Arc::clone(&buffer),
        network_frame,
        hub: Some(hub),
        bus: bus.clone(),
        watchdog: Arc::clone(&platform.watchdog),
    })
    .start()?;

    let _capture = CaptureTask::new(
        platform.sensor,
        frames,
        buffer,
        bus.clone(),
        Arc::clone(&platform.watchdog),
        CaptureConfig::new(palette),
    )
    .start()?;

    // ---- Network ----------------------------------------------------------
    let _network = NetworkTask::new(NetworkDeps {
        wifi: platform.wifi,
        provisioning: platform.provisioning,
        server: Box::new(server),
        time,
        settings,
        watchdog: platform.watchdog,
        bus,
    })
    .start()?;

    log::info!("All tasks started");

    // Tasks run on their own threads; the handles above stay alive here.
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

/// The loopback driver accepts any SSID; give the host run one so it goes
/// straight to Connected instead of provisioning.
#[cfg(not(target_os = "espidf"))]
fn seed_host_credentials(settings: &SettingsManager) -> anyhow::Result<()> {
    use pyrovision::settings::WifiSettings;

    let mut wifi = settings.get::<WifiSettings>();
    if !wifi.has_credentials() {
        wifi.ssid = "pyrovision-sim".into();
        wifi.password = "thermal123".into();
        settings.update(wifi)?;
    }
    Ok(())
}
