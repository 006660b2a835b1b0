// PyroVision — Host Simulation Drivers
//
// Stand-ins for the camera hardware so the complete pipeline runs on a
// development machine: a synthetic thermal scene, a WiFi driver that
// answers through the event bus, a slowly draining battery, a swappable SD
// card, a logging provisioning transport and an SNTP client that syncs on
// start.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::*;
use crate::drivers::{
    ApConfig, PowerMonitor, ProvisioningTransport, RawFrame, RawSpotmeter, SensorError, StaConfig,
    StorageError, StorageInfo, StorageMonitor, ThermalSensor, WifiDriver, WifiError,
};
use crate::event_bus::{EventBus, Wait};
use crate::events::{Event, IpInfo, NetworkEvent, Roi, RoiType};
use crate::frame_channel::FrameChannel;
use crate::network::wifi::REASON_NO_AP_FOUND;
use crate::settings::WifiMode;
use crate::time::{SntpClient, SyncCallback, TimeError};

const SIM_POST_WAIT: Wait = Wait::For(Duration::from_millis(100));

/// 20 °C in centikelvin.
const SCENE_BACKGROUND: u16 = 29_315;
/// Lepton streams at roughly 9 Hz.
const SIM_FRAME_INTERVAL_MS: u64 = 111;

// ---------------------------------------------------------------------------
// Thermal sensor
// ---------------------------------------------------------------------------

/// Synthetic scene: a warm gradient with a hot spot orbiting the centre.
pub fn synthetic_frame(tick: u32) -> RawFrame {
    let (w, h) = (LEPTON_WIDTH as usize, LEPTON_HEIGHT as usize);
    let angle = tick as f32 * 0.1;
    let cx = w as f32 / 2.0 + angle.cos() * 40.0;
    let cy = h as f32 / 2.0 + angle.sin() * 30.0;

    let mut pixels = Vec::with_capacity(w * h);
    for y in 0..h {
        for x in 0..w {
            let gradient = (y * 200 / h) as u16;
            let (dx, dy) = (x as f32 - cx, y as f32 - cy);
            let spot = (1500.0 - (dx * dx + dy * dy) * 4.0).max(0.0) as u16;
            pixels.push(SCENE_BACKGROUND + gradient + spot);
        }
    }
    RawFrame {
        pixels,
        telemetry: vec![tick as u16],
        width: LEPTON_WIDTH,
        height: LEPTON_HEIGHT,
        bytes_per_pixel: 2,
    }
}

fn roi_stats(pixels: &[u16], roi: &Roi) -> Option<RawSpotmeter> {
    let width = usize::from(LEPTON_WIDTH);
    let mut values = (roi.y..=roi.end_row()).flat_map(|y| {
        (roi.x..=roi.end_col()).filter_map(move |x| pixels.get(usize::from(y) * width + usize::from(x)))
    });
    let first = *values.next()?;
    let (mut min, mut max, mut sum, mut n) = (first, first, u32::from(first), 1u32);
    for &v in values {
        min = min.min(v);
        max = max.max(v);
        sum += u32::from(v);
        n += 1;
    }
    Some(RawSpotmeter {
        min,
        max,
        avg: (sum / n) as u16,
    })
}

pub struct SimThermalSensor {
    rois: Vec<Roi>,
    last: Arc<Mutex<Option<Vec<u16>>>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    frame_interval: Duration,
}

impl SimThermalSensor {
    pub fn new() -> Self {
        let centre = |kind| Roi {
            kind,
            x: 78,
            y: 58,
            w: 4,
            h: 4,
        };
        Self {
            rois: vec![
                centre(RoiType::Spotmeter),
                Roi {
                    kind: RoiType::Scene,
                    x: 0,
                    y: 0,
                    w: LEPTON_WIDTH,
                    h: LEPTON_HEIGHT,
                },
                Roi {
                    kind: RoiType::Agc,
                    x: 0,
                    y: 0,
                    w: LEPTON_WIDTH,
                    h: LEPTON_HEIGHT,
                },
                centre(RoiType::VideoFocus),
            ],
            last: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            frame_interval: Duration::from_millis(SIM_FRAME_INTERVAL_MS),
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }
}

impl Default for SimThermalSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl ThermalSensor for SimThermalSensor {
    fn start_capture(&mut self, sink: FrameChannel<RawFrame>) -> Result<(), SensorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (running, last, interval) = (
            Arc::clone(&self.running),
            Arc::clone(&self.last),
            self.frame_interval,
        );
        let worker = thread::Builder::new()
            .name("sim_lepton".into())
            .stack_size(STACK_CAPTURE)
            .spawn(move || {
                let mut tick = 0u32;
                while running.load(Ordering::SeqCst) {
                    let frame = synthetic_frame(tick);
                    *last.lock() = Some(frame.pixels.clone());
                    sink.publish(frame);
                    tick = tick.wrapping_add(1);
                    thread::sleep(interval);
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                SensorError::Transaction(e.to_string())
            })?;
        self.worker = Some(worker);
        log::info!("Simulated thermal sensor streaming");
        Ok(())
    }

    fn stop_capture(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Simulated sensor thread panicked");
            }
        }
    }

    fn part_number(&mut self) -> Result<String, SensorError> {
        Ok("500-0771-01-SIM".into())
    }

    fn serial_number(&mut self) -> Result<u64, SensorError> {
        Ok(0x5059_524F_0000_0001)
    }

    fn set_roi(&mut self, roi: &Roi) -> Result<(), SensorError> {
        if roi.end_col() >= LEPTON_WIDTH || roi.end_row() >= LEPTON_HEIGHT {
            return Err(SensorError::InvalidArgument(format!("{:?}", roi)));
        }
        self.rois.retain(|r| r.kind != roi.kind);
        self.rois.push(*roi);
        Ok(())
    }

    fn roi(&mut self, kind: RoiType) -> Result<Roi, SensorError> {
        self.rois
            .iter()
            .find(|r| r.kind == kind)
            .copied()
            .ok_or_else(|| SensorError::InvalidArgument(format!("no {:?} ROI", kind)))
    }

    fn fpa_temperature(&mut self) -> Result<u16, SensorError> {
        Ok(30_215)
    }

    fn aux_temperature(&mut self) -> Result<u16, SensorError> {
        Ok(29_915)
    }

    fn uptime_ms(&mut self) -> Result<u32, SensorError> {
        Ok(crate::now_ms() as u32)
    }

    fn spotmeter(&mut self) -> Result<RawSpotmeter, SensorError> {
        let roi = self.roi(RoiType::Spotmeter)?;
        let last = self.last.lock();
        let pixels = last.as_deref().ok_or(SensorError::NotResponding)?;
        roi_stats(pixels, &roi).ok_or(SensorError::NotResponding)
    }
}

impl Drop for SimThermalSensor {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

// ---------------------------------------------------------------------------
// WiFi
// ---------------------------------------------------------------------------

/// Shared view on what the loopback driver was asked to do.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    pub connects: AtomicU32,
    pub starts: AtomicU32,
}

/// Answers every driver call with the events a real station/AP would
/// produce. `failing(n)` makes the next `n` connects fail with
/// "AP not found"; `refusing_after(n)` makes the driver reject every
/// connect request after the first `n`.
pub struct LoopbackWifi {
    bus: EventBus,
    mode: Option<WifiMode>,
    sta: Option<StaConfig>,
    started: bool,
    failures_left: Option<u32>,
    accept_limit: Option<u32>,
    stats: Arc<LoopbackStats>,
}

impl LoopbackWifi {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            mode: None,
            sta: None,
            started: false,
            failures_left: Some(0),
            accept_limit: None,
            stats: Arc::new(LoopbackStats::default()),
        }
    }

    pub fn failing(mut self, connects: u32) -> Self {
        self.failures_left = Some(connects);
        self
    }

    pub fn refusing_after(mut self, connects: u32) -> Self {
        self.accept_limit = Some(connects);
        self
    }

    /// Every connect fails.
    pub fn unreachable(mut self) -> Self {
        self.failures_left = None;
        self
    }

    pub fn stats(&self) -> Arc<LoopbackStats> {
        Arc::clone(&self.stats)
    }

    fn post(&self, event: NetworkEvent) {
        self.bus.post_or_warn(&Event::Network(event), SIM_POST_WAIT);
    }
}

impl WifiDriver for LoopbackWifi {
    fn configure(
        &mut self,
        mode: WifiMode,
        sta: Option<&StaConfig>,
        _ap: Option<&ApConfig>,
    ) -> Result<(), WifiError> {
        self.mode = Some(mode);
        self.sta = sta.cloned();
        Ok(())
    }

    fn start(&mut self) -> Result<(), WifiError> {
        let mode = self.mode.ok_or(WifiError::NotStarted)?;
        self.started = true;
        self.stats.starts.fetch_add(1, Ordering::Relaxed);
        if mode.has_ap() {
            self.post(NetworkEvent::ApStarted);
        }
        Ok(())
    }

    fn connect(&mut self) -> Result<(), WifiError> {
        if !self.started {
            return Err(WifiError::NotStarted);
        }
        let Some(sta) = self.sta.as_ref() else {
            return Err(WifiError::InvalidConfig("no station config".into()));
        };
        let attempt = self.stats.connects.fetch_add(1, Ordering::Relaxed) + 1;
        if self.accept_limit.is_some_and(|limit| attempt > limit) {
            return Err(WifiError::Driver("connect request refused".into()));
        }
        log::debug!("Loopback WiFi connecting to '{}'", sta.ssid);

        let fail = match self.failures_left.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        };
        if fail {
            self.post(NetworkEvent::WifiDisconnected {
                reason: REASON_NO_AP_FOUND,
            });
        } else {
            self.post(NetworkEvent::WifiConnected);
            self.post(NetworkEvent::WifiGotIp(IpInfo {
                ip: Ipv4Addr::new(192, 168, 4, 20),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::new(192, 168, 4, 1),
            }));
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), WifiError> {
        self.post(NetworkEvent::WifiDisconnected { reason: 8 });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), WifiError> {
        if self.started && self.mode.is_some_and(|m| m.has_ap()) {
            self.post(NetworkEvent::ApStopped);
        }
        self.started = false;
        Ok(())
    }

    fn rssi(&mut self) -> Option<i8> {
        self.started.then_some(-55)
    }

    fn mac(&mut self) -> [u8; 6] {
        [0x02, 0x00, 0x00, 0x00, 0xBE, 0xEF]
    }
}

// ---------------------------------------------------------------------------
// Power
// ---------------------------------------------------------------------------
pub struct SimPower {
    voltage: f32,
}

impl SimPower {
    pub fn new() -> Self {
        Self { voltage: 4.1 }
    }
}

impl Default for SimPower {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerMonitor for SimPower {
    fn battery_voltage(&mut self) -> Result<f32, SensorError> {
        self.voltage = (self.voltage - 0.001).max(3.5);
        Ok(self.voltage)
    }

    fn is_charging(&mut self) -> Result<bool, SensorError> {
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Card slot whose contents can be swapped from outside, e.g. by a test.
#[derive(Clone, Default)]
pub struct SimStorage {
    slot: Arc<Mutex<Option<Result<StorageInfo, String>>>>,
}

impl SimStorage {
    /// Slot holding an 8 GB card.
    pub fn with_card() -> Self {
        let storage = Self::default();
        storage.insert(StorageInfo {
            total_mb: 7_580,
            free_mb: 7_400,
        });
        storage
    }

    pub fn insert(&self, info: StorageInfo) {
        *self.slot.lock() = Some(Ok(info));
    }

    /// Card present but unformatted.
    pub fn insert_unreadable(&self) {
        *self.slot.lock() = Some(Err("no FAT filesystem".into()));
    }

    pub fn eject(&self) {
        *self.slot.lock() = None;
    }
}

impl StorageMonitor for SimStorage {
    fn storage(&mut self) -> Result<Option<StorageInfo>, StorageError> {
        match self.slot.lock().clone() {
            Some(Ok(info)) => Ok(Some(info)),
            Some(Err(e)) => Err(StorageError::Mount(e)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioning / SNTP
// ---------------------------------------------------------------------------

/// Provisioning transport that only logs; credentials are injected by
/// posting `ProvCredentialsReceived` directly.
#[derive(Debug, Default)]
pub struct LoggingProvisioning {
    active: Option<String>,
}

impl ProvisioningTransport for LoggingProvisioning {
    fn start(&mut self, service_name: &str) -> Result<(), WifiError> {
        log::info!("Simulated provisioning portal '{}' open", service_name);
        self.active = Some(service_name.to_owned());
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(name) = self.active.take() {
            log::info!("Simulated provisioning portal '{}' closed", name);
        }
    }
}

/// Reports a successful sync as soon as it is started.
#[derive(Debug, Default)]
pub struct InstantSntp;

impl SntpClient for InstantSntp {
    fn start(&mut self, on_sync: SyncCallback) -> Result<(), TimeError> {
        on_sync();
        Ok(())
    }

    fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_scene_has_a_hot_spot() {
        let frame = synthetic_frame(0);
        assert_eq!(frame.pixels.len(), LEPTON_WIDTH as usize * LEPTON_HEIGHT as usize);
        let max = frame.pixels.iter().copied().max().unwrap();
        let min = frame.pixels.iter().copied().min().unwrap();
        assert_eq!(min, SCENE_BACKGROUND);
        assert!(max > SCENE_BACKGROUND + 1000);
    }

    #[test]
    fn spotmeter_averages_the_roi() {
        let mut sensor = SimThermalSensor::new();
        *sensor.last.lock() = Some(vec![30_000; LEPTON_WIDTH as usize * LEPTON_HEIGHT as usize]);
        let spot = sensor.spotmeter().unwrap();
        assert_eq!((spot.min, spot.max, spot.avg), (30_000, 30_000, 30_000));
    }

    #[test]
    fn loopback_connect_reports_through_the_bus() {
        let bus = EventBus::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(None, move |e| sink.lock().push(e.clone()));

        let mut wifi = LoopbackWifi::new(bus.clone()).failing(1);
        let sta = StaConfig {
            ssid: "lab".into(),
            password: "pw".into(),
        };
        wifi.configure(WifiMode::Sta, Some(&sta), None).unwrap();
        wifi.start().unwrap();
        wifi.connect().unwrap();
        wifi.connect().unwrap();
        bus.dispatch_pending();

        let seen = seen.lock();
        assert_eq!(
            seen[0],
            Event::Network(NetworkEvent::WifiDisconnected {
                reason: REASON_NO_AP_FOUND
            })
        );
        assert_eq!(seen[1], Event::Network(NetworkEvent::WifiConnected));
        assert!(matches!(seen[2], Event::Network(NetworkEvent::WifiGotIp(_))));
        assert_eq!(wifi.stats().connects.load(Ordering::Relaxed), 2);
    }
}
