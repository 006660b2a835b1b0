// PyroVision — Telemetry Cache
//
// Keeps the latest sensor, power and network readings as they pass over the
// event bus, so HTTP and WebSocket telemetry never query another task.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::event_bus::{EventBus, Subscription};
use crate::events::{DevicesEvent, Event, LeptonEvent, NetworkEvent, NetworkState, Spotmeter};
use crate::server::ServerStatus;

pub type RssiProbe = Arc<dyn Fn() -> i8 + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Readings {
    spotmeter: Spotmeter,
    fpa_c: f32,
    aux_c: f32,
    supply_voltage_v: f32,
    battery_percent: u8,
    network_state: NetworkState,
    sd_present: bool,
    sd_free_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReport {
    pub temp_c: f32,
    pub fpa_c: f32,
    pub aux_c: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SdCardReport {
    pub present: bool,
    pub free_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryReport {
    pub uptime_s: u64,
    pub sensor: SensorReport,
    pub supply_voltage_v: f32,
    pub battery_percent: u8,
    pub wifi_rssi_dbm: i8,
    pub network_state: NetworkState,
    pub ws_clients: u32,
    pub requests_served: u32,
    pub frames_streamed: u32,
    pub sdcard: SdCardReport,
}

pub struct TelemetryCache {
    readings: Arc<Mutex<Readings>>,
    rssi: RssiProbe,
    _subscription: Subscription,
}

impl TelemetryCache {
    pub fn new(bus: &EventBus, rssi: RssiProbe) -> Arc<Self> {
        let readings = Arc::new(Mutex::new(Readings::default()));
        let sink = Arc::clone(&readings);
        let subscription = bus.subscribe_scoped(None, move |event| {
            let mut r = sink.lock();
            match event {
                Event::Lepton(LeptonEvent::Spotmeter(s)) => r.spotmeter = *s,
                Event::Lepton(LeptonEvent::Temperatures { fpa_c, aux_c }) => {
                    r.fpa_c = *fpa_c;
                    r.aux_c = *aux_c;
                }
                Event::Devices(DevicesEvent::Battery { voltage, percentage }) => {
                    r.supply_voltage_v = *voltage;
                    r.battery_percent = *percentage;
                }
                Event::Devices(DevicesEvent::SdCard { present, free_mb }) => {
                    r.sd_present = *present;
                    r.sd_free_mb = *free_mb;
                }
                Event::Network(NetworkEvent::StateChanged(state)) => r.network_state = *state,
                _ => {}
            }
        });

        Arc::new(Self {
            readings,
            rssi,
            _subscription: subscription,
        })
    }

    pub fn network_state(&self) -> NetworkState {
        self.readings.lock().network_state
    }

    /// Latest spotmeter average and housing temperatures, °C.
    pub fn sensor(&self) -> SensorReport {
        let r = self.readings.lock();
        SensorReport {
            temp_c: r.spotmeter.avg_c,
            fpa_c: r.fpa_c,
            aux_c: r.aux_c,
        }
    }

    pub fn report(&self, status: &ServerStatus) -> TelemetryReport {
        let sensor = self.sensor();
        let r = self.readings.lock().clone();
        let wifi_rssi_dbm = if r.network_state == NetworkState::Connected {
            (self.rssi)()
        } else {
            0
        };

        TelemetryReport {
            uptime_s: crate::now_ms() / 1000,
            sensor,
            supply_voltage_v: r.supply_voltage_v,
            battery_percent: r.battery_percent,
            wifi_rssi_dbm,
            network_state: r.network_state,
            ws_clients: status.ws_clients.load(Ordering::Relaxed),
            requests_served: status.requests_served.load(Ordering::Relaxed),
            frames_streamed: status.frames_streamed.load(Ordering::Relaxed),
            sdcard: SdCardReport {
                present: r.sd_present,
                free_mb: r.sd_free_mb,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::Wait;

    #[test]
    fn readings_follow_the_bus() {
        let bus = EventBus::new(8);
        let cache = TelemetryCache::new(&bus, Arc::new(|| -61));
        let status = ServerStatus::default();

        let post = |e: Event| bus.post(&e, Wait::None).unwrap();
        post(Event::Devices(DevicesEvent::Battery { voltage: 3.9, percentage: 66 }));
        post(Event::Lepton(LeptonEvent::Spotmeter(Spotmeter { min_c: 20.0, max_c: 30.0, avg_c: 25.0 })));
        bus.dispatch_pending();

        let report = cache.report(&status);
        assert_eq!(report.battery_percent, 66);
        assert_eq!(report.sensor.temp_c, 25.0);
        // Not connected yet.
        assert_eq!(report.wifi_rssi_dbm, 0);

        post(Event::Network(NetworkEvent::StateChanged(NetworkState::Connected)));
        bus.dispatch_pending();
        assert_eq!(cache.report(&status).wifi_rssi_dbm, -61);
    }

    #[test]
    fn report_serializes_expected_shape() {
        let bus = EventBus::new(4);
        let cache = TelemetryCache::new(&bus, Arc::new(|| 0));
        let json = serde_json::to_value(cache.report(&ServerStatus::default())).unwrap();
        assert!(json["sensor"]["fpa_c"].is_number());
        assert_eq!(json["network_state"], "idle");
        assert_eq!(json["sdcard"]["present"], false);
    }
}
