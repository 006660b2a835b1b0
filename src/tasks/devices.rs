// PyroVision — Devices Task
//
// Periodically samples the battery and reports charge changes. The SD card
// is checked on a slower cadence; mounting happens inside that check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::*;
use crate::drivers::{PowerMonitor, StorageMonitor};
use crate::event_bus::{EventBus, Wait};
use crate::events::{DevicesEvent, Event};
use crate::tasks::{spawn_task, EventBits, TaskError, TaskHandle, Watchdog, STOP_REQUEST};

const DEVICES_POST_WAIT: Wait = Wait::For(Duration::from_millis(EVENT_POST_TIMEOUT_MS));

/// Map LiPo range: 3.3 V = 0 %, 4.2 V = 100 %.
pub fn battery_percentage(voltage: f32) -> u8 {
    let level = (voltage - BATTERY_EMPTY_V) / (BATTERY_FULL_V - BATTERY_EMPTY_V) * 100.0;
    level.clamp(0.0, 100.0).round() as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardState {
    Absent,
    Mounted { free_mb: u32 },
    Unreadable,
}

pub struct DevicesTask {
    power: Box<dyn PowerMonitor>,
    storage: Box<dyn StorageMonitor>,
    bus: EventBus,
    watchdog: Arc<dyn Watchdog>,
    bits: Arc<EventBits>,
    interval: Duration,
    storage_interval: Duration,
    next_sample: Option<Instant>,
    next_storage: Option<Instant>,
    charging: Option<bool>,
    card: Option<CardState>,
}

impl DevicesTask {
    pub fn new(
        power: Box<dyn PowerMonitor>,
        storage: Box<dyn StorageMonitor>,
        bus: EventBus,
        watchdog: Arc<dyn Watchdog>,
    ) -> Self {
        Self {
            power,
            storage,
            bus,
            watchdog,
            bits: EventBits::new(),
            interval: Duration::from_millis(BATTERY_UPDATE_MS),
            storage_interval: Duration::from_millis(SD_POLL_MS),
            next_sample: None,
            next_storage: None,
            charging: None,
            card: None,
        }
    }

    /// Sample when due. Returns `true` if a battery sample was taken.
    pub fn poll(&mut self, now: Instant) -> bool {
        if !self.next_storage.is_some_and(|due| now < due) {
            self.next_storage = Some(now + self.storage_interval);
            self.check_storage();
        }
        if self.next_sample.is_some_and(|due| now < due) {
            return false;
        }
        self.next_sample = Some(now + self.interval);
        self.sample();
        true
    }

    fn check_storage(&mut self) {
        let state = match self.storage.storage() {
            Ok(Some(info)) => CardState::Mounted {
                free_mb: info.free_mb,
            },
            Ok(None) => CardState::Absent,
            Err(e) => {
                if self.card != Some(CardState::Unreadable) {
                    log::warn!("SD card: {}", e);
                }
                CardState::Unreadable
            }
        };
        if self.card == Some(state) {
            return;
        }

        match state {
            CardState::Mounted { free_mb } => {
                if !matches!(self.card, Some(CardState::Mounted { .. })) {
                    log::info!("SD card ready, {} MiB free", free_mb);
                }
                self.post(DevicesEvent::SdCard {
                    present: true,
                    free_mb,
                });
            }
            CardState::Absent => {
                log::info!("No SD card");
                self.post(DevicesEvent::SdCard {
                    present: false,
                    free_mb: 0,
                });
            }
            CardState::Unreadable => {
                self.post(DevicesEvent::SdMountFailed);
                self.post(DevicesEvent::SdCard {
                    present: false,
                    free_mb: 0,
                });
            }
        }
        self.card = Some(state);
    }

    fn sample(&mut self) {
        match self.power.battery_voltage() {
            Ok(voltage) => {
                let percentage = battery_percentage(voltage);
                log::debug!("Battery {:.2} V ({}%)", voltage, percentage);
                self.post(DevicesEvent::Battery {
                    voltage,
                    percentage,
                });
            }
            Err(e) => log::warn!("Battery read failed: {}", e),
        }

        match self.power.is_charging() {
            Ok(charging) if self.charging != Some(charging) => {
                log::info!("Charger {}", if charging { "connected" } else { "disconnected" });
                self.charging = Some(charging);
                self.post(DevicesEvent::Charging(charging));
            }
            Ok(_) => {}
            Err(e) => log::warn!("Charge state read failed: {}", e),
        }
    }

    fn post(&self, event: DevicesEvent) {
        self.bus.post_or_warn(&Event::Devices(event), DEVICES_POST_WAIT);
    }

    fn run(mut self) {
        self.watchdog.subscribe_current();
        let period = Duration::from_millis(DEVICES_LOOP_MS);
        loop {
            self.watchdog.feed();
            if self.bits.wait_any(STOP_REQUEST, period) & STOP_REQUEST != 0 {
                break;
            }
            self.poll(Instant::now());
        }
        self.watchdog.unsubscribe_current();
        log::info!("Devices task exiting");
    }

    pub fn start(self) -> Result<TaskHandle, TaskError> {
        let bits = Arc::clone(&self.bits);
        spawn_task("devices", STACK_DEVICES, bits, move || self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::sim::SimStorage;
    use crate::drivers::{SensorError, StorageInfo};
    use crate::tasks::NoWatchdog;
    use parking_lot::Mutex;

    struct FakePower {
        voltage: f32,
        charging: Arc<Mutex<bool>>,
    }

    impl PowerMonitor for FakePower {
        fn battery_voltage(&mut self) -> Result<f32, SensorError> {
            Ok(self.voltage)
        }
        fn is_charging(&mut self) -> Result<bool, SensorError> {
            Ok(*self.charging.lock())
        }
    }

    #[test]
    fn percentage_is_linear_and_clamped() {
        assert_eq!(battery_percentage(3.0), 0);
        assert_eq!(battery_percentage(3.3), 0);
        assert_eq!(battery_percentage(3.75), 50);
        assert_eq!(battery_percentage(4.2), 100);
        assert_eq!(battery_percentage(4.5), 100);
    }

    #[test]
    fn samples_once_per_interval_and_reports_charge_changes() {
        let bus = EventBus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(None, move |e| sink.lock().push(e.clone()));

        let charging = Arc::new(Mutex::new(false));
        let mut task = DevicesTask::new(
            Box::new(FakePower {
                voltage: 3.75,
                charging: Arc::clone(&charging),
            }),
            Box::new(SimStorage::default()),
            bus.clone(),
            Arc::new(NoWatchdog),
        );

        let t0 = Instant::now();
        assert!(task.poll(t0));
        assert!(!task.poll(t0 + Duration::from_millis(500)));
        assert!(task.poll(t0 + Duration::from_millis(1000)));
        *charging.lock() = true;
        assert!(task.poll(t0 + Duration::from_millis(2000)));
        bus.dispatch_pending();

        let seen = seen.lock();
        let batteries = seen
            .iter()
            .filter(|e| matches!(e, Event::Devices(DevicesEvent::Battery { percentage: 50, .. })))
            .count();
        assert_eq!(batteries, 3);
        let charging: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                Event::Devices(DevicesEvent::Charging(c)) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(charging, vec![false, true]);
        let cards = seen
            .iter()
            .filter(|e| matches!(e, Event::Devices(DevicesEvent::SdCard { present: false, .. })))
            .count();
        assert_eq!(cards, 1);
    }

    fn sd_events(seen: &[Event]) -> Vec<DevicesEvent> {
        seen.iter()
            .filter_map(|e| match e {
                Event::Devices(d @ (DevicesEvent::SdCard { .. } | DevicesEvent::SdMountFailed)) => {
                    Some(*d)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn card_changes_are_reported_on_the_storage_cadence() {
        let bus = EventBus::new(32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(None, move |e| sink.lock().push(e.clone()));

        let slot = SimStorage::default();
        let mut task = DevicesTask::new(
            Box::new(FakePower {
                voltage: 4.0,
                charging: Arc::new(Mutex::new(false)),
            }),
            Box::new(slot.clone()),
            bus.clone(),
            Arc::new(NoWatchdog),
        );
        let sd = Duration::from_millis(SD_POLL_MS);
        let t0 = Instant::now();

        task.poll(t0);
        slot.insert(StorageInfo {
            total_mb: 1000,
            free_mb: 900,
        });
        // Between storage checks the insert goes unnoticed.
        task.poll(t0 + sd / 2);
        task.poll(t0 + sd);
        task.poll(t0 + sd * 2);
        slot.insert_unreadable();
        task.poll(t0 + sd * 3);
        task.poll(t0 + sd * 4);
        slot.eject();
        task.poll(t0 + sd * 5);
        bus.dispatch_pending();

        assert_eq!(
            sd_events(&seen.lock()),
            vec![
                DevicesEvent::SdCard {
                    present: false,
                    free_mb: 0
                },
                DevicesEvent::SdCard {
                    present: true,
                    free_mb: 900
                },
                DevicesEvent::SdMountFailed,
                DevicesEvent::SdCard {
                    present: false,
                    free_mb: 0
                },
                DevicesEvent::SdCard {
                    present: false,
                    free_mb: 0
                },
            ]
        );
    }
}
