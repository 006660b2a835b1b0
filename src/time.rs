// PyroVision — Time Manager
//
// Keeps track of where wall-clock time comes from. SNTP is preferred while
// the network is up; without network the RTC (if fitted) takes over,
// otherwise the free-running system clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::event_bus::{EventBus, Wait};
use crate::events::{Event, NetworkEvent, TimeEvent};

const TIME_POST_WAIT: Wait = Wait::For(Duration::from_millis(100));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSource {
    #[default]
    None,
    Rtc,
    Sntp,
    System,
}

#[derive(Debug, Error)]
pub enum TimeError {
    #[error("invalid time: {0}")]
    Invalid(String),
    #[error("clock backend error: {0}")]
    Backend(String),
}

/// System wall clock.
pub trait Clock: Send {
    fn now_epoch(&self) -> i64;
    fn set_epoch(&mut self, secs: i64) -> Result<(), TimeError>;
    fn set_timezone(&mut self, tz: &str) -> Result<(), TimeError>;
}

/// Battery-backed real-time clock.
pub trait Rtc: Send {
    fn read_epoch(&mut self) -> Result<i64, TimeError>;
    fn write_epoch(&mut self, secs: i64) -> Result<(), TimeError>;
}

pub type SyncCallback = Box<dyn Fn() + Send + Sync>;

pub trait SntpClient: Send {
    /// Start polling; `on_sync` fires after every successful sync.
    fn start(&mut self, on_sync: SyncCallback) -> Result<(), TimeError>;
    fn stop(&mut self);
}

/// Clock that only shifts the process clock by an offset. Used on the host,
/// where setting the real system time is neither possible nor wanted.
#[derive(Debug, Default)]
pub struct SoftClock {
    offset_s: AtomicI64,
    timezone: String,
}

impl SoftClock {
    pub fn timezone(&self) -> &str {
        &self.timezone
    }
}

impl Clock for SoftClock {
    fn now_epoch(&self) -> i64 {
        let base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64);
        base + self.offset_s.load(Ordering::Relaxed)
    }

    fn set_epoch(&mut self, secs: i64) -> Result<(), TimeError> {
        let base = self.now_epoch() - self.offset_s.load(Ordering::Relaxed);
        self.offset_s.store(secs - base, Ordering::Relaxed);
        Ok(())
    }

    fn set_timezone(&mut self, tz: &str) -> Result<(), TimeError> {
        self.timezone = tz.to_owned();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Earliest plausible time (2024-01-01); anything older is an unset clock.
const MIN_VALID_EPOCH: i64 = 1_704_067_200;

struct State {
    clock: Box<dyn Clock>,
    rtc: Option<Box<dyn Rtc>>,
    sntp: Option<Box<dyn SntpClient>>,
    sntp_running: bool,
    source: TimeSource,
    last_sync: Option<i64>,
}

struct Inner {
    state: Mutex<State>,
    bus: EventBus,
}

#[derive(Clone)]
pub struct TimeManager {
    inner: Arc<Inner>,
}

impl TimeManager {
    pub fn new(
        clock: Box<dyn Clock>,
        rtc: Option<Box<dyn Rtc>>,
        sntp: Option<Box<dyn SntpClient>>,
        bus: EventBus,
    ) -> Self {
        let mut state = State {
            clock,
            rtc,
            sntp,
            sntp_running: false,
            source: TimeSource::None,
            last_sync: None,
        };

        if let Some(rtc) = state.rtc.as_mut() {
            match rtc.read_epoch() {
                Ok(t) if t >= MIN_VALID_EPOCH => match state.clock.set_epoch(t) {
                    Ok(()) => {
                        state.source = TimeSource::Rtc;
                        log::info!("System time initialised from RTC ({})", t);
                    }
                    Err(e) => log::warn!("Failed to apply RTC time: {}", e),
                },
                Ok(t) => log::warn!("RTC time invalid ({}), waiting for SNTP", t),
                Err(e) => log::warn!("Failed to read RTC: {}", e),
            }
        } else {
            log::info!("No RTC available, SNTP will be the primary time source");
        }

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                bus,
            }),
        }
    }

    pub fn source(&self) -> TimeSource {
        self.inner.state.lock().source
    }

    pub fn now_epoch(&self) -> i64 {
        self.inner.state.lock().clock.now_epoch()
    }

    pub fn last_sync(&self) -> Option<i64> {
        self.inner.state.lock().last_sync
    }

    pub fn on_network_connected(&self) {
        // The client may call back synchronously, so start it unlocked.
        let mut sntp = {
            let mut state = self.inner.state.lock();
            if state.sntp_running {
                return;
            }
            let Some(sntp) = state.sntp.take() else {
                log::debug!("No SNTP client configured");
                return;
            };
            sntp
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let on_sync: SyncCallback = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                TimeManager { inner }.on_sntp_synced();
            }
        });
        let result = sntp.start(on_sync);

        let mut state = self.inner.state.lock();
        state.sntp = Some(sntp);
        match result {
            Ok(()) => {
                state.sntp_running = true;
                log::info!("Network up, SNTP started");
            }
            Err(e) => log::warn!("Failed to start SNTP: {}", e),
        }
    }

    pub fn on_network_disconnected(&self) {
        let (old, new) = {
            let mut state = self.inner.state.lock();
            if state.sntp_running {
                if let Some(sntp) = state.sntp.as_mut() {
                    sntp.stop();
                }
                state.sntp_running = false;
            }
            let old = state.source;
            state.source = if state.rtc.is_some() {
                TimeSource::Rtc
            } else {
                log::warn!("No RTC available, system time will drift");
                TimeSource::System
            };
            (old, state.source)
        };

        if old != new {
            log::info!("Time source {:?} -> {:?}", old, new);
            self.inner
                .bus
                .post_or_warn(&Event::Time(TimeEvent::SourceChanged(new)), TIME_POST_WAIT);
        }
    }

    /// Called from the SNTP client's context after a successful sync.
    pub fn on_sntp_synced(&self) {
        let changed = {
            let mut state = self.inner.state.lock();
            let now = state.clock.now_epoch();
            state.last_sync = Some(now);
            if let Some(rtc) = state.rtc.as_mut() {
                if let Err(e) = rtc.write_epoch(now) {
                    log::warn!("Failed to back up time to RTC: {}", e);
                }
            }
            let changed = state.source != TimeSource::Sntp;
            state.source = TimeSource::Sntp;
            changed
        };

        log::info!("SNTP time synchronised");
        if changed {
            self.inner.bus.post_or_warn(
                &Event::Time(TimeEvent::SourceChanged(TimeSource::Sntp)),
                TIME_POST_WAIT,
            );
        }
        self.inner
            .bus
            .post_or_warn(&Event::Time(TimeEvent::Synchronized), TIME_POST_WAIT);
        self.inner
            .bus
            .post_or_warn(&Event::Network(NetworkEvent::SntpSynced), TIME_POST_WAIT);
    }

    /// Set wall-clock time from an external source (HTTP API).
    pub fn set_epoch(&self, secs: i64) -> Result<(), TimeError> {
        if secs < MIN_VALID_EPOCH {
            return Err(TimeError::Invalid(format!("epoch {} before 2024", secs)));
        }
        let mut state = self.inner.state.lock();
        state.clock.set_epoch(secs)?;
        if let Some(rtc) = state.rtc.as_mut() {
            if let Err(e) = rtc.write_epoch(secs) {
                log::warn!("Failed to back up time to RTC: {}", e);
            }
        }
        if state.source == TimeSource::None {
            state.source = TimeSource::System;
        }
        log::info!("System time set to {}", secs);
        Ok(())
    }

    pub fn set_timezone(&self, tz: &str) -> Result<(), TimeError> {
        if tz.is_empty() {
            return Err(TimeError::Invalid("empty timezone".into()));
        }
        self.inner.state.lock().clock.set_timezone(tz)?;
        log::info!("Timezone set to {}", tz);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRtc(i64);

    impl Rtc for FakeRtc {
        fn read_epoch(&mut self) -> Result<i64, TimeError> {
            Ok(self.0)
        }
        fn write_epoch(&mut self, secs: i64) -> Result<(), TimeError> {
            self.0 = secs;
            Ok(())
        }
    }

    /// Syncs immediately on start.
    struct InstantSntp;

    impl SntpClient for InstantSntp {
        fn start(&mut self, on_sync: SyncCallback) -> Result<(), TimeError> {
            on_sync();
            Ok(())
        }
        fn stop(&mut self) {}
    }

    fn events(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(Some(crate::events::EventBase::Time), move |e| {
            sink.lock().push(e.clone())
        });
        seen
    }

    #[test]
    fn valid_rtc_seeds_the_clock() {
        let bus = EventBus::new(8);
        let tm = TimeManager::new(
            Box::new(SoftClock::default()),
            Some(Box::new(FakeRtc(1_800_000_000))),
            None,
            bus,
        );
        assert_eq!(tm.source(), TimeSource::Rtc);
        assert!((tm.now_epoch() - 1_800_000_000).abs() < 5);
    }

    #[test]
    fn sntp_sync_switches_source_and_notifies() {
        let bus = EventBus::new(8);
        let seen = events(&bus);
        let tm = TimeManager::new(Box::new(SoftClock::default()), None, Some(Box::new(InstantSntp)), bus.clone());

        tm.on_network_connected();
        bus.dispatch_pending();
        assert_eq!(tm.source(), TimeSource::Sntp);
        assert!(tm.last_sync().is_some());
        assert!(seen.lock().contains(&Event::Time(TimeEvent::Synchronized)));
    }

    #[test]
    fn disconnect_without_rtc_falls_back_to_system_once() {
        let bus = EventBus::new(8);
        let seen = events(&bus);
        let tm = TimeManager::new(Box::new(SoftClock::default()), None, Some(Box::new(InstantSntp)), bus.clone());

        tm.on_network_connected();
        tm.on_network_disconnected();
        tm.on_network_disconnected();
        bus.dispatch_pending();

        assert_eq!(tm.source(), TimeSource::System);
        let switches = seen
            .lock()
            .iter()
            .filter(|e| **e == Event::Time(TimeEvent::SourceChanged(TimeSource::System)))
            .count();
        assert_eq!(switches, 1);
    }

    #[test]
    fn set_epoch_rejects_unset_clock_values() {
        let tm = TimeManager::new(Box::new(SoftClock::default()), None, None, EventBus::new(4));
        assert!(tm.set_epoch(0).is_err());
        tm.set_epoch(1_750_000_000).unwrap();
        assert!((tm.now_epoch() - 1_750_000_000).abs() < 5);
        assert_eq!(tm.source(), TimeSource::System);
    }

    #[test]
    fn empty_timezone_is_invalid() {
        let tm = TimeManager::new(Box::new(SoftClock::default()), None, None, EventBus::new(4));
        assert!(tm.set_timezone("").is_err());
        assert!(tm.set_timezone("UTC0").is_ok());
    }
}
