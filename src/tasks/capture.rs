// PyroVision — Capture Task
//
// Pulls raw frames from the thermal sensor's 1-slot queue, colours them into
// the free DoubleBuffer slot and publishes a FrameDescriptor to the GUI.
// Sensor queries requested by the GUI (ROI, temperatures, uptime, pixel
// temperature, spotmeter) arrive as bus events, are latched into event bits
// and executed between frames on this task.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::*;
use crate::double_buffer::DoubleBuffer;
use crate::drivers::{RawFrame, SensorError, ThermalSensor};
use crate::encoder::{colorize, SharedPalette};
use crate::event_bus::{EventBus, Subscription, Wait};
use crate::events::{Event, EventBase, GuiEvent, LeptonEvent, Roi, Spotmeter};
use crate::frame_channel::{FrameChannel, FrameDescriptor};
use crate::tasks::{spawn_task, EventBits, TaskError, TaskHandle, Watchdog, STOP_REQUEST};

const BIT_SET_ROI: u32 = 1 << 0;
const BIT_TEMPERATURES: u32 = 1 << 1;
const BIT_UPTIME: u32 = 1 << 2;
const BIT_PIXEL: u32 = 1 << 3;
const BIT_SPOTMETER: u32 = 1 << 4;
const REQUEST_BITS: u32 = BIT_SET_ROI | BIT_TEMPERATURES | BIT_UPTIME | BIT_PIXEL | BIT_SPOTMETER;

const RESPONSE_WAIT: Wait = Wait::For(Duration::from_millis(EVENT_POST_TIMEOUT_MS));

pub fn centikelvin_to_celsius(raw: u16) -> f32 {
    f32::from(raw) * 0.01 - KELVIN_OFFSET
}

/// `0x0123456789ABCDEF` -> `"0123-4567-89AB-CDEF"`.
pub fn format_serial(serial: u64) -> String {
    format!(
        "{:04X}-{:04X}-{:04X}-{:04X}",
        (serial >> 48) & 0xFFFF,
        (serial >> 32) & 0xFFFF,
        (serial >> 16) & 0xFFFF,
        serial & 0xFFFF
    )
}

/// Map a display coordinate onto the sensor grid.
pub fn screen_to_frame(screen_x: u16, screen_y: u16, width: u16, height: u16) -> (u16, u16) {
    let scale = |v: u16, from: u16, to: u16| -> u16 {
        let scaled = u32::from(v) * u32::from(to) / u32::from(from.max(1));
        scaled.min(u32::from(to.saturating_sub(1))) as u16
    };
    (
        scale(screen_x, DISPLAY_WIDTH, width),
        scale(screen_y, DISPLAY_HEIGHT, height),
    )
}

#[derive(Clone)]
pub struct CaptureConfig {
    pub stabilize_steps: u32,
    pub step: Duration,
    pub frame_timeout: Duration,
    pub palette: SharedPalette,
}

impl CaptureConfig {
    pub fn new(palette: SharedPalette) -> Self {
        Self {
            stabilize_steps: CAPTURE_STABILIZE_STEPS,
            step: Duration::from_millis(CAPTURE_STEP_MS),
            frame_timeout: Duration::from_millis(CAPTURE_FRAME_TIMEOUT_MS),
            palette,
        }
    }

    /// No warm-up wait; for the simulated sensor.
    pub fn immediate(palette: SharedPalette) -> Self {
        Self {
            stabilize_steps: 0,
            ..Self::new(palette)
        }
    }
}

#[derive(Default)]
struct Requests {
    roi: Option<Roi>,
    pixel: Option<(u16, u16)>,
}

/// Geometry and pixels of the last converted frame, for pixel queries.
struct LastFrame {
    pixels: Vec<u16>,
    width: u16,
    height: u16,
}

pub struct CaptureTask {
    sensor: Box<dyn ThermalSensor>,
    frames: FrameChannel<FrameDescriptor>,
    raw: FrameChannel<RawFrame>,
    buffer: Arc<DoubleBuffer>,
    bus: EventBus,
    watchdog: Arc<dyn Watchdog>,
    config: CaptureConfig,
    bits: Arc<EventBits>,
    requests: Arc<Mutex<Requests>>,
    last: Option<LastFrame>,
    seq: u32,
    capturing: bool,
    _subscription: Subscription,
}

impl CaptureTask {
    pub fn new(
        sensor: Box<dyn ThermalSensor>,
        frames: FrameChannel<FrameDescriptor>,
        buffer: Arc<DoubleBuffer>,
        bus: EventBus,
        watchdog: Arc<dyn Watchdog>,
        config: CaptureConfig,
    ) -> Self {
        let bits = EventBits::new();
        let requests = Arc::new(Mutex::new(Requests::default()));

        let subscription = {
            let (bits, requests) = (Arc::clone(&bits), Arc::clone(&requests));
            bus.subscribe_scoped(Some(EventBase::Gui), move |event| {
                let Event::Gui(request) = event else { return };
                let bit = match request {
                    GuiEvent::SetRoi(roi) => {
                        requests.lock().roi = Some(*roi);
                        BIT_SET_ROI
                    }
                    GuiEvent::GetTemperatures => BIT_TEMPERATURES,
                    GuiEvent::GetUptime => BIT_UPTIME,
                    GuiEvent::GetPixelTemperature { screen_x, screen_y } => {
                        requests.lock().pixel = Some((*screen_x, *screen_y));
                        BIT_PIXEL
                    }
                    GuiEvent::GetSpotmeter => BIT_SPOTMETER,
                };
                bits.set(bit);
            })
        };

        Self {
            sensor,
            frames,
            raw: FrameChannel::new(),
            buffer,
            bus,
            watchdog,
            config,
            bits,
            requests,
            last: None,
            seq: 0,
            capturing: false,
            _subscription: subscription,
        }
    }

    pub fn bits(&self) -> &Arc<EventBits> {
        &self.bits
    }

    /// Frames converted so far.
    pub fn frames_converted(&self) -> u32 {
        self.seq
    }

    /// Warm-up, identify the camera and start streaming. On failure anything
    /// already started is stopped again and `CameraError` is posted.
    pub fn startup(&mut self) -> Result<(), SensorError> {
        for _ in 0..self.config.stabilize_steps {
            self.watchdog.feed();
            thread::sleep(self.config.step);
        }

        let result = self.identify_and_start();
        if let Err(ref e) = result {
            log::error!("Thermal camera startup failed: {}", e);
            self.shutdown_sensor();
            self.post(LeptonEvent::CameraError);
        }
        result
    }

    fn identify_and_start(&mut self) -> Result<(), SensorError> {
        let part_number = self.sensor.part_number()?;
        let serial = format_serial(self.sensor.serial_number()?);
        log::info!("Thermal camera {} (S/N {})", part_number, serial);

        self.sensor.start_capture(self.raw.clone())?;
        self.capturing = true;

        if let Err(e) = self.bus.post(
            &Event::Lepton(LeptonEvent::CameraReady {
                part_number,
                serial,
            }),
            Wait::Forever,
        ) {
            log::error!("Failed to announce camera: {}", e);
        }
        Ok(())
    }

    fn shutdown_sensor(&mut self) {
        if self.capturing {
            self.sensor.stop_capture();
            self.capturing = false;
        }
    }

    /// One loop iteration: pending GUI requests, then wait up to `timeout`
    /// for the next raw frame.
    pub fn step(&mut self, timeout: Duration) {
        let pending = self.bits.take(REQUEST_BITS);
        if pending != 0 {
            self.handle_requests(pending);
        }

        match self.raw.consume_timeout(timeout) {
            Some(frame) => self.convert(frame),
            None => log::warn!("No raw frame within {} ms", timeout.as_millis()),
        }
    }

    fn convert(&mut self, frame: RawFrame) {
        let palette = self.config.palette.get();
        match self
            .buffer
            .write_next(|rgb| colorize(&frame.pixels, rgb, palette))
        {
            Ok((slot, (min, max))) => {
                self.seq = self.seq.wrapping_add(1);
                self.frames.publish(FrameDescriptor {
                    slot,
                    width: frame.width,
                    height: frame.height,
                    channels: RGB_CHANNELS,
                    min,
                    max,
                    seq: self.seq,
                });
            }
            Err(e) => log::debug!("Frame conversion skipped: {}", e),
        }

        self.last = Some(LastFrame {
            pixels: frame.pixels,
            width: frame.width,
            height: frame.height,
        });
    }

    fn handle_requests(&mut self, pending: u32) {
        if pending & BIT_SET_ROI != 0 {
            let roi = self.requests.lock().roi.take();
            if let Some(roi) = roi {
                self.apply_roi(roi);
            }
        }
        if pending & BIT_TEMPERATURES != 0 {
            match (self.sensor.fpa_temperature(), self.sensor.aux_temperature()) {
                (Ok(fpa), Ok(aux)) => self.post(LeptonEvent::Temperatures {
                    fpa_c: centikelvin_to_celsius(fpa),
                    aux_c: centikelvin_to_celsius(aux),
                }),
                (Err(e), _) | (_, Err(e)) => log::warn!("Temperature query failed: {}", e),
            }
        }
        if pending & BIT_UPTIME != 0 {
            match self.sensor.uptime_ms() {
                Ok(ms) => self.post(LeptonEvent::Uptime(ms)),
                Err(e) => log::warn!("Uptime query failed: {}", e),
            }
        }
        if pending & BIT_PIXEL != 0 {
            let pixel = self.requests.lock().pixel.take();
            if let Some((sx, sy)) = pixel {
                self.pixel_temperature(sx, sy);
            }
        }
        if pending & BIT_SPOTMETER != 0 {
            match self.sensor.spotmeter() {
                Ok(raw) => self.post(LeptonEvent::Spotmeter(Spotmeter {
                    min_c: centikelvin_to_celsius(raw.min),
                    max_c: centikelvin_to_celsius(raw.max),
                    avg_c: centikelvin_to_celsius(raw.avg),
                })),
                Err(e) => log::warn!("Spotmeter query failed: {}", e),
            }
        }
    }

    fn apply_roi(&mut self, roi: Roi) {
        if roi.w == 0 || roi.h == 0 || roi.end_col() >= LEPTON_WIDTH || roi.end_row() >= LEPTON_HEIGHT {
            log::warn!("ROI {:?} outside the sensor, ignored", roi);
            return;
        }
        let result = self
            .sensor
            .set_roi(&roi)
            .and_then(|()| self.sensor.roi(roi.kind));
        match result {
            Ok(applied) => {
                log::info!(
                    "{:?} ROI set to ({}, {})..({}, {})",
                    applied.kind,
                    applied.x,
                    applied.y,
                    applied.end_col(),
                    applied.end_row()
                );
                self.post(LeptonEvent::RoiResponse(applied));
            }
            Err(e) => log::warn!("Setting {:?} ROI failed: {}", roi.kind, e),
        }
    }

    fn pixel_temperature(&self, screen_x: u16, screen_y: u16) {
        let Some(last) = self.last.as_ref() else {
            log::debug!("Pixel temperature requested before the first frame");
            return;
        };
        let (x, y) = screen_to_frame(screen_x, screen_y, last.width, last.height);
        let index = usize::from(y) * usize::from(last.width) + usize::from(x);
        if let Some(&raw) = last.pixels.get(index) {
            self.post(LeptonEvent::PixelTemperature {
                x,
                y,
                temp_c: centikelvin_to_celsius(raw),
            });
        }
    }

    fn post(&self, event: LeptonEvent) {
        self.bus.post_or_warn(&Event::Lepton(event), RESPONSE_WAIT);
    }

    fn run(mut self) {
        self.watchdog.subscribe_current();
        if self.startup().is_ok() {
            let timeout = self.config.frame_timeout;
            while self.bits.get() & STOP_REQUEST == 0 {
                self.watchdog.feed();
                self.step(timeout);
            }
        }
        self.shutdown_sensor();
        self.watchdog.unsubscribe_current();
        log::info!("Capture task exiting");
    }

    pub fn start(self) -> Result<TaskHandle, TaskError> {
        let bits = Arc::clone(&self.bits);
        spawn_task("capture", STACK_CAPTURE, bits, move || self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::RawSpotmeter;
    use crate::encoder::Palette;
    use crate::events::RoiType;
    use crate::tasks::NoWatchdog;

    #[derive(Default)]
    struct FakeState {
        rois: Vec<Roi>,
        started: bool,
        fail_serial: bool,
    }

    struct FakeSensor {
        state: Arc<Mutex<FakeState>>,
        sink: Arc<Mutex<Option<FrameChannel<RawFrame>>>>,
    }

    impl ThermalSensor for FakeSensor {
        fn start_capture(&mut self, sink: FrameChannel<RawFrame>) -> Result<(), SensorError> {
            self.state.lock().started = true;
            *self.sink.lock() = Some(sink);
            Ok(())
        }
        fn stop_capture(&mut self) {
            self.state.lock().started = false;
            self.sink.lock().take();
        }
        fn part_number(&mut self) -> Result<String, SensorError> {
            Ok("500-0771-01".into())
        }
        fn serial_number(&mut self) -> Result<u64, SensorError> {
            if self.state.lock().fail_serial {
                return Err(SensorError::NotResponding);
            }
            Ok(0x0001_0002_0003_00AB)
        }
        fn set_roi(&mut self, roi: &Roi) -> Result<(), SensorError> {
            self.state.lock().rois.push(*roi);
            Ok(())
        }
        fn roi(&mut self, kind: RoiType) -> Result<Roi, SensorError> {
            self.state
                .lock()
                .rois
                .iter()
                .rev()
                .find(|r| r.kind == kind)
                .copied()
                .ok_or(SensorError::NotResponding)
        }
        fn fpa_temperature(&mut self) -> Result<u16, SensorError> {
            Ok(30_315)
        }
        fn aux_temperature(&mut self) -> Result<u16, SensorError> {
            Ok(29_815)
        }
        fn uptime_ms(&mut self) -> Result<u32, SensorError> {
            Ok(42_000)
        }
        fn spotmeter(&mut self) -> Result<RawSpotmeter, SensorError> {
            Ok(RawSpotmeter {
                min: 29_315,
                max: 31_315,
                avg: 30_315,
            })
        }
    }

    struct Fixture {
        task: CaptureTask,
        bus: EventBus,
        frames: FrameChannel<FrameDescriptor>,
        raw: Arc<Mutex<Option<FrameChannel<RawFrame>>>>,
        state: Arc<Mutex<FakeState>>,
        seen: Arc<Mutex<Vec<Event>>>,
    }

    fn fixture() -> Fixture {
        let bus = EventBus::new(32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(Some(EventBase::Lepton), move |e| sink.lock().push(e.clone()));

        let state = Arc::new(Mutex::new(FakeState::default()));
        let raw = Arc::new(Mutex::new(None));
        let sensor = FakeSensor {
            state: Arc::clone(&state),
            sink: Arc::clone(&raw),
        };
        let frames = FrameChannel::new();
        let task = CaptureTask::new(
            Box::new(sensor),
            frames.clone(),
            Arc::new(DoubleBuffer::new(RGB_FRAME_BYTES, Duration::from_millis(10))),
            bus.clone(),
            Arc::new(NoWatchdog),
            CaptureConfig::immediate(SharedPalette::new(Palette::Gray)),
        );
        Fixture {
            task,
            bus,
            frames,
            raw,
            state,
            seen,
        }
    }

    fn raw_frame(value: u16) -> RawFrame {
        let mut pixels = vec![value; LEPTON_WIDTH as usize * LEPTON_HEIGHT as usize];
        pixels[0] = value + 100;
        RawFrame {
            pixels,
            telemetry: Vec::new(),
            width: LEPTON_WIDTH,
            height: LEPTON_HEIGHT,
            bytes_per_pixel: 2,
        }
    }

    #[test]
    fn serial_is_grouped_hex() {
        assert_eq!(format_serial(0x0123_4567_89AB_CDEF), "0123-4567-89AB-CDEF");
    }

    #[test]
    fn screen_coordinates_scale_to_the_sensor() {
        assert_eq!(screen_to_frame(0, 0, 160, 120), (0, 0));
        assert_eq!(screen_to_frame(160, 120, 160, 120), (80, 60));
        assert_eq!(screen_to_frame(u16::MAX, u16::MAX, 160, 120), (159, 119));
    }

    #[test]
    fn startup_announces_camera_and_starts_streaming() {
        let mut f = fixture();
        f.task.startup().unwrap();
        f.bus.dispatch_pending();
        assert!(f.state.lock().started);
        assert_eq!(
            *f.seen.lock(),
            vec![Event::Lepton(LeptonEvent::CameraReady {
                part_number: "500-0771-01".into(),
                serial: "0001-0002-0003-00AB".into(),
            })]
        );
    }

    #[test]
    fn failed_startup_posts_camera_error() {
        let mut f = fixture();
        f.state.lock().fail_serial = true;
        assert!(f.task.startup().is_err());
        f.bus.dispatch_pending();
        assert!(!f.state.lock().started);
        assert_eq!(*f.seen.lock(), vec![Event::Lepton(LeptonEvent::CameraError)]);
    }

    #[test]
    fn raw_frame_becomes_a_descriptor() {
        let mut f = fixture();
        f.task.startup().unwrap();
        let raw = f.raw.lock().clone().unwrap();

        raw.publish(raw_frame(30_000));
        f.task.step(Duration::from_millis(10));

        let desc = f.frames.try_consume().expect("descriptor");
        assert_eq!((desc.width, desc.height, desc.channels), (160, 120, 3));
        assert_eq!((desc.min, desc.max, desc.seq), (30_000, 30_100, 1));
        assert_eq!(desc.slot, 1);
    }

    #[test]
    fn gui_requests_are_answered_between_frames() {
        let mut f = fixture();
        f.task.startup().unwrap();
        f.bus.dispatch_pending();
        f.seen.lock().clear();

        let roi = Roi {
            kind: RoiType::Spotmeter,
            x: 10,
            y: 20,
            w: 4,
            h: 4,
        };
        for request in [
            GuiEvent::SetRoi(roi),
            GuiEvent::GetTemperatures,
            GuiEvent::GetUptime,
            GuiEvent::GetSpotmeter,
        ] {
            f.bus.post(&Event::Gui(request), Wait::None).unwrap();
        }
        f.bus.dispatch_pending();
        f.task.step(Duration::ZERO);
        f.bus.dispatch_pending();

        let seen = f.seen.lock();
        assert!(seen.contains(&Event::Lepton(LeptonEvent::RoiResponse(roi))));
        assert!(seen.contains(&Event::Lepton(LeptonEvent::Uptime(42_000))));
        assert!(seen.iter().any(|e| matches!(
            e,
            Event::Lepton(LeptonEvent::Temperatures { fpa_c, aux_c })
                if (fpa_c - 30.0).abs() < 0.01 && (aux_c - 25.0).abs() < 0.01
        )));
        assert!(seen.iter().any(|e| matches!(
            e,
            Event::Lepton(LeptonEvent::Spotmeter(s)) if (s.max_c - 40.0).abs() < 0.01
        )));
    }

    #[test]
    fn out_of_range_roi_is_not_sent() {
        let mut f = fixture();
        let roi = Roi {
            kind: RoiType::Scene,
            x: 150,
            y: 0,
            w: 20,
            h: 10,
        };
        f.bus.post(&Event::Gui(GuiEvent::SetRoi(roi)), Wait::None).unwrap();
        f.bus.dispatch_pending();
        f.task.step(Duration::ZERO);
        assert!(f.state.lock().rois.is_empty());
    }

    #[test]
    fn pixel_temperature_uses_last_frame() {
        let mut f = fixture();
        f.task.startup().unwrap();
        let raw = f.raw.lock().clone().unwrap();
        raw.publish(raw_frame(29_315));
        f.task.step(Duration::from_millis(10));
        f.bus.dispatch_pending();
        f.seen.lock().clear();

        f.bus
            .post(
                &Event::Gui(GuiEvent::GetPixelTemperature {
                    screen_x: 0,
                    screen_y: 0,
                }),
                Wait::None,
            )
            .unwrap();
        f.bus.dispatch_pending();
        f.task.step(Duration::ZERO);
        f.bus.dispatch_pending();

        assert!(f.seen.lock().iter().any(|e| matches!(
            e,
            Event::Lepton(LeptonEvent::PixelTemperature { x: 0, y: 0, temp_c })
                if (temp_c - 21.0).abs() < 0.01
        )));
    }
}
