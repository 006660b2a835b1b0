// PyroVision — GUI Task
//
// Consumes frame descriptors from the capture task, shows the referenced
// DoubleBuffer slot and, while the HTTP server runs, republishes the frame
// into the NetworkFrame and pokes the WebSocket broadcast task.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use embedded_graphics::mono_font::ascii::FONT_6X10;
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};
use embedded_graphics::text::{Baseline, Text};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::*;
use crate::double_buffer::DoubleBuffer;
use crate::event_bus::{EventBus, Subscription, Wait};
use crate::events::{DevicesEvent, Event, GuiEvent, LeptonEvent, NetworkEvent, NetworkState, Roi, Spotmeter};
use crate::frame_channel::{FrameChannel, FrameDescriptor};
use crate::network_frame::SharedNetworkFrame;
use crate::server::websocket::WsHub;
use crate::tasks::{spawn_task, EventBits, TaskError, TaskHandle, Watchdog, STOP_REQUEST};

const STATUS_BAR_HEIGHT: u32 = 12;

const GUI_POST_WAIT: Wait = Wait::For(Duration::from_millis(EVENT_POST_TIMEOUT_MS));

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("frame {width}x{height} does not match {len} bytes")]
    Size { width: u16, height: u16, len: usize },
    #[error("display write failed: {0}")]
    Write(String),
}

/// What the status line shows next to the image.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Overlay {
    pub network: NetworkState,
    pub spot: Spotmeter,
    pub battery: Option<u8>,
}

/// Presents one RGB888 frame plus the overlay and invalidates the screen.
pub trait FrameView: Send {
    fn present(&mut self, rgb: &[u8], width: u16, height: u16, overlay: &Overlay) -> Result<(), DisplayError>;
}

// ---------------------------------------------------------------------------
// embedded-graphics canvas
// ---------------------------------------------------------------------------

/// RGB888 framebuffer the size of the panel.
pub struct RgbCanvas {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl RgbCanvas {
    pub fn new(width: u16, height: u16) -> Self {
        let (width, height) = (u32::from(width), u32::from(height));
        Self {
            data: vec![0; width as usize * height as usize * 3],
            width,
            height,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb888> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y * self.width + x) as usize * 3;
        Some(Rgb888::new(self.data[i], self.data[i + 1], self.data[i + 2]))
    }
}

impl OriginDimensions for RgbCanvas {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for RgbCanvas {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            let (Ok(x), Ok(y)) = (u32::try_from(point.x), u32::try_from(point.y)) else {
                continue;
            };
            if x < self.width && y < self.height {
                let i = (y * self.width + x) as usize * 3;
                self.data[i..i + 3].copy_from_slice(&[color.r(), color.g(), color.b()]);
            }
        }
        Ok(())
    }
}

fn state_label(state: NetworkState) -> &'static str {
    match state {
        NetworkState::Idle => "OFFLINE",
        NetworkState::Connecting => "CONNECTING",
        NetworkState::Connected => "ONLINE",
        NetworkState::Disconnected => "DISCONNECTED",
        NetworkState::Provisioning => "SETUP",
        NetworkState::ApStarted => "AP",
        NetworkState::Error => "WIFI ERROR",
    }
}

/// `FrameView` drawing into an `RgbCanvas`: the thermal image scaled to the
/// panel and a status bar along the bottom edge.
pub struct CanvasView {
    canvas: RgbCanvas,
    presented: u32,
}

impl CanvasView {
    pub fn new() -> Self {
        Self {
            canvas: RgbCanvas::new(DISPLAY_WIDTH, DISPLAY_HEIGHT),
            presented: 0,
        }
    }

    pub fn canvas(&self) -> &RgbCanvas {
        &self.canvas
    }

    pub fn presented(&self) -> u32 {
        self.presented
    }

    fn draw_status(&mut self, overlay: &Overlay) {
        let size = self.canvas.size();
        let top = size.height.saturating_sub(STATUS_BAR_HEIGHT) as i32;
        Rectangle::new(Point::new(0, top), Size::new(size.width, STATUS_BAR_HEIGHT))
            .into_styled(PrimitiveStyle::with_fill(Rgb888::BLACK))
            .draw(&mut self.canvas)
            .ok();

        let mut line = format!(
            "{:.1}C  {}",
            overlay.spot.avg_c,
            state_label(overlay.network)
        );
        if let Some(battery) = overlay.battery {
            line.push_str(&format!("  {}%", battery));
        }
        let style = MonoTextStyle::new(&FONT_6X10, Rgb888::WHITE);
        Text::with_baseline(&line, Point::new(2, top + 1), style, Baseline::Top)
            .draw(&mut self.canvas)
            .ok();
    }
}

impl Default for CanvasView {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameView for CanvasView {
    fn present(&mut self, rgb: &[u8], width: u16, height: u16, overlay: &Overlay) -> Result<(), DisplayError> {
        let (w, h) = (u32::from(width), u32::from(height));
        if w == 0 || h == 0 || rgb.len() < (w * h * 3) as usize {
            return Err(DisplayError::Size {
                width,
                height,
                len: rgb.len(),
            });
        }

        // Nearest-neighbour scale onto the panel.
        let size = self.canvas.size();
        let pixels = (0..size.height).flat_map(|y| {
            (0..size.width).map(move |x| {
                let sx = x * w / size.width;
                let sy = y * h / size.height;
                let i = ((sy * w + sx) * 3) as usize;
                Pixel(
                    Point::new(x as i32, y as i32),
                    Rgb888::new(rgb[i], rgb[i + 1], rgb[i + 2]),
                )
            })
        });
        self.canvas.draw_iter(pixels).ok();
        self.draw_status(overlay);
        self.presented = self.presented.wrapping_add(1);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Touch forwarding
// ---------------------------------------------------------------------------

/// Hand a touch-edited ROI to the capture task.
pub fn forward_roi_edit(bus: &EventBus, roi: Roi) {
    bus.post_or_warn(&Event::Gui(GuiEvent::SetRoi(roi)), GUI_POST_WAIT);
}

pub fn request_pixel_temperature(bus: &EventBus, screen_x: u16, screen_y: u16) {
    bus.post_or_warn(
        &Event::Gui(GuiEvent::GetPixelTemperature { screen_x, screen_y }),
        GUI_POST_WAIT,
    );
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub struct GuiDeps {
    pub view: Box<dyn FrameView>,
    pub frames: FrameChannel<FrameDescriptor>,
    pub buffer: Arc<DoubleBuffer>,
    pub network_frame: SharedNetworkFrame,
    pub hub: Option<Arc<WsHub>>,
    pub bus: EventBus,
    pub watchdog: Arc<dyn Watchdog>,
}

#[derive(Debug, Default)]
struct Cached {
    overlay: Overlay,
    /// Last server start/stop seen since the previous cycle.
    server: Option<bool>,
    fpa_c: f32,
    aux_c: f32,
}

pub struct GuiTask {
    view: Box<dyn FrameView>,
    frames: FrameChannel<FrameDescriptor>,
    buffer: Arc<DoubleBuffer>,
    network_frame: SharedNetworkFrame,
    hub: Option<Arc<WsHub>>,
    bus: EventBus,
    watchdog: Arc<dyn Watchdog>,
    bits: Arc<EventBits>,
    cached: Arc<Mutex<Cached>>,
    server_running: bool,
    next_sensor_poll: Option<Instant>,
    _subscription: Subscription,
}

impl GuiTask {
    pub fn new(deps: GuiDeps) -> Self {
        let bits = EventBits::new();
        let cached = Arc::new(Mutex::new(Cached::default()));

        let subscription = {
            let cached = Arc::clone(&cached);
            deps.bus.subscribe_scoped(None, move |event| match event {
                Event::Network(NetworkEvent::ServerStarted) => cached.lock().server = Some(true),
                Event::Network(NetworkEvent::ServerStopped | NetworkEvent::ServerError) => {
                    cached.lock().server = Some(false)
                }
                Event::Network(NetworkEvent::StateChanged(state)) => {
                    cached.lock().overlay.network = *state
                }
                Event::Lepton(LeptonEvent::Spotmeter(spot)) => cached.lock().overlay.spot = *spot,
                Event::Lepton(LeptonEvent::Temperatures { fpa_c, aux_c }) => {
                    let mut c = cached.lock();
                    c.fpa_c = *fpa_c;
                    c.aux_c = *aux_c;
                }
                Event::Devices(DevicesEvent::Battery { percentage, .. }) => {
                    cached.lock().overlay.battery = Some(*percentage)
                }
                _ => {}
            })
        };

        Self {
            view: deps.view,
            frames: deps.frames,
            buffer: deps.buffer,
            network_frame: deps.network_frame,
            hub: deps.hub,
            bus: deps.bus,
            watchdog: deps.watchdog,
            bits,
            cached,
            server_running: false,
            next_sensor_poll: None,
            _subscription: subscription,
        }
    }

    pub fn server_running(&self) -> bool {
        self.server_running
    }

    /// Housing and FPA temperature from the last sensor poll, °C.
    pub fn sensor_temperatures(&self) -> (f32, f32) {
        let c = self.cached.lock();
        (c.fpa_c, c.aux_c)
    }

    /// One render cycle. Returns `true` when a frame was shown.
    pub fn step(&mut self, now: Instant) -> bool {
        let server = self.cached.lock().server.take();
        match server {
            Some(true) if !self.server_running => {
                log::info!("Server up, streaming frames to the network");
                self.server_running = true;
            }
            Some(false) if self.server_running => {
                log::info!("Server down, network streaming paused");
                self.server_running = false;
            }
            _ => {}
        }

        if self.next_sensor_poll.map_or(true, |due| now >= due) {
            self.next_sensor_poll = Some(now + Duration::from_millis(GUI_SENSOR_POLL_MS));
            self.bus
                .post_or_warn(&Event::Gui(GuiEvent::GetSpotmeter), GUI_POST_WAIT);
            self.bus
                .post_or_warn(&Event::Gui(GuiEvent::GetTemperatures), GUI_POST_WAIT);
        }

        let Some(desc) = self.frames.try_consume() else {
            return false;
        };
        self.render(desc)
    }

    fn render(&mut self, desc: FrameDescriptor) -> bool {
        let overlay = self.cached.lock().overlay;
        let len = usize::from(desc.width) * usize::from(desc.height) * usize::from(desc.channels);
        let lock_timeout = Duration::from_millis(DOUBLE_BUFFER_LOCK_MS);

        let view = &mut self.view;
        let network_frame = &self.network_frame;
        let server_running = self.server_running;
        let result = self.buffer.read(desc.slot, lock_timeout, |slot| {
            let Some(rgb) = slot.get(..len) else {
                return Err(DisplayError::Size {
                    width: desc.width,
                    height: desc.height,
                    len: slot.len(),
                });
            };
            view.present(rgb, desc.width, desc.height, &overlay)?;
            let published = server_running
                && network_frame.try_update(rgb, desc.width, desc.height, overlay.spot, crate::now_ms());
            Ok(published)
        });

        match result {
            Some(Ok(published)) => {
                if published {
                    if let Some(hub) = self.hub.as_ref() {
                        hub.notify_frame_ready();
                    }
                }
                true
            }
            Some(Err(e)) => {
                log::warn!("Frame {} not shown: {}", desc.seq, e);
                false
            }
            None => {
                log::debug!("Buffer slot {} busy, frame {} skipped", desc.slot, desc.seq);
                false
            }
        }
    }

    fn run(mut self) {
        self.watchdog.subscribe_current();
        let period = Duration::from_millis(GUI_LOOP_MS);
        loop {
            self.watchdog.feed();
            self.step(Instant::now());
            if self.bits.wait_any(STOP_REQUEST, period) & STOP_REQUEST != 0 {
                break;
            }
        }
        self.watchdog.unsubscribe_current();
        log::info!("GUI task exiting");
    }

    pub fn start(self) -> Result<TaskHandle, TaskError> {
        let bits = Arc::clone(&self.bits);
        spawn_task("gui", STACK_GUI, bits, move || self.run())
    }
}
