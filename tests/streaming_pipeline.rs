// Capture -> GUI -> NetworkFrame -> HTTP / WebSocket, wired the way `main`
// wires it, with the synthetic sensor and an in-memory socket table.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use pyrovision::config::*;
use pyrovision::double_buffer::DoubleBuffer;
use pyrovision::drivers::sim::SimThermalSensor;
use pyrovision::encoder::{Palette, SharedPalette};
use pyrovision::event_bus::{EventBus, Wait};
use pyrovision::events::{Event, NetworkEvent};
use pyrovision::frame_channel::FrameChannel;
use pyrovision::network_frame::SharedNetworkFrame;
use pyrovision::server::http::{HttpApi, HttpApiParts, Method, Request, ROUTE_IMAGE};
use pyrovision::server::telemetry::TelemetryCache;
use pyrovision::server::websocket::{SendError, WsFrame, WsHub, WsSender};
use pyrovision::server::{ServerConfig, ServerStatus};
use pyrovision::tasks::capture::{CaptureConfig, CaptureTask};
use pyrovision::tasks::gui::{CanvasView, GuiDeps, GuiTask};
use pyrovision::tasks::NoWatchdog;
use pyrovision::time::{SoftClock, TimeManager};

#[derive(Default)]
struct Sockets {
    binary: Mutex<Vec<(i32, Vec<u8>)>>,
    text: Mutex<Vec<(i32, String)>>,
    closed: Mutex<Vec<i32>>,
}

impl WsSender for Sockets {
    fn send(&self, fd: i32, frame: WsFrame<'_>) -> Result<(), SendError> {
        if self.closed.lock().contains(&fd) {
            return Err(SendError::Closed(fd));
        }
        match frame {
            WsFrame::Binary(b) => self.binary.lock().push((fd, b.to_vec())),
            WsFrame::Text(t) => self.text.lock().push((fd, t.to_owned())),
            WsFrame::Ping | WsFrame::Pong(_) => {}
        }
        Ok(())
    }
}

struct Get(String);

impl Request for Get {
    fn method(&self) -> Method {
        Method::Get
    }
    fn uri(&self) -> &str {
        &self.0
    }
    fn header(&self, _: &str) -> Option<&str> {
        None
    }
    fn read(&mut self, _: &mut [u8]) -> Result<usize, String> {
        Ok(0)
    }
}

struct Pipeline {
    bus: EventBus,
    capture: CaptureTask,
    gui: GuiTask,
    hub: Arc<WsHub>,
    api: HttpApi,
    sockets: Arc<Sockets>,
    buffer: Arc<DoubleBuffer>,
    seen: Arc<Mutex<Vec<Event>>>,
}

impl Pipeline {
    fn new() -> Self {
        let bus = EventBus::new(64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(None, move |e| sink.lock().push(e.clone()));

        let palette = SharedPalette::new(Palette::Iron);
        let buffer = Arc::new(DoubleBuffer::new(RGB_FRAME_BYTES, Duration::from_millis(10)));
        let frames = FrameChannel::new();
        let network_frame = SharedNetworkFrame::new();
        let status = Arc::new(ServerStatus::default());
        let sockets = Arc::new(Sockets::default());

        let hub = Arc::new(
            WsHub::new(
                2,
                Arc::clone(&sockets) as Arc<dyn WsSender>,
                network_frame.clone(),
                Arc::clone(&status),
                bus.clone(),
            )
            .with_send_retry(Duration::from_millis(1)),
        );
        let api = HttpApi::new(
            ServerConfig::default(),
            HttpApiParts {
                time: TimeManager::new(Box::new(SoftClock::default()), None, None, bus.clone()),
                frame: network_frame.clone(),
                palette: palette.clone(),
                telemetry: TelemetryCache::new(&bus, Arc::new(|| -60)),
                status,
                ota: None,
                bus: bus.clone(),
            },
        );
        let gui = GuiTask::new(GuiDeps {
            view: Box::new(CanvasView::new()),
            frames: frames.clone(),
            buffer: Arc::clone(&buffer),
            network_frame,
            hub: Some(Arc::clone(&hub)),
            bus: bus.clone(),
            watchdog: Arc::new(NoWatchdog),
        });
        let mut capture = CaptureTask::new(
            Box::new(SimThermalSensor::new().with_frame_interval(Duration::from_millis(5))),
            frames,
            Arc::clone(&buffer),
            bus.clone(),
            Arc::new(NoWatchdog),
            CaptureConfig::immediate(palette),
        );
        capture.startup().unwrap();

        Self {
            bus,
            capture,
            gui,
            hub,
            api,
            sockets,
            buffer,
            seen,
        }
    }

    fn server_started(&self) {
        self.bus
            .post(&Event::Network(NetworkEvent::ServerStarted), Wait::None)
            .unwrap();
        self.bus.dispatch_pending();
    }

    /// One captured frame through to the display (and network frame).
    fn frame(&mut self) -> bool {
        self.capture.step(Duration::from_millis(500));
        self.bus.dispatch_pending();
        self.gui.step(Instant::now())
    }

    fn stream(&self, fd: i32, fps: u8) {
        assert!(self.hub.on_connect(fd));
        self.hub
            .handle_text(fd, &format!(r#"{{"cmd":"start","data":{{"fps":{}}}}}"#, fps));
    }

    fn frames_to(&self, fd: i32) -> Vec<Vec<u8>> {
        self.sockets
            .binary
            .lock()
            .iter()
            .filter(|(f, _)| *f == fd)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFF, 0xD8]) && bytes.ends_with(&[0xFF, 0xD9])
}

#[test]
fn nothing_is_streamed_before_the_server_is_up() {
    let mut p = Pipeline::new();
    p.stream(3, 10);

    assert!(p.frame());
    assert_eq!(p.hub.wait_and_broadcast(Duration::from_millis(20)), 0);
    assert!(p.frames_to(3).is_empty());

    let response = p.api.route(&mut Get(ROUTE_IMAGE.into()));
    assert_eq!(response.status, 503);
}

#[test]
fn captured_frame_reaches_websocket_and_http() {
    let mut p = Pipeline::new();
    p.server_started();
    p.stream(3, 10);

    assert!(p.frame());
    assert_eq!(p.hub.wait_and_broadcast(Duration::from_millis(100)), 1);
    let frames = p.frames_to(3);
    assert_eq!(frames.len(), 1);
    assert!(is_jpeg(&frames[0]));
    assert_eq!(p.hub.encodes(), 1);

    let response = p.api.route(&mut Get(format!("{}?format=png", ROUTE_IMAGE)));
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type, "image/png");
    assert!(response.body.starts_with(&[0x89, b'P', b'N', b'G']));
}

#[test]
fn client_frame_rate_limits_delivery() {
    let mut p = Pipeline::new();
    p.server_started();
    p.stream(3, 1);

    assert!(p.frame());
    assert_eq!(p.hub.wait_and_broadcast(Duration::from_millis(100)), 1);

    // A second frame well inside the 1 s period is not sent, and nothing is
    // encoded for nobody.
    assert!(p.frame());
    assert_eq!(p.hub.wait_and_broadcast(Duration::from_millis(100)), 0);
    assert_eq!(p.frames_to(3).len(), 1);
    assert_eq!(p.hub.encodes(), 1);
}

#[test]
fn several_frames_between_wakes_cost_one_encode() {
    let mut p = Pipeline::new();
    p.server_started();
    p.stream(3, 30);
    p.stream(4, 30);

    for _ in 0..3 {
        assert!(p.frame());
    }
    assert_eq!(p.hub.wait_and_broadcast(Duration::from_millis(100)), 2);
    assert_eq!(p.hub.wait_and_broadcast(Duration::from_millis(10)), 0);
    assert_eq!(p.hub.encodes(), 1);
    assert_eq!(p.frames_to(3), p.frames_to(4));
}

#[test]
fn vanished_client_is_dropped_once_and_others_keep_streaming() {
    let mut p = Pipeline::new();
    p.server_started();
    p.stream(3, 30);
    p.stream(4, 30);
    p.sockets.closed.lock().push(4);

    assert!(p.frame());
    assert_eq!(p.hub.wait_and_broadcast(Duration::from_millis(100)), 1);
    // The transport's own close notification arrives late.
    p.hub.on_disconnect(4);
    p.bus.dispatch_pending();

    assert_eq!(p.hub.client_count(), 1);
    let drops = p
        .seen
        .lock()
        .iter()
        .filter(|e| matches!(e, Event::Network(NetworkEvent::WsClientDisconnected { fd: 4 })))
        .count();
    assert_eq!(drops, 1);
    assert_eq!(p.frames_to(3).len(), 1);
}

#[test]
fn palette_query_recolours_the_next_capture() {
    let mut p = Pipeline::new();
    p.server_started();

    assert!(p.frame());
    let response = p.api.route(&mut Get(format!("{}?palette=gray", ROUTE_IMAGE)));
    assert_eq!(response.status, 200);

    assert!(p.frame());
    let (_, grey) = p
        .buffer
        .read_current(Duration::from_millis(10), |rgb| {
            rgb.chunks_exact(3).all(|px| px[0] == px[1] && px[1] == px[2])
        })
        .unwrap();
    assert!(grey);
}
