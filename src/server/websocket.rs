// PyroVision — WebSocket Hub & Broadcast Task
//
// Clients subscribe to the image stream and/or telemetry over `/ws`. The GUI
// only raises a 1-slot "frame ready" signal; the broadcast task wakes on it,
// encodes the NetworkFrame once per requested format and fans the bytes out
// to every due client.
// Sends happen outside the client-table lock. A client whose sends keep
// failing is dropped from the table.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::*;
use crate::encoder::{ImageEncoder, ImageFormat};
use crate::event_bus::{EventBus, Wait};
use crate::events::{Event, NetworkEvent};
use crate::frame_channel::FrameChannel;
use crate::network_frame::SharedNetworkFrame;
use crate::server::telemetry::TelemetryReport;
use crate::server::ServerStatus;
use crate::tasks::{spawn_task, EventBits, TaskError, TaskHandle, STOP_REQUEST};

const CONNECT_POST_WAIT: Wait = Wait::For(Duration::from_millis(EVENT_POST_TIMEOUT_MS));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsFrame<'a> {
    Binary(&'a [u8]),
    Text(&'a str),
    Ping,
    Pong(&'a [u8]),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("client {0} is gone")]
    Closed(i32),
    #[error("send failed: {0}")]
    Failed(String),
}

/// Outbound half of the WebSocket transport, addressed by socket fd.
pub trait WsSender: Send + Sync {
    fn send(&self, fd: i32, frame: WsFrame<'_>) -> Result<(), SendError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct WsClient {
    pub fd: i32,
    pub stream_enabled: bool,
    pub telemetry_enabled: bool,
    pub format: ImageFormat,
    pub fps: u8,
    pub telemetry_interval_ms: u32,
    last_frame_ms: Option<u64>,
    last_telemetry_ms: Option<u64>,
}

impl WsClient {
    fn new(fd: i32) -> Self {
        Self {
            fd,
            stream_enabled: false,
            telemetry_enabled: false,
            format: ImageFormat::Jpeg,
            fps: WS_DEFAULT_FPS,
            telemetry_interval_ms: WS_DEFAULT_TELEMETRY_MS,
            last_frame_ms: None,
            last_telemetry_ms: None,
        }
    }

    fn frame_due(&self, now: u64) -> bool {
        let period = 1000 / u64::from(self.fps.max(1));
        self.last_frame_ms.map_or(true, |t| now.saturating_sub(t) >= period)
    }

    fn telemetry_due(&self, now: u64) -> bool {
        let period = u64::from(self.telemetry_interval_ms);
        self.last_telemetry_ms.map_or(true, |t| now.saturating_sub(t) >= period)
    }
}

#[derive(Debug, Deserialize)]
struct Command {
    cmd: String,
    #[serde(default)]
    data: CommandData,
}

#[derive(Debug, Default, Deserialize)]
struct CommandData {
    fps: Option<u32>,
    interval: Option<u32>,
    format: Option<String>,
}

pub struct WsHub {
    clients: Mutex<Vec<WsClient>>,
    max_clients: usize,
    sender: Arc<dyn WsSender>,
    frame: SharedNetworkFrame,
    encoder: Mutex<ImageEncoder>,
    frame_ready: FrameChannel<()>,
    status: Arc<ServerStatus>,
    bus: EventBus,
    encodes: AtomicU32,
    send_retry: Duration,
}

impl WsHub {
    pub fn new(
        max_clients: usize,
        sender: Arc<dyn WsSender>,
        frame: SharedNetworkFrame,
        status: Arc<ServerStatus>,
        bus: EventBus,
    ) -> Self {
        Self {
            clients: Mutex::new(Vec::with_capacity(max_clients)),
            max_clients,
            sender,
            frame,
            encoder: Mutex::new(ImageEncoder::default()),
            frame_ready: FrameChannel::new(),
            status,
            bus,
            encodes: AtomicU32::new(0),
            send_retry: Duration::from_millis(WS_SEND_RETRY_MS),
        }
    }

    /// Shorter retry spacing, for tests.
    pub fn with_send_retry(mut self, delay: Duration) -> Self {
        self.send_retry = delay;
        self
    }

    pub fn set_jpeg_quality(&self, quality: u8) {
        self.encoder.lock().set_quality(quality);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn client(&self, fd: i32) -> Option<WsClient> {
        self.clients.lock().iter().find(|c| c.fd == fd).cloned()
    }

    /// Encode cycles performed so far.
    pub fn encodes(&self) -> u32 {
        self.encodes.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Register a new connection. Returns `false` when the table is full.
    pub fn on_connect(&self, fd: i32) -> bool {
        {
            let mut clients = self.clients.lock();
            if clients.iter().any(|c| c.fd == fd) {
                return true;
            }
            if clients.len() >= self.max_clients {
                log::warn!("WS: rejecting client {}, {} already connected", fd, clients.len());
                return false;
            }
            clients.push(WsClient::new(fd));
            self.status.ws_clients.store(clients.len() as u32, Ordering::Relaxed);
            log::info!("WS: client {} connected ({} total)", fd, clients.len());
        }
        self.bus.post_or_warn(
            &Event::Network(NetworkEvent::WsClientConnected { fd }),
            CONNECT_POST_WAIT,
        );
        true
    }

    pub fn on_disconnect(&self, fd: i32) {
        self.remove_client(fd);
    }

    /// Drop `fd` from the table. Only the call that finds it posts and
    /// decrements.
    fn remove_client(&self, fd: i32) -> bool {
        {
            let mut clients = self.clients.lock();
            let Some(pos) = clients.iter().position(|c| c.fd == fd) else {
                return false;
            };
            clients.remove(pos);
            self.status.ws_clients.store(clients.len() as u32, Ordering::Relaxed);
            log::info!("WS: client {} removed ({} left)", fd, clients.len());
        }
        self.bus.post_or_warn(
            &Event::Network(NetworkEvent::WsClientDisconnected { fd }),
            CONNECT_POST_WAIT,
        );
        true
    }

    /// Forget every client, e.g. when the server goes down. Each removal is
    /// announced like a regular disconnect.
    pub fn clear_clients(&self) -> usize {
        let removed: Vec<i32> = {
            let mut clients = self.clients.lock();
            let fds = clients.iter().map(|c| c.fd).collect();
            clients.clear();
            self.status.ws_clients.store(0, Ordering::Relaxed);
            fds
        };
        for &fd in &removed {
            self.bus.post_or_warn(
                &Event::Network(NetworkEvent::WsClientDisconnected { fd }),
                CONNECT_POST_WAIT,
            );
        }
        if !removed.is_empty() {
            log::info!("WS: dropped {} client(s)", removed.len());
        }
        removed.len()
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------
    pub fn handle_text(&self, fd: i32, text: &str) {
        let command: Command = match serde_json::from_str(text) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("WS: malformed command from {}: {}", fd, e);
                return;
            }
        };

        let reply = {
            let mut clients = self.clients.lock();
            let Some(client) = clients.iter_mut().find(|c| c.fd == fd) else {
                log::warn!("WS: command from unknown client {}", fd);
                return;
            };
            match command.cmd.as_str() {
                "start" => {
                    let fps = command
                        .data
                        .fps
                        .unwrap_or(u32::from(client.fps))
                        .clamp(u32::from(WS_MIN_FPS), u32::from(WS_MAX_FPS));
                    client.fps = fps as u8;
                    if let Some(name) = command.data.format.as_deref() {
                        match ImageFormat::from_query(name) {
                            Some(format) => client.format = format,
                            None => log::warn!("WS: client {} asked for format '{}'", fd, name),
                        }
                    }
                    client.stream_enabled = true;
                    client.last_frame_ms = None;
                    log::info!("WS: client {} streaming at {} fps", fd, fps);
                    json!({"cmd": "started", "data": {"status": "ok", "fps": fps}})
                }
                "stop" => {
                    client.stream_enabled = false;
                    json!({"cmd": "stopped", "data": {"status": "ok"}})
                }
                "subscribe" => {
                    let interval = command
                        .data
                        .interval
                        .unwrap_or(client.telemetry_interval_ms)
                        .max(WS_MIN_TELEMETRY_MS);
                    client.telemetry_interval_ms = interval;
                    client.telemetry_enabled = true;
                    client.last_telemetry_ms = None;
                    json!({"cmd": "subscribed", "data": {"status": "ok", "interval": interval}})
                }
                "unsubscribe" => {
                    client.telemetry_enabled = false;
                    json!({"cmd": "unsubscribed", "data": {"status": "ok"}})
                }
                other => {
                    log::warn!("WS: unknown command '{}' from {}", other, fd);
                    return;
                }
            }
        };

        let text = reply.to_string();
        if let Err(e) = self.sender.send(fd, WsFrame::Text(&text)) {
            log::warn!("WS: reply to {} failed: {}", fd, e);
        }
    }

    /// Answer a ping. One retry; a second failure drops the client.
    pub fn handle_ping(&self, fd: i32, payload: &[u8]) {
        if self.sender.send(fd, WsFrame::Pong(payload)).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(WS_PONG_RETRY_MS));
        if let Err(e) = self.sender.send(fd, WsFrame::Pong(payload)) {
            log::warn!("WS: pong to {} failed twice ({}), dropping client", fd, e);
            self.remove_client(fd);
        }
    }

    pub fn handle_close(&self, fd: i32) {
        log::debug!("WS: close frame from {}", fd);
        self.remove_client(fd);
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Called by the GUI after each NetworkFrame update. Skipped entirely
    /// while nobody is connected. Returns whether a signal was raised.
    pub fn notify_frame_ready(&self) -> bool {
        if self.client_count() == 0 {
            return false;
        }
        self.frame_ready.publish(());
        true
    }

    /// Wait up to `timeout` for a frame-ready signal and broadcast if one
    /// arrived. Any number of signals raised before the wake coalesce into a
    /// single encode.
    pub fn wait_and_broadcast(&self, timeout: Duration) -> usize {
        match self.frame_ready.consume_timeout(timeout) {
            Some(()) => self.broadcast_frame(),
            None => 0,
        }
    }

    /// Encode the current NetworkFrame once per format in use and send it to
    /// every due streaming client. Returns the number of clients that
    /// received it.
    pub fn broadcast_frame(&self) -> usize {
        let now = crate::now_ms();
        let targets: Vec<(i32, ImageFormat)> = self
            .clients
            .lock()
            .iter()
            .filter(|c| c.stream_enabled && c.frame_due(now))
            .map(|c| (c.fd, c.format))
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let mut formats: Vec<ImageFormat> = Vec::with_capacity(3);
        for (_, format) in &targets {
            if !formats.contains(format) {
                formats.push(*format);
            }
        }

        let encoder = *self.encoder.lock();
        let encoded = self.frame.read(Duration::from_millis(WS_FRAME_LOCK_MS), |f| {
            formats
                .iter()
                .map(|&format| (format, encoder.encode(&f.rgb, f.width, f.height, format)))
                .collect::<Vec<_>>()
        });
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                log::debug!("WS: skipping broadcast ({})", e);
                return 0;
            }
        };
        let mut frames: Vec<(ImageFormat, Vec<u8>)> = Vec::with_capacity(encoded.len());
        for (format, result) in encoded {
            match result {
                Ok(bytes) => {
                    self.encodes.fetch_add(1, Ordering::Relaxed);
                    frames.push((format, bytes));
                }
                Err(e) => log::warn!("WS: {:?} frame encode failed: {}", format, e),
            }
        }

        let mut sent = 0;
        for (fd, format) in targets {
            let Some((_, bytes)) = frames.iter().find(|(f, _)| *f == format) else {
                continue;
            };
            let ok = self.send_with_retry(fd, WsFrame::Binary(bytes.as_slice()));
            if ok {
                sent += 1;
                self.status.frames_streamed.fetch_add(1, Ordering::Relaxed);
                self.mark(fd, |c| c.last_frame_ms = Some(now));
            } else {
                log::warn!("WS: client {} unreachable after {} attempts", fd, WS_SEND_ATTEMPTS);
                self.remove_client(fd);
            }
            thread::sleep(Duration::from_millis(WS_SEND_PACE_MS));
        }
        sent
    }

    /// Send telemetry to every subscribed client whose interval elapsed.
    pub fn broadcast_telemetry(&self, report: &TelemetryReport) -> usize {
        let now = crate::now_ms();
        let targets: Vec<i32> = self
            .clients
            .lock()
            .iter()
            .filter(|c| c.telemetry_enabled && c.telemetry_due(now))
            .map(|c| c.fd)
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let text = json!({"cmd": "telemetry", "data": report}).to_string();
        let mut sent = 0;
        for fd in targets {
            match self.sender.send(fd, WsFrame::Text(&text)) {
                Ok(()) => {
                    sent += 1;
                    self.mark(fd, |c| c.last_telemetry_ms = Some(now));
                }
                Err(e) => log::warn!("WS: telemetry to {} failed: {}", fd, e),
            }
        }
        sent
    }

    pub fn ping_all(&self) {
        let fds: Vec<i32> = self.clients.lock().iter().map(|c| c.fd).collect();
        for fd in fds {
            if let Err(e) = self.sender.send(fd, WsFrame::Ping) {
                log::debug!("WS: ping to {} failed: {}", fd, e);
            }
        }
    }

    fn send_with_retry(&self, fd: i32, frame: WsFrame<'_>) -> bool {
        for attempt in 1..=WS_SEND_ATTEMPTS {
            match self.sender.send(fd, frame) {
                Ok(()) => return true,
                Err(SendError::Closed(_)) => return false,
                Err(e) => {
                    log::debug!("WS: send to {} failed (attempt {}): {}", fd, attempt, e);
                    if attempt < WS_SEND_ATTEMPTS {
                        thread::sleep(self.send_retry);
                    }
                }
            }
        }
        false
    }

    /// Update a client that may have left while we were sending.
    fn mark(&self, fd: i32, f: impl FnOnce(&mut WsClient)) {
        if let Some(client) = self.clients.lock().iter_mut().find(|c| c.fd == fd) {
            f(client);
        }
    }

    // -----------------------------------------------------------------------
    // Broadcast task
    // -----------------------------------------------------------------------

    /// Start the broadcast loop. `telemetry` builds the report sent to
    /// subscribers.
    pub fn start_task(
        self: &Arc<Self>,
        ping_interval: Duration,
        telemetry: impl Fn() -> TelemetryReport + Send + 'static,
    ) -> Result<TaskHandle, TaskError> {
        let bits = EventBits::new();
        let hub = Arc::clone(self);
        let loop_bits = Arc::clone(&bits);
        spawn_task("ws_broadcast", STACK_BROADCAST, bits, move || {
            let mut last_ping = crate::now_ms();
            loop {
                if loop_bits.take(STOP_REQUEST) != 0 {
                    break;
                }
                hub.wait_and_broadcast(Duration::from_millis(WS_SIGNAL_WAIT_MS));

                if hub.client_count() > 0 {
                    hub.broadcast_telemetry(&telemetry());
                }

                let now = crate::now_ms();
                if !ping_interval.is_zero() && now - last_ping >= ping_interval.as_millis() as u64 {
                    hub.ping_all();
                    last_ping = now;
                }
                thread::sleep(Duration::from_millis(WS_BROADCAST_YIELD_MS));
            }
            log::info!("WS: broadcast task exiting");
        })
    }

    /// Stop the broadcast loop, giving it `timeout` to exit.
    pub fn stop_task(handle: &mut TaskHandle, timeout: Duration) -> Result<(), TaskError> {
        let poll = Duration::from_millis(TASK_STOP_POLL_MS);
        let polls = (timeout.as_millis() / poll.as_millis()).max(1) as u32;
        handle.stop_with(polls, poll)
    }
}
