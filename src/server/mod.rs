// PyroVision — HTTP/WebSocket Server Lifecycle
//
// The network task starts the server once an IP is available and stops it
// on teardown. Starting means: bring up the transport (httpd), then the
// WebSocket broadcast task. A failure in the second step tears down the
// first. The SCPI listener, when configured, follows the same lifecycle but
// a failure there leaves HTTP running.

pub mod http;
pub mod telemetry;
pub mod visa;
pub mod websocket;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::*;
use crate::settings::HttpServerSettings;
use crate::tasks::{TaskError, TaskHandle};
use self::http::HttpApi;
use self::telemetry::TelemetryCache;
use self::visa::VisaServer;
use self::websocket::{SendError, WsFrame, WsHub, WsSender};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server transport failed: {0}")]
    Transport(String),
    #[error(transparent)]
    Task(#[from] TaskError),
}

#[derive(Debug, Default)]
pub struct ServerStatus {
    pub running: AtomicBool,
    pub ws_clients: AtomicU32,
    pub requests_served: AtomicU32,
    pub frames_streamed: AtomicU32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub max_clients: u8,
    pub ws_ping_interval_s: u16,
    pub enable_cors: bool,
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: HTTP_DEFAULT_PORT,
            max_clients: HTTP_DEFAULT_MAX_CLIENTS,
            ws_ping_interval_s: WS_DEFAULT_PING_INTERVAL_S,
            enable_cors: true,
            api_key: None,
        }
    }
}

impl From<&HttpServerSettings> for ServerConfig {
    fn from(s: &HttpServerSettings) -> Self {
        Self {
            port: s.port,
            max_clients: s.max_clients,
            ws_ping_interval_s: s.ws_ping_interval_s,
            enable_cors: s.enable_cors,
            api_key: s.api_key.clone().filter(|k| !k.is_empty()),
        }
    }
}

/// What the network task needs from the server.
pub trait ServerControl: Send {
    fn start(&mut self) -> Result<(), ServerError>;
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

/// Socket side of the server: binds the port and routes requests and
/// WebSocket frames into `HttpApi` / `WsHub`.
pub trait HttpTransport: Send {
    fn start(&mut self, api: Arc<HttpApi>, hub: Arc<WsHub>) -> Result<(), ServerError>;
    fn stop(&mut self);
}

/// Transport that binds nothing. Host runs use it so the broadcast side can
/// still be driven in-process.
pub struct NullTransport;

impl HttpTransport for NullTransport {
    fn start(&mut self, api: Arc<HttpApi>, _hub: Arc<WsHub>) -> Result<(), ServerError> {
        log::info!("HTTP: no transport, port {} not bound", api.config().port);
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Sender for `NullTransport`: no socket ever exists.
pub struct NullSender;

impl WsSender for NullSender {
    fn send(&self, fd: i32, _frame: WsFrame<'_>) -> Result<(), SendError> {
        Err(SendError::Closed(fd))
    }
}

pub struct Server<T: HttpTransport> {
    transport: T,
    api: Arc<HttpApi>,
    hub: Arc<WsHub>,
    telemetry: Arc<TelemetryCache>,
    status: Arc<ServerStatus>,
    broadcast: Option<TaskHandle>,
    visa: Option<VisaServer>,
}

impl<T: HttpTransport> Server<T> {
    pub fn new(
        transport: T,
        api: Arc<HttpApi>,
        hub: Arc<WsHub>,
        telemetry: Arc<TelemetryCache>,
        status: Arc<ServerStatus>,
    ) -> Self {
        Self {
            transport,
            api,
            hub,
            telemetry,
            status,
            broadcast: None,
            visa: None,
        }
    }

    pub fn with_visa(mut self, visa: VisaServer) -> Self {
        self.visa = Some(visa);
        self
    }

    pub fn hub(&self) -> &Arc<WsHub> {
        &self.hub
    }

    pub fn visa(&self) -> Option<&VisaServer> {
        self.visa.as_ref()
    }
}

impl<T: HttpTransport> ServerControl for Server<T> {
    fn start(&mut self) -> Result<(), ServerError> {
        if self.is_running() {
            log::warn!("HTTP server already running");
            return Ok(());
        }

        self.transport
            .start(Arc::clone(&self.api), Arc::clone(&self.hub))?;

        let ping = Duration::from_secs(u64::from(self.api.config().ws_ping_interval_s));
        let telemetry = Arc::clone(&self.telemetry);
        let status = Arc::clone(&self.status);
        match self.hub.start_task(ping, move || telemetry.report(&status)) {
            Ok(handle) => self.broadcast = Some(handle),
            Err(e) => {
                log::error!("Failed to start WS broadcast task: {}", e);
                self.transport.stop();
                return Err(e.into());
            }
        }

        if let Some(visa) = self.visa.as_mut() {
            if let Err(e) = visa.start() {
                log::error!("VISA server failed to start: {}", e);
            }
        }

        self.status.running.store(true, Ordering::SeqCst);
        log::info!("HTTP server started on port {}", self.api.config().port);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut handle) = self.broadcast.take() {
            if let Err(e) = WsHub::stop_task(&mut handle, Duration::from_secs(1)) {
                log::warn!("{}", e);
            }
        }
        if let Some(visa) = self.visa.as_mut() {
            visa.stop();
        }
        if self.status.running.swap(false, Ordering::SeqCst) {
            self.transport.stop();
            self.hub.clear_clients();
            log::info!("HTTP server stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.status.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::SharedPalette;
    use crate::event_bus::EventBus;
    use crate::events::{Event, NetworkEvent};
    use crate::network_frame::SharedNetworkFrame;
    use crate::server::http::HttpApiParts;
    use crate::server::visa::{Identity, VisaContext};
    use crate::settings::InfoSettings;
    use crate::tasks::NoWatchdog;
    use crate::time::{SoftClock, TimeManager};
    use parking_lot::Mutex;

    struct Accepting;

    impl WsSender for Accepting {
        fn send(&self, _fd: i32, _frame: WsFrame<'_>) -> Result<(), SendError> {
            Ok(())
        }
    }

    fn server(bus: &EventBus) -> Server<NullTransport> {
        let status = Arc::new(ServerStatus::default());
        let frame = SharedNetworkFrame::new();
        let telemetry = TelemetryCache::new(bus, Arc::new(|| 0));
        let hub = Arc::new(WsHub::new(
            4,
            Arc::new(Accepting),
            frame.clone(),
            Arc::clone(&status),
            bus.clone(),
        ));
        let api = Arc::new(HttpApi::new(
            ServerConfig::default(),
            HttpApiParts {
                time: TimeManager::new(Box::new(SoftClock::default()), None, None, bus.clone()),
                frame,
                palette: SharedPalette::default(),
                telemetry: Arc::clone(&telemetry),
                status: Arc::clone(&status),
                ota: None,
                bus: bus.clone(),
            },
        ));
        Server::new(NullTransport, api, hub, telemetry, status)
    }

    #[test]
    fn stop_forgets_websocket_clients() {
        let bus = EventBus::new(32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(None, move |e| sink.lock().push(e.clone()));

        let mut server = server(&bus);
        server.start().unwrap();
        assert!(server.is_running());
        server.hub().on_connect(5);
        server.hub().handle_text(5, r#"{"cmd":"start","data":{"fps":3}}"#);

        server.stop();
        assert!(!server.is_running());
        assert_eq!(server.hub().client_count(), 0);
        bus.dispatch_pending();
        assert!(seen
            .lock()
            .contains(&Event::Network(NetworkEvent::WsClientDisconnected { fd: 5 })));

        server.start().unwrap();
        assert!(server.hub().on_connect(5));
        assert!(!server.hub().client(5).unwrap().stream_enabled);
        server.stop();
    }

    #[test]
    fn visa_listener_follows_the_http_lifecycle() {
        let bus = EventBus::new(32);
        let visa = VisaServer::new(
            VisaContext {
                identity: Identity::from(&InfoSettings::default()),
                frame: SharedNetworkFrame::new(),
                palette: SharedPalette::default(),
                telemetry: TelemetryCache::new(&bus, Arc::new(|| 0)),
            },
            0,
            &bus,
            Arc::new(NoWatchdog),
        );
        let mut server = server(&bus).with_visa(visa);
        assert!(!server.visa().unwrap().is_running());

        server.start().unwrap();
        assert!(server.visa().unwrap().is_running());
        assert!(server.visa().unwrap().local_addr().is_some());

        server.stop();
        assert!(!server.visa().unwrap().is_running());
    }
}
