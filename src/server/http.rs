// PyroVision — HTTP REST API
//
// Route bodies for the `/api/v1` surface. The transport (esp-idf httpd on the
// device, plain structs in tests) adapts its request type to `Request` and
// writes the returned `Response` back.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::*;
use crate::drivers::OtaWriter;
use crate::encoder::{ImageEncoder, ImageFormat, Palette, SharedPalette};
use crate::event_bus::{EventBus, Wait};
use crate::events::{Event, NetworkEvent};
use crate::network_frame::{FrameReadError, SharedNetworkFrame};
use crate::server::telemetry::TelemetryCache;
use crate::server::{ServerConfig, ServerStatus};
use crate::time::TimeManager;

const HTTP_POST_WAIT: Wait = Wait::For(Duration::from_millis(100));
/// Progress events are posted once per this many bytes.
const OTA_PROGRESS_STEP: usize = 64 * 1024;

pub const ROUTE_TIME: &str = "/api/v1/time";
pub const ROUTE_IMAGE: &str = "/api/v1/image";
pub const ROUTE_TELEMETRY: &str = "/api/v1/telemetry";
pub const ROUTE_UPDATE: &str = "/api/v1/update";
pub const ROUTE_WS: &str = "/ws";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Options,
}

pub trait Request {
    fn method(&self) -> Method;
    /// Path including any query string.
    fn uri(&self) -> &str;
    fn header(&self, name: &str) -> Option<&str>;
    /// Read the next body bytes; 0 at end of body.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

const JSON: &str = "application/json; charset=utf-8";

impl Response {
    pub fn json<T: Serialize>(status: u16, payload: &T) -> Self {
        match serde_json::to_vec(payload) {
            Ok(body) => Self {
                status,
                content_type: JSON,
                headers: Vec::new(),
                body,
            },
            Err(e) => Self::error(500, &format!("Serialization failed: {}", e)),
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: JSON,
            headers: Vec::new(),
            body: json!({"error": message, "code": status}).to_string().into_bytes(),
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

pub fn query_param<'a>(uri: &'a str, key: &str) -> Option<&'a str> {
    let query = uri.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        (name == key).then_some(value)
    })
}

fn read_body(req: &mut dyn Request, limit: usize) -> Result<Vec<u8>, Response> {
    let mut body = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = req
            .read(&mut chunk)
            .map_err(|e| Response::error(400, &format!("Failed to read body: {}", e)))?;
        if n == 0 {
            return Ok(body);
        }
        if body.len() + n > limit {
            return Err(Response::error(400, "Request body too large"));
        }
        body.extend_from_slice(&chunk[..n]);
    }
}

#[derive(Debug, Deserialize)]
struct TimeRequest {
    epoch: Option<i64>,
    timezone: Option<String>,
}

pub struct HttpApi {
    config: ServerConfig,
    time: TimeManager,
    frame: SharedNetworkFrame,
    palette: SharedPalette,
    encoder: ImageEncoder,
    telemetry: Arc<TelemetryCache>,
    status: Arc<ServerStatus>,
    ota: Option<Arc<dyn OtaWriter>>,
    bus: EventBus,
}

pub struct HttpApiParts {
    pub time: TimeManager,
    pub frame: SharedNetworkFrame,
    pub palette: SharedPalette,
    pub telemetry: Arc<TelemetryCache>,
    pub status: Arc<ServerStatus>,
    pub ota: Option<Arc<dyn OtaWriter>>,
    pub bus: EventBus,
}

impl HttpApi {
    pub fn new(config: ServerConfig, parts: HttpApiParts) -> Self {
        Self {
            config,
            time: parts.time,
            frame: parts.frame,
            palette: parts.palette,
            encoder: ImageEncoder::default(),
            telemetry: parts.telemetry,
            status: parts.status,
            ota: parts.ota,
            bus: parts.bus,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn route(&self, req: &mut dyn Request) -> Response {
        self.status.requests_served.fetch_add(1, Ordering::Relaxed);
        let path = req.uri().split('?').next().unwrap_or_default().to_owned();
        let method = req.method();

        let mut response = if method == Method::Options {
            self.preflight()
        } else if let Err(denied) = self.authorize(req) {
            denied
        } else {
            match (method, path.as_str()) {
                (Method::Post, ROUTE_TIME) => self.handle_time(req),
                (Method::Get, ROUTE_IMAGE) => self.handle_image(req.uri()),
                (Method::Get, ROUTE_TELEMETRY) => self.handle_telemetry(),
                (Method::Post, ROUTE_UPDATE) => self.handle_update(req),
                (_, ROUTE_TIME | ROUTE_IMAGE | ROUTE_TELEMETRY | ROUTE_UPDATE) => {
                    Response::error(405, "Method not allowed")
                }
                _ => Response::error(404, "Not found"),
            }
        };

        if self.config.enable_cors {
            response
                .headers
                .push(("Access-Control-Allow-Origin", "*".into()));
        }
        log::debug!("HTTP {:?} {} -> {}", method, path, response.status);
        response
    }

    fn authorize(&self, req: &dyn Request) -> Result<(), Response> {
        let Some(expected) = self.config.api_key.as_deref() else {
            return Ok(());
        };
        if req.header("X-API-Key") == Some(expected) {
            Ok(())
        } else {
            log::warn!("HTTP: rejected request with bad API key");
            Err(Response::error(401, "Unauthorized"))
        }
    }

    fn preflight(&self) -> Response {
        if !self.config.enable_cors {
            return Response::error(405, "Method not allowed");
        }
        let mut response = Response::empty(204);
        response
            .headers
            .push(("Access-Control-Allow-Methods", "GET, POST, OPTIONS".into()));
        response
            .headers
            .push(("Access-Control-Allow-Headers", "Content-Type, X-API-Key".into()));
        response
            .headers
            .push(("Access-Control-Max-Age", "3600".into()));
        response
    }

    fn handle_time(&self, req: &mut dyn Request) -> Response {
        let body = match read_body(req, HTTP_MAX_JSON_BODY) {
            Ok(b) => b,
            Err(r) => return r,
        };
        let parsed: TimeRequest = match serde_json::from_slice(&body) {
            Ok(t) => t,
            Err(_) => return Response::error(400, "Invalid JSON"),
        };
        let Some(epoch) = parsed.epoch else {
            return Response::error(400, "Missing epoch field");
        };
        if let Err(e) = self.time.set_epoch(epoch) {
            return Response::error(400, &e.to_string());
        }
        if let Some(tz) = parsed.timezone.filter(|tz| !tz.is_empty()) {
            self.bus
                .post_or_warn(&Event::Network(NetworkEvent::SetTimezone(tz)), HTTP_POST_WAIT);
        }
        Response::json(200, &json!({"status": "ok"}))
    }

    fn handle_image(&self, uri: &str) -> Response {
        let format = match query_param(uri, "format") {
            None => ImageFormat::Jpeg,
            Some(f) => match ImageFormat::from_query(f) {
                Some(f) => f,
                None => return Response::error(400, "Invalid format"),
            },
        };
        if let Some(p) = query_param(uri, "palette") {
            match Palette::from_query(p) {
                Some(p) => self.palette.set(p),
                None => return Response::error(400, "Invalid palette"),
            }
        }

        let timeout = Duration::from_millis(NETWORK_FRAME_READ_MS);
        let encoded = self
            .frame
            .read(timeout, |f| self.encoder.encode(&f.rgb, f.width, f.height, format));

        match encoded {
            Ok(Ok(body)) => Response {
                status: 200,
                content_type: format.content_type(),
                headers: vec![("Cache-Control", "no-cache".into())],
                body,
            },
            Ok(Err(e)) => {
                log::error!("HTTP: image encode failed: {}", e);
                Response::error(500, "Encoding failed")
            }
            Err(FrameReadError::NoData) => Response::error(503, "No thermal data available"),
            Err(FrameReadError::Busy) => Response::error(503, "Frame busy"),
        }
    }

    fn handle_telemetry(&self) -> Response {
        Response::json(200, &self.telemetry.report(&self.status))
    }

    fn handle_update(&self, req: &mut dyn Request) -> Response {
        let Some(ota) = self.ota.as_ref() else {
            return Response::error(500, "OTA not available");
        };

        log::info!("OTA: update started");
        self.post(NetworkEvent::OtaStarted);
        let mut update = match ota.begin() {
            Ok(u) => u,
            Err(e) => {
                log::error!("OTA: begin failed: {}", e);
                self.post(NetworkEvent::OtaFailed);
                return Response::error(500, "OTA begin failed");
            }
        };

        let mut chunk = [0u8; OTA_CHUNK_SIZE];
        let mut written = 0usize;
        let mut next_progress = OTA_PROGRESS_STEP;
        loop {
            let n = match req.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    log::error!("OTA: receive failed after {} bytes: {}", written, e);
                    update.abort();
                    self.post(NetworkEvent::OtaFailed);
                    return Response::error(500, "Firmware receive failed");
                }
            };
            if let Err(e) = update.write(&chunk[..n]) {
                log::error!("OTA: write failed after {} bytes: {}", written, e);
                update.abort();
                self.post(NetworkEvent::OtaFailed);
                return Response::error(500, "Firmware write failed");
            }
            written += n;
            if written >= next_progress {
                next_progress += OTA_PROGRESS_STEP;
                self.bus.post_or_warn(
                    &Event::Network(NetworkEvent::OtaProgress { written }),
                    Wait::None,
                );
            }
        }

        if written == 0 {
            update.abort();
            self.post(NetworkEvent::OtaFailed);
            return Response::error(400, "Empty firmware image");
        }
        if let Err(e) = update.complete() {
            log::error!("OTA: finalize failed: {}", e);
            self.post(NetworkEvent::OtaFailed);
            return Response::error(500, "Firmware validation failed");
        }

        log::info!("OTA: {} bytes written, restarting", written);
        self.post(NetworkEvent::OtaCompleted { size: written });
        ota.schedule_restart(OTA_RESTART_DELAY_MS);
        Response::json(200, &json!({"status": "updating", "size": written}))
    }

    fn post(&self, event: NetworkEvent) {
        self.bus.post_or_warn(&Event::Network(event), HTTP_POST_WAIT);
    }
}
