// PyroVision — esp_http_server Transport
//
// Registers every API route for GET/POST/OPTIONS and lets `HttpApi` decide;
// the `/ws` endpoint feeds `WsHub` and keeps one detached sender per socket
// for the broadcast task.

use std::collections::HashMap;
use std::sync::Arc;

use embedded_svc::http::Headers;
use embedded_svc::io::{Read, Write};
use embedded_svc::ws::FrameType;
use esp_idf_svc::http::server::ws::{EspHttpWsConnection, EspHttpWsDetachedSender};
use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer};
use esp_idf_svc::http::Method as SvcMethod;
use esp_idf_sys::EspError;
use parking_lot::Mutex;

use crate::server::http::{
    HttpApi, Method, Request, Response, ROUTE_IMAGE, ROUTE_TELEMETRY, ROUTE_TIME, ROUTE_UPDATE,
    ROUTE_WS,
};
use crate::server::websocket::{SendError, WsFrame, WsHub, WsSender};
use crate::server::{HttpTransport, ServerError};

const HTTPD_STACK: usize = 10240;
/// Sockets reserved for plain HTTP on top of the WebSocket clients.
const HTTP_EXTRA_SOCKETS: usize = 3;
const WS_MAX_INBOUND: usize = 1024;

// ---------------------------------------------------------------------------
// WebSocket senders
// ---------------------------------------------------------------------------

/// Detached senders keyed by socket fd.
#[derive(Default)]
pub struct EspWsSenders {
    senders: Mutex<HashMap<i32, EspHttpWsDetachedSender>>,
}

impl EspWsSenders {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, fd: i32, sender: EspHttpWsDetachedSender) {
        self.senders.lock().insert(fd, sender);
    }

    fn remove(&self, fd: i32) {
        self.senders.lock().remove(&fd);
    }

    fn clear(&self) {
        self.senders.lock().clear();
    }
}

impl WsSender for EspWsSenders {
    fn send(&self, fd: i32, frame: WsFrame<'_>) -> Result<(), SendError> {
        let mut senders = self.senders.lock();
        let sender = senders.get_mut(&fd).ok_or(SendError::Closed(fd))?;
        if sender.is_closed() {
            senders.remove(&fd);
            return Err(SendError::Closed(fd));
        }
        let (kind, payload): (FrameType, &[u8]) = match frame {
            WsFrame::Binary(data) => (FrameType::Binary(false), data),
            WsFrame::Text(text) => (FrameType::Text(false), text.as_bytes()),
            WsFrame::Ping => (FrameType::Ping, &[]),
            WsFrame::Pong(data) => (FrameType::Pong, data),
        };
        sender
            .send(kind, payload)
            .map_err(|e| SendError::Failed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Request adapter
// ---------------------------------------------------------------------------

struct EspRequest<'r, 'c> {
    inner: esp_idf_svc::http::server::Request<&'r mut EspHttpConnection<'c>>,
    method: Method,
}

impl Request for EspRequest<'_, '_> {
    fn method(&self) -> Method {
        self.method
    }

    fn uri(&self) -> &str {
        self.inner.uri()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.inner.header(name)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, String> {
        self.inner.read(buf).map_err(|e| format!("{:?}", e))
    }
}

fn respond(
    req: esp_idf_svc::http::server::Request<&mut EspHttpConnection<'_>>,
    response: Response,
) -> anyhow::Result<()> {
    let mut headers: Vec<(&str, &str)> = vec![("Content-Type", response.content_type)];
    headers.extend(response.headers.iter().map(|(k, v)| (*k, v.as_str())));
    req.into_response(response.status, None, &headers)?
        .write_all(&response.body)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct EspHttpTransport {
    server: Option<EspHttpServer<'static>>,
    senders: Arc<EspWsSenders>,
}

impl EspHttpTransport {
    /// `senders` must be the same instance the `WsHub` was built with.
    pub fn new(senders: Arc<EspWsSenders>) -> Self {
        Self {
            server: None,
            senders,
        }
    }

    fn register_api(server: &mut EspHttpServer<'static>, api: &Arc<HttpApi>) -> Result<(), EspError> {
        let methods = [
            (SvcMethod::Get, Method::Get),
            (SvcMethod::Post, Method::Post),
            (SvcMethod::Options, Method::Options),
        ];
        for route in [ROUTE_TIME, ROUTE_IMAGE, ROUTE_TELEMETRY, ROUTE_UPDATE] {
            for (svc_method, method) in methods {
                let api = Arc::clone(api);
                server.fn_handler::<anyhow::Error, _>(route, svc_method, move |req| {
                    let mut wrapped = EspRequest { inner: req, method };
                    let response = api.route(&mut wrapped);
                    respond(wrapped.inner, response)
                })?;
            }
        }
        Ok(())
    }

    fn register_ws(
        server: &mut EspHttpServer<'static>,
        hub: Arc<WsHub>,
        senders: Arc<EspWsSenders>,
    ) -> Result<(), EspError> {
        server.ws_handler(ROUTE_WS, move |ws: &mut EspHttpWsConnection| -> Result<(), EspError> {
            let fd = ws.session();
            if ws.is_new() {
                let sender = ws.create_detached_sender()?;
                senders.insert(fd, sender);
                if !hub.on_connect(fd) {
                    senders.remove(fd);
                }
                return Ok(());
            }
            if ws.is_closed() {
                senders.remove(fd);
                hub.on_disconnect(fd);
                return Ok(());
            }

            let (kind, len) = ws.recv(&mut [])?;
            if len > WS_MAX_INBOUND {
                log::warn!("WS fd={} sent {} bytes, dropping frame", fd, len);
                return Ok(());
            }
            let mut buf = vec![0u8; len];
            if len > 0 {
                ws.recv(&mut buf)?;
            }
            match kind {
                FrameType::Text(_) => match std::str::from_utf8(&buf) {
                    Ok(text) => hub.handle_text(fd, text.trim_end_matches('\0')),
                    Err(_) => log::warn!("WS fd={} sent non-UTF-8 text", fd),
                },
                FrameType::Ping => hub.handle_ping(fd, &buf),
                FrameType::Close | FrameType::SocketClose => {
                    senders.remove(fd);
                    hub.handle_close(fd);
                }
                _ => {}
            }
            Ok(())
        })?;
        Ok(())
    }
}

impl HttpTransport for EspHttpTransport {
    fn start(&mut self, api: Arc<HttpApi>, hub: Arc<WsHub>) -> Result<(), ServerError> {
        let config = api.config();
        let server_config = Configuration {
            http_port: config.port,
            max_open_sockets: usize::from(config.max_clients) + HTTP_EXTRA_SOCKETS,
            max_uri_handlers: 16,
            stack_size: HTTPD_STACK,
            ..Default::default()
        };
        let transport_err = |e: EspError| ServerError::Transport(e.to_string());

        let mut server = EspHttpServer::new(&server_config).map_err(transport_err)?;
        Self::register_api(&mut server, &api).map_err(transport_err)?;
        Self::register_ws(&mut server, hub, Arc::clone(&self.senders)).map_err(transport_err)?;

        self.server = Some(server);
        Ok(())
    }

    fn stop(&mut self) {
        self.senders.clear();
        self.server = None;
    }
}
