// PyroVision — Captive Portal Provisioning
//
// While provisioning the device hosts its own AP; this serves a one-page
// form on it and posts whatever credentials come back. A DNS responder
// points every lookup at the AP so clients land on the form.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use embedded_svc::io::{Read, Write};
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use esp_idf_svc::http::Method;

use crate::config::*;
use crate::drivers::{ProvisioningTransport, WifiError};
use crate::event_bus::{EventBus, Wait};
use crate::events::{Event, NetworkEvent};
use crate::network::dns::CaptiveDns;
use crate::network::provisioning::parse_credentials;
use crate::tasks::Watchdog;

const PORTAL_PAGE: &str = r#"<!DOCTYPE html>
<html><head><meta name="viewport" content="width=device-width">
<title>PyroVision setup</title></head>
<body><h3>PyroVision WiFi</h3>
<form onsubmit="fetch('/prov',{method:'POST',body:JSON.stringify({ssid:s.value,password:p.value})}).then(r=>r.text()).then(t=>document.body.innerText=t);return false">
<input id="s" placeholder="SSID"><br><input id="p" type="password" placeholder="Password"><br>
<button>Connect</button></form></body></html>"#;

pub struct CaptivePortal {
    bus: EventBus,
    watchdog: Arc<dyn Watchdog>,
    server: Option<EspHttpServer<'static>>,
    dns: Option<CaptiveDns>,
}

impl CaptivePortal {
    pub fn new(bus: EventBus, watchdog: Arc<dyn Watchdog>) -> Self {
        Self {
            bus,
            watchdog,
            server: None,
            dns: None,
        }
    }
}

impl ProvisioningTransport for CaptivePortal {
    fn start(&mut self, service_name: &str) -> Result<(), WifiError> {
        let config = Configuration {
            http_port: HTTP_DEFAULT_PORT,
            max_uri_handlers: 4,
            ..Default::default()
        };
        let err = |e: esp_idf_sys::EspError| WifiError::Driver(format!("portal: {}", e));
        let mut server = EspHttpServer::new(&config).map_err(err)?;

        server
            .fn_handler::<anyhow::Error, _>("/", Method::Get, |req| {
                req.into_response(200, None, &[("Content-Type", "text/html")])?
                    .write_all(PORTAL_PAGE.as_bytes())?;
                Ok(())
            })
            .map_err(err)?;

        let bus = self.bus.clone();
        server
            .fn_handler::<anyhow::Error, _>("/prov", Method::Post, move |mut req| {
                let mut body = Vec::new();
                let mut chunk = [0u8; 128];
                loop {
                    let n = req.read(&mut chunk)?;
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&chunk[..n]);
                    if body.len() > HTTP_MAX_JSON_BODY {
                        req.into_status_response(413)?.write_all(b"Body too large")?;
                        return Ok(());
                    }
                }
                match parse_credentials(&body) {
                    Ok(creds) => {
                        log::info!("Portal received credentials for '{}'", creds.ssid);
                        let event = Event::Network(NetworkEvent::ProvCredentialsReceived {
                            ssid: creds.ssid,
                            password: creds.password,
                        });
                        bus.post(&event, Wait::For(Duration::from_millis(500)))?;
                        req.into_ok_response()?.write_all(b"Connecting...")?;
                    }
                    Err(e) => {
                        req.into_status_response(400)?.write_all(e.to_string().as_bytes())?;
                    }
                }
                Ok(())
            })
            .map_err(err)?;

        let dns = CaptiveDns::start(
            SocketAddr::from(([0, 0, 0, 0], DNS_PORT)),
            Ipv4Addr::from(AP_DEFAULT_IP),
            Arc::clone(&self.watchdog),
        )
        .map_err(|e| WifiError::Driver(format!("portal dns: {}", e)))?;

        self.server = Some(server);
        self.dns = Some(dns);
        log::info!("Captive portal '{}' up on port {}", service_name, HTTP_DEFAULT_PORT);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut dns) = self.dns.take() {
            dns.stop();
        }
        if self.server.take().is_some() {
            log::info!("Captive portal stopped");
        }
    }
}
