// PyroVision — VISA / SCPI Server
//
// Line-based SCPI over a raw TCP socket for lab tooling: identification,
// temperature readout and image capture against the same network frame and
// telemetry the HTTP side serves. One client is served at a time.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::*;
use crate::encoder::{ImageEncoder, ImageFormat, Palette, SharedPalette};
use crate::event_bus::{EventBus, Subscription};
use crate::events::{Event, EventBase, SettingsEvent};
use crate::network_frame::SharedNetworkFrame;
use crate::server::telemetry::TelemetryCache;
use crate::settings::InfoSettings;
use crate::tasks::{spawn_task, EventBits, TaskError, TaskHandle, Watchdog, STOP_REQUEST};

/// SCPI version reported by `SYST:VERS?`.
const SCPI_VERSION: &str = "1999.0";

#[derive(Debug, Error)]
pub enum VisaError {
    #[error("visa socket: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Entries of the per-client SCPI error queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScpiError {
    #[error("Command error")]
    Command,
    #[error("Parameter not allowed")]
    ParameterNotAllowed,
    #[error("Missing parameter")]
    MissingParameter,
    #[error("Undefined header")]
    UndefinedHeader,
    #[error("Illegal parameter value")]
    IllegalParameter,
    #[error("Data corrupt or stale")]
    NoData,
    #[error("Queue overflow")]
    QueueOverflow,
}

impl ScpiError {
    pub fn code(self) -> i16 {
        match self {
            Self::Command => -100,
            Self::ParameterNotAllowed => -108,
            Self::MissingParameter => -109,
            Self::UndefinedHeader => -113,
            Self::IllegalParameter => -224,
            Self::NoData => -230,
            Self::QueueOverflow => -350,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl From<&InfoSettings> for Identity {
    fn from(info: &InfoSettings) -> Self {
        Self {
            manufacturer: info.manufacturer.clone(),
            model: info.model.clone(),
            serial: if info.serial_number.is_empty() {
                "0".into()
            } else {
                info.serial_number.clone()
            },
            firmware: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// What a session reads from the rest of the system.
pub struct VisaContext {
    pub identity: Identity,
    pub frame: SharedNetworkFrame,
    pub palette: SharedPalette,
    pub telemetry: Arc<TelemetryCache>,
}

// ---------------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------------
#[derive(Debug, PartialEq)]
struct Command<'a> {
    header: Vec<&'a str>,
    query: bool,
    args: Vec<&'a str>,
}

fn parse(line: &str) -> Option<Command<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (head, rest) = line
        .split_once(|c: char| c.is_ascii_whitespace())
        .unwrap_or((line, ""));
    let (head, query) = match head.strip_suffix('?') {
        Some(head) => (head, true),
        None => (head, false),
    };
    Some(Command {
        header: head.trim_start_matches(':').split(':').collect(),
        query,
        args: rest
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .collect(),
    })
}

/// SCPI keyword match: the uppercase prefix of `mnemonic` is the short
/// form, the whole word the long form, both case-insensitive.
fn keyword(token: &str, mnemonic: &str) -> bool {
    let short_len = mnemonic
        .find(|c: char| c.is_ascii_lowercase())
        .unwrap_or(mnemonic.len());
    token.eq_ignore_ascii_case(&mnemonic[..short_len]) || token.eq_ignore_ascii_case(mnemonic)
}

impl Command<'_> {
    fn is(&self, path: &[&str]) -> bool {
        self.header.len() == path.len()
            && self.header.iter().zip(path).all(|(t, m)| keyword(t, m))
    }

    fn no_args(&self) -> Result<(), ScpiError> {
        if self.args.is_empty() {
            Ok(())
        } else {
            Err(ScpiError::ParameterNotAllowed)
        }
    }

    fn arg(&self) -> Result<&str, ScpiError> {
        match self.args.as_slice() {
            [arg] => Ok(*arg),
            [] => Err(ScpiError::MissingParameter),
            _ => Err(ScpiError::ParameterNotAllowed),
        }
    }
}

fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "JPEG",
        ImageFormat::Png => "PNG",
        ImageFormat::Raw => "RAW",
    }
}

fn palette_name(palette: Palette) -> &'static str {
    match palette {
        Palette::Iron => "IRON",
        Palette::Gray => "GRAY",
        Palette::Rainbow => "RAINBOW",
    }
}

/// Definite-length arbitrary block: `#<digits><length><bytes>`.
fn ieee_block(data: &[u8]) -> Vec<u8> {
    let len = data.len().to_string();
    let mut out = format!("#{}{}", len.len(), len).into_bytes();
    out.extend_from_slice(data);
    out.push(b'\n');
    out
}

fn text(reply: impl Into<String>) -> Option<Vec<u8>> {
    let mut reply = reply.into();
    reply.push('\n');
    Some(reply.into_bytes())
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-client state: error queue, selected format and the last capture.
pub struct VisaSession {
    ctx: Arc<VisaContext>,
    encoder: ImageEncoder,
    format: ImageFormat,
    captured: Option<Vec<u8>>,
    errors: VecDeque<ScpiError>,
}

impl VisaSession {
    pub fn new(ctx: Arc<VisaContext>) -> Self {
        Self {
            ctx,
            encoder: ImageEncoder::default(),
            format: ImageFormat::default(),
            captured: None,
            errors: VecDeque::with_capacity(VISA_ERROR_QUEUE_DEPTH),
        }
    }

    /// Run one command line. Returns the bytes to send back, if any; a
    /// failed command answers `ERROR: <code>` and queues the error.
    pub fn execute(&mut self, line: &str) -> Option<Vec<u8>> {
        let cmd = parse(line)?;
        match self.dispatch(&cmd) {
            Ok(reply) => reply,
            Err(e) => {
                log::debug!("SCPI '{}' failed: {}", line.trim(), e);
                self.push_error(e);
                text(format!("ERROR: {}", e.code()))
            }
        }
    }

    pub fn pending_errors(&self) -> usize {
        self.errors.len()
    }

    fn push_error(&mut self, e: ScpiError) {
        if self.errors.len() >= VISA_ERROR_QUEUE_DEPTH {
            if let Some(last) = self.errors.back_mut() {
                *last = ScpiError::QueueOverflow;
            }
        } else {
            self.errors.push_back(e);
        }
    }

    fn dispatch(&mut self, cmd: &Command<'_>) -> Result<Option<Vec<u8>>, ScpiError> {
        let q = cmd.query;

        if cmd.is(&["*IDN"]) && q {
            cmd.no_args()?;
            let id = &self.ctx.identity;
            return Ok(text(format!(
                "{},{},{},{}",
                id.manufacturer, id.model, id.serial, id.firmware
            )));
        }
        if cmd.is(&["*RST"]) && !q {
            cmd.no_args()?;
            self.format = ImageFormat::default();
            self.captured = None;
            return Ok(None);
        }
        if cmd.is(&["*CLS"]) && !q {
            cmd.no_args()?;
            self.errors.clear();
            return Ok(None);
        }
        if cmd.is(&["*OPC"]) && q {
            return Ok(text("1"));
        }
        if cmd.is(&["*TST"]) && q {
            return Ok(text("0"));
        }

        if (cmd.is(&["SYSTem", "ERRor"]) || cmd.is(&["SYSTem", "ERRor", "NEXT"])) && q {
            return Ok(match self.errors.pop_front() {
                Some(e) => text(format!("{},\"{}\"", e.code(), e)),
                None => text("0,\"No error\""),
            });
        }
        if cmd.is(&["SYSTem", "VERSion"]) && q {
            return Ok(text(SCPI_VERSION));
        }

        if cmd.is(&["SENSe", "TEMPerature"]) && q {
            return Ok(text(format!("{:.2}", self.ctx.telemetry.sensor().temp_c)));
        }
        if cmd.is(&["SENSe", "TEMPerature", "FPA"]) && q {
            return Ok(text(format!("{:.2}", self.ctx.telemetry.sensor().fpa_c)));
        }
        if cmd.is(&["SENSe", "TEMPerature", "AUX"]) && q {
            return Ok(text(format!("{:.2}", self.ctx.telemetry.sensor().aux_c)));
        }

        if cmd.is(&["SENSe", "IMAGe", "CAPTure"]) && !q {
            cmd.no_args()?;
            self.capture()?;
            return Ok(None);
        }
        if cmd.is(&["SENSe", "IMAGe", "DATA"]) && q {
            return match &self.captured {
                Some(data) => Ok(Some(ieee_block(data))),
                None => Err(ScpiError::NoData),
            };
        }
        if cmd.is(&["SENSe", "IMAGe", "FORMat"]) {
            if q {
                return Ok(text(format_name(self.format)));
            }
            self.format = ImageFormat::from_query(cmd.arg()?).ok_or(ScpiError::IllegalParameter)?;
            return Ok(None);
        }
        if cmd.is(&["SENSe", "IMAGe", "PALette"]) {
            if q {
                return Ok(text(palette_name(self.ctx.palette.get())));
            }
            let palette = Palette::from_query(cmd.arg()?).ok_or(ScpiError::IllegalParameter)?;
            self.ctx.palette.set(palette);
            return Ok(None);
        }

        Err(ScpiError::UndefinedHeader)
    }

    fn capture(&mut self) -> Result<(), ScpiError> {
        let (encoder, format) = (self.encoder, self.format);
        let encoded = self
            .ctx
            .frame
            .read(Duration::from_millis(NETWORK_FRAME_READ_MS), |f| {
                encoder.encode(&f.rgb, f.width, f.height, format)
            })
            .map_err(|e| {
                log::debug!("SCPI capture: {}", e);
                ScpiError::NoData
            })?;
        match encoded {
            Ok(data) => {
                log::debug!("SCPI captured {} bytes {:?}", data.len(), format);
                self.captured = Some(data);
                Ok(())
            }
            Err(e) => {
                log::warn!("SCPI capture encode failed: {}", e);
                Err(ScpiError::NoData)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TCP server
// ---------------------------------------------------------------------------

/// Listener task. The port follows `VisaServerChanged` and applies on the
/// next `start`.
pub struct VisaServer {
    ctx: Arc<VisaContext>,
    port: Arc<AtomicU16>,
    watchdog: Arc<dyn Watchdog>,
    task: Option<TaskHandle>,
    local_addr: Option<SocketAddr>,
    _subscription: Subscription,
}

impl VisaServer {
    pub fn new(ctx: VisaContext, port: u16, bus: &EventBus, watchdog: Arc<dyn Watchdog>) -> Self {
        let port = Arc::new(AtomicU16::new(port));
        let sink = Arc::clone(&port);
        let subscription = bus.subscribe_scoped(Some(EventBase::Settings), move |event| {
            if let Event::Settings(SettingsEvent::VisaServerChanged(s)) = event {
                if sink.swap(s.port, Ordering::SeqCst) != s.port {
                    log::info!("VISA port set to {}, applies on next start", s.port);
                }
            }
        });

        Self {
            ctx: Arc::new(ctx),
            port,
            watchdog,
            task: None,
            local_addr: None,
            _subscription: subscription,
        }
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// Address actually bound by the running listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(TaskHandle::is_running)
    }

    pub fn start(&mut self) -> Result<(), VisaError> {
        if self.is_running() {
            log::warn!("VISA server already running");
            return Ok(());
        }

        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], self.port())))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let bits = EventBits::new();
        let stop = Arc::clone(&bits);
        let ctx = Arc::clone(&self.ctx);
        let watchdog = Arc::clone(&self.watchdog);
        self.task = Some(spawn_task("visa", STACK_VISA, bits, move || {
            accept_loop(listener, &ctx, &stop, watchdog.as_ref())
        })?);
        self.local_addr = Some(local_addr);
        log::info!("VISA server listening on {}", local_addr);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut task) = self.task.take() {
            if let Err(e) = task.stop() {
                log::warn!("{}", e);
            }
        }
        self.local_addr = None;
    }
}

impl Drop for VisaServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, ctx: &Arc<VisaContext>, bits: &EventBits, watchdog: &dyn Watchdog) {
    watchdog.subscribe_current();
    loop {
        watchdog.feed();
        match listener.accept() {
            Ok((stream, peer)) => {
                log::info!("VISA client {} connected", peer);
                if let Err(e) = serve_client(stream, ctx, bits, watchdog) {
                    log::warn!("VISA client {}: {}", peer, e);
                }
                log::info!("VISA client {} disconnected", peer);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("VISA accept failed: {}", e),
        }
        if bits.wait_any(STOP_REQUEST, Duration::from_millis(VISA_ACCEPT_POLL_MS)) & STOP_REQUEST != 0
        {
            break;
        }
    }
    watchdog.unsubscribe_current();
    log::info!("VISA server exiting");
}

fn serve_client(
    stream: TcpStream,
    ctx: &Arc<VisaContext>,
    bits: &EventBits,
    watchdog: &dyn Watchdog,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(VISA_RECV_TIMEOUT_MS)))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut session = VisaSession::new(Arc::clone(ctx));
    let mut line = Vec::new();

    while bits.get() & STOP_REQUEST == 0 {
        watchdog.feed();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let reply = session.execute(&String::from_utf8_lossy(&line));
                line.clear();
                if let Some(reply) = reply {
                    writer.write_all(&reply)?;
                }
            }
            // Partial input stays in `line` until the rest arrives.
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => return Err(e),
        }
        if line.len() > VISA_MAX_LINE {
            log::warn!("SCPI line over {} bytes dropped", VISA_MAX_LINE);
            line.clear();
            session.push_error(ScpiError::Command);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::Wait;
    use crate::events::{LeptonEvent, Spotmeter};
    use crate::settings::VisaServerSettings;
    use crate::tasks::NoWatchdog;

    fn context(bus: &EventBus) -> VisaContext {
        VisaContext {
            identity: Identity {
                manufacturer: "PyroVision".into(),
                model: "PV-1".into(),
                serial: "0042".into(),
                firmware: "1.2.3".into(),
            },
            frame: SharedNetworkFrame::new(),
            palette: SharedPalette::default(),
            telemetry: TelemetryCache::new(bus, Arc::new(|| 0)),
        }
    }

    fn reply(session: &mut VisaSession, line: &str) -> String {
        String::from_utf8(session.execute(line).unwrap_or_default()).unwrap()
    }

    #[test]
    fn parses_headers_queries_and_arguments() {
        let cmd = parse(":sens:img:form png\r\n").unwrap();
        assert_eq!(cmd.header, vec!["sens", "img", "form"]);
        assert!(!cmd.query);
        assert_eq!(cmd.args, vec!["png"]);

        let cmd = parse("SYST:ERR?").unwrap();
        assert!(cmd.query);
        assert!(cmd.args.is_empty());
        assert!(parse("  \r\n").is_none());
    }

    #[test]
    fn keywords_accept_short_and_long_forms() {
        assert!(keyword("SENS", "SENSe"));
        assert!(keyword("sense", "SENSe"));
        assert!(keyword("Temperature", "TEMPerature"));
        assert!(!keyword("SEN", "SENSe"));
        assert!(!keyword("SENSES", "SENSe"));
        assert!(keyword("*idn", "*IDN"));
    }

    #[test]
    fn identification_and_common_queries() {
        let bus = EventBus::new(8);
        let mut s = VisaSession::new(Arc::new(context(&bus)));
        assert_eq!(reply(&mut s, "*IDN?\n"), "PyroVision,PV-1,0042,1.2.3\n");
        assert_eq!(reply(&mut s, "*OPC?"), "1\n");
        assert_eq!(reply(&mut s, "*TST?"), "0\n");
        assert_eq!(reply(&mut s, "SYSTem:VERSion?"), "1999.0\n");
        assert!(s.execute("*RST").is_none());
        assert!(s.execute("").is_none());
    }

    #[test]
    fn errors_queue_in_order_until_cleared() {
        let bus = EventBus::new(8);
        let mut s = VisaSession::new(Arc::new(context(&bus)));
        assert_eq!(reply(&mut s, "FOO:BAR?"), "ERROR: -113\n");
        assert_eq!(reply(&mut s, "SENS:IMG:FORM"), "ERROR: -109\n");
        assert_eq!(reply(&mut s, "SENS:IMG:FORM TIFF"), "ERROR: -224\n");
        assert_eq!(s.pending_errors(), 3);

        assert_eq!(reply(&mut s, "SYST:ERR?"), "-113,\"Undefined header\"\n");
        assert_eq!(reply(&mut s, "syst:err:next?"), "-109,\"Missing parameter\"\n");
        assert!(s.execute("*CLS").is_none());
        assert_eq!(reply(&mut s, "SYST:ERR?"), "0,\"No error\"\n");
    }

    #[test]
    fn full_error_queue_reports_overflow_last() {
        let bus = EventBus::new(8);
        let mut s = VisaSession::new(Arc::new(context(&bus)));
        for _ in 0..VISA_ERROR_QUEUE_DEPTH + 3 {
            s.execute("BOGUS");
        }
        assert_eq!(s.pending_errors(), VISA_ERROR_QUEUE_DEPTH);
        for _ in 0..VISA_ERROR_QUEUE_DEPTH - 1 {
            assert!(reply(&mut s, "SYST:ERR?").starts_with("-113,"));
        }
        assert_eq!(reply(&mut s, "SYST:ERR?"), "-350,\"Queue overflow\"\n");
    }

    #[test]
    fn temperatures_come_from_telemetry() {
        let bus = EventBus::new(8);
        let mut s = VisaSession::new(Arc::new(context(&bus)));
        let spot = Spotmeter {
            min_c: 20.0,
            max_c: 40.0,
            avg_c: 31.5,
        };
        bus.post(&Event::Lepton(LeptonEvent::Spotmeter(spot)), Wait::None).unwrap();
        bus.post(
            &Event::Lepton(LeptonEvent::Temperatures {
                fpa_c: 29.25,
                aux_c: 27.0,
            }),
            Wait::None,
        )
        .unwrap();
        bus.dispatch_pending();

        assert_eq!(reply(&mut s, "MEAS:TEMP?"), "ERROR: -113\n");
        assert_eq!(reply(&mut s, "SENS:TEMP?"), "31.50\n");
        assert_eq!(reply(&mut s, "SENSE:TEMPERATURE:FPA?"), "29.25\n");
        assert_eq!(reply(&mut s, "sens:temp:aux?"), "27.00\n");
    }

    #[test]
    fn capture_returns_the_frame_as_a_block() {
        let bus = EventBus::new(8);
        let ctx = Arc::new(context(&bus));
        let mut s = VisaSession::new(Arc::clone(&ctx));

        assert_eq!(reply(&mut s, "SENS:IMG:CAPT"), "ERROR: -230\n");
        assert_eq!(reply(&mut s, "SENS:IMG:DATA?"), "ERROR: -230\n");

        let rgb: Vec<u8> = (0..48).collect();
        assert!(ctx.frame.try_update(&rgb, 4, 4, Spotmeter::default(), 1));
        assert!(s.execute("SENS:IMG:FORM raw").is_none());
        assert_eq!(reply(&mut s, "SENS:IMG:FORM?"), "RAW\n");
        assert!(s.execute("SENS:IMG:CAPT").is_none());

        let data = s.execute("SENS:IMG:DATA?").unwrap();
        assert_eq!(&data[..4], b"#248");
        assert_eq!(&data[4..52], rgb.as_slice());
        assert_eq!(data[52], b'\n');

        assert!(s.execute("SENS:IMG:FORM JPEG").is_none());
        assert!(s.execute("SENS:IMG:CAPT").is_none());
        let jpeg = s.execute("SENS:IMG:DATA?").unwrap();
        let digits = usize::from(jpeg[1] - b'0');
        assert_eq!(&jpeg[2 + digits..4 + digits], &[0xFF, 0xD8]);

        assert!(s.execute("*RST").is_none());
        assert_eq!(reply(&mut s, "SENS:IMG:DATA?"), "ERROR: -230\n");
        assert_eq!(reply(&mut s, "SENS:IMG:FORM?"), "JPEG\n");
    }

    #[test]
    fn palette_is_shared_with_the_renderer() {
        let bus = EventBus::new(8);
        let ctx = Arc::new(context(&bus));
        let mut s = VisaSession::new(Arc::clone(&ctx));
        assert_eq!(reply(&mut s, "SENS:IMG:PAL?"), "IRON\n");
        assert!(s.execute("SENS:IMG:PAL rainbow").is_none());
        assert_eq!(ctx.palette.get(), Palette::Rainbow);
        assert_eq!(reply(&mut s, "SENS:IMG:PAL IRON,GRAY"), "ERROR: -108\n");
    }

    #[test]
    fn serves_a_client_over_tcp_and_follows_port_changes() {
        let bus = EventBus::new(8);
        let mut server = VisaServer::new(context(&bus), 0, &bus, Arc::new(NoWatchdog));
        server.start().unwrap();
        assert!(server.is_running());
        let port = server.local_addr().unwrap().port();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        // Split writes exercise partial-line reassembly.
        client.write_all(b"*ID").unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(2 * VISA_RECV_TIMEOUT_MS));
        client.write_all(b"N?\r\nSYST:ERR?\n").unwrap();

        let mut lines = BufReader::new(client.try_clone().unwrap()).lines();
        assert_eq!(lines.next().unwrap().unwrap(), "PyroVision,PV-1,0042,1.2.3");
        assert_eq!(lines.next().unwrap().unwrap(), "0,\"No error\"");
        drop(client);

        bus.post(
            &Event::Settings(SettingsEvent::VisaServerChanged(VisaServerSettings { port: 5026 })),
            Wait::None,
        )
        .unwrap();
        bus.dispatch_pending();
        assert_eq!(server.port(), 5026);

        server.stop();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }
}
