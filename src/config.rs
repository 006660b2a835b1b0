// PyroVision — System Configuration
// Target: ESP32-S3 + FLIR Lepton 3.5 thermal core

// ---------------------------------------------------------------------------
// Thermal sensor geometry
// ---------------------------------------------------------------------------
pub const LEPTON_WIDTH: u16 = 160;
pub const LEPTON_HEIGHT: u16 = 120;
pub const RGB_CHANNELS: u8 = 3;
pub const RGB_FRAME_BYTES: usize =
    LEPTON_WIDTH as usize * LEPTON_HEIGHT as usize * RGB_CHANNELS as usize; // 57_600

/// Kelvin offset for centikelvin → °C conversions.
pub const KELVIN_OFFSET: f32 = 273.15;

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------
pub const DISPLAY_WIDTH: u16 = 320;
pub const DISPLAY_HEIGHT: u16 = 240;

// ---------------------------------------------------------------------------
// Task Stack Sizes (bytes)
// ---------------------------------------------------------------------------
pub const STACK_EVENT_LOOP: usize = 4096;
pub const STACK_CAPTURE: usize = 8192;
pub const STACK_GUI: usize = 16384;
pub const STACK_NETWORK: usize = 8192;
pub const STACK_DEVICES: usize = 4096;
pub const STACK_BROADCAST: usize = 8192;
pub const STACK_DNS: usize = 4096;
pub const STACK_VISA: usize = 8192;

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------
pub const EVENT_QUEUE_DEPTH: usize = 32;
/// Best-effort telemetry posts give up after this long.
pub const EVENT_POST_TIMEOUT_MS: u64 = 10;

// ---------------------------------------------------------------------------
// Timing (milliseconds)
// ---------------------------------------------------------------------------
pub const CAPTURE_FRAME_TIMEOUT_MS: u64 = 500;
pub const DOUBLE_BUFFER_LOCK_MS: u64 = 100;
pub const CAPTURE_STABILIZE_STEPS: u32 = 50;
pub const CAPTURE_STEP_MS: u64 = 100;

pub const GUI_LOOP_MS: u64 = 10;
pub const GUI_SENSOR_POLL_MS: u64 = 1000;

pub const NETWORK_LOOP_MS: u64 = 10;
pub const DEVICES_LOOP_MS: u64 = 10;
pub const BATTERY_UPDATE_MS: u64 = 1000;
/// Mount attempts block the devices task, so the card is checked less often.
pub const SD_POLL_MS: u64 = 5000;

/// Cooperative shutdown: poll the running flag this many times …
pub const TASK_STOP_POLLS: u32 = 20;
/// … this far apart.
pub const TASK_STOP_POLL_MS: u64 = 50;

// ---------------------------------------------------------------------------
// Network frame / HTTP
// ---------------------------------------------------------------------------
pub const NETWORK_FRAME_READ_MS: u64 = 100;
pub const HTTP_MAX_JSON_BODY: usize = 4096;
pub const OTA_CHUNK_SIZE: usize = 1024;
pub const OTA_RESTART_DELAY_MS: u64 = 1000;
pub const JPEG_DEFAULT_QUALITY: u8 = 80;

// ---------------------------------------------------------------------------
// WebSocket broadcast
// ---------------------------------------------------------------------------
pub const WS_DEFAULT_FPS: u8 = 8;
pub const WS_MIN_FPS: u8 = 1;
pub const WS_MAX_FPS: u8 = 30;
pub const WS_DEFAULT_TELEMETRY_MS: u32 = 1000;
pub const WS_MIN_TELEMETRY_MS: u32 = 100;
pub const WS_SIGNAL_WAIT_MS: u64 = 100;
pub const WS_FRAME_LOCK_MS: u64 = 50;
pub const WS_SEND_ATTEMPTS: u32 = 3;
pub const WS_SEND_RETRY_MS: u64 = 50;
pub const WS_SEND_PACE_MS: u64 = 5;
pub const WS_BROADCAST_YIELD_MS: u64 = 10;
pub const WS_PONG_RETRY_MS: u64 = 10;

// ---------------------------------------------------------------------------
// WiFi / provisioning defaults
// ---------------------------------------------------------------------------
pub const WIFI_DEFAULT_MAX_RETRIES: u8 = 5;
pub const WIFI_DEFAULT_RETRY_INTERVAL_MS: u16 = 2000;
pub const WIFI_SSID_MAX: usize = 32;
pub const WIFI_PASSWORD_MAX: usize = 64;
pub const PROV_DEFAULT_TIMEOUT_S: u32 = 300;
pub const PROV_SERVICE_NAME_PREFIX_MAX: usize = 26;
pub const AP_DEFAULT_SSID: &str = "PyroVision-AP";
pub const AP_DEFAULT_CHANNEL: u8 = 1;
pub const AP_DEFAULT_MAX_CONNECTIONS: u8 = 4;
/// Address the soft-AP hands out for itself.
pub const AP_DEFAULT_IP: [u8; 4] = [192, 168, 4, 1];

// ---------------------------------------------------------------------------
// Captive DNS
// ---------------------------------------------------------------------------
pub const DNS_PORT: u16 = 53;
pub const DNS_MAX_PACKET: usize = 512;
pub const DNS_RECV_TIMEOUT_MS: u64 = 250;
pub const DNS_ANSWER_TTL_S: u32 = 60;

// ---------------------------------------------------------------------------
// Server defaults
// ---------------------------------------------------------------------------
pub const HTTP_DEFAULT_PORT: u16 = 80;
pub const HTTP_DEFAULT_MAX_CLIENTS: u8 = 4;
pub const WS_DEFAULT_PING_INTERVAL_S: u16 = 30;
pub const VISA_DEFAULT_PORT: u16 = 5025;
pub const VISA_ACCEPT_POLL_MS: u64 = 100;
pub const VISA_RECV_TIMEOUT_MS: u64 = 200;
pub const VISA_MAX_LINE: usize = 256;
pub const VISA_ERROR_QUEUE_DEPTH: usize = 10;

// ---------------------------------------------------------------------------
// Battery (1:2 divider in front of the ADC)
// ---------------------------------------------------------------------------
pub const BATTERY_EMPTY_V: f32 = 3.3;
pub const BATTERY_FULL_V: f32 = 4.2;

// ---------------------------------------------------------------------------
// Pins
// ---------------------------------------------------------------------------
/// Battery sense: GPIO2 / ADC1 channel 2 behind the divider.
pub const PIN_BATTERY_ADC_CHANNEL: u32 = 2;
/// Charger STAT output, active low.
pub const PIN_CHARGE_STAT: i32 = 4;
/// SD card on SPI2: SCLK 12, MOSI 11, MISO 13, CS 10.
pub const PIN_SD_CS: i32 = 10;

// ---------------------------------------------------------------------------
// SD card
// ---------------------------------------------------------------------------
pub const SD_MAX_OPEN_FILES: i32 = 5;
pub const SD_ALLOCATION_UNIT: usize = 16 * 1024;

pub const WATCHDOG_TIMEOUT_MS: u32 = 10_000;
pub const NVS_NAMESPACE: &str = "pyrovision";
pub const NVS_MAX_VALUE_LEN: usize = 4000;
