// PyroVision — Firmware Core
//
// Everything that coordinates the camera: frame hand-off between capture,
// GUI and network, the event bus, settings, the WiFi/provisioning state
// machine and the HTTP/WebSocket surface. Hardware and IDF services are
// reached only through the traits in `drivers`, so the whole core also runs
// (and is tested) on a host.

pub mod config;
pub mod double_buffer;
pub mod drivers;
pub mod encoder;
pub mod event_bus;
pub mod events;
pub mod frame_channel;
pub mod network;
pub mod network_frame;
pub mod server;
pub mod settings;
pub mod tasks;
pub mod time;

// ---------------------------------------------------------------------------
// Utility: milliseconds since boot
// ---------------------------------------------------------------------------
#[cfg(target_os = "espidf")]
pub fn now_ms() -> u64 {
    unsafe { (esp_idf_sys::esp_timer_get_time() / 1000) as u64 }
}

#[cfg(not(target_os = "espidf"))]
pub fn now_ms() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static BOOT: OnceLock<Instant> = OnceLock::new();
    BOOT.get_or_init(Instant::now).elapsed().as_millis() as u64
}
