// PyroVision — ESP-IDF Backends
//
// Implementations of the collaborator traits on top of esp-idf-svc and raw
// esp-idf-sys calls. Only built for the `espidf` target.

pub mod clock;
pub mod http;
pub mod nvs;
pub mod ota;
pub mod portal;
pub mod power;
pub mod sd;
pub mod sntp;
pub mod watchdog;
pub mod wifi;

pub use clock::EspClock;
pub use http::{EspHttpTransport, EspWsSenders};
pub use nvs::NvsStore;
pub use ota::EspOtaWriter;
pub use portal::CaptivePortal;
pub use power::AdcBattery;
pub use sd::SdSpiCard;
pub use sntp::EspSntpClient;
pub use watchdog::TaskWatchdog;
pub use wifi::EspWifiDriver;

/// Map an `esp_err_t` to `Err(code)` unless it is `ESP_OK`.
pub(crate) fn esp_check(ret: esp_idf_sys::esp_err_t) -> Result<(), esp_idf_sys::esp_err_t> {
    if ret == esp_idf_sys::ESP_OK {
        Ok(())
    } else {
        Err(ret)
    }
}
