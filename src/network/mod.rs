// PyroVision — Networking
//
// WiFi station/AP control, credential provisioning and the captive DNS
// responder. The state machine
// that ties them to the server lives in `tasks::network`.

pub mod dns;
pub mod provisioning;
pub mod wifi;

pub use dns::CaptiveDns;
pub use provisioning::ProvisioningManager;
pub use wifi::{WifiManager, WifiOutcome};
