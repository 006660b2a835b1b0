// PyroVision — SNTP Client

use esp_idf_svc::sntp::{EspSntp, SntpConf};

use crate::time::{SntpClient, SyncCallback, TimeError};

#[derive(Default)]
pub struct EspSntpClient {
    sntp: Option<EspSntp<'static>>,
}

impl EspSntpClient {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SntpClient for EspSntpClient {
    fn start(&mut self, on_sync: SyncCallback) -> Result<(), TimeError> {
        if self.sntp.is_some() {
            return Ok(());
        }
        let sntp = EspSntp::new_with_callback(&SntpConf::default(), move |synced| {
            log::debug!("SNTP sync, {:?} since epoch", synced);
            on_sync();
        })
        .map_err(|e| TimeError::Backend(format!("SNTP start failed: {}", e)))?;
        self.sntp = Some(sntp);
        log::info!("SNTP started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.sntp.take().is_some() {
            log::info!("SNTP stopped");
        }
    }
}
