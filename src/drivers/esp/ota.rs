// PyroVision — OTA Writer
//
// Streams the image into the next OTA slot with the raw esp_ota_* API so
// an update session can outlive the HTTP handler's borrow of the writer.

use std::thread;
use std::time::Duration;

use esp_idf_sys::{esp_ota_handle_t, esp_partition_t};

use crate::drivers::{OtaError, OtaUpdate, OtaWriter};

use super::esp_check;

pub struct EspOtaWriter;

impl EspOtaWriter {
    pub fn new() -> Self {
        Self
    }

    /// Confirm the running image so the bootloader does not roll back.
    pub fn mark_running_valid() {
        let ret = unsafe { esp_idf_sys::esp_ota_mark_app_valid_cancel_rollback() };
        if let Err(e) = esp_check(ret) {
            log::warn!("Failed to mark running OTA slot valid ({})", e);
        }
    }
}

impl Default for EspOtaWriter {
    fn default() -> Self {
        Self::new()
    }
}

struct Session {
    handle: esp_ota_handle_t,
    partition: *const esp_partition_t,
    written: usize,
}

impl OtaUpdate for Session {
    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        let ret = unsafe { esp_idf_sys::esp_ota_write(self.handle, chunk.as_ptr().cast(), chunk.len()) };
        esp_check(ret).map_err(|e| OtaError::Write(format!("esp_ota_write ({}) at {}", e, self.written)))?;
        self.written += chunk.len();
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<(), OtaError> {
        esp_check(unsafe { esp_idf_sys::esp_ota_end(self.handle) })
            .map_err(|e| OtaError::Invalid(format!("esp_ota_end ({})", e)))?;
        esp_check(unsafe { esp_idf_sys::esp_ota_set_boot_partition(self.partition) })
            .map_err(|e| OtaError::Invalid(format!("set boot partition ({})", e)))?;
        log::info!("OTA image of {} bytes marked bootable", self.written);
        Ok(())
    }

    fn abort(self: Box<Self>) {
        unsafe {
            esp_idf_sys::esp_ota_abort(self.handle);
        }
        log::warn!("OTA aborted after {} bytes", self.written);
    }
}

impl OtaWriter for EspOtaWriter {
    fn begin(&self) -> Result<Box<dyn OtaUpdate + '_>, OtaError> {
        let partition = unsafe { esp_idf_sys::esp_ota_get_next_update_partition(core::ptr::null()) };
        if partition.is_null() {
            return Err(OtaError::NoPartition);
        }
        let mut handle: esp_ota_handle_t = 0;
        let ret = unsafe {
            esp_idf_sys::esp_ota_begin(partition, esp_idf_sys::OTA_SIZE_UNKNOWN as usize, &mut handle)
        };
        esp_check(ret).map_err(|e| OtaError::Write(format!("esp_ota_begin ({})", e)))?;
        Ok(Box::new(Session {
            handle,
            partition,
            written: 0,
        }))
    }

    fn schedule_restart(&self, delay_ms: u64) {
        let spawned = thread::Builder::new()
            .name("ota_restart".into())
            .stack_size(2048)
            .spawn(move || {
                thread::sleep(Duration::from_millis(delay_ms));
                log::info!("Restarting into new image");
                unsafe { esp_idf_sys::esp_restart() };
            });
        if let Err(e) = spawned {
            log::error!("Could not schedule restart: {}", e);
        }
    }
}
