// PyroVision — Task Watchdog

use esp_idf_sys::{esp_task_wdt_add, esp_task_wdt_config_t, esp_task_wdt_delete, esp_task_wdt_reset};

use crate::tasks::Watchdog;

use super::esp_check;

/// IDF task watchdog; every call acts on the calling FreeRTOS task.
pub struct TaskWatchdog;

impl TaskWatchdog {
    /// Reconfigure the watchdog (it may already be running from sdkconfig).
    pub fn init(timeout_ms: u32) -> anyhow::Result<Self> {
        let config = esp_task_wdt_config_t {
            timeout_ms,
            idle_core_mask: 0,
            trigger_panic: true,
        };
        let ret = unsafe { esp_idf_sys::esp_task_wdt_reconfigure(&config) };
        if esp_check(ret).is_err() {
            esp_check(unsafe { esp_idf_sys::esp_task_wdt_init(&config) })
                .map_err(|e| anyhow::anyhow!("task watchdog init failed ({})", e))?;
        }
        log::info!("Task watchdog armed, {} ms", timeout_ms);
        Ok(Self)
    }
}

impl Watchdog for TaskWatchdog {
    fn subscribe_current(&self) {
        if let Err(e) = esp_check(unsafe { esp_task_wdt_add(core::ptr::null_mut()) }) {
            log::warn!("Watchdog subscribe failed ({})", e);
        }
    }

    fn feed(&self) {
        unsafe {
            esp_task_wdt_reset();
        }
    }

    fn unsubscribe_current(&self) {
        unsafe {
            esp_task_wdt_delete(core::ptr::null_mut());
        }
    }
}
