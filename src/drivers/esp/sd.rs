// PyroVision — SD Card (SPI)
//
// FAT filesystem on an SD card in SPI mode, mounted at `/sdcard`. The card
// is mounted lazily from the devices task and unmounted again once the
// filesystem stops answering, so hot-swapping a card works without a
// card-detect pin.

use core::ffi::CStr;

use esp_idf_hal::spi::SpiDriver;

use crate::config::*;
use crate::drivers::{StorageError, StorageInfo, StorageMonitor};

use super::esp_check;

const MOUNT_POINT: &CStr = c"/sdcard";

// sdmmc_host_t flags; the C headers define them through BIT(), which
// bindgen does not carry over.
const HOST_FLAG_SPI: u32 = 1 << 3;
const HOST_FLAG_DEINIT_ARG: u32 = 1 << 5;
const HOST_FREQ_DEFAULT_KHZ: i32 = 20_000;
const GPIO_NOT_CONNECTED: i32 = -1;

pub struct SdSpiCard {
    // Keeps the SPI bus initialized for as long as the card may be mounted.
    bus: SpiDriver<'static>,
    card: *mut esp_idf_sys::sdmmc_card_t,
}

// The card handle is only ever used from the devices task.
unsafe impl Send for SdSpiCard {}

impl SdSpiCard {
    pub fn new(bus: SpiDriver<'static>) -> Self {
        Self {
            bus,
            card: core::ptr::null_mut(),
        }
    }

    fn is_mounted(&self) -> bool {
        !self.card.is_null()
    }

    /// `Ok(false)` when no card answered on the bus.
    fn mount(&mut self) -> Result<bool, StorageError> {
        let slot = self.bus.host() as i32;
        let ret = unsafe {
            let mut host: esp_idf_sys::sdmmc_host_t = core::mem::zeroed();
            host.flags = HOST_FLAG_SPI | HOST_FLAG_DEINIT_ARG;
            host.slot = slot;
            host.max_freq_khz = HOST_FREQ_DEFAULT_KHZ;
            host.io_voltage = 3.3;
            host.init = Some(esp_idf_sys::sdspi_host_init);
            host.set_card_clk = Some(esp_idf_sys::sdspi_host_set_card_clk);
            host.do_transaction = Some(esp_idf_sys::sdspi_host_do_transaction);
            host.__bindgen_anon_1.deinit_p = Some(esp_idf_sys::sdspi_host_remove_device);
            host.io_int_enable = Some(esp_idf_sys::sdspi_host_io_int_enable);
            host.io_int_wait = Some(esp_idf_sys::sdspi_host_io_int_wait);
            host.get_real_freq = Some(esp_idf_sys::sdspi_host_get_real_freq);

            let device = esp_idf_sys::sdspi_device_config_t {
                host_id: self.bus.host(),
                gpio_cs: PIN_SD_CS,
                gpio_cd: GPIO_NOT_CONNECTED,
                gpio_wp: GPIO_NOT_CONNECTED,
                gpio_int: GPIO_NOT_CONNECTED,
                ..core::mem::zeroed()
            };

            let mount = esp_idf_sys::esp_vfs_fat_mount_config_t {
                format_if_mount_failed: false,
                max_files: SD_MAX_OPEN_FILES,
                allocation_unit_size: SD_ALLOCATION_UNIT,
                ..core::mem::zeroed()
            };

            esp_idf_sys::esp_vfs_fat_sdspi_mount(
                MOUNT_POINT.as_ptr(),
                &host,
                &device,
                &mount,
                &mut self.card,
            )
        };

        match esp_check(ret) {
            Ok(()) => {
                log::info!("SD card mounted at {:?}", MOUNT_POINT);
                Ok(true)
            }
            // Card answered but holds no usable FAT filesystem.
            Err(code) if code == esp_idf_sys::ESP_FAIL => {
                self.card = core::ptr::null_mut();
                Err(StorageError::Mount(format!("no FAT filesystem ({})", code)))
            }
            Err(code) => {
                self.card = core::ptr::null_mut();
                log::debug!("No SD card answered ({})", code);
                Ok(false)
            }
        }
    }

    fn unmount(&mut self) {
        if !self.is_mounted() {
            return;
        }
        let ret = unsafe { esp_idf_sys::esp_vfs_fat_sdcard_unmount(MOUNT_POINT.as_ptr(), self.card) };
        if let Err(e) = esp_check(ret) {
            log::warn!("SD card unmount failed ({})", e);
        }
        self.card = core::ptr::null_mut();
        log::info!("SD card unmounted");
    }

    fn info(&self) -> Result<StorageInfo, StorageError> {
        let (mut total, mut free) = (0u64, 0u64);
        unsafe { esp_check(esp_idf_sys::esp_vfs_fat_info(MOUNT_POINT.as_ptr(), &mut total, &mut free)) }
            .map_err(|e| StorageError::Info(format!("esp_vfs_fat_info ({})", e)))?;
        Ok(StorageInfo {
            total_mb: (total / (1024 * 1024)) as u32,
            free_mb: (free / (1024 * 1024)) as u32,
        })
    }
}

impl StorageMonitor for SdSpiCard {
    fn storage(&mut self) -> Result<Option<StorageInfo>, StorageError> {
        if !self.is_mounted() && !self.mount()? {
            return Ok(None);
        }
        match self.info() {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                log::warn!("SD card stopped answering: {}", e);
                self.unmount();
                Ok(None)
            }
        }
    }
}

impl Drop for SdSpiCard {
    fn drop(&mut self) {
        self.unmount();
    }
}
