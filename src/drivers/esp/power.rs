// PyroVision — Battery ADC
//
// One-shot ADC1 reading through the 1:2 divider plus the charger STAT pin.

use crate::config::*;
use crate::drivers::{PowerMonitor, SensorError};

use super::esp_check;

pub struct AdcBattery {
    handle: esp_idf_sys::adc_oneshot_unit_handle_t,
    channel: esp_idf_sys::adc_channel_t,
}

// The unit handle is only ever used from the devices task.
unsafe impl Send for AdcBattery {}

impl AdcBattery {
    pub fn new() -> Result<Self, SensorError> {
        let channel = PIN_BATTERY_ADC_CHANNEL as esp_idf_sys::adc_channel_t;
        let mut handle: esp_idf_sys::adc_oneshot_unit_handle_t = core::ptr::null_mut();
        unsafe {
            let unit_cfg = esp_idf_sys::adc_oneshot_unit_init_cfg_t {
                unit_id: esp_idf_sys::adc_unit_t_ADC_UNIT_1,
                ulp_mode: esp_idf_sys::adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
                ..core::mem::zeroed()
            };
            esp_check(esp_idf_sys::adc_oneshot_new_unit(&unit_cfg, &mut handle))
                .map_err(|e| SensorError::Transaction(format!("ADC unit init failed ({})", e)))?;

            // 11 dB attenuation: 0..3.3 V input range.
            let chan_cfg = esp_idf_sys::adc_oneshot_chan_cfg_t {
                atten: esp_idf_sys::adc_atten_t_ADC_ATTEN_DB_11,
                bitwidth: esp_idf_sys::adc_bitwidth_t_ADC_BITWIDTH_12,
            };
            esp_check(esp_idf_sys::adc_oneshot_config_channel(handle, channel, &chan_cfg))
                .map_err(|e| SensorError::Transaction(format!("ADC channel config failed ({})", e)))?;

            let gpio_cfg = esp_idf_sys::gpio_config_t {
                pin_bit_mask: 1u64 << PIN_CHARGE_STAT,
                mode: esp_idf_sys::gpio_mode_t_GPIO_MODE_INPUT,
                pull_up_en: esp_idf_sys::gpio_pullup_t_GPIO_PULLUP_ENABLE,
                ..core::mem::zeroed()
            };
            esp_check(esp_idf_sys::gpio_config(&gpio_cfg))
                .map_err(|e| SensorError::Transaction(format!("charge pin config failed ({})", e)))?;
        }
        Ok(Self { handle, channel })
    }
}

impl PowerMonitor for AdcBattery {
    fn battery_voltage(&mut self) -> Result<f32, SensorError> {
        let mut raw: i32 = 0;
        unsafe { esp_check(esp_idf_sys::adc_oneshot_read(self.handle, self.channel, &mut raw)) }
            .map_err(|e| SensorError::Transaction(format!("ADC read failed ({})", e)))?;
        Ok((raw as f32 / 4095.0) * 3.3 * 2.0)
    }

    fn is_charging(&mut self) -> Result<bool, SensorError> {
        Ok(unsafe { esp_idf_sys::gpio_get_level(PIN_CHARGE_STAT) } == 0)
    }
}

impl Drop for AdcBattery {
    fn drop(&mut self) {
        unsafe {
            esp_idf_sys::adc_oneshot_del_unit(self.handle);
        }
    }
}
