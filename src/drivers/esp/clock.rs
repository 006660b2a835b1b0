// PyroVision — System Clock

use std::time::{SystemTime, UNIX_EPOCH};

use crate::time::{Clock, TimeError};

/// newlib wall clock; SNTP adjusts the same clock underneath.
#[derive(Debug, Default)]
pub struct EspClock;

impl Clock for EspClock {
    fn now_epoch(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn set_epoch(&mut self, secs: i64) -> Result<(), TimeError> {
        let tv = esp_idf_sys::timeval {
            tv_sec: secs as _,
            tv_usec: 0,
        };
        let ret = unsafe { esp_idf_sys::settimeofday(&tv, core::ptr::null()) };
        if ret != 0 {
            return Err(TimeError::Backend(format!("settimeofday returned {}", ret)));
        }
        Ok(())
    }

    fn set_timezone(&mut self, tz: &str) -> Result<(), TimeError> {
        if tz.is_empty() || tz.contains('\0') {
            return Err(TimeError::Invalid(format!("timezone {:?}", tz)));
        }
        std::env::set_var("TZ", tz);
        unsafe { esp_idf_sys::tzset() };
        Ok(())
    }
}
