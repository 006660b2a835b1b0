// PyroVision — Network Frame
//
// Latest rendered frame in the form the HTTP/WebSocket encoders consume.
// The GUI task is the only writer and never blocks on it: if a reader holds
// the lock, that render cycle's update is skipped and the previous contents
// stay valid. Readers take the lock with a short timeout.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::events::Spotmeter;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkFrame {
    /// RGB888, row-major, `width * height * 3` bytes.
    pub rgb: Vec<u8>,
    pub width: u16,
    pub height: u16,
    pub temp_min: f32,
    pub temp_max: f32,
    pub temp_avg: f32,
    /// Milliseconds since boot when the frame was rendered.
    pub timestamp_ms: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameReadError {
    #[error("no thermal data available")]
    NoData,
    #[error("frame busy")]
    Busy,
}

#[derive(Clone, Default)]
pub struct SharedNetworkFrame {
    inner: Arc<Mutex<Option<NetworkFrame>>>,
}

impl SharedNetworkFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking write. Returns `false` when the frame was busy and this
    /// update was skipped.
    pub fn try_update(
        &self,
        rgb: &[u8],
        width: u16,
        height: u16,
        temps: Spotmeter,
        timestamp_ms: u64,
    ) -> bool {
        let Some(mut slot) = self.inner.try_lock() else {
            log::debug!("Network frame busy, skipping update");
            return false;
        };

        let frame = slot.get_or_insert_with(NetworkFrame::default);
        frame.rgb.clear();
        frame.rgb.extend_from_slice(rgb);
        frame.width = width;
        frame.height = height;
        frame.temp_min = temps.min_c;
        frame.temp_max = temps.max_c;
        frame.temp_avg = temps.avg_c;
        frame.timestamp_ms = timestamp_ms;
        true
    }

    /// Run `f` on the current frame while holding the lock.
    pub fn read<R>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&NetworkFrame) -> R,
    ) -> Result<R, FrameReadError> {
        let slot = self.inner.try_lock_for(timeout).ok_or(FrameReadError::Busy)?;
        match slot.as_ref() {
            Some(frame) if !frame.rgb.is_empty() => Ok(f(frame)),
            _ => Err(FrameReadError::NoData),
        }
    }
}
