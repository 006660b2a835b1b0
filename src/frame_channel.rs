// PyroVision — Frame Channel
//
// Single-slot, overwrite-on-write queue. A publish never blocks and always
// replaces whatever the consumer has not picked up yet; the consumer only
// ever sees the latest value. Used for capture → GUI frame descriptors, for
// the sensor's raw-frame hand-off and for the broadcast frame-ready signal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Descriptor of one converted frame living in a `DoubleBuffer` slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameDescriptor {
    /// Index of the double-buffer slot holding the RGB data.
    pub slot: usize,
    pub width: u16,
    pub height: u16,
    pub channels: u8,
    /// Decoded intensity range of the raw frame.
    pub min: u16,
    pub max: u16,
    /// Capture sequence number.
    pub seq: u32,
}

struct Slot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
    overwritten: AtomicU32,
}

pub struct FrameChannel<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for FrameChannel<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for FrameChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameChannel<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                value: Mutex::new(None),
                ready: Condvar::new(),
                overwritten: AtomicU32::new(0),
            }),
        }
    }

    /// Store `value`, replacing any unconsumed one. Returns `true` when an
    /// older value was shed.
    pub fn publish(&self, value: T) -> bool {
        let replaced = self.slot.value.lock().replace(value).is_some();
        if replaced {
            self.slot.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.slot.ready.notify_one();
        replaced
    }

    /// Take the latest value, if one was published since the last consume.
    pub fn try_consume(&self) -> Option<T> {
        self.slot.value.lock().take()
    }

    /// Wait up to `timeout` for a value.
    pub fn consume_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut value = self.slot.value.lock();
        while value.is_none() {
            if self.slot.ready.wait_until(&mut value, deadline).timed_out() {
                break;
            }
        }
        value.take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.value.lock().is_some()
    }

    /// Number of values replaced before anyone consumed them.
    pub fn overwritten(&self) -> u32 {
        self.slot.overwritten.load(Ordering::Relaxed)
    }
}
