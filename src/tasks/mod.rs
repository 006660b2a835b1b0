// PyroVision — Task Plumbing
//
// Every long-running task is a named thread that owns its context, reacts to
// event bits set by its bus handlers, and stops cooperatively when the stop
// bit is raised. The bits replace FreeRTOS event groups.

pub mod capture;
pub mod devices;
pub mod gui;
pub mod network;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::config::*;

/// Shared by every task: the loop exits once this bit is seen.
pub const STOP_REQUEST: u32 = 1 << 31;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0} task already running")]
    AlreadyRunning(&'static str),
    #[error("{0} task not initialized")]
    NotInitialized(&'static str),
    #[error("{0} task did not stop in time")]
    StopTimeout(&'static str),
    #[error("failed to spawn task: {0}")]
    Spawn(#[from] io::Error),
    #[error("{0} init failed: {1}")]
    Init(&'static str, String),
}

// ---------------------------------------------------------------------------
// Event bits
// ---------------------------------------------------------------------------
#[derive(Default)]
pub struct EventBits {
    bits: Mutex<u32>,
    changed: Condvar,
}

impl EventBits {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, mask: u32) {
        *self.bits.lock() |= mask;
        self.changed.notify_all();
    }

    pub fn clear(&self, mask: u32) {
        *self.bits.lock() &= !mask;
    }

    pub fn get(&self) -> u32 {
        *self.bits.lock()
    }

    /// Return the bits of `mask` that are set and clear them.
    pub fn take(&self, mask: u32) -> u32 {
        let mut bits = self.bits.lock();
        let hit = *bits & mask;
        *bits &= !hit;
        hit
    }

    /// Block until any bit of `mask` is set or `timeout` elapses, then
    /// take those bits. Returns 0 on timeout.
    pub fn wait_any(&self, mask: u32, timeout: Duration) -> u32 {
        let deadline = Instant::now() + timeout;
        let mut bits = self.bits.lock();
        while *bits & mask == 0 {
            if self.changed.wait_until(&mut bits, deadline).timed_out() {
                break;
            }
        }
        let hit = *bits & mask;
        *bits &= !hit;
        hit
    }
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

/// Task watchdog. All calls act on the calling thread.
pub trait Watchdog: Send + Sync {
    fn subscribe_current(&self);
    fn feed(&self);
    fn unsubscribe_current(&self);
}

/// Host stand-in.
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn subscribe_current(&self) {}
    fn feed(&self) {}
    fn unsubscribe_current(&self) {}
}

// ---------------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------------

/// Clears the running flag when the task body returns or unwinds.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct TaskHandle {
    name: &'static str,
    bits: Arc<EventBits>,
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

/// Spawn `body` as a named task. `bits` is the task's event group; the
/// handle raises `STOP_REQUEST` in it on `stop`.
pub fn spawn_task<F>(
    name: &'static str,
    stack_size: usize,
    bits: Arc<EventBits>,
    body: F,
) -> Result<TaskHandle, TaskError>
where
    F: FnOnce() + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    bits.clear(STOP_REQUEST);

    let guard = RunningGuard(Arc::clone(&running));
    let join = thread::Builder::new()
        .name(name.into())
        .stack_size(stack_size)
        .spawn(move || {
            let _guard = guard;
            body();
        });

    match join {
        Ok(join) => {
            log::info!("{} task started", name);
            Ok(TaskHandle {
                name,
                bits,
                running,
                join: Some(join),
            })
        }
        Err(e) => {
            running.store(false, Ordering::SeqCst);
            log::error!("Failed to spawn {} task: {}", name, e);
            Err(TaskError::Spawn(e))
        }
    }
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn bits(&self) -> &Arc<EventBits> {
        &self.bits
    }

    pub fn request_stop(&self) {
        self.bits.set(STOP_REQUEST);
    }

    /// Request a stop and wait for the task to finish.
    pub fn stop(&mut self) -> Result<(), TaskError> {
        self.stop_with(TASK_STOP_POLLS, Duration::from_millis(TASK_STOP_POLL_MS))
    }

    pub fn stop_with(&mut self, polls: u32, interval: Duration) -> Result<(), TaskError> {
        self.request_stop();
        for _ in 0..polls {
            if !self.is_running() {
                break;
            }
            thread::sleep(interval);
        }
        if self.is_running() {
            log::warn!("{} task did not stop after {} polls", self.name, polls);
            return Err(TaskError::StopTimeout(self.name));
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("{} task panicked", self.name);
            }
        }
        log::info!("{} task stopped", self.name);
        Ok(())
    }
}
