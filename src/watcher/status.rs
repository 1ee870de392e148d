use super::velocity::{BlockVelocity, VelocitySampler};
use anyhow::Error as AnyError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexingStatus {
    /// The watcher has never run.
    Initial,
    Indexing,
    /// Running with a pause requested; takes effect at the next block boundary.
    Pausing,
    Paused,
    /// Halted by an error the loop did not recover from.
    Stopped,
}

/// Flags and samples shared between the control surface and the polling task.
#[derive(Debug)]
pub(crate) struct WatcherState {
    running: AtomicBool,
    should_pause: AtomicBool,
    clean: AtomicBool,
    error: Mutex<Option<Arc<AnyError>>>,
    velocity: Mutex<VelocitySampler>,
}

impl WatcherState {
    pub(crate) fn new(velocity_sample_size: usize) -> Self {
        Self {
            running: AtomicBool::new(false),
            should_pause: AtomicBool::new(false),
            clean: AtomicBool::new(true),
            error: Mutex::new(None),
            velocity: Mutex::new(VelocitySampler::new(velocity_sample_size)),
        }
    }

    /// Claims the running flag. Returns `false` when a loop is already active.
    pub(crate) fn try_begin(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.clean.store(false, Ordering::SeqCst);
        true
    }

    pub(crate) fn begin_cycle(&self) {
        self.clean.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.lock_error().take();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn request_pause(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.should_pause.store(true, Ordering::SeqCst);
        true
    }

    pub(crate) fn pause_requested(&self) -> bool {
        self.should_pause.load(Ordering::SeqCst)
    }

    /// Consumes a pending pause request, marking the loop as no longer running.
    pub(crate) fn settle_pause(&self) -> bool {
        if !self.should_pause.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.running.store(false, Ordering::SeqCst);
        true
    }

    pub(crate) fn record_failure(&self, error: AnyError) {
        self.running.store(false, Ordering::SeqCst);
        self.should_pause.store(false, Ordering::SeqCst);
        self.lock_velocity().clear();
        *self.lock_error() = Some(Arc::new(error));
    }

    /// Marks the loop as gone without touching the recorded error.
    pub(crate) fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.should_pause.store(false, Ordering::SeqCst);
    }

    pub(crate) fn error(&self) -> Option<Arc<AnyError>> {
        self.lock_error().clone()
    }

    pub(crate) fn status(&self) -> IndexingStatus {
        if self.clean.load(Ordering::SeqCst) {
            return IndexingStatus::Initial;
        }

        let running = self.is_running();
        let pausing = self.pause_requested();
        match (running, pausing) {
            (true, false) => IndexingStatus::Indexing,
            (true, true) => IndexingStatus::Pausing,
            _ if self.lock_error().is_some() => IndexingStatus::Stopped,
            _ => IndexingStatus::Paused,
        }
    }

    pub(crate) fn record_interval(&self, start: Instant, end: Instant) {
        self.lock_velocity().record(start, end);
    }

    pub(crate) fn clear_velocity(&self) {
        self.lock_velocity().clear();
    }

    pub(crate) fn velocity(&self) -> BlockVelocity {
        self.lock_velocity().velocity()
    }

    fn lock_error(&self) -> MutexGuard<'_, Option<Arc<AnyError>>> {
        self.error.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_velocity(&self) -> MutexGuard<'_, VelocitySampler> {
        self.velocity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
