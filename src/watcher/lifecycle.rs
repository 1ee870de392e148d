//! Task bookkeeping for [`super::Watcher`]: the run token, the polling loop handle and
//! the metrics reporter.

use super::status::WatcherState;
use crate::runtime::telemetry::{self, Telemetry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Coordinates the control surface with the polling task.
///
/// `alive` is true while a polling task exists, including while it idles after a failed
/// cycle. Exit decisions and (re)starts both happen under its lock.
#[derive(Debug, Default)]
pub(crate) struct LoopControl {
    alive: Mutex<bool>,
    wake: Notify,
    replay_next: AtomicBool,
}

impl LoopControl {
    pub(crate) fn lock_alive(&self) -> MutexGuard<'_, bool> {
        self.alive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wakes an idle polling task, optionally running its next cycle in replay mode.
    pub(crate) fn wake(&self, is_replay: bool) {
        self.replay_next.store(is_replay, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    pub(crate) fn take_replay(&self) -> bool {
        self.replay_next.swap(false, Ordering::SeqCst)
    }
}

pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    loop_handle: Option<JoinHandle<()>>,
    metrics_handle: Option<JoinHandle<()>>,
}

pub(crate) struct LifecycleSpawnParams<'a> {
    pub shutdown_root: &'a CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub state: Arc<WatcherState>,
    pub metrics_interval: Duration,
}

impl LifecycleHandles {
    pub(crate) fn spawn(params: LifecycleSpawnParams<'_>) -> Self {
        let LifecycleSpawnParams {
            shutdown_root,
            telemetry,
            state,
            metrics_interval,
        } = params;

        let run_token = shutdown_root.child_token();
        let metrics_handle =
            telemetry::spawn_metrics_reporter(telemetry, state, run_token.clone(), metrics_interval);

        Self {
            run_token,
            loop_handle: None,
            metrics_handle: Some(metrics_handle),
        }
    }

    /// Stores the handle of a freshly spawned polling task. A previous task must already
    /// have exited; its handle is simply released.
    pub(crate) fn set_loop(&mut self, handle: JoinHandle<()>) {
        if let Some(previous) = self.loop_handle.replace(handle) {
            if !previous.is_finished() {
                tracing::debug!("previous polling task still winding down");
            }
        }
    }

    pub(crate) async fn shutdown(mut self) {
        self.run_token.cancel();

        if let Some(handle) = self.loop_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "polling task panicked");
            }
        }

        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }
    }
}
