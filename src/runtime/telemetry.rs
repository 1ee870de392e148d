use crate::watcher::status::WatcherState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters describing what the watcher loop has done so far.
#[derive(Default, Debug)]
pub struct Telemetry {
    processed_blocks: AtomicU64,
    rollbacks: AtomicU64,
    seeks: AtomicU64,
    cycle_errors: AtomicU64,
}

impl Telemetry {
    pub fn record_processed_block(&self) {
        self.processed_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_seek(&self) {
        self.seeks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle_error(&self) {
        self.cycle_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            processed_blocks: self.processed_blocks.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            seeks: self.seeks.load(Ordering::Relaxed),
            cycle_errors: self.cycle_errors.load(Ordering::Relaxed),
        }
    }

    pub fn processed_blocks(&self) -> u64 {
        self.processed_blocks.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub processed_blocks: u64,
    pub rollbacks: u64,
    pub seeks: u64,
    pub cycle_errors: u64,
}

/// Spawns a background task that periodically logs throughput, block velocity, and
/// error counters until `shutdown` fires.
pub(crate) fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    state: Arc<WatcherState>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(target: "forkwatch::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let processed_delta = current_snapshot
                        .processed_blocks
                        .saturating_sub(last_snapshot.processed_blocks);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        processed_delta as f64 / elapsed
                    };
                    let velocity = state.velocity();

                    tracing::info!(
                        target: "forkwatch::metrics",
                        status = ?state.status(),
                        throughput = format!("{throughput:.2}"),
                        current_block_velocity = format!("{:.2}", velocity.current_block_velocity),
                        max_block_velocity = format!("{:.2}", velocity.max_block_velocity),
                        processed = current_snapshot.processed_blocks,
                        rollbacks = current_snapshot.rollbacks,
                        seeks = current_snapshot.seeks,
                        cycle_errors = current_snapshot.cycle_errors,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
