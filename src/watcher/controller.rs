use super::cycle::{watch_loop, WatchShared};
use super::lifecycle::{LifecycleHandles, LifecycleSpawnParams, LoopControl};
use super::status::{IndexingStatus, WatcherState};
use super::velocity::BlockVelocity;
use crate::handler::action_handler::{ActionHandler, HandlerInfo};
use crate::handler::persistence::Persistence;
use crate::handler::version::HandlerVersion;
use crate::reader::block_reader::{BlockReader, ReaderInfo};
use crate::reader::source::BlockSource;
use crate::runtime::config::WatcherConfig;
use crate::runtime::telemetry::Telemetry;
use anyhow::{Error as AnyError, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherInfo {
    pub indexing_status: IndexingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub velocity: BlockVelocity,
}

/// Combined snapshot of the reader, the handler and the polling loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineInfo {
    pub reader: ReaderInfo,
    pub handler: HandlerInfo,
    pub watcher: WatcherInfo,
}

/// Drives a [`BlockReader`] and an [`ActionHandler`] from a background polling task.
///
/// The control methods are cheap and non-blocking: [`Watcher::start`],
/// [`Watcher::replay`] and [`Watcher::pause`] only flip flags or spawn the task, and a
/// pause takes effect at the next block boundary.
pub struct Watcher<S, P: Persistence> {
    shared: Arc<WatchShared<S, P>>,
    config: WatcherConfig,
    shutdown_root: CancellationToken,
    lifecycle: Mutex<Option<LifecycleHandles>>,
}

impl<S, P> Watcher<S, P>
where
    S: BlockSource + 'static,
    P: Persistence,
{
    pub fn new(reader: BlockReader<S>, handler: ActionHandler<P>, config: WatcherConfig) -> Self {
        Self::with_cancellation_token(reader, handler, config, CancellationToken::new())
    }

    /// Same as [`Self::new`], deriving the polling task's cancellation from `shutdown`.
    pub fn with_cancellation_token(
        reader: BlockReader<S>,
        handler: ActionHandler<P>,
        config: WatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let shared = WatchShared {
            reader: tokio::sync::Mutex::new(reader),
            handler: tokio::sync::Mutex::new(handler),
            state: Arc::new(WatcherState::new(config.velocity_sample_size())),
            telemetry: Arc::new(Telemetry::default()),
            control: LoopControl::default(),
            poll_interval: config.poll_interval(),
            auto_resume: config.auto_resume(),
            span: tracing::info_span!("watcher", source = %config.log_source()),
        };

        Self {
            shared: Arc::new(shared),
            config,
            shutdown_root: shutdown,
            lifecycle: Mutex::new(None),
        }
    }

    /// Builds the reader and handler from their collaborators and wires them together.
    pub fn from_parts(
        source: S,
        persistence: P,
        versions: Vec<HandlerVersion<P::State>>,
        config: WatcherConfig,
    ) -> Result<Self> {
        let reader = BlockReader::new(source, &config);
        let handler = ActionHandler::new(persistence, versions, &config)?;
        Ok(Self::new(reader, handler, config))
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.shared.telemetry)
    }

    pub fn reader(&self) -> &tokio::sync::Mutex<BlockReader<S>> {
        &self.shared.reader
    }

    pub fn handler(&self) -> &tokio::sync::Mutex<ActionHandler<P>> {
        &self.shared.handler
    }

    pub fn status(&self) -> IndexingStatus {
        self.shared.state.status()
    }

    /// Error that stopped the most recent cycle, cleared when the next cycle begins.
    pub fn error(&self) -> Option<Arc<AnyError>> {
        self.shared.state.error()
    }

    pub fn velocity(&self) -> BlockVelocity {
        self.shared.state.velocity()
    }

    /// Starts indexing. Returns `false` when the watcher is already indexing.
    pub fn start(&self) -> bool {
        self.launch(false)
    }

    /// Starts indexing with the first cycle in replay mode, which applies updaters but
    /// skips effects. Returns `false` when the watcher is already indexing.
    pub fn replay(&self) -> bool {
        self.launch(true)
    }

    /// Asks the polling task to stop at the next block boundary. Returns `false` when
    /// the watcher is not indexing.
    pub fn pause(&self) -> bool {
        if !self.shared.state.request_pause() {
            tracing::info!(parent: &self.shared.span, "cannot pause; not currently indexing");
            return false;
        }
        tracing::info!(parent: &self.shared.span, "pausing indexing");
        true
    }

    /// Cancels the polling task's sleep and the metrics reporter and waits for both. The
    /// watcher can be started again afterwards.
    pub async fn stop(&self) -> Result<()> {
        let handles = self.lock_lifecycle().take();
        if let Some(handles) = handles {
            tracing::info!(parent: &self.shared.span, "stopping watcher");
            handles.shutdown().await;
        }
        Ok(())
    }

    /// Replaces the root token the polling task's cancellation derives from. Only takes
    /// effect for tasks spawned after a [`Self::stop`].
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        self.shutdown_root = shutdown;
    }

    pub async fn info(&self) -> EngineInfo {
        let reader = self.shared.reader.lock().await.info();
        let handler = self.shared.handler.lock().await.info();
        EngineInfo {
            reader,
            handler,
            watcher: WatcherInfo {
                indexing_status: self.shared.state.status(),
                error: self.shared.state.error().map(|err| format!("{err:#}")),
                velocity: self.shared.state.velocity(),
            },
        }
    }

    fn launch(&self, is_replay: bool) -> bool {
        let span = &self.shared.span;
        let mut alive = self.shared.control.lock_alive();
        if !self.shared.state.try_begin() {
            tracing::info!(parent: span, "cannot start; already indexing");
            return false;
        }

        if is_replay {
            tracing::info!(parent: span, "replaying");
        } else {
            tracing::info!(parent: span, "starting indexing");
        }

        if *alive {
            // The polling task is idling after a failed cycle.
            self.shared.control.wake(is_replay);
            return true;
        }

        *alive = true;
        let mut lifecycle = self.lock_lifecycle();
        let handles = lifecycle.get_or_insert_with(|| {
            LifecycleHandles::spawn(LifecycleSpawnParams {
                shutdown_root: &self.shutdown_root,
                telemetry: Arc::clone(&self.shared.telemetry),
                state: Arc::clone(&self.shared.state),
                metrics_interval: self.config.metrics_interval(),
            })
        });
        let task = tokio::spawn(watch_loop(
            Arc::clone(&self.shared),
            is_replay,
            handles.run_token.clone(),
        ));
        handles.set_loop(task);
        true
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Option<LifecycleHandles>> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
