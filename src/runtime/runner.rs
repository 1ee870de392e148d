use crate::handler::{HandlerVersion, Persistence};
use crate::reader::source::BlockSource;
use crate::watcher::Watcher;
use crate::WatcherConfig;
use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Owns a [`Watcher`] and handles OS signals for graceful shutdowns.
pub struct Runner<S, P: Persistence> {
    watcher: Watcher<S, P>,
    shutdown: CancellationToken,
    started: bool,
}

impl<S, P> Runner<S, P>
where
    S: BlockSource + 'static,
    P: Persistence,
{
    /// Creates a new runner and wires a root [`CancellationToken`] into the watcher's
    /// polling task and metrics reporter.
    pub fn new(
        source: S,
        persistence: P,
        versions: Vec<HandlerVersion<P::State>>,
        config: WatcherConfig,
    ) -> Result<Self> {
        let mut watcher = Watcher::from_parts(source, persistence, versions, config)?;
        let shutdown = CancellationToken::new();
        watcher.replace_shutdown_root(shutdown.clone());
        Ok(Self {
            watcher,
            shutdown,
            started: false,
        })
    }

    pub fn watcher(&self) -> &Watcher<S, P> {
        &self.watcher
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.watcher.start();
        self.started = true;
        Ok(())
    }

    /// Stops the polling task by cancelling the root token and waiting for it to exit.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        self.shutdown.cancel();
        self.watcher.stop().await?;
        self.started = false;
        self.reinitialize_shutdown_token();
        Ok(())
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start()?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.shutdown.cancel();
        self.watcher.stop().await?;
        self.started = false;
        self.reinitialize_shutdown_token();
        Ok(())
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.watcher.replace_shutdown_root(self.shutdown.clone());
    }
}
