use super::backoff::RetryBackoff;
use super::history::BlockHistory;
use super::source::BlockSource;
use crate::block::{Block, BlockMeta, NextBlock};
use crate::runtime::config::WatcherConfig;
use crate::runtime::setup::{NotInitializedError, SetupTarget};
use anyhow::Result;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

const RELOAD_INITIAL_BACKOFF_MS: u64 = 25;
const RELOAD_MAX_BACKOFF_MS: u64 = 1_000;

/// Failures raised by [`BlockReader`] itself, as opposed to errors bubbling up from the
/// [`BlockSource`]. Recover them with `anyhow::Error::downcast_ref`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderError {
    ImproperStartAtBlock {
        block_number: u64,
        start_at_block: u64,
    },
    ImproperSeekToBlock {
        block_number: u64,
        head_block_number: u64,
    },
    UnresolvedFork {
        block_number: u64,
        last_irreversible_block_number: u64,
    },
    ReloadHistory {
        attempts: usize,
    },
    ReloadCancelled,
}

impl std::fmt::Display for ReaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderError::ImproperStartAtBlock {
                block_number,
                start_at_block,
            } => write!(
                f,
                "cannot seek to block {block_number} before the configured start block {start_at_block}"
            ),
            ReaderError::ImproperSeekToBlock {
                block_number,
                head_block_number,
            } => write!(
                f,
                "cannot seek to block {block_number}: it does not exist yet (head {head_block_number})"
            ),
            ReaderError::UnresolvedFork {
                block_number,
                last_irreversible_block_number,
            } => write!(
                f,
                "last irreversible block {last_irreversible_block_number} has been passed without resolving fork (at block {block_number})"
            ),
            ReaderError::ReloadHistory { attempts } => {
                write!(f, "could not reload block history after {attempts} attempts")
            }
            ReaderError::ReloadCancelled => write!(f, "block history reload was cancelled"),
        }
    }
}

impl std::error::Error for ReaderError {}

/// Serializable view of the reader's cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderInfo {
    pub current_block_number: u64,
    pub start_at_block: u64,
    pub head_block_number: u64,
    pub only_irreversible: bool,
    pub last_irreversible_block_number: u64,
}

/// Walks a [`BlockSource`] one block at a time, validating the hash chain and
/// resolving forks against a window of recently accepted blocks.
pub struct BlockReader<S> {
    pub(super) source: S,
    pub(super) start_offset: i64,
    pub(super) start_at_block: u64,
    pub(super) current_block_number: u64,
    pub(super) head_block_number: u64,
    pub(super) last_irreversible_block_number: u64,
    pub(super) current_block: Block,
    pub(super) history: BlockHistory,
    pub(super) only_irreversible: bool,
    pub(super) reload_backoff: RetryBackoff,
    pub(super) initialized: bool,
    pub(super) span: Span,
}

impl<S: BlockSource> BlockReader<S> {
    pub fn new(source: S, config: &WatcherConfig) -> Self {
        let start_offset = config.start_at_block();
        // Non-positive offsets are resolved against the head during initialization.
        let start_at_block = u64::try_from(start_offset).unwrap_or(0).max(1);

        Self {
            source,
            start_offset,
            start_at_block,
            current_block_number: start_at_block - 1,
            head_block_number: 0,
            last_irreversible_block_number: 0,
            current_block: Block::sentinel(),
            history: BlockHistory::new(),
            only_irreversible: config.only_irreversible(),
            reload_backoff: RetryBackoff::new(
                Duration::from_millis(RELOAD_INITIAL_BACKOFF_MS),
                Duration::from_millis(RELOAD_MAX_BACKOFF_MS),
                config.history_reload_attempts(),
            ),
            initialized: false,
            span: tracing::info_span!("reader", source = %config.log_source()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn current_block_number(&self) -> u64 {
        self.current_block_number
    }

    pub fn head_block_number(&self) -> u64 {
        self.head_block_number
    }

    pub fn last_irreversible_block_number(&self) -> u64 {
        self.last_irreversible_block_number
    }

    pub fn start_at_block(&self) -> u64 {
        self.start_at_block
    }

    pub fn current_block(&self) -> &Block {
        &self.current_block
    }

    pub fn history(&self) -> &BlockHistory {
        &self.history
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Lets `token` interrupt history reloads waiting out their backoff.
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.reload_backoff.cancellation = Some(token);
    }

    pub fn info(&self) -> ReaderInfo {
        ReaderInfo {
            current_block_number: self.current_block_number,
            start_at_block: self.start_at_block,
            head_block_number: self.head_block_number,
            only_irreversible: self.only_irreversible,
            last_irreversible_block_number: self.last_irreversible_block_number,
        }
    }

    /// Runs the source's setup, loads the chain watermarks and rebuilds history around
    /// the starting position. Called lazily by the other operations; a failed setup is
    /// retried on the next call.
    pub async fn initialize(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.initialize_inner().instrument(span).await
    }

    /// Advances by at most one block, or reports the block the chain was rolled back to.
    pub async fn get_next_block(&mut self) -> Result<NextBlock> {
        let span = self.span.clone();
        self.get_next_block_inner().instrument(span).await
    }

    /// Repositions the reader so that the next call to [`Self::get_next_block`] returns
    /// `block_number`.
    pub async fn seek_to_block(&mut self, block_number: u64) -> Result<()> {
        let span = self.span.clone();
        self.seek_to_block_inner(block_number).instrument(span).await
    }

    async fn initialize_inner(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        self.source
            .setup()
            .await
            .map_err(|err| NotInitializedError::new(SetupTarget::Reader, err))?;

        self.last_irreversible_block_number = self.source.last_irreversible_block_number().await?;
        self.head_block_number = self.latest_needed_block_number().await?;

        if self.start_offset <= 0 {
            let resolved = (self.head_block_number as i64)
                .saturating_add(self.start_offset)
                .max(1) as u64;
            tracing::info!(
                offset = self.start_offset,
                head = self.head_block_number,
                start_at_block = resolved,
                "resolved relative start block"
            );
            self.start_at_block = resolved;
            self.current_block_number = resolved - 1;
            // Resolved once; a later re-initialization keeps the cursor.
            self.start_offset = resolved as i64;
        }

        self.reload_history().await?;
        self.initialized = true;

        tracing::info!(
            start_at_block = self.start_at_block,
            current_block = self.current_block_number,
            head = self.head_block_number,
            last_irreversible = self.last_irreversible_block_number,
            only_irreversible = self.only_irreversible,
            "block reader initialized"
        );
        Ok(())
    }

    async fn get_next_block_inner(&mut self) -> Result<NextBlock> {
        let mut block_meta = BlockMeta::default();
        self.initialize_inner().await?;

        self.last_irreversible_block_number = self.source.last_irreversible_block_number().await?;

        if self.current_block_number == self.head_block_number {
            self.head_block_number = self.latest_needed_block_number().await?;
        }

        if self.current_block_number < self.head_block_number {
            let candidate = self.source.block(self.current_block_number + 1).await?;

            if self.current_block_number == 0 || candidate.previous_hash() == self.current_block.hash()
            {
                self.accept_block(candidate);
                block_meta.is_new_block = true;
            } else {
                tracing::warn!(
                    block_number = candidate.number(),
                    previous_hash = candidate.previous_hash(),
                    expected_previous_hash = self.current_block.hash(),
                    "fork detected; resolving"
                );
                self.resolve_fork().await?;
                block_meta.is_new_block = true;
                block_meta.is_rollback = true;
                // The new branch may be shorter than the one it replaced.
                self.head_block_number = self.latest_needed_block_number().await?;
            }
        }

        block_meta.is_earliest_block = self.current_block_number == self.start_at_block;

        Ok(NextBlock {
            block: self.current_block.clone(),
            block_meta,
            last_irreversible_block_number: self.last_irreversible_block_number,
        })
    }

    async fn seek_to_block_inner(&mut self, block_number: u64) -> Result<()> {
        self.initialize_inner().await?;

        self.head_block_number = self.latest_needed_block_number().await?;
        if block_number < self.start_at_block {
            return Err(ReaderError::ImproperStartAtBlock {
                block_number,
                start_at_block: self.start_at_block,
            }
            .into());
        }
        if block_number > self.head_block_number + 1 {
            return Err(ReaderError::ImproperSeekToBlock {
                block_number,
                head_block_number: self.head_block_number,
            }
            .into());
        }

        tracing::info!(
            from = self.current_block_number + 1,
            to = block_number,
            "seeking to block"
        );
        self.current_block_number = block_number - 1;
        if let Err(err) = self.reload_history().await {
            // History no longer matches the cursor; the next call rebuilds it.
            self.initialized = false;
            return Err(err);
        }
        Ok(())
    }

    fn accept_block(&mut self, block: Block) {
        tracing::debug!(
            block_number = block.number(),
            block_hash = block.hash(),
            "accepted block"
        );
        self.current_block_number = block.number();
        let previous = std::mem::replace(&mut self.current_block, block);
        self.history.push(previous);
        self.history.prune_below(self.last_irreversible_block_number);
    }

    pub(super) async fn latest_needed_block_number(&self) -> Result<u64> {
        if self.only_irreversible {
            self.source.last_irreversible_block_number().await
        } else {
            self.source.head_block_number().await
        }
    }
}
