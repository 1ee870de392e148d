//! Fork resolution and history reloading for [`BlockReader`].

use super::backoff::{retry_with_backoff, RetryDisposition, RetryFailure};
use super::block_reader::{BlockReader, ReaderError};
use super::history::BlockHistory;
use super::source::BlockSource;
use crate::block::Block;
use anyhow::Result;

/// Raised while refetching history when two consecutive blocks do not link up, which
/// means the chain moved underneath the reload.
#[derive(Debug)]
struct MicroFork {
    block_number: u64,
}

impl std::fmt::Display for MicroFork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "block {} does not link to its predecessor",
            self.block_number
        )
    }
}

impl std::error::Error for MicroFork {}

impl<S: BlockSource> BlockReader<S> {
    /// Walks back through history, refetching the current block at each step, until the
    /// canonical chain links to a remembered block again.
    pub(super) async fn resolve_fork(&mut self) -> Result<()> {
        loop {
            if self.history.is_empty() {
                self.add_previous_block_to_history().await?;
            }
            let Some(previous) = self.history.last() else {
                break;
            };

            let refetch_number = self.current_block.number();
            tracing::info!(block_number = refetch_number, "refetching block");
            let refetched = self.source.block(refetch_number).await?;

            if previous.is_sentinel() || refetched.previous_hash() == previous.hash() {
                tracing::info!(
                    block_number = refetched.number(),
                    block_hash = refetched.hash(),
                    previous_block_number = previous.number(),
                    "fork resolved"
                );
                self.current_block = refetched;
                break;
            }

            tracing::info!(
                block_number = refetched.number(),
                previous_hash = refetched.previous_hash(),
                remembered_number = previous.number(),
                remembered_hash = previous.hash(),
                "refetched block does not link to history; stepping back"
            );
            if let Some(popped) = self.history.pop() {
                self.current_block = popped;
            }
        }

        self.current_block_number = self
            .history
            .last()
            .map(|block| block.number() + 1)
            .unwrap_or_else(|| self.current_block.number());
        Ok(())
    }

    async fn add_previous_block_to_history(&mut self) -> Result<()> {
        let current = self.current_block.number();
        if current <= self.last_irreversible_block_number {
            return Err(ReaderError::UnresolvedFork {
                block_number: current,
                last_irreversible_block_number: self.last_irreversible_block_number,
            }
            .into());
        }

        let previous = match current {
            0 | 1 => Block::sentinel(),
            _ => self.source.block(current - 1).await?,
        };
        self.history.push(previous);
        Ok(())
    }

    /// Rebuilds history so that `current_block_number` is the current block and the
    /// blocks before it, back to the irreversible watermark, are cached.
    pub(super) async fn reload_history(&mut self) -> Result<()> {
        let current = self.current_block_number;
        if current == 0 {
            self.history.clear();
            self.current_block = Block::sentinel();
            return Ok(());
        }
        if current == 1 {
            self.history = BlockHistory::from_blocks([Block::sentinel()]);
            self.current_block = self.source.block(1).await?;
            return Ok(());
        }

        let mut first = self.last_irreversible_block_number.max(1);
        if first >= current {
            first = current - 1;
        }

        let source = &self.source;
        let max_attempts = self.reload_backoff.max_attempts;
        let fetched = retry_with_backoff(
            self.reload_backoff.clone(),
            |_| fetch_linked_range(source, first, current),
            |attempt, backoff, err, will_retry| {
                if will_retry {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "history reload hit a micro-fork; retrying"
                    );
                } else {
                    tracing::error!(
                        attempt,
                        max_attempts,
                        error = %err,
                        "history reload hit a micro-fork; giving up"
                    );
                }
            },
            |err| {
                if err.downcast_ref::<MicroFork>().is_some() {
                    RetryDisposition::Retry
                } else {
                    RetryDisposition::Abort
                }
            },
        )
        .await;

        let mut blocks = match fetched {
            Ok(blocks) => blocks,
            Err(RetryFailure::Exhausted { attempts, .. }) => {
                return Err(ReaderError::ReloadHistory { attempts }.into());
            }
            Err(RetryFailure::Aborted(err)) => return Err(err),
            Err(RetryFailure::Cancelled { attempts }) => {
                tracing::info!(attempts, "history reload cancelled");
                return Err(ReaderError::ReloadCancelled.into());
            }
        };

        if let Some(last) = blocks.pop() {
            self.current_block = last;
        }
        self.history = BlockHistory::from_blocks(blocks);
        tracing::debug!(
            first,
            current,
            history_len = self.history.len(),
            "history reloaded"
        );
        Ok(())
    }
}

async fn fetch_linked_range<S: BlockSource>(source: &S, first: u64, last: u64) -> Result<Vec<Block>> {
    let mut blocks: Vec<Block> = Vec::with_capacity((last - first + 1) as usize);
    for block_number in first..=last {
        let block = source.block(block_number).await?;
        if let Some(previous) = blocks.last() {
            if block.previous_hash() != previous.hash() {
                return Err(MicroFork { block_number }.into());
            }
        }
        blocks.push(block);
    }
    Ok(blocks)
}
