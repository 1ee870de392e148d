//! Capability trait implemented by chain adapters.

use crate::block::Block;
use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Answers "what is block N" and "how far has the chain progressed".
///
/// For any segment that has not forked, `block(n).previous_block_hash` must equal
/// `block(n - 1).block_hash`.
pub trait BlockSource: Send + Sync {
    /// One-time setup, run the first time the reader needs the source.
    fn setup(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn head_block_number(&self) -> BoxFuture<'_, Result<u64>>;

    fn last_irreversible_block_number(&self) -> BoxFuture<'_, Result<u64>>;

    fn block(&self, block_number: u64) -> BoxFuture<'_, Result<Block>>;
}

impl<T: BlockSource + ?Sized> BlockSource for Arc<T> {
    fn setup(&self) -> BoxFuture<'_, Result<()>> {
        (**self).setup()
    }

    fn head_block_number(&self) -> BoxFuture<'_, Result<u64>> {
        (**self).head_block_number()
    }

    fn last_irreversible_block_number(&self) -> BoxFuture<'_, Result<u64>> {
        (**self).last_irreversible_block_number()
    }

    fn block(&self, block_number: u64) -> BoxFuture<'_, Result<Block>> {
        (**self).block(block_number)
    }
}
