use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use forkwatch::{Action, Block, BlockInfo, BlockSource};
use futures::future::BoxFuture;
use serde_json::json;

pub const COUNTER_ADD: &str = "counter::add";

#[derive(Default)]
struct ChainState {
    blocks: Vec<Block>,
    last_irreversible: u64,
    failing_setups: usize,
    failing_requests: usize,
    block_delay: Duration,
}

/// Mutable chain that can be extended, forked and made to fail on demand.
#[derive(Clone, Default)]
pub struct MemoryChain {
    state: Arc<Mutex<ChainState>>,
}

impl MemoryChain {
    pub fn new(len: u64) -> Self {
        let chain = Self::default();
        chain.extend(len, "a");
        chain
    }

    pub fn make_block(number: u64, tag: &str, previous_hash: &str) -> Block {
        let timestamp = Utc.timestamp_opt(1_528_285_617, 0).single().unwrap_or_default()
            + ChronoDuration::milliseconds(500 * number as i64);
        Block::new(
            BlockInfo::new(number, format!("{tag}-{number}"), previous_hash, timestamp),
            vec![Action::new(COUNTER_ADD, json!({ "amount": number }))],
        )
    }

    /// Appends `count` blocks whose hashes carry `tag`.
    pub fn extend(&self, count: u64, tag: &str) {
        let mut state = self.lock();
        for _ in 0..count {
            let number = state.blocks.len() as u64 + 1;
            let previous = state
                .blocks
                .last()
                .map(|block| block.hash().to_owned())
                .unwrap_or_default();
            state.blocks.push(Self::make_block(number, tag, &previous));
        }
    }

    /// Drops every block above `keep` and grows `count` replacement blocks on top.
    pub fn fork_from(&self, keep: u64, count: u64, tag: &str) {
        self.lock().blocks.truncate(keep as usize);
        self.extend(count, tag);
    }

    pub fn set_last_irreversible(&self, block_number: u64) {
        self.lock().last_irreversible = block_number;
    }

    pub fn fail_setups(&self, count: usize) {
        self.lock().failing_setups = count;
    }

    pub fn fail_requests(&self, count: usize) {
        self.lock().failing_requests = count;
    }

    /// Makes every `block()` call take at least `delay`.
    pub fn set_block_delay(&self, delay: Duration) {
        self.lock().block_delay = delay;
    }

    pub fn head(&self) -> u64 {
        self.lock().blocks.len() as u64
    }

    pub fn hash_of(&self, block_number: u64) -> Option<String> {
        self.lock()
            .blocks
            .get(block_number.checked_sub(1)? as usize)
            .map(|block| block.hash().to_owned())
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_request(&self) -> Result<()> {
        let mut state = self.lock();
        if state.failing_requests > 0 {
            state.failing_requests -= 1;
            bail!("injected source failure");
        }
        Ok(())
    }
}

impl BlockSource for MemoryChain {
    fn setup(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.failing_setups > 0 {
                state.failing_setups -= 1;
                bail!("chain endpoint unreachable");
            }
            Ok(())
        })
    }

    fn head_block_number(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            self.check_request()?;
            Ok(self.head())
        })
    }

    fn last_irreversible_block_number(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            self.check_request()?;
            let state = self.lock();
            Ok(state.last_irreversible.min(state.blocks.len() as u64))
        })
    }

    fn block(&self, block_number: u64) -> BoxFuture<'_, Result<Block>> {
        Box::pin(async move {
            let delay = self.lock().block_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.check_request()?;
            let state = self.lock();
            block_number
                .checked_sub(1)
                .and_then(|index| state.blocks.get(index as usize))
                .cloned()
                .ok_or_else(|| anyhow!("block {block_number} is not on the chain"))
        })
    }
}
