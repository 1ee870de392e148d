use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use forkwatch::{BlockContext, IndexState, NextBlock, Persistence};
use futures::future::BoxFuture;

#[derive(Debug, Clone)]
pub struct CommittedBlock {
    pub block_hash: String,
    pub amount: u64,
    pub index_state: IndexState,
}

#[derive(Default)]
pub struct StoreState {
    pub committed: BTreeMap<u64, CommittedBlock>,
    pub total: u64,
    pub index_state: IndexState,
    pub rollbacks: Vec<u64>,
}

/// Uncommitted changes for one block.
pub struct PendingBlock {
    pub block_number: u64,
    pub block_hash: String,
    pub amount: u64,
    index_state: Option<IndexState>,
}

impl PendingBlock {
    pub fn add(&mut self, amount: u64) {
        self.amount += amount;
    }
}

/// [`Persistence`] keeping a running total in memory; tests inspect it through a clone.
#[derive(Clone, Default)]
pub struct RecordingStore {
    state: Arc<Mutex<StoreState>>,
}

impl RecordingStore {
    /// Store that already processed up to `index_state.block_number`.
    pub fn resuming_from(index_state: IndexState) -> Self {
        let store = Self::default();
        store.lock().index_state = index_state;
        store
    }

    pub fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn applied_numbers(&self) -> Vec<u64> {
        self.lock().committed.keys().copied().collect()
    }

    pub fn applied_hash(&self, block_number: u64) -> Option<String> {
        self.lock()
            .committed
            .get(&block_number)
            .map(|block| block.block_hash.clone())
    }

    pub fn cursor(&self) -> IndexState {
        self.lock().index_state.clone()
    }

    pub fn rollbacks(&self) -> Vec<u64> {
        self.lock().rollbacks.clone()
    }
}

impl Persistence for RecordingStore {
    type State = PendingBlock;

    fn load_index_state(&mut self) -> BoxFuture<'_, Result<IndexState>> {
        Box::pin(async move { Ok(self.cursor()) })
    }

    fn begin_block<'a>(&'a mut self, next_block: &'a NextBlock) -> BoxFuture<'a, Result<PendingBlock>> {
        Box::pin(async move {
            Ok(PendingBlock {
                block_number: next_block.block.number(),
                block_hash: next_block.block.hash().to_owned(),
                amount: 0,
                index_state: None,
            })
        })
    }

    fn update_index_state<'a>(
        &'a mut self,
        state: &'a mut PendingBlock,
        next_block: &'a NextBlock,
        is_replay: bool,
        handler_version_name: &'a str,
        _context: &'a BlockContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            state.index_state = Some(IndexState::for_block(
                next_block,
                is_replay,
                handler_version_name,
            ));
            Ok(())
        })
    }

    fn commit_block(&mut self, state: PendingBlock) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut store = self.lock();
            let index_state = state.index_state.unwrap_or_else(|| store.index_state.clone());
            store.total += state.amount;
            store.index_state = index_state.clone();
            store.committed.insert(
                state.block_number,
                CommittedBlock {
                    block_hash: state.block_hash,
                    amount: state.amount,
                    index_state,
                },
            );
            Ok(())
        })
    }

    fn rollback_to(&mut self, block_number: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut store = self.lock();
            let reverted: u64 = store
                .committed
                .split_off(&(block_number + 1))
                .values()
                .map(|block| block.amount)
                .sum();
            store.total -= reverted;
            store.index_state = store
                .committed
                .values()
                .next_back()
                .map(|block| block.index_state.clone())
                .unwrap_or_default();
            store.rollbacks.push(block_number);
            Ok(())
        })
    }
}
