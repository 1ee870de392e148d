use crate::block::NextBlock;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Scratch space shared by the updaters of one block and handed, read-only, to the
/// effects those actions trigger.
pub type BlockContext = Map<String, Value>;

pub const DEFAULT_HANDLER_VERSION: &str = "v1";

/// Cursor the handler persists after every block so it can resume after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexState {
    pub block_number: u64,
    pub block_hash: String,
    pub last_irreversible_block_number: u64,
    pub handler_version_name: String,
    pub is_replay: bool,
}

impl Default for IndexState {
    fn default() -> Self {
        Self {
            block_number: 0,
            block_hash: String::new(),
            last_irreversible_block_number: 0,
            handler_version_name: DEFAULT_HANDLER_VERSION.to_owned(),
            is_replay: false,
        }
    }
}

impl IndexState {
    /// Index state describing `next_block` as the last processed block.
    pub fn for_block(next_block: &NextBlock, is_replay: bool, handler_version_name: &str) -> Self {
        Self {
            block_number: next_block.block.number(),
            block_hash: next_block.block.hash().to_owned(),
            last_irreversible_block_number: next_block.last_irreversible_block_number,
            handler_version_name: handler_version_name.to_owned(),
            is_replay,
        }
    }
}

/// Storage adapter driven by [`crate::handler::ActionHandler`].
///
/// Every block is processed inside a session: [`Persistence::begin_block`] hands out a
/// `State` that updaters mutate, and [`Persistence::commit_block`] makes it durable.
/// A state dropped without being committed must leave the store untouched.
pub trait Persistence: Send + Sync + 'static {
    type State: Send + 'static;

    /// One-time setup, run the first time the handler needs the store.
    fn setup(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn load_index_state(&mut self) -> BoxFuture<'_, Result<IndexState>>;

    fn begin_block<'a>(&'a mut self, next_block: &'a NextBlock) -> BoxFuture<'a, Result<Self::State>>;

    /// Records the cursor inside the open session. Called once per block and once more
    /// whenever an updater switches the handler version.
    fn update_index_state<'a>(
        &'a mut self,
        state: &'a mut Self::State,
        next_block: &'a NextBlock,
        is_replay: bool,
        handler_version_name: &'a str,
        context: &'a BlockContext,
    ) -> BoxFuture<'a, Result<()>>;

    fn commit_block(&mut self, state: Self::State) -> BoxFuture<'_, Result<()>>;

    /// Reverts every change made by blocks numbered above `block_number`.
    fn rollback_to(&mut self, block_number: u64) -> BoxFuture<'_, Result<()>>;
}
