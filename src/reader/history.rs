use crate::block::Block;
use std::collections::VecDeque;

/// Blocks accepted before the reader's current block, oldest first.
///
/// Entries are hash-chained. Anything below the last irreversible block is pruned,
/// except that the newest entry always survives so fork resolution has an anchor.
#[derive(Debug, Clone, Default)]
pub struct BlockHistory {
    items: VecDeque<Block>,
}

impl BlockHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_blocks(blocks: impl IntoIterator<Item = Block>) -> Self {
        Self {
            items: blocks.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, block: Block) {
        self.items.push_back(block);
    }

    pub fn pop(&mut self) -> Option<Block> {
        self.items.pop_back()
    }

    pub fn last(&self) -> Option<&Block> {
        self.items.back()
    }

    pub fn first(&self) -> Option<&Block> {
        self.items.front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Drops entries numbered below `last_irreversible`, keeping at least one entry.
    pub fn prune_below(&mut self, last_irreversible: u64) {
        while self.items.len() > 1
            && matches!(self.items.front(), Some(block) if block.number() < last_irreversible)
        {
            self.items.pop_front();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.items.iter()
    }

    pub fn numbers(&self) -> Vec<u64> {
        self.items.iter().map(Block::number).collect()
    }
}
