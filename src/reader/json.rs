//! In-memory [`BlockSource`] over a list of blocks, typically loaded from JSON.

use super::source::BlockSource;
use crate::block::Block;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonBlockSourceError {
    Empty,
    BlockDoesNotExist { block_number: u64 },
    WrongPosition { position: u64, block_number: u64 },
}

impl std::fmt::Display for JsonBlockSourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonBlockSourceError::Empty => write!(f, "json block source holds no blocks"),
            JsonBlockSourceError::BlockDoesNotExist { block_number } => {
                write!(f, "block number {block_number} does not exist")
            }
            JsonBlockSourceError::WrongPosition {
                position,
                block_number,
            } => write!(
                f,
                "block at position {position} claims to be block {block_number}"
            ),
        }
    }
}

impl std::error::Error for JsonBlockSourceError {}

/// Serves blocks `1..=n` from memory. Every block is treated as irreversible, so the
/// head and the last irreversible number are both the last block's number.
#[derive(Debug, Default)]
pub struct JsonBlockSource {
    blocks: RwLock<Vec<Block>>,
}

impl JsonBlockSource {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks: RwLock::new(blocks),
        }
    }

    /// Parses a JSON array of blocks (camelCase fields, actions keyed by `type`).
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let blocks: Vec<Block> =
            serde_json::from_str(raw).context("failed to parse blocks from json")?;
        Ok(Self::new(blocks))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read block file {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Swaps the served chain, e.g. to simulate a reorganization.
    pub fn replace_blocks(&self, blocks: Vec<Block>) {
        let mut guard = self
            .blocks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = blocks;
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Block>> {
        self.blocks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn head(&self) -> Result<u64> {
        let blocks = self.read();
        let last = blocks.last().ok_or(JsonBlockSourceError::Empty)?;
        let position = blocks.len() as u64;
        if last.number() != position {
            return Err(JsonBlockSourceError::WrongPosition {
                position,
                block_number: last.number(),
            }
            .into());
        }
        Ok(position)
    }

    fn get(&self, block_number: u64) -> Result<Block> {
        let blocks = self.read();
        let block = block_number
            .checked_sub(1)
            .and_then(|index| blocks.get(index as usize))
            .ok_or(JsonBlockSourceError::BlockDoesNotExist { block_number })?;
        if block.number() != block_number {
            return Err(JsonBlockSourceError::WrongPosition {
                position: block_number,
                block_number: block.number(),
            }
            .into());
        }
        Ok(block.clone())
    }
}

impl BlockSource for JsonBlockSource {
    fn head_block_number(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { self.head() })
    }

    fn last_irreversible_block_number(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { self.head() })
    }

    fn block(&self, block_number: u64) -> BoxFuture<'_, Result<Block>> {
        Box::pin(async move { self.get(block_number) })
    }
}
