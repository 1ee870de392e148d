//! Chain-agnostic block, action, and reader envelope types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header fields the engine needs to chain blocks together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub block_number: u64,
    pub block_hash: String,
    pub previous_block_hash: String,
    pub timestamp: DateTime<Utc>,
}

impl BlockInfo {
    pub fn new(
        block_number: u64,
        block_hash: impl Into<String>,
        previous_block_hash: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            block_number,
            block_hash: block_hash.into(),
            previous_block_hash: previous_block_hash.into(),
            timestamp,
        }
    }
}

/// A single typed action extracted from a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Action {
    pub fn new(action_type: impl Into<String>, payload: Value) -> Self {
        Self {
            action_type: action_type.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub block_info: BlockInfo,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Block {
    pub fn new(block_info: BlockInfo, actions: Vec<Action>) -> Self {
        Self {
            block_info,
            actions,
        }
    }

    /// Placeholder that sits "before" block 1. Its empty hash is what block 1 links to.
    pub fn sentinel() -> Self {
        Self {
            block_info: BlockInfo {
                block_number: 0,
                block_hash: String::new(),
                previous_block_hash: String::new(),
                timestamp: DateTime::<Utc>::default(),
            },
            actions: Vec::new(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.block_info.block_number == 0 && self.block_info.block_hash.is_empty()
    }

    pub fn number(&self) -> u64 {
        self.block_info.block_number
    }

    pub fn hash(&self) -> &str {
        &self.block_info.block_hash
    }

    pub fn previous_hash(&self) -> &str {
        &self.block_info.previous_block_hash
    }
}

/// Flags describing how a returned block relates to the previous reader call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub is_rollback: bool,
    pub is_new_block: bool,
    pub is_earliest_block: bool,
}

/// Envelope produced by every [`crate::BlockReader::get_next_block`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextBlock {
    pub block: Block,
    pub block_meta: BlockMeta,
    pub last_irreversible_block_number: u64,
}

impl NextBlock {
    pub fn block_info(&self) -> &BlockInfo {
        &self.block.block_info
    }
}
