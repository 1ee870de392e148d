//! Effect scheduling: run-mode gating, pollable task handles, the capped error
//! buffer and the queue of effects waiting for irreversibility.

use super::persistence::BlockContext;
use super::version::Effect;
use crate::block::{Action, BlockInfo};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Which effects the handler is allowed to launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EffectRunMode {
    #[default]
    All,
    OnlyImmediate,
    OnlyDeferred,
    None,
}

impl EffectRunMode {
    pub fn allows(self, deferred: bool) -> bool {
        match self {
            EffectRunMode::All => true,
            EffectRunMode::OnlyImmediate => !deferred,
            EffectRunMode::OnlyDeferred => deferred,
            EffectRunMode::None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectStatus {
    Pending,
    Fulfilled,
    Rejected(String),
}

/// An effect invocation captured with everything it needs to run later.
pub(crate) struct PendingEffect {
    pub effect: Arc<dyn Effect>,
    pub action: Action,
    pub block_info: BlockInfo,
    pub context: Arc<BlockContext>,
}

impl PendingEffect {
    pub(crate) fn launch(self, span: tracing::Span) -> EffectHandle {
        let action_type = self.action.action_type.clone();
        let block_number = self.block_info.block_number;
        tracing::debug!(
            action_type = %action_type,
            block_number,
            "running effect"
        );
        let run = self
            .effect
            .run(self.action.payload, self.block_info, self.context);
        EffectHandle {
            action_type,
            block_number,
            task: Some(tokio::spawn(run.instrument(span))),
            status: EffectStatus::Pending,
        }
    }
}

/// Handle to a spawned effect that can be queried without blocking.
#[derive(Debug)]
pub struct EffectHandle {
    action_type: String,
    block_number: u64,
    task: Option<JoinHandle<anyhow::Result<()>>>,
    status: EffectStatus,
}

impl EffectHandle {
    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    /// Current outcome. Once settled the result is cached and the task is released.
    pub fn status(&mut self) -> &EffectStatus {
        let settled = match self.task.as_mut() {
            Some(task) if task.is_finished() => task.now_or_never(),
            _ => None,
        };

        if let Some(outcome) = settled {
            self.task = None;
            self.status = match outcome {
                Ok(Ok(())) => EffectStatus::Fulfilled,
                Ok(Err(err)) => EffectStatus::Rejected(format!(
                    "effect for '{}' at block {} failed: {err:#}",
                    self.action_type, self.block_number
                )),
                Err(join_err) => EffectStatus::Rejected(format!(
                    "effect for '{}' at block {} did not complete: {join_err}",
                    self.action_type, self.block_number
                )),
            };
        }

        &self.status
    }
}

/// Running effects plus a FIFO of the most recent failures.
#[derive(Debug)]
pub(crate) struct EffectTracker {
    running: Vec<EffectHandle>,
    errors: VecDeque<String>,
    max_errors: usize,
}

impl EffectTracker {
    pub(crate) fn new(max_errors: usize) -> Self {
        Self {
            running: Vec::new(),
            errors: VecDeque::new(),
            max_errors,
        }
    }

    pub(crate) fn push(&mut self, handle: EffectHandle) {
        self.running.push(handle);
    }

    /// Drops settled handles, recording the error text of rejected ones.
    pub(crate) fn drain_finished(&mut self) {
        let mut still_running = Vec::with_capacity(self.running.len());
        for mut handle in self.running.drain(..) {
            match handle.status().clone() {
                EffectStatus::Pending => still_running.push(handle),
                EffectStatus::Fulfilled => {}
                EffectStatus::Rejected(message) => {
                    tracing::warn!(
                        action_type = handle.action_type(),
                        block_number = handle.block_number(),
                        error = %message,
                        "effect failed"
                    );
                    self.errors.push_back(message);
                }
            }
        }
        self.running = still_running;

        while self.errors.len() > self.max_errors {
            self.errors.pop_front();
        }
    }

    pub(crate) fn running(&self) -> usize {
        self.running.len()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.iter().cloned().collect()
    }
}

/// Effects waiting for their block to become irreversible, keyed by block number.
#[derive(Default)]
pub(crate) struct DeferredEffects {
    queue: BTreeMap<u64, Vec<PendingEffect>>,
}

impl DeferredEffects {
    pub(crate) fn defer(&mut self, pending: PendingEffect) {
        self.queue
            .entry(pending.block_info.block_number)
            .or_default()
            .push(pending);
    }

    /// Removes and returns, in block order, every effect whose block is at or below
    /// `last_irreversible`.
    pub(crate) fn take_irreversible(&mut self, last_irreversible: u64) -> Vec<PendingEffect> {
        let later = self.queue.split_off(&last_irreversible.saturating_add(1));
        let ready = std::mem::replace(&mut self.queue, later);
        ready.into_values().flatten().collect()
    }

    /// Drops effects of blocks numbered `block_number` and above. Returns how many were
    /// dropped.
    pub(crate) fn discard_from(&mut self, block_number: u64) -> usize {
        self.queue
            .split_off(&block_number)
            .into_values()
            .map(|effects| effects.len())
            .sum()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.values().map(Vec::len).sum()
    }

    pub(crate) fn block_numbers(&self) -> Vec<u64> {
        self.queue.keys().copied().collect()
    }
}
