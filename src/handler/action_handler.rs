use super::effects::{DeferredEffects, EffectRunMode, EffectTracker, PendingEffect};
use super::persistence::{BlockContext, Persistence, DEFAULT_HANDLER_VERSION};
use super::version::{ActionMatcher, ExactMatch, HandlerVersion};
use crate::block::{Action, NextBlock};
use crate::runtime::config::WatcherConfig;
use crate::runtime::setup::{NotInitializedError, SetupTarget};
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Instrument, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    MissingHandlerVersion,
    DuplicateHandlerVersion {
        version_name: String,
    },
    MismatchedBlockHash {
        block_number: u64,
        expected_hash: String,
        actual_hash: String,
    },
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::MissingHandlerVersion => {
                write!(f, "must have at least one handler version")
            }
            HandlerError::DuplicateHandlerVersion { version_name } => {
                write!(f, "handler version name '{version_name}' already exists")
            }
            HandlerError::MismatchedBlockHash {
                block_number,
                expected_hash,
                actual_hash,
            } => write!(
                f,
                "block hashes do not match; block {block_number}'s previous hash was {actual_hash}, expected {expected_hash}"
            ),
        }
    }
}

impl std::error::Error for HandlerError {}

/// An action tagged with the handler version that was active once its updaters ran.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedAction {
    pub action: Action,
    pub handler_version_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerInfo {
    pub last_processed_block_number: u64,
    pub last_processed_block_hash: String,
    pub last_irreversible_block_number: u64,
    pub handler_version_name: String,
    pub is_replay: bool,
    pub effect_run_mode: EffectRunMode,
    pub number_of_running_effects: usize,
    pub effect_errors: Vec<String>,
}

/// Applies updaters and dispatches effects for each block handed over by the watcher,
/// keeping the persisted cursor and the active handler version in sync.
pub struct ActionHandler<P: Persistence> {
    persistence: P,
    versions: HashMap<String, Arc<HandlerVersion<P::State>>>,
    handler_version_name: String,
    last_processed_block_number: u64,
    last_processed_block_hash: String,
    last_irreversible_block_number: u64,
    is_replay: bool,
    deferred: DeferredEffects,
    effects: EffectTracker,
    effect_run_mode: EffectRunMode,
    validate_blocks: bool,
    matcher: Arc<dyn ActionMatcher>,
    warned_unknown_version: Option<String>,
    initialized: bool,
    span: Span,
}

impl<P: Persistence> ActionHandler<P> {
    pub fn new(
        persistence: P,
        versions: Vec<HandlerVersion<P::State>>,
        config: &WatcherConfig,
    ) -> Result<Self> {
        let span = tracing::info_span!("handler", source = %config.log_source());
        let first_name = versions
            .first()
            .map(|version| version.version_name().to_owned())
            .ok_or(HandlerError::MissingHandlerVersion)?;

        let mut registered = HashMap::with_capacity(versions.len());
        for version in versions {
            let name = version.version_name().to_owned();
            if registered.contains_key(&name) {
                return Err(HandlerError::DuplicateHandlerVersion { version_name: name }.into());
            }
            registered.insert(name, Arc::new(version));
        }

        let handler_version_name = if registered.contains_key(DEFAULT_HANDLER_VERSION) {
            if first_name != DEFAULT_HANDLER_VERSION {
                span.in_scope(|| {
                    tracing::warn!(
                        first = %first_name,
                        "first handler version is not '{DEFAULT_HANDLER_VERSION}', but '{DEFAULT_HANDLER_VERSION}' is present and will be used"
                    )
                });
            }
            DEFAULT_HANDLER_VERSION.to_owned()
        } else {
            span.in_scope(|| {
                tracing::warn!(
                    using = %first_name,
                    "no handler version named '{DEFAULT_HANDLER_VERSION}'; starting with the first registered version"
                )
            });
            first_name
        };

        Ok(Self {
            persistence,
            versions: registered,
            handler_version_name,
            last_processed_block_number: 0,
            last_processed_block_hash: String::new(),
            last_irreversible_block_number: 0,
            is_replay: false,
            deferred: DeferredEffects::default(),
            effects: EffectTracker::new(config.max_effect_errors()),
            effect_run_mode: config.effect_run_mode(),
            validate_blocks: config.validate_blocks(),
            matcher: Arc::new(ExactMatch),
            warned_unknown_version: None,
            initialized: false,
            span,
        })
    }

    /// Replaces the default exact-equality action type matching.
    pub fn with_action_matcher(mut self, matcher: impl ActionMatcher + 'static) -> Self {
        self.matcher = Arc::new(matcher);
        self
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    pub fn persistence_mut(&mut self) -> &mut P {
        &mut self.persistence
    }

    pub fn handler_version_name(&self) -> &str {
        &self.handler_version_name
    }

    pub fn last_processed_block_number(&self) -> u64 {
        self.last_processed_block_number
    }

    pub fn last_processed_block_hash(&self) -> &str {
        &self.last_processed_block_hash
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of effects waiting for their block to become irreversible.
    pub fn deferred_effect_count(&self) -> usize {
        self.deferred.len()
    }

    pub fn info(&mut self) -> HandlerInfo {
        self.effects.drain_finished();
        HandlerInfo {
            last_processed_block_number: self.last_processed_block_number,
            last_processed_block_hash: self.last_processed_block_hash.clone(),
            last_irreversible_block_number: self.last_irreversible_block_number,
            handler_version_name: self.handler_version_name.clone(),
            is_replay: self.is_replay,
            effect_run_mode: self.effect_run_mode,
            number_of_running_effects: self.effects.running(),
            effect_errors: self.effects.errors(),
        }
    }

    /// Runs the store's setup and loads the persisted cursor. Idempotent.
    pub async fn initialize(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.initialize_inner().instrument(span).await
    }

    /// Processes one block. Returns `Some(n)` when the watcher must seek the reader to
    /// block `n` before handing over anything else.
    pub async fn handle_block(
        &mut self,
        next_block: &NextBlock,
        is_replay: bool,
    ) -> Result<Option<u64>> {
        let span = self.span.clone();
        self.handle_block_inner(next_block, is_replay)
            .instrument(span)
            .await
    }

    async fn initialize_inner(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.persistence
            .setup()
            .await
            .map_err(|err| NotInitializedError::new(SetupTarget::Handler, err))?;
        self.refresh_index_state().await?;
        self.initialized = true;
        tracing::debug!(
            last_processed = self.last_processed_block_number,
            version = %self.handler_version_name,
            "action handler initialized"
        );
        Ok(())
    }

    async fn handle_block_inner(
        &mut self,
        next_block: &NextBlock,
        is_replay: bool,
    ) -> Result<Option<u64>> {
        let block_info = next_block.block_info();
        let meta = next_block.block_meta;

        if !self.initialized {
            tracing::info!("action handler was not initialized before use; initializing now");
            self.initialize_inner().await?;
        }

        if meta.is_rollback || (is_replay && meta.is_earliest_block) {
            self.rollback(block_info.block_number).await?;
        }

        self.refresh_index_state().await?;
        let next_needed = self.last_processed_block_number + 1;

        if block_info.block_number == self.last_processed_block_number
            && block_info.block_hash == self.last_processed_block_hash
        {
            tracing::debug!(
                block_number = block_info.block_number,
                "block was just handled; skipping"
            );
            return Ok(None);
        }

        let has_cursor = !self.last_processed_block_hash.is_empty();
        if meta.is_earliest_block && has_cursor && block_info.block_number != next_needed {
            tracing::info!(
                block_number = block_info.block_number,
                next_needed,
                "starting block is behind the persisted cursor; requesting seek"
            );
            return Ok(Some(next_needed));
        }

        if self.validate_blocks && (!meta.is_earliest_block || has_cursor) {
            if block_info.block_number != next_needed {
                tracing::debug!(
                    block_number = block_info.block_number,
                    next_needed,
                    "received unexpected block; requesting seek"
                );
                return Ok(Some(next_needed));
            }
            if has_cursor && block_info.previous_block_hash != self.last_processed_block_hash {
                return Err(HandlerError::MismatchedBlockHash {
                    block_number: block_info.block_number,
                    expected_hash: self.last_processed_block_hash.clone(),
                    actual_hash: block_info.previous_block_hash.clone(),
                }
                .into());
            }
        }

        self.handle_with_state(next_block, is_replay).await?;
        Ok(None)
    }

    async fn rollback(&mut self, block_number: u64) -> Result<()> {
        let rollback_to = block_number.saturating_sub(1);
        let rollback_count = self.last_processed_block_number.saturating_sub(rollback_to);
        self.persistence
            .rollback_to(rollback_to)
            .await
            .with_context(|| format!("failed to roll back to block {rollback_to}"))?;
        let dropped = self.deferred.discard_from(block_number);
        tracing::info!(
            rollback_to,
            rollback_count,
            dropped_deferred_effects = dropped,
            "rolled back"
        );
        Ok(())
    }

    async fn refresh_index_state(&mut self) -> Result<()> {
        let index_state = self
            .persistence
            .load_index_state()
            .await
            .context("failed to load index state")?;

        self.last_processed_block_number = index_state.block_number;
        self.last_processed_block_hash = index_state.block_hash;
        self.last_irreversible_block_number = index_state.last_irreversible_block_number;
        self.is_replay = index_state.is_replay;

        let persisted = index_state.handler_version_name;
        if self.versions.contains_key(&persisted) {
            self.handler_version_name = persisted;
        } else if self.warned_unknown_version.as_deref() != Some(persisted.as_str()) {
            tracing::warn!(
                persisted = %persisted,
                active = %self.handler_version_name,
                "persisted handler version is not registered; keeping the active version"
            );
            self.warned_unknown_version = Some(persisted);
        }
        Ok(())
    }

    async fn handle_with_state(&mut self, next_block: &NextBlock, is_replay: bool) -> Result<()> {
        let block_info = next_block.block_info();
        let mut state = self
            .persistence
            .begin_block(next_block)
            .await
            .with_context(|| format!("failed to open state for block {}", block_info.block_number))?;

        let mut context = BlockContext::new();
        let versioned_actions = self
            .apply_updaters(&mut state, next_block, &mut context, is_replay)
            .await?;
        let context = Arc::new(context);

        if !is_replay {
            self.run_effects(&versioned_actions, &context, next_block);
        }

        let version_name = self.handler_version_name.clone();
        self.persistence
            .update_index_state(&mut state, next_block, is_replay, &version_name, &context)
            .await
            .context("failed to update index state")?;
        self.persistence
            .commit_block(state)
            .await
            .with_context(|| format!("failed to commit block {}", block_info.block_number))?;

        self.last_processed_block_number = block_info.block_number;
        self.last_processed_block_hash = block_info.block_hash.clone();
        self.last_irreversible_block_number = next_block.last_irreversible_block_number;
        self.is_replay = is_replay;
        self.effects.drain_finished();

        tracing::debug!(
            block_number = block_info.block_number,
            actions = versioned_actions.len(),
            version = %self.handler_version_name,
            "handled block"
        );
        Ok(())
    }

    /// Runs the active version's matching updaters for every action of the block.
    /// An updater that switches versions ends the updater scan for its action.
    pub async fn apply_updaters(
        &mut self,
        state: &mut P::State,
        next_block: &NextBlock,
        context: &mut BlockContext,
        is_replay: bool,
    ) -> Result<Vec<VersionedAction>> {
        let block_info = next_block.block_info();
        let mut versioned_actions = Vec::with_capacity(next_block.block.actions.len());

        for action in &next_block.block.actions {
            let version = self.active_version()?;
            let updaters = version.updaters();

            for (index, updater) in updaters.iter().enumerate() {
                if !self
                    .matcher
                    .matches(&action.action_type, updater.action_type(), &action.payload)
                {
                    continue;
                }

                let switched = updater
                    .apply(state, &action.payload, block_info, context)
                    .await
                    .with_context(|| {
                        format!(
                            "updater for '{}' failed at block {}",
                            action.action_type, block_info.block_number
                        )
                    })?;

                let Some(new_version) = switched else {
                    continue;
                };
                if !self.versions.contains_key(&new_version) {
                    tracing::warn!(
                        requested = %new_version,
                        active = %self.handler_version_name,
                        "attempted to switch to a handler version that does not exist"
                    );
                    continue;
                }

                let skipped = updaters.len() - index - 1;
                if skipped > 0 {
                    tracing::warn!(
                        version = %new_version,
                        skipped,
                        action_type = %action.action_type,
                        "handler version changed with updaters left; skipping them for this action"
                    );
                }
                tracing::info!(
                    version = %new_version,
                    block_number = block_info.block_number,
                    "updated handler version"
                );
                self.persistence
                    .update_index_state(state, next_block, is_replay, &new_version, context)
                    .await
                    .context("failed to record handler version change")?;
                self.handler_version_name = new_version;
                break;
            }

            versioned_actions.push(VersionedAction {
                action: action.clone(),
                handler_version_name: self.handler_version_name.clone(),
            });
        }

        Ok(versioned_actions)
    }

    /// Launches deferred effects that became irreversible, then launches or defers the
    /// effects triggered by this block's actions.
    pub fn run_effects(
        &mut self,
        versioned_actions: &[VersionedAction],
        context: &Arc<BlockContext>,
        next_block: &NextBlock,
    ) {
        let last_irreversible = next_block.last_irreversible_block_number;
        let ready = self.deferred.take_irreversible(last_irreversible);
        if !ready.is_empty() {
            tracing::debug!(
                last_irreversible,
                count = ready.len(),
                "running deferred effects for irreversible blocks"
            );
        }
        for pending in ready {
            let handle = pending.launch(self.span.clone());
            self.effects.push(handle);
        }

        let block_info = next_block.block_info();
        for versioned in versioned_actions {
            let Some(version) = self.versions.get(&versioned.handler_version_name) else {
                continue;
            };
            for effect in version.effects() {
                let deferred = effect.defer_until_irreversible();
                let action = &versioned.action;
                if !self
                    .matcher
                    .matches(&action.action_type, effect.action_type(), &action.payload)
                    || !self.effect_run_mode.allows(deferred)
                {
                    continue;
                }

                let pending = PendingEffect {
                    effect: Arc::clone(effect),
                    action: action.clone(),
                    block_info: block_info.clone(),
                    context: Arc::clone(context),
                };
                if !deferred || block_info.block_number <= last_irreversible {
                    self.effects.push(pending.launch(self.span.clone()));
                } else {
                    tracing::debug!(
                        action_type = %action.action_type,
                        block_number = block_info.block_number,
                        "deferring effect until block is irreversible"
                    );
                    self.deferred.defer(pending);
                }
            }
        }
    }

    fn active_version(&self) -> Result<Arc<HandlerVersion<P::State>>> {
        self.versions
            .get(&self.handler_version_name)
            .cloned()
            .ok_or_else(|| anyhow!("handler version '{}' is not registered", self.handler_version_name))
    }
}
