use super::persistence::BlockContext;
use crate::block::BlockInfo;
use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Deterministic state transition bound to one action type.
///
/// Returning `Some(name)` asks the handler to switch to the handler version `name`
/// starting with the next action.
pub trait Updater<S>: Send + Sync {
    fn action_type(&self) -> &str;

    fn apply<'a>(
        &'a self,
        state: &'a mut S,
        payload: &'a Value,
        block_info: &'a BlockInfo,
        context: &'a mut BlockContext,
    ) -> BoxFuture<'a, Result<Option<String>>>;
}

/// Side effect bound to one action type. Effects run as detached tasks and never block
/// block processing.
pub trait Effect: Send + Sync {
    fn action_type(&self) -> &str;

    /// Hold the effect back until its block is irreversible.
    fn defer_until_irreversible(&self) -> bool {
        false
    }

    fn run(
        &self,
        payload: Value,
        block_info: BlockInfo,
        context: Arc<BlockContext>,
    ) -> BoxFuture<'static, Result<()>>;
}

/// Decides whether an incoming action type triggers a subscribed updater or effect.
pub trait ActionMatcher: Send + Sync {
    fn matches(&self, candidate_type: &str, subscribed_type: &str, payload: &Value) -> bool;
}

/// Default matcher: plain string equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl ActionMatcher for ExactMatch {
    fn matches(&self, candidate_type: &str, subscribed_type: &str, _payload: &Value) -> bool {
        candidate_type == subscribed_type
    }
}

impl<F> ActionMatcher for F
where
    F: Fn(&str, &str, &Value) -> bool + Send + Sync,
{
    fn matches(&self, candidate_type: &str, subscribed_type: &str, payload: &Value) -> bool {
        self(candidate_type, subscribed_type, payload)
    }
}

/// Updater backed by a synchronous closure.
pub struct FnUpdater<F> {
    action_type: String,
    apply: F,
}

impl<F> FnUpdater<F> {
    pub fn new<S>(action_type: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&mut S, &Value, &BlockInfo, &mut BlockContext) -> Result<Option<String>>,
    {
        Self {
            action_type: action_type.into(),
            apply,
        }
    }
}

impl<S, F> Updater<S> for FnUpdater<F>
where
    S: Send,
    F: Fn(&mut S, &Value, &BlockInfo, &mut BlockContext) -> Result<Option<String>> + Send + Sync,
{
    fn action_type(&self) -> &str {
        &self.action_type
    }

    fn apply<'a>(
        &'a self,
        state: &'a mut S,
        payload: &'a Value,
        block_info: &'a BlockInfo,
        context: &'a mut BlockContext,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        let outcome = (self.apply)(state, payload, block_info, context);
        Box::pin(async move { outcome })
    }
}

/// Effect backed by a closure returning a future.
pub struct FnEffect<F> {
    action_type: String,
    defer_until_irreversible: bool,
    run: F,
}

impl<F> FnEffect<F> {
    pub fn new<Fut>(action_type: impl Into<String>, run: F) -> Self
    where
        F: Fn(Value, BlockInfo, Arc<BlockContext>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            action_type: action_type.into(),
            defer_until_irreversible: false,
            run,
        }
    }

    pub fn deferred(mut self) -> Self {
        self.defer_until_irreversible = true;
        self
    }
}

impl<F, Fut> Effect for FnEffect<F>
where
    F: Fn(Value, BlockInfo, Arc<BlockContext>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn action_type(&self) -> &str {
        &self.action_type
    }

    fn defer_until_irreversible(&self) -> bool {
        self.defer_until_irreversible
    }

    fn run(
        &self,
        payload: Value,
        block_info: BlockInfo,
        context: Arc<BlockContext>,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.run)(payload, block_info, context))
    }
}

/// A named set of updaters and effects. Registered versions are never mutated.
pub struct HandlerVersion<S> {
    version_name: String,
    updaters: Vec<Arc<dyn Updater<S>>>,
    effects: Vec<Arc<dyn Effect>>,
}

impl<S> HandlerVersion<S> {
    pub fn new(version_name: impl Into<String>) -> Self {
        Self {
            version_name: version_name.into(),
            updaters: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn with_updater(mut self, updater: impl Updater<S> + 'static) -> Self {
        self.updaters.push(Arc::new(updater));
        self
    }

    pub fn with_effect(mut self, effect: impl Effect + 'static) -> Self {
        self.effects.push(Arc::new(effect));
        self
    }

    pub fn version_name(&self) -> &str {
        &self.version_name
    }

    pub fn updaters(&self) -> &[Arc<dyn Updater<S>>] {
        &self.updaters
    }

    pub fn effects(&self) -> &[Arc<dyn Effect>] {
        &self.effects
    }
}

impl<S> std::fmt::Debug for HandlerVersion<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerVersion")
            .field("version_name", &self.version_name)
            .field("updaters", &self.updaters.len())
            .field("effects", &self.effects.len())
            .finish()
    }
}
