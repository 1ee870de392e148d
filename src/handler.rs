//! Versioned update/effect dispatch: updaters mutate state deterministically, effects
//! run detached, and handler versions can be switched from inside an updater.

pub mod action_handler;
pub mod effects;
pub mod persistence;
pub mod version;

pub use action_handler::{ActionHandler, HandlerError, HandlerInfo, VersionedAction};
pub use effects::{EffectHandle, EffectRunMode, EffectStatus};
pub use persistence::{BlockContext, IndexState, Persistence};
pub use version::{ActionMatcher, Effect, ExactMatch, FnEffect, FnUpdater, HandlerVersion, Updater};
