pub mod block;
pub mod handler;
pub mod reader;
pub mod runtime;
pub mod watcher;

pub use block::{Action, Block, BlockInfo, BlockMeta, NextBlock};
pub use handler::{
    ActionHandler, ActionMatcher, BlockContext, Effect, EffectHandle, EffectRunMode,
    EffectStatus, ExactMatch, FnEffect, FnUpdater, HandlerError, HandlerInfo, HandlerVersion,
    IndexState, Persistence, Updater, VersionedAction,
};
pub use reader::block_reader::{BlockReader, ReaderError, ReaderInfo};
pub use reader::history::BlockHistory;
pub use reader::json::{JsonBlockSource, JsonBlockSourceError};
pub use reader::source::BlockSource;
pub use runtime::config::{WatcherConfig, WatcherConfigBuilder, WatcherConfigParams};
pub use runtime::runner::Runner;
pub use runtime::setup::{NotInitializedError, SetupTarget};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use watcher::{BlockVelocity, EngineInfo, IndexingStatus, Watcher, WatcherInfo};
