//! Polling loop and control surface tying a reader to an action handler.

pub mod controller;
pub(crate) mod cycle;
pub(crate) mod lifecycle;
pub mod status;
pub mod velocity;

pub use controller::{EngineInfo, Watcher, WatcherInfo};
pub use status::IndexingStatus;
pub use velocity::BlockVelocity;
