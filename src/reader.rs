//! Block sourcing: chain-walking, fork detection and resolution, history reloads.

pub(crate) mod backoff;
pub mod block_reader;
mod fork;
pub mod history;
pub mod json;
pub mod source;
