pub mod memory_chain;
pub mod recording_store;
