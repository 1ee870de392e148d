//! Runtime glue that wires configs, setup errors, telemetry, and runner
//! orchestration.

pub mod config;
pub mod runner;
pub mod setup;
pub mod telemetry;
