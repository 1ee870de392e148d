use crate::handler::effects::EffectRunMode;
use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_START_AT_BLOCK: i64 = 1;
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_VELOCITY_SAMPLE_SIZE: usize = 20;
const DEFAULT_MAX_EFFECT_ERRORS: usize = 100;
const DEFAULT_HISTORY_RELOAD_ATTEMPTS: usize = 10;
const DEFAULT_LOG_SOURCE: &str = "forkwatch";

/// Runtime configuration shared by the reader, handler, and watcher.
///
/// Instances are built through [`WatcherConfig::builder`] or [`WatcherConfig::new`] so
/// invariants are validated before any component observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    start_at_block: i64,
    only_irreversible: bool,
    poll_interval: Duration,
    velocity_sample_size: usize,
    max_effect_errors: usize,
    effect_run_mode: EffectRunMode,
    validate_blocks: bool,
    auto_resume: bool,
    history_reload_attempts: usize,
    metrics_interval: Duration,
    log_source: String,
}

pub struct WatcherConfigParams {
    pub start_at_block: i64,
    pub only_irreversible: bool,
    pub poll_interval: Duration,
    pub velocity_sample_size: usize,
    pub max_effect_errors: usize,
    pub effect_run_mode: EffectRunMode,
    pub validate_blocks: bool,
    pub auto_resume: bool,
    pub history_reload_attempts: usize,
    pub metrics_interval: Duration,
    pub log_source: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            start_at_block: DEFAULT_START_AT_BLOCK,
            only_irreversible: false,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            velocity_sample_size: DEFAULT_VELOCITY_SAMPLE_SIZE,
            max_effect_errors: DEFAULT_MAX_EFFECT_ERRORS,
            effect_run_mode: EffectRunMode::All,
            validate_blocks: true,
            auto_resume: true,
            history_reload_attempts: DEFAULT_HISTORY_RELOAD_ATTEMPTS,
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
            log_source: DEFAULT_LOG_SOURCE.to_owned(),
        }
    }
}

impl WatcherConfig {
    pub fn builder() -> WatcherConfigBuilder {
        WatcherConfigBuilder::default()
    }

    /// Constructs a configuration directly from concrete values, running validation.
    pub fn new(params: WatcherConfigParams) -> Result<Self> {
        let WatcherConfigParams {
            start_at_block,
            only_irreversible,
            poll_interval,
            velocity_sample_size,
            max_effect_errors,
            effect_run_mode,
            validate_blocks,
            auto_resume,
            history_reload_attempts,
            metrics_interval,
            log_source,
        } = params;

        let config = Self {
            start_at_block,
            only_irreversible,
            poll_interval,
            velocity_sample_size,
            max_effect_errors,
            effect_run_mode,
            validate_blocks,
            auto_resume,
            history_reload_attempts,
            metrics_interval,
            log_source: log_source.trim().to_owned(),
        };

        config.validate()?;
        Ok(config)
    }

    /// First block to read. Zero or negative values are offsets from the head block
    /// observed when the reader initializes.
    pub fn start_at_block(&self) -> i64 {
        self.start_at_block
    }

    /// When set, the reader never advances past the last irreversible block.
    pub fn only_irreversible(&self) -> bool {
        self.only_irreversible
    }

    /// Target duration of one watcher cycle, including the idle wait.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Number of per-block timing intervals kept for velocity metrics.
    pub fn velocity_sample_size(&self) -> usize {
        self.velocity_sample_size
    }

    /// Number of effect failures retained for the status query.
    pub fn max_effect_errors(&self) -> usize {
        self.max_effect_errors
    }

    pub fn effect_run_mode(&self) -> EffectRunMode {
        self.effect_run_mode
    }

    /// Whether the handler enforces block sequence and previous-hash continuity.
    pub fn validate_blocks(&self) -> bool {
        self.validate_blocks
    }

    /// Whether the watcher restarts its loop after a failed cycle.
    pub fn auto_resume(&self) -> bool {
        self.auto_resume
    }

    /// Attempts made to rebuild the reader's block history before giving up.
    pub fn history_reload_attempts(&self) -> usize {
        self.history_reload_attempts
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Name recorded on every component's tracing span.
    pub fn log_source(&self) -> &str {
        &self.log_source
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.velocity_sample_size == 0 {
            bail!("velocity_sample_size must be greater than 0");
        }

        if self.history_reload_attempts == 0 {
            bail!("history_reload_attempts must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.log_source.trim().is_empty() {
            bail!("log_source cannot be empty");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct WatcherConfigBuilder {
    start_at_block: Option<i64>,
    only_irreversible: Option<bool>,
    poll_interval: Option<Duration>,
    velocity_sample_size: Option<usize>,
    max_effect_errors: Option<usize>,
    effect_run_mode: Option<EffectRunMode>,
    validate_blocks: Option<bool>,
    auto_resume: Option<bool>,
    history_reload_attempts: Option<usize>,
    metrics_interval: Option<Duration>,
    log_source: Option<String>,
}

impl WatcherConfigBuilder {
    pub fn start_at_block(mut self, block_number: i64) -> Self {
        self.start_at_block = Some(block_number);
        self
    }

    pub fn only_irreversible(mut self, enabled: bool) -> Self {
        self.only_irreversible = Some(enabled);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn velocity_sample_size(mut self, samples: usize) -> Self {
        self.velocity_sample_size = Some(samples);
        self
    }

    pub fn max_effect_errors(mut self, max: usize) -> Self {
        self.max_effect_errors = Some(max);
        self
    }

    pub fn effect_run_mode(mut self, mode: EffectRunMode) -> Self {
        self.effect_run_mode = Some(mode);
        self
    }

    pub fn validate_blocks(mut self, enabled: bool) -> Self {
        self.validate_blocks = Some(enabled);
        self
    }

    pub fn auto_resume(mut self, enabled: bool) -> Self {
        self.auto_resume = Some(enabled);
        self
    }

    pub fn history_reload_attempts(mut self, attempts: usize) -> Self {
        self.history_reload_attempts = Some(attempts);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn log_source(mut self, source: impl Into<String>) -> Self {
        self.log_source = Some(source.into());
        self
    }

    pub fn build(self) -> Result<WatcherConfig> {
        let defaults = WatcherConfig::default();
        let params = WatcherConfigParams {
            start_at_block: self.start_at_block.unwrap_or(defaults.start_at_block),
            only_irreversible: self.only_irreversible.unwrap_or(defaults.only_irreversible),
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            velocity_sample_size: self
                .velocity_sample_size
                .unwrap_or(defaults.velocity_sample_size),
            max_effect_errors: self.max_effect_errors.unwrap_or(defaults.max_effect_errors),
            effect_run_mode: self.effect_run_mode.unwrap_or(defaults.effect_run_mode),
            validate_blocks: self.validate_blocks.unwrap_or(defaults.validate_blocks),
            auto_resume: self.auto_resume.unwrap_or(defaults.auto_resume),
            history_reload_attempts: self
                .history_reload_attempts
                .unwrap_or(defaults.history_reload_attempts),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
            log_source: self.log_source.unwrap_or(defaults.log_source),
        };

        WatcherConfig::new(params)
    }
}
