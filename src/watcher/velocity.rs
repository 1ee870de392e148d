use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;

/// Sliding window of per-block `[start, end]` processing intervals.
#[derive(Debug, Clone)]
pub struct VelocitySampler {
    limit: usize,
    intervals: VecDeque<(Instant, Instant)>,
}

/// Throughput figures derived from a [`VelocitySampler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockVelocity {
    /// Blocks per second across the sampled window, wall-clock based.
    pub current_block_velocity: f64,
    /// Seconds per block, the inverse of `current_block_velocity`.
    pub current_block_interval: f64,
    /// Blocks per second if the engine never idled between blocks.
    pub max_block_velocity: f64,
}

impl VelocitySampler {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            intervals: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn record(&mut self, start: Instant, end: Instant) {
        self.intervals.push_back((start, end));
        while self.intervals.len() > self.limit {
            self.intervals.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    pub fn current_block_velocity(&self) -> f64 {
        if self.intervals.len() < 2 {
            return 0.0;
        }

        let (Some((first_start, _)), Some((last_start, _))) =
            (self.intervals.front(), self.intervals.back())
        else {
            return 0.0;
        };

        let elapsed = last_start.saturating_duration_since(*first_start).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }

        (self.intervals.len() - 1) as f64 / elapsed
    }

    pub fn max_block_velocity(&self) -> f64 {
        if self.intervals.is_empty() {
            return 0.0;
        }

        let total: f64 = self
            .intervals
            .iter()
            .map(|(start, end)| end.saturating_duration_since(*start).as_secs_f64())
            .sum();
        let average = total / self.intervals.len() as f64;
        if average <= f64::EPSILON {
            return 0.0;
        }

        1.0 / average
    }

    pub fn velocity(&self) -> BlockVelocity {
        let current_block_velocity = self.current_block_velocity();
        let current_block_interval = if current_block_velocity > 0.0 {
            1.0 / current_block_velocity
        } else {
            0.0
        };

        BlockVelocity {
            current_block_velocity,
            current_block_interval,
            max_block_velocity: self.max_block_velocity(),
        }
    }
}
