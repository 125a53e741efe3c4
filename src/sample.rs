//! Exponentially-decaying reservoir of success latencies.
//!
//! Bounded-memory summary statistics with recency bias: each recorded value
//! carries a priority `exp(alpha * dt) / u` with `u` drawn from `(0, 1]`, and
//! once the reservoir is full a new value only displaces the lowest-priority
//! slot when it outranks it. Priorities grow with elapsed time, so recent
//! samples win ties against old ones and a burst of stale latencies cannot
//! mask a recent shift. Priorities are rescaled against a fresh landmark
//! every hour to keep the exponent from overflowing.

use crate::clock::{Clock, MonotonicClock};
use rand::Rng;
use std::sync::{Arc, Mutex};

/// Decay factor for the reservoir priorities.
pub const DEFAULT_ALPHA: f64 = 0.015;

const RESCALE_INTERVAL_MS: u64 = 60 * 60 * 1_000;

#[derive(Debug, Clone, Copy)]
struct WeightedValue {
    priority: f64,
    value: i64,
}

#[derive(Debug)]
struct SampleState {
    values: Vec<WeightedValue>,
    count: u64,
    landmark_ms: u64,
    next_rescale_ms: u64,
}

/// Concurrent forward-decaying priority reservoir.
///
/// Cloning shares the underlying reservoir. Updates take the internal lock
/// for an O(capacity) scan; queries return a consistent [`SampleSnapshot`].
#[derive(Debug, Clone)]
pub struct ExpDecaySample {
    inner: Arc<Mutex<SampleState>>,
    capacity: usize,
    alpha: f64,
    clock: Arc<dyn Clock>,
}

/// Point-in-time view of the reservoir contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSnapshot {
    /// Total number of updates ever applied, not current occupancy.
    pub count: u64,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub variance: f64,
    values: Vec<i64>,
}

impl ExpDecaySample {
    pub fn new(capacity: usize, alpha: f64) -> Self {
        Self::with_clock(capacity, alpha, MonotonicClock::default())
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(capacity: usize, alpha: f64, clock: C) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let now = clock.now_millis();
        Self {
            inner: Arc::new(Mutex::new(SampleState {
                values: Vec::with_capacity(capacity.max(1)),
                count: 0,
                landmark_ms: now,
                next_rescale_ms: now + RESCALE_INTERVAL_MS,
            })),
            capacity: capacity.max(1),
            alpha,
            clock,
        }
    }

    /// Record one value into the reservoir.
    pub fn update(&self, value: i64) {
        let now = self.clock.now_millis();
        let mut state = self.inner.lock().unwrap();
        state.count += 1;

        let dt = now.saturating_sub(state.landmark_ms) as f64 / 1_000.0;
        // random::<f64>() is [0, 1); flip it so the divisor stays non-zero
        let u: f64 = 1.0 - rand::rng().random::<f64>();
        let priority = (self.alpha * dt).exp() / u;

        if state.values.len() < self.capacity {
            state.values.push(WeightedValue { priority, value });
        } else if let Some(idx) = lowest_priority(&state.values) {
            if priority > state.values[idx].priority {
                state.values[idx] = WeightedValue { priority, value };
            }
        }

        if now >= state.next_rescale_ms {
            let factor = (-self.alpha * dt).exp();
            for slot in &mut state.values {
                slot.priority *= factor;
            }
            state.landmark_ms = now;
            state.next_rescale_ms = now + RESCALE_INTERVAL_MS;
        }
    }

    /// Consistent snapshot of the current contents plus lifetime count.
    pub fn snapshot(&self) -> SampleSnapshot {
        let state = self.inner.lock().unwrap();
        let values: Vec<i64> = state.values.iter().map(|slot| slot.value).collect();
        SampleSnapshot::from_values(state.count, values)
    }

    /// Number of values currently held (at most the configured capacity).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().unwrap().count
    }

    pub fn percentile(&self, q: f64) -> f64 {
        self.snapshot().percentile(q)
    }
}

fn lowest_priority(values: &[WeightedValue]) -> Option<usize> {
    let mut min: Option<usize> = None;
    for (idx, slot) in values.iter().enumerate() {
        match min {
            Some(m) if values[m].priority <= slot.priority => {}
            _ => min = Some(idx),
        }
    }
    min
}

impl SampleSnapshot {
    fn from_values(count: u64, values: Vec<i64>) -> Self {
        if values.is_empty() {
            return SampleSnapshot { count, ..Default::default() };
        }
        let min = values.iter().copied().min().unwrap_or(0);
        let max = values.iter().copied().max().unwrap_or(0);
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        SampleSnapshot { count, min, max, mean, variance, values }
    }

    /// Linear-interpolated quantile of the current contents, `q` in `[0, 1]`.
    pub fn percentile(&self, q: f64) -> f64 {
        let mut sorted = self.values.clone();
        sorted.sort_unstable();
        let size = sorted.len();
        if size == 0 {
            return 0.0;
        }
        let pos = q * (size + 1) as f64;
        if pos < 1.0 {
            sorted[0] as f64
        } else if pos >= size as f64 {
            sorted[size - 1] as f64
        } else {
            let lower = sorted[pos as usize - 1] as f64;
            let upper = sorted[pos as usize] as f64;
            lower + (pos - pos.floor()) * (upper - lower)
        }
    }
}
