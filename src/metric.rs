//! Per-command rolling health window.
//!
//! A metric owns a ring of one-second buckets plus an
//! [`ExpDecaySample`](crate::sample::ExpDecaySample) of success latencies.
//! All bucket and timestamp state lives inside one long-lived owner task;
//! [`MetricHandle`] talks to it over a bounded channel, so recordings and
//! aggregations on one metric are totally ordered without a lock. Reservoir
//! updates are pushed onto a separate task: `success` followed immediately by
//! `stats` is eventually consistent, never blocking the owner.

use crate::clock::{Clock, MonotonicClock};
use crate::export;
use crate::sample::{ExpDecaySample, SampleSnapshot, DEFAULT_ALPHA};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Rolling window size in seconds (= bucket count) when not configured.
pub const DEFAULT_SECONDS_TO_STORE: usize = 20;
/// Latency reservoir capacity when not configured.
pub const DEFAULT_SAMPLES_TO_STORE: usize = 20;

const OP_CHANNEL_CAPACITY: usize = 64;

/// One second-slot of outcome counters.
#[derive(Debug, Clone, Copy, Default)]
struct HealthCountsBucket {
    success: u64,
    failures: u64,
    fallback: u64,
    fallback_errors: u64,
    timeouts: u64,
    panics: u64,
    // clock millis of the last increment; 0 = never written
    last_write_ms: u64,
}

impl HealthCountsBucket {
    fn reset(&mut self) {
        self.success = 0;
        self.failures = 0;
        self.fallback = 0;
        self.fallback_errors = 0;
        self.timeouts = 0;
        self.panics = 0;
    }
}

/// Aggregate of all in-window buckets.
///
/// `total` counts requests that reached a verdict (`success + failures`);
/// fallback and panic counters ride alongside without contributing to it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthCounts {
    pub success: u64,
    pub failures: u64,
    pub fallback: u64,
    pub fallback_errors: u64,
    pub timeouts: u64,
    pub panics: u64,
    pub total: u64,
    pub error_percentage: f64,
}

/// Health counts plus the last-event wall timestamps, for the debug surface.
#[derive(Debug, Clone, Default)]
pub struct MetricSnapshot {
    pub counts: HealthCounts,
    pub last_success: Option<DateTime<Local>>,
    pub last_failure: Option<DateTime<Local>>,
    pub last_timeout: Option<DateTime<Local>>,
}

enum MetricOp {
    Success(Duration),
    Fail,
    Timeout,
    Fallback,
    FallbackError,
    Panic,
    Counts(oneshot::Sender<HealthCounts>),
    Snapshot(oneshot::Sender<MetricSnapshot>),
}

/// Cloneable handle to a metric owner task.
///
/// Record operations enqueue onto the owner; queries round-trip through it,
/// so a query observes every recording sent before it from the same task.
#[derive(Debug, Clone)]
pub struct MetricHandle {
    group: Arc<str>,
    name: Arc<str>,
    tx: mpsc::Sender<MetricOp>,
    sample: ExpDecaySample,
}

impl MetricHandle {
    /// Spawn the owner task for a fresh metric. One per (group, name);
    /// [`new_circuit`](crate::circuit_breaker::CircuitBreaker::new_circuit)
    /// enforces that through the registry.
    pub(crate) fn spawn(group: &str, name: &str, buckets: usize, sample_size: usize) -> Self {
        Self::spawn_with_clock(group, name, buckets, sample_size, MonotonicClock::default())
    }

    pub(crate) fn spawn_with_clock<C: Clock + Clone + 'static>(
        group: &str,
        name: &str,
        buckets: usize,
        sample_size: usize,
        clock: C,
    ) -> Self {
        let buckets = buckets.max(1);
        let sample = ExpDecaySample::with_clock(sample_size, DEFAULT_ALPHA, clock.clone());
        let (tx, rx) = mpsc::channel(OP_CHANNEL_CAPACITY);
        let group: Arc<str> = Arc::from(group);
        let name: Arc<str> = Arc::from(name);
        let owner = MetricOwner {
            group: group.clone(),
            name: name.clone(),
            buckets: vec![HealthCountsBucket::default(); buckets],
            window_ms: buckets as u64 * 1_000,
            clock: Arc::new(clock),
            sample: sample.clone(),
            last_success: None,
            last_failure: None,
            last_timeout: None,
        };
        tokio::spawn(owner.run(rx));
        Self { group, name, tx, sample }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn success(&self, duration: Duration) {
        let _ = self.tx.send(MetricOp::Success(duration)).await;
    }

    pub async fn fail(&self) {
        let _ = self.tx.send(MetricOp::Fail).await;
    }

    pub async fn timeout(&self) {
        let _ = self.tx.send(MetricOp::Timeout).await;
    }

    pub async fn fallback(&self) {
        let _ = self.tx.send(MetricOp::Fallback).await;
    }

    pub async fn fallback_error(&self) {
        let _ = self.tx.send(MetricOp::FallbackError).await;
    }

    pub async fn panicked(&self) {
        let _ = self.tx.send(MetricOp::Panic).await;
    }

    /// Aggregate of the current window.
    pub async fn health_counts(&self) -> HealthCounts {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(MetricOp::Counts(reply)).await.is_err() {
            return HealthCounts::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Health counts plus last-event timestamps.
    pub async fn snapshot(&self) -> MetricSnapshot {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(MetricOp::Snapshot(reply)).await.is_err() {
            return MetricSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Summary statistics of recorded success latencies.
    ///
    /// The reservoir is fed from a background task; do not expect a success
    /// recorded a moment ago to be visible here yet.
    pub fn stats(&self) -> SampleSnapshot {
        self.sample.snapshot()
    }
}

struct MetricOwner {
    group: Arc<str>,
    name: Arc<str>,
    buckets: Vec<HealthCountsBucket>,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    sample: ExpDecaySample,
    last_success: Option<DateTime<Local>>,
    last_failure: Option<DateTime<Local>>,
    last_timeout: Option<DateTime<Local>>,
}

impl MetricOwner {
    async fn run(mut self, mut rx: mpsc::Receiver<MetricOp>) {
        while let Some(op) = rx.recv().await {
            self.apply(op);
        }
        tracing::debug!(group = %self.group, name = %self.name, "metric owner stopped");
    }

    fn apply(&mut self, op: MetricOp) {
        match op {
            MetricOp::Success(duration) => {
                self.bucket().success += 1;
                self.last_success = Some(Local::now());
                let sample = self.sample.clone();
                tokio::spawn(async move {
                    sample.update(duration.as_nanos() as i64);
                });
                export::current_export().success(&self.group, &self.name, duration);
            }
            MetricOp::Fail => {
                self.bucket().failures += 1;
                self.last_failure = Some(Local::now());
                export::current_export().fail(&self.group, &self.name);
            }
            MetricOp::Timeout => {
                let bucket = self.bucket();
                bucket.timeouts += 1;
                bucket.failures += 1;
                let now = Some(Local::now());
                self.last_failure = now;
                self.last_timeout = now;
                export::current_export().timeout(&self.group, &self.name);
            }
            MetricOp::Fallback => {
                self.bucket().fallback += 1;
                export::current_export().fallback(&self.group, &self.name);
            }
            MetricOp::FallbackError => {
                self.bucket().fallback_errors += 1;
                export::current_export().fallback_error(&self.group, &self.name);
            }
            MetricOp::Panic => {
                self.bucket().panics += 1;
                export::current_export().panicked(&self.group, &self.name);
            }
            MetricOp::Counts(reply) => {
                let _ = reply.send(self.health_counts());
            }
            MetricOp::Snapshot(reply) => {
                let _ = reply.send(MetricSnapshot {
                    counts: self.health_counts(),
                    last_success: self.last_success,
                    last_failure: self.last_failure,
                    last_timeout: self.last_timeout,
                });
            }
        }
    }

    /// Current-second bucket, zeroed first when its contents predate the window.
    fn bucket(&mut self) -> &mut HealthCountsBucket {
        // clamp to 1 so a write in the clock's first millisecond still counts
        let now_ms = self.clock.now_millis().max(1);
        let index = self.clock.now_seconds() as usize % self.buckets.len();
        let window_ms = self.window_ms;
        let bucket = &mut self.buckets[index];
        if bucket.last_write_ms != 0 && now_ms.saturating_sub(bucket.last_write_ms) > window_ms {
            bucket.reset();
        }
        bucket.last_write_ms = now_ms;
        bucket
    }

    fn health_counts(&self) -> HealthCounts {
        let now_ms = self.clock.now_millis().max(1);
        let mut agg = HealthCounts::default();
        for bucket in &self.buckets {
            if bucket.last_write_ms != 0
                && now_ms.saturating_sub(bucket.last_write_ms) <= self.window_ms
            {
                agg.success += bucket.success;
                agg.failures += bucket.failures;
                agg.fallback += bucket.fallback;
                agg.fallback_errors += bucket.fallback_errors;
                agg.timeouts += bucket.timeouts;
                agg.panics += bucket.panics;
            }
        }
        agg.total = agg.success + agg.failures;
        if agg.total > 0 {
            agg.error_percentage = agg.failures as f64 / agg.total as f64 * 100.0;
        }
        agg
    }
}
