//! Circuit breaker: an open/closed decision over the rolling health window.
//!
//! There is no stored breaker state and no half-open machinery. The decision
//! is recomputed from the window on every call, so a quiet period or a run of
//! successes ages the errors out and the breaker closes again on its own.

use crate::error::OptionsError;
use crate::metric::{HealthCounts, MetricHandle, DEFAULT_SAMPLES_TO_STORE, DEFAULT_SECONDS_TO_STORE};
use crate::registry::circuits;
use std::sync::Arc;

/// Error percentage at which the breaker opens.
pub const DEFAULT_ERRORS_THRESHOLD: f64 = 50.0;
/// Requests required in the window before the breaker may open.
pub const DEFAULT_MINIMUM_REQUESTS: u64 = 20;

/// Breaker policy plus window and reservoir sizing.
#[derive(Debug, Clone, Copy)]
pub struct CircuitOptions {
    /// Error percentage in `[0, 100]` at which the circuit opens.
    pub errors_threshold: f64,
    /// Minimum `total` in the window before the circuit may open.
    pub minimum_requests: u64,
    /// Rolling window size in seconds (= bucket count).
    pub seconds_to_store: usize,
    /// Latency reservoir capacity.
    pub samples_to_store: usize,
}

impl Default for CircuitOptions {
    fn default() -> Self {
        Self {
            errors_threshold: DEFAULT_ERRORS_THRESHOLD,
            minimum_requests: DEFAULT_MINIMUM_REQUESTS,
            seconds_to_store: DEFAULT_SECONDS_TO_STORE,
            samples_to_store: DEFAULT_SAMPLES_TO_STORE,
        }
    }
}

impl CircuitOptions {
    pub(crate) fn validate(&self) -> Result<(), OptionsError> {
        if !self.errors_threshold.is_finite()
            || !(0.0..=100.0).contains(&self.errors_threshold)
        {
            return Err(OptionsError::ErrorsThresholdOutOfRange(self.errors_threshold));
        }
        if self.seconds_to_store == 0 {
            return Err(OptionsError::EmptyWindow);
        }
        if self.samples_to_store == 0 {
            return Err(OptionsError::EmptyReservoir);
        }
        Ok(())
    }
}

/// Cloneable handle to the one breaker for a (group, name) pair.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<CircuitInner>,
}

#[derive(Debug)]
struct CircuitInner {
    group: String,
    name: String,
    errors_threshold: f64,
    minimum_requests: u64,
    metric: MetricHandle,
}

impl CircuitBreaker {
    /// Look up or create the breaker for `(group, name)`.
    ///
    /// The registry is consulted first: when an entry exists it is returned
    /// unchanged and `options` is ignored; the first writer wins for the
    /// lifetime of the process. Must be called from within a tokio runtime,
    /// since a fresh breaker spawns its metric owner task.
    pub fn new_circuit(
        group: &str,
        name: &str,
        options: CircuitOptions,
    ) -> Result<CircuitBreaker, OptionsError> {
        options.validate()?;
        Ok(Self::register(group, name, &options))
    }

    pub(crate) fn register(group: &str, name: &str, options: &CircuitOptions) -> CircuitBreaker {
        circuits().get_or_insert_with(group, name, || {
            tracing::info!(group, name, "registering circuit");
            Self::build(group, name, options)
        })
    }

    fn build(group: &str, name: &str, options: &CircuitOptions) -> CircuitBreaker {
        let metric =
            MetricHandle::spawn(group, name, options.seconds_to_store, options.samples_to_store);
        CircuitBreaker {
            inner: Arc::new(CircuitInner {
                group: group.to_owned(),
                name: name.to_owned(),
                errors_threshold: options.errors_threshold,
                minimum_requests: options.minimum_requests,
                metric,
            }),
        }
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn metric(&self) -> &MetricHandle {
        &self.inner.metric
    }

    /// Evaluate the breaker against the current window.
    ///
    /// Returns the open flag plus the reason: `"not enough requests"`,
    /// `"too many errors"`, or `"ok"`.
    pub async fn evaluate(&self) -> (bool, &'static str) {
        let counts = self.inner.metric.health_counts().await;
        self.decide(&counts)
    }

    pub async fn is_open(&self) -> bool {
        self.evaluate().await.0
    }

    fn decide(&self, counts: &HealthCounts) -> (bool, &'static str) {
        if counts.total < self.inner.minimum_requests {
            return (false, "not enough requests");
        }
        if counts.error_percentage >= self.inner.errors_threshold {
            return (true, "too many errors");
        }
        (false, "ok")
    }

    /// True when two handles point at the same registered breaker.
    pub fn same_circuit(&self, other: &CircuitBreaker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn counts(success: u64, failures: u64) -> HealthCounts {
        let total = success + failures;
        HealthCounts {
            success,
            failures,
            total,
            error_percentage: if total == 0 {
                0.0
            } else {
                failures as f64 / total as f64 * 100.0
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn closed_below_the_minimum_volume() {
        let breaker = CircuitBreaker::build(
            "cb-unit",
            "min-volume",
            &CircuitOptions { minimum_requests: 3, ..Default::default() },
        );
        // 100% errors, but only two requests
        assert_eq!(breaker.decide(&counts(0, 2)), (false, "not enough requests"));
        assert_eq!(breaker.decide(&counts(0, 3)), (true, "too many errors"));
    }

    #[tokio::test]
    async fn opens_at_the_threshold_exactly() {
        let breaker = CircuitBreaker::build(
            "cb-unit",
            "threshold",
            &CircuitOptions { minimum_requests: 2, ..Default::default() },
        );
        assert_eq!(breaker.decide(&counts(1, 1)), (true, "too many errors"));
        assert_eq!(breaker.decide(&counts(2, 1)), (false, "ok"));
    }

    #[tokio::test]
    async fn closes_again_when_the_window_recovers() {
        let breaker = CircuitBreaker::build(
            "cb-unit",
            "recovers",
            &CircuitOptions { minimum_requests: 3, ..Default::default() },
        );
        assert_eq!(breaker.decide(&counts(0, 3)).0, true);
        // successes landed, errors aged out
        assert_eq!(breaker.decide(&counts(9, 3)), (false, "ok"));
        assert_eq!(breaker.decide(&counts(0, 0)), (false, "not enough requests"));
    }

    #[tokio::test]
    async fn evaluate_reads_the_live_window() {
        let breaker = CircuitBreaker::build(
            "cb-unit",
            "live",
            &CircuitOptions { minimum_requests: 2, ..Default::default() },
        );
        assert_eq!(breaker.evaluate().await, (false, "not enough requests"));

        breaker.metric().fail().await;
        breaker.metric().fail().await;
        assert_eq!(breaker.evaluate().await, (true, "too many errors"));
        assert!(breaker.is_open().await);

        for _ in 0..6 {
            breaker.metric().success(Duration::from_nanos(1)).await;
        }
        assert_eq!(breaker.evaluate().await, (false, "ok"));
    }

    #[tokio::test]
    async fn new_circuit_is_idempotent_per_key() {
        let first = CircuitBreaker::new_circuit(
            "cb-unit-registry",
            "idempotent",
            CircuitOptions { minimum_requests: 3, ..Default::default() },
        )
        .unwrap();
        let second = CircuitBreaker::new_circuit(
            "cb-unit-registry",
            "idempotent",
            CircuitOptions { minimum_requests: 1_000, ..Default::default() },
        )
        .unwrap();

        assert!(first.same_circuit(&second));
        // the losing options never applied
        second.metric().fail().await;
        second.metric().fail().await;
        second.metric().fail().await;
        assert!(first.is_open().await);
    }

    #[test]
    fn options_validation_rejects_nonsense() {
        assert_eq!(
            CircuitOptions { errors_threshold: 140.0, ..Default::default() }.validate(),
            Err(OptionsError::ErrorsThresholdOutOfRange(140.0))
        );
        assert_eq!(
            CircuitOptions { errors_threshold: f64::NAN, ..Default::default() }
                .validate()
                .is_err(),
            true
        );
        assert_eq!(
            CircuitOptions { seconds_to_store: 0, ..Default::default() }.validate(),
            Err(OptionsError::EmptyWindow)
        );
        assert_eq!(
            CircuitOptions { samples_to_store: 0, ..Default::default() }.validate(),
            Err(OptionsError::EmptyReservoir)
        );
        assert!(CircuitOptions::default().validate().is_ok());
    }
}
