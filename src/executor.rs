//! Command execution engine: timeout, panic recovery, fallback dispatch.

use crate::circuit_breaker::{
    CircuitBreaker, CircuitOptions, DEFAULT_ERRORS_THRESHOLD, DEFAULT_MINIMUM_REQUESTS,
};
use crate::error::{
    BoxError, CommandError, NoFallbackError, OptionsError, RunPanicError, RunTimeoutError,
};
use crate::metric::{
    HealthCounts, MetricHandle, DEFAULT_SAMPLES_TO_STORE, DEFAULT_SECONDS_TO_STORE,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio::time::Instant;

/// Per-invocation deadline for `run` when not configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// User-supplied unit of work guarded by the library.
///
/// `run` is the primary path. `fallback` is an optional capability: the
/// default body returns `None`, which declares it absent, and the executor
/// then fails the call with a [`NoFallbackError`] cause instead of invoking
/// it.
/// Commands may be driven concurrently and must be thread-safe if shared.
#[async_trait]
pub trait Command: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn run(&self) -> Result<Self::Output, BoxError>;

    async fn fallback(&self) -> Option<Result<Self::Output, BoxError>> {
        None
    }
}

/// Executor configuration.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    /// Error percentage in `[0, 100]` at which the circuit opens.
    pub errors_threshold: f64,
    /// Minimum `total` in the window before the circuit may open.
    pub minimum_requests: u64,
    /// Rolling window size in seconds (= bucket count).
    pub seconds_to_store: usize,
    /// Latency reservoir capacity.
    pub samples_to_store: usize,
    /// Per-invocation deadline for `run`. Zero always times out.
    pub timeout: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            errors_threshold: DEFAULT_ERRORS_THRESHOLD,
            minimum_requests: DEFAULT_MINIMUM_REQUESTS,
            seconds_to_store: DEFAULT_SECONDS_TO_STORE,
            samples_to_store: DEFAULT_SAMPLES_TO_STORE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ExecutorOptions {
    pub fn errors_threshold(mut self, percentage: f64) -> Self {
        self.errors_threshold = percentage;
        self
    }

    pub fn minimum_requests(mut self, requests: u64) -> Self {
        self.minimum_requests = requests;
        self
    }

    pub fn seconds_to_store(mut self, seconds: usize) -> Self {
        self.seconds_to_store = seconds;
        self
    }

    pub fn samples_to_store(mut self, samples: usize) -> Self {
        self.samples_to_store = samples;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn circuit_options(&self) -> CircuitOptions {
        CircuitOptions {
            errors_threshold: self.errors_threshold,
            minimum_requests: self.minimum_requests,
            seconds_to_store: self.seconds_to_store,
            samples_to_store: self.samples_to_store,
        }
    }
}

/// Runs one command under a shared circuit breaker.
///
/// The executor is stateless between calls: clone it freely and drive it from
/// any number of tasks. All executors constructed for the same (group, name)
/// share one breaker and one metric through the registry.
pub struct Executor<C: Command> {
    group: Arc<str>,
    name: Arc<str>,
    timeout: Duration,
    command: Arc<C>,
    circuit: CircuitBreaker,
}

impl<C: Command> Clone for Executor<C> {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            name: self.name.clone(),
            timeout: self.timeout,
            command: self.command.clone(),
            circuit: self.circuit.clone(),
        }
    }
}

impl<C: Command> Executor<C> {
    /// Executor with the default policy. Must be called within a tokio
    /// runtime; a first-seen (group, name) spawns its metric owner task.
    pub fn new(group: &str, name: &str, command: C) -> Self {
        Self::build(group, name, command, &ExecutorOptions::default())
    }

    /// Executor with an explicit policy.
    ///
    /// When the (group, name) circuit already exists, the breaker-side
    /// options are ignored in favor of the registered ones; the timeout
    /// still applies to this executor.
    pub fn with_options(
        group: &str,
        name: &str,
        command: C,
        options: ExecutorOptions,
    ) -> Result<Self, OptionsError> {
        options.circuit_options().validate()?;
        Ok(Self::build(group, name, command, &options))
    }

    fn build(group: &str, name: &str, command: C, options: &ExecutorOptions) -> Self {
        let circuit = CircuitBreaker::register(group, name, &options.circuit_options());
        Self {
            group: Arc::from(group),
            name: Arc::from(name),
            timeout: options.timeout,
            command: Arc::new(command),
            circuit,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn metric(&self) -> &MetricHandle {
        self.circuit.metric()
    }

    pub async fn health_counts(&self) -> HealthCounts {
        self.metric().health_counts().await
    }

    /// Execute the command, blocking the caller until the outcome settles.
    ///
    /// With the breaker closed the command runs on a fresh worker raced
    /// against the timeout; any failure (error, timeout, panic) diverts to
    /// the fallback path. With the breaker open the run is skipped entirely.
    /// A successful fallback absorbs the failure: the caller sees `Ok` and
    /// the underlying cause is logged.
    pub async fn execute(&self) -> Result<C::Output, CommandError> {
        let (open, reason) = self.circuit.evaluate().await;
        if open {
            tracing::debug!(
                group = %self.group,
                name = %self.name,
                reason,
                "circuit open, skipping run"
            );
            return self.run_fallback(None).await;
        }
        match self.run_guarded().await {
            Ok(value) => Ok(value),
            Err(nested) => self.run_fallback(Some(nested)).await,
        }
    }

    /// Execute asynchronously: the outcome lands on exactly one of the two
    /// returned single-slot channels.
    pub fn queue(&self) -> (oneshot::Receiver<C::Output>, oneshot::Receiver<CommandError>) {
        let (value_tx, value_rx) = oneshot::channel();
        let (error_tx, error_rx) = oneshot::channel();
        let executor = self.clone();
        tokio::spawn(async move {
            match executor.execute().await {
                Ok(value) => {
                    let _ = value_tx.send(value);
                }
                Err(error) => {
                    let _ = error_tx.send(error);
                }
            }
        });
        (value_rx, error_rx)
    }

    async fn run_guarded(&self) -> Result<C::Output, BoxError> {
        let metric = self.metric();
        let command = self.command.clone();
        let worker = tokio::spawn(async move {
            let start = Instant::now();
            let result = command.run().await;
            (start.elapsed(), result)
        });

        if self.timeout.is_zero() {
            // a zero deadline never observes a result; the worker finishes
            // detached and its outcome is discarded
            metric.timeout().await;
            return Err(self.timeout_error());
        }

        match tokio::time::timeout(self.timeout, worker).await {
            Ok(Ok((elapsed, Ok(value)))) => {
                metric.success(elapsed).await;
                Ok(value)
            }
            Ok(Ok((_elapsed, Err(error)))) => {
                metric.fail().await;
                Err(error)
            }
            Ok(Err(join_error)) => {
                metric.panicked().await;
                let recovered = RunPanicError { payload: panic_payload(join_error) };
                tracing::error!(
                    group = %self.group,
                    name = %self.name,
                    error = %recovered,
                    "worker panicked"
                );
                Err(Box::new(recovered))
            }
            Err(_) => {
                // dropping the join handle detaches the worker; it keeps
                // running and its late result is discarded
                metric.timeout().await;
                Err(self.timeout_error())
            }
        }
    }

    async fn run_fallback(&self, nested: Option<BoxError>) -> Result<C::Output, CommandError> {
        let metric = self.metric();
        metric.fallback().await;
        match self.command.fallback().await {
            None => {
                metric.fallback_error().await;
                let missing = NoFallbackError { name: self.name.to_string() };
                Err(CommandError::new(
                    &*self.group,
                    &*self.name,
                    nested,
                    Some(Box::new(missing)),
                ))
            }
            Some(Ok(value)) => {
                if let Some(cause) = nested {
                    let absorbed =
                        CommandError::new(&*self.group, &*self.name, Some(cause), None);
                    tracing::info!(error = %absorbed, "fallback absorbed failure");
                }
                Ok(value)
            }
            Some(Err(fallback_error)) => {
                metric.fallback_error().await;
                Err(CommandError::new(&*self.group, &*self.name, nested, Some(fallback_error)))
            }
        }
    }

    fn timeout_error(&self) -> BoxError {
        Box::new(RunTimeoutError {
            group: self.group.to_string(),
            name: self.name.to_string(),
            timeout: self.timeout,
        })
    }
}

fn panic_payload(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => {
            if let Some(message) = payload.downcast_ref::<&str>() {
                (*message).to_owned()
            } else if let Some(message) = payload.downcast_ref::<String>() {
                message.clone()
            } else {
                "unknown panic payload".to_owned()
            }
        }
        Err(error) => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OkCommand;

    #[async_trait]
    impl Command for OkCommand {
        type Output = &'static str;

        async fn run(&self) -> Result<Self::Output, BoxError> {
            Ok("hello circuit world")
        }
    }

    struct FailingCommand;

    #[async_trait]
    impl Command for FailingCommand {
        type Output = &'static str;

        async fn run(&self) -> Result<Self::Output, BoxError> {
            Err("this method is meant to fail".into())
        }
    }

    struct PanickingCommand;

    #[async_trait]
    impl Command for PanickingCommand {
        type Output = &'static str;

        async fn run(&self) -> Result<Self::Output, BoxError> {
            panic!("worker exploded");
        }
    }

    struct SleepyCommand;

    #[async_trait]
    impl Command for SleepyCommand {
        type Output = &'static str;

        async fn run(&self) -> Result<Self::Output, BoxError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late")
        }

        async fn fallback(&self) -> Option<Result<Self::Output, BoxError>> {
            Some(Ok("FALLBACK"))
        }
    }

    #[tokio::test]
    async fn returns_the_run_value_unchanged() {
        let executor = Executor::new("exec-unit", "ok", OkCommand);
        assert_eq!(executor.execute().await.unwrap(), "hello circuit world");

        let counts = executor.health_counts().await;
        assert_eq!(counts.success, 1);
        assert_eq!(counts.failures, 0);
    }

    #[tokio::test]
    async fn run_error_without_fallback_fails_with_the_contract_string() {
        let executor = Executor::new("G", "N", FailingCommand);
        let error = executor.execute().await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "[G:N] FallbackError: No fallback implementation available for N \
             RunError: this method is meant to fail"
        );

        let counts = executor.health_counts().await;
        assert_eq!(counts.failures, 1);
        assert_eq!(counts.fallback, 1);
        assert_eq!(counts.fallback_errors, 1);
    }

    #[tokio::test]
    async fn zero_timeout_always_takes_the_timeout_branch() {
        let options = ExecutorOptions::default().timeout(Duration::ZERO);
        let executor =
            Executor::with_options("exec-unit", "zero-timeout", OkCommand, options).unwrap();

        let error = executor.execute().await.unwrap_err();
        assert!(error.is_timeout());

        let counts = executor.health_counts().await;
        assert_eq!(counts.timeouts, 1);
        assert_eq!(counts.failures, 1);
        assert_eq!(counts.success, 0);
    }

    #[tokio::test]
    async fn timeout_does_not_wait_for_the_worker() {
        let options = ExecutorOptions::default().timeout(Duration::from_millis(10));
        let executor =
            Executor::with_options("exec-unit", "sleepy", SleepyCommand, options).unwrap();

        let started = std::time::Instant::now();
        assert_eq!(executor.execute().await.unwrap(), "FALLBACK");
        assert!(started.elapsed() < Duration::from_secs(5));

        let counts = executor.health_counts().await;
        assert_eq!(counts.timeouts, 1);
        assert_eq!(counts.failures, 1);
    }

    #[tokio::test]
    async fn panics_are_recovered_and_counted_apart_from_failures() {
        let executor = Executor::new("exec-unit", "panicky", PanickingCommand);
        let error = executor.execute().await.unwrap_err();
        assert!(error.is_panic());
        assert!(error.to_string().contains("Recovered from panic: worker exploded"));

        let counts = executor.health_counts().await;
        assert_eq!(counts.panics, 1);
        assert_eq!(counts.failures, 0);
        assert_eq!(counts.total, 0);
    }

    #[tokio::test]
    async fn timeout_message_names_the_command() {
        struct BareSleepyCommand;

        #[async_trait]
        impl Command for BareSleepyCommand {
            type Output = &'static str;

            async fn run(&self) -> Result<Self::Output, BoxError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("too late")
            }
        }

        let options = ExecutorOptions::default().timeout(Duration::from_millis(3));
        let executor =
            Executor::with_options("remote", "sleeper", BareSleepyCommand, options).unwrap();

        let error = executor.execute().await.unwrap_err();
        assert!(error.is_timeout());
        assert!(
            error
                .to_string()
                .ends_with("RunError: error: Timeout (3ms), executing command remote:sleeper"),
            "got: {error}"
        );
    }

    #[tokio::test]
    async fn options_validation_propagates() {
        let bad = ExecutorOptions::default().errors_threshold(250.0);
        let result = Executor::with_options("exec-unit", "bad-options", OkCommand, bad);
        assert!(matches!(result, Err(OptionsError::ErrorsThresholdOutOfRange(_))));
    }
}
