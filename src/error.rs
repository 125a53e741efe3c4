//! Error types for command execution.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Opaque user-side failure; run and fallback errors both land here.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Synthesized when the timeout timer beats the worker.
#[derive(Debug, Error)]
#[error("error: Timeout ({timeout:?}), executing command {group}:{name}")]
pub struct RunTimeoutError {
    pub group: String,
    pub name: String,
    pub timeout: Duration,
}

/// Synthesized when the worker panicked and the panic was recovered.
#[derive(Debug, Error)]
#[error("Recovered from panic: {payload}")]
pub struct RunPanicError {
    pub payload: String,
}

/// Synthesized when the fallback path is taken but the command has none.
#[derive(Debug, Error)]
#[error("No fallback implementation available for {name}")]
pub struct NoFallbackError {
    pub name: String,
}

/// Configuration rejected at construction time.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum OptionsError {
    #[error("errors threshold must be a percentage in [0, 100], got {0}")]
    ErrorsThresholdOutOfRange(f64),
    #[error("window must cover at least one second")]
    EmptyWindow,
    #[error("latency reservoir must hold at least one sample")]
    EmptyReservoir,
}

/// Composite error for a failed command invocation.
///
/// Carries the command identity plus the run-side cause (user error, timeout,
/// or recovered panic) and the fallback-side cause (user fallback error or
/// [`NoFallbackError`]), either of which may be absent. This is the public
/// error contract: a call only fails with a `CommandError`.
#[derive(Debug)]
pub struct CommandError {
    group: String,
    name: String,
    run_error: Option<BoxError>,
    fallback_error: Option<BoxError>,
}

impl CommandError {
    pub(crate) fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        run_error: Option<BoxError>,
        fallback_error: Option<BoxError>,
    ) -> Self {
        Self { group: group.into(), name: name.into(), run_error, fallback_error }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The error produced by `run`, the timeout, or the recovered panic.
    pub fn run_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.run_error.as_deref()
    }

    /// The error produced by the fallback path.
    pub fn fallback_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.fallback_error.as_deref()
    }

    /// True when the run-side cause was the synthesized timeout.
    pub fn is_timeout(&self) -> bool {
        self.run_error.as_ref().map_or(false, |e| e.is::<RunTimeoutError>())
    }

    /// True when the run-side cause was a recovered panic.
    pub fn is_panic(&self) -> bool {
        self.run_error.as_ref().map_or(false, |e| e.is::<RunPanicError>())
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.group, self.name)?;
        if let Some(fallback) = &self.fallback_error {
            write!(f, " FallbackError: {}", fallback)?;
        }
        if let Some(run) = &self.run_error {
            write!(f, " RunError: {}", run)?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.fallback_error
            .as_ref()
            .or(self.run_error.as_ref())
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}
