#![forbid(unsafe_code)]

//! # Fusebox
//!
//! Hystrix-style command isolation for async Rust: wrap each outbound
//! dependency call in a [`Command`], execute it through an [`Executor`], and
//! let a per-dependency circuit breaker divert traffic to a fallback when
//! the dependency is failing above policy.
//!
//! ## What a call does
//!
//! - bounds the latency the caller observes, even when the dependency hangs
//!   (the worker is raced against a timeout and left behind on loss)
//! - records every outcome into a rolling per-second health window and an
//!   exponentially-decaying reservoir of success latencies
//! - opens the circuit when the windowed error percentage crosses the
//!   threshold, skipping the dependency entirely until the window recovers
//! - recovers panics from the command and treats them like failures of the
//!   primary path
//! - mirrors every outcome to a pluggable metrics sink and exposes the whole
//!   registry as a JSON debug document
//!
//! There is no half-open probe state: the window ages out on its own, so
//! recovery is discovered by organic traffic.
//!
//! ## Quick Start
//!
//! ```rust
//! use async_trait::async_trait;
//! use fusebox::{BoxError, Command, Executor, ExecutorOptions};
//! use std::time::Duration;
//!
//! struct FetchUser;
//!
//! #[async_trait]
//! impl Command for FetchUser {
//!     type Output = String;
//!
//!     async fn run(&self) -> Result<String, BoxError> {
//!         // call the real dependency here
//!         Ok("alice".to_owned())
//!     }
//!
//!     async fn fallback(&self) -> Option<Result<String, BoxError>> {
//!         Some(Ok("anonymous".to_owned()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fusebox::CommandError> {
//!     let options = ExecutorOptions::default()
//!         .errors_threshold(50.0)
//!         .minimum_requests(10)
//!         .timeout(Duration::from_millis(250));
//!     let executor =
//!         Executor::with_options("users", "fetch", FetchUser, options).expect("valid options");
//!
//!     let user = executor.execute().await?;
//!     assert_eq!(user, "alice");
//!     Ok(())
//! }
//! ```

mod circuit_breaker;
mod clock;
mod error;
mod executor;
mod export;
mod metric;
mod registry;
mod sample;

// Re-exports
pub use circuit_breaker::{
    CircuitBreaker, CircuitOptions, DEFAULT_ERRORS_THRESHOLD, DEFAULT_MINIMUM_REQUESTS,
};
pub use clock::{Clock, MonotonicClock};
pub use error::{
    BoxError, CommandError, NoFallbackError, OptionsError, RunPanicError, RunTimeoutError,
};
pub use executor::{Command, Executor, ExecutorOptions, DEFAULT_TIMEOUT};
pub use export::{
    current_export, export_registry_state, set_export, spawn_state_poller, ExportEvent, LogExport,
    MemoryExport, MetricsExport, NullExport,
};
pub use metric::{
    HealthCounts, MetricHandle, MetricSnapshot, DEFAULT_SAMPLES_TO_STORE, DEFAULT_SECONDS_TO_STORE,
};
pub use registry::{circuits, circuits_reset, CircuitRegistry};
pub use sample::{ExpDecaySample, SampleSnapshot, DEFAULT_ALPHA};

pub mod prelude;
