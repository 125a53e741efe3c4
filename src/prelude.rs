//! Convenient re-exports for common Fusebox types.
pub use crate::{
    circuits, circuits_reset, set_export, BoxError, CircuitBreaker, CircuitOptions, CircuitRegistry,
    Command, CommandError, Executor, ExecutorOptions, HealthCounts, LogExport, MemoryExport,
    MetricsExport, NullExport, SampleSnapshot,
};
