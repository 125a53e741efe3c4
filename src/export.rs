//! External metrics sink seam.
//!
//! Every recorded outcome is mirrored to the process-wide [`MetricsExport`]
//! as it lands in the health window, and a background poller periodically
//! reports each circuit's open/closed state. The default sink is
//! [`NullExport`]; wire a real one with [`set_export`].

use crate::registry::circuits;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Consumer of per-command metric events.
///
/// Called from the metric owner tasks and the state poller. Implementations
/// must not block: hand the event to a channel or a cheap in-memory
/// structure and return.
pub trait MetricsExport: Send + Sync + 'static {
    fn success(&self, group: &str, name: &str, duration: Duration);
    fn fail(&self, group: &str, name: &str);
    fn fallback(&self, group: &str, name: &str);
    fn fallback_error(&self, group: &str, name: &str);
    fn timeout(&self, group: &str, name: &str);
    fn panicked(&self, group: &str, name: &str);
    /// Open/closed gauge for one circuit, emitted by the state poller.
    fn state(&self, group: &str, name: &str, open: bool);
}

/// A recorded export event, as stored by [`MemoryExport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportEvent {
    Success { group: String, name: String, duration: Duration },
    Fail { group: String, name: String },
    Fallback { group: String, name: String },
    FallbackError { group: String, name: String },
    Timeout { group: String, name: String },
    Panic { group: String, name: String },
    State { group: String, name: String, open: bool },
}

impl ExportEvent {
    pub fn group(&self) -> &str {
        match self {
            ExportEvent::Success { group, .. }
            | ExportEvent::Fail { group, .. }
            | ExportEvent::Fallback { group, .. }
            | ExportEvent::FallbackError { group, .. }
            | ExportEvent::Timeout { group, .. }
            | ExportEvent::Panic { group, .. }
            | ExportEvent::State { group, .. } => group,
        }
    }
}

/// Discards every event; the configured default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullExport;

impl MetricsExport for NullExport {
    fn success(&self, _group: &str, _name: &str, _duration: Duration) {}
    fn fail(&self, _group: &str, _name: &str) {}
    fn fallback(&self, _group: &str, _name: &str) {}
    fn fallback_error(&self, _group: &str, _name: &str) {}
    fn timeout(&self, _group: &str, _name: &str) {}
    fn panicked(&self, _group: &str, _name: &str) {}
    fn state(&self, _group: &str, _name: &str, _open: bool) {}
}

/// Forwards events to `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogExport;

impl MetricsExport for LogExport {
    fn success(&self, group: &str, name: &str, duration: Duration) {
        tracing::info!(group, name, ?duration, "command success");
    }

    fn fail(&self, group: &str, name: &str) {
        tracing::info!(group, name, "command failure");
    }

    fn fallback(&self, group: &str, name: &str) {
        tracing::info!(group, name, "command fallback");
    }

    fn fallback_error(&self, group: &str, name: &str) {
        tracing::info!(group, name, "command fallback error");
    }

    fn timeout(&self, group: &str, name: &str) {
        tracing::info!(group, name, "command timeout");
    }

    fn panicked(&self, group: &str, name: &str) {
        tracing::info!(group, name, "command panic");
    }

    fn state(&self, group: &str, name: &str, open: bool) {
        tracing::info!(group, name, open, "circuit state");
    }
}

/// Stores events in memory with bounded capacity; test instrumentation.
#[derive(Debug, Clone)]
pub struct MemoryExport {
    events: Arc<Mutex<Vec<ExportEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemoryExport {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<ExportEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events for one group only; keeps assertions stable when circuits from
    /// unrelated tests share the process-global sink.
    pub fn events_for_group(&self, group: &str) -> Vec<ExportEvent> {
        self.events.lock().unwrap().iter().filter(|e| e.group() == group).cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn push(&self, event: ExportEvent) {
        let mut guard = self.events.lock().unwrap();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
    }
}

impl Default for MemoryExport {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsExport for MemoryExport {
    fn success(&self, group: &str, name: &str, duration: Duration) {
        self.push(ExportEvent::Success { group: group.into(), name: name.into(), duration });
    }

    fn fail(&self, group: &str, name: &str) {
        self.push(ExportEvent::Fail { group: group.into(), name: name.into() });
    }

    fn fallback(&self, group: &str, name: &str) {
        self.push(ExportEvent::Fallback { group: group.into(), name: name.into() });
    }

    fn fallback_error(&self, group: &str, name: &str) {
        self.push(ExportEvent::FallbackError { group: group.into(), name: name.into() });
    }

    fn timeout(&self, group: &str, name: &str) {
        self.push(ExportEvent::Timeout { group: group.into(), name: name.into() });
    }

    fn panicked(&self, group: &str, name: &str) {
        self.push(ExportEvent::Panic { group: group.into(), name: name.into() });
    }

    fn state(&self, group: &str, name: &str, open: bool) {
        self.push(ExportEvent::State { group: group.into(), name: name.into(), open });
    }
}

fn export_cell() -> &'static RwLock<Arc<dyn MetricsExport>> {
    static CELL: OnceLock<RwLock<Arc<dyn MetricsExport>>> = OnceLock::new();
    CELL.get_or_init(|| RwLock::new(Arc::new(NullExport)))
}

/// Install the process-wide sink. Applies to already-registered circuits.
pub fn set_export(export: Arc<dyn MetricsExport>) {
    *export_cell().write().unwrap() = export;
}

/// The currently configured sink.
pub fn current_export() -> Arc<dyn MetricsExport> {
    export_cell().read().unwrap().clone()
}

/// Evaluate every registered circuit once and emit its state gauge.
pub async fn export_registry_state() {
    let export = current_export();
    for (group, name, circuit) in circuits().entries() {
        let (open, _) = circuit.evaluate().await;
        export.state(&group, &name, open);
    }
}

/// Report circuit states to the sink on a fixed interval.
///
/// The task runs until aborted; callers keep the handle.
pub fn spawn_state_poller(interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            export_registry_state().await;
        }
    })
}
