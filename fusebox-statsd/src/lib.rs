//! Statsd metrics sink for `fusebox`.
//!
//! Formats command events into the statsd line protocol and ships them over
//! UDP from a background task. Emission never blocks the recorder: the
//! datagram is queued with `try_send` and dropped (counted) when the queue
//! is full.
//!
//! Wire format, with `prefix.group.name` as the key base:
//!
//! - counters `<base>.<event>:1|c` for
//!   `success | fail | fallback | fallbackError | timeout | panic`
//! - timing `<base>.duration:<ms>|ms` on every success
//! - gauge `<base>.open:0|1|g` from the circuit-state poller

use fusebox::MetricsExport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const QUEUE_CAPACITY: usize = 1_024;

/// Statsd sink over UDP.
///
/// Install it with [`fusebox::set_export`] and pair it with
/// [`fusebox::spawn_state_poller`] for the open/closed gauges.
#[derive(Debug, Clone)]
pub struct StatsdExport {
    prefix: Arc<str>,
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl StatsdExport {
    /// Connect to a statsd daemon, e.g. `StatsdExport::new("hystrix",
    /// "127.0.0.1:8125")`.
    ///
    /// # Errors
    ///
    /// Returns an error when the local socket cannot be bound or the remote
    /// address does not resolve.
    pub async fn new(prefix: &str, addr: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        let (tx, mut rx) = mpsc::channel::<String>(QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(error) = socket.send(line.as_bytes()).await {
                    tracing::debug!(%error, "statsd send failed");
                }
            }
        });

        Ok(Self { prefix: Arc::from(prefix), tx, dropped: Arc::new(AtomicU64::new(0)) })
    }

    /// Datagrams discarded because the outbound queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn emit(&self, line: String) {
        if self.tx.try_send(line).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counter(&self, group: &str, name: &str, event: &str) {
        self.emit(format!("{}.{}.{}.{}:1|c", self.prefix, group, name, event));
    }
}

impl MetricsExport for StatsdExport {
    fn success(&self, group: &str, name: &str, duration: Duration) {
        self.counter(group, name, "success");
        self.emit(format!(
            "{}.{}.{}.duration:{}|ms",
            self.prefix,
            group,
            name,
            duration.as_millis()
        ));
    }

    fn fail(&self, group: &str, name: &str) {
        self.counter(group, name, "fail");
    }

    fn fallback(&self, group: &str, name: &str) {
        self.counter(group, name, "fallback");
    }

    fn fallback_error(&self, group: &str, name: &str) {
        self.counter(group, name, "fallbackError");
    }

    fn timeout(&self, group: &str, name: &str) {
        self.counter(group, name, "timeout");
    }

    fn panicked(&self, group: &str, name: &str) {
        self.counter(group, name, "panic");
    }

    fn state(&self, group: &str, name: &str, open: bool) {
        self.emit(format!("{}.{}.{}.open:{}|g", self.prefix, group, name, u8::from(open)));
    }
}
