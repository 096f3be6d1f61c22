//! Aggregate counters shared by client workers and server handlers.
//!
//! A `Stats` instance is built once and handed down as `Arc<Stats>`; nothing
//! here is process-global, so tests can run isolated instances side by side.

use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// Lock-free counters updated concurrently from many workers.
#[derive(Debug, Default)]
pub struct Stats {
    connections: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
    /// Sum of verified round trips, in microseconds.
    rtt_total_us: AtomicU64,
    /// Slowest verified round trip, in microseconds.
    rtt_max_us: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections: u64,
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub rtt_total_us: u64,
    pub rtt_max_us: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the latency of one verified request/response cycle.
    pub fn record_round_trip(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.rtt_total_us.fetch_add(us, Ordering::Relaxed);
        self.rtt_max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            rtt_total_us: self.rtt_total_us.load(Ordering::Relaxed),
            rtt_max_us: self.rtt_max_us.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Mean round trip over verified messages.
    pub fn avg_round_trip(&self) -> Option<Duration> {
        if self.received == 0 {
            return None;
        }
        Some(Duration::from_micros(self.rtt_total_us / self.received))
    }
}

/// Final summary of a load run.
#[derive(Debug, Clone)]
pub struct Report {
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub attempted: usize,
    pub totals: StatsSnapshot,
}

impl Report {
    /// Verified messages per second over the whole run.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.totals.received as f64 / secs
        } else {
            0.0
        }
    }

    /// Emit the summary through the logging sink.
    pub fn log(&self) {
        let t = &self.totals;
        info!(
            started_at = %self.started_at.format("%Y-%m-%d %H:%M:%S"),
            attempted = self.attempted,
            connections = t.connections,
            sent = t.sent,
            received = t.received,
            errors = t.errors,
            elapsed_ms = self.elapsed.as_millis() as u64,
            "Test completed"
        );
        info!(
            throughput = %format!("{:.1}", self.throughput()),
            avg_rtt_us = t.avg_round_trip().map(|d| d.as_micros() as u64).unwrap_or(0),
            max_rtt_us = t.rtt_max_us,
            "Throughput (messages/sec)"
        );
    }
}
