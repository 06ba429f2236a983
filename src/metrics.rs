//! Metrics instrumentation for servicekeel.
//!
//! All metrics are prefixed with `servicekeel.`

use metrics::{counter, gauge, histogram, Counter, Gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Record a DNS question.
pub fn record_query(record_type: &str, result: QueryResult, duration: std::time::Duration) {
    let result_str = match result {
        QueryResult::Hijacked => "hijacked",
        QueryResult::Empty => "empty",
        QueryResult::NxDomain => "nxdomain",
        QueryResult::Unsupported => "unsupported",
    };

    counter!("servicekeel.dns.query.count", "type" => record_type.to_string(), "result" => result_str)
        .increment(1);
    histogram!("servicekeel.dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// Query result type for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    /// Answered with a virtual IP.
    Hijacked,
    /// Answered successfully with no records (AAAA, other types).
    Empty,
    /// A question with no matching mapping.
    NxDomain,
    /// Request opcode is not a query.
    Unsupported,
}

/// Record virtual IP pool state (call periodically).
pub fn record_pool_state(used: usize, capacity: u64, aliases: usize) {
    gauge!("servicekeel.pool.used").set(used as f64);
    gauge!("servicekeel.pool.capacity").set(capacity as f64);
    gauge!("servicekeel.state.aliases.count").set(aliases as f64);
}

/// Reconciliation metrics owned by a single controller.
///
/// Values are kept locally so they can be read back, and mirrored into the
/// global recorder labelled with the controller's instance name.
pub struct ReconcileMetrics {
    errors: AtomicU64,
    cycles: AtomicU64,
    active: AtomicU64,
    errors_counter: Counter,
    cycles_counter: Counter,
    active_gauge: Gauge,
}

impl ReconcileMetrics {
    /// Create metrics for the controller named `instance`.
    pub fn new(instance: &str) -> Self {
        let instance = instance.to_string();
        Self {
            errors: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            active: AtomicU64::new(0),
            errors_counter: counter!("servicekeel.reconcile.errors.count", "instance" => instance.clone()),
            cycles_counter: counter!("servicekeel.reconcile.cycles.count", "instance" => instance.clone()),
            active_gauge: gauge!("servicekeel.reconcile.active_endpoints", "instance" => instance),
        }
    }

    /// A cycle failed as a whole.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.errors_counter.increment(1);
    }

    /// A cycle completed.
    pub fn record_cycle(&self, duration: std::time::Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.cycles_counter.increment(1);
        histogram!("servicekeel.reconcile.duration.seconds").record(duration.as_secs_f64());
    }

    /// Set the number of endpoints currently running.
    pub fn set_active_endpoints(&self, count: usize) {
        self.active.store(count as u64, Ordering::Relaxed);
        self.active_gauge.set(count as f64);
    }

    /// Cycle-level errors so far.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Completed cycles so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Last reported active endpoint count.
    pub fn active_endpoints(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
