//! Planner counters
//!
//! - Counters only, monotonic
//! - Thread-safe, Relaxed ordering
//! - Shared by the arena and every executor built on it

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters for one planner
#[derive(Debug, Default)]
pub struct PlannerMetrics {
    plans_created: AtomicU64,
    plans_deduplicated: AtomicU64,
    plans_inlined: AtomicU64,
    plans_standalone: AtomicU64,
    plans_finalized: AtomicU64,
    batches_executed: AtomicU64,
    rows_fetched: AtomicU64,
    streams_opened: AtomicU64,
    sources_released: AtomicU64,
    cursors_rejected: AtomicU64,
}

impl PlannerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // Planning

    pub fn increment_plans_created(&self) {
        self.plans_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_plans_deduplicated(&self) {
        self.plans_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts both join and subquery inlining
    pub fn increment_plans_inlined(&self) {
        self.plans_inlined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_plans_standalone(&self) {
        self.plans_standalone.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_plans_finalized(&self) {
        self.plans_finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_cursors_rejected(&self) {
        self.cursors_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // Execution

    pub fn increment_batches_executed(&self) {
        self.batches_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rows_fetched(&self, rows: u64) {
        self.rows_fetched.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn increment_streams_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_sources_released(&self) {
        self.sources_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            plans_created: self.plans_created.load(Ordering::Relaxed),
            plans_deduplicated: self.plans_deduplicated.load(Ordering::Relaxed),
            plans_inlined: self.plans_inlined.load(Ordering::Relaxed),
            plans_standalone: self.plans_standalone.load(Ordering::Relaxed),
            plans_finalized: self.plans_finalized.load(Ordering::Relaxed),
            batches_executed: self.batches_executed.load(Ordering::Relaxed),
            rows_fetched: self.rows_fetched.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            sources_released: self.sources_released.load(Ordering::Relaxed),
            cursors_rejected: self.cursors_rejected.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub plans_created: u64,
    pub plans_deduplicated: u64,
    pub plans_inlined: u64,
    pub plans_standalone: u64,
    pub plans_finalized: u64,
    pub batches_executed: u64,
    pub rows_fetched: u64,
    pub streams_opened: u64,
    pub sources_released: u64,
    pub cursors_rejected: u64,
}
