//! Per-run atomic counters.
//!
//! Each pipeline run owns one [`RunMetrics`]; counters are incremented
//! silently at the call site and emitted once via [`RunMetrics::flush`] when
//! the run ends.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lightweight atomic counters; no allocations, no locking.
#[derive(Debug, Default)]
pub struct RunMetrics {
    invocations: AtomicU64,
    denied: AtomicU64,
    recoveries: AtomicU64,
    verification_issues: AtomicU64,
    stage_retries: AtomicU64,
    escalations: AtomicU64,
}

/// Point-in-time copy of [`RunMetrics`], embedded in the run result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub invocations: u64,
    pub denied: u64,
    pub recoveries: u64,
    pub verification_issues: u64,
    pub stage_retries: u64,
    pub escalations: u64,
}

impl RunMetrics {
    pub const fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            verification_issues: AtomicU64::new(0),
            stage_retries: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
        }
    }

    pub fn inc_invocations(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_recoveries(&self, n: u64) {
        self.recoveries.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_verification_issues(&self, n: u64) {
        self.verification_issues.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_stage_retries(&self) {
        self.stage_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_escalations(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            verification_issues: self.verification_issues.load(Ordering::Relaxed),
            stage_retries: self.stage_retries.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self, run_id: &str) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            run_id = %run_id,
            invocations = s.invocations,
            denied = s.denied,
            recoveries = s.recoveries,
            verification_issues = s.verification_issues,
            stage_retries = s.stage_retries,
            escalations = s.escalations,
        );
    }
}
