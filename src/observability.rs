//! Process-wide counters for operator introspection

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics handle for recording counters
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_planned: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    uploads_conflicted: AtomicU64,
    values_migrated: AtomicU64,
    discrepancies_found: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_planned(&self) {
        self.jobs_planned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_dead_lettered(&self) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_conflicted(&self) {
        self.uploads_conflicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn values_migrated(&self, count: u64) {
        self.values_migrated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn discrepancies_found(&self, count: u64) {
        self.discrepancies_found.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_planned: self.jobs_planned.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_dead_lettered: self.jobs_dead_lettered.load(Ordering::Relaxed),
            uploads_conflicted: self.uploads_conflicted.load(Ordering::Relaxed),
            values_migrated: self.values_migrated.load(Ordering::Relaxed),
            discrepancies_found: self.discrepancies_found.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub jobs_planned: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub uploads_conflicted: u64,
    pub values_migrated: u64,
    pub discrepancies_found: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.job_planned();
        metrics.job_planned();
        metrics.values_migrated(10);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_planned, 2);
        assert_eq!(snapshot.values_migrated, 10);
        assert_eq!(snapshot.jobs_dead_lettered, 0);
    }
}
