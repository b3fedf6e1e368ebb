//! Global atomic counters for control-plane observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the daemon does this on every sweep tick).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    deployments_created: AtomicU64,
    services_skipped: AtomicU64,
    reconciles_succeeded: AtomicU64,
    reconciles_failed: AtomicU64,
    queue_rejections: AtomicU64,
    builds_delegated: AtomicU64,
    builds_local: AtomicU64,
    admission_timeouts: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident) => {
        pub fn $inc(&self) {
            self.$get.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($get), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$get.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            deployments_created: AtomicU64::new(0),
            services_skipped: AtomicU64::new(0),
            reconciles_succeeded: AtomicU64::new(0),
            reconciles_failed: AtomicU64::new(0),
            queue_rejections: AtomicU64::new(0),
            builds_delegated: AtomicU64::new(0),
            builds_local: AtomicU64::new(0),
            admission_timeouts: AtomicU64::new(0),
        }
    }

    counter!(inc_deployments_created, deployments_created);
    counter!(inc_services_skipped, services_skipped);
    counter!(inc_reconciles_succeeded, reconciles_succeeded);
    counter!(inc_reconciles_failed, reconciles_failed);
    counter!(inc_queue_rejections, queue_rejections);
    counter!(inc_builds_delegated, builds_delegated);
    counter!(inc_builds_local, builds_local);
    counter!(inc_admission_timeouts, admission_timeouts);

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            deployments_created = self.deployments_created(),
            services_skipped = self.services_skipped(),
            reconciles_succeeded = self.reconciles_succeeded(),
            reconciles_failed = self.reconciles_failed(),
            queue_rejections = self.queue_rejections(),
            builds_delegated = self.builds_delegated(),
            builds_local = self.builds_local(),
            admission_timeouts = self.admission_timeouts(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.deployments_created,
            &self.services_skipped,
            &self.reconciles_succeeded,
            &self.reconciles_failed,
            &self.queue_rejections,
            &self.builds_delegated,
            &self.builds_local,
            &self.admission_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.deployments_created(), 0);
        m.inc_deployments_created();
        m.inc_deployments_created();
        assert_eq!(m.deployments_created(), 2);

        m.inc_queue_rejections();
        assert_eq!(m.queue_rejections(), 1);
        assert_eq!(m.builds_local(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_services_skipped();
        m.inc_reconciles_failed();
        m.inc_admission_timeouts();
        m.reset();
        assert_eq!(m.services_skipped(), 0);
        assert_eq!(m.reconciles_failed(), 0);
        assert_eq!(m.admission_timeouts(), 0);
    }
}
