//! Semaphore-based build admission.
//!
//! [`BuildAdmissionController`] bounds how many local builds run at once
//! across the platform. Slots are returned when the [`BuildSlot`] is dropped,
//! so every exit path (success, error, timeout, panic) gives capacity back.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::AdmissionError;
use crate::metrics::METRICS;

/// Builds are fully serialised unless configured otherwise.
pub const DEFAULT_BUILD_SLOTS: usize = 1;

/// Budget for one build attempt, slot wait included.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The right to run one build. Dropping it releases the slot.
#[derive(Debug)]
pub struct BuildSlot {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct BuildAdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    timeout: Duration,
}

impl BuildAdmissionController {
    /// `capacity` of zero is raised to one.
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        info!(capacity, timeout_secs = timeout.as_secs(), "build admission controller created");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            timeout,
        }
    }

    /// Wait for a slot for at most the configured timeout.
    pub async fn acquire(&self) -> Result<BuildSlot, AdmissionError> {
        self.acquire_until(Instant::now() + self.timeout).await
    }

    /// Wait for a slot until `deadline`.
    ///
    /// Callers that bound the build itself by the same deadline pass it here
    /// so slot wait and build share one budget.
    pub async fn acquire_until(&self, deadline: Instant) -> Result<BuildSlot, AdmissionError> {
        let started = Instant::now();
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        match tokio::time::timeout_at(deadline, acquire).await {
            Ok(Ok(permit)) => {
                debug!(waited_ms = started.elapsed().as_millis() as u64, "build slot acquired");
                Ok(BuildSlot { _permit: permit })
            }
            Ok(Err(_)) => Err(AdmissionError::Closed),
            Err(_) => {
                METRICS.inc_admission_timeouts();
                let waited = started.elapsed();
                warn!(waited_secs = waited.as_secs(), "timed out waiting for build slot");
                Err(AdmissionError::Timeout { waited })
            }
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<BuildSlot> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(BuildSlot { _permit: permit })
    }

    /// Stop admitting. Waiters and later callers get [`AdmissionError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for BuildAdmissionController {
    fn default() -> Self {
        Self::new(DEFAULT_BUILD_SLOTS, DEFAULT_BUILD_TIMEOUT)
    }
}
