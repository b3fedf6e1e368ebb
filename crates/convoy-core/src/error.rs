//! Error types for the orchestration core.
//!
//! Each component has its own narrow error; [`ConvoyError`] is what the
//! externally exposed operations return.

use std::time::Duration;

use convoy_state::{ServiceId, StorageError};
use thiserror::Error;

use crate::reconciler::RollbackError;

fn join_ids(ids: &[ServiceId]) -> String {
    ids.iter().map(ServiceId::as_str).collect::<Vec<_>>().join(", ")
}

/// Dependency graph violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("service {service} cannot depend on itself")]
    SelfDependency { service: ServiceId },

    /// The edge (or selection) would contain a cycle through these services.
    #[error("dependency cycle detected involving services: {}", join_ids(.services))]
    Cycle { services: Vec<ServiceId> },
}

/// Reconciliation admission failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Backpressure: retry later.
    #[error("work queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("reconciliation scheduler is shutting down")]
    ShuttingDown,
}

/// Build slot acquisition failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("timed out after {waited:?} waiting for a build slot")]
    Timeout { waited: Duration },

    #[error("build admission controller has been closed")]
    Closed,
}

/// External build farm failures. Any of these triggers the local fallback.
#[derive(Debug, Error)]
pub enum BuildFarmError {
    #[error("build farm unreachable: {0}")]
    Transport(String),

    #[error("build farm rejected enqueue with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed build farm response: {0}")]
    Decode(String),
}

/// Errors produced by the control plane operations.
#[derive(Debug, Error)]
pub enum ConvoyError {
    /// Request rejected before any state was touched.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown service: {service}")]
    UnknownService { service: ServiceId },

    #[error("no ready release found for service {service}")]
    NoReadyRelease { service: ServiceId },

    /// The entity exists but is not in a state that allows the operation.
    #[error("{entity} {id} is {actual}, expected {expected}")]
    InvalidState {
        entity: &'static str,
        id: String,
        actual: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    BuildFarm(#[from] BuildFarmError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ConvoyError {
    /// Backpressure the caller should answer with a later retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConvoyError::Schedule(ScheduleError::QueueFull { .. })
                | ConvoyError::Admission(AdmissionError::Timeout { .. })
        )
    }

    /// Validation-class errors: nothing was mutated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ConvoyError::Validation(_)
                | ConvoyError::UnknownService { .. }
                | ConvoyError::Graph(GraphError::SelfDependency { .. })
        )
    }
}

/// Convenience result alias.
pub type ConvoyResult<T> = std::result::Result<T, ConvoyError>;
