//! Repository ports consumed by the orchestration core.
//!
//! - `ServiceCatalog` / `EnvironmentStore`: project configuration (read-mostly)
//! - `ReleaseStore`: built artifacts and their build outcome
//! - `DeploymentStore`: deployment attempts and their status/health
//! - `GroupStore`: deployment groups and their lifecycle
//! - `DependencyStore`: persisted service dependency edges
//!
//! All traits are async and backend-agnostic. A write must be durable when
//! the call returns, because the caller may hand the entity id to another
//! component immediately. In-memory fakes live in the `fakes` module.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::ids::*;
use crate::records::*;
use crate::status::{DeploymentStatus, GroupStatus, HealthStatus, ReleaseStatus};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Project configuration
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    /// Returns `StorageError::NotFound` for an unknown id.
    async fn get_service(&self, id: &ServiceId) -> StorageResult<Service>;

    /// All services of a project, ascending by id.
    async fn list_by_project(&self, project_id: &ProjectId) -> StorageResult<Vec<Service>>;

    /// Insert or replace.
    async fn upsert_service(&self, service: Service) -> StorageResult<()>;
}

#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    async fn get_environment(&self, id: &EnvironmentId) -> StorageResult<Environment>;

    /// Look an environment up by its project-scoped name.
    async fn find_by_name(
        &self,
        project_id: &ProjectId,
        name: &str,
    ) -> StorageResult<Option<Environment>>;

    async fn upsert_environment(&self, environment: Environment) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// ReleaseStore
// ---------------------------------------------------------------------------

/// Guarantees:
/// - `list_by_service` returns newest releases first.
/// - `update_status` only performs transitions allowed by [`ReleaseStatus`].
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    async fn create_release(&self, release: Release) -> StorageResult<()>;

    async fn get_release(&self, id: &ReleaseId) -> StorageResult<Release>;

    async fn list_by_service(&self, service_id: &ServiceId) -> StorageResult<Vec<Release>>;

    async fn update_status(
        &self,
        id: &ReleaseId,
        status: ReleaseStatus,
        failure_reason: Option<String>,
    ) -> StorageResult<Release>;

    /// Attach build outputs. Allowed only while the release is `building`.
    async fn record_artifact(
        &self,
        id: &ReleaseId,
        image_uri: String,
        sbom: Option<serde_json::Value>,
        signature: Option<String>,
    ) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// DeploymentStore
// ---------------------------------------------------------------------------

/// Guarantees:
/// - `update_status` only performs transitions allowed by [`DeploymentStatus`].
/// - Terminal deployments are never modified in place.
/// - `list_by_group` is ordered by `deploy_order`, then creation.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Returns `StorageError::AlreadyExists` when the id was already written.
    async fn create_deployment(&self, deployment: Deployment) -> StorageResult<()>;

    async fn get_deployment(&self, id: &DeploymentId) -> StorageResult<Deployment>;

    async fn list_by_group(&self, group_id: &GroupId) -> StorageResult<Vec<Deployment>>;

    async fn list_by_status(&self, status: DeploymentStatus) -> StorageResult<Vec<Deployment>>;

    /// Deployments of one service into one environment, oldest first.
    async fn list_by_service_environment(
        &self,
        service_id: &ServiceId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Vec<Deployment>>;

    async fn update_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        health: HealthStatus,
        error_message: Option<String>,
    ) -> StorageResult<Deployment>;

    /// Update only the health axis. Rejected for terminal deployments.
    async fn update_health(&self, id: &DeploymentId, health: HealthStatus)
        -> StorageResult<Deployment>;
}

// ---------------------------------------------------------------------------
// GroupStore
// ---------------------------------------------------------------------------

/// Guarantees:
/// - `update_status` only performs transitions allowed by [`GroupStatus`],
///   stamping `started_at` on `running` and `completed_at` on settled states.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn create_group(&self, group: DeploymentGroup) -> StorageResult<()>;

    async fn get_group(&self, id: &GroupId) -> StorageResult<DeploymentGroup>;

    async fn update_status(
        &self,
        id: &GroupId,
        status: GroupStatus,
        error_message: Option<String>,
    ) -> StorageResult<DeploymentGroup>;

    /// Record an error on the group without changing its status.
    async fn record_error(&self, id: &GroupId, error_message: String) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// DependencyStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DependencyStore: Send + Sync {
    /// Returns `StorageError::AlreadyExists` if the `(service, depends_on)` pair is present.
    async fn create_dependency(&self, dependency: ServiceDependency) -> StorageResult<()>;

    /// Idempotent. Returns whether a row was removed.
    async fn delete_dependency(
        &self,
        service_id: &ServiceId,
        depends_on: &ServiceId,
    ) -> StorageResult<bool>;

    async fn list_dependencies(&self) -> StorageResult<Vec<ServiceDependency>>;
}

// ---------------------------------------------------------------------------
// StateStores
// ---------------------------------------------------------------------------

/// One handle per repository port.
#[derive(Clone)]
pub struct StateStores {
    pub services: Arc<dyn ServiceCatalog>,
    pub environments: Arc<dyn EnvironmentStore>,
    pub releases: Arc<dyn ReleaseStore>,
    pub deployments: Arc<dyn DeploymentStore>,
    pub groups: Arc<dyn GroupStore>,
    pub dependencies: Arc<dyn DependencyStore>,
}

impl std::fmt::Debug for StateStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStores").finish_non_exhaustive()
    }
}
