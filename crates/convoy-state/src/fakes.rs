//! In-memory fakes for the repository ports.
//!
//! Every fake enforces the same state-machine rules a real backend must, so
//! tests exercising the core against them see realistic rejections.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::ids::*;
use crate::records::*;
use crate::status::{DeploymentStatus, GroupStatus, HealthStatus, ReleaseStatus};
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn invalid_transition(
    entity: &'static str,
    id: impl ToString,
    from: impl ToString,
    to: impl ToString,
) -> StorageError {
    StorageError::InvalidTransition {
        entity,
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

// ---------------------------------------------------------------------------
// MemoryServiceCatalog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryServiceCatalog {
    services: Mutex<BTreeMap<ServiceId, Service>>,
}

impl MemoryServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceCatalog for MemoryServiceCatalog {
    async fn get_service(&self, id: &ServiceId) -> StorageResult<Service> {
        lock(&self.services)
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("service", id))
    }

    async fn list_by_project(&self, project_id: &ProjectId) -> StorageResult<Vec<Service>> {
        Ok(lock(&self.services)
            .values()
            .filter(|s| &s.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn upsert_service(&self, service: Service) -> StorageResult<()> {
        lock(&self.services).insert(service.id.clone(), service);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryEnvironmentStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryEnvironmentStore {
    environments: Mutex<BTreeMap<EnvironmentId, Environment>>,
}

impl MemoryEnvironmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnvironmentStore for MemoryEnvironmentStore {
    async fn get_environment(&self, id: &EnvironmentId) -> StorageResult<Environment> {
        lock(&self.environments)
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("environment", id))
    }

    async fn find_by_name(
        &self,
        project_id: &ProjectId,
        name: &str,
    ) -> StorageResult<Option<Environment>> {
        Ok(lock(&self.environments)
            .values()
            .find(|e| &e.project_id == project_id && e.name == name)
            .cloned())
    }

    async fn upsert_environment(&self, environment: Environment) -> StorageResult<()> {
        lock(&self.environments).insert(environment.id.clone(), environment);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryReleaseStore
// ---------------------------------------------------------------------------

/// Releases kept in insertion order; "newest" means most recently created.
#[derive(Debug, Default)]
pub struct MemoryReleaseStore {
    releases: Mutex<Vec<Release>>,
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn create_release(&self, release: Release) -> StorageResult<()> {
        let mut releases = lock(&self.releases);
        if releases.iter().any(|r| r.id == release.id) {
            return Err(StorageError::AlreadyExists {
                entity: "release",
                id: release.id.to_string(),
            });
        }
        releases.push(release);
        Ok(())
    }

    async fn get_release(&self, id: &ReleaseId) -> StorageResult<Release> {
        lock(&self.releases)
            .iter()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("release", id))
    }

    async fn list_by_service(&self, service_id: &ServiceId) -> StorageResult<Vec<Release>> {
        Ok(lock(&self.releases)
            .iter()
            .rev()
            .filter(|r| &r.service_id == service_id)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        id: &ReleaseId,
        status: ReleaseStatus,
        failure_reason: Option<String>,
    ) -> StorageResult<Release> {
        let mut releases = lock(&self.releases);
        let release = releases
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| StorageError::not_found("release", id))?;
        if !release.status.can_transition_to(status) {
            return Err(invalid_transition("release", id, release.status, status));
        }
        release.status = status;
        release.failure_reason = failure_reason;
        release.updated_at = Utc::now();
        Ok(release.clone())
    }

    async fn record_artifact(
        &self,
        id: &ReleaseId,
        image_uri: String,
        sbom: Option<serde_json::Value>,
        signature: Option<String>,
    ) -> StorageResult<()> {
        let mut releases = lock(&self.releases);
        let release = releases
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| StorageError::not_found("release", id))?;
        if release.status != ReleaseStatus::Building {
            return Err(invalid_transition("release", id, release.status, "artifact"));
        }
        release.image_uri = Some(image_uri);
        release.sbom = sbom;
        release.signature = signature;
        release.updated_at = Utc::now();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryDeploymentStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryDeploymentStore {
    deployments: Mutex<Vec<Deployment>>,
}

impl MemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_deployment<R>(
        &self,
        id: &DeploymentId,
        f: impl FnOnce(&mut Deployment) -> StorageResult<R>,
    ) -> StorageResult<R> {
        let mut deployments = lock(&self.deployments);
        let deployment = deployments
            .iter_mut()
            .find(|d| &d.id == id)
            .ok_or_else(|| StorageError::not_found("deployment", id))?;
        f(deployment)
    }
}

#[async_trait]
impl DeploymentStore for MemoryDeploymentStore {
    async fn create_deployment(&self, deployment: Deployment) -> StorageResult<()> {
        let mut deployments = lock(&self.deployments);
        if deployments.iter().any(|d| d.id == deployment.id) {
            return Err(StorageError::AlreadyExists {
                entity: "deployment",
                id: deployment.id.to_string(),
            });
        }
        deployments.push(deployment);
        Ok(())
    }

    async fn get_deployment(&self, id: &DeploymentId) -> StorageResult<Deployment> {
        lock(&self.deployments)
            .iter()
            .find(|d| &d.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("deployment", id))
    }

    async fn list_by_group(&self, group_id: &GroupId) -> StorageResult<Vec<Deployment>> {
        let mut found: Vec<Deployment> = lock(&self.deployments)
            .iter()
            .filter(|d| d.group_id.as_ref() == Some(group_id))
            .cloned()
            .collect();
        // Stable: equal orders keep creation order.
        found.sort_by_key(|d| d.deploy_order);
        Ok(found)
    }

    async fn list_by_status(&self, status: DeploymentStatus) -> StorageResult<Vec<Deployment>> {
        Ok(lock(&self.deployments)
            .iter()
            .filter(|d| d.status == status)
            .cloned()
            .collect())
    }

    async fn list_by_service_environment(
        &self,
        service_id: &ServiceId,
        environment_id: &EnvironmentId,
    ) -> StorageResult<Vec<Deployment>> {
        Ok(lock(&self.deployments)
            .iter()
            .filter(|d| &d.service_id == service_id && &d.environment_id == environment_id)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        health: HealthStatus,
        error_message: Option<String>,
    ) -> StorageResult<Deployment> {
        self.with_deployment(id, |d| {
            if !d.status.can_transition_to(status) {
                return Err(invalid_transition("deployment", id, d.status, status));
            }
            d.status = status;
            d.health = health;
            d.error_message = error_message;
            d.updated_at = Utc::now();
            Ok(d.clone())
        })
    }

    async fn update_health(
        &self,
        id: &DeploymentId,
        health: HealthStatus,
    ) -> StorageResult<Deployment> {
        self.with_deployment(id, |d| {
            if d.status.is_terminal() {
                return Err(invalid_transition("deployment", id, d.status, health));
            }
            d.health = health;
            d.updated_at = Utc::now();
            Ok(d.clone())
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryGroupStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryGroupStore {
    groups: Mutex<BTreeMap<GroupId, DeploymentGroup>>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn create_group(&self, group: DeploymentGroup) -> StorageResult<()> {
        let mut groups = lock(&self.groups);
        if groups.contains_key(&group.id) {
            return Err(StorageError::AlreadyExists {
                entity: "group",
                id: group.id.to_string(),
            });
        }
        groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn get_group(&self, id: &GroupId) -> StorageResult<DeploymentGroup> {
        lock(&self.groups)
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("group", id))
    }

    async fn update_status(
        &self,
        id: &GroupId,
        status: GroupStatus,
        error_message: Option<String>,
    ) -> StorageResult<DeploymentGroup> {
        let mut groups = lock(&self.groups);
        let group = groups
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found("group", id))?;
        if !group.status.can_transition_to(status) {
            return Err(invalid_transition("group", id, group.status, status));
        }
        let now = Utc::now();
        if status == GroupStatus::Running {
            group.started_at = Some(now);
        }
        if status.is_terminal() {
            group.completed_at = Some(now);
        }
        group.status = status;
        group.error_message = error_message;
        Ok(group.clone())
    }

    async fn record_error(&self, id: &GroupId, error_message: String) -> StorageResult<()> {
        let mut groups = lock(&self.groups);
        let group = groups
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found("group", id))?;
        group.error_message = Some(error_message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryDependencyStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryDependencyStore {
    edges: Mutex<BTreeMap<(ServiceId, ServiceId), ServiceDependency>>,
}

impl MemoryDependencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DependencyStore for MemoryDependencyStore {
    async fn create_dependency(&self, dependency: ServiceDependency) -> StorageResult<()> {
        let key = (
            dependency.service_id.clone(),
            dependency.depends_on_service_id.clone(),
        );
        let mut edges = lock(&self.edges);
        if edges.contains_key(&key) {
            return Err(StorageError::AlreadyExists {
                entity: "dependency",
                id: format!("{} -> {}", key.0, key.1),
            });
        }
        edges.insert(key, dependency);
        Ok(())
    }

    async fn delete_dependency(
        &self,
        service_id: &ServiceId,
        depends_on: &ServiceId,
    ) -> StorageResult<bool> {
        Ok(lock(&self.edges)
            .remove(&(service_id.clone(), depends_on.clone()))
            .is_some())
    }

    async fn list_dependencies(&self) -> StorageResult<Vec<ServiceDependency>> {
        Ok(lock(&self.edges).values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// StateStores
// ---------------------------------------------------------------------------

impl StateStores {
    /// Wire every port to a fresh in-memory fake.
    pub fn in_memory() -> Self {
        Self {
            services: Arc::new(MemoryServiceCatalog::new()),
            environments: Arc::new(MemoryEnvironmentStore::new()),
            releases: Arc::new(MemoryReleaseStore::new()),
            deployments: Arc::new(MemoryDeploymentStore::new()),
            groups: Arc::new(MemoryGroupStore::new()),
            dependencies: Arc::new(MemoryDependencyStore::new()),
        }
    }
}
