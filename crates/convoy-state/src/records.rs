//! Entity records shared by the control plane and its repositories.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseVariantError;
use crate::ids::*;
use crate::status::{DeploymentStatus, GroupStatus, HealthStatus, ReleaseStatus};

// ---------------------------------------------------------------------------
// Service & Environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildKind {
    #[default]
    Buildpacks,
    Dockerfile,
}

/// Declared build configuration of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub kind: BuildKind,
    /// Build context relative to the repository root.
    pub context: String,
    pub dockerfile: Option<String>,
    pub buildpack: Option<String>,
    pub target: Option<String>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
}

impl Default for BuildSpec {
    fn default() -> Self {
        Self {
            kind: BuildKind::Buildpacks,
            context: ".".to_string(),
            dockerfile: None,
            buildpack: None,
            target: None,
            build_args: BTreeMap::new(),
        }
    }
}

/// Deploy a freshly built release without a manual trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoDeployPolicy {
    pub enabled: bool,
    /// Environment name the new release is deployed to.
    pub environment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub project_id: ProjectId,
    pub name: String,
    pub git_repo: String,
    #[serde(default)]
    pub build: BuildSpec,
    #[serde(default)]
    pub auto_deploy: AutoDeployPolicy,
}

impl Service {
    /// A service named after its id with default build settings.
    pub fn new(id: impl Into<ServiceId>, project_id: impl Into<ProjectId>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            git_repo: String::new(),
            id,
            project_id: project_id.into(),
            build: BuildSpec::default(),
            auto_deploy: AutoDeployPolicy::default(),
        }
    }

    pub fn with_repo(mut self, git_repo: impl Into<String>) -> Self {
        self.git_repo = git_repo.into();
        self
    }

    pub fn with_auto_deploy(mut self, environment: impl Into<String>) -> Self {
        self.auto_deploy = AutoDeployPolicy {
            enabled: true,
            environment: Some(environment.into()),
        };
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub project_id: ProjectId,
    pub name: String,
    /// Cluster namespace workloads of this environment run in.
    pub kube_namespace: String,
}

impl Environment {
    pub fn new(
        id: impl Into<EnvironmentId>,
        project_id: impl Into<ProjectId>,
        name: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let name = name.into();
        Self {
            kube_namespace: name.clone(),
            id,
            project_id: project_id.into(),
            name,
        }
    }
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

/// An immutable built artifact reference for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    pub service_id: ServiceId,
    pub version: String,
    pub image_uri: Option<String>,
    pub git_sha: String,
    pub status: ReleaseStatus,
    pub sbom: Option<serde_json::Value>,
    pub signature: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Release {
    /// A release whose build has not finished yet.
    pub fn building(
        service_id: impl Into<ServiceId>,
        version: impl Into<String>,
        git_sha: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ReleaseId::generate(),
            service_id: service_id.into(),
            version: version.into(),
            image_uri: None,
            git_sha: git_sha.into(),
            status: ReleaseStatus::Building,
            sbom: None,
            signature: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

/// One attempt to run a release in an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub release_id: ReleaseId,
    pub service_id: ServiceId,
    pub environment_id: EnvironmentId,
    pub group_id: Option<GroupId>,
    /// Layer index within the owning group.
    pub deploy_order: usize,
    pub replicas: u32,
    pub status: DeploymentStatus,
    pub health: HealthStatus,
    pub error_message: Option<String>,
    /// Set on records created by a rollback; points at the deployment rolled back.
    pub rollback_of: Option<DeploymentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// A new `pending` deployment of `release` into `environment_id`.
    pub fn pending(release: &Release, environment_id: impl Into<EnvironmentId>) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            release_id: release.id.clone(),
            service_id: release.service_id.clone(),
            environment_id: environment_id.into(),
            group_id: None,
            deploy_order: 0,
            replicas: 1,
            status: DeploymentStatus::Pending,
            health: HealthStatus::Unknown,
            error_message: None,
            rollback_of: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn in_group(mut self, group_id: GroupId, deploy_order: usize) -> Self {
        self.group_id = Some(group_id);
        self.deploy_order = deploy_order;
        self
    }
}

// ---------------------------------------------------------------------------
// DeploymentGroup
// ---------------------------------------------------------------------------

/// How a group walks its services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Everything in one layer; dependencies ignored.
    Parallel,
    /// One service per layer, ascending id; dependencies ignored.
    Sequential,
    /// Topological layers of the dependency graph.
    #[default]
    DependencyOrdered,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Parallel => "parallel",
            Strategy::Sequential => "sequential",
            Strategy::DependencyOrdered => "dependency_ordered",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(Strategy::Parallel),
            "sequential" => Ok(Strategy::Sequential),
            "dependency_ordered" => Ok(Strategy::DependencyOrdered),
            other => Err(ParseVariantError {
                kind: "strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// Ordered layers of service ids; every member of a layer may deploy concurrently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentOrder(Vec<Vec<ServiceId>>);

impl DeploymentOrder {
    pub fn new(layers: Vec<Vec<ServiceId>>) -> Self {
        Self(layers)
    }

    pub fn layers(&self) -> &[Vec<ServiceId>] {
        &self.0
    }

    /// All services, in layer order.
    pub fn services(&self) -> impl Iterator<Item = &ServiceId> {
        self.0.iter().flatten()
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn layer_of(&self, service: &ServiceId) -> Option<usize> {
        self.0.iter().position(|layer| layer.contains(service))
    }

    pub fn into_inner(self) -> Vec<Vec<ServiceId>> {
        self.0
    }
}

impl From<Vec<Vec<ServiceId>>> for DeploymentOrder {
    fn from(layers: Vec<Vec<ServiceId>>) -> Self {
        Self(layers)
    }
}

/// A coordinated set of deployments sharing one trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentGroup {
    pub id: GroupId,
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub name: String,
    pub strategy: Strategy,
    pub order: DeploymentOrder,
    pub status: GroupStatus,
    pub git_sha: Option<String>,
    pub triggered_by: Option<String>,
    pub pr_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeploymentGroup {
    /// A freshly planned group named `deploy-{project}-{YYYYMMDD-HHMMSS}`.
    pub fn planned(
        project_id: ProjectId,
        environment_id: EnvironmentId,
        strategy: Strategy,
        order: DeploymentOrder,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: GroupId::generate(),
            name: format!("deploy-{}-{}", project_id, now.format("%Y%m%d-%H%M%S")),
            project_id,
            environment_id,
            strategy,
            order,
            status: GroupStatus::Planned,
            git_sha: None,
            triggered_by: None,
            pr_url: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceDependency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    #[default]
    Runtime,
    Build,
    Data,
}

impl DependencyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyKind::Runtime => "runtime",
            DependencyKind::Build => "build",
            DependencyKind::Data => "data",
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyKind {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "runtime" => Ok(DependencyKind::Runtime),
            "build" => Ok(DependencyKind::Build),
            "data" => Ok(DependencyKind::Data),
            other => Err(ParseVariantError {
                kind: "dependency type",
                value: other.to_string(),
            }),
        }
    }
}

/// `service_id` requires `depends_on_service_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDependency {
    pub id: DependencyId,
    pub service_id: ServiceId,
    pub depends_on_service_id: ServiceId,
    pub kind: DependencyKind,
    pub created_at: DateTime<Utc>,
}

impl ServiceDependency {
    pub fn new(service_id: ServiceId, depends_on_service_id: ServiceId, kind: DependencyKind) -> Self {
        Self {
            id: DependencyId::generate(),
            service_id,
            depends_on_service_id,
            kind,
            created_at: Utc::now(),
        }
    }
}
