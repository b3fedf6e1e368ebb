//! Convoy-State: records and repository ports for the Convoy control plane
//!
//! This crate owns the data model the orchestration core operates on and
//! the narrow storage interfaces it writes through. It has no opinion on
//! the storage engine; `fakes` provides an in-memory implementation of
//! every port.
//!
//! ## Key Components
//!
//! - `records`: `Service`, `Environment`, `Release`, `Deployment`,
//!   `DeploymentGroup`, `ServiceDependency`
//! - `status`: explicit state machines for releases, deployments and groups
//! - `storage_traits`: async repository ports and the `StateStores` bundle

mod error;
pub mod fakes;
pub mod ids;
pub mod records;
pub mod status;
pub mod storage_traits;

pub use error::{ParseVariantError, StorageError};
pub use ids::{
    DependencyId, DeploymentId, EnvironmentId, GroupId, ProjectId, ReleaseId, ServiceId,
};
pub use records::{
    AutoDeployPolicy, BuildKind, BuildSpec, DependencyKind, Deployment, DeploymentGroup,
    DeploymentOrder, Environment, Release, Service, ServiceDependency, Strategy,
};
pub use status::{DeploymentStatus, GroupStatus, HealthStatus, ReleaseStatus};
pub use storage_traits::{
    DependencyStore, DeploymentStore, EnvironmentStore, GroupStore, ReleaseStore,
    ServiceCatalog, StateStores, StorageResult,
};
