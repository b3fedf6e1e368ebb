//! The core's view of the cluster: one convergence call and one rollback call.

use async_trait::async_trait;
use convoy_state::{Deployment, Environment, Release, Service};
use thiserror::Error;
use tracing::info;

/// Everything a reconciler needs to converge one deployment.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub deployment: Deployment,
    pub release: Release,
    pub service: Service,
    pub environment: Environment,
    pub priority: i64,
    /// 1 for the first attempt of this scheduling, incremented on reruns.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    pub success: bool,
    pub error: Option<String>,
    /// The cluster has not settled yet; a later attempt may still converge.
    pub retryable: bool,
}

impl ReconcileResult {
    pub fn converged() -> Self {
        Self {
            success: true,
            error: None,
            retryable: false,
        }
    }

    /// Permanent failure.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            retryable: false,
        }
    }

    /// Not converged yet.
    pub fn pending(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            retryable: true,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("rollback of {service} in {namespace} failed: {reason}")]
pub struct RollbackError {
    pub namespace: String,
    pub service: String,
    pub reason: String,
}

/// Cluster-facing collaborator.
///
/// Implementations must not panic on cluster errors; they report them in
/// [`ReconcileResult`] instead.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, request: &ReconcileRequest) -> ReconcileResult;

    /// Revert `service_name` in `namespace` to its previous revision.
    async fn rollback(&self, namespace: &str, service_name: &str) -> Result<(), RollbackError>;
}

/// Logs what it would apply and reports convergence. Used by `convoyd`
/// when no cluster is attached.
#[derive(Debug, Default)]
pub struct DryRunReconciler;

#[async_trait]
impl Reconciler for DryRunReconciler {
    async fn reconcile(&self, request: &ReconcileRequest) -> ReconcileResult {
        info!(
            deployment_id = %request.deployment.id,
            service = %request.service.name,
            namespace = %request.environment.kube_namespace,
            image = request.release.image_uri.as_deref().unwrap_or("<none>"),
            replicas = request.deployment.replicas,
            "dry-run reconcile"
        );
        ReconcileResult::converged()
    }

    async fn rollback(&self, namespace: &str, service_name: &str) -> Result<(), RollbackError> {
        info!(namespace, service = service_name, "dry-run rollback");
        Ok(())
    }
}
