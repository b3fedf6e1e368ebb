//! Group execution and rollback.
//!
//! [`GroupExecutor::execute`] walks a planned group's layers in order. Every
//! service in a layer is deployed concurrently, and the next layer starts
//! only once each of them has a deployment record accepted for
//! reconciliation or a creation error. A failed service takes its transitive
//! dependents (from the full graph) out of every later layer.
//!
//! [`GroupExecutor::rollback`] walks the same layers in reverse, so
//! dependents are reverted before the services they depend on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use convoy_state::{
    Deployment, DeploymentGroup, DeploymentId, DeploymentStatus, Environment, GroupId,
    GroupStatus, Release, ReleaseStatus, ServiceId, StateStores,
};
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::dependencies::DependencyRegistry;
use crate::error::{ConvoyError, ConvoyResult, ScheduleError};
use crate::metrics::METRICS;
use crate::obs;
use crate::reconciler::Reconciler;
use crate::scheduler::ReconciliationScheduler;

/// Priority given to deployments created by group execution.
pub const GROUP_DEPLOY_PRIORITY: i64 = 10;

/// Failure reason written on pending deployments of a rolled-back group.
pub const GROUP_ROLLED_BACK: &str = "group rolled back";

/// What happened to one service of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Deployment created and queued for reconciliation.
    Scheduled { deployment_id: DeploymentId },
    /// Deployment created but the queue was full; the pending sweeper
    /// schedules it later.
    Deferred { deployment_id: DeploymentId },
    Failed { reason: String },
    /// Not attempted because `cause` (a transitive dependency) failed.
    Skipped { cause: ServiceId },
}

impl ServiceOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            ServiceOutcome::Scheduled { .. } | ServiceOutcome::Deferred { .. }
        )
    }
}

/// Aggregate result of [`GroupExecutor::execute`].
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub group: DeploymentGroup,
    /// Every deployment record created, in layer order.
    pub deployments: Vec<Deployment>,
    pub outcomes: BTreeMap<ServiceId, ServiceOutcome>,
    /// Per-service creation errors.
    pub failed: Vec<(ServiceId, String)>,
    pub skipped: Vec<ServiceId>,
    pub deferred: Vec<ServiceId>,
}

impl ExecutionReport {
    pub fn accepted(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_accepted()).count()
    }

    pub fn overall_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// One line per failed or skipped service.
    pub fn errors(&self) -> Vec<String> {
        let failed = self
            .failed
            .iter()
            .map(|(service, reason)| format!("{service}: {reason}"));
        let skipped = self.skipped.iter().map(|service| match self.outcomes.get(service) {
            Some(ServiceOutcome::Skipped { cause }) => {
                format!("{service}: skipped, dependency {cause} failed")
            }
            _ => format!("{service}: skipped"),
        });
        failed.chain(skipped).collect()
    }
}

/// Aggregate result of [`GroupExecutor::rollback`].
#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub group: DeploymentGroup,
    /// New deployment records written for each successful rollback.
    pub rollback_deployments: Vec<Deployment>,
    pub failed_to_roll: Vec<(ServiceId, String)>,
    /// Deployments that had nothing to roll back. Those still `pending`
    /// are failed with [`GROUP_ROLLED_BACK`] so they never converge later.
    pub not_rolled: Vec<DeploymentId>,
}

impl RollbackReport {
    pub fn rolled_back(&self) -> usize {
        self.rollback_deployments.len()
    }

    pub fn errors(&self) -> Vec<String> {
        self.failed_to_roll
            .iter()
            .map(|(service, reason)| format!("{service}: {reason}"))
            .collect()
    }
}

/// A deployment created and handed to the scheduler.
struct Accepted {
    deployment: Deployment,
    deferred: bool,
}

enum RollbackStep {
    Rolled(Deployment),
    Failed(ServiceId, String),
}

pub struct GroupExecutor {
    stores: StateStores,
    dependencies: Arc<DependencyRegistry>,
    scheduler: Arc<ReconciliationScheduler>,
    reconciler: Arc<dyn Reconciler>,
}

impl GroupExecutor {
    pub fn new(
        stores: StateStores,
        dependencies: Arc<DependencyRegistry>,
        scheduler: Arc<ReconciliationScheduler>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        Self {
            stores,
            dependencies,
            scheduler,
            reconciler,
        }
    }

    /// Run a `planned` group to `completed`, `partially_failed` or `failed`.
    ///
    /// Per-service failures never abort the run; they are collected in the
    /// report. An error is returned only when the group cannot be executed
    /// at all (unknown, not planned, storage failure on the group itself).
    #[instrument(skip_all, fields(group_id = %group_id))]
    pub async fn execute(&self, group_id: &GroupId) -> ConvoyResult<ExecutionReport> {
        let group = self.stores.groups.get_group(group_id).await?;
        if group.status != GroupStatus::Planned {
            return Err(ConvoyError::InvalidState {
                entity: "group",
                id: group.id.to_string(),
                actual: group.status.to_string(),
                expected: "planned",
            });
        }
        let group = self
            .stores
            .groups
            .update_status(&group.id, GroupStatus::Running, None)
            .await?;
        info!(layers = group.order.len(), strategy = %group.strategy, "group execution started");

        let graph = self.dependencies.snapshot().await;
        let mut outcomes: BTreeMap<ServiceId, ServiceOutcome> = BTreeMap::new();
        let mut deployments = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        let mut deferred = Vec::new();
        // excluded service -> failed dependency that excluded it
        let mut excluded: BTreeMap<ServiceId, ServiceId> = BTreeMap::new();

        for (layer_index, layer) in group.order.layers().iter().enumerate() {
            let mut runnable = Vec::with_capacity(layer.len());
            for service in layer {
                match excluded.get(service) {
                    Some(cause) => {
                        debug!(service_id = %service, cause = %cause, "service skipped");
                        METRICS.inc_services_skipped();
                        skipped.push(service.clone());
                        outcomes.insert(
                            service.clone(),
                            ServiceOutcome::Skipped {
                                cause: cause.clone(),
                            },
                        );
                    }
                    None => runnable.push(service),
                }
            }

            // Layer barrier: every deploy in this layer resolves before the next layer starts.
            let results = join_all(
                runnable
                    .iter()
                    .map(|service| self.deploy_service(&group, service, layer_index)),
            )
            .await;

            for (service, result) in runnable.into_iter().zip(results) {
                match result {
                    Ok(accepted) => {
                        let deployment_id = accepted.deployment.id.clone();
                        let outcome = if accepted.deferred {
                            deferred.push(service.clone());
                            ServiceOutcome::Deferred { deployment_id }
                        } else {
                            ServiceOutcome::Scheduled { deployment_id }
                        };
                        outcomes.insert(service.clone(), outcome);
                        deployments.push(accepted.deployment);
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        warn!(service_id = %service, layer = layer_index, error = %reason, "service deployment failed");
                        failed.push((service.clone(), reason.clone()));
                        outcomes.insert(service.clone(), ServiceOutcome::Failed { reason });
                        for dependent in graph.transitive_dependents(service) {
                            excluded.entry(dependent).or_insert_with(|| service.clone());
                        }
                    }
                }
            }
        }

        let accepted = outcomes.values().filter(|o| o.is_accepted()).count();
        let (status, message) = if failed.is_empty() && skipped.is_empty() {
            (GroupStatus::Completed, None)
        } else {
            let message = format!("{} failed, {} skipped", failed.len(), skipped.len());
            if accepted > 0 {
                (GroupStatus::PartiallyFailed, Some(message))
            } else {
                (GroupStatus::Failed, Some(message))
            }
        };
        let group = self
            .stores
            .groups
            .update_status(&group.id, status, message)
            .await?;
        obs::emit_group_executed(
            group.id.as_str(),
            group.status.as_str(),
            accepted,
            failed.len(),
            skipped.len(),
        );

        Ok(ExecutionReport {
            group,
            deployments,
            outcomes,
            failed,
            skipped,
            deferred,
        })
    }

    /// Roll a settled group back, dependents first.
    ///
    /// Each `running`/`succeeded` deployment is reverted through the
    /// reconciler and recorded as a new deployment pointing back at it. One
    /// failure does not stop the others. The group moves to `rolled_back`
    /// only when every rollback succeeded; otherwise its status is kept and
    /// the partial failure is recorded on it, so the rollback can be retried.
    #[instrument(skip_all, fields(group_id = %group_id))]
    pub async fn rollback(&self, group_id: &GroupId) -> ConvoyResult<RollbackReport> {
        let group = self.stores.groups.get_group(group_id).await?;
        if !group.status.can_transition_to(GroupStatus::RolledBack) {
            return Err(ConvoyError::InvalidState {
                entity: "group",
                id: group.id.to_string(),
                actual: group.status.to_string(),
                expected: "completed, partially_failed or failed",
            });
        }
        let environment = self
            .stores
            .environments
            .get_environment(&group.environment_id)
            .await?;

        let all = self.stores.deployments.list_by_group(&group.id).await?;
        let already_rolled: BTreeSet<&DeploymentId> =
            all.iter().filter_map(|d| d.rollback_of.as_ref()).collect();
        let mut by_layer: BTreeMap<usize, Vec<&Deployment>> = BTreeMap::new();
        for deployment in all
            .iter()
            .filter(|d| d.rollback_of.is_none() && !already_rolled.contains(&d.id))
        {
            by_layer.entry(deployment.deploy_order).or_default().push(deployment);
        }

        let mut rollback_deployments = Vec::new();
        let mut failed_to_roll = Vec::new();
        let mut not_rolled = Vec::new();

        for (layer, members) in by_layer.into_iter().rev() {
            let (eligible, idle): (Vec<&Deployment>, Vec<&Deployment>) = members
                .into_iter()
                .partition(|d| d.status.is_rollbackable());
            for deployment in idle {
                if deployment.status == DeploymentStatus::Pending {
                    self.fail_deployment(deployment, GROUP_ROLLED_BACK).await;
                }
                not_rolled.push(deployment.id.clone());
            }

            debug!(layer, deployments = eligible.len(), "rolling back layer");
            let steps = join_all(
                eligible
                    .into_iter()
                    .map(|d| self.rollback_deployment(&environment, d)),
            )
            .await;
            for step in steps {
                match step {
                    RollbackStep::Rolled(record) => rollback_deployments.push(record),
                    RollbackStep::Failed(service, reason) => {
                        warn!(service_id = %service, error = %reason, "rollback failed");
                        failed_to_roll.push((service, reason));
                    }
                }
            }
        }

        let group = if failed_to_roll.is_empty() {
            self.stores
                .groups
                .update_status(&group.id, GroupStatus::RolledBack, None)
                .await?
        } else {
            self.stores
                .groups
                .record_error(
                    &group.id,
                    format!(
                        "rollback partially failed: {} succeeded, {} failed",
                        rollback_deployments.len(),
                        failed_to_roll.len()
                    ),
                )
                .await?;
            self.stores.groups.get_group(&group.id).await?
        };
        obs::emit_group_rolled_back(
            group.id.as_str(),
            rollback_deployments.len(),
            failed_to_roll.len(),
        );

        Ok(RollbackReport {
            group,
            rollback_deployments,
            failed_to_roll,
            not_rolled,
        })
    }

    async fn deploy_service(
        &self,
        group: &DeploymentGroup,
        service: &ServiceId,
        layer_index: usize,
    ) -> ConvoyResult<Accepted> {
        let release = self.select_release(service, group.git_sha.as_deref()).await?;
        let deployment = Deployment::pending(&release, group.environment_id.clone())
            .in_group(group.id.clone(), layer_index);
        self.stores
            .deployments
            .create_deployment(deployment.clone())
            .await?;
        METRICS.inc_deployments_created();

        match self.scheduler.schedule(&deployment.id, GROUP_DEPLOY_PRIORITY) {
            Ok(_) => Ok(Accepted {
                deployment,
                deferred: false,
            }),
            Err(ScheduleError::QueueFull { .. }) => {
                warn!(
                    service_id = %service,
                    deployment_id = %deployment.id,
                    "reconciliation queue full, deployment left pending for the sweeper"
                );
                Ok(Accepted {
                    deployment,
                    deferred: true,
                })
            }
            Err(e) => {
                // Reported as failed, so the record must not converge after a restart.
                self.fail_deployment(&deployment, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Move a pending deployment to `failed`. Errors are logged only.
    async fn fail_deployment(&self, deployment: &Deployment, reason: &str) {
        match self
            .stores
            .deployments
            .update_status(
                &deployment.id,
                DeploymentStatus::Failed,
                deployment.health,
                Some(reason.to_string()),
            )
            .await
        {
            Ok(_) => debug!(deployment_id = %deployment.id, reason, "pending deployment failed"),
            Err(e) => warn!(deployment_id = %deployment.id, error = %e, "cannot fail pending deployment"),
        }
    }

    /// Newest ready release, preferring one built from `git_sha`.
    async fn select_release(
        &self,
        service: &ServiceId,
        git_sha: Option<&str>,
    ) -> ConvoyResult<Release> {
        let ready: Vec<Release> = self
            .stores
            .releases
            .list_by_service(service)
            .await?
            .into_iter()
            .filter(|r| r.status == ReleaseStatus::Ready)
            .collect();
        let chosen = match git_sha.and_then(|sha| ready.iter().position(|r| r.git_sha == sha)) {
            Some(index) => ready.into_iter().nth(index),
            None => ready.into_iter().next(),
        };
        chosen.ok_or_else(|| ConvoyError::NoReadyRelease {
            service: service.clone(),
        })
    }

    async fn rollback_deployment(
        &self,
        environment: &Environment,
        deployment: &Deployment,
    ) -> RollbackStep {
        let service_id = deployment.service_id.clone();
        match self.try_rollback(environment, deployment).await {
            Ok(record) => RollbackStep::Rolled(record),
            Err(e) => RollbackStep::Failed(service_id, e.to_string()),
        }
    }

    async fn try_rollback(
        &self,
        environment: &Environment,
        deployment: &Deployment,
    ) -> ConvoyResult<Deployment> {
        let service = self.stores.services.get_service(&deployment.service_id).await?;
        self.reconciler
            .rollback(&environment.kube_namespace, &service.name)
            .await?;

        let release = self.previous_release(deployment).await?;
        let mut record = Deployment::pending(&release, deployment.environment_id.clone());
        record.group_id = deployment.group_id.clone();
        record.deploy_order = deployment.deploy_order;
        record.replicas = deployment.replicas;
        record.status = DeploymentStatus::Running;
        record.rollback_of = Some(deployment.id.clone());
        self.stores.deployments.create_deployment(record.clone()).await?;
        debug!(
            deployment_id = %deployment.id,
            rollback_id = %record.id,
            release_id = %release.id,
            "rollback recorded"
        );
        Ok(record)
    }

    /// The newest ready release older than the one `deployment` runs, or
    /// that release itself if there is none.
    async fn previous_release(&self, deployment: &Deployment) -> ConvoyResult<Release> {
        let releases = self
            .stores
            .releases
            .list_by_service(&deployment.service_id)
            .await?;
        let current = releases.iter().position(|r| r.id == deployment.release_id);
        let previous = current.and_then(|index| {
            releases[index + 1..]
                .iter()
                .find(|r| r.status == ReleaseStatus::Ready)
                .cloned()
        });
        match previous {
            Some(release) => Ok(release),
            None => Ok(self
                .stores
                .releases
                .get_release(&deployment.release_id)
                .await?),
        }
    }
}
