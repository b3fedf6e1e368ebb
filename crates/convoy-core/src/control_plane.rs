//! The operations the API layer calls.
//!
//! [`ControlPlane`] wires the dependency registry, planner, executor,
//! scheduler and build pipeline over one set of repositories, and converts
//! loosely typed request fields (strategy and dependency type strings) into
//! their closed enumerations at this boundary.

use std::sync::Arc;

use convoy_state::{
    DependencyKind, DeploymentGroup, DeploymentId, DeploymentOrder, EnvironmentId, GroupId,
    ProjectId, ReleaseId, ServiceDependency, ServiceId, StateStores, Strategy,
};

use crate::admission::BuildAdmissionController;
use crate::build::{BuildDisposition, BuildPipeline, BuildRequest, BuildResult, Builder};
use crate::config::ControlPlaneConfig;
use crate::dependencies::DependencyRegistry;
use crate::error::{ConvoyError, ConvoyResult};
use crate::executor::{ExecutionReport, GroupExecutor, RollbackReport};
use crate::farm::BuildFarmClient;
use crate::planner::{GroupPlanner, PlanRequest};
use crate::reconciler::Reconciler;
use crate::scheduler::{ReconciliationScheduler, ScheduleAck, SchedulerConfig};

/// Collaborators the core cannot provide itself.
pub struct Collaborators {
    pub reconciler: Arc<dyn Reconciler>,
    pub builder: Arc<dyn Builder>,
    pub farm: Option<Arc<dyn BuildFarmClient>>,
}

pub struct ControlPlane {
    stores: StateStores,
    dependencies: Arc<DependencyRegistry>,
    planner: GroupPlanner,
    executor: GroupExecutor,
    scheduler: Arc<ReconciliationScheduler>,
    builds: Arc<BuildPipeline>,
}

impl ControlPlane {
    /// Load the dependency graph and assemble every component.
    ///
    /// Background work (scheduler workers, sweeper) starts with [`start`](Self::start).
    pub async fn new(
        config: &ControlPlaneConfig,
        stores: StateStores,
        collaborators: Collaborators,
    ) -> ConvoyResult<Self> {
        config.validate()?;
        let dependencies = Arc::new(
            DependencyRegistry::load(stores.dependencies.clone(), stores.services.clone()).await?,
        );
        let scheduler = Arc::new(ReconciliationScheduler::new(
            SchedulerConfig::from(config),
            stores.clone(),
            collaborators.reconciler.clone(),
        ));
        let admission = Arc::new(BuildAdmissionController::new(
            config.builds.slots,
            config.build_timeout(),
        ));

        let mut pipeline = BuildPipeline::new(
            stores.clone(),
            admission,
            collaborators.builder,
            scheduler.clone(),
        );
        if let Some(farm) = collaborators.farm {
            pipeline = pipeline.with_farm(farm, config.builds.callback_url.clone());
        }

        Ok(Self {
            planner: GroupPlanner::new(stores.clone(), dependencies.clone()),
            executor: GroupExecutor::new(
                stores.clone(),
                dependencies.clone(),
                scheduler.clone(),
                collaborators.reconciler,
            ),
            builds: Arc::new(pipeline),
            stores,
            dependencies,
            scheduler,
        })
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    /// Plan and persist a group. `strategy = None` means `dependency_ordered`.
    pub async fn create_group_deployment(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        service_ids: Vec<ServiceId>,
        strategy: Option<&str>,
        git_sha: Option<String>,
    ) -> ConvoyResult<(DeploymentGroup, DeploymentOrder)> {
        let strategy = match strategy {
            None => Strategy::default(),
            Some(raw) => raw
                .parse::<Strategy>()
                .map_err(|e| ConvoyError::Validation(e.to_string()))?,
        };
        let mut request = PlanRequest::new(project_id.clone(), environment_id.clone())
            .with_services(service_ids)
            .with_strategy(strategy);
        request.git_sha = git_sha;

        let group = self.planner.plan(request).await?;
        let order = group.order.clone();
        Ok((group, order))
    }

    pub async fn execute_group_deployment(&self, group_id: &GroupId) -> ConvoyResult<ExecutionReport> {
        self.executor.execute(group_id).await
    }

    pub async fn rollback_group(&self, group_id: &GroupId) -> ConvoyResult<RollbackReport> {
        self.executor.rollback(group_id).await
    }

    /// `kind = None` means `runtime`.
    pub async fn add_service_dependency(
        &self,
        service_id: &ServiceId,
        depends_on: &ServiceId,
        kind: Option<&str>,
    ) -> ConvoyResult<ServiceDependency> {
        let kind = match kind {
            None => DependencyKind::default(),
            Some(raw) => raw
                .parse::<DependencyKind>()
                .map_err(|e| ConvoyError::Validation(e.to_string()))?,
        };
        self.dependencies
            .add_dependency(service_id, depends_on, kind)
            .await
    }

    pub async fn remove_service_dependency(
        &self,
        service_id: &ServiceId,
        depends_on: &ServiceId,
    ) -> ConvoyResult<bool> {
        self.dependencies
            .remove_dependency(service_id, depends_on)
            .await
    }

    /// Queue a deployment for reconciliation. Never waits for queue space.
    pub async fn schedule_reconciliation(
        &self,
        deployment_id: &DeploymentId,
        priority: i64,
    ) -> ConvoyResult<ScheduleAck> {
        self.stores.deployments.get_deployment(deployment_id).await?;
        Ok(self.scheduler.schedule(deployment_id, priority)?)
    }

    pub async fn submit_build(&self, request: BuildRequest) -> ConvoyResult<BuildDisposition> {
        self.builds.submit(request).await
    }

    /// Apply the build farm's completion report for a delegated release.
    pub async fn complete_delegated_build(
        &self,
        release_id: &ReleaseId,
        result: BuildResult,
    ) -> ConvoyResult<BuildDisposition> {
        self.builds.complete_delegated(release_id, result).await
    }

    pub fn builds(&self) -> &Arc<BuildPipeline> {
        &self.builds
    }

    pub fn scheduler(&self) -> &Arc<ReconciliationScheduler> {
        &self.scheduler
    }

    pub fn dependencies(&self) -> &Arc<DependencyRegistry> {
        &self.dependencies
    }

    pub fn stores(&self) -> &StateStores {
        &self.stores
    }
}
