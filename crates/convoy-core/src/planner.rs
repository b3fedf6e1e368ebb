//! Group planning: pick the participating services and compute their order.

use std::collections::BTreeSet;
use std::sync::Arc;

use convoy_state::{
    DeploymentGroup, DeploymentOrder, EnvironmentId, ProjectId, ServiceId, StateStores, Strategy,
};
use tracing::instrument;

use crate::dependencies::DependencyRegistry;
use crate::error::{ConvoyError, ConvoyResult};
use crate::obs;

/// Input to [`GroupPlanner::plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    /// Empty means every service of the project.
    pub services: Vec<ServiceId>,
    pub strategy: Strategy,
    pub git_sha: Option<String>,
    pub triggered_by: Option<String>,
    pub pr_url: Option<String>,
}

impl PlanRequest {
    pub fn new(project_id: impl Into<ProjectId>, environment_id: impl Into<EnvironmentId>) -> Self {
        Self {
            project_id: project_id.into(),
            environment_id: environment_id.into(),
            services: Vec::new(),
            strategy: Strategy::default(),
            git_sha: None,
            triggered_by: None,
            pr_url: None,
        }
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ServiceId>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_git_sha(mut self, git_sha: impl Into<String>) -> Self {
        self.git_sha = Some(git_sha.into());
        self
    }
}

pub struct GroupPlanner {
    stores: StateStores,
    dependencies: Arc<DependencyRegistry>,
}

impl GroupPlanner {
    pub fn new(stores: StateStores, dependencies: Arc<DependencyRegistry>) -> Self {
        Self {
            stores,
            dependencies,
        }
    }

    /// Validate the request, order its services and persist a `planned` group.
    ///
    /// Nothing is written unless planning succeeds.
    #[instrument(skip_all, fields(project_id = %request.project_id, strategy = %request.strategy))]
    pub async fn plan(&self, request: PlanRequest) -> ConvoyResult<DeploymentGroup> {
        let environment = match self
            .stores
            .environments
            .get_environment(&request.environment_id)
            .await
        {
            Ok(env) => env,
            Err(e) if e.is_not_found() => {
                return Err(ConvoyError::Validation(format!(
                    "unknown environment: {}",
                    request.environment_id
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if environment.project_id != request.project_id {
            return Err(ConvoyError::Validation(format!(
                "environment {} does not belong to project {}",
                environment.id, request.project_id
            )));
        }

        let services = self.select_services(&request).await?;
        let order = self.order(&services, request.strategy).await?;

        let mut group = DeploymentGroup::planned(
            request.project_id,
            request.environment_id,
            request.strategy,
            order,
        );
        group.git_sha = request.git_sha;
        group.triggered_by = request.triggered_by;
        group.pr_url = request.pr_url;
        self.stores.groups.create_group(group.clone()).await?;

        obs::emit_group_planned(
            group.id.as_str(),
            group.strategy.as_str(),
            group.order.len(),
            services.len(),
        );
        Ok(group)
    }

    /// Requested services (deduplicated, validated) or all project services.
    async fn select_services(&self, request: &PlanRequest) -> ConvoyResult<Vec<ServiceId>> {
        if request.services.is_empty() {
            let all: Vec<ServiceId> = self
                .stores
                .services
                .list_by_project(&request.project_id)
                .await?
                .into_iter()
                .map(|s| s.id)
                .collect();
            if all.is_empty() {
                return Err(ConvoyError::Validation("no services to deploy".to_string()));
            }
            return Ok(all);
        }

        let unique: BTreeSet<&ServiceId> = request.services.iter().collect();
        let mut selected = Vec::with_capacity(unique.len());
        for id in unique {
            let service = match self.stores.services.get_service(id).await {
                Ok(s) => s,
                Err(e) if e.is_not_found() => {
                    return Err(ConvoyError::UnknownService {
                        service: id.clone(),
                    })
                }
                Err(e) => return Err(e.into()),
            };
            if service.project_id != request.project_id {
                return Err(ConvoyError::Validation(format!(
                    "service {} does not belong to project {}",
                    service.id, request.project_id
                )));
            }
            selected.push(service.id);
        }
        Ok(selected)
    }

    async fn order(
        &self,
        services: &[ServiceId],
        strategy: Strategy,
    ) -> ConvoyResult<DeploymentOrder> {
        let mut sorted = services.to_vec();
        sorted.sort();
        let layers = match strategy {
            Strategy::Parallel => vec![sorted],
            Strategy::Sequential => sorted.into_iter().map(|id| vec![id]).collect(),
            Strategy::DependencyOrdered => {
                self.dependencies.topological_layers(&sorted).await?
            }
        };
        Ok(DeploymentOrder::new(layers))
    }
}
