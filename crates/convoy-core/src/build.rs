//! Build pipeline: farm delegation, local admission, release bookkeeping
//! and auto-deploy.
//!
//! A request ends in exactly one [`BuildDisposition`]. When a farm is
//! configured the build is delegated and never admitted locally; if the
//! enqueue fails the request falls through to the local path. The local
//! path waits for a [`BuildSlot`](crate::admission::BuildSlot) and runs the
//! [`Builder`] under one deadline shared by the wait and the build.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use convoy_state::{
    Deployment, Release, ReleaseId, ReleaseStatus, Service, ServiceId, StateStores,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::admission::BuildAdmissionController;
use crate::error::{ConvoyError, ConvoyResult};
use crate::farm::{idempotency_key, BuildFarmClient, EnqueueRequest};
use crate::metrics::METRICS;
use crate::obs;
use crate::scheduler::ReconciliationScheduler;

/// Priority used when scheduling auto-deployed releases.
const AUTO_DEPLOY_PRIORITY: i64 = 0;

/// Output of one build attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildResult {
    pub success: bool,
    pub image_uri: Option<String>,
    pub sbom: Option<serde_json::Value>,
    pub signature: Option<String>,
    pub logs: Vec<String>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl BuildResult {
    pub fn succeeded(image_uri: impl Into<String>) -> Self {
        Self {
            success: true,
            image_uri: Some(image_uri.into()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Runs a build (buildpacks, Dockerfile, ...) for one commit of a service.
///
/// Potentially slow. The pipeline drops the future when the deadline passes.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build_from_git(&self, service: &Service, git_sha: &str) -> BuildResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub service_id: ServiceId,
    pub git_sha: String,
    /// Defaults to the first 12 characters of the commit.
    pub version: Option<String>,
    pub git_branch: Option<String>,
    pub priority: i32,
}

impl BuildRequest {
    pub fn new(service_id: impl Into<ServiceId>, git_sha: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            git_sha: git_sha.into(),
            version: None,
            git_branch: None,
            priority: 0,
        }
    }
}

/// The single outcome of a build request.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildDisposition {
    /// Handed to the external farm; the release stays `building` until the
    /// farm reports back through [`BuildPipeline::complete_delegated`].
    Delegated {
        release_id: ReleaseId,
        job_id: String,
        position: u32,
    },
    /// The release is `ready`.
    Built { release: Release },
    /// The release is `failed`. `retryable` marks admission timeouts.
    Failed {
        release_id: ReleaseId,
        reason: String,
        retryable: bool,
    },
}

impl BuildDisposition {
    pub fn release_id(&self) -> &ReleaseId {
        match self {
            BuildDisposition::Delegated { release_id, .. } => release_id,
            BuildDisposition::Built { release } => &release.id,
            BuildDisposition::Failed { release_id, .. } => release_id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            BuildDisposition::Delegated { .. } => "delegated",
            BuildDisposition::Built { .. } => "built",
            BuildDisposition::Failed { .. } => "failed",
        }
    }
}

pub struct BuildPipeline {
    stores: StateStores,
    admission: Arc<BuildAdmissionController>,
    builder: Arc<dyn Builder>,
    farm: Option<Arc<dyn BuildFarmClient>>,
    scheduler: Arc<ReconciliationScheduler>,
    callback_url: Option<String>,
}

impl BuildPipeline {
    pub fn new(
        stores: StateStores,
        admission: Arc<BuildAdmissionController>,
        builder: Arc<dyn Builder>,
        scheduler: Arc<ReconciliationScheduler>,
    ) -> Self {
        Self {
            stores,
            admission,
            builder,
            farm: None,
            scheduler,
            callback_url: None,
        }
    }

    /// Delegate builds to `farm` when it accepts them.
    pub fn with_farm(mut self, farm: Arc<dyn BuildFarmClient>, callback_url: Option<String>) -> Self {
        self.farm = Some(farm);
        self.callback_url = callback_url;
        self
    }

    /// Create a `building` release for the commit and drive it to one outcome.
    #[instrument(skip_all, fields(service_id = %request.service_id, git_sha = %request.git_sha))]
    pub async fn submit(&self, request: BuildRequest) -> ConvoyResult<BuildDisposition> {
        let service = match self.stores.services.get_service(&request.service_id).await {
            Ok(s) => s,
            Err(e) if e.is_not_found() => {
                return Err(ConvoyError::UnknownService {
                    service: request.service_id,
                })
            }
            Err(e) => return Err(e.into()),
        };
        if request.git_sha.trim().is_empty() {
            return Err(ConvoyError::Validation("git sha is required".to_string()));
        }

        let version = request
            .version
            .clone()
            .unwrap_or_else(|| request.git_sha.chars().take(12).collect());
        let release = Release::building(service.id.clone(), version, request.git_sha.clone());
        self.stores.releases.create_release(release.clone()).await?;

        let disposition = match self.delegate(&service, &release, &request).await {
            Some(delegated) => delegated,
            None => self.build_locally(&service, release).await?,
        };
        obs::emit_build_finished(disposition.release_id().as_str(), disposition.label());
        Ok(disposition)
    }

    /// Run [`submit`](Self::submit) on a background task.
    pub fn spawn(self: &Arc<Self>, request: BuildRequest) -> JoinHandle<ConvoyResult<BuildDisposition>> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.submit(request).await })
    }

    async fn delegate(
        &self,
        service: &Service,
        release: &Release,
        request: &BuildRequest,
    ) -> Option<BuildDisposition> {
        let farm = self.farm.as_ref()?;
        let job = EnqueueRequest {
            release_id: release.id.clone(),
            service_id: service.id.clone(),
            project_id: service.project_id.clone(),
            git_repo: service.git_repo.clone(),
            git_sha: release.git_sha.clone(),
            git_branch: request.git_branch.clone(),
            build_config: service.build.clone(),
            callback_url: self.callback_url.clone(),
            priority: request.priority,
            idempotency_key: idempotency_key(&release.id, &release.git_sha),
        };
        match farm.enqueue(&job).await {
            Ok(accepted) => {
                METRICS.inc_builds_delegated();
                info!(
                    release_id = %release.id,
                    job_id = %accepted.job_id,
                    position = accepted.position,
                    "build delegated to farm"
                );
                Some(BuildDisposition::Delegated {
                    release_id: release.id.clone(),
                    job_id: accepted.job_id,
                    position: accepted.position,
                })
            }
            Err(e) => {
                warn!(release_id = %release.id, error = %e, "farm enqueue failed, building locally");
                None
            }
        }
    }

    async fn build_locally(
        &self,
        service: &Service,
        release: Release,
    ) -> ConvoyResult<BuildDisposition> {
        let deadline = Instant::now() + self.admission.timeout();
        let slot = match self.admission.acquire_until(deadline).await {
            Ok(slot) => slot,
            Err(e) => {
                let retryable = ConvoyError::from(e.clone()).is_retryable();
                return self.fail(&release.id, e.to_string(), retryable).await;
            }
        };
        METRICS.inc_builds_local();
        info!(release_id = %release.id, "local build started");

        let started = Instant::now();
        let build = self.builder.build_from_git(service, &release.git_sha);
        let result = match tokio::time::timeout_at(deadline, build).await {
            Ok(result) => result,
            Err(_) => BuildResult::failed(format!(
                "build timed out after {:?}",
                started.elapsed()
            )),
        };
        drop(slot);

        self.finish(service, &release.id, result).await
    }

    /// Record the farm's report for a delegated build.
    ///
    /// The release must still be `building`. A successful report stores the
    /// artifact, marks the release `ready` and auto-deploys it exactly as a
    /// local build would; a failed one marks it `failed`.
    #[instrument(skip_all, fields(release_id = %release_id, success = result.success))]
    pub async fn complete_delegated(
        &self,
        release_id: &ReleaseId,
        result: BuildResult,
    ) -> ConvoyResult<BuildDisposition> {
        let release = self.stores.releases.get_release(release_id).await?;
        if release.status != ReleaseStatus::Building {
            return Err(ConvoyError::InvalidState {
                entity: "release",
                id: release.id.to_string(),
                actual: release.status.to_string(),
                expected: "building",
            });
        }
        let service = self.stores.services.get_service(&release.service_id).await?;
        let disposition = self.finish(&service, &release.id, result).await?;
        obs::emit_build_finished(disposition.release_id().as_str(), disposition.label());
        Ok(disposition)
    }

    async fn finish(
        &self,
        service: &Service,
        release_id: &ReleaseId,
        result: BuildResult,
    ) -> ConvoyResult<BuildDisposition> {
        if !result.success {
            let reason = result
                .error
                .unwrap_or_else(|| "build failed".to_string());
            return self.fail(release_id, reason, false).await;
        }
        let Some(image_uri) = result.image_uri else {
            return self
                .fail(release_id, "build produced no image".to_string(), false)
                .await;
        };

        self.stores
            .releases
            .record_artifact(release_id, image_uri, result.sbom, result.signature)
            .await?;
        let release = self
            .stores
            .releases
            .update_status(release_id, ReleaseStatus::Ready, None)
            .await?;
        info!(
            release_id = %release.id,
            duration_ms = result.duration.as_millis() as u64,
            "release ready"
        );

        self.auto_deploy(service, &release).await;
        Ok(BuildDisposition::Built { release })
    }

    async fn fail(
        &self,
        release_id: &ReleaseId,
        reason: String,
        retryable: bool,
    ) -> ConvoyResult<BuildDisposition> {
        warn!(release_id = %release_id, reason = %reason, "build failed");
        self.stores
            .releases
            .update_status(release_id, ReleaseStatus::Failed, Some(reason.clone()))
            .await?;
        Ok(BuildDisposition::Failed {
            release_id: release_id.clone(),
            reason,
            retryable,
        })
    }

    /// Deploy a ready release if the service asks for it. Failures here do
    /// not affect the build outcome.
    async fn auto_deploy(&self, service: &Service, release: &Release) {
        let policy = &service.auto_deploy;
        let Some(env_name) = policy.environment.as_deref().filter(|_| policy.enabled) else {
            return;
        };

        let environment = match self
            .stores
            .environments
            .find_by_name(&service.project_id, env_name)
            .await
        {
            Ok(Some(env)) => env,
            Ok(None) => {
                warn!(service_id = %service.id, environment = env_name, "auto-deploy target environment not found");
                return;
            }
            Err(e) => {
                warn!(service_id = %service.id, error = %e, "auto-deploy environment lookup failed");
                return;
            }
        };

        let deployment = Deployment::pending(release, environment.id.clone());
        if let Err(e) = self.stores.deployments.create_deployment(deployment.clone()).await {
            warn!(service_id = %service.id, error = %e, "auto-deploy could not create deployment");
            return;
        }
        METRICS.inc_deployments_created();
        match self.scheduler.schedule(&deployment.id, AUTO_DEPLOY_PRIORITY) {
            Ok(_) => info!(deployment_id = %deployment.id, environment = env_name, "auto-deploy scheduled"),
            Err(e) => warn!(
                deployment_id = %deployment.id,
                error = %e,
                "auto-deploy not queued; left pending for the sweeper"
            ),
        }
    }
}
