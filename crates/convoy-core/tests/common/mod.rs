//! Shared fixtures: in-memory stores seeded with one project, plus scripted
//! collaborators that record what the core asked of them.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convoy_core::build::{BuildResult, Builder};
use convoy_core::error::BuildFarmError;
use convoy_core::farm::{BuildFarmClient, EnqueueRequest, EnqueueResponse};
use convoy_core::reconciler::{ReconcileRequest, ReconcileResult, Reconciler, RollbackError};
use convoy_state::{
    Environment, EnvironmentId, ProjectId, Release, ReleaseStatus, Service, ServiceId,
    StateStores,
};

pub const PROJECT: &str = "shop";
pub const ENV: &str = "env-prod";
pub const ENV_NAME: &str = "production";

pub fn project() -> ProjectId {
    ProjectId::from(PROJECT)
}

pub fn env() -> EnvironmentId {
    EnvironmentId::from(ENV)
}

pub fn sid(s: &str) -> ServiceId {
    ServiceId::from(s)
}

/// Stores holding project `shop` with environment `production`.
pub async fn stores() -> StateStores {
    let stores = StateStores::in_memory();
    stores
        .environments
        .upsert_environment(Environment::new(ENV, PROJECT, ENV_NAME))
        .await
        .unwrap();
    stores
}

pub async fn add_service(stores: &StateStores, id: &str) -> Service {
    let service = Service::new(id, PROJECT).with_repo(format!("https://git.example.com/shop/{id}"));
    stores.services.upsert_service(service.clone()).await.unwrap();
    service
}

/// Insert a release for `service` built from `sha` and mark it ready.
pub async fn ready_release(stores: &StateStores, service: &str, sha: &str) -> Release {
    let release = Release::building(service, sha, sha);
    stores.releases.create_release(release.clone()).await.unwrap();
    stores
        .releases
        .record_artifact(&release.id, format!("registry.example.com/{service}:{sha}"), None, None)
        .await
        .unwrap();
    stores
        .releases
        .update_status(&release.id, ReleaseStatus::Ready, None)
        .await
        .unwrap()
}

/// A deployable service: registered and with one ready release.
pub async fn deployable(stores: &StateStores, id: &str) -> Release {
    add_service(stores, id).await;
    ready_release(stores, id, &format!("{id}0001")).await
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Reconciler whose answers are scripted per service name.
#[derive(Default)]
pub struct ScriptedReconciler {
    results: Mutex<HashMap<String, ReconcileResult>>,
    failing_rollbacks: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    reconciled: Mutex<Vec<(String, u32)>>,
    rolled_back: Mutex<Vec<String>>,
    active: Mutex<HashMap<String, usize>>,
    max_overlap: AtomicUsize,
}

impl ScriptedReconciler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, service: &str, result: ReconcileResult) {
        self.results
            .lock()
            .unwrap()
            .insert(service.to_string(), result);
    }

    pub fn fail_rollback(&self, service: &str) {
        self.failing_rollbacks
            .lock()
            .unwrap()
            .insert(service.to_string());
    }

    pub fn slow(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// `(service, attempt)` in call order.
    pub fn reconciled(&self) -> Vec<(String, u32)> {
        self.reconciled.lock().unwrap().clone()
    }

    pub fn rolled_back(&self) -> Vec<String> {
        self.rolled_back.lock().unwrap().clone()
    }

    /// Highest number of simultaneous reconciles seen for any one deployment.
    pub fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reconciler for ScriptedReconciler {
    async fn reconcile(&self, request: &ReconcileRequest) -> ReconcileResult {
        let key = request.deployment.id.to_string();
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(key.clone()).or_default();
            *count += 1;
            self.max_overlap.fetch_max(*count, Ordering::SeqCst);
        }
        self.reconciled
            .lock()
            .unwrap()
            .push((request.service.name.clone(), request.attempt));

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(count) = self.active.lock().unwrap().get_mut(&key) {
            *count -= 1;
        }
        self.results
            .lock()
            .unwrap()
            .get(&request.service.name)
            .cloned()
            .unwrap_or_else(ReconcileResult::converged)
    }

    async fn rollback(&self, namespace: &str, service_name: &str) -> Result<(), RollbackError> {
        if self.failing_rollbacks.lock().unwrap().contains(service_name) {
            return Err(RollbackError {
                namespace: namespace.to_string(),
                service: service_name.to_string(),
                reason: "previous revision not found".to_string(),
            });
        }
        self.rolled_back
            .lock()
            .unwrap()
            .push(service_name.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct StubBuilder {
    result: BuildResult,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StubBuilder {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            result: BuildResult::succeeded("registry.example.com/built:latest"),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(error: &str) -> Arc<Self> {
        Arc::new(Self {
            result: BuildResult::failed(error),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            result: BuildResult::succeeded("registry.example.com/built:latest"),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Builder for StubBuilder {
    async fn build_from_git(&self, _service: &Service, _git_sha: &str) -> BuildResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }
}

// ---------------------------------------------------------------------------
// Build farm
// ---------------------------------------------------------------------------

pub struct StubFarm {
    accept: bool,
    requests: Mutex<Vec<EnqueueRequest>>,
}

impl StubFarm {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            accept: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            accept: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<EnqueueRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildFarmClient for StubFarm {
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueResponse, BuildFarmError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.accept {
            Ok(EnqueueResponse {
                job_id: format!("job-{}", self.requests.lock().unwrap().len()),
                position: 3,
            })
        } else {
            Err(BuildFarmError::Transport("connection refused".to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

pub async fn control_plane_with(
    config: &convoy_core::ControlPlaneConfig,
    stores: &StateStores,
    reconciler: Arc<ScriptedReconciler>,
) -> convoy_core::ControlPlane {
    convoy_core::ControlPlane::new(
        config,
        stores.clone(),
        convoy_core::Collaborators {
            reconciler,
            builder: StubBuilder::succeeding(),
            farm: None,
        },
    )
    .await
    .unwrap()
}

pub async fn control_plane(
    stores: &StateStores,
    reconciler: Arc<ScriptedReconciler>,
) -> convoy_core::ControlPlane {
    control_plane_with(&convoy_core::ControlPlaneConfig::default(), stores, reconciler).await
}
