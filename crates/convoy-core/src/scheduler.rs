//! Bounded, priority-ordered reconciliation queue with single-flight
//! execution per deployment.
//!
//! Every deployment id is in at most one of three places:
//! - `queued`: waiting, ordered by (priority desc, arrival)
//! - `in_flight`: a worker is reconciling it
//! - `in_flight` and `reruns`: reconciling, with one follow-up run owed
//!
//! Requests for a queued id raise its priority instead of adding an entry.
//! Requests for an in-flight id park in `reruns` and are re-queued when the
//! current run finishes, so two runs for one id never overlap and the last
//! request is never dropped. Queue capacity counts `queued` plus `reruns`.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use convoy_state::{Deployment, DeploymentId, DeploymentStatus, HealthStatus, StateStores};
use futures::FutureExt;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ControlPlaneConfig;
use crate::error::{ConvoyResult, ScheduleError};
use crate::metrics::METRICS;
use crate::obs;
use crate::reconciler::{ReconcileRequest, ReconcileResult, Reconciler};

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const OUTCOME_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl From<&ControlPlaneConfig> for SchedulerConfig {
    fn from(config: &ControlPlaneConfig) -> Self {
        Self {
            workers: config.scheduler.workers.max(1),
            queue_capacity: config.scheduler.queue_capacity.max(1),
            sweep_interval: config.sweep_interval(),
        }
    }
}

/// How a successful `schedule` call was absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAck {
    /// New queue entry.
    Enqueued,
    /// Merged into an entry that was already waiting.
    Coalesced,
    /// The id is being reconciled; it runs again once that finishes.
    AfterInFlight,
}

/// A unit of reconciliation work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationTask {
    pub deployment_id: DeploymentId,
    pub priority: i64,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileStatus {
    Converged,
    NotConverged { error: String, retryable: bool },
    /// The deployment was already terminal; nothing was sent to the cluster.
    Skipped { reason: String },
    /// A newer deployment of the same service is already running, so this
    /// one was failed instead of being promoted.
    Superseded { by: DeploymentId },
    /// Loading inputs or recording the result failed.
    Aborted { error: String },
}

/// Published on the outcome channel for every processed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub task: ReconciliationTask,
    pub status: ReconcileStatus,
}

impl ReconcileOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ReconcileStatus::Converged
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuePressure {
    pub queued: usize,
    pub waiting_reruns: usize,
    pub in_flight: usize,
    pub capacity: usize,
    pub rejected_total: u64,
}

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Slot {
    priority: i64,
    seq: u64,
    attempt: u32,
}

#[derive(Debug, Clone, Copy)]
struct Rerun {
    priority: i64,
    attempt: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    queued: HashMap<DeploymentId, Slot>,
    order: BTreeSet<(Reverse<i64>, u64, DeploymentId)>,
    /// In-flight id → attempt number of the running task.
    in_flight: HashMap<DeploymentId, u32>,
    reruns: HashMap<DeploymentId, Rerun>,
    next_seq: u64,
    closed: bool,
    rejected_total: u64,
}

impl QueueState {
    fn len(&self) -> usize {
        self.queued.len() + self.reruns.len()
    }

    fn push(&mut self, id: DeploymentId, priority: i64, attempt: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert((Reverse(priority), seq, id.clone()));
        self.queued.insert(
            id,
            Slot {
                priority,
                seq,
                attempt,
            },
        );
    }

    fn offer(
        &mut self,
        id: &DeploymentId,
        priority: i64,
        capacity: usize,
    ) -> Result<ScheduleAck, ScheduleError> {
        if self.closed {
            return Err(ScheduleError::ShuttingDown);
        }

        if let Some(slot) = self.queued.get_mut(id) {
            if priority > slot.priority {
                self.order.remove(&(Reverse(slot.priority), slot.seq, id.clone()));
                slot.priority = priority;
                self.order.insert((Reverse(priority), slot.seq, id.clone()));
            }
            return Ok(ScheduleAck::Coalesced);
        }

        if let Some(&running_attempt) = self.in_flight.get(id) {
            if let Some(rerun) = self.reruns.get_mut(id) {
                rerun.priority = rerun.priority.max(priority);
                return Ok(ScheduleAck::Coalesced);
            }
            if self.len() >= capacity {
                self.rejected_total += 1;
                return Err(ScheduleError::QueueFull { capacity });
            }
            self.reruns.insert(
                id.clone(),
                Rerun {
                    priority,
                    attempt: running_attempt + 1,
                },
            );
            return Ok(ScheduleAck::AfterInFlight);
        }

        if self.len() >= capacity {
            self.rejected_total += 1;
            return Err(ScheduleError::QueueFull { capacity });
        }
        self.push(id.clone(), priority, 1);
        Ok(ScheduleAck::Enqueued)
    }

    /// Take the highest-priority entry and mark it in flight.
    fn pop(&mut self) -> Option<ReconciliationTask> {
        let (Reverse(priority), _, id) = self.order.pop_first()?;
        let slot = self.queued.remove(&id)?;
        self.in_flight.insert(id.clone(), slot.attempt);
        Some(ReconciliationTask {
            deployment_id: id,
            priority,
            attempt: slot.attempt,
        })
    }

    /// Clear the in-flight mark; returns `true` if an owed rerun was queued.
    fn finish(&mut self, id: &DeploymentId) -> bool {
        self.in_flight.remove(id);
        match self.reruns.remove(id) {
            Some(rerun) => {
                self.push(id.clone(), rerun.priority, rerun.attempt);
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<ReconciliationTask> {
        self.order
            .iter()
            .map(|(Reverse(priority), _, id)| ReconciliationTask {
                deployment_id: id.clone(),
                priority: *priority,
                attempt: self.queued.get(id).map_or(1, |s| s.attempt),
            })
            .collect()
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// ReconciliationScheduler
// ---------------------------------------------------------------------------

struct Inner {
    config: SchedulerConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    stores: StateStores,
    reconciler: Arc<dyn Reconciler>,
    outcomes: broadcast::Sender<ReconcileOutcome>,
}

pub struct ReconciliationScheduler {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReconciliationScheduler {
    pub fn new(
        config: SchedulerConfig,
        stores: StateStores,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                stores,
                reconciler,
                outcomes,
            }),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Non-blocking enqueue.
    ///
    /// Fails with [`ScheduleError::QueueFull`] when the queue is at capacity;
    /// callers treat that as "retry later".
    pub fn schedule(
        &self,
        deployment_id: &DeploymentId,
        priority: i64,
    ) -> Result<ScheduleAck, ScheduleError> {
        self.inner.schedule(deployment_id, priority)
    }

    /// Spawn the worker pool and the pending sweeper. Idempotent.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        if !handles.is_empty() {
            return;
        }
        for worker in 0..self.inner.config.workers {
            let inner = Arc::clone(&self.inner);
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(inner.worker_loop(worker, shutdown)));
        }
        let inner = Arc::clone(&self.inner);
        handles.push(tokio::spawn(inner.sweep_loop(self.shutdown.subscribe())));
        info!(
            workers = self.inner.config.workers,
            queue_capacity = self.inner.config.queue_capacity,
            "reconciliation scheduler started"
        );
    }

    /// Reject new work, let workers finish their current task, and wait for them.
    ///
    /// Tasks still queued are dropped; their deployments stay `pending` and
    /// are picked up by the sweeper after restart.
    pub async fn shutdown(&self) {
        lock(&self.inner.state).closed = true;
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        info!("reconciliation scheduler stopped");
    }

    /// Observe every processed task.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileOutcome> {
        self.inner.outcomes.subscribe()
    }

    pub fn pressure(&self) -> QueuePressure {
        let state = lock(&self.inner.state);
        QueuePressure {
            queued: state.queued.len(),
            waiting_reruns: state.reruns.len(),
            in_flight: state.in_flight.len(),
            capacity: self.inner.config.queue_capacity,
            rejected_total: state.rejected_total,
        }
    }

    /// Waiting tasks in the order workers will take them.
    pub fn queued(&self) -> Vec<ReconciliationTask> {
        lock(&self.inner.state).snapshot()
    }

    /// Process the next queued task on the calling task, if any.
    pub async fn run_next(&self) -> Option<ReconcileOutcome> {
        self.inner.run_next().await
    }

    /// Schedule every `pending` deployment, oldest first by priority.
    /// Returns how many were accepted.
    pub async fn sweep_pending(&self) -> ConvoyResult<usize> {
        self.inner.sweep_pending().await
    }
}

impl Drop for ReconciliationScheduler {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl Inner {
    fn schedule(
        &self,
        deployment_id: &DeploymentId,
        priority: i64,
    ) -> Result<ScheduleAck, ScheduleError> {
        let result = lock(&self.state).offer(deployment_id, priority, self.config.queue_capacity);
        match &result {
            Ok(ScheduleAck::Enqueued) => {
                debug!(deployment_id = %deployment_id, priority, "reconciliation queued");
                self.notify.notify_one();
            }
            Ok(ack) => {
                debug!(deployment_id = %deployment_id, priority, ack = ?ack, "reconciliation merged");
            }
            Err(ScheduleError::QueueFull { .. }) => {
                METRICS.inc_queue_rejections();
                warn!(deployment_id = %deployment_id, priority, "reconciliation queue full");
            }
            Err(_) => {}
        }
        result
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "reconcile worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.run_next().await.is_some() {
                continue;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(worker, "reconcile worker stopped");
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.sweep_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_pending().await {
                        Ok(n) if n > 0 => debug!(scheduled = n, "pending sweep"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "pending sweep failed"),
                    }
                    METRICS.flush();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn sweep_pending(&self) -> ConvoyResult<usize> {
        let pending = self
            .stores
            .deployments
            .list_by_status(DeploymentStatus::Pending)
            .await?;
        let now = Utc::now();
        let mut scheduled = 0;
        for deployment in pending {
            let age_minutes = (now - deployment.created_at).num_minutes().max(0);
            match self.schedule(&deployment.id, age_minutes) {
                Ok(_) => scheduled += 1,
                Err(ScheduleError::QueueFull { .. }) => {
                    debug!("queue full, deferring rest of sweep");
                    break;
                }
                Err(ScheduleError::ShuttingDown) => break,
            }
        }
        Ok(scheduled)
    }

    async fn run_next(&self) -> Option<ReconcileOutcome> {
        let task = lock(&self.state).pop()?;
        let status = AssertUnwindSafe(self.process(&task))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| ReconcileStatus::Aborted {
                error: "reconciler panicked".to_string(),
            });
        if lock(&self.state).finish(&task.deployment_id) {
            self.notify.notify_one();
        }
        let outcome = ReconcileOutcome { task, status };
        // No subscribers is fine.
        let _ = self.outcomes.send(outcome.clone());
        Some(outcome)
    }

    async fn process(&self, task: &ReconciliationTask) -> ReconcileStatus {
        let deployment = match self.stores.deployments.get_deployment(&task.deployment_id).await {
            Ok(d) => d,
            Err(e) => {
                warn!(deployment_id = %task.deployment_id, error = %e, "cannot load deployment");
                return ReconcileStatus::Aborted {
                    error: e.to_string(),
                };
            }
        };
        if deployment.status.is_terminal() {
            return ReconcileStatus::Skipped {
                reason: format!("deployment is {}", deployment.status),
            };
        }
        if deployment.status == DeploymentStatus::Pending {
            if let Some(newer) = self.newer_running(&deployment).await {
                return self.retire_stale(&deployment, newer).await;
            }
        }

        let request = match self.build_request(deployment, task).await {
            Ok(r) => r,
            Err(e) => {
                warn!(deployment_id = %task.deployment_id, error = %e, "cannot assemble reconcile request");
                return ReconcileStatus::Aborted {
                    error: e.to_string(),
                };
            }
        };

        let result = self.reconciler.reconcile(&request).await;
        obs::emit_reconcile_finished(request.deployment.id.as_str(), task.attempt, result.success);

        if result.success && request.deployment.status == DeploymentStatus::Pending {
            if let Some(newer) = self.newer_running(&request.deployment).await {
                return self.retire_stale(&request.deployment, newer).await;
            }
        }
        if let Err(e) = self.apply(&request.deployment, &result).await {
            warn!(deployment_id = %task.deployment_id, error = %e, "cannot record reconcile result");
            return ReconcileStatus::Aborted {
                error: e.to_string(),
            };
        }

        if result.success {
            ReconcileStatus::Converged
        } else {
            ReconcileStatus::NotConverged {
                error: result
                    .error
                    .unwrap_or_else(|| "reconcile failed".to_string()),
                retryable: result.retryable,
            }
        }
    }

    async fn build_request(
        &self,
        deployment: Deployment,
        task: &ReconciliationTask,
    ) -> ConvoyResult<ReconcileRequest> {
        let release = self.stores.releases.get_release(&deployment.release_id).await?;
        let service = self.stores.services.get_service(&deployment.service_id).await?;
        let environment = self
            .stores
            .environments
            .get_environment(&deployment.environment_id)
            .await?;
        Ok(ReconcileRequest {
            deployment,
            release,
            service,
            environment,
            priority: task.priority,
            attempt: task.attempt,
        })
    }

    async fn apply(&self, deployment: &Deployment, result: &ReconcileResult) -> ConvoyResult<()> {
        let store = &self.stores.deployments;
        if result.success {
            METRICS.inc_reconciles_succeeded();
            if deployment.status == DeploymentStatus::Pending {
                store
                    .update_status(
                        &deployment.id,
                        DeploymentStatus::Running,
                        HealthStatus::Healthy,
                        None,
                    )
                    .await?;
                self.supersede_older(deployment).await;
            } else {
                store.update_health(&deployment.id, HealthStatus::Healthy).await?;
            }
            return Ok(());
        }

        METRICS.inc_reconciles_failed();
        let error = result
            .error
            .clone()
            .unwrap_or_else(|| "reconcile failed".to_string());
        warn!(
            deployment_id = %deployment.id,
            error = %error,
            retryable = result.retryable,
            "reconcile did not converge"
        );
        if deployment.status == DeploymentStatus::Running {
            store
                .update_health(&deployment.id, HealthStatus::Unhealthy)
                .await?;
        } else if result.retryable {
            store.update_health(&deployment.id, HealthStatus::Unknown).await?;
        } else {
            store
                .update_status(
                    &deployment.id,
                    DeploymentStatus::Failed,
                    HealthStatus::Unhealthy,
                    Some(error),
                )
                .await?;
        }
        Ok(())
    }

    /// A running deployment of the same service and environment created
    /// after `deployment`, if any.
    async fn newer_running(&self, deployment: &Deployment) -> Option<DeploymentId> {
        let siblings = match self
            .stores
            .deployments
            .list_by_service_environment(&deployment.service_id, &deployment.environment_id)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(deployment_id = %deployment.id, error = %e, "cannot list sibling deployments");
                return None;
            }
        };
        siblings
            .into_iter()
            .filter(|d| d.status == DeploymentStatus::Running && d.created_at > deployment.created_at)
            .max_by_key(|d| d.created_at)
            .map(|d| d.id)
    }

    /// Fail a pending deployment that lost to a newer running one.
    async fn retire_stale(&self, deployment: &Deployment, newer: DeploymentId) -> ReconcileStatus {
        let reason = format!("superseded by newer deployment {newer}");
        if let Err(e) = self
            .stores
            .deployments
            .update_status(
                &deployment.id,
                DeploymentStatus::Failed,
                HealthStatus::Unknown,
                Some(reason),
            )
            .await
        {
            warn!(deployment_id = %deployment.id, error = %e, "cannot retire stale deployment");
            return ReconcileStatus::Aborted {
                error: e.to_string(),
            };
        }
        info!(deployment_id = %deployment.id, by = %newer, "stale deployment not promoted");
        ReconcileStatus::Superseded { by: newer }
    }

    /// A newly running deployment retires the running deployments of the
    /// same service in the same environment that were created before it.
    async fn supersede_older(&self, current: &Deployment) {
        let store = &self.stores.deployments;
        let siblings = match store
            .list_by_service_environment(&current.service_id, &current.environment_id)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(deployment_id = %current.id, error = %e, "cannot list superseded deployments");
                return;
            }
        };
        for old in siblings
            .into_iter()
            .filter(|d| {
                d.id != current.id
                    && d.status == DeploymentStatus::Running
                    && d.created_at < current.created_at
            })
        {
            match store
                .update_status(&old.id, DeploymentStatus::Succeeded, old.health, None)
                .await
            {
                Ok(_) => debug!(deployment_id = %old.id, by = %current.id, "deployment superseded"),
                Err(e) => warn!(deployment_id = %old.id, error = %e, "cannot retire superseded deployment"),
            }
        }
    }
}
