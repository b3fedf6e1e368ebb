//! Convoy Core: orchestration for the Convoy control plane
//!
//! Turns declared services, releases and dependencies into scheduled
//! deployments.
//!
//! ## Key Components
//!
//! - `graph` / `dependencies`: acyclic service dependency graph and its
//!   persisted, lock-guarded registry
//! - `planner`: selects services for a group and orders them by strategy
//! - `executor`: layer-by-layer group execution with skip-on-failure, and
//!   reverse-order group rollback
//! - `scheduler`: bounded priority queue with single-flight reconciliation
//! - `admission` / `build`: build slot limiter, farm delegation, auto-deploy
//! - `control_plane`: the operations exposed to the API layer

pub mod admission;
pub mod build;
pub mod config;
pub mod control_plane;
pub mod dependencies;
pub mod error;
pub mod executor;
pub mod farm;
pub mod graph;
pub mod metrics;
pub mod obs;
pub mod planner;
pub mod reconciler;
pub mod scheduler;
pub mod telemetry;

pub use admission::{BuildAdmissionController, BuildSlot};
pub use build::{BuildDisposition, BuildPipeline, BuildRequest, BuildResult, Builder};
pub use config::{BuildMode, ControlPlaneConfig};
pub use control_plane::{Collaborators, ControlPlane};
pub use dependencies::DependencyRegistry;
pub use error::{
    AdmissionError, BuildFarmError, ConvoyError, ConvoyResult, GraphError, ScheduleError,
};
pub use executor::{ExecutionReport, GroupExecutor, RollbackReport, ServiceOutcome};
pub use farm::{BuildFarmClient, EnqueueRequest, EnqueueResponse, HttpBuildFarmClient};
pub use graph::DependencyGraph;
pub use planner::{GroupPlanner, PlanRequest};
pub use reconciler::{DryRunReconciler, ReconcileRequest, ReconcileResult, Reconciler};
pub use scheduler::{
    ReconcileOutcome, ReconcileStatus, ReconciliationScheduler, ReconciliationTask, ScheduleAck,
    SchedulerConfig,
};
