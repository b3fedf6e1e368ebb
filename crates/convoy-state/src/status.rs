//! Explicit state machines for releases, deployments and groups.
//!
//! Each status type enumerates its legal transitions in `can_transition_to`.
//! Writing the current state again is not a legal transition.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseVariantError;

macro_rules! status_names {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseVariantError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseVariantError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

/// `building → ready | failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Building,
    Ready,
    Failed,
}

status_names!(ReleaseStatus, "release status", {
    Building => "building",
    Ready => "ready",
    Failed => "failed",
});

impl ReleaseStatus {
    pub fn can_transition_to(self, next: ReleaseStatus) -> bool {
        matches!(
            (self, next),
            (ReleaseStatus::Building, ReleaseStatus::Ready)
                | (ReleaseStatus::Building, ReleaseStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ReleaseStatus::Building)
    }
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

/// `pending → running → (failed | succeeded)`, plus `pending → failed` when
/// convergence is abandoned before the workload ever ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

status_names!(DeploymentStatus, "deployment status", {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});

impl DeploymentStatus {
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Succeeded) | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Succeeded | DeploymentStatus::Failed)
    }

    /// Deployments in these states have touched the cluster and can be rolled back.
    pub fn is_rollbackable(self) -> bool {
        matches!(self, DeploymentStatus::Running | DeploymentStatus::Succeeded)
    }
}

/// Health is an independent axis; any value may follow any other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

status_names!(HealthStatus, "health status", {
    Unknown => "unknown",
    Healthy => "healthy",
    Unhealthy => "unhealthy",
});

// ---------------------------------------------------------------------------
// DeploymentGroup
// ---------------------------------------------------------------------------

/// `planned → running → (completed | partially_failed | failed) → rolled_back`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Planned,
    Running,
    Completed,
    PartiallyFailed,
    Failed,
    RolledBack,
}

status_names!(GroupStatus, "group status", {
    Planned => "planned",
    Running => "running",
    Completed => "completed",
    PartiallyFailed => "partially_failed",
    Failed => "failed",
    RolledBack => "rolled_back",
});

impl GroupStatus {
    pub fn can_transition_to(self, next: GroupStatus) -> bool {
        use GroupStatus::*;
        match (self, next) {
            (Planned, Running) => true,
            (Running, Completed | PartiallyFailed | Failed) => true,
            (Completed | PartiallyFailed | Failed, RolledBack) => true,
            _ => false,
        }
    }

    /// Execution has finished (successfully or not).
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            GroupStatus::Completed | GroupStatus::PartiallyFailed | GroupStatus::Failed
        )
    }

    pub fn is_terminal(self) -> bool {
        self.is_settled() || self == GroupStatus::RolledBack
    }
}
