//! Structured observability hooks for group and build lifecycle events.
//!
//! One `info!` event per lifecycle transition. Group scoping comes from the
//! `#[instrument]` spans on the executor entry points.

use tracing::info;

pub fn emit_group_planned(group_id: &str, strategy: &str, layers: usize, services: usize) {
    info!(
        event = "group.planned",
        group_id = %group_id,
        strategy = %strategy,
        layers = layers,
        services = services,
    );
}

pub fn emit_group_executed(
    group_id: &str,
    status: &str,
    accepted: usize,
    failed: usize,
    skipped: usize,
) {
    info!(
        event = "group.executed",
        group_id = %group_id,
        status = %status,
        accepted = accepted,
        failed = failed,
        skipped = skipped,
    );
}

pub fn emit_group_rolled_back(group_id: &str, rolled_back: usize, failed_to_roll: usize) {
    info!(
        event = "group.rolled_back",
        group_id = %group_id,
        rolled_back = rolled_back,
        failed_to_roll = failed_to_roll,
    );
}

/// Emit event: one reconciliation attempt finished.
pub fn emit_reconcile_finished(deployment_id: &str, attempt: u32, success: bool) {
    info!(
        event = "reconcile.finished",
        deployment_id = %deployment_id,
        attempt = attempt,
        success = success,
    );
}

/// Emit event: a build request reached its single outcome.
pub fn emit_build_finished(release_id: &str, outcome: &str) {
    info!(event = "build.finished", release_id = %release_id, outcome = %outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_lifecycle_events() {
        emit_group_planned("test-group", "parallel", 1, 3);
        emit_group_executed("test-group", "completed", 3, 0, 0);
    }
}
