//! Group planning and execution through the control plane.

mod common;

use std::collections::HashMap;

use common::*;
use convoy_core::{ConvoyError, ControlPlaneConfig, ServiceOutcome};
use convoy_state::{DeploymentStatus, GroupStatus, HealthStatus, ServiceId, StateStores};

fn names(layers: &[Vec<ServiceId>]) -> Vec<Vec<&str>> {
    layers
        .iter()
        .map(|layer| layer.iter().map(|s| s.as_str()).collect())
        .collect()
}

/// api → db, worker → db.
async fn shop(stores: &StateStores, cp: &convoy_core::ControlPlane) {
    for name in ["api", "worker", "db"] {
        deployable(stores, name).await;
    }
    cp.add_service_dependency(&sid("api"), &sid("db"), None)
        .await
        .unwrap();
    cp.add_service_dependency(&sid("worker"), &sid("db"), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_dependency_ordered_puts_db_first() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    shop(&stores, &cp).await;

    let (group, order) = cp
        .create_group_deployment(&project(), &env(), vec![], None, None)
        .await
        .unwrap();

    assert_eq!(names(order.layers()), vec![vec!["db"], vec!["api", "worker"]]);
    assert_eq!(group.status, GroupStatus::Planned);
    let stored = stores.groups.get_group(&group.id).await.unwrap();
    assert_eq!(stored.order, order);
    assert!(stored.name.starts_with("deploy-shop-"));
}

#[tokio::test]
async fn test_parallel_is_one_layer() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    shop(&stores, &cp).await;

    let (_, order) = cp
        .create_group_deployment(&project(), &env(), vec![], Some("parallel"), None)
        .await
        .unwrap();

    assert_eq!(names(order.layers()), vec![vec!["api", "db", "worker"]]);
}

#[tokio::test]
async fn test_sequential_is_one_service_per_layer() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    shop(&stores, &cp).await;

    let (_, order) = cp
        .create_group_deployment(&project(), &env(), vec![], Some("sequential"), None)
        .await
        .unwrap();

    assert_eq!(names(order.layers()), vec![vec!["api"], vec!["db"], vec!["worker"]]);
}

#[tokio::test]
async fn test_selection_ignores_unselected_dependencies() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    shop(&stores, &cp).await;

    let (_, order) = cp
        .create_group_deployment(
            &project(),
            &env(),
            vec![sid("worker"), sid("api"), sid("api")],
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(names(order.layers()), vec![vec!["api", "worker"]]);
}

#[tokio::test]
async fn test_unknown_strategy_is_validation_error() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    shop(&stores, &cp).await;

    let err = cp
        .create_group_deployment(&project(), &env(), vec![], Some("canary"), None)
        .await
        .unwrap_err();
    assert!(err.is_validation(), "got {err}");
}

#[tokio::test]
async fn test_unknown_service_rejected() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    shop(&stores, &cp).await;

    let err = cp
        .create_group_deployment(&project(), &env(), vec![sid("api"), sid("ghost")], None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConvoyError::UnknownService { ref service } if service.as_str() == "ghost"));
}

#[tokio::test]
async fn test_project_without_services_rejected() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;

    let err = cp
        .create_group_deployment(&project(), &env(), vec![], None, None)
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_execute_schedules_every_layer_in_order() {
    let stores = stores().await;
    let reconciler = ScriptedReconciler::new();
    let cp = control_plane(&stores, reconciler.clone()).await;
    shop(&stores, &cp).await;
    let (group, _) = cp
        .create_group_deployment(&project(), &env(), vec![], None, None)
        .await
        .unwrap();

    let report = cp.execute_group_deployment(&group.id).await.unwrap();

    assert!(report.overall_success());
    assert_eq!(report.group.status, GroupStatus::Completed);
    assert!(report.errors().is_empty());
    assert_eq!(report.deployments.len(), 3);

    let layer_of: HashMap<&str, usize> = report
        .deployments
        .iter()
        .map(|d| (d.service_id.as_str(), d.deploy_order))
        .collect();
    assert_eq!(layer_of["db"], 0);
    assert_eq!(layer_of["api"], 1);
    assert_eq!(layer_of["worker"], 1);

    // Equal priorities drain FIFO, so db was accepted before its dependents.
    let service_of: HashMap<_, _> = report
        .deployments
        .iter()
        .map(|d| (d.id.clone(), d.service_id.to_string()))
        .collect();
    let queued = cp.scheduler().queued();
    assert_eq!(service_of[&queued[0].deployment_id], "db");
    assert!(queued.iter().all(|t| t.priority == 10));

    while cp.scheduler().run_next().await.is_some() {}
    for deployment in &report.deployments {
        let stored = stores.deployments.get_deployment(&deployment.id).await.unwrap();
        assert_eq!(stored.status, DeploymentStatus::Running);
        assert_eq!(stored.health, HealthStatus::Healthy);
        assert_eq!(stored.group_id.as_ref(), Some(&group.id));
    }
    assert_eq!(reconciler.reconciled()[0].0, "db");
}

#[tokio::test]
async fn test_failed_root_skips_all_dependents() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    deployable(&stores, "api").await;
    deployable(&stores, "worker").await;
    // No ready release: creating db's deployment fails.
    add_service(&stores, "db").await;
    cp.add_service_dependency(&sid("api"), &sid("db"), None)
        .await
        .unwrap();
    cp.add_service_dependency(&sid("worker"), &sid("db"), None)
        .await
        .unwrap();
    let (group, _) = cp
        .create_group_deployment(&project(), &env(), vec![], None, None)
        .await
        .unwrap();

    let report = cp.execute_group_deployment(&group.id).await.unwrap();

    assert_eq!(report.group.status, GroupStatus::Failed);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, sid("db"));
    assert_eq!(report.skipped, vec![sid("api"), sid("worker")]);
    assert!(report.deployments.is_empty());
    assert_eq!(report.errors().len(), 3);
    assert_eq!(
        report.group.error_message.as_deref(),
        Some("1 failed, 2 skipped")
    );
    assert!(matches!(
        report.outcomes[&sid("api")],
        ServiceOutcome::Skipped { ref cause } if cause == &sid("db")
    ));
}

#[tokio::test]
async fn test_independent_branch_survives_failure() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    add_service(&stores, "db").await;
    deployable(&stores, "api").await;
    deployable(&stores, "cache").await;
    cp.add_service_dependency(&sid("api"), &sid("db"), None)
        .await
        .unwrap();
    let (group, _) = cp
        .create_group_deployment(&project(), &env(), vec![], None, None)
        .await
        .unwrap();

    let report = cp.execute_group_deployment(&group.id).await.unwrap();

    assert_eq!(report.group.status, GroupStatus::PartiallyFailed);
    assert_eq!(report.accepted(), 1);
    assert_eq!(report.skipped, vec![sid("api")]);
    assert!(matches!(
        report.outcomes[&sid("cache")],
        ServiceOutcome::Scheduled { .. }
    ));
    assert!(!report.overall_success());
}

#[tokio::test]
async fn test_execute_requires_planned_group() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    shop(&stores, &cp).await;
    let (group, _) = cp
        .create_group_deployment(&project(), &env(), vec![], None, None)
        .await
        .unwrap();
    cp.execute_group_deployment(&group.id).await.unwrap();

    let err = cp.execute_group_deployment(&group.id).await.unwrap_err();
    assert!(matches!(err, ConvoyError::InvalidState { entity: "group", .. }));
}

#[tokio::test]
async fn test_git_sha_selects_matching_release() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    add_service(&stores, "api").await;
    let old = ready_release(&stores, "api", "aaaa").await;
    let new = ready_release(&stores, "api", "bbbb").await;

    let (pinned, _) = cp
        .create_group_deployment(&project(), &env(), vec![sid("api")], None, Some("aaaa".into()))
        .await
        .unwrap();
    let report = cp.execute_group_deployment(&pinned.id).await.unwrap();
    assert_eq!(report.deployments[0].release_id, old.id);

    let (latest, _) = cp
        .create_group_deployment(&project(), &env(), vec![sid("api")], None, None)
        .await
        .unwrap();
    let report = cp.execute_group_deployment(&latest.id).await.unwrap();
    assert_eq!(report.deployments[0].release_id, new.id);
}

#[tokio::test]
async fn test_full_queue_defers_to_sweeper() {
    let stores = stores().await;
    let mut config = ControlPlaneConfig::default();
    config.scheduler.queue_capacity = 1;
    let cp = control_plane_with(&config, &stores, ScriptedReconciler::new()).await;
    for name in ["a", "b", "c"] {
        deployable(&stores, name).await;
    }
    let (group, _) = cp
        .create_group_deployment(&project(), &env(), vec![], Some("parallel"), None)
        .await
        .unwrap();

    let report = cp.execute_group_deployment(&group.id).await.unwrap();

    // Deferred deployments exist and count as accepted.
    assert_eq!(report.group.status, GroupStatus::Completed);
    assert_eq!(report.deferred, vec![sid("b"), sid("c")]);
    assert_eq!(cp.scheduler().pressure().rejected_total, 2);

    cp.scheduler().run_next().await.unwrap();
    assert_eq!(cp.scheduler().sweep_pending().await.unwrap(), 1);
    cp.scheduler().run_next().await.unwrap();
    assert_eq!(cp.scheduler().sweep_pending().await.unwrap(), 1);
    cp.scheduler().run_next().await.unwrap();

    let pending = stores
        .deployments
        .list_by_status(DeploymentStatus::Pending)
        .await
        .unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_execute_during_shutdown_leaves_nothing_pending() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    for name in ["api", "worker"] {
        deployable(&stores, name).await;
    }
    let (group, _) = cp
        .create_group_deployment(&project(), &env(), vec![], Some("parallel"), None)
        .await
        .unwrap();
    cp.shutdown().await;

    let report = cp.execute_group_deployment(&group.id).await.unwrap();

    assert_eq!(report.group.status, GroupStatus::Failed);
    assert_eq!(report.failed.len(), 2);
    assert!(report.deployments.is_empty());
    let pending = stores
        .deployments
        .list_by_status(DeploymentStatus::Pending)
        .await
        .unwrap();
    assert!(pending.is_empty());
    let failed = stores
        .deployments
        .list_by_status(DeploymentStatus::Failed)
        .await
        .unwrap();
    assert_eq!(failed.len(), 2);
    for deployment in failed {
        assert_eq!(
            deployment.error_message.as_deref(),
            Some("reconciliation scheduler is shutting down")
        );
    }
}
