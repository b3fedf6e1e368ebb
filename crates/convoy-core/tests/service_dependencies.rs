//! Dependency edges through the control plane: cycle rejection,
//! add/remove symmetry and layering properties.

mod common;

use std::collections::{BTreeMap, BTreeSet};

use common::*;
use convoy_core::{ConvoyError, DependencyGraph, GraphError};
use convoy_state::{DependencyKind, ServiceId};

fn reachability(graph: &DependencyGraph, services: &[&str]) -> BTreeMap<String, BTreeSet<ServiceId>> {
    services
        .iter()
        .map(|s| (s.to_string(), graph.reachable_from(&sid(s))))
        .collect()
}

/// Every selected service lands in exactly one layer, after all of its
/// selected dependencies.
fn assert_layering(graph: &DependencyGraph, selected: &[ServiceId], layers: &[Vec<ServiceId>]) {
    let mut layer_of = BTreeMap::new();
    for (index, layer) in layers.iter().enumerate() {
        assert!(!layer.is_empty());
        let mut sorted = layer.clone();
        sorted.sort();
        assert_eq!(&sorted, layer, "layer {index} is not sorted");
        for service in layer {
            assert!(layer_of.insert(service.clone(), index).is_none(), "{service} placed twice");
        }
    }
    let expected: BTreeSet<&ServiceId> = selected.iter().collect();
    let placed: BTreeSet<&ServiceId> = layer_of.keys().collect();
    assert_eq!(placed, expected);

    for (from, to, _) in graph.edges() {
        if let (Some(a), Some(b)) = (layer_of.get(&from), layer_of.get(&to)) {
            assert!(a > b, "{from} (layer {a}) must come after {to} (layer {b})");
        }
    }
}

#[tokio::test]
async fn test_reverse_edge_is_a_cycle_and_changes_nothing() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    for name in ["api", "worker", "db"] {
        add_service(&stores, name).await;
    }
    cp.add_service_dependency(&sid("api"), &sid("db"), None)
        .await
        .unwrap();
    cp.add_service_dependency(&sid("worker"), &sid("db"), None)
        .await
        .unwrap();

    let err = cp
        .add_service_dependency(&sid("db"), &sid("api"), None)
        .await
        .unwrap_err();

    match err {
        ConvoyError::Graph(GraphError::Cycle { services }) => {
            assert_eq!(services, vec![sid("db"), sid("api"), sid("db")]);
        }
        other => panic!("expected a cycle, got {other}"),
    }
    let graph = cp.dependencies().snapshot().await;
    assert_eq!(graph.edge_count(), 2);
    assert!(!graph.contains_edge(&sid("db"), &sid("api")));
    assert_eq!(stores.dependencies.list_dependencies().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_self_dependency_rejected() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    add_service(&stores, "api").await;

    let err = cp
        .add_service_dependency(&sid("api"), &sid("api"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConvoyError::Graph(GraphError::SelfDependency { .. })));
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_dependency_type_is_parsed_at_the_boundary() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    add_service(&stores, "api").await;
    add_service(&stores, "migrations").await;

    let err = cp
        .add_service_dependency(&sid("api"), &sid("migrations"), Some("optional"))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let edge = cp
        .add_service_dependency(&sid("api"), &sid("migrations"), Some("build"))
        .await
        .unwrap();
    assert_eq!(edge.kind, DependencyKind::Build);
    assert_eq!(
        cp.dependencies().dependencies_of(&sid("api")).await,
        vec![(sid("migrations"), DependencyKind::Build)]
    );
}

#[tokio::test]
async fn test_add_then_remove_restores_reachability() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    let names = ["web", "api", "auth", "db", "cache"];
    for name in names {
        add_service(&stores, name).await;
    }
    for (from, to) in [("web", "api"), ("api", "db"), ("auth", "db")] {
        cp.add_service_dependency(&sid(from), &sid(to), None)
            .await
            .unwrap();
    }
    let before = reachability(&cp.dependencies().snapshot().await, &names);

    cp.add_service_dependency(&sid("api"), &sid("auth"), None)
        .await
        .unwrap();
    let during = reachability(&cp.dependencies().snapshot().await, &names);
    assert!(during["web"].contains(&sid("auth")));

    assert!(cp
        .remove_service_dependency(&sid("api"), &sid("auth"))
        .await
        .unwrap());
    assert!(!cp
        .remove_service_dependency(&sid("api"), &sid("auth"))
        .await
        .unwrap());

    let after = reachability(&cp.dependencies().snapshot().await, &names);
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_layers_respect_every_edge() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    let names = ["gateway", "web", "api", "auth", "billing", "db", "queue", "cache"];
    for name in names {
        add_service(&stores, name).await;
    }
    for (from, to) in [
        ("gateway", "web"),
        ("gateway", "api"),
        ("web", "api"),
        ("api", "auth"),
        ("api", "billing"),
        ("billing", "db"),
        ("billing", "queue"),
        ("auth", "db"),
        ("web", "cache"),
    ] {
        cp.add_service_dependency(&sid(from), &sid(to), None)
            .await
            .unwrap();
    }
    let graph = cp.dependencies().snapshot().await;

    let all: Vec<ServiceId> = names.iter().map(|s| sid(s)).collect();
    let layers = graph.topological_layers(&all).unwrap();
    assert_layering(&graph, &all, &layers);
    assert_eq!(layers[0], vec![sid("cache"), sid("db"), sid("queue")]);

    for subset in [
        vec!["gateway", "db"],
        vec!["api", "billing", "queue"],
        vec!["web", "auth", "cache"],
    ] {
        let selected: Vec<ServiceId> = subset.iter().map(|s| sid(s)).collect();
        let layers = graph.topological_layers(&selected).unwrap();
        assert_layering(&graph, &selected, &layers);
    }
}

#[tokio::test]
async fn test_registry_reloads_persisted_edges() {
    let stores = stores().await;
    let cp = control_plane(&stores, ScriptedReconciler::new()).await;
    for name in ["api", "db"] {
        add_service(&stores, name).await;
    }
    cp.add_service_dependency(&sid("api"), &sid("db"), None)
        .await
        .unwrap();
    drop(cp);

    let reloaded = control_plane(&stores, ScriptedReconciler::new()).await;
    assert_eq!(
        reloaded.dependencies().dependents_of(&sid("db")).await,
        vec![sid("api")]
    );
}
