//! Service dependency graph and topological layering.
//!
//! An edge `A → B` means "A depends on B": B must be deployed before A.
//! Edges are validated on insertion, so the graph is acyclic at every point
//! in time. Layering runs Kahn's algorithm on the subgraph induced by a
//! service selection.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use convoy_state::{DependencyKind, ServiceDependency, ServiceId};

use crate::error::GraphError;

/// Directed dependency graph over service ids.
///
/// Both adjacency directions are kept in ordered maps so every traversal
/// is deterministic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// `service → {dependency → kind}`
    upstream: BTreeMap<ServiceId, BTreeMap<ServiceId, DependencyKind>>,
    /// `dependency → {dependent, ...}`
    downstream: BTreeMap<ServiceId, BTreeSet<ServiceId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a graph from persisted edges, validating each one.
    pub fn from_edges<'a>(
        edges: impl IntoIterator<Item = &'a ServiceDependency>,
    ) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for edge in edges {
            graph.add_edge(
                edge.service_id.clone(),
                edge.depends_on_service_id.clone(),
                edge.kind,
            )?;
        }
        Ok(graph)
    }

    /// Add `from → to` ("`from` depends on `to`").
    ///
    /// Returns `Ok(false)` if the edge already exists (its kind is left as is).
    /// Returns [`GraphError::SelfDependency`] for `from == to` and
    /// [`GraphError::Cycle`] if `to` already reaches `from`; in both cases
    /// the graph is unchanged.
    pub fn add_edge(
        &mut self,
        from: ServiceId,
        to: ServiceId,
        kind: DependencyKind,
    ) -> Result<bool, GraphError> {
        if from == to {
            return Err(GraphError::SelfDependency { service: from });
        }
        if self.contains_edge(&from, &to) {
            return Ok(false);
        }
        if let Some(path) = self.path_between(&to, &from) {
            let mut services = Vec::with_capacity(path.len() + 1);
            services.push(from);
            services.extend(path);
            return Err(GraphError::Cycle { services });
        }

        self.downstream
            .entry(to.clone())
            .or_default()
            .insert(from.clone());
        self.upstream.entry(from).or_default().insert(to, kind);
        Ok(true)
    }

    /// Remove `from → to`. Returns whether an edge was removed.
    pub fn remove_edge(&mut self, from: &ServiceId, to: &ServiceId) -> bool {
        let removed = match self.upstream.get_mut(from) {
            Some(deps) => deps.remove(to).is_some(),
            None => false,
        };
        if !removed {
            return false;
        }
        if self.upstream.get(from).is_some_and(BTreeMap::is_empty) {
            self.upstream.remove(from);
        }
        if let Some(dependents) = self.downstream.get_mut(to) {
            dependents.remove(from);
            if dependents.is_empty() {
                self.downstream.remove(to);
            }
        }
        true
    }

    pub fn contains_edge(&self, from: &ServiceId, to: &ServiceId) -> bool {
        self.upstream
            .get(from)
            .is_some_and(|deps| deps.contains_key(to))
    }

    pub fn edge_count(&self) -> usize {
        self.upstream.values().map(BTreeMap::len).sum()
    }

    /// Every edge as `(service, depends_on, kind)`, ordered.
    pub fn edges(&self) -> Vec<(ServiceId, ServiceId, DependencyKind)> {
        self.upstream
            .iter()
            .flat_map(|(from, deps)| {
                deps.iter()
                    .map(move |(to, kind)| (from.clone(), to.clone(), *kind))
            })
            .collect()
    }

    /// Direct dependencies of `service`.
    pub fn dependencies_of(&self, service: &ServiceId) -> Vec<(ServiceId, DependencyKind)> {
        self.upstream
            .get(service)
            .into_iter()
            .flatten()
            .map(|(id, kind)| (id.clone(), *kind))
            .collect()
    }

    /// Direct dependents of `service`.
    pub fn dependents_of(&self, service: &ServiceId) -> Vec<ServiceId> {
        self.downstream
            .get(service)
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// All services that depend on `service`, directly or transitively.
    pub fn transitive_dependents(&self, service: &ServiceId) -> BTreeSet<ServiceId> {
        Self::bfs(service, |id| self.downstream.get(id).into_iter().flatten())
    }

    /// All services `service` depends on, directly or transitively.
    pub fn reachable_from(&self, service: &ServiceId) -> BTreeSet<ServiceId> {
        Self::bfs(service, |id| self.upstream.get(id).into_iter().flat_map(|m| m.keys()))
    }

    /// Partition `services` into dependency layers.
    ///
    /// Only edges between selected services count; a dependency outside the
    /// selection is ignored, so its dependent becomes a root of this order.
    /// Layer `k` holds every remaining service with no remaining dependency,
    /// sorted by id. Returns [`GraphError::Cycle`] with the unassigned
    /// services if peeling stalls.
    pub fn topological_layers(
        &self,
        services: &[ServiceId],
    ) -> Result<Vec<Vec<ServiceId>>, GraphError> {
        let selected: BTreeSet<&ServiceId> = services.iter().collect();

        let mut in_degree: BTreeMap<&ServiceId, usize> = selected
            .iter()
            .map(|&id| {
                let deg = self
                    .upstream
                    .get(id)
                    .map(|deps| deps.keys().filter(|d| selected.contains(d)).count())
                    .unwrap_or(0);
                (id, deg)
            })
            .collect();

        let mut layers = Vec::new();
        while !in_degree.is_empty() {
            let layer: Vec<&ServiceId> = in_degree
                .iter()
                .filter(|(_, &deg)| deg == 0)
                .map(|(&id, _)| id)
                .collect();

            if layer.is_empty() {
                return Err(GraphError::Cycle {
                    services: in_degree.keys().map(|&id| id.clone()).collect(),
                });
            }

            for id in &layer {
                in_degree.remove(id);
                for dependent in self.downstream.get(*id).into_iter().flatten() {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                    }
                }
            }
            layers.push(layer.into_iter().cloned().collect());
        }

        Ok(layers)
    }

    /// DFS along dependency edges from `start` looking for `target`.
    /// Returns the path `start, …, target` if one exists.
    fn path_between(&self, start: &ServiceId, target: &ServiceId) -> Option<Vec<ServiceId>> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();
        if self.dfs(start, target, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs<'a>(
        &'a self,
        node: &'a ServiceId,
        target: &ServiceId,
        visited: &mut BTreeSet<&'a ServiceId>,
        path: &mut Vec<ServiceId>,
    ) -> bool {
        if !visited.insert(node) {
            return false;
        }
        path.push(node.clone());
        if node == target {
            return true;
        }
        for dep in self.upstream.get(node).into_iter().flat_map(|m| m.keys()) {
            if self.dfs(dep, target, visited, path) {
                return true;
            }
        }
        path.pop();
        false
    }

    fn bfs<'a, I>(start: &ServiceId, next: impl Fn(&ServiceId) -> I) -> BTreeSet<ServiceId>
    where
        I: Iterator<Item = &'a ServiceId>,
    {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([start.clone()]);
        while let Some(current) = queue.pop_front() {
            for id in next(&current) {
                if id != start && visited.insert(id.clone()) {
                    queue.push_back(id.clone());
                }
            }
        }
        visited
    }
}
