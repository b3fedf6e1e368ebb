//! Persisted, concurrency-safe view of the service dependency graph.
//!
//! Readers (planning, execution) take a shared lock; mutations take the
//! single writer lock for the whole validate → persist → apply sequence,
//! so the in-memory graph and the store never disagree about an edge.

use std::collections::BTreeSet;
use std::sync::Arc;

use convoy_state::{
    DependencyKind, DependencyStore, ServiceCatalog, ServiceDependency, ServiceId,
};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::error::{ConvoyError, ConvoyResult, GraphError};
use crate::graph::DependencyGraph;

pub struct DependencyRegistry {
    graph: RwLock<DependencyGraph>,
    store: Arc<dyn DependencyStore>,
    services: Arc<dyn ServiceCatalog>,
}

impl DependencyRegistry {
    /// Load every persisted edge. Fails if the stored edge set is cyclic.
    pub async fn load(
        store: Arc<dyn DependencyStore>,
        services: Arc<dyn ServiceCatalog>,
    ) -> ConvoyResult<Self> {
        let edges = store.list_dependencies().await?;
        let graph = DependencyGraph::from_edges(&edges)?;
        info!(edges = graph.edge_count(), "dependency graph loaded");
        Ok(Self {
            graph: RwLock::new(graph),
            store,
            services,
        })
    }

    /// Record that `service` depends on `depends_on`.
    ///
    /// Rejected without any write when either service is unknown, the edge
    /// is a self-loop, already exists, or would close a cycle.
    #[instrument(skip_all, fields(service = %service, depends_on = %depends_on))]
    pub async fn add_dependency(
        &self,
        service: &ServiceId,
        depends_on: &ServiceId,
        kind: DependencyKind,
    ) -> ConvoyResult<ServiceDependency> {
        if service == depends_on {
            return Err(GraphError::SelfDependency {
                service: service.clone(),
            }
            .into());
        }
        self.ensure_known(service).await?;
        self.ensure_known(depends_on).await?;

        let mut graph = self.graph.write().await;
        if !graph.add_edge(service.clone(), depends_on.clone(), kind)? {
            return Err(ConvoyError::Validation(format!(
                "dependency {service} -> {depends_on} already exists"
            )));
        }

        let record = ServiceDependency::new(service.clone(), depends_on.clone(), kind);
        if let Err(e) = self.store.create_dependency(record.clone()).await {
            graph.remove_edge(service, depends_on);
            return Err(e.into());
        }
        debug!(kind = %kind, "dependency added");
        Ok(record)
    }

    /// Drop the edge if present. Returns whether anything was removed.
    #[instrument(skip_all, fields(service = %service, depends_on = %depends_on))]
    pub async fn remove_dependency(
        &self,
        service: &ServiceId,
        depends_on: &ServiceId,
    ) -> ConvoyResult<bool> {
        let mut graph = self.graph.write().await;
        let stored = self.store.delete_dependency(service, depends_on).await?;
        let in_graph = graph.remove_edge(service, depends_on);
        if stored || in_graph {
            debug!("dependency removed");
        }
        Ok(stored || in_graph)
    }

    pub async fn topological_layers(
        &self,
        services: &[ServiceId],
    ) -> Result<Vec<Vec<ServiceId>>, GraphError> {
        self.graph.read().await.topological_layers(services)
    }

    pub async fn transitive_dependents(&self, service: &ServiceId) -> BTreeSet<ServiceId> {
        self.graph.read().await.transitive_dependents(service)
    }

    pub async fn dependencies_of(&self, service: &ServiceId) -> Vec<(ServiceId, DependencyKind)> {
        self.graph.read().await.dependencies_of(service)
    }

    pub async fn dependents_of(&self, service: &ServiceId) -> Vec<ServiceId> {
        self.graph.read().await.dependents_of(service)
    }

    /// Point-in-time copy of the whole graph.
    pub async fn snapshot(&self) -> DependencyGraph {
        self.graph.read().await.clone()
    }

    async fn ensure_known(&self, service: &ServiceId) -> ConvoyResult<()> {
        match self.services.get_service(service).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Err(ConvoyError::UnknownService {
                service: service.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
