//! # Graph Analytics
//!
//! Centrality, community detection, path analysis, influence propagation
//! and whole-network metrics over a materialized projection. Every public
//! call is cancellable: computation loops poll the token and return a
//! `Cancelled` error promptly, releasing the projection data.

pub mod centrality;
pub mod community;
pub mod influence;
pub mod network;
pub mod paths;

pub use centrality::{CentralityReport, CentralityScore, DistributionSummary};
pub use community::{Community, CommunityAlgorithm, CommunityParams, CommunityReport};
pub use influence::{InfluenceParams, InfluenceReport};
pub use network::NetworkMetrics;
pub use paths::{PathAnalysisReport, PathQuery};

use crate::error::{GraphError, Result};
use crate::model::Subgraph;
use crate::store::GraphStore;
use aegis_core::config::AnalyticsConfig;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What slice of the graph an analysis runs over.
#[derive(Debug, Clone)]
pub enum AnalysisScope {
    /// A named projection created via `GraphStore::project`.
    Projection(String),
    /// The induced subgraph of `ids` expanded by `depth` hops.
    Entities { ids: Vec<Uuid>, depth: usize },
}

/// Petgraph view over a subgraph with stable node ordering (sorted by
/// entity id), so iteration-dependent results are reproducible.
pub struct AnalysisGraph {
    pub graph: DiGraph<Uuid, f64>,
    pub index: HashMap<Uuid, NodeIndex>,
}

impl AnalysisGraph {
    pub fn from_subgraph(subgraph: &Subgraph) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        let mut ordered: Vec<Uuid> = subgraph.entities.iter().map(|e| e.id).collect();
        ordered.sort_by_key(|id| id.to_string());
        for id in ordered {
            let node = graph.add_node(id);
            index.insert(id, node);
        }

        let mut edges: Vec<_> = subgraph.relationships.iter().collect();
        edges.sort_by_key(|r| r.id.to_string());
        for rel in edges {
            if let (Some(&source), Some(&target)) =
                (index.get(&rel.source_id), index.get(&rel.target_id))
            {
                graph.add_edge(source, target, rel.weight());
            }
        }

        Self { graph, index }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Node ids in the stable analysis order.
    pub fn ordered_ids(&self) -> Vec<Uuid> {
        self.graph.node_indices().map(|n| self.graph[n]).collect()
    }

    /// Undirected neighbor indices, deduplicated, in stable order.
    pub fn undirected_neighbors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self
            .graph
            .neighbors_undirected(node)
            .collect();
        neighbors.sort();
        neighbors.dedup();
        neighbors
    }
}

/// Poll the cancellation token inside computation loops.
pub(crate) fn check_cancelled(cancel: &CancellationToken, operation: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(GraphError::Cancelled {
            operation: operation.to_string(),
        });
    }
    Ok(())
}

/// Facade over the per-algorithm modules.
pub struct AnalyticsEngine {
    store: Arc<dyn GraphStore>,
    config: AnalyticsConfig,
}

impl AnalyticsEngine {
    pub fn new(store: Arc<dyn GraphStore>, config: AnalyticsConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    pub(crate) async fn materialize(&self, scope: &AnalysisScope) -> Result<Subgraph> {
        match scope {
            AnalysisScope::Projection(name) => self.store.projection(name).await,
            AnalysisScope::Entities { ids, depth } => self.store.subgraph(ids, *depth).await,
        }
    }

    /// Centrality measures with distributional summaries.
    pub async fn centrality(
        &self,
        scope: &AnalysisScope,
        cancel: &CancellationToken,
    ) -> Result<CentralityReport> {
        let subgraph = self.materialize(scope).await?;
        centrality::compute(&subgraph, &self.config, cancel)
    }

    /// Community detection with the requested algorithm.
    pub async fn communities(
        &self,
        scope: &AnalysisScope,
        algorithm: CommunityAlgorithm,
        params: &CommunityParams,
        cancel: &CancellationToken,
    ) -> Result<CommunityReport> {
        let subgraph = self.materialize(scope).await?;
        community::compute(&subgraph, algorithm, params, cancel)
    }

    /// Shortest path and bounded all-paths analysis.
    pub async fn analyze_paths(
        &self,
        query: &PathQuery,
        cancel: &CancellationToken,
    ) -> Result<PathAnalysisReport> {
        paths::compute(self.store.as_ref(), &self.config, query, cancel).await
    }

    /// Personalized PageRank influence from the supplied seed entities.
    pub async fn influence(
        &self,
        scope: &AnalysisScope,
        params: &InfluenceParams,
        cancel: &CancellationToken,
    ) -> Result<InfluenceReport> {
        let subgraph = self.materialize(scope).await?;
        influence::compute(&subgraph, &self.config, params, cancel)
    }

    /// Components, clustering, density, average path length.
    pub async fn network_metrics(
        &self,
        scope: &AnalysisScope,
        cancel: &CancellationToken,
    ) -> Result<NetworkMetrics> {
        let subgraph = self.materialize(scope).await?;
        network::compute(&subgraph, cancel)
    }
}
