//! Whole-network metrics: weakly-connected components, clustering
//! coefficient, average path length, density.

use super::{check_cancelled, AnalysisGraph};
use crate::error::Result;
use crate::model::Subgraph;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub node_count: usize,
    pub edge_count: usize,
    pub density: f64,
    pub component_count: usize,
    pub giant_component_size: usize,
    /// A component holding more than half the nodes.
    pub has_giant_component: bool,
    /// Global average of the local clustering coefficients.
    pub clustering_coefficient: f64,
    /// Mean shortest-path length over connected pairs.
    pub average_path_length: f64,
    pub processing_time_ms: u64,
}

pub fn compute(subgraph: &Subgraph, cancel: &CancellationToken) -> Result<NetworkMetrics> {
    let started = Instant::now();
    let analysis = AnalysisGraph::from_subgraph(subgraph);
    let n = analysis.node_count();
    let m = analysis.edge_count();

    let density = if n > 1 {
        m as f64 / (n as f64 * (n as f64 - 1.0))
    } else {
        0.0
    };

    let components = weakly_connected_components(&analysis, cancel)?;
    let giant_component_size = components.iter().copied().max().unwrap_or(0);
    let has_giant_component = n > 0 && giant_component_size * 2 > n;

    let clustering_coefficient = clustering(&analysis, cancel)?;
    let average_path_length = average_path_length(&analysis, cancel)?;

    Ok(NetworkMetrics {
        node_count: n,
        edge_count: m,
        density,
        component_count: components.len(),
        giant_component_size,
        has_giant_component,
        clustering_coefficient,
        average_path_length,
        processing_time_ms: started.elapsed().as_millis() as u64,
    })
}

/// Sizes of the weakly-connected components.
fn weakly_connected_components(
    analysis: &AnalysisGraph,
    cancel: &CancellationToken,
) -> Result<Vec<usize>> {
    let n = analysis.node_count();
    let mut visited = vec![false; n];
    let mut sizes = Vec::new();

    for start in analysis.graph.node_indices() {
        if visited[start.index()] {
            continue;
        }
        check_cancelled(cancel, "analytics.components")?;
        let mut size = 0;
        let mut queue = VecDeque::new();
        queue.push_back(start);
        visited[start.index()] = true;
        while let Some(node) = queue.pop_front() {
            size += 1;
            for neighbor in analysis.undirected_neighbors(node) {
                if !visited[neighbor.index()] {
                    visited[neighbor.index()] = true;
                    queue.push_back(neighbor);
                }
            }
        }
        sizes.push(size);
    }
    Ok(sizes)
}

fn clustering(analysis: &AnalysisGraph, cancel: &CancellationToken) -> Result<f64> {
    let n = analysis.node_count();
    if n == 0 {
        return Ok(0.0);
    }
    let mut total = 0.0;
    for node in analysis.graph.node_indices() {
        check_cancelled(cancel, "analytics.clustering")?;
        let neighbors = analysis.undirected_neighbors(node);
        let k = neighbors.len();
        if k < 2 {
            continue;
        }
        let mut links = 0;
        for (i, &a) in neighbors.iter().enumerate() {
            for &b in &neighbors[i + 1..] {
                if analysis.undirected_neighbors(a).contains(&b) {
                    links += 1;
                }
            }
        }
        total += 2.0 * links as f64 / (k as f64 * (k as f64 - 1.0));
    }
    Ok(total / n as f64)
}

fn average_path_length(analysis: &AnalysisGraph, cancel: &CancellationToken) -> Result<f64> {
    let n = analysis.node_count();
    let mut pair_count = 0u64;
    let mut distance_sum = 0u64;

    for source in analysis.graph.node_indices() {
        check_cancelled(cancel, "analytics.path_length")?;
        let mut distance: Vec<i64> = vec![-1; n];
        distance[source.index()] = 0;
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        queue.push_back(source);
        while let Some(node) = queue.pop_front() {
            for neighbor in analysis.undirected_neighbors(node) {
                if distance[neighbor.index()] < 0 {
                    distance[neighbor.index()] = distance[node.index()] + 1;
                    queue.push_back(neighbor);
                }
            }
        }
        for d in distance.iter().filter(|d| **d > 0) {
            pair_count += 1;
            distance_sum += *d as u64;
        }
    }

    Ok(if pair_count == 0 {
        0.0
    } else {
        distance_sum as f64 / pair_count as f64
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, GraphEntity, Relationship, RelationshipType};
    use uuid::Uuid;

    fn triangle_plus_isolate() -> Subgraph {
        let entities = (1..=4u128)
            .map(|n| GraphEntity::new(Uuid::from_u128(n), EntityType::Account))
            .collect();
        let relationships = vec![
            Relationship::new(
                RelationshipType::TransferredTo,
                Uuid::from_u128(1),
                Uuid::from_u128(2),
            ),
            Relationship::new(
                RelationshipType::TransferredTo,
                Uuid::from_u128(2),
                Uuid::from_u128(3),
            ),
            Relationship::new(
                RelationshipType::TransferredTo,
                Uuid::from_u128(3),
                Uuid::from_u128(1),
            ),
        ];
        Subgraph {
            entities,
            relationships,
        }
    }

    #[test]
    fn metrics_for_triangle_with_isolate() {
        let metrics = compute(&triangle_plus_isolate(), &CancellationToken::new()).unwrap();

        assert_eq!(metrics.node_count, 4);
        assert_eq!(metrics.edge_count, 3);
        assert_eq!(metrics.component_count, 2);
        assert_eq!(metrics.giant_component_size, 3);
        assert!(metrics.has_giant_component);
        // Triangle nodes are fully clustered; the isolate contributes 0.
        assert!((metrics.clustering_coefficient - 0.75).abs() < 1e-9);
        assert_eq!(metrics.average_path_length, 1.0);
    }

    #[test]
    fn empty_graph_yields_zeroes() {
        let metrics = compute(&Subgraph::default(), &CancellationToken::new()).unwrap();
        assert_eq!(metrics.node_count, 0);
        assert_eq!(metrics.density, 0.0);
        assert_eq!(metrics.component_count, 0);
    }
}
