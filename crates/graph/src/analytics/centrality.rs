//! Centrality measures: degree, betweenness (Brandes), closeness,
//! eigenvector (power iteration) and PageRank.

use super::{check_cancelled, AnalysisGraph};
use crate::error::Result;
use crate::model::Subgraph;
use aegis_core::config::AnalyticsConfig;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-entity centrality scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralityScore {
    pub entity_id: Uuid,
    pub degree: f64,
    pub betweenness: f64,
    pub closeness: f64,
    pub eigenvector: f64,
    pub pagerank: f64,
}

/// Distributional summary of one measure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributionSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

impl DistributionSummary {
    fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            stddev: variance.sqrt(),
        }
    }
}

/// Centrality report: per-entity scores ranked by PageRank descending and
/// distributional summaries per measure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralityReport {
    pub scores: Vec<CentralityScore>,
    pub summaries: HashMap<String, DistributionSummary>,
    pub processing_time_ms: u64,
}

pub fn compute(
    subgraph: &Subgraph,
    config: &AnalyticsConfig,
    cancel: &CancellationToken,
) -> Result<CentralityReport> {
    let started = Instant::now();
    let analysis = AnalysisGraph::from_subgraph(subgraph);
    let n = analysis.node_count();

    let degree = degree_centrality(&analysis);
    check_cancelled(cancel, "analytics.centrality")?;
    let betweenness = betweenness_centrality(&analysis, cancel)?;
    let closeness = closeness_centrality(&analysis, cancel)?;
    let eigenvector = eigenvector_centrality(&analysis, config, cancel)?;
    let pagerank = pagerank(&analysis, config, cancel)?;

    let mut scores: Vec<CentralityScore> = (0..n)
        .map(|i| {
            let node = NodeIndex::new(i);
            CentralityScore {
                entity_id: analysis.graph[node],
                degree: degree[i],
                betweenness: betweenness[i],
                closeness: closeness[i],
                eigenvector: eigenvector[i],
                pagerank: pagerank[i],
            }
        })
        .collect();
    scores.sort_by(|a, b| {
        b.pagerank
            .total_cmp(&a.pagerank)
            .then_with(|| a.entity_id.to_string().cmp(&b.entity_id.to_string()))
    });

    let mut summaries = HashMap::new();
    summaries.insert("degree".to_string(), DistributionSummary::of(&degree));
    summaries.insert("betweenness".to_string(), DistributionSummary::of(&betweenness));
    summaries.insert("closeness".to_string(), DistributionSummary::of(&closeness));
    summaries.insert("eigenvector".to_string(), DistributionSummary::of(&eigenvector));
    summaries.insert("pagerank".to_string(), DistributionSummary::of(&pagerank));

    Ok(CentralityReport {
        scores,
        summaries,
        processing_time_ms: started.elapsed().as_millis() as u64,
    })
}

fn degree_centrality(analysis: &AnalysisGraph) -> Vec<f64> {
    analysis
        .graph
        .node_indices()
        .map(|node| analysis.undirected_neighbors(node).len() as f64)
        .collect()
}

/// Brandes' algorithm over the undirected, unweighted view.
fn betweenness_centrality(
    analysis: &AnalysisGraph,
    cancel: &CancellationToken,
) -> Result<Vec<f64>> {
    let n = analysis.node_count();
    let mut centrality = vec![0.0; n];

    for source in analysis.graph.node_indices() {
        check_cancelled(cancel, "analytics.betweenness")?;

        let mut stack: Vec<NodeIndex> = Vec::new();
        let mut predecessors: Vec<Vec<NodeIndex>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0_f64; n];
        let mut distance = vec![-1_i64; n];
        sigma[source.index()] = 1.0;
        distance[source.index()] = 0;

        let mut queue = VecDeque::new();
        queue.push_back(source);
        while let Some(v) = queue.pop_front() {
            stack.push(v);
            for w in analysis.undirected_neighbors(v) {
                if distance[w.index()] < 0 {
                    distance[w.index()] = distance[v.index()] + 1;
                    queue.push_back(w);
                }
                if distance[w.index()] == distance[v.index()] + 1 {
                    sigma[w.index()] += sigma[v.index()];
                    predecessors[w.index()].push(v);
                }
            }
        }

        let mut delta = vec![0.0_f64; n];
        while let Some(w) = stack.pop() {
            for &v in &predecessors[w.index()] {
                delta[v.index()] +=
                    (sigma[v.index()] / sigma[w.index()]) * (1.0 + delta[w.index()]);
            }
            if w != source {
                centrality[w.index()] += delta[w.index()];
            }
        }
    }

    // Undirected pairs are visited twice.
    for value in &mut centrality {
        *value /= 2.0;
    }
    Ok(centrality)
}

fn closeness_centrality(
    analysis: &AnalysisGraph,
    cancel: &CancellationToken,
) -> Result<Vec<f64>> {
    let n = analysis.node_count();
    let mut centrality = vec![0.0; n];

    for source in analysis.graph.node_indices() {
        check_cancelled(cancel, "analytics.closeness")?;
        let distances = bfs_distances(analysis, source);
        let reachable: Vec<i64> = distances.iter().copied().filter(|d| *d > 0).collect();
        if reachable.is_empty() {
            continue;
        }
        let sum: i64 = reachable.iter().sum();
        let r = reachable.len() as f64;
        // Wasserman-Faust correction for disconnected graphs.
        centrality[source.index()] = if n > 1 {
            (r / (n as f64 - 1.0)) * (r / sum as f64)
        } else {
            0.0
        };
    }
    Ok(centrality)
}

fn bfs_distances(analysis: &AnalysisGraph, source: NodeIndex) -> Vec<i64> {
    let mut distance = vec![-1_i64; analysis.node_count()];
    distance[source.index()] = 0;
    let mut queue = VecDeque::new();
    queue.push_back(source);
    while let Some(v) = queue.pop_front() {
        for w in analysis.undirected_neighbors(v) {
            if distance[w.index()] < 0 {
                distance[w.index()] = distance[v.index()] + 1;
                queue.push_back(w);
            }
        }
    }
    distance
}

fn eigenvector_centrality(
    analysis: &AnalysisGraph,
    config: &AnalyticsConfig,
    cancel: &CancellationToken,
) -> Result<Vec<f64>> {
    let n = analysis.node_count();
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut scores = vec![1.0 / (n as f64).sqrt(); n];

    for _ in 0..config.eigenvector_max_iterations {
        check_cancelled(cancel, "analytics.eigenvector")?;
        let mut next = vec![0.0; n];
        for v in analysis.graph.node_indices() {
            for w in analysis.undirected_neighbors(v) {
                next[v.index()] += scores[w.index()];
            }
        }
        let norm = next.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm == 0.0 {
            return Ok(next);
        }
        for value in &mut next {
            *value /= norm;
        }
        let delta: f64 = next
            .iter()
            .zip(scores.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        scores = next;
        if delta < config.convergence_tolerance {
            break;
        }
    }
    Ok(scores)
}

pub(crate) fn pagerank(
    analysis: &AnalysisGraph,
    config: &AnalyticsConfig,
    cancel: &CancellationToken,
) -> Result<Vec<f64>> {
    personalized_pagerank(analysis, config, None, cancel)
}

/// PageRank with optional personalization: when `seeds` is set, teleport
/// mass goes only to the seed nodes.
pub(crate) fn personalized_pagerank(
    analysis: &AnalysisGraph,
    config: &AnalyticsConfig,
    seeds: Option<&[NodeIndex]>,
    cancel: &CancellationToken,
) -> Result<Vec<f64>> {
    let n = analysis.node_count();
    if n == 0 {
        return Ok(Vec::new());
    }
    let damping = config.pagerank_damping;

    let teleport: Vec<f64> = match seeds {
        Some(seeds) if !seeds.is_empty() => {
            let mut t = vec![0.0; n];
            let share = 1.0 / seeds.len() as f64;
            for seed in seeds {
                t[seed.index()] = share;
            }
            t
        }
        _ => vec![1.0 / n as f64; n],
    };

    let out_degree: Vec<usize> = analysis
        .graph
        .node_indices()
        .map(|v| analysis.graph.neighbors(v).count())
        .collect();

    let mut ranks = teleport.clone();
    for _ in 0..config.pagerank_max_iterations {
        check_cancelled(cancel, "analytics.pagerank")?;
        let mut next = vec![0.0; n];

        let mut dangling_mass = 0.0;
        for v in analysis.graph.node_indices() {
            let rank = ranks[v.index()];
            if out_degree[v.index()] == 0 {
                dangling_mass += rank;
                continue;
            }
            let share = rank / out_degree[v.index()] as f64;
            for w in analysis.graph.neighbors(v) {
                next[w.index()] += share;
            }
        }

        let mut delta = 0.0;
        for i in 0..n {
            let value =
                (1.0 - damping) * teleport[i] + damping * (next[i] + dangling_mass * teleport[i]);
            delta += (value - ranks[i]).abs();
            next[i] = value;
        }
        ranks = next;
        if delta < config.convergence_tolerance {
            break;
        }
    }
    Ok(ranks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, GraphEntity, Relationship, RelationshipType};

    fn star_graph() -> Subgraph {
        // Hub 1 connected to leaves 2..=5.
        let entities = (1..=5u128)
            .map(|n| GraphEntity::new(Uuid::from_u128(n), EntityType::Account))
            .collect();
        let relationships = (2..=5u128)
            .map(|n| {
                Relationship::new(
                    RelationshipType::TransferredTo,
                    Uuid::from_u128(n),
                    Uuid::from_u128(1),
                )
            })
            .collect();
        Subgraph {
            entities,
            relationships,
        }
    }

    #[test]
    fn hub_dominates_every_measure() {
        let report = compute(
            &star_graph(),
            &AnalyticsConfig::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        let hub = Uuid::from_u128(1);
        let top = &report.scores[0];
        assert_eq!(top.entity_id, hub);
        assert_eq!(top.degree, 4.0);
        assert!(top.betweenness > 0.0);
        assert!(report.scores[1..].iter().all(|s| s.betweenness == 0.0));
        assert!(top.pagerank > report.scores[1].pagerank);
    }

    #[test]
    fn summaries_track_distribution() {
        let report = compute(
            &star_graph(),
            &AnalyticsConfig::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        let degree = &report.summaries["degree"];
        assert_eq!(degree.max, 4.0);
        assert_eq!(degree.min, 1.0);
        assert!((degree.mean - 1.6).abs() < 1e-9);
    }

    #[test]
    fn cancellation_stops_computation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = compute(&star_graph(), &AnalyticsConfig::default(), &cancel).unwrap_err();
        assert!(matches!(err, crate::error::GraphError::Cancelled { .. }));
    }
}
