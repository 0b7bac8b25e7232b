//! Community detection: Louvain, label propagation, and Leiden-style
//! refinement, with modularity scoring.

use super::{check_cancelled, AnalysisGraph};
use crate::error::Result;
use crate::model::Subgraph;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunityAlgorithm {
    Louvain,
    LabelPropagation,
    Leiden,
}

/// Algorithm parameters supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityParams {
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Modularity resolution; >1 favors smaller communities.
    pub resolution: f64,
}

impl Default for CommunityParams {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tolerance: 1e-6,
            resolution: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    pub id: usize,
    pub entity_ids: Vec<Uuid>,
}

impl Community {
    pub fn size(&self) -> usize {
        self.entity_ids.len()
    }
}

/// Communities ordered by size descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityReport {
    pub algorithm: CommunityAlgorithm,
    pub communities: Vec<Community>,
    pub modularity: f64,
    pub largest: usize,
    pub smallest: usize,
    pub processing_time_ms: u64,
}

pub fn compute(
    subgraph: &Subgraph,
    algorithm: CommunityAlgorithm,
    params: &CommunityParams,
    cancel: &CancellationToken,
) -> Result<CommunityReport> {
    let started = Instant::now();
    let analysis = AnalysisGraph::from_subgraph(subgraph);
    let view = UndirectedView::build(&analysis);

    let assignment = match algorithm {
        CommunityAlgorithm::Louvain => louvain(&view, params, cancel)?,
        CommunityAlgorithm::LabelPropagation => label_propagation(&view, params, cancel)?,
        CommunityAlgorithm::Leiden => {
            let coarse = louvain(&view, params, cancel)?;
            refine_connectivity(&view, coarse)
        }
    };

    let modularity = modularity(&view, &assignment, params.resolution);

    // Relabel into dense ids and order by size descending.
    let mut grouped: HashMap<usize, Vec<Uuid>> = HashMap::new();
    for (node, community) in assignment.iter().enumerate() {
        grouped
            .entry(*community)
            .or_default()
            .push(analysis.graph[petgraph::graph::NodeIndex::new(node)]);
    }
    let mut communities: Vec<Community> = grouped
        .into_values()
        .map(|mut entity_ids| {
            entity_ids.sort_by_key(|id| id.to_string());
            Community { id: 0, entity_ids }
        })
        .collect();
    communities.sort_by(|a, b| {
        b.size()
            .cmp(&a.size())
            .then_with(|| a.entity_ids.first().cmp(&b.entity_ids.first()))
    });
    for (id, community) in communities.iter_mut().enumerate() {
        community.id = id;
    }

    let largest = communities.first().map(Community::size).unwrap_or(0);
    let smallest = communities.last().map(Community::size).unwrap_or(0);

    Ok(CommunityReport {
        algorithm,
        communities,
        modularity,
        largest,
        smallest,
        processing_time_ms: started.elapsed().as_millis() as u64,
    })
}

/// Weighted undirected adjacency with precomputed degrees.
struct UndirectedView {
    /// node -> [(neighbor, weight)]
    adjacency: Vec<Vec<(usize, f64)>>,
    weighted_degree: Vec<f64>,
    total_weight: f64,
}

impl UndirectedView {
    fn build(analysis: &AnalysisGraph) -> Self {
        let n = analysis.node_count();
        let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        let mut weighted_degree = vec![0.0; n];
        let mut total_weight = 0.0;

        for edge in analysis.graph.edge_indices() {
            let (a, b) = analysis.graph.edge_endpoints(edge).expect("edge endpoints");
            let w = analysis.graph[edge];
            adjacency[a.index()].push((b.index(), w));
            adjacency[b.index()].push((a.index(), w));
            weighted_degree[a.index()] += w;
            weighted_degree[b.index()] += w;
            total_weight += w;
        }
        for neighbors in &mut adjacency {
            neighbors.sort_by(|x, y| x.0.cmp(&y.0));
        }

        Self {
            adjacency,
            weighted_degree,
            total_weight,
        }
    }

    fn len(&self) -> usize {
        self.adjacency.len()
    }
}

fn modularity(view: &UndirectedView, assignment: &[usize], resolution: f64) -> f64 {
    let m2 = 2.0 * view.total_weight;
    if m2 == 0.0 {
        return 0.0;
    }
    let mut q = 0.0;
    for node in 0..view.len() {
        for &(neighbor, weight) in &view.adjacency[node] {
            if assignment[node] == assignment[neighbor] {
                q += weight
                    - resolution * view.weighted_degree[node] * view.weighted_degree[neighbor]
                        / m2;
            }
        }
    }
    q / m2
}

/// One-level Louvain local moving, then aggregation, repeated until the
/// modularity gain drops below tolerance.
fn louvain(
    view: &UndirectedView,
    params: &CommunityParams,
    cancel: &CancellationToken,
) -> Result<Vec<usize>> {
    let n = view.len();
    let mut assignment: Vec<usize> = (0..n).collect();
    if n == 0 {
        return Ok(assignment);
    }

    let mut current_view = UndirectedView {
        adjacency: view.adjacency.clone(),
        weighted_degree: view.weighted_degree.clone(),
        total_weight: view.total_weight,
    };
    // membership of the original nodes in the current coarse graph
    let mut membership: Vec<usize> = (0..n).collect();

    for _ in 0..params.max_iterations {
        check_cancelled(cancel, "analytics.louvain")?;
        let before = modularity(&current_view, &(0..current_view.len()).collect::<Vec<_>>(), params.resolution);
        let local = local_move(&current_view, params, cancel)?;
        let after = modularity(&current_view, &local, params.resolution);

        // Project coarse communities back onto the original nodes.
        for node in 0..n {
            membership[node] = local[membership[node]];
        }
        assignment.copy_from_slice(&membership);

        if after - before < params.tolerance {
            break;
        }
        let (aggregated, relabel) = aggregate(&current_view, &local);
        for node in 0..n {
            membership[node] = relabel[&membership[node]];
        }
        current_view = aggregated;
    }

    Ok(normalize(assignment))
}

fn local_move(
    view: &UndirectedView,
    params: &CommunityParams,
    cancel: &CancellationToken,
) -> Result<Vec<usize>> {
    let n = view.len();
    let mut community: Vec<usize> = (0..n).collect();
    let mut community_degree: Vec<f64> = view.weighted_degree.clone();
    let m2 = 2.0 * view.total_weight;
    if m2 == 0.0 {
        return Ok(community);
    }

    let mut improved = true;
    let mut rounds = 0;
    while improved && rounds < params.max_iterations {
        check_cancelled(cancel, "analytics.louvain")?;
        improved = false;
        rounds += 1;

        for node in 0..n {
            let own = community[node];
            community_degree[own] -= view.weighted_degree[node];

            // Weight from `node` into each adjacent community.
            let mut links: HashMap<usize, f64> = HashMap::new();
            for &(neighbor, weight) in &view.adjacency[node] {
                if neighbor != node {
                    *links.entry(community[neighbor]).or_default() += weight;
                }
            }

            let mut best = own;
            let mut best_gain = 0.0;
            let mut candidates: Vec<usize> = links.keys().copied().collect();
            candidates.sort_unstable();
            for candidate in candidates {
                let gain = links.get(&candidate).copied().unwrap_or(0.0)
                    - params.resolution * community_degree[candidate] * view.weighted_degree[node]
                        / m2;
                if gain > best_gain {
                    best_gain = gain;
                    best = candidate;
                }
            }

            community_degree[best] += view.weighted_degree[node];
            if best != own {
                community[node] = best;
                improved = true;
            }
        }
    }
    Ok(community)
}

fn aggregate(view: &UndirectedView, community: &[usize]) -> (UndirectedView, HashMap<usize, usize>) {
    let mut relabel: HashMap<usize, usize> = HashMap::new();
    for &c in community {
        let next = relabel.len();
        relabel.entry(c).or_insert(next);
    }
    let k = relabel.len();

    let mut edge_weights: HashMap<(usize, usize), f64> = HashMap::new();
    for node in 0..view.len() {
        let a = relabel[&community[node]];
        for &(neighbor, weight) in &view.adjacency[node] {
            if neighbor < node {
                continue; // count each undirected edge once
            }
            let b = relabel[&community[neighbor]];
            let key = if a <= b { (a, b) } else { (b, a) };
            *edge_weights.entry(key).or_default() += weight;
        }
    }

    let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); k];
    let mut weighted_degree = vec![0.0; k];
    let mut total_weight = 0.0;
    for ((a, b), weight) in edge_weights {
        adjacency[a].push((b, weight));
        if a != b {
            adjacency[b].push((a, weight));
        }
        weighted_degree[a] += weight;
        weighted_degree[b] += weight;
        total_weight += weight;
    }
    for neighbors in &mut adjacency {
        neighbors.sort_by(|x, y| x.0.cmp(&y.0));
    }

    (
        UndirectedView {
            adjacency,
            weighted_degree,
            total_weight,
        },
        relabel,
    )
}

/// Deterministic label propagation: nodes adopt the most frequent
/// neighbor label in ascending node order; ties take the smallest label.
fn label_propagation(
    view: &UndirectedView,
    params: &CommunityParams,
    cancel: &CancellationToken,
) -> Result<Vec<usize>> {
    let n = view.len();
    let mut labels: Vec<usize> = (0..n).collect();

    for _ in 0..params.max_iterations {
        check_cancelled(cancel, "analytics.label_propagation")?;
        let mut changed = false;
        for node in 0..n {
            let mut counts: HashMap<usize, f64> = HashMap::new();
            for &(neighbor, weight) in &view.adjacency[node] {
                *counts.entry(labels[neighbor]).or_default() += weight;
            }
            if counts.is_empty() {
                continue;
            }
            let mut entries: Vec<(usize, f64)> = counts.into_iter().collect();
            entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            let winner = entries[0].0;
            if winner != labels[node] {
                labels[node] = winner;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    Ok(normalize(labels))
}

/// Leiden-style refinement: split any community that is internally
/// disconnected into its connected components.
fn refine_connectivity(view: &UndirectedView, assignment: Vec<usize>) -> Vec<usize> {
    let n = view.len();
    let mut refined = vec![usize::MAX; n];
    let mut next_label = 0;

    let mut by_community: HashMap<usize, Vec<usize>> = HashMap::new();
    for (node, &c) in assignment.iter().enumerate() {
        by_community.entry(c).or_default().push(node);
    }
    let mut communities: Vec<_> = by_community.into_iter().collect();
    communities.sort_by_key(|(c, _)| *c);

    for (_, members) in communities {
        let member_set: HashSet<usize> = members.iter().copied().collect();
        let mut unvisited: Vec<usize> = members.clone();
        unvisited.sort_unstable();
        let mut seen: HashSet<usize> = HashSet::new();

        for start in unvisited {
            if seen.contains(&start) {
                continue;
            }
            let label = next_label;
            next_label += 1;
            let mut queue = VecDeque::new();
            queue.push_back(start);
            seen.insert(start);
            while let Some(node) = queue.pop_front() {
                refined[node] = label;
                for &(neighbor, _) in &view.adjacency[node] {
                    if member_set.contains(&neighbor) && seen.insert(neighbor) {
                        queue.push_back(neighbor);
                    }
                }
            }
        }
    }
    refined
}

fn normalize(assignment: Vec<usize>) -> Vec<usize> {
    let mut relabel: HashMap<usize, usize> = HashMap::new();
    assignment
        .into_iter()
        .map(|c| {
            let next = relabel.len();
            *relabel.entry(c).or_insert(next)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, GraphEntity, Relationship, RelationshipType};

    /// Two dense cliques joined by a single bridge edge.
    fn two_cliques() -> Subgraph {
        let entities = (1..=8u128)
            .map(|n| GraphEntity::new(Uuid::from_u128(n), EntityType::Account))
            .collect();
        let mut relationships = Vec::new();
        let clique = |ids: &[u128], rels: &mut Vec<Relationship>| {
            for (i, &a) in ids.iter().enumerate() {
                for &b in &ids[i + 1..] {
                    rels.push(Relationship::new(
                        RelationshipType::AssociatedWith,
                        Uuid::from_u128(a),
                        Uuid::from_u128(b),
                    ));
                }
            }
        };
        clique(&[1, 2, 3, 4], &mut relationships);
        clique(&[5, 6, 7, 8], &mut relationships);
        relationships.push(Relationship::new(
            RelationshipType::AssociatedWith,
            Uuid::from_u128(4),
            Uuid::from_u128(5),
        ));
        Subgraph {
            entities,
            relationships,
        }
    }

    #[test]
    fn louvain_splits_cliques() {
        let report = compute(
            &two_cliques(),
            CommunityAlgorithm::Louvain,
            &CommunityParams::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(report.communities.len(), 2);
        assert_eq!(report.largest, 4);
        assert_eq!(report.smallest, 4);
        assert!(report.modularity > 0.3);
    }

    #[test]
    fn label_propagation_is_deterministic() {
        let a = compute(
            &two_cliques(),
            CommunityAlgorithm::LabelPropagation,
            &CommunityParams::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        let b = compute(
            &two_cliques(),
            CommunityAlgorithm::LabelPropagation,
            &CommunityParams::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        let ids =
            |r: &CommunityReport| -> Vec<Vec<Uuid>> { r.communities.iter().map(|c| c.entity_ids.clone()).collect() };
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn leiden_matches_clique_structure() {
        let report = compute(
            &two_cliques(),
            CommunityAlgorithm::Leiden,
            &CommunityParams::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(report.communities.len(), 2);
        // Every community internally connected by construction.
        assert!(report.communities.iter().all(|c| c.size() == 4));
    }

    #[test]
    fn communities_ordered_by_size_desc() {
        let mut subgraph = two_cliques();
        // Add an isolated node: smallest community of size 1.
        subgraph
            .entities
            .push(GraphEntity::new(Uuid::from_u128(99), EntityType::Account));

        let report = compute(
            &subgraph,
            CommunityAlgorithm::Louvain,
            &CommunityParams::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        let sizes: Vec<usize> = report.communities.iter().map(Community::size).collect();
        let mut sorted = sizes.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(sizes, sorted);
        assert_eq!(report.smallest, 1);
    }
}
