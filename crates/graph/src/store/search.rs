//! Deterministic path search shared by the store implementations.
//!
//! Both adapters materialize the bounded neighborhood of the query and run
//! the same breadth-first enumeration over it, which is what makes the
//! ordering contract identical across backends.

use crate::model::{GraphPath, Subgraph};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Adjacency view over a subgraph, direction-agnostic.
struct Adjacency {
    /// node -> [(neighbor, relationship id, weight)]
    edges: HashMap<Uuid, Vec<(Uuid, Uuid, f64)>>,
}

impl Adjacency {
    fn build(subgraph: &Subgraph) -> Self {
        let mut edges: HashMap<Uuid, Vec<(Uuid, Uuid, f64)>> = HashMap::new();
        for rel in &subgraph.relationships {
            let weight = rel.weight();
            edges
                .entry(rel.source_id)
                .or_default()
                .push((rel.target_id, rel.id, weight));
            edges
                .entry(rel.target_id)
                .or_default()
                .push((rel.source_id, rel.id, weight));
        }
        // Sorted neighbor order makes enumeration independent of map
        // iteration order.
        for neighbors in edges.values_mut() {
            neighbors.sort_by(|a, b| {
                a.0.to_string()
                    .cmp(&b.0.to_string())
                    .then_with(|| a.1.to_string().cmp(&b.1.to_string()))
            });
        }
        Self { edges }
    }

    fn neighbors(&self, id: Uuid) -> &[(Uuid, Uuid, f64)] {
        self.edges.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Enumerate simple paths from any source to any target with at most
/// `max_len` edges, returning the first `max_results` in deterministic
/// order: length ascending, total weight ascending, lexicographic entity
/// sequence.
pub fn find_paths(
    subgraph: &Subgraph,
    sources: &[Uuid],
    targets: &[Uuid],
    max_len: usize,
    max_results: usize,
) -> Vec<GraphPath> {
    if max_len == 0 || max_results == 0 {
        return Vec::new();
    }
    let adjacency = Adjacency::build(subgraph);
    let target_set: HashSet<Uuid> = targets.iter().copied().collect();

    let mut ordered_sources: Vec<Uuid> = sources.to_vec();
    ordered_sources.sort_by_key(|id| id.to_string());
    ordered_sources.dedup();

    let mut found: Vec<GraphPath> = Vec::new();
    for source in ordered_sources {
        let mut visited: HashSet<Uuid> = HashSet::new();
        visited.insert(source);
        let mut entities = vec![source];
        let mut relationships = Vec::new();
        dfs(
            &adjacency,
            &target_set,
            max_len,
            &mut visited,
            &mut entities,
            &mut relationships,
            0.0,
            &mut found,
        );
    }

    found.sort_by(|a, b| a.compare(b));
    found.dedup_by(|a, b| a.entities == b.entities && a.relationships == b.relationships);
    found.truncate(max_results);
    found
}

#[allow(clippy::too_many_arguments)]
fn dfs(
    adjacency: &Adjacency,
    targets: &HashSet<Uuid>,
    max_len: usize,
    visited: &mut HashSet<Uuid>,
    entities: &mut Vec<Uuid>,
    relationships: &mut Vec<Uuid>,
    weight: f64,
    found: &mut Vec<GraphPath>,
) {
    let current = *entities.last().unwrap_or(&Uuid::nil());
    if !relationships.is_empty() && targets.contains(&current) {
        found.push(GraphPath {
            entities: entities.clone(),
            relationships: relationships.clone(),
            total_weight: weight,
        });
        // A target can also be an intermediate node of a longer path, so
        // the search continues below.
    }
    if relationships.len() >= max_len {
        return;
    }
    for &(neighbor, rel_id, rel_weight) in adjacency.neighbors(current) {
        if visited.contains(&neighbor) {
            continue;
        }
        visited.insert(neighbor);
        entities.push(neighbor);
        relationships.push(rel_id);
        dfs(
            adjacency,
            targets,
            max_len,
            visited,
            entities,
            relationships,
            weight + rel_weight,
            found,
        );
        relationships.pop();
        entities.pop();
        visited.remove(&neighbor);
    }
}

/// All simple paths starting at `source`, up to `max_len` edges, capped at
/// `max_paths`. Used by path analysis.
pub fn paths_from(
    subgraph: &Subgraph,
    source: Uuid,
    max_len: usize,
    max_paths: usize,
) -> Vec<GraphPath> {
    // Every reachable node is a target.
    let targets: Vec<Uuid> = subgraph
        .entities
        .iter()
        .map(|e| e.id)
        .filter(|id| *id != source)
        .collect();
    find_paths(subgraph, &[source], &targets, max_len, max_paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, GraphEntity, Relationship, RelationshipType};

    fn entity(n: u128) -> GraphEntity {
        GraphEntity::new(Uuid::from_u128(n), EntityType::Account)
    }

    fn edge(n: u128, from: u128, to: u128, weight: f64) -> Relationship {
        let mut rel = Relationship::new(
            RelationshipType::TransferredTo,
            Uuid::from_u128(from),
            Uuid::from_u128(to),
        )
        .with_property("weight", serde_json::json!(weight));
        rel.id = Uuid::from_u128(n);
        rel
    }

    /// X -> m1 -> m2 -> Y twice over parallel intermediaries with equal
    /// weight; ordering must be stable across calls.
    fn parallel_paths_graph() -> Subgraph {
        Subgraph {
            entities: vec![entity(1), entity(2), entity(3), entity(4), entity(5), entity(6)],
            relationships: vec![
                edge(100, 1, 2, 1.0),
                edge(101, 2, 3, 1.0),
                edge(102, 3, 6, 1.0),
                edge(103, 1, 4, 1.0),
                edge(104, 4, 5, 1.0),
                edge(105, 5, 6, 1.0),
            ],
        }
    }

    #[test]
    fn equal_weight_ties_break_lexicographically() {
        let graph = parallel_paths_graph();
        let x = Uuid::from_u128(1);
        let y = Uuid::from_u128(6);

        let first = find_paths(&graph, &[x], &[y], 5, 10);
        let second = find_paths(&graph, &[x], &[y], 5, 10);

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        // Lexicographic tie-break: the path through the smaller uuid
        // sequence comes first.
        assert!(first[0].entities[1].to_string() < first[1].entities[1].to_string());
    }

    #[test]
    fn respects_max_len() {
        let graph = parallel_paths_graph();
        let x = Uuid::from_u128(1);
        let y = Uuid::from_u128(6);
        assert!(find_paths(&graph, &[x], &[y], 2, 10).is_empty());
        assert_eq!(find_paths(&graph, &[x], &[y], 3, 10).len(), 2);
    }

    #[test]
    fn shorter_paths_sort_first() {
        let mut graph = parallel_paths_graph();
        // Direct shortcut X -> Y, heavy.
        graph.relationships.push(edge(106, 1, 6, 50.0));

        let paths = find_paths(&graph, &[Uuid::from_u128(1)], &[Uuid::from_u128(6)], 5, 10);
        assert_eq!(paths[0].len(), 1);
        assert_eq!(paths[0].total_weight, 50.0);
        assert_eq!(paths[1].len(), 3);
    }

    #[test]
    fn symmetric_under_reversal() {
        let graph = parallel_paths_graph();
        let x = Uuid::from_u128(1);
        let y = Uuid::from_u128(6);

        let forward = find_paths(&graph, &[x], &[y], 5, 10);
        let backward = find_paths(&graph, &[y], &[x], 5, 10);

        let mut reversed: Vec<GraphPath> = backward.iter().map(GraphPath::reversed).collect();
        reversed.sort_by(|a, b| a.compare(b));
        assert_eq!(forward, reversed);
    }
}
