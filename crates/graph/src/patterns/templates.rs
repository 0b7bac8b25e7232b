//! Pattern templates: topological shape, temporal window, and confidence
//! scoring per template.
//!
//! Every template scans the `TRANSFERRED_TO` edges of a materialized
//! subgraph. Confidence expresses structural quality in [0,1]; severity is
//! derived from the monetary volume the structure moves.

use super::{PatternMatch, PatternType};
use crate::model::{Relationship, RelationshipType, Subgraph};
use aegis_core::config::{ChainParams, LayeringParams, SmurfingParams, StarParams};
use aegis_core::types::Severity;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Confidence never reports absolute certainty.
const MAX_CONFIDENCE: f64 = 0.99;

fn severity_from_total(total: f64) -> Severity {
    if total >= 1_000_000.0 {
        Severity::Critical
    } else if total >= 100_000.0 {
        Severity::High
    } else if total >= 25_000.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn transfers(subgraph: &Subgraph) -> Vec<&Relationship> {
    subgraph.relationships_of(&[RelationshipType::TransferredTo])
}

fn sorted_unique(ids: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
    let mut out: Vec<Uuid> = ids.into_iter().collect();
    out.sort_by_key(|id| id.to_string());
    out.dedup();
    out
}

fn amount_statistics(amounts: &[f64]) -> (f64, f64, f64) {
    let n = amounts.len() as f64;
    let total: f64 = amounts.iter().sum();
    let mean = if n > 0.0 { total / n } else { 0.0 };
    let cv = if mean > 0.0 {
        let variance = amounts.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
        variance.sqrt() / mean
    } else {
        0.0
    };
    (total, mean, cv)
}

/// Smurfing: many small, structurally-similar transfers converging on one
/// sink inside the temporal window.
///
/// Confidence = 0.55 base
///   + 0.25 · fan-in volume beyond the minimum (capped)
///   + 0.15 · amount similarity (1 − cv/cv_max)
///   + 0.05 when the mean sits just under the reporting threshold.
pub fn detect_smurfing(subgraph: &Subgraph, params: &SmurfingParams) -> Vec<PatternMatch> {
    let window = Duration::seconds(params.window_secs);
    let mut inbound: HashMap<Uuid, Vec<&Relationship>> = HashMap::new();
    for rel in transfers(subgraph) {
        inbound.entry(rel.target_id).or_default().push(rel);
    }

    let mut matches = Vec::new();
    let mut sinks: Vec<Uuid> = inbound.keys().copied().collect();
    sinks.sort_by_key(|id| id.to_string());

    for sink in sinks {
        let mut edges = inbound.remove(&sink).unwrap_or_default();
        edges.sort_by_key(|r| (r.occurred_at(), r.id.to_string()));

        // Best window: widest distinct-source fan-in within `window`.
        let mut best: Option<Vec<&Relationship>> = None;
        for start in 0..edges.len() {
            let open = edges[start].occurred_at();
            let in_window: Vec<&Relationship> = edges[start..]
                .iter()
                .take_while(|r| r.occurred_at() - open <= window)
                .copied()
                .collect();
            let distinct: HashSet<Uuid> = in_window.iter().map(|r| r.source_id).collect();
            if distinct.len() < params.min_sources {
                continue;
            }
            if best.as_ref().map(|b| b.len()).unwrap_or(0) < in_window.len() {
                best = Some(in_window);
            }
        }
        let Some(in_window) = best else {
            continue;
        };

        let sources: HashSet<Uuid> = in_window.iter().map(|r| r.source_id).collect();
        let amounts: Vec<f64> = in_window
            .iter()
            .filter_map(|r| r.amount())
            .filter_map(|d| d.to_string().parse::<f64>().ok())
            .collect();
        let (total, mean, cv) = amount_statistics(&amounts);

        let fan_in_score =
            ((sources.len() - params.min_sources) as f64 / params.min_sources as f64).min(1.0);
        let similarity = 1.0 - (cv / params.max_amount_cv).min(1.0);
        let threshold_bonus = if mean >= 0.8 * params.reporting_threshold
            && mean < params.reporting_threshold
        {
            0.05
        } else {
            0.0
        };
        let confidence =
            (0.55 + 0.25 * fan_in_score + 0.15 * similarity + threshold_bonus).min(MAX_CONFIDENCE);

        let entity_ids = sorted_unique(sources.iter().copied().chain(std::iter::once(sink)));
        matches.push(PatternMatch {
            id: Uuid::new_v4(),
            pattern_type: PatternType::Smurfing,
            entity_ids,
            relationship_ids: in_window.iter().map(|r| r.id).collect(),
            confidence,
            severity: severity_from_total(total),
            evidence: serde_json::json!({
                "sink": sink,
                "fan_in": sources.len(),
                "transfer_count": in_window.len(),
                "total_amount": total,
                "mean_amount": mean,
                "amount_cv": cv,
                "window_secs": params.window_secs,
            }),
            detected_at: Utc::now(),
        });
    }
    matches
}

/// Layering: chains of pass-through intermediaries between an ultimate
/// source and sink. An intermediary qualifies when its outflow roughly
/// matches its inflow inside the window.
pub fn detect_layering(subgraph: &Subgraph, params: &LayeringParams) -> Vec<PatternMatch> {
    let edges = transfers(subgraph);
    let mut outbound: HashMap<Uuid, Vec<&Relationship>> = HashMap::new();
    let mut inbound: HashMap<Uuid, Vec<&Relationship>> = HashMap::new();
    for rel in &edges {
        outbound.entry(rel.source_id).or_default().push(rel);
        inbound.entry(rel.target_id).or_default().push(rel);
    }

    let flow = |map: &HashMap<Uuid, Vec<&Relationship>>, id: Uuid| -> f64 {
        map.get(&id)
            .map(|rels| {
                rels.iter()
                    .filter_map(|r| r.amount())
                    .filter_map(|d| d.to_string().parse::<f64>().ok())
                    .sum()
            })
            .unwrap_or(0.0)
    };

    // Ultimate sources originate but do not receive; sinks the reverse.
    let mut sources: Vec<Uuid> = outbound
        .keys()
        .filter(|id| !inbound.contains_key(id))
        .copied()
        .collect();
    sources.sort_by_key(|id| id.to_string());
    let mut sinks: Vec<Uuid> = inbound
        .keys()
        .filter(|id| !outbound.contains_key(id))
        .copied()
        .collect();
    sinks.sort_by_key(|id| id.to_string());

    let mut matches = Vec::new();
    for &source in &sources {
        for &sink in &sinks {
            let paths = directed_paths(subgraph, source, sink, params.max_hops);
            for path in paths {
                if path.nodes.len() < params.min_hops + 1 {
                    continue;
                }
                if !within_window(&path.edges, Duration::seconds(params.window_secs)) {
                    continue;
                }
                let intermediaries = &path.nodes[1..path.nodes.len() - 1];
                if intermediaries.is_empty() {
                    continue;
                }
                let passthrough: Vec<f64> = intermediaries
                    .iter()
                    .map(|&node| {
                        let inflow = flow(&inbound, node);
                        let outflow = flow(&outbound, node);
                        if inflow.max(outflow) == 0.0 {
                            0.0
                        } else {
                            inflow.min(outflow) / inflow.max(outflow)
                        }
                    })
                    .collect();
                let avg_passthrough =
                    passthrough.iter().sum::<f64>() / passthrough.len() as f64;
                if avg_passthrough < params.min_passthrough_ratio {
                    continue;
                }

                let hops = path.edges.len();
                let total: f64 = path
                    .edges
                    .iter()
                    .filter_map(|r| r.amount())
                    .filter_map(|d| d.to_string().parse::<f64>().ok())
                    .sum();
                let depth_score = ((hops - params.min_hops) as f64 / params.min_hops as f64)
                    .min(1.0);
                let confidence =
                    (0.45 + 0.2 * depth_score + 0.3 * avg_passthrough).min(MAX_CONFIDENCE);

                matches.push(PatternMatch {
                    id: Uuid::new_v4(),
                    pattern_type: PatternType::Layering,
                    entity_ids: sorted_unique(path.nodes.iter().copied()),
                    relationship_ids: path.edges.iter().map(|r| r.id).collect(),
                    confidence,
                    severity: severity_from_total(total),
                    evidence: serde_json::json!({
                        "ultimate_source": source,
                        "ultimate_sink": sink,
                        "hops": hops,
                        "avg_passthrough": avg_passthrough,
                        "total_amount": total,
                    }),
                    detected_at: Utc::now(),
                });
            }
        }
    }
    matches
}

/// Star: one center moving funds with at least `min_leaves` distinct
/// counterparties inside the window.
pub fn detect_star(subgraph: &Subgraph, params: &StarParams) -> Vec<PatternMatch> {
    let window = Duration::seconds(params.window_secs);
    let mut touching: HashMap<Uuid, Vec<&Relationship>> = HashMap::new();
    for rel in transfers(subgraph) {
        touching.entry(rel.source_id).or_default().push(rel);
        touching.entry(rel.target_id).or_default().push(rel);
    }

    let mut centers: Vec<Uuid> = touching.keys().copied().collect();
    centers.sort_by_key(|id| id.to_string());

    let mut matches = Vec::new();
    for center in centers {
        let mut edges = touching.remove(&center).unwrap_or_default();
        edges.sort_by_key(|r| (r.occurred_at(), r.id.to_string()));
        if edges.is_empty() {
            continue;
        }
        let open = edges[0].occurred_at();
        let in_window: Vec<&Relationship> = edges
            .iter()
            .take_while(|r| r.occurred_at() - open <= window)
            .copied()
            .collect();

        let leaves: HashSet<Uuid> = in_window
            .iter()
            .filter_map(|r| r.other_endpoint(center))
            .collect();
        if leaves.len() < params.min_leaves {
            continue;
        }

        let amounts: Vec<f64> = in_window
            .iter()
            .filter_map(|r| r.amount())
            .filter_map(|d| d.to_string().parse::<f64>().ok())
            .collect();
        let (total, _, cv) = amount_statistics(&amounts);
        let breadth =
            ((leaves.len() - params.min_leaves) as f64 / (2 * params.min_leaves) as f64).min(1.0);
        let confidence = (0.4 + 0.4 * breadth + 0.1 * (1.0 - cv.min(1.0))).min(MAX_CONFIDENCE);

        matches.push(PatternMatch {
            id: Uuid::new_v4(),
            pattern_type: PatternType::Star,
            entity_ids: sorted_unique(leaves.iter().copied().chain(std::iter::once(center))),
            relationship_ids: in_window.iter().map(|r| r.id).collect(),
            confidence,
            severity: severity_from_total(total),
            evidence: serde_json::json!({
                "center": center,
                "leaf_count": leaves.len(),
                "total_amount": total,
            }),
            detected_at: Utc::now(),
        });
    }
    matches
}

/// Triangle: a directed 3-cycle of transfers.
pub fn detect_triangle(subgraph: &Subgraph) -> Vec<PatternMatch> {
    let edges = transfers(subgraph);
    let mut by_source: HashMap<Uuid, Vec<&Relationship>> = HashMap::new();
    for rel in &edges {
        by_source.entry(rel.source_id).or_default().push(rel);
    }

    let mut seen: HashSet<Vec<Uuid>> = HashSet::new();
    let mut matches = Vec::new();
    let mut ordered = edges.clone();
    ordered.sort_by_key(|r| r.id.to_string());

    for first in &ordered {
        let Some(seconds) = by_source.get(&first.target_id) else {
            continue;
        };
        for second in seconds {
            if second.target_id == first.source_id {
                continue; // 2-cycle, not a triangle
            }
            let Some(thirds) = by_source.get(&second.target_id) else {
                continue;
            };
            for third in thirds {
                if third.target_id != first.source_id {
                    continue;
                }
                let entity_ids =
                    sorted_unique([first.source_id, second.source_id, third.source_id]);
                if entity_ids.len() != 3 || !seen.insert(entity_ids.clone()) {
                    continue;
                }

                let amounts: Vec<f64> = [first, second, third]
                    .iter()
                    .filter_map(|r| r.amount())
                    .filter_map(|d| d.to_string().parse::<f64>().ok())
                    .collect();
                let (total, _, cv) = amount_statistics(&amounts);
                let confidence = (0.6 + 0.2 * (1.0 - cv.min(1.0))).min(MAX_CONFIDENCE);

                matches.push(PatternMatch {
                    id: Uuid::new_v4(),
                    pattern_type: PatternType::Triangle,
                    entity_ids,
                    relationship_ids: vec![first.id, second.id, third.id],
                    confidence,
                    severity: severity_from_total(total),
                    evidence: serde_json::json!({
                        "cycle": [first.source_id, second.source_id, third.source_id],
                        "total_amount": total,
                    }),
                    detected_at: Utc::now(),
                });
            }
        }
    }
    matches
}

/// Chain: a simple directed transfer path of bounded length between two
/// foci. When `foci` is empty every originator/terminator pair is tried.
pub fn detect_chain(
    subgraph: &Subgraph,
    params: &ChainParams,
    foci: &[Uuid],
) -> Vec<PatternMatch> {
    let edges = transfers(subgraph);
    let mut outbound: HashSet<Uuid> = HashSet::new();
    let mut inbound: HashSet<Uuid> = HashSet::new();
    for rel in &edges {
        outbound.insert(rel.source_id);
        inbound.insert(rel.target_id);
    }

    let (starts, ends): (Vec<Uuid>, Vec<Uuid>) = if foci.is_empty() {
        (
            sorted_unique(outbound.difference(&inbound).copied()),
            sorted_unique(inbound.difference(&outbound).copied()),
        )
    } else {
        (foci.to_vec(), foci.to_vec())
    };

    let mut matches = Vec::new();
    let mut seen: HashSet<Vec<Uuid>> = HashSet::new();
    for &start in &starts {
        for &end in &ends {
            if start == end {
                continue;
            }
            for path in directed_paths(subgraph, start, end, params.max_length) {
                let length = path.edges.len();
                if length < params.min_length || length > params.max_length {
                    continue;
                }
                if !within_window(&path.edges, Duration::seconds(params.window_secs)) {
                    continue;
                }
                if !seen.insert(path.nodes.clone()) {
                    continue;
                }
                let total: f64 = path
                    .edges
                    .iter()
                    .filter_map(|r| r.amount())
                    .filter_map(|d| d.to_string().parse::<f64>().ok())
                    .sum();
                let confidence =
                    (0.5 + 0.08 * (length - params.min_length + 1) as f64).min(MAX_CONFIDENCE);

                matches.push(PatternMatch {
                    id: Uuid::new_v4(),
                    pattern_type: PatternType::Chain,
                    entity_ids: sorted_unique(path.nodes.iter().copied()),
                    relationship_ids: path.edges.iter().map(|r| r.id).collect(),
                    confidence,
                    severity: severity_from_total(total),
                    evidence: serde_json::json!({
                        "from": start,
                        "to": end,
                        "length": length,
                        "total_amount": total,
                    }),
                    detected_at: Utc::now(),
                });
            }
        }
    }
    matches
}

struct DirectedPath<'a> {
    nodes: Vec<Uuid>,
    edges: Vec<&'a Relationship>,
}

/// All simple directed transfer paths from `start` to `end`, bounded by
/// `max_len` edges, in deterministic order.
fn directed_paths<'a>(
    subgraph: &'a Subgraph,
    start: Uuid,
    end: Uuid,
    max_len: usize,
) -> Vec<DirectedPath<'a>> {
    let mut by_source: HashMap<Uuid, Vec<&'a Relationship>> = HashMap::new();
    for rel in transfers(subgraph) {
        by_source.entry(rel.source_id).or_default().push(rel);
    }
    for rels in by_source.values_mut() {
        rels.sort_by_key(|r| r.id.to_string());
    }

    let mut found = Vec::new();
    let mut nodes = vec![start];
    let mut edges: Vec<&'a Relationship> = Vec::new();
    let mut visited: HashSet<Uuid> = HashSet::from([start]);

    fn walk<'a>(
        by_source: &HashMap<Uuid, Vec<&'a Relationship>>,
        end: Uuid,
        max_len: usize,
        nodes: &mut Vec<Uuid>,
        edges: &mut Vec<&'a Relationship>,
        visited: &mut HashSet<Uuid>,
        found: &mut Vec<DirectedPath<'a>>,
    ) {
        let current = *nodes.last().expect("path never empty");
        if current == end && !edges.is_empty() {
            found.push(DirectedPath {
                nodes: nodes.clone(),
                edges: edges.clone(),
            });
            return;
        }
        if edges.len() >= max_len {
            return;
        }
        let Some(outgoing) = by_source.get(&current) else {
            return;
        };
        for rel in outgoing {
            if visited.contains(&rel.target_id) {
                continue;
            }
            visited.insert(rel.target_id);
            nodes.push(rel.target_id);
            edges.push(rel);
            walk(by_source, end, max_len, nodes, edges, visited, found);
            edges.pop();
            nodes.pop();
            visited.remove(&rel.target_id);
        }
    }

    walk(
        &by_source,
        end,
        max_len,
        &mut nodes,
        &mut edges,
        &mut visited,
        &mut found,
    );
    found
}

fn within_window(edges: &[&Relationship], window: Duration) -> bool {
    let times: Vec<DateTime<Utc>> = edges.iter().map(|r| r.occurred_at()).collect();
    match (times.iter().min(), times.iter().max()) {
        (Some(min), Some(max)) => *max - *min <= window,
        _ => true,
    }
}
