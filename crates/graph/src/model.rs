//! Typed property-graph model: entities, relationships, paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Canonical entity classes. Unknown classes from upstream systems are
/// preserved verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityType {
    Person,
    Organization,
    Account,
    Device,
    Address,
    Other(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Organization => "ORGANIZATION",
            EntityType::Account => "ACCOUNT",
            EntityType::Device => "DEVICE",
            EntityType::Address => "ADDRESS",
            EntityType::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "PERSON" => EntityType::Person,
            "ORGANIZATION" => EntityType::Organization,
            "ACCOUNT" => EntityType::Account,
            "DEVICE" => EntityType::Device,
            "ADDRESS" => EntityType::Address,
            other => EntityType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EntityType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EntityType::parse(&s))
    }
}

/// Edge classes. `TransferredTo` edges carry `amount` and `timestamp`
/// properties and are what the pattern templates traverse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelationshipType {
    TransferredTo,
    Owns,
    Controls,
    AssociatedWith,
    SameAs,
    Other(String),
}

impl RelationshipType {
    pub fn as_str(&self) -> &str {
        match self {
            RelationshipType::TransferredTo => "TRANSFERRED_TO",
            RelationshipType::Owns => "OWNS",
            RelationshipType::Controls => "CONTROLS",
            RelationshipType::AssociatedWith => "ASSOCIATED_WITH",
            RelationshipType::SameAs => "SAME_AS",
            RelationshipType::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "TRANSFERRED_TO" => RelationshipType::TransferredTo,
            "OWNS" => RelationshipType::Owns,
            "CONTROLS" => RelationshipType::Controls,
            "ASSOCIATED_WITH" => RelationshipType::AssociatedWith,
            "SAME_AS" => RelationshipType::SameAs,
            other => RelationshipType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RelationshipType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RelationshipType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RelationshipType::parse(&s))
    }
}

/// A node in the property graph. Identity is the canonical id produced by
/// the entity resolver; mutation goes through the resolver's reconcile
/// operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEntity {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub properties: HashMap<String, serde_json::Value>,
    pub risk_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GraphEntity {
    pub fn new(id: Uuid, entity_type: EntityType) -> Self {
        let now = Utc::now();
        Self {
            id,
            entity_type,
            properties: HashMap::new(),
            risk_score: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_risk_score(mut self, risk_score: f64) -> Self {
        self.risk_score = risk_score;
        self
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }
}

/// A typed edge. Endpoints are weak references; deleting an endpoint
/// invalidates its edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Uuid,
    pub relationship_type: RelationshipType,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub properties: HashMap<String, serde_json::Value>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(relationship_type: RelationshipType, source_id: Uuid, target_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            relationship_type,
            source_id,
            target_id,
            properties: HashMap::new(),
            confidence: 1.0,
            created_at: Utc::now(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Traversal weight; defaults to 1.0 when absent.
    pub fn weight(&self) -> f64 {
        self.properties
            .get("weight")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0)
    }

    /// Monetary amount carried by transfer edges.
    pub fn amount(&self) -> Option<rust_decimal::Decimal> {
        match self.properties.get("amount") {
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            Some(serde_json::Value::Number(n)) => n.to_string().parse().ok(),
            _ => None,
        }
    }

    /// Event time carried by transfer edges; `created_at` otherwise.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.properties
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(self.created_at)
    }

    /// The endpoint opposite `id`, if `id` is an endpoint at all.
    pub fn other_endpoint(&self, id: Uuid) -> Option<Uuid> {
        if self.source_id == id {
            Some(self.target_id)
        } else if self.target_id == id {
            Some(self.source_id)
        } else {
            None
        }
    }
}

/// A traversal path: `entities[i] -(relationships[i])-> entities[i+1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphPath {
    pub entities: Vec<Uuid>,
    pub relationships: Vec<Uuid>,
    pub total_weight: f64,
}

impl GraphPath {
    /// Number of edges.
    pub fn len(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relationships.is_empty()
    }

    /// Path with entity sequence and edges reversed.
    pub fn reversed(&self) -> GraphPath {
        GraphPath {
            entities: self.entities.iter().rev().copied().collect(),
            relationships: self.relationships.iter().rev().copied().collect(),
            total_weight: self.total_weight,
        }
    }

    /// Deterministic result order: length ascending, total weight
    /// ascending, then lexicographic entity sequence.
    pub fn compare(&self, other: &GraphPath) -> Ordering {
        self.len()
            .cmp(&other.len())
            .then_with(|| self.total_weight.total_cmp(&other.total_weight))
            .then_with(|| {
                for (a, b) in self.entities.iter().zip(other.entities.iter()) {
                    let ord = a.to_string().cmp(&b.to_string());
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            })
    }
}

/// Entities and relationships reachable from a root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Neighborhood {
    pub root: Option<Uuid>,
    pub entities: Vec<GraphEntity>,
    pub relationships: Vec<Relationship>,
}

/// A self-contained slice of the graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subgraph {
    pub entities: Vec<GraphEntity>,
    pub relationships: Vec<Relationship>,
}

impl Subgraph {
    pub fn entity(&self, id: Uuid) -> Option<&GraphEntity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn contains_entity(&self, id: Uuid) -> bool {
        self.entities.iter().any(|e| e.id == id)
    }

    /// Edges of the given types, or all edges when `types` is empty.
    pub fn relationships_of(&self, types: &[RelationshipType]) -> Vec<&Relationship> {
        self.relationships
            .iter()
            .filter(|r| types.is_empty() || types.contains(&r.relationship_type))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_round_trips() {
        for raw in ["PERSON", "ACCOUNT", "VESSEL"] {
            let parsed = EntityType::parse(raw);
            assert_eq!(parsed.as_str(), raw);
        }
        assert_eq!(EntityType::parse("VESSEL"), EntityType::Other("VESSEL".to_string()));
    }

    #[test]
    fn relationship_weight_defaults_to_one() {
        let rel = Relationship::new(RelationshipType::Owns, Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(rel.weight(), 1.0);

        let weighted = rel.with_property("weight", serde_json::json!(2.5));
        assert_eq!(weighted.weight(), 2.5);
    }

    #[test]
    fn path_ordering_is_deterministic() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let c = Uuid::from_u128(3);

        let short = GraphPath {
            entities: vec![a, b],
            relationships: vec![Uuid::new_v4()],
            total_weight: 5.0,
        };
        let long_light = GraphPath {
            entities: vec![a, b, c],
            relationships: vec![Uuid::new_v4(), Uuid::new_v4()],
            total_weight: 1.0,
        };
        // Shorter wins regardless of weight.
        assert_eq!(short.compare(&long_light), Ordering::Less);

        let same_len_heavier = GraphPath {
            entities: vec![a, c],
            relationships: vec![Uuid::new_v4()],
            total_weight: 6.0,
        };
        assert_eq!(short.compare(&same_len_heavier), Ordering::Less);
    }

    #[test]
    fn reversed_path_preserves_weight() {
        let path = GraphPath {
            entities: vec![Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3)],
            relationships: vec![Uuid::from_u128(10), Uuid::from_u128(11)],
            total_weight: 2.0,
        };
        let rev = path.reversed();
        assert_eq!(rev.entities[0], Uuid::from_u128(3));
        assert_eq!(rev.relationships[0], Uuid::from_u128(11));
        assert_eq!(rev.total_weight, 2.0);
        assert_eq!(rev.reversed(), path);
    }

    #[test]
    fn transfer_edge_carries_amount_and_time() {
        let rel = Relationship::new(RelationshipType::TransferredTo, Uuid::new_v4(), Uuid::new_v4())
            .with_property("amount", serde_json::json!("9500"))
            .with_property("timestamp", serde_json::json!("2026-07-01T10:00:00Z"));
        assert_eq!(rel.amount().unwrap(), rust_decimal::Decimal::new(9_500, 0));
        assert_eq!(rel.occurred_at().to_rfc3339(), "2026-07-01T10:00:00+00:00");
    }
}
