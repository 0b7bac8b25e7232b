pub mod analytics;
pub mod error;
pub mod model;
pub mod patterns;
pub mod store;

pub use analytics::{AnalysisScope, AnalyticsEngine};
pub use error::{GraphError, Result};
pub use model::{
    EntityType, GraphEntity, GraphPath, Neighborhood, Relationship, RelationshipType, Subgraph,
};
pub use patterns::{DetectionReport, DetectionRequest, PatternDetector, PatternMatch, PatternType};
pub use store::{
    GraphCommand, GraphStore, MemoryGraphStore, NodeFilter, PostgresGraphStore,
    ProjectionInfo, RelationshipFilter,
};
