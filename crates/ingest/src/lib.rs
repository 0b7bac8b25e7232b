pub mod batch;
pub mod error;
pub mod jobs;
pub mod model;
pub mod pipeline;
pub mod resolver;
pub mod validation;

pub use batch::{FlushOutcome, TransactionBatcher};
pub use error::{IngestError, Result};
pub use jobs::{IngestionJob, IngestionJobStore, JobKind, JobState};
pub use model::{
    IssueSeverity, PaymentMethod, Transaction, TransactionStatus, TransactionType,
    ValidationIssue, ValidationResult,
};
pub use pipeline::{FileUploadRequest, IngestResponse, IngestionPipeline, RecordAck};
pub use resolver::{
    CandidateRecord, EntityResolver, MatchOutcome, MatchReason, MatchStrategy,
    ProposedRelationship, ResolutionRequest,
};
pub use validation::ValidationPipeline;
