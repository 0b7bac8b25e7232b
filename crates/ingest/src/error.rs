use crate::model::ValidationIssue;
use aegis_core::error::ErrorKind;
use aegis_graph::GraphError;
use thiserror::Error;
use uuid::Uuid;

/// Ingestion pipeline errors.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("transaction {transaction_id} failed validation")]
    Invalid {
        transaction_id: Uuid,
        issues: Vec<ValidationIssue>,
    },

    #[error("ambiguous entity match for '{name}': {candidates} equally strong candidates")]
    Ambiguous { name: String, candidates: usize },

    #[error("entity conflict for key '{key}': {message}")]
    EntityConflict { key: String, message: String },

    #[error("file exceeds maximum size: {size} > {limit}")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("ingestion job not found: {id}")]
    JobNotFound { id: Uuid },

    #[error("batch {batch_id} failed permanently after {attempts} attempts: {message}")]
    BatchFailed {
        batch_id: Uuid,
        attempts: u32,
        message: String,
    },

    #[error("graph store error: {0}")]
    Storage(#[from] GraphError),

    #[error("downstream error: {0}")]
    Downstream(aegis_core::Error),

    #[error("core error: {0}")]
    Core(#[from] aegis_core::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IngestError {
    /// Taxonomy kind; preserved when wrapped by callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Invalid { .. } => ErrorKind::Invalid,
            IngestError::Ambiguous { .. } => ErrorKind::Conflict,
            IngestError::EntityConflict { .. } => ErrorKind::Conflict,
            IngestError::FileTooLarge { .. } => ErrorKind::Invalid,
            IngestError::JobNotFound { .. } => ErrorKind::NotFound,
            IngestError::BatchFailed { .. } => ErrorKind::Permanent,
            IngestError::Storage(e) => e.kind(),
            IngestError::Downstream(e) | IngestError::Core(e) => e.kind,
            IngestError::Serialization(_) => ErrorKind::Invalid,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<IngestError> for aegis_core::Error {
    fn from(err: IngestError) -> Self {
        aegis_core::Error::new(err.kind(), err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
