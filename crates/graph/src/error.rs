use aegis_core::error::ErrorKind;
use thiserror::Error;
use uuid::Uuid;

/// Graph engine errors.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("entity not found: {id}")]
    EntityNotFound { id: Uuid },

    #[error("relationship not found: {id}")]
    RelationshipNotFound { id: Uuid },

    #[error("relationship {relationship} references missing endpoint {endpoint}")]
    EndpointMissing { relationship: Uuid, endpoint: Uuid },

    #[error("projection not found: {name}")]
    ProjectionNotFound { name: String },

    #[error("projection already exists: {name}")]
    ProjectionExists { name: String },

    #[error("analysis cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("deadline exceeded: {operation}")]
    DeadlineExceeded { operation: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("core error: {0}")]
    Core(#[from] aegis_core::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    /// Taxonomy kind; preserved when upper layers wrap this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::EntityNotFound { .. }
            | GraphError::RelationshipNotFound { .. }
            | GraphError::ProjectionNotFound { .. } => ErrorKind::NotFound,
            GraphError::EndpointMissing { .. } | GraphError::ProjectionExists { .. } => {
                ErrorKind::Conflict
            }
            GraphError::Cancelled { .. } | GraphError::DeadlineExceeded { .. } => ErrorKind::Timeout,
            GraphError::InvalidRequest { .. } => ErrorKind::Invalid,
            GraphError::Database(e) => match e {
                sqlx::Error::RowNotFound => ErrorKind::NotFound,
                sqlx::Error::PoolTimedOut => ErrorKind::Timeout,
                sqlx::Error::Io(_) | sqlx::Error::PoolClosed => ErrorKind::Transient,
                _ => ErrorKind::Permanent,
            },
            GraphError::Core(e) => e.kind,
            GraphError::Serialization(_) => ErrorKind::Invalid,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<GraphError> for aegis_core::Error {
    fn from(err: GraphError) -> Self {
        aegis_core::Error::new(err.kind(), err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
