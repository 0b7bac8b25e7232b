use aegis_core::error::ErrorKind;
use thiserror::Error;
use uuid::Uuid;

/// Alert, investigation, evidence, and workflow errors.
#[derive(Error, Debug)]
pub enum CaseError {
    #[error("alert not found: {id}")]
    AlertNotFound { id: Uuid },

    #[error("investigation not found: {id}")]
    InvestigationNotFound { id: Uuid },

    #[error("evidence not found: {id}")]
    EvidenceNotFound { id: Uuid },

    #[error("workflow template not found: {id}")]
    TemplateNotFound { id: String },

    #[error("workflow instance not found: {id}")]
    InstanceNotFound { id: Uuid },

    #[error("workflow step not found: {name}")]
    StepNotFound { name: String },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("archived investigation {id} is read-only")]
    ArchivedImmutable { id: Uuid },

    #[error("no step handler registered for '{handler}'")]
    HandlerMissing { handler: String },

    #[error("core error: {0}")]
    Core(#[from] aegis_core::Error),

    #[error("graph error: {0}")]
    Graph(#[from] aegis_graph::GraphError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CaseError {
    /// Taxonomy kind; preserved when wrapped. An `Overloaded` audit
    /// failure surfaces as `Overloaded` so callers abort the transition.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaseError::AlertNotFound { .. }
            | CaseError::InvestigationNotFound { .. }
            | CaseError::EvidenceNotFound { .. }
            | CaseError::TemplateNotFound { .. }
            | CaseError::InstanceNotFound { .. }
            | CaseError::StepNotFound { .. } => ErrorKind::NotFound,
            CaseError::InvalidTransition { .. } | CaseError::ArchivedImmutable { .. } => {
                ErrorKind::Conflict
            }
            CaseError::HandlerMissing { .. } => ErrorKind::Invalid,
            CaseError::Core(e) => e.kind,
            CaseError::Graph(e) => e.kind(),
            CaseError::Serialization(_) => ErrorKind::Invalid,
        }
    }
}

impl From<CaseError> for aegis_core::Error {
    fn from(err: CaseError) -> Self {
        aegis_core::Error::new(err.kind(), err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CaseError>;
