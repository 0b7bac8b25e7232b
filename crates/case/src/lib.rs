pub mod alerts;
pub mod error;
pub mod evidence;
pub mod investigations;
pub mod model;
pub mod repository;
pub mod rules;
pub mod workflow;

pub use alerts::{AlertManager, EmitCompensator, PatternAction};
pub use error::{CaseError, Result};
pub use evidence::{EvidenceSubmission, EvidenceVault};
pub use investigations::{InvestigationManager, OpenInvestigation};
pub use model::{
    Alert, AlertStatus, ChainVerification, CustodyAction, CustodyEntry, Evidence,
    Investigation, InvestigationFilter, InvestigationStatus,
};
pub use repository::CaseRepository;
pub use rules::{AlertRule, AlertRuleTable};
pub use workflow::{
    InstanceStatus, OverdueStep, StepHandler, StepKind, StepStatus, StepTemplate,
    WorkflowEngine, WorkflowInstance, WorkflowStep, WorkflowTemplate,
};
