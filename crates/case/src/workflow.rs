//! # Investigation Workflows
//!
//! A workflow template is an ordered list of steps; an instance is one
//! enactment attached to an investigation. Steps are manual (an analyst
//! marks them complete) or automated (the engine calls a registered
//! handler). Overdue steps escalate per their retry policy.

use crate::error::{CaseError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepKind {
    Manual,
    Automated { handler: String },
}

/// One step of a workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    pub name: String,
    pub kind: StepKind,
    /// Deadline measured from step start.
    pub deadline_secs: i64,
    /// Overdue escalations allowed before the step is marked escalated.
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    pub steps: Vec<StepTemplate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Escalated,
}

/// Runtime state of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub assignee: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub retries: u32,
    max_retries: u32,
    deadline_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
}

/// A running enactment of a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub template_id: String,
    pub investigation_id: Uuid,
    pub status: InstanceStatus,
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Index of the first step that is not yet complete.
    fn active_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| !matches!(s.status, StepStatus::Completed))
    }
}

/// Automated step implementation registered by the hosting process.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(
        &self,
        instance_id: Uuid,
        investigation_id: Uuid,
        step_name: &str,
    ) -> aegis_core::error::Result<serde_json::Value>;
}

/// A step that went overdue; surfaced to the alerting layer.
#[derive(Debug, Clone)]
pub struct OverdueStep {
    pub instance_id: Uuid,
    pub investigation_id: Uuid,
    pub step_name: String,
    pub assignee: Option<String>,
    pub escalated: bool,
}

pub struct WorkflowEngine {
    templates: RwLock<HashMap<String, WorkflowTemplate>>,
    instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
    handlers: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
}

impl WorkflowEngine {
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_template(&self, template: WorkflowTemplate) {
        self.templates
            .write()
            .await
            .insert(template.id.clone(), template);
    }

    pub async fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.write().await.insert(name.into(), handler);
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<WorkflowInstance> {
        self.instances
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CaseError::InstanceNotFound { id })
    }

    /// Start an instance and drive automated steps until a manual step or
    /// completion.
    pub async fn start_instance(
        &self,
        template_id: &str,
        investigation_id: Uuid,
        assignee: Option<String>,
    ) -> Result<WorkflowInstance> {
        let template = self
            .templates
            .read()
            .await
            .get(template_id)
            .cloned()
            .ok_or_else(|| CaseError::TemplateNotFound {
                id: template_id.to_string(),
            })?;

        let steps = template
            .steps
            .iter()
            .map(|step| WorkflowStep {
                name: step.name.clone(),
                kind: step.kind.clone(),
                status: StepStatus::Pending,
                assignee: assignee.clone(),
                deadline: None,
                started_at: None,
                completed_at: None,
                output: None,
                retries: 0,
                max_retries: step.max_retries,
                deadline_secs: step.deadline_secs,
            })
            .collect();

        let instance = WorkflowInstance {
            id: Uuid::new_v4(),
            template_id: template.id.clone(),
            investigation_id,
            status: InstanceStatus::Running,
            steps,
            created_at: Utc::now(),
        };
        self.instances
            .write()
            .await
            .insert(instance.id, instance.clone());
        info!(instance = %instance.id, template = %template.id, "workflow started");

        self.advance(instance.id).await?;
        self.get_instance(instance.id).await
    }

    /// Mark a manual step complete.
    pub async fn complete_step(
        &self,
        instance_id: Uuid,
        step_name: &str,
        actor: &str,
        output: serde_json::Value,
    ) -> Result<WorkflowInstance> {
        {
            let mut instances = self.instances.write().await;
            let instance = instances
                .get_mut(&instance_id)
                .ok_or(CaseError::InstanceNotFound { id: instance_id })?;
            let step = instance
                .steps
                .iter_mut()
                .find(|s| s.name == step_name)
                .ok_or_else(|| CaseError::StepNotFound {
                    name: step_name.to_string(),
                })?;
            if !matches!(step.status, StepStatus::InProgress | StepStatus::Escalated) {
                return Err(CaseError::InvalidTransition {
                    from: format!("{:?}", step.status),
                    to: "completed".to_string(),
                });
            }
            step.status = StepStatus::Completed;
            step.completed_at = Some(Utc::now());
            step.assignee = Some(actor.to_string());
            step.output = Some(output);
        }
        self.advance(instance_id).await?;
        self.get_instance(instance_id).await
    }

    /// Drive the instance: start the next pending step; execute automated
    /// steps inline; stop at the first manual step awaiting an analyst.
    async fn advance(&self, instance_id: Uuid) -> Result<()> {
        loop {
            let (step_index, handler_name) = {
                let mut instances = self.instances.write().await;
                let instance = instances
                    .get_mut(&instance_id)
                    .ok_or(CaseError::InstanceNotFound { id: instance_id })?;

                let Some(index) = instance.active_step() else {
                    instance.status = InstanceStatus::Completed;
                    info!(instance = %instance_id, "workflow completed");
                    return Ok(());
                };
                let step = &mut instance.steps[index];
                match step.status {
                    StepStatus::Pending => {
                        step.status = StepStatus::InProgress;
                        step.started_at = Some(Utc::now());
                        step.deadline =
                            Some(Utc::now() + Duration::seconds(step.deadline_secs));
                    }
                    // Waiting on an analyst or already running.
                    StepStatus::InProgress | StepStatus::Escalated => return Ok(()),
                    StepStatus::Failed => {
                        instance.status = InstanceStatus::Failed;
                        return Ok(());
                    }
                    StepStatus::Completed => unreachable!("active step is never completed"),
                }
                match &step.kind {
                    StepKind::Manual => return Ok(()),
                    StepKind::Automated { handler } => (index, handler.clone()),
                }
            };

            // Automated step: call the handler outside the lock.
            let handler = self
                .handlers
                .read()
                .await
                .get(&handler_name)
                .cloned()
                .ok_or_else(|| CaseError::HandlerMissing {
                    handler: handler_name.clone(),
                })?;
            let investigation_id = self.get_instance(instance_id).await?.investigation_id;
            let step_name = self.get_instance(instance_id).await?.steps[step_index]
                .name
                .clone();
            let outcome = handler
                .execute(instance_id, investigation_id, &step_name)
                .await;

            let mut instances = self.instances.write().await;
            let instance = instances
                .get_mut(&instance_id)
                .ok_or(CaseError::InstanceNotFound { id: instance_id })?;
            let step = &mut instance.steps[step_index];
            match outcome {
                Ok(output) => {
                    step.status = StepStatus::Completed;
                    step.completed_at = Some(Utc::now());
                    step.output = Some(output);
                }
                Err(e) => {
                    warn!(instance = %instance_id, step = %step_name, error = %e, "automated step failed");
                    step.status = StepStatus::Failed;
                    step.output = Some(serde_json::json!({"error": e.to_string()}));
                    instance.status = InstanceStatus::Failed;
                    return Ok(());
                }
            }
        }
    }

    /// Sweep for overdue steps; each sweep past the deadline consumes one
    /// retry, and exhausting retries escalates the step.
    pub async fn check_overdue(&self, now: DateTime<Utc>) -> Vec<OverdueStep> {
        let mut overdue = Vec::new();
        let mut instances = self.instances.write().await;
        for instance in instances.values_mut() {
            if instance.status != InstanceStatus::Running {
                continue;
            }
            for step in &mut instance.steps {
                if step.status != StepStatus::InProgress {
                    continue;
                }
                let Some(deadline) = step.deadline else {
                    continue;
                };
                if now <= deadline {
                    continue;
                }
                step.retries += 1;
                let escalated = step.retries > step.max_retries;
                if escalated {
                    step.status = StepStatus::Escalated;
                } else {
                    // Push the deadline out for the next retry.
                    step.deadline = Some(now + Duration::seconds(step.deadline_secs));
                }
                overdue.push(OverdueStep {
                    instance_id: instance.id,
                    investigation_id: instance.investigation_id,
                    step_name: step.name.clone(),
                    assignee: step.assignee.clone(),
                    escalated,
                });
            }
        }
        overdue
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}
