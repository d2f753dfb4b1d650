use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MeshError;

use super::state::{JobStatus, StepStatus};

/// Job type assigned to a stepped job submitted without one.
pub const WORKFLOW_JOB_TYPE: &str = "workflow";

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// How the steps of a multi-step job are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// In declared order, condition-gated, fail-fast.
    #[default]
    Serial,
    /// All at once, no ordering and no conditions.
    Parallel,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Serial => write!(f, "serial"),
            ExecutionMode::Parallel => write!(f, "parallel"),
        }
    }
}

/// Declaration of one step, as submitted by a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub id: String,
    pub command_id: String,
    #[serde(default = "empty_object")]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, command_id: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            command_id: command_id.into(),
            args,
            name: None,
            condition: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// What a producer hands to `JobStore::add_job`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(default = "empty_object")]
    pub request: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
}

impl JobSpec {
    /// A single-command job.
    pub fn command(job_type: impl Into<String>, request: Value) -> Self {
        Self {
            job_type: Some(job_type.into()),
            request,
            steps: None,
            mode: None,
        }
    }

    pub fn serial(steps: Vec<StepSpec>) -> Self {
        Self::stepped(steps, ExecutionMode::Serial)
    }

    pub fn parallel(steps: Vec<StepSpec>) -> Self {
        Self::stepped(steps, ExecutionMode::Parallel)
    }

    fn stepped(steps: Vec<StepSpec>, mode: ExecutionMode) -> Self {
        Self {
            job_type: None,
            request: empty_object(),
            steps: Some(steps),
            mode: Some(mode),
        }
    }

    fn validate(&self) -> Result<(), MeshError> {
        let steps = match self.steps.as_deref() {
            Some(steps) if !steps.is_empty() => steps,
            _ => {
                let has_type = self
                    .job_type
                    .as_deref()
                    .is_some_and(|t| !t.trim().is_empty());
                if !has_type {
                    return Err(MeshError::InvalidJob(
                        "a job without steps needs a command type".into(),
                    ));
                }
                return Ok(());
            }
        };

        // Ids and names share one lookup namespace for conditions.
        let mut keys = HashSet::new();
        for step in steps {
            if step.id.trim().is_empty() {
                return Err(MeshError::InvalidJob("step id must not be empty".into()));
            }
            if step.command_id.trim().is_empty() {
                return Err(MeshError::InvalidJob(format!(
                    "step `{}` has no command",
                    step.id
                )));
            }
            if !keys.insert(step.id.as_str()) {
                return Err(MeshError::InvalidJob(format!(
                    "duplicate step key `{}`",
                    step.id
                )));
            }
        }
        for step in steps {
            if let Some(name) = step.name.as_deref()
                && name != step.id
                && !keys.insert(name)
            {
                return Err(MeshError::InvalidJob(format!("duplicate step key `{name}`")));
            }
        }
        Ok(())
    }
}

/// One unit inside a multi-step job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub command_id: String,
    #[serde(default = "empty_object")]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl From<StepSpec> for Step {
    fn from(spec: StepSpec) -> Self {
        Self {
            id: spec.id,
            command_id: spec.command_id,
            args: spec.args,
            name: spec.name,
            condition: spec.condition,
            status: StepStatus::Pending,
            result: None,
        }
    }
}

impl Step {
    /// Compact `{id, name?, status, result}` view used in job results.
    pub fn summary(&self) -> Value {
        let mut summary = serde_json::json!({
            "id": self.id,
            "status": self.status,
            "result": self.result.clone().unwrap_or(Value::Null),
        });
        if let Some(name) = &self.name {
            summary["name"] = Value::String(name.clone());
        }
        summary
    }
}

/// A trackable unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default = "empty_object")]
    pub request: Value,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Step>>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Builds a fresh `queued` job from a validated spec.
    pub fn new(spec: JobSpec) -> Result<Self, MeshError> {
        spec.validate()?;
        let now = Utc::now();
        let steps = spec
            .steps
            .filter(|steps| !steps.is_empty())
            .map(|steps| steps.into_iter().map(Step::from).collect::<Vec<_>>());
        let job_type = match spec.job_type.filter(|t| !t.trim().is_empty()) {
            Some(t) => t,
            None => WORKFLOW_JOB_TYPE.to_string(),
        };

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            job_type,
            request: spec.request,
            status: JobStatus::Queued,
            steps,
            mode: spec.mode.unwrap_or_default(),
            result: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn has_steps(&self) -> bool {
        self.steps.as_ref().is_some_and(|s| !s.is_empty())
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.as_ref()?.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.as_mut()?.iter_mut().find(|s| s.id == step_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Partial update applied through `JobStore::update_job`.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    /// Full replacement of the step list; ids and length must not change.
    pub steps: Option<Vec<Step>>,
    pub result: Option<Value>,
}

/// Terminal result of running a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Value),
    Failed(Value),
}

impl JobOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        JobOutcome::Failed(Value::String(message.into()))
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }

    pub fn result(&self) -> &Value {
        match self {
            JobOutcome::Completed(v) | JobOutcome::Failed(v) => v,
        }
    }

    pub fn into_result(self) -> Value {
        match self {
            JobOutcome::Completed(v) | JobOutcome::Failed(v) => v,
        }
    }
}
