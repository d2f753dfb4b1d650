//! The command layer contract consumed by the engine.
//!
//! The engine only ever calls [`CommandDispatcher::execute`]. Every side
//! effect on mesh entities happens behind it, so new commands never require
//! scheduler changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::artifact::{Artifact, ArtifactSink};
use crate::error::MeshError;
use crate::state_machine::{Job, JobSpec};
use crate::store::JobStore;

/// Failure of a single dispatched command. Aborts the job it belongs to and
/// nothing else.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("invalid arguments for `{command}`: {message}")]
    InvalidArgs { command: String, message: String },

    #[error("{0}")]
    Failed(String),

    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("`{command}` panicked: {message}")]
    Panicked { command: String, message: String },

    #[error("language model error: {0}")]
    Model(#[from] AnthropicError),

    #[error(transparent)]
    Engine(#[from] MeshError),
}

impl CommandError {
    pub fn failed(message: impl Into<String>) -> Self {
        CommandError::Failed(message.into())
    }
}

/// Maps a command identifier to its side-effecting implementation.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn execute(
        &self,
        command_id: &str,
        args: &Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, CommandError>;
}

/// What a running command can see and reach besides its own arguments.
#[derive(Clone)]
pub struct ExecutionContext {
    pub job_id: String,
    pub job_type: String,
    pub step_id: Option<String>,
    request: Value,
    vars: Map<String, Value>,
    jobs: JobStore,
    artifacts: Arc<dyn ArtifactSink>,
}

impl ExecutionContext {
    pub fn new(
        job: &Job,
        jobs: JobStore,
        artifacts: Arc<dyn ArtifactSink>,
        vars: Map<String, Value>,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            step_id: None,
            request: job.request.clone(),
            vars,
            jobs,
            artifacts,
        }
    }

    pub fn for_step(&self, step_id: &str) -> Self {
        Self {
            step_id: Some(step_id.to_string()),
            ..self.clone()
        }
    }

    /// Variables configured for the engine.
    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    /// Schedules a follow-up job. It is queued behind everything already
    /// waiting and never runs inside the current job.
    pub fn enqueue(&self, spec: JobSpec) -> Result<Job, MeshError> {
        self.jobs.add_job(spec)
    }

    pub fn save_artifact(
        &self,
        artifact_type: &str,
        name: &str,
        content: Value,
    ) -> Result<Artifact, MeshError> {
        let artifact = Artifact::new(&self.job_id, artifact_type, name, content);
        self.artifacts.record(artifact.clone())?;
        Ok(artifact)
    }

    /// The value conditions see under `context`: configured variables plus
    /// `job: {id, type, request}`.
    pub fn condition_scope(&self) -> Value {
        let mut scope = self.vars.clone();
        scope.insert(
            "job".to_string(),
            json!({
                "id": self.job_id,
                "type": self.job_type,
                "request": self.request,
            }),
        );
        Value::Object(scope)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStore;

    fn context(store: &JobStore, artifacts: Arc<ArtifactStore>) -> ExecutionContext {
        let job = store
            .add_job(JobSpec::command("create_agent", json!({"name": "Scout"})))
            .unwrap();
        let mut vars = Map::new();
        vars.insert("env".into(), json!("staging"));
        ExecutionContext::new(&job, store.clone(), artifacts, vars)
    }

    #[test]
    fn condition_scope_exposes_job_and_vars() {
        let store = JobStore::in_memory();
        let ctx = context(&store, Arc::new(ArtifactStore::in_memory()));
        let scope = ctx.condition_scope();
        assert_eq!(scope["env"], "staging");
        assert_eq!(scope["job"]["type"], "create_agent");
        assert_eq!(scope["job"]["request"]["name"], "Scout");
    }

    #[test]
    fn enqueue_adds_follow_up_job() {
        let store = JobStore::in_memory();
        let ctx = context(&store, Arc::new(ArtifactStore::in_memory()));
        let follow_up = ctx
            .enqueue(JobSpec::command("list_agents", json!({})))
            .unwrap();
        assert_eq!(store.jobs().len(), 2);
        assert_eq!(store.jobs()[1].id, follow_up.id);
    }

    #[test]
    fn save_artifact_is_tagged_with_job() {
        let store = JobStore::in_memory();
        let artifacts = Arc::new(ArtifactStore::in_memory());
        let ctx = context(&store, artifacts.clone()).for_step("s1");
        assert_eq!(ctx.step_id.as_deref(), Some("s1"));

        let saved = ctx.save_artifact("text", "notes.txt", json!("hello")).unwrap();
        assert_eq!(saved.job_id, ctx.job_id);
        assert_eq!(artifacts.for_job(&ctx.job_id).unwrap().len(), 1);
    }

    #[test]
    fn command_error_display() {
        let err = CommandError::TimedOut {
            command: "ask_model".into(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "`ask_model` timed out after 30s");
        let short = CommandError::TimedOut {
            command: "list_agents".into(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(short.to_string(), "`list_agents` timed out after 250ms");
        assert_eq!(CommandError::failed("boom").to_string(), "boom");
    }
}
