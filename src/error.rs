use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the job store and the engine around it.
///
/// Command and condition failures have their own types
/// ([`CommandError`](crate::dispatcher::CommandError),
/// [`ConditionError`](crate::condition::ConditionError)) because they are
/// contained inside a single job and never reach the scheduler loop.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Step `{step_id}` not found in job {job_id}")]
    StepNotFound { job_id: String, step_id: String },

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Illegal {kind} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Timed out waiting for lock {}", .0.display())]
    LockTimeout(PathBuf),

    #[error("Another runner is active ({})", .0.display())]
    RunnerActive(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
