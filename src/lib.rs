//! Job orchestration for an agent mesh.
//!
//! Producers enqueue [`Job`]s into a [`JobStore`]. A single-flight
//! [`Scheduler`] picks them up in FIFO order and hands each to the
//! [`StepExecutor`], which runs either one command or a serial/parallel list
//! of steps through a [`CommandDispatcher`]. Successful jobs leave a
//! `result.json` [`Artifact`], and every job start and finish is appended to
//! the audit trail.

pub mod anthropic;
pub mod artifact;
pub mod audit;
pub mod commands;
pub mod condition;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod lock;
pub mod mesh;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod ui;

pub use artifact::{Artifact, ArtifactSink, ArtifactStore, RESULT_ARTIFACT};
pub use audit::{AuditEntry, AuditLog, AuditSink};
pub use commands::MeshCommands;
pub use config::MeshConfig;
pub use dispatcher::{CommandDispatcher, CommandError, ExecutionContext};
pub use error::MeshError;
pub use executor::StepExecutor;
pub use lock::RunnerLock;
pub use mesh::MeshStore;
pub use scheduler::{Scheduler, TickOutcome};
pub use state_machine::{
    ExecutionMode, Job, JobOutcome, JobSpec, JobStatus, Step, StepSpec, StepStatus,
};
pub use store::JobStore;
