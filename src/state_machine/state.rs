use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;

use super::job::{Job, Step};

/// Lifecycle status of a job.
///
/// Each job flows through: QUEUED → RUNNING → COMPLETED | FAILED
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward-only transition table.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle status of a single step inside a multi-step job.
///
/// PENDING → RUNNING → COMPLETED | FAILED, or PENDING → SKIPPED
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Pending, StepStatus::Skipped)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Failed)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A validated status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
}

/// Applies status changes to jobs and steps, refusing anything that is not
/// a forward move in the lifecycle.
pub struct StateMachine;

impl StateMachine {
    pub fn advance_job(job: &mut Job, next: JobStatus) -> Result<Transition<JobStatus>, MeshError> {
        let from = job.status;
        if !from.can_transition_to(next) {
            return Err(MeshError::InvalidTransition {
                kind: "job",
                id: job.id.clone(),
                from: from.to_string(),
                to: next.to_string(),
            });
        }
        job.status = next;
        Ok(Transition { from, to: next })
    }

    pub fn advance_step(
        step: &mut Step,
        next: StepStatus,
    ) -> Result<Transition<StepStatus>, MeshError> {
        let from = step.status;
        if !from.can_transition_to(next) {
            return Err(MeshError::InvalidTransition {
                kind: "step",
                id: step.id.clone(),
                from: from.to_string(),
                to: next.to_string(),
            });
        }
        step.status = next;
        Ok(Transition { from, to: next })
    }

    /// Checks that `next` is reachable from `current` through zero or more
    /// forward moves. Used when a whole step list is replaced at once.
    pub fn step_reachable(current: StepStatus, next: StepStatus) -> bool {
        if current == next {
            return true;
        }
        current.can_transition_to(next)
            || (current == StepStatus::Pending && StepStatus::Running.can_transition_to(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::JobSpec;

    fn make_job() -> Job {
        Job::new(JobSpec::command("create_agent", serde_json::json!({"name": "Scout"}))).unwrap()
    }

    #[test]
    fn happy_path_walks_all_states() {
        let mut job = make_job();
        assert_eq!(job.status, JobStatus::Queued);

        let t = StateMachine::advance_job(&mut job, JobStatus::Running).unwrap();
        assert_eq!(t.from, JobStatus::Queued);
        assert_eq!(job.status, JobStatus::Running);

        StateMachine::advance_job(&mut job, JobStatus::Completed).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn terminal_job_never_reverts() {
        let mut job = make_job();
        StateMachine::advance_job(&mut job, JobStatus::Running).unwrap();
        StateMachine::advance_job(&mut job, JobStatus::Failed).unwrap();

        let err = StateMachine::advance_job(&mut job, JobStatus::Running).unwrap_err();
        assert!(matches!(err, MeshError::InvalidTransition { kind: "job", .. }));
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn queued_cannot_skip_running() {
        let mut job = make_job();
        assert!(StateMachine::advance_job(&mut job, JobStatus::Completed).is_err());
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn step_transitions() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Skipped));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Failed));
        assert!(!StepStatus::Skipped.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Running.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Pending));
    }

    #[test]
    fn step_reachable_allows_multi_hop_forward_moves() {
        assert!(StateMachine::step_reachable(StepStatus::Pending, StepStatus::Completed));
        assert!(StateMachine::step_reachable(StepStatus::Pending, StepStatus::Failed));
        assert!(StateMachine::step_reachable(StepStatus::Running, StepStatus::Running));
        assert!(!StateMachine::step_reachable(StepStatus::Completed, StepStatus::Pending));
        assert!(!StateMachine::step_reachable(StepStatus::Failed, StepStatus::Completed));
    }

    #[test]
    fn status_display() {
        assert_eq!(JobStatus::Queued.to_string(), "queued");
        assert_eq!(JobStatus::Running.to_string(), "running");
        assert_eq!(StepStatus::Skipped.to_string(), "skipped");
        assert_eq!(StepStatus::Pending.to_string(), "pending");
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Completed).unwrap(), r#""completed""#);
        let s: StepStatus = serde_json::from_str(r#""skipped""#).unwrap();
        assert_eq!(s, StepStatus::Skipped);
    }
}
