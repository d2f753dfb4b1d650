mod job;
mod state;

pub use job::{
    ExecutionMode, Job, JobOutcome, JobPatch, JobSpec, Step, StepSpec, WORKFLOW_JOB_TYPE,
};
pub use state::{JobStatus, StateMachine, StepStatus, Transition};
