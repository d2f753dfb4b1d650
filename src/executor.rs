//! Runs one job to completion against the command layer.
//!
//! - No steps: `job.type` is dispatched once with `job.request`.
//! - Serial: steps run in declared order, gated by their conditions,
//!   fail-fast. Each step's status is persisted as it changes.
//! - Parallel: all steps are dispatched together and the settled step list
//!   is written back in one replace.
//!
//! The executor never mutates mesh entities itself and never returns an
//! error: anything that goes wrong inside a job becomes a failed
//! [`JobOutcome`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::artifact::ArtifactSink;
use crate::condition::{self, StepLookup};
use crate::dispatcher::{CommandDispatcher, CommandError, ExecutionContext};
use crate::state_machine::{
    ExecutionMode, Job, JobOutcome, StateMachine, Step, StepStatus,
};
use crate::store::JobStore;

/// Result recorded on a step whose condition did not hold.
pub const CONDITION_NOT_MET: &str = "Condition not met";

pub struct StepExecutor {
    store: JobStore,
    dispatcher: Arc<dyn CommandDispatcher>,
    artifacts: Arc<dyn ArtifactSink>,
    step_timeout: Option<Duration>,
    vars: Map<String, Value>,
}

impl StepExecutor {
    pub fn new(
        store: JobStore,
        dispatcher: Arc<dyn CommandDispatcher>,
        artifacts: Arc<dyn ArtifactSink>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            artifacts,
            step_timeout: None,
            vars: Map::new(),
        }
    }

    /// Upper bound for every single dispatch. `None` waits forever.
    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Variables exposed to commands and to conditions as `context.*`.
    pub fn with_vars(mut self, vars: Map<String, Value>) -> Self {
        self.vars = vars;
        self
    }

    pub async fn run(&self, job: &Job) -> JobOutcome {
        let ctx = ExecutionContext::new(
            job,
            self.store.clone(),
            self.artifacts.clone(),
            self.vars.clone(),
        );
        if !job.has_steps() {
            return self.run_single(job, &ctx).await;
        }
        match job.mode {
            ExecutionMode::Serial => self.run_serial(job, &ctx).await,
            ExecutionMode::Parallel => self.run_parallel(job, &ctx).await,
        }
    }

    async fn run_single(&self, job: &Job, ctx: &ExecutionContext) -> JobOutcome {
        match self.dispatch(&job.job_type, &job.request, ctx).await {
            Ok(result) => JobOutcome::Completed(result),
            Err(e) => {
                warn!(job_id = %job.id, command = %job.job_type, error = %e, "Command failed");
                JobOutcome::failed(e.to_string())
            }
        }
    }

    async fn run_serial(&self, job: &Job, ctx: &ExecutionContext) -> JobOutcome {
        let steps = job.steps.clone().unwrap_or_default();
        let scope = ctx.condition_scope();
        let mut lookup = StepLookup::new();
        let mut summaries = Vec::with_capacity(steps.len());

        for mut step in steps {
            if let Some(expr) = step.condition.as_deref()
                && !condition::is_met(expr, &lookup, &scope)
            {
                debug!(job_id = %job.id, step_id = %step.id, condition = expr, "Step skipped");
                self.advance(
                    &job.id,
                    &mut step,
                    StepStatus::Skipped,
                    Some(Value::String(CONDITION_NOT_MET.to_string())),
                );
                lookup.record(&step);
                summaries.push(step.summary());
                continue;
            }

            self.advance(&job.id, &mut step, StepStatus::Running, None);
            let outcome = self
                .dispatch(&step.command_id, &step.args, &ctx.for_step(&step.id))
                .await;

            match outcome {
                Ok(result) => {
                    debug!(job_id = %job.id, step_id = %step.id, "Step completed");
                    self.advance(&job.id, &mut step, StepStatus::Completed, Some(result));
                    lookup.record(&step);
                    summaries.push(step.summary());
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(
                        job_id = %job.id,
                        step_id = %step.id,
                        command = %step.command_id,
                        error = %message,
                        "Step failed, aborting remaining steps"
                    );
                    self.advance(
                        &job.id,
                        &mut step,
                        StepStatus::Failed,
                        Some(Value::String(message.clone())),
                    );
                    return JobOutcome::failed(message);
                }
            }
        }

        JobOutcome::Completed(Value::Array(summaries))
    }

    async fn run_parallel(&self, job: &Job, ctx: &ExecutionContext) -> JobOutcome {
        let mut steps = job.steps.clone().unwrap_or_default();
        for step in &mut steps {
            if step.condition.is_some() {
                debug!(job_id = %job.id, step_id = %step.id, "Condition ignored in parallel mode");
            }
            step.status = StepStatus::Running;
        }
        self.replace_steps(&job.id, &steps);

        let outcomes = join_all(steps.iter().map(|step| {
            let step_ctx = ctx.for_step(&step.id);
            async move {
                self.dispatch(&step.command_id, &step.args, &step_ctx)
                    .await
            }
        }))
        .await;

        let mut failures = Vec::new();
        for (step, outcome) in steps.iter_mut().zip(outcomes) {
            match outcome {
                Ok(result) => {
                    step.status = StepStatus::Completed;
                    step.result = Some(result);
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(job_id = %job.id, step_id = %step.id, error = %message, "Parallel step failed");
                    step.status = StepStatus::Failed;
                    step.result = Some(Value::String(message.clone()));
                    failures.push(message);
                }
            }
        }
        self.replace_steps(&job.id, &steps);

        match failures.first() {
            None => JobOutcome::Completed(Value::Array(steps.iter().map(Step::summary).collect())),
            Some(first) => JobOutcome::failed(format!(
                "{} of {} parallel steps failed: {first}",
                failures.len(),
                steps.len()
            )),
        }
    }

    /// Dispatches one command under the step timeout, turning panics into
    /// command errors.
    async fn dispatch(
        &self,
        command_id: &str,
        args: &Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, CommandError> {
        debug!(job_id = %ctx.job_id, step_id = ?ctx.step_id, command = command_id, "Dispatching command");
        let call = AssertUnwindSafe(self.dispatcher.execute(command_id, args, ctx)).catch_unwind();

        let settled = match self.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(settled) => settled,
                Err(_) => {
                    return Err(CommandError::TimedOut {
                        command: command_id.to_string(),
                        timeout: limit,
                    });
                }
            },
            None => call.await,
        };

        settled.unwrap_or_else(|panic| {
            Err(CommandError::Panicked {
                command: command_id.to_string(),
                message: panic_message(panic.as_ref()),
            })
        })
    }

    /// Moves the local copy of a step forward and persists the change.
    /// Store failures are logged; the run continues on the local copy.
    fn advance(&self, job_id: &str, step: &mut Step, status: StepStatus, result: Option<Value>) {
        if let Err(e) = StateMachine::advance_step(step, status) {
            warn!(job_id, step_id = %step.id, error = %e, "Refused step transition");
            return;
        }
        if result.is_some() {
            step.result = result.clone();
        }
        if let Err(e) = self.store.update_step(job_id, &step.id, status, result) {
            warn!(job_id, step_id = %step.id, error = %e, "Could not persist step progress");
        }
    }

    fn replace_steps(&self, job_id: &str, steps: &[Step]) {
        match self.store.replace_steps(job_id, steps.to_vec()) {
            Ok(_) => info!(job_id, steps = steps.len(), "Step list written"),
            Err(e) => warn!(job_id, error = %e, "Could not persist step list"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
