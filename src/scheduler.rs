//! Single-flight scheduler loop.
//!
//! Each tick takes the first queued job, runs it through the
//! [`StepExecutor`] and persists the terminal status. At most one job is in
//! flight at any time: the flag is taken with compare-and-set before a job
//! is picked and released by a drop guard, so an error or a panic inside a
//! job can never leave the scheduler wedged.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::{Artifact, ArtifactSink};
use crate::audit::{AuditEntry, AuditSink};
use crate::dispatcher::CommandDispatcher;
use crate::error::MeshError;
use crate::executor::StepExecutor;
use crate::state_machine::{Job, JobOutcome, JobStatus};
use crate::store::JobStore;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The queue is paused.
    Paused,
    /// Another job is still in flight.
    Busy,
    /// Nothing is queued.
    Idle,
    /// A job ran to a terminal status.
    Processed { job_id: String, status: JobStatus },
    /// A job finished but its terminal status could not be written. The
    /// store still shows it `running`.
    Unrecorded {
        job_id: String,
        status: JobStatus,
        error: String,
    },
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    store: JobStore,
    executor: StepExecutor,
    artifacts: Arc<dyn ArtifactSink>,
    audit: Arc<dyn AuditSink>,
    in_flight: AtomicBool,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: JobStore,
        dispatcher: Arc<dyn CommandDispatcher>,
        artifacts: Arc<dyn ArtifactSink>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let executor = StepExecutor::new(store.clone(), dispatcher, artifacts.clone());
        Self {
            store,
            executor,
            artifacts,
            audit,
            in_flight: AtomicBool::new(false),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.executor = self.executor.with_step_timeout(timeout);
        self
    }

    pub fn with_context_vars(mut self, vars: Map<String, Value>) -> Self {
        self.executor = self.executor.with_vars(vars);
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Whether a job is currently being advanced.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Runs at most one queued job.
    pub async fn tick(&self) -> TickOutcome {
        if self.store.is_paused() {
            return TickOutcome::Paused;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Tick skipped, a job is already in flight");
            return TickOutcome::Busy;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let Some(job) = self.store.next_queued() else {
            return TickOutcome::Idle;
        };
        self.process(job).await
    }

    /// Processes queued jobs until the queue is empty or paused, or until a
    /// job outcome could not be stored. Returns how many jobs ran.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        while let TickOutcome::Processed { .. } = self.tick().await {
            processed += 1;
        }
        processed
    }

    /// Polls until `shutdown` is cancelled. Wakes on the tick interval and
    /// whenever a job is enqueued or the queue is resumed. A job that is
    /// already running is finished before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_ms = self.tick_interval.as_millis() as u64, "Scheduler started");
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.store.notified() => {}
            }
            while !shutdown.is_cancelled() {
                match self.tick().await {
                    TickOutcome::Processed { .. } => {}
                    TickOutcome::Unrecorded { job_id, error, .. } => {
                        error!(job_id = %job_id, error = %error, "Job outcome lost, waiting for the next tick");
                        break;
                    }
                    _ => break,
                }
            }
        }
        info!("Scheduler stopped");
    }

    async fn process(&self, job: Job) -> TickOutcome {
        let job = match self.store.update_job_status(&job.id, JobStatus::Running, None) {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Could not start job");
                return TickOutcome::Idle;
            }
        };
        let started = Instant::now();
        info!(job_id = %job.id, job_type = %job.job_type, mode = ?job.mode, "Job started");
        self.audit(AuditEntry::job_started(&job));

        let outcome = self.executor.run(&job).await;
        let status = outcome.status();
        let duration_ms = started.elapsed().as_millis() as u64;

        let write_error = self.store_outcome(&job, &outcome).await.err();

        match &outcome {
            JobOutcome::Completed(result) => {
                info!(job_id = %job.id, duration_ms, "Job completed");
                if let Err(e) = self.artifacts.record(Artifact::job_result(&job, result)) {
                    warn!(job_id = %job.id, error = %e, "Could not record result artifact");
                }
                self.audit(AuditEntry::job_completed(&job, result, duration_ms));
            }
            JobOutcome::Failed(reason) => {
                warn!(job_id = %job.id, duration_ms, reason = %reason, "Job failed");
                self.audit(AuditEntry::job_failed(&job, reason, duration_ms));
            }
        }

        match write_error {
            None => TickOutcome::Processed {
                job_id: job.id,
                status,
            },
            Some(e) => TickOutcome::Unrecorded {
                job_id: job.id,
                status,
                error: e.to_string(),
            },
        }
    }

    /// Writes the terminal status, retrying transient store failures. A job
    /// removed while it ran counts as stored.
    async fn store_outcome(&self, job: &Job, outcome: &JobOutcome) -> Result<(), MeshError> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .update_job_status(&job.id, outcome.status(), Some(outcome.result().clone()))
            {
                Ok(_) => return Ok(()),
                Err(MeshError::JobNotFound(_)) => {
                    warn!(job_id = %job.id, "Job was removed while running, outcome not stored");
                    return Ok(());
                }
                Err(e) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                    warn!(job_id = %job.id, attempt, error = %e, "Could not store job outcome, retrying");
                    attempt += 1;
                    tokio::time::sleep(TERMINAL_WRITE_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(job_id = %job.id, attempts = attempt, error = %e, "Could not store job outcome");
                    return Err(e);
                }
            }
        }
    }

    fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.append(entry) {
            warn!(error = %e, "Could not append audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::artifact::{ArtifactStore, RESULT_ARTIFACT};
    use crate::audit::AuditLog;
    use crate::dispatcher::testing::{Behavior, ScriptedDispatcher};
    use crate::state_machine::{JobSpec, StepSpec, StepStatus};

    struct Harness {
        scheduler: Arc<Scheduler>,
        dispatcher: Arc<ScriptedDispatcher>,
        artifacts: Arc<ArtifactStore>,
        audit: Arc<AuditLog>,
    }

    fn harness(dispatcher: ScriptedDispatcher) -> Harness {
        harness_on(JobStore::in_memory(), dispatcher)
    }

    fn harness_on(store: JobStore, dispatcher: ScriptedDispatcher) -> Harness {
        let dispatcher = Arc::new(dispatcher);
        let artifacts = Arc::new(ArtifactStore::in_memory());
        let audit = Arc::new(AuditLog::in_memory());
        let scheduler = Scheduler::new(store, dispatcher.clone(), artifacts.clone(), audit.clone())
            .with_tick_interval(Duration::from_millis(10));
        Harness {
            scheduler: Arc::new(scheduler),
            dispatcher,
            artifacts,
            audit,
        }
    }

    impl Harness {
        fn store(&self) -> &JobStore {
            self.scheduler.store()
        }
    }

    #[tokio::test]
    async fn tick_runs_first_queued_job() {
        let h = harness(ScriptedDispatcher::new().on("create_agent", Behavior::EchoArgs));
        let first = h
            .store()
            .add_job(JobSpec::command("create_agent", json!({"name": "Scout"})))
            .unwrap();
        let second = h
            .store()
            .add_job(JobSpec::command("create_agent", json!({"name": "Ranger"})))
            .unwrap();

        let outcome = h.scheduler.tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Processed {
                job_id: first.id.clone(),
                status: JobStatus::Completed
            }
        );
        let done = h.store().get(&first.id).unwrap();
        assert_eq!(done.result, Some(json!({"name": "Scout"})));
        assert_eq!(h.store().get(&second.id).unwrap().status, JobStatus::Queued);
        assert!(!h.scheduler.is_busy());
    }

    #[tokio::test]
    async fn idle_when_nothing_queued() {
        let h = harness(ScriptedDispatcher::new());
        assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn success_records_artifact_and_audit() {
        let h = harness(ScriptedDispatcher::new().on("create_agent", Behavior::EchoArgs));
        let job = h
            .store()
            .add_job(JobSpec::command("create_agent", json!({"name": "Scout"})))
            .unwrap();
        h.scheduler.tick().await;

        let artifacts = h.artifacts.for_job(&job.id).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, RESULT_ARTIFACT);
        assert_eq!(artifacts[0].content["data"]["name"], "Scout");

        let tags: Vec<String> = h
            .audit
            .entries()
            .unwrap()
            .iter()
            .map(|e| e.tags[2].clone())
            .collect();
        assert_eq!(tags, vec!["started", "completed"]);
    }

    #[tokio::test]
    async fn failure_is_contained_to_its_job() {
        let h = harness(
            ScriptedDispatcher::new()
                .on("boom", Behavior::Fail("exploded".into()))
                .on("ok", Behavior::Return(json!("fine"))),
        );
        let bad = h.store().add_job(JobSpec::command("boom", json!({}))).unwrap();
        let good = h.store().add_job(JobSpec::command("ok", json!({}))).unwrap();

        assert_eq!(h.scheduler.drain().await, 2);

        let bad = h.store().get(&bad.id).unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.result, Some(json!("exploded")));
        assert!(h.artifacts.for_job(&bad.id).unwrap().is_empty());
        assert_eq!(h.store().get(&good.id).unwrap().status, JobStatus::Completed);

        let failed_entries = h
            .audit
            .entries()
            .unwrap()
            .into_iter()
            .filter(|e| e.tags.contains(&"failed".to_string()))
            .count();
        assert_eq!(failed_entries, 1);
    }

    #[tokio::test]
    async fn panic_inside_job_releases_in_flight_flag() {
        let h = harness(
            ScriptedDispatcher::new()
                .on("explode", Behavior::Panic)
                .on("ok", Behavior::Return(json!(1))),
        );
        let bad = h.store().add_job(JobSpec::command("explode", json!({}))).unwrap();
        h.store().add_job(JobSpec::command("ok", json!({}))).unwrap();

        h.scheduler.tick().await;
        assert!(!h.scheduler.is_busy());
        assert_eq!(h.store().get(&bad.id).unwrap().status, JobStatus::Failed);
        assert!(matches!(
            h.scheduler.tick().await,
            TickOutcome::Processed { status: JobStatus::Completed, .. }
        ));
    }

    #[tokio::test]
    async fn reentrant_tick_is_refused() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedDispatcher::new()
                .on("slow", Behavior::Gated(gate.clone(), json!("done")))
                .on("other", Behavior::Return(json!(1))),
        );
        let first = h.store().add_job(JobSpec::command("slow", json!({}))).unwrap();
        let second = h.store().add_job(JobSpec::command("other", json!({}))).unwrap();

        let (a, b) = tokio::join!(h.scheduler.tick(), async {
            tokio::task::yield_now().await;
            let busy = h.scheduler.tick().await;
            gate.notify_one();
            busy
        });

        assert_eq!(
            a,
            TickOutcome::Processed {
                job_id: first.id,
                status: JobStatus::Completed
            }
        );
        assert_eq!(b, TickOutcome::Busy);
        assert_eq!(h.dispatcher.commands(), vec!["slow"]);
        assert_eq!(h.store().get(&second.id).unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn pause_holds_queued_jobs_until_resume() {
        let h = harness(ScriptedDispatcher::new().on("ok", Behavior::Return(json!(1))));
        let job = h.store().add_job(JobSpec::command("ok", json!({}))).unwrap();
        h.store().pause().unwrap();

        for _ in 0..5 {
            assert_eq!(h.scheduler.tick().await, TickOutcome::Paused);
        }
        assert_eq!(h.store().get(&job.id).unwrap().status, JobStatus::Queued);
        assert_eq!(h.dispatcher.call_count(), 0);

        h.store().resume().unwrap();
        assert!(matches!(h.scheduler.tick().await, TickOutcome::Processed { .. }));
    }

    #[tokio::test]
    async fn reordered_queue_changes_pick_order() {
        let h = harness(
            ScriptedDispatcher::new()
                .on("a", Behavior::Return(json!(1)))
                .on("b", Behavior::Return(json!(2))),
        );
        let a = h.store().add_job(JobSpec::command("a", json!({}))).unwrap();
        let b = h.store().add_job(JobSpec::command("b", json!({}))).unwrap();
        h.store().reorder_queue(&[b.id.clone(), a.id.clone()]).unwrap();

        h.scheduler.drain().await;
        assert_eq!(h.dispatcher.commands(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn removed_while_running_keeps_scheduler_healthy() {
        let gate = Arc::new(Notify::new());
        let h = harness(ScriptedDispatcher::new().on("slow", Behavior::Gated(gate.clone(), json!(1))));
        let job = h.store().add_job(JobSpec::command("slow", json!({}))).unwrap();

        let (outcome, _) = tokio::join!(h.scheduler.tick(), async {
            tokio::task::yield_now().await;
            h.store().remove_job(&job.id).unwrap();
            gate.notify_one();
        });
        assert!(matches!(outcome, TickOutcome::Processed { .. }));
        assert!(h.store().get(&job.id).is_none());
        // Artifacts outlive their job.
        assert_eq!(h.artifacts.for_job(&job.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unstored_outcome_is_reported_and_stops_drain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let gate = Arc::new(Notify::new());
        let h = harness_on(
            JobStore::open(&path).unwrap(),
            ScriptedDispatcher::new()
                .on("slow", Behavior::Gated(gate.clone(), json!("done")))
                .on("ok", Behavior::Return(json!(1))),
        );
        let job = h.store().add_job(JobSpec::command("slow", json!({}))).unwrap();
        let next = h.store().add_job(JobSpec::command("ok", json!({}))).unwrap();

        // A directory in place of the snapshot temp file makes every write fail.
        let blocker = path.with_extension("tmp");
        let (outcome, _) = tokio::join!(h.scheduler.tick(), async {
            tokio::task::yield_now().await;
            std::fs::create_dir(&blocker).unwrap();
            gate.notify_one();
        });

        match outcome {
            TickOutcome::Unrecorded { job_id, status, error } => {
                assert_eq!(job_id, job.id);
                assert_eq!(status, JobStatus::Completed);
                assert!(!error.is_empty());
            }
            other => panic!("expected an unrecorded outcome, got {other:?}"),
        }
        assert!(!h.scheduler.is_busy());
        assert_eq!(h.store().get(&job.id).unwrap().status, JobStatus::Running);

        // The next job cannot be started while writes keep failing.
        assert_eq!(h.scheduler.drain().await, 0);
        assert_eq!(h.store().get(&next.id).unwrap().status, JobStatus::Queued);

        std::fs::remove_dir(&blocker).unwrap();
        assert_eq!(h.scheduler.drain().await, 1);
        assert_eq!(h.store().get(&next.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn serial_job_through_scheduler() {
        let h = harness(
            ScriptedDispatcher::new()
                .on("create_agent", Behavior::Fail("agent `A` already exists".into()))
                .on("create_channel", Behavior::Return(json!({}))),
        );
        let job = h
            .store()
            .add_job(JobSpec::serial(vec![
                StepSpec::new("s1", "create_agent", json!({"name": "A"})),
                StepSpec::new("s2", "create_channel", json!({}))
                    .with_condition("steps.s1.status === 'completed'"),
            ]))
            .unwrap();
        h.scheduler.tick().await;

        let job = h.store().get(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.step("s2").unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn run_loop_wakes_on_enqueue_and_stops_on_cancel() {
        let h = harness(ScriptedDispatcher::new().on("ok", Behavior::Return(json!(1))));
        let h_store = h.store().clone();
        let scheduler = h.scheduler.clone();
        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });

        let job = h_store.add_job(JobSpec::command("ok", json!({}))).unwrap();
        let mut done = false;
        for _ in 0..100 {
            if h_store.get(&job.id).is_some_and(|j| j.status == JobStatus::Completed) {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), loop_handle)
            .await
            .unwrap()
            .unwrap();
    }
}
