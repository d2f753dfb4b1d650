//! Durable job store: the job collection plus the global pause flag.
//!
//! Every mutation is a functional transform over the whole [`QueueState`]:
//! the transform runs against a copy, the copy is persisted, and only then
//! does it replace the current state. All transforms go through one mutex,
//! so writers are serialized instead of racing each other. A failed persist
//! leaves the in-memory state as it was.
//!
//! The file-backed store is shared with other processes (the CLI talking to
//! a running scheduler). Transforms re-read the file while holding a lock
//! file, and queries always look at the latest snapshot on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, info, warn};

use crate::error::MeshError;
use crate::lock::{LockGuard, RunnerLock};
use crate::state_machine::{
    Job, JobPatch, JobSpec, JobStatus, StateMachine, Step, StepStatus,
};

/// Result written to jobs found `running` when a store is reopened.
pub const INTERRUPTED_REASON: &str = "interrupted: engine stopped while the job was running";

/// Everything the store persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug)]
enum Backend {
    Memory,
    /// JSON snapshot shared with other processes. Writers hold `lock_path`
    /// for the whole read-modify-write.
    File { path: PathBuf, lock_path: PathBuf },
}

impl Backend {
    fn file(path: PathBuf) -> Self {
        let lock_path = path.with_extension("lock");
        Backend::File { path, lock_path }
    }

    fn lock(&self) -> Result<Option<LockGuard>, MeshError> {
        match self {
            Backend::Memory => Ok(None),
            Backend::File { lock_path, .. } => LockGuard::acquire(lock_path).map(Some),
        }
    }

    /// Current on-disk state, `None` for the in-memory backend.
    fn load(&self) -> Result<Option<QueueState>, MeshError> {
        match self {
            Backend::Memory => Ok(None),
            Backend::File { path, .. } if !path.exists() => Ok(Some(QueueState::default())),
            Backend::File { path, .. } => {
                let raw = std::fs::read(path)?;
                Ok(Some(serde_json::from_slice(&raw)?))
            }
        }
    }

    fn persist(&self, state: &QueueState) -> Result<(), MeshError> {
        match self {
            Backend::Memory => Ok(()),
            Backend::File { path, .. } => write_json_atomic(path, state),
        }
    }
}

/// Writes `value` as pretty JSON through a temp file and a rename so a crash
/// never leaves a half-written snapshot behind.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), MeshError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(Debug)]
struct StoreInner {
    state: Mutex<QueueState>,
    backend: Backend,
    wake: Notify,
}

/// Shared handle to the job collection. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct JobStore {
    inner: Arc<StoreInner>,
}

impl JobStore {
    pub fn in_memory() -> Self {
        Self::with_state(QueueState::default(), Backend::Memory)
    }

    /// Opens (or creates) a file-backed store.
    ///
    /// Several processes may open the same file: every mutation re-reads it
    /// under the write lock and every query sees the latest snapshot. Jobs
    /// left `running` are failed as interrupted unless a live runner still
    /// holds the runner lock. Queued jobs stay queued.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MeshError> {
        let path = path.into();
        let runner_lock = runner_lock_path(&path);
        let backend = Backend::file(path);
        let state = backend.load()?.unwrap_or_default();
        let store = Self::with_state(state, backend);

        let recovered = if RunnerLock::is_held(&runner_lock) {
            debug!(path = %runner_lock.display(), "Live runner found, skipping interrupted-job recovery");
            0
        } else {
            store.recover()?
        };
        let (jobs, paused) = store.read(|state| (state.jobs.len(), state.paused));
        info!(jobs, paused, recovered, "Job store opened");
        Ok(store)
    }

    /// Claims the scheduler role for this store's file. Fails while another
    /// live process holds it. Jobs still marked `running` belong to a dead
    /// runner at this point and are failed as interrupted.
    pub fn claim_runner(&self) -> Result<Option<RunnerLock>, MeshError> {
        let Backend::File { path, .. } = &self.inner.backend else {
            return Ok(None);
        };
        let lock = RunnerLock::acquire(&runner_lock_path(path))?;
        self.recover()?;
        Ok(Some(lock))
    }

    fn recover(&self) -> Result<usize, MeshError> {
        if !self.read(|state| state.jobs.iter().any(|j| j.status == JobStatus::Running)) {
            return Ok(0);
        }
        self.transform(|state| Ok(recover_interrupted(state)))
    }

    fn with_state(state: QueueState, backend: Backend) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(state),
                backend,
                wake: Notify::new(),
            }),
        }
    }

    fn transform<R>(
        &self,
        f: impl FnOnce(&mut QueueState) -> Result<R, MeshError>,
    ) -> Result<R, MeshError> {
        let mut current = self.inner.state.lock();
        let _file_lock = self.inner.backend.lock()?;
        if let Some(on_disk) = self.inner.backend.load()? {
            *current = on_disk;
        }
        let mut next = current.clone();
        let out = f(&mut next)?;
        self.inner.backend.persist(&next)?;
        *current = next;
        Ok(out)
    }

    /// Runs `f` against the latest state. File-backed stores pick up writes
    /// made by other processes first.
    fn read<R>(&self, f: impl FnOnce(&QueueState) -> R) -> R {
        let mut current = self.inner.state.lock();
        match self.inner.backend.load() {
            Ok(Some(on_disk)) => *current = on_disk,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not reload job store, using last known state"),
        }
        f(&current)
    }

    /// Transforms a single job and returns its updated snapshot.
    fn with_job(
        &self,
        id: &str,
        f: impl FnOnce(&mut Job) -> Result<(), MeshError>,
    ) -> Result<Job, MeshError> {
        self.transform(|state| {
            let job = state
                .jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| MeshError::JobNotFound(id.to_string()))?;
            f(job)?;
            job.touch();
            Ok(job.clone())
        })
    }

    // ---- producers ----

    /// Validates and enqueues a job, returning it in `queued` state.
    pub fn add_job(&self, spec: JobSpec) -> Result<Job, MeshError> {
        let job = Job::new(spec)?;
        let snapshot = job.clone();
        self.transform(move |state| {
            state.jobs.push(job);
            Ok(())
        })?;
        info!(job_id = %snapshot.id, job_type = %snapshot.job_type, "Job queued");
        self.inner.wake.notify_one();
        Ok(snapshot)
    }

    // ---- queries ----

    pub fn get(&self, id: &str) -> Option<Job> {
        self.read(|state| state.jobs.iter().find(|j| j.id == id).cloned())
    }

    /// Snapshot of all jobs in queue order.
    pub fn jobs(&self) -> Vec<Job> {
        self.read(|state| state.jobs.clone())
    }

    /// The first `queued` job in queue order.
    pub fn next_queued(&self) -> Option<Job> {
        self.read(|state| {
            state
                .jobs
                .iter()
                .find(|j| j.status == JobStatus::Queued)
                .cloned()
        })
    }

    pub fn is_paused(&self) -> bool {
        self.read(|state| state.paused)
    }

    /// Resolves once a job is enqueued or the queue is resumed.
    pub fn notified(&self) -> Notified<'_> {
        self.inner.wake.notified()
    }

    // ---- engine-side mutations ----

    pub fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        result: Option<Value>,
    ) -> Result<Job, MeshError> {
        let job = self.with_job(id, |job| {
            StateMachine::advance_job(job, status)?;
            if let Some(result) = result {
                job.result = Some(result);
            }
            Ok(())
        })?;
        debug!(job_id = id, %status, "Job status updated");
        Ok(job)
    }

    /// Applies a partial update. A step list replacement must keep the same
    /// step ids in the same order and may only move each step forward.
    pub fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job, MeshError> {
        self.with_job(id, |job| {
            if let Some(steps) = patch.steps {
                check_step_replacement(job, &steps)?;
                job.steps = Some(steps);
            }
            if let Some(result) = patch.result {
                job.result = Some(result);
            }
            Ok(())
        })
    }

    /// Moves one step forward and records its result.
    pub fn update_step(
        &self,
        job_id: &str,
        step_id: &str,
        status: StepStatus,
        result: Option<Value>,
    ) -> Result<Job, MeshError> {
        self.with_job(job_id, |job| {
            let step = job.step_mut(step_id).ok_or_else(|| MeshError::StepNotFound {
                job_id: job_id.to_string(),
                step_id: step_id.to_string(),
            })?;
            StateMachine::advance_step(step, status)?;
            if let Some(result) = result {
                step.result = Some(result);
            }
            Ok(())
        })
    }

    /// Atomic replace of a job's full step list.
    pub fn replace_steps(&self, job_id: &str, steps: Vec<Step>) -> Result<Job, MeshError> {
        self.update_job(
            job_id,
            JobPatch {
                steps: Some(steps),
                result: None,
            },
        )
    }

    // ---- control surface ----

    /// Removes a job regardless of its status. Returns whether it existed.
    pub fn remove_job(&self, id: &str) -> Result<bool, MeshError> {
        let removed = self.transform(|state| {
            let before = state.jobs.len();
            state.jobs.retain(|j| j.id != id);
            Ok(state.jobs.len() != before)
        })?;
        if removed {
            info!(job_id = id, "Job removed");
        }
        Ok(removed)
    }

    /// Reorders queued jobs only.
    ///
    /// Queued jobs named in `ids` take the queued slots in that order,
    /// followed by the remaining queued jobs in their previous order.
    /// Jobs in any other status keep their positions. Unknown ids and ids of
    /// jobs that are no longer queued are ignored.
    pub fn reorder_queue(&self, ids: &[String]) -> Result<(), MeshError> {
        self.transform(|state| {
            let slots: Vec<usize> = state
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, j)| j.status == JobStatus::Queued)
                .map(|(i, _)| i)
                .collect();
            let mut remaining: Vec<Job> = slots.iter().map(|&i| state.jobs[i].clone()).collect();
            let mut ordered = Vec::with_capacity(remaining.len());

            for id in ids {
                match remaining.iter().position(|j| &j.id == id) {
                    Some(pos) => ordered.push(remaining.remove(pos)),
                    None => debug!(job_id = %id, "Reorder ignored id that is not queued"),
                }
            }
            ordered.extend(remaining);

            for (slot, job) in slots.into_iter().zip(ordered) {
                state.jobs[slot] = job;
            }
            Ok(())
        })
    }

    /// Drops every job. Returns how many were removed.
    pub fn clear_jobs(&self) -> Result<usize, MeshError> {
        let cleared = self.transform(|state| Ok(std::mem::take(&mut state.jobs).len()))?;
        info!(cleared, "Job queue cleared");
        Ok(cleared)
    }

    /// Flips the pause flag and returns the new value.
    pub fn toggle_pause(&self) -> Result<bool, MeshError> {
        let paused = self.transform(|state| {
            state.paused = !state.paused;
            Ok(state.paused)
        })?;
        self.log_pause(paused);
        Ok(paused)
    }

    pub fn pause(&self) -> Result<(), MeshError> {
        self.set_paused(true)
    }

    pub fn resume(&self) -> Result<(), MeshError> {
        self.set_paused(false)
    }

    fn set_paused(&self, paused: bool) -> Result<(), MeshError> {
        self.transform(|state| {
            state.paused = paused;
            Ok(())
        })?;
        self.log_pause(paused);
        Ok(())
    }

    fn log_pause(&self, paused: bool) {
        if paused {
            info!("Job queue paused");
        } else {
            info!("Job queue resumed");
            self.inner.wake.notify_one();
        }
    }
}

fn check_step_replacement(job: &Job, steps: &[Step]) -> Result<(), MeshError> {
    let current = job.steps.as_deref().unwrap_or_default();
    if current.len() != steps.len() {
        return Err(MeshError::InvalidJob(format!(
            "step list of job {} has {} entries, replacement has {}",
            job.id,
            current.len(),
            steps.len()
        )));
    }
    for (old, new) in current.iter().zip(steps) {
        if old.id != new.id {
            return Err(MeshError::InvalidJob(format!(
                "step replacement for job {} reorders `{}` and `{}`",
                job.id, old.id, new.id
            )));
        }
        if !StateMachine::step_reachable(old.status, new.status) {
            return Err(MeshError::InvalidTransition {
                kind: "step",
                id: old.id.clone(),
                from: old.status.to_string(),
                to: new.status.to_string(),
            });
        }
    }
    Ok(())
}

/// Runner lock belonging to the store file at `path`.
pub fn runner_lock_path(path: &Path) -> PathBuf {
    path.with_extension("runner.lock")
}

fn recover_interrupted(state: &mut QueueState) -> usize {
    let mut recovered = 0;
    for job in state.jobs.iter_mut().filter(|j| j.status == JobStatus::Running) {
        if let Some(steps) = job.steps.as_mut() {
            for step in steps.iter_mut().filter(|s| s.status == StepStatus::Running) {
                step.status = StepStatus::Failed;
                step.result = Some(Value::String(INTERRUPTED_REASON.to_string()));
            }
        }
        job.status = JobStatus::Failed;
        job.result = Some(Value::String(INTERRUPTED_REASON.to_string()));
        job.touch();
        warn!(job_id = %job.id, "Marked interrupted job as failed");
        recovered += 1;
    }
    recovered
}
