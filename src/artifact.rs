//! Artifacts: persisted, independently addressable job output.
//!
//! Artifacts reference their job by id only. Removing or clearing jobs
//! leaves them in place.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::error::MeshError;
use crate::lock::LockGuard;
use crate::state_machine::{Job, JobStatus};

/// Name of the artifact written for every successful job.
pub const RESULT_ARTIFACT: &str = "result.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub job_id: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub name: String,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(job_id: &str, artifact_type: &str, name: &str, content: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            artifact_type: artifact_type.to_string(),
            name: name.to_string(),
            content,
            created_at: Utc::now(),
        }
    }

    /// Wraps a successful job's result as
    /// `{jobId, timestamp, status, command, data}`.
    pub fn job_result(job: &Job, result: &Value) -> Self {
        let content = json!({
            "jobId": job.id,
            "timestamp": Utc::now(),
            "status": JobStatus::Completed,
            "command": job.job_type,
            "data": result,
        });
        Self::new(&job.id, "json", RESULT_ARTIFACT, content)
    }
}

/// Receives artifacts produced by jobs and commands.
pub trait ArtifactSink: Send + Sync {
    fn record(&self, artifact: Artifact) -> Result<(), MeshError>;
}

#[derive(Debug)]
enum Shelf {
    Memory(Mutex<Vec<Artifact>>),
    /// JSON-lines file, one artifact per line. Recording appends a line.
    File { path: PathBuf, lock_path: PathBuf },
}

/// Artifact collection kept in memory or in a JSON-lines file.
#[derive(Debug)]
pub struct ArtifactStore {
    shelf: Shelf,
}

impl ArtifactStore {
    pub fn in_memory() -> Self {
        Self {
            shelf: Shelf::Memory(Mutex::new(Vec::new())),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MeshError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = path.with_extension("lock");
        Ok(Self {
            shelf: Shelf::File { path, lock_path },
        })
    }

    /// Artifacts matching `keep`, in recording order.
    fn select(&self, mut keep: impl FnMut(&Artifact) -> bool) -> Result<Vec<Artifact>, MeshError> {
        match &self.shelf {
            Shelf::Memory(artifacts) => Ok(artifacts.lock().iter().filter(|a| keep(a)).cloned().collect()),
            Shelf::File { path, .. } => {
                let file = match File::open(path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                };
                let mut selected = Vec::new();
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let artifact: Artifact = serde_json::from_str(&line)?;
                    if keep(&artifact) {
                        selected.push(artifact);
                    }
                }
                Ok(selected)
            }
        }
    }

    pub fn list(&self) -> Result<Vec<Artifact>, MeshError> {
        self.select(|_| true)
    }

    pub fn for_job(&self, job_id: &str) -> Result<Vec<Artifact>, MeshError> {
        self.select(|a| a.job_id == job_id)
    }

    pub fn get(&self, id: &str) -> Result<Option<Artifact>, MeshError> {
        Ok(self.select(|a| a.id == id)?.into_iter().next())
    }

    /// Deletes one artifact. The file backend rewrites the whole file.
    pub fn remove(&self, id: &str) -> Result<Artifact, MeshError> {
        let missing = || MeshError::ArtifactNotFound(id.to_string());
        match &self.shelf {
            Shelf::Memory(artifacts) => {
                let mut artifacts = artifacts.lock();
                let pos = artifacts.iter().position(|a| a.id == id).ok_or_else(missing)?;
                Ok(artifacts.remove(pos))
            }
            Shelf::File { path, lock_path } => {
                let _lock = LockGuard::acquire(lock_path)?;
                let mut artifacts = self.list()?;
                let pos = artifacts.iter().position(|a| a.id == id).ok_or_else(missing)?;
                let removed = artifacts.remove(pos);
                let mut body = Vec::new();
                for artifact in &artifacts {
                    serde_json::to_writer(&mut body, artifact)?;
                    body.push(b'\n');
                }
                let tmp = path.with_extension("tmp");
                std::fs::write(&tmp, body)?;
                std::fs::rename(&tmp, path)?;
                Ok(removed)
            }
        }
    }
}

impl ArtifactSink for ArtifactStore {
    fn record(&self, artifact: Artifact) -> Result<(), MeshError> {
        match &self.shelf {
            Shelf::Memory(artifacts) => artifacts.lock().push(artifact.clone()),
            Shelf::File { path, lock_path } => {
                let mut line = serde_json::to_vec(&artifact)?;
                line.push(b'\n');
                let _lock = LockGuard::acquire(lock_path)?;
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                file.write_all(&line)?;
            }
        }
        debug!(artifact_id = %artifact.id, job_id = %artifact.job_id, name = %artifact.name, "Artifact recorded");
        Ok(())
    }
}
