//! Append-only audit trail of job lifecycle events.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::error::MeshError;
use crate::state_machine::Job;

pub const JOB_CATEGORY: &str = "job";

/// One audit record: `{category, title, description, details, tags, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub category: String,
    pub title: String,
    pub description: String,
    pub details: Value,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    fn for_job(job: &Job, title: String, description: String, details: Value, outcome: &str) -> Self {
        Self {
            category: JOB_CATEGORY.to_string(),
            title,
            description,
            details,
            tags: vec![
                JOB_CATEGORY.to_string(),
                job.job_type.clone(),
                outcome.to_string(),
            ],
            timestamp: Utc::now(),
        }
    }

    pub fn job_started(job: &Job) -> Self {
        let steps = job.steps.as_ref().map_or(0, Vec::len);
        Self::for_job(
            job,
            format!("Job started: {}", job.job_type),
            format!("Job {} picked up from the queue", job.id),
            json!({
                "jobId": job.id,
                "type": job.job_type,
                "mode": job.mode,
                "steps": steps,
                "request": job.request,
            }),
            "started",
        )
    }

    pub fn job_completed(job: &Job, result: &Value, duration_ms: u64) -> Self {
        Self::for_job(
            job,
            format!("Job completed: {}", job.job_type),
            format!("Job {} completed in {duration_ms}ms", job.id),
            json!({
                "jobId": job.id,
                "type": job.job_type,
                "durationMs": duration_ms,
                "result": result,
            }),
            "completed",
        )
    }

    pub fn job_failed(job: &Job, reason: &Value, duration_ms: u64) -> Self {
        let reason_text = match reason {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self::for_job(
            job,
            format!("Job failed: {}", job.job_type),
            format!("Job {} failed after {duration_ms}ms: {reason_text}", job.id),
            json!({
                "jobId": job.id,
                "type": job.job_type,
                "durationMs": duration_ms,
                "error": reason,
            }),
            "failed",
        )
    }
}

/// Receives audit entries. Implementations must only ever append.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: AuditEntry) -> Result<(), MeshError>;
}

/// Bytes read per step when scanning the audit file backwards.
const TAIL_CHUNK: u64 = 8 * 1024;

#[derive(Debug)]
enum Trail {
    Memory(Mutex<Vec<AuditEntry>>),
    /// JSON-lines file. Nothing is cached: reads go to the file.
    File { path: PathBuf, write: Mutex<()> },
}

/// Audit trail kept in memory or in a JSON-lines file.
#[derive(Debug)]
pub struct AuditLog {
    trail: Trail,
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self {
            trail: Trail::Memory(Mutex::new(Vec::new())),
        }
    }

    /// Opens a JSON-lines audit file. Existing entries stay on disk and are
    /// only read when queried.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MeshError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            trail: Trail::File {
                path,
                write: Mutex::new(()),
            },
        })
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> Result<Vec<AuditEntry>, MeshError> {
        match &self.trail {
            Trail::Memory(entries) => Ok(entries.lock().clone()),
            Trail::File { path, .. } => {
                let file = match File::open(path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                };
                let mut entries = Vec::new();
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if !line.trim().is_empty() {
                        entries.push(serde_json::from_str(&line)?);
                    }
                }
                Ok(entries)
            }
        }
    }

    /// The last `limit` entries, oldest first. The file is read from the end
    /// and only as far back as needed.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, MeshError> {
        match &self.trail {
            Trail::Memory(entries) => {
                let entries = entries.lock();
                let skip = entries.len().saturating_sub(limit);
                Ok(entries[skip..].to_vec())
            }
            Trail::File { path, .. } => read_tail(path, limit),
        }
    }
}

fn read_tail(path: &Path, limit: usize) -> Result<Vec<AuditEntry>, MeshError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    // `limit + 1` newlines guarantee the last `limit` lines are complete.
    let mut start = file.metadata()?.len();
    let mut buf = Vec::new();
    let mut newlines = 0;
    while start > 0 && newlines <= limit {
        let step = TAIL_CHUNK.min(start);
        start -= step;
        file.seek(SeekFrom::Start(start))?;
        let mut chunk = vec![0; step as usize];
        file.read_exact(&mut chunk)?;
        newlines += chunk.iter().filter(|&&b| b == b'\n').count();
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }

    let mut lines: Vec<&[u8]> = buf.split(|&b| b == b'\n').collect();
    if start > 0 {
        // Partial line cut by the chunk boundary.
        lines.remove(0);
    }
    let lines: Vec<&[u8]> = lines
        .into_iter()
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .collect();
    let skip = lines.len().saturating_sub(limit);
    lines[skip..]
        .iter()
        .map(|line| serde_json::from_slice(line).map_err(MeshError::from))
        .collect()
}

impl AuditSink for AuditLog {
    fn append(&self, entry: AuditEntry) -> Result<(), MeshError> {
        match &self.trail {
            Trail::Memory(entries) => entries.lock().push(entry.clone()),
            Trail::File { path, write } => {
                let mut line = serde_json::to_vec(&entry)?;
                line.push(b'\n');
                let _write = write.lock();
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                file.write_all(&line)?;
            }
        }
        info!(
            category = %entry.category,
            tags = ?entry.tags,
            "{}", entry.title
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::JobSpec;

    fn job() -> Job {
        Job::new(JobSpec::command("create_agent", json!({"name": "Scout"}))).unwrap()
    }

    #[test]
    fn lifecycle_entries_carry_job_details() {
        let job = job();
        let started = AuditEntry::job_started(&job);
        assert_eq!(started.category, JOB_CATEGORY);
        assert_eq!(started.title, "Job started: create_agent");
        assert_eq!(started.details["jobId"], job.id.as_str());
        assert_eq!(started.tags, vec!["job", "create_agent", "started"]);

        let done = AuditEntry::job_completed(&job, &json!({"name": "Scout"}), 12);
        assert_eq!(done.details["durationMs"], 12);
        assert_eq!(done.details["result"]["name"], "Scout");

        let failed = AuditEntry::job_failed(&job, &json!("agent exists"), 3);
        assert!(failed.description.ends_with("agent exists"));
        assert_eq!(failed.tags[2], "failed");
    }

    #[test]
    fn recent_returns_tail() {
        let log = AuditLog::in_memory();
        let job = job();
        log.append(AuditEntry::job_started(&job)).unwrap();
        log.append(AuditEntry::job_completed(&job, &json!(1), 1)).unwrap();
        log.append(AuditEntry::job_failed(&job, &json!("x"), 1)).unwrap();

        let tail = log.recent(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].tags[2], "completed");
        assert_eq!(log.recent(10).unwrap().len(), 3);
    }

    #[test]
    fn jsonl_file_is_appended_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let job = job();

        let log = AuditLog::open(&path).unwrap();
        log.append(AuditEntry::job_started(&job)).unwrap();
        drop(log);

        let log = AuditLog::open(&path).unwrap();
        log.append(AuditEntry::job_completed(&job, &json!(1), 5)).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert_eq!(AuditLog::open(&path).unwrap().entries().unwrap().len(), 2);
    }

    #[test]
    fn file_tail_spans_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();
        let job = job();

        // Each line is larger than one read chunk.
        let bulky = json!("x".repeat(TAIL_CHUNK as usize + 100));
        for i in 0..12 {
            log.append(AuditEntry::job_completed(&job, &bulky, i)).unwrap();
        }
        let all = log.entries().unwrap();
        assert_eq!(all.len(), 12);

        let tail = log.recent(4).unwrap();
        assert_eq!(tail, all[8..].to_vec());
        let durations: Vec<Value> = tail.iter().map(|e| e.details["durationMs"].clone()).collect();
        assert_eq!(durations, vec![json!(8), json!(9), json!(10), json!(11)]);

        assert_eq!(log.recent(50).unwrap(), all);
        assert!(log.recent(0).unwrap().is_empty());
    }

    #[test]
    fn file_tail_of_small_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();
        assert!(log.recent(5).unwrap().is_empty());

        let job = job();
        for i in 0..200 {
            log.append(AuditEntry::job_failed(&job, &json!("x"), i)).unwrap();
        }
        let tail = log.recent(3).unwrap();
        let durations: Vec<Value> = tail.iter().map(|e| e.details["durationMs"].clone()).collect();
        assert_eq!(durations, vec![json!(197), json!(198), json!(199)]);
    }

    #[test]
    fn handles_on_one_file_see_each_others_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let writer = AuditLog::open(&path).unwrap();
        let reader = AuditLog::open(&path).unwrap();

        writer.append(AuditEntry::job_started(&job())).unwrap();
        assert_eq!(reader.recent(10).unwrap().len(), 1);
    }
}
