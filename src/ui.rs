//! Terminal output: spinners while jobs run and colored job listings.

use std::time::Duration;

use console::{Style, style};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;

use crate::artifact::Artifact;
use crate::audit::AuditEntry;
use crate::state_machine::{Job, JobStatus, StepStatus};

fn job_status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Queued => Style::new().dim(),
        JobStatus::Running => Style::new().cyan(),
        JobStatus::Completed => Style::new().green().bold(),
        JobStatus::Failed => Style::new().red().bold(),
    }
}

fn step_status_style(status: StepStatus) -> Style {
    match status {
        StepStatus::Pending => Style::new().dim(),
        StepStatus::Running => Style::new().cyan(),
        StepStatus::Completed => Style::new().green(),
        StepStatus::Skipped => Style::new().yellow(),
        StepStatus::Failed => Style::new().red(),
    }
}

/// Single-line rendering of a job result, cut to `max` characters.
pub fn summarize(value: &Value, max: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= max {
        text
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

/// Spinner shown while the scheduler works through the queue.
pub struct JobProgress {
    pb: ProgressBar,
}

impl JobProgress {
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let spinner = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(spinner);
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    pub fn set_message(&self, message: String) {
        self.pb.set_message(message);
    }

    /// Prints the finished job above the spinner.
    pub fn job_finished(&self, job: &Job) {
        let (mark, st) = match job.status {
            JobStatus::Completed => ("✓", job_status_style(JobStatus::Completed)),
            _ => ("✗", job_status_style(JobStatus::Failed)),
        };
        let result = job
            .result
            .as_ref()
            .map(|r| summarize(r, 80))
            .unwrap_or_default();
        self.pb.println(format!(
            "  {} {} {} {}",
            st.apply_to(mark),
            style(&job.job_type).bold(),
            style(&job.id).dim(),
            result
        ));
    }

    pub fn finish(&self, processed: usize) {
        self.pb.finish_and_clear();
        println!(
            "  {} {processed} job(s) processed",
            Style::new().green().bold().apply_to("✓")
        );
    }
}

pub fn print_queue(jobs: &[Job], paused: bool) {
    if paused {
        println!("{}", Style::new().yellow().bold().apply_to("Queue is paused"));
    }
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }
    for job in jobs {
        let steps = job
            .steps
            .as_ref()
            .map(|s| format!(" [{} {} steps]", s.len(), job.mode))
            .unwrap_or_default();
        println!(
            "{:<10} {} {}{}",
            job_status_style(job.status).apply_to(job.status),
            style(&job.id).dim(),
            job.job_type,
            steps
        );
    }
}

pub fn print_job(job: &Job) {
    println!("{} {}", style("Job").bold(), job.id);
    println!("  type:    {}", job.job_type);
    println!("  status:  {}", job_status_style(job.status).apply_to(job.status));
    println!("  created: {}", job.created_at.to_rfc3339());
    println!("  updated: {}", job.updated_at.to_rfc3339());
    if let Some(steps) = &job.steps {
        println!("  mode:    {}", job.mode);
        for step in steps {
            let label = step.name.as_deref().unwrap_or(&step.id);
            let result = step
                .result
                .as_ref()
                .map(|r| format!(" {}", summarize(r, 60)))
                .unwrap_or_default();
            println!(
                "    {:<10} {} ({}){}",
                step_status_style(step.status).apply_to(step.status),
                label,
                step.command_id,
                result
            );
        }
    }
    if let Some(result) = &job.result {
        println!("  result:");
        println!(
            "{}",
            serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
        );
    }
}

pub fn print_artifacts(artifacts: &[Artifact]) {
    if artifacts.is_empty() {
        println!("No artifacts.");
        return;
    }
    for artifact in artifacts {
        println!(
            "{} {} {} {}",
            style(&artifact.id).dim(),
            style(&artifact.name).bold(),
            artifact.job_id,
            summarize(&artifact.content, 60)
        );
    }
}

pub fn print_audit(entries: &[AuditEntry]) {
    for entry in entries {
        let st = match entry.tags.last().map(String::as_str) {
            Some("completed") => Style::new().green(),
            Some("failed") => Style::new().red(),
            _ => Style::new().cyan(),
        };
        println!(
            "{} {} {}",
            style(entry.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
            st.apply_to(&entry.title),
            entry.description
        );
    }
}
