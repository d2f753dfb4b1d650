//! Command line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// meshjobs: queue and run jobs against an agent mesh.
#[derive(Debug, Parser)]
#[command(name = "meshjobs", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./meshjobs.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enables debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Queues a job.
    Submit {
        /// Command to run when the job has no steps.
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        command: Option<String>,

        /// JSON arguments passed to the command.
        #[arg(long, requires = "command")]
        request: Option<String>,

        /// JSON or TOML file holding a full job spec.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Runs queued jobs.
    Run {
        /// Drain the queue once and exit instead of polling until Ctrl-C.
        #[arg(long, default_value_t = false)]
        once: bool,
    },

    /// Shows the queue, or a single job.
    Status {
        id: Option<String>,
    },

    /// Pauses the queue.
    Pause,

    /// Resumes the queue.
    Resume,

    /// Moves the given queued jobs to the front, in this order.
    Reorder {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Removes a job, whatever its status.
    Remove {
        id: String,
    },

    /// Removes every job.
    Clear,

    /// Lists artifacts.
    Artifacts {
        /// Only artifacts of this job.
        #[arg(long)]
        job: Option<String>,
    },

    /// Shows the latest audit entries.
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}
