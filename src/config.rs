//! Configuration loaded from `meshjobs.toml`.
//!
//! Keys missing from the file fall back to defaults. `ANTHROPIC_API_KEY`
//! takes precedence over `api_key`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

pub const CONFIG_FILE: &str = "meshjobs.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub api_key: String,

    /// Model used by `ask_model` when the agent does not name one.
    #[serde(default = "default_model")]
    pub model: String,

    /// Directory holding jobs, artifacts, audit and mesh state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Upper bound for a single command dispatch. 0 disables it.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Variables visible to step conditions as `context.*`.
    #[serde(default)]
    pub context: Map<String, Value>,
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".meshjobs")
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            state_dir: default_state_dir(),
            tick_interval_ms: default_tick_interval_ms(),
            step_timeout_secs: default_step_timeout_secs(),
            log_level: default_log_level(),
            context: Map::new(),
        }
    }
}

impl MeshConfig {
    /// Loads `meshjobs.toml` from the current directory, or defaults when it
    /// does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<MeshConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        // The environment wins over the file for the API key.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        Ok(config)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_timeout_secs > 0).then(|| Duration::from_secs(self.step_timeout_secs))
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.state_dir.join("jobs.json")
    }

    pub fn artifacts_path(&self) -> PathBuf {
        self.state_dir.join("artifacts.jsonl")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.state_dir.join("audit.jsonl")
    }

    pub fn mesh_path(&self) -> PathBuf {
        self.state_dir.join("mesh.json")
    }
}
