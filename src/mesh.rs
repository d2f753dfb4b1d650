//! Mesh entities mutated by the reference command set: agents, the channels
//! between them, groups and the messages sent over channels.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::MeshError;
use crate::store::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Link between two agents. Messages may flow either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub from: String,
    pub to: String,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn touches(&self, agent_id: &str) -> bool {
        self.from == agent_id || self.to == agent_id
    }

    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.from == a && self.to == b) || (self.from == b && self.to == a)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshMessage {
    pub id: String,
    pub channel_id: String,
    pub from: String,
    pub to: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshState {
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub messages: Vec<MeshMessage>,
}

impl MeshState {
    /// Finds an agent by id, then by name.
    pub fn agent(&self, key: &str) -> Option<&Agent> {
        self.agents
            .iter()
            .find(|a| a.id == key)
            .or_else(|| self.agents.iter().find(|a| a.name == key))
    }

    pub fn channel_between(&self, a: &str, b: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.connects(a, b))
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Mesh state kept in memory and, optionally, in a JSON file. Updates are
/// applied to a copy which is persisted before it replaces the current state.
#[derive(Debug)]
pub struct MeshStore {
    state: Mutex<MeshState>,
    path: Option<PathBuf>,
}

impl MeshStore {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(MeshState::default()),
            path: None,
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MeshError> {
        let path = path.into();
        let state: MeshState = if path.exists() {
            serde_json::from_slice(&std::fs::read(&path)?)?
        } else {
            MeshState::default()
        };
        debug!(path = %path.display(), agents = state.agents.len(), "Mesh state loaded");
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    pub fn snapshot(&self) -> MeshState {
        self.state.lock().clone()
    }

    /// Runs `f` against a copy of the state. The copy only becomes current
    /// when `f` succeeds and the copy was persisted.
    pub fn mutate<R, E>(&self, f: impl FnOnce(&mut MeshState) -> Result<R, E>) -> Result<R, E>
    where
        E: From<MeshError>,
    {
        let mut current = self.state.lock();
        let mut next = current.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            write_json_atomic(path, &next).map_err(E::from)?;
        }
        *current = next;
        Ok(out)
    }
}
