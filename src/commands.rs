//! Reference command set over the agent mesh.
//!
//! | command          | args                                     |
//! |------------------|------------------------------------------|
//! | `create_agent`   | `{name, role?, model?, systemPrompt?}`   |
//! | `delete_agent`   | `{id}` or `{name}`                       |
//! | `create_channel` | `{from, to}`                             |
//! | `create_group`   | `{name, members}`                        |
//! | `send_message`   | `{from, to, content}`                    |
//! | `list_agents`    | `{}`                                     |
//! | `schedule_job`   | a job spec                               |
//! | `ask_model`      | `{prompt, agent?, maxTokens?}`           |
//!
//! Agents may be referenced by id or by name wherever an agent is expected.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::anthropic::{MessageSender, MessagesRequest};
use crate::dispatcher::{CommandDispatcher, CommandError, ExecutionContext};
use crate::mesh::{Agent, Channel, Group, MeshMessage, MeshState, MeshStore, new_id};
use crate::state_machine::JobSpec;

pub const DEFAULT_ROLE: &str = "assistant";
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAgentArgs {
    name: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentRef {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelArgs {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct CreateGroupArgs {
    name: String,
    members: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessageArgs {
    from: String,
    to: String,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AskModelArgs {
    prompt: String,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

fn parse_args<T: DeserializeOwned>(command: &str, args: &Value) -> Result<T, CommandError> {
    serde_json::from_value(args.clone()).map_err(|e| CommandError::InvalidArgs {
        command: command.to_string(),
        message: e.to_string(),
    })
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, CommandError> {
    serde_json::to_value(value).map_err(|e| CommandError::Engine(e.into()))
}

fn resolve_agent<'a>(state: &'a MeshState, key: &str) -> Result<&'a Agent, CommandError> {
    state
        .agent(key)
        .ok_or_else(|| CommandError::failed(format!("agent `{key}` not found")))
}

/// [`CommandDispatcher`] over a [`MeshStore`] and a language model client.
pub struct MeshCommands {
    mesh: Arc<MeshStore>,
    llm: Arc<dyn MessageSender>,
    model: String,
}

impl MeshCommands {
    pub fn new(mesh: Arc<MeshStore>, llm: Arc<dyn MessageSender>, model: impl Into<String>) -> Self {
        Self {
            mesh,
            llm,
            model: model.into(),
        }
    }

    pub fn mesh(&self) -> &MeshStore {
        &self.mesh
    }

    fn create_agent(&self, args: &Value) -> Result<Value, CommandError> {
        let args: CreateAgentArgs = parse_args("create_agent", args)?;
        let name = args.name.trim().to_string();
        if name.is_empty() {
            return Err(CommandError::InvalidArgs {
                command: "create_agent".into(),
                message: "name must not be empty".into(),
            });
        }
        let agent = self.mesh.mutate(|state| {
            if state.agents.iter().any(|a| a.name == name) {
                return Err(CommandError::failed(format!("agent `{name}` already exists")));
            }
            let agent = Agent {
                id: new_id(),
                name: name.clone(),
                role: args.role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
                model: args.model,
                system_prompt: args.system_prompt,
                created_at: Utc::now(),
            };
            state.agents.push(agent.clone());
            Ok(agent)
        })?;
        info!(agent_id = %agent.id, name = %agent.name, "Agent created");
        to_value(&agent)
    }

    fn delete_agent(&self, args: &Value) -> Result<Value, CommandError> {
        let args: AgentRef = parse_args("delete_agent", args)?;
        let key = args.id.or(args.name).ok_or_else(|| CommandError::InvalidArgs {
            command: "delete_agent".into(),
            message: "either `id` or `name` is required".into(),
        })?;
        let (id, dropped) = self.mesh.mutate(|state| {
            let id = resolve_agent(state, &key)?.id.clone();
            state.agents.retain(|a| a.id != id);
            let before = state.channels.len();
            state.channels.retain(|c| !c.touches(&id));
            for group in &mut state.groups {
                group.members.retain(|m| *m != id);
            }
            Ok::<_, CommandError>((id, before - state.channels.len()))
        })?;
        info!(agent_id = %id, channels_dropped = dropped, "Agent deleted");
        Ok(json!({ "deleted": id }))
    }

    fn create_channel(&self, args: &Value) -> Result<Value, CommandError> {
        let args: ChannelArgs = parse_args("create_channel", args)?;
        let channel = self.mesh.mutate(|state| {
            let from = resolve_agent(state, &args.from)?.id.clone();
            let to = resolve_agent(state, &args.to)?.id.clone();
            if from == to {
                return Err(CommandError::failed("an agent cannot open a channel to itself"));
            }
            if state.channel_between(&from, &to).is_some() {
                return Err(CommandError::failed(format!(
                    "channel between `{}` and `{}` already exists",
                    args.from, args.to
                )));
            }
            let channel = Channel {
                id: new_id(),
                from,
                to,
                created_at: Utc::now(),
            };
            state.channels.push(channel.clone());
            Ok(channel)
        })?;
        info!(channel_id = %channel.id, "Channel created");
        to_value(&channel)
    }

    fn create_group(&self, args: &Value) -> Result<Value, CommandError> {
        let args: CreateGroupArgs = parse_args("create_group", args)?;
        let group = self.mesh.mutate(|state| {
            if state.group(&args.name).is_some() {
                return Err(CommandError::failed(format!(
                    "group `{}` already exists",
                    args.name
                )));
            }
            let mut members = Vec::with_capacity(args.members.len());
            for key in &args.members {
                let id = resolve_agent(state, key)?.id.clone();
                if !members.contains(&id) {
                    members.push(id);
                }
            }
            let group = Group {
                id: new_id(),
                name: args.name.clone(),
                members,
                created_at: Utc::now(),
            };
            state.groups.push(group.clone());
            Ok(group)
        })?;
        info!(group_id = %group.id, members = group.members.len(), "Group created");
        to_value(&group)
    }

    fn send_message(&self, args: &Value) -> Result<Value, CommandError> {
        let args: SendMessageArgs = parse_args("send_message", args)?;
        let message = self.mesh.mutate(|state| {
            let from = resolve_agent(state, &args.from)?.id.clone();
            let to = resolve_agent(state, &args.to)?.id.clone();
            let channel_id = state
                .channel_between(&from, &to)
                .map(|c| c.id.clone())
                .ok_or_else(|| {
                    CommandError::failed(format!(
                        "no channel between `{}` and `{}`",
                        args.from, args.to
                    ))
                })?;
            let message = MeshMessage {
                id: new_id(),
                channel_id,
                from,
                to,
                content: args.content.clone(),
                created_at: Utc::now(),
            };
            state.messages.push(message.clone());
            Ok::<_, CommandError>(message)
        })?;
        debug!(message_id = %message.id, channel_id = %message.channel_id, "Message sent");
        to_value(&message)
    }

    fn list_agents(&self) -> Result<Value, CommandError> {
        to_value(&self.mesh.snapshot().agents)
    }

    fn schedule_job(&self, args: &Value, ctx: &ExecutionContext) -> Result<Value, CommandError> {
        let spec: JobSpec = parse_args("schedule_job", args)?;
        let job = ctx.enqueue(spec)?;
        info!(parent = %ctx.job_id, job_id = %job.id, "Follow-up job scheduled");
        Ok(json!({ "scheduled": job.id }))
    }

    async fn ask_model(&self, args: &Value) -> Result<Value, CommandError> {
        let args: AskModelArgs = parse_args("ask_model", args)?;
        let (model, system) = match args.agent.as_deref() {
            Some(key) => {
                let state = self.mesh.snapshot();
                let agent = resolve_agent(&state, key)?;
                (
                    agent.model.clone().unwrap_or_else(|| self.model.clone()),
                    agent.system_prompt.clone(),
                )
            }
            None => (self.model.clone(), None),
        };
        let req = MessagesRequest::prompt(
            model,
            args.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            args.prompt,
        )
        .with_system(system);

        let resp = self.llm.send_message(&req).await?;
        Ok(json!({
            "text": resp.text(),
            "model": resp.model,
            "usage": resp.usage,
        }))
    }
}

#[async_trait]
impl CommandDispatcher for MeshCommands {
    async fn execute(
        &self,
        command_id: &str,
        args: &Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, CommandError> {
        debug!(job_id = %ctx.job_id, step_id = ?ctx.step_id, command = command_id, "Dispatching");
        match command_id {
            "create_agent" => self.create_agent(args),
            "delete_agent" => self.delete_agent(args),
            "create_channel" => self.create_channel(args),
            "create_group" => self.create_group(args),
            "send_message" => self.send_message(args),
            "list_agents" => self.list_agents(),
            "schedule_job" => self.schedule_job(args, ctx),
            "ask_model" => self.ask_model(args).await,
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockSender;
    use super::*;
    use crate::artifact::ArtifactStore;
    use crate::state_machine::{Job, JobStatus};
    use crate::store::JobStore;

    const MODEL: &str = "claude-sonnet-4-5-20250929";

    struct Fixture {
        commands: MeshCommands,
        sender: Arc<MockSender>,
        store: JobStore,
        ctx: ExecutionContext,
    }

    fn fixture_with(sender: MockSender) -> Fixture {
        let sender = Arc::new(sender);
        let commands = MeshCommands::new(Arc::new(MeshStore::in_memory()), sender.clone(), MODEL);
        let store = JobStore::in_memory();
        let job = Job::new(JobSpec::command("test", json!({}))).unwrap();
        let ctx = ExecutionContext::new(
            &job,
            store.clone(),
            Arc::new(ArtifactStore::in_memory()),
            Default::default(),
        );
        Fixture {
            commands,
            sender,
            store,
            ctx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockSender::ok("hello"))
    }

    impl Fixture {
        async fn run(&self, command: &str, args: Value) -> Result<Value, CommandError> {
            self.commands.execute(command, &args, &self.ctx).await
        }
    }

    #[tokio::test]
    async fn create_agent_applies_defaults_and_rejects_duplicates() {
        let f = fixture();
        let agent = f.run("create_agent", json!({"name": "Scout"})).await.unwrap();
        assert_eq!(agent["name"], "Scout");
        assert_eq!(agent["role"], DEFAULT_ROLE);
        assert!(agent.get("systemPrompt").is_none());

        let err = f.run("create_agent", json!({"name": "Scout"})).await.unwrap_err();
        assert_eq!(err.to_string(), "agent `Scout` already exists");

        let err = f.run("create_agent", json!({"role": "x"})).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgs { .. }));
    }

    #[tokio::test]
    async fn channels_and_messages() {
        let f = fixture();
        f.run("create_agent", json!({"name": "A"})).await.unwrap();
        f.run("create_agent", json!({"name": "B"})).await.unwrap();

        let err = f
            .run("send_message", json!({"from": "A", "to": "B", "content": "hi"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no channel"));

        let channel = f.run("create_channel", json!({"from": "A", "to": "B"})).await.unwrap();
        assert!(f.run("create_channel", json!({"from": "B", "to": "A"})).await.is_err());

        let message = f
            .run("send_message", json!({"from": "B", "to": "A", "content": "hi"}))
            .await
            .unwrap();
        assert_eq!(message["channelId"], channel["id"]);
        assert_eq!(f.commands.mesh().snapshot().messages.len(), 1);
    }

    #[tokio::test]
    async fn delete_agent_drops_channels_and_memberships() {
        let f = fixture();
        let a = f.run("create_agent", json!({"name": "A"})).await.unwrap();
        f.run("create_agent", json!({"name": "B"})).await.unwrap();
        f.run("create_channel", json!({"from": "A", "to": "B"})).await.unwrap();
        f.run("create_group", json!({"name": "crew", "members": ["A", "B"]}))
            .await
            .unwrap();

        let deleted = f.run("delete_agent", json!({"name": "A"})).await.unwrap();
        assert_eq!(deleted["deleted"], a["id"]);

        let state = f.commands.mesh().snapshot();
        assert_eq!(state.agents.len(), 1);
        assert!(state.channels.is_empty());
        assert_eq!(state.groups[0].members.len(), 1);

        assert!(f.run("delete_agent", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn create_group_requires_known_members() {
        let f = fixture();
        f.run("create_agent", json!({"name": "A"})).await.unwrap();
        let err = f
            .run("create_group", json!({"name": "crew", "members": ["A", "Ghost"]}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "agent `Ghost` not found");
        assert!(f.commands.mesh().snapshot().groups.is_empty());
    }

    #[tokio::test]
    async fn list_agents_returns_all() {
        let f = fixture();
        f.run("create_agent", json!({"name": "A"})).await.unwrap();
        f.run("create_agent", json!({"name": "B"})).await.unwrap();
        let agents = f.run("list_agents", json!({})).await.unwrap();
        assert_eq!(agents.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn schedule_job_enqueues_follow_up() {
        let f = fixture();
        let out = f
            .run("schedule_job", json!({"type": "list_agents"}))
            .await
            .unwrap();
        let queued = f.store.get(out["scheduled"].as_str().unwrap()).unwrap();
        assert_eq!(queued.status, JobStatus::Queued);
        assert_eq!(queued.job_type, "list_agents");
    }

    #[tokio::test]
    async fn ask_model_uses_agent_prompt_and_model() {
        let f = fixture();
        f.run(
            "create_agent",
            json!({"name": "Scout", "model": "claude-haiku-4-5-20251001", "systemPrompt": "Be brief."}),
        )
        .await
        .unwrap();

        let out = f
            .run("ask_model", json!({"prompt": "status?", "agent": "Scout", "maxTokens": 64}))
            .await
            .unwrap();
        assert_eq!(out["text"], "hello");
        assert_eq!(out["model"], "claude-haiku-4-5-20251001");
        assert_eq!(out["usage"]["input_tokens"], 4);

        let requests = f.sender.requests.lock();
        assert_eq!(requests[0].max_tokens, 64);
        assert_eq!(requests[0].system.as_deref(), Some("Be brief."));
    }

    #[tokio::test]
    async fn ask_model_surfaces_client_errors() {
        let f = fixture_with(MockSender::err(500));
        let err = f.run("ask_model", json!({"prompt": "hi"})).await.unwrap_err();
        assert!(matches!(err, CommandError::Model(_)));
        assert_eq!(f.sender.requests.lock()[0].model, MODEL);
    }

    #[tokio::test]
    async fn unknown_command_fails() {
        let f = fixture();
        let err = f.run("launch_rocket", json!({})).await.unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand(c) if c == "launch_rocket"));
    }
}
