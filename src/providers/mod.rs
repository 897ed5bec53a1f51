use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{AgentCallError, CollaboratorError, ScriptError},
    scripts::ScriptRef,
    types::{AgentResponse, ChatMessage, StreamOptions},
};

pub mod adapters;
pub mod http;
pub mod scripted;

/// The agent under test, or any agent addressed by id.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &StreamOptions,
    ) -> Result<AgentResponse, AgentCallError>;

    fn name(&self) -> &str {
        "agent"
    }
}

/// Resolves agents by id: the agent under test, simulators, validators and case generators.
pub trait AgentDirectory: Send + Sync {
    fn agent(&self, id: &str) -> Result<Arc<dyn AgentClient>, AgentCallError>;
}

#[async_trait]
pub trait Simulator: Send + Sync {
    async fn next_turn(&self, request: &SimulatorRequest) -> Result<SimulatorReply, CollaboratorError>;
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, request: &ValidationRequest) -> Result<ValidationVerdict, CollaboratorError>;
}

/// Out-of-process code used by `script` assertions and before/after hooks.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    async fn load(&self, module: &str) -> Result<(), ScriptError>;

    async fn call(&self, target: &ScriptRef, args: Vec<Value>) -> Result<Value, ScriptError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorRequest {
    pub simulator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
    pub conversation: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<Value>,
    pub turn: usize,
    pub max_turns: usize,
    #[serde(default)]
    pub reached_checkpoints: Vec<String>,
    #[serde(default)]
    pub pending_checkpoints: Vec<String>,
    /// Connector override for the simulator's own model; not part of the payload.
    #[serde(skip)]
    pub connector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimulatorReply {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub goal_achieved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl SimulatorReply {
    pub fn say(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn goal_achieved(mut self) -> Self {
        self.goal_achieved = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub validator: String,
    pub criteria: Value,
    /// Merged into the top level of the payload sent to agent-backed validators.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversation: Vec<ChatMessage>,
    #[serde(skip)]
    pub connector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationVerdict {
    #[serde(default)]
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

/// In-memory directory keyed by agent id.
#[derive(Clone, Default)]
pub struct StaticDirectory {
    agents: HashMap<String, Arc<dyn AgentClient>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, id: impl Into<String>, agent: Arc<dyn AgentClient>) -> Self {
        self.agents.insert(id.into(), agent);
        self
    }
}

impl AgentDirectory for StaticDirectory {
    fn agent(&self, id: &str) -> Result<Arc<dyn AgentClient>, AgentCallError> {
        let id = id.strip_prefix("agents:").unwrap_or(id);
        self.agents
            .get(id)
            .cloned()
            .ok_or_else(|| AgentCallError::UnknownAgent(id.to_string()))
    }
}
