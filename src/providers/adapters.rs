use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
    error::CollaboratorError,
    json::extract_json,
    providers::{
        AgentDirectory, Simulator, SimulatorReply, SimulatorRequest, ValidationRequest,
        ValidationVerdict, Validator,
    },
    types::{content_text, AgentResponse, ChatMessage, SkipOptions, StreamOptions},
};

fn side_channel_options(test_mode: &str, connector: Option<String>) -> StreamOptions {
    let mut metadata = Map::new();
    metadata.insert("test_mode".to_string(), json!(test_mode));
    StreamOptions {
        connector,
        skip: SkipOptions {
            history: true,
            trace: true,
            output: true,
            ..SkipOptions::default()
        },
        mode: None,
        metadata,
    }
}

fn payload_message<T: serde::Serialize>(payload: &T) -> Result<ChatMessage, CollaboratorError> {
    let encoded = serde_json::to_string(payload)
        .map_err(|e| CollaboratorError::InvalidResponse(format!("failed to encode request: {e}")))?;
    Ok(ChatMessage::user(encoded))
}

/// Simulator played by an agent: the request goes out as a JSON user message and the reply
/// is read as `{message, goal_achieved, reasoning}`, or as plain text meaning the message.
pub struct AgentSimulator {
    directory: Arc<dyn AgentDirectory>,
}

impl AgentSimulator {
    pub fn new(directory: Arc<dyn AgentDirectory>) -> Self {
        Self { directory }
    }
}

pub(crate) fn parse_simulator_reply(response: &AgentResponse) -> Result<SimulatorReply, CollaboratorError> {
    let text = content_text(&response.content);
    if text.trim().is_empty() {
        return Err(CollaboratorError::InvalidResponse(
            "empty response from simulator".to_string(),
        ));
    }
    let Some(Value::Object(fields)) = extract_json(&text) else {
        return Ok(SimulatorReply::say(text));
    };
    let reply = SimulatorReply {
        message: fields
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        goal_achieved: fields
            .get("goal_achieved")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        reasoning: fields
            .get("reasoning")
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    if reply.message.is_empty() && !reply.goal_achieved {
        return Err(CollaboratorError::InvalidResponse(
            "simulator returned empty message".to_string(),
        ));
    }
    Ok(reply)
}

#[async_trait]
impl Simulator for AgentSimulator {
    async fn next_turn(&self, request: &SimulatorRequest) -> Result<SimulatorReply, CollaboratorError> {
        let agent = self.directory.agent(&request.simulator)?;
        let options = side_channel_options("simulator", request.connector.clone());
        let messages = [payload_message(request)?];
        debug!(simulator = %request.simulator, turn = request.turn, "requesting simulated user turn");
        let response = agent.stream(&messages, &options).await?;
        parse_simulator_reply(&response)
    }
}

/// External validator played by an agent answering `{passed, reason, score, suggestions}`.
pub struct AgentValidator {
    directory: Arc<dyn AgentDirectory>,
}

impl AgentValidator {
    pub fn new(directory: Arc<dyn AgentDirectory>) -> Self {
        Self { directory }
    }
}

pub(crate) fn parse_verdict(response: &AgentResponse) -> ValidationVerdict {
    let parsed = match &response.content {
        Value::Object(_) => Some(response.content.clone()),
        other => extract_json(&content_text(other)),
    };
    let Some(Value::Object(fields)) = parsed else {
        return ValidationVerdict {
            passed: false,
            reason: Some("validator agent returned invalid response format".to_string()),
            ..ValidationVerdict::default()
        };
    };
    let Some(passed) = fields.get("passed").and_then(Value::as_bool) else {
        return ValidationVerdict {
            passed: false,
            reason: Some("validator response missing 'passed' field".to_string()),
            ..ValidationVerdict::default()
        };
    };
    ValidationVerdict {
        passed,
        score: fields.get("score").and_then(Value::as_f64),
        reason: fields.get("reason").and_then(Value::as_str).map(str::to_string),
        suggestions: fields
            .get("suggestions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

#[async_trait]
impl Validator for AgentValidator {
    async fn validate(&self, request: &ValidationRequest) -> Result<ValidationVerdict, CollaboratorError> {
        let agent = self.directory.agent(&request.validator)?;
        let options = side_channel_options("validator", request.connector.clone());
        let messages = [payload_message(request)?];
        debug!(validator = %request.validator, "requesting validation");
        let response = agent.stream(&messages, &options).await?;
        Ok(parse_verdict(&response))
    }
}
