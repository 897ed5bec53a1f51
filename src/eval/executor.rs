use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    error::AgentCallError,
    eval::awaiting::{AwaitingDetector, AwaitingInput},
    input::truncate,
    providers::AgentClient,
    types::{content_text, AgentResponse, ChatMessage, MessageContent, StreamOptions, ToolCall},
};

/// Outcome of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub turn: usize,
    /// What the user side sent this turn: text, or the message list.
    pub input: Value,
    pub content: Value,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_awaiting: Option<bool>,
    pub awaiting: AwaitingInput,
    pub duration_ms: u64,
}

impl TurnResult {
    pub fn from_response(
        turn: usize,
        input: Value,
        response: AgentResponse,
        detector: &AwaitingDetector,
        duration_ms: u64,
    ) -> Self {
        let text = content_text(&response.content);
        let awaiting = detector.detect(response.awaiting_input, &response.tool_calls, &text);
        Self {
            turn,
            input,
            content: response.content,
            text,
            tool_calls: response.tool_calls,
            declared_awaiting: response.awaiting_input,
            awaiting,
            duration_ms,
        }
    }

    /// Messages to append to the conversation: the assistant reply, then one tool
    /// message per call that produced a result or an error.
    pub fn reply_messages(&self) -> Vec<ChatMessage> {
        let mut assistant = ChatMessage::assistant(self.text.clone()).with_tool_calls(self.tool_calls.clone());
        if self.text.is_empty() && !self.tool_calls.is_empty() {
            assistant.content = None;
        }
        let mut messages = vec![assistant];
        for (index, call) in self.tool_calls.iter().enumerate() {
            let payload = match (&call.result, &call.error) {
                (_, Some(error)) => serde_json::json!({ "error": error }),
                (Some(result), None) => result.clone(),
                (None, None) => continue,
            };
            let id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{}_{index}", self.turn));
            let mut message = ChatMessage::tool(id, MessageContent::Text(crate::json::to_text(&payload)));
            message.name = Some(call.name.clone());
            messages.push(message);
        }
        messages
    }
}

/// Runs single agent invocations under the case deadline.
pub struct TurnExecutor<'a> {
    agent: &'a dyn AgentClient,
    options: &'a StreamOptions,
    detector: &'a AwaitingDetector,
    deadline: Instant,
}

impl<'a> TurnExecutor<'a> {
    pub fn new(
        agent: &'a dyn AgentClient,
        options: &'a StreamOptions,
        detector: &'a AwaitingDetector,
        deadline: Instant,
    ) -> Self {
        Self {
            agent,
            options,
            detector,
            deadline,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub async fn execute(
        &self,
        turn: usize,
        input: Value,
        messages: &[ChatMessage],
    ) -> Result<TurnResult, AgentCallError> {
        let started = Instant::now();
        let response = tokio::time::timeout_at(self.deadline, self.agent.stream(messages, self.options))
            .await
            .map_err(|_| AgentCallError::Timeout)??;
        let elapsed = started.elapsed().as_millis() as u64;
        let result = TurnResult::from_response(turn, input, response, self.detector, elapsed);
        debug!(
            turn,
            agent = self.agent.name(),
            tools = result.tool_calls.len(),
            awaiting = result.awaiting.awaiting,
            output = %truncate(&result.text, 80),
            "turn completed"
        );
        Ok(result)
    }
}
