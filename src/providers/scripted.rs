use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::{AgentCallError, CollaboratorError, ScriptError},
    providers::{
        AgentClient, ScriptHost, Simulator, SimulatorReply, SimulatorRequest, ValidationRequest,
        ValidationVerdict, Validator,
    },
    scripts::ScriptRef,
    types::{AgentResponse, ChatMessage, StreamOptions},
};

type Responder = dyn Fn(&[ChatMessage]) -> Result<AgentResponse, AgentCallError> + Send + Sync;

enum Script {
    Queue(VecDeque<Result<AgentResponse, AgentCallError>>),
    Respond(Arc<Responder>),
}

/// Agent fixture that replays queued responses, or answers through a closure.
/// Every invocation is recorded for later inspection.
pub struct ScriptedAgent {
    script: Mutex<Script>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::from_responses(Vec::new())
    }

    pub fn from_responses(responses: impl IntoIterator<Item = AgentResponse>) -> Self {
        Self::with_script(Script::Queue(responses.into_iter().map(Ok).collect()))
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_responses(texts.into_iter().map(AgentResponse::text))
    }

    pub fn from_fn<F>(respond: F) -> Self
    where
        F: Fn(&[ChatMessage]) -> Result<AgentResponse, AgentCallError> + Send + Sync + 'static,
    {
        Self::with_script(Script::Respond(Arc::new(respond)))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(self, response: AgentResponse) -> Self {
        self.push_result(Ok(response))
    }

    pub fn push_error(self, error: AgentCallError) -> Self {
        self.push_result(Err(error))
    }

    fn push_result(self, result: Result<AgentResponse, AgentCallError>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            if let Script::Queue(queue) = &mut *script {
                queue.push_back(result);
            }
        }
        self
    }

    /// Sleeps before every reply; used to exercise timeouts and parallelism.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    fn next_response(&self, messages: &[ChatMessage]) -> Result<AgentResponse, AgentCallError> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| AgentCallError::Agent("scripted agent poisoned".to_string()))?;
        match &mut *script {
            Script::Queue(queue) => queue
                .pop_front()
                .unwrap_or_else(|| Err(AgentCallError::Agent("no more scripted responses".to_string()))),
            Script::Respond(respond) => respond(messages),
        }
    }
}

impl Default for ScriptedAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        _options: &StreamOptions,
    ) -> Result<AgentResponse, AgentCallError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_response(messages)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Simulator fixture replaying queued replies; an exhausted queue is an error.
pub struct ScriptedSimulator {
    replies: Mutex<VecDeque<Result<SimulatorReply, CollaboratorError>>>,
    delay: Option<Duration>,
    requests: Mutex<Vec<SimulatorRequest>>,
}

impl ScriptedSimulator {
    pub fn new(replies: impl IntoIterator<Item = SimulatorReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_error(self, error: CollaboratorError) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Err(error));
        }
        self
    }

    pub fn requests(&self) -> Vec<SimulatorRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Simulator for ScriptedSimulator {
    async fn next_turn(&self, request: &SimulatorRequest) -> Result<SimulatorReply, CollaboratorError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .map_err(|_| CollaboratorError::InvalidResponse("scripted simulator poisoned".to_string()))?
            .pop_front()
            .unwrap_or_else(|| {
                Err(CollaboratorError::InvalidResponse(
                    "no more scripted simulator replies".to_string(),
                ))
            })
    }
}

type Judge = dyn Fn(&ValidationRequest) -> Result<ValidationVerdict, CollaboratorError> + Send + Sync;

/// Validator fixture backed by a closure.
pub struct ScriptedValidator {
    judge: Box<Judge>,
}

impl ScriptedValidator {
    pub fn new<F>(judge: F) -> Self
    where
        F: Fn(&ValidationRequest) -> Result<ValidationVerdict, CollaboratorError> + Send + Sync + 'static,
    {
        Self { judge: Box::new(judge) }
    }

    pub fn always(verdict: ValidationVerdict) -> Self {
        Self::new(move |_| Ok(verdict.clone()))
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate(&self, request: &ValidationRequest) -> Result<ValidationVerdict, CollaboratorError> {
        (self.judge)(request)
    }
}

type ScriptFn = dyn Fn(&[Value]) -> Result<Value, ScriptError> + Send + Sync;

/// In-process script host keyed by `module.function`.
#[derive(Default)]
pub struct ScriptedHost {
    functions: HashMap<String, Box<ScriptFn>>,
    loads: Mutex<Vec<String>>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function<F>(mut self, target: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, ScriptError> + Send + Sync + 'static,
    {
        self.functions.insert(target.into(), Box::new(function));
        self
    }

    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ScriptHost for ScriptedHost {
    async fn load(&self, module: &str) -> Result<(), ScriptError> {
        let prefix = format!("{module}.");
        if !self.functions.keys().any(|key| key.starts_with(&prefix)) {
            return Err(ScriptError::Load {
                module: module.to_string(),
                message: "unknown module".to_string(),
            });
        }
        if let Ok(mut loads) = self.loads.lock() {
            loads.push(module.to_string());
        }
        Ok(())
    }

    async fn call(&self, target: &ScriptRef, args: Vec<Value>) -> Result<Value, ScriptError> {
        let function = self
            .functions
            .get(&target.to_string())
            .ok_or_else(|| ScriptError::Execution {
                target: target.to_string(),
                message: "function not found".to_string(),
            })?;
        function(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_queue_then_errors() {
        let agent = ScriptedAgent::from_texts(["one", "two"]);
        let options = StreamOptions::default();
        let messages = [ChatMessage::user("hi")];

        assert_eq!(agent.stream(&messages, &options).await.unwrap(), AgentResponse::text("one"));
        assert_eq!(agent.stream(&messages, &options).await.unwrap(), AgentResponse::text("two"));
        assert!(agent.stream(&messages, &options).await.is_err());
        assert_eq!(agent.call_count(), 3);
    }

    #[tokio::test]
    async fn closure_agent_sees_messages() {
        let agent = ScriptedAgent::from_fn(|messages| {
            Ok(AgentResponse::text(format!("{} messages", messages.len())))
        });
        let reply = agent
            .stream(&[ChatMessage::system("s"), ChatMessage::user("u")], &StreamOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.content, Value::String("2 messages".to_string()));
    }
}
