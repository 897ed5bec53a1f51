use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    config::{duration_opt, RunOptions, DEFAULT_MAX_TURNS},
    error::ConfigError,
    eval::{
        assertion::{deserialize_rules, Assertion},
        checkpoint::{validate_checkpoints, Checkpoint},
    },
    input::InputSpec,
    types::{ChatMessage, SkipOptions, StreamOptions},
};

/// Id given to a case built from a literal message on the command line.
pub const MESSAGE_CASE_ID: &str = "T001";

/// What to do when the agent still waits for input after the last scripted turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingInputPolicy {
    #[default]
    Skip,
    Fail,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseMode {
    StaticSingle,
    StaticMulti,
    Dynamic,
}

impl CaseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaticSingle => "static_single",
            Self::StaticMulti => "static_multi",
            Self::Dynamic => "dynamic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSpec {
    pub input: InputSpec,
    #[serde(default, deserialize_with = "deserialize_rules", skip_serializing_if = "Vec::is_empty")]
    pub assert: Vec<Assertion>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatorOptions {
    /// Common keys: `persona`, `goal`, `style`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatorSpec {
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    #[serde(default)]
    pub options: SimulatorOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<SkipOptions>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_global_prompts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turns: Option<Vec<TurnSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_rules", skip_serializing_if = "Vec::is_empty")]
    pub assert: Vec<Assertion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulator: Option<SimulatorSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<usize>,
    #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<CaseOptions>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_missing_input: Option<MissingInputPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs: Option<usize>,
    #[serde(rename = "user", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "team", default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

impl TestCase {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: None,
            messages: None,
            turns: None,
            expected: None,
            assert: Vec::new(),
            simulator: None,
            checkpoints: Vec::new(),
            max_turns: None,
            timeout: None,
            before: None,
            after: None,
            skip: false,
            options: None,
            metadata: Map::new(),
            on_missing_input: None,
            runs: None,
            user_id: None,
            team_id: None,
        }
    }

    /// A single-turn case wrapping a literal message.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self::new(MESSAGE_CASE_ID).with_input(InputSpec::Text(message.into()))
    }

    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_assertion(mut self, assertion: Assertion) -> Self {
        self.assert.push(assertion);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn invalid(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::InvalidCase {
            case: self.id.clone(),
            message: message.into(),
        }
    }

    /// Decides the execution mode from which fields are populated.
    pub fn mode(&self) -> Result<CaseMode, ConfigError> {
        let dynamic = self.simulator.is_some() || !self.checkpoints.is_empty();
        if self.turns.is_some() {
            if dynamic {
                return Err(self.invalid("'turns' cannot be combined with 'simulator' or 'checkpoints'"));
            }
            return Ok(CaseMode::StaticMulti);
        }
        if self.input.is_some() && self.messages.is_some() {
            return Err(self.invalid("'input' and 'messages' are mutually exclusive"));
        }
        if dynamic {
            return Ok(CaseMode::Dynamic);
        }
        if self.input.is_some() || self.messages.is_some() {
            return Ok(CaseMode::StaticSingle);
        }
        Err(self.invalid("no input specification: set 'input', 'messages', 'turns' or 'simulator'"))
    }

    pub fn validate(&self) -> Result<CaseMode, ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidCase {
                case: "<unnamed>".to_string(),
                message: "missing 'id'".to_string(),
            });
        }
        let mode = self.mode()?;
        match mode {
            CaseMode::StaticMulti => {
                let turns = self.turns.as_deref().unwrap_or_default();
                if turns.is_empty() {
                    return Err(self.invalid("'turns' must contain at least one turn"));
                }
                if turns.iter().any(|turn| turn.input.is_empty()) {
                    return Err(self.invalid("every turn needs a non-empty 'input'"));
                }
            }
            CaseMode::Dynamic => {
                validate_checkpoints(&self.id, &self.checkpoints)?;
                if self.max_turns == Some(0) {
                    return Err(self.invalid("'max_turns' must be at least 1"));
                }
            }
            CaseMode::StaticSingle => {
                if self.input.as_ref().is_some_and(InputSpec::is_empty)
                    || self.messages.as_ref().is_some_and(Vec::is_empty)
                {
                    return Err(self.invalid("input must not be empty"));
                }
            }
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(self.invalid("timeout must be positive"));
        }
        if self.runs == Some(0) {
            return Err(self.invalid("'runs' must be at least 1"));
        }
        Ok(mode)
    }

    /// Messages sent on the first turn: `input` or `messages`.
    pub fn initial_messages(&self) -> Vec<ChatMessage> {
        match (&self.input, &self.messages) {
            (Some(input), _) => input.to_messages(),
            (None, Some(messages)) => messages.clone(),
            (None, None) => Vec::new(),
        }
    }

    /// The case input as JSON, as handed to validators and scripts.
    pub fn input_value(&self) -> Option<Value> {
        match (&self.input, &self.messages) {
            (Some(input), _) => serde_json::to_value(input).ok(),
            (None, Some(messages)) => serde_json::to_value(messages).ok(),
            (None, None) => None,
        }
    }

    /// The case's rules; `expected` stands in as an `equals` rule when `assert` is empty.
    pub fn assertions(&self) -> Vec<Assertion> {
        if !self.assert.is_empty() {
            return self.assert.clone();
        }
        match &self.expected {
            Some(expected) => vec![Assertion::equals(expected.clone())],
            None => Vec::new(),
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns.unwrap_or(DEFAULT_MAX_TURNS)
    }

    pub fn missing_input_policy(&self, run: &RunOptions) -> MissingInputPolicy {
        self.on_missing_input.unwrap_or(run.on_missing_input)
    }

    /// Simulator id from the case, falling back to the run default.
    pub fn simulator_id(&self, run: &RunOptions) -> Option<String> {
        self.simulator
            .as_ref()
            .and_then(|sim| sim.use_.clone())
            .or_else(|| run.simulator.clone())
            .map(|id| id.strip_prefix("agents:").map(str::to_string).unwrap_or(id))
            .filter(|id| !id.trim().is_empty())
    }

    pub fn runs(&self, run: &RunOptions) -> usize {
        self.runs.unwrap_or(run.runs).max(1)
    }

    /// Options for invoking the agent under test. The run-level connector wins over the
    /// case's; history is always skipped since every call carries the full conversation.
    pub fn stream_options(&self, run: &RunOptions) -> StreamOptions {
        let case_options = self.options.clone().unwrap_or_default();
        let mut skip = case_options.skip.unwrap_or_default();
        skip.history = true;
        if case_options.search == Some(false) {
            skip.search = true;
        }

        let mut metadata = self.metadata.clone();
        metadata.extend(case_options.metadata);
        if case_options.disable_global_prompts {
            metadata.insert("disable_global_prompts".to_string(), Value::Bool(true));
        }
        if let Some(user) = &self.user_id {
            metadata.insert("user_id".to_string(), Value::String(user.clone()));
        }
        if let Some(team) = &self.team_id {
            metadata.insert("team_id".to_string(), Value::String(team.clone()));
        }

        StreamOptions {
            connector: run.connector.clone().or(case_options.connector),
            skip,
            mode: case_options.mode,
            metadata,
        }
    }
}
