use std::path::PathBuf;

use thiserror::Error;

/// Problems found while loading or validating test cases and run options.
/// Any of these aborts the run before a single case executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: invalid test case: {message}")]
    Parse { line: usize, message: String },

    #[error("invalid configuration file: {0}")]
    Options(String),

    #[error("duplicate test case id: {0}")]
    DuplicateId(String),

    #[error("test case {case}: {message}")]
    InvalidCase { case: String, message: String },

    #[error("test case {case}: duplicate checkpoint id: {checkpoint}")]
    DuplicateCheckpoint { case: String, checkpoint: String },

    #[error("test case {case}: checkpoint {checkpoint} depends on unknown checkpoint {missing}")]
    UnknownCheckpoint {
        case: String,
        checkpoint: String,
        missing: String,
    },

    #[error("test case {case}: checkpoint prerequisites form a cycle: {}", .cycle.join(" -> "))]
    CheckpointCycle { case: String, cycle: Vec<String> },

    #[error("invalid duration '{value}': {message}")]
    InvalidDuration { value: String, message: String },

    #[error("invalid filter pattern: {0}")]
    InvalidFilter(#[from] regex::Error),

    #[error("no test cases found in {0}")]
    Empty(String),

    #[error("test case generation failed: {0}")]
    Generator(String),
}

/// Failure reported by the agent collaborator itself.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentCallError {
    #[error("agent call timed out")]
    Timeout,

    #[error("agent error: {0}")]
    Agent(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),
}

impl From<reqwest::Error> for AgentCallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Agent(err.to_string())
        }
    }
}

/// Failure of a simulator or external validator call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    #[error(transparent)]
    Agent(#[from] AgentCallError),

    #[error("invalid collaborator response: {0}")]
    InvalidResponse(String),

    #[error("collaborator not configured: {0}")]
    NotConfigured(&'static str),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScriptError {
    #[error("invalid script reference '{0}'")]
    InvalidReference(String),

    #[error("script host not configured")]
    NotConfigured,

    #[error("failed to load script module {module}: {message}")]
    Load { module: String, message: String },

    #[error("script {target} failed: {message}")]
    Execution { target: String, message: String },

    #[error("script {target} returned invalid output: {message}")]
    InvalidOutput { target: String, message: String },
}

/// Evaluator-level failure: the assertion could not be judged at all.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("invalid regex pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("invalid JSON schema: {0}")]
    InvalidSchema(String),

    #[error("external validator failed: {0}")]
    Validator(#[from] CollaboratorError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("validator call timed out")]
    Timeout,
}

/// Failure that aborts a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("before_all hook failed: {0}")]
    BeforeAll(#[source] ScriptError),
}
