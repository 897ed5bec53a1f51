pub mod config;
pub mod error;
pub mod eval;
pub mod input;
pub mod json;
pub mod providers;
pub mod scripts;
pub mod types;

pub use config::RunOptions;
pub use error::{AgentCallError, CollaboratorError, ConfigError, EvalError, RunError, ScriptError};
pub use eval::{
    assertion::{Assertion, AssertionKind, AssertionOutcome, EvalContext, Evaluator},
    awaiting::{AwaitingDetector, AwaitingInput, AwaitingSource},
    case::{CaseMode, MissingInputPolicy, TestCase},
    checkpoint::{Checkpoint, CheckpointState, CheckpointTracker},
    executor::{TurnExecutor, TurnResult},
    loader::{load_cases, parse_cases, validate_cases, InputSource},
    machine::{CaseMachine, CaseResult, CaseState, CaseStatus, Harness, TurnRecord},
    report::{Report, ReportMetadata, Summary},
    runner::{CasePlan, Collaborators, Runner},
    stability::{StabilityClass, StabilityResult},
};
pub use input::InputSpec;
pub use providers::{
    AgentClient, AgentDirectory, ScriptHost, Simulator, SimulatorReply, SimulatorRequest, ValidationRequest,
    ValidationVerdict, Validator,
};
pub use scripts::{ScriptRef, ScriptRegistry};
pub use types::{AgentResponse, ChatMessage, MessageRole, StreamOptions, ToolCall};
