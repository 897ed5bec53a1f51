use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::{
    config::{RunOptions, DEFAULT_DYNAMIC_TIMEOUT, DEFAULT_TIMEOUT},
    error::{AgentCallError, ConfigError, EvalError, ScriptError},
    eval::{
        assertion::{Assertion, AssertionOutcome, EvalContext, Evaluator},
        awaiting::AwaitingDetector,
        case::{CaseMode, MissingInputPolicy, TestCase},
        checkpoint::{CheckpointState, CheckpointTracker},
        executor::{TurnExecutor, TurnResult},
    },
    input::resolve_attachments,
    providers::{AgentClient, Simulator, SimulatorRequest, Validator},
    scripts::ScriptRegistry,
    types::{ChatMessage, StreamOptions},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
    Error,
    Timeout,
}

impl CaseStatus {
    /// Statuses that make a run unsuccessful. Skips never do.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Error | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

/// Lifecycle of one case execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseState {
    Init,
    Running,
    Finished(CaseStatus),
}

impl CaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished(_))
    }

    /// Applies `next` if the move is legal; a finished case never changes again.
    pub fn transition(&mut self, next: CaseState) -> bool {
        let allowed = matches!(
            (*self, next),
            (Self::Init, Self::Running) | (Self::Init | Self::Running, Self::Finished(_))
        );
        if allowed {
            trace!(from = ?*self, to = ?next, "case state transition");
            *self = next;
        }
        allowed
    }
}

/// One turn of the trace: the agent's result and what was judged against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    #[serde(flatten)]
    pub result: TurnResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<AssertionOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints_reached: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulator_reasoning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub id: String,
    pub mode: CaseMode,
    pub status: CaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turns: Vec<TurnRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<CheckpointState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_assertions: Vec<AssertionOutcome>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub run: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_data: Option<Value>,
}

impl CaseResult {
    /// A result for a case that was never executed.
    pub fn skipped(case: &TestCase, mode: CaseMode, run: usize, reason: impl Into<String>) -> Self {
        Self {
            id: case.id.clone(),
            mode,
            status: CaseStatus::Skipped,
            input: case_input(case, mode),
            expected: case.expected.clone(),
            output: None,
            turns: Vec::new(),
            checkpoints: Vec::new(),
            failed_assertions: Vec::new(),
            duration_ms: 0,
            error: Some(reason.into()),
            run,
            before_data: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }

    /// Text of the last agent reply.
    pub fn output_text(&self) -> String {
        self.output.as_ref().map(crate::json::to_text).unwrap_or_default()
    }
}

fn case_input(case: &TestCase, mode: CaseMode) -> Option<Value> {
    match (mode, &case.turns) {
        (CaseMode::StaticMulti, Some(turns)) => Some(Value::Array(
            turns
                .iter()
                .filter_map(|turn| serde_json::to_value(&turn.input).ok())
                .collect(),
        )),
        _ => case.input_value(),
    }
}

/// Timeout for one run of a case: the case's own, else the run default, else
/// the mode default.
pub fn case_timeout(case: &TestCase, mode: CaseMode, options: &RunOptions) -> Duration {
    case.timeout.or(options.timeout).unwrap_or(match mode {
        CaseMode::Dynamic => DEFAULT_DYNAMIC_TIMEOUT,
        _ => DEFAULT_TIMEOUT,
    })
}

/// Everything a case execution may call out to. Shared read-only across workers.
pub struct Harness {
    pub agent: Arc<dyn AgentClient>,
    pub simulator: Option<Arc<dyn Simulator>>,
    pub evaluator: Evaluator,
    pub scripts: Option<Arc<ScriptRegistry>>,
    pub detector: AwaitingDetector,
    pub options: RunOptions,
    /// Directory that relative attachment paths resolve against.
    pub base_dir: Option<PathBuf>,
}

impl Harness {
    pub fn new(agent: Arc<dyn AgentClient>, options: RunOptions) -> Self {
        let detector = AwaitingDetector::new(options.input_tools.clone());
        Self {
            agent,
            simulator: None,
            evaluator: Evaluator::new(),
            scripts: None,
            detector,
            options,
            base_dir: None,
        }
    }

    pub fn with_simulator(mut self, simulator: Arc<dyn Simulator>) -> Self {
        self.simulator = Some(simulator);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.evaluator = self.evaluator.with_validator(validator);
        self
    }

    pub fn with_scripts(mut self, scripts: Arc<ScriptRegistry>) -> Self {
        self.evaluator = self.evaluator.with_scripts(scripts.clone());
        self.scripts = Some(scripts);
        self
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }
}

/// How a run ended, before it is folded into a [`CaseResult`].
#[derive(Debug, Clone, PartialEq)]
struct Resolution {
    status: CaseStatus,
    message: Option<String>,
}

impl Resolution {
    fn passed() -> Self {
        Self {
            status: CaseStatus::Passed,
            message: None,
        }
    }

    fn with(status: CaseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self::with(CaseStatus::Failed, message)
    }

    fn error(message: impl Into<String>) -> Self {
        Self::with(CaseStatus::Error, message)
    }

    fn skipped(message: impl Into<String>) -> Self {
        Self::with(CaseStatus::Skipped, message)
    }

    fn timeout(message: impl Into<String>) -> Self {
        Self::with(CaseStatus::Timeout, message)
    }
}

/// `Err` carries a terminal resolution reached mid-step.
type Step<T> = Result<T, Resolution>;

fn failure_summary(outcomes: &[AssertionOutcome]) -> String {
    let messages: Vec<&str> = outcomes
        .iter()
        .filter(|outcome| !outcome.passed)
        .map(|outcome| outcome.message.as_str())
        .collect();
    format!("assertion failed: {}", messages.join("; "))
}

fn split_persona(metadata: &Map<String, Value>) -> (Option<String>, Option<String>, Map<String, Value>) {
    let mut extra = metadata.clone();
    let mut take = |key: &str| match extra.remove(key) {
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
        None => None,
    };
    let persona = take("persona");
    let goal = take("goal");
    (persona, goal, extra)
}

/// Drives one run of one case from `Init` to a terminal status.
pub struct CaseMachine<'a> {
    harness: &'a Harness,
    case: &'a TestCase,
    mode: CaseMode,
    run: usize,
    state: CaseState,
    timeout: Duration,
    deadline: Instant,
    stream_options: StreamOptions,
    input: Option<Value>,
    conversation: Vec<ChatMessage>,
    turns: Vec<TurnRecord>,
    failed: Vec<AssertionOutcome>,
    checkpoints: Vec<CheckpointState>,
}

impl<'a> CaseMachine<'a> {
    pub fn new(harness: &'a Harness, case: &'a TestCase, run: usize) -> Result<Self, ConfigError> {
        let mode = case.validate()?;
        let timeout = case_timeout(case, mode, &harness.options);
        Ok(Self {
            harness,
            case,
            mode,
            run,
            state: CaseState::Init,
            timeout,
            deadline: Instant::now() + timeout,
            stream_options: case.stream_options(&harness.options),
            input: case_input(case, mode),
            conversation: Vec::new(),
            turns: Vec::new(),
            failed: Vec::new(),
            checkpoints: Vec::new(),
        })
    }

    pub fn mode(&self) -> CaseMode {
        self.mode
    }

    pub fn state(&self) -> CaseState {
        self.state
    }

    pub async fn run(mut self) -> CaseResult {
        let started = Instant::now();
        self.deadline = started + self.timeout;
        self.state.transition(CaseState::Running);
        debug!(case = %self.case.id, mode = self.mode.as_str(), run = self.run, "case started");

        let mut before_data = None;
        let resolution = if self.case.skip {
            Resolution::skipped("skipped by case definition")
        } else {
            match self.before_hook().await {
                Ok(data) => {
                    before_data = data;
                    self.drive().await
                }
                Err(resolution) => resolution,
            }
        };

        let harness = self.harness;
        let case = self.case;
        let hook_timeout = self.timeout;
        let mut result = self.into_result(resolution, before_data, started);
        if let Some(reference) = &case.after {
            if let Err(err) = after_hook(harness, case, &result, reference, hook_timeout).await {
                warn!(case = %case.id, error = %err, "after hook failed");
                let note = format!("after hook failed: {err}");
                result.error = Some(match result.error.take() {
                    Some(previous) => format!("{previous}; {note}"),
                    None => note,
                });
                if result.status == CaseStatus::Passed {
                    result.status = CaseStatus::Error;
                }
            }
        }
        result
    }

    fn into_result(mut self, resolution: Resolution, before_data: Option<Value>, started: Instant) -> CaseResult {
        self.state.transition(CaseState::Finished(resolution.status));
        debug!(
            case = %self.case.id,
            run = self.run,
            status = resolution.status.as_str(),
            turns = self.turns.len(),
            "case finished"
        );
        CaseResult {
            id: self.case.id.clone(),
            mode: self.mode,
            status: resolution.status,
            input: self.input,
            expected: self.case.expected.clone(),
            output: self.turns.last().map(|record| record.result.content.clone()),
            turns: self.turns,
            checkpoints: self.checkpoints,
            failed_assertions: self.failed,
            duration_ms: started.elapsed().as_millis() as u64,
            error: resolution.message,
            run: self.run,
            before_data,
        }
    }

    async fn drive(&mut self) -> Resolution {
        let outcome = match self.mode {
            CaseMode::StaticSingle => self.run_single().await,
            CaseMode::StaticMulti => self.run_multi().await,
            CaseMode::Dynamic => self.run_dynamic().await,
        };
        match outcome {
            Ok(resolution) | Err(resolution) => resolution,
        }
    }

    async fn before_hook(&self) -> Step<Option<Value>> {
        let Some(reference) = &self.case.before else {
            return Ok(None);
        };
        let Some(scripts) = &self.harness.scripts else {
            return Err(Resolution::error(format!(
                "before hook failed: {}",
                ScriptError::NotConfigured
            )));
        };
        let case = serde_json::to_value(self.case).unwrap_or(Value::Null);
        match timeout_at(self.deadline, scripts.run_hook(reference, vec![case])).await {
            Err(_) => Err(self.timed_out("in before hook")),
            Ok(Err(err)) => Err(Resolution::error(format!("before hook failed: {err}"))),
            Ok(Ok(data)) => Ok(Some(data)),
        }
    }

    async fn run_single(&mut self) -> Step<Resolution> {
        let messages = self.prepare(self.case.initial_messages()).await?;
        self.conversation = messages;
        let input = self.input.clone().unwrap_or(Value::Null);
        let turn = self.execute(1, input).await?;
        self.conversation.extend(turn.reply_messages());

        let assertions = self.case.assertions();
        let passed = self.judge_and_record(&assertions, turn, Vec::new(), None).await?;
        if passed {
            Ok(Resolution::passed())
        } else {
            Ok(Resolution::failed(failure_summary(&self.failed)))
        }
    }

    async fn run_multi(&mut self) -> Step<Resolution> {
        let case = self.case;
        let turns = case.turns.as_deref().unwrap_or_default();
        for (index, spec) in turns.iter().enumerate() {
            let number = index + 1;
            let messages = self.prepare(spec.input.to_messages()).await?;
            self.conversation.extend(messages);
            let input = serde_json::to_value(&spec.input).unwrap_or(Value::Null);
            let turn = self.execute(number, input).await?;
            self.conversation.extend(turn.reply_messages());

            if !self.judge_and_record(&spec.assert, turn, Vec::new(), None).await? {
                return Ok(Resolution::failed(format!(
                    "turn {number}: {}",
                    failure_summary(&self.failed)
                )));
            }
        }

        let awaiting = self
            .turns
            .last()
            .is_some_and(|record| record.result.awaiting.awaiting);
        if awaiting {
            let reason = format!(
                "agent is awaiting input after turn {} and no scripted turn remains",
                turns.len()
            );
            match case.missing_input_policy(&self.harness.options) {
                MissingInputPolicy::Skip => return Ok(Resolution::skipped(reason)),
                MissingInputPolicy::Fail => return Ok(Resolution::failed(reason)),
                MissingInputPolicy::End => debug!(case = %self.case.id, "{reason}; ending conversation"),
            }
        }
        self.final_assertions().await
    }

    async fn run_dynamic(&mut self) -> Step<Resolution> {
        let harness = self.harness;
        let Some(simulator) = harness.simulator.as_deref() else {
            return Ok(Resolution::skipped("no simulator configured"));
        };
        let Some(simulator_id) = self.case.simulator_id(&harness.options) else {
            return Ok(Resolution::skipped("neither the case nor the run names a simulator"));
        };

        let mut tracker = CheckpointTracker::new(&self.case.checkpoints);
        let outcome = self
            .conversation_loop(simulator, &simulator_id, &mut tracker)
            .await;
        self.checkpoints = tracker.into_states();
        match outcome? {
            resolution if resolution.status == CaseStatus::Passed => self.final_assertions().await,
            resolution => Ok(resolution),
        }
    }

    async fn conversation_loop(
        &mut self,
        simulator: &dyn Simulator,
        simulator_id: &str,
        tracker: &mut CheckpointTracker,
    ) -> Step<Resolution> {
        let options = self
            .case
            .simulator
            .as_ref()
            .map(|spec| spec.options.clone())
            .unwrap_or_default();
        let (persona, goal, extra) = split_persona(&options.metadata);
        let max_turns = self.case.max_turns();
        let has_checkpoints = !self.case.checkpoints.is_empty();
        let initial = self.prepare(self.case.initial_messages()).await?;
        let mut last_response = None;

        for number in 1..=max_turns {
            if Instant::now() >= self.deadline {
                return Err(self.timed_out(&format!("at turn {number}")));
            }

            let (messages, input, reasoning) = if number == 1 && !initial.is_empty() {
                (initial.clone(), self.input.clone().unwrap_or(Value::Null), None)
            } else {
                let request = SimulatorRequest {
                    simulator: simulator_id.to_string(),
                    persona: persona.clone(),
                    goal: goal.clone(),
                    extra: extra.clone(),
                    conversation: self.conversation.clone(),
                    last_response: last_response.clone(),
                    turn: number,
                    max_turns,
                    reached_checkpoints: tracker.reached_ids(),
                    pending_checkpoints: tracker.pending_ids(),
                    connector: options.connector.clone(),
                };
                let reply = match timeout_at(self.deadline, simulator.next_turn(&request)).await {
                    Err(_) => return Err(self.timed_out(&format!("waiting for the simulator at turn {number}"))),
                    Ok(Err(err)) => {
                        return Err(Resolution::error(format!("simulator error at turn {number}: {err}")))
                    }
                    Ok(Ok(reply)) => reply,
                };
                if reply.goal_achieved {
                    debug!(case = %self.case.id, turn = number, "simulator reports goal achieved");
                    return Ok(if tracker.all_required_reached() {
                        Resolution::passed()
                    } else {
                        Resolution::failed(format!(
                            "simulator signaled goal achieved but not all required checkpoints reached: missing {}",
                            tracker.missing_required().join(", ")
                        ))
                    });
                }
                let text = reply.message;
                (vec![ChatMessage::user(text.clone())], Value::String(text), reply.reasoning)
            };

            self.conversation.extend(messages);
            let turn = self.execute(number, input).await?;
            last_response = Some(turn.content.clone());
            self.conversation.extend(turn.reply_messages());

            let observed = {
                let ctx = EvalContext::new(self.input.as_ref(), &self.conversation).with_deadline(self.deadline);
                tracker.observe(&turn, &self.harness.evaluator, &ctx).await
            };
            let reached = match observed {
                Ok(reached) => reached,
                Err(err) => {
                    let failure = self.eval_failure(number, err);
                    self.record(turn, Vec::new(), Vec::new(), reasoning);
                    return Err(failure);
                }
            };
            if !reached.is_empty() {
                debug!(case = %self.case.id, turn = number, reached = ?reached, "checkpoints reached");
            }
            self.record(turn, Vec::new(), reached, reasoning);

            if has_checkpoints && tracker.all_required_reached() {
                return Ok(Resolution::passed());
            }
        }

        Ok(Resolution::failed(if has_checkpoints {
            format!(
                "max turns ({max_turns}) exceeded without reaching all checkpoints: missing {}",
                tracker.missing_required().join(", ")
            )
        } else {
            format!("max turns ({max_turns}) exceeded before the simulator reached its goal")
        }))
    }

    /// Case-level rules judged against the last turn.
    async fn final_assertions(&mut self) -> Step<Resolution> {
        let assertions = self.case.assertions();
        let Some(last) = self.turns.last().map(|record| record.result.clone()) else {
            return Ok(Resolution::passed());
        };
        if assertions.is_empty() {
            return Ok(Resolution::passed());
        }
        let outcomes = self.judge(&assertions, &last).await?;
        let passed = outcomes.iter().all(|outcome| outcome.passed);
        self.failed.extend(outcomes.iter().filter(|o| !o.passed).cloned());
        if let Some(record) = self.turns.last_mut() {
            record.outcomes.extend(outcomes);
        }
        if passed {
            Ok(Resolution::passed())
        } else {
            Ok(Resolution::failed(failure_summary(&self.failed)))
        }
    }

    async fn prepare(&self, messages: Vec<ChatMessage>) -> Step<Vec<ChatMessage>> {
        resolve_attachments(messages, self.harness.base_dir.as_deref())
            .await
            .map_err(|err| Resolution::error(err.to_string()))
    }

    async fn execute(&self, number: usize, input: Value) -> Step<TurnResult> {
        let executor = TurnExecutor::new(
            self.harness.agent.as_ref(),
            &self.stream_options,
            &self.harness.detector,
            self.deadline,
        );
        executor
            .execute(number, input, &self.conversation)
            .await
            .map_err(|err| match err {
                AgentCallError::Timeout => self.timed_out(&format!("at turn {number}")),
                AgentCallError::Agent(message) => {
                    Resolution::error(format!("agent error at turn {number}: {message}"))
                }
                other => Resolution::error(format!("turn {number}: {other}")),
            })
    }

    async fn judge(&self, assertions: &[Assertion], turn: &TurnResult) -> Step<Vec<AssertionOutcome>> {
        let ctx = EvalContext::new(self.input.as_ref(), &self.conversation).with_deadline(self.deadline);
        self.harness
            .evaluator
            .evaluate_all(assertions, turn, &ctx)
            .await
            .map_err(|err| self.eval_failure(turn.turn, err))
    }

    /// Judges `turn` and appends it to the trace; the turn is kept even when
    /// evaluation itself fails.
    async fn judge_and_record(
        &mut self,
        assertions: &[Assertion],
        turn: TurnResult,
        reached: Vec<String>,
        reasoning: Option<String>,
    ) -> Step<bool> {
        match self.judge(assertions, &turn).await {
            Ok(outcomes) => {
                let passed = outcomes.iter().all(|outcome| outcome.passed);
                self.record(turn, outcomes, reached, reasoning);
                Ok(passed)
            }
            Err(resolution) => {
                self.record(turn, Vec::new(), reached, reasoning);
                Err(resolution)
            }
        }
    }

    fn record(
        &mut self,
        result: TurnResult,
        outcomes: Vec<AssertionOutcome>,
        checkpoints_reached: Vec<String>,
        simulator_reasoning: Option<String>,
    ) {
        self.failed
            .extend(outcomes.iter().filter(|outcome| !outcome.passed).cloned());
        self.turns.push(TurnRecord {
            result,
            outcomes,
            checkpoints_reached,
            simulator_reasoning,
        });
    }

    fn timed_out(&self, context: &str) -> Resolution {
        Resolution::timeout(format!(
            "timed out after {} {context}",
            humantime::format_duration(self.timeout)
        ))
    }

    fn eval_failure(&self, number: usize, err: EvalError) -> Resolution {
        match err {
            EvalError::Timeout => self.timed_out(&format!("evaluating turn {number}")),
            other => Resolution::error(format!("assertion error at turn {number}: {other}")),
        }
    }
}

async fn after_hook(
    harness: &Harness,
    case: &TestCase,
    result: &CaseResult,
    reference: &str,
    limit: Duration,
) -> Result<(), ScriptError> {
    let scripts = harness.scripts.as_ref().ok_or(ScriptError::NotConfigured)?;
    let args = vec![
        serde_json::to_value(case).unwrap_or(Value::Null),
        serde_json::to_value(result).unwrap_or(Value::Null),
        result.before_data.clone().unwrap_or(Value::Null),
    ];
    timeout(limit, scripts.run_hook(reference, args))
        .await
        .unwrap_or_else(|_| {
            Err(ScriptError::Execution {
                target: reference.to_string(),
                message: "timed out".to_string(),
            })
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        providers::{
            scripted::{ScriptedAgent, ScriptedHost, ScriptedSimulator},
            SimulatorReply,
        },
        types::{AgentResponse, ToolCall},
    };

    fn case(value: Value) -> TestCase {
        serde_json::from_value(value).unwrap()
    }

    fn harness(agent: ScriptedAgent) -> Harness {
        Harness::new(Arc::new(agent), RunOptions::default())
    }

    async fn run(harness: &Harness, tc: &TestCase) -> CaseResult {
        CaseMachine::new(harness, tc, 1).unwrap().run().await
    }

    #[test]
    fn terminal_states_absorb() {
        let mut state = CaseState::Init;
        assert!(state.transition(CaseState::Running));
        assert!(state.transition(CaseState::Finished(CaseStatus::Failed)));
        assert!(!state.transition(CaseState::Running));
        assert!(!state.transition(CaseState::Finished(CaseStatus::Passed)));
        assert_eq!(state, CaseState::Finished(CaseStatus::Failed));
        assert!(state.is_terminal());
    }

    #[tokio::test]
    async fn single_turn_contains() {
        let tc = case(json!({"id": "T1", "input": "Hello", "assert": {"type": "contains", "value": "Hi"}}));

        let passed = run(&harness(ScriptedAgent::from_texts(["Hi there"])), &tc).await;
        assert_eq!(passed.status, CaseStatus::Passed);
        assert_eq!(passed.output, Some(json!("Hi there")));

        let failed = run(&harness(ScriptedAgent::from_texts(["hi there"])), &tc).await;
        assert_eq!(failed.status, CaseStatus::Failed);
        assert_eq!(failed.failed_assertions.len(), 1);
        assert_eq!(failed.failed_assertions[0].expected, Some(json!("Hi")));
    }

    #[tokio::test]
    async fn agent_error_is_error_status() {
        let agent = ScriptedAgent::new().push_error(AgentCallError::Agent("boom".into()));
        let result = run(&harness(agent), &case(json!({"id": "T1", "input": "x"}))).await;
        assert_eq!(result.status, CaseStatus::Error);
        assert_eq!(result.error.as_deref(), Some("agent error at turn 1: boom"));
    }

    #[tokio::test]
    async fn multi_turn_carries_conversation() {
        let agent = Arc::new(ScriptedAgent::from_texts(["What type?", "Logged your taxi expense."]));
        let harness = Harness::new(agent.clone(), RunOptions::default());
        let tc = case(json!({
            "id": "M1",
            "turns": [
                {"input": "log an expense", "assert": {"type": "contains", "value": "type"}},
                {"input": "taxi", "assert": {"type": "contains", "value": "Logged"}}
            ]
        }));
        let result = run(&harness, &tc).await;
        assert_eq!(result.status, CaseStatus::Passed);
        assert_eq!(result.turns.len(), 2);

        let calls = agent.calls();
        assert_eq!(calls[1].len(), 3);
        assert_eq!(calls[1][1].text().as_deref(), Some("What type?"));
    }

    #[tokio::test]
    async fn multi_turn_missing_input_policy() {
        let tc = |policy: &str| {
            case(json!({
                "id": "M2",
                "turns": [{"input": "start"}, {"input": "next"}],
                "on_missing_input": policy
            }))
        };
        let agent = || ScriptedAgent::from_texts(["ok", "Which account should I use?"]);

        let fail = run(&harness(agent()), &tc("fail")).await;
        assert_eq!(fail.status, CaseStatus::Failed);
        let skip = run(&harness(agent()), &tc("skip")).await;
        assert_eq!(skip.status, CaseStatus::Skipped);
        let end = run(&harness(agent()), &tc("end")).await;
        assert_eq!(end.status, CaseStatus::Passed);
    }

    #[tokio::test]
    async fn negative_statement_is_not_skipped_as_awaiting() {
        let tc = case(json!({
            "id": "M4",
            "turns": [{"input": "log my taxi"}, {"input": "yesterday"}],
            "assert": {"type": "contains", "value": "created"}
        }));
        let agent = ScriptedAgent::from_texts(["Sure.", "Can't find that expense, sorry."]);
        let result = run(&harness(agent), &tc).await;

        assert_eq!(result.status, CaseStatus::Failed);
        assert!(!result.turns[1].result.awaiting.awaiting);
        assert!(result.is_failure());
    }

    #[tokio::test]
    async fn first_failing_turn_halts() {
        let agent = Arc::new(ScriptedAgent::from_texts(["nope", "never"]));
        let harness = Harness::new(agent.clone(), RunOptions::default());
        let tc = case(json!({
            "id": "M3",
            "turns": [
                {"input": "a", "assert": {"type": "contains", "value": "yes"}},
                {"input": "b"}
            ]
        }));
        let result = run(&harness, &tc).await;
        assert_eq!(result.status, CaseStatus::Failed);
        assert!(result.error.unwrap().starts_with("turn 1:"));
        assert_eq!(agent.call_count(), 1);
    }

    fn expense_case() -> TestCase {
        case(json!({
            "id": "D1",
            "simulator": {"use": "tests.sim", "options": {"metadata": {"persona": "busy employee", "goal": "log a taxi ride", "style": "terse"}}},
            "max_turns": 10,
            "checkpoints": [
                {"id": "ask_type", "assert": {"type": "regex", "value": "(?i)type"}},
                {"id": "call_create", "after": ["ask_type"], "assert": {"type": "tool_called", "value": "create"}}
            ]
        }))
    }

    #[tokio::test]
    async fn dynamic_reaches_checkpoints() {
        let agent = ScriptedAgent::from_responses([
            AgentResponse::text("What type of expense?"),
            AgentResponse::text("Done").with_tool_call(ToolCall::new("expenses__create", json!({}))),
        ]);
        let simulator = Arc::new(ScriptedSimulator::new([
            SimulatorReply::say("I need to log an expense"),
            SimulatorReply::say("Taxi, 20 euros"),
        ]));
        let harness = harness(agent).with_simulator(simulator.clone());
        let result = run(&harness, &expense_case()).await;

        assert_eq!(result.status, CaseStatus::Passed);
        assert_eq!(result.turns.len(), 2);
        assert_eq!(result.turns[1].checkpoints_reached, vec!["call_create".to_string()]);
        let requests = simulator.requests();
        assert_eq!(requests[0].persona.as_deref(), Some("busy employee"));
        assert_eq!(requests[0].extra.get("style"), Some(&json!("terse")));
        assert_eq!(requests[1].reached_checkpoints, vec!["ask_type".to_string()]);
    }

    #[tokio::test]
    async fn goal_achieved_with_missing_checkpoints_fails() {
        let simulator = Arc::new(ScriptedSimulator::new([
            SimulatorReply::say("hello"),
            SimulatorReply::default().goal_achieved(),
        ]));
        let harness = harness(ScriptedAgent::from_texts(["What type?"])).with_simulator(simulator);
        let result = run(&harness, &expense_case()).await;
        assert_eq!(result.status, CaseStatus::Failed);
        assert!(result.error.unwrap().contains("missing call_create"));
        assert!(result.checkpoints[0].reached);
    }

    #[tokio::test]
    async fn max_turns_exceeded_fails() {
        let mut tc = expense_case();
        tc.max_turns = Some(2);
        let simulator = Arc::new(ScriptedSimulator::new([SimulatorReply::say("a"), SimulatorReply::say("b")]));
        let harness = harness(ScriptedAgent::from_texts(["nothing", "still nothing"])).with_simulator(simulator);
        let result = run(&harness, &tc).await;
        assert_eq!(result.status, CaseStatus::Failed);
        assert_eq!(
            result.error.as_deref(),
            Some("max turns (2) exceeded without reaching all checkpoints: missing ask_type, call_create")
        );
    }

    #[tokio::test]
    async fn dynamic_without_simulator_is_skipped() {
        let result = run(&harness(ScriptedAgent::new()), &expense_case()).await;
        assert_eq!(result.status, CaseStatus::Skipped);
    }

    #[tokio::test]
    async fn simulator_error_is_error_status() {
        let simulator = Arc::new(ScriptedSimulator::new([]).push_error(crate::error::CollaboratorError::InvalidResponse(
            "empty".into(),
        )));
        let harness = harness(ScriptedAgent::new()).with_simulator(simulator);
        let result = run(&harness, &expense_case()).await;
        assert_eq!(result.status, CaseStatus::Error);
        assert!(result.error.unwrap().starts_with("simulator error at turn 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_agent_times_out() {
        let agent = ScriptedAgent::from_texts(["first"]);
        let tc = case(json!({"id": "T1", "input": "x", "timeout": "1s"}));
        let slow = harness(agent.with_delay(Duration::from_secs(5)));
        let result = run(&slow, &tc).await;
        assert_eq!(result.status, CaseStatus::Timeout);
        assert!(result.error.unwrap().starts_with("timed out after 1s"));
    }

    fn timed_expense_case() -> TestCase {
        let mut tc = expense_case();
        tc.timeout = Some(Duration::from_secs(3));
        tc
    }

    #[tokio::test(start_paused = true)]
    async fn dynamic_agent_overrunning_deadline_times_out() {
        let agent = ScriptedAgent::from_texts(["Hello there", "Still here", "Anything else"])
            .with_delay(Duration::from_secs(2));
        let simulator = Arc::new(ScriptedSimulator::new([
            SimulatorReply::say("hi"),
            SimulatorReply::say("log a taxi"),
            SimulatorReply::say("20 euros"),
        ]));
        let harness = harness(agent).with_simulator(simulator);
        let result = run(&harness, &timed_expense_case()).await;

        assert_eq!(result.status, CaseStatus::Timeout);
        assert_eq!(result.error.as_deref(), Some("timed out after 3s at turn 2"));
        assert_eq!(result.turns.len(), 1);
        assert_eq!(result.turns[0].result.text, "Hello there");
        assert_eq!(result.checkpoints.len(), 2);
        assert!(result.checkpoints.iter().all(|cp| !cp.reached));
    }

    #[tokio::test(start_paused = true)]
    async fn dynamic_slow_simulator_times_out() {
        let simulator = Arc::new(
            ScriptedSimulator::new([SimulatorReply::say("hi"), SimulatorReply::say("log a taxi")])
                .with_delay(Duration::from_secs(2)),
        );
        let harness = harness(ScriptedAgent::from_texts(["Hello there", "Sure"])).with_simulator(simulator);
        let result = run(&harness, &timed_expense_case()).await;

        assert_eq!(result.status, CaseStatus::Timeout);
        assert_eq!(
            result.error.as_deref(),
            Some("timed out after 3s waiting for the simulator at turn 2")
        );
        assert_eq!(result.turns.len(), 1);
    }

    #[tokio::test]
    async fn invalid_regex_is_error_not_failure() {
        let tc = case(json!({"id": "T1", "input": "x", "assert": {"type": "regex", "value": "("}}));
        let result = run(&harness(ScriptedAgent::from_texts(["anything"])), &tc).await;
        assert_eq!(result.status, CaseStatus::Error);
        assert_eq!(result.turns.len(), 1);
    }

    #[tokio::test]
    async fn hooks_share_before_data() {
        let host = ScriptedHost::new()
            .with_function("tests.env.Before", |_| Ok(json!({"token": "abc"})))
            .with_function("tests.env.After", |args| {
                if args.get(2) == Some(&json!({"token": "abc"})) {
                    Ok(Value::Null)
                } else {
                    Err(ScriptError::Execution {
                        target: "tests.env.After".into(),
                        message: "before data missing".into(),
                    })
                }
            });
        let registry = Arc::new(ScriptRegistry::new(Arc::new(host)));
        let harness = harness(ScriptedAgent::from_texts(["ok"])).with_scripts(registry.clone());
        let tc = case(json!({
            "id": "H1",
            "input": "x",
            "before": "scripts:tests.env.Before",
            "after": "scripts:tests.env.After"
        }));
        let result = run(&harness, &tc).await;
        assert_eq!(result.status, CaseStatus::Passed);
        assert_eq!(result.before_data, Some(json!({"token": "abc"})));
        assert_eq!(registry.loaded_modules().await, 1);
    }

    #[tokio::test]
    async fn failing_hooks() {
        let host = ScriptedHost::new().with_function("tests.env.Explode", |_| {
            Err(ScriptError::Execution {
                target: "tests.env.Explode".into(),
                message: "boom".into(),
            })
        });
        let harness = harness(ScriptedAgent::from_texts(["ok", "ok"]))
            .with_scripts(Arc::new(ScriptRegistry::new(Arc::new(host))));

        let before = case(json!({"id": "H2", "input": "x", "before": "tests.env.Explode"}));
        let result = run(&harness, &before).await;
        assert_eq!(result.status, CaseStatus::Error);
        assert!(result.turns.is_empty());

        let after = case(json!({"id": "H3", "input": "x", "after": "tests.env.Explode"}));
        let result = run(&harness, &after).await;
        assert_eq!(result.status, CaseStatus::Error);
        assert!(result.error.unwrap().starts_with("after hook failed"));
    }
}
