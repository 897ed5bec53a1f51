use std::{sync::Arc, time::Duration};

use denkprobe::{
    providers::scripted::{ScriptedAgent, ScriptedHost, ScriptedSimulator, ScriptedValidator},
    AgentResponse, CaseStatus, Collaborators, ConfigError, RunError, RunOptions, Runner, SimulatorReply, TestCase,
    ToolCall, ValidationVerdict,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn cases(value: Value) -> Vec<TestCase> {
    serde_json::from_value(value).unwrap()
}

fn runner(agent: Arc<ScriptedAgent>, options: RunOptions) -> Runner {
    Runner::new(options, Collaborators::new(agent))
}

#[tokio::test]
async fn input_and_messages_send_identical_turns() {
    let agent = Arc::new(ScriptedAgent::from_texts(["Hi", "Hi"]));
    let report = runner(agent.clone(), RunOptions::default())
        .run(cases(json!([
            {"id": "text", "input": "Hello"},
            {"id": "messages", "messages": [{"role": "user", "content": "Hello"}]}
        ])))
        .await
        .unwrap();

    assert_eq!(report.summary.passed, 2);
    let calls = agent.calls();
    assert_eq!(calls[0], calls[1]);
}

#[tokio::test]
async fn static_multi_awaiting_input_with_fail_policy() {
    let agent = Arc::new(ScriptedAgent::from_texts([
        "Sure, I can book that.",
        "What time would you like to leave?",
    ]));
    let report = runner(agent, RunOptions::default())
        .run(cases(json!([{
            "id": "booking",
            "turns": [{"input": "Book a taxi"}, {"input": "To the airport"}],
            "on_missing_input": "fail"
        }])))
        .await
        .unwrap();

    assert_eq!(report.results[0].status, CaseStatus::Failed);
    assert_eq!(report.results[0].turns.len(), 2);
}

#[tokio::test]
async fn dynamic_checkpoints_respect_prerequisites() {
    let agent = Arc::new(ScriptedAgent::from_responses([
        AgentResponse::text("Let me create that").with_tool_call(ToolCall::new("expenses__create", json!({}))),
        AgentResponse::text("What type of expense is it?"),
        AgentResponse::text("Expense created").with_tool_call(ToolCall::new("expenses__create", json!({"type": "taxi"}))),
    ]));
    let simulator = Arc::new(ScriptedSimulator::new([
        SimulatorReply::say("I want to log an expense"),
        SimulatorReply::say("Please just do it"),
        SimulatorReply::say("It was a taxi"),
    ]));
    let collaborators = Collaborators::new(agent).with_simulator(simulator);
    let report = Runner::new(RunOptions::default(), collaborators)
        .run(cases(json!([{
            "id": "expense",
            "simulator": {"use": "agents:tests.user"},
            "max_turns": 10,
            "checkpoints": [
                {"id": "ask_type", "assert": {"type": "regex", "value": "(?i)what type"}},
                {"id": "call_create", "after": ["ask_type"], "assert": {"type": "tool_called", "value": "create"}},
                {"id": "confirm", "after": ["call_create"], "assert": {"type": "contains", "value": "created"}}
            ]
        }])))
        .await
        .unwrap();

    let result = &report.results[0];
    assert_eq!(result.status, CaseStatus::Passed);
    assert!(result.turns[0].checkpoints_reached.is_empty());
    assert_eq!(result.turns[1].checkpoints_reached, vec!["ask_type".to_string()]);
    assert_eq!(
        result.turns[2].checkpoints_reached,
        vec!["call_create".to_string(), "confirm".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn case_timeout_only_affects_that_case() {
    let agent = Arc::new(ScriptedAgent::from_texts(["slow", "fast"]).with_delay(Duration::from_millis(1500)));
    let report = runner(agent, RunOptions::default().with_parallel(2))
        .run(cases(json!([
            {"id": "tight", "input": "a", "timeout": "1s"},
            {"id": "relaxed", "input": "b", "timeout": "5s"}
        ])))
        .await
        .unwrap();

    assert_eq!(report.results[0].status, CaseStatus::Timeout);
    assert_eq!(report.results[1].status, CaseStatus::Passed);
    assert_eq!(report.summary.timeouts, 1);
}

#[tokio::test]
async fn invalid_regex_is_an_error_not_a_failure() {
    let agent = Arc::new(ScriptedAgent::from_texts(["anything"]));
    let report = runner(agent, RunOptions::default())
        .run(cases(json!([{"id": "bad", "input": "x", "assert": {"type": "regex", "value": "[unclosed"}}])))
        .await
        .unwrap();
    assert_eq!(report.results[0].status, CaseStatus::Error);
    assert_eq!((report.summary.errors, report.summary.failed), (1, 0));
}

#[tokio::test]
async fn checkpoint_cycles_abort_the_run() {
    let agent = Arc::new(ScriptedAgent::new());
    let err = runner(agent.clone(), RunOptions::default())
        .run(cases(json!([{
            "id": "loop",
            "simulator": {"use": "tests.user"},
            "checkpoints": [
                {"id": "a", "after": ["b"], "assert": "contains"},
                {"id": "b", "after": ["a"], "assert": "contains"}
            ]
        }])))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Config(ConfigError::CheckpointCycle { .. })));
    assert_eq!(agent.call_count(), 0);
}

#[tokio::test]
async fn validator_and_script_assertions() {
    let agent = Arc::new(ScriptedAgent::from_texts(["The capital of France is Paris."]));
    let validator = Arc::new(ScriptedValidator::new(|request| {
        let output = request.output.as_str().unwrap_or_default();
        Ok(ValidationVerdict {
            passed: output.contains("Paris"),
            score: Some(0.9),
            reason: Some("mentions the capital".to_string()),
            suggestions: Vec::new(),
        })
    }));
    let host = Arc::new(ScriptedHost::new().with_function("tests.checks.Short", |args| {
        let output = args[0].as_str().unwrap_or_default();
        Ok(json!({"pass": output.len() < 80, "message": "short enough"}))
    }));
    let collaborators = Collaborators::new(agent).with_validator(validator).with_scripts(host);
    let report = Runner::new(RunOptions::default(), collaborators)
        .run(cases(json!([{
            "id": "capital",
            "input": "What is the capital of France?",
            "assert": [
                {"type": "agent", "use": "agents:tests.judge", "value": "names the capital"},
                {"type": "script", "script": "scripts:tests.checks.Short"}
            ]
        }])))
        .await
        .unwrap();

    let result = &report.results[0];
    assert_eq!(result.status, CaseStatus::Passed);
    let outcomes = &result.turns[0].outcomes;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].details.as_ref().and_then(|d| d.get("score")), Some(&json!(0.9)));
}

#[tokio::test]
async fn loads_cases_from_a_jsonl_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cases.jsonl");
    std::fs::write(
        &path,
        "// smoke tests\n{\"id\": \"T001\", \"input\": \"ping\", \"expected\": \"pong\"}\n\n{\"id\": \"T002\", \"input\": \"ping\", \"assert\": {\"type\": \"not_contains\", \"value\": \"error\"}}\n",
    )
    .unwrap();

    let agent = Arc::new(ScriptedAgent::from_texts(["pong", "pong"]));
    let report = runner(agent, RunOptions::default())
        .run_input(path.to_str().unwrap())
        .await
        .unwrap();
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.passed, 2);
    assert_eq!(report.metadata.input.as_deref(), path.to_str());
}

#[tokio::test]
async fn stability_fail_fast_stops_after_unstable_case() {
    let agent = Arc::new(ScriptedAgent::from_texts(["yes", "no", "yes", "yes"]));
    let report = runner(agent.clone(), RunOptions::default().with_runs(2).with_fail_fast(true))
        .run(cases(json!([
            {"id": "flaky", "input": "q", "assert": {"type": "contains", "value": "yes"}},
            {"id": "later", "input": "q", "assert": {"type": "contains", "value": "yes"}}
        ])))
        .await
        .unwrap();

    assert_eq!(report.stability_results[0].pass_rate, 50.0);
    assert_eq!(report.stability_results[1].status, CaseStatus::Skipped);
    assert_eq!(agent.call_count(), 2);
}
