use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigError, EvalError},
    eval::{
        assertion::{deserialize_rules, Assertion, AssertionOutcome, EvalContext, Evaluator},
        executor::TurnResult,
    },
};

fn default_required() -> bool {
    true
}

/// A milestone a dynamic conversation must reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_rules")]
    pub assert: Vec<Assertion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

/// Rejects duplicate ids, dangling `after` references and prerequisite cycles.
pub fn validate_checkpoints(case: &str, checkpoints: &[Checkpoint]) -> Result<(), ConfigError> {
    let mut index = HashMap::new();
    for (position, checkpoint) in checkpoints.iter().enumerate() {
        if checkpoint.id.trim().is_empty() {
            return Err(ConfigError::InvalidCase {
                case: case.to_string(),
                message: "checkpoint id must not be empty".to_string(),
            });
        }
        if index.insert(checkpoint.id.as_str(), position).is_some() {
            return Err(ConfigError::DuplicateCheckpoint {
                case: case.to_string(),
                checkpoint: checkpoint.id.clone(),
            });
        }
        if checkpoint.assert.is_empty() {
            return Err(ConfigError::InvalidCase {
                case: case.to_string(),
                message: format!("checkpoint {} has no assertions", checkpoint.id),
            });
        }
    }
    for checkpoint in checkpoints {
        if let Some(missing) = checkpoint.after.iter().find(|dep| !index.contains_key(dep.as_str())) {
            return Err(ConfigError::UnknownCheckpoint {
                case: case.to_string(),
                checkpoint: checkpoint.id.clone(),
                missing: missing.clone(),
            });
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Active,
        Done,
    }

    fn visit(
        node: usize,
        checkpoints: &[Checkpoint],
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[node] = Mark::Active;
        stack.push(node);
        for dep in &checkpoints[node].after {
            let Some(&next) = index.get(dep.as_str()) else {
                continue;
            };
            match marks[next] {
                Mark::Active => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|&n| checkpoints[n].id.clone()).collect();
                    cycle.push(checkpoints[next].id.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, checkpoints, index, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; checkpoints.len()];
    for node in 0..checkpoints.len() {
        if marks[node] == Mark::Unvisited {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(node, checkpoints, &index, &mut marks, &mut stack) {
                return Err(ConfigError::CheckpointCycle {
                    case: case.to_string(),
                    cycle,
                });
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub id: String,
    pub required: bool,
    pub reached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reached_at_turn: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<AssertionOutcome>,
}

/// Per-run progress over a case's checkpoints. Reached is permanent.
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    checkpoints: Vec<Checkpoint>,
    states: Vec<CheckpointState>,
}

impl CheckpointTracker {
    pub fn new(checkpoints: &[Checkpoint]) -> Self {
        let states = checkpoints
            .iter()
            .map(|cp| CheckpointState {
                id: cp.id.clone(),
                required: cp.required,
                reached: false,
                reached_at_turn: None,
                outcomes: Vec::new(),
            })
            .collect();
        Self {
            checkpoints: checkpoints.to_vec(),
            states,
        }
    }

    fn is_reached(&self, id: &str) -> bool {
        self.states.iter().any(|state| state.id == id && state.reached)
    }

    /// Visits pending checkpoints in case order and returns the ids reached by this turn.
    /// A prerequisite reached earlier in the same pass counts.
    pub async fn observe(
        &mut self,
        turn: &TurnResult,
        evaluator: &Evaluator,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<String>, EvalError> {
        let mut reached = Vec::new();
        for position in 0..self.checkpoints.len() {
            if self.states[position].reached {
                continue;
            }
            let checkpoint = &self.checkpoints[position];
            if !checkpoint.after.iter().all(|dep| self.is_reached(dep)) {
                continue;
            }
            let outcomes = evaluator.evaluate_all(&checkpoint.assert, turn, ctx).await?;
            let passed = outcomes.iter().all(|outcome| outcome.passed);
            let state = &mut self.states[position];
            state.outcomes = outcomes;
            if passed {
                state.reached = true;
                state.reached_at_turn = Some(turn.turn);
                reached.push(state.id.clone());
            }
        }
        Ok(reached)
    }

    pub fn all_required_reached(&self) -> bool {
        self.states.iter().all(|state| state.reached || !state.required)
    }

    /// Required checkpoints still pending, in case order.
    pub fn missing_required(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|state| state.required && !state.reached)
            .map(|state| state.id.clone())
            .collect()
    }

    pub fn reached_ids(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|state| state.reached)
            .map(|state| state.id.clone())
            .collect()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|state| !state.reached)
            .map(|state| state.id.clone())
            .collect()
    }

    pub fn states(&self) -> &[CheckpointState] {
        &self.states
    }

    pub fn into_states(self) -> Vec<CheckpointState> {
        self.states
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        eval::awaiting::AwaitingDetector,
        types::{AgentResponse, ToolCall},
    };

    fn checkpoints(value: serde_json::Value) -> Vec<Checkpoint> {
        serde_json::from_value(value).unwrap()
    }

    fn turn(number: usize, response: AgentResponse) -> TurnResult {
        TurnResult::from_response(number, json!(""), response, &AwaitingDetector::default(), 0)
    }

    fn expense_flow() -> Vec<Checkpoint> {
        checkpoints(json!([
            {"id": "ask_type", "assert": {"type": "regex", "value": "(?i)type"}},
            {"id": "call_create", "after": ["ask_type"], "assert": {"type": "tool_called", "value": "create"}},
            {"id": "confirm", "after": ["call_create"], "assert": {"type": "contains", "value": "created"}}
        ]))
    }

    #[tokio::test]
    async fn prerequisite_holds_checkpoint_until_reached() {
        let mut tracker = CheckpointTracker::new(&expense_flow());
        let evaluator = Evaluator::new();
        let ctx = EvalContext::new(None, &[]);

        // create is called before the type question was ever asked
        let early = turn(
            1,
            AgentResponse::text("Working on it").with_tool_call(ToolCall::new("expenses__create", json!({}))),
        );
        assert!(tracker.observe(&early, &evaluator, &ctx).await.unwrap().is_empty());

        let ask = turn(2, AgentResponse::text("What type of expense?"));
        assert_eq!(tracker.observe(&ask, &evaluator, &ctx).await.unwrap(), vec!["ask_type".to_string()]);

        let create = turn(
            3,
            AgentResponse::text("Expense created").with_tool_call(ToolCall::new("expenses__create", json!({}))),
        );
        let reached = tracker.observe(&create, &evaluator, &ctx).await.unwrap();
        assert_eq!(reached, vec!["call_create".to_string(), "confirm".to_string()]);
        assert!(tracker.all_required_reached());
        assert_eq!(tracker.states()[1].reached_at_turn, Some(3));
    }

    #[tokio::test]
    async fn reached_never_reverts() {
        let mut tracker = CheckpointTracker::new(&expense_flow()[..1]);
        let evaluator = Evaluator::new();
        let ctx = EvalContext::new(None, &[]);
        tracker.observe(&turn(1, AgentResponse::text("Which type?")), &evaluator, &ctx).await.unwrap();
        tracker.observe(&turn(2, AgentResponse::text("nothing")), &evaluator, &ctx).await.unwrap();
        assert_eq!(tracker.reached_ids(), vec!["ask_type".to_string()]);
        assert_eq!(tracker.states()[0].reached_at_turn, Some(1));
    }

    #[test]
    fn missing_required_in_case_order() {
        let mut list = expense_flow();
        list[1].required = false;
        let tracker = CheckpointTracker::new(&list);
        assert_eq!(tracker.missing_required(), vec!["ask_type".to_string(), "confirm".to_string()]);
        assert_eq!(tracker.pending_ids().len(), 3);
    }

    #[test]
    fn rejects_bad_graphs() {
        let duplicate = checkpoints(json!([
            {"id": "a", "assert": "contains"},
            {"id": "a", "assert": "contains"}
        ]));
        assert!(matches!(
            validate_checkpoints("T1", &duplicate),
            Err(ConfigError::DuplicateCheckpoint { .. })
        ));

        let dangling = checkpoints(json!([{"id": "a", "after": ["ghost"], "assert": "contains"}]));
        assert!(matches!(
            validate_checkpoints("T1", &dangling),
            Err(ConfigError::UnknownCheckpoint { ref missing, .. }) if missing == "ghost"
        ));

        let cyclic = checkpoints(json!([
            {"id": "a", "after": ["c"], "assert": "contains"},
            {"id": "b", "after": ["a"], "assert": "contains"},
            {"id": "c", "after": ["b"], "assert": "contains"}
        ]));
        match validate_checkpoints("T1", &cyclic) {
            Err(ConfigError::CheckpointCycle { cycle, .. }) => {
                assert_eq!(cycle, vec!["a", "c", "b", "a"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }

        assert!(validate_checkpoints("T1", &expense_flow()).is_ok());
    }
}
