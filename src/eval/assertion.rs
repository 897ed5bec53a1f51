use std::sync::Arc;

use jsonschema::{Draft, JSONSchema};
use regex::Regex;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::{
    error::{CollaboratorError, EvalError, ScriptError},
    eval::executor::TurnResult,
    json::{deep_equal, extract_json, extract_path, to_text, type_label},
    providers::{ValidationRequest, Validator},
    scripts::{ScriptRef, ScriptRegistry},
    types::{ChatMessage, ToolCall},
};

const TYPE_LABELS: &[&str] = &["string", "number", "boolean", "array", "object", "null"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssertionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolExpectation {
    Name(String),
    AnyOf(Vec<String>),
    WithArguments { name: String, arguments: Option<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssertionKind {
    Equals { value: Value },
    Contains { value: Value },
    NotContains { value: Value },
    Regex { pattern: String },
    JsonPath { path: String, value: Value },
    Type { expected: String, path: Option<String> },
    ToolCalled { expected: ToolExpectation, raw: Value },
    ToolResult { tool: String, result: Option<Value>, raw: Value },
    Schema { schema: Value },
    Agent { validator: String, criteria: Value, options: AssertionOptions },
    Script { target: ScriptRef, reference: String, value: Value },
}

impl AssertionKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Equals { .. } => "equals",
            Self::Contains { .. } => "contains",
            Self::NotContains { .. } => "not_contains",
            Self::Regex { .. } => "regex",
            Self::JsonPath { .. } => "json_path",
            Self::Type { .. } => "type",
            Self::ToolCalled { .. } => "tool_called",
            Self::ToolResult { .. } => "tool_result",
            Self::Schema { .. } => "schema",
            Self::Agent { .. } => "agent",
            Self::Script { .. } => "script",
        }
    }

    fn expected(&self) -> Option<Value> {
        match self {
            Self::Equals { value }
            | Self::Contains { value }
            | Self::NotContains { value }
            | Self::JsonPath { value, .. } => Some(value.clone()),
            Self::Regex { pattern } => Some(Value::String(pattern.clone())),
            Self::Type { expected, .. } => Some(Value::String(expected.clone())),
            Self::ToolCalled { raw, .. } | Self::ToolResult { raw, .. } => Some(raw.clone()),
            Self::Schema { schema } => Some(schema.clone()),
            Self::Agent { criteria, .. } => Some(criteria.clone()),
            Self::Script { value, .. } => (!value.is_null()).then(|| value.clone()),
        }
    }
}

/// One validated pass/fail rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAssertion", into = "RawAssertion")]
pub struct Assertion {
    pub kind: AssertionKind,
    /// Replaces the generated message when the assertion fails.
    pub message: Option<String>,
    pub negate: bool,
}

impl Assertion {
    pub fn new(kind: AssertionKind) -> Self {
        Self {
            kind,
            message: None,
            negate: false,
        }
    }

    pub fn equals(value: Value) -> Self {
        Self::new(AssertionKind::Equals { value })
    }

    pub fn contains(value: impl Into<String>) -> Self {
        Self::new(AssertionKind::Contains {
            value: Value::String(value.into()),
        })
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::new(AssertionKind::Regex {
            pattern: pattern.into(),
        })
    }

    pub fn tool_called(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(AssertionKind::ToolCalled {
            raw: Value::String(name.clone()),
            expected: ToolExpectation::Name(name),
        })
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Wire form: `{type, value, path, script, use, options, message, negate}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawAssertion {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    script: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    use_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<AssertionOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    negate: bool,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_tool_expectation(value: &Value) -> Result<ToolExpectation, String> {
    match value {
        Value::String(name) if !name.is_empty() => Ok(ToolExpectation::Name(name.clone())),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| "tool_called list entries must be strings".to_string())
            })
            .collect::<Result<Vec<_>, _>>()
            .map(ToolExpectation::AnyOf),
        Value::Object(fields) => {
            let name = fields
                .get("name")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| "tool_called object requires a 'name'".to_string())?;
            Ok(ToolExpectation::WithArguments {
                name: name.to_string(),
                arguments: fields.get("arguments").filter(|a| !a.is_null()).cloned(),
            })
        }
        other => Err(format!("invalid tool_called value: {other}")),
    }
}

impl TryFrom<RawAssertion> for Assertion {
    type Error = String;

    fn try_from(raw: RawAssertion) -> Result<Self, Self::Error> {
        let value = raw.value.unwrap_or(Value::Null);
        let kind = match raw.kind.as_str() {
            "" | "equals" => AssertionKind::Equals { value },
            "contains" => AssertionKind::Contains { value },
            "not_contains" => AssertionKind::NotContains { value },
            "regex" => match value {
                Value::String(pattern) => AssertionKind::Regex { pattern },
                _ => return Err("regex pattern must be a string".to_string()),
            },
            "json_path" => {
                let path = non_empty(raw.path).ok_or("json_path assertion requires 'path'")?;
                AssertionKind::JsonPath { path, value }
            }
            "type" => {
                let expected = value
                    .as_str()
                    .ok_or("type assertion value must be a string")?
                    .to_string();
                if !TYPE_LABELS.contains(&expected.as_str()) {
                    return Err(format!(
                        "unknown type '{expected}', expected one of {}",
                        TYPE_LABELS.join(", ")
                    ));
                }
                AssertionKind::Type {
                    expected,
                    path: non_empty(raw.path),
                }
            }
            "tool_called" => AssertionKind::ToolCalled {
                expected: parse_tool_expectation(&value)?,
                raw: value,
            },
            "tool_result" => {
                let tool = value
                    .get("tool")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .ok_or("tool_result assertion requires a map with 'tool' and 'result' fields")?
                    .to_string();
                let result = value.get("result").filter(|r| !r.is_null()).cloned();
                AssertionKind::ToolResult {
                    tool,
                    result,
                    raw: value,
                }
            }
            "schema" => {
                if !value.is_object() {
                    return Err("schema assertion value must be a JSON schema object".to_string());
                }
                AssertionKind::Schema { schema: value }
            }
            "agent" => {
                let validator = non_empty(raw.use_).ok_or("agent assertion requires a 'use' field")?;
                let validator = validator
                    .strip_prefix("agents:")
                    .unwrap_or(&validator)
                    .to_string();
                if validator.is_empty() {
                    return Err("agent assertion requires a validator id".to_string());
                }
                AssertionKind::Agent {
                    validator,
                    criteria: value,
                    options: raw.options.unwrap_or_default(),
                }
            }
            "script" => {
                let reference = non_empty(raw.script)
                    .or_else(|| non_empty(raw.use_))
                    .ok_or("script assertion requires a script name")?;
                let target = ScriptRef::parse(&reference).map_err(|e| e.to_string())?;
                AssertionKind::Script {
                    target,
                    reference,
                    value,
                }
            }
            other => return Err(format!("unknown assertion type: {other}")),
        };
        Ok(Self {
            kind,
            message: non_empty(raw.message),
            negate: raw.negate,
        })
    }
}

impl From<Assertion> for RawAssertion {
    fn from(assertion: Assertion) -> Self {
        let mut raw = RawAssertion {
            kind: assertion.kind.label().to_string(),
            message: assertion.message,
            negate: assertion.negate,
            ..RawAssertion::default()
        };
        match assertion.kind {
            AssertionKind::Equals { value }
            | AssertionKind::Contains { value }
            | AssertionKind::NotContains { value } => raw.value = Some(value),
            AssertionKind::Regex { pattern } => raw.value = Some(Value::String(pattern)),
            AssertionKind::JsonPath { path, value } => {
                raw.path = Some(path);
                raw.value = Some(value);
            }
            AssertionKind::Type { expected, path } => {
                raw.value = Some(Value::String(expected));
                raw.path = path;
            }
            AssertionKind::ToolCalled { raw: value, .. } | AssertionKind::ToolResult { raw: value, .. } => {
                raw.value = Some(value)
            }
            AssertionKind::Schema { schema } => raw.value = Some(schema),
            AssertionKind::Agent {
                validator,
                criteria,
                options,
            } => {
                raw.use_ = Some(format!("agents:{validator}"));
                raw.value = Some(criteria);
                raw.options = Some(options);
            }
            AssertionKind::Script { reference, value, .. } => {
                raw.script = Some(reference);
                raw.value = (!value.is_null()).then_some(value);
            }
        }
        raw
    }
}

/// `assert` accepts a single rule, a list of rules, or a bare type name.
pub fn deserialize_rules<'de, D>(deserializer: D) -> Result<Vec<Assertion>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::String(kind) => {
            return Assertion::try_from(RawAssertion {
                kind,
                ..RawAssertion::default()
            })
            .map(|assertion| vec![assertion])
            .map_err(D::Error::custom)
        }
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        other => return Err(D::Error::custom(format!("invalid assert value: {other}"))),
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value::<Assertion>(item).map_err(D::Error::custom))
        .collect()
}

/// Verdict for one rule against one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionOutcome {
    #[serde(rename = "type")]
    pub kind: String,
    pub passed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    /// Extra collaborator data, e.g. validator score and suggestions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

struct Verdict {
    passed: bool,
    message: String,
    actual: Option<Value>,
    details: Option<Value>,
}

impl Verdict {
    fn new(passed: bool, message: impl Into<String>) -> Self {
        Self {
            passed,
            message: message.into(),
            actual: None,
            details: None,
        }
    }

    fn with_actual(mut self, actual: Value) -> Self {
        self.actual = Some(actual);
        self
    }
}

/// What an assertion may look at besides the turn itself.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub input: Option<&'a Value>,
    pub conversation: &'a [ChatMessage],
    pub deadline: Option<Instant>,
}

impl<'a> EvalContext<'a> {
    pub fn new(input: Option<&'a Value>, conversation: &'a [ChatMessage]) -> Self {
        Self {
            input,
            conversation,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Stateless judge of assertions; collaborators are only consulted for `agent` and `script` rules.
#[derive(Clone, Default)]
pub struct Evaluator {
    validator: Option<Arc<dyn Validator>>,
    scripts: Option<Arc<ScriptRegistry>>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_scripts(mut self, scripts: Arc<ScriptRegistry>) -> Self {
        self.scripts = Some(scripts);
        self
    }

    pub async fn evaluate(
        &self,
        assertion: &Assertion,
        turn: &TurnResult,
        ctx: &EvalContext<'_>,
    ) -> Result<AssertionOutcome, EvalError> {
        let verdict = match &assertion.kind {
            AssertionKind::Agent {
                validator,
                criteria,
                options,
            } => self.ask_validator(validator, criteria, options, turn, ctx).await?,
            AssertionKind::Script { target, value, .. } => {
                self.run_script(target, value, turn, ctx).await?
            }
            kind => evaluate_local(kind, turn)?,
        };

        let Verdict {
            mut passed,
            mut message,
            actual,
            details,
        } = verdict;
        if assertion.negate {
            passed = !passed;
            message = if passed {
                "negated assertion passed".to_string()
            } else {
                format!("negated: {message}")
            };
        }
        if !passed {
            if let Some(custom) = &assertion.message {
                message = custom.clone();
            }
        }

        Ok(AssertionOutcome {
            kind: assertion.kind.label().to_string(),
            passed,
            message,
            expected: assertion.kind.expected(),
            actual,
            details,
        })
    }

    /// Evaluates rules in order; stops at the first evaluator error.
    pub async fn evaluate_all(
        &self,
        assertions: &[Assertion],
        turn: &TurnResult,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<AssertionOutcome>, EvalError> {
        let mut outcomes = Vec::with_capacity(assertions.len());
        for assertion in assertions {
            outcomes.push(self.evaluate(assertion, turn, ctx).await?);
        }
        Ok(outcomes)
    }

    async fn ask_validator(
        &self,
        validator_id: &str,
        criteria: &Value,
        options: &AssertionOptions,
        turn: &TurnResult,
        ctx: &EvalContext<'_>,
    ) -> Result<Verdict, EvalError> {
        let validator = self
            .validator
            .as_ref()
            .ok_or(CollaboratorError::NotConfigured("validator"))?;
        let request = ValidationRequest {
            validator: validator_id.to_string(),
            criteria: criteria.clone(),
            metadata: options.metadata.clone(),
            output: turn.content.clone(),
            input: ctx.input.cloned(),
            conversation: ctx.conversation.to_vec(),
            connector: options.connector.clone(),
        };
        let verdict = match ctx.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, validator.validate(&request))
                .await
                .map_err(|_| EvalError::Timeout)??,
            None => validator.validate(&request).await?,
        };
        let message = verdict.reason.clone().unwrap_or_else(|| {
            if verdict.passed {
                "validator accepted the output".to_string()
            } else {
                "validator rejected the output".to_string()
            }
        });
        Ok(Verdict {
            passed: verdict.passed,
            message,
            actual: Some(turn.content.clone()),
            details: Some(json!({
                "score": verdict.score,
                "suggestions": verdict.suggestions,
            })),
        })
    }

    async fn run_script(
        &self,
        target: &ScriptRef,
        value: &Value,
        turn: &TurnResult,
        ctx: &EvalContext<'_>,
    ) -> Result<Verdict, EvalError> {
        let scripts = self.scripts.as_ref().ok_or(ScriptError::NotConfigured)?;
        let args = vec![
            turn.content.clone(),
            ctx.input.cloned().unwrap_or(Value::Null),
            value.clone(),
        ];
        let call = scripts.call(target, args);
        let result = match ctx.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, call)
                .await
                .map_err(|_| EvalError::Timeout)??,
            None => call.await?,
        };
        let verdict = match &result {
            Value::Bool(passed) => Verdict::new(
                *passed,
                if *passed {
                    "script assertion passed"
                } else {
                    "script assertion failed"
                },
            ),
            Value::Object(fields) => {
                let passed = fields.get("pass").and_then(Value::as_bool).unwrap_or(false);
                let message = fields
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("script assertion {}", if passed { "passed" } else { "failed" }));
                Verdict::new(passed, message)
            }
            other => {
                return Err(ScriptError::InvalidOutput {
                    target: target.to_string(),
                    message: format!("expected a boolean or {{pass, message}}, got {}", type_label(other)),
                }
                .into())
            }
        };
        Ok(verdict.with_actual(turn.content.clone()))
    }
}

fn structured_output(content: &Value) -> Result<Value, String> {
    match content {
        Value::Object(_) | Value::Array(_) => Ok(content.clone()),
        Value::String(text) => {
            extract_json(text).ok_or_else(|| format!("output is not valid JSON: {}", crate::input::truncate(text, 200)))
        }
        other => Err(format!("output is not a JSON object or array, got {}", type_label(other))),
    }
}

fn output_equals(actual: &Value, expected: &Value) -> bool {
    if deep_equal(actual, expected) {
        return true;
    }
    match (actual, expected) {
        (Value::String(_), Value::String(_)) => false,
        (Value::String(text), _) => serde_json::from_str::<Value>(text.trim())
            .ok()
            .or_else(|| extract_json(text))
            .is_some_and(|parsed| deep_equal(&parsed, expected)),
        _ => false,
    }
}

/// Name matches exactly, by namespaced suffix, or as a substring.
pub fn match_tool_name(call: &ToolCall, expected: &str) -> bool {
    !expected.is_empty() && (call.is_named(expected) || call.name.contains(expected))
}

fn match_result(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Object(fields) => {
            let Value::Object(actual) = actual else {
                return false;
            };
            fields
                .iter()
                .all(|(key, value)| actual.get(key).is_some_and(|a| match_result(a, value)))
        }
        Value::String(pattern) => match pattern.strip_prefix("regex:") {
            Some(pattern) => Regex::new(pattern).is_ok_and(|re| re.is_match(&to_text(actual))),
            None => to_text(actual) == *pattern,
        },
        other => deep_equal(actual, other),
    }
}

fn evaluate_local(kind: &AssertionKind, turn: &TurnResult) -> Result<Verdict, EvalError> {
    let output = &turn.content;
    let verdict = match kind {
        AssertionKind::Equals { value } => {
            let verdict = if output_equals(output, value) {
                Verdict::new(true, "values are equal")
            } else {
                Verdict::new(false, format!("expected {value}, got {output}"))
            };
            verdict.with_actual(output.clone())
        }
        AssertionKind::Contains { value } => {
            let needle = to_text(value);
            let found = turn.text.contains(&needle);
            Verdict::new(
                found,
                if found {
                    format!("output contains '{needle}'")
                } else {
                    format!("output does not contain '{needle}'")
                },
            )
            .with_actual(Value::String(turn.text.clone()))
        }
        AssertionKind::NotContains { value } => {
            let needle = to_text(value);
            let found = turn.text.contains(&needle);
            Verdict::new(
                !found,
                if found {
                    format!("output should not contain '{needle}'")
                } else {
                    format!("output does not contain '{needle}'")
                },
            )
            .with_actual(Value::String(turn.text.clone()))
        }
        AssertionKind::Regex { pattern } => {
            let re = Regex::new(pattern).map_err(|e| EvalError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            let matched = re.is_match(&turn.text);
            Verdict::new(
                matched,
                if matched {
                    format!("output matches pattern '{pattern}'")
                } else {
                    format!("output does not match pattern '{pattern}'")
                },
            )
            .with_actual(Value::String(turn.text.clone()))
        }
        AssertionKind::JsonPath { path, value } => match structured_output(output) {
            Err(message) => Verdict::new(false, message),
            Ok(data) => {
                let actual = extract_path(&data, path).cloned().unwrap_or(Value::Null);
                let verdict = if deep_equal(&actual, value) {
                    Verdict::new(true, format!("path '{path}' equals expected value"))
                } else if let (Value::Array(options), false) = (value, actual.is_array()) {
                    let hit = options.iter().any(|option| deep_equal(&actual, option));
                    Verdict::new(
                        hit,
                        if hit {
                            format!("path '{path}' equals one of expected values")
                        } else {
                            format!("path '{path}': expected {value}, got {actual}")
                        },
                    )
                } else {
                    Verdict::new(false, format!("path '{path}': expected {value}, got {actual}"))
                };
                verdict.with_actual(actual)
            }
        },
        AssertionKind::Type { expected, path } => {
            let subject = match path {
                None => output.clone(),
                Some(path) => match structured_output(output) {
                    Ok(data) => extract_path(&data, path).cloned().unwrap_or(Value::Null),
                    Err(message) => return Ok(Verdict::new(false, message)),
                },
            };
            let actual = type_label(&subject);
            Verdict::new(
                actual == expected,
                if actual == expected {
                    format!("output is of type '{expected}'")
                } else {
                    format!("expected type '{expected}', got '{actual}'")
                },
            )
            .with_actual(Value::String(actual.to_string()))
        }
        AssertionKind::ToolCalled { expected, .. } => tool_called(expected, &turn.tool_calls),
        AssertionKind::ToolResult { tool, result, .. } => tool_result(tool, result.as_ref(), &turn.tool_calls),
        AssertionKind::Schema { schema } => match structured_output(output) {
            Err(message) => Verdict::new(false, message),
            Ok(instance) => {
                let compiled = JSONSchema::options()
                    .with_draft(Draft::Draft7)
                    .compile(schema)
                    .map_err(|e| EvalError::InvalidSchema(e.to_string()))?;
                let violations: Vec<String> = match compiled.validate(&instance) {
                    Ok(()) => Vec::new(),
                    Err(errors) => errors.take(5).map(|e| format!("schema violation: {e}")).collect(),
                };
                let verdict = if violations.is_empty() {
                    Verdict::new(true, "output matches schema")
                } else {
                    Verdict::new(false, violations.join("; "))
                };
                verdict.with_actual(instance)
            }
        },
        AssertionKind::Agent { .. } | AssertionKind::Script { .. } => Verdict::new(
            false,
            format!("{} assertions need an evaluator with collaborators", kind.label()),
        ),
    };
    Ok(verdict)
}

fn called_names(calls: &[ToolCall]) -> Value {
    Value::Array(calls.iter().map(|c| Value::String(c.name.clone())).collect())
}

fn tool_called(expected: &ToolExpectation, calls: &[ToolCall]) -> Verdict {
    if calls.is_empty() {
        return Verdict::new(false, "no tools were called").with_actual(json!([]));
    }
    let names = called_names(calls);
    let verdict = match expected {
        ToolExpectation::Name(name) => {
            if calls.iter().any(|call| match_tool_name(call, name)) {
                Verdict::new(true, format!("tool '{name}' was called"))
            } else {
                Verdict::new(false, format!("tool '{name}' was not called, called: {names}"))
            }
        }
        ToolExpectation::AnyOf(options) => {
            match options
                .iter()
                .find(|name| calls.iter().any(|call| match_tool_name(call, name)))
            {
                Some(name) => Verdict::new(true, format!("tool '{name}' was called")),
                None => Verdict::new(
                    false,
                    format!("none of the expected tools were called, called: {names}"),
                ),
            }
        }
        ToolExpectation::WithArguments { name, arguments } => {
            let matched = calls.iter().filter(|call| match_tool_name(call, name)).any(|call| {
                match arguments {
                    None => true,
                    Some(Value::Object(expected)) => call.arguments_object().is_some_and(|actual| {
                        expected
                            .iter()
                            .all(|(key, value)| actual.get(key).is_some_and(|a| deep_equal(a, value)))
                    }),
                    Some(_) => false,
                }
            });
            match (matched, arguments.is_some()) {
                (true, true) => Verdict::new(true, format!("tool '{name}' was called with matching arguments")),
                (true, false) => Verdict::new(true, format!("tool '{name}' was called")),
                (false, true) => Verdict::new(false, format!("tool '{name}' was not called with expected arguments")),
                (false, false) => Verdict::new(false, format!("tool '{name}' was not called, called: {names}")),
            }
        }
    };
    verdict.with_actual(names)
}

fn tool_result(tool: &str, expected: Option<&Value>, calls: &[ToolCall]) -> Verdict {
    if calls.is_empty() {
        return Verdict::new(false, "no tools were called");
    }
    let Some(call) = calls.iter().find(|call| match_tool_name(call, tool)) else {
        return Verdict::new(false, format!("tool '{tool}' was not called")).with_actual(called_names(calls));
    };
    let actual = call.result.clone().unwrap_or(Value::Null);
    let verdict = if let Some(error) = &call.error {
        Verdict::new(false, format!("tool '{tool}' returned error: {error}"))
    } else {
        match expected {
            None => Verdict::new(true, format!("tool '{tool}' executed successfully")),
            Some(expected) if match_result(&actual, expected) => {
                Verdict::new(true, format!("tool '{tool}' result matches expected"))
            }
            Some(_) => Verdict::new(false, format!("tool '{tool}' result does not match expected")),
        }
    };
    verdict.with_actual(actual)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        eval::awaiting::AwaitingDetector,
        providers::{scripted::{ScriptedHost, ScriptedValidator}, ValidationVerdict},
        types::AgentResponse,
    };

    fn turn(response: AgentResponse) -> TurnResult {
        TurnResult::from_response(1, json!("input"), response, &AwaitingDetector::default(), 0)
    }

    fn rule(value: Value) -> Assertion {
        serde_json::from_value(value).unwrap()
    }

    async fn check(assertion: &Assertion, turn: &TurnResult) -> AssertionOutcome {
        Evaluator::new()
            .evaluate(assertion, turn, &EvalContext::new(None, &[]))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn contains_is_case_sensitive_and_untrimmed() {
        let t = turn(AgentResponse::text("Hello world "));
        assert!(check(&Assertion::contains("world"), &t).await.passed);
        assert!(!check(&Assertion::contains("World"), &t).await.passed);
        assert!(check(&Assertion::contains("world "), &t).await.passed);
        let outcome = check(&Assertion::contains("goodbye"), &t).await;
        assert!(!outcome.passed);
        assert_eq!(outcome.message, "output does not contain 'goodbye'");
    }

    #[tokio::test]
    async fn equals_parses_string_output_for_structured_expectations() {
        let t = turn(AgentResponse::text(r#"{"need_search": false}"#));
        assert!(check(&Assertion::equals(json!({"need_search": false})), &t).await.passed);
        assert!(!check(&Assertion::equals(json!("need_search")), &t).await.passed);
    }

    #[tokio::test]
    async fn json_path_with_in_semantics() {
        let t = turn(AgentResponse::text("```json\n{\"wheres\": [{\"like\": \"%abc%\"}], \"kind\": \"b\"}\n```"));
        let like = rule(json!({"type": "json_path", "path": "$.wheres[0].like", "value": "%abc%"}));
        assert!(check(&like, &t).await.passed);
        let any = rule(json!({"type": "json_path", "path": "kind", "value": ["a", "b"]}));
        assert!(check(&any, &t).await.passed);
        let missing = rule(json!({"type": "json_path", "path": "absent", "value": 1}));
        let outcome = check(&missing, &t).await;
        assert!(!outcome.passed);
        assert_eq!(outcome.actual, Some(Value::Null));
    }

    #[tokio::test]
    async fn invalid_regex_is_an_evaluator_error() {
        let t = turn(AgentResponse::text("abc"));
        let err = Evaluator::new()
            .evaluate(&Assertion::regex("(unclosed"), &t, &EvalContext::new(None, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::InvalidPattern { .. }));
    }

    #[tokio::test]
    async fn negate_and_custom_message() {
        let t = turn(AgentResponse::text("plain"));
        let outcome = check(&Assertion::contains("plain").negated(), &t).await;
        assert!(!outcome.passed);
        assert_eq!(outcome.message, "negated: output contains 'plain'");

        let outcome = check(&Assertion::contains("x").with_message("must mention x"), &t).await;
        assert_eq!(outcome.message, "must mention x");
        let outcome = check(&Assertion::contains("plain").with_message("unused"), &t).await;
        assert_eq!(outcome.message, "output contains 'plain'");
    }

    #[tokio::test]
    async fn type_category_at_path() {
        let t = turn(AgentResponse::structured(json!({"items": [1, 2], "count": 2})));
        assert!(check(&rule(json!({"type": "type", "value": "object"})), &t).await.passed);
        assert!(check(&rule(json!({"type": "type", "value": "array", "path": "items"})), &t).await.passed);
        let outcome = check(&rule(json!({"type": "type", "value": "string", "path": "count"})), &t).await;
        assert_eq!(outcome.message, "expected type 'string', got 'number'");
    }

    #[tokio::test]
    async fn tool_called_shapes() {
        let t = turn(
            AgentResponse::text("done")
                .with_tool_call(ToolCall::new("expenses__create", json!(r#"{"kind": "expense", "amount": 5}"#))),
        );
        assert!(check(&Assertion::tool_called("create"), &t).await.passed);
        assert!(check(&rule(json!({"type": "tool_called", "value": ["delete", "create"]})), &t).await.passed);
        let args = rule(json!({"type": "tool_called", "value": {"name": "create", "arguments": {"kind": "expense"}}}));
        assert!(check(&args, &t).await.passed);
        let wrong = rule(json!({"type": "tool_called", "value": {"name": "create", "arguments": {"kind": "income"}}}));
        assert_eq!(
            check(&wrong, &t).await.message,
            "tool 'create' was not called with expected arguments"
        );
        assert!(!check(&Assertion::tool_called("create"), &turn(AgentResponse::text("x"))).await.passed);
    }

    #[tokio::test]
    async fn tool_result_matching() {
        let t = turn(
            AgentResponse::text("ok")
                .with_tool_call(ToolCall::new("search", json!({})).with_result(json!({"id": "exp-42", "total": 3})))
                .with_tool_call(ToolCall::new("notify", json!({})).with_error("smtp down")),
        );
        let by_regex = rule(json!({"type": "tool_result", "value": {"tool": "search", "result": {"id": "regex:^exp-\\d+$"}}}));
        assert!(check(&by_regex, &t).await.passed);
        let failed = check(&rule(json!({"type": "tool_result", "value": {"tool": "notify"}})), &t).await;
        assert_eq!(failed.message, "tool 'notify' returned error: smtp down");
    }

    #[tokio::test]
    async fn schema_validation() {
        let schema = json!({"type": "object", "required": ["name"], "properties": {"name": {"type": "string"}}});
        let assertion = rule(json!({"type": "schema", "value": schema}));
        assert!(check(&assertion, &turn(AgentResponse::text(r#"{"name": "x"}"#))).await.passed);
        assert!(!check(&assertion, &turn(AgentResponse::text(r#"{"name": 1}"#))).await.passed);
    }

    #[tokio::test]
    async fn agent_rule_uses_validator_verdict() {
        let validator = ScriptedValidator::new(|request| {
            Ok(ValidationVerdict {
                passed: request.output == json!("Hi there"),
                score: Some(0.8),
                reason: Some("greets the user".to_string()),
                suggestions: vec![],
            })
        });
        let evaluator = Evaluator::new().with_validator(Arc::new(validator));
        let assertion = rule(json!({"type": "agent", "use": "agents:tests.validator", "value": "greets"}));
        let outcome = evaluator
            .evaluate(&assertion, &turn(AgentResponse::text("Hi there")), &EvalContext::new(None, &[]))
            .await
            .unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.message, "greets the user");
        assert_eq!(outcome.details.unwrap()["score"], json!(0.8));

        let err = Evaluator::new()
            .evaluate(&assertion, &turn(AgentResponse::text("x")), &EvalContext::new(None, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Validator(CollaboratorError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn script_rule_accepts_bool_and_object() {
        let host = ScriptedHost::new()
            .with_function("checks.Short", |args| Ok(json!(crate::json::to_text(&args[0]).len() < 10)))
            .with_function("checks.Explain", |_| Ok(json!({"pass": false, "message": "too vague"})));
        let evaluator = Evaluator::new().with_scripts(Arc::new(ScriptRegistry::new(Arc::new(host))));
        let t = turn(AgentResponse::text("brief"));
        let ctx = EvalContext::new(None, &[]);

        let short = rule(json!({"type": "script", "script": "scripts:checks.Short"}));
        assert!(evaluator.evaluate(&short, &t, &ctx).await.unwrap().passed);
        let explain = rule(json!({"type": "script", "use": "checks.Explain"}));
        assert_eq!(evaluator.evaluate(&explain, &t, &ctx).await.unwrap().message, "too vague");
    }

    #[tokio::test]
    async fn evaluation_is_idempotent() {
        let t = turn(AgentResponse::text("The total is 42"));
        let rules = vec![Assertion::contains("42"), Assertion::regex(r"\d+"), Assertion::contains("nope")];
        let evaluator = Evaluator::new();
        let ctx = EvalContext::new(None, &[]);
        let first = evaluator.evaluate_all(&rules, &t, &ctx).await.unwrap();
        let second = evaluator.evaluate_all(&rules, &t, &ctx).await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn wire_form_validation() {
        let err = serde_json::from_value::<Assertion>(json!({"type": "fuzzy"})).unwrap_err();
        assert!(err.to_string().contains("unknown assertion type: fuzzy"));
        assert!(serde_json::from_value::<Assertion>(json!({"type": "agent"})).is_err());
        assert!(serde_json::from_value::<Assertion>(json!({"type": "json_path", "value": 1})).is_err());
        assert!(serde_json::from_value::<Assertion>(json!({"type": "script", "script": "nomodule"})).is_err());

        let agent = rule(json!({"type": "agent", "use": "tests.validator"}));
        assert!(matches!(agent.kind, AssertionKind::Agent { ref validator, .. } if validator == "tests.validator"));
        let missing_type = rule(json!({"value": "x"}));
        assert_eq!(missing_type.kind, AssertionKind::Equals { value: json!("x") });
    }
}
