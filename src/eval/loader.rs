use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{
    error::ConfigError,
    eval::case::{CaseMode, TestCase},
    providers::AgentDirectory,
    types::{content_text, ChatMessage, StreamOptions},
};

const CASE_EXTENSIONS: &[&str] = &["jsonl", "json", "yaml", "yml"];
const GENERATOR_PREFIX: &str = "agents:";

/// Where the cases of a run come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    File(PathBuf),
    /// A literal message run as a single case.
    Message(String),
    /// An agent asked to produce the cases.
    Generator(String),
}

impl InputSource {
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if let Some(id) = trimmed.strip_prefix(GENERATOR_PREFIX) {
            return Self::Generator(id.trim().to_string());
        }
        let path = Path::new(trimmed);
        let has_case_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| CASE_EXTENSIONS.contains(&ext));
        if path.exists() || (has_case_extension && !trimmed.contains(char::is_whitespace)) {
            Self::File(path.to_path_buf())
        } else {
            Self::Message(input.to_string())
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Message(_) => "message".to_string(),
            Self::Generator(id) => format!("{GENERATOR_PREFIX}{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseFormat {
    JsonLines,
    Json,
    Yaml,
}

impl CaseFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()).unwrap_or("") {
            "json" => Self::Json,
            "yaml" | "yml" => Self::Yaml,
            _ => Self::JsonLines,
        }
    }
}

fn parse_json_lines(content: &str) -> Result<Vec<TestCase>, ConfigError> {
    let mut cases = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") {
            continue;
        }
        let case: TestCase = serde_json::from_str(trimmed).map_err(|e| ConfigError::Parse {
            line: index + 1,
            message: e.to_string(),
        })?;
        cases.push(case);
    }
    Ok(cases)
}

/// Parses case text. JSONL reports the failing line; JSON and YAML report the parser's line.
pub fn parse_cases(content: &str, format: CaseFormat) -> Result<Vec<TestCase>, ConfigError> {
    match format {
        CaseFormat::JsonLines => parse_json_lines(content),
        CaseFormat::Json => serde_json::from_str(content).map_err(|e| ConfigError::Parse {
            line: e.line(),
            message: e.to_string(),
        }),
        CaseFormat::Yaml => serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            line: e.location().map(|l| l.line()).unwrap_or(0),
            message: e.to_string(),
        }),
    }
}

fn read_file(path: &Path) -> Result<Vec<TestCase>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_cases(&content, CaseFormat::from_path(path))
}

/// Loads cases from a file, or from every case file in a directory sorted by name.
pub fn load_cases(path: impl AsRef<Path>) -> Result<Vec<TestCase>, ConfigError> {
    let path = path.as_ref();
    let io_error = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    let cases = if path.is_dir() {
        let mut files = Vec::new();
        for entry in fs::read_dir(path).map_err(io_error)? {
            let file = entry.map_err(io_error)?.path();
            let ext = file.extension().and_then(|s| s.to_str()).unwrap_or("");
            if CASE_EXTENSIONS.contains(&ext) {
                files.push(file);
            }
        }
        files.sort();
        let mut cases = Vec::new();
        for file in files {
            cases.extend(read_file(&file)?);
        }
        cases
    } else {
        read_file(path)?
    };
    if cases.is_empty() {
        return Err(ConfigError::Empty(path.display().to_string()));
    }
    debug!(path = %path.display(), count = cases.len(), "loaded test cases");
    Ok(cases)
}

/// Checks id uniqueness and every case's own invariants; returns each case's mode.
pub fn validate_cases(cases: &[TestCase]) -> Result<Vec<CaseMode>, ConfigError> {
    let mut seen = HashSet::new();
    let mut modes = Vec::with_capacity(cases.len());
    for case in cases {
        if !seen.insert(case.id.as_str()) {
            return Err(ConfigError::DuplicateId(case.id.clone()));
        }
        modes.push(case.validate()?);
    }
    Ok(modes)
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Asks a generator agent for cases; the reply holds JSONL, or a JSON array, optionally fenced.
pub async fn generate_cases(
    directory: &dyn AgentDirectory,
    generator: &str,
    target_agent: Option<&str>,
) -> Result<Vec<TestCase>, ConfigError> {
    let agent = directory
        .agent(generator)
        .map_err(|e| ConfigError::Generator(e.to_string()))?;
    let request = json!({
        "task": "generate_test_cases",
        "format": "jsonl",
        "agent": target_agent,
    });
    let mut options = StreamOptions::default();
    options.skip.history = true;
    options.skip.trace = true;
    options
        .metadata
        .insert("test_mode".to_string(), Value::String("generator".to_string()));

    info!(generator, "generating test cases");
    let response = agent
        .stream(&[ChatMessage::user(request.to_string())], &options)
        .await
        .map_err(|e| ConfigError::Generator(e.to_string()))?;

    let cases = match &response.content {
        Value::Array(items) if items.iter().all(Value::is_object) && !items.is_empty() => {
            serde_json::from_value(response.content.clone()).map_err(|e| ConfigError::Generator(e.to_string()))?
        }
        content => {
            let text = content_text(content);
            let body = strip_fences(&text);
            if body.starts_with('[') {
                parse_cases(body, CaseFormat::Json)?
            } else {
                parse_cases(body, CaseFormat::JsonLines)?
            }
        }
    };
    if cases.is_empty() {
        return Err(ConfigError::Empty(format!("{GENERATOR_PREFIX}{generator}")));
    }
    Ok(cases)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::providers::{scripted::ScriptedAgent, StaticDirectory};

    const JSONL: &str = r#"
// greeting checks
{"id": "T001", "input": "Hello", "assert": {"type": "contains", "value": "Hi"}}

{"id": "T002", "messages": [{"role": "user", "content": "Hello"}]}
"#;

    #[test]
    fn jsonl_skips_blank_and_comment_lines() {
        let cases = parse_cases(JSONL, CaseFormat::JsonLines).unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[1].id, "T002");
        assert_eq!(validate_cases(&cases).unwrap(), vec![CaseMode::StaticSingle; 2]);
    }

    #[test]
    fn parse_errors_carry_line_numbers() {
        let content = "{\"id\": \"a\", \"input\": \"x\"}\n{\"id\": \"b\", \"input\": \"x\", \"assert\": {\"type\": \"nope\"}}\n";
        match parse_cases(content, CaseFormat::JsonLines) {
            Err(ConfigError::Parse { line, message }) => {
                assert_eq!(line, 2);
                assert!(message.contains("unknown assertion type"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let content = "{\"id\": \"a\", \"input\": \"x\"}\n{\"id\": \"a\", \"input\": \"y\"}";
        let cases = parse_cases(content, CaseFormat::JsonLines).unwrap();
        assert!(matches!(validate_cases(&cases), Err(ConfigError::DuplicateId(id)) if id == "a"));
    }

    #[test]
    fn loads_yaml_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("b.yaml"),
            "- id: Y1\n  input: hi\n  assert:\n    type: contains\n    value: hello\n",
        )
        .unwrap();
        fs::write(dir.path().join("a.jsonl"), "{\"id\": \"J1\", \"input\": \"x\"}\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let cases = load_cases(dir.path()).unwrap();
        let ids: Vec<_> = cases.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["J1", "Y1"]);

        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(load_cases(empty.path()), Err(ConfigError::Empty(_))));
    }

    #[test]
    fn input_source_detection() {
        assert_eq!(InputSource::parse("agents:tests.generator"), InputSource::Generator("tests.generator".into()));
        assert_eq!(InputSource::parse("cases.jsonl"), InputSource::File(PathBuf::from("cases.jsonl")));
        assert_eq!(
            InputSource::parse("What is the weather?"),
            InputSource::Message("What is the weather?".into())
        );
    }

    #[tokio::test]
    async fn generator_reply_is_parsed() {
        let reply = "```jsonl\n{\"id\": \"G1\", \"input\": \"hi\"}\n{\"id\": \"G2\", \"input\": \"bye\"}\n```";
        let directory = StaticDirectory::new().with_agent("tests.gen", Arc::new(ScriptedAgent::from_texts([reply])));
        let cases = generate_cases(&directory, "tests.gen", Some("tests.echo")).await.unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].id, "G1");

        assert!(matches!(
            generate_cases(&directory, "missing", None).await,
            Err(ConfigError::Generator(_))
        ));
    }
}
