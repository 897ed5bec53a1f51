use std::{env, fs, path::Path, time::Duration};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, eval::case::MissingInputPolicy};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_DYNAMIC_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_TURNS: usize = 20;

/// Tool names whose invocation means the agent is waiting on the user.
pub const DEFAULT_INPUT_TOOLS: &[&str] = &["ask_user", "request_user_input", "human_input", "clarify"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Case file, literal message, or `agents:<id>` generator reference.
    pub input: Option<String>,
    pub output: Option<String>,
    /// Id of the agent under test.
    pub agent: Option<String>,
    pub connector: Option<String>,
    /// Default simulator id for dynamic cases that do not name one.
    pub simulator: Option<String>,
    #[serde(with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    pub parallel: usize,
    pub runs: usize,
    pub fail_fast: bool,
    /// Regex over case ids; only matching cases run.
    pub run: Option<String>,
    pub dry_run: bool,
    pub verbose: bool,
    pub before_all: Option<String>,
    pub after_all: Option<String>,
    pub on_missing_input: MissingInputPolicy,
    pub input_tools: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            input: None,
            output: None,
            agent: None,
            connector: None,
            simulator: None,
            timeout: None,
            parallel: 1,
            runs: 1,
            fail_fast: false,
            run: None,
            dry_run: false,
            verbose: false,
            before_all: None,
            after_all: None,
            on_missing_input: MissingInputPolicy::default(),
            input_tools: DEFAULT_INPUT_TOOLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        let options: RunOptions = if ext == "json" {
            serde_json::from_str(&raw).map_err(|e| ConfigError::Options(e.to_string()))?
        } else {
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::Options(e.to_string()))?
        };
        options.validated()
    }

    /// Applies `DENKPROBE_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(timeout) = env::var("DENKPROBE_TIMEOUT") {
            self.timeout = Some(parse_duration(&timeout)?);
        }
        if let Ok(parallel) = env::var("DENKPROBE_PARALLEL") {
            self.parallel = parallel
                .parse()
                .map_err(|_| ConfigError::Options(format!("DENKPROBE_PARALLEL: not a number: {parallel}")))?;
        }
        if let Ok(agent) = env::var("DENKPROBE_AGENT") {
            self.agent = Some(agent);
        }
        if let Ok(simulator) = env::var("DENKPROBE_SIMULATOR") {
            self.simulator = Some(simulator);
        }
        Ok(())
    }

    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.parallel = self.parallel.max(1);
        self.runs = self.runs.max(1);
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(ConfigError::InvalidDuration {
                    value: "0s".to_string(),
                    message: "timeout must be positive".to_string(),
                });
            }
        }
        self.filter()?;
        Ok(self)
    }

    pub fn filter(&self) -> Result<Option<Regex>, ConfigError> {
        self.run
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(ConfigError::from)
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn with_runs(mut self, runs: usize) -> Self {
        self.runs = runs.max(1);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_simulator(mut self, simulator: impl Into<String>) -> Self {
        self.simulator = Some(simulator.into());
        self
    }

    pub fn with_connector(mut self, connector: impl Into<String>) -> Self {
        self.connector = Some(connector.into());
        self
    }

    pub fn with_filter(mut self, pattern: impl Into<String>) -> Self {
        self.run = Some(pattern.into());
        self
    }
}

pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::InvalidDuration {
        value: value.to_string(),
        message: e.to_string(),
    })
}

pub(crate) mod duration_opt {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_str(&humantime::format_duration(*duration).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|value| humantime::parse_duration(value.trim()).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2m30s").unwrap(), Duration::from_secs(150));
        assert!(matches!(
            parse_duration("soon"),
            Err(ConfigError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn loads_yaml_options_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "parallel: 4\ntimeout: 45s\nfail_fast: true\nrun: \"^T0\"").unwrap();

        let options = RunOptions::from_file(file.path()).unwrap();
        assert_eq!(options.parallel, 4);
        assert_eq!(options.timeout, Some(Duration::from_secs(45)));
        assert!(options.fail_fast);
        assert_eq!(options.runs, 1);
        assert_eq!(options.input_tools.len(), DEFAULT_INPUT_TOOLS.len());
        assert!(options.filter().unwrap().unwrap().is_match("T001"));
    }

    #[test]
    fn rejects_invalid_filter() {
        let options = RunOptions::new().with_filter("(");
        assert!(matches!(options.validated(), Err(ConfigError::InvalidFilter(_))));
    }

    #[test]
    fn zero_parallelism_becomes_sequential() {
        let options = RunOptions {
            parallel: 0,
            runs: 0,
            ..RunOptions::default()
        }
        .validated()
        .unwrap();
        assert_eq!(options.parallel, 1);
        assert_eq!(options.runs, 1);
    }
}
