use std::{path::PathBuf, sync::Arc};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::RunOptions,
    error::{ConfigError, RunError, ScriptError},
    eval::{
        case::{CaseMode, TestCase},
        loader::{generate_cases, load_cases, validate_cases, InputSource},
        machine::{CaseMachine, CaseResult, CaseStatus, Harness},
        report::{Report, ReportMetadata, Summary},
        stability::StabilityResult,
    },
    input::truncate,
    providers::{AgentClient, AgentDirectory, ScriptHost, Simulator, Validator},
    scripts::ScriptRegistry,
};

/// External parties a run talks to. Only the agent under test is mandatory.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn AgentClient>,
    pub simulator: Option<Arc<dyn Simulator>>,
    pub validator: Option<Arc<dyn Validator>>,
    pub scripts: Option<Arc<dyn ScriptHost>>,
    /// Resolves `agents:<id>` case generators.
    pub directory: Option<Arc<dyn AgentDirectory>>,
}

impl Collaborators {
    pub fn new(agent: Arc<dyn AgentClient>) -> Self {
        Self {
            agent,
            simulator: None,
            validator: None,
            scripts: None,
            directory: None,
        }
    }

    pub fn with_simulator(mut self, simulator: Arc<dyn Simulator>) -> Self {
        self.simulator = Some(simulator);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptHost>) -> Self {
        self.scripts = Some(scripts);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn AgentDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }
}

/// What a dry run reports for a case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CasePlan {
    pub id: String,
    pub mode: CaseMode,
    pub turns: usize,
    pub checkpoints: Vec<String>,
    pub assertions: usize,
    pub runs: usize,
    pub skip: bool,
    pub input: String,
}

enum Outcome {
    Single(CaseResult),
    Repeated(StabilityResult),
}

impl Outcome {
    fn status(&self) -> CaseStatus {
        match self {
            Self::Single(result) => result.status,
            Self::Repeated(result) => result.status,
        }
    }

    /// A repeated case that is not fully stable counts as failing.
    fn trips_fail_fast(&self) -> bool {
        match self {
            Self::Single(result) => result.is_failure(),
            Self::Repeated(result) => result.status != CaseStatus::Skipped && !result.stable,
        }
    }
}

pub struct Runner {
    options: RunOptions,
    collaborators: Collaborators,
    base_dir: Option<PathBuf>,
}

impl Runner {
    pub fn new(options: RunOptions, collaborators: Collaborators) -> Self {
        Self {
            options,
            collaborators,
            base_dir: None,
        }
    }

    /// Directory that relative attachment paths resolve against.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub async fn load(&self, source: &InputSource) -> Result<Vec<TestCase>, ConfigError> {
        match source {
            InputSource::File(path) => load_cases(path),
            InputSource::Message(message) => Ok(vec![TestCase::from_message(message.clone())]),
            InputSource::Generator(generator) => {
                let directory = self
                    .collaborators
                    .directory
                    .as_deref()
                    .ok_or_else(|| ConfigError::Generator("no agent directory configured".to_string()))?;
                generate_cases(directory, generator, self.options.agent.as_deref()).await
            }
        }
    }

    /// Validates and filters cases and lists them without invoking anything.
    pub fn plan(&self, cases: &[TestCase]) -> Result<Vec<CasePlan>, ConfigError> {
        let modes = validate_cases(cases)?;
        let filter = self.options.filter()?;
        Ok(cases
            .iter()
            .zip(modes)
            .filter(|(case, _)| filter.as_ref().map_or(true, |re| re.is_match(&case.id)))
            .map(|(case, mode)| CasePlan {
                id: case.id.clone(),
                mode,
                turns: match mode {
                    CaseMode::StaticSingle => 1,
                    CaseMode::StaticMulti => case.turns.as_ref().map_or(0, Vec::len),
                    CaseMode::Dynamic => case.max_turns(),
                },
                checkpoints: case.checkpoints.iter().map(|cp| cp.id.clone()).collect(),
                assertions: case.assertions().len(),
                runs: case.runs(&self.options),
                skip: case.skip,
                input: case
                    .input
                    .as_ref()
                    .map(|input| input.summary(60))
                    .or_else(|| case.messages.as_ref().map(|m| format!("[{} messages]", m.len())))
                    .unwrap_or_default(),
            })
            .collect())
    }

    /// Resolves `input` (file, message or generator), then runs the cases.
    pub async fn run_input(&self, input: &str) -> Result<Report, RunError> {
        let source = InputSource::parse(input);
        let cases = self.load(&source).await?;
        let mut report = match (&source, &self.base_dir) {
            (InputSource::File(path), None) => {
                let base = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| p.to_path_buf());
                self.execute(cases, base).await?
            }
            _ => self.execute(cases, self.base_dir.clone()).await?,
        };
        report.metadata.input = Some(source.label());
        Ok(report)
    }

    pub async fn run(&self, cases: Vec<TestCase>) -> Result<Report, RunError> {
        self.execute(cases, self.base_dir.clone()).await
    }

    async fn execute(&self, cases: Vec<TestCase>, base_dir: Option<PathBuf>) -> Result<Report, RunError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let modes = validate_cases(&cases)?;
        let filter = self.options.filter()?;
        let selected: Vec<(TestCase, CaseMode)> = cases
            .into_iter()
            .zip(modes)
            .filter(|(case, _)| filter.as_ref().map_or(true, |re| re.is_match(&case.id)))
            .collect();
        let stability = self.options.runs > 1 || selected.iter().any(|(case, _)| case.runs.is_some_and(|n| n > 1));

        let registry = self
            .collaborators
            .scripts
            .clone()
            .map(|host| Arc::new(ScriptRegistry::new(host)));
        let harness = Arc::new(self.harness(registry.clone(), base_dir));

        let before_all = match (&self.options.before_all, &registry) {
            (Some(reference), Some(scripts)) => {
                let all: Vec<Value> = selected
                    .iter()
                    .filter_map(|(case, _)| serde_json::to_value(case).ok())
                    .collect();
                Some(
                    scripts
                        .run_hook(reference, vec![Value::Array(all)])
                        .await
                        .map_err(RunError::BeforeAll)?,
                )
            }
            (Some(_), None) => return Err(RunError::BeforeAll(ScriptError::NotConfigured)),
            (None, _) => None,
        };

        info!(
            cases = selected.len(),
            parallel = self.options.parallel,
            runs = self.options.runs,
            fail_fast = self.options.fail_fast,
            "starting test run"
        );
        let outcomes = self.schedule(&selected, harness, stability).await;

        let mut results = Vec::new();
        let mut stability_results = Vec::new();
        for outcome in outcomes {
            match outcome {
                Outcome::Single(result) => results.push(result),
                Outcome::Repeated(result) => stability_results.push(result),
            }
        }

        if let (Some(reference), Some(scripts)) = (&self.options.after_all, &registry) {
            let payload = if stability {
                serde_json::to_value(&stability_results)
            } else {
                serde_json::to_value(&results)
            }
            .unwrap_or(Value::Null);
            let args = vec![payload, before_all.unwrap_or(Value::Null)];
            if let Err(err) = scripts.run_hook(reference, args).await {
                warn!(error = %err, "after_all hook failed");
            }
        }

        let mut summary = if stability {
            Summary::from_stability(&stability_results)
        } else {
            Summary::from_results(&results)
        };
        summary.duration_ms = started.elapsed().as_millis() as u64;
        summary.agent_id = self.options.agent.clone();
        summary.connector = self.options.connector.clone();

        info!(
            total = summary.total,
            passed = summary.passed,
            failed = summary.failed,
            skipped = summary.skipped,
            errors = summary.errors,
            timeouts = summary.timeouts,
            duration_ms = summary.duration_ms,
            "test run finished"
        );

        let mut metadata = ReportMetadata::new(started_at);
        metadata.output = self.options.output.clone();
        metadata.agent = self.options.agent.clone();
        metadata.input = self.options.input.clone();
        Ok(Report {
            summary,
            results,
            stability_results,
            metadata,
        })
    }

    fn harness(&self, registry: Option<Arc<ScriptRegistry>>, base_dir: Option<PathBuf>) -> Harness {
        let mut harness = Harness::new(self.collaborators.agent.clone(), self.options.clone());
        if let Some(simulator) = &self.collaborators.simulator {
            harness = harness.with_simulator(simulator.clone());
        }
        if let Some(validator) = &self.collaborators.validator {
            harness = harness.with_validator(validator.clone());
        }
        if let Some(registry) = registry {
            harness = harness.with_scripts(registry);
        }
        if let Some(base_dir) = base_dir {
            harness = harness.with_base_dir(base_dir);
        }
        harness
    }

    /// Runs the cases on a bounded pool and returns outcomes in case order.
    async fn schedule(&self, selected: &[(TestCase, CaseMode)], harness: Arc<Harness>, stability: bool) -> Vec<Outcome> {
        let semaphore = Arc::new(Semaphore::new(self.options.parallel.max(1)));
        let cancel = CancellationToken::new();
        let fail_fast = self.options.fail_fast;
        let mut slots: Vec<Option<Outcome>> = selected.iter().map(|_| None).collect();
        let mut workers = JoinSet::new();

        for (index, (case, mode)) in selected.iter().enumerate() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    slots[index] = Some(not_started(case, *mode, stability, "worker pool closed"));
                    continue;
                }
            };
            if cancel.is_cancelled() {
                debug!(case = %case.id, "fail-fast: not starting case");
                slots[index] = Some(not_started(case, *mode, stability, "not started: fail-fast"));
                continue;
            }
            if case.skip {
                slots[index] = Some(not_started(case, *mode, stability, "skipped by case definition"));
                continue;
            }

            let case = case.clone();
            let mode = *mode;
            let runs = case.runs(&self.options);
            let harness = harness.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let _permit = permit;
                let outcome = if stability {
                    let mut results = Vec::with_capacity(runs);
                    for run in 1..=runs {
                        results.push(run_once(&harness, &case, mode, run).await);
                    }
                    Outcome::Repeated(StabilityResult::from_runs(case.id.clone(), &results))
                } else {
                    Outcome::Single(run_once(&harness, &case, mode, 1).await)
                };
                if fail_fast && outcome.trips_fail_fast() {
                    warn!(case = %case.id, status = outcome.status().as_str(), "fail-fast triggered");
                    cancel.cancel();
                }
                (index, outcome)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(err) => warn!(error = %err, "case worker failed"),
            }
        }

        slots
            .into_iter()
            .zip(selected)
            .map(|(slot, (case, mode))| {
                slot.unwrap_or_else(|| {
                    let mut result = CaseResult::skipped(case, *mode, 1, "case worker failed");
                    result.status = CaseStatus::Error;
                    if stability {
                        Outcome::Repeated(StabilityResult::from_runs(case.id.clone(), &[result]))
                    } else {
                        Outcome::Single(result)
                    }
                })
            })
            .collect()
    }
}

fn not_started(case: &TestCase, mode: CaseMode, stability: bool, reason: &str) -> Outcome {
    let result = CaseResult::skipped(case, mode, 1, reason);
    if stability {
        let mut repeated = StabilityResult::from_runs(case.id.clone(), &[]);
        repeated.input = result.input;
        repeated.expected = result.expected;
        Outcome::Repeated(repeated)
    } else {
        Outcome::Single(result)
    }
}

async fn run_once(harness: &Harness, case: &TestCase, mode: CaseMode, run: usize) -> CaseResult {
    let result = match CaseMachine::new(harness, case, run) {
        Ok(machine) => machine.run().await,
        Err(err) => {
            let mut result = CaseResult::skipped(case, mode, run, err.to_string());
            result.status = CaseStatus::Error;
            result
        }
    };
    info!(
        case = %result.id,
        run,
        status = result.status.as_str(),
        duration_ms = result.duration_ms,
        error = %truncate(result.error.as_deref().unwrap_or(""), 120),
        "case finished"
    );
    result
}
