use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use denkprobe::{
    config::parse_duration,
    providers::{
        adapters::{AgentSimulator, AgentValidator},
        http::{HttpAgentConfig, HttpDirectory},
        AgentDirectory,
    },
    scripts::ProcessScriptHost,
    Collaborators, InputSource, Report, RunError, RunOptions, Runner,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "denkprobe")]
#[command(about = "Run declarative test cases against a conversational agent")]
struct Args {
    /// Case file or directory, a literal message, or `agents:<id>` to generate cases
    #[arg(short, long)]
    input: Option<String>,

    /// Id of the agent under test
    #[arg(short, long)]
    agent: Option<String>,

    /// Base URL of the agent service
    #[arg(long)]
    endpoint: Option<String>,

    /// Default simulator agent for dynamic cases
    #[arg(long)]
    simulator: Option<String>,

    /// Connector override passed to the agent under test
    #[arg(long)]
    connector: Option<String>,

    /// Number of cases executed concurrently
    #[arg(long)]
    parallel: Option<usize>,

    /// Stop starting new cases after the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Default per-case timeout, e.g. `30s` or `2m30s`
    #[arg(long)]
    timeout: Option<String>,

    /// Runs per case; more than one produces stability results
    #[arg(long)]
    runs: Option<usize>,

    /// Only run cases whose id matches this regex
    #[arg(long)]
    run: Option<String>,

    /// Parse and list cases without executing them
    #[arg(long)]
    dry_run: bool,

    /// Write the JSON report here
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run options file (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding hook and assertion scripts
    #[arg(long)]
    scripts: Option<PathBuf>,

    /// Interpreter used for scripts
    #[arg(long, default_value = "node")]
    script_runner: String,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to write report to {path}: {source}")]
struct ReportWriteError {
    path: String,
    #[source]
    source: std::io::Error,
}

fn write_report(report: &Report, path: &str) -> Result<(), ReportWriteError> {
    report.write(path).map_err(|source| ReportWriteError {
        path: path.to_string(),
        source,
    })
}

/// Log message for an error that ended the run.
fn failure_label(err: &(dyn std::error::Error + 'static)) -> &'static str {
    if err.is::<ReportWriteError>() {
        "report not written"
    } else if matches!(err.downcast_ref::<RunError>(), Some(RunError::BeforeAll(_))) {
        "run aborted"
    } else {
        "configuration error"
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "debug,denkprobe=debug"
    } else {
        "info,denkprobe=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn options(args: &Args) -> Result<RunOptions, Box<dyn std::error::Error>> {
    let mut options = match &args.config {
        Some(path) => RunOptions::from_file(path)?,
        None => RunOptions::default(),
    };
    options.apply_env()?;

    if let Some(input) = &args.input {
        options.input = Some(input.clone());
    }
    if let Some(agent) = &args.agent {
        options.agent = Some(agent.clone());
    }
    if let Some(simulator) = &args.simulator {
        options.simulator = Some(simulator.clone());
    }
    if let Some(connector) = &args.connector {
        options.connector = Some(connector.clone());
    }
    if let Some(parallel) = args.parallel {
        options.parallel = parallel;
    }
    if let Some(runs) = args.runs {
        options.runs = runs;
    }
    if let Some(timeout) = &args.timeout {
        options.timeout = Some(parse_duration(timeout)?);
    }
    if let Some(run) = &args.run {
        options.run = Some(run.clone());
    }
    if let Some(output) = &args.output {
        options.output = Some(output.display().to_string());
    }
    options.fail_fast |= args.fail_fast;
    options.dry_run |= args.dry_run;
    options.verbose |= args.verbose;
    Ok(options.validated()?)
}

fn print_summary(report: &Report) {
    let summary = &report.summary;
    println!(
        "{} cases: {} passed, {} failed, {} skipped, {} errors, {} timeouts ({} ms)",
        summary.total,
        summary.passed,
        summary.failed,
        summary.skipped,
        summary.errors,
        summary.timeouts,
        summary.duration_ms
    );
    for result in report.results.iter().filter(|r| r.is_failure()) {
        println!(
            "  {} [{}] {}",
            result.id,
            result.status.as_str(),
            result.error.as_deref().unwrap_or("")
        );
    }
    for result in report.stability_results.iter().filter(|r| !r.stable) {
        println!(
            "  {} pass rate {:.0}% ({:?})",
            result.id, result.pass_rate, result.stability_class
        );
    }
}

async fn run(args: Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let options = options(&args)?;
    let input = options
        .input
        .clone()
        .ok_or("no input given: pass --input or set `input` in the config file")?;

    let mut http = HttpAgentConfig::from_env();
    if let Some(endpoint) = &args.endpoint {
        http.endpoint = endpoint.clone();
    }
    let directory: Arc<dyn AgentDirectory> = Arc::new(HttpDirectory::new(http)?);

    if options.dry_run {
        let collaborators = Collaborators::new(directory.agent("dry-run")?).with_directory(directory.clone());
        let probe = Runner::new(options.clone(), collaborators);
        let cases = probe.load(&InputSource::parse(&input)).await?;
        for plan in probe.plan(&cases)? {
            println!("{}", serde_json::to_string(&plan)?);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let agent_id = options
        .agent
        .clone()
        .ok_or("no agent selected: pass --agent or set DENKPROBE_AGENT")?;
    let mut collaborators = Collaborators::new(directory.agent(&agent_id)?)
        .with_simulator(Arc::new(AgentSimulator::new(directory.clone())))
        .with_validator(Arc::new(AgentValidator::new(directory.clone())))
        .with_directory(directory.clone());
    if let Some(root) = &args.scripts {
        let host = ProcessScriptHost::new(args.script_runner.clone(), root);
        collaborators = collaborators.with_scripts(Arc::new(host));
    }

    let output = options.output.clone();
    let runner = Runner::new(options, collaborators);
    let report = runner.run_input(&input).await?;
    print_summary(&report);
    if let Some(path) = output {
        write_report(&report, &path)?;
        tracing::info!(path = %path, "report written");
    }

    Ok(if report.has_failures() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);
    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "{}", failure_label(err.as_ref()));
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use denkprobe::{ConfigError, ReportMetadata, ScriptError, Summary};

    use super::*;

    fn empty_report() -> Report {
        Report {
            summary: Summary::from_results(&[]),
            results: Vec::new(),
            stability_results: Vec::new(),
            metadata: ReportMetadata::new(Utc::now()),
        }
    }

    #[test]
    fn unwritable_report_is_not_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("report.json");
        let err = write_report(&empty_report(), path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().starts_with("failed to write report to"));

        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert_eq!(failure_label(boxed.as_ref()), "report not written");
    }

    #[test]
    fn labels_run_failures() {
        let aborted: Box<dyn std::error::Error> = Box::new(RunError::BeforeAll(ScriptError::NotConfigured));
        assert_eq!(failure_label(aborted.as_ref()), "run aborted");
        let config: Box<dyn std::error::Error> = Box::new(ConfigError::DuplicateId("T1".to_string()));
        assert_eq!(failure_label(config.as_ref()), "configuration error");
    }
}
