use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::eval::machine::{CaseResult, CaseStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityClass {
    Stable,
    MostlyStable,
    Unstable,
    HighlyUnstable,
}

impl StabilityClass {
    /// `pass_rate` is a percentage.
    pub fn classify(pass_rate: f64) -> Self {
        if pass_rate >= 100.0 {
            Self::Stable
        } else if pass_rate >= 80.0 {
            Self::MostlyStable
        } else if pass_rate >= 50.0 {
            Self::Unstable
        } else {
            Self::HighlyUnstable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetail {
    pub run: usize,
    pub status: CaseStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A case aggregated over its repeated runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityResult {
    pub id: String,
    pub status: CaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    pub runs: usize,
    pub passed: usize,
    /// Every run that did not pass.
    pub failed: usize,
    pub pass_rate: f64,
    /// Mean pairwise similarity of the run outputs, 0 to 1.
    pub consistency: f64,
    pub stable: bool,
    pub stability_class: StabilityClass,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub std_deviation_ms: f64,
    pub run_details: Vec<RunDetail>,
}

impl StabilityResult {
    pub fn from_runs(id: impl Into<String>, runs: &[CaseResult]) -> Self {
        let total = runs.len();
        let passed = runs.iter().filter(|r| r.status == CaseStatus::Passed).count();
        let pass_rate = if total == 0 {
            0.0
        } else {
            passed as f64 / total as f64 * 100.0
        };
        let stable = total > 0 && passed == total;

        let durations: Vec<u64> = runs.iter().map(|r| r.duration_ms).collect();
        let avg = mean(&durations);
        let variance = if durations.is_empty() {
            0.0
        } else {
            durations
                .iter()
                .map(|&d| (d as f64 - avg).powi(2))
                .sum::<f64>()
                / durations.len() as f64
        };

        let outputs: Vec<String> = runs.iter().map(CaseResult::output_text).collect();
        let all_skipped = total > 0 && runs.iter().all(|r| r.status == CaseStatus::Skipped);
        let status = if total == 0 || all_skipped {
            CaseStatus::Skipped
        } else if stable {
            CaseStatus::Passed
        } else {
            CaseStatus::Failed
        };

        Self {
            id: id.into(),
            status,
            input: runs.first().and_then(|r| r.input.clone()),
            expected: runs.first().and_then(|r| r.expected.clone()),
            runs: total,
            passed,
            failed: total - passed,
            pass_rate,
            consistency: consistency(&outputs),
            stable,
            stability_class: StabilityClass::classify(pass_rate),
            avg_duration_ms: avg,
            min_duration_ms: durations.iter().copied().min().unwrap_or(0),
            max_duration_ms: durations.iter().copied().max().unwrap_or(0),
            std_deviation_ms: variance.sqrt(),
            run_details: runs
                .iter()
                .map(|r| RunDetail {
                    run: r.run,
                    status: r.status,
                    duration_ms: r.duration_ms,
                    output: r.output.clone(),
                    error: r.error.clone(),
                })
                .collect(),
        }
    }
}

fn mean(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<u64>() as f64 / values.len() as f64
}

fn consistency(outputs: &[String]) -> f64 {
    if outputs.len() < 2 {
        return 1.0;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (i, left) in outputs.iter().enumerate() {
        for right in &outputs[i + 1..] {
            total += strsim::normalized_levenshtein(left, right);
            pairs += 1;
        }
    }
    total / pairs as f64
}
