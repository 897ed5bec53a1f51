use std::{fs, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eval::{
    machine::{CaseResult, CaseStatus},
    stability::StabilityResult,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub timeouts: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<String>,
    /// Absent when cases ran a differing number of times.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs_per_case: Option<usize>,
    pub total_runs: usize,
    /// Percentage; in stability mode the mean of the per-case pass rates.
    pub overall_pass_rate: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub stable_cases: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub unstable_cases: usize,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl Summary {
    fn count(&mut self, status: CaseStatus) {
        match status {
            CaseStatus::Passed => self.passed += 1,
            CaseStatus::Failed => self.failed += 1,
            CaseStatus::Skipped => self.skipped += 1,
            CaseStatus::Error => self.errors += 1,
            CaseStatus::Timeout => self.timeouts += 1,
        }
    }

    pub fn from_results(results: &[CaseResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            runs_per_case: Some(1),
            total_runs: results.len(),
            ..Self::default()
        };
        for result in results {
            summary.count(result.status);
        }
        if summary.total > 0 {
            summary.overall_pass_rate = summary.passed as f64 / summary.total as f64 * 100.0;
        }
        summary
    }

    pub fn from_stability(results: &[StabilityResult]) -> Self {
        let mut executed = results.iter().map(|r| r.runs).filter(|&runs| runs > 0);
        let runs_per_case = executed
            .next()
            .filter(|&first| executed.all(|runs| runs == first));
        let mut summary = Self {
            total: results.len(),
            runs_per_case,
            total_runs: results.iter().map(|r| r.runs).sum(),
            ..Self::default()
        };
        let mut rate_sum = 0.0;
        let mut rated = 0usize;
        for result in results {
            summary.count(result.status);
            if result.status == CaseStatus::Skipped {
                continue;
            }
            if result.stable {
                summary.stable_cases += 1;
            } else {
                summary.unstable_cases += 1;
            }
            rate_sum += result.pass_rate;
            rated += 1;
        }
        if rated > 0 {
            summary.overall_pass_rate = rate_sum / rated as f64;
        }
        summary
    }

    /// True when anything failed, errored or timed out.
    pub fn has_failures(&self) -> bool {
        self.failed + self.errors + self.timeouts > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl ReportMetadata {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            completed_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            input: None,
            output: None,
            agent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub summary: Summary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<CaseResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stability_results: Vec<StabilityResult>,
    pub metadata: ReportMetadata,
}

impl Report {
    pub fn has_failures(&self) -> bool {
        self.summary.has_failures()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::case::{CaseMode, TestCase};

    fn result(status: CaseStatus) -> CaseResult {
        let mut result = CaseResult::skipped(&TestCase::from_message("hi"), CaseMode::StaticSingle, 1, "");
        result.status = status;
        result
    }

    #[test]
    fn counts_every_status() {
        let results: Vec<_> = [
            CaseStatus::Passed,
            CaseStatus::Failed,
            CaseStatus::Skipped,
            CaseStatus::Error,
            CaseStatus::Timeout,
        ]
        .into_iter()
        .map(result)
        .collect();
        let summary = Summary::from_results(&results);
        assert_eq!(
            (summary.passed, summary.failed, summary.skipped, summary.errors, summary.timeouts),
            (1, 1, 1, 1, 1)
        );
        assert!(summary.has_failures());
        assert_eq!(summary.overall_pass_rate, 20.0);
    }

    #[test]
    fn skips_alone_are_not_failures() {
        let summary = Summary::from_results(&[result(CaseStatus::Passed), result(CaseStatus::Skipped)]);
        assert!(!summary.has_failures());
    }

    #[test]
    fn stability_summary_averages_pass_rates() {
        let stable = StabilityResult::from_runs("a", &[result(CaseStatus::Passed), result(CaseStatus::Passed)]);
        let flaky = StabilityResult::from_runs("b", &[result(CaseStatus::Passed), result(CaseStatus::Failed)]);
        let summary = Summary::from_stability(&[stable, flaky]);
        assert_eq!((summary.stable_cases, summary.unstable_cases), (1, 1));
        assert_eq!((summary.passed, summary.failed), (1, 1));
        assert_eq!(summary.total_runs, 4);
        assert_eq!(summary.overall_pass_rate, 75.0);
        assert_eq!(summary.runs_per_case, Some(2));
    }

    #[test]
    fn runs_per_case_follows_executed_runs() {
        let twice = StabilityResult::from_runs("a", &[result(CaseStatus::Passed), result(CaseStatus::Passed)]);
        let thrice = StabilityResult::from_runs(
            "b",
            &[result(CaseStatus::Passed), result(CaseStatus::Passed), result(CaseStatus::Passed)],
        );
        let never = StabilityResult::from_runs("c", &[]);

        let uniform = Summary::from_stability(&[thrice.clone(), never]);
        assert_eq!(uniform.runs_per_case, Some(3));
        let mixed = Summary::from_stability(&[twice, thrice]);
        assert_eq!(mixed.runs_per_case, None);
        assert_eq!(mixed.total_runs, 5);
        assert!(serde_json::to_value(&mixed).unwrap().get("runs_per_case").is_none());
    }

    #[test]
    fn writes_json_report() {
        let report = Report {
            summary: Summary::from_results(&[result(CaseStatus::Passed)]),
            results: vec![result(CaseStatus::Passed)],
            stability_results: Vec::new(),
            metadata: ReportMetadata::new(Utc::now()),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.write(&path).unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["summary"]["passed"], 1);
        assert_eq!(value["results"][0]["status"], "passed");
        assert!(value.get("stability_results").is_none());
        assert_eq!(value["metadata"]["version"], env!("CARGO_PKG_VERSION"));
    }
}
