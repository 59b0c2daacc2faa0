//! Shared deterministic types for a workflow run.
//!
//! Every entity held by the state store is defined here. These types carry no
//! behavior beyond construction helpers and small derived queries; they must
//! stay free of I/O.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::decision::Transition;
use crate::error::EngineError;

/// Default iteration cap for the refinement loop.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
/// Default timeout for a single generation capability invocation.
pub const DEFAULT_CAPABILITY_TIMEOUT: Duration = Duration::from_secs(300);
/// Default wall-clock timeout for one sandboxed test execution.
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(30);

/// The code under test. Written once when a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    pub id: String,
    pub text: String,
}

/// One structural fact about the source unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub symbol: String,
    pub kind: String,
    pub signature: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub findings: Vec<Finding>,
}

/// A planned test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub intent: String,
    pub expected: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSet {
    pub scenarios: Vec<Scenario>,
}

/// Candidate test suite. `version` must strictly increase on every rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCode {
    pub version: u32,
    pub text: String,
}

impl TestCode {
    pub fn new(version: u32, text: impl Into<String>) -> Self {
        Self {
            version,
            text: text.into(),
        }
    }
}

/// How a sandboxed execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    /// The test process ran to completion (any exit code).
    Ok,
    /// The wall-clock timeout expired and the process was killed.
    TimedOut,
    /// The process ended abnormally (e.g. killed by a signal).
    Error,
}

/// Raw outcome of running test code against the source unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub status: ExecStatus,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    /// True when the runner completed and reported success through its exit code.
    pub fn succeeded(&self) -> bool {
        self.status == ExecStatus::Ok && self.exit_code == Some(0)
    }
}

/// Per-test status in a parsed report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    /// The test (or its collection) raised outside of an assertion.
    Error,
    /// Synthetic entry for an execution that hit the sandbox timeout.
    TimedOut,
}

impl TestStatus {
    pub fn is_failure(self) -> bool {
        !matches!(self, TestStatus::Passed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEntry {
    pub scenario: String,
    pub status: TestStatus,
    pub message: Option<String>,
}

impl TestEntry {
    pub fn passed(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            status: TestStatus::Passed,
            message: None,
        }
    }

    pub fn failed(scenario: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            status: TestStatus::Failed,
            message: Some(message.into()),
        }
    }
}

/// Parsed outcome of one execution.
///
/// Counts are always derived from `entries`, so `passed + failed == total`
/// holds for every value of this type, including deserialized ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ResultReportRepr")]
pub struct ResultReport {
    total: usize,
    passed: usize,
    failed: usize,
    entries: Vec<TestEntry>,
}

impl ResultReport {
    pub fn from_entries(entries: Vec<TestEntry>) -> Self {
        let failed = entries
            .iter()
            .filter(|entry| entry.status.is_failure())
            .count();
        Self {
            total: entries.len(),
            passed: entries.len() - failed,
            failed,
            entries,
        }
    }

    /// Report with no tests at all (nothing structured was produced).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Report holding one failing entry, used for timeouts and unparsable output.
    pub fn single_failure(scenario: &str, status: TestStatus, message: impl Into<String>) -> Self {
        Self::from_entries(vec![TestEntry {
            scenario: scenario.to_string(),
            status,
            message: Some(message.into()),
        }])
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn passed(&self) -> usize {
        self.passed
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn entries(&self) -> &[TestEntry] {
        &self.entries
    }

    pub fn failing_entries(&self) -> impl Iterator<Item = &TestEntry> {
        self.entries.iter().filter(|entry| entry.status.is_failure())
    }
}

#[derive(Deserialize)]
struct ResultReportRepr {
    total: usize,
    passed: usize,
    failed: usize,
    entries: Vec<TestEntry>,
}

impl TryFrom<ResultReportRepr> for ResultReport {
    type Error = String;

    fn try_from(repr: ResultReportRepr) -> Result<Self, Self::Error> {
        let report = ResultReport::from_entries(repr.entries);
        if (report.total, report.passed, report.failed) != (repr.total, repr.passed, repr.failed) {
            return Err(format!(
                "result counts total={} passed={} failed={} do not match entries (total={} passed={} failed={})",
                repr.total, repr.passed, repr.failed, report.total, report.passed, report.failed
            ));
        }
        Ok(report)
    }
}

/// Refinement loop bookkeeping. `current` is a 0-based iteration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationState {
    pub current: u32,
    pub max: u32,
    pub terminal: bool,
}

impl IterationState {
    pub fn start(max: u32) -> Self {
        Self {
            current: 0,
            max,
            terminal: false,
        }
    }

    /// Number of sandbox executions performed once the loop has stopped.
    pub fn iterations_used(&self) -> u32 {
        self.current + 1
    }
}

/// Terminal classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// All tests passed within the iteration budget.
    Passed,
    /// The budget ran out with tests still failing.
    Exhausted,
}

/// Terminal output of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalArtifact {
    pub run_id: String,
    pub source_id: String,
    pub outcome: Outcome,
    /// Failing entries left in the last report; zero when `outcome` is `Passed`.
    pub failing_remaining: usize,
    pub iterations_used: u32,
    pub max_iterations: u32,
    /// Status and exit code of the last sandbox execution.
    pub last_exec_status: ExecStatus,
    pub last_exit_code: Option<i32>,
    pub test_code: TestCode,
    pub results: ResultReport,
    pub transitions: Vec<Transition>,
}

impl FinalArtifact {
    pub fn summary(&self) -> String {
        match self.outcome {
            Outcome::Passed => format!(
                "passed: {} tests green after {}/{} iterations (test code v{})",
                self.results.total(),
                self.iterations_used,
                self.max_iterations,
                self.test_code.version
            ),
            Outcome::Exhausted => format!(
                "exhausted: {} of {} tests still failing after {}/{} iterations (test code v{})",
                self.failing_remaining,
                self.results.total(),
                self.iterations_used,
                self.max_iterations,
                self.test_code.version
            ),
        }
    }
}

/// Bounds the engine enforces on a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_iterations: u32,
    pub capability_timeout: Duration,
    pub sandbox_timeout: Duration,
}

impl Limits {
    pub fn new(
        max_iterations: u32,
        capability_timeout: Duration,
        sandbox_timeout: Duration,
    ) -> Result<Self, EngineError> {
        if max_iterations == 0 {
            return Err(EngineError::InvalidLimits(
                "max_iterations must be >= 1".to_string(),
            ));
        }
        if capability_timeout.is_zero() {
            return Err(EngineError::InvalidLimits(
                "capability timeout must be > 0".to_string(),
            ));
        }
        if sandbox_timeout.is_zero() {
            return Err(EngineError::InvalidLimits(
                "sandbox timeout must be > 0".to_string(),
            ));
        }
        Ok(Self {
            max_iterations,
            capability_timeout,
            sandbox_timeout,
        })
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            capability_timeout: DEFAULT_CAPABILITY_TIMEOUT,
            sandbox_timeout: DEFAULT_SANDBOX_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts_derive_from_entries() {
        let report = ResultReport::from_entries(vec![
            TestEntry::passed("a"),
            TestEntry::failed("b", "boom"),
            TestEntry {
                scenario: "c".to_string(),
                status: TestStatus::Error,
                message: None,
            },
        ]);
        assert_eq!(report.total(), 3);
        assert_eq!(report.passed(), 1);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.passed() + report.failed(), report.total());
    }

    #[test]
    fn report_rejects_inconsistent_counts_on_deserialize() {
        let raw = r#"{"total":2,"passed":2,"failed":0,"entries":[{"scenario":"a","status":"failed","message":null},{"scenario":"b","status":"passed","message":null}]}"#;
        let err = serde_json::from_str::<ResultReport>(raw).unwrap_err();
        assert!(err.to_string().contains("do not match entries"));
    }

    #[test]
    fn report_accepts_consistent_counts_on_deserialize() {
        let raw = r#"{"total":1,"passed":0,"failed":1,"entries":[{"scenario":"a","status":"timed_out","message":"slow"}]}"#;
        let report: ResultReport = serde_json::from_str(raw).expect("parse");
        assert_eq!(report.failed(), 1);
    }

    #[test]
    fn limits_reject_zero_iterations() {
        let err = Limits::new(0, Duration::from_secs(1), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidLimits(_)));
    }

    #[test]
    fn default_limits_match_documented_values() {
        let limits = Limits::default();
        assert_eq!(limits.max_iterations, 3);
        assert_eq!(limits.sandbox_timeout, Duration::from_secs(30));
        assert_eq!(limits.capability_timeout, Duration::from_secs(300));
    }

    #[test]
    fn execution_succeeds_only_on_clean_exit() {
        let mut record = ExecutionRecord {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            status: ExecStatus::Ok,
            duration_ms: 1,
        };
        assert!(record.succeeded());
        record.exit_code = Some(1);
        assert!(!record.succeeded());
        record.exit_code = Some(0);
        record.status = ExecStatus::TimedOut;
        assert!(!record.succeeded());
    }
}
