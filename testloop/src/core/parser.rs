//! Result parser for verbose pytest output.
//!
//! Turns an [`ExecutionRecord`] into a [`ResultReport`]. Output with no
//! recognizable structure yields an empty report; a timed-out execution yields
//! a single synthetic failing entry. Output whose per-test lines disagree with
//! the final summary line is reported as [`EngineError::UnparsableResult`].

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};

use crate::core::types::{ExecStatus, ExecutionRecord, ResultReport, TestEntry, TestStatus};
use crate::error::{EngineError, Result};

/// Scenario name used for the synthetic entry of a timed-out execution.
pub const TIMEOUT_SCENARIO: &str = "<timeout>";

/// Parametrized ids may contain spaces (`test_upper[hello world]`), so the
/// node id runs lazily up to the first standalone status word.
static TEST_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<node>\S+::.+?)\s+(?P<status>PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)(?:\s|$)",
    )
    .expect("test line regex")
});
static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^_{3,} (?P<name>.+?) _{3,}$").expect("section regex"));
static BANNER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^={3,}").expect("banner regex"));
static SHORT_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:FAILED|ERROR) (?P<node>[^\s\[]+(?:\[[^\]]*\])?)(?: - (?P<message>.*))?$")
        .expect("short summary regex")
});
static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^=+ (?P<body>.+?) in [\d.]+s(?: \([^)]*\))? =+$").expect("summary regex")
});
static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<count>\d+) (?P<label>failed|passed|errors?|xpassed)\b").expect("count regex")
});

/// Counts reported by the final pytest summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SummaryCounts {
    passed: usize,
    failed: usize,
}

/// A `____ name ____` block from the FAILURES or ERRORS section.
#[derive(Debug)]
struct Section {
    name: String,
    message: Option<String>,
}

/// Parse an execution record into a report.
#[instrument(skip_all, fields(status = ?record.status, exit_code = ?record.exit_code))]
pub fn parse(record: &ExecutionRecord) -> Result<ResultReport> {
    if record.status == ExecStatus::TimedOut {
        debug!("execution timed out; synthesizing timeout entry");
        return Ok(ResultReport::single_failure(
            TIMEOUT_SCENARIO,
            TestStatus::TimedOut,
            format!("test execution timed out after {} ms", record.duration_ms),
        ));
    }
    parse_output(&record.stdout)
}

/// Parse raw pytest stdout.
pub fn parse_output(stdout: &str) -> Result<ResultReport> {
    let lines: Vec<&str> = stdout.lines().map(str::trim_end).collect();

    let mut entries = Vec::new();
    for line in &lines {
        if let Some(caps) = TEST_LINE_RE.captures(line) {
            let status = match &caps["status"] {
                "PASSED" | "XPASS" => TestStatus::Passed,
                "FAILED" => TestStatus::Failed,
                "ERROR" => TestStatus::Error,
                // Skipped and expected failures are not part of the totals.
                _ => continue,
            };
            entries.push(TestEntry {
                scenario: scenario_name(&caps["node"]).to_string(),
                status,
                message: None,
            });
        }
    }

    let sections = collect_sections(&lines);
    for section in &sections {
        if let Some(target) = section.name.strip_prefix("ERROR collecting ") {
            entries.push(TestEntry {
                scenario: format!("collect:{}", target.trim()),
                status: TestStatus::Error,
                message: Some(
                    section
                        .message
                        .clone()
                        .unwrap_or_else(|| "error during collection".to_string()),
                ),
            });
        }
    }
    attach_messages(&mut entries, &sections, &lines);

    let summary = lines.iter().rev().find_map(|line| parse_summary(line));
    let report = ResultReport::from_entries(entries);

    match summary {
        None => {
            debug!(total = report.total(), "no summary line");
            Ok(report)
        }
        Some(counts) => {
            if report.total() == 0 && counts.passed + counts.failed > 0 {
                return Err(EngineError::UnparsableResult(format!(
                    "summary reports {} passed and {} failed but no per-test results were found",
                    counts.passed, counts.failed
                )));
            }
            if counts.passed != report.passed() || counts.failed != report.failed() {
                return Err(EngineError::UnparsableResult(format!(
                    "summary reports {} passed and {} failed but per-test results show {} passed and {} failed",
                    counts.passed,
                    counts.failed,
                    report.passed(),
                    report.failed()
                )));
            }
            debug!(
                total = report.total(),
                passed = report.passed(),
                failed = report.failed(),
                "parsed results"
            );
            Ok(report)
        }
    }
}

/// `tests/test_x.py::TestCalc::test_add[1-2]` → `test_add[1-2]`.
fn scenario_name(node: &str) -> &str {
    node.rsplit("::").next().unwrap_or(node)
}

fn collect_sections(lines: &[&str]) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in lines {
        if let Some(caps) = SECTION_RE.captures(line) {
            if let Some((name, body)) = current.take() {
                sections.push(finish_section(name, &body));
            }
            current = Some((caps["name"].to_string(), Vec::new()));
            continue;
        }
        if BANNER_RE.is_match(line) {
            if let Some((name, body)) = current.take() {
                sections.push(finish_section(name, &body));
            }
            continue;
        }
        if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((name, body)) = current.take() {
        sections.push(finish_section(name, &body));
    }
    sections
}

fn finish_section(name: String, body: &[&str]) -> Section {
    let message = body
        .iter()
        .rev()
        .find_map(|line| {
            let trimmed = line.trim_start();
            trimmed
                .strip_prefix("E ")
                .map(|rest| rest.trim().to_string())
        })
        .or_else(|| {
            body.iter()
                .rev()
                .map(|line| line.trim())
                .find(|line| !line.is_empty())
                .map(str::to_string)
        });
    Section { name, message }
}

/// Fill failing entries' messages from failure sections, falling back to the
/// short test summary lines.
fn attach_messages(entries: &mut [TestEntry], sections: &[Section], lines: &[&str]) {
    let short: Vec<(String, String)> = lines
        .iter()
        .filter_map(|line| SHORT_SUMMARY_RE.captures(line))
        .filter_map(|caps| {
            let message = caps.name("message")?.as_str().to_string();
            Some((scenario_name(&caps["node"]).to_string(), message))
        })
        .collect();

    for entry in entries
        .iter_mut()
        .filter(|entry| entry.status.is_failure() && entry.message.is_none())
    {
        let message = sections
            .iter()
            .find(|section| section_matches(&section.name, &entry.scenario))
            .and_then(|section| section.message.clone())
            .or_else(|| {
                short
                    .iter()
                    .find(|(scenario, _)| *scenario == entry.scenario)
                    .map(|(_, message)| message.clone())
            });
        entry.message = message;
    }
}

fn section_matches(section: &str, scenario: &str) -> bool {
    let name = section
        .strip_prefix("ERROR at setup of ")
        .or_else(|| section.strip_prefix("ERROR at teardown of "))
        .unwrap_or(section);
    name == scenario || name.ends_with(&format!(".{scenario}"))
}

fn parse_summary(line: &str) -> Option<SummaryCounts> {
    let caps = SUMMARY_RE.captures(line)?;
    let body = caps.name("body")?.as_str();
    let mut counts = SummaryCounts::default();
    let mut matched = body.contains("no tests ran");
    for count in COUNT_RE.captures_iter(body) {
        let Ok(value) = count["count"].parse::<usize>() else {
            continue;
        };
        matched = true;
        match &count["label"] {
            "passed" | "xpassed" => counts.passed += value,
            _ => counts.failed += value,
        }
    }
    matched.then_some(counts)
}
