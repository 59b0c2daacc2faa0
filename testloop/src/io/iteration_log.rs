//! Per-iteration logs under `<out>/iterations/<run-id>/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::ExecStatus;
use crate::refine::IterationRecord;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub iteration: u32,
    pub test_code_version: u32,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub decision: String,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub test_code_path: PathBuf,
    pub execution_log_path: PathBuf,
    pub results_path: PathBuf,
}

impl IterationPaths {
    pub fn new(out_dir: &Path, run_id: &str, iteration: u32) -> Self {
        let dir = out_dir
            .join("iterations")
            .join(run_id)
            .join(iteration.to_string());
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            test_code_path: dir.join("test_code.py"),
            execution_log_path: dir.join("execution.log"),
            results_path: dir.join("results.json"),
        }
    }
}

/// Write every artifact of one iteration.
pub fn write_iteration(
    out_dir: &Path,
    run_id: &str,
    record: &IterationRecord<'_>,
) -> Result<IterationPaths> {
    let paths = IterationPaths::new(out_dir, run_id, record.index);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    let meta = IterationMeta {
        run_id: run_id.to_string(),
        iteration: record.index,
        test_code_version: record.test_code.version,
        status: record.execution.status,
        exit_code: record.execution.exit_code,
        duration_ms: record.execution.duration_ms,
        total: record.report.total(),
        passed: record.report.passed(),
        failed: record.report.failed(),
        decision: record.decision.next_state().to_string(),
    };

    write_json(&paths.meta_path, &meta)?;
    write_text(&paths.test_code_path, &record.test_code.text)?;
    write_text(&paths.execution_log_path, &execution_log(record))?;
    write_json(&paths.results_path, record.report)?;

    Ok(paths)
}

fn execution_log(record: &IterationRecord<'_>) -> String {
    let execution = record.execution;
    let exit = execution
        .exit_code
        .map_or_else(|| "none".to_string(), |code| code.to_string());
    format!(
        "status: {:?}\nexit_code: {exit}\nduration_ms: {}\n\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
        execution.status, execution.duration_ms, execution.stdout, execution.stderr
    )
}

pub(crate) fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decision::Decision;
    use crate::core::parser::parse;
    use crate::test_support::{pytest_execution, test_code};

    #[test]
    fn iteration_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = IterationPaths::new(temp.path(), "run-1", 2);
        assert!(paths.dir.ends_with(Path::new("iterations/run-1/2")));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.test_code_path.ends_with("test_code.py"));
        assert!(paths.execution_log_path.ends_with("execution.log"));
        assert!(paths.results_path.ends_with("results.json"));
    }

    #[test]
    fn writes_all_iteration_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let code = test_code(2);
        let execution = pytest_execution(&[("test_add", true), ("test_sub", false)]);
        let report = parse(&execution).expect("parse");
        let record = IterationRecord {
            index: 1,
            test_code: &code,
            execution: &execution,
            report: &report,
            decision: Decision::Retry { next: 2 },
        };

        let paths = write_iteration(temp.path(), "run-abc", &record).expect("write");

        assert_eq!(fs::read_to_string(&paths.test_code_path).expect("code"), code.text);
        let log = fs::read_to_string(&paths.execution_log_path).expect("log");
        assert!(log.contains("exit_code: 1"));
        assert!(log.contains("test_generated.py::test_sub FAILED"));
        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("meta"))
                .expect("meta json");
        assert_eq!(meta["decision"], "DEBUG");
        assert_eq!(meta["failed"], 1);
        assert_eq!(meta["test_code_version"], 2);
        let results: crate::core::types::ResultReport =
            serde_json::from_str(&fs::read_to_string(&paths.results_path).expect("results"))
                .expect("results json");
        assert_eq!(results, report);
    }
}
