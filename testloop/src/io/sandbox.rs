//! Sandboxed execution of generated test code.
//!
//! Every run gets a fresh scratch directory holding only the source unit and
//! the test file. The runner process starts with a cleared environment (only
//! `PATH` survives, `HOME` points at the scratch directory) and its whole
//! process group is killed at the wall-clock timeout. Nothing outlives the call.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::clean::strip_code_fence;
use crate::core::types::{ExecStatus, ExecutionRecord, SourceUnit, TestCode};
use crate::io::process::run_command_with_timeout;

/// Runs test code against a source unit in isolation.
///
/// An `Err` means the sandbox itself could not be prepared or started.
/// Failing tests, crashes, and timeouts are all reported through the
/// returned [`ExecutionRecord`].
pub trait Sandbox {
    fn run(&self, source: &SourceUnit, test: &TestCode, timeout: Duration)
    -> Result<ExecutionRecord>;
}

/// Process-isolated sandbox driving an external test runner.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    /// Runner argv; the test file name is appended as the last argument.
    command: Vec<String>,
    source_file: String,
    test_file: String,
    output_limit_bytes: usize,
}

impl ProcessSandbox {
    pub fn new(
        command: Vec<String>,
        source_file: impl Into<String>,
        test_file: impl Into<String>,
        output_limit_bytes: usize,
    ) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("sandbox command must be a non-empty array"));
        }
        Ok(Self {
            command,
            source_file: source_file.into(),
            test_file: test_file.into(),
            output_limit_bytes,
        })
    }

    fn prepare(&self, dir: &Path, source: &SourceUnit, test: &TestCode) -> Result<()> {
        let source_path = dir.join(&self.source_file);
        fs::write(&source_path, &source.text)
            .with_context(|| format!("write source {}", source_path.display()))?;
        let test_path = dir.join(&self.test_file);
        fs::write(&test_path, strip_code_fence(&test.text))
            .with_context(|| format!("write test file {}", test_path.display()))?;
        Ok(())
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(source = %source.id, version = test.version))]
    fn run(
        &self,
        source: &SourceUnit,
        test: &TestCode,
        timeout: Duration,
    ) -> Result<ExecutionRecord> {
        let scratch = tempfile::Builder::new()
            .prefix("testloop-sandbox-")
            .tempdir()
            .context("create sandbox directory")?;
        self.prepare(scratch.path(), source, test)?;

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("sandbox command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&self.test_file)
            .current_dir(scratch.path())
            .env_clear()
            .env("HOME", scratch.path())
            .env("PYTHONDONTWRITEBYTECODE", "1");
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }

        debug!(program = %program, dir = %scratch.path().display(), "starting test runner");
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .with_context(|| format!("run sandbox command {program}"))?;

        let status = if output.timed_out {
            ExecStatus::TimedOut
        } else if output.status.code().is_some() {
            ExecStatus::Ok
        } else {
            ExecStatus::Error
        };
        let record = ExecutionRecord {
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            exit_code: if output.timed_out {
                None
            } else {
                output.status.code()
            },
            status,
            duration_ms: output.elapsed.as_millis() as u64,
        };
        info!(
            status = ?record.status,
            exit_code = ?record.exit_code,
            duration_ms = record.duration_ms,
            "sandbox run finished"
        );
        Ok(record)
    }
}
