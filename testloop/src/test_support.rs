//! Test-only doubles and fixtures for workflow runs.
//!
//! Scripted capabilities replay queued outputs and remember which keys each
//! invocation was shown. The scripted sandbox replays queued execution records
//! and remembers which test code versions it was asked to run.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::capability::GenerationCapability;
use crate::core::keys::StateKey;
use crate::core::store::{Entry, Produced, Snapshot, StateStore};
use crate::core::types::{
    AnalysisReport, ExecStatus, ExecutionRecord, Finding, Scenario, ScenarioSet, SourceUnit,
    TestCode,
};
use crate::io::sandbox::Sandbox;

#[derive(Debug, Clone)]
enum Reply {
    Produce(Vec<Entry>),
    Fail(String),
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: VecDeque<Reply>,
    /// Served once the queue is empty.
    fallback: Option<Reply>,
    seen: Vec<Vec<StateKey>>,
}

/// Capability that replays scripted replies in order.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCapability {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedCapability {
    fn with(replies: Vec<Reply>, fallback: Option<Reply>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                replies: replies.into(),
                fallback,
                seen: Vec::new(),
            })),
        }
    }

    /// One single-entry reply per call.
    pub fn returning(entries: Vec<Entry>) -> Self {
        Self::with(
            entries
                .into_iter()
                .map(|entry| Reply::Produce(vec![entry]))
                .collect(),
            None,
        )
    }

    /// One multi-entry reply per call.
    pub fn returning_many(replies: Vec<Vec<Entry>>) -> Self {
        Self::with(replies.into_iter().map(Reply::Produce).collect(), None)
    }

    /// The same reply on every call.
    pub fn always(entries: Vec<Entry>) -> Self {
        Self::with(Vec::new(), Some(Reply::Produce(entries)))
    }

    /// Fails on every call.
    pub fn failing(message: &str) -> Self {
        Self::with(Vec::new(), Some(Reply::Fail(message.to_string())))
    }

    /// Debugger double that emits test code versions `first..` on successive calls.
    pub fn debugger_from(first: u32, calls: u32) -> Self {
        Self::returning(
            (first..first + calls)
                .map(|version| Entry::TestCode(test_code(version)))
                .collect(),
        )
    }

    pub fn handle(&self) -> Arc<dyn GenerationCapability> {
        Arc::new(self.clone())
    }

    pub fn calls(&self) -> usize {
        self.lock().seen.len()
    }

    /// Keys present in the snapshot of every invocation, in call order.
    pub fn seen_keys(&self) -> Vec<Vec<StateKey>> {
        self.lock().seen.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().expect("script state lock")
    }
}

impl GenerationCapability for ScriptedCapability {
    fn invoke(&self, snapshot: &Snapshot) -> Result<Produced> {
        let mut state = self.lock();
        state.seen.push(snapshot.keys().collect());
        let reply = match state.replies.pop_front() {
            Some(reply) => reply,
            None => state
                .fallback
                .clone()
                .ok_or_else(|| anyhow!("no scripted reply left"))?,
        };
        match reply {
            Reply::Produce(entries) => Ok(entries
                .into_iter()
                .map(|entry| (entry.key(), entry))
                .collect()),
            Reply::Fail(message) => Err(anyhow!(message)),
        }
    }
}

#[derive(Debug, Default)]
struct SandboxState {
    records: VecDeque<Result<ExecutionRecord, String>>,
    versions: Vec<u32>,
}

/// Sandbox that replays queued execution records.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSandbox {
    state: Arc<Mutex<SandboxState>>,
}

impl ScriptedSandbox {
    pub fn new(records: Vec<ExecutionRecord>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SandboxState {
                records: records.into_iter().map(Ok).collect(),
                versions: Vec::new(),
            })),
        }
    }

    /// Sandbox whose environment cannot be prepared.
    pub fn unavailable(message: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(SandboxState {
                records: VecDeque::from([Err(message.to_string())]),
                versions: Vec::new(),
            })),
        }
    }

    /// Test code versions executed, in order.
    pub fn versions(&self) -> Vec<u32> {
        self.state.lock().expect("sandbox lock").versions.clone()
    }
}

impl Sandbox for ScriptedSandbox {
    fn run(
        &self,
        _source: &SourceUnit,
        test: &TestCode,
        _timeout: Duration,
    ) -> Result<ExecutionRecord> {
        let mut state = self.state.lock().expect("sandbox lock");
        state.versions.push(test.version);
        match state.records.pop_front() {
            Some(Ok(record)) => Ok(record),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted execution left")),
        }
    }
}

/// The source unit used across tests (`calc.py`).
pub fn sample_source() -> SourceUnit {
    SourceUnit {
        id: "calc.py".to_string(),
        text: "def add(a, b):\n    return a + b\n\n\ndef sub(a, b):\n    return a - b\n"
            .to_string(),
    }
}

pub fn test_code(version: u32) -> TestCode {
    TestCode::new(
        version,
        format!(
            "# v{version}\nfrom source_under_test import add\n\n\ndef test_add():\n    assert add(1, 2) == 3\n"
        ),
    )
}

pub fn analysis_report() -> Entry {
    Entry::AnalysisReport(AnalysisReport {
        findings: vec![
            Finding {
                symbol: "add".to_string(),
                kind: "function".to_string(),
                signature: "add(a, b)".to_string(),
            },
            Finding {
                symbol: "sub".to_string(),
                kind: "function".to_string(),
                signature: "sub(a, b)".to_string(),
            },
        ],
    })
}

pub fn scenario_set() -> Entry {
    Entry::ScenarioSet(ScenarioSet {
        scenarios: vec![Scenario {
            name: "test_add".to_string(),
            intent: "adds two integers".to_string(),
            expected: "add(1, 2) == 3".to_string(),
        }],
    })
}

/// Store holding only the sample source unit.
pub fn seeded_store() -> StateStore {
    let mut store = StateStore::new();
    store
        .put(StateKey::SourceUnit, Entry::SourceUnit(sample_source()))
        .expect("seed source");
    store
}

/// Completed execution with the given stdout and exit code.
pub fn execution(stdout: &str, exit_code: Option<i32>) -> ExecutionRecord {
    ExecutionRecord {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code,
        status: ExecStatus::Ok,
        duration_ms: 12,
    }
}

/// Execution that was killed at the sandbox timeout.
pub fn timed_out_execution() -> ExecutionRecord {
    ExecutionRecord {
        stdout: String::new(),
        stderr: String::new(),
        exit_code: None,
        status: ExecStatus::TimedOut,
        duration_ms: 30_000,
    }
}

/// Execution of a verbose pytest run over `(name, passed)` tests.
pub fn pytest_execution(tests: &[(&str, bool)]) -> ExecutionRecord {
    let all_pass = tests.iter().all(|(_, passed)| *passed);
    execution(&pytest_output(tests), Some(if all_pass { 0 } else { 1 }))
}

/// Verbose pytest stdout for `(name, passed)` tests. Failing tests get a
/// FAILURES section whose assertion line reads `assert 1 == 2`.
pub fn pytest_output(tests: &[(&str, bool)]) -> String {
    let mut out = String::new();
    out.push_str("============================= test session starts ==============================\n");
    let _ = writeln!(out, "collected {} items\n", tests.len());
    let count = tests.len().max(1);
    for (index, (name, passed)) in tests.iter().enumerate() {
        let status = if *passed { "PASSED" } else { "FAILED" };
        let percent = (index + 1) * 100 / count;
        let _ = writeln!(out, "test_generated.py::{name} {status} [{percent:>3}%]");
    }

    let failing: Vec<&str> = tests
        .iter()
        .filter(|(_, passed)| !passed)
        .map(|(name, _)| *name)
        .collect();
    if !failing.is_empty() {
        out.push_str("\n=================================== FAILURES ===================================\n");
        for name in &failing {
            let _ = writeln!(out, "_________________________________ {name} _________________________________\n");
            let _ = writeln!(out, "    def {name}():\n>       assert 1 == 2");
            out.push_str("E       assert 1 == 2\n\ntest_generated.py:5: AssertionError\n");
        }
        out.push_str("=========================== short test summary info ============================\n");
        for name in &failing {
            let _ = writeln!(out, "FAILED test_generated.py::{name} - assert 1 == 2");
        }
    }

    let passed = tests.len() - failing.len();
    let body = match (failing.len(), passed) {
        (0, p) => format!("{p} passed"),
        (f, 0) => format!("{f} failed"),
        (f, p) => format!("{f} failed, {p} passed"),
    };
    let _ = writeln!(out, "========================= {body} in 0.03s ==========================");
    out
}
