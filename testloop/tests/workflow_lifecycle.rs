//! Full workflow runs driven by scripted capabilities and a scripted sandbox.
//!
//! Each test builds a `Workflow` over the sample source unit, runs the
//! generation pipeline and the refinement loop end to end, and checks the
//! final artifact together with the store it leaves behind.

use std::time::Duration;

use testloop::core::decision::{LoopState, Transition};
use testloop::core::keys::StateKey;
use testloop::core::store::Entry;
use testloop::core::types::{Limits, Outcome, TestCode, TestStatus};
use testloop::error::EngineError;
use testloop::test_support::{
    ScriptedCapability, ScriptedSandbox, analysis_report, pytest_execution, sample_source,
    scenario_set, test_code, timed_out_execution,
};
use testloop::workflow::{Capabilities, Workflow};

struct Doubles {
    analyzer: ScriptedCapability,
    designer: ScriptedCapability,
    implementer: ScriptedCapability,
    debugger: ScriptedCapability,
}

impl Doubles {
    fn with_debugger(debugger: ScriptedCapability) -> Self {
        Self {
            analyzer: ScriptedCapability::returning(vec![analysis_report()]),
            designer: ScriptedCapability::returning(vec![scenario_set()]),
            implementer: ScriptedCapability::returning(vec![Entry::TestCode(test_code(1))]),
            debugger,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            analyzer: self.analyzer.handle(),
            designer: self.designer.handle(),
            implementer: self.implementer.handle(),
            debugger: self.debugger.handle(),
        }
    }
}

fn limits(max_iterations: u32) -> Limits {
    Limits::new(
        max_iterations,
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
    .expect("limits")
}

/// All tests pass on the first run: one iteration, debugger never called.
#[test]
fn passes_on_first_iteration_without_debugging() {
    let doubles = Doubles::with_debugger(ScriptedCapability::debugger_from(2, 3));
    let sandbox = ScriptedSandbox::new(vec![pytest_execution(&[
        ("test_add", true),
        ("test_sub", true),
    ])]);
    let mut workflow =
        Workflow::new(sample_source(), doubles.capabilities(), &sandbox, limits(3))
            .expect("workflow");

    let artifact = workflow.run(|_| {}).expect("run");

    assert_eq!(artifact.outcome, Outcome::Passed);
    assert_eq!(artifact.iterations_used, 1);
    assert_eq!(artifact.failing_remaining, 0);
    assert_eq!(artifact.results.total(), 2);
    assert_eq!(artifact.test_code.version, 1);
    assert_eq!(artifact.source_id, "calc.py");
    assert_eq!(artifact.run_id, workflow.run_id());
    assert_eq!(doubles.debugger.calls(), 0);
    assert_eq!(sandbox.versions(), vec![1]);
    assert_eq!(
        artifact.transitions.last(),
        Some(&Transition {
            from: LoopState::Decide,
            to: LoopState::DonePass,
            iteration: 0,
        })
    );
}

/// Every run fails: the loop stops after `max_iterations` executions and the
/// artifact reports the last iteration's code and results.
///
/// Execution sequence:
/// 1. Iter 0: v1 fails → debugger emits v2
/// 2. Iter 1: v2 fails → debugger emits v3
/// 3. Iter 2: v3 fails → budget exhausted
#[test]
fn exhausts_budget_and_reports_last_iteration() {
    let doubles = Doubles::with_debugger(ScriptedCapability::debugger_from(2, 5));
    let sandbox = ScriptedSandbox::new(vec![
        pytest_execution(&[("test_add", false), ("test_sub", false)]),
        pytest_execution(&[("test_add", true), ("test_sub", false)]),
        pytest_execution(&[("test_add", true), ("test_sub", false)]),
    ]);
    let mut workflow =
        Workflow::new(sample_source(), doubles.capabilities(), &sandbox, limits(3))
            .expect("workflow");
    let mut seen = Vec::new();

    let artifact = workflow
        .run(|record| seen.push(record.index))
        .expect("run");

    assert_eq!(artifact.outcome, Outcome::Exhausted);
    assert_eq!(artifact.iterations_used, 3);
    assert_eq!(artifact.max_iterations, 3);
    assert_eq!(artifact.failing_remaining, 1);
    assert_eq!(artifact.test_code.version, 3);
    assert_eq!(artifact.results.failed(), 1);
    assert_eq!(artifact.last_exit_code, Some(1));
    assert_eq!(seen, vec![0, 1, 2]);
    assert_eq!(sandbox.versions(), vec![1, 2, 3]);
    assert_eq!(doubles.debugger.calls(), 2);
    assert!(artifact.summary().starts_with("exhausted: 1 of 2"));
}

/// The loop never runs more sandbox executions than the budget allows.
#[test]
fn sandbox_runs_are_bounded_by_budget() {
    for max in 1..=4 {
        let doubles = Doubles::with_debugger(ScriptedCapability::debugger_from(2, 10));
        let sandbox = ScriptedSandbox::new(
            (0..10)
                .map(|_| pytest_execution(&[("test_add", false)]))
                .collect(),
        );
        let mut workflow =
            Workflow::new(sample_source(), doubles.capabilities(), &sandbox, limits(max))
                .expect("workflow");
        let artifact = workflow.run(|_| {}).expect("run");

        assert_eq!(sandbox.versions().len() as u32, max);
        assert_eq!(artifact.iterations_used, max);
        assert_eq!(doubles.debugger.calls() as u32, max - 1);
    }
}

/// A debugger that keeps returning the same version is rejected on the
/// second debug pass, and the run aborts.
#[test]
fn stale_debugger_revision_aborts_run() {
    let doubles = Doubles::with_debugger(ScriptedCapability::always(vec![Entry::TestCode(
        TestCode::new(2, "def test_add():\n    assert False\n"),
    )]));
    let sandbox = ScriptedSandbox::new(vec![
        pytest_execution(&[("test_add", false)]),
        pytest_execution(&[("test_add", false)]),
        pytest_execution(&[("test_add", false)]),
    ]);
    let mut workflow =
        Workflow::new(sample_source(), doubles.capabilities(), &sandbox, limits(3))
            .expect("workflow");

    let err = workflow.run(|_| {}).unwrap_err();

    match err {
        EngineError::StaleRevision {
            stage,
            iteration,
            previous,
            proposed,
        } => {
            assert_eq!(stage, "debugger");
            assert_eq!(iteration, 1);
            assert_eq!((previous, proposed), (2, 2));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!workflow.store().is_frozen());
    assert!(!workflow.store().has(StateKey::FinalArtifact));
}

/// A sandbox timeout becomes a single failing entry, not an error.
#[test]
fn timeout_is_reported_as_failing_result() {
    let doubles = Doubles::with_debugger(ScriptedCapability::debugger_from(2, 1));
    let sandbox = ScriptedSandbox::new(vec![timed_out_execution()]);
    let mut workflow =
        Workflow::new(sample_source(), doubles.capabilities(), &sandbox, limits(1))
            .expect("workflow");

    let artifact = workflow.run(|_| {}).expect("run");

    assert_eq!(artifact.outcome, Outcome::Exhausted);
    assert_eq!(
        (
            artifact.results.total(),
            artifact.results.passed(),
            artifact.results.failed()
        ),
        (1, 0, 1)
    );
    assert_eq!(artifact.results.entries()[0].status, TestStatus::TimedOut);
    assert_eq!(artifact.last_exit_code, None);
}

/// Debugger failures are fatal and name the iteration they happened in.
#[test]
fn debugger_failure_is_fatal_with_iteration() {
    let doubles = Doubles::with_debugger(ScriptedCapability::failing("model offline"));
    let sandbox = ScriptedSandbox::new(vec![pytest_execution(&[("test_add", false)])]);
    let mut workflow =
        Workflow::new(sample_source(), doubles.capabilities(), &sandbox, limits(3))
            .expect("workflow");

    let err = workflow.run(|_| {}).unwrap_err();

    assert!(matches!(
        err,
        EngineError::CapabilityFailed {
            ref stage,
            iteration: Some(0),
            ..
        } if stage == "debugger"
    ));
    assert!(err.is_fatal());
}

/// A failing pipeline stage stops the run before any sandbox execution.
#[test]
fn pipeline_failure_stops_before_sandbox() {
    let mut doubles = Doubles::with_debugger(ScriptedCapability::debugger_from(2, 1));
    doubles.designer = ScriptedCapability::failing("planner unavailable");
    let sandbox = ScriptedSandbox::new(Vec::new());
    let mut workflow =
        Workflow::new(sample_source(), doubles.capabilities(), &sandbox, limits(3))
            .expect("workflow");

    let err = workflow.run(|_| {}).unwrap_err();

    assert_eq!(err.stage(), Some("designer"));
    assert_eq!(doubles.implementer.calls(), 0);
    assert!(sandbox.versions().is_empty());
    assert!(workflow.store().has(StateKey::AnalysisReport));
    assert!(!workflow.store().has(StateKey::ScenarioSet));
}

/// The store is frozen after finalization and its audit log records the
/// whole run in order.
#[test]
fn store_is_frozen_and_audited_after_run() {
    let doubles = Doubles::with_debugger(ScriptedCapability::debugger_from(2, 3));
    let sandbox = ScriptedSandbox::new(vec![
        pytest_execution(&[("test_add", false)]),
        pytest_execution(&[("test_add", true)]),
    ]);
    let mut workflow =
        Workflow::new(sample_source(), doubles.capabilities(), &sandbox, limits(3))
            .expect("workflow");

    let artifact = workflow.run(|_| {}).expect("run");
    let store = workflow.store();

    assert_eq!(artifact.outcome, Outcome::Passed);
    assert_eq!(artifact.iterations_used, 2);
    assert!(store.is_frozen());
    assert_eq!(store.writes_to(StateKey::SourceUnit), 1);
    assert_eq!(store.writes_to(StateKey::AnalysisReport), 1);
    assert_eq!(store.writes_to(StateKey::ScenarioSet), 1);
    assert_eq!(store.writes_to(StateKey::TestCode), 2);
    assert_eq!(store.writes_to(StateKey::ExecutionRecord), 2);
    assert_eq!(store.writes_to(StateKey::FinalArtifact), 1);

    let seqs: Vec<u64> = store.log().iter().map(|record| record.seq).collect();
    assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(store.log().last().map(|record| record.key), Some(StateKey::FinalArtifact));

    let dump = store.dump();
    assert!(dump.frozen);
    assert_eq!(dump.write_counter, store.write_counter());
}
