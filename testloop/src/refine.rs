//! Refinement loop controller.
//!
//! Drives `RUN → PARSE → DECIDE → (DEBUG → RUN)*` until the tests pass or the
//! iteration budget runs out. Every state change is checked against the
//! transition table and recorded. The loop terminates in at most
//! `max_iterations` sandbox executions.

use tracing::{debug, error, info, instrument, warn};

use crate::core::decision::{Decision, LoopState, Transition, decide, is_legal_transition};
use crate::core::keys::StateKey;
use crate::core::parser;
use crate::core::store::{Entry, StateStore};
use crate::core::types::{
    ExecutionRecord, IterationState, Limits, ResultReport, TestCode, TestStatus,
};
use crate::error::{EngineError, Result};
use crate::io::sandbox::Sandbox;
use crate::pipeline::{commit, invoke_stage};
use crate::stage::Stage;

pub const STAGE_NAME: &str = "refinement_loop";

/// Scenario name of the entry synthesized for runner output the parser rejects.
pub const UNPARSABLE_SCENARIO: &str = "<unparsable>";

/// One completed RUN → PARSE → DECIDE pass, reported to the loop observer.
#[derive(Debug)]
pub struct IterationRecord<'a> {
    /// 0-based iteration index.
    pub index: u32,
    pub test_code: &'a TestCode,
    pub execution: &'a ExecutionRecord,
    pub report: &'a ResultReport,
    pub decision: Decision,
}

/// How the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub terminal: LoopState,
    pub iteration: IterationState,
    pub transitions: Vec<Transition>,
}

/// Records transitions and refuses any the table does not allow.
#[derive(Debug, Default)]
struct TransitionLog {
    state: Option<LoopState>,
    entries: Vec<Transition>,
}

impl TransitionLog {
    fn enter(&mut self, to: LoopState, iteration: u32) -> Result<()> {
        if let Some(from) = self.state {
            if !is_legal_transition(from, to) {
                return Err(EngineError::ContractViolation {
                    stage: STAGE_NAME.to_string(),
                    detail: format!("illegal transition {from} -> {to} at iteration {iteration}"),
                });
            }
            debug!(%from, %to, iteration, "transition");
            self.entries.push(Transition {
                from,
                to,
                iteration,
            });
        }
        self.state = Some(to);
        Ok(())
    }
}

/// Run the refinement loop over the store's current TestCode.
///
/// Requires SourceUnit and TestCode. `on_iteration` is called once per
/// completed DECIDE, before any debug pass.
#[instrument(skip_all, fields(max_iterations = limits.max_iterations))]
pub fn run_refinement<S, F>(
    store: &mut StateStore,
    sandbox: &S,
    debugger: &Stage,
    limits: &Limits,
    mut on_iteration: F,
) -> Result<LoopOutcome>
where
    S: Sandbox + ?Sized,
    F: FnMut(&IterationRecord<'_>),
{
    let missing = store.missing(&[StateKey::SourceUnit, StateKey::TestCode]);
    if !missing.is_empty() {
        return Err(EngineError::UnmetDependency {
            stage: STAGE_NAME.to_string(),
            missing,
        });
    }
    if !debugger.produces().contains(&StateKey::TestCode) {
        return Err(EngineError::ContractViolation {
            stage: debugger.name().to_string(),
            detail: "a debugger stage must produce test_code".to_string(),
        });
    }

    let mut iteration = IterationState::start(limits.max_iterations);
    store.put(StateKey::IterationState, Entry::IterationState(iteration))?;

    let mut log = TransitionLog::default();
    log.enter(LoopState::Run, iteration.current)?;

    loop {
        let index = iteration.current;

        // RUN
        let record = {
            let source = store.source_unit()?;
            let test_code = store.test_code()?;
            info!(iteration = index, version = test_code.version, "running test code");
            sandbox
                .run(source, test_code, limits.sandbox_timeout)
                .map_err(|err| {
                    error!(iteration = index, err = %format!("{err:#}"), "sandbox unavailable");
                    EngineError::SandboxUnavailable {
                        iteration: index,
                        source: err.into(),
                    }
                })?
        };
        store.put(StateKey::ExecutionRecord, Entry::ExecutionRecord(record))?;
        log.enter(LoopState::Parse, index)?;

        // PARSE
        let report = match parser::parse(store.execution_record()?) {
            Ok(report) => report,
            Err(EngineError::UnparsableResult(detail)) => {
                warn!(iteration = index, %detail, "runner output unparsable");
                ResultReport::single_failure(UNPARSABLE_SCENARIO, TestStatus::Error, detail)
            }
            Err(other) => return Err(other),
        };
        store.put(StateKey::ResultReport, Entry::ResultReport(report))?;
        log.enter(LoopState::Decide, index)?;

        // DECIDE
        let decision = decide(
            store.result_report()?,
            store.execution_record()?,
            &iteration,
        );
        on_iteration(&IterationRecord {
            index,
            test_code: store.test_code()?,
            execution: store.execution_record()?,
            report: store.result_report()?,
            decision,
        });
        let next = decision.next_state();
        {
            let report = store.result_report()?;
            info!(
                iteration = index,
                total = report.total(),
                failed = report.failed(),
                next = %next,
                "decided"
            );
        }
        log.enter(next, index)?;

        match decision {
            Decision::Pass | Decision::Exhausted => {
                iteration.terminal = true;
                store.put(StateKey::IterationState, Entry::IterationState(iteration))?;
                return Ok(LoopOutcome {
                    terminal: next,
                    iteration,
                    transitions: log.entries,
                });
            }
            Decision::Retry { next: next_index } => {
                iteration.current = next_index;
                store.put(StateKey::IterationState, Entry::IterationState(iteration))?;
            }
        }

        // DEBUG
        let previous = store.test_code()?.version;
        let produced = invoke_stage(debugger, store, limits.capability_timeout)
            .map_err(|err| err.at_iteration(index))?;
        if let Some(Entry::TestCode(proposed)) = produced.get(&StateKey::TestCode) {
            if proposed.version <= previous {
                return Err(EngineError::StaleRevision {
                    stage: debugger.name().to_string(),
                    iteration: index,
                    previous,
                    proposed: proposed.version,
                });
            }
        }
        commit(debugger, store, produced)?;
        log.enter(LoopState::Run, iteration.current)?;
    }
}
