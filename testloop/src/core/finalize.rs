//! Finalizer: turns the terminal loop state into the run's final artifact.

use tracing::{info, instrument};

use crate::core::decision::{LoopState, Transition};
use crate::core::keys::StateKey;
use crate::core::store::{Entry, StateStore};
use crate::core::types::{FinalArtifact, Outcome};
use crate::error::{EngineError, Result};

pub const STAGE_NAME: &str = "finalizer";

/// Build the final artifact from the store's terminal entries and write it,
/// freezing the store.
///
/// The artifact snapshots the latest TestCode and ResultReport, so an
/// exhausted run always reports the last iteration's code and results.
#[instrument(skip_all, fields(run_id = %run_id, terminal = %terminal))]
pub fn finalize(
    store: &mut StateStore,
    run_id: &str,
    terminal: LoopState,
    transitions: Vec<Transition>,
) -> Result<FinalArtifact> {
    let Some(outcome) = terminal.outcome() else {
        return Err(EngineError::ContractViolation {
            stage: STAGE_NAME.to_string(),
            detail: format!("cannot finalize from non-terminal state {terminal}"),
        });
    };

    let missing = store.missing(&[
        StateKey::SourceUnit,
        StateKey::TestCode,
        StateKey::ExecutionRecord,
        StateKey::ResultReport,
        StateKey::IterationState,
    ]);
    if !missing.is_empty() {
        return Err(EngineError::UnmetDependency {
            stage: STAGE_NAME.to_string(),
            missing,
        });
    }

    let iteration = *store.iteration_state()?;
    let results = store.result_report()?.clone();
    let record = store.execution_record()?;
    let failing_remaining = match outcome {
        Outcome::Passed => 0,
        Outcome::Exhausted => results.failed(),
    };

    let artifact = FinalArtifact {
        run_id: run_id.to_string(),
        source_id: store.source_unit()?.id.clone(),
        outcome,
        failing_remaining,
        iterations_used: iteration.iterations_used(),
        max_iterations: iteration.max,
        last_exec_status: record.status,
        last_exit_code: record.exit_code,
        test_code: store.test_code()?.clone(),
        results,
        transitions,
    };

    store.put(
        StateKey::FinalArtifact,
        Entry::FinalArtifact(Box::new(artifact.clone())),
    )?;
    info!(
        outcome = ?artifact.outcome,
        failing = artifact.failing_remaining,
        iterations = artifact.iterations_used,
        "final artifact written"
    );
    Ok(artifact)
}
