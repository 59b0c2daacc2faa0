//! Refinement loop states, legal transitions, and the DECIDE rule.
//!
//! ```text
//! Run    → Parse
//! Parse  → Decide
//! Decide → Debug | DonePass | DoneExhausted
//! Debug  → Run
//! ```
//! `DonePass` and `DoneExhausted` are terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::{ExecutionRecord, IterationState, Outcome, ResultReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Run,
    Parse,
    Decide,
    Debug,
    DonePass,
    DoneExhausted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::DonePass | LoopState::DoneExhausted)
    }

    /// Outcome carried by a terminal state.
    pub fn outcome(self) -> Option<Outcome> {
        match self {
            LoopState::DonePass => Some(Outcome::Passed),
            LoopState::DoneExhausted => Some(Outcome::Exhausted),
            _ => None,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Run => "RUN",
            LoopState::Parse => "PARSE",
            LoopState::Decide => "DECIDE",
            LoopState::Debug => "DEBUG",
            LoopState::DonePass => "DONE_PASS",
            LoopState::DoneExhausted => "DONE_EXHAUSTED",
        };
        f.write_str(name)
    }
}

pub fn is_legal_transition(from: LoopState, to: LoopState) -> bool {
    matches!(
        (from, to),
        (LoopState::Run, LoopState::Parse)
            | (LoopState::Parse, LoopState::Decide)
            | (LoopState::Decide, LoopState::Debug)
            | (LoopState::Decide, LoopState::DonePass)
            | (LoopState::Decide, LoopState::DoneExhausted)
            | (LoopState::Debug, LoopState::Run)
    )
}

/// A recorded state change, tagged with the 0-based iteration it happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: LoopState,
    pub to: LoopState,
    pub iteration: u32,
}

/// Result of evaluating the DECIDE state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Pass,
    Exhausted,
    /// Continue with a debug pass; carries the next iteration index.
    Retry { next: u32 },
}

impl Decision {
    pub fn next_state(self) -> LoopState {
        match self {
            Decision::Pass => LoopState::DonePass,
            Decision::Exhausted => LoopState::DoneExhausted,
            Decision::Retry { .. } => LoopState::Debug,
        }
    }
}

/// Decide whether the loop passes, stops on budget, or retries.
///
/// A run passes when the report has no failing entries and the runner itself
/// reported success. A report with zero tests from a crashed or failing runner
/// is not a pass. The budget check happens before incrementing, so
/// `current` never reaches `max`.
pub fn decide(
    report: &ResultReport,
    record: &ExecutionRecord,
    iteration: &IterationState,
) -> Decision {
    let green = report.failed() == 0 && (report.total() > 0 || record.succeeded());
    if green {
        return Decision::Pass;
    }
    if iteration.current + 1 >= iteration.max {
        return Decision::Exhausted;
    }
    Decision::Retry {
        next: iteration.current + 1,
    }
}
