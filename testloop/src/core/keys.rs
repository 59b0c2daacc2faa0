//! Names of the entries held by the state store.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of keys a workflow run reads and writes.
///
/// Ordering follows the data flow of a run so that ordered collections of keys
/// (missing-key reports, dumps) read in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    SourceUnit,
    AnalysisReport,
    ScenarioSet,
    TestCode,
    ExecutionRecord,
    ResultReport,
    IterationState,
    FinalArtifact,
}

impl StateKey {
    pub const ALL: [StateKey; 8] = [
        StateKey::SourceUnit,
        StateKey::AnalysisReport,
        StateKey::ScenarioSet,
        StateKey::TestCode,
        StateKey::ExecutionRecord,
        StateKey::ResultReport,
        StateKey::IterationState,
        StateKey::FinalArtifact,
    ];

    /// Entries that may be written exactly once per run.
    ///
    /// `FinalArtifact` is not listed: writing it freezes the whole store, which
    /// rejects any second write anyway.
    pub fn is_write_once(self) -> bool {
        matches!(
            self,
            StateKey::SourceUnit | StateKey::AnalysisReport | StateKey::ScenarioSet
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StateKey::SourceUnit => "source_unit",
            StateKey::AnalysisReport => "analysis_report",
            StateKey::ScenarioSet => "scenario_set",
            StateKey::TestCode => "test_code",
            StateKey::ExecutionRecord => "execution_record",
            StateKey::ResultReport => "result_report",
            StateKey::IterationState => "iteration_state",
            StateKey::FinalArtifact => "final_artifact",
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a list of keys as `a, b, c` for error messages.
pub fn join_keys<'a, I: IntoIterator<Item = &'a StateKey>>(keys: I) -> String {
    keys.into_iter()
        .map(|key| key.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_inputs_and_plans_are_write_once() {
        let once: Vec<StateKey> = StateKey::ALL
            .into_iter()
            .filter(|key| key.is_write_once())
            .collect();
        assert_eq!(
            once,
            vec![
                StateKey::SourceUnit,
                StateKey::AnalysisReport,
                StateKey::ScenarioSet
            ]
        );
    }

    #[test]
    fn serde_name_matches_display() {
        for key in StateKey::ALL {
            let json = serde_json::to_string(&key).expect("serialize");
            assert_eq!(json, format!("\"{key}\""));
        }
    }
}
