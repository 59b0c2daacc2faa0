//! Generation capability abstraction.
//!
//! The [`GenerationCapability`] trait decouples the orchestrator from how any
//! stage produces its output (an LLM agent, an external command, a scripted
//! test double). The four pipeline variants differ only in the keys they read
//! and write, which [`CapabilityKind`] declares.

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::keys::StateKey;
use crate::core::store::{Produced, Snapshot};
use crate::error::{EngineError, Result};

/// Pluggable logic mapping a state snapshot to new state entries.
///
/// Implementations may block (network calls, child processes); the engine
/// always invokes them on a worker thread bounded by a timeout.
pub trait GenerationCapability: Send + Sync {
    fn invoke(&self, snapshot: &Snapshot) -> anyhow::Result<Produced>;
}

impl<F> GenerationCapability for F
where
    F: Fn(&Snapshot) -> anyhow::Result<Produced> + Send + Sync,
{
    fn invoke(&self, snapshot: &Snapshot) -> anyhow::Result<Produced> {
        self(snapshot)
    }
}

/// The closed set of capability variants used by the standard pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Analyzer,
    Designer,
    Implementer,
    Debugger,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 4] = [
        CapabilityKind::Analyzer,
        CapabilityKind::Designer,
        CapabilityKind::Implementer,
        CapabilityKind::Debugger,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityKind::Analyzer => "analyzer",
            CapabilityKind::Designer => "designer",
            CapabilityKind::Implementer => "implementer",
            CapabilityKind::Debugger => "debugger",
        }
    }

    pub fn requires(self) -> &'static [StateKey] {
        match self {
            CapabilityKind::Analyzer => &[StateKey::SourceUnit],
            CapabilityKind::Designer => &[StateKey::SourceUnit, StateKey::AnalysisReport],
            CapabilityKind::Implementer => &[
                StateKey::SourceUnit,
                StateKey::AnalysisReport,
                StateKey::ScenarioSet,
            ],
            CapabilityKind::Debugger => &[
                StateKey::SourceUnit,
                StateKey::TestCode,
                StateKey::ResultReport,
            ],
        }
    }

    pub fn produces(self) -> &'static [StateKey] {
        match self {
            CapabilityKind::Analyzer => &[StateKey::AnalysisReport],
            CapabilityKind::Designer => &[StateKey::ScenarioSet],
            CapabilityKind::Implementer | CapabilityKind::Debugger => &[StateKey::TestCode],
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoke `capability` on a worker thread and wait at most `timeout`.
///
/// On timeout the worker is detached and its eventual result discarded; the
/// caller gets [`EngineError::CapabilityTimeout`]. A panicking capability is
/// reported as [`EngineError::CapabilityFailed`].
#[instrument(skip(capability, snapshot), fields(timeout_ms = timeout.as_millis() as u64))]
pub fn invoke_with_timeout(
    capability: Arc<dyn GenerationCapability>,
    snapshot: Snapshot,
    stage: &str,
    timeout: Duration,
) -> Result<Produced> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("capability-{stage}"))
        .spawn(move || {
            let result = capability.invoke(&snapshot);
            // The receiver is gone when the caller already timed out.
            let _ = tx.send(result);
        })
        .map_err(|err| EngineError::CapabilityFailed {
            stage: stage.to_string(),
            iteration: None,
            source: Box::new(err),
        })?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(produced)) => {
            debug!(keys = produced.len(), "capability returned");
            Ok(produced)
        }
        Ok(Err(err)) => {
            warn!(err = %format!("{err:#}"), "capability failed");
            Err(EngineError::CapabilityFailed {
                stage: stage.to_string(),
                iteration: None,
                source: err.into(),
            })
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!("capability timed out");
            Err(EngineError::CapabilityTimeout {
                stage: stage.to_string(),
                iteration: None,
                timeout,
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(EngineError::CapabilityFailed {
            stage: stage.to_string(),
            iteration: None,
            source: "capability worker exited without a result (panicked)".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::Entry;
    use crate::core::types::AnalysisReport;
    use anyhow::anyhow;

    fn analysis_only(_: &Snapshot) -> anyhow::Result<Produced> {
        Ok(Produced::from([(
            StateKey::AnalysisReport,
            Entry::AnalysisReport(AnalysisReport::default()),
        )]))
    }

    #[test]
    fn returns_capability_output() {
        let produced = invoke_with_timeout(
            Arc::new(analysis_only),
            Snapshot::default(),
            "analyzer",
            Duration::from_secs(5),
        )
        .expect("invoke");
        assert!(produced.contains_key(&StateKey::AnalysisReport));
    }

    #[test]
    fn slow_capability_times_out() {
        let slow = |_: &Snapshot| -> anyhow::Result<Produced> {
            thread::sleep(Duration::from_millis(500));
            Ok(Produced::new())
        };
        let err = invoke_with_timeout(
            Arc::new(slow),
            Snapshot::default(),
            "designer",
            Duration::from_millis(20),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapabilityTimeout { ref stage, iteration: None, .. } if stage == "designer"
        ));
    }

    #[test]
    fn capability_error_is_wrapped_with_stage() {
        let failing = |_: &Snapshot| -> anyhow::Result<Produced> { Err(anyhow!("model offline")) };
        let err = invoke_with_timeout(
            Arc::new(failing),
            Snapshot::default(),
            "implementer",
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "stage 'implementer' failed: model offline");
    }

    #[test]
    fn panicking_capability_is_a_failure() {
        let panicking = |_: &Snapshot| -> anyhow::Result<Produced> { panic!("bug in capability") };
        let err = invoke_with_timeout(
            Arc::new(panicking),
            Snapshot::default(),
            "debugger",
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::CapabilityFailed { .. }));
    }

    #[test]
    fn debugger_reads_results_and_rewrites_test_code() {
        assert!(
            CapabilityKind::Debugger
                .requires()
                .contains(&StateKey::ResultReport)
        );
        assert_eq!(CapabilityKind::Debugger.produces(), &[StateKey::TestCode]);
    }
}
