//! Pipeline orchestrator: a dependency-checked sequencer of stages.
//!
//! The orchestrator performs no business logic. For each stage it checks that
//! the declared inputs exist, hands the capability a snapshot restricted to
//! those inputs, validates the returned keys against the declared outputs, and
//! only then writes them to the store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::capability::{CapabilityKind, GenerationCapability, invoke_with_timeout};
use crate::core::keys::{StateKey, join_keys};
use crate::core::store::{Produced, StateStore};
use crate::error::{EngineError, Result};
use crate::stage::Stage;

#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    capability_timeout: Duration,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>, capability_timeout: Duration) -> Self {
        Self {
            stages,
            capability_timeout,
        }
    }

    /// Analyzer → Designer → Implementer.
    pub fn standard(
        analyzer: Arc<dyn GenerationCapability>,
        designer: Arc<dyn GenerationCapability>,
        implementer: Arc<dyn GenerationCapability>,
        capability_timeout: Duration,
    ) -> Self {
        Self::new(
            vec![
                Stage::new(CapabilityKind::Analyzer, analyzer),
                Stage::new(CapabilityKind::Designer, designer),
                Stage::new(CapabilityKind::Implementer, implementer),
            ],
            capability_timeout,
        )
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run every stage in order, stopping at the first error.
    pub fn run(&self, store: &mut StateStore) -> Result<()> {
        for stage in &self.stages {
            run_stage(stage, store, self.capability_timeout)?;
        }
        Ok(())
    }
}

/// Check dependencies, invoke, validate, and commit one stage.
pub fn run_stage(stage: &Stage, store: &mut StateStore, timeout: Duration) -> Result<()> {
    let produced = invoke_stage(stage, store, timeout)?;
    commit(stage, store, produced)
}

/// Check dependencies, invoke the capability, and validate its output without
/// writing anything.
///
/// When a required key is missing the capability is never invoked.
#[instrument(skip_all, fields(stage = %stage.name()))]
pub fn invoke_stage(stage: &Stage, store: &StateStore, timeout: Duration) -> Result<Produced> {
    let missing = store.missing(stage.requires());
    if !missing.is_empty() {
        warn!(missing = %join_keys(&missing), "unmet dependencies");
        return Err(EngineError::UnmetDependency {
            stage: stage.name().to_string(),
            missing,
        });
    }

    let snapshot = store.snapshot(stage.requires())?;
    info!(requires = %join_keys(stage.requires()), "invoking stage");
    let produced = invoke_with_timeout(stage.capability(), snapshot, stage.name(), timeout)?;
    validate_produced(stage, &produced)?;
    Ok(produced)
}

/// Write validated stage output to the store.
///
/// Write-once conflicts are checked for every key before the first write, so
/// a rejected commit leaves the store untouched.
pub fn commit(stage: &Stage, store: &mut StateStore, produced: Produced) -> Result<()> {
    if let Some(key) = produced
        .keys()
        .find(|key| key.is_write_once() && store.has(**key))
    {
        return Err(EngineError::IllegalOverwrite { key: *key });
    }
    for (key, entry) in produced {
        let seq = store.put(key, entry)?;
        info!(stage = %stage.name(), %key, seq, "stage output written");
    }
    Ok(())
}

fn validate_produced(stage: &Stage, produced: &Produced) -> Result<()> {
    let returned: BTreeSet<StateKey> = produced.keys().copied().collect();
    let undeclared: Vec<StateKey> = returned.difference(stage.produces()).copied().collect();
    let omitted: Vec<StateKey> = stage.produces().difference(&returned).copied().collect();

    let mut problems = Vec::new();
    if !undeclared.is_empty() {
        problems.push(format!("returned undeclared keys: {}", join_keys(&undeclared)));
    }
    if !omitted.is_empty() {
        problems.push(format!("omitted declared keys: {}", join_keys(&omitted)));
    }
    for (key, entry) in produced {
        if entry.key() != *key {
            problems.push(format!("returned a {} entry under '{key}'", entry.key()));
        }
    }

    if problems.is_empty() {
        return Ok(());
    }
    Err(EngineError::ContractViolation {
        stage: stage.name().to_string(),
        detail: problems.join("; "),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::Entry;
    use crate::core::types::{AnalysisReport, ScenarioSet};
    use crate::test_support::{
        ScriptedCapability, analysis_report, sample_source, scenario_set, seeded_store,
        test_code,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn standard_with(
        analyzer: &ScriptedCapability,
        designer: &ScriptedCapability,
        implementer: &ScriptedCapability,
    ) -> Pipeline {
        Pipeline::standard(
            analyzer.handle(),
            designer.handle(),
            implementer.handle(),
            TIMEOUT,
        )
    }

    #[test]
    fn standard_pipeline_writes_each_stage_output_in_order() {
        let analyzer = ScriptedCapability::returning(vec![analysis_report()]);
        let designer = ScriptedCapability::returning(vec![scenario_set()]);
        let implementer = ScriptedCapability::returning(vec![Entry::TestCode(test_code(1))]);
        let mut store = seeded_store();

        standard_with(&analyzer, &designer, &implementer)
            .run(&mut store)
            .expect("pipeline");

        assert!(store.has(StateKey::AnalysisReport));
        assert!(store.has(StateKey::ScenarioSet));
        assert_eq!(store.test_code().expect("test code").version, 1);
        let keys: Vec<StateKey> = store.log().iter().map(|record| record.key).collect();
        assert_eq!(
            keys,
            vec![
                StateKey::SourceUnit,
                StateKey::AnalysisReport,
                StateKey::ScenarioSet,
                StateKey::TestCode
            ]
        );
    }

    #[test]
    fn snapshot_contains_only_required_keys() {
        let analyzer = ScriptedCapability::returning(vec![analysis_report()]);
        let designer = ScriptedCapability::returning(vec![scenario_set()]);
        let implementer = ScriptedCapability::returning(vec![Entry::TestCode(test_code(1))]);
        let mut store = seeded_store();

        standard_with(&analyzer, &designer, &implementer)
            .run(&mut store)
            .expect("pipeline");

        assert_eq!(analyzer.seen_keys(), vec![vec![StateKey::SourceUnit]]);
        assert_eq!(
            designer.seen_keys(),
            vec![vec![StateKey::SourceUnit, StateKey::AnalysisReport]]
        );
        assert_eq!(
            implementer.seen_keys(),
            vec![vec![
                StateKey::SourceUnit,
                StateKey::AnalysisReport,
                StateKey::ScenarioSet
            ]]
        );
    }

    #[test]
    fn unmet_dependency_skips_invocation() {
        let designer = ScriptedCapability::returning(vec![scenario_set()]);
        let stage = Stage::new(CapabilityKind::Designer, designer.handle());
        let mut store = seeded_store();

        let err = run_stage(&stage, &mut store, TIMEOUT).unwrap_err();
        match err {
            EngineError::UnmetDependency { stage, missing } => {
                assert_eq!(stage, "designer");
                assert_eq!(missing, vec![StateKey::AnalysisReport]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(designer.calls(), 0);
        assert_eq!(store.write_counter(), 1);
    }

    #[test]
    fn undeclared_key_is_contract_violation() {
        let analyzer = ScriptedCapability::returning_many(vec![vec![
            analysis_report(),
            Entry::ScenarioSet(ScenarioSet::default()),
        ]]);
        let stage = Stage::new(CapabilityKind::Analyzer, analyzer.handle());
        let mut store = seeded_store();

        let err = run_stage(&stage, &mut store, TIMEOUT).unwrap_err();
        match err {
            EngineError::ContractViolation { detail, .. } => {
                assert!(detail.contains("undeclared keys: scenario_set"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!store.has(StateKey::AnalysisReport));
        assert!(!store.has(StateKey::ScenarioSet));
    }

    #[test]
    fn omitted_key_is_contract_violation() {
        let analyzer = ScriptedCapability::returning_many(vec![Vec::new()]);
        let stage = Stage::new(CapabilityKind::Analyzer, analyzer.handle());
        let mut store = seeded_store();

        let err = run_stage(&stage, &mut store, TIMEOUT).unwrap_err();
        match err {
            EngineError::ContractViolation { detail, .. } => {
                assert!(detail.contains("omitted declared keys: analysis_report"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn mislabelled_entry_is_contract_violation() {
        let capability = |_: &crate::core::store::Snapshot| -> anyhow::Result<Produced> {
            Ok(Produced::from([(
                StateKey::AnalysisReport,
                Entry::ScenarioSet(ScenarioSet::default()),
            )]))
        };
        let stage = Stage::new(CapabilityKind::Analyzer, Arc::new(capability));
        let mut store = seeded_store();

        let err = run_stage(&stage, &mut store, TIMEOUT).unwrap_err();
        assert!(err.is_contract_error());
        assert!(err.to_string().contains("scenario_set entry under 'analysis_report'"));
    }

    #[test]
    fn rerunning_write_once_stage_is_illegal_overwrite() {
        let analyzer =
            ScriptedCapability::returning(vec![analysis_report(), analysis_report()]);
        let stage = Stage::new(CapabilityKind::Analyzer, analyzer.handle());
        let mut store = seeded_store();

        run_stage(&stage, &mut store, TIMEOUT).expect("first run");
        let err = run_stage(&stage, &mut store, TIMEOUT).unwrap_err();
        assert!(matches!(
            err,
            EngineError::IllegalOverwrite {
                key: StateKey::AnalysisReport
            }
        ));
        assert_eq!(store.writes_to(StateKey::AnalysisReport), 1);
    }

    #[test]
    fn failing_stage_stops_the_pipeline() {
        let analyzer = ScriptedCapability::failing("analysis backend down");
        let designer = ScriptedCapability::returning(vec![scenario_set()]);
        let implementer = ScriptedCapability::returning(vec![Entry::TestCode(test_code(1))]);
        let mut store = seeded_store();

        let err = standard_with(&analyzer, &designer, &implementer)
            .run(&mut store)
            .unwrap_err();
        assert_eq!(err.stage(), Some("analyzer"));
        assert_eq!(designer.calls(), 0);
        assert_eq!(implementer.calls(), 0);
    }

    #[test]
    fn custom_stage_declarations_are_enforced() {
        let capability = |snapshot: &crate::core::store::Snapshot| -> anyhow::Result<Produced> {
            let source = snapshot.source_unit()?;
            Ok(Produced::from([(
                StateKey::AnalysisReport,
                Entry::AnalysisReport(AnalysisReport {
                    findings: vec![crate::core::types::Finding {
                        symbol: source.id.clone(),
                        kind: "module".to_string(),
                        signature: String::new(),
                    }],
                }),
            )]))
        };
        let stage = Stage::custom(
            "module-scan",
            [StateKey::SourceUnit],
            [StateKey::AnalysisReport],
            Arc::new(capability),
        );
        let mut store = StateStore::new();
        store
            .put(StateKey::SourceUnit, Entry::SourceUnit(sample_source()))
            .expect("source");

        run_stage(&stage, &mut store, TIMEOUT).expect("custom stage");
        let dump = store.dump();
        assert_eq!(dump.entries[&StateKey::AnalysisReport].writes, 1);
    }
}
