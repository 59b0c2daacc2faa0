//! Stage descriptors: one capability plus its declared inputs and outputs.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::capability::{CapabilityKind, GenerationCapability};
use crate::core::keys::{StateKey, join_keys};

/// The orchestration unit. A stage may only be invoked once every key in
/// `requires` is present, and must return exactly the keys in `produces`.
#[derive(Clone)]
pub struct Stage {
    name: String,
    requires: BTreeSet<StateKey>,
    produces: BTreeSet<StateKey>,
    capability: Arc<dyn GenerationCapability>,
}

impl Stage {
    /// Stage for one of the standard capability variants.
    pub fn new(kind: CapabilityKind, capability: Arc<dyn GenerationCapability>) -> Self {
        Self::custom(
            kind.as_str(),
            kind.requires().iter().copied(),
            kind.produces().iter().copied(),
            capability,
        )
    }

    pub fn custom(
        name: impl Into<String>,
        requires: impl IntoIterator<Item = StateKey>,
        produces: impl IntoIterator<Item = StateKey>,
        capability: Arc<dyn GenerationCapability>,
    ) -> Self {
        Self {
            name: name.into(),
            requires: requires.into_iter().collect(),
            produces: produces.into_iter().collect(),
            capability,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requires(&self) -> &BTreeSet<StateKey> {
        &self.requires
    }

    pub fn produces(&self) -> &BTreeSet<StateKey> {
        &self.produces
    }

    pub fn capability(&self) -> Arc<dyn GenerationCapability> {
        Arc::clone(&self.capability)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("requires", &join_keys(&self.requires))
            .field("produces", &join_keys(&self.produces))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{Produced, Snapshot};

    fn noop(_: &Snapshot) -> anyhow::Result<Produced> {
        Ok(Produced::new())
    }

    #[test]
    fn standard_stage_takes_kind_declarations() {
        let stage = Stage::new(CapabilityKind::Designer, Arc::new(noop));
        assert_eq!(stage.name(), "designer");
        assert_eq!(
            stage.requires().iter().copied().collect::<Vec<_>>(),
            vec![StateKey::SourceUnit, StateKey::AnalysisReport]
        );
        assert_eq!(
            stage.produces().iter().copied().collect::<Vec<_>>(),
            vec![StateKey::ScenarioSet]
        );
    }

    #[test]
    fn debug_output_lists_keys() {
        let stage = Stage::new(CapabilityKind::Analyzer, Arc::new(noop));
        let rendered = format!("{stage:?}");
        assert!(rendered.contains("requires: \"source_unit\""));
        assert!(rendered.contains("produces: \"analysis_report\""));
    }
}
