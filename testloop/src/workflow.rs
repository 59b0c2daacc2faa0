//! End-to-end run: seed the store, run the generation pipeline, refine, and
//! finalize.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};
use tracing::{error, info, instrument};

use crate::capability::{CapabilityKind, GenerationCapability};
use crate::core::finalize::finalize;
use crate::core::keys::StateKey;
use crate::core::store::{Entry, StateStore};
use crate::core::types::{FinalArtifact, Limits, SourceUnit};
use crate::error::Result;
use crate::io::sandbox::Sandbox;
use crate::pipeline::Pipeline;
use crate::refine::{IterationRecord, run_refinement};
use crate::stage::Stage;

/// The four capabilities a standard run is built from.
#[derive(Clone)]
pub struct Capabilities {
    pub analyzer: Arc<dyn GenerationCapability>,
    pub designer: Arc<dyn GenerationCapability>,
    pub implementer: Arc<dyn GenerationCapability>,
    pub debugger: Arc<dyn GenerationCapability>,
}

/// A single run over one source unit. The store is owned by the run and
/// frozen once the final artifact is written.
pub struct Workflow<'a, S: Sandbox + ?Sized> {
    store: StateStore,
    run_id: String,
    pipeline: Pipeline,
    debugger: Stage,
    sandbox: &'a S,
    limits: Limits,
}

impl<'a, S: Sandbox + ?Sized> Workflow<'a, S> {
    /// Create a run and write the SourceUnit.
    pub fn new(
        source: SourceUnit,
        capabilities: Capabilities,
        sandbox: &'a S,
        limits: Limits,
    ) -> Result<Self> {
        let run_id = new_run_id(&source);
        let mut store = StateStore::new();
        store.put(StateKey::SourceUnit, Entry::SourceUnit(source))?;
        Ok(Self {
            store,
            run_id,
            pipeline: Pipeline::standard(
                capabilities.analyzer,
                capabilities.designer,
                capabilities.implementer,
                limits.capability_timeout,
            ),
            debugger: Stage::new(CapabilityKind::Debugger, capabilities.debugger),
            sandbox,
            limits,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run to completion. Fatal errors leave the store unfrozen so the
    /// partial state can still be inspected.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn run<F>(&mut self, on_iteration: F) -> Result<FinalArtifact>
    where
        F: FnMut(&IterationRecord<'_>),
    {
        let result = self.run_inner(on_iteration);
        if let Err(err) = &result {
            error!(err = %err, stage = ?err.stage(), "run aborted");
        }
        result
    }

    fn run_inner<F>(&mut self, on_iteration: F) -> Result<FinalArtifact>
    where
        F: FnMut(&IterationRecord<'_>),
    {
        info!("running generation pipeline");
        self.pipeline.run(&mut self.store)?;

        let outcome = run_refinement(
            &mut self.store,
            self.sandbox,
            &self.debugger,
            &self.limits,
            on_iteration,
        )?;

        let artifact = finalize(
            &mut self.store,
            &self.run_id,
            outcome.terminal,
            outcome.transitions,
        )?;
        info!(summary = %artifact.summary(), "run finished");
        Ok(artifact)
    }
}

/// Fresh id for one run over `source`. Two runs never share an id, even on
/// the same text within the same second.
pub fn new_run_id(source: &SourceUnit) -> String {
    build_run_id(&generate_timestamp(), &source_digest(source), &generate_short_id())
}

/// `run-<timestamp>-<digest>-<short id>`.
pub fn build_run_id(timestamp: &str, digest: &str, short_id: &str) -> String {
    format!("run-{timestamp}-{digest}-{short_id}")
}

/// First 8 hex digits of the SHA-256 of the source text.
pub fn source_digest(source: &SourceUnit) -> String {
    let digest = Sha256::digest(source.text.as_bytes());
    hex::encode(&digest[..4])
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}
