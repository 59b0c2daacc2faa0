//! Engine error taxonomy.
//!
//! Contract errors are integration bugs and abort the run. Capability and
//! sandbox infrastructure errors are fatal as well. Failing tests, timeouts
//! inside the sandbox, and unparsable runner output are not errors: they are
//! content of a `ResultReport`.

use std::time::Duration;

use thiserror::Error;

use crate::core::keys::{StateKey, join_keys};

/// Boxed source error from an adapter (capability backend, sandbox setup).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Engine result type.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// `get` on a key that has never been written.
    #[error("missing key '{key}'")]
    MissingKey { key: StateKey },

    /// Second write to a write-once entry.
    #[error("illegal overwrite of write-once key '{key}'")]
    IllegalOverwrite { key: StateKey },

    /// Write after the final artifact froze the store.
    #[error("store is frozen; rejected write to '{key}'")]
    StoreFrozen { key: StateKey },

    /// `put` with a value whose kind does not belong under the key.
    #[error("entry of kind '{found}' cannot be stored under '{key}'")]
    EntryKindMismatch { key: StateKey, found: StateKey },

    #[error("stage '{stage}' requires missing keys: {}", join_keys(.missing))]
    UnmetDependency {
        stage: String,
        missing: Vec<StateKey>,
    },

    #[error("stage '{stage}' violated its output contract: {detail}")]
    ContractViolation { stage: String, detail: String },

    #[error(
        "stage '{stage}' returned stale test code at iteration {iteration}: version {proposed} does not exceed {previous}"
    )]
    StaleRevision {
        stage: String,
        iteration: u32,
        previous: u32,
        proposed: u32,
    },

    #[error("stage '{stage}' timed out after {timeout:?}{}", iteration_suffix(.iteration))]
    CapabilityTimeout {
        stage: String,
        iteration: Option<u32>,
        timeout: Duration,
    },

    #[error("stage '{stage}' failed{}: {source}", iteration_suffix(.iteration))]
    CapabilityFailed {
        stage: String,
        iteration: Option<u32>,
        #[source]
        source: BoxError,
    },

    #[error("sandbox unavailable at iteration {iteration}: {source}")]
    SandboxUnavailable {
        iteration: u32,
        #[source]
        source: BoxError,
    },

    /// Runner output that could not be turned into a report. The refinement
    /// loop converts this into a failing report instead of propagating it.
    #[error("unparsable test results: {0}")]
    UnparsableResult(String),

    #[error("invalid limits: {0}")]
    InvalidLimits(String),
}

impl EngineError {
    /// Programming or integration bugs in a stage or capability.
    pub fn is_contract_error(&self) -> bool {
        matches!(
            self,
            EngineError::MissingKey { .. }
                | EngineError::IllegalOverwrite { .. }
                | EngineError::StoreFrozen { .. }
                | EngineError::EntryKindMismatch { .. }
                | EngineError::UnmetDependency { .. }
                | EngineError::ContractViolation { .. }
                | EngineError::StaleRevision { .. }
        )
    }

    /// Errors that abort a run. Unparsable output is folded into a failing
    /// report by the refinement loop and never reaches the caller.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::UnparsableResult(_))
    }

    /// Stage name attached to the error, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            EngineError::UnmetDependency { stage, .. }
            | EngineError::ContractViolation { stage, .. }
            | EngineError::StaleRevision { stage, .. }
            | EngineError::CapabilityTimeout { stage, .. }
            | EngineError::CapabilityFailed { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Attach the loop iteration index to capability errors raised inside the loop.
    pub(crate) fn at_iteration(self, index: u32) -> Self {
        match self {
            EngineError::CapabilityTimeout {
                stage,
                iteration: None,
                timeout,
            } => EngineError::CapabilityTimeout {
                stage,
                iteration: Some(index),
                timeout,
            },
            EngineError::CapabilityFailed {
                stage,
                iteration: None,
                source,
            } => EngineError::CapabilityFailed {
                stage,
                iteration: Some(index),
                source,
            },
            other => other,
        }
    }
}

fn iteration_suffix(iteration: &Option<u32>) -> String {
    match iteration {
        Some(index) => format!(" at iteration {index}"),
        None => String::new(),
    }
}
