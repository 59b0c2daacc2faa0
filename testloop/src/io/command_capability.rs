//! Generation capability backed by an external command.
//!
//! The command receives `{"stage": ..., "source_module": ..., "snapshot": {...}}`
//! as JSON on stdin and must print `{"entries": [{"kind": ..., "value": ...}]}` on stdout and
//! exit 0. Output is validated against the embedded schema before it is
//! deserialized. `source_module` is the module name the sandbox gives the
//! source unit, so generated tests can import it.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::capability::GenerationCapability;
use crate::core::store::{Entry, Produced, Snapshot};
use crate::io::process::run_command_with_timeout;

const PRODUCED_SCHEMA: &str = include_str!("../../schemas/produced.schema.json");

#[derive(Debug, Serialize)]
struct CapabilityRequest<'a> {
    stage: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_module: Option<&'a str>,
    snapshot: &'a Snapshot,
}

#[derive(Debug, Deserialize)]
struct CapabilityResponse {
    entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
pub struct CommandCapability {
    stage: String,
    argv: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    source_module: Option<String>,
}

impl CommandCapability {
    /// `timeout` bounds the child process itself; it is killed when it expires.
    pub fn new(
        stage: impl Into<String>,
        argv: Vec<String>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<Self> {
        let stage = stage.into();
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            bail!("no command configured for capability '{stage}'");
        }
        Ok(Self {
            stage,
            argv,
            timeout,
            output_limit_bytes,
            source_module: None,
        })
    }

    /// Module name generated tests must import the source unit under.
    pub fn with_source_module(mut self, module: impl Into<String>) -> Self {
        self.source_module = Some(module.into());
        self
    }
}

impl GenerationCapability for CommandCapability {
    #[instrument(skip_all, fields(stage = %self.stage))]
    fn invoke(&self, snapshot: &Snapshot) -> Result<Produced> {
        let request = serde_json::to_vec(&CapabilityRequest {
            stage: &self.stage,
            source_module: self.source_module.as_deref(),
            snapshot,
        })
        .context("serialize capability request")?;

        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("capability command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        let output = run_command_with_timeout(
            cmd,
            Some(&request),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run capability command {program}"))?;
        if output.timed_out {
            bail!("capability command {program} killed after {:?}", self.timeout);
        }
        if !output.status.success() {
            bail!(
                "capability command {program} exited with {}: {}",
                output.status,
                output.stderr_text().trim()
            );
        }
        if output.stdout_truncated > 0 {
            bail!(
                "capability output exceeded {} bytes",
                self.output_limit_bytes
            );
        }
        debug!(bytes = output.stdout.len(), "capability command finished");
        parse_produced(&output.stdout_text())
    }
}

/// Validate and decode capability stdout.
pub fn parse_produced(raw: &str) -> Result<Produced> {
    let value: Value = serde_json::from_str(raw.trim()).context("parse capability output json")?;
    validate_schema(&value)?;
    let response: CapabilityResponse =
        serde_json::from_value(value).context("deserialize capability output")?;

    let mut produced = Produced::new();
    for entry in response.entries {
        let key = entry.key();
        if produced.insert(key, entry).is_some() {
            bail!("capability output repeats key '{key}'");
        }
    }
    Ok(produced)
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PRODUCED_SCHEMA).context("parse output schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile output schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!(
            "capability output failed schema validation:\n- {}",
            messages.join("\n- ")
        );
    }
    Ok(())
}
