//! Engine configuration stored as TOML (default `testloop.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{
    DEFAULT_CAPABILITY_TIMEOUT, DEFAULT_MAX_ITERATIONS, DEFAULT_SANDBOX_TIMEOUT, Limits,
};

pub const DEFAULT_CONFIG_FILE: &str = "testloop.toml";

/// Engine configuration (TOML).
///
/// Edited by humans; missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Refinement loop iteration cap.
    pub max_iterations: u32,

    /// Timeout for a single capability invocation in seconds.
    pub capability_timeout_secs: u64,

    /// Wall-clock timeout for one sandboxed test run in seconds.
    pub sandbox_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    pub sandbox: SandboxConfig,

    pub capabilities: CapabilityCommands,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Test runner argv; the test file name is appended.
    pub command: Vec<String>,
    pub source_file: String,
    pub test_file: String,
}

impl SandboxConfig {
    /// Importable module name of the source file (`source_under_test.py` → `source_under_test`).
    pub fn source_module(&self) -> &str {
        self.source_file.strip_suffix(".py").unwrap_or(&self.source_file)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: ["python3", "-m", "pytest", "-v"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            source_file: "source_under_test.py".to_string(),
            test_file: "test_generated.py".to_string(),
        }
    }
}

/// External commands backing each capability. Empty means unconfigured.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CapabilityCommands {
    pub analyzer: Vec<String>,
    pub designer: Vec<String>,
    pub implementer: Vec<String>,
    pub debugger: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            capability_timeout_secs: DEFAULT_CAPABILITY_TIMEOUT.as_secs(),
            sandbox_timeout_secs: DEFAULT_SANDBOX_TIMEOUT.as_secs(),
            output_limit_bytes: 100_000,
            sandbox: SandboxConfig::default(),
            capabilities: CapabilityCommands::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be >= 1"));
        }
        if self.capability_timeout_secs == 0 {
            return Err(anyhow!("capability_timeout_secs must be > 0"));
        }
        if self.sandbox_timeout_secs == 0 {
            return Err(anyhow!("sandbox_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.sandbox.command.is_empty() || self.sandbox.command[0].trim().is_empty() {
            return Err(anyhow!("sandbox.command must be a non-empty array"));
        }
        validate_file_name("sandbox.source_file", &self.sandbox.source_file)?;
        validate_file_name("sandbox.test_file", &self.sandbox.test_file)?;
        if self.sandbox.source_file == self.sandbox.test_file {
            return Err(anyhow!(
                "sandbox.source_file and sandbox.test_file must differ"
            ));
        }
        Ok(())
    }

    pub fn to_limits(&self) -> Result<Limits> {
        Limits::new(
            self.max_iterations,
            Duration::from_secs(self.capability_timeout_secs),
            Duration::from_secs(self.sandbox_timeout_secs),
        )
        .context("config limits")
    }
}

fn validate_file_name(field: &str, name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed != name
        || name.contains(['/', '\\'])
        || name == "."
        || name == ".."
    {
        return Err(anyhow!("{field} must be a plain file name, got {name:?}"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let tmp_path = path.with_extension("toml.tmp");
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
