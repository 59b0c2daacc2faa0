//! Export of a finished run: final artifact, final test file, store dump, and
//! a markdown report.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::clean::strip_code_fence;
use crate::core::store::StateStore;
use crate::core::types::{FinalArtifact, TestStatus};
use crate::io::iteration_log::{write_json, write_text};

const REPORT_TEMPLATE: &str = include_str!("../../templates/report.md");

#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
    pub artifact_path: PathBuf,
    pub test_file_path: PathBuf,
    pub store_path: PathBuf,
    pub report_path: PathBuf,
}

impl ArtifactPaths {
    pub fn new(out_dir: &Path, run_id: &str, test_file: &str) -> Self {
        let dir = out_dir.join("runs").join(run_id);
        Self {
            artifact_path: dir.join("final_artifact.json"),
            test_file_path: dir.join(test_file),
            store_path: dir.join("store.json"),
            report_path: dir.join("report.md"),
            dir,
        }
    }
}

#[derive(Debug, Serialize)]
struct EntryRow {
    scenario: String,
    /// Rendered with its serde name, e.g. `timed_out`.
    status: TestStatus,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransitionRow {
    iteration: u32,
    from: String,
    to: String,
}

/// Render the markdown report for a final artifact.
pub fn render_report(artifact: &FinalArtifact) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("report", REPORT_TEMPLATE)
        .context("load report template")?;
    let template = env.get_template("report").context("get report template")?;

    let entries: Vec<EntryRow> = artifact
        .results
        .entries()
        .iter()
        .map(|entry| EntryRow {
            scenario: entry.scenario.clone(),
            status: entry.status,
            message: entry.message.as_deref().map(table_cell),
        })
        .collect();
    let transitions: Vec<TransitionRow> = artifact
        .transitions
        .iter()
        .map(|t| TransitionRow {
            iteration: t.iteration,
            from: t.from.to_string(),
            to: t.to.to_string(),
        })
        .collect();
    let rendered = template
        .render(context! {
            source_id => &artifact.source_id,
            run_id => &artifact.run_id,
            outcome => artifact.outcome,
            iterations_used => artifact.iterations_used,
            max_iterations => artifact.max_iterations,
            version => artifact.test_code.version,
            last_status => artifact.last_exec_status,
            last_exit_code => artifact.last_exit_code,
            summary => artifact.summary(),
            entries => entries,
            transitions => transitions,
        })
        .context("render report")?;
    Ok(rendered)
}

/// One-line table cell: newlines collapsed, pipes escaped.
fn table_cell(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('|', "\\|")
}

/// Write the exported files for a finished run.
pub fn write_artifacts(
    out_dir: &Path,
    test_file: &str,
    artifact: &FinalArtifact,
    store: &StateStore,
) -> Result<ArtifactPaths> {
    let paths = ArtifactPaths::new(out_dir, &artifact.run_id, test_file);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create artifact dir {}", paths.dir.display()))?;

    write_json(&paths.artifact_path, artifact)?;
    // Same text the sandbox ran: fences stripped.
    write_text(&paths.test_file_path, &strip_code_fence(&artifact.test_code.text))?;
    write_json(&paths.store_path, &store.dump())?;
    write_text(&paths.report_path, &render_report(artifact)?)?;

    debug!(dir = %paths.dir.display(), "artifacts written");
    Ok(paths)
}
