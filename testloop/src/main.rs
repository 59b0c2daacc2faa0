//! `testloop` CLI: generate, run, and repair a test suite for one source file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::warn;

use testloop::capability::{CapabilityKind, GenerationCapability};
use testloop::core::parser::parse;
use testloop::core::types::{ExecStatus, ExecutionRecord, Outcome, SourceUnit};
use testloop::exit_codes;
use testloop::io::artifact::write_artifacts;
use testloop::io::command_capability::CommandCapability;
use testloop::io::config::{DEFAULT_CONFIG_FILE, EngineConfig, load_config, write_config};
use testloop::io::iteration_log::write_iteration;
use testloop::io::sandbox::ProcessSandbox;
use testloop::logging;
use testloop::workflow::{Capabilities, Workflow};

#[derive(Parser)]
#[command(
    name = "testloop",
    version,
    about = "Generate, run, and repair a test suite for a source file"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Config file to create.
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the full workflow on a source file.
    Run {
        /// Source file under test.
        source: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Directory for iteration logs and exported artifacts.
        #[arg(long, default_value = ".testloop")]
        out: PathBuf,
    },
    /// Parse a saved test runner log and print the result report as JSON.
    Parse {
        log: PathBuf,
        /// Exit code the runner reported.
        #[arg(long)]
        exit_code: Option<i32>,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Init { config, force } => cmd_init(&config, force),
        Command::Run {
            source,
            config,
            out,
        } => cmd_run(&source, &config, &out),
        Command::Parse { log, exit_code } => cmd_parse(&log, exit_code),
    };
    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::FATAL);
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &EngineConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(source_path: &Path, config_path: &Path, out: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let limits = config.to_limits()?;
    let text = fs::read_to_string(source_path)
        .with_context(|| format!("read source {}", source_path.display()))?;
    let id = source_path.file_name().map_or_else(
        || source_path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    );
    let source = SourceUnit { id, text };

    let capabilities = build_capabilities(&config, limits.capability_timeout)?;
    let sandbox = ProcessSandbox::new(
        config.sandbox.command.clone(),
        config.sandbox.source_file.clone(),
        config.sandbox.test_file.clone(),
        config.output_limit_bytes,
    )?;

    let mut workflow = Workflow::new(source, capabilities, &sandbox, limits)?;
    let run_id = workflow.run_id().to_string();
    let result = workflow.run(|record| {
        if let Err(err) = write_iteration(out, &run_id, record) {
            warn!(
                err = %format!("{err:#}"),
                iteration = record.index,
                "failed to write iteration log"
            );
        }
    });

    match result {
        Ok(artifact) => {
            let paths =
                write_artifacts(out, &config.sandbox.test_file, &artifact, workflow.store())?;
            println!("{}", artifact.summary());
            println!("artifacts: {}", paths.dir.display());
            Ok(match artifact.outcome {
                Outcome::Passed => exit_codes::OK,
                Outcome::Exhausted => exit_codes::EXHAUSTED,
            })
        }
        Err(err) => {
            let dump_dir = out.join("runs").join(&run_id);
            let dumped = fs::create_dir_all(&dump_dir)
                .context("create run dir")
                .and_then(|()| {
                    let mut buf = serde_json::to_string_pretty(&workflow.store().dump())?;
                    buf.push('\n');
                    fs::write(dump_dir.join("store.json"), buf).context("write store dump")
                });
            if let Err(dump_err) = dumped {
                warn!(err = %format!("{dump_err:#}"), "failed to dump store");
            }
            Err(err).with_context(|| format!("run {run_id} aborted"))
        }
    }
}

fn build_capabilities(config: &EngineConfig, timeout: Duration) -> Result<Capabilities> {
    let commands = &config.capabilities;
    let build = |kind: CapabilityKind, argv: &[String]| -> Result<Arc<dyn GenerationCapability>> {
        let capability = CommandCapability::new(
            kind.as_str(),
            argv.to_vec(),
            timeout,
            config.output_limit_bytes,
        )
        .with_context(|| format!("set capabilities.{kind} in the config file"))?
        .with_source_module(config.sandbox.source_module());
        let capability: Arc<dyn GenerationCapability> = Arc::new(capability);
        Ok(capability)
    };
    Ok(Capabilities {
        analyzer: build(CapabilityKind::Analyzer, &commands.analyzer)?,
        designer: build(CapabilityKind::Designer, &commands.designer)?,
        implementer: build(CapabilityKind::Implementer, &commands.implementer)?,
        debugger: build(CapabilityKind::Debugger, &commands.debugger)?,
    })
}

fn cmd_parse(log: &Path, exit_code: Option<i32>) -> Result<i32> {
    let stdout = fs::read_to_string(log).with_context(|| format!("read {}", log.display()))?;
    let record = ExecutionRecord {
        stdout,
        stderr: String::new(),
        exit_code,
        status: ExecStatus::Ok,
        duration_ms: 0,
    };
    let report = parse(&record)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(exit_codes::OK)
}
