//! Forgeline - validation-gated stage pipelines
//!
//! The `forgeline` command runs declarative pipelines against a working
//! directory using the built-in capabilities.
//!
//! ## Commands
//!
//! - `run`: Execute a pipeline file and print the run result
//! - `check`: Parse and validate a pipeline file without running it
//! - `classify`: Show how the recovery layer categorises an error message
//! - `report`: Load a stored run report and verify its digest

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::future::Future;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

use forgeline_core::{
    builtin_registry, cancel_pair, classify_error, read_run_report, write_run_report,
    CancelSignal, EscalationOption, EscalationRequest, EscalationResolution, Escalator,
    Orchestrator, OrchestratorConfig, PipelineDefinition, PipelineRunResult, PolicyEscalator,
    RecoveryPlaybook, StageOutcome,
};

/// Where `report` looks when no directory is given.
const DEFAULT_REPORT_DIR: &str = ".forgeline/runs";

/// How long exit waits on blocking work, such as an unanswered escalation
/// prompt still reading stdin after the run was cancelled.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "forgeline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Validation-gated stage pipelines for agentic coding tasks", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and machine-readable results
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline definition (TOML)
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Task description handed to every stage
        #[arg(short, long, default_value = "")]
        task: String,

        /// Working directory capabilities act on
        #[arg(short, long, default_value = ".")]
        workdir: PathBuf,

        /// Orchestrator settings (TOML); overrides the pipeline's [config]
        #[arg(long, env = "FORGELINE_CONFIG")]
        config: Option<PathBuf>,

        /// How escalations are resolved
        #[arg(long, value_enum, default_value_t = EscalationMode::Prompt)]
        on_escalation: EscalationMode,

        /// Persist the run report under this directory
        #[arg(long, env = "FORGELINE_REPORT_DIR")]
        report_dir: Option<PathBuf>,
    },

    /// Validate a pipeline definition
    Check {
        /// Pipeline definition (TOML)
        pipeline: PathBuf,
    },

    /// Classify a capability error message
    Classify {
        /// Error text as a handler would report it
        message: String,
    },

    /// Show a stored run report
    Report {
        /// Run ID
        #[arg(long)]
        run: String,

        /// Root directory containing run reports (default: .forgeline/runs)
        #[arg(long, env = "FORGELINE_REPORT_DIR")]
        report_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EscalationMode {
    /// Ask on the terminal
    Prompt,
    /// Abort (or skip, for optional stages)
    Abort,
    /// Continue with the unvalidated output
    Continue,
}

struct RunOptions {
    pipeline: PathBuf,
    task: String,
    workdir: PathBuf,
    config: Option<PathBuf>,
    on_escalation: EscalationMode,
    report_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    block_on_then_shutdown(dispatch(cli))?
}

/// Drive `fut` on a fresh runtime, then shut the runtime down without
/// waiting indefinitely on blocking tasks.
fn block_on_then_shutdown<F: Future>(fut: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;
    let output = runtime.block_on(fut);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    Ok(output)
}

async fn dispatch(cli: Cli) -> Result<()> {
    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    forgeline_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            pipeline,
            task,
            workdir,
            config,
            on_escalation,
            report_dir,
        } => {
            let opts = RunOptions {
                pipeline,
                task,
                workdir,
                config,
                on_escalation,
                report_dir,
            };
            cmd_run(&opts, cli.json).await
        }
        Commands::Check { pipeline } => cmd_check(&pipeline),
        Commands::Classify { message } => {
            println!("{}", classify_line(&message, &RecoveryPlaybook::standard()));
            Ok(())
        }
        Commands::Report { run, report_dir } => cmd_report(
            &run,
            report_dir.as_deref(),
            cli.json,
            &mut std::io::stdout().lock(),
        ),
    }
}

/// Load settings: an explicit config file wins over the pipeline's own.
fn load_config(opts: &RunOptions, definition: &PipelineDefinition) -> Result<OrchestratorConfig> {
    match &opts.config {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {:?}", path)),
        None => Ok(definition.config.clone().unwrap_or_default()),
    }
}

fn escalator_for(mode: EscalationMode) -> Arc<dyn Escalator> {
    match mode {
        EscalationMode::Prompt => Arc::new(TerminalEscalator),
        EscalationMode::Abort => Arc::new(PolicyEscalator::always_abort()),
        EscalationMode::Continue => Arc::new(PolicyEscalator::always_continue()),
    }
}

/// Build the orchestrator from `opts` and run it to completion.
async fn execute_pipeline(opts: &RunOptions, cancel: CancelSignal) -> Result<PipelineRunResult> {
    let definition = PipelineDefinition::from_file(&opts.pipeline)
        .with_context(|| format!("Failed to load pipeline: {:?}", opts.pipeline))?;
    let config = load_config(opts, &definition)?;
    let workdir = opts
        .workdir
        .canonicalize()
        .with_context(|| format!("Working directory not found: {:?}", opts.workdir))?;

    let registry = builtin_registry()?.into_shared();
    let orchestrator = Orchestrator::new(
        config,
        registry,
        definition.into_stages(),
        escalator_for(opts.on_escalation),
    )?;
    info!(stages = ?orchestrator.stage_names(), workdir = %workdir.display(), "starting pipeline");

    let result = orchestrator.run(&opts.task, workdir, cancel).await;

    if let Some(dir) = &opts.report_dir {
        let path = write_run_report(&result, dir)
            .with_context(|| format!("Failed to write run report under {:?}", dir))?;
        info!(path = %path.display(), "run report written");
    }
    Ok(result)
}

async fn cmd_run(opts: &RunOptions, json: bool) -> Result<()> {
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            handle.cancel();
        }
    });

    let result = execute_pipeline(opts, signal).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        write_result(&result, &mut std::io::stdout().lock())?;
    }

    if result.success {
        Ok(())
    } else {
        anyhow::bail!("pipeline run {} failed", result.run_id)
    }
}

fn write_result(result: &PipelineRunResult, out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "Run ID: {}", result.run_id)?;
    writeln!(out, "Status: {}", if result.success { "✓ PASSED" } else { "✗ FAILED" })?;
    writeln!(out, "Duration: {}ms", result.duration_ms)?;
    writeln!(out)?;

    for stage in &result.per_stage {
        let mark = match stage.outcome {
            StageOutcome::Committed => "✓",
            StageOutcome::Skipped => "-",
            StageOutcome::Aborted => "✗",
            StageOutcome::NotRun => " ",
        };
        let provenance = stage
            .provenance
            .map(|p| format!(", {}", serde_json::to_value(p).unwrap_or(Value::Null)))
            .unwrap_or_default();
        writeln!(
            out,
            "  {} {} ({} attempt(s){}) {}",
            mark, stage.name, stage.attempts_used, provenance, stage.message
        )?;
    }

    if !result.escalations.is_empty() {
        writeln!(out)?;
        writeln!(out, "Escalations:")?;
        for decision in &result.escalations {
            writeln!(
                out,
                "  - {}: {} (requested {})",
                decision.stage, decision.applied, decision.requested
            )?;
        }
    }

    writeln!(out)?;
    writeln!(
        out,
        "Summary: {}/{} stages committed, {} invocation(s)",
        result.stages_completed,
        result.total_stages,
        result.invocations.len()
    )?;
    if let Some(failure) = result.failure {
        writeln!(out, "Failure: {}", failure)?;
    }
    Ok(())
}

fn cmd_check(path: &Path) -> Result<()> {
    let definition = PipelineDefinition::from_file(path)
        .with_context(|| format!("Invalid pipeline: {:?}", path))?;
    println!("Pipeline OK: {} stage(s)", definition.stages.len());
    for stage in &definition.stages {
        let allowed: Vec<String> = stage.allow_list.iter().map(|c| c.to_string()).collect();
        println!(
            "  {} [{}] allow: {}",
            stage.name,
            if stage.required { "required" } else { "optional" },
            allowed.join(", ")
        );
    }
    Ok(())
}

fn classify_line(message: &str, playbook: &RecoveryPlaybook) -> String {
    match classify_error(message) {
        Some(category) => {
            let action = playbook
                .action_for(category)
                .map(|a| a.to_string())
                .unwrap_or_else(|| "escalate".to_string());
            format!("{}: {}", category, action)
        }
        None => "unclassified: escalate".to_string(),
    }
}

fn cmd_report(
    run_id: &str,
    report_dir: Option<&Path>,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    let root = report_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_DIR));
    let result = read_run_report(run_id, &root)
        .with_context(|| format!("Failed to load run report {} from {:?}", run_id, root))?;

    info!(run_id = %result.run_id, "report digest verified");
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&result)?)?;
    } else {
        write_result(&result, out)?;
        writeln!(out, "Report digest verified")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Terminal escalation
// ---------------------------------------------------------------------------

/// Asks the operator on stderr/stdin. End of input resolves to abort.
struct TerminalEscalator;

#[async_trait]
impl Escalator for TerminalEscalator {
    async fn present_escalation(&self, request: &EscalationRequest) -> EscalationResolution {
        let request = request.clone();
        let answer = tokio::task::spawn_blocking(move || {
            let stdin = std::io::stdin();
            let mut input = stdin.lock();
            prompt_resolution(&request, &mut input, &mut std::io::stderr())
        })
        .await;
        match answer {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(e)) => {
                warn!(error = %e, "escalation prompt failed; aborting");
                EscalationResolution::Abort
            }
            Err(e) => {
                warn!(error = %e, "escalation prompt task failed; aborting");
                EscalationResolution::Abort
            }
        }
    }
}

fn prompt_resolution(
    request: &EscalationRequest,
    input: &mut impl BufRead,
    out: &mut impl Write,
) -> std::io::Result<EscalationResolution> {
    writeln!(out)?;
    writeln!(
        out,
        "Stage '{}' failed after {} attempt(s): {}",
        request.stage,
        request.attempts_used,
        request.message()
    )?;
    if let Some(output) = &request.last_output {
        writeln!(out, "Last output:\n{}", output.text)?;
    }
    for (i, option) in request.options.iter().enumerate() {
        let label = match (option, request.required) {
            (EscalationOption::Abort, false) => "skip this stage",
            (EscalationOption::Abort, true) => "abort the run",
            (EscalationOption::Continue, _) => "continue with the unvalidated output",
            (EscalationOption::SubstituteOutput, _) => "supply the output yourself",
        };
        writeln!(out, "  [{}] {} - {}", i + 1, option, label)?;
    }

    loop {
        write!(out, "Choice: ")?;
        out.flush()?;
        let Some(line) = read_line(input)? else {
            return Ok(EscalationResolution::Abort);
        };
        let Some(option) = parse_choice(&line, &request.options) else {
            writeln!(out, "Unrecognised choice '{}'", line)?;
            continue;
        };
        return Ok(match option {
            EscalationOption::Continue => EscalationResolution::Continue,
            EscalationOption::Abort => EscalationResolution::Abort,
            EscalationOption::SubstituteOutput => {
                write!(out, "Output (JSON or text): ")?;
                out.flush()?;
                match read_line(input)? {
                    Some(text) => EscalationResolution::SubstituteOutput {
                        data: parse_substitute(&text),
                    },
                    None => EscalationResolution::Abort,
                }
            }
        });
    }
}

fn read_line(input: &mut impl BufRead) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Accepts a 1-based index or an option name.
fn parse_choice(line: &str, options: &[EscalationOption]) -> Option<EscalationOption> {
    if let Ok(n) = line.parse::<usize>() {
        return n.checked_sub(1).and_then(|i| options.get(i)).copied();
    }
    let wanted = line.to_ascii_lowercase().replace('-', "_");
    options.iter().copied().find(|o| {
        let name = o.to_string();
        name == wanted || (wanted == "skip" && *o == EscalationOption::Abort)
    })
}

fn parse_substitute(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
