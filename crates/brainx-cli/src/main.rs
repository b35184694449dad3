//! brainx - resumable brainstem MRI pipeline
//!
//! Runs the eight processing stages for one subject, or for every subject
//! directory of a batch, and exits with a code describing the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use brainx_core::{
    exit, BrainxError, HaltPolicy, PipelineConfig, PipelineKind, PipelineStage, QualityPreset,
    ReferenceStrategy, RunContext,
};
use brainx_pipeline::{run_batch, BatchOutcome, BatchSettings, Orchestrator, RunOutcome};
use brainx_toolkit::{CommandToolkit, Toolkit};
use clap::Parser;
use tracing::{info, Level};

const LOG_DIR: &str = "logs";

#[derive(Parser, Debug)]
#[command(name = "brainx")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resumable brainstem MRI processing pipeline", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "BRAINX_CONFIG")]
    config: Option<PathBuf>,

    /// DICOM input directory (batch mode: one sub-directory per subject)
    #[arg(short, long, env = "BRAINX_INPUT")]
    input: Option<PathBuf>,

    /// Output root
    #[arg(short, long, env = "BRAINX_OUTPUT")]
    output: Option<PathBuf>,

    /// Subject id (default: input directory name)
    #[arg(short, long, env = "BRAINX_SUBJECT")]
    subject: Option<String>,

    /// LOW, MEDIUM or HIGH
    #[arg(short, long, env = "BRAINX_QUALITY")]
    quality: Option<QualityPreset>,

    /// BASIC, FULL or BATCH
    #[arg(short, long)]
    pipeline: Option<PipelineKind>,

    /// Resume from this stage; earlier outputs must exist
    #[arg(long)]
    start_stage: Option<PipelineStage>,

    /// Only warnings and errors
    #[arg(long, conflicts_with_all = ["verbose", "debug"])]
    quiet: bool,

    /// Debug output
    #[arg(short, long, conflicts_with = "debug")]
    verbose: bool,

    /// Trace output
    #[arg(long)]
    debug: bool,

    /// Emit JSON-formatted log lines and a JSON run report
    #[arg(long)]
    json: bool,

    /// Concurrent jobs per batch (0 = one per core)
    #[arg(short, long, env = "BRAINX_JOBS")]
    jobs: Option<usize>,

    /// adaptive, always-primary or always-secondary
    #[arg(long)]
    reference_strategy: Option<ReferenceStrategy>,

    /// Attempt every item of a batch even after one fails
    #[arg(long)]
    best_effort_batches: bool,

    /// Abort a batch after this many seconds (0 = unbounded)
    #[arg(long)]
    batch_timeout: Option<u64>,

    /// Log file (default: <output>/logs/brainx_<subject>.log)
    #[arg(long, env = "BRAINX_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn level(&self) -> Level {
        if self.debug {
            Level::TRACE
        } else if self.verbose {
            Level::DEBUG
        } else if self.quiet {
            Level::WARN
        } else {
            Level::INFO
        }
    }

    /// Flags override whatever the config file said.
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(input) = &self.input {
            config.input_dir = Some(input.clone());
        }
        if let Some(output) = &self.output {
            config.output_dir = Some(output.clone());
        }
        if let Some(subject) = &self.subject {
            config.subject = Some(subject.clone());
        }
        if let Some(quality) = self.quality {
            config.quality = quality;
        }
        if let Some(pipeline) = self.pipeline {
            config.pipeline = pipeline;
        }
        if let Some(stage) = self.start_stage {
            config.start_stage = Some(stage);
        }
        if let Some(jobs) = self.jobs {
            config.parallel.jobs = jobs;
        }
        if let Some(strategy) = self.reference_strategy {
            config.reference_strategy = strategy;
        }
        if self.best_effort_batches {
            config.parallel.halt_policy = HaltPolicy::BestEffort;
        }
        if let Some(secs) = self.batch_timeout {
            config.parallel.batch_timeout_secs = secs;
        }
    }
}

/// Everything a run needs once flags and config are merged.
#[derive(Debug)]
struct Resolved {
    config: PipelineConfig,
    input: PathBuf,
    output: PathBuf,
    subject: String,
}

fn resolve(cli: &Cli) -> Result<Resolved> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    let input = config
        .input_dir
        .clone()
        .ok_or_else(|| BrainxError::InvalidArgument("--input is required".to_string()))?;
    let output = config
        .output_dir
        .clone()
        .ok_or_else(|| BrainxError::InvalidArgument("--output is required".to_string()))?;
    let subject = match &config.subject {
        Some(subject) => subject.clone(),
        None => default_subject(&input)?,
    };
    Ok(Resolved {
        config,
        input,
        output,
        subject,
    })
}

/// Name of the input directory.
fn default_subject(input: &Path) -> Result<String> {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            BrainxError::InvalidArgument(format!(
                "cannot derive a subject id from {}; pass --subject",
                input.display()
            ))
        })?;
    Ok(name)
}

fn log_path(cli: &Cli, resolved: &Resolved) -> Result<PathBuf> {
    if let Some(path) = &cli.log_file {
        return Ok(path.clone());
    }
    let dir = resolved.output.join(LOG_DIR);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let name = match resolved.config.pipeline {
        PipelineKind::Batch => "brainx_batch.log".to_string(),
        _ => format!("brainx_{}.log", resolved.subject),
    };
    Ok(dir.join(name))
}

/// Exit code for an error that escaped the run itself.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<BrainxError>())
        .map_or(exit::GENERAL, BrainxError::exit_code)
}

fn print_run(outcome: &RunOutcome) {
    println!(
        "{} [{}]: {} ({} error(s), {} ms)",
        outcome.subject, outcome.run_id, outcome.state, outcome.error_count, outcome.duration_ms
    );
    for report in &outcome.stages {
        match &report.error {
            Some(error) => println!("  {:<17} {}: {error}", report.stage.name(), report.status),
            None => println!("  {:<17} {}", report.stage.name(), report.status),
        }
    }
}

fn print_batch(outcome: &BatchOutcome) {
    for run in &outcome.runs {
        print_run(run);
    }
    println!(
        "{} subject(s), {} failed",
        outcome.runs.len(),
        outcome.failed()
    );
}

async fn run(cli: Cli) -> Result<i32> {
    let resolved = resolve(&cli)?;
    let log_file = log_path(&cli, &resolved)?;
    brainx_core::init_tracing(cli.json, cli.level(), Some(&log_file))
        .with_context(|| format!("opening log file {}", log_file.display()))?;
    info!(
        input = %resolved.input.display(),
        output = %resolved.output.display(),
        pipeline = %resolved.config.pipeline,
        quality = %resolved.config.quality,
        "brainx starting"
    );

    let Resolved {
        config,
        input,
        output,
        subject,
    } = resolved;
    let quality = config.quality;
    let pipeline = config.pipeline;
    let start_stage = config.start_stage.unwrap_or(PipelineStage::Import);
    let toolkit = Toolkit::shared(Arc::new(CommandToolkit::new(config.tools.clone())));
    let orchestrator = Orchestrator::new(config, toolkit);

    if pipeline == PipelineKind::Batch {
        let outcome = run_batch(
            &orchestrator,
            &input,
            &output,
            BatchSettings {
                quality,
                start_stage,
            },
        )
        .await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        } else {
            print_batch(&outcome);
        }
        return Ok(outcome.exit_code());
    }

    let mut ctx = RunContext::new(subject, input, output)
        .with_quality(quality)
        .with_pipeline(pipeline)
        .with_start_stage(start_stage);
    let outcome = orchestrator.run(&mut ctx).await;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_run(&outcome);
    }
    Ok(outcome.exit_code())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("brainx: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("brainx").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config() {
        let cli = parse(&[
            "--input",
            "/data/sub01",
            "--output",
            "/out",
            "--quality",
            "high",
            "--pipeline",
            "basic",
            "--start-stage",
            "registration",
            "--jobs",
            "3",
            "--reference-strategy",
            "always-secondary",
            "--best-effort-batches",
            "--batch-timeout",
            "600",
        ]);
        let mut config = PipelineConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.quality, QualityPreset::High);
        assert_eq!(config.pipeline, PipelineKind::Basic);
        assert_eq!(config.start_stage, Some(PipelineStage::Registration));
        assert_eq!(config.parallel.jobs, 3);
        assert_eq!(config.parallel.halt_policy, HaltPolicy::BestEffort);
        assert_eq!(config.parallel.batch_timeout_secs, 600);
        assert_eq!(config.reference_strategy, ReferenceStrategy::AlwaysSecondary);
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(parse(&[]).level(), Level::INFO);
        assert_eq!(parse(&["--quiet"]).level(), Level::WARN);
        assert_eq!(parse(&["--verbose"]).level(), Level::DEBUG);
        assert_eq!(parse(&["--debug"]).level(), Level::TRACE);
        assert!(Cli::try_parse_from(["brainx", "--quiet", "--debug"]).is_err());
    }

    #[test]
    fn test_unknown_stage_is_rejected() {
        assert!(Cli::try_parse_from(["brainx", "--start-stage", "reticulation"]).is_err());
    }

    #[test]
    fn test_subject_defaults_to_input_dir_name() {
        let cli = parse(&["--input", "/data/sub07", "--output", "/out"]);
        let resolved = resolve(&cli).unwrap();
        assert_eq!(resolved.subject, "sub07");
    }

    #[test]
    fn test_missing_output_is_invalid_argument() {
        let cli = parse(&["--input", "/data/sub07"]);
        let err = resolve(&cli).unwrap_err();
        assert_eq!(exit_code_for(&err), exit::INVALID_ARGUMENT);
    }

    #[test]
    fn test_missing_config_file_maps_to_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let cli = parse(&[
            "--config",
            missing.to_str().unwrap(),
            "--input",
            "/data/sub07",
            "--output",
            "/out",
        ]);
        let err = resolve(&cli).unwrap_err();
        assert_eq!(exit_code_for(&err), exit::FILE_NOT_FOUND);
    }

    #[test]
    fn test_default_log_path_under_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let cli = parse(&[
            "--input",
            "/data/sub07",
            "--output",
            out.to_str().unwrap(),
        ]);
        let resolved = resolve(&cli).unwrap();
        let path = log_path(&cli, &resolved).unwrap();
        assert_eq!(path, out.join("logs/brainx_sub07.log"));
        assert!(out.join("logs").is_dir());
    }
}
