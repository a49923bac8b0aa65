use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use solver_sweep::checkpoint::CheckpointStore;
use solver_sweep::collaborators::{ConfigProvider, JsonConfig};
use solver_sweep::execution::{CommandKeepAwake, ExecutionStrategy, StrategyKind};
use solver_sweep::hooks::{CommandExtractor, CommandSceneBuilder, FsProjectDocument};
use solver_sweep::pipeline::{plan_sweep, Collaborators, Pipeline};
use solver_sweep::ui::{render_status, render_summary, ProgressBarSink};
use solver_sweep::{CancellationToken, Phase, PipelineConfig, TelemetrySink};

/// Exit code after a cancelled sweep, as for SIGINT.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "sweep", version, about = "Resilient solver sweep runner")]
struct Cli {
    /// Show debug logs and raw solver output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sweep, resuming from existing checkpoints.
    Run(RunArgs),
    /// Show which phases of each work unit are checkpointed.
    Status(StudyArgs),
    /// Print the effective configuration as TOML.
    PrintConfig {
        /// Pipeline configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct StudyArgs {
    /// Pipeline configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Study configuration (JSON).
    #[arg(short, long)]
    study: PathBuf,

    /// Override the results root.
    #[arg(long)]
    results_root: Option<PathBuf>,

    /// Shard owned by this instance.
    #[arg(long, requires = "shard_count")]
    shard_index: Option<usize>,

    /// Number of independent instances sharing the sweep.
    #[arg(long, requires = "shard_index")]
    shard_count: Option<usize>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    study: StudyArgs,

    /// Phase to leave out of this invocation. Repeatable.
    #[arg(long = "skip", value_name = "PHASE")]
    skip: Vec<Phase>,

    /// Give up on a unit after this many failed attempts.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Do not draw a progress bar.
    #[arg(long)]
    no_progress: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let use_colors = !cli.no_color && std::io::stdout().is_terminal();

    let result = match cli.command {
        Command::Run(args) => run(args, cli.verbose, use_colors),
        Command::Status(args) => status(args, use_colors),
        Command::PrintConfig { config } => print_config(config.as_deref()),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(args: &StudyArgs) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(root) = &args.results_root {
        config = config.with_results_root(root);
    }
    if let (Some(index), Some(count)) = (args.shard_index, args.shard_count) {
        config = config.with_shard(index, count);
    }
    config.validate()?;
    Ok(config)
}

fn load_study(path: &Path) -> Result<Arc<dyn ConfigProvider>> {
    let study = JsonConfig::from_path(path)
        .with_context(|| format!("reading study configuration {}", path.display()))?;
    Ok(Arc::new(study))
}

fn run(args: RunArgs, verbose: bool, use_colors: bool) -> Result<ExitCode> {
    let mut config = load_config(&args.study)?;
    for phase in &args.skip {
        config.phases.set(*phase, false);
    }
    if args.max_attempts.is_some() {
        config = config.with_max_attempts(args.max_attempts);
    }
    config.validate()?;

    let study = load_study(&args.study.study)?;
    let units = plan_sweep(study.root(), &config)?.into_units();

    let strategy = match config.execution.strategy {
        StrategyKind::Direct => ExecutionStrategy::direct(
            config.execution.solver_binary.clone(),
            config.execution.solver_flags.clone(),
        ),
        other => bail!("strategy '{}' needs an embedding application; the CLI only runs 'direct'", other),
    };
    let collaborators = Collaborators {
        strategy,
        scene: Box::new(CommandSceneBuilder::new(config.hooks.setup.clone())),
        extractor: Box::new(CommandExtractor::new(config.hooks.extract.clone())),
        document: Box::new(FsProjectDocument::new()),
        keep_awake: Some(Box::new(CommandKeepAwake::new())),
    };

    let sink = Arc::new(if args.no_progress || !std::io::stderr().is_terminal() {
        ProgressBarSink::hidden(verbose)
    } else {
        ProgressBarSink::new(verbose, use_colors)
    });
    let telemetry: Arc<dyn TelemetrySink> = sink.clone();
    let cancel = CancellationToken::new();
    let mut pipeline = Pipeline::new(config, study, collaborators, telemetry, cancel.clone())?;
    install_interrupt_handler(cancel, pipeline.registry().clone())?;

    info!(units = units.len(), "sweep planned");
    let summary = pipeline.run(&units)?;
    sink.finish();
    print!("{}", render_summary(&summary, use_colors));

    Ok(if summary.cancelled {
        ExitCode::from(EXIT_CANCELLED)
    } else if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// First Ctrl-C cancels cooperatively. A second one terminates every live
/// solver process and exits.
fn install_interrupt_handler(
    cancel: CancellationToken,
    registry: solver_sweep::execution::ProcessRegistry,
) -> Result<()> {
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            let killed = registry.terminate_all(Duration::from_secs(5));
            eprintln!("forced exit, terminated {} solver process(es)", killed);
            std::process::exit(i32::from(EXIT_CANCELLED));
        }
        eprintln!("cancelling after the current step (press Ctrl-C again to force)");
        cancel.cancel();
    })
    .context("installing Ctrl-C handler")
}

fn status(args: StudyArgs, use_colors: bool) -> Result<ExitCode> {
    let config = load_config(&args)?;
    let study = load_study(&args.study)?;
    let units = plan_sweep(study.root(), &config)?.into_units();
    let store = CheckpointStore::new(
        config.sweep.results_root.clone(),
        study,
        config.checkpoint.artifacts.clone(),
        config.checkpoint.snapshot.clone(),
    )?;
    let rows: Vec<_> = units
        .into_iter()
        .map(|unit| {
            let validity = store.verify(&unit);
            (unit, validity)
        })
        .collect();
    print!("{}", render_status(&rows, use_colors));
    Ok(ExitCode::SUCCESS)
}

fn print_config(path: Option<&Path>) -> Result<ExitCode> {
    let config = PipelineConfig::load(path).context("loading configuration")?;
    print!("{}", config.to_toml()?);
    Ok(ExitCode::SUCCESS)
}
