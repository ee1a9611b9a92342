//! affect-eval CLI
//!
//! Prompt-matrix evaluation of LLM backends on emotion and mental-health
//! classification datasets.

use affect_eval::{
    Aggregator, BackendRegistry, Credentials, EvaluationDriver, HarnessConfig, JsonlSource,
    PlanLoader, RunConfig, ShotStrategy, TemplateStore, WorkerCommand,
};
use affect_eval::{Axis, AxisSelectors};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "affect-eval")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Harness configuration (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Shot memory strategy (`teacher_forcing` or `live_completion`)
    #[arg(long, global = true)]
    shot_strategy: Option<ShotStrategy>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args)]
struct EvaluateArgs {
    #[arg(long, default_value = "Emotion")]
    data_task: String,

    #[arg(long, default_value = "Classification")]
    problem_task: String,

    /// Dataset name
    #[arg(long, default_value = "goemotion")]
    data: String,

    /// System instruction selector
    #[arg(long, default_value = "persona-expert")]
    si: String,

    /// Task query selector
    #[arg(long, default_value = "goemotion")]
    tq: String,

    /// Prompt strategy selector
    #[arg(long, default_value = "goemotion-none")]
    ps: String,

    /// Context input selector
    #[arg(long, default_value = "goemotion")]
    ct: String,

    /// Label definition selector
    #[arg(long, default_value = "none")]
    ld: String,

    /// Output indicator selector
    #[arg(long, default_value = "goemotion")]
    oi: String,

    /// In-context examples; 0 is zero-shot
    #[arg(long, default_value = "0")]
    shot: usize,

    /// Row cap before stratified sampling
    #[arg(long, default_value = "200")]
    max_rows: usize,

    /// Backends to evaluate; more than one runs a worker process each
    #[arg(long, value_delimiter = ',', default_value = "Ollama_Llama")]
    backends: Vec<String>,
}

impl EvaluateArgs {
    fn run_config(&self) -> RunConfig {
        RunConfig {
            data_task: self.data_task.clone(),
            problem_task: self.problem_task.clone(),
            data: self.data.clone(),
            selectors: AxisSelectors {
                system_instruction: self.si.clone(),
                task_query: self.tq.clone(),
                prompt_strategy: self.ps.clone(),
                context: self.ct.clone(),
                label_def: self.ld.clone(),
                output_indicator: self.oi.clone(),
            },
            shot: self.shot,
            max_rows: self.max_rows,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one configuration against one or more backends
    Evaluate(EvaluateArgs),

    /// Run every configuration of the matching plan files
    Plan {
        /// Plan files (glob pattern)
        #[arg(long, default_value = "plans/*.yaml")]
        plans: String,
    },

    /// Aggregate transcripts into metric reports
    Aggregate {
        /// `<results>/<dataset>/<problem_task>` directory
        #[arg(long)]
        base: PathBuf,

        /// Only these backends
        #[arg(long, value_delimiter = ',')]
        backends: Vec<String>,
    },

    /// List template selectors per axis
    Templates {
        #[arg(long, default_value = "Emotion")]
        data_task: String,

        #[arg(long, default_value = "Classification")]
        problem_task: String,
    },

    /// List registered backends
    Backends,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = HarnessConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load harness configuration")?;
    if let Some(strategy) = cli.shot_strategy {
        config.shot_strategy = strategy;
    }
    let worker = |config_path: Option<&Path>| -> Result<WorkerCommand> {
        Ok(WorkerCommand::current(config_path)?.with_shot_strategy(cli.shot_strategy))
    };

    match cli.command {
        Commands::Evaluate(args) => evaluate(&config, &args, || worker(cli.config.as_deref())),
        Commands::Plan { plans } => plan(&plans, &worker(cli.config.as_deref())?),
        Commands::Aggregate { base, backends } => aggregate(&base, &backends),
        Commands::Templates {
            data_task,
            problem_task,
        } => templates(&config, &data_task, &problem_task),
        Commands::Backends => {
            list_backends(&config);
            Ok(())
        }
    }
}

fn evaluate(
    config: &HarnessConfig,
    args: &EvaluateArgs,
    worker: impl FnOnce() -> Result<WorkerCommand>,
) -> Result<()> {
    let run = args.run_config();

    if let [backend] = args.backends.as_slice() {
        let registry = BackendRegistry::with_overrides(&config.backends);
        let credentials = Credentials::load(&config.credentials)
            .context("Failed to load credentials")?;
        let source = JsonlSource::new(&config.data_root);

        let summary = EvaluationDriver::new(config)
            .run_named(&run, &source, backend, &registry, &credentials)
            .with_context(|| format!("Run failed for {backend}"))?;

        println!(
            "Model {} finished: {} transcripts ({} failed) in {}",
            summary.backend,
            summary.written,
            summary.sentinels,
            summary.dir.display()
        );
        return Ok(());
    }

    if args.backends.is_empty() {
        bail!("No backend given");
    }

    let outcomes = affect_eval::run_workers(&worker()?, &run, &args.backends)?;
    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|o| !o.success)
        .map(|o| o.backend.as_str())
        .collect();
    if !failed.is_empty() {
        bail!("Workers failed: {}", failed.join(", "));
    }
    println!("All {} backends finished", outcomes.len());
    Ok(())
}

fn plan(pattern: &str, worker: &WorkerCommand) -> Result<()> {
    let loader = PlanLoader::load_glob(pattern).context("Failed to load plans")?;
    if loader.is_empty() {
        bail!("No plan matches {pattern}");
    }

    let mut failures = 0;
    for (path, plan) in loader.plans() {
        tracing::info!(
            plan = %path.display(),
            backends = plan.backends.len(),
            runs = plan.all_runs().len(),
            "Running plan"
        );
        let outcomes = affect_eval::run_plan(worker, plan);
        let failed = outcomes.iter().filter(|o| !o.success).count();
        println!(
            "{}: {} runs, {} failed",
            path.display(),
            outcomes.len(),
            failed
        );
        failures += failed;
    }

    if failures > 0 {
        bail!("{failures} runs failed");
    }
    Ok(())
}

fn aggregate(base: &Path, backends: &[String]) -> Result<()> {
    let only = (!backends.is_empty()).then_some(backends);
    let written = Aggregator::new()?
        .aggregate_tree(base, only)
        .with_context(|| format!("Failed to aggregate {}", base.display()))?;

    for (dir, report) in &written {
        println!("{}", dir.display());
        println!("{}", report.summary_table());
        println!();
    }
    println!("{} configurations aggregated", written.len());
    Ok(())
}

fn templates(config: &HarnessConfig, data_task: &str, problem_task: &str) -> Result<()> {
    let store = TemplateStore::load(&config.template_root, data_task, problem_task)
        .context("Failed to load templates")?;

    for axis in Axis::ALL {
        println!("{axis} ({})", axis.file_name());
        for selector in store.selectors(axis) {
            println!("  - {selector}");
        }
    }
    Ok(())
}

fn list_backends(config: &HarnessConfig) {
    let registry = BackendRegistry::with_overrides(&config.backends);
    println!("Registered backends ({})", registry.len());
    println!("=====================");
    for (name, spec) in registry.iter() {
        let retry = if spec.uses_retry() { "retry" } else { "single" };
        println!("  {name:<16} {:<10} {:<8} {}", spec.kind(), retry, spec.model());
    }
}
