//! Evaluation execution.
//!
//! [`EvaluationDriver`] runs one configuration against one backend in the
//! current process, strictly one example after another. Several backends
//! run as separate worker processes that re-invoke this binary with a
//! single backend each ([`WorkerCommand`]); [`run_plan`] does the same for
//! every run of a plan, one sequential worker chain per backend.

use crate::adapter::{
    AdapterError, Exchange, InvocationPolicy, ModelAdapter, RetryPolicy, SENTINEL_ANSWER,
};
use crate::backends::{BackendError, BackendRegistry, ChatBackend};
use crate::config::{ConfigError, Credentials, HarnessConfig, Plan, RunConfig, ShotStrategy};
use crate::dataset::{self, DatasetError, DatasetSource};
use crate::prompt::{PromptGenerator, ShotMode};
use crate::shots::FewShotAccumulator;
use crate::templates::{GeneralPrompt, TemplateError, TemplateStore, GENERAL_PROMPT_FILE};
use crate::transcript::{backend_dir, Trailer, TranscriptError, TranscriptWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

/// Errors that abort a run
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Shot memory failed: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Transcript error: {0}")]
    Transcript(#[from] TranscriptError),

    #[error("Worker for {backend} failed: {status}")]
    Worker { backend: String, status: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Outcome of one driver run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub backend: String,
    pub dir: PathBuf,
    /// Transcript pairs written
    pub written: usize,
    /// Of those, answers that are the sentinel
    pub sentinels: usize,
    /// Rows consumed as shots
    pub shots: usize,
}

/// Runs one configuration against one backend
#[derive(Debug, Clone)]
pub struct EvaluationDriver {
    results_root: PathBuf,
    template_root: PathBuf,
    seed: u64,
    retry: RetryPolicy,
    shot_strategy: ShotStrategy,
}

impl EvaluationDriver {
    #[must_use]
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            results_root: config.results_root.clone(),
            template_root: config.template_root.clone(),
            seed: config.seed,
            retry: config.retry.policy(),
            shot_strategy: config.shot_strategy,
        }
    }

    /// Outer prompt document, or the plain concatenation when absent
    ///
    /// # Errors
    ///
    /// Returns an error if the document exists but cannot be parsed.
    pub fn general_prompt(&self) -> Result<GeneralPrompt, TemplateError> {
        if self.template_root.join(GENERAL_PROMPT_FILE).exists() {
            GeneralPrompt::load(&self.template_root)
        } else {
            tracing::warn!(
                root = %self.template_root.display(),
                "No general prompt document; concatenating axes"
            );
            Ok(GeneralPrompt::default())
        }
    }

    /// Build the named backend from the registry and run it
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unknown, lacks a credential, or
    /// the run fails.
    pub fn run_named(
        &self,
        run: &RunConfig,
        source: &dyn DatasetSource,
        name: &str,
        registry: &BackendRegistry,
        credentials: &Credentials,
    ) -> Result<RunSummary, RunnerError> {
        let spec = registry.get(name)?;
        let backend = spec.build(name, credentials)?;
        let policy = if spec.uses_retry() {
            InvocationPolicy::Retry(self.retry)
        } else {
            InvocationPolicy::Single
        };
        self.run(run, source, backend, policy)
    }

    /// Run every sampled example of `run` through `backend`.
    ///
    /// A backend failure on one example is logged and recorded as the
    /// sentinel answer; template, dataset and file errors abort the run.
    ///
    /// # Errors
    ///
    /// Returns an error if templates, the dataset or the shot memory cannot
    /// be prepared, or a transcript cannot be written.
    pub fn run(
        &self,
        run: &RunConfig,
        source: &dyn DatasetSource,
        backend: Arc<dyn ChatBackend>,
        policy: InvocationPolicy,
    ) -> Result<RunSummary, RunnerError> {
        let name = backend.name().to_string();
        tracing::info!(
            backend = %name,
            data = %run.data,
            si = %run.selectors.system_instruction,
            tq = %run.selectors.task_query,
            ps = %run.selectors.prompt_strategy,
            shot = run.shot,
            "Starting run"
        );

        let spec = dataset::lookup(&run.data)?;
        let rows = source.load(spec)?;
        let examples = dataset::preprocess(spec, &rows, run.max_rows, self.seed);

        let store = TemplateStore::load(&self.template_root, &run.data_task, &run.problem_task)?;
        let generator = PromptGenerator::new(&store, &run.selectors)?;
        let adapter = ModelAdapter::new(backend, policy, &self.general_prompt()?, run.shot);

        let memory = FewShotAccumulator::new(&generator, self.shot_strategy).build(
            &examples,
            run.shot,
            self.seed,
            &adapter,
        )?;

        let writer = TranscriptWriter::create(backend_dir(&self.results_root, run, &name))?;
        let mut summary = RunSummary {
            backend: name,
            dir: writer.dir().to_path_buf(),
            written: 0,
            sentinels: 0,
            shots: memory.count(),
        };

        for (index, example) in examples.iter().enumerate() {
            if memory.contains(index) {
                continue;
            }

            let record = generator.generate(example, &memory.text, ShotMode::Basic, memory.count())?;
            let (system, user) = adapter.normalize(&record)?;
            let answer = adapter.invoke(&system, &user).unwrap_or_else(|e| {
                tracing::error!(backend = %summary.backend, index, error = %e, "Example failed");
                SENTINEL_ANSWER.to_string()
            });
            let exchange = Exchange {
                query: format!("{system}{user}"),
                answer,
            };

            let trailer = run.is_classification().then(|| Trailer::for_example(example));
            writer.write(index, &exchange, trailer.as_ref())?;

            summary.written += 1;
            if exchange.is_sentinel() {
                summary.sentinels += 1;
            }
            tracing::debug!(backend = %summary.backend, index, "Example written");
        }

        tracing::info!(
            backend = %summary.backend,
            written = summary.written,
            sentinels = summary.sentinels,
            dir = %summary.dir.display(),
            "Run finished"
        );
        Ok(summary)
    }
}

// =============================================================================
// Worker processes
// =============================================================================

/// Command line that re-runs one configuration for a single backend
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    config: Option<PathBuf>,
    shot_strategy: Option<ShotStrategy>,
}

impl WorkerCommand {
    #[must_use]
    pub fn new<P: AsRef<Path>>(program: P, config: Option<&Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            config: config.map(Path::to_path_buf),
            shot_strategy: None,
        }
    }

    /// Forward a shot strategy override to every worker
    #[must_use]
    pub fn with_shot_strategy(mut self, strategy: Option<ShotStrategy>) -> Self {
        self.shot_strategy = strategy;
        self
    }

    /// Worker that re-invokes the running executable
    ///
    /// # Errors
    ///
    /// Returns an error if the executable path cannot be determined.
    pub fn current(config: Option<&Path>) -> Result<Self, RunnerError> {
        Ok(Self::new(std::env::current_exe()?, config))
    }

    /// `evaluate` arguments for one run and one backend
    #[must_use]
    pub fn args(&self, run: &RunConfig, backend: &str) -> Vec<String> {
        let s = &run.selectors;
        let mut args: Vec<String> = [
            "evaluate",
            "--data-task",
            &run.data_task,
            "--problem-task",
            &run.problem_task,
            "--data",
            &run.data,
            "--si",
            &s.system_instruction,
            "--tq",
            &s.task_query,
            "--ps",
            &s.prompt_strategy,
            "--ct",
            &s.context,
            "--ld",
            &s.label_def,
            "--oi",
            &s.output_indicator,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        args.extend([
            "--shot".to_string(),
            run.shot.to_string(),
            "--max-rows".to_string(),
            run.max_rows.to_string(),
            "--backends".to_string(),
            backend.to_string(),
        ]);

        if let Some(strategy) = self.shot_strategy {
            args.push("--shot-strategy".to_string());
            args.push(strategy.as_str().to_string());
        }
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        args
    }

    fn command(&self, run: &RunConfig, backend: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(run, backend));
        cmd
    }

    fn spawn(&self, run: &RunConfig, backend: &str) -> Result<Child, RunnerError> {
        tracing::info!(backend, program = %self.program.display(), "Spawning worker");
        Ok(self.command(run, backend).spawn()?)
    }
}

/// Exit state of one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub backend: String,
    /// `PS-<ps>_shot-<n>` label of the run
    pub run: String,
    pub success: bool,
}

fn run_label(run: &RunConfig) -> String {
    format!(
        "{}/{}/{}/PS-{}_shot-{}",
        run.data,
        run.selectors.system_instruction,
        run.selectors.task_query,
        run.selectors.prompt_strategy,
        run.shot
    )
}

fn check(backend: &str, status: ExitStatus) -> Result<(), RunnerError> {
    if status.success() {
        Ok(())
    } else {
        Err(RunnerError::Worker {
            backend: backend.to_string(),
            status: status.to_string(),
        })
    }
}

/// Run one configuration for several backends, one process each.
///
/// All workers start before any is awaited.
///
/// # Errors
///
/// Returns an error if a worker cannot be spawned or awaited. Workers
/// that exit unsuccessfully are reported in the outcomes.
pub fn run_workers(
    worker: &WorkerCommand,
    run: &RunConfig,
    backends: &[String],
) -> Result<Vec<WorkerOutcome>, RunnerError> {
    let children = backends
        .iter()
        .map(|backend| Ok((backend, worker.spawn(run, backend)?)))
        .collect::<Result<Vec<_>, RunnerError>>()?;

    let mut outcomes = Vec::with_capacity(children.len());
    for (backend, mut child) in children {
        let status = child.wait()?;
        let success = match check(backend, status) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(backend = %backend, error = %e, "Worker failed");
                false
            }
        };
        outcomes.push(WorkerOutcome {
            backend: backend.clone(),
            run: run_label(run),
            success,
        });
    }
    Ok(outcomes)
}

/// Run every configuration of a plan.
///
/// Each backend gets its own thread that runs the plan's configurations
/// one worker process at a time; a failed configuration is logged and the
/// chain moves on to the next one.
#[must_use]
pub fn run_plan(worker: &WorkerCommand, plan: &Plan) -> Vec<WorkerOutcome> {
    let runs = plan.all_runs();

    thread::scope(|scope| {
        let handles: Vec<_> = plan
            .backends
            .iter()
            .map(|backend| {
                let runs = &runs;
                scope.spawn(move || {
                    runs.iter()
                        .map(|run| {
                            let success = worker
                                .command(run, backend)
                                .status()
                                .map_err(RunnerError::from)
                                .and_then(|status| check(backend, status))
                                .map_err(|e| {
                                    tracing::error!(
                                        backend = %backend,
                                        run = %run_label(run),
                                        error = %e,
                                        "Run failed"
                                    );
                                })
                                .is_ok();
                            WorkerOutcome {
                                backend: backend.clone(),
                                run: run_label(run),
                                success,
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap_or_default())
            .collect()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Sweep;
    use crate::dataset::{DatasetSpec, Example};
    use crate::prompt::AxisSelectors;
    use crate::templates::Axis;
    use serde_json::json;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Rows(Vec<Example>);

    impl DatasetSource for Rows {
        fn load(&self, _spec: &DatasetSpec) -> Result<Vec<Example>, DatasetError> {
            Ok(self.0.clone())
        }
    }

    struct Echo(AtomicUsize);

    impl ChatBackend for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        fn chat(&self, _system: &str, _user: &str) -> Result<String, BackendError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                Err(BackendError::Invocation("boom".into()))
            } else {
                Ok("label: yes\nconfidence score: 0.9".into())
            }
        }
    }

    fn write_templates(root: &Path) {
        let dir = root.join("Mental-Health").join("Classification");
        fs::create_dir_all(&dir).unwrap();
        let docs = [
            (Axis::SystemInstruction, json!({"persona": {"none": "You label posts. "}})),
            (Axis::TaskQuery, json!({"dreaddit": "Is the poster stressed? "})),
            (Axis::PromptStrategy, json!({"dreaddit": {"none": "Answer directly. ", "fewshot_icl": "Post: {context} Label: {label_text}\n"}})),
            (Axis::ContextInput, json!({"dreaddit": "Post: {context}\n"})),
            (Axis::LabelDef, json!({"none": "{}"})),
            (Axis::OutputIndicator, json!({"dreaddit": "Reply with label and confidence score."})),
        ];
        for (axis, doc) in docs {
            fs::write(dir.join(axis.file_name()), doc.to_string()).unwrap();
        }
    }

    fn run(ps: &str, shot: usize) -> RunConfig {
        RunConfig {
            data_task: "Mental-Health".into(),
            problem_task: "Classification".into(),
            data: "dreaddit".into(),
            selectors: AxisSelectors {
                system_instruction: "persona-none".into(),
                task_query: "dreaddit".into(),
                prompt_strategy: ps.into(),
                context: "dreaddit".into(),
                label_def: "none".into(),
                output_indicator: "dreaddit".into(),
            },
            shot,
            max_rows: 4,
        }
    }

    fn rows() -> Rows {
        Rows(
            (0..6)
                .map(|i| {
                    let (label, text) = if i < 3 { (0, "yes") } else { (1, "no") };
                    Example::text(&format!("post {i}"), label, text, &["yes", "no"])
                })
                .collect(),
        )
    }

    fn driver(tmp: &TempDir) -> EvaluationDriver {
        let config = HarnessConfig {
            results_root: tmp.path().join("results"),
            template_root: tmp.path().join("templates"),
            ..HarnessConfig::default()
        };
        write_templates(&config.template_root);
        EvaluationDriver::new(&config)
    }

    // =========================================================================
    // Driver
    // =========================================================================

    #[test]
    fn test_backend_failure_becomes_sentinel() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(Echo(AtomicUsize::new(0)));
        let summary = driver(&tmp)
            .run(&run("dreaddit-none", 0), &rows(), backend, InvocationPolicy::Single)
            .unwrap();

        assert_eq!(summary.written, 4);
        assert_eq!(summary.sentinels, 1);

        let sentinel_files = (0..4)
            .filter(|i| {
                fs::read_to_string(summary.dir.join(format!("answer{i}.txt")))
                    .unwrap()
                    .starts_with(SENTINEL_ANSWER)
            })
            .count();
        assert_eq!(sentinel_files, 1);
    }

    #[test]
    fn test_shots_are_skipped_and_strategy_dropped() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(Echo(AtomicUsize::new(0)));
        let summary = driver(&tmp)
            .run(
                &run("dreaddit-fewshot_icl", 2),
                &rows(),
                backend.clone(),
                InvocationPolicy::Retry(RetryPolicy::default()),
            )
            .unwrap();

        assert_eq!(summary.shots, 2);
        assert_eq!(summary.written, 2);
        assert!(summary.dir.ends_with("PS-dreaddit-fewshot_icl_shot-2/Echo"));

        let queries: Vec<String> = fs::read_dir(&summary.dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("query"))
            .map(|p| fs::read_to_string(p).unwrap())
            .collect();
        assert_eq!(queries.len(), 2);
        for query in queries {
            // shot memory carries the strategy-rendered exemplars
            assert_eq!(query.matches(" Label: ").count(), 2);
            assert!(query.contains("Reply with label and confidence score."));
        }
    }

    #[test]
    fn test_missing_selector_aborts() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(Echo(AtomicUsize::new(0)));
        let err = driver(&tmp)
            .run(&run("dreaddit-cot", 0), &rows(), backend, InvocationPolicy::Single)
            .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Template(TemplateError::Resolution { .. })
        ));
    }

    #[test]
    fn test_run_named_unknown_backend() {
        let tmp = TempDir::new().unwrap();
        let err = driver(&tmp)
            .run_named(
                &run("dreaddit-none", 0),
                &rows(),
                "NoSuchModel",
                &BackendRegistry::default(),
                &Credentials::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Backend(BackendError::UnknownBackend(_))
        ));
    }

    // =========================================================================
    // Workers
    // =========================================================================

    #[test]
    fn test_worker_args() {
        let worker = WorkerCommand::new("affect-eval", Some(Path::new("harness.yaml")));
        let args = worker.args(&run("dreaddit-none", 0), "GPT4o");
        assert_eq!(args[0], "evaluate");
        let joined = args.join(" ");
        assert!(joined.contains("--si persona-none"));
        assert!(joined.contains("--ps dreaddit-none"));
        assert!(joined.contains("--shot 0"));
        assert!(joined.contains("--max-rows 4"));
        assert!(joined.contains("--backends GPT4o"));
        assert!(joined.ends_with("--config harness.yaml"));

        let live = worker
            .with_shot_strategy(Some(ShotStrategy::LiveCompletion))
            .args(&run("dreaddit-fewshot_icl", 2), "Sonnet");
        assert!(live.join(" ").contains("--shot-strategy live_completion --config"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_workers_reports_exit_status() {
        let backends = vec!["A".to_string(), "B".to_string()];
        let ok = run_workers(&WorkerCommand::new("true", None), &run("dreaddit-none", 0), &backends)
            .unwrap();
        assert_eq!(ok.len(), 2);
        assert!(ok.iter().all(|o| o.success));

        let failed = run_workers(&WorkerCommand::new("false", None), &run("dreaddit-none", 0), &backends)
            .unwrap();
        assert!(failed.iter().all(|o| !o.success));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_plan_covers_every_pair() {
        let plan = Plan {
            backends: vec!["A".into(), "B".into()],
            runs: vec![run("dreaddit-none", 0)],
            sweeps: vec![Sweep {
                data_task: "Mental-Health".into(),
                problem_task: "Classification".into(),
                data: "dreaddit".into(),
                system_instruction: "persona-none".into(),
                task_queries: vec!["dreaddit".into()],
                context: "dreaddit".into(),
                label_def: "none".into(),
                output_indicator: "dreaddit".into(),
                ps_base: "dreaddit".into(),
                shots: vec![0, 2],
                max_rows: 4,
            }],
        };

        let outcomes = run_plan(&WorkerCommand::new("true", None), &plan);
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(outcomes.iter().filter(|o| o.backend == "B").count(), 3);
    }
}
