//! Configuration for the harness, individual runs and batch plans.
//!
//! The harness configuration is YAML with every field defaulted, run
//! configurations describe one point of the prompt matrix, and plan files
//! bundle runs for a set of backends.

use crate::adapter::RetryPolicy;
use crate::backends::BackendSpec;
use crate::prompt::AxisSelectors;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse credentials: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid shot strategy: {0}")]
    InvalidShotStrategy(String),
}

/// How shot memory is produced
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShotStrategy {
    /// Flatten exemplar prompts built from gold labels
    #[default]
    TeacherForcing,
    /// Ask the backend and keep its completion
    LiveCompletion,
}

impl ShotStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TeacherForcing => "teacher_forcing",
            Self::LiveCompletion => "live_completion",
        }
    }
}

impl std::str::FromStr for ShotStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "teacher_forcing" => Ok(Self::TeacherForcing),
            "live_completion" | "live" => Ok(Self::LiveCompletion),
            _ => Err(ConfigError::InvalidShotStrategy(s.to_string())),
        }
    }
}

/// Retry budget for hosted and daemon backends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    /// Attempts per example
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Wall-clock limit per attempt
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_attempts() -> u32 {
    5
}
const fn default_timeout_secs() -> u64 {
    10
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RetrySettings {
    /// Policy used by the model adapter
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Harness-wide settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessConfig {
    /// Root directory for transcripts
    #[serde(default = "default_results_root")]
    pub results_root: PathBuf,
    /// Root directory of the template store
    #[serde(default = "default_template_root")]
    pub template_root: PathBuf,
    /// Directory holding `<dataset>.jsonl` files
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// JSON file mapping backend name to API key
    #[serde(default = "default_credentials")]
    pub credentials: PathBuf,
    /// Seed for sampling and shot selection
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Retry budget
    #[serde(default)]
    pub retry: RetrySettings,
    /// Shot memory strategy
    #[serde(default)]
    pub shot_strategy: ShotStrategy,
    /// Extra or overriding backend definitions
    #[serde(default)]
    pub backends: BTreeMap<String, BackendSpec>,
}

fn default_results_root() -> PathBuf {
    PathBuf::from("results")
}
fn default_template_root() -> PathBuf {
    PathBuf::from("templates")
}
fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}
fn default_credentials() -> PathBuf {
    PathBuf::from("api_keys.json")
}
const fn default_seed() -> u64 {
    42
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            results_root: default_results_root(),
            template_root: default_template_root(),
            data_root: default_data_root(),
            credentials: default_credentials(),
            seed: default_seed(),
            retry: RetrySettings::default(),
            shot_strategy: ShotStrategy::default(),
            backends: BTreeMap::new(),
        }
    }
}

impl HarnessConfig {
    /// Load harness configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load harness configuration from a YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load from `path` when given, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if a given file cannot be read or parsed.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }
}

/// Backend name to credential string
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Credentials {
    keys: HashMap<String, String>,
}

impl Credentials {
    /// Load credentials from a JSON object file.
    ///
    /// A missing file yields empty credentials; hosted backends then fail
    /// at construction with a missing-credential error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Credentials file not found; hosted backends unavailable");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Credential for a backend
    #[must_use]
    pub fn get(&self, backend: &str) -> Option<&str> {
        self.keys.get(backend).map(String::as_str)
    }

    /// Add or replace a credential
    pub fn insert(&mut self, backend: impl Into<String>, key: impl Into<String>) {
        self.keys.insert(backend.into(), key.into());
    }
}

/// Problem task whose answers carry gold-label trailers
pub const CLASSIFICATION_TASK: &str = "Classification";

/// One point of the prompt matrix
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunConfig {
    /// Data task directory (`Emotion`, `Mental-Health`)
    pub data_task: String,
    /// Problem task directory (`Classification`, `Reasoning`)
    pub problem_task: String,
    /// Dataset name
    #[serde(alias = "dataset")]
    pub data: String,
    /// Axis selectors
    #[serde(flatten)]
    pub selectors: AxisSelectors,
    /// In-context examples
    #[serde(default)]
    pub shot: usize,
    /// Row cap before stratified sampling
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

const fn default_max_rows() -> usize {
    200
}

impl RunConfig {
    /// Whether answers get gold-label trailers
    #[must_use]
    pub fn is_classification(&self) -> bool {
        self.problem_task == CLASSIFICATION_TASK
    }
}

/// A task swept over task queries and shot counts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sweep {
    pub data_task: String,
    pub problem_task: String,
    pub data: String,
    #[serde(rename = "SI")]
    pub system_instruction: String,
    #[serde(rename = "TQ")]
    pub task_queries: Vec<String>,
    #[serde(rename = "CT")]
    pub context: String,
    #[serde(rename = "LD", default = "default_label_def")]
    pub label_def: String,
    #[serde(rename = "OI")]
    pub output_indicator: String,
    /// Strategy prefix; `-none` is appended for zero-shot, `-fewshot_icl` otherwise
    pub ps_base: String,
    #[serde(default = "default_shots")]
    pub shots: Vec<usize>,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

fn default_label_def() -> String {
    "none".to_string()
}
fn default_shots() -> Vec<usize> {
    vec![0]
}

impl Sweep {
    /// Expand into one run per (task query, shot count)
    #[must_use]
    pub fn expand(&self) -> Vec<RunConfig> {
        let mut runs = Vec::with_capacity(self.task_queries.len() * self.shots.len());
        for task_query in &self.task_queries {
            for &shot in &self.shots {
                let strategy = if shot == 0 { "none" } else { "fewshot_icl" };
                runs.push(RunConfig {
                    data_task: self.data_task.clone(),
                    problem_task: self.problem_task.clone(),
                    data: self.data.clone(),
                    selectors: AxisSelectors {
                        system_instruction: self.system_instruction.clone(),
                        task_query: task_query.clone(),
                        prompt_strategy: format!("{}-{strategy}", self.ps_base),
                        context: self.context.clone(),
                        label_def: self.label_def.clone(),
                        output_indicator: self.output_indicator.clone(),
                    },
                    shot,
                    max_rows: self.max_rows,
                });
            }
        }
        runs
    }
}

/// Batch of runs for a set of backends
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    /// Backend names; each gets its own worker
    pub backends: Vec<String>,
    /// Explicit runs
    #[serde(default)]
    pub runs: Vec<RunConfig>,
    /// Runs generated from sweeps, appended after explicit runs
    #[serde(default)]
    pub sweeps: Vec<Sweep>,
}

impl Plan {
    /// Load a plan from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or names no backend.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load a plan from a YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed or names no backend.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let plan: Self = serde_yaml::from_str(yaml)?;
        if plan.backends.is_empty() {
            return Err(ConfigError::MissingField("backends".to_string()));
        }
        Ok(plan)
    }

    /// Every run of the plan in execution order
    #[must_use]
    pub fn all_runs(&self) -> Vec<RunConfig> {
        let mut runs = self.runs.clone();
        for sweep in &self.sweeps {
            runs.extend(sweep.expand());
        }
        runs
    }
}

/// Plan loader for glob patterns such as `plans/*.yaml`
pub struct PlanLoader {
    plans: Vec<(PathBuf, Plan)>,
}

impl PlanLoader {
    /// Create a new empty loader
    #[must_use]
    pub const fn new() -> Self {
        Self { plans: Vec::new() }
    }

    /// Load plans from a glob pattern
    ///
    /// # Errors
    ///
    /// Returns an error if the glob pattern is invalid or a file cannot be loaded.
    pub fn load_glob(pattern: &str) -> Result<Self, ConfigError> {
        let mut loader = Self::new();

        let paths = glob::glob(pattern)
            .map_err(|e| ConfigError::MissingField(format!("Invalid glob pattern: {e}")))?;

        for entry in paths {
            let path = entry
                .map_err(|e| ConfigError::IoError(std::io::Error::other(format!("Glob error: {e}"))))?;
            let plan = Plan::load(&path)?;
            loader.plans.push((path, plan));
        }

        Ok(loader)
    }

    /// Loaded plans with their source paths
    #[must_use]
    pub fn plans(&self) -> &[(PathBuf, Plan)] {
        &self.plans
    }

    /// Number of loaded plans
    #[must_use]
    pub const fn len(&self) -> usize {
        self.plans.len()
    }

    /// Check if no plans are loaded
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

impl Default for PlanLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tempfile::TempDir;

    const RUN_YAML: &str = r"
data_task: Emotion
problem_task: Classification
data: goemotion
SI: persona-expert
TQ: goemotion
PS: goemotion-none
CT: goemotion
LD: none
OI: goemotion
";

    // =========================================================================
    // Harness config
    // =========================================================================

    #[test]
    fn test_harness_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.results_root, PathBuf::from("results"));
        assert_eq!(config.credentials, PathBuf::from("api_keys.json"));
        assert_eq!(config.seed, 42);
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.policy().timeout, Duration::from_secs(10));
        assert_eq!(config.shot_strategy, ShotStrategy::TeacherForcing);
        assert!(config.backends.is_empty());
    }

    #[test]
    fn test_harness_partial_yaml() {
        let config = HarnessConfig::from_yaml(
            r"
results_root: out
retry:
  attempts: 2
shot_strategy: live_completion
backends:
  Local:
    kind: ollama
    model: llama3.1:8b
",
        )
        .unwrap();
        assert_eq!(config.results_root, PathBuf::from("out"));
        assert_eq!(config.template_root, PathBuf::from("templates"));
        assert_eq!(config.retry.attempts, 2);
        assert_eq!(config.retry.timeout_secs, 10);
        assert_eq!(config.shot_strategy, ShotStrategy::LiveCompletion);
        assert!(config.backends.contains_key("Local"));
    }

    #[test]
    fn test_harness_serialization_roundtrip() {
        let config = HarnessConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert_eq!(HarnessConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_load_or_default_without_path() {
        assert_eq!(
            HarnessConfig::load_or_default(None).unwrap(),
            HarnessConfig::default()
        );
    }

    #[test]
    fn test_shot_strategy_parsing() {
        assert_eq!(
            ShotStrategy::from_str("teacher-forcing").unwrap(),
            ShotStrategy::TeacherForcing
        );
        assert_eq!(
            ShotStrategy::from_str("LIVE").unwrap(),
            ShotStrategy::LiveCompletion
        );
        assert!(matches!(
            ShotStrategy::from_str("random"),
            Err(ConfigError::InvalidShotStrategy(_))
        ));
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    #[test]
    fn test_credentials_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("api_keys.json");
        std::fs::write(&path, r#"{"GPT4o": "sk-test", "Sonnet": "sk-ant"}"#).unwrap();
        let credentials = Credentials::load(&path).unwrap();
        assert_eq!(credentials.get("GPT4o"), Some("sk-test"));
        assert_eq!(credentials.get("Gemini"), None);
    }

    #[test]
    fn test_credentials_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let credentials = Credentials::load(temp.path().join("none.json")).unwrap();
        assert_eq!(credentials, Credentials::default());
    }

    #[test]
    fn test_credentials_invalid_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("api_keys.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(
            Credentials::load(&path),
            Err(ConfigError::JsonError(_))
        ));
    }

    // =========================================================================
    // Runs, sweeps and plans
    // =========================================================================

    #[test]
    fn test_run_config_from_yaml() {
        let run: RunConfig = serde_yaml::from_str(RUN_YAML).unwrap();
        assert_eq!(run.selectors.system_instruction, "persona-expert");
        assert_eq!(run.selectors.prompt_strategy, "goemotion-none");
        assert_eq!(run.shot, 0);
        assert_eq!(run.max_rows, 200);
        assert!(run.is_classification());
    }

    #[test]
    fn test_sweep_expansion() {
        let sweep: Sweep = serde_yaml::from_str(
            r"
data_task: Mental-Health
problem_task: Classification
data: dreaddit
SI: persona-expert
TQ: [dreaddit-Clear, dreaddit-EmDe]
CT: dreaddit
OI: dreaddit
ps_base: dreaddit
shots: [0, 2]
",
        )
        .unwrap();
        let runs = sweep.expand();
        assert_eq!(runs.len(), 4);
        assert_eq!(runs[0].selectors.prompt_strategy, "dreaddit-none");
        assert_eq!(runs[1].selectors.prompt_strategy, "dreaddit-fewshot_icl");
        assert_eq!(runs[1].shot, 2);
        assert_eq!(runs[2].selectors.task_query, "dreaddit-EmDe");
        assert_eq!(runs[0].selectors.label_def, "none");
    }

    #[test]
    fn test_plan_requires_backends() {
        let err = Plan::from_yaml("backends: []\nruns: []\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn test_plan_loader_glob() {
        let temp = TempDir::new().unwrap();
        let body = format!("backends: [GPT4o, Gemini]\nruns:\n  - {}", RUN_YAML.trim().replace('\n', "\n    "));
        std::fs::write(temp.path().join("a.yaml"), &body).unwrap();
        std::fs::write(temp.path().join("b.yaml"), &body).unwrap();
        std::fs::write(temp.path().join("notes.txt"), "skip").unwrap();

        let pattern = format!("{}/*.yaml", temp.path().display());
        let loader = PlanLoader::load_glob(&pattern).unwrap();
        assert_eq!(loader.len(), 2);
        let (_, plan) = &loader.plans()[0];
        assert_eq!(plan.backends, vec!["GPT4o".to_string(), "Gemini".to_string()]);
        assert_eq!(plan.all_runs().len(), 1);
    }

    #[test]
    fn test_plan_loader_no_matches() {
        let loader = PlanLoader::load_glob("nonexistent-dir/*.yaml").unwrap();
        assert!(loader.is_empty());
    }
}
