//! # affect-eval
//!
//! Prompt-matrix benchmarking of LLM backends on emotion and mental-health
//! classification datasets.
//!
//! A run fixes one template variant per prompt axis (system instruction,
//! task query, prompting strategy, context framing, label definitions,
//! output indicator), a dataset, a shot count and a backend. Every sampled
//! example is rendered, sent to the backend and filed as a query/answer
//! transcript; an offline pass parses the answers back into labels and
//! reports classification metrics per backend.
//!
//! ## Architecture
//!
//! ```text
//! Template Store (JSON per axis)
//!        ↓
//! Prompt Generator ←── Few-Shot Accumulator (shot memory)
//!        ↓
//! Model Adapter (retry + timeout, sentinel on exhaustion)
//!        ↓
//! Transcripts  <results>/<data>/<task>/<SI>/<TQ>/PS-<PS>_shot-<N>/<backend>/
//!        ↓
//! Aggregator (answer parsing, F1 / accuracy / confidence correlation)
//!        ↓
//! aggregated_results.md / .json
//! ```

pub mod adapter;
pub mod aggregate;
pub mod backends;
pub mod config;
pub mod dataset;
pub mod metrics;
pub mod prompt;
pub mod render;
pub mod report;
pub mod runner;
pub mod sampling;
pub mod shots;
pub mod templates;
pub mod transcript;

pub use adapter::{
    AdapterError, Exchange, InvocationPolicy, ModelAdapter, RetryPolicy, SENTINEL_ANSWER,
};
pub use aggregate::{backend_dirs, config_dirs, AggregateError, Aggregator};
pub use backends::{builtin_backends, BackendError, BackendRegistry, BackendSpec, ChatBackend};
pub use config::{
    ConfigError, Credentials, HarnessConfig, Plan, PlanLoader, RetrySettings, RunConfig,
    ShotStrategy, Sweep,
};
pub use dataset::{
    lookup, preprocess, Context, DatasetError, DatasetSource, DatasetSpec, Example, Gold,
    JsonlSource, CATALOG,
};
pub use metrics::{
    accuracy, pearson, score, ClassScores, ClassificationMetrics, ClassificationReport,
};
pub use prompt::{AxisSelectors, LabelDef, PromptGenerator, PromptRecord, ShotMode};
pub use render::{conditional_format, FieldValue, RenderError};
pub use report::{AggregateReport, AggregatedResult};
pub use runner::{
    run_plan, run_workers, EvaluationDriver, RunSummary, RunnerError, WorkerCommand,
    WorkerOutcome,
};
pub use sampling::{balanced_sampling, LabelSequence, DEFAULT_SEED};
pub use shots::{select_shots, FewShotAccumulator, ShotMemory};
pub use templates::{Axis, GeneralPrompt, RoleTemplates, TemplateError, TemplateStore};
pub use transcript::{
    backend_dir, config_dir, AnswerParser, FolderInfo, ParsedAnswer, Trailer, TranscriptError,
    TranscriptWriter,
};
