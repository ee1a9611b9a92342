//! Dataset catalog and loading.
//!
//! Rows are read through a [`DatasetSource`]; the bundled [`JsonlSource`]
//! reads `<data_root>/<dataset>.jsonl`, one JSON object per line. The
//! catalog fixes each dataset's candidate label names and whether its rows
//! are stratified before evaluation.

use crate::render::{render_list, FieldValue};
use crate::sampling::{balanced_sampling, LabelSequence};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading a dataset
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("Dataset file not found: {0}")]
    NotFound(String),

    #[error("Dataset {0} has no rows")]
    Empty(String),

    #[error("Row {line} of {path} is invalid: {source}")]
    InvalidRow {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Row {0} has no per-row choices")]
    MissingChoices(usize),

    #[error("Row {0} mixes single and per-turn fields")]
    ShapeMismatch(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Text the model classifies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Context {
    /// A single post, sentence or scenario
    Text(String),
    /// A multi-turn conversation
    Dialogue(Vec<String>),
}

/// Gold annotation of a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gold {
    /// One label for the whole row
    Single { label: i64, text: String },
    /// One label per dialogue turn
    PerTurn { labels: Vec<i64>, texts: Vec<String> },
}

/// One dataset row, read-only after loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    /// Classified text
    pub context: Context,
    /// Gold label(s)
    pub gold: Gold,
    /// Ordered candidate label names
    pub label_list: Vec<String>,
    /// Optional subject or topic
    pub subject: Option<String>,
}

impl Example {
    /// Single-label example, mostly useful for fixtures
    #[must_use]
    pub fn text(context: &str, label: i64, label_text: &str, label_list: &[&str]) -> Self {
        Self {
            context: Context::Text(context.to_string()),
            gold: Gold::Single {
                label,
                text: label_text.to_string(),
            },
            label_list: label_list.iter().map(ToString::to_string).collect(),
            subject: None,
        }
    }

    /// Context as a template field
    #[must_use]
    pub fn context_field(&self) -> FieldValue {
        match &self.context {
            Context::Text(text) => FieldValue::Text(text.clone()),
            Context::Dialogue(turns) => FieldValue::Turns(turns.clone()),
        }
    }

    /// Gold label text as a template field
    #[must_use]
    pub fn label_text_field(&self) -> FieldValue {
        match &self.gold {
            Gold::Single { text, .. } => FieldValue::Text(text.clone()),
            Gold::PerTurn { texts, .. } => FieldValue::Turns(texts.clone()),
        }
    }

    /// Candidate labels as a template field
    #[must_use]
    pub fn label_list_field(&self) -> FieldValue {
        FieldValue::List(self.label_list.clone())
    }

    /// Subject as a template field, when present
    #[must_use]
    pub fn subject_field(&self) -> Option<FieldValue> {
        self.subject.clone().map(FieldValue::Text)
    }

    /// Gold label text as written to the `TrueAnswer:` trailer
    #[must_use]
    pub fn label_text_repr(&self) -> String {
        self.label_text_field().render()
    }

    /// Candidate labels as written to the `TrueLabellist:` trailer
    #[must_use]
    pub fn label_list_repr(&self) -> String {
        render_list(&self.label_list)
    }
}

/// Catalog entry for a known dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetSpec {
    /// Dataset name as used on the command line and in result paths
    pub name: &'static str,
    /// Fixed candidate labels; empty when each row carries its own choices
    pub labels: &'static [&'static str],
    /// Whether rows are stratified by label before evaluation
    pub stratified: bool,
}

impl DatasetSpec {
    /// Whether rows carry their own label list
    #[must_use]
    pub fn per_row_choices(&self) -> bool {
        self.labels.is_empty()
    }
}

const GOEMOTION_LABELS: &[&str] = &[
    "admiration",
    "amusement",
    "anger",
    "annoyance",
    "approval",
    "caring",
    "confusion",
    "curiosity",
    "desire",
    "disappointment",
    "disapproval",
    "disgust",
    "embarrassment",
    "excitement",
    "fear",
    "gratitude",
    "grief",
    "joy",
    "love",
    "nervousness",
    "optimism",
    "pride",
    "realization",
    "relief",
    "remorse",
    "sadness",
    // Matches the label text the source annotations use
    "surpris",
    "neutral",
];

/// Known datasets
pub const CATALOG: &[DatasetSpec] = &[
    DatasetSpec {
        name: "iemocap",
        labels: &["happy", "sad", "neutral", "angry", "excited", "frustrated"],
        stratified: true,
    },
    DatasetSpec {
        name: "emobench",
        labels: &[],
        stratified: false,
    },
    DatasetSpec {
        name: "goemotion",
        labels: GOEMOTION_LABELS,
        stratified: true,
    },
    DatasetSpec {
        name: "dreaddit",
        labels: &["yes", "no"],
        stratified: true,
    },
    DatasetSpec {
        name: "cssrs",
        labels: &["supportive", "indicator", "ideation", "behavior", "attempt"],
        stratified: true,
    },
    DatasetSpec {
        name: "sdcnl",
        labels: &["depression", "suicidal"],
        stratified: true,
    },
];

/// Look up a dataset in the catalog
///
/// # Errors
///
/// Returns `DatasetError::UnknownDataset` for names outside the catalog.
pub fn lookup(name: &str) -> Result<&'static DatasetSpec, DatasetError> {
    CATALOG
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| DatasetError::UnknownDataset(name.to_string()))
}

/// Read-only provider of dataset rows
pub trait DatasetSource {
    /// Load every row of a dataset in source order
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset cannot be read.
    fn load(&self, spec: &DatasetSpec) -> Result<Vec<Example>, DatasetError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawContext {
    Text(String),
    Dialogue(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLabel {
    One(i64),
    Many(Vec<i64>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLabelText {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct RawRow {
    #[serde(
        alias = "post",
        alias = "Post",
        alias = "text",
        alias = "sentence",
        alias = "scenario",
        alias = "conversation"
    )]
    context: RawContext,
    label: RawLabel,
    label_text: RawLabelText,
    #[serde(default)]
    choices: Option<Vec<String>>,
    #[serde(default)]
    subject: Option<String>,
}

impl RawRow {
    fn into_example(self, spec: &DatasetSpec, line: usize) -> Result<Example, DatasetError> {
        let context = match self.context {
            RawContext::Text(text) => Context::Text(text),
            RawContext::Dialogue(turns) => Context::Dialogue(turns),
        };

        let gold = match (self.label, self.label_text) {
            (RawLabel::One(label), RawLabelText::One(text)) => Gold::Single { label, text },
            (RawLabel::Many(labels), RawLabelText::Many(texts)) if labels.len() == texts.len() => {
                Gold::PerTurn { labels, texts }
            }
            _ => return Err(DatasetError::ShapeMismatch(line)),
        };

        let label_list = if spec.per_row_choices() {
            self.choices.ok_or(DatasetError::MissingChoices(line))?
        } else {
            spec.labels.iter().map(ToString::to_string).collect()
        };

        Ok(Example {
            context,
            gold,
            label_list,
            subject: self.subject,
        })
    }
}

/// Dataset source reading `<root>/<name>.jsonl`
#[derive(Debug, Clone)]
pub struct JsonlSource {
    root: PathBuf,
}

impl JsonlSource {
    /// Create a source rooted at a data directory
    #[must_use]
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Path of a dataset file
    #[must_use]
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.jsonl"))
    }
}

impl DatasetSource for JsonlSource {
    fn load(&self, spec: &DatasetSpec) -> Result<Vec<Example>, DatasetError> {
        let path = self.path_for(spec.name);
        if !path.exists() {
            return Err(DatasetError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(&path)?;
        let mut rows = Vec::new();

        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let raw: RawRow =
                serde_json::from_str(line).map_err(|source| DatasetError::InvalidRow {
                    path: path.display().to_string(),
                    line: i + 1,
                    source,
                })?;
            rows.push(raw.into_example(spec, i + 1)?);
        }

        if rows.is_empty() {
            return Err(DatasetError::Empty(spec.name.to_string()));
        }

        tracing::debug!(dataset = spec.name, rows = rows.len(), "Loaded dataset");
        Ok(rows)
    }
}

/// Reduce loaded rows to the evaluation set.
///
/// Unstratified datasets keep every row in source order. Stratified datasets
/// cap `max_rows` at the row count and draw a label-balanced sample.
#[must_use]
pub fn preprocess(
    spec: &DatasetSpec,
    rows: &[Example],
    max_rows: usize,
    seed: u64,
) -> Vec<Example> {
    if !spec.stratified {
        return rows.to_vec();
    }

    let max_rows = max_rows.min(rows.len());
    let labels = if rows.iter().any(|row| matches!(row.gold, Gold::PerTurn { .. })) {
        LabelSequence::Nested(
            rows.iter()
                .map(|row| match &row.gold {
                    Gold::Single { label, .. } => vec![*label],
                    Gold::PerTurn { labels, .. } => labels.clone(),
                })
                .collect(),
        )
    } else {
        LabelSequence::Flat(
            rows.iter()
                .filter_map(|row| match &row.gold {
                    Gold::Single { label, .. } => Some(*label),
                    Gold::PerTurn { .. } => None,
                })
                .collect(),
        )
    };

    let sampled: Vec<Example> = balanced_sampling(&labels, max_rows, seed)
        .into_iter()
        .map(|i| rows[i].clone())
        .collect();

    tracing::info!(
        dataset = spec.name,
        available = rows.len(),
        sampled = sampled.len(),
        "Stratified sample drawn"
    );
    sampled
}
