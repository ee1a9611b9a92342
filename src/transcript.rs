//! Transcript files.
//!
//! Layout of a run on disk and the parser that turns a free-text answer
//! file back into a predicted label, a confidence score and the gold
//! trailers the driver appended.
//!
//! ```text
//! <results>/<data>/<problem_task>/<SI>/<TQ>/PS-<PS>_shot-<shot>/<backend>/
//!     query0.txt   answer0.txt
//!     query1.txt   answer1.txt
//! ```

use crate::adapter::Exchange;
use crate::config::RunConfig;
use crate::dataset::Example;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while writing or parsing transcripts
#[derive(Error, Debug)]
pub enum TranscriptError {
    #[error("Confidence score missing")]
    MissingConfidence,

    #[error("Confidence score is not a number: {0}")]
    InvalidConfidence(String),

    #[error("Answer is missing field: {0}")]
    MissingField(&'static str),

    #[error("Label not in candidate list: {label}")]
    LabelLookup { label: String },

    #[error("Invalid answer pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

const QUERY_PREFIX: &str = "query";
const ANSWER_PREFIX: &str = "answer";
const TRANSCRIPT_EXT: &str = "txt";
const SHOT_MARKER: &str = "_shot-";
const STRATEGY_MARKER: &str = "PS-";

/// Directory shared by every backend of one configuration
#[must_use]
pub fn config_dir(results_root: &Path, run: &RunConfig) -> PathBuf {
    results_root
        .join(&run.data)
        .join(&run.problem_task)
        .join(&run.selectors.system_instruction)
        .join(&run.selectors.task_query)
        .join(format!(
            "{STRATEGY_MARKER}{}{SHOT_MARKER}{}",
            run.selectors.prompt_strategy, run.shot
        ))
}

/// Directory owned by one backend of one configuration
#[must_use]
pub fn backend_dir(results_root: &Path, run: &RunConfig, backend: &str) -> PathBuf {
    config_dir(results_root, run).join(backend)
}

/// Gold-label lines appended to classification answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub true_answer: String,
    pub label_list: String,
}

impl Trailer {
    #[must_use]
    pub fn for_example(example: &Example) -> Self {
        Self {
            true_answer: example.label_text_repr(),
            label_list: example.label_list_repr(),
        }
    }

    fn render(&self) -> String {
        format!(
            "\n\nTrueAnswer:{}\n\nTrueLabellist:{}",
            self.true_answer, self.label_list
        )
    }
}

/// Writes query/answer pairs into one backend directory
#[derive(Debug, Clone)]
pub struct TranscriptWriter {
    dir: PathBuf,
}

impl TranscriptWriter {
    /// Create the directory (and parents) if needed
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self, TranscriptError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn query_path(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("{QUERY_PREFIX}{index}.{TRANSCRIPT_EXT}"))
    }

    #[must_use]
    pub fn answer_path(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("{ANSWER_PREFIX}{index}.{TRANSCRIPT_EXT}"))
    }

    /// Write `query<index>.txt` and `answer<index>.txt`, overwriting
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be written.
    pub fn write(
        &self,
        index: usize,
        exchange: &Exchange,
        trailer: Option<&Trailer>,
    ) -> Result<(), TranscriptError> {
        fs::write(self.query_path(index), &exchange.query)?;

        let mut answer = exchange.answer.clone();
        if let Some(trailer) = trailer {
            answer.push_str(&trailer.render());
        }
        fs::write(self.answer_path(index), answer)?;
        Ok(())
    }
}

/// Answer files of a backend directory, ordered by their numeric index.
///
/// A file qualifies when its name contains `answer` and ends in `.txt`.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn answer_files(dir: &Path) -> Result<Vec<PathBuf>, TranscriptError> {
    let mut files: Vec<(Option<usize>, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let suffix = format!(".{TRANSCRIPT_EXT}");
        if !name.contains(ANSWER_PREFIX) || !name.ends_with(&suffix) {
            continue;
        }
        let index = name
            .trim_end_matches(&suffix)
            .rsplit(ANSWER_PREFIX)
            .next()
            .and_then(|digits| digits.parse().ok());
        files.push((index, path));
    }
    files.sort();
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Structured fields recovered from an answer file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedAnswer {
    /// Predicted label, first element when the model answered with a list
    pub label: Option<String>,
    pub confidence: f64,
    pub true_answer: Option<String>,
    pub label_list: Option<Vec<String>>,
}

impl ParsedAnswer {
    /// Position of `label` in the candidate list (last duplicate wins)
    ///
    /// # Errors
    ///
    /// Returns `MissingField` without a label list, `LabelLookup` when
    /// the label is not a candidate.
    pub fn index_of(&self, label: &str) -> Result<usize, TranscriptError> {
        let list = self
            .label_list
            .as_ref()
            .ok_or(TranscriptError::MissingField("truelabellist"))?;
        list.iter()
            .rposition(|candidate| candidate == label)
            .ok_or_else(|| TranscriptError::LabelLookup {
                label: label.to_string(),
            })
    }

    /// (predicted index, gold index)
    ///
    /// # Errors
    ///
    /// Returns an error if either label is absent or not a candidate.
    pub fn indices(&self) -> Result<(usize, usize), TranscriptError> {
        let label = self
            .label
            .as_deref()
            .ok_or(TranscriptError::MissingField("label"))?;
        let truth = self
            .true_answer
            .as_deref()
            .ok_or(TranscriptError::MissingField("trueanswer"))?;
        Ok((self.index_of(label)?, self.index_of(truth)?))
    }
}

/// Compiled patterns for answer parsing
#[derive(Debug, Clone)]
pub struct AnswerParser {
    label_key: Regex,
    confidence_key: Regex,
    label: Regex,
    confidence: Regex,
    true_answer: Regex,
    label_list: Regex,
}

/// Substrings dropped before matching
const STRIPPED: &[&str] = &["**", "*", " & ", "#", "'", "\"", "<", ">"];

impl AnswerParser {
    /// # Errors
    ///
    /// Returns an error if a pattern fails to compile.
    pub fn new() -> Result<Self, TranscriptError> {
        Ok(Self {
            label_key: Regex::new(r"label\s*:\s*")?,
            confidence_key: Regex::new(r"confidence score\s*:\s*")?,
            label: Regex::new(r"label:\s*(\[.*?\]|\w+)")?,
            confidence: Regex::new(r"confidence score:\s*([\d.]+)")?,
            true_answer: Regex::new(r"trueanswer:\s*(\[[^\]]+\]|\w+)")?,
            label_list: Regex::new(r"truelabellist:\[(.*?)\]")?,
        })
    }

    /// Parse one answer text.
    ///
    /// Matching is case-insensitive (the text is lowercased) and ignores
    /// markdown emphasis, headings, quotes and angle brackets. The
    /// confidence score is mandatory; every other field is optional here
    /// and checked by [`ParsedAnswer::indices`].
    ///
    /// # Errors
    ///
    /// Returns `MissingConfidence` or `InvalidConfidence`.
    pub fn parse(&self, text: &str) -> Result<ParsedAnswer, TranscriptError> {
        let mut normalized = text.to_lowercase();
        for token in STRIPPED {
            normalized = normalized.replace(token, "");
        }
        let normalized = self.label_key.replace_all(&normalized, "label:");
        let normalized = self
            .confidence_key
            .replace_all(&normalized, "confidence score:");

        let label = self
            .label
            .captures(&normalized)
            .map(|caps| first_item(&caps[1]));

        let raw = self
            .confidence
            .captures(&normalized)
            .ok_or(TranscriptError::MissingConfidence)?;
        let confidence = raw[1]
            .parse::<f64>()
            .map_err(|_| TranscriptError::InvalidConfidence(raw[1].to_string()))?;

        let true_answer = self
            .true_answer
            .captures(&normalized)
            .map(|caps| first_item(&caps[1]));

        let label_list = self
            .label_list
            .captures(&normalized)
            .map(|caps| split_items(&caps[1]));

        Ok(ParsedAnswer {
            label,
            confidence,
            true_answer,
            label_list,
        })
    }
}

fn split_items(inner: &str) -> Vec<String> {
    inner
        .split(',')
        .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
        .collect()
}

/// Bare token, or first element of a `[a, b]` list
fn first_item(value: &str) -> String {
    if value.starts_with('[') {
        let inner = value.trim_matches(|c| c == '[' || c == ']');
        split_items(inner).into_iter().next().unwrap_or_default()
    } else {
        value.to_string()
    }
}

/// Selector values recovered from a configuration directory path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderInfo {
    #[serde(rename = "SI")]
    pub system_instruction: String,
    #[serde(rename = "TQ")]
    pub task_query: String,
    #[serde(rename = "PS")]
    pub prompt_strategy: String,
    #[serde(rename = "SHOT")]
    pub shot: String,
}

const UNKNOWN: &str = "Unknown";

impl FolderInfo {
    /// Read `.../<SI>/<TQ>/PS-<PS>_shot-<N>`; missing parts become `Unknown`
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let mut parts = path
            .components()
            .rev()
            .filter_map(|c| c.as_os_str().to_str());

        let (Some(leaf), Some(task_query), Some(system_instruction)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Self::unknown();
        };

        let body = leaf.strip_prefix(STRATEGY_MARKER).unwrap_or(leaf);
        let (prompt_strategy, shot) = body
            .rsplit_once(SHOT_MARKER)
            .unwrap_or((UNKNOWN, body));

        Self {
            system_instruction: system_instruction.to_string(),
            task_query: task_query.to_string(),
            prompt_strategy: prompt_strategy.to_string(),
            shot: shot.to_string(),
        }
    }

    fn unknown() -> Self {
        Self {
            system_instruction: UNKNOWN.to_string(),
            task_query: UNKNOWN.to_string(),
            prompt_strategy: UNKNOWN.to_string(),
            shot: UNKNOWN.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::prompt::AxisSelectors;
    use tempfile::TempDir;

    fn run() -> RunConfig {
        RunConfig {
            data_task: "Mental-Health".into(),
            problem_task: "Classification".into(),
            data: "dreaddit".into(),
            selectors: AxisSelectors {
                system_instruction: "persona-none".into(),
                task_query: "dreaddit".into(),
                prompt_strategy: "dreaddit-none".into(),
                context: "dreaddit".into(),
                label_def: "none".into(),
                output_indicator: "dreaddit".into(),
            },
            shot: 0,
            max_rows: 4,
        }
    }

    // =========================================================================
    // Layout
    // =========================================================================

    #[test]
    fn test_backend_dir_encodes_configuration() {
        let dir = backend_dir(Path::new("results"), &run(), "GPT4o");
        assert_eq!(
            dir,
            PathBuf::from(
                "results/dreaddit/Classification/persona-none/dreaddit/PS-dreaddit-none_shot-0/GPT4o"
            )
        );
    }

    #[test]
    fn test_write_appends_trailer() {
        let tmp = TempDir::new().unwrap();
        let writer = TranscriptWriter::create(tmp.path().join("b")).unwrap();
        let example = Example::text("I can't sleep", 0, "yes", &["yes", "no"]);
        let exchange = Exchange {
            query: "Q".into(),
            answer: "Label: yes".into(),
        };
        writer
            .write(3, &exchange, Some(&Trailer::for_example(&example)))
            .unwrap();

        assert_eq!(fs::read_to_string(writer.query_path(3)).unwrap(), "Q");
        assert_eq!(
            fs::read_to_string(writer.answer_path(3)).unwrap(),
            "Label: yes\n\nTrueAnswer:yes\n\nTrueLabellist:['yes', 'no']"
        );
    }

    #[test]
    fn test_write_without_trailer() {
        let tmp = TempDir::new().unwrap();
        let writer = TranscriptWriter::create(tmp.path()).unwrap();
        let exchange = Exchange {
            query: "Q".into(),
            answer: "free text".into(),
        };
        writer.write(0, &exchange, None).unwrap();
        assert_eq!(
            fs::read_to_string(writer.answer_path(0)).unwrap(),
            "free text"
        );
    }

    #[test]
    fn test_answer_files_numeric_order() {
        let tmp = TempDir::new().unwrap();
        for name in ["answer10.txt", "answer2.txt", "query2.txt", "answer1.md", "answer0.txt"] {
            fs::write(tmp.path().join(name), "x").unwrap();
        }
        let names: Vec<String> = answer_files(tmp.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["answer0.txt", "answer2.txt", "answer10.txt"]);
    }

    // =========================================================================
    // Parsing
    // =========================================================================

    #[test]
    fn test_parse_markdown_answer() {
        let parser = AnswerParser::new().unwrap();
        let text = "**Label:** Yes\n**Confidence Score:** 0.85\n\nTrueAnswer:yes\n\nTrueLabellist:['yes', 'no']";
        let parsed = parser.parse(text).unwrap();
        assert_eq!(parsed.label.as_deref(), Some("yes"));
        assert_eq!(parsed.confidence, 0.85);
        assert_eq!(parsed.true_answer.as_deref(), Some("yes"));
        assert_eq!(
            parsed.label_list,
            Some(vec!["yes".to_string(), "no".to_string()])
        );
        assert_eq!(parsed.indices().unwrap(), (0, 0));
    }

    #[test]
    fn test_parse_list_label_uses_first() {
        let parser = AnswerParser::new().unwrap();
        let parsed = parser
            .parse("label: [\"no\", \"yes\"]\nconfidence score: 1\nTrueAnswer:yes\nTrueLabellist:['yes', 'no']")
            .unwrap();
        assert_eq!(parsed.label.as_deref(), Some("no"));
        assert_eq!(parsed.indices().unwrap(), (1, 0));
    }

    #[test]
    fn test_parse_missing_confidence() {
        let parser = AnswerParser::new().unwrap();
        let err = parser
            .parse("Failed to get a response\n\nTrueAnswer:yes\n\nTrueLabellist:['yes', 'no']")
            .unwrap_err();
        assert!(matches!(err, TranscriptError::MissingConfidence));
    }

    #[test]
    fn test_parse_malformed_confidence() {
        let parser = AnswerParser::new().unwrap();
        let err = parser.parse("label: yes\nconfidence score: 0.5.1").unwrap_err();
        assert!(matches!(err, TranscriptError::InvalidConfidence(v) if v == "0.5.1"));
    }

    #[test]
    fn test_unknown_label_is_lookup_error() {
        let parser = AnswerParser::new().unwrap();
        let parsed = parser
            .parse("label: maybe\nconfidence score: 0.4\n\nTrueAnswer:yes\n\nTrueLabellist:['yes', 'no']")
            .unwrap();
        assert!(matches!(
            parsed.indices(),
            Err(TranscriptError::LabelLookup { label }) if label == "maybe"
        ));
    }

    #[test]
    fn test_missing_label_field() {
        let parser = AnswerParser::new().unwrap();
        let parsed = parser.parse("confidence score: 0.4").unwrap();
        assert!(matches!(
            parsed.indices(),
            Err(TranscriptError::MissingField("label"))
        ));
    }

    // =========================================================================
    // Folder info
    // =========================================================================

    #[test]
    fn test_folder_info_from_path() {
        let info = FolderInfo::from_path(Path::new(
            "results/cssrs/Classification/persona-expert/cssrs/PS-cssrs-fewshot_icl_shot-3",
        ));
        assert_eq!(info.system_instruction, "persona-expert");
        assert_eq!(info.task_query, "cssrs");
        assert_eq!(info.prompt_strategy, "cssrs-fewshot_icl");
        assert_eq!(info.shot, "3");
    }

    #[test]
    fn test_folder_info_short_path() {
        assert_eq!(FolderInfo::from_path(Path::new("x")), FolderInfo::unknown());
    }
}
