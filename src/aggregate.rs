//! Offline metrics over persisted transcripts.
//!
//! Walks `<base>/<SI>/<TQ>/<PS-*_shot-*>` configuration directories,
//! scores every backend directory below each one and writes the
//! aggregated report next to them.

use crate::metrics::{self, ClassificationReport};
use crate::report::{AggregateReport, AggregatedResult};
use crate::transcript::{answer_files, AnswerParser, FolderInfo, TranscriptError};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that abort aggregation of a whole directory
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Results directory not found: {0}")]
    NotFound(String),

    #[error("Transcript error: {0}")]
    Transcript(#[from] TranscriptError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Depth of configuration directories below the `<data>/<task>` base
const CONFIG_DEPTH: usize = 3;

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, AggregateError> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Configuration directories exactly three levels below `base`
///
/// # Errors
///
/// Returns `NotFound` if `base` is not a directory.
pub fn config_dirs(base: &Path) -> Result<Vec<PathBuf>, AggregateError> {
    if !base.is_dir() {
        return Err(AggregateError::NotFound(base.display().to_string()));
    }

    let mut level = vec![base.to_path_buf()];
    for _ in 0..CONFIG_DEPTH {
        let mut next = Vec::new();
        for dir in &level {
            next.extend(subdirectories(dir)?);
        }
        level = next;
    }
    Ok(level)
}

/// Backend directories of one configuration, by name
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn backend_dirs(config_dir: &Path) -> Result<Vec<(String, PathBuf)>, AggregateError> {
    Ok(subdirectories(config_dir)?
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            Some((name, path))
        })
        .collect())
}

/// Scores transcript directories
pub struct Aggregator {
    parser: AnswerParser,
}

impl Aggregator {
    /// # Errors
    ///
    /// Returns an error if the answer patterns fail to compile.
    pub fn new() -> Result<Self, AggregateError> {
        Ok(Self {
            parser: AnswerParser::new()?,
        })
    }

    /// Score every answer file of one backend directory.
    ///
    /// A file without a usable confidence score, or whose predicted or
    /// gold label is missing from its candidate list, is counted as
    /// failed and listed in `error_files`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the directory itself cannot be read.
    pub fn aggregate_backend(
        &self,
        backend: &str,
        dir: &Path,
    ) -> Result<AggregatedResult, AggregateError> {
        let mut result = AggregatedResult::empty(backend);
        let mut y_true = Vec::new();
        let mut y_pred = Vec::new();
        let mut confidences = Vec::new();
        let mut hits = Vec::new();
        let mut label_names: Vec<String> = Vec::new();

        for path in answer_files(dir)? {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let scored = fs::read_to_string(&path)
                .map_err(TranscriptError::from)
                .and_then(|text| self.parser.parse(&text))
                .and_then(|parsed| parsed.indices().map(|idx| (parsed, idx)));

            let (parsed, (predicted, truth)) = match scored {
                Ok(scored) => scored,
                Err(e) => {
                    tracing::debug!(backend, file = %name, error = %e, "Unscoreable answer");
                    result.error_files.push(name);
                    result.failed += 1;
                    continue;
                }
            };

            if label_names.is_empty() {
                label_names = parsed.label_list.clone().unwrap_or_default();
            }

            y_true.push(truth);
            y_pred.push(predicted);
            confidences.push(parsed.confidence);
            hits.push(f64::from(u8::from(truth == predicted)));
            result.processed += 1;
        }

        if result.processed > 0 {
            result.metrics = metrics::score(&y_true, &y_pred);
            result.avg_confidence = metrics::mean(&confidences);
            result.correlation = metrics::pearson(&confidences, &hits);
            result.report = Some(ClassificationReport::new(&y_true, &y_pred, &label_names));
        }

        tracing::info!(
            backend,
            processed = result.processed,
            failed = result.failed,
            f1_macro = result.metrics.f1_macro,
            "Backend aggregated"
        );

        Ok(result)
    }

    /// Score the backends of one configuration directory.
    ///
    /// With `only` set, backends not named there are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be read.
    pub fn aggregate_config(
        &self,
        config_dir: &Path,
        only: Option<&[String]>,
    ) -> Result<AggregateReport, AggregateError> {
        let mut results = Vec::new();
        for (name, dir) in backend_dirs(config_dir)? {
            if only.is_some_and(|names| !names.contains(&name)) {
                continue;
            }
            results.push(self.aggregate_backend(&name, &dir)?);
        }
        Ok(AggregateReport::new(FolderInfo::from_path(config_dir), results))
    }

    /// Aggregate every configuration below `base` and write its report.
    ///
    /// Returns the configuration directories that were written.
    ///
    /// # Errors
    ///
    /// Returns an error if `base` is missing or a report cannot be written.
    pub fn aggregate_tree(
        &self,
        base: &Path,
        only: Option<&[String]>,
    ) -> Result<Vec<(PathBuf, AggregateReport)>, AggregateError> {
        let mut written = Vec::new();
        for dir in config_dirs(base)? {
            tracing::info!(dir = %dir.display(), "Processing folder");
            let report = self.aggregate_config(&dir, only)?;
            report.write(&dir)?;
            written.push((dir, report));
        }
        Ok(written)
    }
}
