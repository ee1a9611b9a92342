//! Aggregated report rendering.
//!
//! One [`AggregateReport`] per configuration directory, written next to
//! the backend directories as `aggregated_results.md` and
//! `aggregated_results.json`.

use crate::metrics::{ClassScores, ClassificationMetrics, ClassificationReport};
use crate::transcript::FolderInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as FmtWrite;
use std::fs;
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};

pub const MARKDOWN_FILE: &str = "aggregated_results.md";
pub const JSON_FILE: &str = "aggregated_results.json";

/// Metrics of one backend for one configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub backend: String,
    pub processed: usize,
    pub failed: usize,
    pub metrics: ClassificationMetrics,
    pub avg_confidence: f64,
    /// Pearson(confidence, per-file accuracy); `None` when not computable
    pub correlation: Option<f64>,
    pub error_files: Vec<String>,
    /// `None` when no file could be scored
    pub report: Option<ClassificationReport>,
}

impl AggregatedResult {
    /// Zeroed result for a backend without scoreable files
    #[must_use]
    pub fn empty(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            processed: 0,
            failed: 0,
            metrics: ClassificationMetrics::default(),
            avg_confidence: 0.0,
            correlation: None,
            error_files: Vec::new(),
            report: None,
        }
    }
}

/// Report for one configuration directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub folder: FolderInfo,
    pub generated_at: DateTime<Utc>,
    pub results: Vec<AggregatedResult>,
}

#[derive(Tabled)]
struct ClassRow {
    #[tabled(rename = "")]
    name: String,
    #[tabled(rename = "precision")]
    precision: String,
    #[tabled(rename = "recall")]
    recall: String,
    #[tabled(rename = "f1-score")]
    f1: String,
    #[tabled(rename = "support")]
    support: usize,
}

impl ClassRow {
    fn scored(name: &str, scores: &ClassScores) -> Self {
        Self {
            name: name.to_string(),
            precision: format!("{:.4}", scores.precision),
            recall: format!("{:.4}", scores.recall),
            f1: format!("{:.4}", scores.f1),
            support: scores.support,
        }
    }
}

#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "Backend")]
    backend: String,
    #[tabled(rename = "F1-macro")]
    f1_macro: String,
    #[tabled(rename = "F1-weight")]
    f1_weighted: String,
    #[tabled(rename = "Accuracy")]
    accuracy: String,
    #[tabled(rename = "Avg Conf")]
    confidence: String,
    #[tabled(rename = "Corr")]
    correlation: String,
    #[tabled(rename = "Processed")]
    processed: usize,
    #[tabled(rename = "Failed")]
    failed: usize,
}

fn format_correlation(value: Option<f64>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| format!("{v:.4}"))
}

/// Classification report as a text table
#[must_use]
pub fn report_table(report: &ClassificationReport) -> String {
    let mut rows: Vec<ClassRow> = report
        .rows
        .iter()
        .map(|row| ClassRow::scored(&row.name, &row.scores))
        .collect();

    rows.push(ClassRow {
        name: "accuracy".to_string(),
        precision: String::new(),
        recall: String::new(),
        f1: format!("{:.4}", report.accuracy),
        support: report.support,
    });
    rows.push(ClassRow::scored("macro avg", &report.macro_avg));
    rows.push(ClassRow::scored("weighted avg", &report.weighted_avg));

    Table::new(rows).to_string()
}

impl AggregateReport {
    #[must_use]
    pub fn new(folder: FolderInfo, results: Vec<AggregatedResult>) -> Self {
        Self {
            folder,
            generated_at: Utc::now(),
            results,
        }
    }

    /// Render report as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Render report as markdown
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        writeln!(
            output,
            "# Folder Info: SI={}, TQ={}, PS={}, SHOT={}",
            self.folder.system_instruction,
            self.folder.task_query,
            self.folder.prompt_strategy,
            self.folder.shot
        )
        .ok();
        writeln!(output).ok();

        for result in &self.results {
            let m = &result.metrics;
            writeln!(output, "# Model: {}", result.backend).ok();
            writeln!(output).ok();
            writeln!(output, "**F1-macro:** {:.4}", m.f1_macro).ok();
            writeln!(output).ok();
            writeln!(output, "**F1-weight:** {:.4}", m.f1_weighted).ok();
            writeln!(output).ok();
            writeln!(output, "**Precision-macro:** {:.4}", m.precision_macro).ok();
            writeln!(output).ok();
            writeln!(output, "**Recall-macro:** {:.4}", m.recall_macro).ok();
            writeln!(output).ok();
            writeln!(output, "**Accuracy:** {:.4}", m.accuracy).ok();
            writeln!(output).ok();
            writeln!(
                output,
                "**Avg Confidence Score:** {:.4}",
                result.avg_confidence
            )
            .ok();
            writeln!(output).ok();
            writeln!(
                output,
                "**Correlation between Confidence Score and Accuracy:** {}",
                format_correlation(result.correlation)
            )
            .ok();
            writeln!(output).ok();
            writeln!(output, "**Processed files:** {}", result.processed).ok();
            writeln!(output).ok();
            writeln!(output, "**Failed files:** {}", result.failed).ok();
            writeln!(output).ok();
            if !result.error_files.is_empty() {
                writeln!(
                    output,
                    "**Error processing files:** [{}]",
                    result.error_files.join(",")
                )
                .ok();
                writeln!(output).ok();
            }

            writeln!(output).ok();
            writeln!(output, "## Classification Report").ok();
            writeln!(output).ok();
            writeln!(output, "```").ok();
            match &result.report {
                Some(report) => writeln!(output, "{}", report_table(report)).ok(),
                None => writeln!(output, "N/A").ok(),
            };
            writeln!(output, "```").ok();
            writeln!(output).ok();
            writeln!(output, "---").ok();
            writeln!(output).ok();
        }

        output
    }

    /// One line per backend, for the terminal
    #[must_use]
    pub fn summary_table(&self) -> String {
        let rows: Vec<SummaryRow> = self
            .results
            .iter()
            .map(|r| SummaryRow {
                backend: r.backend.clone(),
                f1_macro: format!("{:.4}", r.metrics.f1_macro),
                f1_weighted: format!("{:.4}", r.metrics.f1_weighted),
                accuracy: format!("{:.4}", r.metrics.accuracy),
                confidence: format!("{:.4}", r.avg_confidence),
                correlation: format_correlation(r.correlation),
                processed: r.processed,
                failed: r.failed,
            })
            .collect();
        Table::new(rows).to_string()
    }

    /// Write markdown and JSON files into `dir`, returning their paths
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write(&self, dir: &Path) -> std::io::Result<(PathBuf, PathBuf)> {
        let markdown = dir.join(MARKDOWN_FILE);
        let json = dir.join(JSON_FILE);
        fs::write(&markdown, self.to_markdown())?;
        fs::write(&json, self.to_json()?)?;
        Ok((markdown, json))
    }
}
