//! Classification metrics.
//!
//! Label indices are plain `usize`. Averaged scores run over the labels
//! present in either the gold or the predicted sequence, and a ratio with
//! a zero denominator counts as 0:
//! - per-class precision, recall, F1 and support
//! - macro and support-weighted averages
//! - accuracy
//! - Pearson correlation between two samples

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, BTreeSet};

/// Scores of one class
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassScores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Gold occurrences
    pub support: usize,
}

/// Overall scores of one prediction sequence
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub f1_macro: f64,
    pub f1_weighted: f64,
    pub precision_macro: f64,
    pub recall_macro: f64,
    pub accuracy: f64,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn harmonic(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

/// Per-class scores keyed by label, for every label seen in either sequence
#[must_use]
pub fn per_class(y_true: &[usize], y_pred: &[usize]) -> BTreeMap<usize, ClassScores> {
    let labels: BTreeSet<usize> = y_true.iter().chain(y_pred).copied().collect();

    labels
        .into_iter()
        .map(|label| {
            let tp = y_true
                .iter()
                .zip(y_pred)
                .filter(|(t, p)| **t == label && **p == label)
                .count();
            let predicted = y_pred.iter().filter(|p| **p == label).count();
            let support = y_true.iter().filter(|t| **t == label).count();

            let precision = ratio(tp, predicted);
            let recall = ratio(tp, support);
            (
                label,
                ClassScores {
                    precision,
                    recall,
                    f1: harmonic(precision, recall),
                    support,
                },
            )
        })
        .collect()
}

/// Unweighted mean over classes
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn macro_average(classes: &BTreeMap<usize, ClassScores>) -> ClassScores {
    if classes.is_empty() {
        return ClassScores::default();
    }
    let n = classes.len() as f64;
    let support = classes.values().map(|c| c.support).sum();
    ClassScores {
        precision: classes.values().map(|c| c.precision).sum::<f64>() / n,
        recall: classes.values().map(|c| c.recall).sum::<f64>() / n,
        f1: classes.values().map(|c| c.f1).sum::<f64>() / n,
        support,
    }
}

/// Mean over classes weighted by support
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn weighted_average(classes: &BTreeMap<usize, ClassScores>) -> ClassScores {
    let support: usize = classes.values().map(|c| c.support).sum();
    if support == 0 {
        return ClassScores::default();
    }
    let total = support as f64;
    let weighted = |f: fn(&ClassScores) -> f64| {
        classes
            .values()
            .map(|c| f(c) * c.support as f64)
            .sum::<f64>()
            / total
    };
    ClassScores {
        precision: weighted(|c: &ClassScores| c.precision),
        recall: weighted(|c: &ClassScores| c.recall),
        f1: weighted(|c: &ClassScores| c.f1),
        support,
    }
}

/// Fraction of positions where prediction equals gold
#[must_use]
pub fn accuracy(y_true: &[usize], y_pred: &[usize]) -> f64 {
    let hits = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    ratio(hits, y_true.len().min(y_pred.len()))
}

/// Score a prediction sequence against gold labels
#[must_use]
pub fn score(y_true: &[usize], y_pred: &[usize]) -> ClassificationMetrics {
    let classes = per_class(y_true, y_pred);
    let macro_avg = macro_average(&classes);
    let weighted = weighted_average(&classes);

    ClassificationMetrics {
        f1_macro: macro_avg.f1,
        f1_weighted: weighted.f1,
        precision_macro: macro_avg.precision,
        recall_macro: macro_avg.recall,
        accuracy: accuracy(y_true, y_pred),
    }
}

/// Arithmetic mean, 0 for an empty sample
#[must_use]
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().mean()
}

/// Pearson correlation coefficient.
///
/// Returns `None` when the samples differ in length, hold fewer than two
/// points, or either has zero variance.
#[must_use]
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }

    let sx = x.iter().std_dev();
    let sy = y.iter().std_dev();
    if sx < f64::EPSILON || sy < f64::EPSILON {
        return None;
    }

    let r = x.iter().covariance(y.iter()) / (sx * sy);
    r.is_finite().then(|| r.clamp(-1.0, 1.0))
}

/// One row of a [`ClassificationReport`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub name: String,
    pub scores: ClassScores,
}

/// Per-class table with accuracy and averaged rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub rows: Vec<ReportRow>,
    pub accuracy: f64,
    /// Number of scored samples
    pub support: usize,
    pub macro_avg: ClassScores,
    pub weighted_avg: ClassScores,
}

impl ClassificationReport {
    /// Build the report; label `i` is shown as `names[i]`, or its index
    /// when the name list is shorter
    #[must_use]
    pub fn new(y_true: &[usize], y_pred: &[usize], names: &[String]) -> Self {
        let classes = per_class(y_true, y_pred);
        let rows = classes
            .iter()
            .map(|(&label, &scores)| ReportRow {
                name: names
                    .get(label)
                    .cloned()
                    .unwrap_or_else(|| label.to_string()),
                scores,
            })
            .collect();

        Self {
            rows,
            accuracy: accuracy(y_true, y_pred),
            support: y_true.len(),
            macro_avg: macro_average(&classes),
            weighted_avg: weighted_average(&classes),
        }
    }
}
