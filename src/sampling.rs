//! Per-label stratified resampling.
//!
//! Rows are divided as evenly as possible across distinct label values.
//! Every draw uses a fresh `ChaCha8Rng` seeded with the same value, so a
//! given label sequence and row target always produce the same indices.

use rand::seq::index;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeSet, HashMap};

/// Default seed for sampling and shot selection
pub const DEFAULT_SEED: u64 = 42;

/// Gold labels of a dataset, one entry per row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelSequence {
    /// One label per row
    Flat(Vec<i64>),
    /// One label per turn, several turns per row
    Nested(Vec<Vec<i64>>),
}

impl LabelSequence {
    /// Number of rows
    #[must_use]
    pub fn rows(&self) -> usize {
        match self {
            Self::Flat(labels) => labels.len(),
            Self::Nested(rows) => rows.len(),
        }
    }

    /// Labels in flattened order, each paired with the row that owns it
    fn flatten(&self) -> Vec<(i64, usize)> {
        match self {
            Self::Flat(labels) => labels.iter().enumerate().map(|(i, &l)| (l, i)).collect(),
            Self::Nested(rows) => rows
                .iter()
                .enumerate()
                .flat_map(|(row, turns)| turns.iter().map(move |&l| (l, row)))
                .collect(),
        }
    }
}

/// Draw `n` items from `pool` without replacement (shuffled order)
fn draw_without_replacement(pool: &[usize], n: usize, seed: u64) -> Vec<usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let n = n.min(pool.len());
    index::sample(&mut rng, pool.len(), n)
        .into_iter()
        .map(|i| pool[i])
        .collect()
}

/// Draw `n` items from `pool` with replacement
fn draw_with_replacement(pool: &[usize], n: usize, seed: u64) -> Vec<usize> {
    if pool.is_empty() {
        return Vec::new();
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n).map(|_| pool[rng.gen_range(0..pool.len())]).collect()
}

/// Select row indices so that each label contributes `max_rows / labels` rows.
///
/// Labels are visited in first-seen order. A label whose pool holds at least
/// `rows_per_label` positions is drawn without replacement; a smaller pool is
/// drawn with replacement, so duplicated rows are possible. Any remainder
/// left by the integer division is topped up from positions not yet drawn.
///
/// For nested sequences the counting happens over the flattened turns and
/// each drawn turn position maps back to the row that owns it.
#[must_use]
pub fn balanced_sampling(labels: &LabelSequence, max_rows: usize, seed: u64) -> Vec<usize> {
    let flat = labels.flatten();
    if flat.is_empty() || max_rows == 0 {
        return Vec::new();
    }

    let mut order: Vec<i64> = Vec::new();
    let mut pools: HashMap<i64, Vec<usize>> = HashMap::new();
    for (position, (label, _)) in flat.iter().enumerate() {
        pools
            .entry(*label)
            .or_insert_with(|| {
                order.push(*label);
                Vec::new()
            })
            .push(position);
    }

    let rows_per_label = max_rows / order.len();
    let mut sampled: Vec<usize> = Vec::with_capacity(max_rows);

    for label in &order {
        let pool = &pools[label];
        let drawn = if pool.len() >= rows_per_label {
            draw_without_replacement(pool, rows_per_label, seed)
        } else {
            draw_with_replacement(pool, rows_per_label, seed)
        };
        tracing::trace!(label, pool = pool.len(), drawn = drawn.len(), "Sampled label pool");
        sampled.extend(drawn);
    }

    if sampled.len() < max_rows {
        let taken: BTreeSet<usize> = sampled.iter().copied().collect();
        let remaining: Vec<usize> = (0..flat.len()).filter(|i| !taken.contains(i)).collect();
        sampled.extend(draw_without_replacement(
            &remaining,
            max_rows - sampled.len(),
            seed,
        ));
    }

    sampled.into_iter().map(|position| flat[position].1).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn counts(labels: &[i64], indices: &[usize]) -> HashMap<i64, usize> {
        let mut map = HashMap::new();
        for &i in indices {
            *map.entry(labels[i]).or_insert(0) += 1;
        }
        map
    }

    // =========================================================================
    // Balanced draws
    // =========================================================================

    #[test]
    fn test_even_split_without_duplicates() {
        let labels = vec![0, 0, 0, 1, 1, 1];
        let seq = LabelSequence::Flat(labels.clone());
        let indices = balanced_sampling(&seq, 4, DEFAULT_SEED);

        assert_eq!(indices.len(), 4);
        let per_label = counts(&labels, &indices);
        assert_eq!(per_label[&0], 2);
        assert_eq!(per_label[&1], 2);

        let unique: BTreeSet<usize> = indices.iter().copied().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn test_remainder_is_topped_up() {
        let labels = vec![0, 0, 0, 1, 1, 1, 2, 2, 2];
        let seq = LabelSequence::Flat(labels);
        let indices = balanced_sampling(&seq, 7, DEFAULT_SEED);

        assert_eq!(indices.len(), 7);
        let unique: BTreeSet<usize> = indices.iter().copied().collect();
        assert_eq!(unique.len(), 7);
    }

    #[test]
    fn test_small_pool_draws_with_replacement() {
        let labels = vec![0, 0, 0, 0, 0, 1];
        let seq = LabelSequence::Flat(labels.clone());
        let indices = balanced_sampling(&seq, 6, DEFAULT_SEED);

        assert_eq!(indices.len(), 6);
        let per_label = counts(&labels, &indices);
        assert_eq!(per_label[&1], 3);
        assert!(indices.iter().filter(|&&i| i == 5).count() == 3);
    }

    #[test]
    fn test_single_row_label_pool() {
        let seq = LabelSequence::Flat(vec![7]);
        let indices = balanced_sampling(&seq, 1, DEFAULT_SEED);
        assert_eq!(indices, vec![0]);
    }

    #[test]
    fn test_more_labels_than_rows() {
        let seq = LabelSequence::Flat(vec![0, 1, 2, 3]);
        let indices = balanced_sampling(&seq, 2, DEFAULT_SEED);
        assert_eq!(indices.len(), 2);
        assert_ne!(indices[0], indices[1]);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(balanced_sampling(&LabelSequence::Flat(vec![]), 10, DEFAULT_SEED).is_empty());
        assert!(balanced_sampling(&LabelSequence::Flat(vec![0, 1]), 0, DEFAULT_SEED).is_empty());
    }

    #[test]
    fn test_reproducible_for_seed() {
        let seq = LabelSequence::Flat((0..40).map(|i| i % 4).collect());
        let a = balanced_sampling(&seq, 12, DEFAULT_SEED);
        let b = balanced_sampling(&seq, 12, DEFAULT_SEED);
        assert_eq!(a, b);
    }

    // =========================================================================
    // Nested labels
    // =========================================================================

    #[test]
    fn test_nested_maps_back_to_rows() {
        let seq = LabelSequence::Nested(vec![vec![0, 1], vec![1, 1], vec![0]]);
        let indices = balanced_sampling(&seq, 2, DEFAULT_SEED);

        assert_eq!(indices.len(), 2);
        assert!(indices.iter().all(|&row| row < seq.rows()));
    }
}
