//! Few-shot memory.
//!
//! Draws K exemplars from the evaluation pool, renders each in few-shot
//! mode and concatenates the results into the memory injected into every
//! later prompt of the run.

use crate::adapter::{AdapterError, ModelAdapter};
use crate::config::ShotStrategy;
use crate::dataset::Example;
use crate::prompt::{PromptGenerator, ShotMode};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Accumulated exemplar text and the rows it consumed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShotMemory {
    /// Concatenated exemplars
    pub text: String,
    /// Pool indices used as exemplars, in draw order
    pub indices: Vec<usize>,
}

impl ShotMemory {
    /// Number of exemplars
    #[must_use]
    pub fn count(&self) -> usize {
        self.indices.len()
    }

    /// Whether a pool index was used as an exemplar
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }
}

/// Draw `min(k, pool)` distinct indices uniformly without replacement
#[must_use]
pub fn select_shots(pool: usize, k: usize, seed: u64) -> Vec<usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    index::sample(&mut rng, pool, k.min(pool)).into_vec()
}

/// Builds [`ShotMemory`] for one run
pub struct FewShotAccumulator<'a> {
    generator: &'a PromptGenerator,
    strategy: ShotStrategy,
}

impl<'a> FewShotAccumulator<'a> {
    #[must_use]
    pub const fn new(generator: &'a PromptGenerator, strategy: ShotStrategy) -> Self {
        Self {
            generator,
            strategy,
        }
    }

    /// Accumulate `k` exemplars from `pool`.
    ///
    /// Teacher forcing appends each exemplar's flattened system and user
    /// text without touching the backend. Live completion sends the
    /// exemplar through the adapter and appends query plus answer.
    ///
    /// # Errors
    ///
    /// Returns an error if an exemplar cannot be rendered, or a live
    /// completion fails on a single-call backend.
    pub fn build(
        &self,
        pool: &[Example],
        k: usize,
        seed: u64,
        adapter: &ModelAdapter,
    ) -> Result<ShotMemory, AdapterError> {
        if k == 0 {
            return Ok(ShotMemory::default());
        }

        let indices = select_shots(pool.len(), k, seed);
        let mut text = String::new();

        for (shot_count, &i) in indices.iter().enumerate() {
            let record = self
                .generator
                .generate(&pool[i], "", ShotMode::FewShot, shot_count)?;

            match self.strategy {
                ShotStrategy::TeacherForcing => {
                    let (system, user) = record.flatten();
                    text.push_str(&system);
                    text.push_str(&user);
                }
                ShotStrategy::LiveCompletion => {
                    let exchange = adapter.respond(&record)?;
                    text.push_str(&exchange.query);
                    text.push_str(&exchange.answer);
                }
            }
        }

        tracing::debug!(
            shots = indices.len(),
            chars = text.len(),
            strategy = ?self.strategy,
            "Shot memory built"
        );

        Ok(ShotMemory { text, indices })
    }
}
