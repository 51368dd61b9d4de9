//! Training Data
//!
//! The encoded corpus is split once into a training prefix and a validation
//! suffix. Training examples are random fixed-length windows drawn from one
//! of the two splits:
//!
//! ```text
//! Tokens:  [5, 9, 2, 7, 3, 8, 1, 4, 6]
//! Window:         ^ offset 2, context_length 4
//! Input:   [2, 7, 3, 8]
//! Target:  [7, 3, 8, 1]   (input shifted one step into the future)
//! ```
//!
//! Target position `t` holds the token that follows input position `t`, so a
//! single window yields `context_length` next-token examples, one for every
//! prefix length.

use crate::error::{ModelError, Result};
use rand::Rng;

/// Which part of the corpus to sample from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

/// An encoded corpus split into training and validation tokens.
///
/// The validation set is taken from the end of the corpus so the two
/// splits never overlap.
#[derive(Clone, Debug)]
pub struct DataSplit {
    train: Vec<usize>,
    val: Vec<usize>,
}

impl DataSplit {
    /// Split `tokens` so that the last `val_fraction` of them form the validation set.
    pub fn new(tokens: Vec<usize>, val_fraction: f32) -> Self {
        let split_idx = ((tokens.len() as f32) * (1.0 - val_fraction)) as usize;
        let mut train = tokens;
        let val = train.split_off(split_idx.min(train.len()));
        Self { train, val }
    }

    /// Tokens of one split.
    pub fn tokens(&self, split: Split) -> &[usize] {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
        }
    }
}

/// A batch of `(input, target)` windows, both `[batch_size][context_length]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub inputs: Vec<Vec<usize>>,
    pub targets: Vec<Vec<usize>>,
}

impl Batch {
    /// `(batch_size, seq_len)` of the inputs.
    pub fn shape(&self) -> (usize, usize) {
        (
            self.inputs.len(),
            self.inputs.first().map_or(0, Vec::len),
        )
    }
}

/// Draws uniformly random windows from a token sequence.
#[derive(Clone, Copy, Debug)]
pub struct BatchSampler {
    pub batch_size: usize,
    pub context_length: usize,
}

impl BatchSampler {
    pub fn new(batch_size: usize, context_length: usize) -> Self {
        Self {
            batch_size,
            context_length,
        }
    }

    /// Sample one batch from `tokens`.
    ///
    /// Offsets are drawn from `[0, tokens.len() - context_length)`, so every
    /// target window, which reaches one token further than its input, stays
    /// inside `tokens`.
    ///
    /// # Errors
    ///
    /// [`ModelError::Shape`] when `tokens` holds fewer than
    /// `context_length + 1` tokens.
    pub fn sample<R: Rng + ?Sized>(&self, tokens: &[usize], rng: &mut R) -> Result<Batch> {
        if tokens.len() <= self.context_length {
            return Err(ModelError::shape(
                "batch sampler",
                format!("at least {} tokens", self.context_length + 1),
                format!("{} tokens", tokens.len()),
            ));
        }

        let max_offset = tokens.len() - self.context_length;
        let mut inputs = Vec::with_capacity(self.batch_size);
        let mut targets = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let offset = rng.random_range(0..max_offset);
            inputs.push(tokens[offset..offset + self.context_length].to_vec());
            targets.push(tokens[offset + 1..offset + self.context_length + 1].to_vec());
        }

        Ok(Batch { inputs, targets })
    }

    /// Sample from one split of a [`DataSplit`].
    pub fn sample_split<R: Rng + ?Sized>(
        &self,
        data: &DataSplit,
        split: Split,
        rng: &mut R,
    ) -> Result<Batch> {
        self.sample(data.tokens(split), rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_split_is_ninety_ten() {
        let data = DataSplit::new((0..100).collect(), 0.1);
        assert_eq!(data.tokens(Split::Train).len(), 90);
        assert_eq!(data.tokens(Split::Val), &(90..100).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn test_targets_follow_inputs() {
        // Strictly increasing tokens make each token's source position recoverable.
        let tokens: Vec<usize> = (0..50).collect();
        let sampler = BatchSampler::new(16, 8);
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..20 {
            let batch = sampler.sample(&tokens, &mut rng).unwrap();
            assert_eq!(batch.shape(), (16, 8));
            for (input, target) in batch.inputs.iter().zip(&batch.targets) {
                for t in 0..8 {
                    assert_eq!(target[t], input[t] + 1);
                }
                assert_eq!(&input[1..], &target[..7]);
                assert!(*target.last().unwrap() < tokens.len());
            }
        }
    }

    #[test]
    fn test_windows_stay_inside_split() {
        let data = DataSplit::new((0..200).collect(), 0.1);
        let sampler = BatchSampler::new(32, 10);
        let mut rng = StdRng::seed_from_u64(11);

        let batch = sampler.sample_split(&data, Split::Val, &mut rng).unwrap();
        for row in batch.inputs.iter().chain(&batch.targets) {
            assert!(row.iter().all(|&t| (180..200).contains(&t)));
        }
        let batch = sampler.sample_split(&data, Split::Train, &mut rng).unwrap();
        for row in batch.inputs.iter().chain(&batch.targets) {
            assert!(row.iter().all(|&t| t < 180));
        }
    }

    #[test]
    fn test_sequence_shorter_than_window() {
        let sampler = BatchSampler::new(2, 8);
        let mut rng = StdRng::seed_from_u64(0);
        let err = sampler.sample(&[1, 2, 3, 4, 5, 6, 7, 8], &mut rng).unwrap_err();
        assert!(matches!(err, ModelError::Shape { .. }));
        assert!(sampler.sample(&[0; 9], &mut rng).is_ok());
    }
}
