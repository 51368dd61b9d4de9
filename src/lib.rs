//! Puck: a character-level GPT on the CPU
//!
//! A decoder-only transformer with hand-written forward and backward passes,
//! trained with AdamW on raw text and sampled one character at a time.
//! Named after the sprite of *A Midsummer Night's Dream*.
//!
//! # Modules
//!
//! - [`tensor`] - row-major tensors and the arithmetic the layers need
//! - [`vocab`] - character vocabulary
//! - [`data`] - train/validation split and random batch sampling
//! - [`layers`] - embedding, attention, feed-forward and block layers
//! - [`model`] - the full model and its loss
//! - [`optimizer`] / [`gradients`] - AdamW, gradient norm and clipping
//! - [`train`] - training step, loss estimation and the training loop
//! - [`generate`] - autoregressive sampling
//! - [`checkpoint`] - saving and resuming
//!
//! # Example
//!
//! ```rust,no_run
//! use puck::{generate_text, Gpt, ModelConfig, Vocabulary};
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let text = std::fs::read_to_string("input.txt").unwrap();
//! let vocab = Vocabulary::from_text(&text);
//!
//! let mut rng = StdRng::seed_from_u64(1337);
//! let model = Gpt::new(&ModelConfig::tiny(vocab.len()), &mut rng).unwrap();
//!
//! // Untrained, so expect noise
//! let sample = generate_text(&model, &vocab, "\n", 100, 1.0, &mut rng).unwrap();
//! println!("{sample}");
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod generate;
pub mod gradients;
pub mod layers;
pub mod model;
pub mod optimizer;
pub mod tensor;
pub mod train;
pub mod training_logger;
pub mod vocab;

// Re-export main types for convenience
pub use checkpoint::Checkpoint;
pub use config::{
    Device, GenerationConfig, ModelConfig, NonFinitePolicy, RunConfig, TrainConfig, PRESETS,
};
pub use data::{Batch, BatchSampler, DataSplit, Split};
pub use error::{ModelError, Result};
pub use generate::{generate, generate_text};
pub use gradients::{clip_gradients, compute_grad_norm};
pub use layers::{Activation, Mode};
pub use model::{AttentionMaps, Gpt, GptGradients};
pub use optimizer::{AdamW, AdamWConfig};
pub use tensor::Tensor;
pub use train::{
    apply_gradients, estimate_loss, training_step, LossEstimate, StepOutcome, TrainSummary, Trainer,
};
pub use training_logger::{EvalRecord, TrainingLogger};
pub use vocab::Vocabulary;
