//! Configuration
//!
//! Hyper-parameters are grouped by the component that consumes them:
//!
//! - [`ModelConfig`]: architecture (width, depth, heads, context window)
//! - [`TrainConfig`]: optimization and evaluation schedule
//! - [`GenerationConfig`]: sampling controls
//!
//! [`RunConfig`] bundles all three for the command-line tool. It can come
//! from a named preset or a JSON file, and the CLI overrides individual
//! fields on top.
//!
//! Validation happens before anything is allocated: [`crate::Gpt::new`]
//! refuses a [`ModelConfig`] that fails [`ModelConfig::validate`].

use crate::error::{ModelError, Result};
use crate::layers::Activation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Architecture hyper-parameters.
///
/// # Parameter Count
///
/// ```text
/// embeddings ≈ (vocab_size + context_length) × n_embd
/// per_layer  ≈ 12 × n_embd²   (attention + feed-forward)
/// head       ≈ n_embd × vocab_size
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of distinct tokens. Filled in from the vocabulary when loading a corpus.
    #[serde(default)]
    pub vocab_size: usize,
    /// Maximum attended history; also the size of the position table.
    pub context_length: usize,
    /// Representation width.
    pub n_embd: usize,
    /// Attention heads per block. Must divide `n_embd`.
    pub n_head: usize,
    /// Number of transformer blocks.
    pub n_layer: usize,
    /// Dropout probability, applied in training mode only.
    pub dropout: f32,
    /// Feed-forward nonlinearity.
    #[serde(default)]
    pub activation: Activation,
}

impl ModelConfig {
    /// Small model for quick experiments (~200K parameters with a 65-symbol vocabulary).
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            context_length: 32,
            n_embd: 64,
            n_head: 4,
            n_layer: 4,
            dropout: 0.0,
            activation: Activation::Relu,
        }
    }

    /// The reference character-level Shakespeare model (~10.8M parameters).
    pub fn shakespeare(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            context_length: 256,
            n_embd: 384,
            n_head: 6,
            n_layer: 6,
            dropout: 0.2,
            activation: Activation::Relu,
        }
    }

    /// Width of each attention head.
    pub fn head_size(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Check that the configuration describes a constructible model.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("context_length", self.context_length),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_layer", self.n_layer),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ModelError::Config(format!("{name} must be positive")));
            }
        }
        if self.n_embd % self.n_head != 0 {
            return Err(ModelError::Config(format!(
                "n_head ({}) must divide n_embd ({})",
                self.n_head, self.n_embd
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::Config(format!(
                "dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// What a training step does when the loss or gradients are not finite.
///
/// In both cases the parameters and optimizer state are left untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonFinitePolicy {
    /// Fail the step with [`ModelError::NonFinite`].
    #[default]
    Abort,
    /// Report the step as skipped and continue.
    Skip,
}

impl FromStr for NonFinitePolicy {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "abort" => Ok(NonFinitePolicy::Abort),
            "skip" => Ok(NonFinitePolicy::Skip),
            other => Err(ModelError::Config(format!(
                "unknown non-finite policy '{other}' (expected 'abort' or 'skip')"
            ))),
        }
    }
}

/// Compute target. Carried through configuration but never interpreted by the model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
}

impl FromStr for Device {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Device::Cpu),
            other => Err(ModelError::Config(format!(
                "unsupported device '{other}' (only 'cpu' is available)"
            ))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

/// Optimization and evaluation schedule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Sequences per training step.
    pub batch_size: usize,
    /// AdamW learning rate (constant).
    pub learning_rate: f32,
    /// Number of training steps.
    pub max_iters: usize,
    /// Estimate train/val loss every N steps.
    pub eval_interval: usize,
    /// Batches averaged per loss estimate.
    pub eval_iters: usize,
    /// Decoupled weight decay for 2-D weight matrices.
    pub weight_decay: f32,
    /// Clip the global gradient norm to this value, if set.
    #[serde(default)]
    pub grad_clip: Option<f32>,
    /// Behavior on non-finite loss or gradients.
    #[serde(default)]
    pub non_finite: NonFinitePolicy,
    /// Fraction of tokens held out for validation.
    pub val_fraction: f32,
    /// Seed for initialization, batch sampling and dropout.
    pub seed: u64,
    /// Compute target.
    #[serde(default)]
    pub device: Device,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            learning_rate: 3e-4,
            max_iters: 5000,
            eval_interval: 500,
            eval_iters: 200,
            weight_decay: 0.01,
            grad_clip: None,
            non_finite: NonFinitePolicy::Abort,
            val_fraction: 0.1,
            seed: 1337,
            device: Device::Cpu,
        }
    }
}

impl TrainConfig {
    /// Schedule matching [`ModelConfig::tiny`].
    pub fn tiny() -> Self {
        Self {
            batch_size: 16,
            learning_rate: 1e-3,
            max_iters: 5000,
            eval_interval: 100,
            eval_iters: 200,
            ..Self::default()
        }
    }

    /// Check ranges of every field.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ModelError::Config("batch_size must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ModelError::Config(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if self.eval_interval == 0 || self.eval_iters == 0 {
            return Err(ModelError::Config(
                "eval_interval and eval_iters must be positive".into(),
            ));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(ModelError::Config(format!(
                "weight_decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        if let Some(clip) = self.grad_clip {
            if !(clip.is_finite() && clip > 0.0) {
                return Err(ModelError::Config(format!(
                    "grad_clip must be positive, got {clip}"
                )));
            }
        }
        if !(self.val_fraction > 0.0 && self.val_fraction < 1.0) {
            return Err(ModelError::Config(format!(
                "val_fraction must lie in (0, 1), got {}",
                self.val_fraction
            )));
        }
        Ok(())
    }
}

/// Sampling controls for the generation loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Number of tokens to append to the seed.
    pub max_new_tokens: usize,
    /// Logits are divided by this before softmax. Must be positive.
    pub temperature: f32,
    /// Seed for the sampling generator.
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 500,
            temperature: 1.0,
            seed: 1337,
        }
    }
}

impl GenerationConfig {
    /// Check that the temperature is usable.
    pub fn validate(&self) -> Result<()> {
        validate_temperature(self.temperature)
    }
}

pub(crate) fn validate_temperature(temperature: f32) -> Result<()> {
    if temperature.is_finite() && temperature > 0.0 {
        Ok(())
    } else {
        Err(ModelError::Config(format!(
            "temperature must be a positive number, got {temperature}"
        )))
    }
}

/// Complete configuration of a training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub train: TrainConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

/// Names accepted by [`RunConfig::preset`].
pub const PRESETS: &[(&str, &str)] = &[
    ("tiny", "4 layers, 64 wide, 32-token context; trains in minutes"),
    ("shakespeare", "6 layers, 384 wide, 256-token context; the reference run"),
];

impl RunConfig {
    /// Look up a named preset. `vocab_size` is left at zero until a corpus is loaded.
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "tiny" => Ok(Self {
                model: ModelConfig::tiny(0),
                train: TrainConfig::tiny(),
                generation: GenerationConfig::default(),
            }),
            "shakespeare" => Ok(Self {
                model: ModelConfig::shakespeare(0),
                train: TrainConfig::default(),
                generation: GenerationConfig::default(),
            }),
            other => Err(ModelError::Config(format!(
                "unknown preset '{other}' (available: {})",
                PRESETS
                    .iter()
                    .map(|(n, _)| *n)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Read a run configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Validate every section. The model's `vocab_size` must already be set.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.train.validate()?;
        self.generation.validate()
    }
}
