//! Character-Level GPT
//!
//! The complete decoder-only model:
//!
//! ```text
//! ids [B][T]
//!   → Embedding (token + position)        [B*T, n_embd]
//!   → Block × n_layer                     [B*T, n_embd]
//!   → LayerNorm (final)                   [B*T, n_embd]
//!   → Linear (lm_head)                    [B*T, vocab_size]
//! ```
//!
//! ## Modes
//!
//! - **Scoring** (targets given): logits plus the mean cross-entropy over all
//!   `B*T` positions.
//! - **Inference** (no targets): logits only.
//!
//! ## Loss
//!
//! ```text
//! loss = -(1/N) Σ log softmax(logits[n])[target[n]]
//! grad_logits[n] = (softmax(logits[n]) - onehot(target[n])) / N
//! ```
//!
//! ## Input Contract
//!
//! Inputs must be rectangular with `1 <= T <= context_length`, every id must
//! be below `vocab_size`, and targets, when given, must have the input's
//! shape. Violations are reported as [`ModelError`] before any computation.
//!
//! The causal mask is built once from `context_length` and stored next to,
//! not among, the parameters.

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};
use crate::layers::{
    Block, BlockCache, BlockGradients, CausalMask, Embedding, EmbeddingCache,
    EmbeddingGradients, LayerNorm, LayerNormCache, LayerNormGradients, Linear, LinearCache,
    LinearGradients, Mode, ParamMut,
};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Decoder-only transformer over a character vocabulary.
#[derive(Clone, Debug)]
pub struct Gpt {
    config: ModelConfig,
    pub embedding: Embedding,
    pub blocks: Vec<Block>,
    pub ln_f: LayerNorm,
    pub lm_head: Linear,
    mask: CausalMask,
}

impl Gpt {
    /// Build a model with freshly initialized parameters.
    ///
    /// # Errors
    ///
    /// [`ModelError::Config`] if the configuration is invalid. Validation
    /// happens before any parameter is allocated.
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;

        let embedding = Embedding::new(
            config.vocab_size,
            config.context_length,
            config.n_embd,
            rng,
        );
        let blocks = (0..config.n_layer)
            .map(|_| Block::new(config, rng))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config: config.clone(),
            embedding,
            blocks,
            ln_f: LayerNorm::new(config.n_embd),
            lm_head: Linear::new(config.n_embd, config.vocab_size, true, rng),
            mask: CausalMask::new(config.context_length),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn mask(&self) -> &CausalMask {
        &self.mask
    }

    /// Total number of trainable scalars.
    pub fn num_parameters(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }

    /// Forward pass in scoring or inference mode.
    ///
    /// Returns `[B*T, vocab_size]` logits and, when `targets` is given, the
    /// mean cross-entropy loss.
    ///
    /// # Errors
    ///
    /// Shape and vocabulary contract errors, or [`ModelError::NonFinite`]
    /// when the logits or the loss are not finite.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        inputs: &[Vec<usize>],
        targets: Option<&[Vec<usize>]>,
        mode: Mode,
        rng: &mut R,
    ) -> Result<(Tensor, Option<f32>)> {
        if let Some(targets) = targets {
            self.check_targets(inputs, targets)?;
        }
        let (logits, _) = self.forward_with_cache(inputs, mode, rng)?;
        if !logits.is_finite() {
            return Err(ModelError::NonFinite { context: "logits" });
        }

        let loss = match targets {
            Some(targets) => {
                let loss = cross_entropy(&logits, &flatten(targets));
                if !loss.is_finite() {
                    return Err(ModelError::NonFinite { context: "loss" });
                }
                Some(loss)
            }
            None => None,
        };

        Ok((logits, loss))
    }

    /// Forward pass keeping every intermediate needed by [`Gpt::backward`].
    pub fn forward_with_cache<R: Rng + ?Sized>(
        &self,
        inputs: &[Vec<usize>],
        mode: Mode,
        rng: &mut R,
    ) -> Result<(Tensor, GptCache)> {
        let seq_len = self.check_inputs(inputs)?;

        let (mut x, embedding) = self.embedding.forward(inputs);
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (y, cache) = block.forward(&x, seq_len, &self.mask, mode, rng);
            blocks.push(cache);
            x = y;
        }
        let (x, ln_f) = self.ln_f.forward(&x);
        let (logits, lm_head) = self.lm_head.forward(&x);

        Ok((
            logits,
            GptCache {
                embedding,
                blocks,
                ln_f,
                lm_head,
            },
        ))
    }

    /// Gradients of the mean cross-entropy with respect to every parameter.
    ///
    /// `targets` must already have been checked against the inputs of the
    /// forward pass that produced `cache`.
    pub fn backward(
        &self,
        logits: &Tensor,
        targets: &[Vec<usize>],
        cache: &GptCache,
    ) -> GptGradients {
        let grad_logits = cross_entropy_grad(logits, &flatten(targets));

        let lm_head = self.lm_head.backward(&grad_logits, &cache.lm_head);
        let ln_f = self.ln_f.backward(&lm_head.x, &cache.ln_f);

        let mut grad_x = ln_f.x.clone();
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for (block, block_cache) in self.blocks.iter().zip(&cache.blocks).rev() {
            let grads = block.backward(&grad_x, block_cache);
            grad_x = grads.x.clone();
            blocks.push(grads);
        }
        blocks.reverse();

        let embedding = self.embedding.backward(&grad_x, &cache.embedding);

        GptGradients {
            embedding,
            blocks,
            ln_f,
            lm_head,
        }
    }

    /// Scoring-mode forward pass followed by the backward pass.
    ///
    /// # Errors
    ///
    /// Contract errors from the forward pass, or [`ModelError::NonFinite`]
    /// when the loss is not finite. No gradients are returned in that case.
    pub fn loss_and_gradients<R: Rng + ?Sized>(
        &self,
        inputs: &[Vec<usize>],
        targets: &[Vec<usize>],
        mode: Mode,
        rng: &mut R,
    ) -> Result<(f32, GptGradients)> {
        self.check_targets(inputs, targets)?;
        let (logits, cache) = self.forward_with_cache(inputs, mode, rng)?;
        let loss = cross_entropy(&logits, &flatten(targets));
        if !loss.is_finite() {
            return Err(ModelError::NonFinite { context: "loss" });
        }
        Ok((loss, self.backward(&logits, targets, &cache)))
    }

    /// Attention weights of every head in every block for one sequence.
    ///
    /// Runs in evaluation mode; the weights are the softmax output before
    /// dropout. Nothing here feeds back into the model.
    pub fn attention_maps(&self, ids: &[usize]) -> Result<AttentionMaps> {
        let inputs = [ids.to_vec()];
        // Evaluation mode never draws from the generator.
        let mut rng = StdRng::seed_from_u64(0);
        let (_, cache) = self.forward_with_cache(&inputs, Mode::Eval, &mut rng)?;

        let blocks: Vec<Vec<Vec<Vec<f32>>>> = cache
            .blocks
            .iter()
            .map(|block| {
                block
                    .attn_cache
                    .heads
                    .iter()
                    .map(|head| -> Vec<Vec<f32>> {
                        let weights = head.weights_for(0);
                        (0..weights.rows()).map(|i| weights.row(i).to_vec()).collect()
                    })
                    .collect()
            })
            .collect();

        Ok(AttentionMaps {
            tokens: ids.to_vec(),
            blocks,
        })
    }

    /// All parameters, in the order shared with [`GptGradients::tensors`].
    pub fn params(&self) -> Vec<&Tensor> {
        let mut params = self.embedding.params();
        for block in &self.blocks {
            params.extend(block.params());
        }
        params.extend(self.ln_f.params());
        params.extend(self.lm_head.params());
        params
    }

    pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        let mut params = self.embedding.params_mut();
        for block in &mut self.blocks {
            params.extend(block.params_mut());
        }
        params.extend(self.ln_f.params_mut());
        params.extend(self.lm_head.params_mut());
        params
    }

    /// Check that inputs are rectangular, fit the context and use valid ids.
    /// Returns the sequence length.
    fn check_inputs(&self, inputs: &[Vec<usize>]) -> Result<usize> {
        let seq_len = match inputs.first() {
            Some(first) => first.len(),
            None => {
                return Err(ModelError::shape(
                    "model input",
                    "at least one sequence",
                    "0 sequences",
                ))
            }
        };
        if seq_len == 0 || seq_len > self.config.context_length {
            return Err(ModelError::shape(
                "model input",
                format!("sequence length in 1..={}", self.config.context_length),
                format!("length {seq_len}"),
            ));
        }
        for (b, seq) in inputs.iter().enumerate() {
            if seq.len() != seq_len {
                return Err(ModelError::shape(
                    "model input",
                    format!("({}, {seq_len})", inputs.len()),
                    format!("row {b} of length {}", seq.len()),
                ));
            }
        }
        self.check_ids(inputs)?;
        Ok(seq_len)
    }

    fn check_targets(&self, inputs: &[Vec<usize>], targets: &[Vec<usize>]) -> Result<()> {
        let same_shape = inputs.len() == targets.len()
            && inputs.iter().zip(targets).all(|(i, t)| i.len() == t.len());
        if !same_shape {
            return Err(ModelError::shape("targets", shape_of(inputs), shape_of(targets)));
        }
        self.check_ids(targets)
    }

    fn check_ids(&self, seqs: &[Vec<usize>]) -> Result<()> {
        let vocab_size = self.config.vocab_size;
        match seqs.iter().flatten().find(|&&id| id >= vocab_size) {
            Some(&id) => Err(ModelError::TokenOutOfRange { id, vocab_size }),
            None => Ok(()),
        }
    }
}

fn flatten(seqs: &[Vec<usize>]) -> Vec<usize> {
    seqs.iter().flatten().copied().collect()
}

fn shape_of(seqs: &[Vec<usize>]) -> String {
    match seqs.first() {
        Some(first) if seqs.iter().all(|s| s.len() == first.len()) => {
            format!("({}, {})", seqs.len(), first.len())
        }
        Some(_) => format!("({}, ragged)", seqs.len()),
        None => "(0, 0)".to_string(),
    }
}

/// Mean cross-entropy of `[N, V]` logits against `N` target ids.
pub fn cross_entropy(logits: &Tensor, targets: &[usize]) -> f32 {
    let total: f32 = targets
        .iter()
        .enumerate()
        .map(|(n, &target)| {
            let row = logits.row(n);
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let sum: f32 = row.iter().map(|&v| (v - max).exp()).sum();
            -((row[target] - max) - sum.ln())
        })
        .sum();
    total / targets.len() as f32
}

/// Gradient of [`cross_entropy`] with respect to the logits.
pub fn cross_entropy_grad(logits: &Tensor, targets: &[usize]) -> Tensor {
    let n = targets.len() as f32;
    let mut grad = logits.clone();
    for (i, &target) in targets.iter().enumerate() {
        let row = grad.row_mut(i);
        crate::tensor::softmax_in_place(row);
        row[target] -= 1.0;
        for v in row.iter_mut() {
            *v /= n;
        }
    }
    grad
}

pub struct GptCache {
    pub embedding: EmbeddingCache,
    pub blocks: Vec<BlockCache>,
    pub ln_f: LayerNormCache,
    pub lm_head: LinearCache,
}

/// Gradients for every parameter of a [`Gpt`].
pub struct GptGradients {
    pub embedding: EmbeddingGradients,
    pub blocks: Vec<BlockGradients>,
    pub ln_f: LayerNormGradients,
    pub lm_head: LinearGradients,
}

impl GptGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut tensors = self.embedding.tensors();
        for block in &self.blocks {
            tensors.extend(block.tensors());
        }
        tensors.extend(self.ln_f.tensors());
        tensors.extend(self.lm_head.tensors());
        tensors
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut tensors = self.embedding.tensors_mut();
        for block in &mut self.blocks {
            tensors.extend(block.tensors_mut());
        }
        tensors.extend(self.ln_f.tensors_mut());
        tensors.extend(self.lm_head.tensors_mut());
        tensors
    }
}

/// Attention weights exported for visualization.
///
/// `blocks[b][h][i][j]` is how much position `i` attends to position `j` in
/// head `h` of block `b`.
#[derive(Clone, Debug, Serialize)]
pub struct AttentionMaps {
    pub tokens: Vec<usize>,
    pub blocks: Vec<Vec<Vec<Vec<f32>>>>,
}
