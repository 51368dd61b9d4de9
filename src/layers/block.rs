//! Transformer Block
//!
//! Pre-norm block with two residual sub-layers:
//!
//! ```text
//! x = x + MultiHeadAttention(LayerNorm1(x))
//! x = x + FeedForward(LayerNorm2(x))
//! ```
//!
//! ```text
//! x → LayerNorm → Attention → (+) → LayerNorm → FeedForward → (+) → output
//! │                            ↑  │                             ↑
//! └────────────────────────────┘  └─────────────────────────────┘
//! ```
//!
//! ## Backward Pass
//!
//! At each residual the gradient splits: one copy flows straight through, the
//! other through the sub-layer and its LayerNorm. The two are summed.

use super::attention::CausalMask;
use super::feed_forward::{FeedForward, FeedForwardCache, FeedForwardGradients};
use super::layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
use super::multi_head::{MultiHeadAttention, MultiHeadCache, MultiHeadGradients};
use super::{Mode, ParamMut};
use crate::config::ModelConfig;
use crate::error::Result;
use crate::tensor::Tensor;
use rand::Rng;

#[derive(Clone, Debug)]
pub struct Block {
    pub ln1: LayerNorm,
    pub attn: MultiHeadAttention,
    pub ln2: LayerNorm,
    pub ffwd: FeedForward,
}

impl Block {
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> Result<Self> {
        Ok(Self {
            ln1: LayerNorm::new(config.n_embd),
            attn: MultiHeadAttention::new(config.n_embd, config.n_head, config.dropout, rng)?,
            ln2: LayerNorm::new(config.n_embd),
            ffwd: FeedForward::new(config.n_embd, config.activation, config.dropout, rng),
        })
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        x: &Tensor,
        seq_len: usize,
        mask: &CausalMask,
        mode: Mode,
        rng: &mut R,
    ) -> (Tensor, BlockCache) {
        let (ln1_out, ln1_cache) = self.ln1.forward(x);
        let (attn_out, attn_cache) = self.attn.forward(&ln1_out, seq_len, mask, mode, rng);
        let x_after_attn = x.add(&attn_out);

        let (ln2_out, ln2_cache) = self.ln2.forward(&x_after_attn);
        let (ffwd_out, ffwd_cache) = self.ffwd.forward(&ln2_out, mode, rng);
        let y = x_after_attn.add(&ffwd_out);

        (
            y,
            BlockCache {
                ln1_cache,
                attn_cache,
                ln2_cache,
                ffwd_cache,
            },
        )
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &BlockCache) -> BlockGradients {
        let ffwd = self.ffwd.backward(grad_out, &cache.ffwd_cache);
        let ln2 = self.ln2.backward(&ffwd.x, &cache.ln2_cache);
        let mut grad_x_after_attn = grad_out.clone();
        grad_x_after_attn.add_assign(&ln2.x);

        let attn = self.attn.backward(&grad_x_after_attn, &cache.attn_cache);
        let ln1 = self.ln1.backward(&attn.x, &cache.ln1_cache);
        let mut x = grad_x_after_attn;
        x.add_assign(&ln1.x);

        BlockGradients {
            ln1,
            attn,
            ln2,
            ffwd,
            x,
        }
    }

    pub fn params(&self) -> Vec<&Tensor> {
        let mut params = self.ln1.params();
        params.extend(self.attn.params());
        params.extend(self.ln2.params());
        params.extend(self.ffwd.params());
        params
    }

    pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        let mut params = self.ln1.params_mut();
        params.extend(self.attn.params_mut());
        params.extend(self.ln2.params_mut());
        params.extend(self.ffwd.params_mut());
        params
    }
}

pub struct BlockCache {
    pub ln1_cache: LayerNormCache,
    pub attn_cache: MultiHeadCache,
    pub ln2_cache: LayerNormCache,
    pub ffwd_cache: FeedForwardCache,
}

pub struct BlockGradients {
    pub ln1: LayerNormGradients,
    pub attn: MultiHeadGradients,
    pub ln2: LayerNormGradients,
    pub ffwd: FeedForwardGradients,
    pub x: Tensor,
}

impl BlockGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut tensors = self.ln1.tensors();
        tensors.extend(self.attn.tensors());
        tensors.extend(self.ln2.tensors());
        tensors.extend(self.ffwd.tensors());
        tensors
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut tensors = self.ln1.tensors_mut();
        tensors.extend(self.attn.tensors_mut());
        tensors.extend(self.ln2.tensors_mut());
        tensors.extend(self.ffwd.tensors_mut());
        tensors
    }
}
