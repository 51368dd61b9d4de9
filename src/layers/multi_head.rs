//! Multi-Head Attention
//!
//! `n_head` independent [`AttentionHead`]s of width `n_embd / n_head` read the
//! same input. Their outputs are concatenated back to `n_embd` columns, passed
//! through an output projection and dropout.
//!
//! Heads are computed in parallel with Rayon. In training mode each head
//! draws its dropout masks from its own generator, seeded from the caller's
//! generator before the heads start, so results do not depend on thread
//! scheduling.

use super::attention::{AttentionCache, AttentionGradients, AttentionHead, CausalMask};
use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache, LinearGradients};
use super::{Mode, ParamMut};
use crate::error::{ModelError, Result};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    pub heads: Vec<AttentionHead>,
    /// `[n_embd, n_embd]` projection of the concatenated heads
    pub proj: Linear,
    pub dropout: Dropout,
}

impl MultiHeadAttention {
    /// # Errors
    ///
    /// [`ModelError::Config`] unless `n_head` is positive and divides `n_embd`.
    pub fn new<R: Rng + ?Sized>(
        n_embd: usize,
        n_head: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self> {
        if n_head == 0 || n_embd % n_head != 0 {
            return Err(ModelError::Config(format!(
                "n_head ({n_head}) must be positive and divide n_embd ({n_embd})"
            )));
        }
        let head_size = n_embd / n_head;
        let heads = (0..n_head)
            .map(|_| AttentionHead::new(n_embd, head_size, dropout, rng))
            .collect();
        Ok(Self {
            heads,
            proj: Linear::new(n_embd, n_embd, true, rng),
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        x: &Tensor,
        seq_len: usize,
        mask: &CausalMask,
        mode: Mode,
        rng: &mut R,
    ) -> (Tensor, MultiHeadCache) {
        let seeds: Vec<u64> = match mode {
            Mode::Train => self.heads.iter().map(|_| rng.random()).collect(),
            Mode::Eval => vec![0; self.heads.len()],
        };

        let (outputs, head_caches): (Vec<Tensor>, Vec<AttentionCache>) = self
            .heads
            .par_iter()
            .zip(seeds)
            .map(|(head, seed)| {
                let mut head_rng = StdRng::seed_from_u64(seed);
                head.forward(x, seq_len, mask, mode, &mut head_rng)
            })
            .unzip();

        let concat = Tensor::concat_cols(&outputs);
        let (projected, proj_cache) = self.proj.forward(&concat);
        let (y, dropout_cache) = self.dropout.forward(&projected, mode, rng);

        (
            y,
            MultiHeadCache {
                heads: head_caches,
                proj_cache,
                dropout_cache,
            },
        )
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &MultiHeadCache) -> MultiHeadGradients {
        let grad_projected = self.dropout.backward(grad_out, &cache.dropout_cache);
        let proj = self.proj.backward(&grad_projected, &cache.proj_cache);

        let head_size = proj.x.cols() / self.heads.len();
        let heads: Vec<AttentionGradients> = self
            .heads
            .par_iter()
            .zip(&cache.heads)
            .enumerate()
            .map(|(h, (head, head_cache))| {
                let grad = proj.x.slice_cols(h * head_size, (h + 1) * head_size);
                head.backward(&grad, head_cache)
            })
            .collect();

        let mut x = Tensor::zeros(grad_out.shape.clone());
        for head in &heads {
            x.add_assign(&head.x);
        }

        MultiHeadGradients { heads, proj, x }
    }

    pub fn params(&self) -> Vec<&Tensor> {
        let mut params: Vec<&Tensor> = self.heads.iter().flat_map(AttentionHead::params).collect();
        params.extend(self.proj.params());
        params
    }

    pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        let mut params: Vec<ParamMut<'_>> = self
            .heads
            .iter_mut()
            .flat_map(AttentionHead::params_mut)
            .collect();
        params.extend(self.proj.params_mut());
        params
    }
}

pub struct MultiHeadCache {
    pub heads: Vec<AttentionCache>,
    pub proj_cache: LinearCache,
    pub dropout_cache: DropoutCache,
}

pub struct MultiHeadGradients {
    pub heads: Vec<AttentionGradients>,
    pub proj: LinearGradients,
    pub x: Tensor,
}

impl MultiHeadGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut tensors: Vec<&Tensor> = self
            .heads
            .iter()
            .flat_map(AttentionGradients::tensors)
            .collect();
        tensors.extend(self.proj.tensors());
        tensors
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut tensors: Vec<&mut Tensor> = self
            .heads
            .iter_mut()
            .flat_map(AttentionGradients::tensors_mut)
            .collect();
        tensors.extend(self.proj.tensors_mut());
        tensors
    }
}
