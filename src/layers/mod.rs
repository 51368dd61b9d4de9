//! Neural Network Layers
//!
//! Every layer of the model with hand-written forward and backward passes.
//!
//! ## Layers
//!
//! - **activation**: ReLU / GELU and their derivatives
//! - **linear**: affine map, with or without bias
//! - **embedding**: token + position lookup tables
//! - **layer_norm**: normalization with learnable scale and shift
//! - **dropout**: inverted dropout, active in [`Mode::Train`] only
//! - **attention**: one causal scaled dot-product head
//! - **multi_head**: heads in parallel, concatenated and projected
//! - **feed_forward**: per-position two-layer network
//! - **block**: pre-norm transformer block with residual connections
//!
//! ## Design Pattern
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn forward(&self, x: &Tensor, ...) -> (Tensor, LayerCache) { }
//!     pub fn backward(&self, grad: &Tensor, cache: &LayerCache) -> LayerGradients { }
//!     pub fn params(&self) -> Vec<&Tensor> { }
//!     pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> { }
//! }
//!
//! impl LayerGradients {
//!     pub fn tensors(&self) -> Vec<&Tensor> { }      // same order as params()
//!     pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> { }
//! }
//! ```
//!
//! The three parameter/gradient listings share one order, which is what lets
//! the optimizer, gradient clipping and checkpointing walk the model without
//! knowing its structure.
//!
//! Activations are 2-D `[batch * seq_len, width]` tensors throughout.

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod embedding;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;
pub mod multi_head;

pub use activation::Activation;
pub use attention::{AttentionCache, AttentionGradients, AttentionHead, CausalMask};
pub use block::{Block, BlockCache, BlockGradients};
pub use dropout::{Dropout, DropoutCache};
pub use embedding::{Embedding, EmbeddingCache, EmbeddingGradients};
pub use feed_forward::{FeedForward, FeedForwardCache, FeedForwardGradients};
pub use layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
pub use linear::{normal_init, Linear, LinearCache, LinearGradients};
pub use multi_head::{MultiHeadAttention, MultiHeadCache, MultiHeadGradients};

use crate::tensor::Tensor;

/// Whether a forward pass is part of training.
///
/// Dropout is the only behavior that changes: it samples masks in
/// [`Mode::Train`] and is the identity in [`Mode::Eval`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// A mutable handle to one parameter tensor.
pub struct ParamMut<'a> {
    pub tensor: &'a mut Tensor,
    /// Whether decoupled weight decay applies (2-D weight matrices only).
    pub decay: bool,
}

impl<'a> ParamMut<'a> {
    pub fn weight(tensor: &'a mut Tensor) -> Self {
        Self {
            tensor,
            decay: true,
        }
    }

    pub fn no_decay(tensor: &'a mut Tensor) -> Self {
        Self {
            tensor,
            decay: false,
        }
    }
}
