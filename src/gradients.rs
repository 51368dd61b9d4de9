//! Gradient Utilities
//!
//! Global L2 norm and norm-based clipping over every gradient tensor of the
//! model.
//!
//! ```text
//! norm = √(Σ g²)
//! if norm > max_norm:
//!     g *= max_norm / norm
//! ```
//!
//! All tensors are scaled by the same factor, so relative magnitudes are
//! preserved. The norm is also the cheapest place to notice a NaN or an
//! infinity anywhere in the backward pass: a single non-finite element makes
//! the norm non-finite.

use crate::model::GptGradients;
use rayon::prelude::*;

/// L2 norm over all gradient values.
pub fn compute_grad_norm(grads: &GptGradients) -> f32 {
    grads
        .tensors()
        .iter()
        .map(|t| t.data.par_iter().map(|&g| g * g).sum::<f32>())
        .sum::<f32>()
        .sqrt()
}

/// Scale all gradients so their global norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_gradients(grads: &mut GptGradients, max_norm: f32) -> f32 {
    let norm = compute_grad_norm(grads);
    if norm > max_norm {
        let scale = max_norm / norm;
        for t in grads.tensors_mut() {
            t.data.par_iter_mut().for_each(|g| *g *= scale);
        }
    }
    norm
}
