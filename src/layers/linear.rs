//! Linear Layer
//!
//! Affine map `y = x @ W (+ b)`.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```
//!
//! Attention projections have no bias; the residual projections and the
//! feed-forward layers do.

use super::ParamMut;
use crate::tensor::Tensor;
use rand::Rng;
use rand_distr::StandardNormal;

/// Standard deviation of the normal initialization for weights and embeddings.
pub const INIT_STD: f32 = 0.02;

/// Draw `size` values from N(0, std²).
pub fn normal_init<R: Rng + ?Sized>(size: usize, std: f32, rng: &mut R) -> Vec<f32> {
    (0..size)
        .map(|_| {
            let z: f32 = rng.sample(StandardNormal);
            z * std
        })
        .collect()
}

/// Fully connected layer.
///
/// - `weight`: `[in_features, out_features]`
/// - `bias`: `[out_features]`, if present
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    /// Create a layer with N(0, 0.02²) weights and a zero bias.
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: Tensor::new(
                normal_init(in_features * out_features, INIT_STD, rng),
                vec![in_features, out_features],
            ),
            bias: bias.then(|| Tensor::zeros(vec![out_features])),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape[1]
    }

    /// Forward pass on `[rows, in_features]`, caching the input.
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let y = x.matmul(&self.weight);
        let y = match &self.bias {
            Some(b) => y.add_row(b),
            None => y,
        };
        (y, LinearCache { x: x.clone() })
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &LinearCache) -> LinearGradients {
        LinearGradients {
            weight: cache.x.transpose().matmul(grad_out),
            bias: self.bias.as_ref().map(|_| grad_out.sum_rows()),
            x: grad_out.matmul(&self.weight.transpose()),
        }
    }

    pub fn params(&self) -> Vec<&Tensor> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        let mut params = vec![ParamMut::weight(&mut self.weight)];
        params.extend(self.bias.as_mut().map(ParamMut::no_decay));
        params
    }
}

pub struct LinearCache {
    pub x: Tensor,
}

pub struct LinearGradients {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    /// Gradient for the previous layer
    pub x: Tensor,
}

impl LinearGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut tensors = vec![&self.weight];
        tensors.extend(self.bias.as_ref());
        tensors
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut tensors = vec![&mut self.weight];
        tensors.extend(self.bias.as_mut());
        tensors
    }
}
