//! Position-wise Feed-Forward Network
//!
//! ```text
//! h = activation(x @ W1 + b1)     [rows, 4 * n_embd]
//! y = dropout(h @ W2 + b2)        [rows, n_embd]
//! ```
//!
//! Every row is transformed independently; mixing across positions is left
//! to attention.

use super::activation::Activation;
use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache, LinearGradients};
use super::{Mode, ParamMut};
use crate::tensor::Tensor;
use rand::Rng;

/// Width multiplier of the hidden layer.
pub const EXPANSION: usize = 4;

#[derive(Clone, Debug)]
pub struct FeedForward {
    pub fc1: Linear,
    pub fc2: Linear,
    pub activation: Activation,
    pub dropout: Dropout,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(
        n_embd: usize,
        activation: Activation,
        dropout: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            fc1: Linear::new(n_embd, EXPANSION * n_embd, true, rng),
            fc2: Linear::new(EXPANSION * n_embd, n_embd, true, rng),
            activation,
            dropout: Dropout::new(dropout),
        }
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        x: &Tensor,
        mode: Mode,
        rng: &mut R,
    ) -> (Tensor, FeedForwardCache) {
        let (pre, fc1_cache) = self.fc1.forward(x);
        let hidden = self.activation.forward(&pre);
        let (out, fc2_cache) = self.fc2.forward(&hidden);
        let (y, dropout_cache) = self.dropout.forward(&out, mode, rng);

        (
            y,
            FeedForwardCache {
                fc1_cache,
                pre,
                fc2_cache,
                dropout_cache,
            },
        )
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &FeedForwardCache) -> FeedForwardGradients {
        let grad = self.dropout.backward(grad_out, &cache.dropout_cache);
        let fc2 = self.fc2.backward(&grad, &cache.fc2_cache);
        let grad_pre = self.activation.backward(&fc2.x, &cache.pre);
        let fc1 = self.fc1.backward(&grad_pre, &cache.fc1_cache);
        let x = fc1.x.clone();

        FeedForwardGradients { fc1, fc2, x }
    }

    pub fn params(&self) -> Vec<&Tensor> {
        let mut params = self.fc1.params();
        params.extend(self.fc2.params());
        params
    }

    pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        let mut params = self.fc1.params_mut();
        params.extend(self.fc2.params_mut());
        params
    }
}

pub struct FeedForwardCache {
    pub fc1_cache: LinearCache,
    /// Activation input
    pub pre: Tensor,
    pub fc2_cache: LinearCache,
    pub dropout_cache: DropoutCache,
}

pub struct FeedForwardGradients {
    pub fc1: LinearGradients,
    pub fc2: LinearGradients,
    pub x: Tensor,
}

impl FeedForwardGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut tensors = self.fc1.tensors();
        tensors.extend(self.fc2.tensors());
        tensors
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut tensors = self.fc1.tensors_mut();
        tensors.extend(self.fc2.tensors_mut());
        tensors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::normal_init;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_rows_are_independent() {
        let mut rng = StdRng::seed_from_u64(3);
        let ffn = FeedForward::new(8, Activation::Relu, 0.0, &mut rng);
        let x = Tensor::new(normal_init(3 * 8, 1.0, &mut rng), vec![3, 8]);
        let (y, _) = ffn.forward(&x, Mode::Eval, &mut rng);
        let (y_row, _) = ffn.forward(&x.slice_rows(1, 2), Mode::Eval, &mut rng);
        assert_eq!(y.shape, vec![3, 8]);
        for (a, b) in y.row(1).iter().zip(&y_row.data) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_gelu_input_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(6);
        let ffn = FeedForward::new(4, Activation::Gelu, 0.0, &mut rng);
        let x = Tensor::new(normal_init(2 * 4, 1.0, &mut rng), vec![2, 4]);
        let g = Tensor::new(normal_init(2 * 4, 1.0, &mut rng), vec![2, 4]);
        let loss = |x: &Tensor| -> f32 {
            let mut r = StdRng::seed_from_u64(0);
            let (y, _) = ffn.forward(x, Mode::Eval, &mut r);
            y.data.iter().zip(&g.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = ffn.forward(&x, Mode::Eval, &mut rng);
        let grads = ffn.backward(&g, &cache);
        assert_eq!(grads.tensors().len(), 4);

        let h = 1e-2;
        for idx in 0..8 {
            let mut plus = x.clone();
            plus.data[idx] += h;
            let mut minus = x.clone();
            minus.data[idx] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert!((numeric - grads.x.data[idx]).abs() < 1e-3);
        }
    }
}
