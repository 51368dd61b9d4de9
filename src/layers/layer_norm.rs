//! Layer Normalization
//!
//! Normalizes each row of a `[rows, n_embd]` activation to zero mean and unit
//! variance, then applies a learnable scale (gamma) and shift (beta).
//!
//! ## Forward Pass
//!
//! ```text
//! mean   = sum(x) / N
//! var    = sum((x - mean)²) / N
//! x_norm = (x - mean) / √(var + ε)
//! y      = γ * x_norm + β
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ      = sum_rows(grad_y * x_norm)
//! grad_β      = sum_rows(grad_y)
//! grad_x_norm = grad_y * γ
//! grad_x      = (grad_x_norm - mean(grad_x_norm) - x_norm * mean(grad_x_norm * x_norm)) / √(var + ε)
//! ```
//!
//! The two mean terms carry the dependence of every output on the row's mean
//! and variance.

use super::ParamMut;
use crate::tensor::Tensor;

pub const LAYER_NORM_EPS: f32 = 1e-5;

#[derive(Clone, Debug)]
pub struct LayerNorm {
    /// Scale `[n_embd]`, initialized to ones
    pub gamma: Tensor,
    /// Shift `[n_embd]`, initialized to zeros
    pub beta: Tensor,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(n_embd: usize) -> Self {
        Self {
            gamma: Tensor::full(vec![n_embd], 1.0),
            beta: Tensor::zeros(vec![n_embd]),
            eps: LAYER_NORM_EPS,
        }
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let rows = x.rows();
        let n = x.cols();
        let mut x_norm = Tensor::zeros(x.shape.clone());
        let mut y = Tensor::zeros(x.shape.clone());
        let mut std = Vec::with_capacity(rows);

        for i in 0..rows {
            let row = x.row(i);
            let mean = row.iter().sum::<f32>() / n as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
            let s = (var + self.eps).sqrt();
            std.push(s);

            let norm_row = x_norm.row_mut(i);
            for (o, v) in norm_row.iter_mut().zip(row) {
                *o = (v - mean) / s;
            }
            let y_row = y.row_mut(i);
            for j in 0..n {
                y_row[j] = self.gamma.data[j] * x_norm.data[i * n + j] + self.beta.data[j];
            }
        }

        (y, LayerNormCache { x_norm, std })
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &LayerNormCache) -> LayerNormGradients {
        let rows = grad_out.rows();
        let n = grad_out.cols();

        let mut grad_gamma = vec![0.0; n];
        let mut grad_beta = vec![0.0; n];
        let mut grad_x = Tensor::zeros(grad_out.shape.clone());

        for i in 0..rows {
            let g_row = grad_out.row(i);
            let xn_row = cache.x_norm.row(i);

            for j in 0..n {
                grad_gamma[j] += g_row[j] * xn_row[j];
                grad_beta[j] += g_row[j];
            }

            let gxn: Vec<f32> = g_row
                .iter()
                .zip(&self.gamma.data)
                .map(|(g, gamma)| g * gamma)
                .collect();
            let mean_gxn = gxn.iter().sum::<f32>() / n as f32;
            let mean_gxn_xn = gxn.iter().zip(xn_row).map(|(g, x)| g * x).sum::<f32>() / n as f32;

            let s = cache.std[i];
            for (j, out) in grad_x.row_mut(i).iter_mut().enumerate() {
                *out = (gxn[j] - mean_gxn - xn_row[j] * mean_gxn_xn) / s;
            }
        }

        LayerNormGradients {
            gamma: Tensor::new(grad_gamma, vec![n]),
            beta: Tensor::new(grad_beta, vec![n]),
            x: grad_x,
        }
    }

    pub fn params(&self) -> Vec<&Tensor> {
        vec![&self.gamma, &self.beta]
    }

    pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        vec![
            ParamMut::no_decay(&mut self.gamma),
            ParamMut::no_decay(&mut self.beta),
        ]
    }
}

pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// `√(var + ε)` per row
    pub std: Vec<f32>,
}

pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}

impl LayerNormGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        vec![&self.gamma, &self.beta]
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_normalized() {
        let ln = LayerNorm::new(4);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, -5.0, 0.0, 5.0, 10.0], vec![2, 4]);
        let (y, _) = ln.forward(&x);
        for i in 0..2 {
            let row = y.row(i);
            let mean = row.iter().sum::<f32>() / 4.0;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        let mut ln = LayerNorm::new(3);
        ln.gamma = Tensor::new(vec![0.5, 1.5, -1.0], vec![3]);
        ln.beta = Tensor::new(vec![0.1, 0.0, 0.2], vec![3]);
        let x = Tensor::new(vec![0.3, -1.2, 2.0], vec![1, 3]);
        // Loss = sum(y * w) for a fixed w
        let w = [1.0f32, -2.0, 0.5];
        let loss = |x: &Tensor| -> f32 {
            let (y, _) = ln.forward(x);
            y.data.iter().zip(&w).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = ln.forward(&x);
        let grads = ln.backward(&Tensor::new(w.to_vec(), vec![1, 3]), &cache);

        let h = 1e-2;
        for j in 0..3 {
            let mut plus = x.clone();
            plus.data[j] += h;
            let mut minus = x.clone();
            minus.data[j] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert!(
                (numeric - grads.x.data[j]).abs() < 1e-2,
                "dx[{j}]: {numeric} vs {}",
                grads.x.data[j]
            );
        }
    }

    #[test]
    fn test_parameter_gradients_sum_over_rows() {
        let ln = LayerNorm::new(2);
        let x = Tensor::new(vec![1.0, 3.0, 2.0, 0.0], vec![2, 2]);
        let (_, cache) = ln.forward(&x);
        let grads = ln.backward(&Tensor::full(vec![2, 2], 1.0), &cache);
        assert_eq!(grads.beta.data, vec![2.0, 2.0]);
        // x_norm rows are [-1, 1] and [1, -1]
        assert!(grads.gamma.data.iter().all(|g| g.abs() < 1e-3));
    }
}
