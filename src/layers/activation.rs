//! Activation Functions
//!
//! The feed-forward network applies one of two element-wise nonlinearities.
//!
//! ## ReLU
//!
//! ```text
//! ReLU(x)  = max(0, x)
//! ReLU'(x) = 1 if x > 0 else 0
//! ```
//!
//! ## GELU
//!
//! Tanh approximation:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```
//!
//! ReLU is the default; GELU is selectable through the model configuration.

use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Nonlinearity used inside the feed-forward network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Gelu,
}

impl Activation {
    pub fn forward(self, x: &Tensor) -> Tensor {
        match self {
            Activation::Relu => relu_forward(x),
            Activation::Gelu => gelu_forward(x),
        }
    }

    /// Gradient with respect to the activation input `x`.
    pub fn backward(self, grad_out: &Tensor, x: &Tensor) -> Tensor {
        match self {
            Activation::Relu => relu_backward(grad_out, x),
            Activation::Gelu => gelu_backward(grad_out, x),
        }
    }
}

impl std::str::FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "gelu" => Ok(Activation::Gelu),
            other => Err(format!("unknown activation '{other}' (expected relu or gelu)")),
        }
    }
}

pub fn relu_forward(x: &Tensor) -> Tensor {
    let result = x.data.par_iter().map(|&v| v.max(0.0)).collect();
    Tensor::new(result, x.shape.clone())
}

pub fn relu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let grad = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&x_val, &g)| if x_val > 0.0 { g } else { 0.0 })
        .collect();
    Tensor::new(grad, x.shape.clone())
}

pub fn gelu_forward(x: &Tensor) -> Tensor {
    let sqrt_2_pi = (2.0 / std::f32::consts::PI).sqrt();
    let result = x
        .data
        .par_iter()
        .map(|&val| 0.5 * val * (1.0 + (sqrt_2_pi * (val + 0.044715 * val.powi(3))).tanh()))
        .collect();
    Tensor::new(result, x.shape.clone())
}

/// `grad_out * GELU'(x)`, differentiating the tanh approximation exactly.
pub fn gelu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let sqrt_2_pi = (2.0 / std::f32::consts::PI).sqrt();
    let grad = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&x_val, &grad_val)| {
            let inner = sqrt_2_pi * (x_val + 0.044715 * x_val.powi(3));
            let tanh_inner = inner.tanh();
            let sech_sq = 1.0 - tanh_inner * tanh_inner;
            let d = 0.5 * (1.0 + tanh_inner)
                + 0.5 * x_val * sech_sq * sqrt_2_pi * (1.0 + 3.0 * 0.044715 * x_val.powi(2));
            grad_val * d
        })
        .collect();
    Tensor::new(grad, x.shape.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu() {
        let x = Tensor::new(vec![-2.0, -0.5, 0.0, 0.5, 2.0], vec![1, 5]);
        assert_eq!(relu_forward(&x).data, vec![0.0, 0.0, 0.0, 0.5, 2.0]);

        let g = Tensor::full(vec![1, 5], 3.0);
        assert_eq!(relu_backward(&g, &x).data, vec![0.0, 0.0, 0.0, 3.0, 3.0]);
    }

    #[test]
    fn test_gelu_derivative_matches_finite_difference() {
        let points = [-2.0f32, -0.7, 0.0, 0.3, 1.5];
        let h = 1e-3;
        for &p in &points {
            let plus = gelu_forward(&Tensor::new(vec![p + h], vec![1, 1])).data[0];
            let minus = gelu_forward(&Tensor::new(vec![p - h], vec![1, 1])).data[0];
            let numeric = (plus - minus) / (2.0 * h);
            let analytic = gelu_backward(
                &Tensor::new(vec![1.0], vec![1, 1]),
                &Tensor::new(vec![p], vec![1, 1]),
            )
            .data[0];
            assert!((numeric - analytic).abs() < 1e-2, "x={p}: {numeric} vs {analytic}");
        }
    }

    #[test]
    fn test_parse_and_default() {
        assert_eq!(Activation::default(), Activation::Relu);
        assert_eq!("GELU".parse::<Activation>().unwrap(), Activation::Gelu);
        assert!("tanh".parse::<Activation>().is_err());
        assert_eq!(serde_json::to_string(&Activation::Gelu).unwrap(), "\"gelu\"");
    }
}
