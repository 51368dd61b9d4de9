//! AdamW Optimizer
//!
//! Adam with decoupled weight decay.
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g, at step t:
//!
//! ```text
//! θ = θ * (1 - α * λ)              # weight decay, weight matrices only
//! m = β₁ * m + (1 - β₁) * g        # first moment
//! v = β₂ * v + (1 - β₂) * g²       # second moment
//! m_hat = m / (1 - β₁^t)
//! v_hat = v / (1 - β₂^t)
//! θ = θ - α * m_hat / (√v_hat + ε)
//! ```
//!
//! Defaults: β₁ = 0.9, β₂ = 0.999, ε = 1e-8, λ = 0.01.
//!
//! ## Selective Weight Decay
//!
//! Decay applies to 2-D weight matrices of linear layers. Embedding tables,
//! biases and LayerNorm parameters are never decayed; each parameter carries
//! its own flag (see [`ParamMut`]).
//!
//! ## State Layout
//!
//! The moment buffers are flat lists in the order of [`Gpt::params_mut`], so
//! the optimizer needs no knowledge of the model structure. The same order is
//! used to persist them in checkpoints.

use crate::error::{ModelError, Result};
use crate::layers::ParamMut;
use crate::model::{Gpt, GptGradients};
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Element count above which a tensor is updated in parallel.
const PARALLEL_THRESHOLD: usize = 1000;

/// Hyper-parameters of the update rule.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// AdamW state: one pair of moment buffers per parameter tensor.
#[derive(Clone, Debug)]
pub struct AdamW {
    pub config: AdamWConfig,
    pub m: Vec<Tensor>,
    pub v: Vec<Tensor>,
    /// Number of updates applied so far
    pub step: usize,
}

impl AdamW {
    /// Zero-initialized moments shaped like the model's parameters.
    pub fn new(model: &Gpt, config: AdamWConfig) -> Self {
        let zeros: Vec<Tensor> = model
            .params()
            .iter()
            .map(|p| Tensor::zeros(p.shape.clone()))
            .collect();
        Self {
            config,
            m: zeros.clone(),
            v: zeros,
            step: 0,
        }
    }

    /// Apply one update with learning rate `lr`.
    ///
    /// # Errors
    ///
    /// [`ModelError::Shape`] when the gradients do not line up with the
    /// model's parameters or with this optimizer's state. Nothing is
    /// modified in that case.
    pub fn update(&mut self, model: &mut Gpt, grads: &GptGradients, lr: f32) -> Result<()> {
        let grad_tensors = grads.tensors();
        let params = model.params_mut();
        if params.len() != grad_tensors.len() || params.len() != self.m.len() {
            return Err(ModelError::shape(
                "optimizer update",
                format!("{} parameter tensors", self.m.len()),
                format!("{} parameters, {} gradients", params.len(), grad_tensors.len()),
            ));
        }
        for ((p, g), m) in params.iter().zip(&grad_tensors).zip(&self.m) {
            if p.tensor.shape != g.shape || p.tensor.shape != m.shape {
                return Err(ModelError::shape(
                    "optimizer update",
                    format!("{:?}", p.tensor.shape),
                    format!("gradient {:?}, moment {:?}", g.shape, m.shape),
                ));
            }
        }

        self.step += 1;
        let t = self.step as i32;
        let step = StepScalars {
            lr,
            beta1: self.config.beta1,
            beta2: self.config.beta2,
            epsilon: self.config.epsilon,
            weight_decay: self.config.weight_decay,
            bias_correction1: 1.0 - self.config.beta1.powi(t),
            bias_correction2: 1.0 - self.config.beta2.powi(t),
        };

        for (((param, grad), m), v) in params
            .into_iter()
            .zip(grad_tensors)
            .zip(&mut self.m)
            .zip(&mut self.v)
        {
            step.apply(param, grad, m, v);
        }
        Ok(())
    }
}

/// Scalars shared by every element of one update.
struct StepScalars {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    bias_correction1: f32,
    bias_correction2: f32,
}

impl StepScalars {
    #[inline(always)]
    fn update_one(&self, decay: bool, p: &mut f32, g: f32, m: &mut f32, v: &mut f32) {
        if decay {
            *p *= 1.0 - self.lr * self.weight_decay;
        }
        *m = self.beta1 * *m + (1.0 - self.beta1) * g;
        *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
        let m_hat = *m / self.bias_correction1;
        let v_hat = *v / self.bias_correction2;
        *p -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
    }

    fn apply(&self, param: ParamMut<'_>, grad: &Tensor, m: &mut Tensor, v: &mut Tensor) {
        let decay = param.decay;
        let data = &mut param.tensor.data;
        if data.len() > PARALLEL_THRESHOLD {
            data.par_iter_mut()
                .zip(grad.data.par_iter())
                .zip(m.data.par_iter_mut().zip(v.data.par_iter_mut()))
                .for_each(|((p, &g), (m, v))| self.update_one(decay, p, g, m, v));
        } else {
            for (((p, &g), m), v) in data
                .iter_mut()
                .zip(&grad.data)
                .zip(&mut m.data)
                .zip(&mut v.data)
            {
                self.update_one(decay, p, g, m, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::layers::Mode;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model() -> Gpt {
        let config = ModelConfig {
            vocab_size: 6,
            context_length: 4,
            n_embd: 8,
            n_head: 2,
            n_layer: 1,
            dropout: 0.0,
            activation: Default::default(),
        };
        Gpt::new(&config, &mut StdRng::seed_from_u64(0)).unwrap()
    }

    fn zero_grads(model: &Gpt) -> GptGradients {
        let mut rng = StdRng::seed_from_u64(1);
        let (_, mut grads) = model
            .loss_and_gradients(&[vec![0, 1]], &[vec![1, 2]], Mode::Eval, &mut rng)
            .unwrap();
        for t in grads.tensors_mut() {
            t.data.iter_mut().for_each(|g| *g = 0.0);
        }
        grads
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        // With bias correction, the first step is lr * sign(g) for every non-zero g.
        let mut model = model();
        let mut grads = zero_grads(&model);
        grads.lm_head.bias.as_mut().unwrap().data[2] = 0.5;
        grads.lm_head.bias.as_mut().unwrap().data[3] = -2.0;

        let before = model.lm_head.bias.clone().unwrap();
        let mut opt = AdamW::new(&model, AdamWConfig::default());
        opt.update(&mut model, &grads, 0.1).unwrap();
        let after = model.lm_head.bias.clone().unwrap();

        assert!((after.data[2] - (before.data[2] - 0.1)).abs() < 1e-5);
        assert!((after.data[3] - (before.data[3] + 0.1)).abs() < 1e-5);
        assert_eq!(after.data[0], before.data[0]);
        assert_eq!(opt.step, 1);
    }

    #[test]
    fn test_decay_touches_weight_matrices_only() {
        let mut model = model();
        let grads = zero_grads(&model);
        let weight_before = model.lm_head.weight.clone();
        let tok_before = model.embedding.tok.clone();
        let gamma_before = model.ln_f.gamma.clone();

        let config = AdamWConfig {
            weight_decay: 0.5,
            ..AdamWConfig::default()
        };
        let mut opt = AdamW::new(&model, config);
        opt.update(&mut model, &grads, 0.1).unwrap();

        for (a, b) in model.lm_head.weight.data.iter().zip(&weight_before.data) {
            assert!((a - b * 0.95).abs() < 1e-7);
        }
        assert_eq!(model.embedding.tok, tok_before);
        assert_eq!(model.ln_f.gamma, gamma_before);
    }

    #[test]
    fn test_mismatched_state_is_rejected() {
        let mut model = model();
        let grads = zero_grads(&model);
        let mut opt = AdamW::new(&model, AdamWConfig::default());
        opt.m.pop();
        let before = model.lm_head.weight.clone();
        assert!(opt.update(&mut model, &grads, 0.1).is_err());
        assert_eq!(model.lm_head.weight, before);
        assert_eq!(opt.step, 0);
    }
}
