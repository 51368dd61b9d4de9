//! Dropout Layer
//!
//! Inverted dropout: in [`Mode::Train`] each activation is zeroed with
//! probability `rate` and the survivors are scaled by `1 / (1 - rate)`, so the
//! expected output equals the input. In [`Mode::Eval`] the layer is the identity.

use super::Mode;
use crate::tensor::Tensor;
use rand::Rng;

#[derive(Clone, Copy, Debug)]
pub struct Dropout {
    pub rate: f32,
}

impl Dropout {
    /// # Panics
    ///
    /// Panics if `rate` is outside `[0, 1)`; configurations are validated
    /// before layers are built.
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&rate),
            "Dropout rate must be in [0, 1)"
        );
        Self { rate }
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        x: &Tensor,
        mode: Mode,
        rng: &mut R,
    ) -> (Tensor, DropoutCache) {
        if mode == Mode::Eval || self.rate == 0.0 {
            return (
                x.clone(),
                DropoutCache {
                    mask: None,
                    scale: 1.0,
                },
            );
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mut mask = Vec::with_capacity(x.len());
        let mut output = Tensor::zeros(x.shape.clone());
        for (out, &v) in output.data.iter_mut().zip(&x.data) {
            let keep = rng.random::<f32>() >= self.rate;
            mask.push(keep);
            if keep {
                *out = v * scale;
            }
        }

        (
            output,
            DropoutCache {
                mask: Some(mask),
                scale,
            },
        )
    }

    pub fn backward(&self, grad_output: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let data = grad_output
                    .data
                    .iter()
                    .zip(mask)
                    .map(|(&g, &keep)| if keep { g * cache.scale } else { 0.0 })
                    .collect();
                Tensor::new(data, grad_output.shape.clone())
            }
            None => grad_output.clone(),
        }
    }
}

pub struct DropoutCache {
    /// Kept positions; `None` when the layer acted as the identity
    pub mask: Option<Vec<bool>>,
    pub scale: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_eval_is_identity() {
        let dropout = Dropout::new(0.5);
        let mut rng = StdRng::seed_from_u64(0);
        let x = Tensor::new((0..12).map(|i| i as f32).collect(), vec![3, 4]);
        let (y, cache) = dropout.forward(&x, Mode::Eval, &mut rng);
        assert_eq!(y, x);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_train_scales_survivors_and_masks_gradient() {
        let dropout = Dropout::new(0.25);
        let mut rng = StdRng::seed_from_u64(7);
        let x = Tensor::full(vec![50, 40], 1.0);
        let (y, cache) = dropout.forward(&x, Mode::Train, &mut rng);

        let scale = 1.0 / 0.75;
        for &v in &y.data {
            assert!(v == 0.0 || (v - scale).abs() < 1e-6);
        }
        let kept = y.data.iter().filter(|&&v| v != 0.0).count() as f32 / y.len() as f32;
        assert!((kept - 0.75).abs() < 0.05, "kept fraction {kept}");

        let grad = dropout.backward(&Tensor::full(vec![50, 40], 2.0), &cache);
        for (g, v) in grad.data.iter().zip(&y.data) {
            assert_eq!(*g == 0.0, *v == 0.0);
        }
    }

    #[test]
    fn test_zero_rate_never_samples() {
        let dropout = Dropout::new(0.0);
        let mut rng = StdRng::seed_from_u64(1);
        let x = Tensor::full(vec![2, 2], 3.0);
        let (y, cache) = dropout.forward(&x, Mode::Train, &mut rng);
        assert_eq!(y, x);
        assert!(cache.mask.is_none());
    }
}
