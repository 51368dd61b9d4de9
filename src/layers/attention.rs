//! Causal Self-Attention Head
//!
//! One head projects the input into a `head_size`-dimensional subspace and
//! lets every position mix the values of itself and earlier positions.
//!
//! ## Scaled Dot-Product Attention
//!
//! ```text
//! Q, K, V  = x @ W_q, x @ W_k, x @ W_v          (no bias)
//! scores   = (Q @ K^T) / √head_size
//! scores[i, j] = -inf  for j > i                (causal mask)
//! weights  = softmax(scores)                    (row-wise)
//! output   = dropout(weights) @ V
//! ```
//!
//! Without the `1/√head_size` factor the dot products grow with the head
//! width and the softmax saturates towards one-hot rows.
//!
//! ## Backward Pass
//!
//! Per sequence in the batch:
//!
//! ```text
//! grad_V  = W_d^T @ grad_out
//! grad_W  = dropout_backward(grad_out @ V^T)
//! grad_S  = W * (grad_W - rowsum(grad_W * W)) * scale
//! grad_Q  = grad_S @ K
//! grad_K  = grad_S^T @ Q
//! ```
//!
//! Masked entries have zero weight, so they receive zero gradient.

use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache, LinearGradients};
use super::{Mode, ParamMut};
use crate::tensor::{softmax_in_place, Tensor};
use rand::Rng;

/// Lower-triangular `context_length × context_length` mask.
///
/// Derived from the configuration at model construction and never updated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CausalMask {
    size: usize,
    allowed: Vec<bool>,
}

impl CausalMask {
    pub fn new(context_length: usize) -> Self {
        let allowed = (0..context_length * context_length)
            .map(|idx| idx % context_length <= idx / context_length)
            .collect();
        Self {
            size: context_length,
            allowed,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether query position `i` may attend to key position `j`.
    pub fn allows(&self, i: usize, j: usize) -> bool {
        self.allowed[i * self.size + j]
    }
}

/// Causal attention weights `[T, T]` for one sequence.
///
/// `q` and `k` are `[T, head_size]` with `T <= mask.size()`. Every row of the
/// result sums to one and is zero strictly above the diagonal.
pub fn causal_attention_weights(q: &Tensor, k: &Tensor, mask: &CausalMask, scale: f32) -> Tensor {
    let t = q.rows();
    let mut scores = q.matmul(&k.transpose());
    for i in 0..t {
        let row = scores.row_mut(i);
        for (j, s) in row.iter_mut().enumerate() {
            *s = if mask.allows(i, j) {
                *s * scale
            } else {
                f32::NEG_INFINITY
            };
        }
        softmax_in_place(row);
    }
    scores
}

/// One attention head.
#[derive(Clone, Debug)]
pub struct AttentionHead {
    pub key: Linear,
    pub query: Linear,
    pub value: Linear,
    pub dropout: Dropout,
}

impl AttentionHead {
    pub fn new<R: Rng + ?Sized>(
        n_embd: usize,
        head_size: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            key: Linear::new(n_embd, head_size, false, rng),
            query: Linear::new(n_embd, head_size, false, rng),
            value: Linear::new(n_embd, head_size, false, rng),
            dropout: Dropout::new(dropout),
        }
    }

    pub fn head_size(&self) -> usize {
        self.key.out_features()
    }

    pub fn scale(&self) -> f32 {
        1.0 / (self.head_size() as f32).sqrt()
    }

    /// Forward pass on `x: [batch * seq_len, n_embd]`.
    ///
    /// Returns `[batch * seq_len, head_size]`. Sequences in the batch never
    /// attend to each other.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        x: &Tensor,
        seq_len: usize,
        mask: &CausalMask,
        mode: Mode,
        rng: &mut R,
    ) -> (Tensor, AttentionCache) {
        let batch = x.rows() / seq_len;
        let scale = self.scale();

        let (k, k_cache) = self.key.forward(x);
        let (q, q_cache) = self.query.forward(x);
        let (v, v_cache) = self.value.forward(x);

        let weights: Vec<Tensor> = (0..batch)
            .map(|b| {
                let rows = b * seq_len..(b + 1) * seq_len;
                causal_attention_weights(
                    &q.slice_rows(rows.start, rows.end),
                    &k.slice_rows(rows.start, rows.end),
                    mask,
                    scale,
                )
            })
            .collect();
        let weights = Tensor::concat_rows(&weights);
        let (dropped, dropout_cache) = self.dropout.forward(&weights, mode, rng);

        let out: Vec<Tensor> = (0..batch)
            .map(|b| {
                let (start, end) = (b * seq_len, (b + 1) * seq_len);
                dropped
                    .slice_rows(start, end)
                    .matmul(&v.slice_rows(start, end))
            })
            .collect();

        (
            Tensor::concat_rows(&out),
            AttentionCache {
                k_cache,
                q_cache,
                v_cache,
                k,
                q,
                v,
                weights,
                dropped,
                dropout_cache,
                seq_len,
            },
        )
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &AttentionCache) -> AttentionGradients {
        let seq_len = cache.seq_len;
        let batch = grad_out.rows() / seq_len;
        let scale = self.scale();

        let mut grad_weights = Vec::with_capacity(batch);
        let mut grad_v = Vec::with_capacity(batch);
        for b in 0..batch {
            let (start, end) = (b * seq_len, (b + 1) * seq_len);
            let g = grad_out.slice_rows(start, end);
            let wd = cache.dropped.slice_rows(start, end);
            grad_v.push(wd.transpose().matmul(&g));
            grad_weights.push(g.matmul(&cache.v.slice_rows(start, end).transpose()));
        }
        let grad_dropped = Tensor::concat_rows(&grad_weights);
        let grad_w = self.dropout.backward(&grad_dropped, &cache.dropout_cache);

        // Softmax backward, row by row, folding in the score scale.
        let mut grad_scores = Tensor::zeros(grad_w.shape.clone());
        for r in 0..grad_w.rows() {
            let w = cache.weights.row(r);
            let gw = grad_w.row(r);
            let dot: f32 = w.iter().zip(gw).map(|(a, b)| a * b).sum();
            for (j, gs) in grad_scores.row_mut(r).iter_mut().enumerate() {
                *gs = w[j] * (gw[j] - dot) * scale;
            }
        }

        let mut grad_q = Vec::with_capacity(batch);
        let mut grad_k = Vec::with_capacity(batch);
        for b in 0..batch {
            let (start, end) = (b * seq_len, (b + 1) * seq_len);
            let gs = grad_scores.slice_rows(start, end);
            grad_q.push(gs.matmul(&cache.k.slice_rows(start, end)));
            grad_k.push(gs.transpose().matmul(&cache.q.slice_rows(start, end)));
        }

        let key = self.key.backward(&Tensor::concat_rows(&grad_k), &cache.k_cache);
        let query = self.query.backward(&Tensor::concat_rows(&grad_q), &cache.q_cache);
        let value = self.value.backward(&Tensor::concat_rows(&grad_v), &cache.v_cache);

        let mut x = key.x.clone();
        x.add_assign(&query.x);
        x.add_assign(&value.x);

        AttentionGradients {
            key,
            query,
            value,
            x,
        }
    }

    pub fn params(&self) -> Vec<&Tensor> {
        let mut params = self.key.params();
        params.extend(self.query.params());
        params.extend(self.value.params());
        params
    }

    pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        let mut params = self.key.params_mut();
        params.extend(self.query.params_mut());
        params.extend(self.value.params_mut());
        params
    }
}

pub struct AttentionCache {
    pub k_cache: LinearCache,
    pub q_cache: LinearCache,
    pub v_cache: LinearCache,
    pub k: Tensor,
    pub q: Tensor,
    pub v: Tensor,
    /// Softmax output `[batch * seq_len, seq_len]`, before dropout
    pub weights: Tensor,
    /// Weights after dropout, as multiplied into V
    pub dropped: Tensor,
    pub dropout_cache: DropoutCache,
    pub seq_len: usize,
}

impl AttentionCache {
    /// Weights of sequence `b` in the batch as a `[seq_len, seq_len]` matrix.
    pub fn weights_for(&self, b: usize) -> Tensor {
        self.weights
            .slice_rows(b * self.seq_len, (b + 1) * self.seq_len)
    }
}

pub struct AttentionGradients {
    pub key: LinearGradients,
    pub query: LinearGradients,
    pub value: LinearGradients,
    pub x: Tensor,
}

impl AttentionGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut tensors = self.key.tensors();
        tensors.extend(self.query.tensors());
        tensors.extend(self.value.tensors());
        tensors
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut tensors = self.key.tensors_mut();
        tensors.extend(self.query.tensors_mut());
        tensors.extend(self.value.tensors_mut());
        tensors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::normal_init;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn entropy(weights: &Tensor) -> f32 {
        weights
            .data
            .iter()
            .filter(|&&p| p > 0.0)
            .map(|&p| -p * p.ln())
            .sum()
    }

    #[test]
    fn test_mask_is_lower_triangular() {
        let mask = CausalMask::new(3);
        assert!(mask.allows(0, 0));
        assert!(!mask.allows(0, 1));
        assert!(mask.allows(2, 1));
        assert!(!mask.allows(1, 2));
    }

    #[test]
    fn test_weights_are_causal_distributions() {
        let mut rng = StdRng::seed_from_u64(5);
        let t = 6;
        let q = Tensor::new(normal_init(t * 4, 1.0, &mut rng), vec![t, 4]);
        let k = Tensor::new(normal_init(t * 4, 1.0, &mut rng), vec![t, 4]);
        let mask = CausalMask::new(8);
        let w = causal_attention_weights(&q, &k, &mask, 0.5);

        for i in 0..t {
            let row = w.row(i);
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
            for (j, &p) in row.iter().enumerate() {
                if j > i {
                    assert_eq!(p, 0.0);
                } else {
                    assert!(p > 0.0);
                }
            }
        }
        // The first position can only see itself
        assert!((w.row(0)[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_scaling_lowers_peakedness() {
        let mut rng = StdRng::seed_from_u64(21);
        let (t, hs) = (8, 64);
        let q = Tensor::new(normal_init(t * hs, 1.0, &mut rng), vec![t, hs]);
        let k = Tensor::new(normal_init(t * hs, 1.0, &mut rng), vec![t, hs]);
        let mask = CausalMask::new(t);

        let scaled = causal_attention_weights(&q, &k, &mask, 1.0 / (hs as f32).sqrt());
        let unscaled = causal_attention_weights(&q, &k, &mask, 1.0);
        assert!(entropy(&unscaled) < entropy(&scaled));
    }

    #[test]
    fn test_future_tokens_do_not_change_past_outputs() {
        let mut rng = StdRng::seed_from_u64(9);
        let head = AttentionHead::new(8, 4, 0.0, &mut rng);
        let mask = CausalMask::new(5);
        let x = Tensor::new(normal_init(5 * 8, 1.0, &mut rng), vec![5, 8]);
        let (out, _) = head.forward(&x, 5, &mask, Mode::Eval, &mut rng);

        let mut changed = x.clone();
        for v in changed.row_mut(4) {
            *v += 10.0;
        }
        let (out2, _) = head.forward(&changed, 5, &mask, Mode::Eval, &mut rng);
        for i in 0..4 {
            for (a, b) in out.row(i).iter().zip(out2.row(i)) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_sequences_in_batch_are_independent() {
        let mut rng = StdRng::seed_from_u64(13);
        let head = AttentionHead::new(6, 3, 0.0, &mut rng);
        let mask = CausalMask::new(4);
        let a = Tensor::new(normal_init(4 * 6, 1.0, &mut rng), vec![4, 6]);
        let b = Tensor::new(normal_init(4 * 6, 1.0, &mut rng), vec![4, 6]);

        let (alone, _) = head.forward(&a, 4, &mask, Mode::Eval, &mut rng);
        let (batched, cache) =
            head.forward(&Tensor::concat_rows(&[a, b]), 4, &mask, Mode::Eval, &mut rng);
        assert_eq!(batched.shape, vec![8, 3]);
        for (x, y) in alone.data.iter().zip(&batched.data[..12]) {
            assert!((x - y).abs() < 1e-6);
        }
        assert_eq!(cache.weights_for(1).shape, vec![4, 4]);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut head = AttentionHead::new(4, 2, 0.0, &mut rng);
        // Larger weights give the softmax something to do
        for p in head.params_mut() {
            for v in p.tensor.data.iter_mut() {
                *v *= 20.0;
            }
        }
        let mask = CausalMask::new(3);
        let x = Tensor::new(normal_init(6 * 4, 1.0, &mut rng), vec![6, 4]);
        let g = Tensor::new(normal_init(6 * 2, 1.0, &mut rng), vec![6, 2]);

        let loss = |head: &AttentionHead, x: &Tensor| -> f32 {
            let mut r = StdRng::seed_from_u64(0);
            let (out, _) = head.forward(x, 3, &mask, Mode::Eval, &mut r);
            out.data.iter().zip(&g.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = head.forward(&x, 3, &mask, Mode::Eval, &mut rng);
        let grads = head.backward(&g, &cache);

        let h = 1e-2;
        for idx in [0, 5, 13, 22] {
            let mut plus = x.clone();
            plus.data[idx] += h;
            let mut minus = x.clone();
            minus.data[idx] -= h;
            let numeric = (loss(&head, &plus) - loss(&head, &minus)) / (2.0 * h);
            let analytic = grads.x.data[idx];
            assert!(
                (numeric - analytic).abs() < 2e-2 * (1.0 + analytic.abs()),
                "dx[{idx}]: {numeric} vs {analytic}"
            );
        }

        let base = head.query.weight.data[3];
        head.query.weight.data[3] = base + h;
        let up = loss(&head, &x);
        head.query.weight.data[3] = base - h;
        let down = loss(&head, &x);
        let numeric = (up - down) / (2.0 * h);
        let analytic = grads.query.weight.data[3];
        assert!(
            (numeric - analytic).abs() < 2e-2 * (1.0 + analytic.abs()),
            "dW_q: {numeric} vs {analytic}"
        );
    }
}
