//! Token and Position Embeddings
//!
//! `x[b, t] = tok[ids[b][t]] + pos[t]`
//!
//! Both tables are learned. The backward pass scatters the incoming gradient
//! back into the rows that were read; repeated tokens accumulate.

use super::linear::{normal_init, INIT_STD};
use super::ParamMut;
use crate::tensor::Tensor;
use rand::Rng;

#[derive(Clone, Debug)]
pub struct Embedding {
    /// `[vocab_size, n_embd]`
    pub tok: Tensor,
    /// `[context_length, n_embd]`
    pub pos: Tensor,
}

impl Embedding {
    pub fn new<R: Rng + ?Sized>(
        vocab_size: usize,
        context_length: usize,
        n_embd: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            tok: Tensor::new(
                normal_init(vocab_size * n_embd, INIT_STD, rng),
                vec![vocab_size, n_embd],
            ),
            pos: Tensor::new(
                normal_init(context_length * n_embd, INIT_STD, rng),
                vec![context_length, n_embd],
            ),
        }
    }

    pub fn n_embd(&self) -> usize {
        self.tok.cols()
    }

    /// Look up `[batch][seq_len]` ids, producing `[batch * seq_len, n_embd]`.
    ///
    /// Ids and lengths are validated by the model before this is called.
    pub fn forward(&self, ids: &[Vec<usize>]) -> (Tensor, EmbeddingCache) {
        let n_embd = self.n_embd();
        let seq_len = ids.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(ids.len() * seq_len * n_embd);

        for seq in ids {
            for (t, &id) in seq.iter().enumerate() {
                data.extend(
                    self.tok
                        .row(id)
                        .iter()
                        .zip(self.pos.row(t))
                        .map(|(a, b)| a + b),
                );
            }
        }

        (
            Tensor::new(data, vec![ids.len() * seq_len, n_embd]),
            EmbeddingCache {
                ids: ids.to_vec(),
            },
        )
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &EmbeddingCache) -> EmbeddingGradients {
        let mut tok = Tensor::zeros(self.tok.shape.clone());
        let mut pos = Tensor::zeros(self.pos.shape.clone());

        let mut r = 0;
        for seq in &cache.ids {
            for (t, &id) in seq.iter().enumerate() {
                let g = grad_out.row(r);
                for (a, b) in tok.row_mut(id).iter_mut().zip(g) {
                    *a += b;
                }
                for (a, b) in pos.row_mut(t).iter_mut().zip(g) {
                    *a += b;
                }
                r += 1;
            }
        }

        EmbeddingGradients { tok, pos }
    }

    pub fn params(&self) -> Vec<&Tensor> {
        vec![&self.tok, &self.pos]
    }

    pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        vec![
            ParamMut::no_decay(&mut self.tok),
            ParamMut::no_decay(&mut self.pos),
        ]
    }
}

pub struct EmbeddingCache {
    pub ids: Vec<Vec<usize>>,
}

pub struct EmbeddingGradients {
    pub tok: Tensor,
    pub pos: Tensor,
}

impl EmbeddingGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        vec![&self.tok, &self.pos]
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.tok, &mut self.pos]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> Embedding {
        Embedding {
            tok: Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 2.0, 2.0], vec![3, 2]),
            pos: Tensor::new(vec![0.1, 0.1, 0.2, 0.2], vec![2, 2]),
        }
    }

    #[test]
    fn test_lookup_adds_position() {
        let emb = fixed();
        let (x, _) = emb.forward(&[vec![2, 0], vec![1, 1]]);
        assert_eq!(x.shape, vec![4, 2]);
        let expected = [2.1, 2.1, 1.2, 0.2, 0.1, 1.1, 0.2, 1.2];
        for (a, b) in x.data.iter().zip(expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_repeated_tokens_accumulate() {
        let emb = fixed();
        let (_, cache) = emb.forward(&[vec![1, 1]]);
        let grads = emb.backward(&Tensor::full(vec![2, 2], 1.0), &cache);
        assert_eq!(grads.tok.row(1), &[2.0, 2.0]);
        assert_eq!(grads.tok.row(0), &[0.0, 0.0]);
        assert_eq!(grads.pos.data, vec![1.0, 1.0, 1.0, 1.0]);
    }
}
