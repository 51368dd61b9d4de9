//! Autoregressive Generation
//!
//! Starting from a seed sequence, repeatedly:
//!
//! 1. crop the sequence to its last `context_length` tokens,
//! 2. run the model in inference mode,
//! 3. divide the logits of the final position by the temperature,
//! 4. softmax and sample one token,
//! 5. append it.
//!
//! Generation stops after exactly `max_new_tokens` tokens; there is no
//! end-of-text token. All randomness comes from the caller's generator, so a
//! fixed seed reproduces the same text.
//!
//! ## Temperature
//!
//! - `< 1.0`: sharper distribution, closer to arg-max
//! - `= 1.0`: the model's distribution
//! - `> 1.0`: flatter distribution, more diverse output

use crate::config::validate_temperature;
use crate::error::{ModelError, Result};
use crate::layers::Mode;
use crate::model::Gpt;
use crate::tensor::softmax_in_place;
use crate::vocab::Vocabulary;
use rand::Rng;
use rand_distr::{weighted::WeightedIndex, Distribution};

/// Extend `seed` by `max_new_tokens` sampled ids.
///
/// Returns the seed followed by the generated ids.
///
/// # Errors
///
/// - [`ModelError::Shape`] for an empty seed
/// - [`ModelError::Config`] for a non-positive temperature
/// - [`ModelError::TokenOutOfRange`] if the seed holds an invalid id
/// - [`ModelError::NonFinite`] / [`ModelError::Sampling`] if the model
///   produces an unusable distribution
pub fn generate<R: Rng + ?Sized>(
    model: &Gpt,
    seed: &[usize],
    max_new_tokens: usize,
    temperature: f32,
    rng: &mut R,
) -> Result<Vec<usize>> {
    if seed.is_empty() {
        return Err(ModelError::shape(
            "generation seed",
            "at least one token",
            "0 tokens",
        ));
    }
    validate_temperature(temperature)?;

    let context_length = model.config().context_length;
    let mut tokens = Vec::with_capacity(seed.len() + max_new_tokens);
    tokens.extend_from_slice(seed);

    for _ in 0..max_new_tokens {
        let start = tokens.len().saturating_sub(context_length);
        let window = [tokens[start..].to_vec()];
        let (logits, _) = model.forward(&window, None, Mode::Eval, rng)?;
        let last = logits.row(logits.rows() - 1);
        tokens.push(sample_next(last, temperature, rng)?);
    }

    Ok(tokens)
}

/// Encode `prompt`, generate, and decode the full sequence back to text.
pub fn generate_text<R: Rng + ?Sized>(
    model: &Gpt,
    vocab: &Vocabulary,
    prompt: &str,
    max_new_tokens: usize,
    temperature: f32,
    rng: &mut R,
) -> Result<String> {
    let seed = vocab.encode(prompt)?;
    let ids = generate(model, &seed, max_new_tokens, temperature, rng)?;
    vocab.decode(&ids)
}

/// Sample one id from `softmax(logits / temperature)`.
pub fn sample_next<R: Rng + ?Sized>(logits: &[f32], temperature: f32, rng: &mut R) -> Result<usize> {
    let mut probs: Vec<f32> = logits.iter().map(|&l| l / temperature).collect();
    softmax_in_place(&mut probs);
    let dist = WeightedIndex::new(&probs).map_err(|e| {
        ModelError::Sampling(format!("cannot sample from next-token distribution: {e}"))
    })?;
    Ok(dist.sample(rng))
}
