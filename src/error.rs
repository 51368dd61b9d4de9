//! Errors
//!
//! Every fallible operation in the crate returns [`ModelError`]. Callers can
//! match on the variant to decide whether to abort a run or skip a batch.
//!
//! # Variants
//!
//! - **Config**: hyper-parameters are inconsistent (e.g. `n_head` does not
//!   divide `n_embd`). Raised at construction; no partial model is returned.
//! - **Shape**: an input violates a shape contract. Carries the expected and
//!   the actual shape.
//! - **UnknownChar / TokenOutOfRange**: text or ids fall outside the vocabulary.
//! - **NonFinite**: a forward or backward pass produced NaN or infinity.
//! - **Sampling**: the next-token distribution is degenerate. This points at a
//!   broken mask or model and is never retried.
//! - **Io / Format**: checkpoint files could not be read, written, or parsed.

use std::fmt;

/// Errors produced by model construction, training, generation and persistence.
#[derive(Debug)]
pub enum ModelError {
    /// Invalid configuration, detected before any parameter is allocated.
    Config(String),

    /// Shape or contract violation at the boundary of an operation.
    Shape {
        /// The operation that rejected the input.
        context: &'static str,
        /// Human-readable expected shape.
        expected: String,
        /// Human-readable actual shape.
        actual: String,
    },

    /// A character that is not part of the vocabulary.
    UnknownChar(char),

    /// A token id outside `[0, vocab_size)`.
    TokenOutOfRange {
        /// The offending id.
        id: usize,
        /// Size of the vocabulary.
        vocab_size: usize,
    },

    /// NaN or infinity in a loss, logits, or gradients.
    NonFinite {
        /// Where the non-finite value was detected.
        context: &'static str,
    },

    /// Degenerate probability distribution during sampling.
    Sampling(String),

    /// Underlying I/O failure.
    Io(std::io::Error),

    /// Malformed checkpoint or configuration file.
    Format(String),
}

impl ModelError {
    /// Shorthand for building a [`ModelError::Shape`].
    pub fn shape(
        context: &'static str,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        ModelError::Shape {
            context,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Config(m) => write!(f, "invalid configuration: {m}"),
            ModelError::Shape {
                context,
                expected,
                actual,
            } => write!(f, "{context}: expected {expected}, got {actual}"),
            ModelError::UnknownChar(c) => write!(f, "character {c:?} is not in the vocabulary"),
            ModelError::TokenOutOfRange { id, vocab_size } => {
                write!(f, "token id {id} is outside the vocabulary (size {vocab_size})")
            }
            ModelError::NonFinite { context } => write!(f, "non-finite value in {context}"),
            ModelError::Sampling(m) => write!(f, "cannot sample next token: {m}"),
            ModelError::Io(e) => write!(f, "i/o error: {e}"),
            ModelError::Format(m) => write!(f, "malformed file: {m}"),
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ModelError {
    fn from(e: std::io::Error) -> Self {
        ModelError::Io(e)
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self {
        ModelError::Format(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ModelError>;
