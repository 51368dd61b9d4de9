//! Character Vocabulary
//!
//! Every distinct character of the training corpus becomes one token. The
//! characters are sorted before ids are assigned, so two runs over the same
//! corpus always produce the same mapping. Newlines and punctuation are
//! ordinary entries.
//!
//! ## Example
//!
//! ```rust
//! use puck::Vocabulary;
//!
//! let vocab = Vocabulary::from_text("hello world");
//! assert_eq!(vocab.len(), 8); // ' ', d, e, h, l, o, r, w
//!
//! let ids = vocab.encode("hold").unwrap();
//! assert_eq!(vocab.decode(&ids).unwrap(), "hold");
//! ```

use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Bijection between characters and the contiguous ids `0..len()`.
///
/// Serialized as the ordered character list; deserialization rebuilds the
/// reverse index and rejects duplicates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<char>", into = "Vec<char>")]
pub struct Vocabulary {
    id_to_char: Vec<char>,
    char_to_id: HashMap<char, usize>,
}

impl Vocabulary {
    /// Build the vocabulary of all characters appearing in `text`, in sorted order.
    pub fn from_text(text: &str) -> Self {
        let chars: BTreeSet<char> = text.chars().collect();
        let id_to_char: Vec<char> = chars.into_iter().collect();
        let char_to_id = id_to_char.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        Self {
            id_to_char,
            char_to_id,
        }
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.id_to_char.len()
    }

    /// True for a vocabulary built from empty text.
    pub fn is_empty(&self) -> bool {
        self.id_to_char.is_empty()
    }

    /// Characters in id order.
    pub fn chars(&self) -> &[char] {
        &self.id_to_char
    }

    /// Id of a single character.
    pub fn id(&self, c: char) -> Option<usize> {
        self.char_to_id.get(&c).copied()
    }

    /// Encode text into ids, failing on the first character outside the vocabulary.
    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        text.chars()
            .map(|c| self.id(c).ok_or(ModelError::UnknownChar(c)))
            .collect()
    }

    /// Decode ids into text, failing on the first id outside `[0, len())`.
    pub fn decode(&self, ids: &[usize]) -> Result<String> {
        ids.iter()
            .map(|&id| {
                self.id_to_char
                    .get(id)
                    .copied()
                    .ok_or(ModelError::TokenOutOfRange {
                        id,
                        vocab_size: self.len(),
                    })
            })
            .collect()
    }
}

impl TryFrom<Vec<char>> for Vocabulary {
    type Error = ModelError;

    fn try_from(id_to_char: Vec<char>) -> Result<Self> {
        let mut char_to_id = HashMap::with_capacity(id_to_char.len());
        for (i, &c) in id_to_char.iter().enumerate() {
            if char_to_id.insert(c, i).is_some() {
                return Err(ModelError::Format(format!(
                    "vocabulary lists {c:?} more than once"
                )));
            }
        }
        Ok(Self {
            id_to_char,
            char_to_id,
        })
    }
}

impl From<Vocabulary> for Vec<char> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.id_to_char
    }
}
