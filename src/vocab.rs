//! Line-indexed vocabularies mapping sub-word strings to token IDs.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use crate::tokenizers::TokenId;

/// Errors returned when loading a [`Vocabulary`].
#[derive(Debug)]
pub enum VocabError {
    /// Reading the vocabulary source failed.
    Io(io::Error),

    /// The source contained no entries.
    Empty,
}

impl fmt::Display for VocabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read vocabulary: {}", err),
            Self::Empty => write!(f, "vocabulary is empty"),
        }
    }
}

impl Error for VocabError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Empty => None,
        }
    }
}

impl From<io::Error> for VocabError {
    fn from(err: io::Error) -> Self {
        VocabError::Io(err)
    }
}

/// Bidirectional mapping between sub-word strings and token IDs.
///
/// A vocabulary is loaded once from a line-delimited source where the 0-based
/// line index is the token's ID, and is immutable afterwards. If the same
/// token appears on several lines, lookups by string resolve to the last
/// line's ID while every line keeps its own ID-to-string entry. This mirrors
/// how line-indexed `vocab.txt` files are consumed by the models this crate
/// targets and is not treated as an error.
#[derive(Clone, Debug)]
pub struct Vocabulary {
    token_to_id: HashMap<String, TokenId>,
    id_to_token: Vec<String>,
}

impl Vocabulary {
    /// Load a vocabulary from a reader over line-delimited UTF-8 text.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Vocabulary, VocabError> {
        let mut token_to_id = HashMap::new();
        let mut id_to_token = Vec::new();

        for line in reader.lines() {
            let token = line?;
            token_to_id.insert(token.clone(), id_to_token.len() as TokenId);
            id_to_token.push(token);
        }

        if id_to_token.is_empty() {
            return Err(VocabError::Empty);
        }

        Ok(Vocabulary {
            token_to_id,
            id_to_token,
        })
    }

    /// Load a vocabulary from a `vocab.txt`-style file with one token per
    /// line.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Vocabulary, VocabError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Return the ID for a token string.
    pub fn id_of(&self, token: &str) -> Option<TokenId> {
        self.token_to_id.get(token).copied()
    }

    /// Return the token string for an ID.
    pub fn token_of(&self, id: TokenId) -> Option<&str> {
        self.id_to_token.get(id as usize).map(|tok| tok.as_str())
    }

    /// Return the number of entries in the vocabulary.
    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }
}
