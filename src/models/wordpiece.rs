use std::ops::Range;
use std::sync::Arc;

use crate::tokenizers::{TokenId, TokenizerError};
use crate::vocab::Vocabulary;

/// WordPiece [^1] sub-word model used by BERT [^2] models.
///
/// Each word is split into the longest vocabulary entries that tile it from
/// left to right, with non-initial pieces looked up in their
/// continuation-prefixed form (eg. `##able`). Words that cannot be tiled, or
/// that exceed the length guard, become a single unknown token.
///
/// [^1]: Schuster, Mike, and Kaisuke Nakajima. "Japanese and korean voice
///       search." 2012 IEEE international conference on acoustics, speech and
///       signal processing (ICASSP). IEEE, 2012.
///
/// [^2]: Devlin, Jacob, et al. "Bert: Pre-training of deep bidirectional
///       transformers for language understanding." arXiv preprint
///       arXiv:1810.04805 (2018). <https://arxiv.org/abs/1810.04805>
#[derive(Clone)]
pub struct WordPiece {
    vocab: Arc<Vocabulary>,
    unknown_token: String,
    subword_prefix: String,
    max_word_chars: usize,
}

/// Configuration for a [`WordPiece`] model.
#[derive(Clone, Debug, Default)]
pub struct WordPieceOptions {
    /// Token substituted for words that cannot be encoded. Defaults to
    /// `[UNK]`.
    pub unknown_token: Option<String>,

    /// Prefix marking sub-word pieces that continue a word. Defaults to
    /// `##`.
    pub subword_prefix: Option<String>,

    /// The maximum length in characters of words that can be encoded. Longer
    /// words become the unknown token immediately, which bounds the cost of
    /// the longest-match search for pathological inputs. Defaults to 2048.
    pub max_word_chars: Option<usize>,
}

impl WordPiece {
    /// Construct a WordPiece model over a shared vocabulary.
    pub fn new(vocab: Arc<Vocabulary>, options: WordPieceOptions) -> WordPiece {
        WordPiece {
            vocab,
            unknown_token: options.unknown_token.unwrap_or_else(|| "[UNK]".to_string()),
            subword_prefix: options.subword_prefix.unwrap_or_else(|| "##".to_string()),
            max_word_chars: options.max_word_chars.unwrap_or(2048),
        }
    }

    /// Return the vocabulary this model encodes with.
    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Return the continuation prefix, eg. `##`.
    pub fn subword_prefix(&self) -> &str {
        &self.subword_prefix
    }

    fn unknown_id(&self) -> Result<TokenId, TokenizerError> {
        self.vocab
            .id_of(&self.unknown_token)
            .ok_or_else(|| TokenizerError::MissingToken(self.unknown_token.clone()))
    }

    /// Encode a single word into sub-word token IDs.
    ///
    /// `on_token` is invoked with `(byte_range, token_id)` for each piece,
    /// where the range locates the piece within `word` (excluding any
    /// continuation prefix). Unknown words produce a single token spanning
    /// the whole word. Fails only if the unknown token itself is missing
    /// from the vocabulary.
    pub fn encode_with_offsets(
        &self,
        word: &str,
        on_token: &mut dyn FnMut(Range<usize>, TokenId),
    ) -> Result<(), TokenizerError> {
        if word.trim().is_empty() {
            return Ok(());
        }

        if word.chars().count() > self.max_word_chars {
            on_token(0..word.len(), self.unknown_id()?);
            return Ok(());
        }

        // Greedy longest-match-first: pieces are buffered so that a failure
        // at any position replaces the entire word with the unknown token
        // rather than a partial encoding.
        let mut pieces: Vec<(Range<usize>, TokenId)> = Vec::new();
        let mut prefixed = String::new();
        let mut pos = 0;

        while pos < word.len() {
            let remainder = &word[pos..];
            let mut len = remainder.len();
            let mut matched = None;

            while len > 0 {
                let piece = if pos > 0 {
                    prefixed.clear();
                    prefixed.push_str(&self.subword_prefix);
                    prefixed.push_str(&remainder[..len]);
                    prefixed.as_str()
                } else {
                    &remainder[..len]
                };

                if let Some(id) = self.vocab.id_of(piece) {
                    matched = Some((len, id));
                    break;
                }

                let last_char = remainder[..len]
                    .chars()
                    .next_back()
                    .expect("piece should be non-empty");
                len -= last_char.len_utf8();
            }

            match matched {
                Some((len, id)) => {
                    pieces.push((pos..pos + len, id));
                    pos += len;
                }
                None => {
                    on_token(0..word.len(), self.unknown_id()?);
                    return Ok(());
                }
            }
        }

        for (range, id) in pieces {
            on_token(range, id);
        }

        Ok(())
    }
}
