//! Tokenizers for converting text into sequences of token IDs.
//!
//! [`BertTokenizer`] composes the pieces from the other modules of this
//! crate: a [`BasicTokenizer`] which splits text into words and a
//! [`WordPiece`] model which encodes each word into sub-word token IDs from a
//! shared [`Vocabulary`]. Tensor assembly for specific model input layouts
//! lives in the [`encode`](crate::encode) module.

use std::error::Error;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::models::{WordPiece, WordPieceOptions};
use crate::pre_tokenizers::{BasicTokenizer, BasicTokenizerOptions, Word};
use crate::vocab::Vocabulary;

/// Integer type used to represent token IDs.
pub type TokenId = u32;

/// Error type returned when tokenizing a string.
#[derive(Clone, Debug, PartialEq)]
pub enum TokenizerError {
    /// A token was not found in the vocabulary. This covers both malformed
    /// input and a vocabulary/model mismatch, and is recoverable per
    /// request.
    MissingToken(String),

    /// No token with a given ID exists in the vocabulary.
    InvalidTokenId(TokenId),
}

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingToken(token) => write!(f, "missing vocab token {}", token),
            Self::InvalidTokenId(id) => write!(f, "unknown token id {}", id),
        }
    }
}

impl Error for TokenizerError {}

/// The reserved control tokens used by BERT-family models.
#[derive(Clone, Debug)]
pub struct SpecialTokens {
    /// Substituted for words that cannot be encoded. Default `[UNK]`.
    pub unknown: String,

    /// Sequence separator. Default `[SEP]`.
    pub sep: String,

    /// Padding filler. Default `[PAD]`.
    pub pad: String,

    /// Classification marker placed at the start of every sequence. Default
    /// `[CLS]`.
    pub cls: String,

    /// Masked-position marker. Default `[MASK]`.
    pub mask: String,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        SpecialTokens {
            unknown: "[UNK]".to_string(),
            sep: "[SEP]".to_string(),
            pad: "[PAD]".to_string(),
            cls: "[CLS]".to_string(),
            mask: "[MASK]".to_string(),
        }
    }
}

/// Configuration for a [`BertTokenizer`].
#[derive(Clone, Debug)]
pub struct BertTokenizerOptions {
    /// Lower-case words and strip accents during basic tokenization.
    pub lowercase: bool,

    /// Run the Unicode-aware [`BasicTokenizer`] before sub-word encoding.
    /// When disabled the input is only split on whitespace.
    pub basic_tokenize: bool,

    /// Treat each CJK character as its own word. See
    /// [`BasicTokenizerOptions::tokenize_chinese_chars`].
    pub tokenize_chinese_chars: bool,

    /// Words exempt from normalization and punctuation splitting.
    pub never_split: Vec<String>,

    /// The reserved control token strings.
    pub special_tokens: SpecialTokens,
}

impl Default for BertTokenizerOptions {
    fn default() -> Self {
        BertTokenizerOptions {
            lowercase: true,
            basic_tokenize: true,
            tokenize_chinese_chars: true,
            never_split: Vec::new(),
            special_tokens: SpecialTokens::default(),
        }
    }
}

/// A tokenized string with source offsets.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenizedText {
    /// Sub-word token IDs.
    pub ids: Vec<TokenId>,

    /// For each token, the byte range of the source text it was derived
    /// from. Entity spans predicted in token space are sliced out of the
    /// original string through these ranges; detokenizing sub-words instead
    /// would lose character boundaries, notably for CJK text.
    pub offsets: Vec<Range<usize>>,
}

/// Tokenizes text into the sub-word token IDs expected by BERT-family
/// models.
///
/// A tokenizer owns its [`Vocabulary`] view and holds no mutable state, so a
/// shared instance can be used from concurrent callers freely.
pub struct BertTokenizer {
    vocab: Arc<Vocabulary>,
    basic: Option<BasicTokenizer>,
    wordpiece: WordPiece,
    special_tokens: SpecialTokens,
}

impl BertTokenizer {
    /// Create a tokenizer over `vocab`.
    pub fn new(vocab: Arc<Vocabulary>, options: BertTokenizerOptions) -> BertTokenizer {
        let basic = options.basic_tokenize.then(|| {
            BasicTokenizer::new(BasicTokenizerOptions {
                lowercase: options.lowercase,
                tokenize_chinese_chars: options.tokenize_chinese_chars,
                never_split: options.never_split.clone(),
            })
        });

        let wordpiece = WordPiece::new(
            vocab.clone(),
            WordPieceOptions {
                unknown_token: Some(options.special_tokens.unknown.clone()),
                ..Default::default()
            },
        );

        BertTokenizer {
            vocab,
            basic,
            wordpiece,
            special_tokens: options.special_tokens,
        }
    }

    /// Return the vocabulary used by this tokenizer.
    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Return the number of entries in the vocabulary.
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Return the special token strings in use.
    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }

    /// Look up the ID of a token, eg. a special token.
    pub fn token_to_id(&self, token: &str) -> Result<TokenId, TokenizerError> {
        self.vocab
            .id_of(token)
            .ok_or_else(|| TokenizerError::MissingToken(token.to_string()))
    }

    pub(crate) fn cls_id(&self) -> Result<TokenId, TokenizerError> {
        self.token_to_id(&self.special_tokens.cls)
    }

    pub(crate) fn sep_id(&self) -> Result<TokenId, TokenizerError> {
        self.token_to_id(&self.special_tokens.sep)
    }

    /// Tokenize `text` into sub-word token IDs, without any special tokens
    /// added.
    pub fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, TokenizerError> {
        Ok(self.tokenize_with_offsets(text)?.ids)
    }

    /// Tokenize `text` into sub-word token IDs plus the byte range of source
    /// text each token covers.
    pub fn tokenize_with_offsets(&self, text: &str) -> Result<TokenizedText, TokenizerError> {
        let words = match &self.basic {
            Some(basic) => basic.tokenize_with_offsets(text),
            None => whitespace_words(text),
        };

        let mut ids = Vec::new();
        let mut offsets = Vec::new();
        for word in &words {
            self.wordpiece.encode_with_offsets(&word.text, &mut |range, id| {
                ids.push(id);
                offsets.push(source_range(text, word, range));
            })?;
        }

        Ok(TokenizedText { ids, offsets })
    }

    /// Encode a `[SEP]`-delimited prompt into token IDs.
    ///
    /// The input is split on the literal `[SEP]` marker and encoded as
    /// `[CLS] part [SEP] part [SEP] …`. Span-extraction models are prompted
    /// with task/subtask/entity-type prefixes in this form, and the length
    /// of the encoded prompt is what positions the text segment within the
    /// model input.
    pub fn encode_prompt(&self, prompt: &str) -> Result<Vec<TokenId>, TokenizerError> {
        let sep = self.sep_id()?;
        let mut ids = vec![self.cls_id()?];
        for part in prompt.split("[SEP]") {
            ids.extend(self.tokenize(part)?);
            ids.push(sep);
        }
        Ok(ids)
    }

    /// Convert a sequence of token IDs back into a single string.
    ///
    /// Sub-word continuation prefixes are stripped and pieces are joined
    /// with spaces. This is lossy; use [`TokenizedText::offsets`] to recover
    /// exact source substrings.
    pub fn tokens_to_string(&self, ids: &[TokenId]) -> Result<String, TokenizerError> {
        let prefix = self.wordpiece.subword_prefix();
        let mut out = String::new();
        for &id in ids {
            let token = self
                .vocab
                .token_of(id)
                .ok_or(TokenizerError::InvalidTokenId(id))?;
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(token.strip_prefix(prefix).unwrap_or(token));
        }
        Ok(out)
    }
}

/// Map a piece's byte range within a word back to a byte range in the source
/// text.
fn source_range(text: &str, word: &Word, piece: Range<usize>) -> Range<usize> {
    let start = word.offsets[piece.start];
    let last = word.offsets[piece.end - 1];
    let last_char_len = text[last..]
        .chars()
        .next()
        .map(char::len_utf8)
        .unwrap_or(0);
    start..last + last_char_len
}

/// Split `text` on whitespace, used when basic tokenization is disabled.
fn whitespace_words(text: &str) -> Vec<Word> {
    text.split_whitespace()
        .map(|word| {
            let start = word.as_ptr() as usize - text.as_ptr() as usize;
            Word {
                text: word.to_string(),
                offsets: (start..start + word.len()).collect(),
            }
        })
        .collect()
}
