//! Pre-tokenization which splits text into words before sub-word encoding.

use std::collections::HashSet;

use unicode_categories::UnicodeCategories;

use crate::normalizer::{Normalizer, NormalizerOptions};

/// A word produced by [`BasicTokenizer::tokenize_with_offsets`].
///
/// `offsets` maps each byte of `text` to the byte offset in the source string
/// of the character it was derived from. Normalization can rewrite characters
/// (lower-casing, accent stripping), so several bytes of `text` may map to
/// the same source offset.
#[derive(Clone, Debug, PartialEq)]
pub struct Word {
    pub text: String,
    pub offsets: Vec<usize>,
}

/// Configuration for a [`BasicTokenizer`].
#[derive(Clone, Debug)]
pub struct BasicTokenizerOptions {
    /// Lower-case words and strip accents from them. Words in
    /// [`never_split`](Self::never_split) are exempt.
    pub lowercase: bool,

    /// Treat every character in the CJK Unicode ranges as its own word. This
    /// is what allows WordPiece to tokenize Chinese text without assuming
    /// any word segmentation.
    pub tokenize_chinese_chars: bool,

    /// Words which are emitted as-is, skipping normalization and punctuation
    /// splitting. Typically used for special control tokens.
    pub never_split: Vec<String>,
}

impl Default for BasicTokenizerOptions {
    fn default() -> Self {
        BasicTokenizerOptions {
            lowercase: true,
            tokenize_chinese_chars: true,
            never_split: Vec::new(),
        }
    }
}

/// Unicode-aware word splitter implementing the pre-tokenization rules used
/// by BERT.
///
/// The input is cleaned up (control characters removed, whitespace folded to
/// ASCII spaces), CJK characters are isolated, and the result is split on
/// whitespace and punctuation. The output is a sequence of words for a
/// sub-word model to encode individually. Tokenization is a pure function of
/// the input text and options.
#[derive(Clone, Debug)]
pub struct BasicTokenizer {
    normalizer: Option<Normalizer>,
    tokenize_chinese_chars: bool,
    never_split: HashSet<String>,
}

impl BasicTokenizer {
    pub fn new(opts: BasicTokenizerOptions) -> BasicTokenizer {
        let normalizer = opts.lowercase.then(|| {
            Normalizer::new(NormalizerOptions {
                lowercase: true,
                strip_accents: true,
            })
        });

        BasicTokenizer {
            normalizer,
            tokenize_chinese_chars: opts.tokenize_chinese_chars,
            never_split: opts.never_split.into_iter().collect(),
        }
    }

    /// Split `text` into words.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        self.tokenize_with_offsets(text)
            .into_iter()
            .map(|word| word.text)
            .collect()
    }

    /// Split `text` into words with source offset maps.
    pub fn tokenize_with_offsets(&self, text: &str) -> Vec<Word> {
        // Cleanup pass: drop control characters, fold whitespace to a single
        // space and isolate CJK characters with surrounding spaces. Each
        // surviving character keeps the byte offset it came from.
        let mut chars: Vec<(char, usize)> = Vec::with_capacity(text.len());
        for (offset, ch) in text.char_indices() {
            if ch == '\u{0}' || ch == '\u{fffd}' || is_control(ch) {
                continue;
            }
            if self.tokenize_chinese_chars && is_cjk_char(ch) {
                chars.push((' ', offset));
                chars.push((ch, offset));
                chars.push((' ', offset));
            } else if ch.is_whitespace() {
                chars.push((' ', offset));
            } else {
                chars.push((ch, offset));
            }
        }

        let mut words = Vec::new();
        for group in chars.split(|(ch, _)| *ch == ' ') {
            if group.is_empty() {
                continue;
            }
            self.split_word(group, &mut words);
        }
        words
    }

    /// Normalize a whitespace-delimited word and split off punctuation,
    /// appending the resulting words to `out`.
    fn split_word(&self, group: &[(char, usize)], out: &mut Vec<Word>) {
        let word: String = group.iter().map(|(ch, _)| *ch).collect();

        // Per-byte map from the un-normalized word to source offsets.
        let mut byte_offsets = Vec::with_capacity(word.len());
        for &(ch, offset) in group {
            for _ in 0..ch.len_utf8() {
                byte_offsets.push(offset);
            }
        }

        if self.never_split.contains(&word) {
            out.push(Word {
                text: word,
                offsets: byte_offsets,
            });
            return;
        }

        let (text, offsets) = match &self.normalizer {
            Some(normalizer) => {
                let (normalized, norm_offsets) = normalizer.normalize(&word);
                let offsets = norm_offsets
                    .into_iter()
                    .map(|word_byte| byte_offsets[word_byte])
                    .collect();
                (normalized, offsets)
            }
            None => (word, byte_offsets),
        };

        // Split punctuation characters off as standalone words.
        let mut start = 0;
        for (idx, ch) in text.char_indices() {
            if is_punctuation(ch) {
                if idx > start {
                    out.push(slice_word(&text, &offsets, start, idx));
                }
                let end = idx + ch.len_utf8();
                out.push(slice_word(&text, &offsets, idx, end));
                start = end;
            }
        }
        if start < text.len() {
            out.push(slice_word(&text, &offsets, start, text.len()));
        }
    }
}

fn slice_word(text: &str, offsets: &[usize], start: usize, end: usize) -> Word {
    Word {
        text: text[start..end].to_string(),
        offsets: offsets[start..end].to_vec(),
    }
}

/// Return true for characters which are removed entirely before splitting.
///
/// Tab, newline and carriage return are treated as whitespace instead.
fn is_control(ch: char) -> bool {
    if matches!(ch, '\t' | '\n' | '\r') {
        return false;
    }
    ch.is_other_control() || ch.is_other_format()
}

/// Return true if `ch` is a punctuation character.
///
/// As in BERT's reference preprocessing, every ASCII character that is not a
/// letter, digit or space counts as punctuation in addition to the Unicode
/// "P" categories.
fn is_punctuation(ch: char) -> bool {
    ch.is_ascii_punctuation() || ch.is_punctuation()
}

/// Return true if `ch` falls in one of the CJK Unicode ranges.
fn is_cjk_char(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF
        | 0x3400..=0x4DBF
        | 0x20000..=0x2A6DF
        | 0x2A700..=0x2B73F
        | 0x2B740..=0x2B81F
        | 0x2B820..=0x2CEAF
        | 0xF900..=0xFAFF
        | 0x2F800..=0x2FA1F)
}
