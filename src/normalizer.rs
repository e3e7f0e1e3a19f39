//! String normalization applied to words before sub-word encoding.

use unicode_categories::UnicodeCategories;
use unicode_normalization::char::decompose_canonical;

/// Normalizer applies lower-casing and accent stripping to strings.
///
/// In addition to the normalized text, [`Normalizer::normalize`] returns a
/// mapping from positions in the normalized string back to the original
/// string. This is what allows model outputs to be traced back to character
/// ranges in the source text after tokenization has rewritten it.
#[derive(Clone, Debug)]
pub struct Normalizer {
    lowercase: bool,
    strip_accents: bool,
}

/// Configuration for a [`Normalizer`].
#[derive(Clone, Debug, Default)]
pub struct NormalizerOptions {
    /// If true, convert all text to lowercase using [`char::to_lowercase`].
    pub lowercase: bool,

    /// Whether to strip accents. An "accent" is any Unicode character in the
    /// Nonspacing Mark ("Mn") category after canonical decomposition.
    pub strip_accents: bool,
}

impl Normalizer {
    pub fn new(opts: NormalizerOptions) -> Normalizer {
        Normalizer {
            lowercase: opts.lowercase,
            strip_accents: opts.strip_accents,
        }
    }

    /// Apply normalization to a string.
    ///
    /// Returns a tuple of `(normalized_string, offset_map)` where `offset_map`
    /// is a mapping from byte offsets in the normalized string to the
    /// corresponding offsets in the original string.
    pub fn normalize(&self, text: &str) -> (String, Vec<usize>) {
        if self.is_noop() {
            let offsets = (0..text.len()).collect();
            return (text.to_string(), offsets);
        }

        let mut normalized = String::with_capacity(text.len());
        let mut offsets = Vec::with_capacity(text.len());

        // Characters produced by the current input character. Lower-casing
        // can expand one character into several (eg. "İ"), so both steps
        // operate on small buffers rather than chars.
        let mut chars: Vec<char> = Vec::new();
        let mut decomposed: Vec<char> = Vec::new();

        for (offset, ch) in text.char_indices() {
            chars.clear();
            if self.lowercase {
                chars.extend(ch.to_lowercase());
            } else {
                chars.push(ch);
            }

            if self.strip_accents {
                decomposed.clear();
                for &ch in &chars {
                    decompose_canonical(ch, |decomp| {
                        if !decomp.is_mark_nonspacing() {
                            decomposed.push(decomp);
                        }
                    });
                }
                std::mem::swap(&mut chars, &mut decomposed);
            }

            for &ch in &chars {
                normalized.push(ch);
                for _ in 0..ch.len_utf8() {
                    offsets.push(offset);
                }
            }
        }

        (normalized, offsets)
    }

    /// Return true if this normalizer doesn't alter its input.
    fn is_noop(&self) -> bool {
        !self.lowercase && !self.strip_accents
    }
}
