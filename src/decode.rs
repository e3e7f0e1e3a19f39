//! Decoding of model output tensors into structured predictions.
//!
//! The hard part of span extraction is not reading the logits but mapping
//! them back to text: span coordinates are positions in the concatenated
//! prompt+text encoding, so they must be shifted by the encoded prompt
//! length and then translated through the tokenization offset mapping into
//! character ranges of the original string.

use std::error::Error;
use std::fmt;

use rten_tensor::prelude::*;
use rten_tensor::NdTensorView;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::encode::ExtractionEncoding;
use crate::tokenizers::{BertTokenizer, TokenizerError};

/// Probability threshold above which a span coordinate becomes a candidate
/// entity.
const SPAN_THRESHOLD: f32 = 0.5;

/// Logistic function mapping a raw logit to a probability in `(0, 1)`.
///
/// The input is clamped to ±500 so that extreme logits saturate instead of
/// overflowing to NaN or infinity.
pub fn sigmoid(x: f32) -> f32 {
    let x = x.clamp(-500.0, 500.0);
    1.0 / (1.0 + (-x).exp())
}

/// Normalize a slice of logits into probabilities summing to 1.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|x| x / sum).collect()
}

/// Return the index of the largest value, or `None` if the slice is empty.
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(idx, _)| idx)
}

/// A single extracted entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// The entity text, sliced from the original input string.
    pub entity_name: String,

    /// Probability of the span this entity was first extracted from.
    pub score: f32,
}

/// Entities extracted from one input record, grouped by entity type.
///
/// Serializes to `{"query": …, "<entity type>": […], …}` with one key per
/// requested entity type, in request order.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityPrediction {
    /// The record's input text.
    pub query: String,

    /// Extracted entities per entity type, in the order the types were
    /// requested. Types with no hits are present with an empty list.
    pub entities: Vec<(String, Vec<Entity>)>,
}

impl EntityPrediction {
    /// Return the entities extracted for `entity_type`, if it was requested.
    pub fn entities_of(&self, entity_type: &str) -> Option<&[Entity]> {
        self.entities
            .iter()
            .find(|(ty, _)| ty == entity_type)
            .map(|(_, entities)| entities.as_slice())
    }
}

impl Serialize for EntityPrediction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1 + self.entities.len()))?;
        map.serialize_entry("query", &self.query)?;
        for (entity_type, entities) in &self.entities {
            map.serialize_entry(entity_type, entities)?;
        }
        map.end()
    }
}

/// Errors returned by [`decode_spans`].
#[derive(Debug)]
pub enum DecodeError {
    /// Re-tokenizing a prompt prefix failed.
    Tokenizer(TokenizerError),

    /// The logit tensor's batch or choice dimensions are smaller than the
    /// encoding that produced the model input.
    ShapeMismatch {
        expected: [usize; 2],
        actual: [usize; 2],
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tokenizer(err) => write!(f, "tokenization failed: {}", err),
            Self::ShapeMismatch { expected, actual } => write!(
                f,
                "logits cover {}x{} record/choice pairs, encoding has {}x{}",
                actual[0], actual[1], expected[0], expected[1]
            ),
        }
    }
}

impl Error for DecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Tokenizer(err) => Some(err),
            Self::ShapeMismatch { .. } => None,
        }
    }
}

impl From<TokenizerError> for DecodeError {
    fn from(err: TokenizerError) -> Self {
        DecodeError::Tokenizer(err)
    }
}

/// A candidate span in token space.
struct Span {
    start: usize,
    end: usize,
    prob: f32,
}

/// Decode a span-extraction output tensor into entity predictions.
///
/// `logits` is shaped `[batch, choice, start, end]`; every coordinate whose
/// sigmoid exceeds 0.5 is a candidate span. For each (record, choice) pair
/// the candidates are shifted back by the encoded length of the
/// `"<task>[SEP]<subtask>[SEP]<entity_type>"` prompt, resolved through the
/// record's offset mapping and sliced out of the original text. Spans that
/// land inside the prompt segment, or outside the mapping, are discarded.
/// Duplicate entity strings within a (record, choice) pair are dropped,
/// keeping the first-seen span's probability.
pub fn decode_spans(
    logits: NdTensorView<f32, 4>,
    encoding: &ExtractionEncoding,
    tokenizer: &BertTokenizer,
) -> Result<Vec<EntityPrediction>, DecodeError> {
    let [batch, choices, starts, ends] = logits.shape();
    let n_records = encoding.records.len();
    let n_choices = encoding
        .records
        .first()
        .map(|rec| rec.request.choices.len())
        .unwrap_or(0);
    if batch < n_records || choices < n_choices {
        return Err(DecodeError::ShapeMismatch {
            expected: [n_records, n_choices],
            actual: [batch, choices],
        });
    }

    // Candidate spans per (record, choice) pair.
    let mut candidates: Vec<Vec<Vec<Span>>> = Vec::with_capacity(n_records);
    for record_idx in 0..n_records {
        let mut per_choice = Vec::with_capacity(n_choices);
        for choice_idx in 0..n_choices {
            let mut spans = Vec::new();
            for start in 0..starts {
                for end in 0..ends {
                    let prob = sigmoid(logits[[record_idx, choice_idx, start, end]]);
                    if prob > SPAN_THRESHOLD {
                        spans.push(Span { start, end, prob });
                    }
                }
            }
            per_choice.push(spans);
        }
        candidates.push(per_choice);
    }

    let mut predictions = Vec::with_capacity(n_records);
    for (record_idx, record) in encoding.records.iter().enumerate() {
        let request = &record.request;
        let offsets = &record.text_tokens.offsets;
        let mut groups = Vec::with_capacity(n_choices);

        for (choice_idx, choice) in request.choices.iter().enumerate() {
            let prefix = format!(
                "{}[SEP]{}[SEP]{}",
                request.task_type, request.subtask_type, choice.entity_type
            );
            let text_start = tokenizer.encode_prompt(&prefix)?.len();

            let mut entities: Vec<Entity> = Vec::new();
            for span in &candidates[record_idx][choice_idx] {
                let (start, end) = match (
                    span.start.checked_sub(text_start),
                    span.end.checked_sub(text_start),
                ) {
                    (Some(start), Some(end)) => (start, end),
                    // The span starts or ends inside the prompt segment.
                    _ => continue,
                };
                if start >= offsets.len() || end >= offsets.len() {
                    continue;
                }

                let range = offsets[start].start..offsets[end].end;
                let entity = match request.text.get(range) {
                    Some(entity) if !entity.is_empty() => entity,
                    _ => continue,
                };
                if entities.iter().any(|seen| seen.entity_name == entity) {
                    continue;
                }
                entities.push(Entity {
                    entity_name: entity.to_string(),
                    score: span.prob,
                });
            }

            groups.push((choice.entity_type.clone(), entities));
        }

        predictions.push(EntityPrediction {
            query: request.text.clone(),
            entities: groups,
        });
    }

    Ok(predictions)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use rten_tensor::prelude::*;
    use rten_tensor::NdTensor;

    use super::{argmax, decode_spans, sigmoid, softmax, DecodeError};
    use crate::encode::ExtractionRequest;
    use crate::tokenizers::BertTokenizer;
    use crate::vocab::Vocabulary;

    fn make_tokenizer() -> BertTokenizer {
        let vocab = [
            "[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "-", "抽", "取", "识", "别", "人",
            "名", "地", "雷", "鸣", "山",
        ];
        let vocab = Vocabulary::from_reader(Cursor::new(vocab.join("\n"))).unwrap();
        BertTokenizer::new(Arc::new(vocab), Default::default())
    }

    fn request(text: &str, entity_types: &[&str]) -> ExtractionRequest {
        ExtractionRequest::new("抽取", "识别", text, entity_types.iter().copied())
    }

    /// Logit value whose sigmoid is close to 1.
    const HIT: f32 = 10.0;

    /// Logit value whose sigmoid is close to 0.
    const MISS: f32 = -10.0;

    // The prompt "抽取[SEP]识别[SEP]<2-char type>" encodes to 10 tokens, so
    // text tokens start at position 10 in every test row.
    const TEXT_START: usize = 10;

    #[test]
    fn test_sigmoid() {
        assert_eq!(sigmoid(0.0), 0.5);

        // Extreme logits saturate without producing NaN or infinities.
        let huge = sigmoid(1e9);
        let tiny = sigmoid(-10023.625);
        assert!(huge > 0.0 && huge <= 1.0 && huge.is_finite());
        assert!(tiny >= 0.0 && tiny < 1.0 && tiny.is_finite());
        assert!(sigmoid(f32::MAX).is_finite());

        assert!(sigmoid(3.0) > 0.9);
        assert!(sigmoid(-3.0) < 0.1);
    }

    #[test]
    fn test_softmax_argmax() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        assert_eq!(probs.len(), 3);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);

        // Large logits must not overflow to NaN.
        let probs = softmax(&[1000.0, 999.0]);
        assert!(probs.iter().all(|p| p.is_finite()));

        assert_eq!(argmax(&[0.1, 0.7, 0.2]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    fn logits_for_spans(choices: usize, spans: &[(usize, usize, usize)]) -> NdTensor<f32, 4> {
        let mut logits = NdTensor::full([1, choices, 50, 50], MISS);
        for &(choice, start, end) in spans {
            logits[[0, choice, start, end]] = HIT;
        }
        logits
    }

    #[test]
    fn test_span_offsets_shift_by_prompt_length() {
        let tokenizer = make_tokenizer();
        let requests = [request("雷鸣山", &["人名"])];
        let encoding = tokenizer.encode_extraction(&requests).unwrap();

        // Span over text positions 0..=1 ("雷鸣"), offset by the prompt.
        let logits = logits_for_spans(1, &[(0, TEXT_START, TEXT_START + 1)]);
        let predictions = decode_spans(logits.view(), &encoding, &tokenizer).unwrap();

        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].query, "雷鸣山");
        let entities = predictions[0].entities_of("人名").unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity_name, "雷鸣");
        assert!(entities[0].score > 0.99);
    }

    #[test]
    fn test_spans_in_prompt_segment_are_discarded() {
        let tokenizer = make_tokenizer();
        let requests = [request("雷鸣山", &["人名"])];
        let encoding = tokenizer.encode_extraction(&requests).unwrap();

        // One span entirely inside the prompt, one crossing into it and one
        // past the end of the text's offset mapping.
        let logits = logits_for_spans(
            1,
            &[(0, 2, 3), (0, 5, TEXT_START), (0, TEXT_START, TEXT_START + 30)],
        );
        let predictions = decode_spans(logits.view(), &encoding, &tokenizer).unwrap();

        assert!(predictions[0].entities_of("人名").unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_entities_keep_first_score() {
        let tokenizer = make_tokenizer();
        let requests = [request("雷雷", &["人名"])];
        let encoding = tokenizer.encode_extraction(&requests).unwrap();

        // Two distinct spans that both slice to "雷". The span visited first
        // has the higher probability and its score must be the one kept.
        let mut logits = NdTensor::full([1, 1, 50, 50], MISS);
        logits[[0, 0, TEXT_START, TEXT_START]] = HIT;
        logits[[0, 0, TEXT_START + 1, TEXT_START + 1]] = 2.0;

        let predictions = decode_spans(logits.view(), &encoding, &tokenizer).unwrap();
        let entities = predictions[0].entities_of("人名").unwrap();

        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity_name, "雷");
        assert!(entities[0].score > 0.99);
    }

    #[test]
    fn test_multiple_choices_group_by_type() {
        let tokenizer = make_tokenizer();
        let requests = [request("雷鸣山", &["人名", "地名"])];
        let encoding = tokenizer.encode_extraction(&requests).unwrap();

        let logits = logits_for_spans(
            2,
            &[
                (0, TEXT_START, TEXT_START + 2),
                (1, TEXT_START + 2, TEXT_START + 2),
            ],
        );
        let predictions = decode_spans(logits.view(), &encoding, &tokenizer).unwrap();

        let person = predictions[0].entities_of("人名").unwrap();
        assert_eq!(person.len(), 1);
        assert_eq!(person[0].entity_name, "雷鸣山");

        let place = predictions[0].entities_of("地名").unwrap();
        assert_eq!(place.len(), 1);
        assert_eq!(place[0].entity_name, "山");
    }

    #[test]
    fn test_shape_mismatch() {
        let tokenizer = make_tokenizer();
        let requests = [request("雷鸣山", &["人名", "地名"])];
        let encoding = tokenizer.encode_extraction(&requests).unwrap();

        // Only one choice's worth of logits for a two-choice encoding.
        let logits = NdTensor::full([1, 1, 50, 50], MISS);
        let err = decode_spans(logits.view(), &encoding, &tokenizer)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DecodeError::ShapeMismatch {
                expected: [1, 2],
                actual: [1, 1]
            }
        ));
    }

    #[test]
    fn test_serialized_shape() {
        let tokenizer = make_tokenizer();
        let requests = [request("雷鸣山", &["人名", "地名"])];
        let encoding = tokenizer.encode_extraction(&requests).unwrap();

        let logits = logits_for_spans(2, &[(0, TEXT_START, TEXT_START + 2)]);
        let predictions = decode_spans(logits.view(), &encoding, &tokenizer).unwrap();

        let json = serde_json::to_value(&predictions[0]).unwrap();
        assert_eq!(json["query"], "雷鸣山");
        assert_eq!(json["人名"][0]["entity_name"], "雷鸣山");
        assert_eq!(json["地名"].as_array().unwrap().len(), 0);
    }
}
