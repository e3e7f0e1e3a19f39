//! Assembly of model input tensors from tokenized text.
//!
//! BERT-family models disagree on the names, shapes and padding of their
//! input tensors even when the underlying tokenization is identical.
//! [`EncodeVariant`] selects between the two single-sequence layouts, and
//! [`BertTokenizer::encode_extraction`] builds the multi-choice layout used
//! by span-extraction models. The variants are not interchangeable: feeding
//! a model tensors encoded for another variant produces silently wrong
//! predictions rather than an error.

use std::error::Error;
use std::fmt;

use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, Tensor};
use serde::{Deserialize, Serialize};

use crate::tokenizers::{BertTokenizer, TokenId, TokenizedText, TokenizerError};

/// Number of token columns in every span-extraction input row.
///
/// This width is fixed by the pretrained model rather than computed from the
/// batch; see [`EncodeError::SequenceTooLong`] for what happens when a
/// prompt does not fit.
pub const EXTRACTION_WIDTH: usize = 50;

/// Fill value marking prompt positions in the span label mask.
const SPAN_MASK_FILL: f32 = -10000.0;

/// Errors returned by the tensor-encoding operations.
#[derive(Debug)]
pub enum EncodeError {
    /// Tokenizing an input failed.
    Tokenizer(TokenizerError),

    /// An encoded sequence does not fit the fixed tensor width.
    SequenceTooLong { len: usize, max: usize },

    /// The records of a span-extraction batch declare different numbers of
    /// choices, so no rectangular tensor can be built.
    UnevenChoices { expected: usize, actual: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tokenizer(err) => write!(f, "tokenization failed: {}", err),
            Self::SequenceTooLong { len, max } => {
                write!(f, "encoded sequence has {} tokens, limit is {}", len, max)
            }
            Self::UnevenChoices { expected, actual } => {
                write!(
                    f,
                    "expected {} choices per record but a record has {}",
                    expected, actual
                )
            }
        }
    }
}

impl Error for EncodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Tokenizer(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TokenizerError> for EncodeError {
    fn from(err: TokenizerError) -> Self {
        EncodeError::Tokenizer(err)
    }
}

/// A tensor stored in a [`TensorBundle`].
#[derive(Clone, Debug)]
pub enum TensorValue {
    Int(Tensor<i32>),
    Float(Tensor<f32>),
}

impl TensorValue {
    /// Return the tensor's shape.
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Int(tensor) => tensor.shape(),
            Self::Float(tensor) => tensor.shape(),
        }
    }

    pub fn as_int(&self) -> Option<&Tensor<i32>> {
        match self {
            Self::Int(tensor) => Some(tensor),
            Self::Float(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<&Tensor<f32>> {
        match self {
            Self::Float(tensor) => Some(tensor),
            Self::Int(_) => None,
        }
    }
}

/// An ordered collection of named input tensors for one model run.
///
/// The slot names are part of the model's contract; see [`EncodeVariant`]
/// for the names each layout produces.
#[derive(Clone, Debug, Default)]
pub struct TensorBundle {
    entries: Vec<(String, TensorValue)>,
}

impl TensorBundle {
    pub fn new() -> TensorBundle {
        TensorBundle::default()
    }

    /// Add a named tensor to the bundle.
    pub fn insert(&mut self, name: &str, value: TensorValue) {
        self.entries.push((name.to_string(), value));
    }

    /// Look up a tensor by slot name.
    pub fn get(&self, name: &str) -> Option<&TensorValue> {
        self.entries
            .iter()
            .find(|(entry_name, _)| entry_name == name)
            .map(|(_, value)| value)
    }

    /// Iterate over `(name, tensor)` entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorValue)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Input tensor layouts for single-sequence models.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum EncodeVariant {
    /// Two slots, `ids` and `mask`, padded to at least 32 columns.
    Classifier,

    /// Three slots, `input_ids`, `attention_mask` and an all-zero
    /// `token_type_ids`, padded to at least 300 columns.
    Roberta,
}

impl EncodeVariant {
    fn min_width(self) -> usize {
        match self {
            Self::Classifier => 32,
            Self::Roberta => 300,
        }
    }
}

/// One choice (entity type) of an [`ExtractionRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Choice {
    pub entity_type: String,
}

/// One record of a span-extraction batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionRequest {
    /// Task prompt prefix, eg. `抽取任务`.
    pub task_type: String,

    /// Subtask prompt prefix, eg. `实体识别`.
    pub subtask_type: String,

    /// The text to extract entities from.
    pub text: String,

    /// The entity types to extract, one model input row each.
    pub choices: Vec<Choice>,
}

impl ExtractionRequest {
    pub fn new<I, S>(task_type: &str, subtask_type: &str, text: &str, entity_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExtractionRequest {
            task_type: task_type.to_string(),
            subtask_type: subtask_type.to_string(),
            text: text.to_string(),
            choices: entity_types
                .into_iter()
                .map(|entity_type| Choice {
                    entity_type: entity_type.into(),
                })
                .collect(),
        }
    }
}

/// Per-record data produced by [`BertTokenizer::encode_extraction`] that
/// decoding needs alongside the input tensors.
#[derive(Clone, Debug)]
pub struct RecordEncoding {
    /// The source request.
    pub request: ExtractionRequest,

    /// Tokenization of the record's text alone, whose offsets map span
    /// positions back to source character ranges.
    pub text_tokens: TokenizedText,
}

/// Output of [`BertTokenizer::encode_extraction`].
#[derive(Clone, Debug)]
pub struct ExtractionEncoding {
    /// Named input tensors for the inference runtime.
    pub inputs: TensorBundle,

    /// Per-record tokenization state for decoding.
    pub records: Vec<RecordEncoding>,
}

impl BertTokenizer {
    /// Encode a batch of texts into the named tensors of a single-sequence
    /// model layout.
    ///
    /// Every row is laid out as `[CLS] tokens [SEP]`, the mask slot is 1
    /// over real tokens, and all rows are right-padded with zeros to the
    /// batch-wide column width: the larger of the variant's minimum and the
    /// longest row observed in the batch.
    pub fn encode_batch(
        &self,
        texts: &[&str],
        variant: EncodeVariant,
    ) -> Result<TensorBundle, EncodeError> {
        let cls = self.cls_id()? as i32;
        let sep = self.sep_id()? as i32;

        let mut width = variant.min_width();
        let mut rows: Vec<Vec<i32>> = Vec::with_capacity(texts.len());
        for text in texts {
            let ids = self.tokenize(text)?;
            let mut row = Vec::with_capacity(ids.len() + 2);
            row.push(cls);
            row.extend(ids.iter().map(|&id| id as i32));
            row.push(sep);
            width = width.max(row.len());
            rows.push(row);
        }

        let batch = rows.len();
        let mut ids_data = vec![0; batch * width];
        let mut mask_data = vec![0; batch * width];
        for (row_idx, row) in rows.iter().enumerate() {
            let base = row_idx * width;
            ids_data[base..base + row.len()].copy_from_slice(row);
            mask_data[base..base + row.len()].fill(1);
        }

        let ids = NdTensor::from_data([batch, width], ids_data).into_dyn();
        let mask = NdTensor::from_data([batch, width], mask_data).into_dyn();

        let mut bundle = TensorBundle::new();
        match variant {
            EncodeVariant::Classifier => {
                bundle.insert("ids", TensorValue::Int(ids));
                bundle.insert("mask", TensorValue::Int(mask));
            }
            EncodeVariant::Roberta => {
                let type_ids = Tensor::zeros(&[batch, width]);
                bundle.insert("input_ids", TensorValue::Int(ids));
                bundle.insert("attention_mask", TensorValue::Int(mask));
                bundle.insert("token_type_ids", TensorValue::Int(type_ids));
            }
        }
        Ok(bundle)
    }

    /// Encode a batch of span-extraction records into the multi-choice
    /// tensor layout.
    ///
    /// Each (record, choice) pair becomes one row of fixed width
    /// [`EXTRACTION_WIDTH`], built from the prompt
    /// `"<task>-<subtask>-<entity_type>-<text>"` with every `-` token
    /// replaced by `[SEP]`. Four slots are produced:
    ///
    /// - `input_ids`, shaped `[records, choices, width]`: `[CLS]` + prompt
    ///   tokens + `[SEP]`, zero-padded.
    /// - `attention_mask`: 1 up to the first zero ID in the row.
    /// - `token_type_ids`: 1 over the text segment, located by scanning
    ///   backward from the final `[SEP]` until the previous `[SEP]`.
    /// - `span_labels_mask`, shaped `[records, choices, width, width]`:
    ///   large negative where the row or column position falls inside the
    ///   `"<task>[SEP]<subtask>[SEP]<entity_type>"` prompt prefix, zero over
    ///   the text quadrant.
    ///
    /// All records must declare the same number of choices, and a row that
    /// does not fit the fixed width is an error.
    pub fn encode_extraction(
        &self,
        requests: &[ExtractionRequest],
    ) -> Result<ExtractionEncoding, EncodeError> {
        let n_records = requests.len();
        let n_choices = requests.first().map(|req| req.choices.len()).unwrap_or(0);
        for req in requests {
            if req.choices.len() != n_choices {
                return Err(EncodeError::UnevenChoices {
                    expected: n_choices,
                    actual: req.choices.len(),
                });
            }
        }

        let cls = self.cls_id()?;
        let sep = self.sep_id()?;
        let dash = self.vocab().id_of("-");
        let width = EXTRACTION_WIDTH;

        let mut ids_data = vec![0; n_records * n_choices * width];
        let mut mask_data = vec![0; n_records * n_choices * width];
        let mut type_data = vec![0; n_records * n_choices * width];
        let mut span_data = vec![SPAN_MASK_FILL; n_records * n_choices * width * width];
        let mut records = Vec::with_capacity(n_records);

        for (record_idx, req) in requests.iter().enumerate() {
            for (choice_idx, choice) in req.choices.iter().enumerate() {
                let prompt = format!(
                    "{}-{}-{}-{}",
                    req.task_type, req.subtask_type, choice.entity_type, req.text
                );
                let mut ids = self.tokenize(&prompt)?;
                if let Some(dash) = dash {
                    for id in ids.iter_mut() {
                        if *id == dash {
                            *id = sep;
                        }
                    }
                }

                let row_len = ids.len() + 2;
                if row_len > width {
                    return Err(EncodeError::SequenceTooLong {
                        len: row_len,
                        max: width,
                    });
                }

                let base = (record_idx * n_choices + choice_idx) * width;
                let row = &mut ids_data[base..base + width];
                row[0] = cls as i32;
                for (idx, &id) in ids.iter().enumerate() {
                    row[idx + 1] = id as i32;
                }
                let sep_pos = ids.len() + 1;
                row[sep_pos] = sep as i32;

                // Mark the text segment: walk back from the final [SEP]
                // until the [SEP] that closed the entity-type prefix.
                let type_row = &mut type_data[base..base + width];
                for idx in (1..=sep_pos).rev() {
                    if idx < sep_pos && row[idx] == sep as i32 {
                        break;
                    }
                    type_row[idx] = 1;
                }

                let mask_row = &mut mask_data[base..base + width];
                for idx in 0..width {
                    if row[idx] == 0 {
                        break;
                    }
                    mask_row[idx] = 1;
                }

                // Span candidates may only start and end inside the text
                // segment, which begins after the encoded prompt prefix.
                let prefix = format!(
                    "{}[SEP]{}[SEP]{}",
                    req.task_type, req.subtask_type, choice.entity_type
                );
                let prefix_len = self.encode_prompt(&prefix)?.len();
                let span_base = (record_idx * n_choices + choice_idx) * width * width;
                for start in prefix_len..width {
                    let row_base = span_base + start * width;
                    span_data[row_base + prefix_len..row_base + width].fill(0.0);
                }
            }

            let text_tokens = self.tokenize_with_offsets(&req.text)?;
            records.push(RecordEncoding {
                request: req.clone(),
                text_tokens,
            });
        }

        let shape = [n_records, n_choices, width];
        let mut inputs = TensorBundle::new();
        inputs.insert(
            "input_ids",
            TensorValue::Int(NdTensor::from_data(shape, ids_data).into_dyn()),
        );
        inputs.insert(
            "attention_mask",
            TensorValue::Int(NdTensor::from_data(shape, mask_data).into_dyn()),
        );
        inputs.insert(
            "token_type_ids",
            TensorValue::Int(NdTensor::from_data(shape, type_data).into_dyn()),
        );
        inputs.insert(
            "span_labels_mask",
            TensorValue::Float(
                NdTensor::from_data([n_records, n_choices, width, width], span_data).into_dyn(),
            ),
        );

        Ok(ExtractionEncoding { inputs, records })
    }
}
