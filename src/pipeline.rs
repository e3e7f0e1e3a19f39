//! Prediction pipelines tying tokenization, encoding and decoding together
//! around an external inference runtime.
//!
//! The runtime itself is out of scope for this crate: anything that can run
//! a model over named tensors can implement [`InferenceSession`], including
//! test fixtures. Pipelines absorb per-request failures, logging them and
//! returning empty results, so one malformed input cannot take down a
//! serving process.

use std::error::Error;
use std::fmt;

use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, Tensor};

use crate::decode::{argmax, decode_spans, softmax, DecodeError, EntityPrediction};
use crate::encode::{EncodeError, EncodeVariant, ExtractionRequest, TensorBundle};
use crate::tokenizers::BertTokenizer;

/// Interface to an external inference runtime.
///
/// `run` receives the named input tensors built by an encode operation and
/// returns named output tensors. Pipelines consume only the first output.
/// Implementations must be usable behind a shared reference; session
/// thread-safety is the implementation's responsibility.
pub trait InferenceSession {
    fn run(
        &self,
        inputs: &TensorBundle,
    ) -> Result<Vec<(String, Tensor<f32>)>, Box<dyn Error + Send + Sync>>;
}

/// Errors returned by the prediction pipelines.
#[derive(Debug)]
pub enum PredictError {
    /// Building the model input tensors failed.
    Encode(EncodeError),

    /// The inference runtime reported an error. Opaque to this crate and
    /// terminal for the request that triggered it.
    Inference(Box<dyn Error + Send + Sync>),

    /// Decoding the output tensor failed.
    Decode(DecodeError),

    /// The runtime returned no output tensors.
    MissingOutput,

    /// The first output tensor does not have the expected number of
    /// dimensions.
    OutputShape { expected: usize, actual: usize },
}

impl fmt::Display for PredictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(err) => write!(f, "encoding inputs failed: {}", err),
            Self::Inference(err) => write!(f, "inference failed: {}", err),
            Self::Decode(err) => write!(f, "decoding outputs failed: {}", err),
            Self::MissingOutput => write!(f, "inference returned no outputs"),
            Self::OutputShape { expected, actual } => {
                write!(f, "expected {}-d output, got {}-d", expected, actual)
            }
        }
    }
}

impl Error for PredictError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Encode(err) => Some(err),
            Self::Inference(err) => Some(err.as_ref()),
            Self::Decode(err) => Some(err),
            Self::MissingOutput | Self::OutputShape { .. } => None,
        }
    }
}

impl From<EncodeError> for PredictError {
    fn from(err: EncodeError) -> Self {
        PredictError::Encode(err)
    }
}

impl From<DecodeError> for PredictError {
    fn from(err: DecodeError) -> Self {
        PredictError::Decode(err)
    }
}

/// Configuration for an [`EntityExtractor`].
#[derive(Clone, Debug)]
pub struct ExtractorConfig {
    /// Task prompt prefix.
    pub task_type: String,

    /// Subtask prompt prefix.
    pub subtask_type: String,

    /// The entity types extracted from every query. Fixed at construction.
    pub entity_types: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        ExtractorConfig {
            task_type: "抽取任务".to_string(),
            subtask_type: "实体识别".to_string(),
            entity_types: ["人名", "地名", "公司", "行业", "公司类别", "品牌"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Named-entity extraction pipeline over a span-extraction model.
pub struct EntityExtractor<S: InferenceSession> {
    tokenizer: BertTokenizer,
    session: S,
    config: ExtractorConfig,
}

impl<S: InferenceSession> EntityExtractor<S> {
    pub fn new(tokenizer: BertTokenizer, session: S, config: ExtractorConfig) -> Self {
        EntityExtractor {
            tokenizer,
            session,
            config,
        }
    }

    /// Return the tokenizer used by this pipeline.
    pub fn tokenizer(&self) -> &BertTokenizer {
        &self.tokenizer
    }

    /// Extract entities from `query`, propagating failures.
    pub fn try_predict(&self, query: &str) -> Result<Vec<EntityPrediction>, PredictError> {
        let request = ExtractionRequest::new(
            &self.config.task_type,
            &self.config.subtask_type,
            query,
            self.config.entity_types.iter().map(String::as_str),
        );
        let encoding = self.tokenizer.encode_extraction(std::slice::from_ref(&request))?;

        let outputs = self
            .session
            .run(&encoding.inputs)
            .map_err(PredictError::Inference)?;
        let logits = first_output(outputs)?;
        let actual = logits.ndim();
        let logits: NdTensor<f32, 4> = logits
            .try_into()
            .map_err(|_| PredictError::OutputShape { expected: 4, actual })?;

        Ok(decode_spans(logits.view(), &encoding, &self.tokenizer)?)
    }

    /// Extract entities from `query`.
    ///
    /// Failures are logged and produce an empty result instead of an error,
    /// trading availability for silent partial failure at the serving
    /// boundary. Use [`try_predict`](Self::try_predict) to observe failures.
    pub fn predict(&self, query: &str) -> Vec<EntityPrediction> {
        match self.try_predict(query) {
            Ok(predictions) => predictions,
            Err(err) => {
                log::error!("entity extraction failed for query: {}", err);
                Vec::new()
            }
        }
    }
}

/// Result of a [`TextClassifier`] prediction.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    /// Index of the winning class.
    pub index: usize,

    /// Label for the winning class, if the label table covers its index.
    pub label: Option<String>,

    /// Softmax probabilities over all classes.
    pub probabilities: Vec<f32>,
}

/// Sequence classification pipeline over a classifier model.
pub struct TextClassifier<S: InferenceSession> {
    tokenizer: BertTokenizer,
    session: S,
    labels: Vec<String>,
    variant: EncodeVariant,
}

impl<S: InferenceSession> TextClassifier<S> {
    pub fn new(
        tokenizer: BertTokenizer,
        session: S,
        labels: Vec<String>,
        variant: EncodeVariant,
    ) -> Self {
        TextClassifier {
            tokenizer,
            session,
            labels,
            variant,
        }
    }

    /// Classify `text`, propagating failures.
    pub fn try_classify(&self, text: &str) -> Result<Classification, PredictError> {
        let inputs = self.tokenizer.encode_batch(&[text], self.variant)?;
        let outputs = self
            .session
            .run(&inputs)
            .map_err(PredictError::Inference)?;
        let logits = first_output(outputs)?;
        let actual = logits.ndim();
        let logits: NdTensor<f32, 2> = logits
            .try_into()
            .map_err(|_| PredictError::OutputShape { expected: 2, actual })?;

        if logits.size(0) == 0 || logits.size(1) == 0 {
            return Err(PredictError::MissingOutput);
        }
        let row: Vec<f32> = (0..logits.size(1)).map(|col| logits[[0, col]]).collect();
        let probabilities = softmax(&row);
        let index = argmax(&probabilities).ok_or(PredictError::MissingOutput)?;

        Ok(Classification {
            index,
            label: self.labels.get(index).cloned(),
            probabilities,
        })
    }

    /// Classify `text`, logging failures and returning `None` instead of an
    /// error.
    pub fn classify(&self, text: &str) -> Option<Classification> {
        match self.try_classify(text) {
            Ok(classification) => Some(classification),
            Err(err) => {
                log::error!("classification failed: {}", err);
                None
            }
        }
    }
}

fn first_output(outputs: Vec<(String, Tensor<f32>)>) -> Result<Tensor<f32>, PredictError> {
    outputs
        .into_iter()
        .next()
        .map(|(_name, tensor)| tensor)
        .ok_or(PredictError::MissingOutput)
}
