//! This crate converts raw text into the fixed-shape input tensors expected
//! by BERT-family sequence models, and decodes their output tensors back
//! into structured predictions.
//!
//! It implements the classic BERT preprocessing stack: Unicode-aware basic
//! tokenization with CJK handling, greedy longest-match WordPiece encoding
//! over a line-indexed vocabulary, and padded tensor assembly for several
//! model input conventions, plus span decoding that maps entity positions
//! back to character ranges of the original text. Running the model itself
//! is left to an external runtime behind the
//! [`InferenceSession`](pipeline::InferenceSession) trait.
//!
//! The preprocessing here must match what the target model was trained
//! with: a deviation in padding, special-token placement or offset mapping
//! produces silently wrong predictions rather than an error.

pub mod decode;
pub mod encode;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod pre_tokenizers;
pub mod tokenizers;
pub mod vocab;

pub use decode::{argmax, decode_spans, sigmoid, softmax, DecodeError, Entity, EntityPrediction};
pub use encode::{
    Choice, EncodeError, EncodeVariant, ExtractionEncoding, ExtractionRequest, TensorBundle,
    TensorValue,
};
pub use pipeline::{
    Classification, EntityExtractor, ExtractorConfig, InferenceSession, PredictError,
    TextClassifier,
};
pub use tokenizers::{BertTokenizer, BertTokenizerOptions, TokenId, TokenizerError};
pub use vocab::{VocabError, Vocabulary};
