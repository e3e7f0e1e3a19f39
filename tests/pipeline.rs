use std::error::Error;
use std::io::Cursor;
use std::sync::Arc;

use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, Tensor};

use bert_prep::pipeline::InferenceSession;
use bert_prep::{
    BertTokenizer, EncodeVariant, EntityExtractor, ExtractorConfig, TensorBundle, TextClassifier,
    Vocabulary,
};

/// Build a tokenizer over a small vocabulary covering the prompts and texts
/// used in these tests.
fn make_tokenizer() -> BertTokenizer {
    let tokens = [
        "[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "-", "抽", "取", "任", "务", "实", "体",
        "识", "别", "人", "名", "地", "雷", "鸣", "山", "你", "好",
    ];
    let vocab = Vocabulary::from_reader(Cursor::new(tokens.join("\n"))).unwrap();
    BertTokenizer::new(Arc::new(vocab), Default::default())
}

fn extractor_config() -> ExtractorConfig {
    ExtractorConfig {
        task_type: "抽取任务".to_string(),
        subtask_type: "实体识别".to_string(),
        entity_types: vec!["人名".to_string(), "地名".to_string()],
    }
}

/// Session standing in for the model runtime. Sanity-checks the input
/// bundle, then reports the spans it was constructed with.
struct ScriptedSession {
    choices: usize,
    /// `(choice, start, end)` coordinates to flag as entity spans.
    spans: Vec<(usize, usize, usize)>,
}

impl InferenceSession for ScriptedSession {
    fn run(
        &self,
        inputs: &TensorBundle,
    ) -> Result<Vec<(String, Tensor<f32>)>, Box<dyn Error + Send + Sync>> {
        let ids = inputs
            .get("input_ids")
            .and_then(|value| value.as_int())
            .ok_or("missing input_ids")?;
        let (batch, choices, width) = match ids.shape() {
            &[batch, choices, width] => (batch, choices, width),
            _ => return Err("input_ids should be 3-d".into()),
        };
        if batch != 1 || choices != self.choices {
            return Err("unexpected input_ids shape".into());
        }
        for slot in ["attention_mask", "token_type_ids"] {
            if inputs.get(slot).is_none() {
                return Err(format!("missing {}", slot).into());
            }
        }
        let span_mask = inputs
            .get("span_labels_mask")
            .and_then(|value| value.as_float())
            .ok_or("missing span_labels_mask")?;
        if span_mask.shape() != &[batch, choices, width, width] {
            return Err("unexpected span_labels_mask shape".into());
        }

        let mut logits = NdTensor::full([1, self.choices, width, width], -30.0);
        for &(choice, start, end) in &self.spans {
            logits[[0, choice, start, end]] = 12.0;
        }
        Ok(vec![("span_logits".to_string(), logits.into_dyn())])
    }
}

struct FailingSession;

impl InferenceSession for FailingSession {
    fn run(
        &self,
        _inputs: &TensorBundle,
    ) -> Result<Vec<(String, Tensor<f32>)>, Box<dyn Error + Send + Sync>> {
        Err("model artifact unavailable".into())
    }
}

// With the full prompts ("抽取任务[SEP]实体识别[SEP]<2-char type>") the
// encoded prefix is [CLS] + 4 + [SEP] + 4 + [SEP] + 2 + [SEP] = 14 tokens.
const TEXT_START: usize = 14;

#[test]
fn test_end_to_end_entity_extraction() {
    let session = ScriptedSession {
        choices: 2,
        spans: vec![
            // "雷鸣山" and "雷" as person names, "山" as a place name.
            (0, TEXT_START, TEXT_START + 2),
            (0, TEXT_START, TEXT_START),
            (1, TEXT_START + 2, TEXT_START + 2),
        ],
    };
    let extractor = EntityExtractor::new(make_tokenizer(), session, extractor_config());

    let predictions = extractor.predict("雷鸣山");
    assert_eq!(predictions.len(), 1);

    let prediction = &predictions[0];
    assert_eq!(prediction.query, "雷鸣山");

    let person_names: Vec<&str> = prediction
        .entities_of("人名")
        .unwrap()
        .iter()
        .map(|entity| entity.entity_name.as_str())
        .collect();
    assert_eq!(person_names, ["雷", "雷鸣山"]);

    let place_names: Vec<&str> = prediction
        .entities_of("地名")
        .unwrap()
        .iter()
        .map(|entity| entity.entity_name.as_str())
        .collect();
    assert_eq!(place_names, ["山"]);

    for entity in prediction.entities_of("人名").unwrap() {
        assert!(entity.score > 0.99);
    }
}

#[test]
fn test_prediction_serializes_to_query_keyed_object() {
    let session = ScriptedSession {
        choices: 2,
        spans: vec![(0, TEXT_START, TEXT_START + 2)],
    };
    let extractor = EntityExtractor::new(make_tokenizer(), session, extractor_config());

    let predictions = extractor.predict("雷鸣山");
    let json = serde_json::to_value(&predictions).unwrap();

    assert_eq!(json[0]["query"], "雷鸣山");
    assert_eq!(json[0]["人名"][0]["entity_name"], "雷鸣山");
    assert!(json[0]["人名"][0]["score"].as_f64().unwrap() > 0.99);
    assert_eq!(json[0]["地名"].as_array().unwrap().len(), 0);
}

#[test]
fn test_failed_inference_yields_empty_result() {
    let extractor = EntityExtractor::new(make_tokenizer(), FailingSession, extractor_config());

    assert!(extractor.try_predict("雷鸣山").is_err());
    assert!(extractor.predict("雷鸣山").is_empty());
}

/// Session for the classifier flow: checks the two-slot layout and returns
/// logits favouring one class.
struct ClassifierSession;

impl InferenceSession for ClassifierSession {
    fn run(
        &self,
        inputs: &TensorBundle,
    ) -> Result<Vec<(String, Tensor<f32>)>, Box<dyn Error + Send + Sync>> {
        let ids = inputs
            .get("ids")
            .and_then(|value| value.as_int())
            .ok_or("missing ids")?;
        let mask = inputs
            .get("mask")
            .and_then(|value| value.as_int())
            .ok_or("missing mask")?;
        if ids.shape() != mask.shape() {
            return Err("ids and mask shapes differ".into());
        }

        Ok(vec![(
            "logits".to_string(),
            NdTensor::from_data([1, 3], vec![0.5f32, 0.1, 3.0]).into_dyn(),
        )])
    }
}

#[test]
fn test_end_to_end_classification() {
    let labels = ["finance", "sports", "games"]
        .into_iter()
        .map(str::to_string)
        .collect();
    let classifier = TextClassifier::new(
        make_tokenizer(),
        ClassifierSession,
        labels,
        EncodeVariant::Classifier,
    );

    let classification = classifier.try_classify("你好").unwrap();
    assert_eq!(classification.index, 2);
    assert_eq!(classification.label.as_deref(), Some("games"));
    assert!((classification.probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-6);
}
