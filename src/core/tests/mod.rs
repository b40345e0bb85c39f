pub mod calibration_test;
pub mod loader_test;
pub mod quantizer_test;

use serde_json::json;

use crate::core::calibration::Example;
use crate::core::model::{ModelConfig, TaskHead, TransformerModel};

/// 블록 양자화가 가능하도록 hidden_size를 블록 크기 배수로 맞춘 작은 모델 설정
pub fn tiny_config() -> ModelConfig {
    ModelConfig::from_value(json!({
        "model_type": "bert",
        "architectures": ["BertForSequenceClassification"],
        "vocab_size": 64,
        "hidden_size": 256,
        "num_labels": 2
    }))
}

/// architectures 없는 설정 (태스크 자동 감지 불가)
pub fn bare_config() -> ModelConfig {
    ModelConfig::from_value(json!({
        "model_type": "bert",
        "vocab_size": 64,
        "hidden_size": 256
    }))
}

pub fn tiny_model() -> TransformerModel {
    let mut model =
        TransformerModel::new(TaskHead::SequenceClassification, Some(tiny_config())).unwrap();
    model.randomize(7).unwrap();
    model
}

/// 고정 길이 토큰 컬럼과 추가 텍스트 컬럼을 가진 예제 행
pub fn sample_rows(n: usize) -> Vec<Example> {
    (0..n)
        .map(|i| {
            let row = json!({
                "input_ids": [(i % 60) as i64, ((i + 1) % 60) as i64, ((i + 2) % 60) as i64, 3],
                "attention_mask": [1, 1, 1, 1],
                "labels": (i % 2) as i64,
                "text": format!("example {i}")
            });
            match row {
                serde_json::Value::Object(map) => map,
                _ => unreachable!(),
            }
        })
        .collect()
}
