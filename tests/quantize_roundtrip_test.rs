use approx::assert_abs_diff_eq;
use serde_json::json;

use quant_llm::core::{
    default_collator, translate_config, CalibrationDataset, ConfigSource, Example,
    FromPretrainedOptions, ModelConfig, QuantApproach, QuantizationConfig, Quantizer,
    QuantizeOptions, QuantizerOptions, TaskHead, TransformerModel, WEIGHTS_NAME,
};
use quant_llm::core::from_pretrained;

fn tiny_config() -> ModelConfig {
    ModelConfig::from_value(json!({
        "model_type": "bert",
        "architectures": ["BertForSequenceClassification"],
        "vocab_size": 64,
        "hidden_size": 256,
        "num_labels": 2
    }))
}

fn tiny_model() -> TransformerModel {
    let mut model =
        TransformerModel::new(TaskHead::SequenceClassification, Some(tiny_config())).unwrap();
    model.randomize(7).unwrap();
    model
}

fn sample_rows(n: usize) -> Vec<Example> {
    (0..n)
        .map(|i| {
            let row = json!({
                "input_ids": [(i % 60) as i64, ((i + 7) % 60) as i64, ((i + 13) % 60) as i64, 1],
                "attention_mask": [1, 1, 1, 1],
                "labels": (i % 2) as i64
            });
            match row {
                serde_json::Value::Object(map) => map,
                _ => unreachable!(),
            }
        })
        .collect()
}

fn static_conf() -> quant_llm::core::EngineConf {
    translate_config(
        &ConfigSource::Inline(QuantizationConfig {
            approach: QuantApproach::Static,
            ..Default::default()
        }),
        None,
    )
    .unwrap()
}

/// 같은 시드와 같은 입력이면 가중치 파일이 바이트 단위로 재현된다
#[test]
fn test_static_quantization_is_reproducible() {
    let dataset = CalibrationDataset::from_rows(sample_rows(24));

    let run = |dir: &std::path::Path| {
        let mut quantizer = Quantizer::from_pretrained(
            tiny_model(),
            QuantizerOptions {
                seed: 42,
                ..Default::default()
            },
        );
        quantizer
            .quantize(dir, &static_conf(), Some(&dataset), QuantizeOptions::default())
            .unwrap();
        std::fs::read(dir.join(WEIGHTS_NAME)).unwrap()
    };

    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let bytes_a = run(dir_a.path());
    let bytes_b = run(dir_b.path());
    assert_eq!(bytes_a, bytes_b);
}

/// 양자화 → 저장 → 로드 → forward 전체 왕복
#[test]
fn test_quantize_save_load_forward_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let original = tiny_model();
    let dataset = CalibrationDataset::from_rows(sample_rows(24));

    let mut quantizer = Quantizer::from_pretrained(original.clone(), QuantizerOptions::default());
    quantizer
        .quantize(dir.path(), &static_conf(), Some(&dataset), QuantizeOptions::default())
        .unwrap();

    let loaded = from_pretrained(
        dir.path().to_str().unwrap(),
        FromPretrainedOptions::default(),
    )
    .unwrap();

    let batch = default_collator(&sample_rows(2)).unwrap();
    let original_logits = original.forward(&batch).unwrap().logits;
    let loaded_logits = loaded.forward(&batch).unwrap().logits;

    assert_eq!(loaded_logits.dims(), &[2, 2]);

    let a = original_logits.to_vec2::<f32>().unwrap();
    let b = loaded_logits.to_vec2::<f32>().unwrap();
    for (row_a, row_b) in a.iter().zip(b.iter()) {
        for (&x, &y) in row_a.iter().zip(row_b.iter()) {
            // 블록 양자화 오차 범위 안에서 원본 출력을 따라간다
            assert_abs_diff_eq!(x, y, epsilon = 0.2);
        }
    }
}

/// 호출자의 원본 모델 객체는 quantize가 건드리지 않는다
#[test]
fn test_caller_model_is_never_mutated() {
    let dir = tempfile::tempdir().unwrap();
    let original = tiny_model();
    let before = original.state_dict().unwrap();

    let mut quantizer = Quantizer::from_pretrained(original.clone(), QuantizerOptions::default());
    let dataset = CalibrationDataset::from_rows(sample_rows(16));
    quantizer
        .quantize(dir.path(), &static_conf(), Some(&dataset), QuantizeOptions::default())
        .unwrap();

    let after = original.state_dict().unwrap();
    let before_keys: Vec<&String> = before.keys().collect();
    let after_keys: Vec<&String> = after.keys().collect();
    assert_eq!(before_keys, after_keys);
}
