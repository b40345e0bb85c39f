use std::collections::BTreeSet;
use std::fs;

use super::{sample_rows, tiny_model};
use crate::core::apply::apply_quantization_from_config;
use crate::core::calibration::CalibrationDataset;
use crate::core::config::{
    translate_config, ConfigSource, EngineConf, FrameworkTarget, QuantApproach,
    QuantizationConfig,
};
use crate::core::error::QuantError;
use crate::core::loader::{from_pretrained, FromPretrainedOptions};
use crate::core::model::{Param, SavedTensor};
use crate::core::quantizer::{QuantizeOptions, Quantizer, QuantizerOptions};
use crate::core::registry::TaskKind;
use crate::core::{BEST_CONFIGURE_KEY, QUANTIZE_CONFIG_NAME};

fn engine_conf(approach: QuantApproach) -> EngineConf {
    translate_config(
        &ConfigSource::Inline(QuantizationConfig {
            approach,
            ..Default::default()
        }),
        None,
    )
    .unwrap()
}

fn quantize_into(dir: &std::path::Path, approach: QuantApproach) {
    let mut quantizer = Quantizer::from_pretrained(tiny_model(), QuantizerOptions::default());
    let dataset = if approach == QuantApproach::Static {
        Some(CalibrationDataset::from_rows(sample_rows(16)))
    } else {
        None
    };
    quantizer
        .quantize(dir, &engine_conf(approach), dataset.as_ref(), QuantizeOptions::default())
        .unwrap();
}

#[test]
fn test_roundtrip_keys_match_fresh_graph_application() {
    let dir = tempfile::tempdir().unwrap();
    quantize_into(dir.path(), QuantApproach::Dynamic);

    let loaded = from_pretrained(
        dir.path().to_str().unwrap(),
        FromPretrainedOptions::default(),
    )
    .unwrap();

    // 같은 설정으로 새 기본 모델에 그래프 변환을 적용하면 키가 정확히 일치해야 한다
    let fresh = apply_quantization_from_config(
        &engine_conf(QuantApproach::Dynamic),
        &tiny_model(),
    )
    .unwrap();
    let loaded_keys: BTreeSet<String> = loaded.param_names().into_iter().collect();
    let fresh_keys: BTreeSet<String> = fresh.param_names().into_iter().collect();
    assert_eq!(loaded_keys, fresh_keys);

    assert!(matches!(
        loaded.param("encoder.dense.weight"),
        Some(Param::Quantized(_))
    ));
}

#[test]
fn test_static_roundtrip_restores_activation_qparams() {
    let dir = tempfile::tempdir().unwrap();
    quantize_into(dir.path(), QuantApproach::Static);

    let loaded = from_pretrained(
        dir.path().to_str().unwrap(),
        FromPretrainedOptions::default(),
    )
    .unwrap();

    let scale = loaded
        .param("encoder.dense.activation_post_process.scale")
        .unwrap()
        .to_tensor(loaded.device())
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()[0];
    // 캘리브레이션을 거친 스케일이 로드로 복원된다 (빈 관측 기본값 1.0이 아님)
    assert!(scale > 0.0 && scale != 1.0);
}

#[test]
fn test_loader_prefers_embedded_best_configure() {
    let dir = tempfile::tempdir().unwrap();
    let eval_fn = Box::new(|_m: &crate::core::model::TransformerModel| Ok(1.0f32));
    let mut quantizer = Quantizer::from_pretrained(
        tiny_model(),
        QuantizerOptions {
            eval_fn: Some(eval_fn),
            ..Default::default()
        },
    );
    quantizer
        .quantize(
            dir.path(),
            &engine_conf(QuantApproach::Dynamic),
            None,
            QuantizeOptions::default(),
        )
        .unwrap();

    // 예약 키가 있으므로 함께 저장된 설정 파일 없이도 로드가 성립해야 한다
    fs::remove_file(dir.path().join(QUANTIZE_CONFIG_NAME)).unwrap();
    let loaded = from_pretrained(
        dir.path().to_str().unwrap(),
        FromPretrainedOptions::default(),
    )
    .unwrap();
    assert!(matches!(
        loaded.param("encoder.dense.weight"),
        Some(Param::Quantized(_))
    ));
}

#[test]
fn test_explicit_state_dict_argument() {
    let dir = tempfile::tempdir().unwrap();
    // 디렉토리에는 config.json만 준비
    tiny_model().config().unwrap().save_pretrained(dir.path()).unwrap();

    let conf = engine_conf(QuantApproach::Dynamic);
    let quantized = apply_quantization_from_config(&conf, &tiny_model()).unwrap();
    let state = quantized.state_dict().unwrap();

    let loaded = from_pretrained(
        dir.path().to_str().unwrap(),
        FromPretrainedOptions {
            state_dict: Some(state),
            config: Some(ConfigSource::Inline(conf.config.clone())),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(matches!(
        loaded.param("classifier.weight"),
        Some(Param::Quantized(_))
    ));
}

#[test]
fn test_missing_weights_file_is_a_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    tiny_model().config().unwrap().save_pretrained(dir.path()).unwrap();

    let err = from_pretrained(
        dir.path().to_str().unwrap(),
        FromPretrainedOptions::default(),
    )
    .unwrap_err();
    match err.downcast_ref::<QuantError>().unwrap() {
        QuantError::ArtifactNotFound { repo, file, .. } => {
            assert_eq!(repo, dir.path().to_str().unwrap());
            assert_eq!(file, "quantized_model.bin");
            // 메시지에 저장소와 파일명이 들어간다
            let message = err.to_string();
            assert!(message.contains("quantized_model.bin"));
        }
        other => panic!("expected ArtifactNotFound, got {other:?}"),
    }
}

#[test]
fn test_ipex_config_rejected_on_load() {
    let dir = tempfile::tempdir().unwrap();
    tiny_model().config().unwrap().save_pretrained(dir.path()).unwrap();

    let conf = engine_conf(QuantApproach::Dynamic);
    let quantized = apply_quantization_from_config(&conf, &tiny_model()).unwrap();
    let mut state = quantized.state_dict().unwrap();
    let ipex_config = QuantizationConfig {
        framework: FrameworkTarget::Ipex,
        ..Default::default()
    };
    state.insert(
        BEST_CONFIGURE_KEY.to_string(),
        SavedTensor::Config(serde_json::to_string(&ipex_config).unwrap()),
    );

    let err = from_pretrained(
        dir.path().to_str().unwrap(),
        FromPretrainedOptions {
            state_dict: Some(state),
            ..Default::default()
        },
    )
    .unwrap_err();
    let quant_err = err.downcast_ref::<QuantError>().unwrap();
    assert!(matches!(quant_err, QuantError::UnsupportedFramework(_)));
}

#[test]
fn test_oneshot_config_delegates_without_graph_reapply() {
    let dir = tempfile::tempdir().unwrap();
    tiny_model().config().unwrap().save_pretrained(dir.path()).unwrap();

    let conf = engine_conf(QuantApproach::Dynamic);
    let quantized = apply_quantization_from_config(&conf, &tiny_model()).unwrap();
    let state = quantized.state_dict().unwrap();

    let oneshot_config = QuantizationConfig {
        is_oneshot: true,
        ..Default::default()
    };
    let loaded = from_pretrained(
        dir.path().to_str().unwrap(),
        FromPretrainedOptions {
            state_dict: Some(state),
            config: Some(ConfigSource::Inline(oneshot_config)),
            ..Default::default()
        },
    )
    .unwrap();
    // 원샷 경로도 저장된 양자화 슬롯을 복원한다
    assert!(matches!(
        loaded.param("encoder.dense.weight"),
        Some(Param::Quantized(_))
    ));
}

#[test]
fn test_explicit_task_overrides_architecture_detection() {
    let dir = tempfile::tempdir().unwrap();
    quantize_into(dir.path(), QuantApproach::Dynamic);

    let loaded = from_pretrained(
        dir.path().to_str().unwrap(),
        FromPretrainedOptions {
            task: Some(TaskKind::SequenceClassification),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(loaded.param("classifier.weight").is_some());
}
