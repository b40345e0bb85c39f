use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{bare_config, sample_rows, tiny_model};
use crate::core::calibration::CalibrationDataset;
use crate::core::config::{
    ConfigSource, EngineConf, QuantApproach, QuantizationConfig, translate_config,
};
use crate::core::dataloader::CalibrationDataLoader;
use crate::core::error::QuantError;
use crate::core::model::{TaskHead, TransformerModel};
use crate::core::quantizer::{QuantizeOptions, Quantizer, QuantizerOptions};
use crate::core::{QUANTIZE_CONFIG_NAME, WEIGHTS_NAME};
use crate::onnx::{OnnxExportSpec, OnnxExporter, ONNX_WEIGHTS_NAME};

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

fn calibration_dataset() -> CalibrationDataset {
    CalibrationDataset::from_rows(sample_rows(20))
}

#[test]
fn test_static_without_calibration_dataset_fails_before_engine() {
    let dir = tempfile::tempdir().unwrap();
    let mut quantizer = Quantizer::from_pretrained(tiny_model(), QuantizerOptions::default());

    let err = quantizer
        .quantize(
            dir.path(),
            &engine_conf(QuantApproach::Static),
            None,
            QuantizeOptions::default(),
        )
        .unwrap_err();
    let quant_err = err.downcast_ref::<QuantError>().unwrap();
    assert!(matches!(quant_err, QuantError::MissingCalibrationDataset));

    // 디렉토리 생성 말고는 아무것도 쓰이지 않았다
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_aware_training_without_train_fn_fails_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("qat_out");
    let mut quantizer = Quantizer::from_pretrained(tiny_model(), QuantizerOptions::default());

    let err = quantizer
        .quantize(
            &target,
            &engine_conf(QuantApproach::AwareTraining),
            Some(&calibration_dataset()),
            QuantizeOptions::default(),
        )
        .unwrap_err();
    let quant_err = err.downcast_ref::<QuantError>().unwrap();
    assert!(matches!(quant_err, QuantError::MissingTrainFunction));

    // 어떤 처리보다 먼저 실패하므로 저장 디렉토리도 만들어지지 않는다
    assert!(!target.exists());
}

#[test]
fn test_dynamic_quantize_writes_artifact_set() {
    let dir = tempfile::tempdir().unwrap();
    let mut quantizer = Quantizer::from_pretrained(tiny_model(), QuantizerOptions::default());

    quantizer
        .quantize(
            dir.path(),
            &engine_conf(QuantApproach::Dynamic),
            None,
            QuantizeOptions::default(),
        )
        .unwrap();

    assert!(dir.path().join(WEIGHTS_NAME).exists());
    assert!(dir.path().join("config.json").exists());
    assert!(dir.path().join(QUANTIZE_CONFIG_NAME).exists());
    // 내보내기는 요청 없이는 수행되지 않는다
    assert!(!dir.path().join(ONNX_WEIGHTS_NAME).exists());
}

#[test]
fn test_custom_file_name() {
    let dir = tempfile::tempdir().unwrap();
    let mut quantizer = Quantizer::from_pretrained(tiny_model(), QuantizerOptions::default());

    quantizer
        .quantize(
            dir.path(),
            &engine_conf(QuantApproach::Dynamic),
            None,
            QuantizeOptions {
                file_name: Some("model_int8.bin".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    assert!(dir.path().join("model_int8.bin").exists());
    assert!(!dir.path().join(WEIGHTS_NAME).exists());
}

#[test]
fn test_remove_unused_columns_keeps_signature_fields() {
    let mut quantizer = Quantizer::from_pretrained(tiny_model(), QuantizerOptions::default());
    let dataset = calibration_dataset();
    assert!(dataset.column_names().contains(&"text".to_string()));

    let loader = quantizer
        .calibration_dataloader(&dataset, 8, true, None)
        .unwrap();
    let columns = loader.column_names().to_vec();
    assert!(columns.contains(&"input_ids".to_string()));
    assert!(columns.contains(&"attention_mask".to_string()));
    assert!(columns.contains(&"labels".to_string()));
    assert!(!columns.contains(&"text".to_string()));

    // 살아남은 컬럼이 기록된다
    assert_eq!(quantizer.input_names().unwrap(), columns.as_slice());
}

#[test]
fn test_columns_kept_when_filtering_disabled() {
    let mut quantizer = Quantizer::from_pretrained(tiny_model(), QuantizerOptions::default());
    let dataset = calibration_dataset();
    let loader = quantizer
        .calibration_dataloader(&dataset, 8, false, None)
        .unwrap();
    assert!(loader.column_names().contains(&"text".to_string()));
}

#[test]
fn test_static_quantize_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut quantizer = Quantizer::from_pretrained(tiny_model(), QuantizerOptions::default());

    quantizer
        .quantize(
            dir.path(),
            &engine_conf(QuantApproach::Static),
            Some(&calibration_dataset()),
            QuantizeOptions::default(),
        )
        .unwrap();
    assert!(dir.path().join(WEIGHTS_NAME).exists());
}

#[test]
fn test_aware_training_runs_train_fn() {
    let dir = tempfile::tempdir().unwrap();
    let called = Arc::new(Mutex::new(0usize));
    let called_inner = Arc::clone(&called);
    let train_fn = Box::new(move |model: &mut TransformerModel| {
        assert!(model.is_training());
        *called_inner.lock().unwrap() += 1;
        Ok(())
    });

    let mut quantizer = Quantizer::from_pretrained(
        tiny_model(),
        QuantizerOptions {
            train_fn: Some(train_fn),
            ..Default::default()
        },
    );
    quantizer
        .quantize(
            dir.path(),
            &engine_conf(QuantApproach::AwareTraining),
            Some(&calibration_dataset()),
            QuantizeOptions::default(),
        )
        .unwrap();

    assert_eq!(*called.lock().unwrap(), 1);
    assert!(dir.path().join(WEIGHTS_NAME).exists());
}

struct RecordingExporter {
    opsets: Mutex<Vec<u32>>,
}

impl OnnxExporter for RecordingExporter {
    fn export_int8_onnx(
        &self,
        _model: &TransformerModel,
        _fp32_model: &TransformerModel,
        spec: &OnnxExportSpec,
        example_inputs: &crate::core::dataloader::Batch,
        output_path: &Path,
        _calib_dataloader: Option<&CalibrationDataLoader>,
    ) -> anyhow::Result<()> {
        assert!(example_inputs.contains_key("input_ids"));
        self.opsets.lock().unwrap().push(spec.opset);
        fs::write(output_path, b"onnx-stub")?;
        Ok(())
    }
}

#[test]
fn test_onnx_export_invoked_when_requested() {
    let dir = tempfile::tempdir().unwrap();
    let exporter = Arc::new(RecordingExporter {
        opsets: Mutex::new(Vec::new()),
    });
    let mut model = tiny_model();
    model.set_onnx_exporter(exporter.clone());

    let mut quantizer = Quantizer::from_pretrained(model, QuantizerOptions::default());
    quantizer
        .quantize(
            dir.path(),
            &engine_conf(QuantApproach::Dynamic),
            None,
            QuantizeOptions {
                save_onnx_model: true,
                ..Default::default()
            },
        )
        .unwrap();

    assert!(dir.path().join(ONNX_WEIGHTS_NAME).exists());
    // opset은 태스크 기본값과 QDQ 최소값 중 작은 쪽
    assert_eq!(exporter.opsets.lock().unwrap().as_slice(), &[14]);
}

#[test]
fn test_onnx_export_with_ambiguous_task_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut model =
        TransformerModel::new(TaskHead::SequenceClassification, Some(bare_config())).unwrap();
    model.randomize(3).unwrap();

    let mut quantizer = Quantizer::from_pretrained(model, QuantizerOptions::default());
    let err = quantizer
        .quantize(
            dir.path(),
            &engine_conf(QuantApproach::Dynamic),
            None,
            QuantizeOptions {
                save_onnx_model: true,
                ..Default::default()
            },
        )
        .unwrap_err();
    let quant_err = err.downcast_ref::<QuantError>().unwrap();
    assert!(matches!(quant_err, QuantError::AmbiguousExportTask));
}

#[test]
fn test_tuning_search_embeds_best_configure() {
    let dir = tempfile::tempdir().unwrap();
    let eval_fn = Box::new(|_model: &TransformerModel| Ok(0.9f32));
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

    let bytes = fs::read(dir.path().join(WEIGHTS_NAME)).unwrap();
    let state: crate::core::model::StateDict = bincode::deserialize(&bytes).unwrap();
    assert!(matches!(
        state.get(crate::core::BEST_CONFIGURE_KEY),
        Some(crate::core::model::SavedTensor::Config(_))
    ));
}

#[test]
fn test_one_shot_conversion_has_no_best_configure() {
    let dir = tempfile::tempdir().unwrap();
    let mut quantizer = Quantizer::from_pretrained(tiny_model(), QuantizerOptions::default());
    quantizer
        .quantize(
            dir.path(),
            &engine_conf(QuantApproach::Dynamic),
            None,
            QuantizeOptions::default(),
        )
        .unwrap();

    let bytes = fs::read(dir.path().join(WEIGHTS_NAME)).unwrap();
    let state: crate::core::model::StateDict = bincode::deserialize(&bytes).unwrap();
    assert!(state.get(crate::core::BEST_CONFIGURE_KEY).is_none());
}
