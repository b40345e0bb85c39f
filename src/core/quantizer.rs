use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use super::calibration::{load_hub_dataset, CalibrationDataset, Preprocess};
use super::config::{EngineConf, QuantApproach};
use super::dataloader::{CalibrationDataLoader, DataCollator};
use super::engine::{self, CalibFn, EvalFn, FitCallbacks, TrainFn};
use super::error::QuantError;
use super::model::{SavedTensor, TransformerModel};
use super::registry::TaskKind;
use super::{BEST_CONFIGURE_KEY, QUANTIZE_CONFIG_NAME, WEIGHTS_NAME};
use crate::hub::HubOptions;
use crate::onnx;

/// Quantizer 생성 옵션
///
/// 정확도 튜닝 수락 콜백(eval_fn)과 학습/캘리브레이션 콜백은 여기서 명시적으로
/// 받는다. 숨은 파라미터는 없다.
pub struct QuantizerOptions {
    /// 캘리브레이션 셔플 시드
    pub seed: u64,
    /// 내보내기 태스크 (없으면 모델 설정에서 자동 감지)
    pub task: Option<TaskKind>,
    pub eval_fn: Option<Box<EvalFn>>,
    pub train_fn: Option<Box<TrainFn>>,
    pub calib_fn: Option<Box<CalibFn>>,
}

impl Default for QuantizerOptions {
    fn default() -> Self {
        Self {
            seed: 42,
            task: None,
            eval_fn: None,
            train_fn: None,
            calib_fn: None,
        }
    }
}

/// 캘리브레이션 데이터셋 구성 옵션
pub struct CalibrationDatasetOptions<'a> {
    /// 최대 샘플 수 (데이터셋 크기로 클램프)
    pub num_samples: Option<usize>,
    pub dataset_config_name: Option<String>,
    pub dataset_split: String,
    pub preprocess: Option<Preprocess<'a>>,
    pub use_auth_token: bool,
}

impl Default for CalibrationDatasetOptions<'_> {
    fn default() -> Self {
        Self {
            num_samples: Some(100),
            dataset_config_name: None,
            dataset_split: "train".to_string(),
            preprocess: None,
            use_auth_token: false,
        }
    }
}

/// quantize 호출 옵션
pub struct QuantizeOptions {
    /// 저장 파일명 (기본값 덮어쓰기)
    pub file_name: Option<String>,
    /// 캘리브레이션 배치 크기
    pub batch_size: usize,
    pub data_collator: Option<DataCollator>,
    /// forward 시그니처에 없는 컬럼 제거 여부
    pub remove_unused_columns: bool,
    pub save_onnx_model: bool,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        Self {
            file_name: None,
            batch_size: 8,
            data_collator: None,
            remove_unused_columns: true,
            save_onnx_model: false,
        }
    }
}

/// 단일 양자화 실행 오케스트레이터
///
/// 모델은 호출자 소유이고 quantize 호출 동안만 참조한다. 내부 변환은 복제본에서
/// 일어나므로 원본 객체는 바뀌지 않는다.
pub struct Quantizer {
    model: TransformerModel,
    seed: u64,
    task: Option<TaskKind>,
    signature_columns: Vec<String>,
    input_names: Option<Vec<String>>,
    eval_fn: Option<Box<EvalFn>>,
    train_fn: Option<Box<TrainFn>>,
    calib_fn: Option<Box<CalibFn>>,
}

impl Quantizer {
    pub fn from_pretrained(model: TransformerModel, options: QuantizerOptions) -> Self {
        // forward 시그니처 컬럼은 생성 시점에 한 번만 계산
        let signature_columns = model.input_names().to_vec();
        Self {
            model,
            seed: options.seed,
            task: options.task,
            signature_columns,
            input_names: None,
            eval_fn: options.eval_fn,
            train_fn: options.train_fn,
            calib_fn: options.calib_fn,
        }
    }

    pub fn model(&self) -> &TransformerModel {
        &self.model
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// 마지막 데이터로더 구성에서 살아남은 컬럼 이름들
    pub fn input_names(&self) -> Option<&[String]> {
        self.input_names.as_deref()
    }

    /// 정적 양자화 캘리브레이션용 데이터셋 구성
    ///
    /// 허브 데이터셋의 분할을 읽고, 시드 고정 셔플 후 샘플 수만큼 앞에서 자르고,
    /// 전처리를 적용한다.
    pub fn get_calibration_dataset(
        &self,
        dataset_name: &str,
        options: CalibrationDatasetOptions<'_>,
    ) -> Result<CalibrationDataset> {
        let hub_options = HubOptions {
            use_auth_token: options.use_auth_token,
            ..Default::default()
        };
        let mut dataset = load_hub_dataset(
            dataset_name,
            options.dataset_config_name.as_deref(),
            &options.dataset_split,
            &hub_options,
        )?;

        if let Some(num_samples) = options.num_samples {
            let n = num_samples.min(dataset.len());
            dataset = dataset.shuffle(self.seed).select(n);
        }

        if let Some(preprocess) = &options.preprocess {
            dataset = dataset.map(preprocess);
        }

        Ok(dataset)
    }

    /// 캘리브레이션 데이터로더 구성
    ///
    /// forward 시그니처에 없는 컬럼을 걸러내고, 살아남은 컬럼 이름을 기록한 뒤
    /// 시드 고정 순서로 배치를 만든다.
    pub fn calibration_dataloader(
        &mut self,
        calibration_dataset: &CalibrationDataset,
        batch_size: usize,
        remove_unused_columns: bool,
        data_collator: Option<DataCollator>,
    ) -> Result<CalibrationDataLoader> {
        let dataset = if remove_unused_columns {
            self.remove_unused_columns(calibration_dataset)
        } else {
            calibration_dataset.clone()
        };
        self.input_names = Some(dataset.column_names().to_vec());
        CalibrationDataLoader::new(dataset, batch_size, self.seed, data_collator)
    }

    fn remove_unused_columns(&self, dataset: &CalibrationDataset) -> CalibrationDataset {
        let signature: BTreeSet<&str> =
            self.signature_columns.iter().map(|s| s.as_str()).collect();
        let ignored: Vec<String> = dataset
            .column_names()
            .iter()
            .filter(|c| !signature.contains(c.as_str()))
            .cloned()
            .collect();
        dataset.remove_columns(&ignored)
    }

    /// 설정에 따라 모델 양자화 후 저장
    ///
    /// 정적 방식은 캘리브레이션 데이터셋이 필수이고, 검사는 엔진 호출 전에 끝난다.
    /// 저장 디렉토리 생성 말고는 fit이 성공하기 전까지 아무 파일도 쓰지 않는다.
    pub fn quantize(
        &mut self,
        save_directory: impl AsRef<Path>,
        quantization_config: &EngineConf,
        calibration_dataset: Option<&CalibrationDataset>,
        options: QuantizeOptions,
    ) -> Result<()> {
        let approach = quantization_config.approach();

        // 학습 인지 방식 콜백 검사는 다른 어떤 처리보다 먼저
        if approach == QuantApproach::AwareTraining && self.train_fn.is_none() {
            return Err(QuantError::MissingTrainFunction.into());
        }

        let save_directory = save_directory.as_ref();
        fs::create_dir_all(save_directory).with_context(|| {
            format!("failed to create save directory {}", save_directory.display())
        })?;
        let file_name = options.file_name.unwrap_or_else(|| WEIGHTS_NAME.to_string());
        let output_path = save_directory.join(&file_name);

        let mut calibration_dataloader = None;
        match approach {
            QuantApproach::Static => {
                let dataset =
                    calibration_dataset.ok_or(QuantError::MissingCalibrationDataset)?;
                calibration_dataloader = Some(self.calibration_dataloader(
                    dataset,
                    options.batch_size,
                    options.remove_unused_columns,
                    options.data_collator,
                )?);
            }
            QuantApproach::AwareTraining => {
                if let Some(dataset) = calibration_dataset {
                    calibration_dataloader = Some(self.calibration_dataloader(
                        dataset,
                        options.batch_size,
                        options.remove_unused_columns,
                        options.data_collator,
                    )?);
                }
            }
            QuantApproach::Dynamic => {}
        }

        println!(
            "🔧 양자화 시작: approach={}, framework={}",
            approach,
            quantization_config.framework().as_str()
        );

        let callbacks = FitCallbacks {
            eval_fn: self.eval_fn.as_deref(),
            train_fn: self.train_fn.as_deref(),
            calib_fn: self.calib_fn.as_deref(),
        };
        let compressed = engine::fit(
            &self.model,
            quantization_config,
            calibration_dataloader.as_ref(),
            &callbacks,
        )?;

        // 모델 설정 저장 (표준 구조화 설정일 때)
        if let Some(config) = self.model.config() {
            if config.is_standard() {
                config.save_pretrained(save_directory)?;
            }
        }

        // 해석된 양자화 설정도 같이 저장 (오프라인 로드용)
        let resolved_config = compressed
            .q_config
            .clone()
            .unwrap_or_else(|| quantization_config.config.clone());
        resolved_config.to_json_file(&save_directory.join(QUANTIZE_CONFIG_NAME))?;

        if options.save_onnx_model {
            let task = onnx::resolve_export_task(&self.model, self.task)?;
            let spec = onnx::build_export_spec(task);
            let output_onnx_path = save_directory.join(onnx::ONNX_WEIGHTS_NAME);
            onnx::export::export_compressed(
                &compressed.model,
                &self.model,
                &spec,
                &output_onnx_path,
                calibration_dataloader.as_ref(),
            )?;
        }

        // 양자화 상태 사전 저장 (튜닝 탐색 결과가 있으면 예약 키로 동봉)
        let mut state = compressed.model.state_dict()?;
        if let Some(q_config) = &compressed.q_config {
            state.insert(
                BEST_CONFIGURE_KEY.to_string(),
                SavedTensor::Config(serde_json::to_string(q_config)?),
            );
        }
        let bytes = bincode::serialize(&state)?;
        fs::write(&output_path, bytes)
            .with_context(|| format!("failed to write weights {}", output_path.display()))?;
        log::info!("model weights saved to {}", output_path.display());

        Ok(())
    }
}
