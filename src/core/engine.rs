use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};

use super::apply;
use super::config::{EngineConf, FrameworkTarget, QuantApproach, QuantDType, QuantizationConfig};
use super::dataloader::CalibrationDataLoader;
use super::error::QuantError;
use super::model::{SavedTensor, StateDict, TransformerModel};

/// 튜닝 목적 평가 함수 (점수 반환)
pub type EvalFn = dyn Fn(&TransformerModel) -> Result<f32>;
/// 학습 인지 양자화용 학습 함수
pub type TrainFn = dyn Fn(&mut TransformerModel) -> Result<()>;
/// 사용자 제공 캘리브레이션 함수 (내부 루프 대체)
pub type CalibFn = dyn Fn(&mut TransformerModel) -> Result<()>;

/// fit에 전달하는 콜백 묶음
#[derive(Default)]
pub struct FitCallbacks<'a> {
    pub eval_fn: Option<&'a EvalFn>,
    pub train_fn: Option<&'a TrainFn>,
    pub calib_fn: Option<&'a CalibFn>,
}

/// 압축 결과
///
/// `q_config`는 정확도 기반 튜닝 탐색이 수행됐을 때만 채워진다. 단발 변환에는 없다.
pub struct CompressedModel {
    pub model: TransformerModel,
    pub q_config: Option<QuantizationConfig>,
}

/// 압축 엔진 진입점
///
/// 단발 변환, 캘리브레이션 패스, 학습 인지 훅, 정확도 기반 튜닝 탐색을 모두
/// 이 안에서 소유한다. 호출측은 콜백만 공급한다.
pub fn fit(
    model: &TransformerModel,
    conf: &EngineConf,
    calib_dataloader: Option<&CalibrationDataLoader>,
    callbacks: &FitCallbacks<'_>,
) -> Result<CompressedModel> {
    if conf.framework() == FrameworkTarget::Ipex {
        return Err(QuantError::UnsupportedFramework("ipex".to_string()).into());
    }
    if conf.approach() == QuantApproach::AwareTraining && callbacks.train_fn.is_none() {
        return Err(QuantError::MissingTrainFunction.into());
    }

    match callbacks.eval_fn {
        Some(eval_fn) => tune(model, conf, calib_dataloader, callbacks, eval_fn),
        None => {
            let q_model =
                convert_once(model, conf, calib_dataloader, callbacks, conf.config.weight_dtype)?;
            Ok(CompressedModel {
                model: q_model,
                q_config: None,
            })
        }
    }
}

/// 단발 변환: 준비 → (캘리브레이션/학습) → 변환
fn convert_once(
    model: &TransformerModel,
    conf: &EngineConf,
    calib_dataloader: Option<&CalibrationDataLoader>,
    callbacks: &FitCallbacks<'_>,
    weight_dtype: QuantDType,
) -> Result<TransformerModel> {
    let mut trial_conf = conf.clone();
    trial_conf.config.weight_dtype = weight_dtype;

    let mut q_model = model.clone();
    apply::prepare(&mut q_model, &trial_conf)?;

    match trial_conf.approach() {
        QuantApproach::Static => {
            if let Some(calib_fn) = callbacks.calib_fn {
                calib_fn(&mut q_model)?;
            } else if let Some(loader) = calib_dataloader {
                run_calibration(&mut q_model, loader)?;
            }
        }
        QuantApproach::AwareTraining => {
            q_model.set_training(true);
            if let Some(train_fn) = callbacks.train_fn {
                train_fn(&mut q_model)?;
            }
            if let Some(loader) = calib_dataloader {
                run_calibration(&mut q_model, loader)?;
            }
        }
        QuantApproach::Dynamic => {}
    }

    apply::convert(&mut q_model, &trial_conf)?;
    Ok(q_model)
}

/// 관측자 범위 수집 캘리브레이션 루프
fn run_calibration(model: &mut TransformerModel, loader: &CalibrationDataLoader) -> Result<()> {
    let pb = ProgressBar::new(loader.num_batches() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40}] {pos}/{len} 캘리브레이션 배치")
            .unwrap(),
    );
    for batch in loader.iter() {
        let batch = batch?;
        model.calibrate_batch(&batch)?;
        pb.inc(1);
    }
    pb.finish();
    Ok(())
}

/// 정확도 기반 튜닝 탐색
///
/// 후보 가중치 포맷을 시도해 기준 점수 대비 허용 손실 안에 드는 첫 후보를
/// 채택한다. 시도 횟수는 튜닝 종료 조건으로 제한된다.
fn tune(
    model: &TransformerModel,
    conf: &EngineConf,
    calib_dataloader: Option<&CalibrationDataLoader>,
    callbacks: &FitCallbacks<'_>,
    eval_fn: &EvalFn,
) -> Result<CompressedModel> {
    let baseline = eval_fn(model)?;
    let criterion = &conf.config.accuracy;
    let max_trials = conf.config.tuning.max_trials.max(1);

    let mut candidates = vec![conf.config.weight_dtype];
    if conf.config.weight_dtype != QuantDType::Q8K {
        candidates.push(QuantDType::Q8K);
    }

    for (trial, dtype) in candidates.into_iter().enumerate() {
        if trial >= max_trials {
            break;
        }
        let q_model = convert_once(model, conf, calib_dataloader, callbacks, dtype)?;
        let score = eval_fn(&q_model)?;
        let loss = relative_loss(baseline, score, criterion.higher_is_better);
        log::info!(
            "tuning trial {}: dtype={} baseline={baseline:.6} score={score:.6} loss={loss:.6}",
            trial + 1,
            dtype.as_str()
        );
        if loss <= criterion.tolerable_loss {
            let mut resolved = conf.config.clone();
            resolved.weight_dtype = dtype;
            return Ok(CompressedModel {
                model: q_model,
                q_config: Some(resolved),
            });
        }
    }

    bail!("accuracy-aware tuning did not meet the accuracy criterion within {max_trials} trials")
}

fn relative_loss(baseline: f32, score: f32, higher_is_better: bool) -> f32 {
    let denom = baseline.abs().max(1e-12);
    if higher_is_better {
        (baseline - score) / denom
    } else {
        (score - baseline) / denom
    }
}

/// 원샷 아티팩트 로더
///
/// 프루닝/증류가 결합된 저장 경로는 그래프 재적용 없이 저장된 슬롯을 그대로
/// 복원한다 (새 키는 추가로 들어간다).
pub fn load_oneshot(
    base: &TransformerModel,
    _config: &QuantizationConfig,
    state: &StateDict,
) -> Result<TransformerModel> {
    let mut model = base.clone();
    for (name, saved) in state {
        if matches!(saved, SavedTensor::Config(_)) {
            continue;
        }
        model.set_param_from_saved(name, saved)?;
    }
    model.make_embeddings_contiguous()?;
    Ok(model)
}
