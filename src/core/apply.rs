use anyhow::Result;
use candle_core::quantized::k_quants::QK_K;
use candle_core::Tensor;

use super::config::{EngineConf, FrameworkTarget, GraphSplitStrategy, QuantApproach};
use super::model::{ModuleKind, ModuleSpec, Param, QuantizedParam, TransformerModel};

/// 동적 양자화 기본 모듈 매핑
pub fn default_dynamic_module_mapping() -> &'static [ModuleKind] {
    &[ModuleKind::Linear, ModuleKind::Embedding]
}

/// 정적 양자화 기본 모듈 매핑
pub fn default_static_module_mapping() -> &'static [ModuleKind] {
    &[ModuleKind::Linear]
}

/// 설정으로부터 양자화 그래프 변환 적용
///
/// 양자화 실행과 로더 양쪽에서 쓰는 순수 함수. 같은 (설정, 모델 구조) 입력이면
/// 항상 같은 파라미터 키 집합을 만든다. 로더가 저장 시점과 동일한 그래프 형태를
/// 재현하는 데 의존한다.
pub fn apply_quantization_from_config(
    conf: &EngineConf,
    model: &TransformerModel,
) -> Result<TransformerModel> {
    let mut q_model = model.clone();
    q_model.set_training(false);
    prepare(&mut q_model, conf)?;
    convert(&mut q_model, conf)?;
    Ok(q_model)
}

/// 변환 대상 모듈 선택
///
/// 그래프 타깃은 하위 모듈 목록(있으면)과 분할 전략을, eager 타깃은 방식별 기본
/// 매핑을 따른다. 내부 차원이 블록 크기 배수가 아닌 가중치는 float로 남긴다.
pub(crate) fn target_modules(conf: &EngineConf, model: &TransformerModel) -> Vec<ModuleSpec> {
    let selected: Vec<ModuleSpec> = match conf.framework() {
        FrameworkTarget::Graph => {
            if !conf.config.graph_sub_modules.is_empty() {
                // 나열된 하위 모듈만 순서대로 개별 준비/변환
                let mut out = Vec::new();
                for prefix in &conf.config.graph_sub_modules {
                    for module in model.modules() {
                        if module.name == *prefix || module.name.starts_with(&format!("{prefix}."))
                        {
                            out.push(module.clone());
                        }
                    }
                }
                out
            } else {
                match conf.config.graph_split {
                    GraphSplitStrategy::EngineDefault => model.modules().to_vec(),
                    GraphSplitStrategy::PerModuleKind => {
                        // 모듈 종류별로 묶어서 순회 (키 집합은 동일, 처리 순서만 다름)
                        let mut out = Vec::new();
                        for kind in [ModuleKind::Embedding, ModuleKind::Linear] {
                            for module in model.modules() {
                                if module.kind == kind {
                                    out.push(module.clone());
                                }
                            }
                        }
                        out
                    }
                }
            }
        }
        FrameworkTarget::Eager => {
            let mapping = if conf.approach() == QuantApproach::Dynamic {
                default_dynamic_module_mapping()
            } else {
                default_static_module_mapping()
            };
            model
                .modules()
                .iter()
                .filter(|m| mapping.contains(&m.kind))
                .cloned()
                .collect()
        }
        FrameworkTarget::Ipex => Vec::new(),
    };

    selected
        .into_iter()
        .filter(|m| weight_is_quantizable(model, &m.name))
        .collect()
}

fn weight_is_quantizable(model: &TransformerModel, module: &str) -> bool {
    match model.param(&format!("{module}.weight")) {
        Some(Param::Float(t)) => {
            let dims = t.dims();
            if dims.len() != 2 || dims[1] % QK_K != 0 {
                log::debug!(
                    "skipping `{module}` (shape {dims:?} not block-quantizable)"
                );
                false
            } else {
                true
            }
        }
        Some(Param::Quantized(_)) => true,
        None => false,
    }
}

/// 변환 준비 단계
///
/// 정적 방식은 관측자 버퍼를, 학습 인지 방식은 학습 모드 준비로 fake-quant
/// 플래그까지 붙인다. 동적 방식은 준비할 것이 없다.
pub(crate) fn prepare(model: &mut TransformerModel, conf: &EngineConf) -> Result<()> {
    let approach = conf.approach();
    if approach == QuantApproach::Dynamic {
        return Ok(());
    }

    if approach == QuantApproach::AwareTraining {
        model.set_training(true);
    }

    let targets = target_modules(conf, model);
    let device = model.device().clone();
    for module in targets {
        if module.kind != ModuleKind::Linear {
            continue;
        }
        model.set_param(
            &format!("{}.observer.min_val", module.name),
            Param::Float(Tensor::zeros(1, candle_core::DType::F32, &device)?),
        );
        model.set_param(
            &format!("{}.observer.max_val", module.name),
            Param::Float(Tensor::zeros(1, candle_core::DType::F32, &device)?),
        );
        if approach == QuantApproach::AwareTraining {
            model.set_param(
                &format!("{}.fake_quant_enabled", module.name),
                Param::Float(Tensor::from_vec(vec![1f32], 1, &device)?),
            );
            model.set_param(
                &format!("{}.observer_enabled", module.name),
                Param::Float(Tensor::from_vec(vec![1f32], 1, &device)?),
            );
        }
    }
    Ok(())
}

/// 변환 단계
///
/// 대상 가중치를 블록 양자화로 교체하고, 관측자 버퍼는 활성화 스케일/제로포인트로
/// 접어 넣은 뒤 제거한다.
pub(crate) fn convert(model: &mut TransformerModel, conf: &EngineConf) -> Result<()> {
    let approach = conf.approach();
    let dtype = conf.config.weight_dtype;
    let targets = target_modules(conf, model);
    let device = model.device().clone();

    for module in targets {
        let weight_key = format!("{}.weight", module.name);
        if let Some(Param::Float(weight)) = model.param(&weight_key) {
            let quantized = QuantizedParam::quantize(dtype, weight)?;
            model.set_param(&weight_key, Param::Quantized(quantized));
        }

        let min_key = format!("{}.observer.min_val", module.name);
        let max_key = format!("{}.observer.max_val", module.name);
        let observed = model.param(&min_key).is_some() && model.param(&max_key).is_some();
        if observed && approach != QuantApproach::Dynamic {
            let min_val = scalar_param(model, &min_key)?;
            let max_val = scalar_param(model, &max_key)?;
            let (scale, zero_point) = activation_qparams(min_val, max_val);
            model.set_param(
                &format!("{}.activation_post_process.scale", module.name),
                Param::Float(Tensor::from_vec(vec![scale], 1, &device)?),
            );
            model.set_param(
                &format!("{}.activation_post_process.zero_point", module.name),
                Param::Float(Tensor::from_vec(vec![zero_point], 1, &device)?),
            );
        }
        model.remove_param(&min_key);
        model.remove_param(&max_key);
        model.remove_param(&format!("{}.fake_quant_enabled", module.name));
        model.remove_param(&format!("{}.observer_enabled", module.name));
    }

    model.set_training(false);
    Ok(())
}

fn scalar_param(model: &TransformerModel, key: &str) -> Result<f32> {
    let param = model
        .param(key)
        .ok_or_else(|| anyhow::anyhow!("parameter `{key}` not found"))?;
    let tensor = param.to_tensor(model.device())?;
    Ok(tensor.to_vec1::<f32>()?[0])
}

/// 관측 범위에서 u8 affine 양자화 파라미터 계산
fn activation_qparams(min_val: f32, max_val: f32) -> (f32, f32) {
    if max_val <= min_val {
        return (1.0, 0.0);
    }
    let scale = (max_val - min_val) / 255.0;
    let zero_point = (-min_val / scale).round().clamp(0.0, 255.0);
    (scale, zero_point)
}
