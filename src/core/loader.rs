use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use super::apply::apply_quantization_from_config;
use super::config::{ConfigSource, EngineConf, FrameworkTarget, QuantizationConfig};
use super::engine;
use super::error::QuantError;
use super::model::{
    LoadAllowList, LoadMode, ModelConfig, SavedTensor, StateDict, TransformerModel,
};
use super::registry::{build_model, TaskKind};
use super::{BEST_CONFIGURE_KEY, MODEL_CONFIG_NAME, QUANTIZE_CONFIG_NAME, SAFETENSORS_NAME, WEIGHTS_NAME};
use crate::hub::{self, HubOptions};

/// from_pretrained 옵션
#[derive(Default)]
pub struct FromPretrainedOptions {
    /// 양자화 설정 (상태 사전에 예약 키가 없을 때 사용)
    pub config: Option<ConfigSource>,
    /// 상태 사전 파일명 (기본값 덮어쓰기)
    pub q_model_name: Option<String>,
    /// 기본 모델 생성자를 고르는 태스크 (없으면 모델 설정에서 추론)
    pub task: Option<TaskKind>,
    /// 명시적 상태 사전 (있으면 파일/허브 해석 생략)
    pub state_dict: Option<StateDict>,
    pub hub: HubOptions,
    /// 중간 로드에서 경고 없이 허용할 키 패턴 (기본: 양자화 전용 키 목록)
    pub load_allow_list: Option<LoadAllowList>,
}

/// 저장된 양자화 모델 복원
///
/// 기본 모델을 다시 만들고, 저장 시점과 동일한 그래프 변환을 재적용한 뒤
/// 양자화 상태 사전을 비엄격하게 로드한다.
pub fn from_pretrained(
    model_name_or_path: &str,
    options: FromPretrainedOptions,
) -> Result<TransformerModel> {
    let path = Path::new(model_name_or_path);
    let allow = options
        .load_allow_list
        .clone()
        .unwrap_or_else(LoadAllowList::quantized_default);

    // 1. 기본 모델 설정과 아키텍처 해석
    let model_config = resolve_model_config(model_name_or_path, path, &options.hub)?;
    let task = options
        .task
        .or_else(|| {
            model_config
                .as_ref()
                .and_then(|c| TaskKind::from_architectures(&c.architectures()))
        })
        .or_else(|| {
            model_config
                .as_ref()
                .and_then(|c| c.pipeline_tag())
                .and_then(TaskKind::from_pipeline_tag)
        })
        .ok_or_else(|| {
            QuantError::InvalidConfig(
                "the model task could not be inferred from the configuration; \
                 pass `task` explicitly"
                    .to_string(),
            )
        })?;
    let mut model = build_model(task, model_config)?.with_name(model_name_or_path);

    // float 가중치가 옆에 있으면 허용 목록 로드로 흡수 (양자화 전용 키 경고 억제)
    if path.is_dir() {
        let float_path = path.join(SAFETENSORS_NAME);
        if float_path.exists() {
            model.load_float_weights(&float_path, LoadMode::AllowList(&allow))?;
        }
    }

    // 2. 양자화 상태 사전 해석
    let q_model_name = options
        .q_model_name
        .clone()
        .unwrap_or_else(|| WEIGHTS_NAME.to_string());
    let mut state = match options.state_dict {
        Some(state) => state,
        None => {
            let state_dict_path = if path.is_dir() {
                let candidate = path.join(&q_model_name);
                if !candidate.exists() {
                    return Err(QuantError::ArtifactNotFound {
                        repo: model_name_or_path.to_string(),
                        file: q_model_name.clone(),
                        revision: options.hub.revision.clone(),
                    }
                    .into());
                }
                candidate
            } else if path.is_file() {
                path.to_path_buf()
            } else {
                hub::fetch_model_file(model_name_or_path, &q_model_name, &options.hub)?
            };
            let bytes = fs::read(&state_dict_path).with_context(|| {
                format!("failed to read state dict {}", state_dict_path.display())
            })?;
            bincode::deserialize(&bytes).with_context(|| {
                format!("failed to parse state dict {}", state_dict_path.display())
            })?
        }
    };

    // 3. 양자화 설정 해석: 예약 키 > 명시 설정 > 같이 저장된 설정 파일
    let q_config = resolve_quant_config(
        &mut state,
        options.config.as_ref(),
        model_name_or_path,
        path,
        &options.hub,
    )?;

    if q_config.framework == FrameworkTarget::Ipex {
        return Err(QuantError::UnsupportedFramework("ipex".to_string()).into());
    }

    // 4. 원샷 저장 경로는 엔진 쪽 로더로 위임
    if q_config.is_oneshot {
        return engine::load_oneshot(&model, &q_config, &state);
    }

    // 5. 저장 시점과 같은 그래프 변환 재적용 후 비엄격 로드
    let conf = EngineConf { config: q_config };
    let mut q_model = apply_quantization_from_config(&conf, &model)?;
    q_model.load_state_dict(&state, LoadMode::AllowList(&allow))?;
    q_model.make_embeddings_contiguous()?;

    Ok(q_model)
}

fn resolve_model_config(
    model_name_or_path: &str,
    path: &Path,
    hub_options: &HubOptions,
) -> Result<Option<ModelConfig>> {
    if path.is_dir() {
        let config_path = path.join(MODEL_CONFIG_NAME);
        if config_path.exists() {
            return Ok(Some(ModelConfig::from_file(&config_path)?));
        }
        return Ok(None);
    }
    if path.is_file() {
        // 단일 가중치 파일이면 옆의 config.json을 본다
        if let Some(dir) = path.parent() {
            let config_path = dir.join(MODEL_CONFIG_NAME);
            if config_path.exists() {
                return Ok(Some(ModelConfig::from_file(&config_path)?));
            }
        }
        return Ok(None);
    }
    match hub::fetch_model_file(model_name_or_path, MODEL_CONFIG_NAME, hub_options) {
        Ok(config_path) => Ok(Some(ModelConfig::from_file(&config_path)?)),
        Err(e) => {
            log::debug!("no remote model config for `{model_name_or_path}`: {e}");
            Ok(None)
        }
    }
}

fn resolve_quant_config(
    state: &mut StateDict,
    explicit: Option<&ConfigSource>,
    model_name_or_path: &str,
    path: &Path,
    hub_options: &HubOptions,
) -> Result<QuantizationConfig> {
    match state.remove(BEST_CONFIGURE_KEY) {
        Some(SavedTensor::Config(json)) => {
            let value: serde_json::Value = serde_json::from_str(&json)
                .context("invalid `best_configure` entry in the state dict")?;
            return QuantizationConfig::from_json_value(&value)
                .context("invalid quantization configuration embedded in the state dict");
        }
        Some(other) => {
            anyhow::bail!(
                "reserved key `{BEST_CONFIGURE_KEY}` holds a tensor entry {other:?} instead \
                 of a serialized configuration"
            );
        }
        None => {}
    }

    if let Some(source) = explicit {
        return source.resolve();
    }

    let config_path = if path.is_dir() {
        let candidate = path.join(QUANTIZE_CONFIG_NAME);
        if !candidate.exists() {
            return Err(QuantError::ArtifactNotFound {
                repo: model_name_or_path.to_string(),
                file: QUANTIZE_CONFIG_NAME.to_string(),
                revision: hub_options.revision.clone(),
            }
            .into());
        }
        candidate
    } else if path.is_file() {
        match path.parent().map(|d| d.join(QUANTIZE_CONFIG_NAME)) {
            Some(candidate) if candidate.exists() => candidate,
            _ => {
                return Err(QuantError::ArtifactNotFound {
                    repo: model_name_or_path.to_string(),
                    file: QUANTIZE_CONFIG_NAME.to_string(),
                    revision: hub_options.revision.clone(),
                }
                .into())
            }
        }
    } else {
        hub::fetch_model_file(model_name_or_path, QUANTIZE_CONFIG_NAME, hub_options)?
    };
    QuantizationConfig::from_json_file(&config_path)
}
