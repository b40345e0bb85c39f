//! 양자화 오케스트레이션 핵심 모듈

pub mod apply;
pub mod calibration;
pub mod config;
pub mod dataloader;
pub mod engine;
pub mod error;
pub mod loader;
pub mod model;
pub mod quantizer;
pub mod registry;

#[cfg(test)]
pub mod tests;

pub use apply::{apply_quantization_from_config, default_dynamic_module_mapping, default_static_module_mapping};
pub use calibration::{load_hub_dataset, CalibrationDataset, Example, Preprocess};
pub use config::{
    translate_config, AccuracyCriterion, ConfigSource, EngineConf, FrameworkTarget,
    GraphSplitStrategy, QuantApproach, QuantDType, QuantizationConfig, TuningCriterion,
};
pub use dataloader::{default_collator, Batch, CalibrationDataLoader, DataCollator};
pub use engine::{fit, CalibFn, CompressedModel, EvalFn, FitCallbacks, TrainFn};
pub use error::QuantError;
pub use loader::{from_pretrained, FromPretrainedOptions};
pub use model::{
    LoadAllowList, LoadMode, LoadReport, ModelConfig, ModelOutput, ModuleKind, ModuleSpec, Param,
    QuantizedParam, SavedTensor, StateDict, TaskHead, TransformerModel,
};
pub use quantizer::{CalibrationDatasetOptions, Quantizer, QuantizeOptions, QuantizerOptions};
pub use registry::{build_model, TaskKind};

/// 양자화 상태 사전 기본 파일명
pub const WEIGHTS_NAME: &str = "quantized_model.bin";
/// 양자화 설정 파일명
pub const QUANTIZE_CONFIG_NAME: &str = "quantize_config.json";
/// 기본 모델 설정 파일명
pub const MODEL_CONFIG_NAME: &str = "config.json";
/// 원본 float 가중치 파일명
pub const SAFETENSORS_NAME: &str = "model.safetensors";
/// 튜닝 탐색이 찾은 설정이 상태 사전에 같이 저장될 때 쓰는 예약 키
pub const BEST_CONFIGURE_KEY: &str = "best_configure";
