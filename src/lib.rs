//! quant_llm: 트랜스포머 모델 양자화 오케스트레이션 라이브러리
//!
//! 압축 엔진(k-quant 블록 양자화)을 트랜스포머 모델 생태계에 연결하는 통합 레이어.
//! 설정 변환, 캘리브레이션 데이터 구성, 양자화 실행, 모델 저장/복원을 담당한다.

pub mod core;
pub mod hub;
pub mod onnx;

// 핵심 타입들 재수출
pub use crate::core::{
    // 설정
    AccuracyCriterion, ConfigSource, EngineConf, FrameworkTarget, GraphSplitStrategy,
    QuantApproach, QuantDType, QuantizationConfig, TuningCriterion,
    // 캘리브레이션
    Batch, CalibrationDataLoader, CalibrationDataset, DataCollator, Example, Preprocess,
    // 모델
    LoadMode, LoadReport, ModelConfig, ModuleKind, Param, SavedTensor, StateDict, TaskHead,
    TaskKind, TransformerModel,
    // 양자화 실행
    apply_quantization_from_config, CompressedModel, FitCallbacks, Quantizer, QuantizeOptions,
    QuantizerOptions,
    // 로더
    from_pretrained, FromPretrainedOptions,
    // 에러
    QuantError,
    // 상수
    BEST_CONFIGURE_KEY, QUANTIZE_CONFIG_NAME, WEIGHTS_NAME,
};
pub use crate::onnx::{OnnxExportSpec, OnnxExporter, MIN_QDQ_ONNX_OPSET, ONNX_WEIGHTS_NAME};

// 편의 타입 별칭들
pub type Model = TransformerModel;
pub type Loader = CalibrationDataLoader;
