//! ONNX 내보내기 스펙 구성과 내보내기 루틴 호출

pub mod export;

pub use export::{
    build_export_spec, dummy_inputs, resolve_export_task, OnnxExportSpec, OnnxExporter,
    MIN_QDQ_ONNX_OPSET, ONNX_WEIGHTS_NAME,
};
