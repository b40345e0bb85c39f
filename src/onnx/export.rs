use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use once_cell::sync::Lazy;

use crate::core::dataloader::{Batch, CalibrationDataLoader};
use crate::core::error::QuantError;
use crate::core::model::TransformerModel;
use crate::core::registry::TaskKind;

/// quantize/dequantize 연산을 지원하는 최소 opset
pub const MIN_QDQ_ONNX_OPSET: u32 = 14;
/// 내보내기 결과 파일명
pub const ONNX_WEIGHTS_NAME: &str = "model.onnx";

/// 텐서 이름 → (축 번호 → 축 이름)
pub type DynamicAxes = BTreeMap<String, BTreeMap<usize, String>>;

/// ONNX 내보내기 스펙
///
/// 태스크별 내보내기 설정에서 유도되어 내보내기 한 번에 소비된다.
#[derive(Debug, Clone)]
pub struct OnnxExportSpec {
    pub task: TaskKind,
    pub opset: u32,
    pub inputs: DynamicAxes,
    pub outputs: DynamicAxes,
}

/// 모델 쪽 내보내기 루틴
///
/// 그래프 직렬화 자체는 이 크레이트 밖의 책임이다. 이 레이어는 스펙을 만들어
/// 호출만 한다.
pub trait OnnxExporter: Send + Sync {
    fn export_int8_onnx(
        &self,
        model: &TransformerModel,
        fp32_model: &TransformerModel,
        spec: &OnnxExportSpec,
        example_inputs: &Batch,
        output_path: &Path,
        calib_dataloader: Option<&CalibrationDataLoader>,
    ) -> Result<()>;
}

/// 태스크별 기본 opset
static TASK_DEFAULT_OPSETS: Lazy<BTreeMap<TaskKind, u32>> = Lazy::new(|| {
    let mut map = BTreeMap::new();
    map.insert(TaskKind::SequenceClassification, 17);
    map.insert(TaskKind::TokenClassification, 17);
    map.insert(TaskKind::QuestionAnswering, 17);
    map.insert(TaskKind::CausalLM, 18);
    map.insert(TaskKind::MaskedLM, 17);
    map.insert(TaskKind::Default, 17);
    map
});

/// 내보내기 태스크 결정
///
/// 명시된 태스크가 없으면 모델 설정(아키텍처 이름, 파이프라인 태그)에서
/// 자동 감지한다. 감지 불가면 설정 오류, 시퀀스-투-시퀀스는 거부.
pub fn resolve_export_task(
    model: &TransformerModel,
    explicit: Option<TaskKind>,
) -> Result<TaskKind> {
    let task = match explicit {
        Some(task) => task,
        None => {
            let config = model.config();
            let from_arch = config
                .map(|c| c.architectures())
                .as_deref()
                .and_then(TaskKind::from_architectures);
            let from_tag = config
                .and_then(|c| c.pipeline_tag())
                .and_then(TaskKind::from_pipeline_tag);
            match from_arch.or(from_tag) {
                Some(task) => task,
                None => return Err(QuantError::AmbiguousExportTask.into()),
            }
        }
    };

    if task.is_seq2seq() {
        return Err(QuantError::UnsupportedExportTask(task.as_str().to_string()).into());
    }
    Ok(task)
}

/// 태스크 내보내기 스펙 구성 (opset은 태스크 기본값과 QDQ 최소값 중 작은 쪽)
pub fn build_export_spec(task: TaskKind) -> OnnxExportSpec {
    let default_opset = TASK_DEFAULT_OPSETS.get(&task).copied().unwrap_or(17);
    let opset = default_opset.min(MIN_QDQ_ONNX_OPSET);

    let batch_seq: BTreeMap<usize, String> =
        [(0, "batch".to_string()), (1, "sequence".to_string())].into();
    let mut inputs = DynamicAxes::new();
    inputs.insert("input_ids".to_string(), batch_seq.clone());
    inputs.insert("attention_mask".to_string(), batch_seq.clone());

    let mut outputs = DynamicAxes::new();
    let logits_axes = match task {
        TaskKind::SequenceClassification => [(0, "batch".to_string())].into(),
        _ => batch_seq,
    };
    outputs.insert("logits".to_string(), logits_axes);

    OnnxExportSpec {
        task,
        opset,
        inputs,
        outputs,
    }
}

/// 내보내기용 더미 입력 생성
pub fn dummy_inputs(model: &TransformerModel) -> Result<Batch> {
    let device = Device::Cpu;
    let (batch, seq) = (2usize, 8usize);
    let vocab = model.vocab_size() as i64;
    let ids: Vec<i64> = (0..(batch * seq) as i64).map(|i| i % vocab).collect();
    let mut inputs = Batch::new();
    inputs.insert(
        "input_ids".to_string(),
        Tensor::from_vec(ids, (batch, seq), &device)?,
    );
    inputs.insert(
        "attention_mask".to_string(),
        Tensor::ones((batch, seq), DType::I64, &device)?,
    );
    Ok(inputs)
}

/// 압축 모델을 ONNX로 내보내기
///
/// 모델이 내보내기 루틴을 제공해야 한다. 루틴 내부 오류는 그대로 전파된다.
pub(crate) fn export_compressed(
    compressed: &TransformerModel,
    fp32_model: &TransformerModel,
    spec: &OnnxExportSpec,
    output_path: &Path,
    calib_dataloader: Option<&CalibrationDataLoader>,
) -> Result<()> {
    let exporter = match compressed.onnx_exporter() {
        Some(exporter) => exporter.clone(),
        None => bail!("the model does not provide an ONNX export routine"),
    };
    let example_inputs = dummy_inputs(fp32_model)?;
    exporter.export_int8_onnx(
        compressed,
        fp32_model,
        spec,
        &example_inputs,
        output_path,
        calib_dataloader,
    )?;
    log::info!("ONNX model exported to {}", output_path.display());
    Ok(())
}
