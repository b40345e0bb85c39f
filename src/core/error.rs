use thiserror::Error;

use super::config::SUPPORTED_QUANT_APPROACHES;

/// 범주별 양자화 오류
///
/// 설정 오류는 엔진 호출 전에, 원격 아티팩트 해석 오류는 다운로드 시점에 발생한다.
/// 엔진/텐서 연산 내부 오류는 anyhow로 그대로 전파된다.
#[derive(Debug, Error)]
pub enum QuantError {
    #[error("unknown quantization approach `{0}`, supported approaches are {}", SUPPORTED_QUANT_APPROACHES.join(", "))]
    UnsupportedApproach(String),

    #[error("post-training static quantization needs a calibration dataset")]
    MissingCalibrationDataset,

    #[error("a training function must be provided for quantization aware training")]
    MissingTrainFunction,

    #[error("the `{0}` framework target is not currently supported")]
    UnsupportedFramework(String),

    #[error("the export task could not be detected and needs to be specified for the ONNX export")]
    AmbiguousExportTask,

    #[error("`{0}` models are currently not supported for post-training static quantization export")]
    UnsupportedExportTask(String),

    #[error(
        "can't load `{file}` for `{repo}`{}; make sure `{repo}` is a model repository \
         listed on the hub or a path to a directory containing a `{file}` file",
        .revision.as_deref().map(|r| format!(" (revision `{r}`)")).unwrap_or_default()
    )]
    ArtifactNotFound {
        repo: String,
        file: String,
        revision: Option<String>,
    },

    #[error("invalid quantization configuration: {0}")]
    InvalidConfig(String),
}
