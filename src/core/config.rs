use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::error::QuantError;

/// 지원하는 양자화 방식 문자열 (유선 포맷)
pub const SUPPORTED_QUANT_APPROACHES: [&str; 3] = [
    "post_training_dynamic_quant",
    "post_training_static_quant",
    "quant_aware_training",
];

/// 양자화 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum QuantApproach {
    Dynamic,
    Static,
    AwareTraining,
}

impl QuantApproach {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantApproach::Dynamic => "post_training_dynamic_quant",
            QuantApproach::Static => "post_training_static_quant",
            QuantApproach::AwareTraining => "quant_aware_training",
        }
    }
}

impl FromStr for QuantApproach {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post_training_dynamic_quant" => Ok(QuantApproach::Dynamic),
            "post_training_static_quant" => Ok(QuantApproach::Static),
            "quant_aware_training" => Ok(QuantApproach::AwareTraining),
            other => Err(QuantError::UnsupportedApproach(other.to_string())),
        }
    }
}

impl TryFrom<String> for QuantApproach {
    type Error = QuantError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<QuantApproach> for String {
    fn from(a: QuantApproach) -> String {
        a.as_str().to_string()
    }
}

impl fmt::Display for QuantApproach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 프레임워크 타깃
///
/// eager는 모듈 단위 변환, graph는 모듈 그래프 단위 변환. ipex는 항상 거부된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FrameworkTarget {
    Eager,
    Graph,
    Ipex,
}

impl FrameworkTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameworkTarget::Eager => "eager",
            FrameworkTarget::Graph => "graph",
            FrameworkTarget::Ipex => "ipex",
        }
    }
}

impl FromStr for FrameworkTarget {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // 레거시 설정 파일의 프레임워크 이름도 같이 받아준다
            "eager" | "pytorch" => Ok(FrameworkTarget::Eager),
            "graph" | "pytorch_fx" => Ok(FrameworkTarget::Graph),
            "ipex" | "pytorch_ipex" => Ok(FrameworkTarget::Ipex),
            other => Err(QuantError::InvalidConfig(format!(
                "unknown framework target `{other}`"
            ))),
        }
    }
}

impl TryFrom<String> for FrameworkTarget {
    type Error = QuantError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FrameworkTarget> for String {
    fn from(f: FrameworkTarget) -> String {
        f.as_str().to_string()
    }
}

/// 가중치 블록 양자화 포맷
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantDType {
    Q8K,
    Q4K,
}

impl QuantDType {
    /// 블록 하나가 담는 원소 수
    pub fn block_elems(&self) -> usize {
        use candle_core::quantized::k_quants::QK_K;
        QK_K
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuantDType::Q8K => "q8k",
            QuantDType::Q4K => "q4k",
        }
    }
}

/// 튜닝 종료 조건
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningCriterion {
    pub max_trials: usize,
}

impl Default for TuningCriterion {
    fn default() -> Self {
        Self { max_trials: 5 }
    }
}

/// 정확도 허용 기준
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracyCriterion {
    /// 기준 모델 대비 허용 상대 손실
    pub tolerable_loss: f32,
    pub higher_is_better: bool,
}

impl Default for AccuracyCriterion {
    fn default() -> Self {
        Self {
            tolerable_loss: 0.01,
            higher_is_better: true,
        }
    }
}

/// 그래프 분할 전략
///
/// 과거에는 엔진 내부 훅을 프로세스 전역으로 덮어써서 분할 방식을 바꿨지만,
/// 지금은 설정 변환 호출의 명시적 파라미터로만 전달된다. 전역 상태는 없다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphSplitStrategy {
    /// 전체 그래프를 한 번에 준비/변환
    #[default]
    EngineDefault,
    /// 모듈 종류별로 그래프 설정을 쪼개서 적용
    PerModuleKind,
}

/// 양자화 설정
///
/// 호출자가 만들거나 파일에서 읽어온 뒤 한 번의 양자화 실행에 소비된다. 불변.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub approach: QuantApproach,
    #[serde(default = "default_framework")]
    pub framework: FrameworkTarget,
    #[serde(default = "default_weight_dtype")]
    pub weight_dtype: QuantDType,
    /// 그래프 모드에서 개별적으로 양자화할 하위 모듈 이름 목록
    #[serde(default)]
    pub graph_sub_modules: Vec<String>,
    #[serde(default)]
    pub tuning: TuningCriterion,
    #[serde(default)]
    pub accuracy: AccuracyCriterion,
    #[serde(default)]
    pub graph_split: GraphSplitStrategy,
    /// 프루닝/증류 결합 아티팩트가 쓰는 원샷 저장 경로 여부
    #[serde(default)]
    pub is_oneshot: bool,
}

fn default_framework() -> FrameworkTarget {
    FrameworkTarget::Eager
}

fn default_weight_dtype() -> QuantDType {
    QuantDType::Q8K
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            approach: QuantApproach::Dynamic,
            framework: FrameworkTarget::Eager,
            weight_dtype: QuantDType::Q8K,
            graph_sub_modules: Vec::new(),
            tuning: TuningCriterion::default(),
            accuracy: AccuracyCriterion::default(),
            graph_split: GraphSplitStrategy::default(),
            is_oneshot: false,
        }
    }
}

impl QuantizationConfig {
    pub fn dynamic() -> Self {
        Self::default()
    }

    pub fn static_quant() -> Self {
        Self {
            approach: QuantApproach::Static,
            ..Default::default()
        }
    }

    pub fn aware_training() -> Self {
        Self {
            approach: QuantApproach::AwareTraining,
            ..Default::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read quantization config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse quantization config {}", path.display()))?;
        Ok(config)
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("failed to write quantization config {}", path.display()))?;
        Ok(())
    }

    /// 레거시 YAML 설정 파일에서 읽기 (마이그레이션 기간 지원)
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read legacy config {}", path.display()))?;
        let legacy: LegacyConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse legacy config {}", path.display()))?;
        legacy.into_config()
    }

    pub fn from_json_value(value: &serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone())?;
        Ok(config)
    }
}

/// 레거시 YAML 설정 스키마 (`model:` / `quantization:` / `tuning:` 섹션 구조)
#[derive(Debug, Deserialize)]
struct LegacyConfig {
    model: Option<LegacyModel>,
    quantization: LegacyQuantization,
    tuning: Option<LegacyTuning>,
}

#[derive(Debug, Deserialize)]
struct LegacyModel {
    framework: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyQuantization {
    approach: String,
}

#[derive(Debug, Deserialize)]
struct LegacyTuning {
    accuracy_criterion: Option<LegacyAccuracy>,
    exit_policy: Option<LegacyExitPolicy>,
}

#[derive(Debug, Deserialize)]
struct LegacyAccuracy {
    relative: Option<f32>,
    higher_is_better: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct LegacyExitPolicy {
    max_trials: Option<usize>,
}

impl LegacyConfig {
    fn into_config(self) -> Result<QuantizationConfig> {
        let approach: QuantApproach = self.quantization.approach.parse()?;
        let framework = match self.model.and_then(|m| m.framework) {
            Some(name) => name.parse()?,
            None => FrameworkTarget::Eager,
        };
        let mut config = QuantizationConfig {
            approach,
            framework,
            ..Default::default()
        };
        if let Some(tuning) = self.tuning {
            if let Some(acc) = tuning.accuracy_criterion {
                if let Some(relative) = acc.relative {
                    config.accuracy.tolerable_loss = relative;
                }
                if let Some(hib) = acc.higher_is_better {
                    config.accuracy.higher_is_better = hib;
                }
            }
            if let Some(exit) = tuning.exit_policy {
                if let Some(max_trials) = exit.max_trials {
                    config.tuning.max_trials = max_trials;
                }
            }
        }
        Ok(config)
    }
}

/// 설정 입력 소스 (구조체 직접 전달 또는 파일 경로)
///
/// 경계에서 한 번만 해석해 단일 정규 표현으로 수렴한다.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Inline(QuantizationConfig),
    File(PathBuf),
}

impl ConfigSource {
    pub fn resolve(&self) -> Result<QuantizationConfig> {
        match self {
            ConfigSource::Inline(config) => Ok(config.clone()),
            ConfigSource::File(path) => {
                let is_yaml = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
                    .unwrap_or(false);
                if is_yaml {
                    QuantizationConfig::from_yaml_file(path)
                } else {
                    QuantizationConfig::from_json_file(path)
                }
            }
        }
    }
}

impl From<QuantizationConfig> for ConfigSource {
    fn from(config: QuantizationConfig) -> Self {
        ConfigSource::Inline(config)
    }
}

/// 압축 엔진 네이티브 설정
///
/// 변환이 끝난 정규 설정. 그래프 분할 전략까지 포함하므로 이후 단계는
/// 전역 상태 없이 이 객체만 본다.
#[derive(Debug, Clone)]
pub struct EngineConf {
    pub config: QuantizationConfig,
}

impl EngineConf {
    pub fn approach(&self) -> QuantApproach {
        self.config.approach
    }

    pub fn framework(&self) -> FrameworkTarget {
        self.config.framework
    }
}

/// 설정 변환기
///
/// 원시 설정(파일 또는 구조체)을 엔진 네이티브 설정으로 변환한다.
/// 그래프 분할 전략은 명시적 파라미터로만 주입된다.
pub fn translate_config(
    source: &ConfigSource,
    graph_split: Option<GraphSplitStrategy>,
) -> Result<EngineConf> {
    let mut config = source.resolve()?;

    if config.framework == FrameworkTarget::Ipex {
        return Err(QuantError::UnsupportedFramework("ipex".to_string()).into());
    }

    if let Some(strategy) = graph_split {
        config.graph_split = strategy;
    }

    Ok(EngineConf { config })
}
