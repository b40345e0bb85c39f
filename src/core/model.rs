use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::mem;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use candle_core::quantized::k_quants::{BlockQ4K, BlockQ8K, QK_K};
use candle_core::quantized::GgmlType;
use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::config::QuantDType;
use super::dataloader::Batch;
use super::{BEST_CONFIGURE_KEY, MODEL_CONFIG_NAME};
use crate::onnx::OnnxExporter;

/// config.json 기반 모델 설정
#[derive(Debug, Clone)]
pub struct ModelConfig {
    value: serde_json::Value,
}

impl ModelConfig {
    pub fn from_value(value: serde_json::Value) -> Self {
        Self { value }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read model config {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse model config {}", path.display()))?;
        Ok(Self { value })
    }

    /// 표준 구조화 설정인지 (model_type 필드를 가진 JSON 오브젝트)
    pub fn is_standard(&self) -> bool {
        self.value.get("model_type").and_then(|v| v.as_str()).is_some()
    }

    pub fn model_type(&self) -> Option<&str> {
        self.value.get("model_type").and_then(|v| v.as_str())
    }

    pub fn architectures(&self) -> Vec<String> {
        self.value
            .get("architectures")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pipeline_tag(&self) -> Option<&str> {
        self.value.get("pipeline_tag").and_then(|v| v.as_str())
    }

    pub fn vocab_size(&self) -> usize {
        self.usize_field("vocab_size").unwrap_or(32000)
    }

    pub fn hidden_size(&self) -> usize {
        self.usize_field("hidden_size").unwrap_or(768)
    }

    pub fn num_labels(&self) -> usize {
        // id2label이 있으면 그 크기가 우선
        if let Some(map) = self.value.get("id2label").and_then(|v| v.as_object()) {
            if !map.is_empty() {
                return map.len();
            }
        }
        self.usize_field("num_labels").unwrap_or(2)
    }

    pub fn usize_field(&self, key: &str) -> Option<usize> {
        self.value.get(key).and_then(|v| v.as_u64()).map(|v| v as usize)
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }

    pub fn save_pretrained(&self, save_directory: &Path) -> Result<()> {
        let path = save_directory.join(MODEL_CONFIG_NAME);
        let json = serde_json::to_string_pretty(&self.value)?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write model config {}", path.display()))?;
        Ok(())
    }
}

/// 모듈 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Embedding,
    Linear,
}

/// 이름 붙은 모듈 (파라미터 접두사 + 종류)
#[derive(Debug, Clone)]
pub struct ModuleSpec {
    pub name: String,
    pub kind: ModuleKind,
}

/// 블록 양자화된 파라미터
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedParam {
    pub dtype: QuantDType,
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<u8>,
}

impl QuantizedParam {
    /// f32 행렬을 블록 양자화
    pub fn quantize(dtype: QuantDType, weight: &Tensor) -> Result<Self> {
        let dims = weight.dims();
        ensure!(dims.len() == 2, "block quantization expects a 2D weight, got {dims:?}");
        let (rows, cols) = (dims[0], dims[1]);
        ensure!(
            cols % QK_K == 0,
            "inner dim {cols} not multiple of {QK_K}"
        );
        let data_f32 = weight.flatten_all()?.to_vec1::<f32>()?;
        let data = match dtype {
            QuantDType::Q8K => quantize_typed::<BlockQ8K>(&data_f32, rows, cols)?,
            QuantDType::Q4K => quantize_typed::<BlockQ4K>(&data_f32, rows, cols)?,
        };
        Ok(Self { dtype, rows, cols, data })
    }

    /// f32 텐서로 복원
    pub fn dequantize(&self, device: &Device) -> Result<Tensor> {
        let data = match self.dtype {
            QuantDType::Q8K => dequantize_typed::<BlockQ8K>(&self.data, self.rows, self.cols)?,
            QuantDType::Q4K => dequantize_typed::<BlockQ4K>(&self.data, self.rows, self.cols)?,
        };
        Ok(Tensor::from_vec(data, (self.rows, self.cols), device)?)
    }
}

fn quantize_typed<T: GgmlType + Clone>(data: &[f32], rows: usize, cols: usize) -> Result<Vec<u8>> {
    let blocks_per_row = cols / QK_K;
    let mut blocks = vec![T::zeros(); rows * blocks_per_row];
    for r in 0..rows {
        let row = &data[r * cols..(r + 1) * cols];
        let dst = &mut blocks[r * blocks_per_row..(r + 1) * blocks_per_row];
        T::from_float(row, dst);
    }
    let raw = unsafe {
        std::slice::from_raw_parts(blocks.as_ptr() as *const u8, blocks.len() * mem::size_of::<T>())
    };
    Ok(raw.to_vec())
}

fn dequantize_typed<T: GgmlType + Clone>(bytes: &[u8], rows: usize, cols: usize) -> Result<Vec<f32>> {
    let blocks_per_row = cols / QK_K;
    let total_blocks = rows * blocks_per_row;
    ensure!(
        bytes.len() == total_blocks * mem::size_of::<T>(),
        "packed data size mismatch (got {}, expect {})",
        bytes.len(),
        total_blocks * mem::size_of::<T>()
    );
    let mut blocks = vec![T::zeros(); total_blocks];
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), blocks.as_mut_ptr() as *mut u8, bytes.len());
    }
    let mut out = vec![0f32; rows * cols];
    for r in 0..rows {
        let src = &blocks[r * blocks_per_row..(r + 1) * blocks_per_row];
        T::to_float(src, &mut out[r * cols..(r + 1) * cols]);
    }
    Ok(out)
}

/// 파라미터 슬롯: float 텐서 또는 블록 양자화 데이터
#[derive(Debug, Clone)]
pub enum Param {
    Float(Tensor),
    Quantized(QuantizedParam),
}

impl Param {
    pub fn is_quantized(&self) -> bool {
        matches!(self, Param::Quantized(_))
    }

    /// forward용 f32 텐서 (양자화 슬롯은 복원해서 반환)
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        match self {
            Param::Float(t) => Ok(t.clone()),
            Param::Quantized(q) => q.dequantize(device),
        }
    }
}

/// 직렬화 가능한 상태 사전 엔트리
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SavedTensor {
    Float { shape: Vec<usize>, data: Vec<f32> },
    Quantized { dtype: QuantDType, rows: usize, cols: usize, data: Vec<u8> },
    /// 예약 키(`best_configure`) 전용: 직렬화된 설정 JSON
    Config(String),
}

pub type StateDict = BTreeMap<String, SavedTensor>;

/// 상태 사전 로드 모드
#[derive(Debug, Clone, Copy)]
pub enum LoadMode<'a> {
    Strict,
    NonStrict,
    /// 명시된 이름 패턴만 경고 없이 허용 (클래스 상태 변경 없이 호출 범위에서만 유효)
    AllowList(&'a LoadAllowList),
}

/// 로드시 무시할 키 패턴 (부분 문자열 매칭)
#[derive(Debug, Clone)]
pub struct LoadAllowList {
    pub ignore_missing: Vec<String>,
    pub ignore_unexpected: Vec<String>,
}

impl LoadAllowList {
    /// 양자화 전용 파라미터 이름들을 허용하는 기본 목록
    pub fn quantized_default() -> Self {
        Self {
            ignore_missing: vec!["weight".to_string(), "bias".to_string()],
            ignore_unexpected: vec![
                "zero_point".to_string(),
                "scale".to_string(),
                "packed_params".to_string(),
                "constant".to_string(),
                "module".to_string(),
                BEST_CONFIGURE_KEY.to_string(),
                "max_val".to_string(),
                "min_val".to_string(),
                "eps".to_string(),
                "fake_quant_enabled".to_string(),
                "observer_enabled".to_string(),
            ],
        }
    }

    fn matches(patterns: &[String], key: &str) -> bool {
        patterns.iter().any(|p| key.contains(p.as_str()))
    }
}

/// 로드 결과 요약
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

/// 태스크 헤드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskHead {
    SequenceClassification,
    TokenClassification,
    QuestionAnswering,
    CausalLM,
    MaskedLM,
}

impl TaskHead {
    /// 헤드 모듈 이름
    fn module_name(&self) -> &'static str {
        match self {
            TaskHead::SequenceClassification | TaskHead::TokenClassification => "classifier",
            TaskHead::QuestionAnswering => "qa_outputs",
            TaskHead::CausalLM | TaskHead::MaskedLM => "lm_head",
        }
    }
}

/// forward 출력
#[derive(Debug)]
pub struct ModelOutput {
    pub logits: Tensor,
}

/// 트랜스포머 모델 래퍼
///
/// 임베딩 → dense 인코더 → 태스크 헤드 구조. 파라미터는 이름으로 접근 가능한
/// 테이블에 들어 있어서 양자화 변환이 슬롯 단위로 이루어진다.
/// 동일한 (헤드, 설정)으로 만들면 파라미터 키 집합이 항상 같다.
#[derive(Clone)]
pub struct TransformerModel {
    name_or_path: Option<String>,
    config: Option<ModelConfig>,
    head: TaskHead,
    vocab_size: usize,
    hidden_size: usize,
    num_labels: usize,
    params: BTreeMap<String, Param>,
    modules: Vec<ModuleSpec>,
    input_names: Vec<String>,
    training: bool,
    exporter: Option<Arc<dyn OnnxExporter>>,
    device: Device,
}

impl fmt::Debug for TransformerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformerModel")
            .field("name_or_path", &self.name_or_path)
            .field("head", &self.head)
            .field("vocab_size", &self.vocab_size)
            .field("hidden_size", &self.hidden_size)
            .field("num_labels", &self.num_labels)
            .field("params", &self.params.len())
            .finish()
    }
}

impl TransformerModel {
    /// 설정으로부터 0 초기화 모델 생성 (결정적: 같은 입력이면 같은 키 집합)
    pub fn new(head: TaskHead, config: Option<ModelConfig>) -> Result<Self> {
        let device = Device::Cpu;
        let (vocab_size, hidden_size, num_labels) = match &config {
            Some(c) => (c.vocab_size(), c.hidden_size(), c.num_labels()),
            None => (32000, 768, 2),
        };

        let head_out = match head {
            TaskHead::SequenceClassification | TaskHead::TokenClassification => num_labels,
            TaskHead::QuestionAnswering => 2,
            TaskHead::CausalLM | TaskHead::MaskedLM => vocab_size,
        };

        let mut params = BTreeMap::new();
        params.insert(
            "embeddings.word_embeddings.weight".to_string(),
            Param::Float(Tensor::zeros((vocab_size, hidden_size), DType::F32, &device)?),
        );
        params.insert(
            "encoder.dense.weight".to_string(),
            Param::Float(Tensor::zeros((hidden_size, hidden_size), DType::F32, &device)?),
        );
        params.insert(
            "encoder.dense.bias".to_string(),
            Param::Float(Tensor::zeros(hidden_size, DType::F32, &device)?),
        );
        let head_name = head.module_name();
        params.insert(
            format!("{head_name}.weight"),
            Param::Float(Tensor::zeros((head_out, hidden_size), DType::F32, &device)?),
        );
        params.insert(
            format!("{head_name}.bias"),
            Param::Float(Tensor::zeros(head_out, DType::F32, &device)?),
        );

        let modules = vec![
            ModuleSpec {
                name: "embeddings.word_embeddings".to_string(),
                kind: ModuleKind::Embedding,
            },
            ModuleSpec {
                name: "encoder.dense".to_string(),
                kind: ModuleKind::Linear,
            },
            ModuleSpec {
                name: head_name.to_string(),
                kind: ModuleKind::Linear,
            },
        ];

        Ok(Self {
            name_or_path: None,
            config,
            head,
            vocab_size,
            hidden_size,
            num_labels,
            params,
            modules,
            input_names: vec![
                "input_ids".to_string(),
                "attention_mask".to_string(),
                "labels".to_string(),
            ],
            training: false,
            exporter: None,
            device,
        })
    }

    pub fn with_name(mut self, name_or_path: &str) -> Self {
        self.name_or_path = Some(name_or_path.to_string());
        self
    }

    pub fn name_or_path(&self) -> Option<&str> {
        self.name_or_path.as_deref()
    }

    pub fn config(&self) -> Option<&ModelConfig> {
        self.config.as_ref()
    }

    pub fn head(&self) -> TaskHead {
        self.head
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// forward 시그니처 컬럼 (호출 시그니처 인트로스펙션에 해당)
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn modules(&self) -> &[ModuleSpec] {
        &self.modules
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn set_onnx_exporter(&mut self, exporter: Arc<dyn OnnxExporter>) {
        self.exporter = Some(exporter);
    }

    pub fn onnx_exporter(&self) -> Option<&Arc<dyn OnnxExporter>> {
        self.exporter.as_ref()
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.get(name)
    }

    pub fn param_names(&self) -> Vec<String> {
        self.params.keys().cloned().collect()
    }

    pub fn set_param(&mut self, name: &str, param: Param) {
        self.params.insert(name.to_string(), param);
    }

    pub fn remove_param(&mut self, name: &str) -> Option<Param> {
        self.params.remove(name)
    }

    fn param_tensor(&self, name: &str) -> Result<Tensor> {
        let param = self
            .params
            .get(name)
            .with_context(|| format!("parameter `{name}` not found"))?;
        param.to_tensor(&self.device)
    }

    /// 테스트/데모용 결정적 가중치 초기화
    pub fn randomize(&mut self, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        let names: Vec<String> = self.params.keys().cloned().collect();
        for name in names {
            if let Some(Param::Float(t)) = self.params.get(&name) {
                let shape = t.dims().to_vec();
                let count = shape.iter().product::<usize>();
                let data: Vec<f32> = (0..count).map(|_| rng.gen_range(-0.1f32..0.1f32)).collect();
                let tensor = Tensor::from_vec(data, shape, &self.device)?;
                self.params.insert(name, Param::Float(tensor));
            }
        }
        Ok(())
    }

    /// 상태 사전 추출
    pub fn state_dict(&self) -> Result<StateDict> {
        let mut state = StateDict::new();
        for (name, param) in &self.params {
            let saved = match param {
                Param::Float(t) => SavedTensor::Float {
                    shape: t.dims().to_vec(),
                    data: t.flatten_all()?.to_vec1::<f32>()?,
                },
                Param::Quantized(q) => SavedTensor::Quantized {
                    dtype: q.dtype,
                    rows: q.rows,
                    cols: q.cols,
                    data: q.data.clone(),
                },
            };
            state.insert(name.clone(), saved);
        }
        Ok(state)
    }

    pub(crate) fn set_param_from_saved(&mut self, name: &str, saved: &SavedTensor) -> Result<()> {
        match saved {
            SavedTensor::Float { shape, data } => {
                let tensor = Tensor::from_vec(data.clone(), shape.clone(), &self.device)?;
                self.params.insert(name.to_string(), Param::Float(tensor));
            }
            SavedTensor::Quantized { dtype, rows, cols, data } => {
                self.params.insert(
                    name.to_string(),
                    Param::Quantized(QuantizedParam {
                        dtype: *dtype,
                        rows: *rows,
                        cols: *cols,
                        data: data.clone(),
                    }),
                );
            }
            SavedTensor::Config(_) => {
                bail!("`{name}` holds a configuration entry, not a tensor")
            }
        }
        Ok(())
    }

    /// 상태 사전 로드
    ///
    /// 슬롯 종류(float/양자화)가 일치하지 않아도 저장된 쪽으로 교체한다.
    /// 모드에 따라 누락/잉여 키를 오류로 만들거나 경고로 낮춘다.
    pub fn load_state_dict(&mut self, state: &StateDict, mode: LoadMode<'_>) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        for (name, saved) in state {
            if matches!(saved, SavedTensor::Config(_)) {
                report.unexpected.push(name.clone());
                continue;
            }
            if self.params.contains_key(name) {
                self.set_param_from_saved(name, saved)?;
            } else {
                report.unexpected.push(name.clone());
            }
        }
        for name in self.params.keys() {
            if !state.contains_key(name) {
                report.missing.push(name.clone());
            }
        }

        match mode {
            LoadMode::Strict => {
                if !report.missing.is_empty() || !report.unexpected.is_empty() {
                    bail!(
                        "state dict mismatch: missing {:?}, unexpected {:?}",
                        report.missing,
                        report.unexpected
                    );
                }
            }
            LoadMode::NonStrict => {
                if !report.missing.is_empty() {
                    log::warn!("missing keys while loading state dict: {:?}", report.missing);
                }
                if !report.unexpected.is_empty() {
                    log::warn!(
                        "unexpected keys while loading state dict: {:?}",
                        report.unexpected
                    );
                }
            }
            LoadMode::AllowList(allow) => {
                let missing: Vec<String> = report
                    .missing
                    .iter()
                    .filter(|k| !LoadAllowList::matches(&allow.ignore_missing, k))
                    .cloned()
                    .collect();
                let unexpected: Vec<String> = report
                    .unexpected
                    .iter()
                    .filter(|k| !LoadAllowList::matches(&allow.ignore_unexpected, k))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    log::warn!("missing keys while loading state dict: {missing:?}");
                }
                if !unexpected.is_empty() {
                    log::warn!("unexpected keys while loading state dict: {unexpected:?}");
                }
            }
        }

        Ok(report)
    }

    /// safetensors 파일에서 float 가중치 흡수
    pub fn load_float_weights(&mut self, path: &Path, mode: LoadMode<'_>) -> Result<LoadReport> {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open weights {}", path.display()))?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let st = safetensors::SafeTensors::deserialize(&mmap)
            .with_context(|| format!("failed to parse safetensors {}", path.display()))?;

        let mut state = StateDict::new();
        for name in st.names() {
            let view = st.tensor(name)?;
            let data = tensor_to_f32(view.data(), view.dtype())?;
            state.insert(
                name.to_string(),
                SavedTensor::Float {
                    shape: view.shape().to_vec(),
                    data,
                },
            );
        }
        self.load_state_dict(&state, mode)
    }

    /// 임베딩 파라미터를 연속 메모리 레이아웃으로 정리 (로드 후 마무리 단계)
    pub fn make_embeddings_contiguous(&mut self) -> Result<()> {
        let embedding_modules: Vec<String> = self
            .modules
            .iter()
            .filter(|m| m.kind == ModuleKind::Embedding)
            .map(|m| format!("{}.weight", m.name))
            .collect();
        for name in embedding_modules {
            if let Some(Param::Float(t)) = self.params.get(&name) {
                let contiguous = t.contiguous()?;
                self.params.insert(name, Param::Float(contiguous));
            }
        }
        Ok(())
    }

    /// forward 패스
    pub fn forward(&self, batch: &Batch) -> Result<ModelOutput> {
        let mut observations = None;
        self.forward_impl(batch, &mut observations)
    }

    /// 캘리브레이션 배치 실행: forward 후 관측자 버퍼 갱신
    pub fn calibrate_batch(&mut self, batch: &Batch) -> Result<ModelOutput> {
        let mut observations = Some(BTreeMap::new());
        let output = self.forward_impl(batch, &mut observations)?;
        if let Some(obs) = observations {
            for (module, (min_val, max_val)) in obs {
                self.update_observer(&module, min_val, max_val)?;
            }
        }
        Ok(output)
    }

    fn forward_impl(
        &self,
        batch: &Batch,
        observations: &mut Option<BTreeMap<String, (f32, f32)>>,
    ) -> Result<ModelOutput> {
        let input_ids = batch
            .get("input_ids")
            .context("batch is missing the `input_ids` column")?;
        let (b, t) = input_ids.dims2()?;

        // 임베딩 조회
        let emb = self.param_tensor("embeddings.word_embeddings.weight")?;
        let flat_ids = input_ids.to_dtype(DType::U32)?.flatten_all()?;
        let mut x = emb
            .index_select(&flat_ids, 0)?
            .reshape((b, t, self.hidden_size))?;

        // dense 인코더
        let x2 = x.reshape((b * t, self.hidden_size))?;
        let x2 = self.linear(&x2, "encoder.dense", observations)?.tanh()?;
        x = x2.reshape((b, t, self.hidden_size))?;

        // 어텐션 마스크 (없으면 전부 1)
        let mask = match batch.get("attention_mask") {
            Some(m) => m.to_dtype(DType::F32)?,
            None => Tensor::ones((b, t), DType::F32, &self.device)?,
        };

        let head_name = self.head.module_name();
        let logits = match self.head {
            TaskHead::SequenceClassification => {
                // 마스크 평균 풀링 후 분류
                let m3 = mask.unsqueeze(2)?;
                let summed = x.broadcast_mul(&m3)?.sum(1)?;
                let counts = mask.sum(1)?.clamp(1f32, f32::MAX)?.unsqueeze(1)?;
                let pooled = summed.broadcast_div(&counts)?;
                self.linear(&pooled, head_name, observations)?
            }
            TaskHead::TokenClassification
            | TaskHead::QuestionAnswering
            | TaskHead::CausalLM
            | TaskHead::MaskedLM => {
                let x2 = x.reshape((b * t, self.hidden_size))?;
                let y = self.linear(&x2, head_name, observations)?;
                let out_dim = y.dims2()?.1;
                y.reshape((b, t, out_dim))?
            }
        };

        Ok(ModelOutput { logits })
    }

    fn linear(
        &self,
        x: &Tensor,
        module: &str,
        observations: &mut Option<BTreeMap<String, (f32, f32)>>,
    ) -> Result<Tensor> {
        if let Some(obs) = observations.as_mut() {
            if self.params.contains_key(&format!("{module}.observer.min_val")) {
                let values = x.flatten_all()?.to_vec1::<f32>()?;
                let mut min_val = f32::INFINITY;
                let mut max_val = f32::NEG_INFINITY;
                for v in values {
                    min_val = min_val.min(v);
                    max_val = max_val.max(v);
                }
                let entry = obs
                    .entry(module.to_string())
                    .or_insert((f32::INFINITY, f32::NEG_INFINITY));
                entry.0 = entry.0.min(min_val);
                entry.1 = entry.1.max(max_val);
            }
        }

        let w = self.param_tensor(&format!("{module}.weight"))?;
        let mut y = x.matmul(&w.t()?)?;
        if let Some(bias) = self.params.get(&format!("{module}.bias")) {
            y = y.broadcast_add(&bias.to_tensor(&self.device)?)?;
        }
        Ok(y)
    }

    fn update_observer(&mut self, module: &str, min_val: f32, max_val: f32) -> Result<()> {
        let min_key = format!("{module}.observer.min_val");
        let max_key = format!("{module}.observer.max_val");
        let current_min = match self.params.get(&min_key) {
            Some(p) => p.to_tensor(&self.device)?.to_vec1::<f32>()?[0],
            None => return Ok(()),
        };
        let current_max = match self.params.get(&max_key) {
            Some(p) => p.to_tensor(&self.device)?.to_vec1::<f32>()?[0],
            None => return Ok(()),
        };
        // 첫 배치 전의 초기값(0,0)은 관측으로 덮어쓴다
        let initialized = current_min != 0.0 || current_max != 0.0;
        let new_min = if initialized { current_min.min(min_val) } else { min_val };
        let new_max = if initialized { current_max.max(max_val) } else { max_val };
        self.params.insert(
            min_key,
            Param::Float(Tensor::from_vec(vec![new_min], 1, &self.device)?),
        );
        self.params.insert(
            max_key,
            Param::Float(Tensor::from_vec(vec![new_max], 1, &self.device)?),
        );
        Ok(())
    }
}

/// safetensors 바이트를 f32로 변환
pub fn tensor_to_f32(bytes: &[u8], dtype: safetensors::Dtype) -> Result<Vec<f32>> {
    use safetensors::Dtype;
    Ok(match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|chunk| {
                let bits = u16::from_le_bytes([chunk[0], chunk[1]]);
                f16::from_bits(bits).to_f32()
            })
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|chunk| {
                let bits = u16::from_le_bytes([chunk[0], chunk[1]]);
                bf16::from_bits(bits).to_f32()
            })
            .collect(),
        other => bail!("unsupported dtype {other:?}"),
    })
}
