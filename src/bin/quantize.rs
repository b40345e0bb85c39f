use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tokenizers::Tokenizer;

use quant_llm::core::{
    CalibrationDataset, CalibrationDatasetOptions, ConfigSource, Example, FrameworkTarget,
    LoadMode, ModelConfig, Preprocess, QuantApproach, QuantizationConfig, Quantizer,
    QuantizeOptions, QuantizerOptions, TaskKind,
};
use quant_llm::core::{build_model, translate_config, LoadAllowList};

/// 로컬 트랜스포머 모델 양자화 CLI
#[derive(Parser, Debug)]
#[command(name = "quantize", about = "트랜스포머 모델 양자화 도구")]
struct Args {
    /// 모델 디렉토리 (config.json + model.safetensors)
    #[arg(long)]
    model: PathBuf,

    /// 저장 디렉토리
    #[arg(long, default_value = "./quantized_model")]
    out: PathBuf,

    /// 양자화 방식 (post_training_dynamic_quant | post_training_static_quant | quant_aware_training)
    #[arg(long, default_value = "post_training_dynamic_quant")]
    approach: String,

    /// 프레임워크 타깃 (eager | graph)
    #[arg(long, default_value = "eager")]
    framework: String,

    /// 양자화 설정 파일 (JSON 또는 레거시 YAML, 지정 시 approach/framework 무시)
    #[arg(long)]
    config: Option<PathBuf>,

    /// 캘리브레이션 데이터셋 (허브 이름 또는 로컬 .jsonl 경로)
    #[arg(long)]
    dataset: Option<String>,

    /// 데이터셋 구성 이름
    #[arg(long)]
    dataset_config: Option<String>,

    /// 데이터셋 분할
    #[arg(long, default_value = "train")]
    split: String,

    /// 캘리브레이션 샘플 수
    #[arg(long, default_value_t = 100)]
    samples: usize,

    /// 캘리브레이션 배치 크기
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// 토크나이징할 텍스트 컬럼
    #[arg(long, default_value = "text")]
    text_column: String,

    /// tokenizer.json 경로 (기본: 모델 디렉토리 안)
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// 토큰 최대 길이
    #[arg(long, default_value_t = 128)]
    max_length: usize,

    /// 캘리브레이션 셔플 시드
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    println!("=== 모델 양자화 시작 ===");
    println!("모델 경로: {}", args.model.display());

    // 모델 구성
    let config_path = args.model.join("config.json");
    let model_config = if config_path.exists() {
        Some(ModelConfig::from_file(&config_path)?)
    } else {
        println!("⚠️  config.json 없음, 기본 구성 사용");
        None
    };
    let task = model_config
        .as_ref()
        .and_then(|c| TaskKind::from_architectures(&c.architectures()))
        .unwrap_or(TaskKind::SequenceClassification);
    println!("태스크: {}", task);

    let mut model = build_model(task, model_config)?
        .with_name(&args.model.display().to_string());
    let weights_path = args.model.join("model.safetensors");
    if weights_path.exists() {
        let allow = LoadAllowList::quantized_default();
        model.load_float_weights(&weights_path, LoadMode::AllowList(&allow))?;
        println!("✅ 가중치 로드 완료: {}", weights_path.display());
    } else {
        println!("⚠️  model.safetensors 없음, 0 초기화 가중치로 진행");
    }

    // 양자화 설정
    let source = match &args.config {
        Some(path) => ConfigSource::File(path.clone()),
        None => {
            let approach: QuantApproach = args.approach.parse()?;
            let framework: FrameworkTarget = args.framework.parse()?;
            ConfigSource::Inline(QuantizationConfig {
                approach,
                framework,
                ..Default::default()
            })
        }
    };
    let conf = translate_config(&source, None)?;

    let mut quantizer = Quantizer::from_pretrained(
        model,
        QuantizerOptions {
            seed: args.seed,
            task: Some(task),
            ..Default::default()
        },
    );

    // 캘리브레이션 데이터셋 (정적 방식)
    let tokenizer_path = args
        .tokenizer
        .clone()
        .unwrap_or_else(|| args.model.join("tokenizer.json"));
    let calibration_dataset = if conf.approach() == QuantApproach::Static {
        let dataset_name = args
            .dataset
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("정적 양자화에는 --dataset이 필요합니다"))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("토크나이저 로드 실패: {:?}", e))?;
        println!("✅ 토크나이저 로드 완료: {} 어휘", tokenizer.get_vocab_size(false));

        let text_column = args.text_column.clone();
        let max_length = args.max_length;
        let tokenize = move |mut example: Example| -> Example {
            let text = example
                .get(&text_column)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            match tokenizer.encode(text, true) {
                Ok(encoding) => {
                    let mut ids: Vec<i64> =
                        encoding.get_ids().iter().map(|&id| id as i64).collect();
                    ids.truncate(max_length);
                    // 배치 안에서 길이를 맞추기 위해 고정 길이로 패딩
                    while ids.len() < max_length {
                        ids.push(0);
                    }
                    let mask: Vec<i64> = ids.iter().map(|&id| (id != 0) as i64).collect();
                    example.insert("input_ids".to_string(), json!(ids));
                    example.insert("attention_mask".to_string(), json!(mask));
                }
                Err(e) => log::warn!("tokenization failed, keeping raw row: {e:?}"),
            }
            if let Some(label) = example.remove("label") {
                example.insert("labels".to_string(), label);
            }
            example
        };

        let dataset = if dataset_name.ends_with(".jsonl") {
            let raw = CalibrationDataset::from_jsonl(std::path::Path::new(dataset_name))?;
            let sampled = raw.shuffle(args.seed).select(args.samples);
            sampled.map(&Preprocess::PerExample(&tokenize))
        } else {
            quantizer.get_calibration_dataset(
                dataset_name,
                CalibrationDatasetOptions {
                    num_samples: Some(args.samples),
                    dataset_config_name: args.dataset_config.clone(),
                    dataset_split: args.split.clone(),
                    preprocess: Some(Preprocess::PerExample(&tokenize)),
                    use_auth_token: false,
                },
            )?
        };
        println!("✅ 캘리브레이션 데이터셋: {} 샘플", dataset.len());
        Some(dataset)
    } else {
        None
    };

    quantizer.quantize(
        &args.out,
        &conf,
        calibration_dataset.as_ref(),
        QuantizeOptions {
            batch_size: args.batch_size,
            ..Default::default()
        },
    )?;

    println!("=== 양자화 완료 ===");
    println!("저장 경로: {}", args.out.display());
    Ok(())
}
