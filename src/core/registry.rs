use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use once_cell::sync::Lazy;

use super::error::QuantError;
use super::model::{ModelConfig, TaskHead, TransformerModel};

/// 내보내기/구성에 쓰는 정규 태스크 이름
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskKind {
    SequenceClassification,
    TokenClassification,
    QuestionAnswering,
    CausalLM,
    MaskedLM,
    Seq2SeqLM,
    Default,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::SequenceClassification => "sequence-classification",
            TaskKind::TokenClassification => "token-classification",
            TaskKind::QuestionAnswering => "question-answering",
            TaskKind::CausalLM => "causal-lm",
            TaskKind::MaskedLM => "masked-lm",
            TaskKind::Seq2SeqLM => "seq2seq-lm",
            TaskKind::Default => "default",
        }
    }

    /// 허브 파이프라인 태그를 정규 태스크로 변환
    pub fn from_pipeline_tag(tag: &str) -> Option<TaskKind> {
        match tag {
            "sentiment-analysis" | "text-classification" | "zero-shot-classification"
            | "sequence-classification" => Some(TaskKind::SequenceClassification),
            "feature-extraction" | "fill-mask" | "default" => Some(TaskKind::Default),
            "token-classification" | "ner" => Some(TaskKind::TokenClassification),
            "question-answering" => Some(TaskKind::QuestionAnswering),
            "text-generation" | "causal-lm" => Some(TaskKind::CausalLM),
            "masked-lm" => Some(TaskKind::MaskedLM),
            "seq2seq-lm" | "translation" | "summarization" | "text2text-generation" => {
                Some(TaskKind::Seq2SeqLM)
            }
            _ => None,
        }
    }

    /// 아키텍처 이름(`...ForSequenceClassification` 등)에서 태스크 추론
    pub fn from_architectures(architectures: &[String]) -> Option<TaskKind> {
        for arch in architectures {
            if arch.ends_with("ForSequenceClassification") {
                return Some(TaskKind::SequenceClassification);
            }
            if arch.ends_with("ForTokenClassification") {
                return Some(TaskKind::TokenClassification);
            }
            if arch.ends_with("ForQuestionAnswering") {
                return Some(TaskKind::QuestionAnswering);
            }
            if arch.ends_with("ForCausalLM") || arch.ends_with("LMHeadModel") {
                return Some(TaskKind::CausalLM);
            }
            if arch.ends_with("ForMaskedLM") {
                return Some(TaskKind::MaskedLM);
            }
            if arch.ends_with("ForConditionalGeneration") {
                return Some(TaskKind::Seq2SeqLM);
            }
        }
        None
    }

    /// 시퀀스-투-시퀀스 계열인지
    pub fn is_seq2seq(&self) -> bool {
        matches!(self, TaskKind::Seq2SeqLM)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::from_pipeline_tag(s)
            .ok_or_else(|| QuantError::InvalidConfig(format!("unknown task `{s}`")))
    }
}

type Constructor = fn(Option<ModelConfig>) -> Result<TransformerModel>;

/// 태스크 → 생성자 매핑
///
/// 서브클래스 디스패치 대신 명시적 테이블로 기본 모델 생성자를 고른다.
static TASK_CONSTRUCTORS: Lazy<BTreeMap<TaskKind, Constructor>> = Lazy::new(|| {
    let mut map: BTreeMap<TaskKind, Constructor> = BTreeMap::new();
    map.insert(TaskKind::SequenceClassification, |c| {
        TransformerModel::new(TaskHead::SequenceClassification, c)
    });
    map.insert(TaskKind::TokenClassification, |c| {
        TransformerModel::new(TaskHead::TokenClassification, c)
    });
    map.insert(TaskKind::QuestionAnswering, |c| {
        TransformerModel::new(TaskHead::QuestionAnswering, c)
    });
    map.insert(TaskKind::CausalLM, |c| TransformerModel::new(TaskHead::CausalLM, c));
    map.insert(TaskKind::MaskedLM, |c| TransformerModel::new(TaskHead::MaskedLM, c));
    // feature-extraction 계열은 masked-lm 헤드 없이도 인코더 출력이 같아서 공유한다
    map.insert(TaskKind::Default, |c| TransformerModel::new(TaskHead::MaskedLM, c));
    map
});

/// 태스크에 맞는 기본 모델 인스턴스 생성
pub fn build_model(task: TaskKind, config: Option<ModelConfig>) -> Result<TransformerModel> {
    match TASK_CONSTRUCTORS.get(&task) {
        Some(constructor) => constructor(config),
        None => Err(QuantError::InvalidConfig(format!(
            "no model constructor registered for task `{task}`"
        ))
        .into()),
    }
}
