use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use hf_hub::RepoType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::hub::{self, HubOptions};

/// 이름 붙은 컬럼을 가진 예제 한 건
pub type Example = serde_json::Map<String, serde_json::Value>;

/// 전처리 함수
pub enum Preprocess<'a> {
    /// 예제 단위 적용
    PerExample(&'a dyn Fn(Example) -> Example),
    /// 배치 단위 적용
    Batched(&'a dyn Fn(Vec<Example>) -> Vec<Example>),
}

/// 캘리브레이션 데이터셋
///
/// 순서가 고정된 유한 예제 시퀀스. 셔플/선택/매핑은 모두 새 데이터셋을 돌려주고
/// 원본은 그대로 둔다.
#[derive(Debug, Clone)]
pub struct CalibrationDataset {
    rows: Vec<Example>,
    columns: Vec<String>,
}

impl CalibrationDataset {
    pub fn from_rows(rows: Vec<Example>) -> Self {
        let columns = column_union(&rows);
        Self { rows, columns }
    }

    /// JSON-lines 파일에서 읽기
    pub fn from_jsonl(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open dataset file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut rows = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(&line)
                .with_context(|| format!("invalid JSON at {}:{}", path.display(), i + 1))?;
            match value {
                serde_json::Value::Object(map) => rows.push(map),
                other => anyhow::bail!(
                    "expected a JSON object at {}:{}, got {other}",
                    path.display(),
                    i + 1
                ),
            }
        }
        Ok(Self::from_rows(rows))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Example] {
        &self.rows
    }

    pub fn get(&self, index: usize) -> Option<&Example> {
        self.rows.get(index)
    }

    /// 고정 시드 셔플 (같은 시드면 항상 같은 순서)
    pub fn shuffle(&self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut indices: Vec<usize> = (0..self.rows.len()).collect();
        indices.shuffle(&mut rng);
        let rows: Vec<Example> = indices.into_iter().map(|i| self.rows[i].clone()).collect();
        Self {
            rows,
            columns: self.columns.clone(),
        }
    }

    /// 앞에서부터 n개 선택 (데이터셋 크기로 클램프)
    pub fn select(&self, n: usize) -> Self {
        let n = n.min(self.rows.len());
        Self {
            rows: self.rows[..n].to_vec(),
            columns: self.columns.clone(),
        }
    }

    /// 전처리 적용 (컬럼 집합은 결과 기준으로 다시 계산)
    pub fn map(&self, preprocess: &Preprocess<'_>) -> Self {
        let rows = match preprocess {
            Preprocess::PerExample(f) => self.rows.iter().map(|r| f(r.clone())).collect(),
            Preprocess::Batched(f) => f(self.rows.clone()),
        };
        Self::from_rows(rows)
    }

    /// 지정 컬럼 제거
    pub fn remove_columns(&self, names: &[String]) -> Self {
        let drop: BTreeSet<&str> = names.iter().map(|s| s.as_str()).collect();
        let rows: Vec<Example> = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .filter(|(k, _)| !drop.contains(k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .collect();
        let columns = self
            .columns
            .iter()
            .filter(|c| !drop.contains(c.as_str()))
            .cloned()
            .collect();
        Self { rows, columns }
    }
}

fn column_union(rows: &[Example]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut columns = Vec::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.clone()) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

/// 허브 데이터셋 저장소에서 분할 파일을 받아 데이터셋 구성
///
/// `{config}/{split}.jsonl`, `{split}.jsonl`, `data/{split}.jsonl` 순으로 시도한다.
pub fn load_hub_dataset(
    dataset_name: &str,
    dataset_config_name: Option<&str>,
    dataset_split: &str,
    options: &HubOptions,
) -> Result<CalibrationDataset> {
    let mut candidates = Vec::new();
    if let Some(config) = dataset_config_name {
        candidates.push(format!("{config}/{dataset_split}.jsonl"));
    }
    candidates.push(format!("{dataset_split}.jsonl"));
    candidates.push(format!("data/{dataset_split}.jsonl"));

    let mut last_err = None;
    for filename in &candidates {
        match hub::fetch_file(dataset_name, RepoType::Dataset, filename, options) {
            Ok(path) => return CalibrationDataset::from_jsonl(&path),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("no split candidates for dataset `{dataset_name}`")))
}
