use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::calibration::{CalibrationDataset, Example};

/// 컬럼 이름 → 텐서 배치
pub type Batch = BTreeMap<String, Tensor>;

/// 배치 구성 함수
pub type DataCollator = Box<dyn Fn(&[Example]) -> Result<Batch>>;

/// 캘리브레이션 데이터로더
///
/// 배치 순서는 생성 시점에 시드로 한 번만 뽑는다. 따라서 몇 번을 순회해도
/// 같은 배치가 같은 순서로 나온다. 마지막 부분 배치는 버리지 않는다.
pub struct CalibrationDataLoader {
    dataset: CalibrationDataset,
    batch_size: usize,
    order: Vec<usize>,
    collator: DataCollator,
}

impl CalibrationDataLoader {
    pub fn new(
        dataset: CalibrationDataset,
        batch_size: usize,
        seed: u64,
        collator: Option<DataCollator>,
    ) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch_size must be positive");
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        order.shuffle(&mut rng);
        Ok(Self {
            dataset,
            batch_size,
            order,
            collator: collator.unwrap_or_else(|| Box::new(default_collator)),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    pub fn column_names(&self) -> &[String] {
        self.dataset.column_names()
    }

    /// 샘플 순서 (검증용)
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// 재시작 가능한 배치 이터레이터
    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            loader: self,
            cursor: 0,
        }
    }
}

/// 배치 이터레이터
pub struct BatchIter<'a> {
    loader: &'a CalibrationDataLoader,
    cursor: usize,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.loader.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.loader.order.len());
        let rows: Vec<Example> = self.loader.order[self.cursor..end]
            .iter()
            .map(|&i| self.loader.dataset.rows()[i].clone())
            .collect();
        self.cursor = end;
        Some((self.loader.collator)(&rows))
    }
}

/// 기본 배치 구성 함수
///
/// 정수 스칼라/배열은 I64, 실수는 F32 텐서로 쌓는다. 배열 컬럼은 배치 안에서
/// 길이가 같아야 한다 (패딩은 전처리 단계 책임).
pub fn default_collator(rows: &[Example]) -> Result<Batch> {
    let device = Device::Cpu;
    let mut batch = Batch::new();
    if rows.is_empty() {
        return Ok(batch);
    }

    let first = &rows[0];
    for (column, sample) in first.iter() {
        match sample {
            serde_json::Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    let values = collect_scalars_i64(rows, column)?;
                    batch.insert(
                        column.clone(),
                        Tensor::from_vec(values, rows.len(), &device)?,
                    );
                } else {
                    let values = collect_scalars_f32(rows, column)?;
                    batch.insert(
                        column.clone(),
                        Tensor::from_vec(values, rows.len(), &device)?,
                    );
                }
            }
            serde_json::Value::Array(arr) => {
                let width = arr.len();
                let is_float = arr.iter().any(|v| v.is_f64() && !v.is_i64());
                if is_float {
                    let values = collect_arrays_f32(rows, column, width)?;
                    batch.insert(
                        column.clone(),
                        Tensor::from_vec(values, (rows.len(), width), &device)?,
                    );
                } else {
                    let values = collect_arrays_i64(rows, column, width)?;
                    batch.insert(
                        column.clone(),
                        Tensor::from_vec(values, (rows.len(), width), &device)?,
                    );
                }
            }
            other => bail!("column `{column}` has unsupported value {other} for collation"),
        }
    }
    Ok(batch)
}

fn collect_scalars_i64(rows: &[Example], column: &str) -> Result<Vec<i64>> {
    rows.iter()
        .map(|row| {
            row.get(column)
                .and_then(|v| v.as_i64())
                .with_context(|| format!("column `{column}` is not an integer in every row"))
        })
        .collect()
}

fn collect_scalars_f32(rows: &[Example], column: &str) -> Result<Vec<f32>> {
    rows.iter()
        .map(|row| {
            row.get(column)
                .and_then(|v| v.as_f64())
                .map(|v| v as f32)
                .with_context(|| format!("column `{column}` is not a number in every row"))
        })
        .collect()
}

fn collect_arrays_i64(rows: &[Example], column: &str, width: usize) -> Result<Vec<i64>> {
    let mut out = Vec::with_capacity(rows.len() * width);
    for row in rows {
        let arr = row
            .get(column)
            .and_then(|v| v.as_array())
            .with_context(|| format!("column `{column}` is not an array in every row"))?;
        if arr.len() != width {
            bail!(
                "column `{column}` has ragged lengths in a batch ({} vs {width}); \
                 pad sequences in the preprocessing step",
                arr.len()
            );
        }
        for v in arr {
            out.push(
                v.as_i64()
                    .with_context(|| format!("column `{column}` holds a non-integer value"))?,
            );
        }
    }
    Ok(out)
}

fn collect_arrays_f32(rows: &[Example], column: &str, width: usize) -> Result<Vec<f32>> {
    let mut out = Vec::with_capacity(rows.len() * width);
    for row in rows {
        let arr = row
            .get(column)
            .and_then(|v| v.as_array())
            .with_context(|| format!("column `{column}` is not an array in every row"))?;
        if arr.len() != width {
            bail!(
                "column `{column}` has ragged lengths in a batch ({} vs {width}); \
                 pad sequences in the preprocessing step",
                arr.len()
            );
        }
        for v in arr {
            out.push(
                v.as_f64()
                    .with_context(|| format!("column `{column}` holds a non-number value"))?
                    as f32,
            );
        }
    }
    Ok(out)
}
