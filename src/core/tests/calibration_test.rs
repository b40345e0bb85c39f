use std::io::Write;

use serde_json::json;

use super::sample_rows;
use crate::core::calibration::{CalibrationDataset, Preprocess};

#[test]
fn test_column_union_preserves_first_seen_order() {
    let dataset = CalibrationDataset::from_rows(sample_rows(3));
    assert_eq!(
        dataset.column_names(),
        &["input_ids", "attention_mask", "labels", "text"]
    );
}

#[test]
fn test_shuffle_is_deterministic() {
    let dataset = CalibrationDataset::from_rows(sample_rows(20));

    let a = dataset.shuffle(42);
    let b = dataset.shuffle(42);
    assert_eq!(a.rows(), b.rows());

    let c = dataset.shuffle(43);
    assert_ne!(a.rows(), c.rows());

    // 원본은 그대로
    assert_eq!(dataset.rows(), CalibrationDataset::from_rows(sample_rows(20)).rows());
}

#[test]
fn test_shuffle_then_select_prefix_is_reproducible() {
    let dataset = CalibrationDataset::from_rows(sample_rows(30));
    let a = dataset.shuffle(42).select(10);
    let b = dataset.shuffle(42).select(10);
    assert_eq!(a.rows(), b.rows());
    assert_eq!(a.len(), 10);
}

#[test]
fn test_select_clamps_to_dataset_size() {
    let dataset = CalibrationDataset::from_rows(sample_rows(5));
    assert_eq!(dataset.select(300).len(), 5);
}

#[test]
fn test_map_per_example() {
    let dataset = CalibrationDataset::from_rows(sample_rows(4));
    let add_marker = |mut example: crate::core::calibration::Example| {
        example.insert("marker".to_string(), json!(1));
        example
    };
    let mapped = dataset.map(&Preprocess::PerExample(&add_marker));
    assert_eq!(mapped.len(), 4);
    assert!(mapped.column_names().contains(&"marker".to_string()));
    assert!(mapped.column_names().contains(&"input_ids".to_string()));
}

#[test]
fn test_map_batched() {
    let dataset = CalibrationDataset::from_rows(sample_rows(4));
    let drop_half = |rows: Vec<crate::core::calibration::Example>| {
        rows.into_iter().take(2).collect::<Vec<_>>()
    };
    let mapped = dataset.map(&Preprocess::Batched(&drop_half));
    assert_eq!(mapped.len(), 2);
}

#[test]
fn test_remove_columns() {
    let dataset = CalibrationDataset::from_rows(sample_rows(3));
    let trimmed = dataset.remove_columns(&["text".to_string()]);
    assert!(!trimmed.column_names().contains(&"text".to_string()));
    assert!(trimmed.rows().iter().all(|row| !row.contains_key("text")));
    assert_eq!(trimmed.len(), 3);
}

#[test]
fn test_from_jsonl() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{}", json!({"input_ids": [1, 2], "labels": 0})).unwrap();
    writeln!(file).unwrap();
    writeln!(file, "{}", json!({"input_ids": [3, 4], "labels": 1})).unwrap();

    let dataset = CalibrationDataset::from_jsonl(file.path()).unwrap();
    assert_eq!(dataset.len(), 2);
    assert_eq!(dataset.column_names(), &["input_ids", "labels"]);
}

#[test]
fn test_from_jsonl_rejects_non_object_rows() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[1, 2, 3]").unwrap();
    assert!(CalibrationDataset::from_jsonl(file.path()).is_err());
}
