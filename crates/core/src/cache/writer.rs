//! Parquet read/write helpers shared by every exported table (§4.8).

use std::fs;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{BooleanArray, Int32Array, Int64Array, StringArray};
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::error::{MsgVaultError, Result};

pub fn write_parquet_file(path: &Path, schema: Arc<Schema>, batch: RecordBatch) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)
        .map_err(|e| MsgVaultError::Other(anyhow::anyhow!("parquet writer init failed: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| MsgVaultError::Other(anyhow::anyhow!("parquet write failed: {e}")))?;
    writer
        .close()
        .map_err(|e| MsgVaultError::Other(anyhow::anyhow!("parquet close failed: {e}")))?;
    Ok(())
}

/// Reads every `*.parquet` file directly under `dir` (non-recursive,
/// matching the read side's "glob `*.parquet` to read all shards"
/// requirement in §4.8) and concatenates their batches.
pub fn read_parquet_dir(dir: &Path) -> Result<Vec<RecordBatch>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut batches = Vec::new();
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
        .collect();
    paths.sort();
    for path in paths {
        let file = fs::File::open(&path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| MsgVaultError::Other(anyhow::anyhow!("parquet reader init failed for {path:?}: {e}")))?
            .build()
            .map_err(|e| MsgVaultError::Other(anyhow::anyhow!("parquet reader build failed for {path:?}: {e}")))?;
        for batch in reader {
            batches.push(batch.map_err(|e| MsgVaultError::Other(anyhow::anyhow!("parquet read failed: {e}")))?);
        }
    }
    Ok(batches)
}

pub fn col_i64(batch: &RecordBatch, name: &str) -> Vec<Option<i64>> {
    let col = batch.column_by_name(name).expect("column present per schema");
    let arr = col.as_any().downcast_ref::<Int64Array>().expect("column is Int64");
    (0..arr.len()).map(|i| if arr.is_null(i) { None } else { Some(arr.value(i)) }).collect()
}

pub fn col_i32(batch: &RecordBatch, name: &str) -> Vec<Option<i32>> {
    let col = batch.column_by_name(name).expect("column present per schema");
    let arr = col.as_any().downcast_ref::<Int32Array>().expect("column is Int32");
    (0..arr.len()).map(|i| if arr.is_null(i) { None } else { Some(arr.value(i)) }).collect()
}

pub fn col_str(batch: &RecordBatch, name: &str) -> Vec<Option<String>> {
    let col = batch.column_by_name(name).expect("column present per schema");
    let arr = col.as_any().downcast_ref::<StringArray>().expect("column is Utf8");
    (0..arr.len()).map(|i| if arr.is_null(i) { None } else { Some(arr.value(i).to_string()) }).collect()
}

pub fn col_bool(batch: &RecordBatch, name: &str) -> Vec<Option<bool>> {
    let col = batch.column_by_name(name).expect("column present per schema");
    let arr = col.as_any().downcast_ref::<BooleanArray>().expect("column is Boolean");
    (0..arr.len()).map(|i| if arr.is_null(i) { None } else { Some(arr.value(i)) }).collect()
}
