//! 数据集读取与摘要
//!
//! 数据集解析是一个可替换的协作方：内置实现只覆盖分隔文本（CSV / TSV），
//! 返回行列数、逐列 dtype 与样例、缺失率和预览。电子表格等其它格式在上传时
//! 即被拒绝（UNSUPPORTED_FORMAT）。

use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};

use crate::core::AgentError;

/// 列摘要：dtype 命名沿用 pandas（int64 / float64 / object）
#[derive(Clone, Debug, Serialize)]
pub struct ColumnSummary {
    pub column: String,
    pub dtype: String,
    pub non_null_count: usize,
    pub null_count: usize,
    pub unique_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sample_values: Vec<String>,
}

/// 文件级统计
#[derive(Clone, Debug, Serialize)]
pub struct DatasetStatistics {
    pub total_rows: usize,
    pub total_columns: usize,
    pub missing_cells: usize,
    /// 0.0 - 100.0
    pub missing_percentage: f64,
}

/// 数据集摘要：data_explored 事件与 read_dataset 工具的载荷
#[derive(Clone, Debug, Serialize)]
pub struct DatasetSummary {
    pub file_path: String,
    pub format: String,
    pub statistics: DatasetStatistics,
    pub schema: Vec<ColumnSummary>,
    /// 前若干行，列名到原始值
    pub preview: Vec<Value>,
}

/// 读取数据集并生成摘要。幂等。
///
/// - 不存在的路径 → InvalidInput
/// - 不支持的扩展名 → UnsupportedFormat
pub fn summarize_dataset(path: &Path, preview_rows: usize) -> Result<DatasetSummary, AgentError> {
    if !path.exists() {
        return Err(AgentError::InvalidInput(format!(
            "dataset not found: {}",
            path.display()
        )));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let delimiter = match ext.as_str() {
        "csv" => b',',
        "tsv" => b'\t',
        other => {
            return Err(AgentError::UnsupportedFormat(format!(
                ".{} (supported: .csv, .tsv)",
                other
            )))
        }
    };

    let content = std::fs::read_to_string(path)
        .map_err(|e| AgentError::InvalidInput(format!("read {}: {}", path.display(), e)))?;
    let mut rows = parse_delimited(&content, delimiter);
    if rows.is_empty() {
        return Err(AgentError::InvalidInput("dataset is empty".to_string()));
    }
    let header = rows.remove(0);
    let n_cols = header.len();
    let n_rows = rows.len();

    let mut schema = Vec::with_capacity(n_cols);
    let mut missing_cells = 0usize;
    for (ci, name) in header.iter().enumerate() {
        let mut non_null = 0usize;
        let mut uniques: HashSet<&str> = HashSet::new();
        let mut numeric: Vec<f64> = Vec::new();
        let mut all_int = true;
        let mut all_numeric = true;
        let mut samples: Vec<String> = Vec::new();
        for row in &rows {
            let cell = row.get(ci).map(String::as_str).unwrap_or("");
            if cell.is_empty() {
                missing_cells += 1;
                continue;
            }
            non_null += 1;
            uniques.insert(cell);
            match cell.parse::<f64>() {
                Ok(v) => {
                    if cell.parse::<i64>().is_err() {
                        all_int = false;
                    }
                    numeric.push(v);
                }
                Err(_) => {
                    all_numeric = false;
                    if samples.len() < 3 && !samples.iter().any(|s| s == cell) {
                        samples.push(cell.to_string());
                    }
                }
            }
        }
        let dtype = if non_null == 0 {
            "object".to_string()
        } else if all_numeric && all_int {
            "int64".to_string()
        } else if all_numeric {
            "float64".to_string()
        } else {
            "object".to_string()
        };
        let (min, max, mean) = if all_numeric && !numeric.is_empty() {
            let min = numeric.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = numeric.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mean = numeric.iter().sum::<f64>() / numeric.len() as f64;
            (Some(min), Some(max), Some(mean))
        } else {
            (None, None, None)
        };
        schema.push(ColumnSummary {
            column: name.clone(),
            dtype,
            non_null_count: non_null,
            null_count: n_rows - non_null,
            unique_count: uniques.len(),
            min,
            max,
            mean,
            sample_values: samples,
        });
    }

    let preview = rows
        .iter()
        .take(preview_rows)
        .map(|row| {
            let mut obj = serde_json::Map::new();
            for (ci, name) in header.iter().enumerate() {
                let cell = row.get(ci).map(String::as_str).unwrap_or("");
                obj.insert(name.clone(), json!(cell));
            }
            Value::Object(obj)
        })
        .collect();

    let total_cells = n_rows * n_cols;
    Ok(DatasetSummary {
        file_path: path.display().to_string(),
        format: format!(".{}", ext),
        statistics: DatasetStatistics {
            total_rows: n_rows,
            total_columns: n_cols,
            missing_cells,
            missing_percentage: if total_cells == 0 {
                0.0
            } else {
                (missing_cells as f64 / total_cells as f64 * 10000.0).round() / 100.0
            },
        },
        schema,
        preview,
    })
}

/// 引号感知的分隔文本解析，支持引号内分隔符、转义引号与换行
fn parse_delimited(content: &str, delimiter: u8) -> Vec<Vec<String>> {
    let delim = delimiter as char;
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
        } else if c == '"' {
            in_quotes = true;
        } else if c == delim {
            row.push(std::mem::take(&mut field));
        } else if c == '\n' {
            row.push(std::mem::take(&mut field));
            if !(row.len() == 1 && row[0].is_empty()) {
                rows.push(std::mem::take(&mut row));
            } else {
                row.clear();
            }
        } else if c != '\r' {
            field.push(c);
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}
