//! read_dataset 工具：读取数据集结构与预览
//!
//! 幂等；成功时发出 data_explored 事件，payload 为完整摘要。

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::dataset::summarize_dataset;
use crate::event::AgentEvent;
use crate::tools::{Tool, ToolContext, ToolOutput};

const DEFAULT_PREVIEW_ROWS: usize = 5;

/// 数据集读取工具
#[derive(Default)]
pub struct ReadDatasetTool;

#[async_trait]
impl Tool for ReadDatasetTool {
    fn name(&self) -> &str {
        "read_dataset"
    }

    fn description(&self) -> &str {
        "读取数据集，返回数据结构、统计信息和预览。分析开始时首先调用此工具了解数据。"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "preview_rows": {
                    "type": "integer",
                    "description": "预览行数，默认 5"
                },
                "sheet_name": {
                    "type": "string",
                    "description": "Excel Sheet 名称（仅对电子表格有效）"
                }
            },
            "required": []
        })
    }

    async fn execute(
        &self,
        ctx: &mut ToolContext<'_>,
        args: Value,
    ) -> Result<ToolOutput, AgentError> {
        if args.get("sheet_name").and_then(|v| v.as_str()).is_some() {
            // 内置读取器只支持分隔文本，sheet 参数对其无意义
            return Ok(ToolOutput::error(
                json!({
                    "status": "error",
                    "error": "INVALID_INPUT: sheet_name is only valid for spreadsheet formats"
                })
                .to_string(),
            ));
        }
        let preview_rows = args
            .get("preview_rows")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_PREVIEW_ROWS);

        let dataset_path = ctx.state.dataset_path.clone();
        match summarize_dataset(&dataset_path, preview_rows) {
            Ok(summary) => {
                ctx.bus.emit(AgentEvent::DataExplored {
                    summary: summary.clone(),
                });
                let payload = json!({
                    "status": "success",
                    "statistics": summary.statistics,
                    "schema": summary.schema,
                    "preview": summary.preview,
                });
                Ok(ToolOutput::success(
                    serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string()),
                ))
            }
            Err(e) => Ok(ToolOutput::error(
                json!({"status": "error", "error": format!("{}: {}", e.kind(), e)}).to_string(),
            )),
        }
    }
}
