//! run_code 工具：执行模型生成的分析代码
//!
//! 代码包进固定前导（数据集路径变量、非交互绘图后端、收尾保存图表）后交给沙箱。
//! 执行出错是回传 LLM 的正常观察结果，不是工具契约失败；图表与结构化产物
//! 从约定文件名 result.png / result.json 收集。

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::event::AgentEvent;
use crate::sandbox::ExecStatus;
use crate::state::{Artifact, ImageRecord, TaskStatus};
use crate::tools::{Tool, ToolContext, ToolOutput};

/// 回传 LLM 的 stdout 上限（字符）
const STDOUT_FOR_LLM: usize = 2000;
/// 回传 LLM 的 stderr 上限（字符）
const STDERR_FOR_LLM: usize = 500;
/// tool_result 事件里的 stdout 预览上限（字符）
const STDOUT_PREVIEW: usize = 500;

/// 代码执行工具。wrap_python=false 时源码原样执行（测试用 sh 剖面）
pub struct RunCodeTool {
    wrap_python: bool,
}

impl Default for RunCodeTool {
    fn default() -> Self {
        Self { wrap_python: true }
    }
}

impl RunCodeTool {
    pub fn raw() -> Self {
        Self { wrap_python: false }
    }

    /// 固定前导 + 用户代码 + 图表收尾。数据集在 cwd 的约定名 dataset.<ext>。
    fn wrap(&self, code: &str, dataset_name: &str) -> String {
        if !self.wrap_python {
            return code.to_string();
        }
        let indented: String = code
            .lines()
            .map(|l| format!("    {}", l))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            r#"import os
import traceback

DATASET_PATH = "{dataset}"
os.environ["DATASET_PATH"] = DATASET_PATH

import matplotlib
matplotlib.use("Agg")

import pandas as pd
import numpy as np
import matplotlib.pyplot as plt
import warnings
warnings.filterwarnings("ignore")

plt.rcParams["font.sans-serif"] = ["SimHei", "Arial Unicode MS", "DejaVu Sans"]
plt.rcParams["axes.unicode_minus"] = False

try:
{indented}
except Exception:
    traceback.print_exc()
    raise SystemExit(1)

if plt.get_fignums():
    plt.savefig("result.png", dpi=150, bbox_inches="tight")
"#,
            dataset = dataset_name,
            indented = indented
        )
    }
}

#[async_trait]
impl Tool for RunCodeTool {
    fn name(&self) -> &str {
        "run_code"
    }

    fn description(&self) -> &str {
        "执行 Python 代码进行数据分析。使用 pandas 处理数据（路径在 DATASET_PATH），matplotlib 绘图，图表保存到 result.png，结构化结果写入 result.json，关键发现 print 到 stdout。"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "要执行的 Python 代码"
                },
                "description": {
                    "type": "string",
                    "description": "代码功能描述"
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(
        &self,
        ctx: &mut ToolContext<'_>,
        args: Value,
    ) -> Result<ToolOutput, AgentError> {
        let code = args.get("code").and_then(|v| v.as_str()).unwrap_or("");
        let description = args
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if code.trim().is_empty() {
            return Err(AgentError::InvalidInput("code must not be empty".into()));
        }

        let iteration = ctx.state.iteration;
        let current_task = ctx
            .state
            .tasks()
            .iter()
            .find(|t| t.status == TaskStatus::InProgress)
            .map(|t| (t.id, t.name.clone()));
        let task_id = current_task.as_ref().map(|(id, _)| *id);

        ctx.bus.emit(AgentEvent::CodeGenerated {
            task_id,
            code: code.to_string(),
            description: description.clone(),
            iteration,
        });

        let ext = ctx
            .state
            .dataset_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("csv");
        let dataset_name = format!("dataset.{}", ext);
        let wrapped = self.wrap(code, &dataset_name);

        let dataset_path = ctx.state.dataset_path.clone();
        let outcome = ctx
            .sandbox
            .execute(&wrapped, Some(&dataset_path), ctx.cancel)
            .await?;

        let has_image = outcome.image.is_some();
        let has_result = outcome.result_json.is_some();
        if let Some(bytes) = &outcome.image {
            let image_base64 = base64::engine::general_purpose::STANDARD.encode(bytes);
            ctx.state.push_image(ImageRecord {
                iteration,
                task_id,
                description: description.clone(),
                image_base64: image_base64.clone(),
            })?;
            ctx.bus.emit(AgentEvent::ImageGenerated {
                task_id,
                task_name: current_task
                    .as_ref()
                    .map(|(_, n)| n.clone())
                    .unwrap_or_default(),
                image_base64,
                iteration,
            });
        }

        ctx.state.append_artifact(Artifact {
            iteration,
            description,
            status: outcome.status.as_str().to_string(),
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
            exit_code: outcome.exit_code,
            image: outcome.image,
            result: outcome.result_json.clone(),
        })?;

        let payload = json!({
            "status": outcome.status.as_str(),
            "stdout": truncate(&outcome.stdout, STDOUT_FOR_LLM),
            "stderr": truncate(&outcome.stderr, STDERR_FOR_LLM),
            "has_image": has_image,
            "has_result": has_result,
            "result": outcome.result_json,
        });

        Ok(ToolOutput {
            payload: serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string()),
            status: match outcome.status {
                ExecStatus::Success => "success",
                ExecStatus::Error => "error",
                ExecStatus::Timeout => "timeout",
            }
            .to_string(),
            stdout_preview: truncate(&outcome.stdout, STDOUT_PREVIEW),
            has_image,
        })
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
