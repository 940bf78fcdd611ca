//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），
//! 由 ToolRegistry 按名注册与查找。调用前参数先过 schema 校验，类型不匹配以
//! INVALID_INPUT 拒绝并作为工具消息回传 LLM；每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::event::EventBus;
use crate::llm::ToolSpec;
use crate::sandbox::CodeSandbox;
use crate::state::SessionState;

/// 工具执行上下文：会话状态的可变引用由运行中的策略独占传入
pub struct ToolContext<'a> {
    pub state: &'a mut SessionState,
    pub bus: &'a EventBus,
    pub sandbox: &'a CodeSandbox,
    pub cancel: &'a CancellationToken,
}

/// 工具执行结果：payload 全文给 LLM，其余字段供 tool_result 事件使用
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub payload: String,
    /// success / error / timeout
    pub status: String,
    pub stdout_preview: String,
    pub has_image: bool,
}

impl ToolOutput {
    pub fn success(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            status: "success".to_string(),
            stdout_preview: String::new(),
            has_image: false,
        }
    }

    pub fn error(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            status: "error".to_string(),
            stdout_preview: String::new(),
            has_image: false,
        }
    }
}

/// 工具 trait：名称、描述与参数 schema（供 LLM 理解）、异步执行
///
/// execute 返回 Err 仅限基础设施故障与取消；LLM 可自行纠正的失败
/// （坏参数、执行出错）以 status="error" 的 ToolOutput 正常返回。
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, ctx: &mut ToolContext<'_>, args: Value) -> Result<ToolOutput, AgentError>;
}

/// 工具注册表：启动后只读
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 广告给 LLM 的工具 schema 列表
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// 调度一次工具调用：schema 校验 → 执行 → 审计日志。
    /// 未知工具与参数不合法均以 status="error" 返回（回传 LLM 自纠），
    /// Err 只在基础设施故障或取消时出现。
    pub async fn dispatch(
        &self,
        ctx: &mut ToolContext<'_>,
        name: &str,
        args: &Value,
    ) -> Result<ToolOutput, AgentError> {
        let start = Instant::now();
        let Some(tool) = self.get(name) else {
            return Ok(ToolOutput::error(format!(
                "{{\"status\":\"error\",\"error\":\"INVALID_INPUT: unknown tool {}\"}}",
                name
            )));
        };
        if let Err(e) = validate_args(&tool.parameters_schema(), args) {
            tracing::warn!(tool = name, error = %e, "tool argument validation failed");
            return Ok(ToolOutput::error(format!(
                "{{\"status\":\"error\",\"error\":\"{}: {}\"}}",
                e.kind(),
                e
            )));
        }

        let result = tool.execute(ctx, args.clone()).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        let (ok, outcome) = match &result {
            Ok(out) => (true, out.status.clone()),
            Err(e) => (false, e.kind().to_string()),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview(args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(out) => Ok(out),
            // 状态层面的拒绝（I1 违例等）同样回传 LLM
            Err(AgentError::InvalidState(msg)) => Ok(ToolOutput::error(format!(
                "{{\"status\":\"error\",\"error\":\"INVALID_STATE: {}\"}}",
                msg
            ))),
            Err(AgentError::InvalidInput(msg)) => Ok(ToolOutput::error(format!(
                "{{\"status\":\"error\",\"error\":\"INVALID_INPUT: {}\"}}",
                msg
            ))),
            Err(e) => Err(e),
        }
    }
}

/// 按 JSON Schema 校验参数：object 形状、required 字段、基本类型匹配
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), AgentError> {
    let Some(obj) = args.as_object() else {
        return Err(AgentError::InvalidInput(format!(
            "arguments must be a JSON object, got {}",
            type_name(args)
        )));
    };
    let properties = schema.get("properties").and_then(|p| p.as_object());
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Err(AgentError::InvalidInput(format!(
                    "missing required argument '{}'",
                    key
                )));
            }
        }
    }
    if let Some(props) = properties {
        for (key, value) in obj {
            let Some(prop) = props.get(key) else {
                continue; // 未声明的多余参数放行，由工具自行忽略
            };
            let Some(expected) = prop.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            let matches = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(AgentError::InvalidInput(format!(
                    "argument '{}' expects {}, got {}",
                    key,
                    expected,
                    type_name(value)
                )));
            }
        }
    }
    Ok(())
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string"},
                "preview_rows": {"type": "integer"},
                "merge": {"type": "boolean"},
            },
            "required": ["code"]
        })
    }

    #[test]
    fn test_validate_ok() {
        assert!(validate_args(&schema(), &json!({"code": "print(1)", "preview_rows": 5})).is_ok());
    }

    #[test]
    fn test_missing_required() {
        let err = validate_args(&schema(), &json!({"preview_rows": 5})).unwrap_err();
        assert_eq!(err.kind(), "INVALID_INPUT");
    }

    #[test]
    fn test_type_mismatch() {
        let err = validate_args(&schema(), &json!({"code": 42})).unwrap_err();
        assert!(err.to_string().contains("expects string"));
    }

    #[test]
    fn test_non_object_args() {
        let err = validate_args(&schema(), &json!("just a string")).unwrap_err();
        assert_eq!(err.kind(), "INVALID_INPUT");
    }

    #[test]
    fn test_extra_args_allowed() {
        assert!(validate_args(&schema(), &json!({"code": "x", "unknown": true})).is_ok());
    }
}
