//! 会话事件：类型化事件 + 线缆信封
//!
//! 内部用带类型的枚举（每种事件一个变体），仅在边界序列化为统一信封
//! `{type, timestamp, session_id, payload}`，与前端约定保持一致。

pub mod bus;

pub use bus::{EventBus, Subscription};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::dataset::DatasetSummary;
use crate::state::{ImageRecord, Task};

/// 任务清单更新的来源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    /// todo_write 工具调用
    Tool,
    /// autonomous 策略解析 <tasks> 标签
    Llm,
    /// 代码规划路径（task_driven / hybrid / staged）
    Code,
}

/// 流式增量类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    Content,
    Reasoning,
    ToolCallChunk,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Content => "content",
            DeltaKind::Reasoning => "reasoning",
            DeltaKind::ToolCallChunk => "tool_call_chunk",
        }
    }
}

/// 会话过程事件（类型化；每会话严格有序、只追加）
#[derive(Clone, Debug)]
pub enum AgentEvent {
    /// 订阅握手确认
    Connected,
    AgentStarted {
        user_request: String,
        mode: String,
    },
    /// phase 为自由字符串：会话阶段（running 等）或策略内部阶段（planning / reporting 等）
    PhaseChange {
        phase: String,
    },
    DataExplored {
        summary: DatasetSummary,
    },
    /// 代码规划路径产生的初始任务清单
    TasksPlanned {
        tasks: Vec<Task>,
    },
    /// 任务清单全量快照
    TasksUpdated {
        tasks: Vec<Task>,
        source: TaskSource,
    },
    TaskStarted {
        task_id: u32,
        task_name: String,
    },
    TaskCompleted {
        task_id: u32,
        task_name: String,
    },
    TaskFailed {
        task_id: u32,
        task_name: String,
        error: String,
    },
    LlmStreaming {
        iteration: u32,
        kind: DeltaKind,
        delta: String,
        full_content_so_far: String,
    },
    /// 模型思考内容（autonomous 解析块 / 其它策略的原生 reasoning）
    LlmThinking {
        thinking: String,
        is_real: bool,
        iteration: u32,
    },
    ToolCall {
        tool_name: String,
        call_id: String,
        arguments: Value,
        iteration: u32,
    },
    ToolResult {
        tool_name: String,
        call_id: String,
        status: String,
        stdout_preview: String,
        has_image: bool,
        iteration: u32,
    },
    /// run_code 生成的代码（与对应 tool_call 相邻发出）
    CodeGenerated {
        task_id: Option<u32>,
        code: String,
        description: String,
        iteration: u32,
    },
    ImageGenerated {
        task_id: Option<u32>,
        task_name: String,
        image_base64: String,
        iteration: u32,
    },
    ReportGenerated {
        report: String,
    },
    /// 非终止性警告（如迭代耗尽）
    AgentWarning {
        message: String,
        incomplete_tasks_count: usize,
    },
    /// 终止：正常完成（含迭代耗尽的软完成）
    AgentCompleted {
        final_report: String,
        images: Vec<ImageRecord>,
        reached_max_iterations: bool,
        incomplete_tasks_count: usize,
        iterations: u32,
    },
    /// 终止：基础设施错误
    AgentError {
        error: String,
        kind: String,
        location: String,
    },
    /// 终止：用户取消
    AgentStopped {
        reason: String,
    },
}

impl AgentEvent {
    /// 终止性事件：关闭事件流
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::AgentCompleted { .. }
                | AgentEvent::AgentError { .. }
                | AgentEvent::AgentStopped { .. }
        )
    }

    /// 事件类型名与 payload（线缆格式）
    pub fn wire(&self) -> (&'static str, Value) {
        match self {
            AgentEvent::Connected => ("connected", json!({"message": "subscription established"})),
            AgentEvent::AgentStarted { user_request, mode } => (
                "agent_started",
                json!({"user_request": user_request, "mode": mode}),
            ),
            AgentEvent::PhaseChange { phase } => ("phase_change", json!({"phase": phase})),
            AgentEvent::DataExplored { summary } => ("data_explored", json!(summary)),
            AgentEvent::TasksPlanned { tasks } => ("tasks_planned", json!({"tasks": tasks})),
            AgentEvent::TasksUpdated { tasks, source } => (
                "tasks_updated",
                json!({"tasks": tasks, "source": source}),
            ),
            AgentEvent::TaskStarted { task_id, task_name } => (
                "task_started",
                json!({"task_id": task_id, "task_name": task_name}),
            ),
            AgentEvent::TaskCompleted { task_id, task_name } => (
                "task_completed",
                json!({"task_id": task_id, "task_name": task_name}),
            ),
            AgentEvent::TaskFailed {
                task_id,
                task_name,
                error,
            } => (
                "task_failed",
                json!({"task_id": task_id, "task_name": task_name, "error": error}),
            ),
            AgentEvent::LlmStreaming {
                iteration,
                kind,
                delta,
                full_content_so_far,
            } => (
                "llm_streaming",
                json!({
                    "iteration": iteration,
                    "type": kind.as_str(),
                    "delta": delta,
                    "full_content_so_far": full_content_so_far,
                }),
            ),
            AgentEvent::LlmThinking {
                thinking,
                is_real,
                iteration,
            } => (
                "llm_thinking",
                json!({"thinking": thinking, "is_real": is_real, "iteration": iteration}),
            ),
            AgentEvent::ToolCall {
                tool_name,
                call_id,
                arguments,
                iteration,
            } => (
                "tool_call",
                json!({
                    "tool_name": tool_name,
                    "call_id": call_id,
                    "arguments": arguments,
                    "iteration": iteration,
                }),
            ),
            AgentEvent::ToolResult {
                tool_name,
                call_id,
                status,
                stdout_preview,
                has_image,
                iteration,
            } => (
                "tool_result",
                json!({
                    "tool_name": tool_name,
                    "call_id": call_id,
                    "status": status,
                    "stdout_preview": stdout_preview,
                    "has_image": has_image,
                    "iteration": iteration,
                }),
            ),
            AgentEvent::CodeGenerated {
                task_id,
                code,
                description,
                iteration,
            } => (
                "code_generated",
                json!({
                    "task_id": task_id,
                    "code": code,
                    "description": description,
                    "iteration": iteration,
                }),
            ),
            AgentEvent::ImageGenerated {
                task_id,
                task_name,
                image_base64,
                iteration,
            } => (
                "image_generated",
                json!({
                    "task_id": task_id,
                    "task_name": task_name,
                    "image_base64": image_base64,
                    "iteration": iteration,
                }),
            ),
            AgentEvent::ReportGenerated { report } => {
                ("report_generated", json!({"report": report}))
            }
            AgentEvent::AgentWarning {
                message,
                incomplete_tasks_count,
            } => (
                "agent_warning",
                json!({"message": message, "incomplete_tasks_count": incomplete_tasks_count}),
            ),
            AgentEvent::AgentCompleted {
                final_report,
                images,
                reached_max_iterations,
                incomplete_tasks_count,
                iterations,
            } => (
                "agent_completed",
                json!({
                    "final_report": final_report,
                    "images": images,
                    "reached_max_iterations": reached_max_iterations,
                    "incomplete_tasks_count": incomplete_tasks_count,
                    "iterations": iterations,
                }),
            ),
            AgentEvent::AgentError {
                error,
                kind,
                location,
            } => (
                "agent_error",
                json!({"error": error, "kind": kind, "where": location}),
            ),
            AgentEvent::AgentStopped { reason } => ("agent_stopped", json!({"reason": reason})),
        }
    }
}

/// 线缆信封：`{type, timestamp, session_id, payload}`
#[derive(Clone, Debug, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    /// RFC 3339，末尾 Z
    pub timestamp: String,
    pub session_id: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(session_id: &str, event: &AgentEvent) -> Self {
        let (event_type, payload) = event.wire();
        Self {
            event_type: event_type.to_string(),
            timestamp: now_rfc3339(),
            session_id: session_id.to_string(),
            payload,
        }
    }

    /// 慢订阅者被丢弃时的收尾信号（仅发给该订阅者，不进会话日志）
    pub fn lagged(session_id: &str) -> Self {
        Self {
            event_type: "subscriber_lagged".to_string(),
            timestamp: now_rfc3339(),
            session_id: session_id.to_string(),
            payload: json!({"reason": "event queue overflow, subscriber dropped"}),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            "agent_completed" | "agent_error" | "agent_stopped"
        )
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_llm_streaming_payload_type_field() {
        let ev = AgentEvent::LlmStreaming {
            iteration: 2,
            kind: DeltaKind::Reasoning,
            delta: "考虑".into(),
            full_content_so_far: "考虑".into(),
        };
        let (t, p) = ev.wire();
        assert_eq!(t, "llm_streaming");
        assert_eq!(p["type"], "reasoning");
        assert_eq!(p["iteration"], 2);
    }

    #[test]
    fn test_envelope_shape() {
        let env = Envelope::new("sess-1", &AgentEvent::PhaseChange { phase: "running".into() });
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "phase_change");
        assert_eq!(v["session_id"], "sess-1");
        assert_eq!(v["payload"]["phase"], "running");
        assert!(v["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_terminal_markers() {
        assert!(AgentEvent::AgentStopped { reason: "user".into() }.is_terminal());
        assert!(!AgentEvent::Connected.is_terminal());
    }
}
