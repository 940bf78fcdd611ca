//! todo_write 工具：任务清单的创建与状态流转
//!
//! merge=false 整体替换（初始规划），merge=true 按 id 增量更新（未知 id 追加）。
//! 整批应用后若出现两个 in_progress，整批拒绝（INVALID_STATE 回传 LLM）。
//! 每次成功调用发出 tasks_updated(source=tool)。

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::event::{AgentEvent, TaskSource};
use crate::state::{Task, TaskStatus};
use crate::tools::{Tool, ToolContext, ToolOutput};

/// 任务管理工具
#[derive(Default)]
pub struct TodoWriteTool;

fn parse_entry(todo: &Value) -> Result<Task, AgentError> {
    let id = match todo.get("id") {
        Some(Value::String(s)) => s
            .trim()
            .parse::<u32>()
            .map_err(|_| AgentError::InvalidInput(format!("task id '{}' is not numeric", s)))?,
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|v| v as u32)
            .ok_or_else(|| AgentError::InvalidInput(format!("task id {} out of range", n)))?,
        _ => return Err(AgentError::InvalidInput("todo entry missing id".into())),
    };
    let content = todo
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let status_str = todo
        .get("status")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AgentError::InvalidInput("todo entry missing status".into()))?;
    // 兼容旧 schema 里的 cancelled
    let status = match status_str {
        "cancelled" => TaskStatus::Skipped,
        other => TaskStatus::parse(other).ok_or_else(|| {
            AgentError::InvalidInput(format!("unknown task status '{}'", other))
        })?,
    };
    let mut task = Task::new(id, content);
    task.status = status;
    Ok(task)
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "管理分析任务清单：创建任务清单（merge=false），标记任务开始 in_progress 或完成 completed（merge=true）。每个任务执行前必须标记 in_progress，完成后必须标记 completed；所有任务 completed 后分析才算闭环。"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "任务对象数组",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "string", "description": "任务唯一标识（如 '1', '2'）"},
                            "content": {"type": "string", "description": "任务内容，动词开头"},
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed", "failed", "skipped"],
                                "description": "任务状态"
                            }
                        },
                        "required": ["id", "content", "status"]
                    }
                },
                "merge": {
                    "type": "boolean",
                    "description": "true=增量更新指定任务，false=整体替换清单"
                }
            },
            "required": ["todos", "merge"]
        })
    }

    async fn execute(
        &self,
        ctx: &mut ToolContext<'_>,
        args: Value,
    ) -> Result<ToolOutput, AgentError> {
        let todos = args
            .get("todos")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AgentError::InvalidInput("todos must be an array".into()))?;
        let merge = args
            .get("merge")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| AgentError::InvalidInput("merge must be a boolean".into()))?;

        let entries = todos
            .iter()
            .map(parse_entry)
            .collect::<Result<Vec<_>, _>>()?;

        if merge {
            ctx.state.apply_task_batch(entries)?;
        } else {
            ctx.state.replace_tasks(entries)?;
        }

        let tasks = ctx.state.tasks().to_vec();
        ctx.bus.emit(AgentEvent::TasksUpdated {
            tasks: tasks.clone(),
            source: TaskSource::Tool,
        });

        let completed = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
        let in_progress = tasks.iter().filter(|t| t.status == TaskStatus::InProgress).count();
        let pending = tasks.iter().filter(|t| t.status == TaskStatus::Pending).count();
        let all_completed = ctx.state.all_tasks_terminal();

        let mut payload = json!({
            "status": "success",
            "message": "任务清单已更新",
            "summary": {
                "total": tasks.len(),
                "completed": completed,
                "in_progress": in_progress,
                "pending": pending,
            },
        });
        if all_completed {
            payload["task_loop_closed"] = json!({
                "completed": true,
                "message": "所有任务已完成，分析任务闭环"
            });
        }

        Ok(ToolOutput::success(payload.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxSection;
    use crate::event::EventBus;
    use crate::sandbox::CodeSandbox;
    use crate::state::SessionState;
    use tokio_util::sync::CancellationToken;

    fn fixtures() -> (SessionState, EventBus, CodeSandbox) {
        let state = SessionState::new("s1", "/tmp/d.csv", "d.csv", "分析", "tool_driven");
        let bus = EventBus::new("s1", 64);
        let sandbox = CodeSandbox::new(&SandboxSection::default(), std::env::temp_dir());
        (state, bus, sandbox)
    }

    fn todo(id: &str, content: &str, status: &str) -> Value {
        json!({"id": id, "content": content, "status": status})
    }

    #[tokio::test]
    async fn test_replace_then_snapshot_yields_exact_list() {
        let (mut state, bus, sandbox) = fixtures();
        let cancel = CancellationToken::new();
        let tool = TodoWriteTool;
        let mut ctx = ToolContext {
            state: &mut state,
            bus: &bus,
            sandbox: &sandbox,
            cancel: &cancel,
        };
        let args = json!({
            "todos": [todo("1", "探索数据", "pending"), todo("2", "生成报告", "pending")],
            "merge": false
        });
        let out = tool.execute(&mut ctx, args).await.unwrap();
        assert_eq!(out.status, "success");
        let tasks = state.tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name, "探索数据");
        assert_eq!(tasks[1].id, 2);
    }

    #[tokio::test]
    async fn test_merge_updates_status_and_appends_unknown() {
        let (mut state, bus, sandbox) = fixtures();
        let cancel = CancellationToken::new();
        let tool = TodoWriteTool;
        {
            let mut ctx = ToolContext { state: &mut state, bus: &bus, sandbox: &sandbox, cancel: &cancel };
            tool.execute(&mut ctx, json!({
                "todos": [todo("1", "探索数据", "pending")],
                "merge": false
            })).await.unwrap();
        }
        {
            let mut ctx = ToolContext { state: &mut state, bus: &bus, sandbox: &sandbox, cancel: &cancel };
            tool.execute(&mut ctx, json!({
                "todos": [todo("1", "探索数据", "in_progress"), todo("3", "补充任务", "pending")],
                "merge": true
            })).await.unwrap();
        }
        assert_eq!(state.tasks().len(), 2);
        assert_eq!(state.get_task(1).unwrap().status, TaskStatus::InProgress);
        assert_eq!(state.get_task(3).unwrap().name, "补充任务");
    }

    #[tokio::test]
    async fn test_double_in_progress_rejected() {
        let (mut state, bus, sandbox) = fixtures();
        let cancel = CancellationToken::new();
        let tool = TodoWriteTool;
        {
            let mut ctx = ToolContext { state: &mut state, bus: &bus, sandbox: &sandbox, cancel: &cancel };
            tool.execute(&mut ctx, json!({
                "todos": [todo("1", "a", "in_progress"), todo("2", "b", "pending")],
                "merge": false
            })).await.unwrap();
        }
        let mut ctx = ToolContext { state: &mut state, bus: &bus, sandbox: &sandbox, cancel: &cancel };
        let err = tool.execute(&mut ctx, json!({
            "todos": [todo("2", "b", "in_progress")],
            "merge": true
        })).await;
        assert!(matches!(err, Err(AgentError::InvalidState(_))));
        assert_eq!(state.get_task(2).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancelled_status_maps_to_skipped() {
        let (mut state, bus, sandbox) = fixtures();
        let cancel = CancellationToken::new();
        let tool = TodoWriteTool;
        let mut ctx = ToolContext { state: &mut state, bus: &bus, sandbox: &sandbox, cancel: &cancel };
        tool.execute(&mut ctx, json!({
            "todos": [todo("1", "a", "cancelled")],
            "merge": false
        })).await.unwrap();
        assert_eq!(state.get_task(1).unwrap().status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_tasks_updated_event_emitted_with_tool_source() {
        let (mut state, bus, sandbox) = fixtures();
        let cancel = CancellationToken::new();
        let tool = TodoWriteTool;
        {
            let mut ctx = ToolContext { state: &mut state, bus: &bus, sandbox: &sandbox, cancel: &cancel };
            tool.execute(&mut ctx, json!({
                "todos": [todo("1", "a", "completed")],
                "merge": false
            })).await.unwrap();
        }
        let log = bus.log_snapshot();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].event_type, "tasks_updated");
        assert_eq!(log[0].payload["source"], "tool");
        assert_eq!(log[0].payload["tasks"][0]["status"], "completed");
    }
}
