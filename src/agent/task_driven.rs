//! task_driven 策略
//!
//! 代码持有任务清单：数据探索与任务规划由代码路径驱动（LLM 只产出 JSON 计划），
//! 之后逐个注入「现在执行任务 #k」用户消息；一个任务在 LLM 给出纯文本小结时记完成。
//! 终止判定：所有代码持有的任务到达终态，再补一轮报告生成。

use async_trait::async_trait;
use serde::Deserialize;

use crate::agent::{LoopDriver, Strategy, TerminalCause};
use crate::core::AgentError;
use crate::event::{AgentEvent, TaskSource};
use crate::prompts::{self, fill};
use crate::state::{Message, Task, TaskStatus, TaskType};
use crate::tools::ToolContext;

pub struct TaskDrivenStrategy;

/// 规划 JSON 的单项
#[derive(Debug, Deserialize)]
struct PlannedTask {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "type", default)]
    task_type: TaskType,
}

/// 从 LLM 文本中提取首个 JSON 数组并解析为任务；失败返回 None（调用方用默认计划兜底）
pub(crate) fn parse_planned_tasks(content: &str) -> Option<Vec<Task>> {
    let start = content.find('[')?;
    let end = content.rfind(']')?;
    if end <= start {
        return None;
    }
    let planned: Vec<PlannedTask> = serde_json::from_str(&content[start..=end]).ok()?;
    if planned.is_empty() {
        return None;
    }
    Some(
        planned
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                let mut t = Task::new(i as u32 + 1, p.name);
                t.description = p.description;
                t.task_type = p.task_type;
                t
            })
            .collect(),
    )
}

/// LLM 规划失败时的保守默认计划
pub(crate) fn fallback_plan() -> Vec<Task> {
    let specs: [(&str, &str, TaskType); 4] = [
        ("探索数据基本特征", "统计行列、缺失与分布", TaskType::DataExploration),
        ("核心指标分析", "围绕用户需求做汇总统计", TaskType::Analysis),
        ("生成可视化图表", "图表保存到 result.png", TaskType::Visualization),
        ("输出分析报告", "汇总结论输出 Markdown", TaskType::Report),
    ];
    specs
        .into_iter()
        .enumerate()
        .map(|(i, (name, desc, ty))| {
            let mut t = Task::new(i as u32 + 1, name);
            t.description = desc.to_string();
            t.task_type = ty;
            t
        })
        .collect()
}

/// 代码路径直接读数据集：发 data_explored，摘要文本给规划提示词用
pub(crate) async fn explore_dataset(driver: &mut LoopDriver<'_>) -> Result<String, AgentError> {
    let mut ctx = ToolContext {
        state: &mut *driver.state,
        bus: driver.deps.bus.as_ref(),
        sandbox: driver.deps.sandbox.as_ref(),
        cancel: &driver.deps.cancel,
    };
    let out = driver
        .deps
        .registry
        .dispatch(&mut ctx, "read_dataset", &serde_json::json!({}))
        .await?;
    Ok(out.payload)
}

/// 已完成任务的小结（注入后续任务的上下文）
fn completed_summary(driver: &LoopDriver<'_>) -> String {
    let lines: Vec<String> = driver
        .state
        .tasks()
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| format!("- [{}] {}", t.id, t.name))
        .collect();
    if lines.is_empty() {
        "（尚无）".to_string()
    } else {
        lines.join("\n")
    }
}

#[async_trait]
impl Strategy for TaskDrivenStrategy {
    async fn run(&self, driver: &mut LoopDriver<'_>) -> Result<TerminalCause, AgentError> {
        let initial = format!(
            "数据文件：{}\n分析需求：{}\n接下来按指示逐步完成分析。",
            driver.state.dataset_filename, driver.state.user_request
        );
        driver.begin(prompts::CODE_DRIVEN_SYSTEM_PROMPT, &initial)?;
        let tools = driver.deps.registry.specs();

        // 探索 + 规划（代码路径）
        driver.emit(AgentEvent::PhaseChange {
            phase: "planning".to_string(),
        });
        let data_summary = explore_dataset(driver).await?;
        driver.state.append_message(Message::user(fill(
            prompts::PLANNING_PROMPT,
            &[
                ("user_request", &driver.state.user_request.clone()),
                ("data_summary", &data_summary),
            ],
        )))?;

        if driver.exhausted() {
            return driver.finish_completed(true);
        }
        let plan_response = driver.llm_turn(&tools).await?;
        driver.record_assistant(&plan_response)?;
        let tasks = parse_planned_tasks(&plan_response.content).unwrap_or_else(|| {
            tracing::warn!(
                session_id = %driver.state.session_id,
                "planning output unparsable, falling back to default plan"
            );
            fallback_plan()
        });
        driver.state.replace_tasks(tasks)?;
        driver.emit(AgentEvent::TasksPlanned {
            tasks: driver.state.tasks().to_vec(),
        });
        driver.emit(AgentEvent::TasksUpdated {
            tasks: driver.state.tasks().to_vec(),
            source: TaskSource::Code,
        });

        // 逐任务执行
        driver.emit(AgentEvent::PhaseChange {
            phase: "executing".to_string(),
        });
        while let Some(task) = driver.state.next_pending_task().cloned() {
            driver.check_cancelled()?;
            driver
                .state
                .update_task(task.id, Some(TaskStatus::InProgress), None, None)?;
            driver.emit(AgentEvent::TaskStarted {
                task_id: task.id,
                task_name: task.name.clone(),
            });
            driver.emit(AgentEvent::TasksUpdated {
                tasks: driver.state.tasks().to_vec(),
                source: TaskSource::Code,
            });

            let summary = completed_summary(driver);
            driver.state.append_message(Message::user(fill(
                prompts::TASK_EXECUTION_PROMPT,
                &[
                    ("task_id", &task.id.to_string()),
                    ("task_name", &task.name),
                    ("task_description", &task.description),
                    ("completed_summary", &summary),
                ],
            )))?;

            loop {
                if driver.exhausted() {
                    return driver.finish_completed(true);
                }
                let response = driver.llm_turn(&tools).await?;
                driver.record_assistant(&response)?;
                if response.is_textual() {
                    driver
                        .state
                        .update_task(task.id, Some(TaskStatus::Completed), None, None)?;
                    driver.emit(AgentEvent::TaskCompleted {
                        task_id: task.id,
                        task_name: task.name.clone(),
                    });
                    driver.emit(AgentEvent::TasksUpdated {
                        tasks: driver.state.tasks().to_vec(),
                        source: TaskSource::Code,
                    });
                    break;
                }
                driver.dispatch_tool_calls(&response).await?;
            }
        }

        // 报告
        driver.emit(AgentEvent::PhaseChange {
            phase: "reporting".to_string(),
        });
        driver.state.append_message(Message::user(fill(
            prompts::REPORT_PROMPT,
            &[("user_request", &driver.state.user_request.clone())],
        )))?;
        loop {
            if driver.exhausted() {
                return driver.finish_completed(true);
            }
            let response = driver.llm_turn(&tools).await?;
            driver.record_assistant(&response)?;
            if response.is_textual() {
                driver.record_report(response.content.clone())?;
                return driver.finish_completed(false);
            }
            driver.dispatch_tool_calls(&response).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_planned_tasks_from_noisy_text() {
        let content = r#"好的，任务如下：
[
  {"name": "探索数据", "description": "看结构", "type": "data_exploration"},
  {"name": "趋势分析", "type": "analysis"}
]
以上。"#;
        let tasks = parse_planned_tasks(content).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, 1);
        assert_eq!(tasks[0].task_type, TaskType::DataExploration);
        assert_eq!(tasks[1].name, "趋势分析");
        assert_eq!(tasks[1].status, TaskStatus::Pending);
    }

    #[test]
    fn test_parse_planned_tasks_garbage_is_none() {
        assert!(parse_planned_tasks("没有任何 JSON").is_none());
        assert!(parse_planned_tasks("[]").is_none());
        assert!(parse_planned_tasks("[not json]").is_none());
    }

    #[test]
    fn test_fallback_plan_shape() {
        let plan = fallback_plan();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0].id, 1);
        assert_eq!(plan[3].task_type, TaskType::Report);
    }
}
