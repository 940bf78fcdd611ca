//! hybrid 策略
//!
//! 代码控制任务清单与顺序，LLM 自主决定每个任务内部怎么做（多轮工具调用），
//! 以 [TASK_DONE] / [TASK_FAILED] 显式宣告收场；单任务迭代数受
//! max_iterations_per_task 约束，超限记失败后继续后续任务。

use async_trait::async_trait;

use crate::agent::task_driven::{explore_dataset, fallback_plan, parse_planned_tasks};
use crate::agent::{LoopDriver, Strategy, TerminalCause};
use crate::core::AgentError;
use crate::event::{AgentEvent, TaskSource};
use crate::prompts::{self, fill};
use crate::state::{Message, TaskStatus};

const TASK_DONE: &str = "[TASK_DONE]";
const TASK_FAILED: &str = "[TASK_FAILED]";

pub struct HybridStrategy;

#[async_trait]
impl Strategy for HybridStrategy {
    async fn run(&self, driver: &mut LoopDriver<'_>) -> Result<TerminalCause, AgentError> {
        let initial = format!(
            "数据文件：{}\n分析需求：{}\n我会逐个指派任务，每个任务由你自主完成并显式宣告结束。",
            driver.state.dataset_filename, driver.state.user_request
        );
        driver.begin(prompts::CODE_DRIVEN_SYSTEM_PROMPT, &initial)?;
        let tools = driver.deps.registry.specs();
        let per_task_cap = driver.deps.agent_cfg.max_iterations_per_task;

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
        let tasks = parse_planned_tasks(&plan_response.content).unwrap_or_else(fallback_plan);
        driver.state.replace_tasks(tasks)?;
        driver.emit(AgentEvent::TasksPlanned {
            tasks: driver.state.tasks().to_vec(),
        });
        driver.emit(AgentEvent::TasksUpdated {
            tasks: driver.state.tasks().to_vec(),
            source: TaskSource::Code,
        });

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
            driver.state.append_message(Message::user(fill(
                prompts::HYBRID_TASK_PROMPT,
                &[
                    ("task_id", &task.id.to_string()),
                    ("task_name", &task.name),
                    ("task_description", &task.description),
                ],
            )))?;

            let mut task_iterations = 0u32;
            let mut outcome: Option<(TaskStatus, Option<String>)> = None;
            while outcome.is_none() {
                if driver.exhausted() {
                    return driver.finish_completed(true);
                }
                if task_iterations >= per_task_cap {
                    outcome = Some((
                        TaskStatus::Failed,
                        Some(format!("单任务迭代超限 ({})", per_task_cap)),
                    ));
                    break;
                }
                task_iterations += 1;
                let response = driver.llm_turn(&tools).await?;
                driver.record_assistant(&response)?;
                if response.is_textual() {
                    if response.content.contains(TASK_FAILED) {
                        outcome = Some((TaskStatus::Failed, Some("模型宣告任务失败".into())));
                    } else if response.content.contains(TASK_DONE) || task_iterations >= per_task_cap
                    {
                        outcome = Some((TaskStatus::Completed, None));
                    }
                    // 纯文本但没有宣告：继续等下一轮
                } else {
                    driver.dispatch_tool_calls(&response).await?;
                }
            }

            let (status, error) = match outcome {
                Some(decided) => decided,
                None => (TaskStatus::Failed, Some("任务未决出结果".to_string())),
            };
            driver
                .state
                .update_task(task.id, Some(status), None, error.clone())?;
            match status {
                TaskStatus::Completed => driver.emit(AgentEvent::TaskCompleted {
                    task_id: task.id,
                    task_name: task.name.clone(),
                }),
                _ => driver.emit(AgentEvent::TaskFailed {
                    task_id: task.id,
                    task_name: task.name.clone(),
                    error: error.unwrap_or_default(),
                }),
            }
            driver.emit(AgentEvent::TasksUpdated {
                tasks: driver.state.tasks().to_vec(),
                source: TaskSource::Code,
            });
        }

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
