//! staged 策略
//!
//! 代码驱动四阶段：探索 → 规划 → 逐任务执行 → 报告。阶段转换由代码完成，
//! 每个阶段使用专属提示词；到达报告阶段末尾即终止。

use async_trait::async_trait;

use crate::agent::task_driven::{explore_dataset, fallback_plan, parse_planned_tasks};
use crate::agent::{LoopDriver, Strategy, TerminalCause};
use crate::core::AgentError;
use crate::event::{AgentEvent, TaskSource};
use crate::prompts::{self, fill};
use crate::state::{Message, TaskStatus};

pub struct StagedStrategy;

#[async_trait]
impl Strategy for StagedStrategy {
    async fn run(&self, driver: &mut LoopDriver<'_>) -> Result<TerminalCause, AgentError> {
        let initial = format!(
            "数据文件：{}\n分析需求：{}\n分析按 探索 → 规划 → 执行 → 报告 四个阶段推进。",
            driver.state.dataset_filename, driver.state.user_request
        );
        driver.begin(prompts::CODE_DRIVEN_SYSTEM_PROMPT, &initial)?;
        let tools = driver.deps.registry.specs();

        // 阶段一：探索（代码直接读数据集，LLM 给出切入点短评）
        driver.emit(AgentEvent::PhaseChange {
            phase: "data_exploration".to_string(),
        });
        let data_summary = explore_dataset(driver).await?;
        driver.state.append_message(Message::user(fill(
            prompts::STAGED_EXPLORE_PROMPT,
            &[
                ("data_summary", &data_summary),
                ("user_request", &driver.state.user_request.clone()),
            ],
        )))?;
        if driver.exhausted() {
            return driver.finish_completed(true);
        }
        let explore_response = driver.llm_turn(&tools).await?;
        driver.record_assistant(&explore_response)?;

        // 阶段二：规划
        driver.emit(AgentEvent::PhaseChange {
            phase: "planning".to_string(),
        });
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

        // 阶段三：逐任务执行
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
                prompts::TASK_EXECUTION_PROMPT,
                &[
                    ("task_id", &task.id.to_string()),
                    ("task_name", &task.name),
                    ("task_description", &task.description),
                    ("completed_summary", &driver.state.tasks_summary()),
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

        // 阶段四：报告；其末尾即策略终点
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
