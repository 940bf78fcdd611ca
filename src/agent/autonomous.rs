//! autonomous 策略
//!
//! 只发一条初始用户消息，LLM 自主决策每一步；状态经 <thinking>/<tasks> 标签
//! 内联在文本里，由代码逐回合解析（畸形块静默忽略）。终止判定：文本回合
//! 包含字面量 [ANALYSIS_COMPLETE]。

use async_trait::async_trait;

use crate::agent::tags;
use crate::agent::{LoopDriver, Strategy, TerminalCause};
use crate::core::AgentError;
use crate::event::{AgentEvent, TaskSource};
use crate::llm::ChatResponse;
use crate::prompts;

pub struct AutonomousStrategy;

/// 逐回合解析标签：thinking → llm_thinking 事件（不落史），tasks → 任务清单覆盖
fn absorb_tags(driver: &mut LoopDriver<'_>, response: &ChatResponse) -> Result<(), AgentError> {
    let iteration = driver.state.iteration;
    if let Some(thinking) = tags::parse_thinking(&response.content) {
        driver.emit(AgentEvent::LlmThinking {
            thinking,
            is_real: true,
            iteration,
        });
    } else if !response.tool_calls.is_empty() {
        // 没有思考块的工具回合：合成一条简述，保持前端时间线连贯
        let names: Vec<&str> = response.tool_calls.iter().map(|c| c.name.as_str()).collect();
        driver.emit(AgentEvent::LlmThinking {
            thinking: format!("调用 {}", names.join(", ")),
            is_real: false,
            iteration,
        });
    }
    if let Some(tasks) = tags::parse_tasks(&response.content) {
        driver.state.replace_tasks(tasks)?;
        driver.emit(AgentEvent::TasksUpdated {
            tasks: driver.state.tasks().to_vec(),
            source: TaskSource::Llm,
        });
    }
    Ok(())
}

#[async_trait]
impl Strategy for AutonomousStrategy {
    async fn run(&self, driver: &mut LoopDriver<'_>) -> Result<TerminalCause, AgentError> {
        let initial = format!(
            r#"请分析以下数据集：

## 数据文件
{}（代码中通过 DATASET_PATH 访问）

## 用户分析需求
{}

请开始执行分析，记得每次回复都要包含 <thinking> 和 <tasks> 标签。"#,
            driver.state.dataset_filename, driver.state.user_request
        );
        driver.begin(prompts::AUTONOMOUS_SYSTEM_PROMPT, &initial)?;
        let tools = driver.deps.registry.specs();

        loop {
            if driver.exhausted() {
                return driver.finish_completed(true);
            }
            driver.check_cancelled()?;

            let response = driver.llm_turn(&tools).await?;
            driver.record_assistant(&response)?;
            absorb_tags(driver, &response)?;

            if response.is_textual() {
                if tags::is_complete(&response.content) {
                    let report = tags::strip_report(&response.content);
                    driver.record_report(report)?;
                    return driver.finish_completed(false);
                }
            } else {
                driver.dispatch_tool_calls(&response).await?;
            }
        }
    }
}
