//! tool_driven 策略（推荐）
//!
//! LLM 经 todo_write 完全自主管理任务生命周期，代码层只做安全兜底：
//! 最大迭代数与唯一 in_progress 约束。终止判定：纯文本回合且所有任务已验收。
//! 疑似报告的文本先暂存，等 todo_write 把任务闭环后再作为最终报告交付。

use async_trait::async_trait;

use crate::agent::{LoopDriver, Strategy, TerminalCause};
use crate::core::AgentError;
use crate::prompts;
use crate::state::Role;

/// 报告特征关键词；命中两个以上即视为报告内容
const REPORT_INDICATORS: &[&str] = &[
    "# 数据分析报告",
    "## 数据概览",
    "## 关键发现",
    "## 分析",
    "## 洞察",
    "## 总结",
];
const REPORT_MIN_CHARS: usize = 200;

pub struct ToolDrivenStrategy;

fn looks_like_report(content: &str) -> bool {
    if content.chars().count() < REPORT_MIN_CHARS {
        return false;
    }
    REPORT_INDICATORS
        .iter()
        .filter(|ind| content.contains(**ind))
        .count()
        >= 2
}

/// 从后往前找最后一条像报告的 assistant 消息；退而求其次取最后一条非空 assistant 文本
fn find_report_in_messages(driver: &LoopDriver<'_>) -> String {
    let messages = driver.state.messages();
    for msg in messages.iter().rev() {
        if msg.role == Role::Assistant && looks_like_report(&msg.content) {
            return msg.content.clone();
        }
    }
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && !m.content.is_empty())
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn initial_prompt(driver: &LoopDriver<'_>) -> String {
    format!(
        r#"请分析以下数据集：

## 数据文件
{}（代码中通过 DATASET_PATH 访问）

## 用户分析需求
{}

## 执行步骤
1. 首先调用 read_dataset 了解数据结构
2. 然后调用 todo_write 创建任务清单（merge=false）
3. 逐个执行任务，每个任务执行前后都要更新状态
4. 所有任务完成后，输出最终分析报告

请开始执行。"#,
        driver.state.dataset_filename, driver.state.user_request
    )
}

#[async_trait]
impl Strategy for ToolDrivenStrategy {
    async fn run(&self, driver: &mut LoopDriver<'_>) -> Result<TerminalCause, AgentError> {
        let initial = initial_prompt(driver);
        driver.begin(prompts::TOOL_DRIVEN_SYSTEM_PROMPT, &initial)?;
        let tools = driver.deps.registry.specs();

        let mut pending_report: Option<String> = None;

        loop {
            if driver.exhausted() {
                return driver.finish_completed(true);
            }
            driver.check_cancelled()?;

            let response = driver.llm_turn(&tools).await?;
            driver.record_assistant(&response)?;

            if response.is_textual() {
                if looks_like_report(&response.content) {
                    tracing::debug!(
                        session_id = %driver.state.session_id,
                        "report-looking content held pending task-loop closure"
                    );
                    pending_report = Some(response.content.clone());
                }
                // 终止判定：纯文本回合 + 任务全部验收。
                // 从未声明任何任务时，一条成形的文本报告也允许干净收尾。
                let tasks_closed = driver.state.all_tasks_terminal();
                let no_tasks_but_report =
                    driver.state.tasks().is_empty() && looks_like_report(&response.content);
                if tasks_closed || no_tasks_but_report {
                    let report = pending_report
                        .take()
                        .unwrap_or_else(|| find_report_in_messages(driver));
                    driver.record_report(report)?;
                    return driver.finish_completed(false);
                }
            } else {
                driver.dispatch_tool_calls(&response).await?;
                // 工具闭环后若已有暂存报告，直接交付，不再多耗一轮
                if driver.state.all_tasks_terminal() {
                    if let Some(report) = pending_report.take() {
                        driver.record_report(report)?;
                        return driver.finish_completed(false);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_report_needs_two_indicators_and_length() {
        let filler = "内容 ".repeat(120);
        let report = format!("# 数据分析报告\n## 关键发现\n{}", filler);
        assert!(looks_like_report(&report));
        assert!(!looks_like_report("# 数据分析报告 太短"));
        let long_plain = "字".repeat(300);
        assert!(!looks_like_report(&long_plain));
    }
}
