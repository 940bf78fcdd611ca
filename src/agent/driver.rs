//! 共享执行框架
//!
//! 所有策略复用同一迭代骨架：LLM 调用（流式增量转发为 llm_streaming 事件）、
//! 工具调度（tool_call / tool_result 成对相邻发出）、取消检查点（迭代顶部、
//! 工具调用之间、沙箱返回之后）、迭代耗尽的软完成（agent_warning + agent_completed）。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentSection;
use crate::core::AgentError;
use crate::event::{AgentEvent, DeltaKind, EventBus};
use crate::llm::{ChatResponse, LlmClient, ToolSpec};
use crate::sandbox::CodeSandbox;
use crate::state::{Message, SessionState};
use crate::tools::{ToolContext, ToolRegistry};

/// 策略运行期依赖（会话间共享只读，取消令牌与总线为会话私有）
pub struct StrategyDeps {
    pub llm: Arc<dyn LlmClient>,
    pub registry: Arc<ToolRegistry>,
    pub sandbox: Arc<CodeSandbox>,
    pub bus: Arc<EventBus>,
    pub cancel: CancellationToken,
    pub agent_cfg: AgentSection,
}

/// 策略正常终止的原因
#[derive(Debug, Clone, Copy)]
pub struct TerminalCause {
    pub reached_max_iterations: bool,
}

/// 策略对会话状态的独占驱动句柄
pub struct LoopDriver<'a> {
    pub state: &'a mut SessionState,
    pub deps: &'a StrategyDeps,
}

impl<'a> LoopDriver<'a> {
    pub fn new(state: &'a mut SessionState, deps: &'a StrategyDeps) -> Self {
        Self { state, deps }
    }

    pub fn emit(&self, event: AgentEvent) {
        self.deps.bus.emit(event);
    }

    /// 共享帧的开场：agent_started、系统 + 初始用户消息、进入 running
    pub fn begin(
        &mut self,
        system_prompt: &str,
        initial_user: &str,
    ) -> Result<(), AgentError> {
        self.emit(AgentEvent::AgentStarted {
            user_request: self.state.user_request.clone(),
            mode: self.state.strategy.clone(),
        });
        self.state.append_message(Message::system(system_prompt))?;
        self.state.append_message(Message::user(initial_user))?;
        self.state.set_phase(crate::state::AgentPhase::Running)?;
        self.emit(AgentEvent::PhaseChange {
            phase: "running".to_string(),
        });
        Ok(())
    }

    pub fn check_cancelled(&self) -> Result<(), AgentError> {
        if self.deps.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    /// 迭代配额已用尽
    pub fn exhausted(&self) -> bool {
        self.state.iteration >= self.deps.agent_cfg.max_iterations
    }

    /// 一次 LLM 调用：计数器先行递增，流式增量实时转为 llm_streaming 事件。
    /// 取消会中止在途请求。原生 reasoning 汇总为一条 llm_thinking，不进消息历史。
    pub async fn llm_turn(&mut self, tools: &[ToolSpec]) -> Result<ChatResponse, AgentError> {
        self.check_cancelled()?;
        self.state.iteration += 1;
        let iteration = self.state.iteration;

        let (tx, mut rx) = mpsc::unbounded_channel::<crate::llm::StreamDelta>();
        let bus = self.deps.bus.clone();
        let pump = tokio::spawn(async move {
            let mut content = String::new();
            let mut reasoning = String::new();
            let mut tool_chunks = String::new();
            while let Some(delta) = rx.recv().await {
                let acc = match delta.kind {
                    DeltaKind::Content => {
                        content.push_str(&delta.text);
                        &content
                    }
                    DeltaKind::Reasoning => {
                        reasoning.push_str(&delta.text);
                        &reasoning
                    }
                    DeltaKind::ToolCallChunk => {
                        tool_chunks.push_str(&delta.text);
                        &tool_chunks
                    }
                };
                bus.emit(AgentEvent::LlmStreaming {
                    iteration,
                    kind: delta.kind,
                    delta: delta.text,
                    full_content_so_far: acc.clone(),
                });
            }
        });

        let result = tokio::select! {
            r = self.deps.llm.chat(self.state.messages(), tools, Some(&tx)) => r,
            _ = self.deps.cancel.cancelled() => Err(AgentError::Cancelled),
        };
        drop(tx);
        let _ = pump.await;

        let response = result?;
        if let Some(reasoning) = &response.reasoning {
            self.emit(AgentEvent::LlmThinking {
                thinking: reasoning.clone(),
                is_real: true,
                iteration,
            });
        }
        Ok(response)
    }

    /// 把一次补全写回消息历史（reasoning 不落史）
    pub fn record_assistant(&mut self, response: &ChatResponse) -> Result<(), AgentError> {
        let msg = if response.tool_calls.is_empty() {
            Message::assistant(response.content.clone())
        } else {
            Message::assistant_tool_calls(response.content.clone(), response.tool_calls.clone())
        };
        self.state.append_message(msg)
    }

    /// 调度一次补全中的全部工具调用：逐个校验、执行、记录。
    /// tool_call 与 tool_result 相邻成对发出；相邻调用之间检查取消。
    pub async fn dispatch_tool_calls(&mut self, response: &ChatResponse) -> Result<(), AgentError> {
        for call in &response.tool_calls {
            self.check_cancelled()?;
            let iteration = self.state.iteration;
            self.emit(AgentEvent::ToolCall {
                tool_name: call.name.clone(),
                call_id: call.id.clone(),
                arguments: call.arguments.clone(),
                iteration,
            });

            let result = {
                let mut ctx = ToolContext {
                    state: &mut *self.state,
                    bus: self.deps.bus.as_ref(),
                    sandbox: self.deps.sandbox.as_ref(),
                    cancel: &self.deps.cancel,
                };
                self.deps
                    .registry
                    .dispatch(&mut ctx, &call.name, &call.arguments)
                    .await
            };
            let output = match result {
                Ok(out) => out,
                Err(e) => {
                    // 调用已广播，补上配对的 tool_result 再传播错误
                    self.emit(AgentEvent::ToolResult {
                        tool_name: call.name.clone(),
                        call_id: call.id.clone(),
                        status: if matches!(e, AgentError::Cancelled) {
                            "cancelled".to_string()
                        } else {
                            "error".to_string()
                        },
                        stdout_preview: String::new(),
                        has_image: false,
                        iteration,
                    });
                    return Err(e);
                }
            };

            self.emit(AgentEvent::ToolResult {
                tool_name: call.name.clone(),
                call_id: call.id.clone(),
                status: output.status.clone(),
                stdout_preview: output.stdout_preview.clone(),
                has_image: output.has_image,
                iteration,
            });
            self.state
                .append_message(Message::tool(call.id.clone(), output.payload))?;
        }
        Ok(())
    }

    /// 记录最终报告并发 report_generated
    pub fn record_report(&mut self, report: impl Into<String>) -> Result<(), AgentError> {
        let report = report.into();
        self.state.set_final_report(report.clone())?;
        self.emit(AgentEvent::ReportGenerated { report });
        Ok(())
    }

    /// 正常完成收尾：终态事件 + completed 阶段
    pub fn finish_completed(&mut self, reached_max_iterations: bool) -> Result<TerminalCause, AgentError> {
        let incomplete = self.state.incomplete_task_count();
        if reached_max_iterations {
            self.emit(AgentEvent::AgentWarning {
                message: format!(
                    "达到最大迭代次数 ({})，以当前结果收尾",
                    self.deps.agent_cfg.max_iterations
                ),
                incomplete_tasks_count: incomplete,
            });
        }
        let event = AgentEvent::AgentCompleted {
            final_report: self.state.final_report().unwrap_or("").to_string(),
            images: self.state.images().to_vec(),
            reached_max_iterations,
            incomplete_tasks_count: incomplete,
            iterations: self.state.iteration,
        };
        self.state.set_phase(crate::state::AgentPhase::Completed)?;
        self.emit(event);
        Ok(TerminalCause {
            reached_max_iterations,
        })
    }
}
