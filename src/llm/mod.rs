//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::chat：带工具 schema 的一次对话补全，
//! 可选地把流式增量（content / reasoning / tool_call_chunk）推给调用方。
//! reasoning 增量只作观察用途，不进入规范消息历史。

pub mod mock;
pub mod openai;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::AgentError;
use crate::event::DeltaKind;
use crate::state::{Message, ToolCallRequest};

/// 向 LLM 广告的工具：名称、说明、JSON Schema 参数
#[derive(Clone, Debug)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    /// OpenAI function-calling 格式
    pub fn to_openai(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// 流式增量
#[derive(Clone, Debug)]
pub struct StreamDelta {
    pub kind: DeltaKind,
    pub text: String,
}

/// 一次补全的结果：纯文本 / 纯工具调用 / 文本前导 + 工具调用
#[derive(Clone, Debug, Default)]
pub struct ChatResponse {
    pub content: String,
    /// 模型原生思考轨迹（DeepSeek reasoning_content 等）
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self {
            tool_calls: vec![ToolCallRequest {
                id: id.into(),
                name: name.into(),
                arguments,
            }],
            ..Default::default()
        }
    }

    /// 纯文本轮次（无任何工具调用）
    pub fn is_textual(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 一次对话补全；deltas 非空时按到达顺序推送流式增量。
    /// 瞬时错误在实现内重试；不可恢复错误返回 LlmFailed。
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        deltas: Option<&mpsc::UnboundedSender<StreamDelta>>,
    ) -> Result<ChatResponse, AgentError>;
}
