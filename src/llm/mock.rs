//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本顺序回放 ChatResponse；脚本耗尽后返回固定的收尾文本。
//! content 会切片推送到流式通道，便于测试 llm_streaming 事件。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::AgentError;
use crate::event::DeltaKind;
use crate::llm::{ChatResponse, LlmClient, StreamDelta, ToolSpec};
use crate::state::Message;

/// 流式分片大小（字符）
const CHUNK_CHARS: usize = 8;

/// Mock 客户端：脚本化回放
pub struct MockLlmClient {
    script: Mutex<VecDeque<ChatResponse>>,
    /// 脚本耗尽后的兜底回复
    fallback: ChatResponse,
    calls: std::sync::atomic::AtomicU32,
}

impl MockLlmClient {
    pub fn new(script: Vec<ChatResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: ChatResponse::text("分析完成。"),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn with_fallback(mut self, fallback: ChatResponse) -> Self {
        self.fallback = fallback;
        self
    }

    /// 累计调用次数
    pub fn call_count(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(
        &self,
        _messages: &[Message],
        _tools: &[ToolSpec],
        deltas: Option<&mpsc::UnboundedSender<StreamDelta>>,
    ) -> Result<ChatResponse, AgentError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let response = self
            .script
            .lock()
            .expect("mock script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if let Some(tx) = deltas {
            if let Some(reasoning) = &response.reasoning {
                let _ = tx.send(StreamDelta {
                    kind: DeltaKind::Reasoning,
                    text: reasoning.clone(),
                });
            }
            let chars: Vec<char> = response.content.chars().collect();
            for chunk in chars.chunks(CHUNK_CHARS) {
                let _ = tx.send(StreamDelta {
                    kind: DeltaKind::Content,
                    text: chunk.iter().collect(),
                });
            }
        }
        Ok(response)
    }
}
