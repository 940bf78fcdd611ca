//! OpenAI 兼容 API 客户端（reqwest 流式）
//!
//! 通过 chat/completions SSE 流调用任意 OpenAI 兼容端点（可配置 base_url），
//! 支持 DeepSeek、OpenAI、自建代理等。逐行解析 `data:` 帧：content 与
//! reasoning_content 增量实时转发，tool_calls 分片按 index 聚合，流结束后拼装
//! 为完整的 ChatResponse。瞬时错误（网络、超时、429/5xx）指数退避重试。

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::LlmSection;
use crate::core::AgentError;
use crate::event::DeltaKind;
use crate::llm::{ChatResponse, LlmClient, StreamDelta, ToolSpec};
use crate::state::{Message, Role, ToolCallRequest};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn new(cfg: &LlmSection) -> Self {
        let api_key = cfg
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());
        let base_url = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            max_retries: cfg.max_retries,
        }
    }

    fn to_wire_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                let mut obj = json!({"role": role});
                if m.content.is_empty() && !m.tool_calls.is_empty() {
                    obj["content"] = Value::Null;
                } else {
                    obj["content"] = json!(m.content);
                }
                if !m.tool_calls.is_empty() {
                    obj["tool_calls"] = Value::Array(
                        m.tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments.to_string(),
                                    }
                                })
                            })
                            .collect(),
                    );
                }
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = json!(id);
                }
                obj
            })
            .collect()
    }

    async fn chat_once(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        deltas: Option<&mpsc::UnboundedSender<StreamDelta>>,
    ) -> Result<ChatResponse, AgentError> {
        let mut body = json!({
            "model": self.model,
            "messages": Self::to_wire_messages(messages),
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(|t| t.to_openai()).collect());
            body["tool_choice"] = json!("auto");
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(AgentError::Timeout(format!("LLM {}: {}", status, text)));
            }
            return Err(AgentError::LlmFailed(format!("LLM {}: {}", status, text)));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut content = String::new();
        let mut reasoning = String::new();
        // index -> (id, name, arguments 分片)
        let mut tool_calls: BTreeMap<u64, (String, String, String)> = BTreeMap::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AgentError::Timeout(format!("LLM stream: {}", e)))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let mut line = buffer[..line_end].trim().to_string();
                buffer = buffer[line_end + 1..].to_string();
                if line.ends_with('\r') {
                    line.pop();
                }
                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let Ok(parsed) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                if let Some(error) = parsed.get("error") {
                    let msg = error
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown error");
                    return Err(AgentError::LlmFailed(msg.to_string()));
                }
                let Some(delta) = parsed
                    .get("choices")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("delta"))
                else {
                    continue;
                };

                if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                    if !text.is_empty() {
                        content.push_str(text);
                        forward(deltas, DeltaKind::Content, text);
                    }
                }
                if let Some(text) = delta.get("reasoning_content").and_then(|c| c.as_str()) {
                    if !text.is_empty() {
                        reasoning.push_str(text);
                        forward(deltas, DeltaKind::Reasoning, text);
                    }
                }
                if let Some(tcs) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                    for tc in tcs {
                        let idx = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                        let entry = tool_calls.entry(idx).or_default();
                        if let Some(id) = tc.get("id").and_then(|i| i.as_str()) {
                            entry.0 = id.to_string();
                        }
                        if let Some(func) = tc.get("function") {
                            if let Some(name) = func.get("name").and_then(|n| n.as_str()) {
                                if entry.1.is_empty() {
                                    entry.1 = name.to_string();
                                }
                            }
                            if let Some(args) = func.get("arguments").and_then(|a| a.as_str()) {
                                entry.2.push_str(args);
                                forward(deltas, DeltaKind::ToolCallChunk, args);
                            }
                        }
                    }
                }
            }
        }

        let tool_calls = tool_calls
            .into_values()
            .map(|(id, name, args)| {
                let arguments = if args.trim().is_empty() {
                    json!({})
                } else {
                    // 解析失败时保留原文，由工具层 schema 校验拒绝并回传 LLM
                    serde_json::from_str(&args).unwrap_or(Value::String(args))
                };
                ToolCallRequest {
                    id: if id.is_empty() {
                        uuid::Uuid::new_v4().to_string()
                    } else {
                        id
                    },
                    name,
                    arguments,
                }
            })
            .collect();

        Ok(ChatResponse {
            content,
            reasoning: if reasoning.is_empty() {
                None
            } else {
                Some(reasoning)
            },
            tool_calls,
        })
    }
}

fn forward(deltas: Option<&mpsc::UnboundedSender<StreamDelta>>, kind: DeltaKind, text: &str) {
    if let Some(tx) = deltas {
        let _ = tx.send(StreamDelta {
            kind,
            text: text.to_string(),
        });
    }
}

fn classify_send_error(e: reqwest::Error) -> AgentError {
    if e.is_timeout() || e.is_connect() {
        AgentError::Timeout(format!("LLM request: {}", e))
    } else {
        AgentError::LlmFailed(format!("LLM request: {}", e))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        deltas: Option<&mpsc::UnboundedSender<StreamDelta>>,
    ) -> Result<ChatResponse, AgentError> {
        let mut attempt = 0u32;
        loop {
            match self.chat_once(messages, tools, deltas).await {
                Ok(resp) => return Ok(resp),
                // Timeout 代表瞬时错误（网络 / 429 / 5xx），退避后重试
                Err(AgentError::Timeout(msg)) if attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = Duration::from_secs(1 << attempt.min(5));
                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        error = %msg,
                        "LLM transient error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(AgentError::Timeout(msg)) => {
                    return Err(AgentError::LlmFailed(format!(
                        "retries exhausted: {}",
                        msg
                    )))
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages_tool_roundtrip() {
        let messages = vec![
            Message::system("sys"),
            Message::assistant_tool_calls(
                "",
                vec![ToolCallRequest {
                    id: "call_1".into(),
                    name: "run_code".into(),
                    arguments: json!({"code": "print(1)"}),
                }],
            ),
            Message::tool("call_1", "{\"status\":\"success\"}"),
        ];
        let wire = OpenAiClient::to_wire_messages(&messages);
        assert_eq!(wire[0]["role"], "system");
        assert!(wire[1]["content"].is_null());
        assert_eq!(wire[1]["tool_calls"][0]["function"]["name"], "run_code");
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "call_1");
    }
}
