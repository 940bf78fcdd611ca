//! Agent 错误类型
//!
//! 错误策略：LLM 写出来的失败（烂代码、错参数）永远不终止会话，作为工具结果回传给 LLM 自行纠错；
//! 基础设施失败（起不了进程、LLM 不可用）才是终止性的，由策略转为 agent_error 事件。

use thiserror::Error;

/// Agent 运行过程中可能出现的错误（上传校验、工具参数、沙箱、LLM、会话生命周期）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 工具参数或上传输入不合法（回传 LLM 或客户端，可恢复）
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 数据集格式不支持（仅在 start 阶段出现）
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// 沙箱无法创建子进程或工作目录（终止性）
    #[error("Executor unavailable: {0}")]
    ExecutorUnavailable(String),

    /// LLM 不可重试错误或重试耗尽（终止性）
    #[error("LLM failed: {0}")]
    LlmFailed(String),

    /// 沙箱或 LLM 超时（可观察，不终止）
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 终态会话被修改，或任务状态违反唯一 in_progress 约束
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// fetch 早于终态
    #[error("Session not ready: {0}")]
    SessionNotReady(String),

    /// 用户取消
    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 错误码字符串（对外接口与事件 payload 使用）
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::InvalidInput(_) => "INVALID_INPUT",
            AgentError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            AgentError::ExecutorUnavailable(_) => "EXECUTOR_UNAVAILABLE",
            AgentError::LlmFailed(_) => "LLM_FAILED",
            AgentError::Timeout(_) => "TIMEOUT",
            AgentError::InvalidState(_) => "INVALID_STATE",
            AgentError::UnknownSession(_) => "UNKNOWN_SESSION",
            AgentError::SessionNotReady(_) => "SESSION_NOT_READY",
            AgentError::Cancelled => "CANCELLED",
        }
    }

    /// 终止性错误：策略应中止并发送 agent_error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::ExecutorUnavailable(_) | AgentError::LlmFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        assert_eq!(AgentError::Cancelled.kind(), "CANCELLED");
        assert_eq!(
            AgentError::InvalidInput("x".into()).kind(),
            "INVALID_INPUT"
        );
        assert!(AgentError::LlmFailed("down".into()).is_fatal());
        assert!(!AgentError::Timeout("30s".into()).is_fatal());
    }
}
