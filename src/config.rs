//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DANA__*` 覆盖（双下划线表示嵌套，如 `DANA__LLM__MODEL=deepseek-chat`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// [server] 段：监听端口、上传目录、文件大小上限
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// 会话工作目录根，每个会话一个子目录
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// 允许上传的文件扩展名（小写，含点）
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// WebSocket 心跳间隔（秒）
    #[serde(default = "default_ws_heartbeat_secs")]
    pub ws_heartbeat_secs: u64,
}

fn default_port() -> u16 {
    8003
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("/tmp/dana_uploads")
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    vec![".csv".to_string(), ".tsv".to_string()]
}

fn default_ws_heartbeat_secs() -> u64 {
    30
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            upload_dir: default_upload_dir(),
            max_file_size_bytes: default_max_file_size(),
            allowed_extensions: default_allowed_extensions(),
            ws_heartbeat_secs: default_ws_heartbeat_secs(),
        }
    }
}

/// [llm] 段：OpenAI 兼容端点与超时、重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// API Key（未设置时读取环境变量 OPENAI_API_KEY）
    #[serde(default)]
    pub api_key: Option<String>,
    /// base_url，如 https://api.deepseek.com/v1；None 表示官方 OpenAI 端点
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 瞬时错误最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: default_model(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// [agent] 段：策略选择与迭代上限
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// 策略：tool_driven / task_driven / hybrid / autonomous / staged
    #[serde(default = "default_mode")]
    pub mode: String,
    /// 单会话 LLM 调用次数硬上限
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// hybrid 策略单任务内层迭代上限
    #[serde(default = "default_max_iterations_per_task")]
    pub max_iterations_per_task: u32,
}

fn default_mode() -> String {
    "tool_driven".to_string()
}

fn default_max_iterations() -> u32 {
    25
}

fn default_max_iterations_per_task() -> u32 {
    5
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            max_iterations: default_max_iterations(),
            max_iterations_per_task: default_max_iterations_per_task(),
        }
    }
}

/// [sandbox] 段：代码执行子进程
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    /// 解释器可执行文件（默认 python3；测试可替换为 sh）
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// 单次执行墙钟超时（秒）
    #[serde(default = "default_code_timeout")]
    pub code_timeout_seconds: u64,
    /// stdout / stderr 捕获上限（字节），超出部分丢弃并打标记
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_code_timeout() -> u64 {
    30
}

fn default_output_cap() -> usize {
    256 * 1024
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            code_timeout_seconds: default_code_timeout(),
            output_cap_bytes: default_output_cap(),
        }
    }
}

/// [session] 段：事件队列深度、终态保留时间、会话日志
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 每个订阅者的有界队列深度，溢出即判定为慢订阅者并断开
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    /// 终态会话保留时间（秒），过期后回收
    #[serde(default = "default_retention_secs")]
    pub retention_seconds: u64,
    /// 是否将每个会话的事件追加写入 JSONL 日志文件
    #[serde(default)]
    pub record_events: bool,
}

fn default_event_buffer_size() -> usize {
    1024
}

fn default_retention_secs() -> u64 {
    3600
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer_size(),
            retention_seconds: default_retention_secs(),
            record_events: false,
        }
    }
}

/// 从 config 目录加载配置，环境变量 DANA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DANA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DANA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_app_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 8003);
        assert_eq!(cfg.agent.max_iterations, 25);
        assert_eq!(cfg.agent.max_iterations_per_task, 5);
        assert_eq!(cfg.sandbox.code_timeout_seconds, 30);
        assert_eq!(cfg.session.event_buffer_size, 1024);
        assert_eq!(cfg.llm.max_retries, 3);
    }

    #[test]
    fn test_mode_default_is_tool_driven() {
        assert_eq!(AgentSection::default().mode, "tool_driven");
    }
}
