//! Dana - 自动化数据分析 Agent 运行时
//!
//! 模块划分：
//! - **agent**: 五种循环策略（tool_driven / task_driven / hybrid / autonomous / staged）与共享执行框架
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与通用定义
//! - **dataset**: 数据集读取与摘要（CSV / TSV）
//! - **event**: 事件类型与会话事件总线（订阅前缓冲、多订阅者扇出）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容流式 / Mock）
//! - **prompts**: 各策略系统提示词
//! - **sandbox**: 代码沙箱（一次性子进程、超时、产物收集）
//! - **server**: axum HTTP / WebSocket 控制面
//! - **session**: 会话管理器（生命周期、取消、结果获取、TTL 回收）
//! - **state**: 会话状态（任务清单、消息历史、产物、阶段）
//! - **tools**: 工具箱（read_dataset、run_code、todo_write）与注册表

pub mod agent;
pub mod config;
pub mod core;
pub mod dataset;
pub mod event;
pub mod llm;
pub mod prompts;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod state;
pub mod tools;
