//! 会话管理器
//!
//! 生命周期：start 立即返回会话 id 并在独立任务上运行策略；stop 翻转取消令牌，
//! 策略在迭代边界与工具调用边界观察到后收尾；subscribe 返回总线订阅（先回放）；
//! fetch 仅终态可用；终态会话超过保留时间后由后台清扫任务回收。

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::agent::{build_strategy, LoopDriver, StrategyDeps, StrategyKind};
use crate::config::AppConfig;
use crate::core::AgentError;
use crate::event::{AgentEvent, EventBus, Subscription};
use crate::llm::LlmClient;
use crate::sandbox::CodeSandbox;
use crate::state::{AgentPhase, ImageRecord, SessionState, StateSnapshot};
use crate::tools::{ReadDatasetTool, RunCodeTool, TodoWriteTool, ToolRegistry};

/// 终态会话的最终产物（供 fetch 读取）
#[derive(Clone, Debug)]
pub struct FinalOutcome {
    pub phase: AgentPhase,
    pub final_report: String,
    pub images: Vec<ImageRecord>,
    pub snapshot: StateSnapshot,
}

/// 单个会话的管理侧句柄
pub struct SessionHandle {
    pub bus: Arc<EventBus>,
    pub cancel: CancellationToken,
    outcome: Mutex<Option<FinalOutcome>>,
    terminal_at: Mutex<Option<Instant>>,
}

impl SessionHandle {
    fn finalize(&self, outcome: FinalOutcome) {
        *self.outcome.lock().expect("outcome lock") = Some(outcome);
        *self.terminal_at.lock().expect("terminal_at lock") = Some(Instant::now());
    }

    fn outcome(&self) -> Option<FinalOutcome> {
        self.outcome.lock().expect("outcome lock").clone()
    }

    fn terminal_elapsed(&self) -> Option<Duration> {
        self.terminal_at
            .lock()
            .expect("terminal_at lock")
            .map(|t| t.elapsed())
    }
}

/// 会话管理器：id → 句柄，策略任务按会话并行、会话内顺序
pub struct SessionManager {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionManager {
    pub fn new(config: AppConfig, llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            config,
            llm,
            registry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// 标准工具面：read_dataset / run_code / todo_write
    pub fn with_default_tools(config: AppConfig, llm: Arc<dyn LlmClient>) -> Self {
        let mut registry = ToolRegistry::new();
        registry.register(ReadDatasetTool);
        registry.register(RunCodeTool::default());
        registry.register(TodoWriteTool);
        Self::new(config, llm, Arc::new(registry))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 启动会话：校验上传（扩展名、大小、需求非空）、落盘数据集、注册总线、
    /// 起策略任务，立即返回会话 id。
    pub async fn start(
        &self,
        dataset_filename: String,
        dataset_bytes: Vec<u8>,
        user_request: String,
        strategy_tag: Option<String>,
    ) -> Result<String, AgentError> {
        if user_request.trim().is_empty() {
            return Err(AgentError::InvalidInput("user request is empty".into()));
        }
        if dataset_bytes.is_empty() {
            return Err(AgentError::InvalidInput("uploaded file is empty".into()));
        }
        if dataset_bytes.len() as u64 > self.config.server.max_file_size_bytes {
            return Err(AgentError::InvalidInput(format!(
                "file exceeds limit of {} bytes",
                self.config.server.max_file_size_bytes
            )));
        }
        let ext = std::path::Path::new(&dataset_filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_ascii_lowercase()))
            .unwrap_or_default();
        if !self.config.server.allowed_extensions.contains(&ext) {
            return Err(AgentError::UnsupportedFormat(format!(
                "{} (supported: {})",
                if ext.is_empty() { "<none>" } else { &ext },
                self.config.server.allowed_extensions.join(", ")
            )));
        }
        let mode_str = strategy_tag.unwrap_or_else(|| self.config.agent.mode.clone());
        let kind = StrategyKind::parse(&mode_str)
            .ok_or_else(|| AgentError::InvalidInput(format!("unknown strategy '{}'", mode_str)))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let session_root = self.config.server.upload_dir.join(&session_id);
        std::fs::create_dir_all(&session_root)
            .map_err(|e| AgentError::ExecutorUnavailable(format!("session dir: {}", e)))?;
        // 只取文件名部分，丢掉客户端路径
        let safe_name = std::path::Path::new(&dataset_filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("dataset.csv")
            .to_string();
        let dataset_path = session_root.join(&safe_name);
        std::fs::write(&dataset_path, &dataset_bytes)
            .map_err(|e| AgentError::ExecutorUnavailable(format!("save dataset: {}", e)))?;
        tracing::info!(
            session_id = %session_id,
            filename = %safe_name,
            bytes = dataset_bytes.len(),
            "dataset saved"
        );

        let bus = Arc::new(EventBus::new(
            session_id.clone(),
            self.config.session.event_buffer_size,
        ));
        let cancel = CancellationToken::new();
        let handle = Arc::new(SessionHandle {
            bus: bus.clone(),
            cancel: cancel.clone(),
            outcome: Mutex::new(None),
            terminal_at: Mutex::new(None),
        });
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), handle.clone());

        if self.config.session.record_events {
            spawn_event_recorder(bus.clone(), session_root.clone());
        }

        let sandbox = Arc::new(CodeSandbox::new(
            &self.config.sandbox,
            session_root.join("runs"),
        ));
        let mut agent_cfg = self.config.agent.clone();
        agent_cfg.mode = mode_str.clone();
        let deps = StrategyDeps {
            llm: self.llm.clone(),
            registry: self.registry.clone(),
            sandbox,
            bus: bus.clone(),
            cancel,
            agent_cfg,
        };

        let sid = session_id.clone();
        tokio::spawn(async move {
            run_session(sid, kind, mode_str, dataset_path, safe_name, user_request, deps, handle)
                .await;
        });

        Ok(session_id)
    }

    /// 翻转取消令牌；策略在下一个检查点收尾并发出 agent_stopped
    pub async fn stop(&self, session_id: &str) -> Result<(), AgentError> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| AgentError::UnknownSession(session_id.to_string()))?;
        tracing::info!(session_id, "stop requested");
        handle.cancel.cancel();
        Ok(())
    }

    /// 订阅事件流：先回放订阅前积压，再接实时事件
    pub async fn subscribe(&self, session_id: &str) -> Result<Subscription, AgentError> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| AgentError::UnknownSession(session_id.to_string()))?;
        Ok(handle.bus.subscribe())
    }

    /// 终态会话的最终产物；未终态返回 SESSION_NOT_READY
    pub async fn fetch(&self, session_id: &str) -> Result<FinalOutcome, AgentError> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| AgentError::UnknownSession(session_id.to_string()))?;
        handle
            .outcome()
            .ok_or_else(|| AgentError::SessionNotReady(session_id.to_string()))
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 清理终态超过保留时间的会话；返回回收数量
    pub async fn reclaim_expired(&self) -> usize {
        let retention = Duration::from_secs(self.config.session.retention_seconds);
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, h)| h.terminal_elapsed().map(|e| e > retention).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
            tracing::info!(session_id = %id, "session reclaimed after retention");
        }
        expired.len()
    }

    /// 后台清扫循环
    pub fn spawn_reclaim_loop(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                manager.reclaim_expired().await;
            }
        });
    }
}

/// 策略任务主体：运行、收束三种终局、沉淀最终产物
#[allow(clippy::too_many_arguments)]
async fn run_session(
    session_id: String,
    kind: StrategyKind,
    mode_str: String,
    dataset_path: PathBuf,
    dataset_filename: String,
    user_request: String,
    deps: StrategyDeps,
    handle: Arc<SessionHandle>,
) {
    let mut state = SessionState::new(
        session_id.clone(),
        dataset_path,
        dataset_filename,
        user_request,
        mode_str,
    );
    let strategy = build_strategy(kind);
    let result = {
        let mut driver = LoopDriver::new(&mut state, &deps);
        strategy.run(&mut driver).await
    };

    match result {
        Ok(cause) => {
            tracing::info!(
                session_id = %session_id,
                iterations = state.iteration,
                reached_max = cause.reached_max_iterations,
                "session completed"
            );
        }
        Err(AgentError::Cancelled) => {
            state.set_phase(AgentPhase::Stopped).ok();
            deps.bus.emit(AgentEvent::AgentStopped {
                reason: "cancelled by user".to_string(),
            });
            tracing::info!(session_id = %session_id, "session stopped");
        }
        Err(e) => {
            state.set_phase(AgentPhase::Failed).ok();
            deps.bus.emit(AgentEvent::AgentError {
                error: e.to_string(),
                kind: e.kind().to_string(),
                location: kind.as_str().to_string(),
            });
            tracing::error!(session_id = %session_id, error = %e, "session failed");
        }
    }

    handle.finalize(FinalOutcome {
        phase: state.phase(),
        final_report: state.final_report().unwrap_or("").to_string(),
        images: state.images().to_vec(),
        snapshot: state.snapshot(),
    });
}

/// 事件落盘：独立订阅者把全量事件追加写入会话目录下的 events.jsonl
fn spawn_event_recorder(bus: Arc<EventBus>, session_dir: PathBuf) {
    tokio::spawn(async move {
        if std::fs::create_dir_all(&session_dir).is_err() {
            return;
        }
        let path = session_dir.join("events.jsonl");
        let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) else {
            return;
        };
        let mut sub = bus.subscribe();
        while let Some(envelope) = sub.next().await {
            if let Ok(line) = serde_json::to_string(&*envelope) {
                if writeln!(file, "{}", line).is_err() {
                    break;
                }
            }
        }
    });
}
