//! 会话状态：任务清单、消息历史、产物、阶段
//!
//! 状态归属：一个会话的状态由其策略任务独占持有（逻辑单线程），本模块不做内部加锁。
//! 约束：同一时刻至多一个任务 in_progress；任务 id 唯一且不可变；进入终态后拒绝一切变更。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 任务状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// 终态任务：completed / failed / skipped
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "skipped" => Some(TaskStatus::Skipped),
            _ => None,
        }
    }
}

/// 任务类型标签
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    DataExploration,
    #[default]
    Analysis,
    Visualization,
    Report,
}

/// 会话阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Initializing,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl AgentPhase {
    /// 终态：completed / failed / stopped
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentPhase::Completed | AgentPhase::Failed | AgentPhase::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentPhase::Initializing => "initializing",
            AgentPhase::Running => "running",
            AgentPhase::Completed => "completed",
            AgentPhase::Failed => "failed",
            AgentPhase::Stopped => "stopped",
        }
    }
}

/// 单个分析任务
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// 会话内稳定序号，创建后不可变
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// 任务生成的分析代码（可选）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            task_type: TaskType::Analysis,
            status: TaskStatus::Pending,
            code: None,
            error: None,
        }
    }
}

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// LLM 发出的一次工具调用（请求侧）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// 调用标识，与 tool 消息的 tool_call_id 配对
    pub id: String,
    pub name: String,
    /// 已解析的 JSON 参数
    pub arguments: serde_json::Value,
}

/// 单条消息；content 为空而 tool_calls 非空表示纯工具调用轮次，消息只追加不修改
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// tool 角色消息所回应的调用标识
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// assistant 轮次，带工具调用（content 可为空串）
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    /// 工具调用结果消息
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// 一次代码执行的产物记录，归会话所有
#[derive(Clone, Debug, Serialize)]
pub struct Artifact {
    pub iteration: u32,
    pub description: String,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// result.png 的二进制内容
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
    /// result.json 的解析内容
    pub result: Option<serde_json::Value>,
}

/// 会话中产生的图表（base64，直接进事件 payload 与最终结果）
#[derive(Clone, Debug, Serialize)]
pub struct ImageRecord {
    pub iteration: u32,
    pub task_id: Option<u32>,
    pub description: String,
    pub image_base64: String,
}

/// 会话完整状态
pub struct SessionState {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub dataset_path: std::path::PathBuf,
    pub dataset_filename: String,
    pub user_request: String,
    pub strategy: String,
    phase: AgentPhase,
    messages: Vec<Message>,
    tasks: Vec<Task>,
    artifacts: Vec<Artifact>,
    images: Vec<ImageRecord>,
    final_report: Option<String>,
    /// LLM 调用计数，每次请求递增一次
    pub iteration: u32,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        dataset_path: impl Into<std::path::PathBuf>,
        dataset_filename: impl Into<String>,
        user_request: impl Into<String>,
        strategy: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: Utc::now(),
            dataset_path: dataset_path.into(),
            dataset_filename: dataset_filename.into(),
            user_request: user_request.into(),
            strategy: strategy.into(),
            phase: AgentPhase::Initializing,
            messages: Vec::new(),
            tasks: Vec::new(),
            artifacts: Vec::new(),
            images: Vec::new(),
            final_report: None,
            iteration: 0,
        }
    }

    fn ensure_mutable(&self) -> Result<(), AgentError> {
        if self.phase.is_terminal() {
            return Err(AgentError::InvalidState(format!(
                "session {} is terminal ({})",
                self.session_id,
                self.phase.as_str()
            )));
        }
        Ok(())
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    /// 设置阶段；终态之后的变更被拒绝
    pub fn set_phase(&mut self, phase: AgentPhase) -> Result<(), AgentError> {
        self.ensure_mutable()?;
        self.phase = phase;
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn append_message(&mut self, msg: Message) -> Result<(), AgentError> {
        self.ensure_mutable()?;
        self.messages.push(msg);
        Ok(())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get_task(&self, id: u32) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn next_pending_task(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.status == TaskStatus::Pending)
    }

    pub fn all_tasks_terminal(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status.is_terminal())
    }

    pub fn incomplete_task_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    fn validate_single_in_progress(tasks: &[Task]) -> Result<(), AgentError> {
        let n = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count();
        if n > 1 {
            return Err(AgentError::InvalidState(format!(
                "{} tasks would be in_progress simultaneously",
                n
            )));
        }
        Ok(())
    }

    /// 整体替换任务清单（todo_write merge=false、代码规划路径）。
    /// id 必须唯一，且至多一个 in_progress。
    pub fn replace_tasks(&mut self, tasks: Vec<Task>) -> Result<(), AgentError> {
        self.ensure_mutable()?;
        let mut seen = std::collections::HashSet::new();
        for t in &tasks {
            if !seen.insert(t.id) {
                return Err(AgentError::InvalidInput(format!(
                    "duplicate task id {}",
                    t.id
                )));
            }
        }
        Self::validate_single_in_progress(&tasks)?;
        self.tasks = tasks;
        Ok(())
    }

    /// 单个任务字段更新；置第二个 in_progress 会被拒绝
    pub fn update_task(
        &mut self,
        id: u32,
        status: Option<TaskStatus>,
        name: Option<String>,
        error: Option<String>,
    ) -> Result<(), AgentError> {
        self.ensure_mutable()?;
        let mut next = self.tasks.clone();
        let task = next
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| AgentError::InvalidInput(format!("unknown task id {}", id)))?;
        if let Some(s) = status {
            task.status = s;
        }
        if let Some(n) = name {
            // 名称仅在未设置时补写，保持 id 与名称稳定
            if task.name.is_empty() {
                task.name = n;
            }
        }
        if let Some(e) = error {
            task.error = Some(e);
        }
        Self::validate_single_in_progress(&next)?;
        self.tasks = next;
        Ok(())
    }

    /// 批量应用任务变更（todo_write merge=true）：全部成功才提交，违反唯一 in_progress 时整批拒绝
    pub fn apply_task_batch(&mut self, entries: Vec<Task>) -> Result<(), AgentError> {
        self.ensure_mutable()?;
        let mut next = self.tasks.clone();
        for entry in entries {
            match next.iter_mut().find(|t| t.id == entry.id) {
                Some(existing) => {
                    existing.status = entry.status;
                    if existing.name.is_empty() && !entry.name.is_empty() {
                        existing.name = entry.name;
                    }
                }
                // 未知 id 追加到清单末尾
                None => next.push(entry),
            }
        }
        Self::validate_single_in_progress(&next)?;
        self.tasks = next;
        Ok(())
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn append_artifact(&mut self, artifact: Artifact) -> Result<(), AgentError> {
        self.ensure_mutable()?;
        self.artifacts.push(artifact);
        Ok(())
    }

    pub fn images(&self) -> &[ImageRecord] {
        &self.images
    }

    pub fn push_image(&mut self, image: ImageRecord) -> Result<(), AgentError> {
        self.ensure_mutable()?;
        self.images.push(image);
        Ok(())
    }

    pub fn final_report(&self) -> Option<&str> {
        self.final_report.as_deref()
    }

    pub fn set_final_report(&mut self, report: impl Into<String>) -> Result<(), AgentError> {
        self.ensure_mutable()?;
        self.final_report = Some(report.into());
        Ok(())
    }

    /// 任务摘要（注入 LLM 上下文）
    pub fn tasks_summary(&self) -> String {
        self.tasks
            .iter()
            .map(|t| {
                format!(
                    "[{}] {}: {}",
                    t.id,
                    t.name,
                    serde_json::to_value(t.status)
                        .ok()
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 不可变快照，用于终态事件与 fetch 接口
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            session_id: self.session_id.clone(),
            phase: self.phase,
            strategy: self.strategy.clone(),
            tasks: self.tasks.clone(),
            iteration: self.iteration,
            images_count: self.images.len(),
            has_final_report: self.final_report.is_some(),
            created_at: self.created_at,
        }
    }
}

/// 会话状态快照（可序列化的只读视图）
#[derive(Clone, Debug, Serialize)]
pub struct StateSnapshot {
    pub session_id: String,
    pub phase: AgentPhase,
    pub strategy: String,
    pub tasks: Vec<Task>,
    pub iteration: u32,
    pub images_count: usize,
    pub has_final_report: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new("s1", "/tmp/dataset.csv", "dataset.csv", "分析销量", "tool_driven")
    }

    #[test]
    fn test_single_in_progress_enforced() {
        let mut s = state();
        s.replace_tasks(vec![Task::new(1, "a"), Task::new(2, "b")]).unwrap();
        s.update_task(1, Some(TaskStatus::InProgress), None, None).unwrap();
        let err = s.update_task(2, Some(TaskStatus::InProgress), None, None);
        assert!(matches!(err, Err(AgentError::InvalidState(_))));
        // 原状态未被破坏
        assert_eq!(s.get_task(2).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_batch_moves_in_progress_atomically() {
        let mut s = state();
        s.replace_tasks(vec![Task::new(1, "a"), Task::new(2, "b")]).unwrap();
        s.update_task(1, Some(TaskStatus::InProgress), None, None).unwrap();
        // 同一批内先完成旧任务再开始新任务：允许
        let mut done = Task::new(1, "a");
        done.status = TaskStatus::Completed;
        let mut next = Task::new(2, "b");
        next.status = TaskStatus::InProgress;
        s.apply_task_batch(vec![done, next]).unwrap();
        assert_eq!(s.get_task(1).unwrap().status, TaskStatus::Completed);
        assert_eq!(s.get_task(2).unwrap().status, TaskStatus::InProgress);
    }

    #[test]
    fn test_terminal_phase_rejects_mutation() {
        let mut s = state();
        s.set_phase(AgentPhase::Running).unwrap();
        s.set_phase(AgentPhase::Completed).unwrap();
        assert!(s.append_message(Message::user("hi")).is_err());
        assert!(s.set_phase(AgentPhase::Running).is_err());
        assert!(s.set_final_report("r").is_err());
    }

    #[test]
    fn test_duplicate_task_ids_rejected() {
        let mut s = state();
        let err = s.replace_tasks(vec![Task::new(1, "a"), Task::new(1, "b")]);
        assert!(matches!(err, Err(AgentError::InvalidInput(_))));
    }

    #[test]
    fn test_unknown_id_appended_in_batch() {
        let mut s = state();
        s.replace_tasks(vec![Task::new(1, "a")]).unwrap();
        let mut extra = Task::new(9, "late");
        extra.status = TaskStatus::Pending;
        s.apply_task_batch(vec![extra]).unwrap();
        assert_eq!(s.tasks().len(), 2);
        assert_eq!(s.tasks()[1].id, 9);
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let mut s = state();
        s.replace_tasks(vec![Task::new(1, "a")]).unwrap();
        s.set_final_report("# 报告").unwrap();
        let snap = s.snapshot();
        assert_eq!(snap.tasks.len(), 1);
        assert!(snap.has_final_report);
        assert_eq!(snap.phase, AgentPhase::Initializing);
    }
}
