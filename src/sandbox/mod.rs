//! 代码沙箱：一次性子进程执行
//!
//! 每次调用在独立工作目录中起一个新子进程：数据集以约定名 dataset.<ext> 落入 cwd，
//! stdout / stderr 进内存缓冲（超上限丢弃并打标记），到点先发终止信号、宽限 2 秒后强杀。
//! 进程退出后在 cwd 收集 result.png 与 result.json 两个约定产物，然后清理目录。
//!
//! 模型写出来的程序错误不会让 execute 返回 Err——那是要回传 LLM 的正常观察结果；
//! 只有起不了进程、建不了目录这类基础设施故障才是 ExecutorUnavailable。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::SandboxSection;
use crate::core::AgentError;

/// 终止信号后的宽限期
const KILL_GRACE: Duration = Duration::from_secs(2);
/// 产物文件约定名（对外契约，改名即破坏兼容）
const RESULT_IMAGE: &str = "result.png";
const RESULT_JSON: &str = "result.json";

/// 执行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Error,
    Timeout,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Success => "success",
            ExecStatus::Error => "error",
            ExecStatus::Timeout => "timeout",
        }
    }
}

/// 一次执行的完整结果
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    /// result.png 内容
    pub image: Option<Vec<u8>>,
    /// result.json 解析结果
    pub result_json: Option<Value>,
}

/// 代码沙箱：解释器 + 超时 + 输出上限由配置决定，root 下每次执行一个独立子目录
pub struct CodeSandbox {
    interpreter: String,
    timeout: Duration,
    output_cap: usize,
    root: PathBuf,
}

impl CodeSandbox {
    pub fn new(cfg: &SandboxSection, root: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: cfg.interpreter.clone(),
            timeout: Duration::from_secs(cfg.code_timeout_seconds),
            output_cap: cfg.output_cap_bytes,
            root: root.into(),
        }
    }

    /// 执行一段脚本源码。dataset 非空时复制进工作目录为 dataset.<ext>。
    /// 取消视同超时做终止-强杀，然后返回 Cancelled。
    pub async fn execute(
        &self,
        source: &str,
        dataset: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, AgentError> {
        let workdir = self.root.join(format!("run_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&workdir)
            .map_err(|e| AgentError::ExecutorUnavailable(format!("mkdir {}: {}", workdir.display(), e)))?;

        let result = self.execute_in(&workdir, source, dataset, cancel).await;
        std::fs::remove_dir_all(&workdir).ok();
        result
    }

    async fn execute_in(
        &self,
        workdir: &Path,
        source: &str,
        dataset: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, AgentError> {
        if let Some(src) = dataset {
            let ext = src
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("csv");
            let target = workdir.join(format!("dataset.{}", ext));
            // 同文件系统优先硬链接，失败则复制
            if std::fs::hard_link(src, &target).is_err() {
                std::fs::copy(src, &target).map_err(|e| {
                    AgentError::ExecutorUnavailable(format!("seed dataset: {}", e))
                })?;
            }
        }

        let script_path = workdir.join("script");
        std::fs::write(&script_path, source)
            .map_err(|e| AgentError::ExecutorUnavailable(format!("write script: {}", e)))?;

        let mut child = Command::new(&self.interpreter)
            .arg(&script_path)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::ExecutorUnavailable(format!("spawn {}: {}", self.interpreter, e))
            })?;

        let stdout_task = capture(child.stdout.take(), self.output_cap);
        let stderr_task = capture(child.stderr.take(), self.output_cap);

        enum WaitOutcome {
            Exited(std::io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }
        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status),
            _ = tokio::time::sleep(self.timeout) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };
        let (timed_out, cancelled, exit_code) = match outcome {
            WaitOutcome::Exited(status) => {
                let code = status
                    .map_err(|e| AgentError::ExecutorUnavailable(format!("wait: {}", e)))?
                    .code();
                (false, false, code)
            }
            WaitOutcome::TimedOut => {
                terminate_then_kill(&mut child).await;
                (true, false, None)
            }
            WaitOutcome::Cancelled => {
                terminate_then_kill(&mut child).await;
                (false, true, None)
            }
        };

        let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();

        if cancelled {
            return Err(AgentError::Cancelled);
        }

        let status = if timed_out {
            ExecStatus::Timeout
        } else if exit_code == Some(0) {
            ExecStatus::Success
        } else {
            ExecStatus::Error
        };

        let image = std::fs::read(workdir.join(RESULT_IMAGE))
            .ok()
            .filter(|b| !b.is_empty());
        let result_json = std::fs::read_to_string(workdir.join(RESULT_JSON))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok());

        tracing::info!(
            status = status.as_str(),
            exit_code = ?exit_code,
            stdout_bytes = stdout.len(),
            has_image = image.is_some(),
            "sandbox execution finished"
        );

        Ok(ExecutionOutcome {
            status,
            exit_code,
            stdout,
            stdout_truncated,
            stderr,
            stderr_truncated,
            image,
            result_json,
        })
    }
}

/// 读子进程输出到上限；超出部分继续读但丢弃，避免管道写满卡死子进程
fn capture<R>(
    reader: Option<R>,
    cap: usize,
) -> tokio::task::JoinHandle<(String, bool)>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return (String::new(), false);
        };
        let mut collected: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if collected.len() < cap {
                        let take = n.min(cap - collected.len());
                        collected.extend_from_slice(&buf[..take]);
                        if take < n {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
            }
        }
        let mut text = String::from_utf8_lossy(&collected).into_owned();
        if truncated {
            text.push_str("\n... [output truncated]");
        }
        (text, truncated)
    })
}

/// 先发终止信号，宽限期内未退出则强杀并收尸
async fn terminate_then_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}
