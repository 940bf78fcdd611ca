//! 循环策略：五种互换的推理-行动驱动器
//!
//! 能力阶梯从「代码编排、LLM 执行」到「LLM 通过工具完全自治」：
//! - **tool_driven**（推荐）：LLM 经 todo_write 自主管理任务生命周期
//! - **task_driven**：代码持有任务清单，逐个注入「执行任务 #k」
//! - **hybrid**：代码控制任务顺序，LLM 决定每个任务怎么做，单任务迭代有界
//! - **autonomous**：LLM 在文本中用 <thinking>/<tasks> 标签内联状态
//! - **staged**：代码驱动 探索 → 规划 → 逐任务执行 → 报告 四阶段
//!
//! 五者共享同一工具面、事件分类与迭代计数；差异只在任务归属与终止判定。

pub mod autonomous;
pub mod driver;
pub mod hybrid;
pub mod staged;
pub mod tags;
pub mod task_driven;
pub mod tool_driven;

pub use driver::{LoopDriver, StrategyDeps, TerminalCause};

use async_trait::async_trait;

use crate::core::AgentError;

/// 策略标签，由会话配置选择
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    ToolDriven,
    TaskDriven,
    Hybrid,
    Autonomous,
    Staged,
}

impl StrategyKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tool_driven" => Some(StrategyKind::ToolDriven),
            "task_driven" => Some(StrategyKind::TaskDriven),
            "hybrid" => Some(StrategyKind::Hybrid),
            "autonomous" => Some(StrategyKind::Autonomous),
            "staged" => Some(StrategyKind::Staged),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::ToolDriven => "tool_driven",
            StrategyKind::TaskDriven => "task_driven",
            StrategyKind::Hybrid => "hybrid",
            StrategyKind::Autonomous => "autonomous",
            StrategyKind::Staged => "staged",
        }
    }
}

/// 循环策略：驱动一个会话从 agent_started 到终止事件
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn run(&self, driver: &mut LoopDriver<'_>) -> Result<TerminalCause, AgentError>;
}

/// 按标签构造策略实现
pub fn build_strategy(kind: StrategyKind) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::ToolDriven => Box::new(tool_driven::ToolDrivenStrategy),
        StrategyKind::TaskDriven => Box::new(task_driven::TaskDrivenStrategy),
        StrategyKind::Hybrid => Box::new(hybrid::HybridStrategy),
        StrategyKind::Autonomous => Box::new(autonomous::AutonomousStrategy),
        StrategyKind::Staged => Box::new(staged::StagedStrategy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for s in ["tool_driven", "task_driven", "hybrid", "autonomous", "staged"] {
            assert_eq!(StrategyKind::parse(s).unwrap().as_str(), s);
        }
        assert!(StrategyKind::parse("unknown").is_none());
    }
}
